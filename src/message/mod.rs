//! A minimal distributed message-passing API.
//!
//! The transfer protocol runs over the [`comm::Communicator`] trait, which
//! moves pure bytes (`Vec<u8>`) between ranks with pairwise FIFO ordering.
//! Three transports are provided: [`tcp::TcpCommunicator`] for distributed
//! process pools, [`local::LocalCommunicator`] for in-process rank groups
//! on threads, and [`null::NullCommunicator`] for single-rank runs where
//! every message is self-delivered and the transport is never touched.

pub mod comm;
pub mod local;
pub mod null;
pub mod tcp;
pub mod util;

pub use comm::Communicator;
pub use local::LocalCommunicator;
pub use null::NullCommunicator;
pub use tcp::TcpCommunicator;
