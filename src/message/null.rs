//! Provides a message-passing communicator that does nothing.
//!
//! Single-rank pools self-deliver every message through the event loop's
//! local inbox, so the transport is never exercised; `send` and `recv`
//! are unreachable and say so loudly if a bug routes traffic here.

use super::comm::Communicator;

/// A message-passing communicator for a pool of one.
pub struct NullCommunicator {}

impl NullCommunicator {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for NullCommunicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Communicator for NullCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&self, _rank: usize, _message: Vec<u8>) {
        unimplemented!("cannot send on a null communicator")
    }

    fn recv(&self) -> Vec<u8> {
        unimplemented!("cannot recv on a null communicator")
    }

    fn next_time_stamp(&mut self) {}
}
