//! Error kinds surfaced by the transfer library.
//!
//! Locally recoverable conditions (degenerate tets, orphaned points) are
//! tallied into [`crate::transfer::TransferStats`] rather than reported
//! here. Everything below aborts the collective call that hit it, on every
//! rank, with the same value; error values therefore cross ranks inside
//! reduction payloads and must serialize.

use crate::partition::MeshRole;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error for registration and transfer operations.
#[derive(Clone, Debug, PartialEq, Error, Serialize, Deserialize)]
pub enum TransferError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A chunk ended up with zero elements. This can happen when the
    /// partitioner over-decomposes the mesh; re-run with fewer chunks or a
    /// different partitioner.
    #[error("chunk {chunk} of mesh {mesh} has no elements; \
             use fewer chunks or a different partitioner")]
    EmptyPartition { mesh: u32, chunk: u32 },

    /// The element list does not decompose into tets.
    #[error("chunk {chunk} of mesh {mesh} has malformed connectivity: \
             {len} node indices is not whole tets")]
    MalformedConnectivity { mesh: u32, chunk: u32, len: usize },

    /// The coordinate map does not cover the connectivity.
    #[error("chunk {chunk} of mesh {mesh} has no coordinates for \
             global node {node}")]
    MissingCoordinate { mesh: u32, chunk: u32, node: u64 },

    #[error(transparent)]
    Numeric(#[from] NumericError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("checkpoint rejected: {0}")]
    Checkpoint(String),
}

/// Invalid tuning parameters, rejected synchronously before any protocol
/// traffic is generated.
#[derive(Clone, Debug, PartialEq, Error, Serialize, Deserialize)]
pub enum ConfigError {
    #[error("grid cell extent {key} = {value} must be a positive finite real")]
    BadCellExtent { key: String, value: f64 },

    #[error("collision.buckets must be at least 1")]
    BadBuckets,

    #[error("virtualization {0} must lie in [0.0, 1.0]")]
    BadVirtualization(f64),

    #[error("unrecognized configuration key {0:?}")]
    UnknownKey(String),

    #[error("configuration entry {0:?} is not a key=value pair")]
    BadEntry(String),

    #[error("value {value:?} for {key:?} does not parse")]
    BadValue { key: String, value: String },
}

/// Numerical trouble in mesh input or narrow-phase evaluation.
#[derive(Clone, Debug, PartialEq, Error, Serialize, Deserialize)]
pub enum NumericError {
    #[error("non-finite coordinate for global node {node}")]
    NonFiniteCoordinate { node: u64 },

    #[error("tet {tet} of chunk {chunk} has a non-positive jacobian")]
    NonPositiveJacobian { chunk: u64, tet: u32 },

    #[error("{skips} of {evaluations} narrow-phase evaluations hit \
             degenerate tets (over the 1% budget)")]
    DegenerateRatio { skips: u64, evaluations: u64 },
}

/// A message or a broad-phase result that violates the protocol contract.
/// These indicate a bug in the grid, the router, or the caller's collective
/// call sequence, never bad mesh data.
#[derive(Clone, Debug, PartialEq, Error, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("mesh {mesh} is not registered")]
    UnknownMesh { mesh: u32 },

    #[error("mesh {mesh} is already registered")]
    MeshExists { mesh: u32 },

    #[error("mesh {mesh} has role {actual:?} where {expected:?} is required")]
    RoleMismatch {
        mesh: u32,
        actual: MeshRole,
        expected: MeshRole,
    },

    #[error("collision references chunk {chunk} outside the registered ranges")]
    UnroutableChunk { chunk: u64 },

    #[error("collision pairs two chunks of {role:?} role")]
    SameRolePair { role: MeshRole },

    #[error("chunk {chunk} of mesh {mesh} is hosted on rank {expected}, not rank {got}")]
    MisplacedChunk {
        mesh: u32,
        chunk: u32,
        expected: usize,
        got: usize,
    },

    #[error("field of length {got} does not match chunk node count {want}")]
    FieldLength { got: usize, want: usize },

    #[error("destination chunk {chunk} of mesh {mesh} was never marked ready")]
    DestinationNotReady { mesh: u32, chunk: u32 },

    #[error("reduction sequence {seq} received mismatched payload kinds")]
    ReductionMismatch { seq: u64 },
}
