//! Wire records and the message envelope exchanged between ranks.
//!
//! Every inter-rank message is one [`Msg`] value, encoded to bytes by the
//! installed [`crate::coder::Coder`]. Messages between two given ranks are
//! delivered in FIFO order by the transport; nothing here assumes any
//! global order.

use crate::geometry::Aabb;
use crate::reduction::Payload;
use crate::topology::Edge;
use serde::{Deserialize, Serialize};

/// Grid cell address: signed integer triple over an implicit infinite
/// domain.
pub type Cell = [i64; 3];

/// A bounding box contributed to the broad phase. The priority is the
/// `chunk_id_base` of the contributing mesh, so the grid can filter out
/// intra-mesh pairs.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridBox {
    pub chunk: u64,
    pub index: u32,
    pub aabb: Aabb,
    pub priority: u64,
}

/// A pair of overlapping boxes with distinct priorities, as emitted by the
/// grid. Sides are unordered; the router sorts out which one is the
/// destination.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Collision {
    pub a_chunk: u64,
    pub a_index: u32,
    pub b_chunk: u64,
    pub b_index: u32,
}

/// A candidate (source tet, destination point) pair shipped from a
/// destination chunk to the source chunk owning the tet.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PotentialCollision {
    /// Tet index local to the source chunk.
    pub source_tet: u32,
    /// Point index local to the destination chunk, echoed back in the
    /// reply.
    pub dest_point: u32,
    pub point: [f64; 3],
}

/// An interpolated value shipped back to the destination chunk. The stamp
/// identifies the winning tet for the shared-face tie-break.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolutionData {
    pub dest_point: u32,
    pub value: f64,
    pub source_chunk: u64,
    pub source_tet: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Msg {
    /// Mapper: chunk-boundary entities binned to bucket chunk `to`.
    MapperQuery {
        mesh: u32,
        to: u32,
        from: u32,
        nodes: Vec<u64>,
        edges: Vec<Edge>,
    },
    /// Mapper: receipt of a query, counted toward the `queried` rendezvous.
    MapperQueryAck { mesh: u32, to: u32 },
    /// Mapper: communication maps computed by bucket chunk `from` for
    /// chunk `to`: per neighbor, the shared nodes and edges.
    MapperBnd {
        mesh: u32,
        to: u32,
        from: u32,
        maps: Vec<(u32, Vec<u64>, Vec<Edge>)>,
    },
    /// Mapper: receipt of a boundary map, counted toward `responded`.
    MapperBndAck { mesh: u32, to: u32 },

    /// Rendezvous contribution, rank -> root.
    Contribute { seq: u64, payload: Payload },
    /// Rendezvous advance, root -> rank, carrying the merged payload.
    Advance { seq: u64, payload: Payload },

    /// Broad phase: all boxes this rank hashed into cells owned by the
    /// receiving rank. Exactly one per ordered rank pair per flush, empty
    /// when nothing hashed there; the count doubles as the "done
    /// registering" signal.
    GridBoxes { cells: Vec<(Cell, Vec<GridBox>)> },
    /// Broad phase: pairs emitted by this rank's cells, sent to the router
    /// rank. Exactly one per rank per flush.
    Collisions { pairs: Vec<Collision> },
    /// Router -> destination chunk: its complete candidate list. Exactly
    /// one per destination chunk per transfer, possibly empty.
    Candidates { dest_chunk: u64, pairs: Vec<Collision> },
    /// Destination chunk -> source chunk: candidate batch to evaluate.
    Potentials {
        source_chunk: u64,
        dest_chunk: u64,
        records: Vec<PotentialCollision>,
    },
    /// Source chunk -> destination chunk: exactly one reply per candidate
    /// batch, possibly empty.
    Solutions {
        dest_chunk: u64,
        data: Vec<SolutionData>,
    },
    /// Destination chunk -> comm-map neighbor: values of owned shared
    /// nodes, one batch per neighbor pair after writeback.
    Halo {
        mesh: u32,
        to: u32,
        values: Vec<(u64, f64)>,
    },
}
