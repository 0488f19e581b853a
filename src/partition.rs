//! Per-rank mesh partition state: the chunk descriptor, mesh handles, and
//! the registration input records.

use crate::error::{NumericError, TransferError};
use crate::geometry;
use crate::topology::{self, Edge};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Which side of a transfer a mesh plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeshRole {
    Source,
    Destination,
}

/// Opaque handle to a registered mesh. The `chunk_id_base` keeps the
/// chunk-id ranges of distinct meshes disjoint, which is how broad-phase
/// results are mapped back to a (mesh, chunk, entity) triple.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshHandle {
    pub id: u32,
    pub n_chunks: u32,
    pub chunk_id_base: u64,
    pub role: MeshRole,
}

impl MeshHandle {
    pub fn owns_chunk_id(&self, chunk_id: u64) -> bool {
        chunk_id >= self.chunk_id_base && chunk_id < self.chunk_id_base + self.n_chunks as u64
    }
}

/// Registration input for one chunk hosted on this rank: element
/// connectivity in global node ids plus the coordinates of every referenced
/// node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkInput {
    /// Mesh-local chunk index.
    pub chunk: u32,
    /// Element connectivity, four global node ids per tet.
    pub ginpoel: Vec<u64>,
    /// Coordinates keyed by global node id; must cover `ginpoel` exactly.
    pub coords: Vec<(u64, [f64; 3])>,
}

/// One contiguous partition of a mesh resident on this rank.
///
/// A chunk is mutated only by its home rank: the mapper protocol fills the
/// communication maps at registration, and a transfer writes interpolated
/// values into `u`. Everything else is fixed at construction.
pub struct Chunk {
    pub mesh: u32,
    pub index: u32,
    pub chunk_id: u64,
    /// Element connectivity in chunk-local node ids, four per tet.
    pub inpoel: Vec<u32>,
    /// Local-to-global node id map; sorted, bijective with `lid`.
    pub gid: Vec<u64>,
    pub lid: HashMap<u64, u32>,
    /// Node coordinates, one array per axis, each sized `|gid|`.
    pub coord: [Vec<f64>; 3],
    /// Neighbor chunk index -> global ids of nodes shared with it.
    pub node_comm_map: BTreeMap<u32, BTreeSet<u64>>,
    /// Neighbor chunk index -> shared edges as unordered gid pairs.
    pub edge_comm_map: BTreeMap<u32, BTreeSet<Edge>>,
    /// Nodal field values.
    pub u: Vec<f64>,
    /// Ownership flags derived from `node_comm_map`: true when no
    /// lower-indexed chunk shares the node.
    pub owned: Vec<bool>,
    pub dest_ready: bool,

    // Transfer-transient state, reset by `reset_transfer`.
    /// Writeback tie-break stamp per point: the (source chunk id, source
    /// tet) that supplied the current value.
    pub stamp: Vec<Option<(u64, u32)>>,
    /// Number of source chunks this chunk dispatched candidate batches to.
    pub dispatched: usize,
    /// Solution batches received back.
    pub replies: usize,
    pub got_candidates: bool,
    /// Halo batches still expected from comm-map neighbors.
    pub halo_pending: usize,
}

impl Chunk {
    /// Builds a chunk from registration input, validating the connectivity
    /// shape, coordinate finiteness, and tet orientation.
    pub fn new(mesh: u32, chunk_id_base: u64, input: &ChunkInput) -> Result<Self, TransferError> {
        let index = input.chunk;
        if input.ginpoel.is_empty() {
            return Err(TransferError::EmptyPartition { mesh, chunk: index });
        }
        if input.ginpoel.len() % 4 != 0 {
            return Err(TransferError::MalformedConnectivity {
                mesh,
                chunk: index,
                len: input.ginpoel.len(),
            });
        }

        let (inpoel, gid, lid) = topology::global_to_local(&input.ginpoel);
        let npoin = gid.len();
        let mut coord = [vec![0.0; npoin], vec![0.0; npoin], vec![0.0; npoin]];
        let mut seen = vec![false; npoin];
        for &(g, xyz) in &input.coords {
            if let Some(&l) = lid.get(&g) {
                if !xyz.iter().all(|x| x.is_finite()) {
                    return Err(NumericError::NonFiniteCoordinate { node: g }.into());
                }
                for axis in 0..3 {
                    coord[axis][l as usize] = xyz[axis];
                }
                seen[l as usize] = true;
            }
        }
        if let Some(l) = seen.iter().position(|&s| !s) {
            return Err(TransferError::MissingCoordinate {
                mesh,
                chunk: index,
                node: gid[l],
            });
        }

        let chunk = Self {
            mesh,
            index,
            chunk_id: chunk_id_base + index as u64,
            inpoel,
            gid,
            lid,
            coord,
            node_comm_map: BTreeMap::new(),
            edge_comm_map: BTreeMap::new(),
            u: vec![0.0; npoin],
            owned: vec![true; npoin],
            dest_ready: false,
            stamp: Vec::new(),
            dispatched: 0,
            replies: 0,
            got_candidates: false,
            halo_pending: 0,
        };

        for e in 0..chunk.ntets() {
            if geometry::jacobian(chunk.tet_coords(e)) <= 0.0 {
                return Err(NumericError::NonPositiveJacobian {
                    chunk: chunk.chunk_id,
                    tet: e as u32,
                }
                .into());
            }
        }
        Ok(chunk)
    }

    pub fn npoin(&self) -> usize {
        self.gid.len()
    }

    pub fn ntets(&self) -> usize {
        self.inpoel.len() / 4
    }

    pub fn point(&self, l: usize) -> [f64; 3] {
        [self.coord[0][l], self.coord[1][l], self.coord[2][l]]
    }

    pub fn tet_nodes(&self, e: usize) -> [u32; 4] {
        let t = &self.inpoel[e * 4..e * 4 + 4];
        [t[0], t[1], t[2], t[3]]
    }

    pub fn tet_coords(&self, e: usize) -> [[f64; 3]; 4] {
        let n = self.tet_nodes(e);
        [
            self.point(n[0] as usize),
            self.point(n[1] as usize),
            self.point(n[2] as usize),
            self.point(n[3] as usize),
        ]
    }

    /// Recomputes the ownership flags once the node communication map is
    /// complete: the lowest-indexed chunk sharing a node owns it.
    pub fn derive_ownership(&mut self) {
        for l in 0..self.npoin() {
            let g = self.gid[l];
            self.owned[l] = !self
                .node_comm_map
                .range(..self.index)
                .any(|(_, shared)| shared.contains(&g));
        }
    }

    /// Clears the transfer-transient state and plants the sentinel value in
    /// the field so orphaned points are detectable afterwards.
    pub fn reset_transfer(&mut self, sentinel: f64) {
        self.stamp = vec![None; self.npoin()];
        self.dispatched = 0;
        self.replies = 0;
        self.got_candidates = false;
        self.halo_pending = self.node_comm_map.len();
        for value in self.u.iter_mut() {
            *value = sentinel;
        }
    }
}

const CHECKPOINT_MAGIC: &[u8; 4] = b"XMSH";
const CHECKPOINT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct ChunkState {
    version: u32,
    mesh: u32,
    index: u32,
    chunk_id: u64,
    inpoel: Vec<u32>,
    gid: Vec<u64>,
    coord: [Vec<f64>; 3],
    node_comm_map: BTreeMap<u32, BTreeSet<u64>>,
    edge_comm_map: BTreeMap<u32, BTreeSet<Edge>>,
    u: Vec<f64>,
}

impl Chunk {
    /// Serializes the persistent chunk state to an opaque versioned blob.
    pub fn checkpoint(&self) -> Vec<u8> {
        let state = ChunkState {
            version: CHECKPOINT_VERSION,
            mesh: self.mesh,
            index: self.index,
            chunk_id: self.chunk_id,
            inpoel: self.inpoel.clone(),
            gid: self.gid.clone(),
            coord: self.coord.clone(),
            node_comm_map: self.node_comm_map.clone(),
            edge_comm_map: self.edge_comm_map.clone(),
            u: self.u.clone(),
        };
        let mut blob = CHECKPOINT_MAGIC.to_vec();
        ciborium::ser::into_writer(&state, &mut blob).expect("chunk state encodes");
        blob
    }

    /// Rebuilds a chunk from a checkpoint blob, restoring the derived
    /// structures (`lid`, ownership) from the persisted ones.
    pub fn restore(blob: &[u8]) -> Result<Self, TransferError> {
        if blob.len() < 4 || &blob[..4] != CHECKPOINT_MAGIC {
            return Err(TransferError::Checkpoint("bad magic".into()));
        }
        let state: ChunkState = ciborium::de::from_reader(&blob[4..])
            .map_err(|e| TransferError::Checkpoint(e.to_string()))?;
        if state.version != CHECKPOINT_VERSION {
            return Err(TransferError::Checkpoint(format!(
                "version {} is not {}",
                state.version, CHECKPOINT_VERSION
            )));
        }
        let lid = state
            .gid
            .iter()
            .enumerate()
            .map(|(l, &g)| (g, l as u32))
            .collect();
        let npoin = state.gid.len();
        let mut chunk = Self {
            mesh: state.mesh,
            index: state.index,
            chunk_id: state.chunk_id,
            inpoel: state.inpoel,
            gid: state.gid,
            lid,
            coord: state.coord,
            node_comm_map: state.node_comm_map,
            edge_comm_map: state.edge_comm_map,
            u: state.u,
            owned: vec![true; npoin],
            dest_ready: false,
            stamp: Vec::new(),
            dispatched: 0,
            replies: 0,
            got_candidates: false,
            halo_pending: 0,
        };
        chunk.derive_ownership();
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_tet_input() -> ChunkInput {
        ChunkInput {
            chunk: 0,
            ginpoel: vec![0, 1, 2, 3],
            coords: vec![
                (0, [0.0, 0.0, 0.0]),
                (1, [1.0, 0.0, 0.0]),
                (2, [0.0, 1.0, 0.0]),
                (3, [0.0, 0.0, 1.0]),
            ],
        }
    }

    #[test]
    fn construction_builds_local_ids() {
        let chunk = Chunk::new(7, 4, &unit_tet_input()).unwrap();
        assert_eq!(chunk.chunk_id, 4);
        assert_eq!(chunk.npoin(), 4);
        assert_eq!(chunk.ntets(), 1);
        assert_eq!(chunk.point(1), [1.0, 0.0, 0.0]);
        assert_eq!(chunk.inpoel.len() % 4, 0);
        assert!(chunk.inpoel.iter().all(|&n| (n as usize) < chunk.npoin()));
    }

    #[test]
    fn empty_chunk_is_a_partition_error() {
        let input = ChunkInput {
            chunk: 3,
            ginpoel: vec![],
            coords: vec![],
        };
        assert!(matches!(
            Chunk::new(1, 0, &input),
            Err(TransferError::EmptyPartition { mesh: 1, chunk: 3 })
        ));
    }

    #[test]
    fn ragged_connectivity_is_rejected() {
        let mut input = unit_tet_input();
        input.ginpoel.pop();
        assert!(matches!(
            Chunk::new(2, 0, &input),
            Err(TransferError::MalformedConnectivity {
                mesh: 2,
                chunk: 0,
                len: 3,
            })
        ));
    }

    #[test]
    fn missing_coordinates_are_rejected() {
        let mut input = unit_tet_input();
        input.coords.remove(2);
        assert!(matches!(
            Chunk::new(0, 0, &input),
            Err(TransferError::MissingCoordinate { node: 2, .. })
        ));
    }

    #[test]
    fn inverted_tet_is_rejected() {
        let mut input = unit_tet_input();
        input.ginpoel = vec![0, 1, 3, 2];
        assert!(matches!(
            Chunk::new(0, 0, &input),
            Err(TransferError::Numeric(
                NumericError::NonPositiveJacobian { .. }
            ))
        ));
    }

    #[test]
    fn nan_coordinate_is_rejected() {
        let mut input = unit_tet_input();
        input.coords[2].1[1] = f64::NAN;
        assert!(matches!(
            Chunk::new(0, 0, &input),
            Err(TransferError::Numeric(
                NumericError::NonFiniteCoordinate { node: 2 }
            ))
        ));
    }

    #[test]
    fn lowest_sharing_chunk_owns_the_node() {
        let mut chunk = Chunk::new(0, 0, &unit_tet_input()).unwrap();
        chunk.index = 1;
        chunk.chunk_id = 1;
        chunk.node_comm_map.insert(0, [1u64, 2].iter().copied().collect());
        chunk.node_comm_map.insert(2, [3u64].iter().copied().collect());
        chunk.derive_ownership();
        // Nodes 1 and 2 are shared with lower-indexed chunk 0; node 3 only
        // with higher-indexed chunk 2.
        assert_eq!(chunk.owned, vec![true, false, false, true]);
    }

    #[test]
    fn reset_plants_the_sentinel() {
        let mut chunk = Chunk::new(0, 0, &unit_tet_input()).unwrap();
        chunk.u = vec![1.0, 2.0, 3.0, 4.0];
        chunk.reset_transfer(-1.0);
        assert_eq!(chunk.u, vec![-1.0; 4]);
        assert_eq!(chunk.stamp, vec![None; 4]);
    }

    #[test]
    fn checkpoint_round_trips() {
        let mut chunk = Chunk::new(9, 100, &unit_tet_input()).unwrap();
        chunk.u = vec![0.5, 1.5, 2.5, 3.5];
        chunk
            .node_comm_map
            .insert(1, [2u64, 3].iter().copied().collect());
        let blob = chunk.checkpoint();
        let back = Chunk::restore(&blob).unwrap();
        assert_eq!(back.mesh, 9);
        assert_eq!(back.chunk_id, 100);
        assert_eq!(back.inpoel, chunk.inpoel);
        assert_eq!(back.gid, chunk.gid);
        assert_eq!(back.coord, chunk.coord);
        assert_eq!(back.u, chunk.u);
        assert_eq!(back.node_comm_map, chunk.node_comm_map);
    }

    #[test]
    fn checkpoint_rejects_foreign_blobs() {
        assert!(matches!(
            Chunk::restore(b"not a checkpoint"),
            Err(TransferError::Checkpoint(_))
        ));
    }
}
