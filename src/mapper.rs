//! The mapper protocol: builds node and edge communication maps across
//! neighbor chunks from raw connectivity, with no central authority.
//!
//! Every chunk finds its chunk-boundary entities and bins them by global
//! node id to *bucket* chunks; each bucket chunk inverts the reports it
//! receives and answers every reporter with the other chunks that reported
//! the same entity. Completion is detected by counting outgoing messages
//! against inbound receipts, with two global rendezvous: `queried` (all
//! reports delivered) strictly before responses start, and `responded`
//! (all answers delivered) strictly before chunks are put into service.

use crate::partition::Chunk;
use crate::topology::{self, Edge};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// The bucket chunk responsible for a global node id, given the total node
/// count and chunk count of the mesh. The bucket width is capped below at
/// one node and the bucket id above at the last chunk.
pub fn bucket_of(gid: u64, npoin: u64, n_chunks: u32) -> u32 {
    let width = (npoin / n_chunks as u64).max(1);
    (gid / width).min(n_chunks as u64 - 1) as u32
}

/// Chunk-boundary entities of a chunk, binned by bucket chunk. Edges bin
/// by their lower endpoint.
pub fn boundary_bins(
    chunk: &Chunk,
    npoin: u64,
    n_chunks: u32,
) -> BTreeMap<u32, (BTreeSet<u64>, BTreeSet<Edge>)> {
    let esup = topology::elements_surrounding_points(&chunk.inpoel, chunk.npoin());
    let esuel = topology::elements_surrounding_elements(&chunk.inpoel, &esup);
    let (nodes, edges) = topology::chunk_boundary(&chunk.inpoel, &chunk.gid, &esuel);

    let mut bins: BTreeMap<u32, (BTreeSet<u64>, BTreeSet<Edge>)> = BTreeMap::new();
    for g in nodes {
        bins.entry(bucket_of(g, npoin, n_chunks))
            .or_insert_with(Default::default)
            .0
            .insert(g);
    }
    for e in edges {
        bins.entry(bucket_of(e.0, npoin, n_chunks))
            .or_insert_with(Default::default)
            .1
            .insert(e);
    }
    bins
}

/// A chunk's bucket-side table: which chunks reported each entity, and the
/// inverse, built up as queries arrive.
#[derive(Default)]
pub struct Seat {
    nodech: HashMap<u64, Vec<u32>>,
    chnode: BTreeMap<u32, BTreeSet<u64>>,
    edgech: HashMap<Edge, Vec<u32>>,
    chedge: BTreeMap<u32, BTreeSet<Edge>>,
}

impl Seat {
    /// Records one incoming query.
    pub fn query(&mut self, from: u32, nodes: &[u64], edges: &[Edge]) {
        for &g in nodes {
            self.nodech.entry(g).or_insert_with(Vec::new).push(from);
        }
        self.chnode
            .entry(from)
            .or_insert_with(Default::default)
            .extend(nodes.iter().copied());
        for &e in edges {
            self.edgech.entry(e).or_insert_with(Vec::new).push(from);
        }
        self.chedge
            .entry(from)
            .or_insert_with(Default::default)
            .extend(edges.iter().copied());
    }

    /// Computes, per reporting chunk, the communication maps it should
    /// receive: for every entity it reported, the other chunks that
    /// reported the same entity. Every reporter gets an entry, possibly
    /// empty, because it is counting on a response.
    pub fn exports(&self) -> BTreeMap<u32, Vec<(u32, Vec<u64>, Vec<Edge>)>> {
        let mut exports: BTreeMap<u32, BTreeMap<u32, (Vec<u64>, Vec<Edge>)>> = BTreeMap::new();

        for (&requestor, reported) in &self.chnode {
            let maps = exports.entry(requestor).or_insert_with(Default::default);
            for g in reported {
                for &other in &self.nodech[g] {
                    if other != requestor {
                        maps.entry(other).or_insert_with(Default::default).0.push(*g);
                    }
                }
            }
        }
        for (&requestor, reported) in &self.chedge {
            let maps = exports.entry(requestor).or_insert_with(Default::default);
            for e in reported {
                for &other in &self.edgech[e] {
                    if other != requestor {
                        maps.entry(other).or_insert_with(Default::default).1.push(*e);
                    }
                }
            }
        }

        exports
            .into_iter()
            .map(|(requestor, maps)| {
                let maps = maps
                    .into_iter()
                    .map(|(neighbor, (nodes, edges))| (neighbor, nodes, edges))
                    .collect();
                (requestor, maps)
            })
            .collect()
    }
}

/// Per-rank state of one mesh registration in flight. Chunks live here
/// until the `responded` rendezvous completes and they are put into
/// service.
pub struct MapperRun {
    pub mesh: u32,
    pub n_chunks: u32,
    pub chunks: BTreeMap<u32, Chunk>,
    pub seats: BTreeMap<u32, Seat>,
    /// Query receipts this rank is still owed.
    pub pending_acks: usize,
    /// Boundary-map receipts this rank is still owed.
    pub pending_bnd_acks: usize,
}

impl MapperRun {
    pub fn new(mesh: u32, n_chunks: u32, chunks: BTreeMap<u32, Chunk>) -> Self {
        let seats = chunks.keys().map(|&c| (c, Seat::default())).collect();
        Self {
            mesh,
            n_chunks,
            chunks,
            seats,
            pending_acks: 0,
            pending_bnd_acks: 0,
        }
    }

    /// Merges one answered boundary map into the owning chunk.
    pub fn merge_bnd(&mut self, to: u32, maps: Vec<(u32, Vec<u64>, Vec<Edge>)>) {
        let chunk = self.chunks.get_mut(&to).expect("bnd addressed to a local chunk");
        for (neighbor, nodes, edges) in maps {
            chunk
                .node_comm_map
                .entry(neighbor)
                .or_insert_with(Default::default)
                .extend(nodes);
            chunk
                .edge_comm_map
                .entry(neighbor)
                .or_insert_with(Default::default)
                .extend(edges);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::ChunkInput;

    #[test]
    fn buckets_cap_at_the_last_chunk() {
        assert_eq!(bucket_of(0, 8, 2), 0);
        assert_eq!(bucket_of(3, 8, 2), 0);
        assert_eq!(bucket_of(4, 8, 2), 1);
        assert_eq!(bucket_of(7, 8, 2), 1);
        // Ids at the top of an uneven range fold into the last bucket.
        assert_eq!(bucket_of(8, 9, 2), 1);
        // Degenerate width when there are more chunks than nodes.
        assert_eq!(bucket_of(2, 3, 8), 2);
    }

    #[test]
    fn single_tet_bins_every_node() {
        let input = ChunkInput {
            chunk: 0,
            ginpoel: vec![0, 1, 2, 3],
            coords: vec![
                (0, [0.0, 0.0, 0.0]),
                (1, [1.0, 0.0, 0.0]),
                (2, [0.0, 1.0, 0.0]),
                (3, [0.0, 0.0, 1.0]),
            ],
        };
        let chunk = Chunk::new(0, 0, &input).unwrap();
        let bins = boundary_bins(&chunk, 4, 2);
        let nodes: BTreeSet<u64> = bins.values().flat_map(|(n, _)| n.iter().copied()).collect();
        assert_eq!(nodes, (0..4).collect());
        assert_eq!(bins[&0].0, (0..2).collect());
        assert_eq!(bins[&1].0, (2..4).collect());
        // Edges follow their lower endpoint.
        assert!(bins[&0].1.contains(&(0, 3)));
        assert!(bins[&1].1.contains(&(2, 3)));
    }

    #[test]
    fn seat_answers_every_reporter_with_the_other_sharers() {
        let mut seat = Seat::default();
        seat.query(0, &[5, 6], &[(5, 6)]);
        seat.query(1, &[5], &[(5, 6)]);
        seat.query(2, &[6], &[]);
        let exports = seat.exports();

        assert_eq!(exports.len(), 3);
        assert_eq!(
            exports[&0],
            vec![(1, vec![5], vec![(5, 6)]), (2, vec![6], vec![])]
        );
        assert_eq!(exports[&1], vec![(0, vec![5], vec![(5, 6)])]);
        assert_eq!(exports[&2], vec![(0, vec![6], vec![])]);
    }

    #[test]
    fn lonely_reporter_still_gets_an_answer() {
        let mut seat = Seat::default();
        seat.query(4, &[9], &[]);
        let exports = seat.exports();
        assert_eq!(exports[&4], vec![]);
    }
}
