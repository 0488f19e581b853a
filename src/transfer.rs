//! Narrow phase and field delivery: broad-phase box generation, the
//! point-in-tet evaluation with interpolation on the source side, solution
//! writeback with the shared-face tie-break on the destination side, and
//! the halo exchange that copies owned shared-node values to neighbor
//! chunks afterwards.

use crate::geometry::{self, Aabb};
use crate::partition::Chunk;
use crate::protocol::{Collision, GridBox, PotentialCollision, SolutionData};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Planted in every destination field entry before writeback so points
/// that receive no interpolation are detectable afterwards. Orphan
/// *counting* uses the absence of a tie-break stamp, not this value.
pub const SENTINEL: f64 = -1.0;

/// Fatal threshold on degenerate-tet skips as a fraction of narrow-phase
/// evaluations.
pub const MAX_SKIP_RATIO: f64 = 0.01;

/// Global per-transfer counters, summed across ranks at the final
/// rendezvous and reported to the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferStats {
    /// Owned destination points considered for transfer.
    pub dest_points: u64,
    pub source_tets: u64,
    /// Candidate pairs emitted by the broad phase.
    pub candidates: u64,
    /// Narrow-phase containments (solutions shipped, before tie-break).
    pub containments: u64,
    /// Owned destination points left at the sentinel.
    pub orphans: u64,
    /// Degenerate-tet evaluations skipped.
    pub numeric_skips: u64,
}

impl TransferStats {
    pub fn merge(&mut self, other: &TransferStats) {
        self.dest_points += other.dest_points;
        self.source_tets += other.source_tets;
        self.candidates += other.candidates;
        self.containments += other.containments;
        self.orphans += other.orphans;
        self.numeric_skips += other.numeric_skips;
    }
}

/// Broad-phase boxes of a source chunk: one per tet.
pub fn tet_boxes(chunk: &Chunk, priority: u64) -> Vec<GridBox> {
    (0..chunk.ntets())
        .map(|e| GridBox {
            chunk: chunk.chunk_id,
            index: e as u32,
            aabb: geometry::tet_aabb(chunk.tet_coords(e)),
            priority,
        })
        .collect()
}

/// Broad-phase boxes of a destination chunk: one degenerate box per owned
/// point. Non-owned shared points are contributed by the owning chunk and
/// filled in by the halo exchange afterwards.
pub fn point_boxes(chunk: &Chunk, priority: u64) -> Vec<GridBox> {
    (0..chunk.npoin())
        .filter(|&l| chunk.owned[l])
        .map(|l| GridBox {
            chunk: chunk.chunk_id,
            index: l as u32,
            aabb: Aabb::of_point(chunk.point(l)),
            priority,
        })
        .collect()
}

/// Destination side: turns this chunk's candidate list into per-source
/// batches, filling in the point coordinates the source side needs.
pub fn candidate_groups(
    chunk: &Chunk,
    pairs: &[Collision],
) -> BTreeMap<u64, Vec<PotentialCollision>> {
    let mut groups: BTreeMap<u64, Vec<PotentialCollision>> = BTreeMap::new();
    for pair in pairs {
        let (source_chunk, source_tet, dest_point) = if pair.a_chunk == chunk.chunk_id {
            (pair.b_chunk, pair.b_index, pair.a_index)
        } else {
            debug_assert_eq!(pair.b_chunk, chunk.chunk_id);
            (pair.a_chunk, pair.a_index, pair.b_index)
        };
        groups
            .entry(source_chunk)
            .or_insert_with(Vec::new)
            .push(PotentialCollision {
                source_tet,
                dest_point,
                point: chunk.point(dest_point as usize),
            });
    }
    groups
}

/// Source side: evaluates one candidate batch, interpolating where the
/// point lands inside the tet. Returns the solutions plus the
/// degenerate-tet skip count.
pub fn evaluate(chunk: &Chunk, records: &[PotentialCollision]) -> (Vec<SolutionData>, u64) {
    // Err marks a degenerate tet, Ok(None) a clean miss.
    let outcomes: Vec<Result<Option<SolutionData>, ()>> = records
        .par_iter()
        .map(|record| {
            let e = record.source_tet as usize;
            let n = geometry::shape_functions(chunk.tet_coords(e), record.point).ok_or(())?;
            if !geometry::contains(&n) {
                return Ok(None);
            }
            let v = chunk.tet_nodes(e);
            let value = n[0] * chunk.u[v[0] as usize]
                + n[1] * chunk.u[v[1] as usize]
                + n[2] * chunk.u[v[2] as usize]
                + n[3] * chunk.u[v[3] as usize];
            Ok(Some(SolutionData {
                dest_point: record.dest_point,
                value,
                source_chunk: chunk.chunk_id,
                source_tet: record.source_tet,
            }))
        })
        .collect();

    let skips = outcomes.iter().filter(|o| o.is_err()).count() as u64;
    let data = outcomes
        .into_iter()
        .filter_map(Result::ok)
        .flatten()
        .collect();
    (data, skips)
}

/// Destination side: stores arriving solutions, keeping the first value
/// per point and overwriting only when the incoming (source chunk, source
/// tet) stamp is lexicographically smaller. Points exactly on a shared
/// face thus resolve to one deterministic winner regardless of arrival
/// order.
pub fn write_solutions(chunk: &mut Chunk, data: &[SolutionData]) {
    for sd in data {
        let p = sd.dest_point as usize;
        let incoming = (sd.source_chunk, sd.source_tet);
        let wins = match chunk.stamp[p] {
            None => true,
            Some(stamp) => incoming < stamp,
        };
        if wins {
            chunk.stamp[p] = Some(incoming);
            chunk.u[p] = sd.value;
        }
    }
}

/// Values of owned shared nodes destined for one comm-map neighbor.
pub fn halo_values(chunk: &Chunk, shared: &BTreeSet<u64>) -> Vec<(u64, f64)> {
    shared
        .iter()
        .filter_map(|g| {
            let l = chunk.lid[g] as usize;
            if chunk.owned[l] {
                Some((*g, chunk.u[l]))
            } else {
                None
            }
        })
        .collect()
}

/// Applies a neighbor's halo batch: owned entries always win, so only
/// non-owned entries are overwritten.
pub fn apply_halo(chunk: &mut Chunk, values: &[(u64, f64)]) {
    for &(g, value) in values {
        if let Some(&l) = chunk.lid.get(&g) {
            if !chunk.owned[l as usize] {
                chunk.u[l as usize] = value;
            }
        }
    }
}

/// Owned-point and orphan tallies of a destination chunk after writeback.
pub fn tally_orphans(chunk: &Chunk) -> (u64, u64) {
    let mut owned = 0;
    let mut orphans = 0;
    for l in 0..chunk.npoin() {
        if chunk.owned[l] {
            owned += 1;
            if chunk.stamp[l].is_none() {
                orphans += 1;
            }
        }
    }
    (owned, orphans)
}

/// Per-axis min/max of box extents; the identity element when there are
/// no boxes, so it merges cleanly.
pub fn extent_bounds(boxes: &[GridBox]) -> ([f64; 3], [f64; 3]) {
    let mut lo = [f64::INFINITY; 3];
    let mut hi = [f64::NEG_INFINITY; 3];
    for b in boxes {
        let ext = b.aabb.extent();
        for axis in 0..3 {
            lo[axis] = lo[axis].min(ext[axis]);
            hi[axis] = hi[axis].max(ext[axis]);
        }
    }
    (lo, hi)
}

/// Histogram of box extents per axis over `buckets` equal intervals of
/// the global `[lo, hi]` range; `3 * buckets` counts, x then y then z.
pub fn extent_histogram(
    boxes: &[GridBox],
    lo: [f64; 3],
    hi: [f64; 3],
    buckets: usize,
) -> Vec<u64> {
    let mut counts = vec![0u64; 3 * buckets];
    for b in boxes {
        let ext = b.aabb.extent();
        for axis in 0..3 {
            let width = (hi[axis] - lo[axis]) / buckets as f64;
            let k = if width > 0.0 {
                (((ext[axis] - lo[axis]) / width) as usize).min(buckets - 1)
            } else {
                0
            };
            counts[axis * buckets + k] += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::ChunkInput;

    fn unit_tet_chunk() -> Chunk {
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
        let mut chunk = Chunk::new(0, 0, &input).unwrap();
        chunk.u = vec![1.0, 2.0, 3.0, 4.0];
        chunk
    }

    #[test]
    fn tet_boxes_cover_each_tet() {
        let chunk = unit_tet_chunk();
        let boxes = tet_boxes(&chunk, 0);
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].aabb.min, [0.0; 3]);
        assert_eq!(boxes[0].aabb.max, [1.0; 3]);
    }

    #[test]
    fn point_boxes_skip_non_owned_points() {
        let mut chunk = unit_tet_chunk();
        chunk.owned[2] = false;
        let boxes = point_boxes(&chunk, 10);
        assert_eq!(boxes.len(), 3);
        assert!(boxes.iter().all(|b| b.index != 2));
        assert_eq!(boxes[1].aabb.min, boxes[1].aabb.max);
    }

    #[test]
    fn interior_candidate_interpolates() {
        let chunk = unit_tet_chunk();
        let records = vec![PotentialCollision {
            source_tet: 0,
            dest_point: 5,
            point: [0.25, 0.25, 0.25],
        }];
        let (data, skips) = evaluate(&chunk, &records);
        assert_eq!(skips, 0);
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].dest_point, 5);
        assert_eq!(data[0].value, 2.5);
    }

    #[test]
    fn outside_candidate_yields_nothing() {
        let chunk = unit_tet_chunk();
        let records = vec![PotentialCollision {
            source_tet: 0,
            dest_point: 0,
            point: [1.0, 1.0, 1.0],
        }];
        let (data, skips) = evaluate(&chunk, &records);
        assert_eq!(data, vec![]);
        assert_eq!(skips, 0);
    }

    #[test]
    fn degenerate_tet_is_skipped_and_counted() {
        let mut chunk = unit_tet_chunk();
        // Flatten the tet after construction-time validation.
        chunk.coord[2][3] = 0.0;
        let records = vec![PotentialCollision {
            source_tet: 0,
            dest_point: 0,
            point: [0.25, 0.25, 0.0],
        }];
        let (data, skips) = evaluate(&chunk, &records);
        assert_eq!(data, vec![]);
        assert_eq!(skips, 1);
    }

    #[test]
    fn candidates_group_by_source_chunk() {
        let chunk = unit_tet_chunk();
        let pairs = vec![
            Collision {
                a_chunk: 0,
                a_index: 1,
                b_chunk: 7,
                b_index: 4,
            },
            Collision {
                a_chunk: 8,
                a_index: 2,
                b_chunk: 0,
                b_index: 3,
            },
            Collision {
                a_chunk: 0,
                a_index: 0,
                b_chunk: 7,
                b_index: 6,
            },
        ];
        let groups = candidate_groups(&chunk, &pairs);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&7].len(), 2);
        assert_eq!(groups[&7][0].source_tet, 4);
        assert_eq!(groups[&7][0].dest_point, 1);
        assert_eq!(groups[&7][0].point, [1.0, 0.0, 0.0]);
        assert_eq!(groups[&8][0].source_tet, 2);
        assert_eq!(groups[&8][0].dest_point, 3);
    }

    #[test]
    fn first_writer_keeps_the_point_unless_outranked() {
        let mut chunk = unit_tet_chunk();
        chunk.reset_transfer(SENTINEL);
        let late_loser = SolutionData {
            dest_point: 1,
            value: 30.0,
            source_chunk: 5,
            source_tet: 0,
        };
        let first = SolutionData {
            dest_point: 1,
            value: 10.0,
            source_chunk: 3,
            source_tet: 9,
        };
        let winner = SolutionData {
            dest_point: 1,
            value: 20.0,
            source_chunk: 3,
            source_tet: 2,
        };
        write_solutions(&mut chunk, &[first]);
        assert_eq!(chunk.u[1], 10.0);
        write_solutions(&mut chunk, &[late_loser]);
        assert_eq!(chunk.u[1], 10.0);
        write_solutions(&mut chunk, &[winner]);
        assert_eq!(chunk.u[1], 20.0);
        assert_eq!(chunk.stamp[1], Some((3, 2)));
        // Untouched points keep the sentinel.
        assert_eq!(chunk.u[0], SENTINEL);
    }

    #[test]
    fn halo_ships_owned_values_and_fills_non_owned() {
        let mut chunk = unit_tet_chunk();
        chunk.owned[3] = false;
        let shared: BTreeSet<u64> = [1u64, 3].iter().copied().collect();
        assert_eq!(halo_values(&chunk, &shared), vec![(1, 2.0)]);

        apply_halo(&mut chunk, &[(1, 99.0), (3, 44.0)]);
        // Node 1 is owned here and keeps its value; node 3 is not.
        assert_eq!(chunk.u[1], 2.0);
        assert_eq!(chunk.u[3], 44.0);
    }

    #[test]
    fn orphans_are_owned_points_without_a_stamp() {
        let mut chunk = unit_tet_chunk();
        chunk.owned[2] = false;
        chunk.reset_transfer(SENTINEL);
        write_solutions(
            &mut chunk,
            &[SolutionData {
                dest_point: 0,
                value: 1.0,
                source_chunk: 0,
                source_tet: 0,
            }],
        );
        assert_eq!(tally_orphans(&chunk), (3, 2));
    }

    #[test]
    fn extent_histogram_buckets_by_axis() {
        let chunk = unit_tet_chunk();
        let boxes = vec![
            tet_boxes(&chunk, 0)[0],
            GridBox {
                chunk: 0,
                index: 1,
                aabb: Aabb {
                    min: [0.0; 3],
                    max: [2.0, 1.0, 1.0],
                },
                priority: 0,
            },
        ];
        let (lo, hi) = extent_bounds(&boxes);
        assert_eq!(lo, [1.0; 3]);
        assert_eq!(hi, [2.0, 1.0, 1.0]);
        let counts = extent_histogram(&boxes, lo, hi, 2);
        assert_eq!(counts, vec![1, 1, 2, 0, 2, 0]);
    }

    #[test]
    fn stats_merge_sums_counters() {
        let mut a = TransferStats {
            dest_points: 1,
            source_tets: 2,
            candidates: 3,
            containments: 4,
            orphans: 5,
            numeric_skips: 6,
        };
        a.merge(&a.clone());
        assert_eq!(a.candidates, 6);
        assert_eq!(a.numeric_skips, 12);
    }
}
