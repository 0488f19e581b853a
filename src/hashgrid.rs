//! Distributed uniform spatial hash grid: the broad phase.
//!
//! Boxes from both meshes are hashed into every grid cell they overlap;
//! cells are assigned to ranks by a deterministic mix of the cell triple,
//! so all boxes sharing a cell meet on one rank regardless of where they
//! were contributed. Each cell owner then forms the Cartesian product of
//! its cell populations, keeps pairs with distinct priorities and
//! overlapping boxes, and emits each surviving pair exactly once across
//! all shared cells.

use crate::geometry::Aabb;
use crate::protocol::{Cell, Collision, GridBox};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// The cell containing a point. Cells are half-open along each axis, so a
/// point on a cell boundary belongs to the higher cell, consistently
/// everywhere.
pub fn cell_of(cell_ext: [f64; 3], p: [f64; 3]) -> Cell {
    let mut cell = [0i64; 3];
    for axis in 0..3 {
        cell[axis] = (p[axis] / cell_ext[axis]).floor() as i64;
    }
    cell
}

/// All cells a box overlaps: the closed cell range between the cells of
/// its two corners.
pub fn cell_cover(cell_ext: [f64; 3], aabb: &Aabb) -> Vec<Cell> {
    let lo = cell_of(cell_ext, aabb.min);
    let hi = cell_of(cell_ext, aabb.max);
    let mut cells = Vec::new();
    for i in lo[0]..=hi[0] {
        for j in lo[1]..=hi[1] {
            for k in lo[2]..=hi[2] {
                cells.push([i, j, k]);
            }
        }
    }
    cells
}

fn mix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// The rank owning a cell: a splitmix-style hash of the cell triple,
/// identical on every rank.
pub fn owner_rank(cell: Cell, size: usize) -> usize {
    let h = mix(cell[0] as u64 ^ mix(cell[1] as u64 ^ mix(cell[2] as u64)));
    (h % size as u64) as usize
}

/// Bins a rank's boxes into per-owner-rank batches of (cell, boxes)
/// entries, ready to become one `GridBoxes` message per rank.
pub fn bin_boxes(
    cell_ext: [f64; 3],
    boxes: &[GridBox],
    size: usize,
) -> Vec<Vec<(Cell, Vec<GridBox>)>> {
    let mut per_rank: Vec<BTreeMap<Cell, Vec<GridBox>>> = vec![BTreeMap::new(); size];
    for b in boxes {
        for cell in cell_cover(cell_ext, &b.aabb) {
            per_rank[owner_rank(cell, size)]
                .entry(cell)
                .or_insert_with(Vec::new)
                .push(*b);
        }
    }
    per_rank
        .into_iter()
        .map(|cells| cells.into_iter().collect())
        .collect()
}

/// Pairs emitted by one cell: distinct priorities, overlapping boxes, and
/// first encountered here. A pair is reported only by the cell containing
/// the min corner of the boxes' intersection, the lexicographically
/// smallest cell the two boxes share.
pub fn cell_pairs(cell_ext: [f64; 3], cell: Cell, boxes: &[GridBox]) -> Vec<Collision> {
    let mut pairs = Vec::new();
    for (i, a) in boxes.iter().enumerate() {
        for b in &boxes[i + 1..] {
            if a.priority == b.priority || !a.aabb.overlaps(&b.aabb) {
                continue;
            }
            if cell_of(cell_ext, a.aabb.intersection(&b.aabb).min) != cell {
                continue;
            }
            pairs.push(Collision {
                a_chunk: a.chunk,
                a_index: a.index,
                b_chunk: b.chunk,
                b_index: b.index,
            });
        }
    }
    pairs
}

/// Accumulates the box batches addressed to this rank during one flush.
/// The batch count doubles as the first flush barrier: every rank sends
/// exactly one batch to every rank, so `batches == size` means all
/// contributions have arrived.
pub struct Flush {
    pub batches: usize,
    cells: BTreeMap<Cell, Vec<GridBox>>,
}

impl Flush {
    pub fn new() -> Self {
        Self {
            batches: 0,
            cells: BTreeMap::new(),
        }
    }

    pub fn absorb(&mut self, batch: Vec<(Cell, Vec<GridBox>)>) {
        self.batches += 1;
        for (cell, mut boxes) in batch {
            self.cells
                .entry(cell)
                .or_insert_with(Vec::new)
                .append(&mut boxes);
        }
    }

    /// Emits all pairs from this rank's cells, sorted for reproducible
    /// delivery order.
    pub fn emit(&self, cell_ext: [f64; 3]) -> Vec<Collision> {
        let cells: Vec<_> = self.cells.iter().collect();
        let mut pairs: Vec<Collision> = cells
            .par_iter()
            .flat_map_iter(|(cell, boxes)| cell_pairs(cell_ext, **cell, boxes))
            .collect();
        pairs.sort_by_key(|c| (c.a_chunk, c.a_index, c.b_chunk, c.b_index));
        pairs
    }
}

impl Default for Flush {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gridbox(chunk: u64, index: u32, min: [f64; 3], max: [f64; 3], priority: u64) -> GridBox {
        GridBox {
            chunk,
            index,
            aabb: Aabb { min, max },
            priority,
        }
    }

    #[test]
    fn cells_are_half_open() {
        let ext = [1.0, 1.0, 1.0];
        assert_eq!(cell_of(ext, [0.5, 0.5, 0.5]), [0, 0, 0]);
        assert_eq!(cell_of(ext, [1.0, 0.0, 0.0]), [1, 0, 0]);
        assert_eq!(cell_of(ext, [-0.5, -1.0, 0.0]), [-1, -1, 0]);
    }

    #[test]
    fn cover_spans_the_box() {
        let ext = [1.0, 1.0, 1.0];
        let aabb = Aabb {
            min: [0.5, 0.5, 0.5],
            max: [1.5, 0.6, 0.6],
        };
        assert_eq!(cell_cover(ext, &aabb), vec![[0, 0, 0], [1, 0, 0]]);
    }

    #[test]
    fn owner_is_deterministic_and_in_range() {
        for size in [1usize, 3, 8].iter().copied() {
            for i in -4i64..4 {
                let cell = [i, 2 * i, -i];
                let rank = owner_rank(cell, size);
                assert!(rank < size);
                assert_eq!(rank, owner_rank(cell, size));
            }
        }
    }

    #[test]
    fn same_priority_pairs_are_suppressed() {
        let ext = [1.0, 1.0, 1.0];
        let boxes = vec![
            gridbox(0, 0, [0.0; 3], [0.5; 3], 0),
            gridbox(1, 0, [0.0; 3], [0.5; 3], 0),
        ];
        assert_eq!(cell_pairs(ext, [0, 0, 0], &boxes), vec![]);
    }

    #[test]
    fn disjoint_boxes_are_suppressed() {
        let ext = [10.0, 10.0, 10.0];
        let boxes = vec![
            gridbox(0, 0, [0.0; 3], [1.0; 3], 0),
            gridbox(5, 0, [2.0; 3], [3.0; 3], 5),
        ];
        assert_eq!(cell_pairs(ext, [0, 0, 0], &boxes), vec![]);
    }

    #[test]
    fn shared_cells_emit_the_pair_exactly_once() {
        // Both boxes span two cells along x; only the cell holding the
        // intersection min corner may emit.
        let ext = [1.0, 1.0, 1.0];
        let a = gridbox(0, 0, [0.5, 0.0, 0.0], [1.5, 0.5, 0.5], 0);
        let b = gridbox(7, 3, [0.75, 0.0, 0.0], [1.25, 0.5, 0.5], 7);
        let boxes = vec![a, b];
        let emitted: Vec<_> = cell_cover(ext, &a.aabb)
            .into_iter()
            .flat_map(|cell| cell_pairs(ext, cell, &boxes))
            .collect();
        assert_eq!(
            emitted,
            vec![Collision {
                a_chunk: 0,
                a_index: 0,
                b_chunk: 7,
                b_index: 3,
            }]
        );
    }

    #[test]
    fn touching_boxes_collide() {
        let ext = [1.0, 1.0, 1.0];
        let boxes = vec![
            gridbox(0, 0, [0.0; 3], [0.5; 3], 0),
            gridbox(9, 1, [0.5, 0.0, 0.0], [0.9, 0.5, 0.5], 9),
        ];
        assert_eq!(cell_pairs(ext, [0, 0, 0], &boxes).len(), 1);
    }

    #[test]
    fn flush_counts_batches_and_merges_cells() {
        let ext = [1.0, 1.0, 1.0];
        let mut flush = Flush::new();
        flush.absorb(vec![(
            [0, 0, 0],
            vec![gridbox(0, 0, [0.1; 3], [0.2; 3], 0)],
        )]);
        flush.absorb(vec![(
            [0, 0, 0],
            vec![gridbox(4, 2, [0.1; 3], [0.3; 3], 4)],
        )]);
        assert_eq!(flush.batches, 2);
        let pairs = flush.emit(ext);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].b_chunk, 4);
    }
}
