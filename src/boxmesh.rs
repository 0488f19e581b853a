//! Structured box tetrahedron meshes, used by the demo driver and the
//! integration tests as partitioner stand-ins.
//!
//! Each grid cell is split into six tets along the cell diagonal (the
//! Freudenthal decomposition). The split is translation-invariant, so the
//! triangulations induced on the shared faces of neighboring cells match
//! and the mesh is conforming; node orderings are arranged so every tet
//! has a positive jacobian.

use crate::partition::ChunkInput;

/// A generated mesh: global connectivity plus a dense coordinate table
/// (node ids are `0..n_nodes`).
pub struct BoxMesh {
    pub cells: [usize; 3],
    pub ginpoel: Vec<u64>,
    pub coords: Vec<(u64, [f64; 3])>,
}

/// The six axis orders of the Freudenthal split, tagged with the
/// permutation parity that decides the node ordering.
const AXIS_PATHS: [([usize; 3], bool); 6] = [
    ([0, 1, 2], true),
    ([1, 2, 0], true),
    ([2, 0, 1], true),
    ([0, 2, 1], false),
    ([2, 1, 0], false),
    ([1, 0, 2], false),
];

/// Builds a `cells[0] x cells[1] x cells[2]` box of tets with the given
/// origin and cell spacing.
pub fn box_mesh(cells: [usize; 3], origin: [f64; 3], spacing: f64) -> BoxMesh {
    let [nx, ny, nz] = cells;
    let node = |i: usize, j: usize, k: usize| ((k * (ny + 1) + j) * (nx + 1) + i) as u64;

    let mut coords = Vec::with_capacity((nx + 1) * (ny + 1) * (nz + 1));
    for k in 0..=nz {
        for j in 0..=ny {
            for i in 0..=nx {
                coords.push((
                    node(i, j, k),
                    [
                        origin[0] + spacing * i as f64,
                        origin[1] + spacing * j as f64,
                        origin[2] + spacing * k as f64,
                    ],
                ));
            }
        }
    }
    coords.sort_by_key(|&(g, _)| g);

    let mut ginpoel = Vec::with_capacity(nx * ny * nz * 24);
    for ck in 0..nz {
        for cj in 0..ny {
            for ci in 0..nx {
                for &(path, even) in AXIS_PATHS.iter() {
                    let mut corner = [ci, cj, ck];
                    let mut walk = [[0usize; 3]; 4];
                    walk[0] = corner;
                    for (step, &axis) in path.iter().enumerate() {
                        corner[axis] += 1;
                        walk[step + 1] = corner;
                    }
                    // Odd axis orders swap the last two nodes to keep the
                    // jacobian positive.
                    let order = if even { [0, 1, 2, 3] } else { [0, 1, 3, 2] };
                    for &w in order.iter() {
                        let [i, j, k] = walk[w];
                        ginpoel.push(node(i, j, k));
                    }
                }
            }
        }
    }

    BoxMesh {
        cells,
        ginpoel,
        coords,
    }
}

/// Splits a mesh into `n_chunks` contiguous element slabs, carving out the
/// coordinate subset each chunk references. A deliberately simple stand-in
/// for a real partitioner.
pub fn partition_slabs(mesh: &BoxMesh, n_chunks: u32) -> Vec<ChunkInput> {
    let nelem = mesh.ginpoel.len() / 4;
    let n = n_chunks as usize;
    (0..n)
        .map(|c| {
            let lo = c * nelem / n;
            let hi = (c + 1) * nelem / n;
            let ginpoel: Vec<u64> = mesh.ginpoel[lo * 4..hi * 4].to_vec();
            let mut used: Vec<u64> = ginpoel.clone();
            used.sort_unstable();
            used.dedup();
            let coords = used
                .into_iter()
                .map(|g| mesh.coords[g as usize])
                .collect();
            ChunkInput {
                chunk: c as u32,
                ginpoel,
                coords,
            }
        })
        .collect()
}
