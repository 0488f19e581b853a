//! Connectivity structures derived from raw tetrahedron meshes: local
//! renumbering, elements-surrounding lookups, and the chunk-boundary sweep
//! the mapper protocol feeds on.

use std::collections::{BTreeSet, HashMap};

/// Node ordering of the four triangular faces of a tet. Face `f` is the
/// face opposite node `f`; the order of each triple fixes the outward
/// normal and is part of the external contract.
pub const FACE_NODES: [[usize; 3]; 4] = [[1, 2, 3], [2, 0, 3], [3, 0, 1], [0, 2, 1]];

/// Edge ordering of a triangle, used to walk the edges of boundary faces.
pub const TRI_EDGES: [[usize; 2]; 3] = [[0, 1], [1, 2], [2, 0]];

/// An unordered node pair, stored as `(min, max)` of the global ids.
pub type Edge = (u64, u64);

pub fn edge(a: u64, b: u64) -> Edge {
    (a.min(b), a.max(b))
}

/// Renumbers a global-id connectivity into chunk-local ids. Returns the
/// local connectivity, the local-to-global map (sorted), and its inverse.
pub fn global_to_local(ginpoel: &[u64]) -> (Vec<u32>, Vec<u64>, HashMap<u64, u32>) {
    let gid: Vec<u64> = ginpoel
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let lid: HashMap<u64, u32> = gid
        .iter()
        .enumerate()
        .map(|(l, &g)| (g, l as u32))
        .collect();
    let inpoel = ginpoel.iter().map(|g| lid[g]).collect();
    (inpoel, gid, lid)
}

/// Elements surrounding points in compressed sparse row storage: the
/// elements incident on local node `n` are `items[ptr[n]..ptr[n + 1]]`.
pub struct Esup {
    pub items: Vec<usize>,
    pub ptr: Vec<usize>,
}

impl Esup {
    pub fn around(&self, node: usize) -> &[usize] {
        &self.items[self.ptr[node]..self.ptr[node + 1]]
    }
}

/// Builds the elements-surrounding-points structure with the usual
/// two-pass count-then-fill sweep.
pub fn elements_surrounding_points(inpoel: &[u32], nnode: usize) -> Esup {
    let mut ptr = vec![0; nnode + 1];
    for &n in inpoel {
        ptr[n as usize + 1] += 1;
    }
    for i in 0..nnode {
        ptr[i + 1] += ptr[i];
    }
    let mut items = vec![0; inpoel.len()];
    let mut cursor = ptr.clone();
    for (e, tet) in inpoel.chunks_exact(4).enumerate() {
        for &n in tet {
            items[cursor[n as usize]] = e;
            cursor[n as usize] += 1;
        }
    }
    Esup { items, ptr }
}

/// Elements surrounding elements across faces: entry `4 e + f` is the
/// element sharing face `f` of element `e`, or `-1` when that face has no
/// local neighbor.
pub fn elements_surrounding_elements(inpoel: &[u32], esup: &Esup) -> Vec<i64> {
    let nelem = inpoel.len() / 4;
    let mut esuel = vec![-1i64; nelem * 4];
    for e in 0..nelem {
        let tet = &inpoel[e * 4..e * 4 + 4];
        for (f, face) in FACE_NODES.iter().enumerate() {
            let fnodes = [tet[face[0]], tet[face[1]], tet[face[2]]];
            let neighbor = esup.around(fnodes[0] as usize).iter().copied().find(|&e2| {
                e2 != e && {
                    let other = &inpoel[e2 * 4..e2 * 4 + 4];
                    fnodes.iter().all(|n| other.contains(n))
                }
            });
            if let Some(e2) = neighbor {
                esuel[e * 4 + f] = e2 as i64;
            }
        }
    }
    esuel
}

/// Chunk-boundary entities of a chunk: the global node ids and edges lying
/// on faces whose neighboring element is missing locally. These are exactly
/// the entities that can be shared with another chunk.
pub fn chunk_boundary(
    inpoel: &[u32],
    gid: &[u64],
    esuel: &[i64],
) -> (BTreeSet<u64>, BTreeSet<Edge>) {
    let mut nodes = BTreeSet::new();
    let mut edges = BTreeSet::new();
    for e in 0..inpoel.len() / 4 {
        let tet = &inpoel[e * 4..e * 4 + 4];
        for (f, face) in FACE_NODES.iter().enumerate() {
            if esuel[e * 4 + f] != -1 {
                continue;
            }
            let g = [
                gid[tet[face[0]] as usize],
                gid[tet[face[1]] as usize],
                gid[tet[face[2]] as usize],
            ];
            for (n, pair) in TRI_EDGES.iter().enumerate() {
                nodes.insert(g[n]);
                edges.insert(edge(g[pair[0]], g[pair[1]]));
            }
        }
    }
    (nodes, edges)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Two tets sharing the face {0, 1, 2}, global ids offset to exercise
    // the renumbering.
    const GINPOEL: [u64; 8] = [10, 11, 12, 13, 11, 10, 12, 14];

    #[test]
    fn renumbering_is_bijective() {
        let (inpoel, gid, lid) = global_to_local(&GINPOEL);
        assert_eq!(gid, vec![10, 11, 12, 13, 14]);
        assert_eq!(inpoel, vec![0, 1, 2, 3, 1, 0, 2, 4]);
        for (l, &g) in gid.iter().enumerate() {
            assert_eq!(lid[&g], l as u32);
        }
    }

    #[test]
    fn esup_collects_incident_elements() {
        let (inpoel, gid, _) = global_to_local(&GINPOEL);
        let esup = elements_surrounding_points(&inpoel, gid.len());
        assert_eq!(esup.around(0), &[0, 1]);
        assert_eq!(esup.around(3), &[0]);
        assert_eq!(esup.around(4), &[1]);
    }

    #[test]
    fn esuel_finds_the_shared_face() {
        let (inpoel, gid, _) = global_to_local(&GINPOEL);
        let esup = elements_surrounding_points(&inpoel, gid.len());
        let esuel = elements_surrounding_elements(&inpoel, &esup);
        // Exactly one face of each tet has a neighbor.
        assert_eq!(esuel.iter().filter(|&&n| n != -1).count(), 2);
        assert!(esuel[0..4].contains(&1));
        assert!(esuel[4..8].contains(&0));
    }

    #[test]
    fn single_tet_is_all_boundary() {
        let (inpoel, gid, _) = global_to_local(&GINPOEL[..4]);
        let esup = elements_surrounding_points(&inpoel, gid.len());
        let esuel = elements_surrounding_elements(&inpoel, &esup);
        let (nodes, edges) = chunk_boundary(&inpoel, &gid, &esuel);
        assert_eq!(nodes, (10..14).collect());
        assert_eq!(edges.len(), 6);
        assert!(edges.contains(&(10, 13)));
    }

    #[test]
    fn interior_face_stays_off_the_boundary() {
        let (inpoel, gid, _) = global_to_local(&GINPOEL);
        let esup = elements_surrounding_points(&inpoel, gid.len());
        let esuel = elements_surrounding_elements(&inpoel, &esup);
        let (nodes, edges) = chunk_boundary(&inpoel, &gid, &esuel);
        // Every node of this tiny mesh touches some boundary face, and so
        // does every edge: only the shared face itself is interior, but its
        // edges also belong to boundary faces.
        assert_eq!(nodes, (10..15).collect());
        assert!(edges.contains(&(10, 11)));
    }
}
