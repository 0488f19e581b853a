//! Routing of broad-phase pairs to the destination chunks that must act on
//! them. Runs on the root rank, which is the grid's delivery client.

use crate::error::ProtocolError;
use crate::partition::{MeshHandle, MeshRole};
use crate::protocol::Collision;
use std::collections::BTreeMap;

/// Labels each collision by mesh role, validates it, and groups the batch
/// by destination chunk id. Every destination chunk gets an entry, empty
/// or not, so downstream delivery is one message per destination chunk
/// with no further accounting.
pub fn route(
    pairs: &[Collision],
    src: &MeshHandle,
    dst: &MeshHandle,
) -> Result<BTreeMap<u64, Vec<Collision>>, ProtocolError> {
    let mut per_dest: BTreeMap<u64, Vec<Collision>> = (0..dst.n_chunks as u64)
        .map(|c| (dst.chunk_id_base + c, Vec::new()))
        .collect();

    for &pair in pairs {
        for &chunk in &[pair.a_chunk, pair.b_chunk] {
            if !src.owns_chunk_id(chunk) && !dst.owns_chunk_id(chunk) {
                return Err(ProtocolError::UnroutableChunk { chunk });
            }
        }
        let a_is_dst = dst.owns_chunk_id(pair.a_chunk);
        let b_is_dst = dst.owns_chunk_id(pair.b_chunk);
        match (a_is_dst, b_is_dst) {
            (true, true) => {
                return Err(ProtocolError::SameRolePair {
                    role: MeshRole::Destination,
                })
            }
            (false, false) => {
                return Err(ProtocolError::SameRolePair {
                    role: MeshRole::Source,
                })
            }
            (true, false) => per_dest.get_mut(&pair.a_chunk).unwrap().push(pair),
            (false, true) => per_dest.get_mut(&pair.b_chunk).unwrap().push(pair),
        }
    }
    Ok(per_dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handles() -> (MeshHandle, MeshHandle) {
        let src = MeshHandle {
            id: 0,
            n_chunks: 2,
            chunk_id_base: 0,
            role: MeshRole::Source,
        };
        let dst = MeshHandle {
            id: 1,
            n_chunks: 3,
            chunk_id_base: 2,
            role: MeshRole::Destination,
        };
        (src, dst)
    }

    fn pair(a: u64, b: u64) -> Collision {
        Collision {
            a_chunk: a,
            a_index: 0,
            b_chunk: b,
            b_index: 1,
        }
    }

    #[test]
    fn pairs_group_by_destination_chunk() {
        let (src, dst) = handles();
        let routed = route(&[pair(0, 3), pair(4, 1), pair(1, 3)], &src, &dst).unwrap();
        // Every destination chunk is present, participating or not.
        assert_eq!(routed.keys().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(routed[&2], vec![]);
        assert_eq!(routed[&3], vec![pair(0, 3), pair(1, 3)]);
        assert_eq!(routed[&4], vec![pair(4, 1)]);
    }

    #[test]
    fn same_role_pairs_abort() {
        let (src, dst) = handles();
        assert_eq!(
            route(&[pair(0, 1)], &src, &dst),
            Err(ProtocolError::SameRolePair {
                role: MeshRole::Source,
            })
        );
        assert_eq!(
            route(&[pair(2, 4)], &src, &dst),
            Err(ProtocolError::SameRolePair {
                role: MeshRole::Destination,
            })
        );
    }

    #[test]
    fn unregistered_chunks_abort() {
        let (src, dst) = handles();
        assert_eq!(
            route(&[pair(0, 9)], &src, &dst),
            Err(ProtocolError::UnroutableChunk { chunk: 9 })
        );
    }
}
