//! Count-down rendezvous with a mergeable payload.
//!
//! Every global synchronization point in the registration and transfer
//! protocols is one of these: each rank contributes exactly once, rank 0
//! merges the payloads, and the merged result is broadcast back as the
//! advance message that releases the waiting ranks. Rendezvous are
//! identified by a sequence number that all ranks generate in the same
//! program order, so a payload-kind mismatch can only mean a protocol bug.

use crate::error::{ProtocolError, TransferError};
use crate::transfer::TransferStats;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The payload carried by a contribution or an advance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Pure barrier.
    Unit,
    /// Registration: the largest global node id seen, plus any per-rank
    /// validation fault.
    Register {
        max_gid: u64,
        fault: Option<TransferError>,
    },
    /// Broad-phase contribution: per-axis min/max of the source tet
    /// bounding-box extents, for the diagnostic histogram.
    Boxes {
        ext_min: [f64; 3],
        ext_max: [f64; 3],
    },
    /// Grid flush: per-axis extent histogram counts, `3 * buckets` long.
    Hist { counts: Vec<u64> },
    /// Routing outcome broadcast by the root.
    Route { fault: Option<TransferError> },
    /// Final statistics, with any global numeric fault attached by the
    /// root.
    Stats {
        stats: TransferStats,
        fault: Option<TransferError>,
    },
}

fn keep_first(acc: &mut Option<TransferError>, inc: Option<TransferError>) {
    if acc.is_none() {
        *acc = inc;
    }
}

/// Merges one contribution into the accumulator. Counters add, extrema
/// widen, faults keep the first reported.
pub fn merge(acc: &mut Payload, inc: Payload, seq: u64) -> Result<(), ProtocolError> {
    match (acc, inc) {
        (Payload::Unit, Payload::Unit) => {}
        (
            Payload::Register { max_gid, fault },
            Payload::Register {
                max_gid: m,
                fault: f,
            },
        ) => {
            *max_gid = (*max_gid).max(m);
            keep_first(fault, f);
        }
        (
            Payload::Boxes { ext_min, ext_max },
            Payload::Boxes {
                ext_min: lo,
                ext_max: hi,
            },
        ) => {
            for axis in 0..3 {
                ext_min[axis] = ext_min[axis].min(lo[axis]);
                ext_max[axis] = ext_max[axis].max(hi[axis]);
            }
        }
        (Payload::Hist { counts }, Payload::Hist { counts: c }) => {
            debug_assert_eq!(counts.len(), c.len());
            for (acc, inc) in counts.iter_mut().zip(c) {
                *acc += inc;
            }
        }
        (Payload::Route { fault }, Payload::Route { fault: f }) => keep_first(fault, f),
        (
            Payload::Stats { stats, fault },
            Payload::Stats {
                stats: s,
                fault: f,
            },
        ) => {
            stats.merge(&s);
            keep_first(fault, f);
        }
        _ => return Err(ProtocolError::ReductionMismatch { seq }),
    }
    Ok(())
}

/// Rendezvous bookkeeping for one rank. The root additionally accumulates
/// contributions in `pending`; every rank parks arrived advances in
/// `ready` until the waiting phase picks them up.
pub struct Reductions {
    size: usize,
    pending: BTreeMap<u64, (usize, Payload)>,
    ready: BTreeMap<u64, Payload>,
}

impl Reductions {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            pending: BTreeMap::new(),
            ready: BTreeMap::new(),
        }
    }

    /// Root side: absorbs one contribution, returning the merged payload
    /// once all ranks have contributed.
    pub fn absorb(&mut self, seq: u64, payload: Payload) -> Result<Option<Payload>, ProtocolError> {
        match self.pending.remove(&seq) {
            None => {
                if self.size == 1 {
                    return Ok(Some(payload));
                }
                self.pending.insert(seq, (1, payload));
                Ok(None)
            }
            Some((count, mut acc)) => {
                merge(&mut acc, payload, seq)?;
                if count + 1 == self.size {
                    Ok(Some(acc))
                } else {
                    self.pending.insert(seq, (count + 1, acc));
                    Ok(None)
                }
            }
        }
    }

    /// Parks an advance payload until the waiting phase claims it.
    pub fn deliver(&mut self, seq: u64, payload: Payload) {
        self.ready.insert(seq, payload);
    }

    pub fn take(&mut self, seq: u64) -> Option<Payload> {
        self.ready.remove(&seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absorb_completes_at_rank_count() {
        let mut red = Reductions::new(3);
        let unit = || Payload::Unit;
        assert_eq!(red.absorb(0, unit()).unwrap(), None);
        assert_eq!(red.absorb(0, unit()).unwrap(), None);
        assert_eq!(red.absorb(0, unit()).unwrap(), Some(Payload::Unit));
    }

    #[test]
    fn register_merge_takes_the_max_and_first_fault() {
        let mut acc = Payload::Register {
            max_gid: 5,
            fault: None,
        };
        let fault = TransferError::EmptyPartition { mesh: 0, chunk: 2 };
        merge(
            &mut acc,
            Payload::Register {
                max_gid: 9,
                fault: Some(fault.clone()),
            },
            1,
        )
        .unwrap();
        merge(
            &mut acc,
            Payload::Register {
                max_gid: 7,
                fault: Some(TransferError::EmptyPartition { mesh: 0, chunk: 4 }),
            },
            1,
        )
        .unwrap();
        assert_eq!(
            acc,
            Payload::Register {
                max_gid: 9,
                fault: Some(fault),
            }
        );
    }

    #[test]
    fn extrema_widen_and_histograms_add() {
        let mut acc = Payload::Boxes {
            ext_min: [1.0, 2.0, 3.0],
            ext_max: [2.0, 3.0, 4.0],
        };
        merge(
            &mut acc,
            Payload::Boxes {
                ext_min: [0.5, 2.5, 3.0],
                ext_max: [1.5, 3.5, 4.0],
            },
            0,
        )
        .unwrap();
        assert_eq!(
            acc,
            Payload::Boxes {
                ext_min: [0.5, 2.0, 3.0],
                ext_max: [2.0, 3.5, 4.0],
            }
        );

        let mut hist = Payload::Hist {
            counts: vec![1, 0, 2],
        };
        merge(
            &mut hist,
            Payload::Hist {
                counts: vec![0, 4, 1],
            },
            0,
        )
        .unwrap();
        assert_eq!(
            hist,
            Payload::Hist {
                counts: vec![1, 4, 3],
            }
        );
    }

    #[test]
    fn mismatched_kinds_are_a_protocol_error() {
        let mut acc = Payload::Unit;
        assert!(matches!(
            merge(&mut acc, Payload::Hist { counts: vec![] }, 4),
            Err(ProtocolError::ReductionMismatch { seq: 4 })
        ));
    }
}
