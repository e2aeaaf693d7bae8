//! Contract of the distributed transport, plus the in-process
//! implementations used for single-rank runs and multi-rank tests. The
//! concrete message-passing substrate stays behind this trait.

use std::sync::{Arc, Condvar, Mutex};

/// Values gathered from all ranks with per-rank offsets; the concatenation
/// of the partitions equals the global set under rank-order partitioning.
#[derive(Debug, Clone, PartialEq)]
pub struct GatheredVector<T> {
    pub values: Vec<T>,
    /// `num_ranks + 1` offsets into `values`.
    pub partition: Vec<usize>,
}

impl<T> GatheredVector<T> {
    pub fn num_ranks(&self) -> usize {
        self.partition.len().saturating_sub(1)
    }

    pub fn rank_slice(&self, rank: usize) -> &[T] {
        &self.values[self.partition[rank]..self.partition[rank + 1]]
    }
}

pub trait DistributedContext: Send + Sync {
    fn id(&self) -> usize;

    fn size(&self) -> usize;

    /// All-gather-v of opaque payloads; the result is indexed by rank and
    /// identical on every rank. A synchronizing collective.
    fn gather(&self, local: Vec<u8>) -> Vec<Vec<u8>>;

    /// All-reduce minimum.
    fn min(&self, value: f64) -> f64 {
        self.gather(value.to_le_bytes().to_vec())
            .into_iter()
            .map(|b| f64::from_le_bytes(b.try_into().expect("eight bytes per rank")))
            .fold(value, f64::min)
    }
}

/// Single-process context: every collective is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalContext;

impl DistributedContext for LocalContext {
    fn id(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn gather(&self, local: Vec<u8>) -> Vec<Vec<u8>> {
        vec![local]
    }
}

struct ExchangeRound {
    slots: Vec<Option<Vec<u8>>>,
    filled: usize,
    result: Option<Arc<Vec<Vec<u8>>>>,
    readers: usize,
}

/// Barrier-synchronised all-gather over shared memory, for exercising
/// multi-rank exchange without a message-passing library. One context per
/// simulated rank; every rank must call `gather` for a round to complete.
pub struct InProcessExchange {
    num_ranks: usize,
    round: Mutex<ExchangeRound>,
    cond: Condvar,
}

impl InProcessExchange {
    pub fn new(num_ranks: usize) -> Vec<Arc<InProcessContext>> {
        assert!(num_ranks > 0, "at least one rank");
        let shared = Arc::new(InProcessExchange {
            num_ranks,
            round: Mutex::new(ExchangeRound {
                slots: vec![None; num_ranks],
                filled: 0,
                result: None,
                readers: 0,
            }),
            cond: Condvar::new(),
        });
        (0..num_ranks)
            .map(|rank| {
                Arc::new(InProcessContext {
                    rank,
                    shared: shared.clone(),
                })
            })
            .collect()
    }

    fn gather(&self, rank: usize, local: Vec<u8>) -> Vec<Vec<u8>> {
        let mut round = self.round.lock().expect("exchange lock");

        // Wait for the previous round to be fully consumed.
        while round.result.is_some() || round.slots[rank].is_some() {
            round = self.cond.wait(round).expect("exchange wait");
        }

        round.slots[rank] = Some(local);
        round.filled += 1;

        if round.filled == self.num_ranks {
            let gathered: Vec<Vec<u8>> = round
                .slots
                .iter_mut()
                .map(|s| s.take().expect("slot filled"))
                .collect();
            let result = Arc::new(gathered);
            round.filled = 0;
            round.readers = 1;
            if round.readers == self.num_ranks {
                round.result = None;
            } else {
                round.result = Some(result.clone());
            }
            self.cond.notify_all();
            return result.as_ref().clone();
        }

        loop {
            round = self.cond.wait(round).expect("exchange wait");
            if let Some(result) = round.result.clone() {
                round.readers += 1;
                if round.readers == self.num_ranks {
                    round.result = None;
                    self.cond.notify_all();
                }
                return result.as_ref().clone();
            }
        }
    }
}

pub struct InProcessContext {
    rank: usize,
    shared: Arc<InProcessExchange>,
}

impl DistributedContext for InProcessContext {
    fn id(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.num_ranks
    }

    fn gather(&self, local: Vec<u8>) -> Vec<Vec<u8>> {
        self.shared.gather(self.rank, local)
    }
}
