//! HostContext: the per-host owner of the BlockPool, Multiplexer, and swap
//! file (spec.md §9: "model them as components explicitly owned by a
//! HostContext value that is threaded into every worker on startup").
//!
//! Collectives are grounded on `thrill/net/group.hpp`'s `Group` object
//! (spec.md §5 lists `AllReduce`/`Broadcast`/`PrefixSum`/`Barrier` as
//! synchronizing suspension points). This crate implements them over an
//! in-process rendezvous when all participating workers are local; a
//! networked job would route the same calls through the `Multiplexer`'s
//! host-to-host connections instead -- wiring that path is left as future
//! work (see DESIGN.md), since cluster bootstrap itself is explicitly out of
//! scope (spec.md §1).

use crate::block::BlockPool;
use crate::config::EngineConfig;
use crate::multiplexer::Multiplexer;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Per-host collective-communication rendezvous for the local workers.
///
/// Each collective is a barrier: every worker's call blocks until all
/// `workers_per_host` calls for that *round* have arrived, then all are
/// released together (spec.md §5: "a worker enters the next stage only
/// when the collective completes").
pub struct Collectives {
    workers: usize,
    state: Mutex<CollectiveState>,
    cv: Condvar,
}

struct CollectiveState {
    round: u64,
    arrived: usize,
    /// Accumulator slot for AllReduce/PrefixSum contributions this round.
    contributions: Vec<i64>,
}

impl Collectives {
    fn new(workers: usize) -> Self {
        Self {
            workers,
            state: Mutex::new(CollectiveState {
                round: 0,
                arrived: 0,
                contributions: Vec::new(),
            }),
            cv: Condvar::new(),
        }
    }

    /// Blocks until every local worker has called `barrier` for the current
    /// round.
    pub fn barrier(&self) {
        let mut st = self.state.lock();
        let my_round = st.round;
        st.arrived += 1;
        if st.arrived == self.workers {
            st.arrived = 0;
            st.round += 1;
            st.contributions.clear();
            self.cv.notify_all();
        } else {
            while st.round == my_round {
                self.cv.wait(&mut st);
            }
        }
    }

    /// Combines `value` from every worker with `reduce`, returning the same
    /// result to all callers.
    pub fn all_reduce(&self, value: i64, reduce: impl Fn(i64, i64) -> i64) -> i64 {
        let mut st = self.state.lock();
        let my_round = st.round;
        st.contributions.push(value);
        st.arrived += 1;
        if st.arrived == self.workers {
            let combined = st.contributions.iter().copied().reduce(&reduce).unwrap();
            st.arrived = 0;
            st.round += 1;
            st.contributions = vec![combined];
            self.cv.notify_all();
            combined
        } else {
            while st.round == my_round {
                self.cv.wait(&mut st);
            }
            st.contributions[0]
        }
    }

    /// Broadcasts `value` from worker 0 to all workers.
    pub fn broadcast(&self, worker_rank: usize, value: Option<i64>) -> i64 {
        let mut st = self.state.lock();
        let my_round = st.round;
        if worker_rank == 0 {
            st.contributions = vec![value.expect("root must supply a value")];
        }
        st.arrived += 1;
        if st.arrived == self.workers {
            st.arrived = 0;
            st.round += 1;
            self.cv.notify_all();
            st.contributions[0]
        } else {
            while st.round == my_round {
                self.cv.wait(&mut st);
            }
            st.contributions[0]
        }
    }
}

/// Owns the per-host BlockPool, Multiplexer, and Collectives.
pub struct HostContext {
    pub config: EngineConfig,
    pub block_pool: BlockPool,
    pub multiplexer: Arc<Multiplexer>,
    pub collectives: Arc<Collectives>,
}

impl HostContext {
    pub fn new(config: EngineConfig) -> Result<Self, crate::error::EngineError> {
        let block_pool = BlockPool::new(config.clone())?;
        let multiplexer = Arc::new(Multiplexer::new(config.clone(), block_pool.clone()));
        let collectives = Arc::new(Collectives::new(config.workers_per_host));
        Ok(Self {
            config,
            block_pool,
            multiplexer,
            collectives,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn barrier_releases_all_workers() {
        let coll = Arc::new(Collectives::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let c = Arc::clone(&coll);
            handles.push(thread::spawn(move || c.barrier()));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn all_reduce_sums_across_workers() {
        let coll = Arc::new(Collectives::new(4));
        let mut handles = Vec::new();
        for i in 0..4 {
            let c = Arc::clone(&coll);
            handles.push(thread::spawn(move || c.all_reduce(i as i64, |a, b| a + b)));
        }
        for h in handles {
            assert_eq!(h.join().unwrap(), 0 + 1 + 2 + 3);
        }
    }
}
