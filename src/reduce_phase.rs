//! ReducePrePhase: the glue between a reduce hash table and a Stream's
//! writers (spec.md §4.6 "Reduce pre-phase", §2's component table: "glue
//! between hash tables and Stream writers, producing the shuffle-side of
//! reduce"). Grounded on `thrill/core/reduce_pre_phase.hpp`, which wires a
//! `ReduceProbingTable`'s spill emitter directly to `data::Stream` writers --
//! one writer per partition, since a reduce's output partitions are the
//! target workers of its shuffle.

use crate::block::BlockPool;
use crate::block_io::BlockWriter;
use crate::hash_table::{BucketHashTable, ProbingHashTable};
use crate::serialization::Serializable;
use crate::stream::{QueueSink, Stream};
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;

/// Builds the emitter closure shared between the hash table and the
/// `close()` path: both need access to the same `Vec<BlockWriter<..>>`, but
/// a hash table holding both its own emitter and that emitter's captured
/// state in one struct would self-borrow, so the writers live behind an
/// `Arc<Mutex<_>>` owned jointly by the table's closure and this phase.
fn spill_emitter<K, V>(
    writers: Arc<Mutex<Vec<BlockWriter<QueueSink>>>>,
) -> impl FnMut(usize, Vec<(K, V)>)
where
    K: Serializable,
    V: Serializable,
{
    move |partition: usize, items: Vec<(K, V)>| {
        let mut w = writers.lock();
        for (k, v) in items {
            w[partition].put(&(k, v));
        }
    }
}

/// Drives a [`ProbingHashTable`] whose spills flow into one
/// [`BlockWriter`] per output partition (spec.md §4.6 glue).
pub struct ReducePrePhase<K, V, R>
where
    K: Eq + Hash + Serializable + Send + 'static,
    V: Serializable + Send + 'static,
    R: Fn(V, V) -> V,
{
    table: ProbingHashTable<K, V, R, Box<dyn FnMut(usize, Vec<(K, V)>) + Send>>,
    writers: Arc<Mutex<Vec<BlockWriter<QueueSink>>>>,
}

impl<K, V, R> ReducePrePhase<K, V, R>
where
    K: Eq + Hash + Serializable + Send + 'static,
    V: Serializable + Send + 'static,
    R: Fn(V, V) -> V,
{
    /// `partitions` is normally `stream.num_workers()`: a reduce's output
    /// partition count equals the number of target workers of its shuffle
    /// (spec.md §3: "P = number of target workers in the output shuffle").
    pub fn new(
        stream: &Stream,
        from_worker: usize,
        pool: BlockPool,
        partitions: usize,
        slots_per_partition: usize,
        fill_limit: usize,
        reduce: R,
    ) -> Self {
        let writers = Arc::new(Mutex::new(stream.get_writers_with_pool(from_worker, pool)));
        let emit: Box<dyn FnMut(usize, Vec<(K, V)>) + Send> = Box::new(spill_emitter(Arc::clone(&writers)));
        let table = ProbingHashTable::new(partitions, slots_per_partition, fill_limit, reduce, emit);
        Self { table, writers }
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.table.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Flushes every partition through its writer, then closes every writer
    /// (spec.md §4.2 "Close() flushes, then forwards a close signal").
    pub fn close(mut self) {
        self.table.flush_all();
        let mut w = self.writers.lock();
        for writer in w.iter_mut() {
            writer.close();
        }
    }
}

/// Bucket-chain flavor of [`ReducePrePhase`], for workloads where the
/// probing variant's full-partition retry cost is undesirable (spec.md
/// §4.6: "Bucket variant").
pub struct ReducePrePhaseBucket<K, V, R>
where
    K: Eq + Hash + Serializable + Send + 'static,
    V: Serializable + Send + 'static,
    R: Fn(V, V) -> V,
{
    table: BucketHashTable<K, V, R, Box<dyn FnMut(usize, Vec<(K, V)>) + Send>>,
    writers: Arc<Mutex<Vec<BlockWriter<QueueSink>>>>,
}

impl<K, V, R> ReducePrePhaseBucket<K, V, R>
where
    K: Eq + Hash + Serializable + Send + 'static,
    V: Serializable + Send + 'static,
    R: Fn(V, V) -> V,
{
    pub fn new(
        stream: &Stream,
        from_worker: usize,
        pool: BlockPool,
        partitions: usize,
        slots_per_partition: usize,
        fill_limit: usize,
        reduce: R,
    ) -> Self {
        let writers = Arc::new(Mutex::new(stream.get_writers_with_pool(from_worker, pool)));
        let emit: Box<dyn FnMut(usize, Vec<(K, V)>) + Send> = Box::new(spill_emitter(Arc::clone(&writers)));
        let table = BucketHashTable::new(partitions, slots_per_partition, fill_limit, reduce, emit);
        Self { table, writers }
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.table.insert(key, value);
    }

    pub fn close(mut self) {
        self.table.flush_all();
        let mut w = self.writers.lock();
        for writer in w.iter_mut() {
            writer.close();
        }
    }
}
