//! Stream: the logical all-to-all redistribution channel (spec.md §3, §4.3).
//!
//! Grounded on `thrill/data/stream_data.hpp` (per-stream `sem_queue_`
//! backpressure, the W*W sentinel close-accounting), `thrill/data/
//! block_queue.hpp` (BlockQueue/BlockQueueSource), and `thrill/data/
//! cat_stream.hpp` (per-source-rank concatenation). The in-process
//! worker-to-worker grid modeled here is the same loopback path the
//! Multiplexer's `CatLoopback`/`MixLoopback` use for same-host transfers;
//! cross-host transfers are the Multiplexer's job (`multiplexer.rs`), which
//! plugs into the same per-cell `BlockQueue`.
//!
//! Open Questions resolved (SPEC_FULL.md §9): the backpressure semaphore is
//! per-stream, and a Mix reader exposes the source rank.

use crate::block::Block;
use crate::block_io::{BlockReader, BlockSink, BlockWriter};
use crate::file::File;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Select, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Globally unique (within a job) stream identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Cat,
    Mix,
}

/// Counts outstanding bytes queued toward delivery; writers acquire
/// proportional to payload size, releases happen on completion (spec.md
/// §4.3). This bounds in-flight shuffle memory for one stream.
struct ByteSemaphore {
    cap: usize,
    outstanding: Mutex<usize>,
    room: Condvar,
}

impl ByteSemaphore {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            outstanding: Mutex::new(0),
            room: Condvar::new(),
        }
    }

    fn acquire(&self, n: usize) {
        let mut g = self.outstanding.lock();
        while *g + n > self.cap {
            self.room.wait(&mut g);
        }
        *g += n;
    }

    fn release(&self, n: usize) {
        let mut g = self.outstanding.lock();
        *g = g.saturating_sub(n);
        self.room.notify_all();
    }
}

/// A thread-safe hand-over queue between a writer and a reader (spec.md
/// §4.3). Each Block is delivered exactly once via [`BlockQueue::pop`].
#[derive(Clone)]
pub struct BlockQueue {
    tx: Sender<Block>,
    rx: Receiver<Block>,
    write_closed: Arc<AtomicBool>,
}

impl BlockQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            write_closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn append(&self, block: Block) {
        let _ = self.tx.send(block);
    }

    /// Idempotent; returns `true` the first time it actually closes the
    /// queue (so callers can count the close exactly once), `false` on any
    /// later call.
    pub fn close_write(&self) -> bool {
        if !self.write_closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Block::sentinel());
            true
        } else {
            false
        }
    }

    /// Blocking pop; returns a sentinel block once the writer has closed.
    pub fn pop(&self) -> Block {
        self.rx.recv().unwrap_or_else(|_| Block::sentinel())
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub(crate) fn receiver(&self) -> &Receiver<Block> {
        &self.rx
    }
}

impl Default for BlockQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`BlockSink`] that writes into one cell of a Stream's worker grid,
/// charging the stream's backpressure semaphore per payload byte.
pub struct QueueSink {
    queue: BlockQueue,
    sem: Arc<ByteSemaphore>,
    sentinels: Arc<AtomicUsize>,
}

impl BlockSink for QueueSink {
    fn append_block(&mut self, block: Block) {
        if block.is_sentinel() {
            if self.queue.close_write() {
                self.sentinels.fetch_add(1, Ordering::SeqCst);
            }
            return;
        }
        let n = block.size();
        self.sem.acquire(n);
        self.queue.append(block);
        // Loopback delivery is synchronous, so the "I/O completion callback"
        // that would release the semaphore on a networked stream fires
        // immediately here.
        self.sem.release(n);
    }

    fn close(&mut self) {
        if self.queue.close_write() {
            self.sentinels.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// [`crate::block_io::BlockSource`] that concatenates a worker's incoming
/// queues in source-rank order (Cat semantics, spec.md §3).
pub struct CatSource {
    queues: Vec<BlockQueue>,
    idx: usize,
}

impl crate::block_io::BlockSource for CatSource {
    fn next_block(&mut self) -> Option<Block> {
        while self.idx < self.queues.len() {
            let b = self.queues[self.idx].pop();
            if b.is_sentinel() {
                self.idx += 1;
                continue;
            }
            return Some(b);
        }
        None
    }

    fn closed(&self) -> bool {
        self.idx >= self.queues.len()
    }
}

/// Reads a Mix stream: blocks arrive in arrival order, each tagged with the
/// source worker rank it came from (Open Question #2: exposed, not hidden).
pub struct MixReader {
    queues: Vec<BlockQueue>,
    current: Bytes,
    current_source: usize,
    pos: usize,
}

impl MixReader {
    fn new(queues: Vec<BlockQueue>) -> Self {
        Self {
            queues,
            current: Bytes::new(),
            current_source: 0,
            pos: 0,
        }
    }

    fn advance(&mut self) -> bool {
        while !self.queues.is_empty() {
            let mut sel = Select::new();
            for q in &self.queues {
                sel.recv(q.receiver());
            }
            let oper = sel.select();
            let idx = oper.index();
            let block = oper
                .recv(self.queues[idx].receiver())
                .unwrap_or_else(|_| Block::sentinel());
            if block.is_sentinel() {
                self.queues.remove(idx);
                continue;
            }
            self.current = block.data();
            self.current_source = idx;
            self.pos = 0;
            return true;
        }
        false
    }

    fn has_next(&mut self) -> bool {
        while self.pos >= self.current.len() {
            if !self.advance() {
                return false;
            }
        }
        true
    }

    /// Next `(source_worker_rank, item)` pair, or `None` at end of stream.
    pub fn next<T: crate::serialization::Serializable>(
        &mut self,
    ) -> Result<Option<(usize, T)>, crate::error::EngineError> {
        if !self.has_next() {
            return Ok(None);
        }
        let source = self.current_source;
        // Items are always read fully within the block they start in for the
        // fixed-size primitive types exercised by this reader; variable-size
        // items that straddle blocks keep their tag from the starting block.
        let item = {
            struct Cursor<'a> {
                bytes: &'a Bytes,
                pos: &'a mut usize,
            }
            impl<'a> crate::serialization::ByteSource for Cursor<'a> {
                fn get_byte(&mut self) -> Option<u8> {
                    if *self.pos >= self.bytes.len() {
                        return None;
                    }
                    let b = self.bytes[*self.pos];
                    *self.pos += 1;
                    Some(b)
                }
                fn get_raw(&mut self, buf: &mut [u8]) -> Result<(), crate::error::EngineError> {
                    let end = *self.pos + buf.len();
                    if end > self.bytes.len() {
                        return Err(crate::error::EngineError::serialization(
                            "mix reader short read within block",
                        ));
                    }
                    buf.copy_from_slice(&self.bytes[*self.pos..end]);
                    *self.pos = end;
                    Ok(())
                }
            }
            let mut cursor = Cursor {
                bytes: &self.current,
                pos: &mut self.pos,
            };
            T::deserialize(&mut cursor)?
        };
        Ok(Some((source, item)))
    }
}

/// A logical Stream: `W` incoming queues per receiving worker, `W` outgoing
/// sinks per sending worker, created identically on every host (spec.md §3).
pub struct Stream {
    id: StreamId,
    kind: StreamKind,
    num_workers: usize,
    /// `grid[sender][receiver]`.
    grid: Vec<Vec<BlockQueue>>,
    sem: Arc<ByteSemaphore>,
    sentinels: Arc<AtomicUsize>,
    self_verify: bool,
}

impl Stream {
    pub fn new(id: StreamId, kind: StreamKind, num_workers: usize, config: &crate::config::EngineConfig) -> Self {
        let grid = (0..num_workers)
            .map(|_| (0..num_workers).map(|_| BlockQueue::new()).collect())
            .collect();
        Self {
            id,
            kind,
            num_workers,
            grid,
            sem: Arc::new(ByteSemaphore::new(config.memory_cap_bytes)),
            sentinels: Arc::new(AtomicUsize::new(0)),
            self_verify: config.self_verify,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// `W` writers from `from_worker`, one per target worker.
    pub fn get_writers(&self, from_worker: usize) -> Vec<BlockWriter<QueueSink>> {
        (0..self.num_workers)
            .map(|to| {
                let sink = QueueSink {
                    queue: self.grid[from_worker][to].clone(),
                    sem: Arc::clone(&self.sem),
                    sentinels: Arc::clone(&self.sentinels),
                };
                // BlockWriter needs a pool to allocate sealed blocks; callers
                // supply it via `with_pool` below when pools differ per host.
                BlockWriter::new(sink, self.scratch_pool(), from_worker)
            })
            .collect()
    }

    /// Like [`Self::get_writers`] but using a caller-supplied pool (the
    /// common case: the worker's own `HostContext` pool).
    pub fn get_writers_with_pool(
        &self,
        from_worker: usize,
        pool: crate::block::BlockPool,
    ) -> Vec<BlockWriter<QueueSink>> {
        (0..self.num_workers)
            .map(|to| {
                let sink = QueueSink {
                    queue: self.grid[from_worker][to].clone(),
                    sem: Arc::clone(&self.sem),
                    sentinels: Arc::clone(&self.sentinels),
                };
                BlockWriter::new(sink, pool.clone(), from_worker)
            })
            .collect()
    }

    fn scratch_pool(&self) -> crate::block::BlockPool {
        // Only reached by tests that don't route through a HostContext; a
        // throwaway pool backed by a tempdir keeps get_writers() ergonomic.
        let dir = tempfile::tempdir().expect("scratch swap dir");
        crate::block::BlockPool::new(crate::config::EngineConfig::single_worker(dir.keep()))
            .expect("scratch pool")
    }

    /// A Cat reader for `for_worker`, concatenating the `W` source queues in
    /// rank order.
    pub fn get_cat_reader(&self, for_worker: usize) -> BlockReader<CatSource> {
        assert_eq!(self.kind, StreamKind::Cat, "stream is not a Cat stream");
        let queues = (0..self.num_workers)
            .map(|from| self.grid[from][for_worker].clone())
            .collect();
        BlockReader::new(CatSource { queues, idx: 0 }, self.self_verify)
    }

    /// A Mix reader for `for_worker`, yielding blocks in arrival order
    /// tagged with their source.
    pub fn get_mix_reader(&self, for_worker: usize) -> MixReader {
        assert_eq!(self.kind, StreamKind::Mix, "stream is not a Mix stream");
        let queues = (0..self.num_workers)
            .map(|from| self.grid[from][for_worker].clone())
            .collect();
        MixReader::new(queues)
    }

    /// Raw, un-typed sink into one grid cell -- used by [`scatter`] to
    /// redistribute a File's Blocks without re-serializing them.
    pub fn raw_sink(&self, from_worker: usize, to_worker: usize) -> QueueSink {
        QueueSink {
            queue: self.grid[from_worker][to_worker].clone(),
            sem: Arc::clone(&self.sem),
            sentinels: Arc::clone(&self.sentinels),
        }
    }

    /// Whether all `W*W` sentinels have been accounted for (spec.md §4.3:
    /// "the Stream is fully closed when W*W sentinels have been accounted
    /// for").
    pub fn fully_closed(&self) -> bool {
        let seen = self.sentinels.load(Ordering::SeqCst);
        let total = self.num_workers * self.num_workers;
        let closed = seen >= total;
        if closed {
            trace!(stream_id = %self.id, seen, total, "stream fully closed");
        }
        closed
    }
}

/// Redistributes a File's existing Blocks across `W` target workers without
/// re-serializing -- used to implement sort's redistribution (spec.md §4.3).
///
/// `boundaries` has `num_workers + 1` entries; worker `i` receives the
/// Blocks whose `first_item` falls in item-range `[boundaries[i],
/// boundaries[i+1])`. Redistribution happens at Block granularity: a Block
/// whose first item falls in a target's range carries its *entire* contents
/// to that target, matching the coarse-grained redistribution Sort needs.
pub fn scatter(file: &File, boundaries: &[usize], stream: &Stream, from_worker: usize) {
    let mut reader = file.keep_reader();
    let mut item_offset = 0usize;
    loop {
        use crate::block_io::BlockSource;
        let Some(block) = reader.next_block() else { break };
        if block.is_sentinel() {
            continue;
        }
        let target = boundaries
            .windows(2)
            .position(|w| item_offset >= w[0] && item_offset < w[1])
            .unwrap_or(boundaries.len().saturating_sub(2));
        item_offset += block.nitems();
        let mut sink = stream.raw_sink(from_worker, target);
        sink.append_block(block);
    }
    for to in 0..stream.num_workers {
        stream.raw_sink(from_worker, to).close();
    }
}
