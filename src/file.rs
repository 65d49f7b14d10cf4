//! File: an ordered, append-only-then-immutable sequence of Blocks
//! (spec.md §3), grounded on `thrill/data/file.cpp`'s `GetWriter`/
//! `GetKeepReader`/`GetConsumeReader` split and its prefix-sum bookkeeping.

use crate::block::Block;
use crate::block_io::{BlockSink, BlockSource};
use std::sync::{Arc, Mutex};

struct FileInner {
    blocks: Vec<Block>,
    /// Prefix sums of `nitems`, enabling binary-search position lookup
    /// (spec.md §3: "prefix sums of nitems").
    item_prefix: Vec<usize>,
    size_bytes: usize,
    num_items: usize,
    closed: bool,
    /// DIA-id tag for stats (spec.md §3: "a File carries a DIA-id tag").
    dia_id: Option<u64>,
}

/// An ordered sequence of Blocks plus running byte/item sums.
#[derive(Clone)]
pub struct File {
    inner: Arc<Mutex<FileInner>>,
}

impl File {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FileInner {
                blocks: Vec::new(),
                item_prefix: vec![0],
                size_bytes: 0,
                num_items: 0,
                closed: false,
                dia_id: None,
            })),
        }
    }

    pub fn with_dia_id(dia_id: u64) -> Self {
        let f = Self::new();
        f.inner.lock().unwrap().dia_id = Some(dia_id);
        f
    }

    pub fn num_items(&self) -> usize {
        self.inner.lock().unwrap().num_items
    }

    pub fn size_bytes(&self) -> usize {
        self.inner.lock().unwrap().size_bytes
    }

    pub fn num_blocks(&self) -> usize {
        self.inner.lock().unwrap().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_blocks() == 0
    }

    /// Invariant check used by tests (spec.md §8 invariant 1).
    pub fn check_accounting(&self) -> bool {
        let g = self.inner.lock().unwrap();
        let size: usize = g.blocks.iter().map(Block::size).sum();
        let items: usize = g.blocks.iter().map(Block::nitems).sum();
        size == g.size_bytes && items == g.num_items
    }

    /// Non-consuming reader: blocks are shared by reference, the File keeps
    /// its data (`KeepFileBlockSource` in the source).
    pub fn keep_reader(&self) -> KeepFileBlockSource {
        KeepFileBlockSource {
            file: self.clone(),
            next_index: 0,
        }
    }

    /// Consuming reader: each call to `next_block` pops the File's front
    /// block, releasing it for reclamation (`ConsumeFileBlockSource`).
    pub fn consume_reader(&self) -> ConsumeFileBlockSource {
        ConsumeFileBlockSource { file: self.clone() }
    }

    pub fn clear(&self) {
        let mut g = self.inner.lock().unwrap();
        g.blocks.clear();
        g.item_prefix = vec![0];
        g.size_bytes = 0;
        g.num_items = 0;
    }
}

impl Default for File {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockSink for File {
    fn append_block(&mut self, block: Block) {
        if block.is_sentinel() {
            return;
        }
        let mut g = self.inner.lock().unwrap();
        g.size_bytes += block.size();
        g.num_items += block.nitems();
        let last = *g.item_prefix.last().unwrap();
        g.item_prefix.push(last + block.nitems());
        g.blocks.push(block);
    }

    fn close(&mut self) {
        self.inner.lock().unwrap().closed = true;
    }
}

/// Reads a File's blocks without consuming them.
pub struct KeepFileBlockSource {
    file: File,
    next_index: usize,
}

impl BlockSource for KeepFileBlockSource {
    fn next_block(&mut self) -> Option<Block> {
        let g = self.file.inner.lock().unwrap();
        let b = g.blocks.get(self.next_index).cloned();
        if b.is_some() {
            self.next_index += 1;
        }
        b
    }

    fn closed(&self) -> bool {
        let g = self.file.inner.lock().unwrap();
        self.next_index >= g.blocks.len()
    }
}

/// Reads a File's blocks, popping the front of the backing vector as it
/// goes. "Files are never closed" (source comment) -- the File is cleared
/// once fully consumed.
pub struct ConsumeFileBlockSource {
    file: File,
}

impl BlockSource for ConsumeFileBlockSource {
    fn next_block(&mut self) -> Option<Block> {
        let mut g = self.file.inner.lock().unwrap();
        if g.blocks.is_empty() {
            return None;
        }
        Some(g.blocks.remove(0))
    }

    fn closed(&self) -> bool {
        self.file.inner.lock().unwrap().blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ByteBlock;
    use crate::config::EngineConfig;

    fn dummy_block(pool: &crate::block::BlockPool, data: Vec<u8>, nitems: usize) -> Block {
        let first_item = 0;
        let len = data.len();
        let bb: ByteBlock = pool.allocate(data, 0).unwrap();
        pool.unpin(&bb, 0);
        Block::new(bb, pool.clone(), 0, 0, len, first_item, nitems)
    }

    #[test]
    fn accounting_matches_appended_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::block::BlockPool::new(EngineConfig::single_worker(dir.keep())).unwrap();
        let mut file = File::new();
        file.append_block(dummy_block(&pool, vec![0u8; 10], 3));
        file.append_block(dummy_block(&pool, vec![1u8; 20], 5));
        assert_eq!(file.size_bytes(), 30);
        assert_eq!(file.num_items(), 8);
        assert!(file.check_accounting());
    }
}
