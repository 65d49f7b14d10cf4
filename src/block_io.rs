//! BlockWriter and BlockReader (spec.md §4.2), grounded on
//! `thrill/data/block_writer.hpp` (MarkItem/Append-with-straddling-loop/
//! Put/Close) and the keep/consume `FileBlockSource` split in
//! `thrill/data/file.cpp`.

use crate::block::{Block, BlockPool};
use crate::error::EngineError;
use crate::serialization::{ByteSink, ByteSource, Serializable};
use bytes::Bytes;

/// Destination a BlockWriter seals finished Blocks into: a File, a Stream
/// writer, or a BlockQueue (spec.md §4.2).
pub trait BlockSink {
    fn append_block(&mut self, block: Block);
    fn close(&mut self);
}

/// Source a BlockReader pulls Blocks from.
pub trait BlockSource {
    /// Returns `None` (or a sentinel, depending on the source) at end of input.
    fn next_block(&mut self) -> Option<Block>;
    fn closed(&self) -> bool;
}

/// Serializes a stream of typed items into successive Blocks delivered to a
/// [`BlockSink`]. Owns one in-flight block at a time.
pub struct BlockWriter<S: BlockSink> {
    sink: S,
    pool: BlockPool,
    worker: usize,
    block_size: usize,
    self_verify: bool,
    buffer: Vec<u8>,
    first_item: Option<usize>,
    nitems: usize,
    closed: bool,
}

impl<S: BlockSink> BlockWriter<S> {
    pub fn new(sink: S, pool: BlockPool, worker: usize) -> Self {
        let block_size = pool.config().block_size;
        let self_verify = pool.config().self_verify;
        Self {
            sink,
            pool,
            worker,
            block_size,
            self_verify,
            buffer: Vec::with_capacity(block_size),
            first_item: None,
            nitems: 0,
            closed: false,
        }
    }

    /// Marks the start of a new record. Sets `first_item` the first time
    /// it's called for the current block; always increments `nitems`.
    pub fn mark_item(&mut self) {
        if self.first_item.is_none() {
            self.first_item = Some(self.buffer.len());
        }
        self.nitems += 1;
    }

    /// Serialize one item, with a self-verify type-hash prefix when enabled.
    pub fn put<T: Serializable>(&mut self, item: &T) {
        self.mark_item();
        if self.self_verify {
            let hash = T::type_hash().to_le_bytes();
            self.put_raw(&hash);
        }
        item.serialize(self);
        self.maybe_flush();
    }

    fn maybe_flush(&mut self) {
        if self.buffer.len() >= self.block_size {
            self.flush_block();
        }
    }

    /// Seals the current block (even if partial) and hands it to the sink.
    pub fn flush(&mut self) {
        if !self.buffer.is_empty() || self.nitems > 0 {
            self.flush_block();
        }
    }

    fn flush_block(&mut self) {
        let data = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.block_size));
        let len = data.len();
        // No record started in this block: first_item >= end (spec.md §4.2).
        let first_item = self.first_item.take().unwrap_or(len);
        let nitems = std::mem::take(&mut self.nitems);
        let byte_block = self.pool.allocate(data, self.worker).expect("block allocation");
        self.pool.unpin(&byte_block, self.worker);
        let block = Block::new(byte_block, self.pool.clone(), self.worker, 0, len, first_item, nitems);
        self.sink.append_block(block);
    }

    /// Flushes, then forwards a close signal (sentinel) to the sink.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.flush();
        self.sink.append_block(Block::sentinel());
        self.sink.close();
        self.closed = true;
    }
}

impl<S: BlockSink> ByteSink for BlockWriter<S> {
    fn put_byte(&mut self, b: u8) {
        if self.buffer.len() >= self.block_size {
            self.flush_block();
        }
        self.buffer.push(b);
    }

    fn put_raw(&mut self, mut bytes: &[u8]) {
        // Straddling loop: a record larger than a block is legal (spec.md §4.2).
        while !bytes.is_empty() {
            let room = self.block_size.saturating_sub(self.buffer.len());
            if room == 0 {
                self.flush_block();
                continue;
            }
            let take = room.min(bytes.len());
            self.buffer.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
        }
    }
}

impl<S: BlockSink> Drop for BlockWriter<S> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Deserializes a stream of typed items out of Blocks pulled from a
/// [`BlockSource`], presenting an append-only byte stream across block
/// boundaries.
pub struct BlockReader<Src: BlockSource> {
    source: Src,
    self_verify: bool,
    current: Bytes,
    pos: usize,
    ended: bool,
}

impl<Src: BlockSource> BlockReader<Src> {
    pub fn new(source: Src, self_verify: bool) -> Self {
        Self {
            source,
            self_verify,
            current: Bytes::new(),
            pos: 0,
            ended: false,
        }
    }

    fn advance_block(&mut self) -> bool {
        match self.source.next_block() {
            Some(b) if !b.is_sentinel() => {
                self.current = b.data();
                self.pos = 0;
                true
            }
            _ => {
                self.ended = true;
                false
            }
        }
    }

    /// May require reading one byte of lookahead (spec.md §4.2).
    pub fn has_next(&mut self) -> bool {
        if self.ended {
            return false;
        }
        while self.pos >= self.current.len() {
            if !self.advance_block() {
                return false;
            }
        }
        true
    }

    fn skip_bytes(&mut self, mut n: usize) -> Result<(), EngineError> {
        while n > 0 {
            if !self.has_next() {
                return Err(EngineError::serialization("short read while skipping"));
            }
            let avail = self.current.len() - self.pos;
            let take = avail.min(n);
            self.pos += take;
            n -= take;
        }
        Ok(())
    }

    /// Fast-path skip for fixed-size types: advances by byte arithmetic
    /// without deserializing (spec.md §4.2, §8 invariant 6).
    pub fn skip<T: Serializable>(&mut self, n_items: usize) -> Result<(), EngineError> {
        let size = T::fixed_size()
            .ok_or_else(|| EngineError::usage("Skip requires a fixed-size item type"))?;
        let per_item = size + if self.self_verify { 8 } else { 0 };
        self.skip_bytes(n_items * per_item)
    }

    /// Deserialize the next item, or `None` at end of input.
    pub fn next<T: Serializable>(&mut self) -> Result<Option<T>, EngineError> {
        if !self.has_next() {
            return Ok(None);
        }
        if self.self_verify {
            let mut hash_buf = [0u8; 8];
            self.get_raw(&mut hash_buf)?;
            let hash = u64::from_le_bytes(hash_buf);
            if hash != T::type_hash() {
                return Err(EngineError::protocol(format!(
                    "self-verify type hash mismatch: expected {:#x}, got {hash:#x}",
                    T::type_hash()
                )));
            }
        }
        T::deserialize(self).map(Some)
    }
}

impl<Src: BlockSource> ByteSource for BlockReader<Src> {
    fn get_byte(&mut self) -> Option<u8> {
        if !self.has_next() {
            return None;
        }
        let b = self.current[self.pos];
        self.pos += 1;
        Some(b)
    }

    fn get_raw(&mut self, buf: &mut [u8]) -> Result<(), EngineError> {
        let mut filled = 0;
        while filled < buf.len() {
            if !self.has_next() {
                return Err(EngineError::serialization("short read"));
            }
            let avail = self.current.len() - self.pos;
            let need = buf.len() - filled;
            let take = avail.min(need);
            buf[filled..filled + take].copy_from_slice(&self.current[self.pos..self.pos + take]);
            self.pos += take;
            filled += take;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::file::File;

    fn pool() -> BlockPool {
        let dir = tempfile::tempdir().unwrap();
        BlockPool::new(EngineConfig::single_worker(dir.keep())).unwrap()
    }

    #[test]
    fn item_round_trip_keep_reader() {
        let pool = pool();
        let self_verify = pool.config().self_verify;
        let file = File::new();
        let mut writer = BlockWriter::new(file.clone(), pool, 0);
        for i in 0..2000i64 {
            writer.put(&i);
        }
        writer.close();

        let mut reader = BlockReader::new(file.keep_reader(), self_verify);
        for i in 0..2000i64 {
            assert_eq!(reader.next::<i64>().unwrap(), Some(i));
        }
        assert_eq!(reader.next::<i64>().unwrap(), None);
    }

    #[test]
    fn skip_matches_successive_next_calls() {
        let pool = pool();
        let self_verify = pool.config().self_verify;
        let file = File::new();
        let mut writer = BlockWriter::new(file.clone(), pool, 0);
        for i in 0..500i32 {
            writer.put(&i);
        }
        writer.close();

        let mut skip_reader = BlockReader::new(file.keep_reader(), self_verify);
        skip_reader.skip::<i32>(100).unwrap();
        let mut next_reader = BlockReader::new(file.keep_reader(), self_verify);
        for _ in 0..100 {
            next_reader.next::<i32>().unwrap();
        }

        assert_eq!(skip_reader.next::<i32>().unwrap(), next_reader.next::<i32>().unwrap());
    }

    #[test]
    fn straddling_record_spans_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = EngineConfig::single_worker(dir.keep());
        cfg.block_size = 16; // force a long String to straddle blocks
        let pool = BlockPool::new(cfg).unwrap();
        let self_verify = pool.config().self_verify;
        let file = File::new();
        let mut writer = BlockWriter::new(file.clone(), pool, 0);
        let long = "x".repeat(100);
        writer.put(&long);
        writer.put(&"short".to_string());
        writer.close();

        assert!(file.num_blocks() > 1);
        let mut reader = BlockReader::new(file.keep_reader(), self_verify);
        assert_eq!(reader.next::<String>().unwrap(), Some(long));
        assert_eq!(reader.next::<String>().unwrap(), Some("short".to_string()));
    }
}
