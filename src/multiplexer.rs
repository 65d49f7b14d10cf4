//! Multiplexer: host-global dispatcher that frames and routes Blocks across
//! `H-1` TCP connections (spec.md §4.4), grounded on `thrill/data/
//! multiplexer.hpp` (one `Multiplexer` per host, a `Repository` of streams
//! keyed by id, `AsyncReadBlockHeader`/`OnBlockHeader` dispatch on magic
//! byte) and `thrill/data/stream_data.hpp` (the `MagicByte` enum this reuses
//! as `wire::Magic`).
//!
//! The repository and connection table are reached through a single
//! host-global mutex (spec.md §5); the actual connection I/O runs on the
//! `net-tcp` feature's tokio tasks, one per peer connection, mirroring the
//! source's single dispatcher thread per host.

use crate::block::BlockPool;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::stream::{Stream, StreamId, StreamKind};
use crate::wire::{BlockHeader, Magic, HEADER_LEN};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

struct Repository {
    streams: HashMap<StreamId, Arc<Stream>>,
}

/// One instance per host. Owns the stream repository and, when the
/// `net-tcp` feature is enabled, the per-peer TCP connections.
pub struct Multiplexer {
    config: EngineConfig,
    block_pool: BlockPool,
    repo: Mutex<Repository>,
    next_stream_id: AtomicU64,
    #[cfg(feature = "net-tcp")]
    connections: Mutex<HashMap<usize, Arc<tokio::sync::Mutex<tokio::net::TcpStream>>>>,
}

impl Multiplexer {
    pub fn new(config: EngineConfig, block_pool: BlockPool) -> Self {
        Self {
            config,
            block_pool,
            repo: Mutex::new(Repository {
                streams: HashMap::new(),
            }),
            next_stream_id: AtomicU64::new(0),
            #[cfg(feature = "net-tcp")]
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn num_hosts(&self) -> usize {
        self.config.num_hosts
    }

    pub fn my_host_rank(&self) -> usize {
        self.config.host_rank
    }

    pub fn num_workers(&self) -> usize {
        self.config.total_workers()
    }

    /// Allocates the next stream id. Deterministically shared across hosts:
    /// every host calls this the same number of times in the same program
    /// order, so ids line up without coordination (spec.md §4.3).
    pub fn allocate_stream_id(&self) -> StreamId {
        StreamId(self.next_stream_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Look up a stream by id, creating it (with the given kind) if absent.
    pub fn get_or_create_stream(&self, id: StreamId, kind: StreamKind) -> Arc<Stream> {
        let mut repo = self.repo.lock();
        repo.streams
            .entry(id)
            .or_insert_with(|| Arc::new(Stream::new(id, kind, self.config.total_workers(), &self.config)))
            .clone()
    }

    /// Request a new id and create its Stream in one call.
    pub fn new_stream(&self, kind: StreamKind) -> Arc<Stream> {
        let id = self.allocate_stream_id();
        self.get_or_create_stream(id, kind)
    }

    /// Releases a stream once every local worker has closed writers and
    /// dropped its reader (spec.md §4.4: reclamation condition).
    pub fn release_stream(&self, id: StreamId) {
        let mut repo = self.repo.lock();
        if let Some(s) = repo.streams.get(&id) {
            if s.fully_closed() {
                repo.streams.remove(&id);
            }
        }
    }

    pub fn block_pool(&self) -> &BlockPool {
        &self.block_pool
    }
}

#[cfg(feature = "net-tcp")]
impl Multiplexer {
    /// Registers an already-connected peer socket and spawns its read loop
    /// (mirrors the constructor in `multiplexer.hpp` calling
    /// `AsyncReadBlockHeader` on every peer connection at startup).
    pub async fn register_peer(self: &Arc<Self>, peer_host: usize, conn: tokio::net::TcpStream) {
        let shared = Arc::new(tokio::sync::Mutex::new(conn));
        self.connections.lock().insert(peer_host, Arc::clone(&shared));
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.read_loop(peer_host, shared).await {
                warn!(peer_host, error = %e, "multiplexer read loop terminated");
            }
        });
    }

    async fn read_loop(
        &self,
        peer_host: usize,
        conn: Arc<tokio::sync::Mutex<tokio::net::TcpStream>>,
    ) -> Result<(), EngineError> {
        use tokio::io::AsyncReadExt;
        loop {
            let mut header_buf = [0u8; HEADER_LEN];
            {
                let mut guard = conn.lock().await;
                match guard.read_exact(&mut header_buf).await {
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                    Err(e) => return Err(EngineError::io("read block header", e)),
                }
            }
            let header = BlockHeader::decode(&header_buf)?;
            self.on_block_header(peer_host, header, &conn).await?;
        }
    }

    async fn on_block_header(
        &self,
        peer_host: usize,
        header: BlockHeader,
        conn: &Arc<tokio::sync::Mutex<tokio::net::TcpStream>>,
    ) -> Result<(), EngineError> {
        use tokio::io::AsyncReadExt;

        let kind = match header.magic {
            Magic::Cat => StreamKind::Cat,
            Magic::Mix => StreamKind::Mix,
            Magic::Partition => StreamKind::Cat,
            Magic::Invalid => return Err(EngineError::protocol("invalid magic byte on wire")),
        };
        let stream = self.get_or_create_stream(header.stream_id, kind);

        let sender_global = peer_host * self.config.workers_per_host + header.sender_local_worker as usize;
        let receiver_global =
            self.config.host_rank * self.config.workers_per_host + header.receiver_local_worker as usize;

        if header.is_close_sentinel() {
            debug!(%header.stream_id, sender_global, receiver_global, "received close sentinel");
            stream.raw_sink(sender_global, receiver_global).close();
            return Ok(());
        }

        let mut payload = vec![0u8; header.payload_size as usize];
        {
            let mut guard = conn.lock().await;
            guard
                .read_exact(&mut payload)
                .await
                .map_err(|e| EngineError::io("read block payload", e))?;
        }
        let byte_block = self.block_pool.allocate(payload, receiver_global)?;
        let len = byte_block.size();
        self.block_pool.unpin(&byte_block, receiver_global);
        let block = crate::block::Block::new(
            byte_block,
            self.block_pool.clone(),
            receiver_global,
            0,
            len,
            header.first_item as usize,
            header.nitems as usize,
        );
        stream.raw_sink(sender_global, receiver_global).append_block(block);
        Ok(())
    }
}
