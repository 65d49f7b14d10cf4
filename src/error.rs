//! Typed error kinds for the engine core.
//!
//! Every failure the core recognizes is fatal to the job (see spec §7): there
//! is no retry and no partial-success state. Call sites wrap [`EngineError`]
//! in `anyhow::Result` and add `.context(...)` at fallible boundaries, the
//! same way the rest of this crate does.

use crate::stream::StreamId;
use thiserror::Error;

/// The five error kinds the core distinguishes.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network or swap-file I/O failure.
    #[error("io failure on {context}: {source}")]
    IoFailure {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Magic byte or type-hash check failed on read.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Allocation impossible even after full eviction.
    #[error("out of memory: requested {requested} bytes, pool cap is {cap} bytes")]
    OutOfMemory { requested: usize, cap: usize },

    /// Invalid DAG usage: rerunning a Disposed node, double pin-release, etc.
    #[error("usage error: {0}")]
    UsageError(String),

    /// Short read or truncated record.
    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl EngineError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::IoFailure {
            context: context.into(),
            source,
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolMismatch(msg.into())
    }

    pub fn usage(msg: impl Into<String>) -> Self {
        Self::UsageError(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::SerializationError(msg.into())
    }
}

/// Error context naming the stream a shuffle-side failure occurred on.
///
/// Attached via `anyhow::Context` at the Stream/Multiplexer boundary so a
/// job-terminating error still names the offending stream, per spec §7
/// ("describing the kind and... the stream ID, stage label, and the
/// offending peer").
#[derive(Debug, Error)]
#[error("stream {stream_id} (peer host {peer_host:?})")]
pub struct StreamContext {
    pub stream_id: StreamId,
    pub peer_host: Option<usize>,
}
