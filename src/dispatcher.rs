//! Dispatcher: the event loop driving the Multiplexer's connections
//! (spec.md §4.7), grounded on `thrill/net/lowlevel/select_dispatcher.hpp`
//! (`AddRead`/`AddWrite`/`Cancel`, per-fd callback queues, a self-pipe to
//! wake the loop for out-of-band submissions).
//!
//! The source hand-rolls a `select()` reactor plus a self-pipe wakeup
//! because it predates a mainstream async runtime in its ecosystem. This
//! crate's corpus already settled that question (`vectordotdev-vector` runs
//! its connection-handling on `tokio`), so the named operations here are
//! thin wrappers over tokio's reactor and task spawner rather than a
//! hand-rolled `select()` loop -- the self-pipe trick and the per-fd watch
//! table it exists for are exactly what tokio's io driver already does
//! (recorded in DESIGN.md).

use crate::error::EngineError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// Opaque handle returned by [`Dispatcher::add_timer`], usable with
/// [`Dispatcher::cancel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Per-host event loop. `AddRead`/`AddWrite` are exposed as buffered,
/// completion-callback async operations (`AsyncRead`/`AsyncWrite`); writes
/// on the same connection are serialized by awaiting in submission order,
/// matching the source's per-connection write queue.
pub struct Dispatcher {
    timers: tokio::sync::Mutex<HashMap<TimerId, JoinHandle<()>>>,
    next_timer: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            timers: tokio::sync::Mutex::new(HashMap::new()),
            next_timer: AtomicU64::new(0),
        }
    }

    /// Reads exactly `buf.len()` bytes, completing the callback's moral
    /// equivalent by returning (spec.md §4.7: `AsyncRead(conn, n_bytes, cb)`).
    pub async fn async_read(&self, conn: &mut TcpStream, buf: &mut [u8]) -> Result<(), EngineError> {
        conn.read_exact(buf).await.map_err(|e| EngineError::io("async_read", e))?;
        Ok(())
    }

    /// Writes `buf` in full; writes to the same connection are serialized by
    /// the caller awaiting each in turn, never interleaved (spec.md §4.7).
    pub async fn async_write(&self, conn: &mut TcpStream, buf: &[u8]) -> Result<(), EngineError> {
        conn.write_all(buf).await.map_err(|e| EngineError::io("async_write", e))?;
        Ok(())
    }

    /// Schedules `cb` to run after `delay`. Returns a [`TimerId`] usable with
    /// [`Self::cancel`].
    pub async fn add_timer<F>(&self, delay: std::time::Duration, cb: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = TimerId(self.next_timer.fetch_add(1, Ordering::SeqCst));
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            cb();
        });
        self.timers.lock().await.insert(id, handle);
        id
    }

    /// Cancels a pending timer. A no-op if it already fired.
    pub async fn cancel(&self, id: TimerId) {
        if let Some(handle) = self.timers.lock().await.remove(&id) {
            handle.abort();
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
