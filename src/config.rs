//! Engine-wide tunables.
//!
//! Mirrors the teacher's `Runner`/`ExecMode` configuration struct, but covers
//! the knobs spec.md leaves as prose ("the pool cap", "the default block
//! size", "per-partition fill limit") instead of operator scheduling.

/// Default Block capacity in bytes (spec.md §3: "default 2 MiB").
pub const DEFAULT_BLOCK_SIZE: usize = 2 * 1024 * 1024;

/// Engine configuration threaded into every [`crate::host::HostContext`].
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Byte capacity of a freshly allocated Block.
    pub block_size: usize,
    /// Hard resident-memory cap enforced by the BlockPool, in bytes.
    pub memory_cap_bytes: usize,
    /// Number of hosts in the job.
    pub num_hosts: usize,
    /// Rank of this host among `num_hosts`.
    pub host_rank: usize,
    /// Symmetric worker threads per host.
    pub workers_per_host: usize,
    /// Directory the per-host swap file is created in.
    pub swap_dir: std::path::PathBuf,
    /// Per-partition item fill limit for reduction hash tables before spill.
    pub table_fill_limit_items: usize,
    /// Per-partition slot count for reduction hash tables.
    pub table_partition_slots: usize,
    /// Whether self-verify type-hash prefixes are emitted/checked (spec §9:
    /// "retain as a compile-time switch... under debug"). Defaults to
    /// `cfg!(debug_assertions)` but is independently overridable for tests.
    pub self_verify: bool,
}

impl EngineConfig {
    /// A single-host, single-worker configuration suitable for unit tests.
    pub fn single_worker(swap_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            memory_cap_bytes: 64 * DEFAULT_BLOCK_SIZE,
            num_hosts: 1,
            host_rank: 0,
            workers_per_host: 1,
            swap_dir: swap_dir.into(),
            table_fill_limit_items: 1 << 16,
            table_partition_slots: 1 << 14,
            self_verify: cfg!(debug_assertions),
        }
    }

    /// Total number of workers `W = H * T` in the job.
    pub fn total_workers(&self) -> usize {
        self.num_hosts * self.workers_per_host
    }
}
