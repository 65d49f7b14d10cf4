//! # Fluxion
//!
//! A distributed in-memory batch dataflow engine core, in the style of a
//! Map/Reduce successor: the DAG planner and stage executor, the shuffle
//! subsystem (multiplexed byte streams over point-to-point transport), the
//! block storage and serialization layer, and the in-memory hash tables
//! that back every reduce-style operator.
//!
//! This crate covers the engineering center of such a system. Deliberately
//! out of scope: the user-facing operator library (map, filter, sort,
//! join, ...), cluster bootstrap, CLI/argument parsing, and the concrete
//! bytewise serialization of user record types beyond the capability
//! interface in [`serialization`]. See `SPEC_FULL.md` and `DESIGN.md` in
//! the repository root for the full requirements and grounding ledger.
//!
//! ## Module overview
//!
//! - [`block`] -- ByteBlock, BlockPool, the pin/evict/spill state machine.
//! - [`file`] -- File: an ordered, append-only-then-immutable Block sequence.
//! - [`block_io`] -- BlockWriter/BlockReader, the typed item serialization layer.
//! - [`serialization`] -- the Serializable capability interface and FNV-1a type hashing.
//! - [`wire`] -- the on-the-wire Block header format.
//! - [`stream`] -- Cat and Mix streams, the all-to-all redistribution channel.
//! - [`multiplexer`] -- host-global routing of framed Blocks across TCP connections.
//! - [`dispatcher`] -- the async event loop driving the Multiplexer.
//! - [`host`] -- HostContext, the per-host owner of the above, plus collectives.
//! - [`node`], [`dag`], [`planner`] -- DIANode lifecycle, the DAG registry, and the StageBuilder.
//! - [`hash_table`] -- probing and bucket hash tables for reduce-style operators.
//! - [`reduce_phase`] -- glue between a hash table and a Stream's writers.
//! - [`config`] -- engine-wide tunables threaded into a HostContext.
//! - [`error`] -- the engine's error type.

pub mod block;
pub mod block_io;
pub mod config;
pub mod dag;
#[cfg(feature = "net-tcp")]
pub mod dispatcher;
pub mod error;
pub mod file;
pub mod hash_table;
pub mod host;
pub mod multiplexer;
pub mod node;
pub mod node_id;
pub mod planner;
pub mod reduce_phase;
pub mod serialization;
pub mod stream;
pub mod wire;

pub use config::EngineConfig;
pub use error::EngineError;
pub use host::HostContext;
pub use node_id::NodeId;
