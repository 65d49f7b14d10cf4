//! Lightweight unique identifier for nodes within a [`Dag`](crate::dag::Dag).
//!
//! Each [`DIANode`](crate::node::DIANode) registered with a `Dag` is assigned
//! a sequential `NodeId`. These are opaque handles -- only the `Dag` and the
//! `StageBuilder` inspect them directly.
//!
//! They're small, `Copy`, and hashable, so they can be used efficiently as
//! keys when the `StageBuilder` tracks which nodes it has already visited.

/// Unique numeric identifier for a node in a job's DAG.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(u64);

impl NodeId {
    /// Create a new `NodeId` (used internally by [`Dag::alloc_id`](crate::dag::Dag::alloc_id)).
    pub(crate) fn new(v: u64) -> Self {
        Self(v)
    }

    /// Return the underlying numeric value.
    ///
    /// Useful mainly for debugging or serialization.
    pub fn raw(&self) -> u64 {
        self.0
    }
}
