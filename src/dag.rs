//! Dag: the node registry and id allocator backing a running job's DAG
//! description (spec.md §3/§4.5). Every host builds a structurally
//! identical Dag from the same user program (spec.md §5: "the DAG
//! description is bit-identical"); this type just owns the nodes and hands
//! out fresh ids, mirroring the teacher's `Pipeline` storing a flat node map
//! rather than a tree.

use crate::node::{DIANode, NodeId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct Dag {
    nodes: Mutex<HashMap<NodeId, Arc<dyn DIANode>>>,
    next_id: AtomicU64,
}

impl Dag {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Allocates the next `NodeId`. Every host calls this the same number
    /// of times in the same program order, so ids line up across hosts
    /// without coordination, the same way `Multiplexer::allocate_stream_id`
    /// does for streams.
    pub fn alloc_id(&self) -> NodeId {
        NodeId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Registers a freshly constructed node. Nodes are immutable once built
    /// (their parent list and kind never change), so this is the only write
    /// path into the registry.
    pub fn insert(&self, node: Arc<dyn DIANode>) {
        self.nodes.lock().insert(node.id(), node);
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<dyn DIANode>> {
        self.nodes.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Dag {
    fn default() -> Self {
        Self::new()
    }
}
