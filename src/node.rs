//! DIANode: the execution graph node type (spec.md §3/§4.5), grounded on
//! `thrill/api/dia_node.hpp`'s `DIABase` and spec.md §9's explicit mapping:
//! "a polymorphic DIANode trait with three methods (execute, push_data,
//! dispose) and an enum tag for type-based scheduling decisions."
//!
//! The concrete operator library (map/filter/reduce/sort/join/...) is
//! explicitly out of scope (spec.md §1); what this module provides is the
//! generic node lifecycle and child-registration mechanism that any such
//! operator would be built on. `DOpNode`/`ActionNode` take their collective
//! work as an injected closure rather than hard-coding a specific operator,
//! matching `DIABase`'s pure-virtual `Execute`/`PushData`.

use crate::file::File;
pub use crate::node_id::NodeId;
use parking_lot::Mutex;
use std::sync::Arc;

/// Type tag distinguishing the four node shapes named in spec.md §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// Holds pre-materialized data; no parents.
    Source,
    /// A fused Map/Filter/FlatMap stack postpending a parent's output.
    MapLike,
    /// A distributed operator: collective work, typically a shuffle.
    DOp,
    /// Terminal: triggers the StageBuilder over its dependency subgraph.
    Action,
    /// Re-execution boundary: passes a parent's output through unchanged,
    /// even if the parent is already `Executed`.
    Collapse,
    /// Materializes a parent's output once and holds it for repeated reads.
    Cache,
}

/// Lifecycle state of a DIANode (spec.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    New,
    Executed,
    Disposed,
}

/// A registered downstream consumer: invoked with the parent's output File
/// and the `consume` flag `PushData` was called with. Children record their
/// own fused function stack as part of the closure itself (spec.md §4.5:
/// "a child records a fused function stack... fed in registration order").
pub type ChildFeed = Arc<dyn Fn(&File, bool) + Send + Sync>;

/// Polymorphic node behavior. Every concrete node type (Source, MapLike,
/// DOp, Action, Collapse, Cache) implements this directly; shared
/// bookkeeping lives in [`NodeBase`], which implementors embed.
pub trait DIANode: Send + Sync {
    fn id(&self) -> NodeId;
    fn kind(&self) -> NodeKind;
    fn state(&self) -> NodeState;
    fn set_state(&self, state: NodeState);
    /// Counted references to this node's dependencies (spec.md §3: "a
    /// reference-counted parent list; children are raw back-pointers").
    fn parents(&self) -> Vec<Arc<dyn DIANode>>;
    fn register_child(&self, feed: ChildFeed);

    /// Perform this node's collective work and leave output in an internal
    /// File. No-op for nodes whose data already exists (Source, Collapse).
    fn execute(&self);

    /// Stream this node's output through every registered child in
    /// registration order.
    fn push_data(&self, consume: bool);

    /// Release this node's held memory. Further `push_data` calls against a
    /// Disposed node are a fatal programming error (spec.md §4.5), enforced
    /// by the StageBuilder rather than here.
    fn dispose(&self);

    /// This node's materialized output. Only valid once `state()` has
    /// passed `New` (i.e. is `Executed`); panics otherwise, since calling
    /// it earlier is a StageBuilder ordering bug, not a recoverable error.
    fn output(&self) -> File;

    /// Whether this node's output is safe to drop after a single downstream
    /// traversal (spec.md §4.5: "inferable from children's keep/no-keep
    /// decorations"). Conservatively `false` unless a node knows better.
    fn default_consume(&self) -> bool {
        false
    }
}

/// Shared fields every concrete node embeds: identity, state, parent list,
/// and the ordered child-feed registry.
pub struct NodeBase {
    id: NodeId,
    kind: NodeKind,
    parents: Vec<Arc<dyn DIANode>>,
    state: Mutex<NodeState>,
    children: Mutex<Vec<ChildFeed>>,
}

impl NodeBase {
    pub fn new(id: NodeId, kind: NodeKind, parents: Vec<Arc<dyn DIANode>>) -> Self {
        Self {
            id,
            kind,
            parents,
            state: Mutex::new(NodeState::New),
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn parents(&self) -> Vec<Arc<dyn DIANode>> {
        self.parents.clone()
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    pub fn set_state(&self, s: NodeState) {
        *self.state.lock() = s;
    }

    pub fn register_child(&self, feed: ChildFeed) {
        self.children.lock().push(feed);
    }

    /// Invokes every registered child, in registration order, with `file`.
    pub fn feed_children(&self, file: &File, consume: bool) {
        for feed in self.children.lock().iter() {
            feed(file, consume);
        }
    }
}

/// Holds pre-materialized data; the start of a DAG chain (spec.md §3).
pub struct SourceNode {
    base: NodeBase,
    file: File,
}

impl SourceNode {
    pub fn new(id: NodeId, file: File) -> Arc<Self> {
        Arc::new(Self {
            base: NodeBase::new(id, NodeKind::Source, Vec::new()),
            file,
        })
    }
}

impl DIANode for SourceNode {
    fn id(&self) -> NodeId {
        self.base.id()
    }
    fn kind(&self) -> NodeKind {
        self.base.kind()
    }
    fn state(&self) -> NodeState {
        self.base.state()
    }
    fn set_state(&self, state: NodeState) {
        self.base.set_state(state)
    }
    fn parents(&self) -> Vec<Arc<dyn DIANode>> {
        self.base.parents()
    }
    fn register_child(&self, feed: ChildFeed) {
        self.base.register_child(feed)
    }
    fn execute(&self) {
        self.base.set_state(NodeState::Executed);
    }
    fn push_data(&self, consume: bool) {
        self.base.feed_children(&self.file, consume);
    }
    fn dispose(&self) {
        self.file.clear();
        self.base.set_state(NodeState::Disposed);
    }
    fn output(&self) -> File {
        self.file.clone()
    }
}

/// A fused Map/Filter/FlatMap stack postpending a parent's natural output
/// (spec.md §3). The stack itself is collapsed to a single closure by the
/// time it reaches a node, since the concrete per-item transforms are the
/// out-of-scope operator library; only the fusion mechanism is in scope.
pub struct MapLikeNode {
    base: NodeBase,
    parent: Arc<dyn DIANode>,
    transform: Arc<dyn Fn(&File) -> File + Send + Sync>,
    output: Mutex<Option<File>>,
}

impl MapLikeNode {
    pub fn new(
        id: NodeId,
        parent: Arc<dyn DIANode>,
        transform: Arc<dyn Fn(&File) -> File + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: NodeBase::new(id, NodeKind::MapLike, vec![parent.clone()]),
            parent,
            transform,
            output: Mutex::new(None),
        })
    }
}

impl DIANode for MapLikeNode {
    fn id(&self) -> NodeId {
        self.base.id()
    }
    fn kind(&self) -> NodeKind {
        self.base.kind()
    }
    fn state(&self) -> NodeState {
        self.base.state()
    }
    fn set_state(&self, state: NodeState) {
        self.base.set_state(state)
    }
    fn parents(&self) -> Vec<Arc<dyn DIANode>> {
        self.base.parents()
    }
    fn register_child(&self, feed: ChildFeed) {
        self.base.register_child(feed)
    }
    fn execute(&self) {
        let out = (self.transform)(&self.parent.output());
        *self.output.lock() = Some(out);
        self.base.set_state(NodeState::Executed);
    }
    fn push_data(&self, consume: bool) {
        self.base.feed_children(&self.output(), consume);
    }
    fn dispose(&self) {
        *self.output.lock() = None;
        self.base.set_state(NodeState::Disposed);
    }
    fn output(&self) -> File {
        self.output
            .lock()
            .clone()
            .expect("MapLikeNode::output called before execute")
    }
}

/// A distributed operator: collective work over one or more parents,
/// typically a shuffle. The work itself is injected, since the concrete
/// operators (Reduce, Sort, Zip, GroupBy) are out of scope here.
pub struct DOpNode {
    base: NodeBase,
    run: Box<dyn Fn(&[Arc<dyn DIANode>]) -> File + Send + Sync>,
    output: Mutex<Option<File>>,
}

impl DOpNode {
    pub fn new(
        id: NodeId,
        parents: Vec<Arc<dyn DIANode>>,
        run: Box<dyn Fn(&[Arc<dyn DIANode>]) -> File + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: NodeBase::new(id, NodeKind::DOp, parents),
            run,
            output: Mutex::new(None),
        })
    }
}

impl DIANode for DOpNode {
    fn id(&self) -> NodeId {
        self.base.id()
    }
    fn kind(&self) -> NodeKind {
        self.base.kind()
    }
    fn state(&self) -> NodeState {
        self.base.state()
    }
    fn set_state(&self, state: NodeState) {
        self.base.set_state(state)
    }
    fn parents(&self) -> Vec<Arc<dyn DIANode>> {
        self.base.parents()
    }
    fn register_child(&self, feed: ChildFeed) {
        self.base.register_child(feed)
    }
    fn execute(&self) {
        let out = (self.run)(&self.base.parents());
        *self.output.lock() = Some(out);
        self.base.set_state(NodeState::Executed);
    }
    fn push_data(&self, consume: bool) {
        self.base.feed_children(&self.output(), consume);
    }
    fn dispose(&self) {
        *self.output.lock() = None;
        self.base.set_state(NodeState::Disposed);
    }
    fn output(&self) -> File {
        self.output
            .lock()
            .clone()
            .expect("DOpNode::output called before execute")
    }
}

/// Terminal node. Triggers `StageBuilder::run_scope` over its own
/// dependency subgraph (spec.md §4.5); produces no DIA output of its own.
pub struct ActionNode {
    base: NodeBase,
    run: Box<dyn Fn(&[Arc<dyn DIANode>]) + Send + Sync>,
}

impl ActionNode {
    pub fn new(
        id: NodeId,
        parents: Vec<Arc<dyn DIANode>>,
        run: Box<dyn Fn(&[Arc<dyn DIANode>]) + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: NodeBase::new(id, NodeKind::Action, parents),
            run,
        })
    }
}

impl DIANode for ActionNode {
    fn id(&self) -> NodeId {
        self.base.id()
    }
    fn kind(&self) -> NodeKind {
        self.base.kind()
    }
    fn state(&self) -> NodeState {
        self.base.state()
    }
    fn set_state(&self, state: NodeState) {
        self.base.set_state(state)
    }
    fn parents(&self) -> Vec<Arc<dyn DIANode>> {
        self.base.parents()
    }
    fn register_child(&self, feed: ChildFeed) {
        self.base.register_child(feed)
    }
    fn execute(&self) {
        (self.run)(&self.base.parents());
        self.base.set_state(NodeState::Executed);
    }
    fn push_data(&self, _consume: bool) {
        // Actions are terminal: nothing downstream to feed.
    }
    fn dispose(&self) {
        self.base.set_state(NodeState::Disposed);
    }
    fn output(&self) -> File {
        File::new()
    }
}

/// Re-execution boundary: passes a parent's output through unchanged, even
/// once the parent is `Executed` (spec.md §4.5: the StageBuilder continues
/// walking through Collapse nodes regardless of their own state).
pub struct CollapseNode {
    base: NodeBase,
    parent: Arc<dyn DIANode>,
}

impl CollapseNode {
    pub fn new(id: NodeId, parent: Arc<dyn DIANode>) -> Arc<Self> {
        Arc::new(Self {
            base: NodeBase::new(id, NodeKind::Collapse, vec![parent.clone()]),
            parent,
        })
    }
}

impl DIANode for CollapseNode {
    fn id(&self) -> NodeId {
        self.base.id()
    }
    fn kind(&self) -> NodeKind {
        self.base.kind()
    }
    fn state(&self) -> NodeState {
        self.base.state()
    }
    fn set_state(&self, state: NodeState) {
        self.base.set_state(state)
    }
    fn parents(&self) -> Vec<Arc<dyn DIANode>> {
        self.base.parents()
    }
    fn register_child(&self, feed: ChildFeed) {
        self.base.register_child(feed)
    }
    fn execute(&self) {
        self.base.set_state(NodeState::Executed);
    }
    fn push_data(&self, consume: bool) {
        self.base.feed_children(&self.parent.output(), consume);
    }
    fn dispose(&self) {
        self.base.set_state(NodeState::Disposed);
    }
    fn output(&self) -> File {
        self.parent.output()
    }
}

/// Materializes a parent's output once and holds it for repeated reads
/// (spec.md §3).
pub struct CacheNode {
    base: NodeBase,
    parent: Arc<dyn DIANode>,
    cached: Mutex<Option<File>>,
}

impl CacheNode {
    pub fn new(id: NodeId, parent: Arc<dyn DIANode>) -> Arc<Self> {
        Arc::new(Self {
            base: NodeBase::new(id, NodeKind::Cache, vec![parent.clone()]),
            parent,
            cached: Mutex::new(None),
        })
    }
}

impl DIANode for CacheNode {
    fn id(&self) -> NodeId {
        self.base.id()
    }
    fn kind(&self) -> NodeKind {
        self.base.kind()
    }
    fn state(&self) -> NodeState {
        self.base.state()
    }
    fn set_state(&self, state: NodeState) {
        self.base.set_state(state)
    }
    fn parents(&self) -> Vec<Arc<dyn DIANode>> {
        self.base.parents()
    }
    fn register_child(&self, feed: ChildFeed) {
        self.base.register_child(feed)
    }
    fn execute(&self) {
        *self.cached.lock() = Some(self.parent.output());
        self.base.set_state(NodeState::Executed);
    }
    fn push_data(&self, consume: bool) {
        self.base.feed_children(&self.output(), consume);
    }
    fn dispose(&self) {
        *self.cached.lock() = None;
        self.base.set_state(NodeState::Disposed);
    }
    fn output(&self) -> File {
        self.cached
            .lock()
            .clone()
            .expect("CacheNode::output called before execute")
    }
    fn default_consume(&self) -> bool {
        // A cache exists precisely so repeated pushes see the same data;
        // never drop it on a single traversal.
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_io::BlockWriter;
    use crate::block::BlockPool;
    use crate::config::EngineConfig;
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT: AtomicU64 = AtomicU64::new(0);
    fn next_id() -> NodeId {
        NodeId::new(NEXT.fetch_add(1, Ordering::SeqCst))
    }

    fn make_file(pool: &BlockPool, items: &[i64]) -> File {
        let file = File::new();
        let mut writer = BlockWriter::new(file.clone(), pool.clone(), 0);
        for v in items {
            writer.put(v);
        }
        writer.close();
        file
    }

    #[test]
    fn source_feeds_registered_children_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::single_worker(dir.path().to_path_buf());
        let pool = BlockPool::new(config).unwrap();
        let file = make_file(&pool, &[1, 2, 3]);

        let source = SourceNode::new(next_id(), file);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen1 = Arc::clone(&seen);
        source.register_child(Arc::new(move |_f: &File, _consume: bool| {
            seen1.lock().push("first");
        }));
        let seen2 = Arc::clone(&seen);
        source.register_child(Arc::new(move |_f: &File, _consume: bool| {
            seen2.lock().push("second");
        }));

        source.execute();
        source.push_data(false);
        assert_eq!(*seen.lock(), vec!["first", "second"]);
    }

    #[test]
    fn collapse_passes_through_executed_parent() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::single_worker(dir.path().to_path_buf());
        let pool = BlockPool::new(config).unwrap();
        let file = make_file(&pool, &[10, 20]);

        let source: Arc<dyn DIANode> = SourceNode::new(next_id(), file);
        source.execute();
        let collapse = CollapseNode::new(next_id(), Arc::clone(&source));
        collapse.execute();
        assert_eq!(collapse.output().num_items(), 2);
    }
}
