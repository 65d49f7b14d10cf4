//! StageBuilder: assembles and runs the stages needed to satisfy one Action
//! (spec.md §4.5), grounded on `thrill/core/stage_builder.hpp`'s
//! `FindStages()` (reverse-DFS over parents, continuing through Collapse
//! nodes even if already executed) and `RunScope()` (Execute+PushData for
//! New nodes, PushData-only for already-Executed ones).

use crate::node::{DIANode, NodeId, NodeKind, NodeState};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument};

pub struct StageBuilder;

impl StageBuilder {
    /// Walks `action`'s parents transitively, collecting every node whose
    /// state is `New` or whose kind is `Collapse` (spec.md §4.5). Recursion
    /// stops at a node that is already `Executed` and not a Collapse
    /// boundary: its own parents are already materialized and irrelevant to
    /// this run. Returns nodes in topological (parents-before-children)
    /// order, ready for `run_scope` to process in sequence.
    pub fn find_stages(action: &Arc<dyn DIANode>) -> Vec<Arc<dyn DIANode>> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        Self::visit(action, &mut visited, &mut order);
        order
    }

    fn visit(node: &Arc<dyn DIANode>, visited: &mut HashSet<NodeId>, order: &mut Vec<Arc<dyn DIANode>>) {
        if !visited.insert(node.id()) {
            return;
        }
        let stop_here = matches!(node.state(), NodeState::Executed) && !matches!(node.kind(), NodeKind::Collapse);
        if !stop_here {
            for parent in node.parents() {
                Self::visit(&parent, visited, order);
            }
        }
        order.push(node.clone());
    }

    /// Runs every stage found by `find_stages`, in order (spec.md §4.5):
    /// a `New` node executes then pushes (`consume` from the node's own
    /// judgment); an already-`Executed` node only re-pushes, with
    /// `consume = false` since its children are being rerun over data it
    /// must still hold; a `Disposed` node reappearing here is a fatal
    /// programming error (spec.md §4.5, Open Question: Dispose on a node
    /// with live handles).
    #[instrument(level = "debug", skip(action), fields(action_id = ?action.id(), stages))]
    pub fn run_scope(action: &Arc<dyn DIANode>) {
        let stages = Self::find_stages(action);
        tracing::Span::current().record("stages", stages.len());
        for node in &stages {
            match node.state() {
                NodeState::New => {
                    debug!(node_id = ?node.id(), kind = ?node.kind(), "executing stage");
                    node.execute();
                    let consume = node.default_consume();
                    node.push_data(consume);
                }
                NodeState::Executed => {
                    debug!(node_id = ?node.id(), kind = ?node.kind(), "re-pushing already-executed stage");
                    node.push_data(false);
                }
                NodeState::Disposed => {
                    panic!(
                        "DIANode {:?} was disposed but its output is needed by a repeated push",
                        node.id()
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockPool;
    use crate::block_io::BlockWriter;
    use crate::config::EngineConfig;
    use crate::dag::Dag;
    use crate::file::File;
    use crate::node::{ActionNode, CollapseNode, SourceNode};
    use parking_lot::Mutex;
    use tracing_test::traced_test;

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
    #[traced_test]
    fn run_scope_logs_stage_execution() {
        let dir = tempfile::tempdir().unwrap();
        let pool = BlockPool::new(EngineConfig::single_worker(dir.path().to_path_buf())).unwrap();
        let file = make_file(&pool, &[1, 2, 3]);

        let dag = Dag::new();
        let source = SourceNode::new(dag.alloc_id(), file);
        dag.insert(source.clone());
        let action_parent: Arc<dyn DIANode> = source.clone();
        let action: Arc<dyn DIANode> =
            ActionNode::new(dag.alloc_id(), vec![action_parent], Box::new(|_parents| {}));

        StageBuilder::run_scope(&action);
        assert!(logs_contain("executing stage"));
    }

    #[test]
    fn new_source_executes_then_pushes_once() {
        let dir = tempfile::tempdir().unwrap();
        let pool = BlockPool::new(EngineConfig::single_worker(dir.path().to_path_buf())).unwrap();
        let file = make_file(&pool, &[1, 2, 3]);

        let dag = Dag::new();
        let source = SourceNode::new(dag.alloc_id(), file);
        dag.insert(source.clone());

        let pushed: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
        let pushed2 = Arc::clone(&pushed);
        source.register_child(Arc::new(move |f: &File, _consume| {
            *pushed2.lock() += f.num_items();
        }));

        let action_parent: Arc<dyn DIANode> = source.clone();
        let action: Arc<dyn DIANode> =
            ActionNode::new(dag.alloc_id(), vec![action_parent], Box::new(|_parents| {}));

        StageBuilder::run_scope(&action);
        assert_eq!(*pushed.lock(), 3);
        assert_eq!(source.state(), NodeState::Executed);
    }

    #[test]
    fn collapse_node_is_revisited_even_once_executed() {
        let dir = tempfile::tempdir().unwrap();
        let pool = BlockPool::new(EngineConfig::single_worker(dir.path().to_path_buf())).unwrap();
        let file = make_file(&pool, &[10, 20]);

        let dag = Dag::new();
        let source = SourceNode::new(dag.alloc_id(), file);
        source.execute();
        dag.insert(source.clone());

        let collapse = CollapseNode::new(dag.alloc_id(), source.clone() as Arc<dyn DIANode>);
        dag.insert(collapse.clone());

        let stages = StageBuilder::find_stages(&(collapse.clone() as Arc<dyn DIANode>));
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].id(), source.id());
        assert_eq!(stages[1].id(), collapse.id());
    }
}
