//! End-to-end DAG lifecycle: Source -> MapLike -> DOp (a shuffle-backed
//! reduce) -> Action, driven by a single `StageBuilder::run_scope` call
//! (spec.md §4.5). Exercises Execute/PushData across the whole chain, a real
//! Cat stream shuffle inside the DOp, and that re-running the same action
//! only re-pushes already-`Executed` nodes instead of redoing their work.

use fluxion::block::BlockPool;
use fluxion::block_io::BlockWriter;
use fluxion::config::EngineConfig;
use fluxion::dag::Dag;
use fluxion::file::File;
use fluxion::node::{ActionNode, DIANode, DOpNode, MapLikeNode, SourceNode};
use fluxion::planner::StageBuilder;
use fluxion::reduce_phase::ReducePrePhase;
use fluxion::stream::{Stream, StreamId, StreamKind};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn pool() -> BlockPool {
    let dir = tempfile::tempdir().unwrap();
    BlockPool::new(EngineConfig::single_worker(dir.keep())).unwrap()
}

fn source_file(pool: &BlockPool, items: &[i64]) -> File {
    let file = File::new();
    let mut writer = BlockWriter::new(file.clone(), pool.clone(), 0);
    for v in items {
        writer.put(v);
    }
    writer.close();
    file
}

/// Doubles every item in a File, single-worker (no shuffle involved).
fn double_file(pool: &BlockPool, input: &File) -> File {
    let self_verify = pool.config().self_verify;
    let mut reader = fluxion::block_io::BlockReader::new(input.keep_reader(), self_verify);
    let out = File::new();
    let mut writer = BlockWriter::new(out.clone(), pool.clone(), 0);
    while let Some(v) = reader.next::<i64>().unwrap() {
        writer.put(&(v * 2));
    }
    writer.close();
    out
}

/// Shuffles a File's items into a reduce-by-key-modulo-2 over a 1-worker
/// Cat stream, then reads the result back into a single output File. This
/// is the DOp's collective work: a real `ReducePrePhase` into a real
/// `Stream`, not a stand-in closure.
fn reduce_mod_two(pool: &BlockPool, input: &File) -> File {
    let config = pool.config().clone();
    let stream = Stream::new(StreamId(42), StreamKind::Cat, 1, &config);
    let mut phase = ReducePrePhase::new(&stream, 0, pool.clone(), 1, 8, 1 << 10, |a: i64, b: i64| a + b);

    let self_verify = pool.config().self_verify;
    let mut reader = fluxion::block_io::BlockReader::new(input.keep_reader(), self_verify);
    while let Some(v) = reader.next::<i64>().unwrap() {
        phase.insert(v % 2, v);
    }
    phase.close();

    let out = File::new();
    let mut out_writer = BlockWriter::new(out.clone(), pool.clone(), 0);
    let mut shuffle_reader = stream.get_cat_reader(0);
    while let Some((k, v)) = shuffle_reader.next::<(i64, i64)>().unwrap() {
        out_writer.put(&(k, v));
    }
    out_writer.close();
    out
}

#[test]
fn full_pipeline_executes_once_and_repushes_on_rerun() {
    let pool = pool();
    let dag = Dag::new();

    let source_file = source_file(&pool, &(1..=20i64).collect::<Vec<_>>());
    let source = SourceNode::new(dag.alloc_id(), source_file);
    dag.insert(source.clone());

    let pool_for_map = pool.clone();
    let map: Arc<dyn DIANode> = MapLikeNode::new(
        dag.alloc_id(),
        source.clone(),
        Arc::new(move |f: &File| double_file(&pool_for_map, f)),
    );
    dag.insert(map.clone());

    let pool_for_dop = pool.clone();
    let dop: Arc<dyn DIANode> = DOpNode::new(
        dag.alloc_id(),
        vec![map.clone()],
        Box::new(move |parents| reduce_mod_two(&pool_for_dop, &parents[0].output())),
    );
    dag.insert(dop.clone());

    let execute_count = Arc::new(AtomicUsize::new(0));
    let collected: Arc<Mutex<Vec<(i64, i64)>>> = Arc::new(Mutex::new(Vec::new()));
    let execute_count2 = Arc::clone(&execute_count);
    let collected2 = Arc::clone(&collected);
    let self_verify = pool.config().self_verify;
    let action: Arc<dyn DIANode> = ActionNode::new(
        dag.alloc_id(),
        vec![dop.clone()],
        Box::new(move |parents| {
            execute_count2.fetch_add(1, Ordering::SeqCst);
            let mut reader =
                fluxion::block_io::BlockReader::new(parents[0].output().keep_reader(), self_verify);
            let mut out = collected2.lock();
            out.clear();
            while let Some(pair) = reader.next::<(i64, i64)>().unwrap() {
                out.push(pair);
            }
        }),
    );
    dag.insert(action.clone());

    StageBuilder::run_scope(&action);
    assert_eq!(execute_count.load(Ordering::SeqCst), 1);

    let totals = collected.lock().clone();
    assert_eq!(totals.len(), 2);
    let even_total: i64 = (2..=40).step_by(2).sum();
    let odd_total: i64 = (1..=39).step_by(2).sum();
    for (k, v) in &totals {
        if *k == 0 {
            assert_eq!(*v, even_total);
        } else {
            assert_eq!(*v, odd_total);
        }
    }

    // Re-running the scope over the same (now Executed) action is a no-op:
    // find_stages stops recursing the moment it reaches an already-Executed,
    // non-Collapse node, so the action neither re-executes (no second
    // increment of execute_count) nor redoes the DOp's shuffle -- it is
    // only ever re-pushed (spec.md §4.5), and an Action's push_data is a
    // terminal no-op.
    StageBuilder::run_scope(&action);
    assert_eq!(execute_count.load(Ordering::SeqCst), 1, "an already-Executed action must not re-run");
    assert_eq!(collected.lock().len(), 2, "materialized data from the first run must still be intact");
}

#[test]
#[should_panic(expected = "disposed")]
fn disposing_a_node_needed_by_a_rerun_is_fatal() {
    let pool = pool();
    let dag = Dag::new();

    let file = source_file(&pool, &[1, 2, 3]);
    let source: Arc<dyn DIANode> = SourceNode::new(dag.alloc_id(), file);
    dag.insert(source.clone());

    let first_action: Arc<dyn DIANode> =
        ActionNode::new(dag.alloc_id(), vec![source.clone()], Box::new(|_parents| {}));
    dag.insert(first_action.clone());
    StageBuilder::run_scope(&first_action);

    // Drop source's materialized data; it is still reachable as a parent of
    // a brand new action, so a second scope that needs it is a fatal
    // ordering bug rather than silently reading stale or empty data.
    source.dispose();

    let second_action: Arc<dyn DIANode> =
        ActionNode::new(dag.alloc_id(), vec![source.clone()], Box::new(|_parents| {}));
    dag.insert(second_action.clone());
    StageBuilder::run_scope(&second_action);
}
