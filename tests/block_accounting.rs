//! S1 -- File round-trip (spec.md §8) plus invariants 1 (block accounting)
//! and 2 (item round-trip, keep vs. consume readers).

use fluxion::block::BlockPool;
use fluxion::block_io::{BlockReader, BlockWriter};
use fluxion::config::EngineConfig;
use fluxion::file::File;

fn pool() -> BlockPool {
    let dir = tempfile::tempdir().unwrap();
    BlockPool::new(EngineConfig::single_worker(dir.keep())).unwrap()
}

/// S1: write 0..1_000_000 in order, read back through a keep-reader.
#[test]
fn file_round_trip_one_million_integers() {
    let pool = pool();
    let self_verify = pool.config().self_verify;
    let file = File::new();
    let mut writer = BlockWriter::new(file.clone(), pool, 0);
    for i in 0..1_000_000i64 {
        writer.put(&i);
    }
    writer.close();

    assert_eq!(file.num_items(), 1_000_000);
    assert!(file.check_accounting());

    let mut reader = BlockReader::new(file.keep_reader(), self_verify);
    for i in 0..1_000_000i64 {
        assert_eq!(reader.next::<i64>().unwrap(), Some(i));
    }
    assert_eq!(reader.next::<i64>().unwrap(), None);
}

/// Invariant 2 holds for a consuming reader too, and consuming drains the
/// backing File as it goes.
#[test]
fn consume_reader_drains_file_while_round_tripping() {
    let pool = pool();
    let self_verify = pool.config().self_verify;
    let file = File::new();
    let mut writer = BlockWriter::new(file.clone(), pool, 0);
    for i in 0..5_000i64 {
        writer.put(&i);
    }
    writer.close();
    assert!(!file.is_empty());

    let mut reader = BlockReader::new(file.consume_reader(), self_verify);
    let mut got = Vec::new();
    while let Some(v) = reader.next::<i64>().unwrap() {
        got.push(v);
    }
    assert_eq!(got, (0..5_000i64).collect::<Vec<_>>());
    assert!(file.is_empty(), "consuming reader must release blocks as it reads");
}

/// Invariant 1: block accounting holds across many small writer flushes,
/// not just one contiguous write.
#[test]
fn accounting_holds_across_many_small_files() {
    let pool = pool();
    for n in [0usize, 1, 17, 500] {
        let file = File::new();
        let mut writer = BlockWriter::new(file.clone(), pool.clone(), 0);
        for i in 0..n {
            writer.put(&(i as i32));
        }
        writer.close();
        assert_eq!(file.num_items(), n);
        assert!(file.check_accounting());
    }
}
