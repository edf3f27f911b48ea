//! Tests for the Engine
//!
//! These tests verify:
//! - Engine open, close and reopen
//! - Store, fetch, remove and scan through transactions
//! - Snapshot isolation and steps
//! - Write-write conflicts, waits and lock timeouts
//! - Tree management
//! - Pruning of obsolete versions and accumulators

use std::thread;
use std::time::{Duration, Instant};

use keelkv::{AccumulatorType, Config, Engine, KeelError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config(temp_dir: &TempDir) -> Config {
    Config::builder()
        .data_dir(temp_dir.path())
        .cleanup_interval_ms(60_000)
        .lock_timeout_ms(5_000)
        .build()
}

fn setup_temp_engine() -> (TempDir, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(test_config(&temp_dir)).unwrap();
    (temp_dir, engine)
}

fn setup_with_tree() -> (TempDir, Engine, u32) {
    let (temp_dir, engine) = setup_temp_engine();
    let tree = engine.create_tree("data").unwrap();
    (temp_dir, engine, tree)
}

// =============================================================================
// Basic Operations
// =============================================================================

#[test]
fn test_open_creates_directories() {
    let (temp_dir, engine) = setup_temp_engine();
    assert!(temp_dir.path().join("journal").is_dir());
    assert!(temp_dir.path().join("checkpoints").is_dir());
    assert!(engine.tree_names().is_empty());
}

#[test]
fn test_store_and_fetch() {
    let (_temp, engine, tree) = setup_with_tree();
    engine.store(tree, b"key1", b"value1").unwrap();
    assert_eq!(engine.fetch(tree, b"key1").unwrap(), Some(b"value1".to_vec()));
    assert_eq!(engine.fetch(tree, b"missing").unwrap(), None);
}

#[test]
fn test_overwrite() {
    let (_temp, engine, tree) = setup_with_tree();
    engine.store(tree, b"key", b"old").unwrap();
    engine.store(tree, b"key", b"new").unwrap();
    assert_eq!(engine.fetch(tree, b"key").unwrap(), Some(b"new".to_vec()));
}

#[test]
fn test_remove() {
    let (_temp, engine, tree) = setup_with_tree();
    engine.store(tree, b"key", b"value").unwrap();
    assert!(engine.remove(tree, b"key").unwrap());
    assert_eq!(engine.fetch(tree, b"key").unwrap(), None);
    assert!(!engine.remove(tree, b"key").unwrap());
    assert!(!engine.remove(tree, b"never").unwrap());
}

#[test]
fn test_scan_is_ordered() {
    let (_temp, engine, tree) = setup_with_tree();
    for i in (0..50).rev() {
        engine
            .store(tree, format!("key{:03}", i).as_bytes(), format!("v{}", i).as_bytes())
            .unwrap();
    }

    let txn = engine.begin();
    let all = txn.scan(tree).unwrap();
    assert_eq!(all.len(), 50);
    assert_eq!(all[0].0, b"key000".to_vec());
    assert_eq!(all[49].1, b"v49".to_vec());
    for pair in all.windows(2) {
        assert!(pair[0].0 < pair[1].0);
    }

    let range = txn.scan_range(tree, b"key010", b"key020").unwrap();
    assert_eq!(range.len(), 10);
    txn.commit().unwrap();
}

#[test]
fn test_remove_range() {
    let (_temp, engine, tree) = setup_with_tree();
    for i in 0..20 {
        engine
            .store(tree, format!("key{:02}", i).as_bytes(), b"v")
            .unwrap();
    }

    let mut txn = engine.begin();
    assert!(txn.remove_range(tree, b"key05", b"key15").unwrap());
    assert!(!txn.remove_range(tree, b"zzz", b"zzzz").unwrap());
    txn.commit().unwrap();

    let txn = engine.begin();
    let left = txn.scan(tree).unwrap();
    assert_eq!(left.len(), 10);
    assert!(left
        .iter()
        .all(|(k, _)| k.as_slice() < b"key05".as_slice() || k.as_slice() >= b"key15".as_slice()));
}

// =============================================================================
// Isolation Tests
// =============================================================================

#[test]
fn test_snapshot_isolation() {
    let (_temp, engine, tree) = setup_with_tree();
    engine.store(tree, b"k", b"v1").unwrap();

    let reader = engine.begin();
    engine.store(tree, b"k", b"v2").unwrap();
    engine.store(tree, b"new", b"x").unwrap();

    assert_eq!(reader.fetch(tree, b"k").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(reader.fetch(tree, b"new").unwrap(), None);
    assert_eq!(reader.scan(tree).unwrap().len(), 1);
    reader.commit().unwrap();

    assert_eq!(engine.fetch(tree, b"k").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn test_uncommitted_writes_invisible_to_others() {
    let (_temp, engine, tree) = setup_with_tree();
    let mut writer = engine.begin();
    writer.store(tree, b"k", b"pending").unwrap();
    assert_eq!(writer.fetch(tree, b"k").unwrap(), Some(b"pending".to_vec()));

    let other = engine.begin();
    assert_eq!(other.fetch(tree, b"k").unwrap(), None);
    writer.commit().unwrap();
    // Still invisible: committed after `other` started
    assert_eq!(other.fetch(tree, b"k").unwrap(), None);
    other.commit().unwrap();
}

#[test]
fn test_steps_within_transaction() {
    let (_temp, engine, tree) = setup_with_tree();
    let mut txn = engine.begin();
    assert_eq!(txn.step(), 0);
    txn.store(tree, b"k", b"step0").unwrap();
    assert_eq!(txn.increment_step().unwrap(), 1);
    txn.store(tree, b"k", b"step1").unwrap();
    assert_eq!(txn.fetch(tree, b"k").unwrap(), Some(b"step1".to_vec()));
    txn.commit().unwrap();

    assert_eq!(engine.fetch(tree, b"k").unwrap(), Some(b"step1".to_vec()));
    assert_eq!(engine.version_count(tree, b"k").unwrap(), 3);
}

#[test]
fn test_rollback_discards_writes() {
    let (_temp, engine, tree) = setup_with_tree();
    engine.store(tree, b"keep", b"1").unwrap();

    let mut txn = engine.begin();
    txn.store(tree, b"keep", b"2").unwrap();
    txn.store(tree, b"gone", b"3").unwrap();
    txn.rollback().unwrap();

    assert_eq!(engine.fetch(tree, b"keep").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.fetch(tree, b"gone").unwrap(), None);
    // A rolled back new key is pruned away at once
    assert_eq!(engine.version_count(tree, b"gone").unwrap(), 0);
}

#[test]
fn test_drop_rolls_back() {
    let (_temp, engine, tree) = setup_with_tree();
    {
        let mut txn = engine.begin();
        txn.store(tree, b"k", b"v").unwrap();
    }
    assert_eq!(engine.fetch(tree, b"k").unwrap(), None);
    assert_eq!(engine.stats().rollbacks, 1);
}

// =============================================================================
// Write-Write Dependency Tests
// =============================================================================

#[test]
fn test_write_conflict_forces_rollback() {
    let (_temp, engine, tree) = setup_with_tree();
    let mut first = engine.begin();
    let mut second = engine.begin();

    first.store(tree, b"k", b"first").unwrap();
    first.commit().unwrap();

    let err = second.store(tree, b"k", b"second").unwrap_err();
    assert!(matches!(err, KeelError::Rollback(_)));
    assert!(err.is_retryable());

    // Every later operation and the commit itself fail
    assert!(matches!(second.fetch(tree, b"k"), Err(KeelError::Rollback(_))));
    assert!(matches!(second.commit(), Err(KeelError::Rollback(_))));

    assert_eq!(engine.fetch(tree, b"k").unwrap(), Some(b"first".to_vec()));
    assert_eq!(engine.stats().write_conflicts, 1);
}

#[test]
fn test_writer_waits_for_rollback() {
    let (_temp, engine, tree) = setup_with_tree();
    let mut holder = engine.begin();
    holder.store(tree, b"k", b"holder").unwrap();

    thread::scope(|s| {
        let waiter = s.spawn(|| {
            let mut txn = engine.begin();
            let start = Instant::now();
            txn.store(tree, b"k", b"waiter").unwrap();
            let waited = start.elapsed();
            txn.commit().unwrap();
            waited
        });

        thread::sleep(Duration::from_millis(150));
        holder.rollback().unwrap();
        assert!(waiter.join().unwrap() >= Duration::from_millis(100));
    });

    assert_eq!(engine.fetch(tree, b"k").unwrap(), Some(b"waiter".to_vec()));
}

#[test]
fn test_lock_timeout() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .lock_timeout_ms(100)
        .build();
    let engine = Engine::open(config).unwrap();
    let tree = engine.create_tree("data").unwrap();

    let mut holder = engine.begin();
    holder.store(tree, b"k", b"holder").unwrap();

    let mut blocked = engine.begin();
    let start = Instant::now();
    let err = blocked.store(tree, b"k", b"blocked").unwrap_err();
    assert!(matches!(err, KeelError::Timeout(_)));
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(matches!(blocked.commit(), Err(KeelError::Rollback(_))));

    holder.commit().unwrap();
    assert_eq!(engine.stats().lock_timeouts, 1);
    assert_eq!(engine.fetch(tree, b"k").unwrap(), Some(b"holder".to_vec()));
}

#[test]
fn test_concurrent_increments() {
    let (_temp, engine, tree) = setup_with_tree();
    engine.store(tree, b"counter", b"0").unwrap();

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..25 {
                    loop {
                        let mut txn = engine.begin();
                        let raw = txn.fetch(tree, b"counter").unwrap().unwrap();
                        let current: u64 = String::from_utf8(raw)
                            .unwrap()
                            .parse()
                            .unwrap();
                        let result = txn
                            .store(tree, b"counter", (current + 1).to_string().as_bytes())
                            .and_then(|_| txn.commit());
                        match result {
                            Ok(()) => break,
                            Err(e) if e.is_retryable() => continue,
                            Err(e) => panic!("unexpected error: {}", e),
                        }
                    }
                }
            });
        }
    });

    assert_eq!(engine.fetch(tree, b"counter").unwrap(), Some(b"100".to_vec()));
}

// =============================================================================
// Tree Tests
// =============================================================================

#[test]
fn test_tree_management() {
    let (_temp, engine) = setup_temp_engine();
    let a = engine.create_tree("alpha").unwrap();
    let b = engine.create_tree("beta").unwrap();
    assert_ne!(a, b);
    assert!(a >= 1);

    assert!(matches!(engine.create_tree("alpha"), Err(KeelError::TreeExists(_))));
    assert!(matches!(engine.create_tree("_hidden"), Err(KeelError::InvalidState(_))));
    assert!(matches!(engine.create_tree(""), Err(KeelError::InvalidState(_))));
    assert_eq!(engine.open_tree("alpha").unwrap(), a);
    assert_eq!(engine.tree_id("beta"), Some(b));
    assert_eq!(engine.tree_names(), vec!["alpha".to_string(), "beta".to_string()]);

    let gamma = engine.open_tree("gamma").unwrap();
    assert!(gamma > b);
}

#[test]
fn test_remove_tree_on_commit() {
    let (_temp, engine, tree) = setup_with_tree();
    engine.store(tree, b"k", b"v").unwrap();

    let mut txn = engine.begin();
    txn.remove_tree(tree).unwrap();
    // Still there until commit
    assert_eq!(engine.tree_id("data"), Some(tree));
    txn.commit().unwrap();

    assert_eq!(engine.tree_id("data"), None);
    assert!(matches!(engine.fetch(tree, b"k"), Err(KeelError::TreeNotFound(_))));

    // A new tree never reuses the id
    let again = engine.create_tree("data").unwrap();
    assert!(again > tree);
    assert_eq!(engine.fetch(again, b"k").unwrap(), None);
}

#[test]
fn test_remove_tree_rolled_back() {
    let (_temp, engine, tree) = setup_with_tree();
    let mut txn = engine.begin();
    txn.remove_tree(tree).unwrap();
    txn.rollback().unwrap();
    assert_eq!(engine.tree_id("data"), Some(tree));
}

// =============================================================================
// Pruning Tests
// =============================================================================

#[test]
fn test_cleanup_prunes_superseded_versions() {
    let (_temp, engine, tree) = setup_with_tree();
    for i in 0..10 {
        engine.store(tree, b"k", format!("v{}", i).as_bytes()).unwrap();
    }
    assert!(engine.version_count(tree, b"k").unwrap() > 1);

    let pass = engine.cleanup().unwrap();
    assert!(pass.pages_pruned >= 1);
    assert!(pass.versions_removed >= 9);
    assert_eq!(engine.version_count(tree, b"k").unwrap(), 1);
    assert_eq!(engine.fetch(tree, b"k").unwrap(), Some(b"v9".to_vec()));
}

#[test]
fn test_cleanup_keeps_versions_for_old_reader() {
    let (_temp, engine, tree) = setup_with_tree();
    engine.store(tree, b"k", b"old").unwrap();
    let reader = engine.begin();
    engine.store(tree, b"k", b"new").unwrap();

    engine.cleanup().unwrap();
    assert_eq!(reader.fetch(tree, b"k").unwrap(), Some(b"old".to_vec()));
    reader.commit().unwrap();

    engine.cleanup().unwrap();
    assert_eq!(engine.version_count(tree, b"k").unwrap(), 1);
}

#[test]
fn test_removed_key_pruned_away() {
    let (_temp, engine, tree) = setup_with_tree();
    engine.store(tree, b"k", b"v").unwrap();
    engine.remove(tree, b"k").unwrap();

    let pass = engine.cleanup().unwrap();
    assert_eq!(pass.keys_removed, 1);
    assert_eq!(engine.version_count(tree, b"k").unwrap(), 0);
}

// =============================================================================
// Accumulator Tests
// =============================================================================

#[test]
fn test_accumulator_snapshot() {
    let (_temp, engine, tree) = setup_with_tree();

    let mut first = engine.begin();
    first.accumulator(tree, 0, AccumulatorType::Sum).unwrap().add(5).unwrap();
    first.commit().unwrap();

    let mut reader = engine.begin();
    let mut writer = engine.begin();
    let mut acc = writer.accumulator(tree, 0, AccumulatorType::Sum).unwrap();
    acc.add(10).unwrap();
    assert_eq!(acc.snapshot_value().unwrap(), 15);
    assert_eq!(acc.live_value(), 15);
    writer.commit().unwrap();

    let acc = reader.accumulator(tree, 0, AccumulatorType::Sum).unwrap();
    assert_eq!(acc.snapshot_value().unwrap(), 5);
    reader.commit().unwrap();

    let mut later = engine.begin();
    assert_eq!(
        later
            .accumulator(tree, 0, AccumulatorType::Sum)
            .unwrap()
            .snapshot_value()
            .unwrap(),
        15
    );
    assert!(matches!(
        later.accumulator(tree, 0, AccumulatorType::Max),
        Err(KeelError::InvalidState(_))
    ));
}

#[test]
fn test_accumulator_rollback() {
    let (_temp, engine, tree) = setup_with_tree();
    let mut txn = engine.begin();
    txn.accumulator(tree, 0, AccumulatorType::Sum).unwrap().add(7).unwrap();
    txn.rollback().unwrap();

    let mut reader = engine.begin();
    let acc = reader.accumulator(tree, 0, AccumulatorType::Sum).unwrap();
    assert_eq!(acc.snapshot_value().unwrap(), 0);
}

#[test]
fn test_sequence_allocation() {
    let (_temp, engine, tree) = setup_with_tree();
    let mut values = Vec::new();
    for _ in 0..5 {
        let mut txn = engine.begin();
        values.push(txn.accumulator(tree, 1, AccumulatorType::Seq).unwrap().allocate().unwrap());
        txn.commit().unwrap();
    }
    assert_eq!(values, vec![1, 2, 3, 4, 5]);
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_close_and_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let engine = Engine::open(test_config(&temp_dir)).unwrap();
        let tree = engine.create_tree("data").unwrap();
        for i in 0..100 {
            engine
                .store(tree, format!("key{}", i).as_bytes(), format!("value{}", i).as_bytes())
                .unwrap();
        }
        let mut txn = engine.begin();
        txn.accumulator(tree, 0, AccumulatorType::Sum).unwrap().add(100).unwrap();
        txn.commit().unwrap();
        engine.close().unwrap();
    }

    let engine = Engine::open(test_config(&temp_dir)).unwrap();
    assert_eq!(engine.recovery_stats().committed_transactions, 0);
    let tree = engine.tree_id("data").unwrap();
    for i in 0..100 {
        assert_eq!(
            engine.fetch(tree, format!("key{}", i).as_bytes()).unwrap(),
            Some(format!("value{}", i).into_bytes())
        );
    }
    let mut txn = engine.begin();
    assert_eq!(
        txn.accumulator(tree, 0, AccumulatorType::Sum)
            .unwrap()
            .snapshot_value()
            .unwrap(),
        100
    );
}

#[test]
fn test_checkpoint_moves_base_forward() {
    let (_temp, engine, tree) = setup_with_tree();
    engine.store(tree, b"a", b"1").unwrap();
    let first = engine.checkpoint().unwrap();
    engine.store(tree, b"b", b"2").unwrap();
    let second = engine.checkpoint().unwrap();

    assert!(second.timestamp > first.timestamp);
    assert!(second.base_address > first.base_address);
    assert_eq!(engine.journal().last_checkpoint(), Some(second));
}
