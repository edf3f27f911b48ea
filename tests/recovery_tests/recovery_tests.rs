//! Tests for crash recovery
//!
//! These tests verify:
//! - Committed transactions survive a crash, others are discarded
//! - Torn journal tails are truncated, earlier corruption stops recovery
//! - Checkpoints bound what is replayed
//! - Trees, removals and accumulators are rebuilt
//! - Recovery planning without side effects

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::mem;
use std::thread;
use std::time::Duration;

use keelkv::journal::{journal_path, list_journal_files, JournalReader, RECORD_HEADER_SIZE};
use keelkv::recovery::{RecoveryManager, RecoveryState};
use keelkv::{AccumulatorType, CommitPolicy, Config, Engine, KeelError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config(temp_dir: &TempDir) -> Config {
    Config::builder()
        .data_dir(temp_dir.path())
        .cleanup_interval_ms(60_000)
        .build()
}

fn soft_config(temp_dir: &TempDir, flush_interval_ms: u64) -> Config {
    Config::builder()
        .data_dir(temp_dir.path())
        .cleanup_interval_ms(60_000)
        .commit_policy(CommitPolicy::Soft)
        .flush_interval_ms(flush_interval_ms)
        .build()
}

fn setup_temp_engine() -> (TempDir, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(test_config(&temp_dir)).unwrap();
    (temp_dir, engine)
}

fn reopen(temp_dir: &TempDir) -> Engine {
    Engine::open(test_config(temp_dir)).unwrap()
}

fn key(i: usize) -> Vec<u8> {
    format!("key{:04}", i).into_bytes()
}

fn value(i: usize) -> Vec<u8> {
    format!("value{}", i).into_bytes()
}

// =============================================================================
// Committed vs Uncommitted
// =============================================================================

#[test]
fn test_committed_survive_crash() {
    let (temp_dir, engine) = setup_temp_engine();
    let tree = engine.create_tree("data").unwrap();
    for i in 0..50 {
        engine.store(tree, &key(i), &value(i)).unwrap();
    }
    engine.crash();

    let engine = reopen(&temp_dir);
    let stats = engine.recovery_stats();
    assert_eq!(stats.committed_transactions, 50);
    assert_eq!(stats.trees_created, 1);
    assert_eq!(stats.applied_updates, 50);
    assert_eq!(stats.failed_updates, 0);
    assert!(!stats.torn_tail);

    let tree = engine.tree_id("data").unwrap();
    for i in 0..50 {
        assert_eq!(engine.fetch(tree, &key(i)).unwrap(), Some(value(i)));
    }
}

#[test]
fn test_uncommitted_discarded() {
    let (temp_dir, engine) = setup_temp_engine();
    let tree = engine.create_tree("data").unwrap();

    let mut in_flight = engine.begin();
    in_flight.store(tree, b"pending", b"never").unwrap();
    // A later commit syncs the journal past the in-flight records
    engine.store(tree, b"done", b"yes").unwrap();

    // Crash with the transaction still open
    mem::forget(in_flight);
    engine.crash();

    let engine = reopen(&temp_dir);
    assert_eq!(engine.recovery_stats().uncommitted_transactions, 1);
    assert_eq!(engine.recovery_stats().committed_transactions, 1);
    let tree = engine.tree_id("data").unwrap();
    assert_eq!(engine.fetch(tree, b"pending").unwrap(), None);
    assert_eq!(engine.fetch(tree, b"done").unwrap(), Some(b"yes".to_vec()));
}

#[test]
fn test_rolled_back_discarded() {
    let (temp_dir, engine) = setup_temp_engine();
    let tree = engine.create_tree("data").unwrap();

    let mut txn = engine.begin();
    txn.store(tree, b"undone", b"x").unwrap();
    txn.rollback().unwrap();
    engine.store(tree, b"kept", b"y").unwrap();
    engine.crash();

    let engine = reopen(&temp_dir);
    assert_eq!(engine.recovery_stats().rolled_back_transactions, 1);
    let tree = engine.tree_id("data").unwrap();
    assert_eq!(engine.fetch(tree, b"undone").unwrap(), None);
    assert_eq!(engine.fetch(tree, b"kept").unwrap(), Some(b"y".to_vec()));
}

#[test]
fn test_concurrent_writers_recovered() {
    let (temp_dir, engine) = setup_temp_engine();
    let tree = engine.create_tree("data").unwrap();

    thread::scope(|s| {
        for t in 0..4 {
            let engine = &engine;
            s.spawn(move || {
                for i in 0..25 {
                    let n = t * 100 + i;
                    engine.store(tree, &key(n), &value(n)).unwrap();
                }
            });
        }
    });
    engine.crash();

    let engine = reopen(&temp_dir);
    assert_eq!(engine.recovery_stats().committed_transactions, 100);
    let tree = engine.tree_id("data").unwrap();
    let txn = engine.begin();
    assert_eq!(txn.scan(tree).unwrap().len(), 100);
    assert_eq!(txn.fetch(tree, &key(317)).unwrap(), Some(value(317)));
}

#[test]
fn test_steps_replayed_in_order() {
    let (temp_dir, engine) = setup_temp_engine();
    let tree = engine.create_tree("data").unwrap();

    let mut txn = engine.begin();
    txn.store(tree, b"k", b"first").unwrap();
    txn.increment_step().unwrap();
    txn.store(tree, b"k", b"second").unwrap();
    txn.remove(tree, b"other").unwrap();
    txn.commit().unwrap();
    engine.crash();

    let engine = reopen(&temp_dir);
    let tree = engine.tree_id("data").unwrap();
    assert_eq!(engine.fetch(tree, b"k").unwrap(), Some(b"second".to_vec()));
}

#[test]
fn test_crash_loses_unflushed_soft_commits() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(soft_config(&temp_dir, 60_000)).unwrap();
    let tree = engine.create_tree("data").unwrap();
    engine.checkpoint().unwrap();

    engine.store(tree, b"k", b"v").unwrap();
    assert_eq!(engine.fetch(tree, b"k").unwrap(), Some(b"v".to_vec()));
    engine.crash();

    let engine = reopen(&temp_dir);
    assert_eq!(engine.recovery_stats().committed_transactions, 0);
    let tree = engine.tree_id("data").unwrap();
    assert_eq!(engine.fetch(tree, b"k").unwrap(), None);
}

#[test]
fn test_crash_keeps_flushed_soft_commits() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(soft_config(&temp_dir, 20)).unwrap();
    let tree = engine.create_tree("data").unwrap();
    engine.store(tree, b"k", b"v").unwrap();
    thread::sleep(Duration::from_millis(200));
    engine.crash();

    let engine = reopen(&temp_dir);
    assert_eq!(engine.recovery_stats().committed_transactions, 1);
    let tree = engine.tree_id("data").unwrap();
    assert_eq!(engine.fetch(tree, b"k").unwrap(), Some(b"v".to_vec()));
}

// =============================================================================
// Journal Damage
// =============================================================================

#[test]
fn test_torn_tail_truncated() {
    let (temp_dir, engine) = setup_temp_engine();
    let tree = engine.create_tree("data").unwrap();
    for i in 0..10 {
        engine.store(tree, &key(i), &value(i)).unwrap();
    }
    engine.crash();

    let journal_dir = temp_dir.path().join("journal");
    let (_, last) = list_journal_files(&journal_dir).unwrap().pop().unwrap();
    let mut file = OpenOptions::new().append(true).open(&last).unwrap();
    file.write_all(&[0x02, 0x40, 0x00, 0x00, 0x00, 0xAA, 0xBB]).unwrap();
    drop(file);

    let engine = reopen(&temp_dir);
    let stats = engine.recovery_stats();
    assert!(stats.torn_tail);
    assert_eq!(stats.truncated_bytes, 7);
    assert_eq!(stats.committed_transactions, 10);

    let tree = engine.tree_id("data").unwrap();
    for i in 0..10 {
        assert_eq!(engine.fetch(tree, &key(i)).unwrap(), Some(value(i)));
    }
}

#[test]
fn test_corruption_in_earlier_file_stops_open() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .journal_block_size(4096)
        .cleanup_interval_ms(60_000)
        .build();
    let engine = Engine::open(config.clone()).unwrap();
    let tree = engine.create_tree("data").unwrap();
    for i in 0..60 {
        engine.store(tree, &key(i), &vec![b'x'; 100]).unwrap();
    }
    assert!(engine.journal().current_generation() >= 1);
    engine.crash();

    let first = journal_path(&temp_dir.path().join("journal"), 0);
    let victim = JournalReader::read_file(&first)
        .unwrap()
        .entries
        .last()
        .unwrap()
        .address;
    let mut data = fs::read(&first).unwrap();
    data[victim as usize + RECORD_HEADER_SIZE + 1] ^= 0xFF;
    fs::write(&first, data).unwrap();

    match Engine::open(config) {
        Err(KeelError::Corruption { address, .. }) => assert_eq!(address, victim),
        Err(e) => panic!("expected corruption, got {}", e),
        Ok(_) => panic!("open succeeded over a corrupt journal"),
    }
}

#[test]
fn test_damaged_record_inside_last_file_stops_open() {
    let (temp_dir, engine) = setup_temp_engine();
    let tree = engine.create_tree("data").unwrap();
    for i in 0..10 {
        engine.store(tree, &key(i), &value(i)).unwrap();
    }
    engine.crash();

    let journal_dir = temp_dir.path().join("journal");
    let (_, last) = list_journal_files(&journal_dir).unwrap().pop().unwrap();
    let file = JournalReader::read_file(&last).unwrap();
    assert!(file.entries.len() > 10);
    let victim = file.entries[file.entries.len() / 2].address;
    let offset = victim - file.header.generation * file.header.block_size;
    let mut data = fs::read(&last).unwrap();
    data[offset as usize + RECORD_HEADER_SIZE + 1] ^= 0xFF;
    fs::write(&last, data).unwrap();

    // Intact records follow the damaged one, so this is not a torn append
    match Engine::open(test_config(&temp_dir)) {
        Err(KeelError::Corruption { address, .. }) => assert_eq!(address, victim),
        Err(e) => panic!("expected corruption, got {}", e),
        Ok(_) => panic!("open truncated committed records after a damaged one"),
    }
}

// =============================================================================
// Checkpoint Tests
// =============================================================================

#[test]
fn test_recovery_after_checkpoint() {
    let (temp_dir, engine) = setup_temp_engine();
    let tree = engine.create_tree("data").unwrap();
    for i in 0..20 {
        engine.store(tree, &key(i), &value(i)).unwrap();
    }
    engine.checkpoint().unwrap();
    for i in 20..30 {
        engine.store(tree, &key(i), &value(i)).unwrap();
    }
    for i in 0..5 {
        engine.store(tree, &key(i), b"updated").unwrap();
    }
    engine.crash();

    let engine = reopen(&temp_dir);
    let stats = engine.recovery_stats();
    assert_eq!(stats.committed_transactions, 15);
    assert_eq!(stats.trees_created, 0);
    assert!(stats.checkpoint_timestamp > 0);

    let tree = engine.tree_id("data").unwrap();
    for i in 0..5 {
        assert_eq!(engine.fetch(tree, &key(i)).unwrap(), Some(b"updated".to_vec()));
    }
    for i in 5..30 {
        assert_eq!(engine.fetch(tree, &key(i)).unwrap(), Some(value(i)));
    }
}

#[test]
fn test_repeated_recovery() {
    let (temp_dir, engine) = setup_temp_engine();
    let tree = engine.create_tree("data").unwrap();
    for i in 0..10 {
        engine.store(tree, &key(i), &value(i)).unwrap();
    }
    engine.crash();

    let engine = reopen(&temp_dir);
    assert_eq!(engine.recovery_stats().committed_transactions, 10);
    engine.crash();

    // The first recovery checkpointed; nothing is left to replay
    let engine = reopen(&temp_dir);
    assert_eq!(engine.recovery_stats().committed_transactions, 0);
    let tree = engine.tree_id("data").unwrap();
    let txn = engine.begin();
    assert_eq!(txn.scan(tree).unwrap().len(), 10);
}

#[test]
fn test_timestamps_continue_after_recovery() {
    let (temp_dir, engine) = setup_temp_engine();
    let tree = engine.create_tree("data").unwrap();
    engine.store(tree, b"k", b"v1").unwrap();
    let before = engine.begin().ts();
    engine.crash();

    let engine = reopen(&temp_dir);
    let tree = engine.tree_id("data").unwrap();
    assert!(engine.begin().ts() > before);

    // New writes are not mistaken for concurrent ones
    engine.store(tree, b"k", b"v2").unwrap();
    assert_eq!(engine.fetch(tree, b"k").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn test_remove_range_open_across_checkpoint() {
    let (temp_dir, engine) = setup_temp_engine();
    let tree = engine.create_tree("data").unwrap();
    engine.store(tree, b"j", b"old").unwrap();

    // Began before "k" existed, so its removal covers only "j"
    let mut remover = engine.begin();
    assert!(remover.remove_range(tree, b"a", b"z").unwrap());
    engine.store(tree, b"k", b"new").unwrap();
    engine.checkpoint().unwrap();
    remover.commit().unwrap();

    let live_j = engine.fetch(tree, b"j").unwrap();
    let live_k = engine.fetch(tree, b"k").unwrap();
    assert_eq!(live_j, None);
    assert_eq!(live_k, Some(b"new".to_vec()));
    engine.crash();

    let engine = reopen(&temp_dir);
    assert_eq!(engine.recovery_stats().committed_transactions, 1);
    let tree = engine.tree_id("data").unwrap();
    assert_eq!(engine.fetch(tree, b"j").unwrap(), live_j);
    assert_eq!(engine.fetch(tree, b"k").unwrap(), live_k);
}

#[test]
fn test_removals_straddling_checkpoint() {
    let (temp_dir, engine) = setup_temp_engine();
    let tree = engine.create_tree("data").unwrap();
    for i in 0..30 {
        engine.store(tree, &key(i), &value(i)).unwrap();
    }

    let mut txn = engine.begin();
    assert!(txn.remove(tree, &key(3)).unwrap());
    assert!(txn.remove_range(tree, &key(10), &key(15)).unwrap());
    engine.checkpoint().unwrap();
    assert!(txn.remove(tree, &key(20)).unwrap());
    assert!(txn.remove_range(tree, &key(25), &key(40)).unwrap());
    txn.commit().unwrap();

    // Stored after the checkpoint and after the range was removed
    engine.store(tree, &key(27), b"again").unwrap();

    let live = engine.begin().scan(tree).unwrap();
    assert_eq!(live.len(), 30 - 1 - 5 - 1 - 5 + 1);
    engine.crash();

    let engine = reopen(&temp_dir);
    let tree = engine.tree_id("data").unwrap();
    let txn = engine.begin();
    assert_eq!(txn.scan(tree).unwrap(), live);
    assert_eq!(txn.fetch(tree, &key(27)).unwrap(), Some(b"again".to_vec()));
}

// =============================================================================
// Trees and Accumulators
// =============================================================================

#[test]
fn test_tree_create_and_remove_recovered() {
    let (temp_dir, engine) = setup_temp_engine();
    let alpha = engine.create_tree("alpha").unwrap();
    let beta = engine.create_tree("beta").unwrap();
    engine.store(alpha, b"a", b"1").unwrap();
    engine.store(beta, b"b", b"2").unwrap();

    let mut txn = engine.begin();
    txn.remove_tree(alpha).unwrap();
    txn.commit().unwrap();
    let gamma = engine.create_tree("gamma").unwrap();
    engine.store(gamma, b"c", b"3").unwrap();
    engine.crash();

    let engine = reopen(&temp_dir);
    assert_eq!(engine.tree_names(), vec!["beta".to_string(), "gamma".to_string()]);
    assert_eq!(engine.tree_id("alpha"), None);
    assert_eq!(engine.fetch(beta, b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(engine.fetch(gamma, b"c").unwrap(), Some(b"3".to_vec()));

    let delta = engine.create_tree("delta").unwrap();
    assert!(delta > gamma);
}

#[test]
fn test_remove_range_recovered() {
    let (temp_dir, engine) = setup_temp_engine();
    let tree = engine.create_tree("data").unwrap();
    for i in 0..20 {
        engine.store(tree, &key(i), &value(i)).unwrap();
    }
    let mut txn = engine.begin();
    txn.remove_range(tree, &key(5), &key(15)).unwrap();
    txn.commit().unwrap();
    engine.crash();

    let engine = reopen(&temp_dir);
    let tree = engine.tree_id("data").unwrap();
    let txn = engine.begin();
    assert_eq!(txn.scan(tree).unwrap().len(), 10);
    assert_eq!(txn.fetch(tree, &key(5)).unwrap(), None);
    assert_eq!(txn.fetch(tree, &key(15)).unwrap(), Some(value(15)));
}

#[test]
fn test_accumulator_recovery() {
    let (temp_dir, engine) = setup_temp_engine();
    let tree = engine.create_tree("rows").unwrap();

    // 70 rows, each counted
    for i in 0..70 {
        let mut txn = engine.begin();
        txn.store(tree, &key(i), &value(i)).unwrap();
        txn.accumulator(tree, 0, AccumulatorType::Sum).unwrap().add(1).unwrap();
        txn.accumulator(tree, 1, AccumulatorType::Max).unwrap().add(i as i64).unwrap();
        txn.commit().unwrap();
    }
    engine.checkpoint().unwrap();

    // Transactions still open at the crash: their rows and counts vanish
    let mut in_flight = Vec::new();
    for i in 100..103 {
        let mut txn = engine.begin();
        txn.store(tree, &key(i), &value(i)).unwrap();
        txn.accumulator(tree, 0, AccumulatorType::Sum).unwrap().add(100).unwrap();
        in_flight.push(txn);
    }

    // Remove half of the rows after the checkpoint
    for i in 0..35 {
        let mut txn = engine.begin();
        assert!(txn.remove(tree, &key(i)).unwrap());
        txn.accumulator(tree, 0, AccumulatorType::Sum).unwrap().add(-1).unwrap();
        txn.commit().unwrap();
    }
    for txn in in_flight {
        mem::forget(txn);
    }
    engine.crash();

    let engine = reopen(&temp_dir);
    let stats = engine.recovery_stats();
    assert_eq!(stats.committed_transactions, 35);
    assert_eq!(stats.uncommitted_transactions, 3);

    let tree = engine.tree_id("rows").unwrap();
    let mut txn = engine.begin();
    assert_eq!(txn.scan(tree).unwrap().len(), 35);
    assert_eq!(
        txn.accumulator(tree, 0, AccumulatorType::Sum)
            .unwrap()
            .snapshot_value()
            .unwrap(),
        35
    );
    assert_eq!(
        txn.accumulator(tree, 1, AccumulatorType::Max)
            .unwrap()
            .snapshot_value()
            .unwrap(),
        69
    );
    txn.commit().unwrap();
}

#[test]
fn test_accumulator_mixed_deltas_across_checkpoint() {
    let (temp_dir, engine) = setup_temp_engine();
    let tree = engine.create_tree("ledger").unwrap();
    let deltas: [i64; 15] = [5, -3, 12, -7, 1, -20, 9, 4, -2, 30, -11, 6, -1, 8, -15];

    for (i, delta) in deltas.iter().enumerate() {
        if i == 8 {
            engine.checkpoint().unwrap();
        }
        let mut txn = engine.begin();
        txn.accumulator(tree, 0, AccumulatorType::Sum).unwrap().add(*delta).unwrap();
        txn.commit().unwrap();
    }

    let mut txn = engine.begin();
    let live = txn
        .accumulator(tree, 0, AccumulatorType::Sum)
        .unwrap()
        .snapshot_value()
        .unwrap();
    txn.commit().unwrap();
    assert_eq!(live, deltas.iter().sum::<i64>());
    engine.crash();

    let engine = reopen(&temp_dir);
    assert_eq!(engine.recovery_stats().committed_transactions, 7);
    let tree = engine.tree_id("ledger").unwrap();
    let mut txn = engine.begin();
    let recovered = txn
        .accumulator(tree, 0, AccumulatorType::Sum)
        .unwrap()
        .snapshot_value()
        .unwrap();
    txn.commit().unwrap();
    assert_eq!(recovered, live);
}

// =============================================================================
// Planning
// =============================================================================

#[test]
fn test_plan_without_replay() {
    let (temp_dir, engine) = setup_temp_engine();
    let tree = engine.create_tree("data").unwrap();
    for i in 0..5 {
        let mut txn = engine.begin();
        txn.store(tree, &key(i), &value(i)).unwrap();
        txn.store(tree, &key(i + 100), &value(i)).unwrap();
        txn.commit().unwrap();
    }
    engine.crash();

    let journal_dir = temp_dir.path().join("journal");
    let checkpoint_dir = temp_dir.path().join("checkpoints");
    let files_before = list_journal_files(&journal_dir).unwrap();

    let mut manager = RecoveryManager::new(&journal_dir, &checkpoint_dir);
    assert_eq!(manager.state(), RecoveryState::Scan);
    let plan = manager.recover().unwrap();
    assert_eq!(manager.state(), RecoveryState::Replay);

    assert!(plan.checkpoint.is_some());
    assert!(plan.image.is_some());
    assert_eq!(plan.transactions.len(), 5);
    assert_eq!(plan.update_count(), 10);
    assert_eq!(plan.trees.len(), 1);
    for pair in plan.transactions.windows(2) {
        assert!(pair[0].commit_ts < pair[1].commit_ts);
    }
    assert!(plan.max_timestamp >= plan.transactions[4].commit_ts.unwrap());

    // Planning leaves the journal alone
    assert_eq!(list_journal_files(&journal_dir).unwrap(), files_before);
    assert!(manager.plan().is_err());
}
