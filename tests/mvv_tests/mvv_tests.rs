//! Tests for multi-version values
//!
//! These tests verify:
//! - Storing and walking versions in handle order
//! - Visibility of versions through the transaction index
//! - Malformed and oversized records are rejected
//! - Pruning of aborted and superseded versions

use std::sync::Arc;

use keelkv::mvv::handle::{ts_to_vh, PRIMORDIAL};
use keelkv::mvv::{
    decode, encode, fetch_visible, is_primordial, prune, store_version, version_count, versions,
    Payload, Version,
};
use keelkv::txn::{Completion, TimestampAllocator, TransactionIndex, TransactionStatus};
use keelkv::KeelError;

const MAX_LEN: usize = 16 * 1024;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_index() -> TransactionIndex {
    TransactionIndex::new(Arc::new(TimestampAllocator::new()), 4)
}

fn commit(index: &TransactionIndex, status: &TransactionStatus) -> u64 {
    let commit_ts = index.start_commit(status).unwrap();
    let at = index.allocator().update_timestamp();
    index
        .notify_completed(status, Completion::Committed, at)
        .unwrap();
    commit_ts
}

fn abort(index: &TransactionIndex, status: &TransactionStatus) {
    let at = index.allocator().update_timestamp();
    index
        .notify_completed(status, Completion::Aborted, at)
        .unwrap();
}

/// A fresh key: primordial AntiValue
fn new_key() -> Vec<u8> {
    encode(&[Version {
        vh: PRIMORDIAL,
        payload: Payload::AntiValue,
    }])
}

fn put(record: &[u8], vh: u64, value: &[u8]) -> Vec<u8> {
    store_version(record, vh, Payload::Value(value), MAX_LEN)
        .unwrap()
        .record
}

fn remove(record: &[u8], vh: u64) -> Vec<u8> {
    store_version(record, vh, Payload::AntiValue, MAX_LEN)
        .unwrap()
        .record
}

// =============================================================================
// Codec Tests
// =============================================================================

#[test]
fn test_empty_record_has_no_versions() {
    let index = setup_index();
    assert_eq!(version_count(&[]).unwrap(), 0);
    assert!(versions(&[]).next().is_none());
    assert_eq!(fetch_visible(&[], &index, 1, 0).unwrap(), None);
}

#[test]
fn test_many_versions_stay_ordered() {
    let mut record = Vec::new();
    // Insert out of order; the record keeps handles ascending
    for i in (1..=5000u64).rev() {
        let value = format!("v{}", i);
        record = store_version(&record, ts_to_vh(i, 0), Payload::Value(value.as_bytes()), 1 << 20)
            .unwrap()
            .record;
    }

    assert_eq!(version_count(&record).unwrap(), 5000);
    for (i, version) in versions(&record).enumerate() {
        let version = version.unwrap();
        let ts = i as u64 + 1;
        assert_eq!(version.vh, ts_to_vh(ts, 0));
        assert_eq!(version.payload, Payload::Value(format!("v{}", ts).as_bytes()));
    }
}

#[test]
fn test_overwrite_same_handle() {
    let vh = ts_to_vh(7, 1);
    let first = store_version(&new_key(), vh, Payload::Value(b"one"), MAX_LEN).unwrap();
    assert!(first.inserted);

    let second = store_version(&first.record, vh, Payload::Value(b"two"), MAX_LEN).unwrap();
    assert!(!second.inserted);
    let list = decode(&second.record).unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[1].payload, Payload::Value(b"two"));
}

#[test]
fn test_record_too_long() {
    let big = vec![0xAB; 100];
    let result = store_version(&new_key(), ts_to_vh(1, 0), Payload::Value(&big), 64);
    match result {
        Err(KeelError::RecordTooLong { size, limit }) => {
            assert!(size > limit);
            assert_eq!(limit, 64);
        }
        other => panic!("expected RecordTooLong, got {:?}", other),
    }
}

#[test]
fn test_bad_type_byte_rejected() {
    let mut record = put(&new_key(), ts_to_vh(1, 0), b"value");
    record[0] = 0x01;
    assert!(matches!(decode(&record), Err(KeelError::MalformedRecord(_))));
    assert!(version_count(&record).is_err());
}

#[test]
fn test_truncated_record_rejected() {
    let record = put(&new_key(), ts_to_vh(1, 0), b"value");
    let truncated = &record[..record.len() - 3];
    assert!(matches!(decode(truncated), Err(KeelError::MalformedRecord(_))));

    let header_cut = &record[..record.len() - 10];
    assert!(matches!(decode(header_cut), Err(KeelError::MalformedRecord(_))));
}

#[test]
fn test_descending_handles_rejected() {
    let record = encode(&[
        Version {
            vh: ts_to_vh(5, 0),
            payload: Payload::AntiValue,
        },
        Version {
            vh: ts_to_vh(3, 0),
            payload: Payload::Value(b"x"),
        },
    ]);
    let mut iter = versions(&record);
    assert!(iter.next().unwrap().is_ok());
    assert!(matches!(iter.next(), Some(Err(KeelError::MalformedRecord(_)))));
    assert!(iter.next().is_none());
}

// =============================================================================
// Visibility Tests
// =============================================================================

#[test]
fn test_fetch_visible_follows_snapshot() {
    let index = setup_index();
    let early = index.begin();
    let writer = index.begin();
    let record = put(&new_key(), ts_to_vh(writer.ts(), 0), b"one");
    commit(&index, &writer);
    let late = index.begin();

    assert_eq!(
        fetch_visible(&record, &index, early.ts(), 0).unwrap(),
        Some(Payload::AntiValue)
    );
    assert_eq!(
        fetch_visible(&record, &index, late.ts(), 0).unwrap(),
        Some(Payload::Value(b"one"))
    );
}

#[test]
fn test_fetch_visible_sees_own_uncommitted() {
    let index = setup_index();
    let writer = index.begin();
    let other = index.begin();
    let record = put(&new_key(), ts_to_vh(writer.ts(), 0), b"mine");

    assert_eq!(
        fetch_visible(&record, &index, writer.ts(), 0).unwrap(),
        Some(Payload::Value(b"mine"))
    );
    assert_eq!(
        fetch_visible(&record, &index, other.ts(), 0).unwrap(),
        Some(Payload::AntiValue)
    );
}

#[test]
fn test_fetch_visible_respects_step() {
    let index = setup_index();
    let txn = index.begin();
    let record = put(&new_key(), ts_to_vh(txn.ts(), 0), b"step0");
    let record = put(&record, ts_to_vh(txn.ts(), 2), b"step2");

    assert_eq!(
        fetch_visible(&record, &index, txn.ts(), 1).unwrap(),
        Some(Payload::Value(b"step0"))
    );
    assert_eq!(
        fetch_visible(&record, &index, txn.ts(), 2).unwrap(),
        Some(Payload::Value(b"step2"))
    );
}

#[test]
fn test_aborted_version_invisible() {
    let index = setup_index();
    let writer = index.begin();
    let record = put(&new_key(), ts_to_vh(writer.ts(), 0), b"gone");
    abort(&index, &writer);
    let reader = index.begin();

    assert_eq!(
        fetch_visible(&record, &index, reader.ts(), 0).unwrap(),
        Some(Payload::AntiValue)
    );
}

// =============================================================================
// Pruning Tests
// =============================================================================

#[test]
fn test_prune_aborted_leaves_removed_key() {
    let index = setup_index();
    let writer = index.begin();
    let record = put(&new_key(), ts_to_vh(writer.ts(), 0), b"x");
    abort(&index, &writer);
    index.update_active_transaction_cache();

    let outcome = prune(&record, &index).unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.removed, 1);
    assert!(outcome.is_removed_key().unwrap());
}

#[test]
fn test_prune_superseded_collapses_to_primordial() {
    let index = setup_index();
    let first = index.begin();
    let record = put(&new_key(), ts_to_vh(first.ts(), 0), b"a");
    commit(&index, &first);
    let second = index.begin();
    let record = put(&record, ts_to_vh(second.ts(), 0), b"b");
    commit(&index, &second);
    index.update_active_transaction_cache();

    let outcome = prune(&record, &index).unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.removed, 2);
    assert!(is_primordial(&outcome.record).unwrap());
    assert!(!outcome.is_removed_key().unwrap());

    let reader = index.begin();
    assert_eq!(
        fetch_visible(&outcome.record, &index, reader.ts(), 0).unwrap(),
        Some(Payload::Value(b"b"))
    );
}

#[test]
fn test_prune_keeps_version_a_reader_needs() {
    let index = setup_index();
    let first = index.begin();
    let record = put(&new_key(), ts_to_vh(first.ts(), 0), b"a");
    commit(&index, &first);
    let reader = index.begin();
    let second = index.begin();
    let record = put(&record, ts_to_vh(second.ts(), 0), b"b");
    commit(&index, &second);
    index.update_active_transaction_cache();

    let outcome = prune(&record, &index).unwrap();
    assert_eq!(outcome.removed, 1);
    assert_eq!(version_count(&outcome.record).unwrap(), 2);
    assert_eq!(
        fetch_visible(&outcome.record, &index, reader.ts(), 0).unwrap(),
        Some(Payload::Value(b"a"))
    );
}

#[test]
fn test_prune_keeps_uncommitted() {
    let index = setup_index();
    let writer = index.begin();
    let record = put(&new_key(), ts_to_vh(writer.ts(), 0), b"pending");
    index.update_active_transaction_cache();

    let outcome = prune(&record, &index).unwrap();
    assert!(!outcome.changed);
    assert_eq!(outcome.removed, 0);
    assert_eq!(outcome.record, record);
}

#[test]
fn test_prune_removed_key() {
    let index = setup_index();
    let writer = index.begin();
    let record = put(&new_key(), ts_to_vh(writer.ts(), 0), b"x");
    commit(&index, &writer);
    let remover = index.begin();
    let record = remove(&record, ts_to_vh(remover.ts(), 0));
    commit(&index, &remover);
    index.update_active_transaction_cache();

    let outcome = prune(&record, &index).unwrap();
    assert!(outcome.is_removed_key().unwrap());
}

#[test]
fn test_prune_is_idempotent() {
    let index = setup_index();
    let first = index.begin();
    let record = put(&new_key(), ts_to_vh(first.ts(), 0), b"a");
    commit(&index, &first);
    let reader = index.begin();
    let second = index.begin();
    let record = put(&record, ts_to_vh(second.ts(), 0), b"b");
    commit(&index, &second);
    index.update_active_transaction_cache();

    let once = prune(&record, &index).unwrap();
    let twice = prune(&once.record, &index).unwrap();
    assert!(!twice.changed);
    assert_eq!(twice.removed, 0);
    assert_eq!(twice.record, once.record);
    drop(reader);
}

#[test]
fn test_prune_without_cache_is_conservative() {
    let index = setup_index();
    let first = index.begin();
    let record = put(&new_key(), ts_to_vh(first.ts(), 0), b"a");
    commit(&index, &first);

    // Cache never refreshed: every commit is newer than its ceiling
    let outcome = prune(&record, &index).unwrap();
    assert!(!outcome.changed);
    assert_eq!(version_count(&outcome.record).unwrap(), 2);
}
