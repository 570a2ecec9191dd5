//! Integration tests for the complete ingest and flush lifecycle.
//!
//! These tests verify the full data path:
//! - ingest → sliding window → retirement → remove_old flush
//! - payload offsets resolving through a caller-owned store
//! - concurrent writers spilling into overflow buffers and draining
//!
//! Offsets are opaque to the cache. The store below appends payloads to
//! a log and hands the cache their positions, the way the surrounding
//! engine does.

use std::sync::Arc;
use std::thread;

use tarn_cairn::{
    BlobEntry, Cache, CacheConfig, CacheError, CancelToken, EntryReader, MapReader, PayloadRef,
    PointEntry, ScanQuery, VecSink,
};

const CALLER: u64 = 42;

/// Append-only payload log standing in for the backing store.
#[derive(Default)]
struct EntryStore {
    entries: Vec<(i64, u64, f64)>,
}

impl EntryStore {
    fn append(&mut self, timestamp: i64, param_id: u64, value: f64) -> u64 {
        self.entries.push((timestamp, param_id, value));
        (self.entries.len() - 1) as u64
    }
}

impl EntryReader for EntryStore {
    fn resolve(&self, offset: u64) -> (i64, u64) {
        let (timestamp, param_id, _) = self.entries[offset as usize];
        (timestamp, param_id)
    }
}

// ============================================================================
// Full Ingest → Retire → Flush Path
// ============================================================================

/// Tests the complete path: ingest across ten windows, flush the retired
/// ones, and read the rest from the live window.
///
/// This test verifies:
/// 1. Ascending writes slide the window and retire older buckets
/// 2. remove_old delivers every retired entry in canonical order
/// 3. The live window still answers range queries afterwards
#[test]
fn test_full_ingest_flush_cycle() {
    let config = CacheConfig::default()
        .with_ttl(1024)
        .with_max_live_buckets(4)
        .with_prepopulation(4)
        .with_shard_count(2)
        .with_shard_capacity_hint(16);
    let cache = Cache::new(config).unwrap();
    let mut store = EntryStore::default();

    // Phase 1: ingest 100 points, timestamps 0, 100, ..., 9900.
    let mut swapped_total = 0;
    for i in 0..100i64 {
        let ts = i * 100;
        let offset = store.append(ts, 7, i as f64 * 0.5);
        let point = PointEntry::new(ts, 7, i as f64 * 0.5);
        swapped_total += cache.add(&point, offset).unwrap();
    }

    // Timestamps 0..9900 span bucket indices 0..9; every one-step slide
    // retired a single bucket, including the prepopulated ones.
    let stats = cache.stats();
    assert_eq!(stats.baseline, 9);
    assert_eq!(stats.live_buckets, 4);
    assert_eq!(stats.retired_buckets, 9);
    assert_eq!(swapped_total, 9);

    // Phase 2: flush everything retired. Timestamps below 6144 are in
    // retired buckets, and single-writer insertion order matches key
    // order, so the delivered offsets are exactly 0..=61.
    let mut flush_sink = VecSink::new();
    let released = cache
        .remove_old(CALLER, &mut flush_sink, &store, i64::MAX)
        .unwrap();
    assert_eq!(released, 9);
    let expected: Vec<u64> = (0..=61).collect();
    assert_eq!(flush_sink.offsets, expected);
    assert_eq!(cache.stats().retired_buckets, 0);
    assert_eq!(cache.stats().free_buckets, 9);

    // Phase 3: the live window answers the remaining range.
    let mut sink = VecSink::new();
    cache.search(CALLER, &mut sink, &ScanQuery::forward(7, 6144, 10240));
    let expected: Vec<u64> = (62..100).collect();
    assert_eq!(sink.offsets, expected);
    assert_eq!(sink.completions, 1);
}

/// Tests that point and blob payloads from different stores interleave
/// in one flush by their canonical keys.
#[test]
fn test_mixed_entry_shapes_flush_in_key_order() {
    let config = CacheConfig::default()
        .with_ttl(1024)
        .with_max_live_buckets(2)
        .with_prepopulation(2)
        .with_shard_count(1);
    let cache = Cache::new(config).unwrap();

    // Points live below offset 1000, blobs above; the reader knows the
    // split, the cache never does.
    struct SplitStore {
        points: Vec<(i64, u64)>,
        blobs: Vec<(i64, u64)>,
    }
    impl EntryReader for SplitStore {
        fn resolve(&self, offset: u64) -> (i64, u64) {
            if offset < 1000 {
                self.points[offset as usize]
            } else {
                self.blobs[(offset - 1000) as usize]
            }
        }
    }

    let store = SplitStore {
        points: vec![(10, 1), (30, 1)],
        blobs: vec![(20, 1)],
    };
    cache.add(&PointEntry::new(10, 1, 0.1), 0).unwrap();
    cache
        .add_blob(
            &BlobEntry::new(20, 1, PayloadRef { offset: 4096, len: 64 }),
            1000,
        )
        .unwrap();
    cache.add(&PointEntry::new(30, 1, 0.3), 1).unwrap();

    // Slide far enough to retire bucket 0, then flush it.
    cache.add_key(4 * 1024, 1, 999).unwrap();
    let mut sink = VecSink::new();
    let released = cache.remove_old(CALLER, &mut sink, &store, i64::MAX).unwrap();
    assert_eq!(released, 2);
    assert_eq!(sink.offsets, vec![0, 1000, 1]);
}

// ============================================================================
// Concurrency
// ============================================================================

/// Tests contended ingest: eight writers into one bucket, then a flush
/// that must deliver all 4000 entries in canonical order, including any
/// that were parked in overflow buffers.
#[test]
fn test_concurrent_ingest_then_ordered_flush() {
    let config = CacheConfig::default()
        .with_ttl(1024)
        .with_max_live_buckets(4)
        .with_prepopulation(4)
        .with_shard_count(4)
        .with_shard_capacity_hint(16);
    let cache = Arc::new(Cache::new(config).unwrap());
    let mut reader = MapReader::new();
    for writer in 0..8u64 {
        for k in 0..500i64 {
            reader.insert(writer * 500 + k as u64, k, writer + 1);
        }
    }

    let handles: Vec<_> = (0..8u64)
        .map(|writer| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for k in 0..500i64 {
                    cache.add_key(k, writer + 1, writer * 500 + k as u64).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(cache.stats().baseline, 0);

    // Retire bucket 0 and flush. Canonical order is (timestamp, series),
    // so for each timestamp the eight writers' offsets appear in series
    // order.
    cache.add_key(7 * 1024, 1, u64::MAX).unwrap();
    let mut sink = VecSink::new();
    let released = cache
        .remove_old(CALLER, &mut sink, &reader, i64::MAX)
        .unwrap();
    assert_eq!(released, 4);

    let expected: Vec<u64> = (0..500u64)
        .flat_map(|ts| (0..8u64).map(move |writer| writer * 500 + ts))
        .collect();
    assert_eq!(sink.offsets.len(), 4000);
    assert_eq!(sink.offsets, expected);
}

/// Tests that readers and writers make progress against each other; the
/// scan sees a consistent prefix of the shard and always completes.
#[test]
fn test_search_runs_against_live_writers() {
    let config = CacheConfig::default()
        .with_ttl(4096)
        .with_max_live_buckets(2)
        .with_prepopulation(2)
        .with_shard_count(1);
    let cache = Arc::new(Cache::new(config).unwrap());

    let writer = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || {
            for k in 0..2000i64 {
                cache.add_key(k, 1, k as u64).unwrap();
            }
        })
    };

    for _ in 0..50 {
        let mut sink = VecSink::new();
        cache.search(CALLER, &mut sink, &ScanQuery::forward(1, 0, 4096));
        assert_eq!(sink.completions, 1);
        assert_eq!(sink.error, None);
        // Offsets equal their timestamps here, so delivery order is
        // checkable even mid-write.
        let mut sorted = sink.offsets.clone();
        sorted.sort_unstable();
        assert_eq!(sink.offsets, sorted);
    }
    writer.join().unwrap();

    // Writes that lost a try-lock race are parked in the overflow
    // buffer; one uncontended add drains them before the final count.
    cache.add_key(2047, 1, 9999).unwrap();
    let mut sink = VecSink::new();
    cache.search(CALLER, &mut sink, &ScanQuery::forward(1, 0, 2047));
    assert_eq!(sink.offsets.len(), 2000);
}

// ============================================================================
// Cancellation
// ============================================================================

/// Tests that a cancelled token stops a search before any emission and
/// reports through the sink.
#[test]
fn test_cancelled_search_reports_without_results() {
    let config = CacheConfig::default()
        .with_ttl(1024)
        .with_max_live_buckets(2)
        .with_prepopulation(2)
        .with_shard_count(1);
    let cache = Cache::new(config).unwrap();
    for k in 0..100i64 {
        cache.add_key(k, 1, k as u64).unwrap();
    }

    let token = CancelToken::new();
    token.cancel();
    let mut sink = VecSink::new();
    cache.search_with_cancel(CALLER, &mut sink, &ScanQuery::forward(1, 0, 1024), &token);

    assert!(sink.offsets.is_empty());
    assert_eq!(sink.completions, 0);
    assert_eq!(sink.error, Some(CacheError::Cancelled));
}

// ============================================================================
// End-to-End Scenario
// ============================================================================

/// Tests a complete workflow: ingest, flush, continue ingesting, and
/// verify the flushed range is gone for good.
#[test]
fn test_end_to_end_flush_then_continue() {
    let config = CacheConfig::default()
        .with_ttl(1024)
        .with_max_live_buckets(2)
        .with_prepopulation(2)
        .with_shard_count(1);
    let cache = Cache::new(config).unwrap();
    let mut store = EntryStore::default();

    // Phase 1: two windows of data.
    for i in 0..20i64 {
        let ts = i * 100;
        let offset = store.append(ts, 3, i as f64);
        cache.add(&PointEntry::new(ts, 3, i as f64), offset).unwrap();
    }
    assert_eq!(cache.stats().baseline, 1);

    // Phase 2: slide ahead and flush everything below the new window.
    cache.add_key(4 * 1024, 3, store.append(4 * 1024, 3, 0.0)).unwrap();
    let mut flush_sink = VecSink::new();
    let released = cache
        .remove_old(CALLER, &mut flush_sink, &store, i64::MAX)
        .unwrap();
    assert_eq!(released, 3);
    let expected: Vec<u64> = (0..20).collect();
    assert_eq!(flush_sink.offsets, expected);

    // Phase 3: keep ingesting at the new baseline.
    let ts = 4 * 1024 + 512;
    let offset = store.append(ts, 3, 99.0);
    assert_eq!(cache.add(&PointEntry::new(ts, 3, 99.0), offset), Ok(0));

    // The flushed range no longer answers from the cache, and writes
    // into it are refused as overflow.
    let mut sink = VecSink::new();
    cache.search(CALLER, &mut sink, &ScanQuery::forward(3, 0, 2048));
    assert!(sink.offsets.is_empty());
    assert_eq!(sink.completions, 1);
    assert!(matches!(
        cache.add_key(100, 3, 0),
        Err(CacheError::WindowOverflow { .. })
    ));

    // The live window holds exactly the post-flush writes.
    let mut sink = VecSink::new();
    cache.search(CALLER, &mut sink, &ScanQuery::forward(3, 4 * 1024, 8 * 1024));
    assert_eq!(sink.offsets, vec![20, 21]);
}
