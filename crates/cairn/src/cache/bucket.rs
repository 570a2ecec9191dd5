//! Bucket - one time window of shards with a retirement hand-off.
//!
//! A bucket owns a fixed group of shards created at construction. Writers
//! spread across the shards by a per-thread pick; readers either fan out
//! (per-shard order only) or run the k-way merge, which produces one
//! globally ordered sequence for flush. The `state` counter is the only
//! synchronization between writers and the flush path: it moves from 0
//! (live) to nonzero (retired) exactly once per window occupancy, and
//! merge refuses to run while the bucket is live.

use std::cell::Cell;
use std::cmp::Reverse;
use std::collections::hash_map::DefaultHasher;
use std::collections::BinaryHeap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::thread;

use crate::cache::shard::Shard;
use crate::cache::{BucketIndex, EntryOffset, ScanQuery, SeriesId, Timestamp};
use crate::cursor::{CallerId, CancelToken, EntryReader, ResultSink};
use crate::error::{CacheError, Result};

thread_local! {
    static WRITER_SEED: Cell<u64> = const { Cell::new(0) };
}

/// Shard-selection seed for the calling thread, hashed from its thread
/// id on first use. Zero marks "not yet computed", so the hash is forced
/// nonzero.
fn writer_seed() -> u64 {
    WRITER_SEED.with(|seed| {
        let mut value = seed.get();
        if value == 0 {
            let mut hasher = DefaultHasher::new();
            thread::current().id().hash(&mut hasher);
            value = hasher.finish() | 1;
            seed.set(value);
        }
        value
    })
}

/// One time-aligned group of shards covering `2^shift` timestamps.
pub struct Bucket {
    /// Shards, fixed at construction.
    shards: Vec<Shard>,
    /// Time-bucket index this bucket currently covers.
    baseline: AtomicI64,
    /// 0 while accepting writes, nonzero once retired.
    state: AtomicU32,
}

impl Bucket {
    /// Creates a live bucket with `shard_count` shards (clamped to at
    /// least 1) covering the window at `baseline`.
    pub fn new(shard_count: usize, overflow_capacity: usize, baseline: BucketIndex) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Shard::new(overflow_capacity))
            .collect();
        Self {
            shards,
            baseline: AtomicI64::new(baseline),
            state: AtomicU32::new(0),
        }
    }

    /// Time-bucket index this bucket covers.
    pub fn baseline(&self) -> BucketIndex {
        self.baseline.load(Ordering::Acquire)
    }

    /// True while the bucket accepts writes.
    pub fn is_live(&self) -> bool {
        self.state.load(Ordering::Acquire) == 0
    }

    /// Marks the bucket retired. Idempotent; the live-to-retired
    /// transition happens at most once per window occupancy, and the
    /// caller must have routed all writes for this baseline elsewhere
    /// before calling.
    pub fn retire(&self) {
        let _ = self
            .state
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Total entries across all shard primary mappings.
    pub fn len(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }

    /// Returns true if no shard holds an entry.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts an entry into one of the shards.
    ///
    /// The shard is picked from a per-thread hash, so a given writer
    /// thread keeps hitting the same shard. The pick affects contention
    /// only, never correctness.
    pub fn add(&self, timestamp: Timestamp, param_id: SeriesId, offset: EntryOffset) {
        let slot = (writer_seed() as usize) % self.shards.len();
        self.shards[slot].add(timestamp, param_id, offset);
    }

    /// Fans a range query out to every shard sequentially.
    ///
    /// Within one shard, results respect the requested direction; across
    /// shards no relative order is guaranteed. Callers needing a single
    /// globally ordered result must use [`Bucket::merge`] instead.
    /// Completion is signaled exactly once for the whole bucket.
    pub fn search(&self, caller: CallerId, sink: &mut dyn ResultSink, query: &ScanQuery) {
        if self.scan_into(caller, sink, query, None) {
            sink.complete(caller);
        }
    }

    /// Like [`Bucket::search`], polling `cancel` between emissions.
    pub fn search_with_cancel(
        &self,
        caller: CallerId,
        sink: &mut dyn ResultSink,
        query: &ScanQuery,
        cancel: &CancelToken,
    ) {
        if self.scan_into(caller, sink, query, Some(cancel)) {
            sink.complete(caller);
        }
    }

    /// Per-shard scan without the completion signal; used by the
    /// top-level window search, which completes its sink once overall.
    pub(crate) fn scan_into(
        &self,
        caller: CallerId,
        sink: &mut dyn ResultSink,
        query: &ScanQuery,
        cancel: Option<&CancelToken>,
    ) -> bool {
        for shard in &self.shards {
            if !shard.scan_into(caller, sink, query, cancel) {
                return false;
            }
        }
        true
    }

    /// Merges all shards into one globally ordered offset sequence.
    ///
    /// Intended for flushing a retired bucket. Every shard's overflow
    /// buffer is drained first, so entries buffered under pre-retirement
    /// contention are included. Ordering follows the canonical
    /// (timestamp, parameter id) of each offset as resolved by `reader`;
    /// the in-shard key order is not trusted for the total order. Ties
    /// between shards go to the lowest shard index. The sink only
    /// receives `put` calls; completion stays with the flush driver.
    ///
    /// # Errors
    ///
    /// [`CacheError::Busy`] if the bucket is still live.
    pub fn merge(
        &self,
        caller: CallerId,
        sink: &mut dyn ResultSink,
        reader: &dyn EntryReader,
    ) -> Result<()> {
        self.merge_inner(caller, sink, reader, None)
    }

    /// Like [`Bucket::merge`], polling `cancel` between emissions.
    ///
    /// # Errors
    ///
    /// [`CacheError::Busy`] if the bucket is still live,
    /// [`CacheError::Cancelled`] if the token fired mid-merge.
    pub fn merge_with_cancel(
        &self,
        caller: CallerId,
        sink: &mut dyn ResultSink,
        reader: &dyn EntryReader,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.merge_inner(caller, sink, reader, Some(cancel))
    }

    fn merge_inner(
        &self,
        caller: CallerId,
        sink: &mut dyn ResultSink,
        reader: &dyn EntryReader,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        if self.is_live() {
            return Err(CacheError::Busy);
        }
        for shard in &self.shards {
            shard.flush_overflow();
        }

        // Retirement stops new writes; holding every index lock keeps the
        // iterators stable for the duration of the merge.
        let guards: Vec<_> = self.shards.iter().map(Shard::lock_index).collect();
        if guards.iter().map(|guard| guard.len()).sum::<usize>() == 0 {
            return Ok(());
        }

        let mut iters: Vec<_> = guards.iter().map(|guard| guard.iter()).collect();
        let mut heap = BinaryHeap::with_capacity(iters.len());
        for (slot, iter) in iters.iter_mut().enumerate() {
            if let Some((_, &offset)) = iter.next() {
                let (ts, id) = reader.resolve(offset);
                heap.push(Reverse((ts, id, slot, offset)));
            }
        }
        while let Some(Reverse((_, _, slot, offset))) = heap.pop() {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(CacheError::Cancelled);
            }
            sink.put(caller, offset);
            if let Some((_, &next)) = iters[slot].next() {
                let (ts, id) = reader.resolve(next);
                heap.push(Reverse((ts, id, slot, next)));
            }
        }
        Ok(())
    }

    /// Clears every shard and rebinds the bucket to a new window slot,
    /// live again. Runs under the cache's structural lock while the
    /// bucket sits on the free list, before it becomes visible to
    /// writers or readers.
    pub(crate) fn reset(&self, baseline: BucketIndex) {
        for shard in &self.shards {
            shard.clear();
        }
        self.baseline.store(baseline, Ordering::Release);
        self.state.store(0, Ordering::Release);
    }
}
