//! Cache - sliding window of time buckets with recycling.
//!
//! The cache routes every write to a time bucket derived from its
//! timestamp (`timestamp >> shift`, shift taken from the TTL) and keeps a
//! bounded window of live buckets, newest first. A write ahead of the
//! window slides it forward: the oldest live buckets are retired to the
//! flush queue and replacements come from a free list of recycled
//! buckets. A write behind the window is an overflow the caller must
//! handle. Retired buckets hold their contents until
//! [`Cache::remove_old`] merges them into the flush sink and releases
//! them for reuse.
//!
//! # Architecture
//!
//! A bucket is always in exactly one of three stations:
//!
//! - the active window (live, accepting writes),
//! - the retired queue (read-only, awaiting flush),
//! - the free list (recycled, cleared on reuse).
//!
//! One structural lock guards station membership and the baseline; it
//! never protects bucket contents. Scans take a snapshot of the window
//! under that lock and read the buckets outside it.
//!
//! # Example
//!
//! ```rust,ignore
//! use tarn_cairn::{Cache, CacheConfig, PointEntry};
//!
//! let cache = Cache::new(CacheConfig::default())?;
//! let point = PointEntry::new(1024, 7, 0.75);
//! let swapped = cache.add(&point, 0x40)?;
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::cache::bucket::Bucket;
use crate::cache::{
    hardware_shard_count, BlobEntry, BucketIndex, Direction, EntryOffset, PointEntry, ScanQuery,
    SeriesId, Timestamp,
};
use crate::cursor::{CallerId, CancelToken, EntryReader, ResultSink};
use crate::error::{CacheError, Result};

/// Default TTL in ticks (shift 12, window span 4096).
pub const DEFAULT_TTL: u64 = 4096;

/// Default live-window capacity.
pub const DEFAULT_MAX_LIVE_BUCKETS: usize = 8;

/// Default number of buckets pre-created into the pool at construction.
pub const DEFAULT_PREPOPULATION: usize = 32;

/// Default minimum bucket span a TTL may map to.
pub const DEFAULT_MIN_TTL_GRANULARITY: u64 = 2;

/// Default pre-sized capacity of each shard's overflow buffer.
pub const DEFAULT_SHARD_CAPACITY_HINT: usize = 64;

/// Configuration for the cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL in engine ticks.
    ///
    /// The bucket span is `2^floor(log2(ttl))`; construction fails when
    /// that span is below `min_ttl_granularity`. Default: 4096.
    pub ttl: u64,

    /// Maximum number of live buckets in the active window.
    ///
    /// Sliding past this capacity retires the oldest buckets. Default: 8.
    pub max_live_buckets: usize,

    /// Number of buckets pre-created into the pool at construction.
    ///
    /// The initial window draws from this pool; keeping it above the
    /// window capacity avoids allocation on early slides. Default: 32.
    pub prepopulation: usize,

    /// Minimum bucket span a TTL may map to. Default: 2.
    pub min_ttl_granularity: u64,

    /// Pre-sized capacity of each shard's contention overflow buffer.
    /// Default: 64.
    pub shard_capacity_hint: usize,

    /// Shards per bucket. `None` probes the hardware concurrency at
    /// construction. Default: `None`.
    pub shard_count: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            max_live_buckets: DEFAULT_MAX_LIVE_BUCKETS,
            prepopulation: DEFAULT_PREPOPULATION,
            min_ttl_granularity: DEFAULT_MIN_TTL_GRANULARITY,
            shard_capacity_hint: DEFAULT_SHARD_CAPACITY_HINT,
            shard_count: None,
        }
    }
}

impl CacheConfig {
    /// Sets the TTL in ticks.
    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the live-window capacity.
    pub fn with_max_live_buckets(mut self, max: usize) -> Self {
        self.max_live_buckets = max;
        self
    }

    /// Sets the construction-time pool size.
    pub fn with_prepopulation(mut self, count: usize) -> Self {
        self.prepopulation = count;
        self
    }

    /// Sets the minimum bucket span.
    pub fn with_min_ttl_granularity(mut self, minimum: u64) -> Self {
        self.min_ttl_granularity = minimum;
        self
    }

    /// Sets the per-shard overflow buffer capacity.
    pub fn with_shard_capacity_hint(mut self, hint: usize) -> Self {
        self.shard_capacity_hint = hint;
        self
    }

    /// Fixes the shard count instead of probing hardware concurrency.
    pub fn with_shard_count(mut self, count: usize) -> Self {
        self.shard_count = Some(count);
        self
    }
}

/// Inspection snapshot of the cache, taken under the structural lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Buckets in the active window.
    pub live_buckets: usize,
    /// Retired buckets awaiting flush.
    pub retired_buckets: usize,
    /// Recycled buckets available for reuse.
    pub free_buckets: usize,
    /// Entries across the live window's primary mappings.
    pub total_entries: usize,
    /// Current newest bucket index.
    pub baseline: BucketIndex,
}

/// Station membership, guarded by the structural lock.
struct WindowState {
    /// Live buckets, newest first; the front is the baseline bucket.
    window: VecDeque<Arc<Bucket>>,
    /// Retired buckets in retirement order, oldest first.
    retired: VecDeque<Arc<Bucket>>,
    /// Recycled buckets, content-undefined until reset on reuse.
    free: Vec<Arc<Bucket>>,
    /// Newest bucket index.
    baseline: BucketIndex,
}

/// Sliding window of time buckets with TTL-driven eviction and reuse.
pub struct Cache {
    /// Station membership and baseline.
    state: Mutex<WindowState>,
    /// Bits a timestamp is shifted by to find its bucket index.
    shift: u32,
    /// Shards per bucket, fixed at construction.
    shard_count: usize,
    /// Configuration the cache was built with.
    config: CacheConfig,
}

impl Cache {
    /// Builds a cache, prepopulates the bucket pool, and fills the
    /// initial window at baseline 0.
    ///
    /// # Errors
    ///
    /// [`CacheError::TtlTooSmall`] when the TTL maps to a bucket span
    /// below the configured minimum, [`CacheError::BadConfig`] for a
    /// zero window capacity or zero shard count.
    pub fn new(config: CacheConfig) -> Result<Self> {
        if config.ttl == 0 {
            return Err(CacheError::TtlTooSmall {
                ttl: 0,
                granularity: 0,
                minimum: config.min_ttl_granularity,
            });
        }
        let shift = config.ttl.ilog2();
        let granularity = 1u64 << shift;
        if granularity < config.min_ttl_granularity {
            return Err(CacheError::TtlTooSmall {
                ttl: config.ttl,
                granularity,
                minimum: config.min_ttl_granularity,
            });
        }
        if config.max_live_buckets == 0 {
            return Err(CacheError::BadConfig(
                "max_live_buckets must be at least 1".into(),
            ));
        }
        if config.shard_count == Some(0) {
            return Err(CacheError::BadConfig("shard_count must be at least 1".into()));
        }
        let shard_count = config.shard_count.unwrap_or_else(hardware_shard_count);

        let mut state = WindowState {
            window: VecDeque::with_capacity(config.max_live_buckets),
            retired: VecDeque::new(),
            free: Vec::with_capacity(config.prepopulation.max(config.max_live_buckets)),
            baseline: 0,
        };
        for _ in 0..config.prepopulation {
            state
                .free
                .push(Arc::new(Bucket::new(shard_count, config.shard_capacity_hint, 0)));
        }

        let cache = Self {
            state: Mutex::new(state),
            shift,
            shard_count,
            config,
        };
        {
            let mut guard = cache.state.lock();
            let capacity = cache.config.max_live_buckets;
            cache.allocate_from_free_list(&mut guard, capacity, 0);
        }
        Ok(cache)
    }

    /// Bits a timestamp is shifted by to find its bucket index.
    pub fn shift(&self) -> u32 {
        self.shift
    }

    /// Timestamp span covered by one bucket (`2^shift`).
    pub fn window_span(&self) -> u64 {
        1u64 << self.shift
    }

    /// Current newest bucket index.
    pub fn baseline(&self) -> BucketIndex {
        self.state.lock().baseline
    }

    /// Configuration the cache was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Shards per bucket.
    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Inspection snapshot of station sizes, entry count, and baseline.
    pub fn stats(&self) -> CacheStats {
        let guard = self.state.lock();
        CacheStats {
            live_buckets: guard.window.len(),
            retired_buckets: guard.retired.len(),
            free_buckets: guard.free.len(),
            total_entries: guard.window.iter().map(|bucket| bucket.len()).sum(),
            baseline: guard.baseline,
        }
    }

    /// Inserts a point entry. See [`Cache::add_key`].
    ///
    /// # Errors
    ///
    /// As for [`Cache::add_key`].
    pub fn add(&self, entry: &PointEntry, offset: EntryOffset) -> Result<usize> {
        self.add_key(entry.timestamp, entry.param_id, offset)
    }

    /// Inserts a blob entry. Both entry shapes store the same
    /// (timestamp, parameter id, offset) triple here.
    ///
    /// # Errors
    ///
    /// As for [`Cache::add_key`].
    pub fn add_blob(&self, entry: &BlobEntry, offset: EntryOffset) -> Result<usize> {
        self.add_key(entry.timestamp, entry.param_id, offset)
    }

    /// Routes one (timestamp, parameter id, offset) triple to its bucket,
    /// sliding the window forward when the write is ahead of it.
    ///
    /// Returns the number of buckets retired by this call, zero when the
    /// window did not move.
    ///
    /// # Errors
    ///
    /// [`CacheError::WindowOverflow`] when the write maps to a window
    /// older than every live bucket; the cache is left unchanged and the
    /// caller must route the entry to cold storage or reject it.
    /// [`CacheError::InvariantViolation`] when the target bucket is
    /// missing after a slide, which indicates a defect.
    pub fn add_key(
        &self,
        timestamp: Timestamp,
        param_id: SeriesId,
        offset: EntryOffset,
    ) -> Result<usize> {
        let index = timestamp >> self.shift;
        let (target, swapped) = self.locate_or_slide(index)?;
        target.add(timestamp, param_id, offset);
        Ok(swapped)
    }

    /// Finds the bucket for `index`, sliding the window if the index is
    /// ahead of the baseline. Returns the bucket and the number of
    /// buckets retired by the slide.
    fn locate_or_slide(&self, index: BucketIndex) -> Result<(Arc<Bucket>, usize)> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if index == state.baseline {
            return match state.window.front() {
                Some(bucket) => Ok((Arc::clone(bucket), 0)),
                None => {
                    error!("active window is empty at baseline {}", state.baseline);
                    Err(CacheError::InvariantViolation(
                        "active window is empty".into(),
                    ))
                }
            };
        }

        if index < state.baseline {
            return match find_live(&state.window, index) {
                Some(bucket) => Ok((bucket, 0)),
                None => {
                    warn!(
                        "write overflow: bucket {} is older than every live bucket (baseline {})",
                        index, state.baseline
                    );
                    Err(CacheError::WindowOverflow {
                        bucket_index: index,
                        baseline: state.baseline,
                    })
                }
            };
        }

        // The write is ahead of the window: slide forward. Retired
        // buckets leave the window before replacements are spliced in,
        // so the capacity bound holds throughout.
        let count = (index - state.baseline) as usize;
        let capacity = self.config.max_live_buckets;
        state.baseline = index;
        let mut swapped = 0;
        if count >= capacity {
            while let Some(bucket) = state.window.pop_back() {
                bucket.retire();
                state.retired.push_back(bucket);
                swapped += 1;
            }
            self.allocate_from_free_list(state, capacity, index);
        } else {
            let excess = (state.window.len() + count).saturating_sub(capacity);
            for _ in 0..excess {
                if let Some(bucket) = state.window.pop_back() {
                    bucket.retire();
                    state.retired.push_back(bucket);
                    swapped += 1;
                }
            }
            self.allocate_from_free_list(state, count, index);
        }
        debug!("window slid to baseline {}, retired {} buckets", index, swapped);

        match find_live(&state.window, index) {
            Some(bucket) => Ok((bucket, swapped)),
            None => {
                error!("bucket {} missing from the window after allocation", index);
                Err(CacheError::InvariantViolation(format!(
                    "bucket {index} missing after allocation"
                )))
            }
        }
    }

    /// Moves `n` buckets from the free list into the window front,
    /// creating new ones if the list is short. Each transferred bucket
    /// is cleared, rebound to its slot, and made live before it becomes
    /// visible; slots run from `newest` backward.
    fn allocate_from_free_list(&self, state: &mut WindowState, n: usize, newest: BucketIndex) {
        let mut created = 0;
        while state.free.len() < n {
            state.free.push(Arc::new(Bucket::new(
                self.shard_count,
                self.config.shard_capacity_hint,
                newest,
            )));
            created += 1;
        }
        if created > 0 {
            debug!("free list grew by {} buckets", created);
        }
        let start = state.free.len() - n;
        for (i, bucket) in state.free.drain(start..).enumerate() {
            let slot = newest - (n - 1 - i) as BucketIndex;
            bucket.reset(slot);
            state.window.push_front(bucket);
        }
    }

    /// Relinks every bucket, live or retired, into the free list and
    /// rebuilds an empty window at the current baseline. Contents are
    /// not touched here; reuse clears them. Unflushed data is abandoned
    /// by contract.
    pub fn clear(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.free.extend(state.window.drain(..));
        state.free.extend(state.retired.drain(..));
        let capacity = self.config.max_live_buckets;
        let baseline = state.baseline;
        self.allocate_from_free_list(state, capacity, baseline);
        debug!("cache cleared, window rebuilt at baseline {}", baseline);
    }

    /// Flushes retired buckets older than `horizon` and releases them
    /// for reuse.
    ///
    /// Claims every retired bucket whose baseline is below `horizon`
    /// (oldest retirement first), merges each into the sink in canonical
    /// order via [`Bucket::merge`], and moves it to the free list once
    /// its merge returned. Sink delivery is synchronous, so a returned
    /// call means every released bucket's offsets reached the flush
    /// driver. Completion signaling stays with the driver. Passing
    /// `BucketIndex::MAX` drains the whole queue.
    ///
    /// Returns the number of buckets released.
    ///
    /// # Errors
    ///
    /// Any merge error; buckets not yet released return to the retired
    /// queue, and a partially delivered bucket is re-delivered from the
    /// start by a later call.
    pub fn remove_old(
        &self,
        caller: CallerId,
        sink: &mut dyn ResultSink,
        reader: &dyn EntryReader,
        horizon: BucketIndex,
    ) -> Result<usize> {
        self.remove_old_inner(caller, sink, reader, horizon, None)
    }

    /// Like [`Cache::remove_old`], polling `cancel` between emissions.
    ///
    /// # Errors
    ///
    /// As for [`Cache::remove_old`], plus [`CacheError::Cancelled`].
    pub fn remove_old_with_cancel(
        &self,
        caller: CallerId,
        sink: &mut dyn ResultSink,
        reader: &dyn EntryReader,
        horizon: BucketIndex,
        cancel: &CancelToken,
    ) -> Result<usize> {
        self.remove_old_inner(caller, sink, reader, horizon, Some(cancel))
    }

    fn remove_old_inner(
        &self,
        caller: CallerId,
        sink: &mut dyn ResultSink,
        reader: &dyn EntryReader,
        horizon: BucketIndex,
        cancel: Option<&CancelToken>,
    ) -> Result<usize> {
        // Claim eligible buckets under the structural lock, merge them
        // outside it.
        let claimed: Vec<Arc<Bucket>> = {
            let mut guard = self.state.lock();
            let mut claimed = Vec::new();
            let mut idx = 0;
            while idx < guard.retired.len() {
                if guard.retired[idx].baseline() < horizon {
                    if let Some(bucket) = guard.retired.remove(idx) {
                        claimed.push(bucket);
                    }
                } else {
                    idx += 1;
                }
            }
            claimed
        };

        let mut released = 0;
        for (pos, bucket) in claimed.iter().enumerate() {
            let merged = match cancel {
                Some(token) => bucket.merge_with_cancel(caller, sink, reader, token),
                None => bucket.merge(caller, sink, reader),
            };
            if let Err(err) = merged {
                let mut guard = self.state.lock();
                for unflushed in &claimed[pos..] {
                    guard.retired.push_back(Arc::clone(unflushed));
                }
                return Err(err);
            }
            self.state.lock().free.push(Arc::clone(bucket));
            released += 1;
        }
        if released > 0 {
            debug!("released {} flushed buckets to the free list", released);
        }
        Ok(released)
    }

    /// Range query across every live bucket overlapping the range.
    ///
    /// Takes one snapshot of the baseline and window membership, then
    /// scans the overlapping buckets outside the structural lock,
    /// bucket by bucket in the order dictated by the direction. Within a
    /// bucket results follow per-shard order only, as with
    /// [`Bucket::search`]. Bucket indices ahead of the snapshot baseline
    /// hold no data; buckets that left the window concurrently simply
    /// contribute nothing. Completion is signaled exactly once.
    pub fn search(&self, caller: CallerId, sink: &mut dyn ResultSink, query: &ScanQuery) {
        self.search_inner(caller, sink, query, None);
    }

    /// Like [`Cache::search`], polling `cancel` between emissions.
    pub fn search_with_cancel(
        &self,
        caller: CallerId,
        sink: &mut dyn ResultSink,
        query: &ScanQuery,
        cancel: &CancelToken,
    ) {
        self.search_inner(caller, sink, query, Some(cancel));
    }

    fn search_inner(
        &self,
        caller: CallerId,
        sink: &mut dyn ResultSink,
        query: &ScanQuery,
        cancel: Option<&CancelToken>,
    ) {
        if let Err(err) = query.validate() {
            sink.set_error(caller, err);
            return;
        }
        let lo_idx = query.lowerbound >> self.shift;
        let hi_idx = query.upperbound >> self.shift;

        let targets: Vec<Arc<Bucket>> = {
            let guard = self.state.lock();
            // Indices ahead of the baseline are a future read.
            let hi_idx = hi_idx.min(guard.baseline);
            let overlaps = |bucket: &&Arc<Bucket>| {
                let base = bucket.baseline();
                bucket.is_live() && base >= lo_idx && base <= hi_idx
            };
            match query.direction {
                Direction::Forward => guard.window.iter().rev().filter(overlaps).cloned().collect(),
                Direction::Backward => guard.window.iter().filter(overlaps).cloned().collect(),
            }
        };

        for bucket in &targets {
            if !bucket.scan_into(caller, sink, query, cancel) {
                return;
            }
        }
        sink.complete(caller);
    }
}

/// Finds the live bucket bound to `index`, if any.
fn find_live(window: &VecDeque<Arc<Bucket>>, index: BucketIndex) -> Option<Arc<Bucket>> {
    window
        .iter()
        .find(|bucket| bucket.is_live() && bucket.baseline() == index)
        .cloned()
}
