//! Shard - ordered per-bucket index with a contention overflow buffer.
//!
//! A shard maps (timestamp, parameter id) keys to storage offsets. The
//! write path is built around `try_lock`: a writer that cannot take the
//! primary lock immediately parks its entry in a small overflow buffer
//! instead of blocking, and the next writer that does take the primary
//! lock drains that buffer before inserting its own entry. Insertion is
//! first-writer-wins; a key already present keeps its original offset.

use std::collections::BTreeMap;

use parking_lot::{Mutex, MutexGuard};

use crate::cache::{Direction, EntryOffset, ScanQuery, SeriesId, SeriesKey, Timestamp};
use crate::cursor::{CallerId, CancelToken, ResultSink};
use crate::error::CacheError;

/// Primary ordered mapping of a shard.
pub(crate) type ShardIndex = BTreeMap<SeriesKey, EntryOffset>;

/// One unit of write concurrency inside a bucket.
///
/// The shard assumes one logical writer drives its main path at a time,
/// but tolerates concurrent callers: contended writers fall back to the
/// overflow buffer and never block behind a busy primary lock.
pub struct Shard {
    /// Primary ordered mapping.
    index: Mutex<ShardIndex>,
    /// Entries buffered while the primary lock was busy.
    overflow: Mutex<Vec<(Timestamp, SeriesId, EntryOffset)>>,
}

impl Shard {
    /// Creates an empty shard. `overflow_capacity` pre-sizes the buffer
    /// that absorbs write bursts under contention.
    pub fn new(overflow_capacity: usize) -> Self {
        Self {
            index: Mutex::new(BTreeMap::new()),
            overflow: Mutex::new(Vec::with_capacity(overflow_capacity)),
        }
    }

    /// Inserts an entry, or buffers it if the shard is busy.
    ///
    /// Fast path: take the primary lock, drain any buffered entries,
    /// insert. If the primary lock is held elsewhere, the entry goes to
    /// the overflow buffer under its own lock and a later drain picks it
    /// up. Either way the write is accepted; a duplicate key is dropped
    /// in favor of the first writer once it reaches the primary mapping.
    pub fn add(&self, timestamp: Timestamp, param_id: SeriesId, offset: EntryOffset) {
        if let Some(mut index) = self.index.try_lock() {
            if let Some(mut overflow) = self.overflow.try_lock() {
                for (ts, id, off) in overflow.drain(..) {
                    index.entry((ts, id)).or_insert(off);
                }
            }
            index.entry((timestamp, param_id)).or_insert(offset);
        } else {
            self.overflow.lock().push((timestamp, param_id, offset));
        }
    }

    /// Moves every buffered entry into the primary mapping.
    ///
    /// Taken by readers of a retired shard before iterating, so a burst's
    /// tail buffered just before retirement is not left invisible.
    pub(crate) fn flush_overflow(&self) {
        let mut index = self.index.lock();
        let mut overflow = self.overflow.lock();
        for (ts, id, off) in overflow.drain(..) {
            index.entry((ts, id)).or_insert(off);
        }
    }

    /// Number of entries in the primary mapping. Entries still sitting in
    /// the overflow buffer are not counted until drained.
    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    /// Returns true if the primary mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries currently buffered in the overflow list.
    pub(crate) fn overflow_len(&self) -> usize {
        self.overflow.lock().len()
    }

    /// Locks the primary mapping for ordered read-only iteration.
    pub(crate) fn lock_index(&self) -> MutexGuard<'_, ShardIndex> {
        self.index.lock()
    }

    /// Drops all entries, buffered or indexed.
    pub(crate) fn clear(&self) {
        let mut index = self.index.lock();
        let mut overflow = self.overflow.lock();
        index.clear();
        overflow.clear();
    }

    /// Scans the shard and emits matching offsets to the sink.
    ///
    /// Forward scans walk `[lowerbound, upperbound)` ascending, backward
    /// scans walk `[lowerbound, upperbound]` descending; only entries of
    /// the queried series are emitted. Completion is signaled exactly
    /// once; a reversed range is reported through the sink as a bad
    /// argument and no completion follows.
    pub fn search(&self, caller: CallerId, sink: &mut dyn ResultSink, query: &ScanQuery) {
        if self.scan_into(caller, sink, query, None) {
            sink.complete(caller);
        }
    }

    /// Like [`Shard::search`], polling `cancel` between emissions. A
    /// cancelled scan reports [`CacheError::Cancelled`] through the sink
    /// and stops without completing.
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

    /// Emits matching offsets without signaling completion.
    ///
    /// Returns false when the scan stopped early; the error has already
    /// been reported to the sink. Shared by the bucket fan-out and the
    /// top-level window search, which own the completion signal.
    pub(crate) fn scan_into(
        &self,
        caller: CallerId,
        sink: &mut dyn ResultSink,
        query: &ScanQuery,
        cancel: Option<&CancelToken>,
    ) -> bool {
        if let Err(err) = query.validate() {
            sink.set_error(caller, err);
            return false;
        }
        let index = self.index.lock();
        match query.direction {
            Direction::Forward => {
                let lo = (query.lowerbound, SeriesId::MIN);
                let hi = (query.upperbound, SeriesId::MIN);
                for (&(_, id), &offset) in index.range(lo..hi) {
                    if cancel.is_some_and(CancelToken::is_cancelled) {
                        sink.set_error(caller, CacheError::Cancelled);
                        return false;
                    }
                    if id == query.param_id {
                        sink.put(caller, offset);
                    }
                }
            }
            Direction::Backward => {
                let lo = (query.lowerbound, SeriesId::MIN);
                let hi = (query.upperbound, SeriesId::MAX);
                for (&(_, id), &offset) in index.range(lo..=hi).rev() {
                    if cancel.is_some_and(CancelToken::is_cancelled) {
                        sink.set_error(caller, CacheError::Cancelled);
                        return false;
                    }
                    if id == query.param_id {
                        sink.put(caller, offset);
                    }
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::VecSink;
    use std::sync::Arc;
    use std::thread;

    const CALLER: CallerId = 1;

    fn shard_with(entries: &[(Timestamp, SeriesId, EntryOffset)]) -> Shard {
        let shard = Shard::new(16);
        for &(ts, id, off) in entries {
            shard.add(ts, id, off);
        }
        shard
    }

    #[test]
    fn test_forward_scan_returns_half_open_range_in_order() {
        let shard = shard_with(&[(10, 1, 100), (20, 1, 200), (30, 1, 300)]);
        let mut sink = VecSink::new();
        shard.search(CALLER, &mut sink, &ScanQuery::forward(1, 10, 30));
        assert_eq!(sink.offsets, vec![100, 200]);
        assert_eq!(sink.completions, 1);
        assert!(sink.error.is_none());
    }

    #[test]
    fn test_backward_scan_returns_closed_range_descending() {
        let shard = shard_with(&[(10, 1, 100), (20, 1, 200), (30, 1, 300)]);
        let mut sink = VecSink::new();
        shard.search(CALLER, &mut sink, &ScanQuery::backward(1, 10, 30));
        assert_eq!(sink.offsets, vec![300, 200, 100]);
        assert_eq!(sink.completions, 1);
    }

    #[test]
    fn test_scan_filters_by_series() {
        let shard = shard_with(&[(10, 1, 100), (10, 2, 900), (20, 2, 910), (20, 1, 200)]);
        let mut sink = VecSink::new();
        shard.search(CALLER, &mut sink, &ScanQuery::forward(2, 0, 100));
        assert_eq!(sink.offsets, vec![900, 910]);
    }

    #[test]
    fn test_empty_scan_still_completes() {
        let shard = Shard::new(16);
        let mut sink = VecSink::new();
        shard.search(CALLER, &mut sink, &ScanQuery::forward(1, 0, 100));
        assert!(sink.offsets.is_empty());
        assert_eq!(sink.completions, 1);
    }

    #[test]
    fn test_duplicate_key_keeps_first_offset() {
        let shard = Shard::new(16);
        shard.add(5, 7, 111);
        shard.add(5, 7, 222);
        assert_eq!(shard.len(), 1);
        let mut sink = VecSink::new();
        shard.search(CALLER, &mut sink, &ScanQuery::forward(7, 0, 10));
        assert_eq!(sink.offsets, vec![111]);
    }

    #[test]
    fn test_reversed_bounds_report_bad_argument_via_sink() {
        let shard = shard_with(&[(10, 1, 100)]);
        let mut sink = VecSink::new();
        shard.search(CALLER, &mut sink, &ScanQuery::forward(1, 50, 10));
        assert!(sink.offsets.is_empty());
        assert_eq!(sink.completions, 0);
        assert_eq!(
            sink.error,
            Some(CacheError::BadArgument {
                lower: 50,
                upper: 10
            })
        );
    }

    #[test]
    fn test_contended_add_goes_to_overflow_and_drains_later() {
        let shard = Shard::new(4);

        let guard = shard.index.lock();
        shard.add(1, 1, 10);
        assert_eq!(shard.overflow_len(), 1);
        assert_eq!(shard.len(), 0);
        drop(guard);

        // Next uncontended add drains the buffer before inserting.
        shard.add(2, 1, 20);
        assert_eq!(shard.overflow_len(), 0);
        assert_eq!(shard.len(), 2);

        let mut sink = VecSink::new();
        shard.search(CALLER, &mut sink, &ScanQuery::forward(1, 0, 10));
        assert_eq!(sink.offsets, vec![10, 20]);
    }

    #[test]
    fn test_buffered_entry_wins_over_later_direct_write() {
        let shard = Shard::new(4);

        let guard = shard.index.lock();
        shard.add(1, 1, 111);
        drop(guard);

        // The drain runs before this insert, so the buffered offset is
        // already present and the direct write is dropped.
        shard.add(1, 1, 222);
        let mut sink = VecSink::new();
        shard.search(CALLER, &mut sink, &ScanQuery::forward(1, 0, 10));
        assert_eq!(sink.offsets, vec![111]);
    }

    #[test]
    fn test_cancelled_scan_reports_and_stops() {
        let shard = shard_with(&[(10, 1, 100), (20, 1, 200)]);
        let token = CancelToken::new();
        token.cancel();
        let mut sink = VecSink::new();
        shard.search_with_cancel(CALLER, &mut sink, &ScanQuery::forward(1, 0, 100), &token);
        assert!(sink.offsets.is_empty());
        assert_eq!(sink.completions, 0);
        assert_eq!(sink.error, Some(CacheError::Cancelled));
    }

    #[test]
    fn test_concurrent_writers_never_lose_entries() {
        let shard = Arc::new(Shard::new(64));
        let threads = 8;
        let per_thread = 500;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let shard = Arc::clone(&shard);
                thread::spawn(move || {
                    for i in 0..per_thread {
                        let ts = (t * per_thread + i) as Timestamp;
                        shard.add(ts, 1, ts as EntryOffset);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        shard.flush_overflow();
        assert_eq!(shard.overflow_len(), 0);
        assert_eq!(shard.len(), threads * per_thread);
    }
}
