//! Interfaces to the surrounding engine: result delivery, entry
//! resolution, and scan cancellation.
//!
//! The cache itself never owns entry payloads. Scans and merges hand
//! matched offsets to a [`ResultSink`] supplied by the caller, and the
//! k-way merge asks an [`EntryReader`] to resolve each offset back to its
//! canonical key in the durable store. Both are traits so the engine can
//! plug in its cursor machinery and page store; [`VecSink`] and
//! [`MapReader`] are trivial implementations for tests and embedding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cache::{EntryOffset, SeriesId, Timestamp};
use crate::error::CacheError;

/// Opaque correlation handle threaded through sink calls unchanged.
pub type CallerId = u64;

/// Receives the results of a scan or merge.
pub trait ResultSink {
    /// Delivers one matched offset.
    fn put(&mut self, caller: CallerId, offset: EntryOffset);

    /// Signals that the producing operation finished normally.
    ///
    /// Each public search entry point signals completion exactly once per
    /// call, even when zero offsets were delivered.
    fn complete(&mut self, caller: CallerId);

    /// Reports a failure. No completion signal follows an error.
    fn set_error(&mut self, caller: CallerId, error: CacheError);
}

/// Resolves a stored offset to its canonical (timestamp, parameter id).
///
/// Backed by the durable store in production. The k-way merge trusts this
/// resolution, not the in-shard key order, for its total order.
pub trait EntryReader {
    /// Reads the entry at `offset` and returns its canonical key.
    fn resolve(&self, offset: EntryOffset) -> (Timestamp, SeriesId);
}

/// A sink that collects delivered offsets into a vector.
#[derive(Debug, Default)]
pub struct VecSink {
    /// Offsets received so far, in delivery order.
    pub offsets: Vec<EntryOffset>,
    /// Number of completion signals observed.
    pub completions: usize,
    /// Last error reported, if any.
    pub error: Option<CacheError>,
}

impl VecSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultSink for VecSink {
    fn put(&mut self, _caller: CallerId, offset: EntryOffset) {
        self.offsets.push(offset);
    }

    fn complete(&mut self, _caller: CallerId) {
        self.completions += 1;
    }

    fn set_error(&mut self, _caller: CallerId, error: CacheError) {
        self.error = Some(error);
    }
}

/// An entry reader backed by an in-memory offset table.
///
/// Offsets absent from the table resolve to `(0, 0)`.
#[derive(Debug, Default)]
pub struct MapReader {
    table: HashMap<EntryOffset, (Timestamp, SeriesId)>,
}

impl MapReader {
    /// Creates an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the canonical key for `offset`.
    pub fn insert(&mut self, offset: EntryOffset, timestamp: Timestamp, param_id: SeriesId) {
        self.table.insert(offset, (timestamp, param_id));
    }

    /// Number of registered offsets.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns true if no offsets are registered.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl EntryReader for MapReader {
    fn resolve(&self, offset: EntryOffset) -> (Timestamp, SeriesId) {
        self.table.get(&offset).copied().unwrap_or_default()
    }
}

/// Cooperative cancellation for long scans and merges.
///
/// Cloned tokens share one flag; a `cancel` call is observed by every
/// holder at its next poll. Scans report [`CacheError::Cancelled`]
/// through their sink, merges return it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; in-flight operations stop at their next poll.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Returns true once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}
