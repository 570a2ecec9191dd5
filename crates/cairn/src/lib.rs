//! Cairn - Tarn Time Windowed Write Cache
//!
//! This crate provides the in-memory write front of the Tarn time series
//! storage engine: a sliding window of time buckets that absorbs incoming
//! samples, spills contended writes into per-shard overflow buffers, and
//! hands retired buckets to the flush path in canonical key order.
//!
//! # Components
//!
//! - [`Cache`]: TTL-sized sliding window with bucket retirement and reuse
//! - [`Bucket`]: one time window, sharded by writer thread
//! - [`Shard`]: lock-striped ordered index with a contention overflow buffer
//! - [`cursor`]: sink and reader traits connecting scans to the storage layer
//!
//! # Example
//!
//! ```rust,ignore
//! use tarn_cairn::{Cache, CacheConfig, PointEntry, ScanQuery, VecSink};
//!
//! // One bucket covers 2^10 ticks; four buckets stay live.
//! let config = CacheConfig::default().with_ttl(1024).with_max_live_buckets(4);
//! let cache = Cache::new(config)?;
//!
//! // Writes carry the offset of the payload in the backing store.
//! let swapped = cache.add(&PointEntry::new(now, series, 0.75), offset)?;
//! if swapped > 0 {
//!     // Retired buckets are ready for Cache::remove_old.
//! }
//!
//! // Range reads stream offsets into a sink.
//! let mut sink = VecSink::new();
//! cache.search(caller, &mut sink, &ScanQuery::forward(series, lo, hi));
//! ```

#![deny(missing_docs)]

pub mod cache;
pub mod cursor;
pub mod error;

pub use cache::{
    hardware_shard_count, BlobEntry, Bucket, BucketIndex, Cache, CacheConfig, CacheStats,
    Direction, EntryOffset, PayloadRef, PointEntry, ScanQuery, SeriesId, SeriesKey, Shard,
    Timestamp,
};
pub use cursor::{CallerId, CancelToken, EntryReader, MapReader, ResultSink, VecSink};
pub use error::{CacheError, Result};
