//! Core cache components: shards, time buckets, and the sliding window.
//!
//! # Architecture
//!
//! Three layers, leaves first:
//!
//! - [`Shard`]: an ordered index from (timestamp, parameter id) to a
//!   storage offset, safe for concurrent contribution, with range scan.
//! - [`Bucket`]: a fixed group of shards covering one time window; adds
//!   route to a shard, reads fan out or merge across all of them.
//! - [`Cache`]: a sliding window of live buckets plus recycling; routes
//!   each write to a bucket by a TTL-derived bit shift of its timestamp.
//!
//! Writers call [`Cache::add`]; the flush path retires a bucket and
//! drains it through [`Cache::remove_old`] or [`Bucket::merge`]. Only
//! (timestamp, parameter id, offset) triples are stored here; payloads
//! stay in the durable store.

pub mod bucket;
pub mod shard;
pub mod window;

pub use bucket::Bucket;
pub use shard::Shard;
pub use window::{Cache, CacheConfig, CacheStats};

use crate::error::{CacheError, Result};

/// Timestamp in engine ticks. The tick unit is opaque to the cache; only
/// the TTL-derived bit shift interprets it. Negative timestamps are
/// outside the supported domain.
pub type Timestamp = i64;

/// Identifier of one time series (parameter id).
pub type SeriesId = u64;

/// Offset of an entry in the durable store.
pub type EntryOffset = u64;

/// Index of one time window: `timestamp >> shift`.
pub type BucketIndex = i64;

/// Ordering key of a stored entry: (timestamp, parameter id).
pub type SeriesKey = (Timestamp, SeriesId);

/// An entry carrying its value inline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointEntry {
    /// Timestamp in engine ticks.
    pub timestamp: Timestamp,
    /// Series the point belongs to.
    pub param_id: SeriesId,
    /// Measured value.
    pub value: f64,
}

impl PointEntry {
    /// Creates a new point entry.
    pub fn new(timestamp: Timestamp, param_id: SeriesId, value: f64) -> Self {
        Self {
            timestamp,
            param_id,
            value,
        }
    }
}

/// Location of an out-of-line payload in the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadRef {
    /// Byte offset of the payload.
    pub offset: u64,
    /// Payload length in bytes.
    pub len: u32,
}

/// An entry whose payload lives out of line in the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobEntry {
    /// Timestamp in engine ticks.
    pub timestamp: Timestamp,
    /// Series the blob belongs to.
    pub param_id: SeriesId,
    /// Where the payload bytes live.
    pub payload: PayloadRef,
}

impl BlobEntry {
    /// Creates a new blob entry.
    pub fn new(timestamp: Timestamp, param_id: SeriesId, payload: PayloadRef) -> Self {
        Self {
            timestamp,
            param_id,
            payload,
        }
    }
}

/// Scan direction for range queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending key order over `[lowerbound, upperbound)`.
    Forward,
    /// Descending key order over `[lowerbound, upperbound]`.
    Backward,
}

/// A single-series range query.
///
/// Forward scans cover the half-open range `[lowerbound, upperbound)` in
/// ascending key order; backward scans cover the closed range
/// `[lowerbound, upperbound]` in descending key order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanQuery {
    /// Lower timestamp bound.
    pub lowerbound: Timestamp,
    /// Upper timestamp bound.
    pub upperbound: Timestamp,
    /// Series to match.
    pub param_id: SeriesId,
    /// Scan direction.
    pub direction: Direction,
}

impl ScanQuery {
    /// Creates a query with an explicit direction.
    pub fn new(
        param_id: SeriesId,
        lowerbound: Timestamp,
        upperbound: Timestamp,
        direction: Direction,
    ) -> Self {
        Self {
            lowerbound,
            upperbound,
            param_id,
            direction,
        }
    }

    /// Creates a forward query over `[lowerbound, upperbound)`.
    pub fn forward(param_id: SeriesId, lowerbound: Timestamp, upperbound: Timestamp) -> Self {
        Self::new(param_id, lowerbound, upperbound, Direction::Forward)
    }

    /// Creates a backward query over `[lowerbound, upperbound]`.
    pub fn backward(param_id: SeriesId, lowerbound: Timestamp, upperbound: Timestamp) -> Self {
        Self::new(param_id, lowerbound, upperbound, Direction::Backward)
    }

    /// Checks the bounds. Reversed bounds are a bad argument, reported
    /// through the sink by every search entry point.
    pub fn validate(&self) -> Result<()> {
        if self.upperbound < self.lowerbound {
            return Err(CacheError::BadArgument {
                lower: self.lowerbound,
                upper: self.upperbound,
            });
        }
        Ok(())
    }
}

/// Hardware concurrency probe, taken once per `Cache` construction.
///
/// Fixes the shard count of every bucket for that cache's lifetime.
/// Falls back to 1 when the parallelism of the host cannot be queried.
pub fn hardware_shard_count() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_validation_rejects_reversed_bounds() {
        let query = ScanQuery::forward(1, 50, 10);
        assert_eq!(
            query.validate(),
            Err(CacheError::BadArgument {
                lower: 50,
                upper: 10
            })
        );
        assert!(ScanQuery::forward(1, 10, 10).validate().is_ok());
    }

    #[test]
    fn test_hardware_shard_count_is_positive() {
        assert!(hardware_shard_count() >= 1);
    }
}
