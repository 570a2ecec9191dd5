//! Error and Result types for cache operations.

use crate::cache::{BucketIndex, Timestamp};
use thiserror::Error;

/// A convenience `Result` type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// The error type for cache operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Scan bounds are reversed.
    #[error("Bad argument: upper bound {upper} is below lower bound {lower}")]
    BadArgument {
        /// Lower bound of the requested range.
        lower: Timestamp,
        /// Upper bound of the requested range.
        upper: Timestamp,
    },

    /// Write targets a time window that has already left the live window.
    #[error("Write overflow: bucket index {bucket_index} is older than every live bucket (baseline {baseline})")]
    WindowOverflow {
        /// Bucket index the write mapped to.
        bucket_index: BucketIndex,
        /// Current newest bucket index.
        baseline: BucketIndex,
    },

    /// Merge attempted on a bucket that is still accepting writes.
    #[error("Bucket is still live, retire it before merging")]
    Busy,

    /// An internal invariant broke; indicates a defect, not a runtime condition.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Configured TTL maps to a bucket span below the minimum granularity.
    #[error("TTL {ttl} yields bucket span {granularity}, below the configured minimum {minimum}")]
    TtlTooSmall {
        /// Configured TTL in ticks.
        ttl: u64,
        /// Bucket span derived from the TTL (2^shift).
        granularity: u64,
        /// Minimum allowed bucket span.
        minimum: u64,
    },

    /// A configuration field holds an unusable value.
    #[error("Invalid configuration: {0}")]
    BadConfig(String),

    /// A scan or merge observed its cancellation token and stopped early.
    #[error("Operation cancelled")]
    Cancelled,
}
