//! Index error types

use crate::kv::KvError;
use thiserror::Error;

/// Errors that can occur in the metric index
#[derive(Error, Debug)]
pub enum IndexError {
    /// Storage family failure (snapshot load, flush write, ...)
    #[error("Storage error: {0}")]
    Storage(#[from] KvError),

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted index data could not be decoded
    #[error("Corrupt index data: {0}")]
    Corruption(String),

    /// Metric already holds the maximum number of fields
    #[error("Too many fields for metric {metric_id}: limit is {limit}")]
    TooManyFields { metric_id: u32, limit: usize },

    /// Metric already holds the maximum number of tag keys
    #[error("Too many tag keys for metric {metric_id}: limit is {limit}")]
    TooManyTagKeys { metric_id: u32, limit: usize },

    /// Namespace exceeds the length limit
    #[error("Namespace too long: {len} bytes exceeds limit of {limit}")]
    NamespaceTooLong { len: usize, limit: usize },

    /// Bucket key longer than the persisted format allows
    #[error("Key too long: {len} bytes exceeds limit of {limit}")]
    KeyTooLong { len: usize, limit: usize },

    /// Field already registered with another type
    #[error("Field {name} already registered as {existing}, got {requested}")]
    FieldTypeMismatch {
        name: String,
        existing: String,
        requested: String,
    },

    /// Malformed regular expression in a tag filter
    #[error("Invalid regular expression: {0}")]
    InvalidRegex(#[from] regex::Error),

    /// Lookup found nothing where the protocol requires a result
    #[error("Not found: {0}")]
    NotFound(String),

    /// Timestamp cannot be mapped to a calendar month
    #[error("Invalid family time: {0}")]
    InvalidTime(i64),

    /// Notify worker has shut down
    #[error("Worker closed: {0}")]
    WorkerClosed(String),

    /// Background flush task failed to run
    #[error("Flush failed: {0}")]
    Flush(String),
}

/// Result type alias for index operations
pub type IndexResult<T> = Result<T, IndexError>;
