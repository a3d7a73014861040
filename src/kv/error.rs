//! Storage family error types
//!
//! Errors raised by the key-value family layer the index persists into.

use thiserror::Error;

/// Errors that can occur in a storage family
#[derive(Error, Debug)]
pub enum KvError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected (checksum mismatch, invalid magic, etc.)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Flusher used out of order (write before prepare, commit twice, ...)
    #[error("Flusher error: {0}")]
    Flusher(String),
}

/// Result type alias for storage family operations
pub type KvResult<T> = Result<T, KvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KvError::Corruption("bad magic".to_string());
        assert_eq!(err.to_string(), "Corrupt data: bad magic");

        let err = KvError::Flusher("write before prepare".to_string());
        assert_eq!(err.to_string(), "Flusher error: write before prepare");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let kv_err: KvError = io_err.into();
        assert!(matches!(kv_err, KvError::Io(_)));
    }
}
