//! Entry payload compression for family table files
//!
//! Payloads are stored as-is or LZ4-compressed with the uncompressed size
//! prepended. The choice is recorded once per table file header.

use crate::kv::error::{KvError, KvResult};
use serde::Deserialize;

/// Compression applied to entry payloads in a table file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    #[default]
    Lz4 = 1,
}

impl TryFrom<u8> for CompressionType {
    type Error = KvError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Lz4),
            _ => Err(KvError::Corruption(format!(
                "Unknown compression type: {}",
                value
            ))),
        }
    }
}

/// Compress an entry payload
pub fn compress(kind: CompressionType, data: &[u8]) -> Vec<u8> {
    match kind {
        CompressionType::None => data.to_vec(),
        CompressionType::Lz4 => lz4_flex::compress_prepend_size(data),
    }
}

/// Decompress an entry payload written by [`compress`]
pub fn decompress(kind: CompressionType, data: &[u8]) -> KvResult<Vec<u8>> {
    match kind {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| KvError::Compression(format!("LZ4 decompression failed: {}", e))),
    }
}
