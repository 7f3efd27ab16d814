/*!
Compression adapters for backup payloads and stored snapshots.

Checksums are always computed over the uncompressed bytes, so switching the
compression level never invalidates an existing backup.
*/

use crate::{Result, WardenError};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};

/// Compression abstraction for persisted payloads
pub trait CompressionAdapter: Send + Sync {
    /// Compress the input data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress the input data
    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>>;

    /// Get the name of the compression algorithm
    fn algorithm_name(&self) -> &str;
}

/// Gzip compression adapter
///
/// # Example
/// ```rust
/// use warden_core::{CompressionAdapter, GzipCompressor};
///
/// let compressor = GzipCompressor::new();
/// let plist = b"<plist><dict><key>Label</key></dict></plist>";
/// let compressed = compressor.compress(plist)?;
/// assert_eq!(compressor.decompress(&compressed)?, plist);
/// # Ok::<(), warden_core::WardenError>(())
/// ```
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Create a new gzip compressor with default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Create a new gzip compressor with the specified level (0-9)
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level.min(9)),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.compression_level);

        encoder.write_all(data).map_err(|e| {
            WardenError::compression(format!("Failed to write data for compression: {e}"))
        })?;

        encoder
            .finish()
            .map_err(|e| WardenError::compression(format!("Failed to finish compression: {e}")))
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(compressed_data);
        let mut decompressed = Vec::new();

        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| WardenError::compression(format!("Failed to decompress data: {e}")))?;

        Ok(decompressed)
    }

    fn algorithm_name(&self) -> &str {
        "gzip"
    }
}

/// Pass-through adapter, used when payloads should stay readable on disk
#[derive(Debug, Clone, Default)]
pub struct NoCompression;

impl NoCompression {
    pub fn new() -> Self {
        Self
    }
}

impl CompressionAdapter for NoCompression {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        Ok(compressed_data.to_vec())
    }

    fn algorithm_name(&self) -> &str {
        "none"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_shrinks_repetitive_plist() {
        let compressor = GzipCompressor::new();
        let plist = b"<key>ProgramArguments</key><array><string>/usr/local/bin/agent</string></array>"
            .repeat(20);

        let compressed = compressor.compress(&plist).unwrap();
        assert!(compressed.len() < plist.len());
        assert_eq!(compressor.decompress(&compressed).unwrap(), plist);
    }

    #[test]
    fn test_level_is_clamped() {
        let compressor = GzipCompressor::with_level(42);
        let data = b"payload";
        let compressed = compressor.compress(data).unwrap();
        assert_eq!(compressor.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_no_compression_passthrough() {
        let compressor = NoCompression::new();
        assert_eq!(compressor.compress(b"raw").unwrap(), b"raw");
        assert_eq!(compressor.algorithm_name(), "none");
    }

    #[test]
    fn test_gzip_rejects_garbage() {
        let compressor = GzipCompressor::new();
        assert!(compressor.decompress(b"definitely not gzip").is_err());
    }
}
