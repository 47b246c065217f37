//! Snappy block codec using `snap::raw`.
//!
//! Bodies are compressed as a single raw snappy block (not the framed
//! stream format), which is what the extension bit on the wire announces.

use crate::error::{Result, WireError};

/// Raw snappy block compression.
pub struct SnappyCodec;

impl SnappyCodec {
    /// Compress a body into one snappy block.
    pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
        snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| WireError::Protocol(format!("snappy compress: {}", e)))
    }

    /// Decompress a snappy block, refusing output larger than `max_len`.
    ///
    /// The decompressed length is read from the block preamble and checked
    /// before the output buffer is allocated.
    pub fn decompress(data: &[u8], max_len: u32) -> Result<Vec<u8>> {
        let len =
            snap::raw::decompress_len(data).map_err(|e| WireError::Decompress(e.to_string()))?;
        if len > max_len as usize {
            return Err(WireError::FrameTooLarge {
                length: u32::try_from(len).unwrap_or(u32::MAX),
                max: max_len,
            });
        }
        snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| WireError::Decompress(e.to_string()))
    }
}
