//! Payload compression.
//!
//! The write side produces LZ4 block payloads prefixed with the
//! uncompressed size as a little-endian u64. The read side additionally
//! understands zstd frames from foreign files; XZ payloads are reported
//! as undecodable rather than decoded.

use crate::error::{JournalError, Result};
use crate::format::{OBJECT_COMPRESSED_LZ4, OBJECT_COMPRESSED_XZ, OBJECT_COMPRESSED_ZSTD};
use std::io::Read;

/// Size prefix carried in front of every LZ4 block we write.
const SIZE_PREFIX: usize = std::mem::size_of::<u64>();

#[derive(Debug, Clone, Copy, Default)]
pub struct CompressionConfig {
    /// Compress payloads at or above this many bytes; `None` disables
    /// compression entirely.
    pub threshold: Option<u64>,
}

impl CompressionConfig {
    pub fn enabled(&self) -> bool {
        self.threshold.is_some()
    }

    pub fn should_compress(&self, payload_len: usize) -> bool {
        self.threshold
            .is_some_and(|threshold| payload_len as u64 >= threshold)
    }
}

/// Compress `payload`, returning the on-disk bytes and the object flag to
/// record, or `None` if compression would not shrink the payload.
pub fn compress(payload: &[u8]) -> Option<(Vec<u8>, u8)> {
    let mut out = Vec::with_capacity(SIZE_PREFIX + payload.len() / 2);
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&lz4_flex::block::compress(payload));

    // Not worth it if the compressed form is no smaller.
    if out.len() >= payload.len() {
        return None;
    }

    Some((out, OBJECT_COMPRESSED_LZ4))
}

/// Decompress an object payload according to its compression flag bits.
pub fn decompress(data: &[u8], flags: u8) -> Result<Vec<u8>> {
    match flags {
        OBJECT_COMPRESSED_LZ4 => {
            if data.len() < SIZE_PREFIX {
                return Err(JournalError::Decompression);
            }
            let size = u64::from_le_bytes(data[..SIZE_PREFIX].try_into().unwrap()) as usize;
            lz4_flex::block::decompress(&data[SIZE_PREFIX..], size)
                .map_err(|_| JournalError::Decompression)
        }
        OBJECT_COMPRESSED_ZSTD => {
            let mut decoder = ruzstd::decoding::StreamingDecoder::new(data)
                .map_err(|_| JournalError::Decompression)?;
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|_| JournalError::Decompression)?;
            Ok(out)
        }
        OBJECT_COMPRESSED_XZ => Err(JournalError::Decompression),
        _ => Err(JournalError::Decompression),
    }
}
