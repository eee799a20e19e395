//! Compression capability traits and algorithm configuration.
//!
//! Callers depend only on the capability they need: [`Compress`] for the
//! write path, [`Decompress`] for whole-archive decoding, and
//! [`SeekableDecompress`] for random-access range decoding.  Exactly one
//! concrete algorithm exists, the chunked seekable zstd format in
//! [`chunked`]; the configuration type is a closed union so "which
//! algorithm" is never an open-ended bit pattern.

pub mod chunked;
pub mod seek_table;

use crate::error::Result;
use seek_table::{CompressionMapping, SeekTable};

pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Compression configuration: algorithm plus its tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    ZstdChunked { level: i32 },
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::ZstdChunked { .. } => "zstd-chunked",
        }
    }
}

impl Default for CompressionAlgorithm {
    fn default() -> Self {
        CompressionAlgorithm::ZstdChunked { level: DEFAULT_COMPRESSION_LEVEL }
    }
}

// ── Capability traits ────────────────────────────────────────────────────────

/// Streaming whole-input compression: `update` any number of times, then
/// `end` exactly once.
pub trait Compress {
    fn update(&mut self, data: &[u8]) -> Result<()>;

    fn end(&mut self) -> Result<()>;

    /// Bytes produced so far; the final archive size only after `end`.
    fn size(&self) -> u64;
}

/// Single-shot whole-archive decompression.
pub trait Decompress {
    /// Decode `src` (a complete archive) into `dst`.  Returns the decoded
    /// length, which always equals the archive's declared decompressed size.
    fn decompress(&self, dst: &mut [u8], src: &[u8]) -> Result<u64>;
}

/// Random-access decompression of syntactically valid sub-ranges.
pub trait SeekableDecompress {
    fn seek_table(&self) -> &SeekTable;

    /// Decode the frames covering `dst.len()` decompressed bytes starting at
    /// `decompressed_offset`, which must be a frame boundary.  `src` holds
    /// the compressed bytes beginning at the first covered frame.
    fn decompress_range(&self, dst: &mut [u8], src: &[u8], decompressed_offset: u64)
        -> Result<()>;

    /// Smallest frame run covering the requested decompressed range, bounded
    /// by `max_decompressed_len`.
    fn mapping_for_decompressed_range(
        &self,
        offset: u64,
        length: u64,
        max_decompressed_len: u64,
    ) -> Result<CompressionMapping> {
        self.seek_table()
            .mapping_for_range(offset, length, max_decompressed_len)
    }
}
