//! Blob metadata record (the "inode" the loader consumes).
//!
//! Created once at blob-write completion and read-only afterwards.  The
//! compression flag field reserves the low byte for algorithm bits; at most
//! one may be set, enforced at construction rather than by convention.

use crate::error::{Error, Result};
use crate::merkle::Digest;

/// Payload is a chunked seekable archive (zstd frames + seek table).
pub const FLAG_CHUNK_COMPRESSED: u32 = 1 << 0;

/// Bits reserved for compression algorithms.
const ALGORITHM_MASK: u32 = 0xff;

/// Closed tag for how a blob's payload is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressedFormat {
    ZstdChunked,
}

#[derive(Debug, Clone)]
pub struct BlobMetadata {
    blob_size: u64,
    block_count: u64,
    flags: u32,
    merkle_root: Digest,
}

impl BlobMetadata {
    /// Rejects flag fields declaring more than one compression algorithm.
    pub fn new(blob_size: u64, block_count: u64, flags: u32, merkle_root: Digest) -> Result<Self> {
        if (flags & ALGORITHM_MASK).count_ones() > 1 {
            return Err(Error::corrupt(format!(
                "metadata for {merkle_root} declares more than one compression algorithm \
                 (flags {flags:#x})"
            )));
        }
        Ok(Self { blob_size, block_count, flags, merkle_root })
    }

    /// Uncompressed content length.
    pub fn blob_size(&self) -> u64 {
        self.blob_size
    }

    /// Blocks reserved for this blob on disk.
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn merkle_root(&self) -> &Digest {
        &self.merkle_root
    }

    /// The payload format, or an error for algorithm bits this build does
    /// not understand.
    pub fn compressed_format(&self) -> Result<Option<CompressedFormat>> {
        match self.flags & ALGORITHM_MASK {
            0 => Ok(None),
            FLAG_CHUNK_COMPRESSED => Ok(Some(CompressedFormat::ZstdChunked)),
            other => Err(Error::Unsupported(format!(
                "unknown compression algorithm flag {other:#x}"
            ))),
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & ALGORITHM_MASK != 0
    }
}
