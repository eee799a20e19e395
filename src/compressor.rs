//! Blob compressor: algorithm selection and the owned output buffer.
//!
//! One instance compresses exactly one blob.  The output buffer is sized by
//! the algorithm's upper-bound estimator rounded up to a block multiple, so
//! the finished archive can be handed to the block-aligned write path
//! without another copy.

use crate::codec::chunked::{self, ChunkedCompressor};
use crate::codec::{Compress, CompressionAlgorithm};
use crate::error::{Error, Result};
use crate::metadata::FLAG_CHUNK_COMPRESSED;

pub struct BlobCompressor {
    inner: ChunkedCompressor,
    buffer: Vec<u8>,
    size: u64,
    block_size: u64,
    finished: bool,
}

impl BlobCompressor {
    pub fn new(
        algorithm: CompressionAlgorithm,
        uncompressed_len: u64,
        block_size: u64,
    ) -> Result<Self> {
        let CompressionAlgorithm::ZstdChunked { level } = algorithm;
        let bound = chunked::compressed_size_upper_bound(uncompressed_len, block_size);
        let capacity = bound
            .checked_add(block_size - 1)
            .ok_or(Error::Overflow)?
            / block_size
            * block_size;
        Ok(Self {
            inner: ChunkedCompressor::new(level, uncompressed_len, block_size),
            buffer: vec![0u8; capacity as usize],
            size: 0,
            block_size,
            finished: false,
        })
    }

    /// The metadata flag bit for the selected algorithm.
    pub fn algorithm_flag(&self) -> u32 {
        FLAG_CHUNK_COMPRESSED
    }

    pub fn update(&mut self, data: &[u8]) -> Result<()> {
        self.inner.update(data)
    }

    pub fn end(&mut self) -> Result<()> {
        self.inner.end()?;
        self.size = self.inner.finish_into(&mut self.buffer)?;
        self.finished = true;
        Ok(())
    }

    /// Exact archive length (valid after `end`).
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Archive length rounded up to whole blocks.
    pub fn block_aligned_size(&self) -> u64 {
        self.size.div_ceil(self.block_size) * self.block_size
    }

    /// The archive plus its zero tail out to the block boundary.
    pub fn buffer(&self) -> Result<&[u8]> {
        if !self.finished {
            return Err(Error::protocol("compressor output read before end"));
        }
        Ok(&self.buffer[..self.block_aligned_size() as usize])
    }
}
