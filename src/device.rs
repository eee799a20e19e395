//! Block device seam.
//!
//! The allocator, bitmap, and journal live outside this crate; the loader
//! and writer only need block-granular reads and writes against a blob's
//! reserved run.

use parking_lot::Mutex;

use crate::error::{Error, Result};

pub const DEFAULT_BLOCK_SIZE: u64 = 8192;

pub trait BlockDevice: Send + Sync {
    fn block_size(&self) -> u64;

    fn block_count(&self) -> u64;

    /// Read whole blocks starting at `block_offset`.  `dest` length must be
    /// a multiple of the block size.
    fn read_blocks(&self, block_offset: u64, dest: &mut [u8]) -> Result<()>;

    /// Write whole blocks starting at `block_offset`.  `src` length must be
    /// a multiple of the block size.
    fn write_blocks(&self, block_offset: u64, src: &[u8]) -> Result<()>;
}

// ── In-memory device ─────────────────────────────────────────────────────────

/// RAM-backed device used by tests and by callers staging blobs before
/// hand-off to real storage.
pub struct MemoryBlockDevice {
    block_size: u64,
    block_count: u64,
    data: Mutex<Vec<u8>>,
}

impl MemoryBlockDevice {
    pub fn new(block_size: u64, block_count: u64) -> Self {
        Self {
            block_size,
            block_count,
            data: Mutex::new(vec![0u8; (block_size * block_count) as usize]),
        }
    }

    fn span(&self, block_offset: u64, len: usize) -> Result<std::ops::Range<usize>> {
        if len as u64 % self.block_size != 0 {
            return Err(Error::protocol(format!(
                "buffer of {len} bytes is not block-aligned"
            )));
        }
        let start = block_offset
            .checked_mul(self.block_size)
            .ok_or(Error::Overflow)?;
        let end = start.checked_add(len as u64).ok_or(Error::Overflow)?;
        if end > self.block_size * self.block_count {
            return Err(Error::OutOfRange);
        }
        Ok(start as usize..end as usize)
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_blocks(&self, block_offset: u64, dest: &mut [u8]) -> Result<()> {
        let span = self.span(block_offset, dest.len())?;
        dest.copy_from_slice(&self.data.lock()[span]);
        Ok(())
    }

    fn write_blocks(&self, block_offset: u64, src: &[u8]) -> Result<()> {
        let span = self.span(block_offset, src.len())?;
        self.data.lock()[span].copy_from_slice(src);
        Ok(())
    }
}
