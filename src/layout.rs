//! Blob block layout arithmetic.
//!
//! A blob occupies a contiguous run of fixed-size blocks holding two
//! regions: the payload ("data") and the Merkle tree bytes.  Two layouts
//! exist on disk:
//!
//! - **Padded-start**: the tree occupies whole blocks at the front,
//!   zero-padded; data starts at the next block boundary.
//! - **Compact-end**: data occupies the front; the tree is packed, unpadded,
//!   against the end of the last block and may share one block with the
//!   data tail.  The gap between data end and tree start is zero-filled.
//!
//! All arithmetic is checked; constructors are the only fallible path and
//! they fail only on overflow.  Accessors are pure functions of the stored
//! fields and never reach outside the blob's reserved run.

use crate::error::{Error, Result};
use crate::merkle;
use crate::metadata::BlobMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobLayoutFormat {
    PaddedStart,
    CompactEnd,
}

#[derive(Debug, Clone)]
pub struct BlobLayout {
    format: BlobLayoutFormat,
    file_size: u64,
    data_size: u64,
    merkle_tree_size: u64,
    block_size: u64,

    // Derived once, checked, in the constructor.
    data_block_offset: u64,
    data_block_count: u64,
    merkle_block_offset: u64,
    merkle_block_count: u64,
    total_block_count: u64,
    /// Byte offset of the first tree byte within the blob's run.
    merkle_byte_offset: u64,
}

fn round_up(value: u64, multiple: u64) -> Result<u64> {
    let rem = value % multiple;
    if rem == 0 {
        return Ok(value);
    }
    value.checked_add(multiple - rem).ok_or(Error::Overflow)
}

fn blocks_for(value: u64, block_size: u64) -> Result<u64> {
    Ok(round_up(value, block_size)? / block_size)
}

impl BlobLayout {
    /// Layout for a stored blob: `data_size` is the metadata's reserved
    /// payload span, the tree size derives from the content length.
    pub fn from_metadata(
        format: BlobLayoutFormat,
        metadata: &BlobMetadata,
        block_size: u64,
    ) -> Result<Self> {
        let file_size = metadata.blob_size();
        let tree = merkle::tree_size(file_size, block_size);
        let data_size = if metadata.is_compressed() {
            // Compressed payloads reserve every block not holding tree data;
            // the exact archive length lives in the seek table.
            let total = metadata
                .block_count()
                .checked_mul(block_size)
                .ok_or(Error::Overflow)?;
            let tree_blocks = match format {
                BlobLayoutFormat::PaddedStart => {
                    blocks_for(tree, block_size)?
                        .checked_mul(block_size)
                        .ok_or(Error::Overflow)?
                }
                BlobLayoutFormat::CompactEnd => tree,
            };
            total.checked_sub(tree_blocks).ok_or(Error::Overflow)?
        } else {
            file_size
        };
        Self::new(format, file_size, data_size, tree, block_size)
    }

    /// Layout from explicit sizes (write path, before metadata exists).
    pub fn from_sizes(
        format: BlobLayoutFormat,
        file_size: u64,
        data_size: u64,
        block_size: u64,
    ) -> Result<Self> {
        let tree = merkle::tree_size(file_size, block_size);
        Self::new(format, file_size, data_size, tree, block_size)
    }

    fn new(
        format: BlobLayoutFormat,
        file_size: u64,
        data_size: u64,
        merkle_tree_size: u64,
        block_size: u64,
    ) -> Result<Self> {
        let data_blocks = blocks_for(data_size, block_size)?;
        let (data_block_offset, merkle_block_offset, merkle_block_count, total, merkle_byte_offset) =
            match format {
                BlobLayoutFormat::PaddedStart => {
                    let tree_blocks = blocks_for(merkle_tree_size, block_size)?;
                    let total = tree_blocks.checked_add(data_blocks).ok_or(Error::Overflow)?;
                    (tree_blocks, 0, tree_blocks, total, 0)
                }
                BlobLayoutFormat::CompactEnd => {
                    let packed = data_size.checked_add(merkle_tree_size).ok_or(Error::Overflow)?;
                    let total = blocks_for(packed, block_size)?;
                    let run_bytes = total.checked_mul(block_size).ok_or(Error::Overflow)?;
                    let tree_start = run_bytes - merkle_tree_size;
                    let (tree_block, tree_blocks) = if merkle_tree_size == 0 {
                        (total, 0)
                    } else {
                        let first = tree_start / block_size;
                        (first, total - first)
                    };
                    (0, tree_block, tree_blocks, total, tree_start)
                }
            };
        Ok(Self {
            format,
            file_size,
            data_size,
            merkle_tree_size,
            block_size,
            data_block_offset,
            data_block_count: data_blocks,
            merkle_block_offset,
            merkle_block_count,
            total_block_count: total,
            merkle_byte_offset,
        })
    }

    pub fn format(&self) -> BlobLayoutFormat {
        self.format
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// On-disk payload length: equals `file_size` unless compressed.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn merkle_tree_size(&self) -> u64 {
        self.merkle_tree_size
    }

    pub fn data_block_aligned_size(&self) -> u64 {
        self.data_block_count * self.block_size
    }

    /// First block of the data region, relative to the blob's run.
    pub fn data_block_offset(&self) -> u64 {
        self.data_block_offset
    }

    pub fn data_block_count(&self) -> u64 {
        self.data_block_count
    }

    /// First block containing tree bytes, relative to the blob's run.
    /// Meaningless when `merkle_tree_size` is zero.
    pub fn merkle_block_offset(&self) -> u64 {
        self.merkle_block_offset
    }

    pub fn merkle_block_count(&self) -> u64 {
        self.merkle_block_count
    }

    /// Byte offset of the first tree byte within the blob's run.
    pub fn merkle_byte_offset(&self) -> u64 {
        self.merkle_byte_offset
    }

    pub fn total_block_count(&self) -> u64 {
        self.total_block_count
    }

    /// True when the data tail and the tree head occupy the same block
    /// (possible only in the compact-end format).
    pub fn has_shared_block(&self) -> bool {
        self.format == BlobLayoutFormat::CompactEnd
            && self.data_size > 0
            && self.merkle_tree_size > 0
            && self.merkle_block_offset < self.data_block_count
    }
}
