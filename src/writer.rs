//! Blob write pipeline.
//!
//! Writing a blob is: build the Merkle tree over the content, compress the
//! payload when that actually saves blocks, compose producers matching the
//! chosen layout, then stream block-aligned writes to the device.  The
//! allocator is external; the caller names the reserved block run.

use tracing::debug;

use crate::compressor::BlobCompressor;
use crate::codec::CompressionAlgorithm;
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::layout::{BlobLayout, BlobLayoutFormat};
use crate::merkle::MerkleTreeCreator;
use crate::metadata::BlobMetadata;
use crate::producer::{BlobDataProducer, MergeBlobDataProducer, SimpleBlobDataProducer};

/// Blocks pulled per producer round.
const WRITE_CHUNK_BLOCKS: u64 = 16;

pub struct BlobWriter<'d> {
    device: &'d dyn BlockDevice,
    format: BlobLayoutFormat,
    algorithm: Option<CompressionAlgorithm>,
}

impl<'d> BlobWriter<'d> {
    pub fn new(
        device: &'d dyn BlockDevice,
        format: BlobLayoutFormat,
        algorithm: Option<CompressionAlgorithm>,
    ) -> Self {
        Self { device, format, algorithm }
    }

    /// Write `data` as one blob into the run starting at `start_block`.
    /// Returns the write-once metadata record.
    pub fn write_blob(&self, start_block: u64, data: &[u8]) -> Result<BlobMetadata> {
        let block_size = self.device.block_size();

        let mut creator = MerkleTreeCreator::new(block_size);
        creator.update(data);
        let (root, tree) = creator.finish();

        // Compress only when it saves at least one block; otherwise store raw.
        let compressed = match self.algorithm {
            Some(algorithm) if !data.is_empty() => {
                let mut compressor =
                    BlobCompressor::new(algorithm, data.len() as u64, block_size)?;
                compressor.update(data)?;
                compressor.end()?;
                let raw_blocks = (data.len() as u64).div_ceil(block_size);
                if compressor.block_aligned_size() / block_size < raw_blocks {
                    Some(compressor)
                } else {
                    None
                }
            }
            _ => None,
        };

        let (payload, flags): (&[u8], u32) = match &compressed {
            Some(compressor) => (compressor.buffer()?, compressor.algorithm_flag()),
            None => (data, 0),
        };

        let layout =
            BlobLayout::from_sizes(self.format, data.len() as u64, payload.len() as u64, block_size)?;
        let total_blocks = layout.total_block_count();
        let run_end = start_block.checked_add(total_blocks).ok_or(Error::Overflow)?;
        if run_end > self.device.block_count() {
            return Err(Error::OutOfRange);
        }

        match self.format {
            BlobLayoutFormat::PaddedStart => {
                // Tree first, zero-padded to whole blocks; data after.
                let mut tree_producer = SimpleBlobDataProducer::new(&tree);
                self.drive(&mut tree_producer, start_block)?;
                let mut data_producer = SimpleBlobDataProducer::new(payload);
                self.drive(&mut data_producer, start_block + layout.data_block_offset())?;
            }
            BlobLayoutFormat::CompactEnd => {
                // Data first, then the zero gap, then the tree packed
                // against the end of the last block.
                let padding = if tree.is_empty() {
                    0
                } else {
                    layout.merkle_byte_offset() - layout.data_size()
                };
                let mut producer = MergeBlobDataProducer::new(
                    Box::new(SimpleBlobDataProducer::new(payload)),
                    Box::new(SimpleBlobDataProducer::new(&tree)),
                    padding,
                    block_size,
                )?;
                self.drive(&mut producer, start_block)?;
            }
        }

        debug!(
            root = %root,
            blocks = total_blocks,
            compressed = compressed.is_some(),
            "blob written"
        );
        BlobMetadata::new(data.len() as u64, total_blocks, flags, root)
    }

    /// Pull the producer dry, writing whole blocks; the final partial block
    /// is zero-padded.  The producer's output is copied into the write
    /// buffer immediately, so `needs_flush` is always satisfied.
    fn drive(&self, producer: &mut dyn BlobDataProducer, start_block: u64) -> Result<()> {
        let block_size = self.device.block_size();
        let chunk = block_size * WRITE_CHUNK_BLOCKS;
        let mut pending: Vec<u8> = Vec::with_capacity(chunk as usize);
        let mut block_cursor = start_block;

        while producer.remaining() > 0 || !pending.is_empty() {
            if producer.remaining() > 0 {
                let bytes = producer.consume(chunk)?;
                pending.extend_from_slice(bytes);
            }
            let exhausted = producer.remaining() == 0;
            let writable = if exhausted {
                // Zero-pad the tail out to the block boundary.
                let padded = pending.len().div_ceil(block_size as usize) * block_size as usize;
                pending.resize(padded, 0);
                pending.len()
            } else {
                pending.len() / block_size as usize * block_size as usize
            };
            if writable > 0 {
                self.device.write_blocks(block_cursor, &pending[..writable])?;
                block_cursor += writable as u64 / block_size;
                pending.drain(..writable);
            }
            if exhausted && pending.is_empty() {
                break;
            }
        }
        Ok(())
    }
}
