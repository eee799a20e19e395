//! Pull-based byte sources for the blob write path.
//!
//! When a blob is written, its on-disk bytes may come from several places:
//! the caller's buffer, zero padding between regions, or a decompression
//! stream when a compressed blob is re-encoded as raw bytes.  Producers
//! materialize those bytes lazily so the writer never builds the whole
//! image in memory.
//!
//! # Contract
//!
//! - `remaining` is the exact count of bytes not yet produced.
//! - `consume(max)` returns up to `max` bytes and advances the cursor.  The
//!   returned slice lives until the next `consume` call at the earliest.
//! - `needs_flush` is true when the next `consume` call will invalidate
//!   previously returned bytes; the caller must durably write prior output
//!   before calling again.

use crate::codec::SeekableDecompress;
use crate::error::{Error, Result};

pub trait BlobDataProducer {
    fn remaining(&self) -> u64;

    fn consume(&mut self, max: u64) -> Result<&[u8]>;

    fn needs_flush(&self) -> bool {
        false
    }
}

// ── Simple producer ──────────────────────────────────────────────────────────

/// Wraps a fixed byte span; `consume` is a pure sub-slice.
pub struct SimpleBlobDataProducer<'a> {
    data: &'a [u8],
}

impl<'a> SimpleBlobDataProducer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl BlobDataProducer for SimpleBlobDataProducer<'_> {
    fn remaining(&self) -> u64 {
        self.data.len() as u64
    }

    fn consume(&mut self, max: u64) -> Result<&[u8]> {
        let n = (max as usize).min(self.data.len());
        let data = std::mem::take(&mut self.data);
        let (head, rest) = data.split_at(n);
        self.data = rest;
        Ok(head)
    }
}

// ── Merge producer ───────────────────────────────────────────────────────────

/// Concatenates two producers with `padding` zero bytes injected between
/// them.  `padding` is strictly less than one block.
///
/// While the first producer still has bytes, each `consume` drains it;
/// when the draining call ends off a block boundary, padding zeros are
/// appended and, if the block is still short, the remainder is pulled from
/// the second producer's front.  Once the first producer is exhausted,
/// later calls drain the second, prepending any padding not yet emitted.
pub struct MergeBlobDataProducer<'a> {
    first: Box<dyn BlobDataProducer + 'a>,
    second: Box<dyn BlobDataProducer + 'a>,
    padding_remaining: u64,
    block_size: u64,
    scratch: Vec<u8>,
    used_scratch: bool,
}

impl<'a> MergeBlobDataProducer<'a> {
    pub fn new(
        first: Box<dyn BlobDataProducer + 'a>,
        second: Box<dyn BlobDataProducer + 'a>,
        padding: u64,
        block_size: u64,
    ) -> Result<Self> {
        if padding >= block_size {
            return Err(Error::protocol(format!(
                "inter-producer padding {padding} must stay under one block"
            )));
        }
        Ok(Self {
            first,
            second,
            padding_remaining: padding,
            block_size,
            scratch: Vec::new(),
            used_scratch: false,
        })
    }
}

impl BlobDataProducer for MergeBlobDataProducer<'_> {
    fn remaining(&self) -> u64 {
        self.first.remaining() + self.padding_remaining + self.second.remaining()
    }

    fn consume(&mut self, max: u64) -> Result<&[u8]> {
        if max == 0 {
            return Ok(&[]);
        }

        if self.first.remaining() > 0 {
            if self.first.remaining() > max {
                self.used_scratch = false;
                return self.first.consume(max);
            }

            // This call drains the first producer; stitch its tail, the
            // padding, and the head of the second into one block.
            self.scratch.clear();
            self.used_scratch = true;
            {
                let chunk = self.first.consume(max)?;
                self.scratch.extend_from_slice(chunk);
            }
            if self.first.remaining() > 0 {
                // Inner producer returned short; keep draining next call.
                return Ok(&self.scratch);
            }

            let tail = self.scratch.len() as u64 % self.block_size;
            if tail != 0 {
                let budget = max - self.scratch.len() as u64;
                let pad = self.padding_remaining.min(self.block_size - tail).min(budget);
                self.scratch.resize(self.scratch.len() + pad as usize, 0);
                self.padding_remaining -= pad;

                let tail = self.scratch.len() as u64 % self.block_size;
                if tail != 0 && self.padding_remaining == 0 {
                    let want = (self.block_size - tail)
                        .min(max - self.scratch.len() as u64)
                        .min(self.second.remaining());
                    if want > 0 {
                        let chunk = self.second.consume(want)?;
                        self.scratch.extend_from_slice(chunk);
                    }
                }
            }
            return Ok(&self.scratch);
        }

        if self.padding_remaining > 0 {
            // First call into the second producer: lead with the padding.
            self.scratch.clear();
            self.used_scratch = true;
            let pad = self.padding_remaining.min(max);
            self.scratch.resize(pad as usize, 0);
            self.padding_remaining -= pad;
            let want = (max - pad).min(self.second.remaining());
            if want > 0 {
                let chunk = self.second.consume(want)?;
                self.scratch.extend_from_slice(chunk);
            }
            return Ok(&self.scratch);
        }

        self.used_scratch = false;
        self.second.consume(max)
    }

    fn needs_flush(&self) -> bool {
        self.used_scratch || self.first.needs_flush() || self.second.needs_flush()
    }
}

// ── Decompress producer ──────────────────────────────────────────────────────

/// Serves a compressed blob's raw bytes by decompressing one mapped range
/// at a time into a fixed scratch buffer sized to the largest frame.
pub struct DecompressBlobDataProducer<'a> {
    decompressor: &'a dyn SeekableDecompress,
    archive: &'a [u8],
    scratch: Vec<u8>,
    scratch_start: usize,
    scratch_len: usize,
    next_offset: u64,
    total_size: u64,
}

impl<'a> DecompressBlobDataProducer<'a> {
    pub fn new(
        decompressor: &'a dyn SeekableDecompress,
        archive: &'a [u8],
        block_size: u64,
    ) -> Result<Self> {
        let table = decompressor.seek_table();
        if (archive.len() as u64) < table.compressed_size() {
            return Err(Error::corrupt("archive shorter than its seek table declares"));
        }
        let scratch_size =
            table.max_frame_decompressed_size().div_ceil(block_size).max(1) * block_size;
        Ok(Self {
            decompressor,
            archive,
            scratch: vec![0u8; scratch_size as usize],
            scratch_start: 0,
            scratch_len: 0,
            next_offset: 0,
            total_size: table.decompressed_size(),
        })
    }
}

impl BlobDataProducer for DecompressBlobDataProducer<'_> {
    fn remaining(&self) -> u64 {
        self.total_size - self.next_offset + (self.scratch_len - self.scratch_start) as u64
    }

    fn consume(&mut self, max: u64) -> Result<&[u8]> {
        if max == 0 {
            return Ok(&[]);
        }
        if self.scratch_start >= self.scratch_len {
            if self.next_offset >= self.total_size {
                return Ok(&[]);
            }
            let want = max.min(self.total_size - self.next_offset);
            let mapping = self.decompressor.mapping_for_decompressed_range(
                self.next_offset,
                want,
                self.scratch.len() as u64,
            )?;
            let src = &self.archive[mapping.compressed_offset as usize
                ..(mapping.compressed_offset + mapping.compressed_length) as usize];
            self.decompressor.decompress_range(
                &mut self.scratch[..mapping.decompressed_length as usize],
                src,
                mapping.decompressed_offset,
            )?;
            self.scratch_start = 0;
            self.scratch_len = mapping.decompressed_length as usize;
            self.next_offset = mapping.decompressed_offset + mapping.decompressed_length;
        }

        let n = (max as usize).min(self.scratch_len - self.scratch_start);
        let out = &self.scratch[self.scratch_start..self.scratch_start + n];
        self.scratch_start += n;
        Ok(out)
    }

    fn needs_flush(&self) -> bool {
        self.scratch_len > 0
            && self.scratch_start >= self.scratch_len
            && self.next_offset < self.total_size
    }
}
