//! Chunked seekable zstd codec.
//!
//! An archive is a seek-table header followed by independently-decodable
//! zstd frames.  Whole archives decode front to back; any frame-aligned
//! sub-range decodes without touching the rest, which is what the paged
//! read path depends on.
//!
//! The compressor streams: input accumulates into frames of a target size
//! chosen up front, each full frame is compressed immediately, and the
//! header is assembled once `end` fixes the total input length.

use crate::codec::seek_table::{self, SeekTable, SeekTableEntry, MAX_FRAMES};
use crate::codec::{Compress, Decompress, SeekableDecompress};
use crate::error::{Error, Result};

/// Uncompressed bytes per frame unless the input is large enough to
/// overflow the seek table at this size.
pub const TARGET_FRAME_SIZE: u64 = 128 * 1024;

/// Frame size for an input of `len` bytes: the fixed target, scaled up just
/// enough to keep the frame count under [`MAX_FRAMES`].  Frame boundaries
/// stay block-aligned so the paged read path can verify supplied ranges.
pub fn frame_size_for(len: u64, block_size: u64) -> u64 {
    let target = TARGET_FRAME_SIZE.div_ceil(block_size) * block_size;
    let min_frame = len.div_ceil(MAX_FRAMES as u64);
    target.max(min_frame.div_ceil(target) * target)
}

/// Worst-case archive size for `len` input bytes, header included.
pub fn compressed_size_upper_bound(len: u64, block_size: u64) -> u64 {
    let frame = frame_size_for(len, block_size);
    let frames = len.div_ceil(frame).max(1);
    let per_frame_bound = zstd::zstd_safe::compress_bound(frame as usize) as u64;
    seek_table::header_size(frames as u32) + frames * per_frame_bound
}

// ── Compressor ───────────────────────────────────────────────────────────────

pub struct ChunkedCompressor {
    level: i32,
    frame_size: u64,
    staging: Vec<u8>,
    /// Concatenated compressed frames (offsets fixed up at `end`).
    frames: Vec<u8>,
    sizes: Vec<(u64, u64)>,
    archive: Option<Vec<u8>>,
}

impl ChunkedCompressor {
    /// `input_len` picks the frame size; feeding more input than declared
    /// fails out-of-range once the frame count would exceed the table bound.
    pub fn new(level: i32, input_len: u64, block_size: u64) -> Self {
        Self::with_frame_size(level, frame_size_for(input_len, block_size))
    }

    /// Explicit frame size.  Frame boundaries must stay block-aligned for
    /// archives that will be served through the paged read path.
    pub fn with_frame_size(level: i32, frame_size: u64) -> Self {
        Self {
            level,
            frame_size: frame_size.max(1),
            staging: Vec::new(),
            frames: Vec::new(),
            sizes: Vec::new(),
            archive: None,
        }
    }

    fn flush_frame(&mut self, len: usize) -> Result<()> {
        if self.sizes.len() >= MAX_FRAMES as usize {
            return Err(Error::OutOfRange);
        }
        let compressed = zstd::bulk::compress(&self.staging[..len], self.level)?;
        self.sizes.push((compressed.len() as u64, len as u64));
        self.frames.extend_from_slice(&compressed);
        self.staging.drain(..len);
        Ok(())
    }

    /// The finished archive; empty slice before `end`.
    pub fn archive(&self) -> &[u8] {
        self.archive.as_deref().unwrap_or(&[])
    }

    /// Copy the finished archive into `dst`.  Fails when `dst` is smaller
    /// than the archive (callers size it by [`compressed_size_upper_bound`]).
    pub fn finish_into(&self, dst: &mut [u8]) -> Result<u64> {
        let archive = self
            .archive
            .as_deref()
            .ok_or_else(|| Error::protocol("finish_into before end"))?;
        if dst.len() < archive.len() {
            return Err(Error::BufferTooSmall {
                needed: archive.len() as u64,
                got: dst.len() as u64,
            });
        }
        dst[..archive.len()].copy_from_slice(archive);
        Ok(archive.len() as u64)
    }
}

impl Compress for ChunkedCompressor {
    fn update(&mut self, data: &[u8]) -> Result<()> {
        if self.archive.is_some() {
            return Err(Error::protocol("update after end"));
        }
        self.staging.extend_from_slice(data);
        while self.staging.len() as u64 >= self.frame_size {
            self.flush_frame(self.frame_size as usize)?;
        }
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        if self.archive.is_some() {
            return Err(Error::protocol("end called twice"));
        }
        if !self.staging.is_empty() {
            let len = self.staging.len();
            self.flush_frame(len)?;
        }

        let header_len = seek_table::header_size(self.sizes.len() as u32);
        let mut entries = Vec::with_capacity(self.sizes.len());
        let mut compressed_offset = header_len;
        let mut decompressed_offset = 0u64;
        for &(compressed, decompressed) in &self.sizes {
            entries.push(SeekTableEntry {
                compressed_offset,
                compressed_size: compressed,
                decompressed_offset,
                decompressed_size: decompressed,
            });
            compressed_offset += compressed;
            decompressed_offset += decompressed;
        }
        let table = SeekTable::new(entries)?;

        let mut archive = table.serialize()?;
        archive.extend_from_slice(&self.frames);
        self.frames = Vec::new();
        self.archive = Some(archive);
        Ok(())
    }

    fn size(&self) -> u64 {
        match &self.archive {
            Some(archive) => archive.len() as u64,
            None => self.frames.len() as u64,
        }
    }
}

// ── Decompressor ─────────────────────────────────────────────────────────────

pub struct ChunkedDecompressor {
    table: SeekTable,
}

impl ChunkedDecompressor {
    /// Parse the seek table from the front of an archive.
    pub fn new(archive_prefix: &[u8]) -> Result<Self> {
        Ok(Self { table: SeekTable::parse(archive_prefix)? })
    }

    pub fn from_table(table: SeekTable) -> Self {
        Self { table }
    }

    fn decode_frame(entry: &SeekTableEntry, src: &[u8], dst: &mut [u8]) -> Result<()> {
        let produced = zstd::bulk::decompress_to_buffer(src, dst)
            .map_err(|e| Error::corrupt(format!("frame decode failed: {e}")))?;
        if produced as u64 != entry.decompressed_size {
            return Err(Error::corrupt(format!(
                "frame at compressed offset {} produced {produced} bytes, expected {}",
                entry.compressed_offset, entry.decompressed_size
            )));
        }
        Ok(())
    }
}

impl Decompress for ChunkedDecompressor {
    fn decompress(&self, dst: &mut [u8], src: &[u8]) -> Result<u64> {
        let total = self.table.decompressed_size();
        if (dst.len() as u64) < total {
            return Err(Error::BufferTooSmall { needed: total, got: dst.len() as u64 });
        }
        if (src.len() as u64) < self.table.compressed_size() {
            return Err(Error::corrupt("archive truncated"));
        }
        for entry in self.table.entries() {
            let src_window = &src[entry.compressed_offset as usize..entry.compressed_end() as usize];
            let dst_window =
                &mut dst[entry.decompressed_offset as usize..entry.decompressed_end() as usize];
            Self::decode_frame(entry, src_window, dst_window)?;
        }
        Ok(total)
    }
}

impl SeekableDecompress for ChunkedDecompressor {
    fn seek_table(&self) -> &SeekTable {
        &self.table
    }

    fn decompress_range(
        &self,
        dst: &mut [u8],
        src: &[u8],
        decompressed_offset: u64,
    ) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let first = self
            .table
            .entry_for_decompressed_offset(decompressed_offset)
            .ok_or(Error::OutOfRange)?;
        let entries = self.table.entries();
        if entries[first].decompressed_offset != decompressed_offset {
            // Range decodes start on frame boundaries; mappings guarantee it.
            return Err(Error::OutOfRange);
        }

        let src_base = entries[first].compressed_offset;
        let mut produced = 0u64;
        let mut idx = first;
        while produced < dst.len() as u64 {
            let entry = entries.get(idx).ok_or(Error::OutOfRange)?;
            let src_start = (entry.compressed_offset - src_base) as usize;
            let src_end = src_start + entry.compressed_size as usize;
            if src_end > src.len() {
                return Err(Error::BufferTooSmall {
                    needed: src_end as u64,
                    got: src.len() as u64,
                });
            }
            let dst_end = produced + entry.decompressed_size;
            if dst_end > dst.len() as u64 {
                return Err(Error::OutOfRange);
            }
            Self::decode_frame(
                entry,
                &src[src_start..src_end],
                &mut dst[produced as usize..dst_end as usize],
            )?;
            produced = dst_end;
            idx += 1;
        }
        if produced != dst.len() as u64 {
            return Err(Error::corrupt("range decode produced fewer bytes than requested"));
        }
        Ok(())
    }
}
