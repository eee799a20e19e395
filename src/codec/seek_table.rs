//! Seek table: the archive header indexing independently-decodable frames.
//!
//! # On-disk header
//!
//! All fields little-endian, at the start of every chunked archive:
//!
//! | offset | size | field                          |
//! |--------|------|--------------------------------|
//! | 0      | 4    | magic `"CSKA"`                 |
//! | 4      | 4    | version (currently 1)          |
//! | 8      | 4    | frame count                    |
//! | 12     | 4    | CRC32 of the entry bytes       |
//! | 16     | 32×n | frame entries                  |
//!
//! Each entry holds `(compressed_offset, compressed_size,
//! decompressed_offset, decompressed_size)` as four `u64`s.  Compressed
//! offsets are absolute within the archive, so entry 0 starts right after
//! the header.  Frames follow the header concatenated, in entry order.
//!
//! The header is bounded: at most [`MAX_FRAMES`] entries, which keeps it
//! inside a small fixed multiple of the storage block size.  Corruption of
//! any kind (bad magic, bad CRC, non-monotonic or non-contiguous entries)
//! is a data-integrity error, never a crash.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::{Error, Result};

pub const SEEK_TABLE_MAGIC: u32 = u32::from_le_bytes(*b"CSKA");
pub const SEEK_TABLE_VERSION: u32 = 1;
pub const HEADER_FIXED_SIZE: u64 = 16;
pub const ENTRY_SIZE: u64 = 32;
/// Caps the header at 4 blocks of 8 KiB.
pub const MAX_FRAMES: u32 = 1023;

/// Total header length for an archive of `frame_count` frames.
pub fn header_size(frame_count: u32) -> u64 {
    HEADER_FIXED_SIZE + frame_count as u64 * ENTRY_SIZE
}

/// Upper bound of any valid header, independent of frame count.
pub fn max_header_size() -> u64 {
    header_size(MAX_FRAMES)
}

// ── Entries ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekTableEntry {
    pub compressed_offset: u64,
    pub compressed_size: u64,
    pub decompressed_offset: u64,
    pub decompressed_size: u64,
}

impl SeekTableEntry {
    pub fn compressed_end(&self) -> u64 {
        self.compressed_offset + self.compressed_size
    }

    pub fn decompressed_end(&self) -> u64 {
        self.decompressed_offset + self.decompressed_size
    }

    fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_u64::<LittleEndian>(self.compressed_offset)?;
        writer.write_u64::<LittleEndian>(self.compressed_size)?;
        writer.write_u64::<LittleEndian>(self.decompressed_offset)?;
        writer.write_u64::<LittleEndian>(self.decompressed_size)?;
        Ok(())
    }

    fn read<R: Read>(mut reader: R) -> std::io::Result<Self> {
        Ok(Self {
            compressed_offset: reader.read_u64::<LittleEndian>()?,
            compressed_size: reader.read_u64::<LittleEndian>()?,
            decompressed_offset: reader.read_u64::<LittleEndian>()?,
            decompressed_size: reader.read_u64::<LittleEndian>()?,
        })
    }
}

/// The frame run covering a decompressed range.  Produced on demand by
/// [`SeekTable::mapping_for_range`]; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionMapping {
    pub compressed_offset: u64,
    pub compressed_length: u64,
    pub decompressed_offset: u64,
    pub decompressed_length: u64,
}

// ── SeekTable ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SeekTable {
    entries: Vec<SeekTableEntry>,
}

impl SeekTable {
    /// Build a table from in-order entries, validating the format
    /// invariants: both coordinate spaces contiguous and strictly
    /// increasing, decompressed space starting at zero.  The compressed
    /// offset of entry 0 is the header size.
    pub fn new(entries: Vec<SeekTableEntry>) -> Result<Self> {
        if let Some(first) = entries.first() {
            if first.decompressed_offset != 0 {
                return Err(Error::corrupt("seek table does not start at decompressed offset 0"));
            }
        }
        for e in &entries {
            if e.compressed_size == 0 || e.decompressed_size == 0 {
                return Err(Error::corrupt("seek table contains an empty frame"));
            }
            if e.compressed_offset.checked_add(e.compressed_size).is_none()
                || e.decompressed_offset.checked_add(e.decompressed_size).is_none()
            {
                return Err(Error::corrupt("seek table entry overflows"));
            }
        }
        for (i, pair) in entries.windows(2).enumerate() {
            let (a, b) = (&pair[0], &pair[1]);
            if b.compressed_offset != a.compressed_end()
                || b.decompressed_offset != a.decompressed_end()
            {
                return Err(Error::corrupt(format!(
                    "seek table entries {i} and {} are not contiguous",
                    i + 1
                )));
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[SeekTableEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total archive length, header included.
    pub fn compressed_size(&self) -> u64 {
        self.entries
            .last()
            .map(SeekTableEntry::compressed_end)
            .unwrap_or_else(|| header_size(0))
    }

    pub fn decompressed_size(&self) -> u64 {
        self.entries.last().map(SeekTableEntry::decompressed_end).unwrap_or(0)
    }

    /// Largest single-frame decompressed size.
    pub fn max_frame_decompressed_size(&self) -> u64 {
        self.entries.iter().map(|e| e.decompressed_size).max().unwrap_or(0)
    }

    /// Index of the entry whose decompressed span contains `offset`.
    pub fn entry_for_decompressed_offset(&self, offset: u64) -> Option<usize> {
        if offset >= self.decompressed_size() {
            return None;
        }
        // First entry ending past `offset`.
        let idx = self.entries.partition_point(|e| e.decompressed_end() <= offset);
        (idx < self.entries.len()).then_some(idx)
    }

    /// Smallest entry run covering `[offset, offset + length)`.
    ///
    /// When the natural run's decompressed total exceeds
    /// `max_decompressed_len`, walks backward from the entry containing
    /// `offset + max_decompressed_len - 1` to the widest run that still
    /// fits, returning a smaller but still valid mapping.  Fails
    /// out-of-range when not even the first entry fits, and with a
    /// data-integrity error when the walk shows offsets decreasing where
    /// the format requires them to increase.
    pub fn mapping_for_range(
        &self,
        offset: u64,
        length: u64,
        max_decompressed_len: u64,
    ) -> Result<CompressionMapping> {
        if length == 0 || max_decompressed_len == 0 {
            return Err(Error::OutOfRange);
        }
        let end = offset.checked_add(length).ok_or(Error::OutOfRange)?;
        let first = self.entry_for_decompressed_offset(offset).ok_or(Error::OutOfRange)?;
        let mut last = self.entry_for_decompressed_offset(end - 1).ok_or(Error::OutOfRange)?;

        let start_offset = self.entries[first].decompressed_offset;
        let natural = self.entries[last]
            .decompressed_end()
            .checked_sub(start_offset)
            .ok_or_else(|| Error::corrupt("seek table decompressed offsets decrease"))?;

        if natural > max_decompressed_len {
            let cap = offset.checked_add(max_decompressed_len).ok_or(Error::OutOfRange)?;
            let mut idx = self.entry_for_decompressed_offset(cap - 1).unwrap_or(last).min(last);
            loop {
                let span = self.entries[idx]
                    .decompressed_end()
                    .checked_sub(start_offset)
                    .ok_or_else(|| Error::corrupt("seek table decompressed offsets decrease"))?;
                if span <= max_decompressed_len {
                    last = idx;
                    break;
                }
                if idx == first {
                    // Even one frame exceeds the bound.
                    return Err(Error::OutOfRange);
                }
                idx -= 1;
            }
        }

        let (f, l) = (&self.entries[first], &self.entries[last]);
        Ok(CompressionMapping {
            compressed_offset: f.compressed_offset,
            compressed_length: l
                .compressed_end()
                .checked_sub(f.compressed_offset)
                .ok_or_else(|| Error::corrupt("seek table compressed offsets decrease"))?,
            decompressed_offset: f.decompressed_offset,
            decompressed_length: l
                .decompressed_end()
                .checked_sub(f.decompressed_offset)
                .ok_or_else(|| Error::corrupt("seek table decompressed offsets decrease"))?,
        })
    }

    // ── Header serialization ─────────────────────────────────────────────────

    /// Serialize the header (magic through entries).
    pub fn serialize(&self) -> Result<Vec<u8>> {
        if self.entries.len() > MAX_FRAMES as usize {
            return Err(Error::OutOfRange);
        }
        let mut entry_bytes = Vec::with_capacity(self.entries.len() * ENTRY_SIZE as usize);
        for entry in &self.entries {
            entry.write(&mut entry_bytes)?;
        }
        let mut hasher = Hasher::new();
        hasher.update(&entry_bytes);

        let mut out = Vec::with_capacity(header_size(self.entries.len() as u32) as usize);
        out.write_u32::<LittleEndian>(SEEK_TABLE_MAGIC)?;
        out.write_u32::<LittleEndian>(SEEK_TABLE_VERSION)?;
        out.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        out.write_u32::<LittleEndian>(hasher.finalize())?;
        out.extend_from_slice(&entry_bytes);
        Ok(out)
    }

    /// Parse a header from the front of `src`.  `src` only needs to hold
    /// the header, not the whole archive.
    pub fn parse(src: &[u8]) -> Result<Self> {
        if (src.len() as u64) < HEADER_FIXED_SIZE {
            return Err(Error::corrupt("archive shorter than the seek table header"));
        }
        let mut cursor = Cursor::new(src);
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != SEEK_TABLE_MAGIC {
            return Err(Error::corrupt(format!("bad seek table magic {magic:#010x}")));
        }
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != SEEK_TABLE_VERSION {
            return Err(Error::corrupt(format!("unsupported seek table version {version}")));
        }
        let count = cursor.read_u32::<LittleEndian>()?;
        if count > MAX_FRAMES {
            return Err(Error::corrupt(format!("seek table declares {count} frames")));
        }
        let stored_crc = cursor.read_u32::<LittleEndian>()?;

        let entries_len = count as u64 * ENTRY_SIZE;
        if (src.len() as u64) < HEADER_FIXED_SIZE + entries_len {
            return Err(Error::corrupt("seek table entries truncated"));
        }
        let entry_bytes =
            &src[HEADER_FIXED_SIZE as usize..(HEADER_FIXED_SIZE + entries_len) as usize];
        let mut hasher = Hasher::new();
        hasher.update(entry_bytes);
        if hasher.finalize() != stored_crc {
            return Err(Error::corrupt("seek table checksum mismatch"));
        }

        let mut entries = Vec::with_capacity(count as usize);
        let mut cursor = Cursor::new(entry_bytes);
        for _ in 0..count {
            entries.push(SeekTableEntry::read(&mut cursor)?);
        }
        if let Some(first) = entries.first() {
            if first.compressed_offset != header_size(count) {
                return Err(Error::corrupt("first frame does not follow the header"));
            }
        }
        Self::new(entries)
    }
}
