//! Streaming decode of a chunked archive as its bytes arrive.
//!
//! Used while a compressed blob is still being written: compressed bytes
//! are appended as they land, every seek-table entry that becomes complete
//! is decoded through the decompression service, and the decoded bytes are
//! handed to the caller's sink in seek-table order.  Consumed input pages
//! are decommitted so resident memory stays bounded by the undecoded
//! suffix, not the archive.

use tracing::debug;

use crate::buffer::ScratchBuffer;
use crate::codec::seek_table::SeekTable;
use crate::error::{Error, Result};
use crate::sandbox::client::DecompressionService;
use crate::sandbox::{AlgorithmTag, ByteRange, DecompressRequest};

/// Receives each decoded frame, synchronously, in increasing offset order.
pub trait FrameSink {
    fn frame(&mut self, bytes: &[u8]) -> Result<()>;
}

impl<F: FnMut(&[u8]) -> Result<()>> FrameSink for F {
    fn frame(&mut self, bytes: &[u8]) -> Result<()> {
        self(bytes)
    }
}

pub struct StreamingChunkedDecompressor<'a> {
    table: SeekTable,
    service: Box<dyn DecompressionService + 'a>,
    sink: Box<dyn FrameSink + 'a>,
    /// Compressed bytes appended so far (header bytes included).
    compressed_bytes: u64,
    /// First seek-table entry not yet decoded.
    curr_entry: usize,
    /// Sized to the archive's total compressed size; the consumed prefix is
    /// decommitted as decoding advances.
    compressed: ScratchBuffer,
    decommitted: usize,
    frame_buf: Vec<u8>,
}

impl<'a> StreamingChunkedDecompressor<'a> {
    pub fn new(
        table: SeekTable,
        service: Box<dyn DecompressionService + 'a>,
        sink: Box<dyn FrameSink + 'a>,
    ) -> Result<Self> {
        if service.decompressed_capacity() < table.max_frame_decompressed_size()
            || service.compressed_capacity()
                < table.entries().iter().map(|e| e.compressed_size).max().unwrap_or(0)
        {
            return Err(Error::protocol("service regions too small for this archive"));
        }
        let mut this = Self {
            compressed: ScratchBuffer::new(table.compressed_size() as usize)?,
            table,
            service,
            sink,
            compressed_bytes: 0,
            curr_entry: 0,
            decommitted: 0,
            frame_buf: Vec::new(),
        };
        if this.table.is_empty() {
            this.release();
        }
        Ok(this)
    }

    fn drained(&self) -> bool {
        self.curr_entry == self.table.entries().len()
    }

    fn release(&mut self) {
        self.compressed.release();
        self.frame_buf = Vec::new();
    }

    /// Append compressed bytes.  Fails out-of-range when the append would
    /// exceed the archive's declared compressed size or the table is
    /// already fully consumed.  Decode or sink failures propagate without
    /// consuming further entries.
    pub fn update(&mut self, chunk: &[u8]) -> Result<()> {
        if self.drained() {
            return Err(Error::OutOfRange);
        }
        let end = self
            .compressed_bytes
            .checked_add(chunk.len() as u64)
            .ok_or(Error::OutOfRange)?;
        if end > self.table.compressed_size() {
            return Err(Error::OutOfRange);
        }
        let start = self.compressed_bytes as usize;
        self.compressed.as_mut_slice()[start..start + chunk.len()].copy_from_slice(chunk);
        self.compressed_bytes = end;

        // Decode every leading entry whose bytes are now complete.
        while !self.drained() {
            let entry = self.table.entries()[self.curr_entry];
            if entry.compressed_end() > self.compressed_bytes {
                break;
            }
            let src = &self.compressed.as_slice()
                [entry.compressed_offset as usize..entry.compressed_end() as usize];
            self.service.write_compressed(0, src)?;
            let request = DecompressRequest {
                decompressed: ByteRange::new(0, entry.decompressed_size),
                compressed: ByteRange::new(0, entry.compressed_size),
                algorithm: AlgorithmTag::ChunkedFrame,
            };
            self.service.decompress(&request)?;
            self.frame_buf.resize(entry.decompressed_size as usize, 0);
            self.service.read_decompressed(0, &mut self.frame_buf)?;
            self.sink.frame(&self.frame_buf)?;
            self.curr_entry += 1;
        }

        if self.drained() {
            debug!(decoded = self.table.entries().len(), "streaming decode complete");
            self.release();
        } else {
            let consumed = self.table.entries()[self.curr_entry].compressed_offset as usize;
            self.compressed.decommit(self.decommitted, consumed)?;
            self.decommitted = consumed.max(self.decommitted);
        }
        Ok(())
    }
}
