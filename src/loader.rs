//! Blob loading: eager and demand-paged read paths.
//!
//! `load_blob` materializes and verifies a whole blob in memory.
//! `load_blob_paged` defers nearly all I/O and CPU work: it loads only the
//! Merkle tree and the archive's seek-table prefix, then hands a
//! [`PageSupplier`] to the caller's page-fault machinery; each `supply`
//! call decompresses and verifies just the faulted range.
//!
//! Corruption found anywhere on either path is reported to the caller's
//! notifier (when present) before the error surfaces; nothing is repaired.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::chunked::ChunkedDecompressor;
use crate::codec::seek_table::{self, SeekTable};
use crate::codec::{Decompress, SeekableDecompress};
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::layout::{BlobLayout, BlobLayoutFormat};
use crate::merkle::{Digest, MerkleTreeVerifier, TreeVerifier};
use crate::metadata::{BlobMetadata, CompressedFormat};
use crate::sandbox::client::{
    DecompressionService, LocalDecompressionService, PathConnector, RemoteDecompressionService,
};
use crate::sandbox::{AlgorithmTag, ByteRange, DecompressRequest};

/// Told about every data-integrity failure before it surfaces, so the
/// owner can evict or quarantine the blob.
pub trait CorruptionNotifier: Send + Sync {
    fn blob_corrupt(&self, root: &Digest);
}

/// Creates one decompression service per load, sized for that blob.  The
/// remote implementation reaches the sandbox process; the local one runs
/// in-process.
pub trait DecompressionServiceProvider: Send + Sync {
    fn create(
        &self,
        compressed_capacity: u64,
        decompressed_capacity: u64,
    ) -> Result<Box<dyn DecompressionService>>;
}

/// In-process decompression, for configurations without a sandbox.
pub struct LocalServiceProvider;

impl DecompressionServiceProvider for LocalServiceProvider {
    fn create(
        &self,
        compressed_capacity: u64,
        decompressed_capacity: u64,
    ) -> Result<Box<dyn DecompressionService>> {
        Ok(Box::new(LocalDecompressionService::new(compressed_capacity, decompressed_capacity)))
    }
}

/// Reaches an isolated decompressor process listening on a socket.
pub struct RemoteServiceProvider {
    socket_path: PathBuf,
}

impl RemoteServiceProvider {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self { socket_path: socket_path.into() }
    }
}

impl DecompressionServiceProvider for RemoteServiceProvider {
    fn create(
        &self,
        compressed_capacity: u64,
        decompressed_capacity: u64,
    ) -> Result<Box<dyn DecompressionService>> {
        Ok(Box::new(RemoteDecompressionService::new(
            Box::new(PathConnector::new(&self.socket_path)),
            compressed_capacity,
            decompressed_capacity,
        )?))
    }
}

#[derive(Debug)]
pub struct LoadedBlob {
    /// Block-aligned content buffer; bytes past `file_size` are zero.
    pub data: Vec<u8>,
    pub file_size: u64,
    /// Tree bytes, present when the tree is non-degenerate.
    pub merkle: Option<Vec<u8>>,
}

pub struct BlobLoader {
    device: Arc<dyn BlockDevice>,
    format: BlobLayoutFormat,
    sandbox: Option<Arc<dyn DecompressionServiceProvider>>,
}

impl BlobLoader {
    pub fn new(
        device: Arc<dyn BlockDevice>,
        format: BlobLayoutFormat,
        sandbox: Option<Arc<dyn DecompressionServiceProvider>>,
    ) -> Self {
        Self { device, format, sandbox }
    }

    fn report<T>(
        &self,
        result: Result<T>,
        root: &Digest,
        notifier: Option<&dyn CorruptionNotifier>,
    ) -> Result<T> {
        if let Err(err) = &result {
            if err.is_corruption() {
                warn!(root = %root, "blob failed integrity checks: {err}");
                if let Some(notifier) = notifier {
                    notifier.blob_corrupt(root);
                }
            }
        }
        result
    }

    /// Load tree bytes (when any) and build the verifier.
    fn load_verifier(
        &self,
        metadata: &BlobMetadata,
        layout: &BlobLayout,
        start_block: u64,
    ) -> Result<(MerkleTreeVerifier, Option<Vec<u8>>)> {
        let block_size = self.device.block_size();
        let root = *metadata.merkle_root();
        if layout.merkle_tree_size() == 0 {
            return Ok((
                MerkleTreeVerifier::from_root(root, layout.file_size(), block_size)?,
                None,
            ));
        }
        let mut buf = vec![0u8; (layout.merkle_block_count() * block_size) as usize];
        self.device
            .read_blocks(start_block + layout.merkle_block_offset(), &mut buf)?;
        let skip = (layout.merkle_byte_offset() - layout.merkle_block_offset() * block_size) as usize;
        let tree = buf[skip..skip + layout.merkle_tree_size() as usize].to_vec();
        let verifier =
            MerkleTreeVerifier::from_tree(root, &tree, layout.file_size(), block_size)?;
        Ok((verifier, Some(tree)))
    }

    fn read_data(&self, layout: &BlobLayout, start_block: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; layout.data_block_aligned_size() as usize];
        self.device
            .read_blocks(start_block + layout.data_block_offset(), &mut buf)?;
        Ok(buf)
    }

    /// The declared data span past its true payload must be zero.  `from`
    /// is the first byte past the payload; the window ends where tree bytes
    /// begin when the tail block is shared.
    fn check_zero_tail(&self, layout: &BlobLayout, data: &[u8], from: u64) -> Result<()> {
        let end = if layout.has_shared_block() {
            (layout.merkle_byte_offset() - layout.data_block_offset() * layout.block_size())
                .min(data.len() as u64)
        } else {
            data.len() as u64
        };
        if from > end {
            return Err(Error::corrupt("payload overruns its declared span"));
        }
        if data[from as usize..end as usize].iter().any(|&b| b != 0) {
            return Err(Error::corrupt("non-zero bytes in zero-padded tail"));
        }
        Ok(())
    }

    // ── Eager path ───────────────────────────────────────────────────────────

    pub fn load_blob(
        &self,
        metadata: &BlobMetadata,
        start_block: u64,
        notifier: Option<&dyn CorruptionNotifier>,
    ) -> Result<LoadedBlob> {
        let root = *metadata.merkle_root();
        let result = self.load_blob_inner(metadata, start_block);
        self.report(result, &root, notifier)
    }

    fn load_blob_inner(&self, metadata: &BlobMetadata, start_block: u64) -> Result<LoadedBlob> {
        let block_size = self.device.block_size();
        let format = metadata.compressed_format()?;

        // The null blob never touches the device: verify the stored root
        // against zero bytes of content.
        if metadata.blob_size() == 0 {
            let verifier = MerkleTreeVerifier::from_root(*metadata.merkle_root(), 0, block_size)?;
            verifier.verify(&[])?;
            return Ok(LoadedBlob { data: Vec::new(), file_size: 0, merkle: None });
        }

        let layout = BlobLayout::from_metadata(self.format, metadata, block_size)?;
        if layout.total_block_count() > metadata.block_count() {
            return Err(Error::corrupt("layout exceeds the blob's reserved blocks"));
        }
        let (verifier, merkle) = self.load_verifier(metadata, &layout, start_block)?;
        let raw = self.read_data(&layout, start_block)?;

        let data = match format {
            None => {
                self.check_zero_tail(&layout, &raw, layout.data_size())?;
                raw
            }
            Some(CompressedFormat::ZstdChunked) => {
                let decoder = ChunkedDecompressor::new(&raw)?;
                let table = decoder.seek_table();
                let archive_len = table.compressed_size();
                if archive_len > raw.len() as u64 {
                    return Err(Error::corrupt("archive longer than the data region"));
                }
                if table.decompressed_size() != layout.file_size() {
                    return Err(Error::corrupt(format!(
                        "archive decompresses to {} bytes, metadata says {}",
                        table.decompressed_size(),
                        layout.file_size()
                    )));
                }
                self.check_zero_tail(&layout, &raw, archive_len)?;

                let aligned = layout.file_size().div_ceil(block_size) * block_size;
                let mut out = vec![0u8; aligned as usize];
                match &self.sandbox {
                    Some(provider) => {
                        let mut service =
                            provider.create(raw.len() as u64, aligned)?;
                        service.write_compressed(0, &raw[..archive_len as usize])?;
                        let request = DecompressRequest {
                            decompressed: ByteRange::new(0, layout.file_size()),
                            compressed: ByteRange::new(0, archive_len),
                            algorithm: AlgorithmTag::ChunkedArchive,
                        };
                        service.decompress(&request)?;
                        service.read_decompressed(0, &mut out[..layout.file_size() as usize])?;
                    }
                    None => {
                        decoder.decompress(&mut out, &raw[..archive_len as usize])?;
                    }
                }
                out
            }
        };

        verifier.verify(&data)?;
        debug!(root = %metadata.merkle_root(), size = metadata.blob_size(), "blob loaded");
        Ok(LoadedBlob { data, file_size: layout.file_size(), merkle })
    }

    // ── Paged path ───────────────────────────────────────────────────────────

    pub fn load_blob_paged(
        &self,
        metadata: &BlobMetadata,
        start_block: u64,
        notifier: Option<&dyn CorruptionNotifier>,
    ) -> Result<PagedBlob> {
        let root = *metadata.merkle_root();
        let result = self.load_blob_paged_inner(metadata, start_block);
        self.report(result, &root, notifier)
    }

    fn load_blob_paged_inner(
        &self,
        metadata: &BlobMetadata,
        start_block: u64,
    ) -> Result<PagedBlob> {
        let block_size = self.device.block_size();
        let format = metadata.compressed_format()?;

        if metadata.blob_size() == 0 {
            let verifier = MerkleTreeVerifier::from_root(*metadata.merkle_root(), 0, block_size)?;
            verifier.verify(&[])?;
            return Ok(PagedBlob {
                merkle: None,
                supplier: PageSupplier {
                    device: Arc::clone(&self.device),
                    verifier,
                    source: PageSource::Raw {
                        data_start_block: start_block,
                        data_size: 0,
                        tree_start: u64::MAX,
                    },
                    block_size,
                    file_size: 0,
                },
            });
        }

        let layout = BlobLayout::from_metadata(self.format, metadata, block_size)?;
        if layout.total_block_count() > metadata.block_count() {
            return Err(Error::corrupt("layout exceeds the blob's reserved blocks"));
        }
        let (verifier, merkle) = self.load_verifier(metadata, &layout, start_block)?;
        let data_start_block = start_block + layout.data_block_offset();

        let source = match format {
            None => PageSource::Raw {
                data_start_block,
                data_size: layout.data_size(),
                tree_start: if layout.has_shared_block() {
                    layout.merkle_byte_offset() - layout.data_block_offset() * block_size
                } else {
                    u64::MAX
                },
            },
            Some(CompressedFormat::ZstdChunked) => {
                // Only the header prefix is read up front; everything else
                // waits for a fault.
                let header_blocks = seek_table::max_header_size()
                    .div_ceil(block_size)
                    .min(layout.data_block_count());
                let mut prefix = vec![0u8; (header_blocks * block_size) as usize];
                self.device.read_blocks(data_start_block, &mut prefix)?;
                let table = SeekTable::parse(&prefix)?;
                if table.decompressed_size() != layout.file_size() {
                    return Err(Error::corrupt(format!(
                        "archive decompresses to {} bytes, metadata says {}",
                        table.decompressed_size(),
                        layout.file_size()
                    )));
                }
                if table.compressed_size() > layout.data_block_aligned_size() {
                    return Err(Error::corrupt("archive longer than the data region"));
                }

                let max_frame = table.max_frame_decompressed_size();
                let supply_cap = max_frame
                    .max(DEFAULT_SUPPLY_BYTES)
                    .div_ceil(block_size)
                    * block_size;
                let service = match &self.sandbox {
                    Some(provider) => {
                        provider.create(layout.data_block_aligned_size(), supply_cap)?
                    }
                    None => LocalServiceProvider
                        .create(layout.data_block_aligned_size(), supply_cap)?,
                };
                PageSource::Chunked { table, service, data_start_block }
            }
        };

        Ok(PagedBlob {
            merkle,
            supplier: PageSupplier {
                device: Arc::clone(&self.device),
                verifier,
                source,
                block_size,
                file_size: layout.file_size(),
            },
        })
    }
}

// ── Page supply ──────────────────────────────────────────────────────────────

/// Decompressed bytes handed back per supply request, one block granular.
const DEFAULT_SUPPLY_BYTES: u64 = 256 * 1024;

pub struct PagedBlob {
    pub supplier: PageSupplier,
    pub merkle: Option<Vec<u8>>,
}

impl std::fmt::Debug for PagedBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedBlob")
            .field("file_size", &self.supplier.file_size)
            .field("merkle", &self.merkle.as_ref().map(|t| t.len()))
            .finish()
    }
}

enum PageSource {
    Raw {
        data_start_block: u64,
        data_size: u64,
        /// Offset within the data region where tree bytes legitimately
        /// begin (compact-end shared block); `u64::MAX` otherwise.
        tree_start: u64,
    },
    Chunked {
        table: SeekTable,
        service: Box<dyn DecompressionService>,
        data_start_block: u64,
    },
}

/// Verified pages produced by one supply request.  `offset` is block
/// aligned and at most the requested offset; the range always covers the
/// request (clamped to the blob's end).
pub struct SuppliedPages {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// The narrow seam the external page-fault machinery drives: supply
/// verified bytes for a faulted range.  Dropping the supplier abandons any
/// further paging.
pub struct PageSupplier {
    device: Arc<dyn BlockDevice>,
    verifier: MerkleTreeVerifier,
    source: PageSource,
    block_size: u64,
    file_size: u64,
}

impl PageSupplier {
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Produce verified bytes covering `[offset, offset + length)`.
    pub fn supply(&mut self, offset: u64, length: u64) -> Result<SuppliedPages> {
        if length == 0 || offset >= self.file_size {
            return Err(Error::OutOfRange);
        }
        let aligned_offset = offset / self.block_size * self.block_size;
        let end = offset
            .checked_add(length)
            .ok_or(Error::OutOfRange)?
            .min(self.file_size);
        let aligned_end =
            end.div_ceil(self.block_size) * self.block_size;

        match &mut self.source {
            PageSource::Raw { data_start_block, data_size, tree_start } => {
                let read_end = aligned_end.min(data_size.div_ceil(self.block_size) * self.block_size);
                let mut buf = vec![0u8; (read_end - aligned_offset) as usize];
                self.device
                    .read_blocks(*data_start_block + aligned_offset / self.block_size, &mut buf)?;

                // Bytes between the content end and any tree bytes sharing
                // the tail block must be zero; the tree bytes themselves are
                // masked out of the supplied pages.
                let content_end = (*data_size).saturating_sub(aligned_offset).min(buf.len() as u64);
                let zero_end = (*tree_start).saturating_sub(aligned_offset).min(buf.len() as u64);
                if buf[content_end as usize..zero_end as usize].iter().any(|&b| b != 0) {
                    return Err(Error::corrupt("non-zero bytes in zero-padded tail"));
                }
                buf[content_end as usize..].fill(0);

                self.verifier.verify_range(&buf, aligned_offset)?;
                Ok(SuppliedPages { offset: aligned_offset, bytes: buf })
            }
            PageSource::Chunked { table, service, data_start_block } => {
                let want = aligned_end.min(self.file_size) - aligned_offset;
                let mapping = table.mapping_for_range(
                    aligned_offset,
                    want,
                    service.decompressed_capacity(),
                )?;

                // Read the covering compressed blocks.
                let first_block = mapping.compressed_offset / self.block_size;
                let last = (mapping.compressed_offset + mapping.compressed_length)
                    .div_ceil(self.block_size);
                let mut compressed =
                    vec![0u8; ((last - first_block) * self.block_size) as usize];
                self.device
                    .read_blocks(*data_start_block + first_block, &mut compressed)?;
                let skip = (mapping.compressed_offset - first_block * self.block_size) as usize;
                let src = &compressed[skip..skip + mapping.compressed_length as usize];

                service.write_compressed(0, src)?;
                let request = DecompressRequest {
                    decompressed: ByteRange::new(0, mapping.decompressed_length),
                    compressed: ByteRange::new(0, mapping.compressed_length),
                    algorithm: AlgorithmTag::ChunkedFrame,
                };
                service.decompress(&request)?;
                let mut bytes = vec![0u8; mapping.decompressed_length as usize];
                service.read_decompressed(0, &mut bytes)?;

                self.verifier.verify_range(&bytes, mapping.decompressed_offset)?;
                Ok(SuppliedPages { offset: mapping.decompressed_offset, bytes })
            }
        }
    }
}
