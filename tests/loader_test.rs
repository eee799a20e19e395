use std::sync::{Arc, Mutex};

use blobcask::device::{BlockDevice, MemoryBlockDevice};
use blobcask::layout::{BlobLayout, BlobLayoutFormat};
use blobcask::loader::{
    BlobLoader, CorruptionNotifier, DecompressionServiceProvider, LocalServiceProvider,
};
use blobcask::merkle;
use blobcask::writer::BlobWriter;
use blobcask::{CompressionAlgorithm, Digest, Error};

const BLOCK: u64 = 8192;

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[derive(Default)]
struct RecordingNotifier {
    corrupt: Mutex<Vec<Digest>>,
}

impl CorruptionNotifier for RecordingNotifier {
    fn blob_corrupt(&self, root: &Digest) {
        self.corrupt.lock().unwrap().push(*root);
    }
}

fn loader_for(
    device: &Arc<MemoryBlockDevice>,
    format: BlobLayoutFormat,
    sandboxed: bool,
) -> BlobLoader {
    BlobLoader::new(
        Arc::clone(device) as Arc<dyn BlockDevice>,
        format,
        sandboxed.then(|| Arc::new(LocalServiceProvider) as Arc<dyn DecompressionServiceProvider>),
    )
}

fn write_and_load(
    format: BlobLayoutFormat,
    algorithm: Option<CompressionAlgorithm>,
    data: &[u8],
    sandboxed: bool,
) {
    let device = Arc::new(MemoryBlockDevice::new(BLOCK, 256));
    let writer = BlobWriter::new(device.as_ref(), format, algorithm);
    let metadata = writer.write_blob(0, data).unwrap();
    assert_eq!(metadata.blob_size(), data.len() as u64);
    assert_eq!(*metadata.merkle_root(), merkle::root_for(data, BLOCK));

    let loader = loader_for(&device, format, sandboxed);
    let loaded = loader.load_blob(&metadata, 0, None).unwrap();
    assert_eq!(loaded.file_size, data.len() as u64);
    assert_eq!(&loaded.data[..data.len()], data);
    assert!(loaded.data[data.len()..].iter().all(|&b| b == 0));
}

#[test]
fn test_round_trip_uncompressed_both_formats() {
    let data = patterned(3 * BLOCK as usize + 700);
    write_and_load(BlobLayoutFormat::PaddedStart, None, &data, false);
    write_and_load(BlobLayoutFormat::CompactEnd, None, &data, false);
}

#[test]
fn test_round_trip_compressed_both_formats() {
    let algorithm = Some(CompressionAlgorithm::ZstdChunked { level: 3 });
    let data = patterned(5 * BLOCK as usize);
    write_and_load(BlobLayoutFormat::PaddedStart, algorithm, &data, false);
    write_and_load(BlobLayoutFormat::CompactEnd, algorithm, &data, false);
}

#[test]
fn test_round_trip_through_sandbox_service() {
    let algorithm = Some(CompressionAlgorithm::ZstdChunked { level: 3 });
    let data = patterned(4 * BLOCK as usize + 123);
    write_and_load(BlobLayoutFormat::CompactEnd, algorithm, &data, true);
}

#[test]
fn test_single_block_blob_has_no_tree() {
    let data = patterned(100);
    let device = Arc::new(MemoryBlockDevice::new(BLOCK, 8));
    let writer = BlobWriter::new(device.as_ref(), BlobLayoutFormat::CompactEnd, None);
    let metadata = writer.write_blob(0, &data).unwrap();

    let loader = loader_for(&device, BlobLayoutFormat::CompactEnd, false);
    let loaded = loader.load_blob(&metadata, 0, None).unwrap();
    assert!(loaded.merkle.is_none());
    assert_eq!(&loaded.data[..100], &data[..]);
}

#[test]
fn test_null_blob_never_reads_the_device() {
    // A device with zero blocks: any read at all would fail.
    let device = Arc::new(MemoryBlockDevice::new(BLOCK, 0));
    let metadata =
        blobcask::BlobMetadata::new(0, 0, 0, merkle::root_for(&[], BLOCK)).unwrap();

    let loader = loader_for(&device, BlobLayoutFormat::CompactEnd, false);
    let loaded = loader.load_blob(&metadata, 0, None).unwrap();
    assert_eq!(loaded.file_size, 0);
    assert!(loaded.data.is_empty());
}

#[test]
fn test_null_blob_root_mismatch_fails() {
    let device = Arc::new(MemoryBlockDevice::new(BLOCK, 0));
    let wrong_root = merkle::root_for(b"not empty", BLOCK);
    let metadata = blobcask::BlobMetadata::new(0, 0, 0, wrong_root).unwrap();

    let notifier = RecordingNotifier::default();
    let loader = loader_for(&device, BlobLayoutFormat::CompactEnd, false);
    let err = loader.load_blob(&metadata, 0, Some(&notifier)).unwrap_err();
    assert!(matches!(err, Error::Corrupt(_)));
    assert_eq!(notifier.corrupt.lock().unwrap().len(), 1);
}

fn flip_byte(device: &MemoryBlockDevice, block: u64, offset: usize) {
    let mut buf = vec![0u8; BLOCK as usize];
    device.read_blocks(block, &mut buf).unwrap();
    buf[offset] ^= 0xff;
    device.write_blocks(block, &buf).unwrap();
}

#[test]
fn test_flipped_data_byte_fails_verification() {
    let data = patterned(3 * BLOCK as usize);
    let device = Arc::new(MemoryBlockDevice::new(BLOCK, 64));
    let writer = BlobWriter::new(device.as_ref(), BlobLayoutFormat::CompactEnd, None);
    let metadata = writer.write_blob(0, &data).unwrap();

    // Data occupies the front of the run in the compact format.
    flip_byte(&device, 1, 17);

    let notifier = RecordingNotifier::default();
    let loader = loader_for(&device, BlobLayoutFormat::CompactEnd, false);
    let err = loader.load_blob(&metadata, 0, Some(&notifier)).unwrap_err();
    assert!(matches!(err, Error::Corrupt(_)));
    assert_eq!(notifier.corrupt.lock().unwrap()[0], *metadata.merkle_root());
}

#[test]
fn test_flipped_tree_byte_fails_verification() {
    let data = patterned(3 * BLOCK as usize);
    let device = Arc::new(MemoryBlockDevice::new(BLOCK, 64));
    let writer = BlobWriter::new(device.as_ref(), BlobLayoutFormat::PaddedStart, None);
    let metadata = writer.write_blob(0, &data).unwrap();

    // The tree occupies block 0 in the padded format.
    flip_byte(&device, 0, 5);

    let notifier = RecordingNotifier::default();
    let loader = loader_for(&device, BlobLayoutFormat::PaddedStart, false);
    let err = loader.load_blob(&metadata, 0, Some(&notifier)).unwrap_err();
    assert!(matches!(err, Error::Corrupt(_)));
    assert_eq!(notifier.corrupt.lock().unwrap().len(), 1);
}

#[test]
fn test_nonzero_tail_padding_fails() {
    let data = patterned(BLOCK as usize + 10);
    let device = Arc::new(MemoryBlockDevice::new(BLOCK, 64));
    let writer = BlobWriter::new(device.as_ref(), BlobLayoutFormat::PaddedStart, None);
    let metadata = writer.write_blob(0, &data).unwrap();

    // Dirty a byte in the zero padding after the content, inside the data
    // region's final block.
    let layout =
        BlobLayout::from_metadata(BlobLayoutFormat::PaddedStart, &metadata, BLOCK).unwrap();
    let tail_block = layout.data_block_offset() + layout.data_block_count() - 1;
    flip_byte(&device, tail_block, 100);

    let loader = loader_for(&device, BlobLayoutFormat::PaddedStart, false);
    let err = loader.load_blob(&metadata, 0, None).unwrap_err();
    assert!(matches!(err, Error::Corrupt(_)));
}

// ── Paged loads ──────────────────────────────────────────────────────────────

#[test]
fn test_paged_load_supplies_verified_ranges() {
    let algorithm = Some(CompressionAlgorithm::ZstdChunked { level: 3 });
    // Three 128 KiB frames once compressed.
    let data = patterned(300_000);
    let device = Arc::new(MemoryBlockDevice::new(BLOCK, 256));
    let writer = BlobWriter::new(device.as_ref(), BlobLayoutFormat::CompactEnd, algorithm);
    let metadata = writer.write_blob(0, &data).unwrap();
    assert!(metadata.is_compressed());

    let loader = loader_for(&device, BlobLayoutFormat::CompactEnd, false);
    let mut paged = loader.load_blob_paged(&metadata, 0, None).unwrap();
    assert_eq!(paged.supplier.file_size(), 300_000);

    // Fault near the start.
    let pages = paged.supplier.supply(100, 1000).unwrap();
    assert_eq!(pages.offset, 0);
    assert_eq!(&pages.bytes[..], &data[..pages.bytes.len()]);

    // Fault in the middle; the supplied range starts at a frame boundary
    // at or before the request.
    let pages = paged.supplier.supply(200_000, 500).unwrap();
    assert!(pages.offset <= 200_000 - 200_000 % BLOCK);
    let start = pages.offset as usize;
    assert_eq!(&pages.bytes[..], &data[start..start + pages.bytes.len()]);

    // Fault covering the tail.
    let pages = paged.supplier.supply(299_000, 10_000).unwrap();
    let start = pages.offset as usize;
    let end = (start + pages.bytes.len()).min(300_000);
    assert_eq!(&pages.bytes[..end - start], &data[start..end]);

    // Past the end.
    assert!(matches!(paged.supplier.supply(300_000, 1), Err(Error::OutOfRange)));
}

#[test]
fn test_paged_load_uncompressed() {
    let data = patterned(2 * BLOCK as usize + 400);
    let device = Arc::new(MemoryBlockDevice::new(BLOCK, 64));
    let writer = BlobWriter::new(device.as_ref(), BlobLayoutFormat::CompactEnd, None);
    let metadata = writer.write_blob(0, &data).unwrap();

    let loader = loader_for(&device, BlobLayoutFormat::CompactEnd, false);
    let mut paged = loader.load_blob_paged(&metadata, 0, None).unwrap();

    let pages = paged.supplier.supply(BLOCK, 100).unwrap();
    assert_eq!(pages.offset, BLOCK);
    assert_eq!(&pages.bytes[..], &data[BLOCK as usize..BLOCK as usize + pages.bytes.len()]);

    // The shared tail block: tree bytes are masked out, content verifies.
    let pages = paged.supplier.supply(2 * BLOCK, 400).unwrap();
    assert_eq!(pages.offset, 2 * BLOCK);
    assert_eq!(&pages.bytes[..400], &data[2 * BLOCK as usize..]);
    assert!(pages.bytes[400..].iter().all(|&b| b == 0));
}

#[test]
fn test_paged_load_fails_fast_on_corrupt_header() {
    let algorithm = Some(CompressionAlgorithm::ZstdChunked { level: 3 });
    let data = patterned(200_000);
    let device = Arc::new(MemoryBlockDevice::new(BLOCK, 128));
    let writer = BlobWriter::new(device.as_ref(), BlobLayoutFormat::CompactEnd, algorithm);
    let metadata = writer.write_blob(0, &data).unwrap();

    // Corrupt the seek table in the archive's first block.
    flip_byte(&device, 0, 20);

    let notifier = RecordingNotifier::default();
    let loader = loader_for(&device, BlobLayoutFormat::CompactEnd, false);
    let err = loader.load_blob_paged(&metadata, 0, Some(&notifier)).unwrap_err();
    assert!(matches!(err, Error::Corrupt(_)));
    assert_eq!(notifier.corrupt.lock().unwrap().len(), 1);
}

#[test]
fn test_unknown_algorithm_flag_rejected() {
    let device = Arc::new(MemoryBlockDevice::new(BLOCK, 8));
    let metadata =
        blobcask::BlobMetadata::new(100, 1, 1 << 1, merkle::root_for(&[], BLOCK)).unwrap();
    let loader = loader_for(&device, BlobLayoutFormat::CompactEnd, false);
    assert!(matches!(
        loader.load_blob_paged(&metadata, 0, None),
        Err(Error::Unsupported(_))
    ));
}

#[test]
fn test_loader_through_remote_sandbox() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("sandbox.sock");
    let listener = std::os::unix::net::UnixListener::bind(&sock).unwrap();
    std::thread::spawn(move || {
        let _ = blobcask::sandbox::server::serve(listener);
    });

    let algorithm = Some(CompressionAlgorithm::ZstdChunked { level: 3 });
    let data = patterned(200_000);
    let device = Arc::new(MemoryBlockDevice::new(BLOCK, 128));
    let writer = BlobWriter::new(device.as_ref(), BlobLayoutFormat::CompactEnd, algorithm);
    let metadata = writer.write_blob(0, &data).unwrap();
    assert!(metadata.is_compressed());

    let loader = BlobLoader::new(
        Arc::clone(&device) as Arc<dyn BlockDevice>,
        BlobLayoutFormat::CompactEnd,
        Some(Arc::new(blobcask::loader::RemoteServiceProvider::new(&sock))),
    );

    let loaded = loader.load_blob(&metadata, 0, None).unwrap();
    assert_eq!(&loaded.data[..data.len()], &data[..]);

    let mut paged = loader.load_blob_paged(&metadata, 0, None).unwrap();
    let pages = paged.supplier.supply(150_000, 100).unwrap();
    let start = pages.offset as usize;
    let end = (start + pages.bytes.len()).min(data.len());
    assert_eq!(&pages.bytes[..end - start], &data[start..end]);
}

// ── Layout arithmetic ────────────────────────────────────────────────────────

#[test]
fn test_layout_padded_start_places_tree_first() {
    let file_size = 3 * BLOCK + 100;
    let layout =
        BlobLayout::from_sizes(BlobLayoutFormat::PaddedStart, file_size, file_size, BLOCK)
            .unwrap();
    assert_eq!(layout.merkle_tree_size(), 4 * 32);
    assert_eq!(layout.merkle_block_offset(), 0);
    assert_eq!(layout.merkle_block_count(), 1);
    assert_eq!(layout.data_block_offset(), 1);
    assert_eq!(layout.data_block_count(), 4);
    assert_eq!(layout.total_block_count(), 5);
    assert!(!layout.has_shared_block());
}

#[test]
fn test_layout_compact_end_shares_tail_block() {
    let file_size = 3 * BLOCK + 100;
    let layout =
        BlobLayout::from_sizes(BlobLayoutFormat::CompactEnd, file_size, file_size, BLOCK)
            .unwrap();
    assert_eq!(layout.data_block_offset(), 0);
    assert_eq!(layout.data_block_count(), 4);
    // Data tail (100 bytes) and the 128-byte tree fit one final block.
    assert_eq!(layout.total_block_count(), 4);
    assert!(layout.has_shared_block());
    assert_eq!(layout.merkle_byte_offset(), 4 * BLOCK - 128);

    // A tree that no longer fits the slack spills into its own block.
    let file_size = 4 * BLOCK - 16;
    let layout =
        BlobLayout::from_sizes(BlobLayoutFormat::CompactEnd, file_size, file_size, BLOCK)
            .unwrap();
    assert_eq!(layout.total_block_count(), 5);
}

#[test]
fn test_layout_single_block_blob_stores_no_tree() {
    let layout =
        BlobLayout::from_sizes(BlobLayoutFormat::CompactEnd, 100, 100, BLOCK).unwrap();
    assert_eq!(layout.merkle_tree_size(), 0);
    assert_eq!(layout.merkle_block_count(), 0);
    assert_eq!(layout.total_block_count(), 1);
    assert!(!layout.has_shared_block());
}
