use blobcask::codec::chunked::{ChunkedCompressor, ChunkedDecompressor};
use blobcask::codec::Compress;
use blobcask::producer::{
    BlobDataProducer, DecompressBlobDataProducer, MergeBlobDataProducer, SimpleBlobDataProducer,
};

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
fn test_simple_producer_subslices() {
    let data = patterned(100);
    let mut producer = SimpleBlobDataProducer::new(&data);
    assert_eq!(producer.remaining(), 100);
    assert!(!producer.needs_flush());

    assert_eq!(producer.consume(40).unwrap(), &data[..40]);
    assert_eq!(producer.remaining(), 60);
    assert_eq!(producer.consume(100).unwrap(), &data[40..]);
    assert_eq!(producer.remaining(), 0);
    assert_eq!(producer.consume(10).unwrap(), &[] as &[u8]);
}

#[test]
fn test_merge_producer_pads_between_producers() {
    // 10 bytes, then 3 zeros of padding, then 20 bytes, block size 16.
    let first = patterned(10);
    let second: Vec<u8> = (100..120).collect();
    let mut producer = MergeBlobDataProducer::new(
        Box::new(SimpleBlobDataProducer::new(&first)),
        Box::new(SimpleBlobDataProducer::new(&second)),
        3,
        16,
    )
    .unwrap();
    assert_eq!(producer.remaining(), 33);

    // One block: first's 10 bytes + 3 padding zeros + 3 bytes of second.
    let block = producer.consume(16).unwrap().to_vec();
    assert_eq!(block.len(), 16);
    assert_eq!(&block[..10], &first[..]);
    assert_eq!(&block[10..13], &[0, 0, 0]);
    assert_eq!(&block[13..], &second[..3]);
    assert!(producer.needs_flush());
    assert_eq!(producer.remaining(), 17);

    // The rest drains the second producer directly.
    assert_eq!(producer.consume(16).unwrap(), &second[3..19]);
    assert_eq!(producer.consume(16).unwrap(), &second[19..]);
    assert_eq!(producer.remaining(), 0);
}

#[test]
fn test_merge_producer_block_aligned_first() {
    // First producer ends exactly on a block boundary: padding is deferred
    // and leads the first pull from the second producer.
    let first = patterned(32);
    let second: Vec<u8> = (200..=209).collect();
    let mut producer = MergeBlobDataProducer::new(
        Box::new(SimpleBlobDataProducer::new(&first)),
        Box::new(SimpleBlobDataProducer::new(&second)),
        5,
        16,
    )
    .unwrap();

    assert_eq!(producer.consume(32).unwrap(), &first[..]);
    let merged = producer.consume(16).unwrap().to_vec();
    assert_eq!(&merged[..5], &[0u8; 5]);
    assert_eq!(&merged[5..], &second[..]);
    assert_eq!(producer.remaining(), 0);
}

#[test]
fn test_merge_producer_rejects_block_sized_padding() {
    let first = patterned(4);
    let second = patterned(4);
    assert!(MergeBlobDataProducer::new(
        Box::new(SimpleBlobDataProducer::new(&first)),
        Box::new(SimpleBlobDataProducer::new(&second)),
        16,
        16,
    )
    .is_err());
}

#[test]
fn test_decompress_producer_reproduces_content() {
    let data = patterned(5000);
    let mut compressor = ChunkedCompressor::with_frame_size(3, 1024);
    compressor.update(&data).unwrap();
    compressor.end().unwrap();
    let archive = compressor.archive().to_vec();
    let decoder = ChunkedDecompressor::new(&archive).unwrap();

    let mut producer = DecompressBlobDataProducer::new(&decoder, &archive, 512).unwrap();
    assert_eq!(producer.remaining(), 5000);

    let mut out = Vec::new();
    while producer.remaining() > 0 {
        let chunk = producer.consume(512).unwrap().to_vec();
        assert!(!chunk.is_empty());
        out.extend_from_slice(&chunk);
    }
    assert_eq!(out, data);
}

#[test]
fn test_decompress_producer_flush_signal() {
    let data = patterned(2048);
    let mut compressor = ChunkedCompressor::with_frame_size(3, 1024);
    compressor.update(&data).unwrap();
    compressor.end().unwrap();
    let archive = compressor.archive().to_vec();
    let decoder = ChunkedDecompressor::new(&archive).unwrap();

    // Scratch holds exactly one 1024-byte frame (block size 512).
    let mut producer = DecompressBlobDataProducer::new(&decoder, &archive, 512).unwrap();

    producer.consume(512).unwrap();
    // Half the frame is still unserved; the next consume reads from scratch.
    assert!(!producer.needs_flush());
    producer.consume(512).unwrap();
    // Scratch exhausted and another frame remains: the next consume
    // overwrites previously returned bytes.
    assert!(producer.needs_flush());
    producer.consume(512).unwrap();
    assert!(!producer.needs_flush());
}
