use std::os::unix::net::UnixListener;
use std::thread;

use blobcask::codec::chunked::{ChunkedCompressor, ChunkedDecompressor};
use blobcask::codec::{Compress, SeekableDecompress};
use blobcask::sandbox::client::{
    DecompressionService, LocalDecompressionService, PathConnector, RemoteDecompressionService,
};
use blobcask::sandbox::server;
use blobcask::sandbox::{AlgorithmTag, ByteRange, DecompressRequest};
use blobcask::streaming::StreamingChunkedDecompressor;
use blobcask::Error;

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn archive_for(data: &[u8], frame_size: u64) -> Vec<u8> {
    let mut compressor = ChunkedCompressor::with_frame_size(3, frame_size);
    compressor.update(data).unwrap();
    compressor.end().unwrap();
    compressor.archive().to_vec()
}

fn archive_request(archive_len: u64, decompressed_len: u64) -> DecompressRequest {
    DecompressRequest {
        decompressed: ByteRange::new(0, decompressed_len),
        compressed: ByteRange::new(0, archive_len),
        algorithm: AlgorithmTag::ChunkedArchive,
    }
}

#[test]
fn test_local_service_whole_archive() {
    let data = patterned(1024);
    let archive = archive_for(&data, 1024);

    let mut service = LocalDecompressionService::new(archive.len() as u64, 1024);
    service.write_compressed(0, &archive).unwrap();
    let response = service
        .decompress(&archive_request(archive.len() as u64, 1024))
        .unwrap();
    assert_eq!(response.size, 1024);

    let mut out = vec![0u8; 1024];
    service.read_decompressed(0, &mut out).unwrap();
    assert_eq!(out, data);
}

#[test]
fn test_declared_size_mismatch_is_integrity_error() {
    let data = patterned(1024);
    let archive = archive_for(&data, 1024);

    let mut service = LocalDecompressionService::new(archive.len() as u64, 1024);
    service.write_compressed(0, &archive).unwrap();
    let err = service
        .decompress(&archive_request(archive.len() as u64, 1023))
        .unwrap_err();
    assert!(matches!(err, Error::Corrupt(_)));
}

#[test]
fn test_whole_archive_rejects_nonzero_offset() {
    let data = patterned(1024);
    let archive = archive_for(&data, 1024);

    let mut service = LocalDecompressionService::new(archive.len() as u64, 4096);
    service.write_compressed(0, &archive).unwrap();
    let request = DecompressRequest {
        decompressed: ByteRange::new(512, 1024),
        compressed: ByteRange::new(0, archive.len() as u64),
        algorithm: AlgorithmTag::ChunkedArchive,
    };
    assert!(matches!(service.decompress(&request), Err(Error::Protocol(_))));
}

#[test]
fn test_frame_mode_decodes_single_frame() {
    let data = patterned(3000);
    let archive = archive_for(&data, 1024);
    let decoder = ChunkedDecompressor::new(&archive).unwrap();
    let entry = decoder.seek_table().entries()[1];

    let mut service = LocalDecompressionService::new(4096, 4096);
    service
        .write_compressed(
            0,
            &archive[entry.compressed_offset as usize..entry.compressed_end() as usize],
        )
        .unwrap();
    let request = DecompressRequest {
        decompressed: ByteRange::new(0, entry.decompressed_size),
        compressed: ByteRange::new(0, entry.compressed_size),
        algorithm: AlgorithmTag::ChunkedFrame,
    };
    let response = service.decompress(&request).unwrap();
    assert_eq!(response.size, entry.decompressed_size);

    let mut out = vec![0u8; entry.decompressed_size as usize];
    service.read_decompressed(0, &mut out).unwrap();
    assert_eq!(out, data[1024..2048]);
}

#[test]
fn test_request_ranges_outside_regions_rejected() {
    let mut service = LocalDecompressionService::new(256, 256);
    let request = DecompressRequest {
        decompressed: ByteRange::new(0, 512),
        compressed: ByteRange::new(0, 128),
        algorithm: AlgorithmTag::ChunkedFrame,
    };
    assert!(matches!(service.decompress(&request), Err(Error::OutOfRange)));
}

// ── Remote transport ─────────────────────────────────────────────────────────

#[test]
fn test_remote_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("sandbox.sock");
    let listener = UnixListener::bind(&sock).unwrap();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        server::serve_connection(stream).unwrap();
    });

    let data = patterned(4096);
    let archive = archive_for(&data, 1024);
    let mut service = RemoteDecompressionService::new(
        Box::new(PathConnector::new(&sock)),
        archive.len() as u64,
        4096,
    )
    .unwrap();

    service.write_compressed(0, &archive).unwrap();
    let response = service
        .decompress(&archive_request(archive.len() as u64, 4096))
        .unwrap();
    assert_eq!(response.size, 4096);

    let mut out = vec![0u8; 4096];
    service.read_decompressed(0, &mut out).unwrap();
    assert_eq!(out, data);

    drop(service);
    server.join().unwrap();
}

#[test]
fn test_remote_reconnects_after_peer_drop() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("sandbox.sock");
    let listener = UnixListener::bind(&sock).unwrap();
    let server = thread::spawn(move || {
        // First connection goes away before answering anything; the client
        // must transparently rebuild the channel.
        let (stream, _) = listener.accept().unwrap();
        drop(stream);
        let (stream, _) = listener.accept().unwrap();
        server::serve_connection(stream).unwrap();
    });

    let data = patterned(2048);
    let archive = archive_for(&data, 1024);
    let mut service = RemoteDecompressionService::new(
        Box::new(PathConnector::new(&sock)),
        archive.len() as u64,
        2048,
    )
    .unwrap();

    service.write_compressed(0, &archive).unwrap();
    let response = service
        .decompress(&archive_request(archive.len() as u64, 2048))
        .unwrap();
    assert_eq!(response.size, 2048);

    let mut out = vec![0u8; 2048];
    service.read_decompressed(0, &mut out).unwrap();
    assert_eq!(out, data);

    drop(service);
    server.join().unwrap();
}

// ── Streaming decode ─────────────────────────────────────────────────────────

#[test]
fn test_streaming_decodes_frames_as_bytes_arrive() {
    let data = patterned(1500);
    let archive = archive_for(&data, 1024);
    let decoder = ChunkedDecompressor::new(&archive).unwrap();
    let table = decoder.seek_table().clone();
    let entries: Vec<_> = table.entries().to_vec();
    assert_eq!(entries.len(), 2);

    let mut frames: Vec<Vec<u8>> = Vec::new();
    {
        let service = LocalDecompressionService::new(4096, 4096);
        let sink = |bytes: &[u8]| -> blobcask::Result<()> {
            frames.push(bytes.to_vec());
            Ok(())
        };
        let mut streaming =
            StreamingChunkedDecompressor::new(table, Box::new(service), Box::new(sink)).unwrap();

        // Header plus a sliver of frame 0: nothing decodable yet.
        let first_end = entries[0].compressed_end() as usize;
        streaming.update(&archive[..first_end - 1]).unwrap();

        // Completing frame 0 yields exactly one callback.
        streaming.update(&archive[first_end - 1..first_end]).unwrap();

        // The rest completes frame 1 and drains the table.
        streaming.update(&archive[first_end..]).unwrap();

        // Drained: any further bytes are out of range.
        assert!(matches!(streaming.update(&[0u8]), Err(Error::OutOfRange)));
    }

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0], &data[..1024]);
    assert_eq!(frames[1], &data[1024..]);
}

#[test]
fn test_streaming_rejects_overflow_past_declared_size() {
    let data = patterned(1024);
    let archive = archive_for(&data, 1024);
    let decoder = ChunkedDecompressor::new(&archive).unwrap();
    let table = decoder.seek_table().clone();

    let mut streaming = StreamingChunkedDecompressor::new(
        table,
        Box::new(LocalDecompressionService::new(4096, 4096)),
        Box::new(|_: &[u8]| -> blobcask::Result<()> { Ok(()) }),
    )
    .unwrap();

    let mut oversized = archive.clone();
    oversized.extend_from_slice(&[0u8; 100]);
    assert!(matches!(streaming.update(&oversized), Err(Error::OutOfRange)));
}

#[test]
fn test_streaming_propagates_sink_failure() {
    let data = patterned(1024);
    let archive = archive_for(&data, 1024);
    let decoder = ChunkedDecompressor::new(&archive).unwrap();
    let table = decoder.seek_table().clone();

    let mut streaming = StreamingChunkedDecompressor::new(
        table,
        Box::new(LocalDecompressionService::new(4096, 4096)),
        Box::new(|_: &[u8]| -> blobcask::Result<()> {
            Err(Error::protocol("sink rejected the frame"))
        }),
    )
    .unwrap();
    assert!(matches!(streaming.update(&archive), Err(Error::Protocol(_))));
}
