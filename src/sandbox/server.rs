//! Server side of the sandbox boundary: the isolated decompressor process.
//!
//! A sandbox binary binds a Unix socket and calls [`serve`]; each
//! connection maps the client's two regions from the setup frame and then
//! answers fixed-size request records until the peer closes.  All decode
//! work happens here, against the mapped regions only; request validation
//! failures become response statuses, never panics.

use std::os::unix::net::{UnixListener, UnixStream};

use tracing::{debug, warn};

use crate::codec::chunked::ChunkedDecompressor;
use crate::codec::{Decompress, SeekableDecompress};
use crate::error::{Error, Result};
use crate::sandbox::channel::{self, SetupFrame};
use crate::sandbox::region::SharedRegion;
use crate::sandbox::{AlgorithmTag, DecompressRequest, DecompressResponse, SandboxStatus};

/// Accept loop.  Per-connection failures are logged and do not take the
/// server down.
pub fn serve(listener: UnixListener) -> Result<()> {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(err) = serve_connection(stream) {
                    warn!("sandbox connection failed: {err}");
                }
            }
            Err(err) => return Err(Error::Io(err)),
        }
    }
    Ok(())
}

/// Serve one client connection until it closes.
pub fn serve_connection(mut stream: UnixStream) -> Result<()> {
    let setup = SetupFrame::read(&mut stream)?;
    let compressed = SharedRegion::open(&setup.compressed_path, setup.compressed_len as usize)?;
    let mut decompressed =
        SharedRegion::open(&setup.decompressed_path, setup.decompressed_len as usize)?;
    debug!(
        compressed = setup.compressed_len,
        decompressed = setup.decompressed_len,
        "sandbox regions mapped"
    );

    while let Some(request) = channel::read_request(&mut stream)? {
        let response = execute(&request, compressed.as_slice(), decompressed.as_mut_slice());
        channel::write_response(&mut stream, &response)?;
    }
    Ok(())
}

/// Execute one request against the two regions.  Shared with the local
/// in-process backend, so both sides of the trait behave identically.
pub(crate) fn execute(
    request: &DecompressRequest,
    compressed: &[u8],
    decompressed: &mut [u8],
) -> DecompressResponse {
    match try_execute(request, compressed, decompressed) {
        Ok(size) => DecompressResponse::ok(size),
        Err(err) => DecompressResponse::failed(SandboxStatus::from_error(&err)),
    }
}

fn region_window<'a>(region: &'a [u8], offset: u64, size: u64) -> Result<&'a [u8]> {
    let end = offset.checked_add(size).ok_or(Error::OutOfRange)?;
    if end > region.len() as u64 {
        return Err(Error::OutOfRange);
    }
    Ok(&region[offset as usize..end as usize])
}

fn try_execute(
    request: &DecompressRequest,
    compressed: &[u8],
    decompressed: &mut [u8],
) -> Result<u64> {
    let src = region_window(compressed, request.compressed.offset, request.compressed.size)?;
    let dst_end = request
        .decompressed
        .end()
        .ok_or(Error::OutOfRange)?;
    if dst_end > decompressed.len() as u64 {
        return Err(Error::OutOfRange);
    }
    let dst = &mut decompressed[request.decompressed.offset as usize..dst_end as usize];

    match request.algorithm {
        AlgorithmTag::ChunkedArchive => {
            if request.decompressed.offset != 0 {
                return Err(Error::protocol(
                    "whole-archive decode requires decompressed offset 0",
                ));
            }
            let decoder = ChunkedDecompressor::new(src)?;
            if decoder.seek_table().decompressed_size() != request.decompressed.size {
                return Err(Error::corrupt(format!(
                    "archive decompresses to {} bytes, request declared {}",
                    decoder.seek_table().decompressed_size(),
                    request.decompressed.size
                )));
            }
            if decoder.seek_table().compressed_size() > request.compressed.size {
                return Err(Error::corrupt("archive longer than the compressed range"));
            }
            decoder.decompress(dst, src)
        }
        AlgorithmTag::ChunkedFrame => {
            // A bounded frame run: plain concatenated zstd frames, already
            // windowed by the client via its seek table.
            let produced = zstd::bulk::decompress_to_buffer(src, dst)
                .map_err(|e| Error::corrupt(format!("frame decode failed: {e}")))?;
            if produced as u64 != request.decompressed.size {
                return Err(Error::corrupt(format!(
                    "frame run produced {produced} bytes, request declared {}",
                    request.decompressed.size
                )));
            }
            Ok(produced as u64)
        }
    }
}
