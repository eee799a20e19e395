//! Client side of the sandbox boundary, and the in-process fallback.
//!
//! [`DecompressionService`] is the seam the loader, page supplier, and
//! streaming decompressor consume: stage compressed bytes, issue one
//! blocking `decompress`, read the produced bytes back.  The remote backend
//! speaks the region + record-queue protocol to an isolated process; the
//! local backend executes the identical request logic in-process.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::sandbox::channel::{MessageQueue, SetupFrame};
use crate::sandbox::region::SharedRegion;
use crate::sandbox::server;
use crate::sandbox::{DecompressRequest, DecompressResponse, SandboxStatus};

// ── Service seam ─────────────────────────────────────────────────────────────

pub trait DecompressionService: Send {
    fn compressed_capacity(&self) -> u64;

    fn decompressed_capacity(&self) -> u64;

    /// Stage compressed bytes into the compressed region.
    fn write_compressed(&mut self, offset: u64, bytes: &[u8]) -> Result<()>;

    /// One blocking round trip.  Implementations validate that an OK
    /// response produced exactly `request.decompressed.size` bytes.
    fn decompress(&mut self, request: &DecompressRequest) -> Result<DecompressResponse>;

    /// Copy produced bytes out of the decompressed region.
    fn read_decompressed(&mut self, offset: u64, dest: &mut [u8]) -> Result<()>;
}

fn check_span(capacity: u64, offset: u64, len: u64) -> Result<()> {
    let end = offset.checked_add(len).ok_or(Error::OutOfRange)?;
    if end > capacity {
        return Err(Error::OutOfRange);
    }
    Ok(())
}

/// An OK response must produce exactly the declared size.
fn check_response(request: &DecompressRequest, response: DecompressResponse) -> Result<DecompressResponse> {
    match response.status {
        SandboxStatus::Ok => {
            if response.size != request.decompressed.size {
                return Err(Error::corrupt(format!(
                    "sandbox produced {} bytes, request declared {}",
                    response.size, request.decompressed.size
                )));
            }
            Ok(response)
        }
        status => Err(status.into_error()),
    }
}

// ── Local backend ────────────────────────────────────────────────────────────

/// In-process execution of the sandbox request logic; used when sandboxing
/// is disabled and in tests.
pub struct LocalDecompressionService {
    compressed: Vec<u8>,
    decompressed: Vec<u8>,
}

impl LocalDecompressionService {
    pub fn new(compressed_capacity: u64, decompressed_capacity: u64) -> Self {
        Self {
            compressed: vec![0u8; compressed_capacity as usize],
            decompressed: vec![0u8; decompressed_capacity as usize],
        }
    }
}

impl DecompressionService for LocalDecompressionService {
    fn compressed_capacity(&self) -> u64 {
        self.compressed.len() as u64
    }

    fn decompressed_capacity(&self) -> u64 {
        self.decompressed.len() as u64
    }

    fn write_compressed(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        check_span(self.compressed_capacity(), offset, bytes.len() as u64)?;
        self.compressed[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn decompress(&mut self, request: &DecompressRequest) -> Result<DecompressResponse> {
        let response = server::execute(request, &self.compressed, &mut self.decompressed);
        check_response(request, response)
    }

    fn read_decompressed(&mut self, offset: u64, dest: &mut [u8]) -> Result<()> {
        check_span(self.decompressed_capacity(), offset, dest.len() as u64)?;
        dest.copy_from_slice(&self.decompressed[offset as usize..offset as usize + dest.len()]);
        Ok(())
    }
}

// ── Remote backend ───────────────────────────────────────────────────────────

/// Opens the transport to the sandbox process.  Interchangeable so tests
/// can pair the client with an in-thread server.
pub trait SandboxConnector: Send {
    fn connect(&self) -> Result<UnixStream>;
}

/// Connects to a listening sandbox socket.
pub struct PathConnector {
    path: PathBuf,
}

impl PathConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SandboxConnector for PathConnector {
    fn connect(&self) -> Result<UnixStream> {
        Ok(UnixStream::connect(&self.path)?)
    }
}

/// Client for an isolated decompressor process.
///
/// The channel is established lazily on first use and re-established after
/// a connection failure: reconnection duplicates both region handles and
/// rebuilds the queue, so region contents are preserved and one retry is
/// attempted per request.
pub struct RemoteDecompressionService {
    connector: Box<dyn SandboxConnector>,
    compressed: SharedRegion,
    decompressed: SharedRegion,
    queue: Option<MessageQueue>,
}

impl RemoteDecompressionService {
    pub fn new(
        connector: Box<dyn SandboxConnector>,
        compressed_capacity: u64,
        decompressed_capacity: u64,
    ) -> Result<Self> {
        Ok(Self {
            connector,
            compressed: SharedRegion::create(compressed_capacity as usize)?,
            decompressed: SharedRegion::create(decompressed_capacity as usize)?,
            queue: None,
        })
    }

    fn setup_frame(&self) -> SetupFrame {
        SetupFrame {
            compressed_path: self.compressed.path().to_path_buf(),
            compressed_len: self.compressed.len() as u64,
            decompressed_path: self.decompressed.path().to_path_buf(),
            decompressed_len: self.decompressed.len() as u64,
        }
    }

    fn connect(&mut self) -> Result<()> {
        // Fresh handles onto the same backing keep buffer contents across
        // the reconnect.
        self.compressed = self.compressed.duplicate()?;
        self.decompressed = self.decompressed.duplicate()?;
        let stream = self.connector.connect()?;
        self.queue = Some(MessageQueue::establish(stream, &self.setup_frame())?);
        debug!("sandbox channel established");
        Ok(())
    }

    fn round_trip(&mut self, request: &DecompressRequest) -> Result<DecompressResponse> {
        if self.queue.is_none() {
            self.connect()?;
        }
        let queue = self.queue.as_mut().ok_or_else(|| Error::protocol("no sandbox channel"))?;
        queue.send_request(request)?;
        queue.recv_response()
    }
}

impl DecompressionService for RemoteDecompressionService {
    fn compressed_capacity(&self) -> u64 {
        self.compressed.len() as u64
    }

    fn decompressed_capacity(&self) -> u64 {
        self.decompressed.len() as u64
    }

    fn write_compressed(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        check_span(self.compressed_capacity(), offset, bytes.len() as u64)?;
        self.compressed.as_mut_slice()[offset as usize..offset as usize + bytes.len()]
            .copy_from_slice(bytes);
        Ok(())
    }

    fn decompress(&mut self, request: &DecompressRequest) -> Result<DecompressResponse> {
        let response = match self.round_trip(request) {
            Ok(response) => response,
            Err(Error::Io(err)) => {
                // The peer went away; rebuild the channel once and retry.
                warn!("sandbox channel lost ({err}), reconnecting");
                self.queue = None;
                self.round_trip(request).map_err(|retry_err| match retry_err {
                    Error::Io(io) => Error::protocol(format!("sandbox peer unreachable: {io}")),
                    other => other,
                })?
            }
            Err(other) => return Err(other),
        };
        check_response(request, response)
    }

    fn read_decompressed(&mut self, offset: u64, dest: &mut [u8]) -> Result<()> {
        check_span(self.decompressed_capacity(), offset, dest.len() as u64)?;
        dest.copy_from_slice(
            &self.decompressed.as_slice()[offset as usize..offset as usize + dest.len()],
        );
        Ok(())
    }
}
