//! Sandboxed decompression protocol.
//!
//! Decompression runs in an isolated process so a decoder vulnerability
//! cannot reach the storage engine's address space.  The two sides share:
//!
//! - a **compressed region** the client fills and the server only reads,
//! - a **decompressed region** the server fills and the client only reads,
//! - a fixed-depth queue of fixed-size request/response records.
//!
//! One request decompresses either a whole archive ([`AlgorithmTag::ChunkedArchive`],
//! decompressed offset must be zero) or one already-bounded frame run
//! ([`AlgorithmTag::ChunkedFrame`]).  The client blocks for exactly one
//! response per request and validates the produced size against the
//! request's declared size.
//!
//! The transport is interchangeable behind [`client::DecompressionService`]:
//! the in-process backend exists for tests and for configurations that
//! disable sandboxing.

pub mod channel;
pub mod client;
pub mod region;
pub mod server;

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// In-flight request records the queue can hold.  This core issues one at a
/// time; the depth exists so higher layers may pipeline.
pub const QUEUE_DEPTH: usize = 8;

pub const REQUEST_RECORD_SIZE: usize = 48;
pub const RESPONSE_RECORD_SIZE: usize = 16;

// ── Ranges and tags ──────────────────────────────────────────────────────────

/// A byte range within one of the shared regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub size: u64,
}

impl ByteRange {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmTag {
    /// Decode a complete archive (header + all frames).
    ChunkedArchive,
    /// Decode a bounded run of frames, no header present.
    ChunkedFrame,
}

impl AlgorithmTag {
    fn to_raw(self) -> u32 {
        match self {
            AlgorithmTag::ChunkedArchive => 1,
            AlgorithmTag::ChunkedFrame => 2,
        }
    }

    fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            1 => Ok(AlgorithmTag::ChunkedArchive),
            2 => Ok(AlgorithmTag::ChunkedFrame),
            other => Err(Error::protocol(format!("unknown algorithm tag {other}"))),
        }
    }
}

// ── Status ───────────────────────────────────────────────────────────────────

/// Result status carried in a response record.  Non-OK statuses map back
/// onto the crate error taxonomy and are propagated verbatim by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    Ok,
    Corrupt,
    OutOfRange,
    Protocol,
    Internal,
}

impl SandboxStatus {
    fn to_raw(self) -> u32 {
        match self {
            SandboxStatus::Ok => 0,
            SandboxStatus::Corrupt => 1,
            SandboxStatus::OutOfRange => 2,
            SandboxStatus::Protocol => 3,
            SandboxStatus::Internal => 4,
        }
    }

    fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(SandboxStatus::Ok),
            1 => Ok(SandboxStatus::Corrupt),
            2 => Ok(SandboxStatus::OutOfRange),
            3 => Ok(SandboxStatus::Protocol),
            4 => Ok(SandboxStatus::Internal),
            other => Err(Error::protocol(format!("unknown sandbox status {other}"))),
        }
    }

    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Corrupt(_) => SandboxStatus::Corrupt,
            Error::OutOfRange | Error::BufferTooSmall { .. } | Error::Overflow => {
                SandboxStatus::OutOfRange
            }
            Error::Protocol(_) | Error::Unsupported(_) => SandboxStatus::Protocol,
            Error::Io(_) => SandboxStatus::Internal,
        }
    }

    pub fn into_error(self) -> Error {
        match self {
            SandboxStatus::Ok => Error::protocol("OK status treated as error"),
            SandboxStatus::Corrupt => Error::corrupt("sandbox reported corrupt data"),
            SandboxStatus::OutOfRange => Error::OutOfRange,
            SandboxStatus::Protocol => Error::protocol("sandbox rejected the request"),
            SandboxStatus::Internal => Error::protocol("sandbox internal failure"),
        }
    }
}

// ── Records ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecompressRequest {
    pub decompressed: ByteRange,
    pub compressed: ByteRange,
    pub algorithm: AlgorithmTag,
}

impl DecompressRequest {
    pub fn encode(&self) -> [u8; REQUEST_RECORD_SIZE] {
        let mut record = [0u8; REQUEST_RECORD_SIZE];
        let mut cursor = Cursor::new(&mut record[..]);
        // Infallible: the cursor writes into a fixed record.
        let _ = cursor.write_u64::<LittleEndian>(self.decompressed.offset);
        let _ = cursor.write_u64::<LittleEndian>(self.decompressed.size);
        let _ = cursor.write_u64::<LittleEndian>(self.compressed.offset);
        let _ = cursor.write_u64::<LittleEndian>(self.compressed.size);
        let _ = cursor.write_u32::<LittleEndian>(self.algorithm.to_raw());
        record
    }

    pub fn decode(record: &[u8; REQUEST_RECORD_SIZE]) -> Result<Self> {
        let mut cursor = Cursor::new(&record[..]);
        let decompressed =
            ByteRange::new(cursor.read_u64::<LittleEndian>()?, cursor.read_u64::<LittleEndian>()?);
        let compressed =
            ByteRange::new(cursor.read_u64::<LittleEndian>()?, cursor.read_u64::<LittleEndian>()?);
        let algorithm = AlgorithmTag::from_raw(cursor.read_u32::<LittleEndian>()?)?;
        Ok(Self { decompressed, compressed, algorithm })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecompressResponse {
    pub status: SandboxStatus,
    /// Decompressed bytes produced; zero unless `status` is OK.
    pub size: u64,
}

impl DecompressResponse {
    pub fn ok(size: u64) -> Self {
        Self { status: SandboxStatus::Ok, size }
    }

    pub fn failed(status: SandboxStatus) -> Self {
        Self { status, size: 0 }
    }

    pub fn encode(&self) -> [u8; RESPONSE_RECORD_SIZE] {
        let mut record = [0u8; RESPONSE_RECORD_SIZE];
        let mut cursor = Cursor::new(&mut record[..]);
        let _ = cursor.write_u32::<LittleEndian>(self.status.to_raw());
        let _ = cursor.write_u32::<LittleEndian>(0); // reserved
        let _ = cursor.write_u64::<LittleEndian>(self.size);
        record
    }

    pub fn decode(record: &[u8; RESPONSE_RECORD_SIZE]) -> Result<Self> {
        let mut cursor = Cursor::new(&record[..]);
        let status = SandboxStatus::from_raw(cursor.read_u32::<LittleEndian>()?)?;
        let _reserved = cursor.read_u32::<LittleEndian>()?;
        let size = cursor.read_u64::<LittleEndian>()?;
        Ok(Self { status, size })
    }
}
