//! Fixed-record message queue over a Unix-domain stream.
//!
//! Every connection starts with one variable-length setup frame naming the
//! two shared regions; after that the stream carries only fixed-size
//! request and response records, at most [`QUEUE_DEPTH`] requests in
//! flight.  All framing is little-endian.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::sandbox::{
    DecompressRequest, DecompressResponse, QUEUE_DEPTH, REQUEST_RECORD_SIZE,
    RESPONSE_RECORD_SIZE,
};

pub const SETUP_MAGIC: u32 = u32::from_le_bytes(*b"CSBX");

/// Names the client's shared regions for the server to map.
#[derive(Debug, Clone)]
pub struct SetupFrame {
    pub compressed_path: PathBuf,
    pub compressed_len: u64,
    pub decompressed_path: PathBuf,
    pub decompressed_len: u64,
}

fn write_path<W: Write>(mut writer: W, path: &PathBuf) -> Result<()> {
    let bytes = path.as_os_str().as_encoded_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(Error::protocol("region path too long for setup frame"));
    }
    writer.write_u16::<LittleEndian>(bytes.len() as u16)?;
    writer.write_all(bytes)?;
    Ok(())
}

fn read_path<R: Read>(mut reader: R) -> Result<PathBuf> {
    let len = reader.read_u16::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    let s = String::from_utf8(bytes)
        .map_err(|_| Error::protocol("region path is not valid UTF-8"))?;
    Ok(PathBuf::from(s))
}

impl SetupFrame {
    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_u32::<LittleEndian>(SETUP_MAGIC)?;
        write_path(&mut writer, &self.compressed_path)?;
        writer.write_u64::<LittleEndian>(self.compressed_len)?;
        write_path(&mut writer, &self.decompressed_path)?;
        writer.write_u64::<LittleEndian>(self.decompressed_len)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != SETUP_MAGIC {
            return Err(Error::protocol(format!("bad setup magic {magic:#010x}")));
        }
        let compressed_path = read_path(&mut reader)?;
        let compressed_len = reader.read_u64::<LittleEndian>()?;
        let decompressed_path = read_path(&mut reader)?;
        let decompressed_len = reader.read_u64::<LittleEndian>()?;
        Ok(Self { compressed_path, compressed_len, decompressed_path, decompressed_len })
    }
}

// ── Client end of the queue ──────────────────────────────────────────────────

pub struct MessageQueue {
    stream: UnixStream,
    in_flight: usize,
}

impl MessageQueue {
    /// Wrap a fresh connection, sending the setup frame first.
    pub fn establish(mut stream: UnixStream, setup: &SetupFrame) -> Result<Self> {
        setup.write(&mut stream)?;
        stream.flush()?;
        Ok(Self { stream, in_flight: 0 })
    }

    /// Write exactly one request record.
    pub fn send_request(&mut self, request: &DecompressRequest) -> Result<()> {
        if self.in_flight >= QUEUE_DEPTH {
            return Err(Error::protocol(format!("message queue full ({QUEUE_DEPTH} in flight)")));
        }
        self.stream.write_all(&request.encode())?;
        self.stream.flush()?;
        self.in_flight += 1;
        Ok(())
    }

    /// Block until exactly one response record arrives.
    pub fn recv_response(&mut self) -> Result<DecompressResponse> {
        let mut record = [0u8; RESPONSE_RECORD_SIZE];
        self.stream.read_exact(&mut record)?;
        self.in_flight = self.in_flight.saturating_sub(1);
        DecompressResponse::decode(&record)
    }
}

// ── Server end of the queue ──────────────────────────────────────────────────

/// Reads one request record; `Ok(None)` on a cleanly closed peer.
pub fn read_request(stream: &mut UnixStream) -> Result<Option<DecompressRequest>> {
    let mut record = [0u8; REQUEST_RECORD_SIZE];
    let mut filled = 0;
    while filled < record.len() {
        let n = stream.read(&mut record[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::protocol("peer closed mid-record"));
        }
        filled += n;
    }
    Ok(Some(DecompressRequest::decode(&record)?))
}

pub fn write_response(stream: &mut UnixStream, response: &DecompressResponse) -> Result<()> {
    stream.write_all(&response.encode())?;
    stream.flush()?;
    Ok(())
}
