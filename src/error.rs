use std::io;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Crate-wide error taxonomy.
///
/// Four families, handled differently by callers:
/// - I/O errors abort the current operation and surface as-is.
/// - Data-integrity errors are reported to the corruption notifier (when one
///   is registered) before surfacing. They are never silently repaired.
/// - Capacity errors (`OutOfRange`, `BufferTooSmall`) are caller mistakes or
///   bounded-lookup misses.
/// - Protocol errors cover the sandbox channel and unsupported metadata.
#[derive(Error, Debug)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Merkle mismatch, seek-table tamper, size mismatch, non-zero padding.
    #[error("data integrity error: {0}")]
    Corrupt(String),

    /// Requested range is not covered, or a bounded lookup cannot fit.
    #[error("requested range is out of range")]
    OutOfRange,

    #[error("destination buffer too small: needed {needed} bytes, got {got}")]
    BufferTooSmall { needed: u64, got: u64 },

    #[error("arithmetic overflow in block arithmetic")]
    Overflow,

    /// Sandbox channel violation: peer closed, malformed record, or a
    /// whole-archive request with a non-zero decompressed offset.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Error::Corrupt(reason.into())
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Error::Protocol(reason.into())
    }

    /// True for the data-integrity family (notifier-reported).
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corrupt(_))
    }
}
