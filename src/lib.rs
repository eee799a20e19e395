//! blobcask — content-addressed blob storage core.
//!
//! Blobs are write-once and identified by the root digest of a Merkle tree
//! over their content.  This crate implements the read/write pipeline
//! around that identity: block layout arithmetic, a seekable chunked
//! compression format with random-access decompression, a pull-based
//! write-side producer family, and a sandboxed decompression protocol that
//! keeps the decoder in an isolated process.

pub mod buffer;
pub mod codec;
pub mod compressor;
pub mod device;
pub mod error;
pub mod layout;
pub mod loader;
pub mod merkle;
pub mod metadata;
pub mod producer;
pub mod sandbox;
pub mod streaming;
pub mod writer;

pub use codec::CompressionAlgorithm;
pub use error::{Error, Result};
pub use layout::{BlobLayout, BlobLayoutFormat};
pub use loader::{BlobLoader, LoadedBlob, PagedBlob};
pub use merkle::Digest;
pub use metadata::BlobMetadata;
pub use writer::BlobWriter;
