//! Merkle tree collaborator: BLAKE3 flat tree over content blocks.
//!
//! The core consumes this module only through [`TreeVerifier`]: construct a
//! verifier from a stored root digest (plus tree bytes when the tree is
//! non-degenerate), feed it candidate bytes, get pass/fail.
//!
//! # Tree shape
//!
//! One leaf digest per `block_size` slice of content (the final leaf covers
//! the exact tail, not a zero-padded block).  Blobs of at most one block
//! degenerate to the stored root digest alone: the root IS the content
//! digest and `tree_size` is zero, so no tree bytes are ever read from disk.
//! For larger blobs the tree bytes are the concatenated leaf digests and the
//! root is the digest of those bytes.

use std::fmt;

use crate::error::{Error, Result};

pub const DIGEST_LEN: usize = 32;

// ── Digest ───────────────────────────────────────────────────────────────────

/// A BLAKE3 content digest.  The root digest is a blob's identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl From<blake3::Hash> for Digest {
    fn from(h: blake3::Hash) -> Self {
        Digest(*h.as_bytes())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self)
    }
}

// ── Size derivation ──────────────────────────────────────────────────────────

/// Bytes of tree data stored on disk for a blob of `file_size` bytes.
///
/// Zero when the tree degenerates to the root digest (at most one leaf).
pub fn tree_size(file_size: u64, block_size: u64) -> u64 {
    let leaves = file_size.div_ceil(block_size);
    if leaves <= 1 {
        0
    } else {
        leaves * DIGEST_LEN as u64
    }
}

// ── Creator (write path) ─────────────────────────────────────────────────────

/// Builds the tree over streamed content.  `finish` yields the root digest
/// and the on-disk tree bytes (empty for degenerate trees).
pub struct MerkleTreeCreator {
    block_size: u64,
    pending: Vec<u8>,
    leaves: Vec<[u8; DIGEST_LEN]>,
}

impl MerkleTreeCreator {
    pub fn new(block_size: u64) -> Self {
        Self { block_size, pending: Vec::new(), leaves: Vec::new() }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        let block = self.block_size as usize;
        while !data.is_empty() {
            let take = (block - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() == block {
                self.leaves.push(*blake3::hash(&self.pending).as_bytes());
                self.pending.clear();
            }
        }
    }

    pub fn finish(mut self) -> (Digest, Vec<u8>) {
        if !self.pending.is_empty() {
            self.leaves.push(*blake3::hash(&self.pending).as_bytes());
        }
        match self.leaves.len() {
            // Root of zero bytes of content.
            0 => (blake3::hash(b"").into(), Vec::new()),
            // Degenerate: root is the content digest itself, no tree bytes.
            1 => (Digest(self.leaves[0]), Vec::new()),
            _ => {
                let mut tree = Vec::with_capacity(self.leaves.len() * DIGEST_LEN);
                for leaf in &self.leaves {
                    tree.extend_from_slice(leaf);
                }
                (blake3::hash(&tree).into(), tree)
            }
        }
    }
}

/// Convenience: root digest of a complete in-memory buffer.
pub fn root_for(data: &[u8], block_size: u64) -> Digest {
    let mut creator = MerkleTreeCreator::new(block_size);
    creator.update(data);
    creator.finish().0
}

// ── Verifier (read path) ─────────────────────────────────────────────────────

/// The verification capability the loader and page supplier consume.
pub trait TreeVerifier: Send + Sync {
    /// Verify a complete content buffer.  `data` must hold at least
    /// `file_size` bytes; bytes past `file_size` are ignored here (the
    /// loader owns the zero-padding checks, which are layout-aware).
    fn verify(&self, data: &[u8]) -> Result<()>;

    /// Verify a block-aligned sub-range starting at content byte `offset`.
    /// `data` may extend past the end of the content only by the final
    /// partial block's tail, which must be zero.
    fn verify_range(&self, data: &[u8], offset: u64) -> Result<()>;
}

/// BLAKE3 flat-tree verifier.
pub struct MerkleTreeVerifier {
    root: Digest,
    leaves: Vec<[u8; DIGEST_LEN]>,
    file_size: u64,
    block_size: u64,
}

impl MerkleTreeVerifier {
    /// For degenerate trees (`tree_size == 0`): the root digest alone.
    pub fn from_root(root: Digest, file_size: u64, block_size: u64) -> Result<Self> {
        if tree_size(file_size, block_size) != 0 {
            return Err(Error::corrupt(format!(
                "blob of {file_size} bytes requires stored tree data"
            )));
        }
        Ok(Self { root, leaves: Vec::new(), file_size, block_size })
    }

    /// For non-degenerate trees: tree bytes loaded from disk, which must
    /// hash to the stored root.
    pub fn from_tree(
        root: Digest,
        tree_bytes: &[u8],
        file_size: u64,
        block_size: u64,
    ) -> Result<Self> {
        let expected = tree_size(file_size, block_size);
        if tree_bytes.len() as u64 != expected {
            return Err(Error::corrupt(format!(
                "tree is {} bytes, expected {expected}",
                tree_bytes.len()
            )));
        }
        if *blake3::hash(tree_bytes).as_bytes() != root.0 {
            return Err(Error::corrupt(format!("tree data does not hash to root {root}")));
        }
        let leaves = tree_bytes
            .chunks_exact(DIGEST_LEN)
            .map(|c| {
                let mut leaf = [0u8; DIGEST_LEN];
                leaf.copy_from_slice(c);
                leaf
            })
            .collect();
        Ok(Self { root, leaves, file_size, block_size })
    }

    fn check_leaf(&self, index: usize, block: &[u8]) -> Result<()> {
        let actual = *blake3::hash(block).as_bytes();
        let expected = if self.leaves.is_empty() { self.root.0 } else { self.leaves[index] };
        if actual != expected {
            return Err(Error::corrupt(format!(
                "content block {index} does not match tree (root {})",
                self.root
            )));
        }
        Ok(())
    }
}

impl TreeVerifier for MerkleTreeVerifier {
    fn verify(&self, data: &[u8]) -> Result<()> {
        if (data.len() as u64) < self.file_size {
            return Err(Error::BufferTooSmall {
                needed: self.file_size,
                got: data.len() as u64,
            });
        }
        if self.file_size == 0 {
            if *blake3::hash(b"").as_bytes() != self.root.0 {
                return Err(Error::corrupt(format!(
                    "empty blob root mismatch (stored {})",
                    self.root
                )));
            }
            return Ok(());
        }
        self.verify_range(&data[..self.file_size as usize], 0)
    }

    fn verify_range(&self, data: &[u8], offset: u64) -> Result<()> {
        if offset % self.block_size != 0 {
            return Err(Error::OutOfRange);
        }
        let end = offset.checked_add(data.len() as u64).ok_or(Error::OutOfRange)?;
        // Tolerate a block-aligned tail past the content end, but it must be
        // all zeros: the supplier hands out whole blocks.
        let content_len = if end > self.file_size {
            if offset >= self.file_size && self.file_size > 0 {
                return Err(Error::OutOfRange);
            }
            let pad = &data[(self.file_size - offset) as usize..];
            if pad.len() as u64 >= self.block_size {
                return Err(Error::OutOfRange);
            }
            if pad.iter().any(|&b| b != 0) {
                return Err(Error::corrupt("non-zero bytes past content end"));
            }
            (self.file_size - offset) as usize
        } else {
            data.len()
        };

        let block = self.block_size as usize;
        let first_leaf = (offset / self.block_size) as usize;
        for (i, chunk) in data[..content_len].chunks(block).enumerate() {
            let leaf = first_leaf + i;
            // Every leaf but the file's last covers a full block.
            let leaf_end = (leaf as u64 + 1) * self.block_size;
            if leaf_end < self.file_size && chunk.len() != block {
                return Err(Error::OutOfRange);
            }
            self.check_leaf(leaf, chunk)?;
        }
        Ok(())
    }
}
