//! Shared memory regions for the sandbox boundary.
//!
//! Regions are file-backed maps: the client creates a temporary backing
//! file, maps it, and names the path in the connection setup frame; the
//! server opens and maps the same file.  No descriptor passing is needed,
//! and `duplicate` (used on reconnection) is a fresh handle onto the same
//! backing, so buffer contents survive a dropped connection.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{MmapMut, UncheckedAdvice};
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

enum Backing {
    /// Client side: the region owns its temp file; dropping the last
    /// duplicate removes it.  Shared so duplicates keep the path alive for
    /// the server to reopen on reconnection.
    Owned(NamedTempFile),
    /// Server side: opened by path, owned elsewhere.
    Opened(File),
}

impl Backing {
    fn file(&self) -> &File {
        match self {
            Backing::Owned(tmp) => tmp.as_file(),
            Backing::Opened(file) => file,
        }
    }
}

pub struct SharedRegion {
    backing: Arc<Backing>,
    path: PathBuf,
    map: MmapMut,
    len: usize,
}

impl SharedRegion {
    /// Client side: create and map a zeroed region of `len` bytes.
    pub fn create(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::protocol("shared region cannot be empty"));
        }
        let tmp = NamedTempFile::new()?;
        tmp.as_file().set_len(len as u64)?;
        let path = tmp.path().to_path_buf();
        let map = Self::map(tmp.as_file(), len)?;
        Ok(Self { backing: Arc::new(Backing::Owned(tmp)), path, map, len })
    }

    /// Server side: map a region the client created.
    pub fn open(path: &Path, len: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let actual = file.metadata()?.len();
        if actual < len as u64 {
            return Err(Error::protocol(format!(
                "region backing is {actual} bytes, setup declared {len}"
            )));
        }
        let map = Self::map(&file, len)?;
        Ok(Self { backing: Arc::new(Backing::Opened(file)), path: path.to_path_buf(), map, len })
    }

    /// A fresh mapping of the same backing.  Contents are shared and the
    /// backing (including a client temp file's path) stays alive for as
    /// long as any duplicate does.
    pub fn duplicate(&self) -> Result<Self> {
        let map = Self::map(self.backing.file(), self.len)?;
        Ok(Self {
            backing: Arc::clone(&self.backing),
            path: self.path.clone(),
            map,
            len: self.len,
        })
    }

    fn map(file: &File, len: usize) -> Result<MmapMut> {
        // SAFETY: the backing file's length was set (or checked) to cover
        // `len`, and the protocol gives each side exclusive write access to
        // its region for the duration of a request.
        let map = unsafe { MmapMut::map_mut(file)? };
        if map.len() < len {
            return Err(Error::protocol("region mapping shorter than declared"));
        }
        Ok(map)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map[..self.len]
    }

    /// Return the region's pages to the OS.  Idempotent.
    pub fn decommit(&mut self) -> Result<()> {
        // SAFETY: the region is not read again until rewritten.
        unsafe {
            self.map.unchecked_advise(UncheckedAdvice::DontNeed)?;
        }
        Ok(())
    }
}
