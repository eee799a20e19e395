//! Owned scratch buffers with explicit decommit.
//!
//! Large transient buffers (the compressed-side staging buffer, the read
//! buffer) are anonymous mappings rather than heap vectors so that consumed
//! regions can be returned to the OS mid-stream instead of staying resident
//! until drop.  Decommit is an explicit, idempotent method; dropping the
//! buffer unmaps whatever remains.

use memmap2::{MmapMut, UncheckedAdvice};

use crate::error::Result;

pub struct ScratchBuffer {
    map: Option<MmapMut>,
    len: usize,
}

impl ScratchBuffer {
    pub fn new(len: usize) -> Result<Self> {
        if len == 0 {
            return Ok(Self { map: None, len: 0 });
        }
        let map = MmapMut::map_anon(len)?;
        Ok(Self { map: Some(map), len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Empty once released.
    pub fn as_slice(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.map.as_deref_mut().unwrap_or(&mut [])
    }

    /// Return the pages covering `start..end` to the OS.  Idempotent; the
    /// range is clamped to the mapping and rounding to page granularity is
    /// left to the kernel.  The bytes read as zero afterwards.
    pub fn decommit(&mut self, start: usize, end: usize) -> Result<()> {
        let Some(map) = &self.map else { return Ok(()) };
        let end = end.min(self.len);
        if start >= end {
            return Ok(());
        }
        // SAFETY: the mapping is anonymous and exclusively owned, and callers
        // never read a decommitted range again before rewriting it.
        unsafe {
            map.unchecked_advise_range(UncheckedAdvice::DontNeed, start, end - start)?;
        }
        Ok(())
    }

    /// Drop the whole mapping.  Idempotent.
    pub fn release(&mut self) {
        self.map = None;
        self.len = 0;
    }
}
