//! Whole-file memory mapping with truncate-and-remap growth.
//!
//! The writer maps the entire file read-write. Growth extends the file
//! with `ftruncate` in fixed increments and replaces the map; shrinking
//! happens once, when a file goes offline and is trimmed to its used
//! length. Readers map the file read-only at its current length.
//!
//! Remapping invalidates previous views, so no reference derived from the
//! map may be held across a call that can grow the file. The accessors in
//! `file.rs` copy small headers out instead of holding borrows.

use crate::error::Result;
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::File;

/// Growth increment for writable maps. Keeping it modest bounds the
/// over-allocation the space accountant sees for the active file.
pub const FILE_SIZE_INCREASE: u64 = 1024 * 1024;

/// Abstraction over read-only and writable whole-file mappings, so the
/// same object accessors serve readers and the writer.
pub trait MemoryMap {
    fn bytes(&self) -> &[u8];

    /// Mutable view, if this mapping is writable.
    fn bytes_mut_opt(&mut self) -> Option<&mut [u8]> {
        None
    }

    /// Flush dirty pages, if this mapping is writable.
    fn flush_all(&self) -> Result<()> {
        Ok(())
    }
}

pub struct MappedFile {
    map: MmapMut,
    len: u64,
}

impl MappedFile {
    /// Map `file` read-write at `len` bytes, extending it if shorter.
    pub fn create(file: &File, len: u64) -> Result<Self> {
        if file.metadata()?.len() < len {
            file.set_len(len)?;
        }

        let map = unsafe { MmapOptions::new().len(len as usize).map_mut(file)? };
        Ok(Self { map, len })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Ensure at least `needed` bytes are mapped, growing the file in
    /// [`FILE_SIZE_INCREASE`] steps.
    pub fn ensure(&mut self, file: &File, needed: u64) -> Result<()> {
        if needed <= self.len {
            return Ok(());
        }

        let new_len = needed.div_ceil(FILE_SIZE_INCREASE) * FILE_SIZE_INCREASE;
        file.set_len(new_len)?;

        self.map = unsafe { MmapOptions::new().len(new_len as usize).map_mut(file)? };
        self.len = new_len;
        Ok(())
    }

    /// Shrink the file to `len` and remap. Only valid while no borrows of
    /// the map are live.
    pub fn truncate(&mut self, file: &File, len: u64) -> Result<()> {
        file.set_len(len)?;
        self.map = unsafe { MmapOptions::new().len(len as usize).map_mut(file)? };
        self.len = len;
        Ok(())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    /// Flush only the header region; used around state transitions where
    /// the ordering of header vs. arena persistence matters.
    pub fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        self.map.flush_range(offset, len)?;
        Ok(())
    }
}

impl MemoryMap for MappedFile {
    fn bytes(&self) -> &[u8] {
        &self.map
    }

    fn bytes_mut_opt(&mut self) -> Option<&mut [u8]> {
        Some(&mut self.map)
    }

    fn flush_all(&self) -> Result<()> {
        self.flush()
    }
}

/// Read-only map of a complete file.
pub struct ReadMap {
    map: Mmap,
}

impl ReadMap {
    pub fn create(file: &File) -> Result<Self> {
        let map = unsafe { Mmap::map(file)? };
        Ok(Self { map })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }
}

impl MemoryMap for ReadMap {
    fn bytes(&self) -> &[u8] {
        &self.map
    }
}
