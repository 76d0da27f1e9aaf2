use crate::fs::layout::{RawDirEntry, FAT_EOC, FS_FILENAME_LEN, FS_FILE_MAX_COUNT};
use crate::fs::{FsError, Result};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// The root directory: one block of 128 fixed-size entries.
///
/// Lookups and slot allocation are linear scans, which is fine at this size.
#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct RootDir {
    entries: [RawDirEntry; FS_FILE_MAX_COUNT],
}

/// A name is valid if it has at least one byte, fits in the on-disk field
/// with its terminating NUL, and contains no interior NUL (the field is a C
/// string on disk).
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() >= FS_FILENAME_LEN || name.bytes().any(|b| b == 0) {
        return Err(FsError::InvalidName);
    }
    Ok(())
}

impl RootDir {
    /// Index of the entry whose name matches `name` byte for byte.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| !entry.is_free() && entry.name() == name.as_bytes())
    }

    /// Claim a free slot for a new empty file and return its index.
    pub fn create(&mut self, name: &str) -> Result<usize> {
        if self.find(name).is_some() {
            return Err(FsError::Exists);
        }
        let index = self
            .entries
            .iter()
            .position(RawDirEntry::is_free)
            .ok_or(FsError::DirFull)?;
        let entry = &mut self.entries[index];
        entry.set_name(name);
        entry.size.set(0);
        entry.first_data_block.set(FAT_EOC);
        Ok(index)
    }

    /// Release a slot. The first name byte going to NUL is what frees the
    /// slot; size and chain head are cleared with it.
    pub fn remove(&mut self, index: usize) {
        let entry = &mut self.entries[index];
        entry.filename[0] = 0;
        entry.size.set(0);
        entry.first_data_block.set(0);
    }

    pub fn entry(&self, index: usize) -> &RawDirEntry {
        &self.entries[index]
    }

    pub fn entry_mut(&mut self, index: usize) -> &mut RawDirEntry {
        &mut self.entries[index]
    }

    pub fn free_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_free()).count()
    }

    pub fn occupied(&self) -> impl Iterator<Item = &RawDirEntry> {
        self.entries.iter().filter(|entry| !entry.is_free())
    }
}
