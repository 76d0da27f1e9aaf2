//! On-disk format definitions.
//!
//! All multi-byte integers are little-endian; the zerocopy field types keep
//! the byte order explicit at every (de)serialization boundary so the format
//! round-trips bit-exactly with external tools.

use crate::block::block_core::{BlockSector, BLOCK_SIZE};
use crate::fs::{FsError, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Signature identifying a formatted disk, at the start of block 0.
pub const SIGNATURE: [u8; 8] = *b"ECS150FS";

/// FAT sentinel marking the end of a chain. Also permanently occupies FAT
/// entry 0, so data block 0 is never allocated.
pub const FAT_EOC: u16 = 0xFFFF;

/// FAT entries packed into one FAT block.
pub const FAT_ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / 2;

/// On-disk size of a file name, including the terminating NUL.
pub const FS_FILENAME_LEN: usize = 16;
/// Number of root directory entries.
pub const FS_FILE_MAX_COUNT: usize = 128;
/// Number of file descriptors that can be open simultaneously.
pub const FS_OPEN_MAX_COUNT: usize = 32;

/// The superblock, stored in block 0.
///
/// The whole block is kept so that writing it back is a single block write;
/// everything past the header fields is zero padding.
#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct Superblock {
    pub signature: [u8; 8],
    pub total_block_count: U16,
    pub root_dir_block: U16,
    pub data_block_start: U16,
    pub data_block_count: U16,
    pub fat_block_count: u8,
    pub padding: [u8; 4079],
}

impl Superblock {
    /// Validate the superblock against the device it was read from and
    /// reduce it to a [`Geometry`].
    pub fn check_integrity(&self, device_blocks: BlockSector) -> Result<Geometry> {
        if self.signature != SIGNATURE {
            return Err(FsError::InvalidDisk);
        }
        let total_blocks = self.total_block_count.get();
        if BlockSector::from(total_blocks) != device_blocks {
            return Err(FsError::InvalidDisk);
        }
        let fat_blocks = self.fat_block_count;
        let data_blocks = self.data_block_count.get();
        let geometry = Geometry {
            total_blocks,
            fat_blocks,
            data_blocks,
        };
        if fat_blocks == 0
            || data_blocks == 0
            || u32::from(total_blocks) != 2 + u32::from(fat_blocks) + u32::from(data_blocks)
            || u32::from(self.root_dir_block.get()) != geometry.root_dir_block()
            || u32::from(self.data_block_start.get()) != geometry.data_start()
            || data_blocks as usize > fat_blocks as usize * FAT_ENTRIES_PER_BLOCK
        {
            return Err(FsError::InvalidDisk);
        }
        Ok(geometry)
    }
}

/// One root directory entry.
///
/// A slot is free iff the first byte of `filename` is NUL. Occupied slots
/// hold a NUL-terminated name; an empty file has `first_data_block ==
/// FAT_EOC`.
#[repr(C)]
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct RawDirEntry {
    pub filename: [u8; FS_FILENAME_LEN],
    pub size: U32,
    pub first_data_block: U16,
    pub padding: [u8; 10],
}

impl RawDirEntry {
    pub fn is_free(&self) -> bool {
        self.filename[0] == 0
    }

    /// Name bytes up to (not including) the terminating NUL.
    pub fn name(&self) -> &[u8] {
        let len = self
            .filename
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FS_FILENAME_LEN);
        &self.filename[..len]
    }

    pub fn set_name(&mut self, name: &str) {
        self.filename = [0; FS_FILENAME_LEN];
        self.filename[..name.len()].copy_from_slice(name.as_bytes());
    }
}

/// Validated disk geometry, as carried in the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Total number of blocks on the device
    pub total_blocks: u16,
    /// Number of FAT blocks
    pub fat_blocks: u8,
    /// Number of data blocks
    pub data_blocks: u16,
}

impl Geometry {
    /// Index of the root directory block.
    pub fn root_dir_block(&self) -> BlockSector {
        1 + BlockSector::from(self.fat_blocks)
    }

    /// Index of the first data block.
    pub fn data_start(&self) -> BlockSector {
        2 + BlockSector::from(self.fat_blocks)
    }

    /// Derive the geometry for a device of `device_blocks` blocks: the
    /// smallest FAT that covers the remaining data region.
    ///
    /// Returns `None` if the device is too small to hold the metadata plus
    /// one data block, or too large to be described by the superblock.
    pub fn for_device(device_blocks: BlockSector) -> Option<Geometry> {
        let total_blocks = u16::try_from(device_blocks).ok()?;
        if total_blocks < 4 {
            return None;
        }
        let mut fat_blocks: u16 = 1;
        loop {
            // superblock + FAT + root directory leave this many data blocks
            let data_blocks = total_blocks - 2 - fat_blocks;
            if data_blocks as usize <= fat_blocks as usize * FAT_ENTRIES_PER_BLOCK {
                return Some(Geometry {
                    total_blocks,
                    fat_blocks: u8::try_from(fat_blocks).ok()?,
                    data_blocks,
                });
            }
            fat_blocks += 1;
        }
    }

    pub fn to_superblock(self) -> Box<Superblock> {
        let mut superblock = Superblock::new_box_zeroed();
        superblock.signature = SIGNATURE;
        superblock.total_block_count.set(self.total_blocks);
        superblock
            .root_dir_block
            .set(self.root_dir_block() as u16);
        superblock.data_block_start.set(self.data_start() as u16);
        superblock.data_block_count.set(self.data_blocks);
        superblock.fat_block_count = self.fat_blocks;
        superblock
    }
}
