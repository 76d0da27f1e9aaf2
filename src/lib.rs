//! A flat filesystem layered over a fixed-size block device.
//!
//! The on-disk layout is three persistent structures followed by a data
//! region, all in 4096-byte blocks:
//!
//! ```text
//! .               | block      | size (blocks)
//! superblock      | 0          | 1
//! FAT             | 1          | F
//! root directory  | F + 1      | 1
//! data region     | F + 2      | D
//! ```
//!
//! The FAT is an array of u16 entries, one per data block. Using FAT entries
//! as next pointers, the data blocks of a file form a chain terminated by
//! [`fs::layout::FAT_EOC`]. The root directory is a single block of 128
//! fixed-size entries; there are no subdirectories.
//!
//! [`FlatFs::mount`] validates the metadata and returns an owning handle
//! through which all file operations go. [`mkfs`] formats a device.

pub mod block;
pub mod fs;

pub use block::block_core::{Block, BlockOp, BlockSector, BLOCK_SIZE};
pub use block::block_error::BlockError;
pub use fs::fs_core::{FlatFs, FsInfo, FsLs};
pub use fs::handle::FileDescriptor;
pub use fs::layout::{Geometry, FS_FILENAME_LEN, FS_FILE_MAX_COUNT, FS_OPEN_MAX_COUNT};
pub use fs::mkfs::mkfs;
pub use fs::{FsError, Result};
