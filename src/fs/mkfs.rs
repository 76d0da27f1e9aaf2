use crate::block::block_core::{Block, BlockSector, BLOCK_SIZE};
use crate::fs::layout::{Geometry, FAT_EOC};
use crate::fs::{FsError, Result};
use log::info;
use zerocopy::AsBytes;

/// Format `disk` with an empty filesystem.
///
/// The geometry is derived from the device size: the smallest FAT that
/// covers the remaining data region. Writes the superblock, a FAT with only
/// entry 0 occupied (reserving data block 0), and an empty root directory;
/// the data region is left untouched.
pub fn mkfs(disk: &mut Block) -> Result<Geometry> {
    let geometry = Geometry::for_device(disk.count()).ok_or(FsError::InvalidDisk)?;

    let superblock = geometry.to_superblock();
    disk.write(0, superblock.as_bytes())?;

    let mut buf = [0u8; BLOCK_SIZE];
    buf[..2].copy_from_slice(&FAT_EOC.to_le_bytes());
    disk.write(1, &buf)?;
    let zeroes = [0u8; BLOCK_SIZE];
    for fat_block in 1..BlockSector::from(geometry.fat_blocks) {
        disk.write(1 + fat_block, &zeroes)?;
    }

    disk.write(geometry.root_dir_block(), &zeroes)?;

    info!(
        "formatted \"{}\": {} blocks total, {} FAT, {} data",
        disk.name(),
        geometry.total_blocks,
        geometry.fat_blocks,
        geometry.data_blocks
    );
    Ok(geometry)
}
