use crate::block::block_core::{Block, BLOCK_SIZE};
use crate::fs::layout::{Geometry, FAT_ENTRIES_PER_BLOCK, FAT_EOC};
use crate::fs::{FsError, Result};
use zerocopy::AsBytes;

/// File Allocation Table
///
/// One u16 entry per data block: 0 marks a free block, `FAT_EOC` the last
/// block of a file, and any other value the index of the next block in the
/// chain. Entry 0 is permanently `FAT_EOC`, reserving data block 0.
///
/// All operations are in-memory; mutations record which FAT blocks they
/// dirtied and the caller flushes them.
pub struct Fat {
    entries: Vec<u16>,
    /// Entries at or past this index do not correspond to data blocks.
    data_blocks: usize,
    /// Per-FAT-block dirty flags, indexed relative to the FAT region.
    dirty: Vec<bool>,
}

impl Fat {
    /// Read the FAT from blocks `1..=fat_blocks` and validate every entry
    /// that maps to a data block.
    pub fn load(disk: &mut Block, geometry: &Geometry) -> Result<Self> {
        let fat_blocks = usize::from(geometry.fat_blocks);
        let mut entries = vec![0u16; fat_blocks * FAT_ENTRIES_PER_BLOCK];
        for i in 0..fat_blocks {
            disk.read(
                1 + i as u32,
                entries[i * FAT_ENTRIES_PER_BLOCK..(i + 1) * FAT_ENTRIES_PER_BLOCK]
                    .as_bytes_mut(),
            )?;
        }

        #[cfg(target_endian = "big")]
        // FAT entries are stored in little endian
        for entry in entries.iter_mut() {
            *entry = entry.swap_bytes();
        }

        let data_blocks = usize::from(geometry.data_blocks);
        let fat = Fat {
            entries,
            data_blocks,
            dirty: vec![false; fat_blocks],
        };
        if fat.entry(0) != FAT_EOC {
            return Err(FsError::Corruption);
        }
        for i in 1..data_blocks as u16 {
            let next = fat.entry(i);
            if next != 0 && next != FAT_EOC && usize::from(next) >= data_blocks {
                return Err(FsError::Corruption);
            }
        }
        Ok(fat)
    }

    pub fn entry(&self, index: u16) -> u16 {
        self.entries[usize::from(index)]
    }

    fn set_entry(&mut self, index: u16, value: u16) {
        self.entries[usize::from(index)] = value;
        self.dirty[usize::from(index) / FAT_ENTRIES_PER_BLOCK] = true;
    }

    /// Materialize the chain starting at `head` as an ordered list of
    /// data-block indices. A `FAT_EOC` head is an empty chain.
    ///
    /// Iteration is bounded by the number of data blocks; a longer walk, a
    /// link out of the data region, or a link to a free entry means the
    /// table no longer describes a valid chain.
    pub fn chain_list(&self, head: u16) -> Result<Vec<u16>> {
        let mut chain = Vec::new();
        if head == FAT_EOC {
            return Ok(chain);
        }
        let mut current = head;
        loop {
            if current == 0 || usize::from(current) >= self.data_blocks {
                return Err(FsError::Corruption);
            }
            if chain.len() >= self.data_blocks {
                // longer than the data region: the chain loops
                return Err(FsError::Corruption);
            }
            chain.push(current);
            let next = self.entry(current);
            if next == FAT_EOC {
                return Ok(chain);
            }
            if next == 0 {
                return Err(FsError::Corruption);
            }
            current = next;
        }
    }

    /// Free every block of the chain rooted at `head`, including the final
    /// `FAT_EOC` slot.
    pub fn chain_free(&mut self, head: u16) -> Result<()> {
        for index in self.chain_list(head)? {
            self.set_entry(index, 0);
        }
        Ok(())
    }

    /// Allocate one block and append it to the chain ending at `tail`
    /// (`None` starts a new chain).
    ///
    /// First-fit scan over the whole table, skipping reserved entry 0.
    /// Returns `None` when the data region is exhausted.
    pub fn chain_extend(&mut self, tail: Option<u16>) -> Option<u16> {
        let new_block = (1..self.data_blocks as u16).find(|&i| self.entry(i) == 0)?;
        self.set_entry(new_block, FAT_EOC);
        if let Some(tail) = tail {
            self.set_entry(tail, new_block);
        }
        Some(new_block)
    }

    /// Number of free data blocks.
    pub fn free_count(&self) -> usize {
        self.entries[1..self.data_blocks]
            .iter()
            .filter(|&&entry| entry == 0)
            .count()
    }

    /// FAT block indices (relative to the start of the FAT region) dirtied
    /// since the last [`Fat::clear_dirty`].
    pub fn dirty_blocks(&self) -> Vec<usize> {
        (0..self.dirty.len()).filter(|&i| self.dirty[i]).collect()
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.fill(false);
    }

    /// Serialize one FAT block into `buf` (little-endian).
    pub fn copy_block_to(&self, fat_block: usize, buf: &mut [u8; BLOCK_SIZE]) {
        let start = fat_block * FAT_ENTRIES_PER_BLOCK;
        let entries = &self.entries[start..start + FAT_ENTRIES_PER_BLOCK];
        for (chunk, entry) in buf.chunks_exact_mut(2).zip(entries.iter()) {
            chunk.copy_from_slice(&entry.to_le_bytes());
        }
    }
}

impl core::fmt::Debug for Fat {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "<FAT data_blocks={} free={}>",
            self.data_blocks,
            self.free_count()
        )
    }
}
