use crate::block::block_core::{Block, BlockSector, BLOCK_SIZE};
use crate::fs::fat::Fat;
use crate::fs::handle::{FileDescriptor, HandleTable};
use crate::fs::layout::{Geometry, Superblock, FAT_EOC, FS_FILE_MAX_COUNT};
use crate::fs::root_dir::{validate_name, RootDir};
use crate::fs::{FsError, Result};
use log::{info, warn};
use std::fmt;
use zerocopy::{AsBytes, FromBytes};

/// A mounted filesystem.
///
/// Owns the block device and the in-memory copies of the FAT and root
/// directory; every operation goes through a value of this type, so there is
/// no mounted/unmounted state to track. Mutating operations write their
/// affected metadata blocks back before returning.
pub struct FlatFs {
    disk: Block,
    geometry: Geometry,
    fat: Fat,
    root_dir: RootDir,
    handles: HandleTable,
}

impl FlatFs {
    /// Mount the filesystem on `disk`.
    ///
    /// Validates the superblock signature and geometry against the device,
    /// then loads the FAT and root directory.
    pub fn mount(mut disk: Block) -> Result<FlatFs> {
        let mut buf = [0u8; BLOCK_SIZE];
        disk.read(0, &mut buf)?;
        let superblock = Superblock::ref_from(&buf[..]).ok_or(FsError::InvalidDisk)?;
        let geometry = match superblock.check_integrity(disk.count()) {
            Ok(geometry) => geometry,
            Err(err) => {
                warn!("refusing to mount \"{}\": bad superblock", disk.name());
                return Err(err);
            }
        };

        let fat = Fat::load(&mut disk, &geometry)?;
        disk.read(geometry.root_dir_block(), &mut buf)?;
        let root_dir = RootDir::read_from(&buf[..]).ok_or(FsError::InvalidDisk)?;

        info!(
            "mounted \"{}\": {} data blocks, {} free",
            disk.name(),
            geometry.data_blocks,
            fat.free_count()
        );
        Ok(FlatFs {
            disk,
            geometry,
            fat,
            root_dir,
            handles: HandleTable::new(),
        })
    }

    /// Unmount, returning the underlying device.
    ///
    /// Fails while any file descriptor is open, handing the filesystem back
    /// untouched. Any pending metadata is written back before the device is
    /// released.
    pub fn umount(mut self) -> std::result::Result<Block, (FlatFs, FsError)> {
        if self.handles.open_count() > 0 {
            return Err((self, FsError::HandlesOpen));
        }
        if let Err(err) = self.flush_fat() {
            return Err((self, err));
        }
        if let Err(err) = self.flush_root_dir() {
            return Err((self, err));
        }
        info!("unmounted \"{}\"", self.disk.name());
        Ok(self.disk)
    }

    /// Filesystem-wide diagnostics; the `Display` output is one line per
    /// statistic.
    pub fn info(&self) -> FsInfo {
        FsInfo {
            geometry: self.geometry,
            fat_free: self.fat.free_count(),
            root_dir_free: self.root_dir.free_count(),
        }
    }

    /// Directory listing; the `Display` output is one line per file.
    pub fn ls(&self) -> FsLs<'_> {
        FsLs {
            root_dir: &self.root_dir,
        }
    }

    /// Create an empty file.
    pub fn create(&mut self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.root_dir.create(name)?;
        self.flush_root_dir()
    }

    /// Delete a file and free its blocks. Fails while the file is open.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        validate_name(name)?;
        let index = self.root_dir.find(name).ok_or(FsError::NotFound)?;
        if self.handles.any_open_on(index) {
            return Err(FsError::FileBusy);
        }
        let head = self.root_dir.entry(index).first_data_block.get();
        if head != FAT_EOC {
            self.fat.chain_free(head)?;
        }
        self.root_dir.remove(index);
        self.flush_fat()?;
        self.flush_root_dir()
    }

    /// Open a file; the returned descriptor starts with its cursor at 0.
    pub fn open(&mut self, name: &str) -> Result<FileDescriptor> {
        validate_name(name)?;
        let index = self.root_dir.find(name).ok_or(FsError::NotFound)?;
        self.handles.allocate(index)
    }

    pub fn close(&mut self, fd: FileDescriptor) -> Result<()> {
        self.handles.release(fd)
    }

    /// Current size of the file `fd` refers to.
    pub fn stat(&self, fd: FileDescriptor) -> Result<u32> {
        let handle = self.handles.get(fd)?;
        Ok(self.root_dir.entry(handle.dir_index).size.get())
    }

    /// Move the cursor of `fd`. Positioning exactly at end of file is legal.
    pub fn lseek(&mut self, fd: FileDescriptor, offset: u32) -> Result<()> {
        let size = self.stat(fd)?;
        if offset > size {
            return Err(FsError::OffsetOutOfRange);
        }
        self.handles.get_mut(fd)?.offset = offset;
        Ok(())
    }

    /// Read up to `buf.len()` bytes at the cursor of `fd`.
    ///
    /// Stops at end of file; the cursor advances by the number of bytes
    /// read. Blocks are streamed one at a time rather than materializing the
    /// file.
    pub fn read(&mut self, fd: FileDescriptor, buf: &mut [u8]) -> Result<usize> {
        let handle = *self.handles.get(fd)?;
        let entry = self.root_dir.entry(handle.dir_index);
        let size = entry.size.get();
        let head = entry.first_data_block.get();
        if head == FAT_EOC {
            return Ok(0);
        }
        let offset = handle.offset as usize;
        let wanted = buf.len().min(size.saturating_sub(handle.offset) as usize);
        if wanted == 0 {
            return Ok(0);
        }

        let chain = self.fat.chain_list(head)?;
        let data_start = self.geometry.data_start();
        let first_block = offset / BLOCK_SIZE;
        let mut block_buf = [0u8; BLOCK_SIZE];
        let mut copied = 0;
        for (i, &data_index) in chain.iter().enumerate().skip(first_block) {
            let start = if i == first_block {
                offset % BLOCK_SIZE
            } else {
                0
            };
            let take = (BLOCK_SIZE - start).min(wanted - copied);
            self.disk
                .read(data_start + BlockSector::from(data_index), &mut block_buf)?;
            buf[copied..copied + take].copy_from_slice(&block_buf[start..start + take]);
            copied += take;
            if copied == wanted {
                break;
            }
        }
        if copied < wanted {
            // size_file claims more blocks than the chain holds
            return Err(FsError::Corruption);
        }
        self.handles.get_mut(fd)?.offset += wanted as u32;
        Ok(wanted)
    }

    /// Write `buf` at the cursor of `fd`, extending the file as needed.
    ///
    /// Returns the number of bytes written, which falls short of
    /// `buf.len()` only when the data region fills up; a write that needs
    /// more blocks and gets none writes nothing. The cursor is deliberately
    /// left where it was (see `lseek`).
    pub fn write(&mut self, fd: FileDescriptor, buf: &[u8]) -> Result<usize> {
        let handle = *self.handles.get(fd)?;
        if buf.is_empty() {
            return Ok(0);
        }
        let entry = self.root_dir.entry(handle.dir_index);
        let size = entry.size.get();
        let mut head = entry.first_data_block.get();
        let offset = handle.offset as usize;

        let mut chain = if head == FAT_EOC {
            Vec::new()
        } else {
            self.fat.chain_list(head)?
        };
        let existing_blocks = chain.len();

        let needed_blocks = (offset + buf.len()).div_ceil(BLOCK_SIZE);
        while chain.len() < needed_blocks {
            match self.fat.chain_extend(chain.last().copied()) {
                Some(new_block) => {
                    if chain.is_empty() {
                        head = new_block;
                    }
                    chain.push(new_block);
                }
                None => break,
            }
        }

        let written = if chain.len() >= needed_blocks {
            buf.len()
        } else if chain.len() == existing_blocks {
            // needed to grow but the data region is exhausted
            0
        } else {
            (chain.len() * BLOCK_SIZE).saturating_sub(offset)
        };
        if written == 0 {
            return Ok(0);
        }

        let data_start = self.geometry.data_start();
        let first_block = offset / BLOCK_SIZE;
        let mut block_buf = [0u8; BLOCK_SIZE];
        let mut copied = 0;
        for (i, &data_index) in chain.iter().enumerate().skip(first_block) {
            let start = if i == first_block {
                offset % BLOCK_SIZE
            } else {
                0
            };
            let take = (BLOCK_SIZE - start).min(written - copied);
            let sector = data_start + BlockSector::from(data_index);
            if take == BLOCK_SIZE {
                block_buf.copy_from_slice(&buf[copied..copied + take]);
            } else if i < existing_blocks {
                // partially covered block already holding file data
                self.disk.read(sector, &mut block_buf)?;
                block_buf[start..start + take].copy_from_slice(&buf[copied..copied + take]);
            } else {
                // freshly allocated block, partially covered
                block_buf.fill(0);
                block_buf[start..start + take].copy_from_slice(&buf[copied..copied + take]);
            }
            self.disk.write(sector, &block_buf)?;
            copied += take;
            if copied == written {
                break;
            }
        }

        // metadata follows the data writes
        let entry = self.root_dir.entry_mut(handle.dir_index);
        entry.first_data_block.set(head);
        entry.size.set(size.max((offset + written) as u32));
        self.flush_fat()?;
        self.flush_root_dir()?;
        Ok(written)
    }

    fn flush_root_dir(&mut self) -> Result<()> {
        self.disk
            .write(self.geometry.root_dir_block(), self.root_dir.as_bytes())?;
        Ok(())
    }

    fn flush_fat(&mut self) -> Result<()> {
        let mut buf = [0u8; BLOCK_SIZE];
        for fat_block in self.fat.dirty_blocks() {
            self.fat.copy_block_to(fat_block, &mut buf);
            self.disk.write(1 + fat_block as BlockSector, &buf)?;
        }
        self.fat.clear_dirty();
        Ok(())
    }
}

/// Snapshot of filesystem-wide statistics, formatted like:
///
/// ```text
/// FS Info:
/// total_blk_count=4100
/// ...
/// ```
pub struct FsInfo {
    geometry: Geometry,
    fat_free: usize,
    root_dir_free: usize,
}

impl fmt::Display for FsInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "FS Info:")?;
        writeln!(f, "total_blk_count={}", self.geometry.total_blocks)?;
        writeln!(f, "fat_blk_count={}", self.geometry.fat_blocks)?;
        writeln!(f, "rdir_blk={}", self.geometry.root_dir_block())?;
        writeln!(f, "data_blk={}", self.geometry.data_start())?;
        writeln!(f, "data_blk_count={}", self.geometry.data_blocks)?;
        writeln!(
            f,
            "fat_free_ratio={}/{}",
            self.fat_free, self.geometry.data_blocks
        )?;
        writeln!(
            f,
            "rdir_free_ratio={}/{}",
            self.root_dir_free, FS_FILE_MAX_COUNT
        )
    }
}

/// Directory listing, one `file:` line per occupied slot.
pub struct FsLs<'a> {
    root_dir: &'a RootDir,
}

impl fmt::Display for FsLs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "FS Ls:")?;
        for entry in self.root_dir.occupied() {
            writeln!(
                f,
                "file: {}, size: {}, data_blk: {}",
                String::from_utf8_lossy(entry.name()),
                entry.size.get(),
                entry.first_data_block.get()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::mkfs::mkfs;

    const B: usize = BLOCK_SIZE;

    /// Format an in-memory disk of `total_blocks` blocks and mount it.
    fn mounted(total_blocks: u32) -> FlatFs {
        let mut disk = Block::in_memory(total_blocks);
        mkfs(&mut disk).unwrap();
        FlatFs::mount(disk).unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn fat_free(fs: &FlatFs) -> usize {
        fs.fat.free_count()
    }

    #[test]
    fn mount_rejects_unformatted_disks() {
        let disk = Block::in_memory(19);
        assert!(matches!(FlatFs::mount(disk), Err(FsError::InvalidDisk)));
    }

    #[test]
    fn small_write_read_round_trip() {
        let mut fs = mounted(19);
        fs.create("hello.txt").unwrap();
        let fd = fs.open("hello.txt").unwrap();
        assert_eq!(fd, 1);
        assert_eq!(fs.write(fd, b"Hi").unwrap(), 2);
        assert_eq!(fs.stat(fd).unwrap(), 2);

        fs.lseek(fd, 0).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(fs.read(fd, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"Hi");
        fs.close(fd).unwrap();
    }

    #[test]
    fn exact_two_block_write_uses_two_fat_entries() {
        let mut fs = mounted(19);
        let free_before = fat_free(&fs);
        fs.create("two").unwrap();
        let fd = fs.open("two").unwrap();
        let data = pattern(2 * B);
        assert_eq!(fs.write(fd, &data).unwrap(), 2 * B);
        assert_eq!(fs.stat(fd).unwrap(), (2 * B) as u32);
        assert_eq!(fat_free(&fs), free_before - 2);

        let head = fs.root_dir.entry(0).first_data_block.get();
        assert_eq!(fs.fat.chain_list(head).unwrap().len(), 2);

        fs.lseek(fd, 0).unwrap();
        let mut back = vec![0u8; 2 * B];
        assert_eq!(fs.read(fd, &mut back).unwrap(), 2 * B);
        assert_eq!(back, data);
    }

    #[test]
    fn read_spanning_three_blocks_from_unaligned_offset() {
        let mut fs = mounted(19);
        fs.create("span").unwrap();
        let fd = fs.open("span").unwrap();
        let data = pattern(3 * B + 1);
        assert_eq!(fs.write(fd, &data).unwrap(), 3 * B + 1);
        assert_eq!(fs.stat(fd).unwrap(), (3 * B + 1) as u32);
        let head = fs.root_dir.entry(0).first_data_block.get();
        assert_eq!(fs.fat.chain_list(head).unwrap().len(), 4);

        let offset = B - 5;
        fs.lseek(fd, offset as u32).unwrap();
        let mut buf = vec![0u8; B + 10];
        assert_eq!(fs.read(fd, &mut buf).unwrap(), B + 10);
        assert_eq!(buf, data[offset..offset + B + 10]);
    }

    #[test]
    fn write_stops_short_when_the_data_region_fills() {
        // total 5 blocks: one usable data block (block 0 is reserved)
        let mut fs = mounted(5);
        fs.create("big").unwrap();
        let fd = fs.open("big").unwrap();
        let data = pattern(B + 100);
        assert_eq!(fs.write(fd, &data).unwrap(), B);
        assert_eq!(fs.stat(fd).unwrap(), B as u32);

        // the cursor does not advance on write, so this starts at 0 again;
        // growing is impossible and nothing is written
        assert_eq!(fs.write(fd, &data).unwrap(), 0);
        assert_eq!(fs.stat(fd).unwrap(), B as u32);

        let mut back = vec![0u8; B];
        assert_eq!(fs.read(fd, &mut back).unwrap(), B);
        assert_eq!(back, data[..B]);
    }

    #[test]
    fn delete_while_open_is_busy() {
        let mut fs = mounted(19);
        fs.create("a").unwrap();
        let fd = fs.open("a").unwrap();
        assert!(matches!(fs.delete("a"), Err(FsError::FileBusy)));
        fs.close(fd).unwrap();
        fs.delete("a").unwrap();
        assert!(matches!(fs.open("a"), Err(FsError::NotFound)));
    }

    #[test]
    fn delete_frees_the_chain_and_create_reuses_the_name() {
        let mut fs = mounted(19);
        let free_before = fat_free(&fs);
        fs.create("a").unwrap();
        let fd = fs.open("a").unwrap();
        fs.write(fd, &pattern(3 * B)).unwrap();
        fs.close(fd).unwrap();
        assert_eq!(fat_free(&fs), free_before - 3);

        fs.delete("a").unwrap();
        assert_eq!(fat_free(&fs), free_before);

        fs.create("a").unwrap();
        let fd = fs.open("a").unwrap();
        assert_eq!(fs.stat(fd).unwrap(), 0);
        let mut buf = [0u8; 8];
        assert_eq!(fs.read(fd, &mut buf).unwrap(), 0);
    }

    #[test]
    fn two_descriptors_share_one_file() {
        let mut fs = mounted(19);
        fs.create("shared").unwrap();
        let writer = fs.open("shared").unwrap();
        let reader = fs.open("shared").unwrap();
        assert_ne!(writer, reader);

        fs.write(writer, b"payload").unwrap();
        assert_eq!(fs.stat(writer).unwrap(), 7);
        assert_eq!(fs.stat(reader).unwrap(), 7);

        let mut buf = [0u8; 16];
        assert_eq!(fs.read(reader, &mut buf).unwrap(), 7);
        assert_eq!(&buf[..7], b"payload");
    }

    #[test]
    fn reads_at_end_of_file_return_zero() {
        let mut fs = mounted(19);
        fs.create("f").unwrap();
        let fd = fs.open("f").unwrap();
        fs.write(fd, &pattern(100)).unwrap();

        fs.lseek(fd, 100).unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(fs.read(fd, &mut buf).unwrap(), 0);
        assert!(matches!(fs.lseek(fd, 101), Err(FsError::OffsetOutOfRange)));
    }

    #[test]
    fn overwriting_inside_a_file_never_grows_it() {
        let mut fs = mounted(19);
        fs.create("f").unwrap();
        let fd = fs.open("f").unwrap();
        let data = pattern(B + 200);
        fs.write(fd, &data).unwrap();
        let free_after_fill = fat_free(&fs);

        // replace bytes 10..60 without moving the end of the file
        fs.lseek(fd, 10).unwrap();
        assert_eq!(fs.write(fd, &[0xEE; 50]).unwrap(), 50);
        assert_eq!(fs.stat(fd).unwrap(), (B + 200) as u32);
        assert_eq!(fat_free(&fs), free_after_fill);

        let mut back = vec![0u8; B + 200];
        fs.lseek(fd, 0).unwrap();
        assert_eq!(fs.read(fd, &mut back).unwrap(), B + 200);
        assert_eq!(back[..10], data[..10]);
        assert!(back[10..60].iter().all(|&b| b == 0xEE));
        assert_eq!(back[60..], data[60..]);
    }

    #[test]
    fn write_at_end_of_file_appends() {
        let mut fs = mounted(19);
        fs.create("f").unwrap();
        let fd = fs.open("f").unwrap();
        let first = pattern(300);
        fs.write(fd, &first).unwrap();

        fs.lseek(fd, 300).unwrap();
        fs.write(fd, b"tail").unwrap();
        assert_eq!(fs.stat(fd).unwrap(), 304);

        fs.lseek(fd, 0).unwrap();
        let mut back = vec![0u8; 304];
        assert_eq!(fs.read(fd, &mut back).unwrap(), 304);
        assert_eq!(back[..300], first[..]);
        assert_eq!(&back[300..], b"tail");
    }

    #[test]
    fn empty_writes_are_no_ops() {
        let mut fs = mounted(19);
        fs.create("f").unwrap();
        let fd = fs.open("f").unwrap();
        assert_eq!(fs.write(fd, &[]).unwrap(), 0);
        assert_eq!(fs.stat(fd).unwrap(), 0);
        assert_eq!(
            fs.ls().to_string(),
            "FS Ls:\nfile: f, size: 0, data_blk: 65535\n"
        );
    }

    #[test]
    fn state_survives_a_remount() {
        let mut fs = mounted(19);
        fs.create("keep.bin").unwrap();
        let fd = fs.open("keep.bin").unwrap();
        let data = pattern(2 * B + 77);
        fs.write(fd, &data).unwrap();
        fs.close(fd).unwrap();
        fs.create("empty").unwrap();
        let info_before = fs.info().to_string();
        let ls_before = fs.ls().to_string();

        let disk = fs.umount().map_err(|(_, err)| err).unwrap();
        let mut fs = FlatFs::mount(disk).unwrap();
        assert_eq!(fs.info().to_string(), info_before);
        assert_eq!(fs.ls().to_string(), ls_before);

        let fd = fs.open("keep.bin").unwrap();
        assert_eq!(fs.stat(fd).unwrap(), (2 * B + 77) as u32);
        let mut back = vec![0u8; 2 * B + 77];
        assert_eq!(fs.read(fd, &mut back).unwrap(), 2 * B + 77);
        assert_eq!(back, data);
    }

    #[test]
    fn umount_refuses_while_descriptors_are_open() {
        let mut fs = mounted(19);
        fs.create("f").unwrap();
        let fd = fs.open("f").unwrap();
        let Err((mut fs, err)) = fs.umount() else {
            panic!("umount should have failed");
        };
        assert!(matches!(err, FsError::HandlesOpen));

        // the filesystem stays usable and unmounts cleanly after close
        fs.close(fd).unwrap();
        fs.umount().map_err(|(_, err)| err).unwrap();
    }

    #[test]
    fn listing_shows_name_size_and_first_block() {
        let mut fs = mounted(19);
        fs.create("a.txt").unwrap();
        let fd = fs.open("a.txt").unwrap();
        fs.write(fd, &pattern(2 * B)).unwrap();
        fs.close(fd).unwrap();
        fs.create("b.txt").unwrap();
        assert_eq!(
            fs.ls().to_string(),
            "FS Ls:\n\
             file: a.txt, size: 8192, data_blk: 1\n\
             file: b.txt, size: 0, data_blk: 65535\n"
        );
    }

    #[test]
    fn free_ratio_accounts_for_every_file_block() {
        let mut fs = mounted(19);
        fs.create("x").unwrap();
        fs.create("y").unwrap();
        let x = fs.open("x").unwrap();
        let y = fs.open("y").unwrap();
        fs.write(x, &pattern(B + 1)).unwrap(); // 2 blocks
        fs.write(y, &pattern(1)).unwrap(); // 1 block
        assert!(fs.info().to_string().contains("fat_free_ratio=12/16"));
        assert!(fs.info().to_string().contains("rdir_free_ratio=126/128"));
    }

    #[test]
    fn chains_interleave_without_crosstalk() {
        // alternate writes so the two files' blocks interleave in the FAT
        let mut fs = mounted(19);
        fs.create("x").unwrap();
        fs.create("y").unwrap();
        let x = fs.open("x").unwrap();
        let y = fs.open("y").unwrap();
        let data_x = pattern(3 * B);
        let data_y: Vec<u8> = pattern(3 * B).iter().map(|b| b ^ 0xFF).collect();
        for i in 0..3 {
            fs.lseek(x, (i * B) as u32).unwrap();
            fs.write(x, &data_x[i * B..(i + 1) * B]).unwrap();
            fs.lseek(y, (i * B) as u32).unwrap();
            fs.write(y, &data_y[i * B..(i + 1) * B]).unwrap();
        }

        let mut back = vec![0u8; 3 * B];
        fs.lseek(x, 0).unwrap();
        assert_eq!(fs.read(x, &mut back).unwrap(), 3 * B);
        assert_eq!(back, data_x);
        fs.lseek(y, 0).unwrap();
        assert_eq!(fs.read(y, &mut back).unwrap(), 3 * B);
        assert_eq!(back, data_y);
    }

    #[test]
    fn partial_allocation_commits_the_bytes_that_fit() {
        // 4 usable data blocks; ask for 6 blocks' worth
        let mut fs = mounted(8);
        assert_eq!(fs.geometry.data_blocks, 5);
        fs.create("f").unwrap();
        let fd = fs.open("f").unwrap();
        let data = pattern(6 * B);
        assert_eq!(fs.write(fd, &data).unwrap(), 4 * B);
        assert_eq!(fs.stat(fd).unwrap(), (4 * B) as u32);
        assert_eq!(fat_free(&fs), 0);

        let mut back = vec![0u8; 6 * B];
        assert_eq!(fs.read(fd, &mut back).unwrap(), 4 * B);
        assert_eq!(back[..4 * B], data[..4 * B]);
    }
}
