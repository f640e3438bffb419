// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! # Inode allocator
//!
//! Groups are visited in order. A group qualifies when its free inode count
//! is at least the volume-wide per-group average and it still has a free
//! block for the new inode's data.

use log::{debug, error, trace};

use crate::{
    bitmap,
    blockdev::BlockDevice,
    error::{Ext4Error, Ext4Result},
    filesystem::Ext4Filesystem,
};

impl<D: BlockDevice> Ext4Filesystem<D> {
    /// Reserve an inode number. The inode record itself is left untouched.
    pub fn alloc_inode_index(&self, is_dir: bool) -> Ext4Result<u32> {
        self.ensure_writable()?;
        let (group_count, ipg, average) = {
            let sb = self.sb();
            let count = sb.block_group_count();
            (count, sb.inodes_per_group(), sb.free_inodes_count() / count)
        };

        for bgid in 0..group_count {
            let mut group = self.get_block_group_ref(bgid)?;
            let free_inodes = group.free_inodes_count();
            if free_inodes < average || free_inodes == 0 || group.free_blocks_count() == 0 {
                continue;
            }

            let inodes_in_group = self.sb().inodes_in_group(bgid);
            let found = {
                let mut bitmap_block = self.cache.get(group.inode_bitmap())?;
                let mut data = bitmap_block.data_mut();
                bitmap::find_free_bit_and_set(&mut data, 0, inodes_in_group)
            };
            let Some(index_in_group) = found else {
                debug!("group {bgid} claims {free_inodes} free inodes but its bitmap is full");
                continue;
            };

            let desc = group.desc_mut();
            desc.set_free_inodes_count(free_inodes - 1);
            if is_dir {
                let dirs = desc.used_dirs_count();
                desc.set_used_dirs_count(dirs + 1);
            }
            let unused = desc.itable_unused();
            if index_in_group >= inodes_in_group.saturating_sub(unused) {
                desc.set_itable_unused(inodes_in_group - (index_in_group + 1));
            }
            drop(group);

            {
                let mut sb = self.sb_mut();
                let free = sb.free_inodes_count();
                sb.set_free_inodes_count(free.saturating_sub(1));
            }

            let index = bgid * ipg + index_in_group + 1;
            trace!("allocated inode {index} in group {bgid}");
            return Ok(index);
        }

        error!("no group can host a new inode");
        Err(Ext4Error::NoSpace)
    }

    /// Return inode `index` to its group's bitmap.
    pub fn free_inode_index(&self, index: u32, is_dir: bool) -> Ext4Result<()> {
        self.ensure_writable()?;
        let ipg = self.sb().inodes_per_group();
        if index == 0 || index > self.sb().s_inodes_count {
            return Err(Ext4Error::InvalidInput);
        }
        let bgid = (index - 1) / ipg;
        let index_in_group = (index - 1) % ipg;

        let mut group = self.get_block_group_ref(bgid)?;
        {
            let mut bitmap_block = self.cache.get(group.inode_bitmap())?;
            if bitmap::is_bit_free(&bitmap_block.data(), index_in_group) {
                error!("inode {index} freed twice");
                return Err(Ext4Error::Corrupted);
            }
            bitmap::clear_bit(&mut bitmap_block.data_mut(), index_in_group);
        }

        let desc = group.desc_mut();
        let free = desc.free_inodes_count();
        desc.set_free_inodes_count(free + 1);
        if is_dir {
            let dirs = desc.used_dirs_count();
            desc.set_used_dirs_count(dirs.saturating_sub(1));
        }
        drop(group);

        let mut sb = self.sb_mut();
        let free = sb.free_inodes_count();
        sb.set_free_inodes_count(free + 1);
        trace!("freed inode {index}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blockdev::RamDisk,
        config::{FormatOptions, MountOptions},
        mkfs,
    };

    fn setup_fs(blocks_count: u64, inodes_per_group: u32) -> Ext4Filesystem<RamDisk> {
        let opts = FormatOptions {
            block_size: 1024,
            blocks_count,
            blocks_per_group: 8192,
            inodes_per_group,
            ..FormatOptions::default()
        };
        let disk = mkfs::format(RamDisk::new(blocks_count as usize * 1024), &opts).unwrap();
        Ext4Filesystem::open(disk, MountOptions::default()).unwrap()
    }

    fn inode_bit(fs: &Ext4Filesystem<RamDisk>, index: u32) -> bool {
        let ipg = fs.sb().inodes_per_group();
        let group = fs.get_block_group_ref((index - 1) / ipg).unwrap();
        let block = fs.cache.get(group.inode_bitmap()).unwrap();
        bitmap::is_bit_set(&block.data(), (index - 1) % ipg)
    }

    #[test]
    fn first_free_inode_follows_reserved_range() {
        let fs = setup_fs(8192, 128);
        let first = fs.sb().first_inode();
        assert_eq!(fs.alloc_inode_index(false).unwrap(), first);
        assert_eq!(fs.alloc_inode_index(false).unwrap(), first + 1);
        assert!(inode_bit(&fs, first));
    }

    #[test]
    fn directory_allocation_tracks_used_dirs() {
        let fs = setup_fs(8192, 128);
        let dirs = fs.get_block_group_ref(0).unwrap().used_dirs_count();
        let free = fs.superblock().free_inodes_count();

        let index = fs.alloc_inode_index(true).unwrap();
        assert_eq!(
            fs.get_block_group_ref(0).unwrap().used_dirs_count(),
            dirs + 1
        );
        assert_eq!(fs.superblock().free_inodes_count(), free - 1);

        fs.free_inode_index(index, true).unwrap();
        assert!(!inode_bit(&fs, index));
        let group = fs.get_block_group_ref(0).unwrap();
        assert_eq!(group.used_dirs_count(), dirs);
        drop(group);
        assert_eq!(fs.superblock().free_inodes_count(), free);
    }

    #[test]
    fn itable_unused_shrinks_past_high_water_mark() {
        let fs = setup_fs(8192, 128);
        let before = fs.get_block_group_ref(0).unwrap().itable_unused();
        let index = fs.alloc_inode_index(false).unwrap();
        let after = fs.get_block_group_ref(0).unwrap().itable_unused();
        assert!(after <= before);
        assert_eq!(after, 128 - index);
    }

    #[test]
    fn oversized_itable_unused_is_repaired() {
        let fs = setup_fs(8192, 128);
        fs.get_block_group_ref(0)
            .unwrap()
            .desc_mut()
            .set_itable_unused(500);
        let index = fs.alloc_inode_index(false).unwrap();
        assert_eq!(fs.get_block_group_ref(0).unwrap().itable_unused(), 128 - index);
    }

    #[test]
    fn busier_group_is_skipped_for_the_average() {
        let fs = setup_fs(16384, 128);
        // group 0 holds the reserved inodes, so it sits below the average
        let index = fs.alloc_inode_index(false).unwrap();
        assert_eq!((index - 1) / 128, 1);
    }

    #[test]
    fn double_free_is_corruption() {
        let fs = setup_fs(8192, 128);
        let index = fs.alloc_inode_index(false).unwrap();
        fs.free_inode_index(index, false).unwrap();
        assert_eq!(
            fs.free_inode_index(index, false),
            Err(Ext4Error::Corrupted)
        );
    }

    #[test]
    fn exhausting_inodes_reports_no_space() {
        let fs = setup_fs(8192, 16);
        let free = fs.superblock().free_inodes_count();
        for _ in 0..free {
            fs.alloc_inode_index(false).unwrap();
        }
        assert_eq!(fs.alloc_inode_index(false), Err(Ext4Error::NoSpace));
    }
}
