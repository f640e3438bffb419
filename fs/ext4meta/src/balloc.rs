// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! # Block allocator
//!
//! Goal-directed allocation of data blocks. The goal is the block right
//! after the file's last block, or the first data block of the inode's
//! group for an empty file. The search order is:
//!
//! 1. the goal bit itself;
//! 2. the rest of the goal's 64-bit aligned window;
//! 3. a completely free byte, then any free bit, in the goal's group;
//! 4. the same byte-then-bit scan in every other group, round robin.
//!
//! A successful allocation updates the bitmap, the group and superblock
//! free counts and the owning inode's block count. The three records are
//! released independently; there is no journal tying them together.

use log::{debug, error, trace};

use crate::{
    bitmap,
    block_group::BlockGroupRef,
    blockdev::BlockDevice,
    error::{Ext4Error, Ext4Result},
    filesystem::Ext4Filesystem,
    inode::InodeRef,
    superblock::IncompatFeatures,
};

/// 512-byte units per block, the unit of `i_blocks`.
fn sectors_per_block(block_size: u32) -> u64 {
    (block_size / 512) as u64
}

impl<D: BlockDevice> Ext4Filesystem<D> {
    /// First block of group `group` that may hold file data.
    ///
    /// Without `FLEX_BG` this is the block after the inode table. With it,
    /// the metadata may live elsewhere, so the first block past the backups
    /// that is neither a bitmap nor inode table block is returned.
    pub fn first_data_block_in_group(&self, group: &BlockGroupRef<'_, D>) -> u64 {
        let sb = self.sb();
        let bgid = group.index();
        let itable = group.inode_table();
        let itable_end = itable + sb.inode_table_blocks(bgid) as u64;

        if !sb.has_incompat(IncompatFeatures::FLEX_BG) {
            return itable_end;
        }

        let in_group = |block: u64| (sb.blockaddr_to_group(block) == bgid).then_some(block);
        let block_bitmap = in_group(group.block_bitmap());
        let inode_bitmap = in_group(group.inode_bitmap());

        let mut block = sb.index_in_group_to_blockaddr(0, bgid) + sb.backup_blocks(bgid) as u64;
        loop {
            if Some(block) == block_bitmap || Some(block) == inode_bitmap {
                block += 1;
            } else if block >= itable && block < itable_end {
                block = itable_end;
            } else {
                return block;
            }
        }
    }

    /// Preferred physical block for the next allocation on behalf of `inode`.
    pub fn find_goal(&self, inode: &InodeRef<'_, D>) -> Ext4Result<u64> {
        let (block_size, ipg, blocks_count) = {
            let sb = self.sb();
            (sb.block_size() as u64, sb.inodes_per_group(), sb.blocks_count())
        };

        let block_count = inode.size().div_ceil(block_size);
        if block_count > 0 {
            let last = self.get_inode_data_block(inode, block_count - 1)?;
            if last != 0 && last + 1 < blocks_count {
                return Ok(last + 1);
            }
            // sparse tail: fall back to the group goal
        }

        let group = self.get_block_group_ref((inode.index() - 1) / ipg)?;
        Ok(self.first_data_block_in_group(&group))
    }

    /// Allocate one data block for `inode`.
    pub fn alloc_block(&self, inode: &mut InodeRef<'_, D>) -> Ext4Result<u64> {
        self.ensure_writable()?;
        let goal = self.find_goal(inode)?;
        let (goal_group, goal_index, group_count) = {
            let sb = self.sb();
            (
                sb.blockaddr_to_group(goal),
                sb.blockaddr_to_index_in_group(goal),
                sb.block_group_count(),
            )
        };

        let mut group = self.get_block_group_ref(goal_group)?;
        if group.free_blocks_count() > 0 {
            if let Some(index) = self.alloc_near_goal(&group, goal_index)? {
                return self.commit_block_alloc(inode, &mut group, index);
            }
        }
        drop(group);

        debug!("goal group {goal_group} has no free block near {goal}, trying other groups");
        let mut bgid = (goal_group + 1) % group_count;
        for _ in 0..group_count {
            let mut group = self.get_block_group_ref(bgid)?;
            if group.free_blocks_count() > 0 {
                let start = self.first_data_index(&group);
                if let Some(index) = self.scan_group(&group, start)? {
                    return self.commit_block_alloc(inode, &mut group, index);
                }
            }
            bgid = (bgid + 1) % group_count;
        }

        error!("no free block left for inode {}", inode.index());
        Err(Ext4Error::NoSpace)
    }

    fn first_data_index(&self, group: &BlockGroupRef<'_, D>) -> u32 {
        let first = self.first_data_block_in_group(group);
        self.sb().blockaddr_to_index_in_group(first)
    }

    /// Steps 1 to 3 of the search, inside the goal's group.
    fn alloc_near_goal(
        &self,
        group: &BlockGroupRef<'_, D>,
        goal_index: u32,
    ) -> Ext4Result<Option<u32>> {
        let blocks_in_group = self.sb().blocks_in_group(group.index());
        let index = goal_index.max(self.first_data_index(group));
        if index >= blocks_in_group {
            return self.scan_group(group, 0);
        }

        let mut bitmap_block = self.cache.get(group.block_bitmap())?;
        let goal_free = bitmap::is_bit_free(&bitmap_block.data(), index);
        if goal_free {
            bitmap::set_bit(&mut bitmap_block.data_mut(), index);
            trace!("allocated goal block index {index} in group {}", group.index());
            return Ok(Some(index));
        }

        let window_end = ((index + 63) & !63).min(blocks_in_group);
        for candidate in index + 1..window_end {
            if bitmap::is_bit_free(&bitmap_block.data(), candidate) {
                bitmap::set_bit(&mut bitmap_block.data_mut(), candidate);
                return Ok(Some(candidate));
            }
        }
        drop(bitmap_block);

        self.scan_group(group, index)
    }

    /// Free byte first, then free bit, from `start` to the end of the group.
    fn scan_group(&self, group: &BlockGroupRef<'_, D>, start: u32) -> Ext4Result<Option<u32>> {
        let blocks_in_group = self.sb().blocks_in_group(group.index());
        let mut bitmap_block = self.cache.get(group.block_bitmap())?;
        let found = {
            let mut data = bitmap_block.data_mut();
            bitmap::find_free_byte_and_set_bit(&mut data, start, blocks_in_group)
                .or_else(|| bitmap::find_free_bit_and_set(&mut data, start, blocks_in_group))
        };
        if found.is_none() {
            trace!("group {} has no free block past index {start}", group.index());
        }
        Ok(found)
    }

    fn commit_block_alloc(
        &self,
        inode: &mut InodeRef<'_, D>,
        group: &mut BlockGroupRef<'_, D>,
        index: u32,
    ) -> Ext4Result<u64> {
        let block = self.sb().index_in_group_to_blockaddr(index, group.index());

        {
            let mut sb = self.sb_mut();
            let free = sb.free_blocks_count();
            sb.set_free_blocks_count(free.saturating_sub(1));
        }

        let sb = self.sb();
        let blocks = inode.blocks_count(&sb) + sectors_per_block(sb.block_size());
        inode.inode_mut().set_blocks_count(&sb, blocks)?;
        drop(sb);

        let free = group.free_blocks_count();
        group.desc_mut().set_free_blocks_count(free.saturating_sub(1));

        trace!("inode {}: allocated block {block}", inode.index());
        Ok(block)
    }

    /// Allocate exactly `block` for `inode` if it is free.
    pub fn try_alloc_block(&self, inode: &mut InodeRef<'_, D>, block: u64) -> Ext4Result<bool> {
        self.ensure_writable()?;
        let (bgid, index) = {
            let sb = self.sb();
            if block < sb.first_data_block() as u64 || block >= sb.blocks_count() {
                return Ok(false);
            }
            (
                sb.blockaddr_to_group(block),
                sb.blockaddr_to_index_in_group(block),
            )
        };

        let mut group = self.get_block_group_ref(bgid)?;
        {
            let mut bitmap_block = self.cache.get(group.block_bitmap())?;
            if bitmap::is_bit_set(&bitmap_block.data(), index) {
                return Ok(false);
            }
            bitmap::set_bit(&mut bitmap_block.data_mut(), index);
        }
        self.commit_block_alloc(inode, &mut group, index)?;
        Ok(true)
    }

    /// Return one block to the free pool.
    pub fn free_block(&self, inode: &mut InodeRef<'_, D>, block: u64) -> Ext4Result<()> {
        self.free_blocks(inode, block, 1)
    }

    /// Return `count` consecutive blocks starting at `first`, which may
    /// span several groups.
    pub fn free_blocks(&self, inode: &mut InodeRef<'_, D>, first: u64, count: u32) -> Ext4Result<()> {
        self.ensure_writable()?;
        let mut first = first;
        let mut count = count as u64;
        while count > 0 {
            let (bgid, group_end) = {
                let sb = self.sb();
                if first < sb.first_data_block() as u64 || first + count > sb.blocks_count() {
                    error!("freeing blocks {first}+{count} outside the volume");
                    return Err(Ext4Error::Corrupted);
                }
                let bgid = sb.blockaddr_to_group(first);
                (bgid, sb.index_in_group_to_blockaddr(0, bgid + 1))
            };
            let run = count.min(group_end - first);
            self.free_in_group(inode, bgid, first, run as u32)?;
            first += run;
            count -= run;
        }
        Ok(())
    }

    fn free_in_group(
        &self,
        inode: &mut InodeRef<'_, D>,
        bgid: u32,
        first: u64,
        count: u32,
    ) -> Ext4Result<()> {
        let index = self.sb().blockaddr_to_index_in_group(first);
        let mut group = self.get_block_group_ref(bgid)?;
        {
            let mut bitmap_block = self.cache.get(group.block_bitmap())?;
            let mut data = bitmap_block.data_mut();
            for bit in index..index + count {
                if bitmap::is_bit_free(&data, bit) {
                    error!("block {} freed twice", first + (bit - index) as u64);
                    return Err(Ext4Error::Corrupted);
                }
            }
            bitmap::clear_bits(&mut data, index, count);
        }

        {
            let mut sb = self.sb_mut();
            let free = sb.free_blocks_count();
            sb.set_free_blocks_count(free + count as u64);
        }

        let sb = self.sb();
        let released = count as u64 * sectors_per_block(sb.block_size());
        let blocks = inode.blocks_count(&sb).saturating_sub(released);
        inode.inode_mut().set_blocks_count(&sb, blocks)?;
        drop(sb);

        let free = group.free_blocks_count();
        group.desc_mut().set_free_blocks_count(free + count);
        trace!("inode {}: freed blocks {first}+{count}", inode.index());
        Ok(())
    }
}
