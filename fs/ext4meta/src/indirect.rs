// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! # Indirect block map
//!
//! Logical to physical translation for inodes without the extents flag.
//! Logical blocks `0..12` are stored in the inode. Past that, the single,
//! double and triple indirect pointers cover `n`, `n^2` and `n^3` further
//! blocks where `n = block_size / 4`. A zero pointer anywhere on the path
//! means the block is sparse.

use log::{error, trace};

use crate::{
    blockdev::BlockDevice,
    config::DIRECT_BLOCKS,
    endian::{read_u32_le, write_u32_le},
    error::{Ext4Error, Ext4Result},
    filesystem::Ext4Filesystem,
    inode::InodeRef,
};

/// Capacity thresholds of the block map for a given block size.
///
/// `limits[l]` is the first logical block that needs more than `l` levels
/// of indirection; `per_level[l]` is how many data blocks one pointer at
/// level `l` covers.
pub fn indirect_limits(block_size: u32) -> ([u64; 4], [u64; 4]) {
    let pointers = (block_size / 4) as u64;
    let mut limits = [0u64; 4];
    let mut per_level = [0u64; 4];
    limits[0] = DIRECT_BLOCKS as u64;
    per_level[0] = 1;
    for i in 1..4 {
        per_level[i] = per_level[i - 1] * pointers;
        limits[i] = limits[i - 1] + per_level[i];
    }
    (limits, per_level)
}

/// Position of a logical block inside the indirect tree.
struct IndirectPath {
    /// Levels left to walk, 1 to 3.
    level: usize,
    /// Offset of the block within the subtree of the current level.
    offset_in_level: u64,
}

impl<D: BlockDevice> Ext4Filesystem<D> {
    fn indirect_path(&self, iblock: u64) -> Ext4Result<IndirectPath> {
        let level = (1..4)
            .find(|&l| iblock < self.inode_block_limits[l])
            .ok_or_else(|| {
                error!("logical block {iblock} beyond the triple indirect range");
                Ext4Error::InvalidInput
            })?;
        Ok(IndirectPath {
            level,
            offset_in_level: iblock - self.inode_block_limits[level - 1],
        })
    }

    /// Slot index inside the pointer block at `level`.
    fn slot(&self, offset_in_level: u64, level: usize) -> usize {
        (offset_in_level / self.inode_blocks_per_level[level - 1]) as usize
    }

    /// Physical block behind `iblock`, zero when sparse.
    pub(crate) fn get_indirect_data_block(
        &self,
        inode: &InodeRef<'_, D>,
        iblock: u64,
    ) -> Ext4Result<u64> {
        if iblock < DIRECT_BLOCKS as u64 {
            return Ok(inode.direct_block(iblock as usize) as u64);
        }

        let IndirectPath {
            mut level,
            mut offset_in_level,
        } = self.indirect_path(iblock)?;
        let mut current = inode.indirect_block(level - 1);

        while level > 0 {
            if current == 0 {
                return Ok(0);
            }
            let slot = self.slot(offset_in_level, level);
            let block = self.cache.get(current as u64)?;
            current = read_u32_le(&block.data(), slot * 4);
            drop(block);

            level -= 1;
            if level > 0 {
                offset_in_level %= self.inode_blocks_per_level[level];
            }
        }
        Ok(current as u64)
    }

    /// Map `iblock` to `fblock`, allocating zeroed pointer blocks on the way.
    pub(crate) fn set_indirect_data_block(
        &self,
        inode: &mut InodeRef<'_, D>,
        iblock: u64,
        fblock: u32,
    ) -> Ext4Result<()> {
        if iblock < DIRECT_BLOCKS as u64 {
            inode.inode_mut().set_direct_block(iblock as usize, fblock);
            return Ok(());
        }

        let IndirectPath {
            mut level,
            mut offset_in_level,
        } = self.indirect_path(iblock)?;

        let mut current = inode.indirect_block(level - 1);
        if current == 0 {
            current = self.alloc_pointer_block(inode)?;
            inode.inode_mut().set_indirect_block(level - 1, current);
        }

        while level > 0 {
            let slot = self.slot(offset_in_level, level);
            let mut block = self.cache.get(current as u64)?;
            if level == 1 {
                write_u32_le(&mut block.data_mut(), slot * 4, fblock);
                break;
            }

            let mut next = read_u32_le(&block.data(), slot * 4);
            if next == 0 {
                next = self.alloc_pointer_block(inode)?;
                write_u32_le(&mut block.data_mut(), slot * 4, next);
            }
            drop(block);

            current = next;
            level -= 1;
            offset_in_level %= self.inode_blocks_per_level[level];
        }
        trace!("inode {}: mapped {iblock} -> {fblock}", inode.index());
        Ok(())
    }

    fn alloc_pointer_block(&self, inode: &mut InodeRef<'_, D>) -> Ext4Result<u32> {
        let block = self.alloc_block(inode)?;
        if let Err(err) = self.cache.get_zeroed(block) {
            self.free_block(inode, block)?;
            return Err(err.into());
        }
        Ok(block as u32)
    }

    /// Unmap `iblock` and free its data block. Pointer blocks stay.
    pub(crate) fn release_indirect_data_block(
        &self,
        inode: &mut InodeRef<'_, D>,
        iblock: u64,
    ) -> Ext4Result<()> {
        if iblock < DIRECT_BLOCKS as u64 {
            let fblock = inode.direct_block(iblock as usize);
            if fblock == 0 {
                return Ok(());
            }
            inode.inode_mut().set_direct_block(iblock as usize, 0);
            return self.free_block(inode, fblock as u64);
        }

        let IndirectPath {
            mut level,
            mut offset_in_level,
        } = self.indirect_path(iblock)?;
        let mut current = inode.indirect_block(level - 1);

        while level > 0 {
            if current == 0 {
                return Ok(());
            }
            let slot = self.slot(offset_in_level, level);
            let mut block = self.cache.get(current as u64)?;
            current = read_u32_le(&block.data(), slot * 4);
            if level == 1 && current != 0 {
                write_u32_le(&mut block.data_mut(), slot * 4, 0);
            }
            drop(block);

            level -= 1;
            if level > 0 {
                offset_in_level %= self.inode_blocks_per_level[level];
            }
        }

        if current == 0 {
            return Ok(());
        }
        self.free_block(inode, current as u64)
    }

    /// Free every pointer block of the indirect tree, leaving data blocks
    /// to the caller. Used when the inode itself goes away.
    pub(crate) fn free_indirect_tree(&self, inode: &mut InodeRef<'_, D>) -> Ext4Result<()> {
        for level in 0..3 {
            let root = inode.indirect_block(level);
            if root == 0 {
                continue;
            }
            self.free_pointer_subtree(inode, root, level)?;
            inode.inode_mut().set_indirect_block(level, 0);
        }
        Ok(())
    }

    /// Free `block` and, for `depth > 0`, the pointer blocks beneath it.
    fn free_pointer_subtree(
        &self,
        inode: &mut InodeRef<'_, D>,
        block: u32,
        depth: usize,
    ) -> Ext4Result<()> {
        if depth > 0 {
            let children: alloc::vec::Vec<u32> = {
                let pointers = self.cache.get(block as u64)?;
                let data = pointers.data();
                data.chunks_exact(4)
                    .map(|c| read_u32_le(c, 0))
                    .filter(|&c| c != 0)
                    .collect()
            };
            for child in children {
                self.free_pointer_subtree(inode, child, depth - 1)?;
            }
        }
        self.free_block(inode, block as u64)
    }
}
