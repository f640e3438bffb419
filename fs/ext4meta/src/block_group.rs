// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! # Block group descriptors
//!
//! The descriptor codec, the [`BlockGroupRef`] guard that writes a mutated
//! descriptor back (with a fresh checksum) when it goes out of scope, and
//! the group geometry helpers: address conversion, superblock backup
//! placement and inode table size.
//!
//! Acquiring a group whose bitmaps were never written (`BLOCK_UNINIT`,
//! `INODE_UNINIT`) builds them on the spot.

use core::ops::Deref;

use log::{debug, error};

use crate::{
    blockdev::BlockDevice,
    cache::BlockRef,
    checksum::crc16,
    config::GROUP_DESC_SIZE_OLD,
    endian::*,
    error::{Ext4Error, Ext4Result},
    filesystem::Ext4Filesystem,
    superblock::{CompatFeatures, Ext4Superblock, RoCompatFeatures},
};

bitflags::bitflags! {
    /// Per-group state flags (`bg_flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockGroupFlags: u16 {
        /// Inode table and bitmap are not initialised.
        const INODE_UNINIT  = 0x0001;
        /// Block bitmap is not initialised.
        const BLOCK_UNINIT  = 0x0002;
        /// Inode table is zeroed.
        const ITABLE_ZEROED = 0x0004;
    }
}

/// Decoded group descriptor. The `_hi` halves only exist in 64-byte records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ext4GroupDesc {
    pub bg_block_bitmap_lo: u32,
    pub bg_inode_bitmap_lo: u32,
    pub bg_inode_table_lo: u32,
    pub bg_free_blocks_count_lo: u16,
    pub bg_free_inodes_count_lo: u16,
    pub bg_used_dirs_count_lo: u16,
    pub bg_flags: BlockGroupFlags,
    pub bg_exclude_bitmap_lo: u32,
    pub bg_block_bitmap_csum_lo: u16,
    pub bg_inode_bitmap_csum_lo: u16,
    pub bg_itable_unused_lo: u16,
    pub bg_checksum: u16,
    pub bg_block_bitmap_hi: u32,
    pub bg_inode_bitmap_hi: u32,
    pub bg_inode_table_hi: u32,
    pub bg_free_blocks_count_hi: u16,
    pub bg_free_inodes_count_hi: u16,
    pub bg_used_dirs_count_hi: u16,
    pub bg_itable_unused_hi: u16,
    pub bg_exclude_bitmap_hi: u32,
    pub bg_block_bitmap_csum_hi: u16,
    pub bg_inode_bitmap_csum_hi: u16,
}

#[inline]
fn join16(hi: u16, lo: u16) -> u32 {
    ((hi as u32) << 16) | lo as u32
}

#[inline]
fn split16(value: u32) -> (u16, u16) {
    ((value >> 16) as u16, value as u16)
}

impl Ext4GroupDesc {
    /// Byte offset of `bg_checksum` inside the record.
    pub const CHECKSUM_OFFSET: usize = 0x1E;

    /// Decode a record of `desc_size` bytes.
    pub fn decode(b: &[u8], desc_size: usize) -> Self {
        let mut desc = Self {
            bg_block_bitmap_lo: read_u32_le(b, 0x00),
            bg_inode_bitmap_lo: read_u32_le(b, 0x04),
            bg_inode_table_lo: read_u32_le(b, 0x08),
            bg_free_blocks_count_lo: read_u16_le(b, 0x0C),
            bg_free_inodes_count_lo: read_u16_le(b, 0x0E),
            bg_used_dirs_count_lo: read_u16_le(b, 0x10),
            bg_flags: BlockGroupFlags::from_bits_retain(read_u16_le(b, 0x12)),
            bg_exclude_bitmap_lo: read_u32_le(b, 0x14),
            bg_block_bitmap_csum_lo: read_u16_le(b, 0x18),
            bg_inode_bitmap_csum_lo: read_u16_le(b, 0x1A),
            bg_itable_unused_lo: read_u16_le(b, 0x1C),
            bg_checksum: read_u16_le(b, 0x1E),
            ..Self::default()
        };
        if desc_size > GROUP_DESC_SIZE_OLD as usize {
            desc.bg_block_bitmap_hi = read_u32_le(b, 0x20);
            desc.bg_inode_bitmap_hi = read_u32_le(b, 0x24);
            desc.bg_inode_table_hi = read_u32_le(b, 0x28);
            desc.bg_free_blocks_count_hi = read_u16_le(b, 0x2C);
            desc.bg_free_inodes_count_hi = read_u16_le(b, 0x2E);
            desc.bg_used_dirs_count_hi = read_u16_le(b, 0x30);
            desc.bg_itable_unused_hi = read_u16_le(b, 0x32);
            desc.bg_exclude_bitmap_hi = read_u32_le(b, 0x34);
            desc.bg_block_bitmap_csum_hi = read_u16_le(b, 0x38);
            desc.bg_inode_bitmap_csum_hi = read_u16_le(b, 0x3A);
        }
        desc
    }

    /// Encode into a record of `desc_size` bytes. Bytes past the known
    /// fields are left as they are.
    pub fn encode(&self, b: &mut [u8], desc_size: usize) {
        write_u32_le(b, 0x00, self.bg_block_bitmap_lo);
        write_u32_le(b, 0x04, self.bg_inode_bitmap_lo);
        write_u32_le(b, 0x08, self.bg_inode_table_lo);
        write_u16_le(b, 0x0C, self.bg_free_blocks_count_lo);
        write_u16_le(b, 0x0E, self.bg_free_inodes_count_lo);
        write_u16_le(b, 0x10, self.bg_used_dirs_count_lo);
        write_u16_le(b, 0x12, self.bg_flags.bits());
        write_u32_le(b, 0x14, self.bg_exclude_bitmap_lo);
        write_u16_le(b, 0x18, self.bg_block_bitmap_csum_lo);
        write_u16_le(b, 0x1A, self.bg_inode_bitmap_csum_lo);
        write_u16_le(b, 0x1C, self.bg_itable_unused_lo);
        write_u16_le(b, 0x1E, self.bg_checksum);
        if desc_size > GROUP_DESC_SIZE_OLD as usize {
            write_u32_le(b, 0x20, self.bg_block_bitmap_hi);
            write_u32_le(b, 0x24, self.bg_inode_bitmap_hi);
            write_u32_le(b, 0x28, self.bg_inode_table_hi);
            write_u16_le(b, 0x2C, self.bg_free_blocks_count_hi);
            write_u16_le(b, 0x2E, self.bg_free_inodes_count_hi);
            write_u16_le(b, 0x30, self.bg_used_dirs_count_hi);
            write_u16_le(b, 0x32, self.bg_itable_unused_hi);
            write_u32_le(b, 0x34, self.bg_exclude_bitmap_hi);
            write_u16_le(b, 0x38, self.bg_block_bitmap_csum_hi);
            write_u16_le(b, 0x3A, self.bg_inode_bitmap_csum_hi);
        }
    }

    pub fn block_bitmap(&self) -> u64 {
        join_hi_lo(self.bg_block_bitmap_hi, self.bg_block_bitmap_lo)
    }

    pub fn set_block_bitmap(&mut self, block: u64) {
        (self.bg_block_bitmap_hi, self.bg_block_bitmap_lo) = split_hi_lo(block);
    }

    pub fn inode_bitmap(&self) -> u64 {
        join_hi_lo(self.bg_inode_bitmap_hi, self.bg_inode_bitmap_lo)
    }

    pub fn set_inode_bitmap(&mut self, block: u64) {
        (self.bg_inode_bitmap_hi, self.bg_inode_bitmap_lo) = split_hi_lo(block);
    }

    pub fn inode_table(&self) -> u64 {
        join_hi_lo(self.bg_inode_table_hi, self.bg_inode_table_lo)
    }

    pub fn set_inode_table(&mut self, block: u64) {
        (self.bg_inode_table_hi, self.bg_inode_table_lo) = split_hi_lo(block);
    }

    pub fn free_blocks_count(&self) -> u32 {
        join16(self.bg_free_blocks_count_hi, self.bg_free_blocks_count_lo)
    }

    pub fn set_free_blocks_count(&mut self, count: u32) {
        (self.bg_free_blocks_count_hi, self.bg_free_blocks_count_lo) = split16(count);
    }

    pub fn free_inodes_count(&self) -> u32 {
        join16(self.bg_free_inodes_count_hi, self.bg_free_inodes_count_lo)
    }

    pub fn set_free_inodes_count(&mut self, count: u32) {
        (self.bg_free_inodes_count_hi, self.bg_free_inodes_count_lo) = split16(count);
    }

    pub fn used_dirs_count(&self) -> u32 {
        join16(self.bg_used_dirs_count_hi, self.bg_used_dirs_count_lo)
    }

    pub fn set_used_dirs_count(&mut self, count: u32) {
        (self.bg_used_dirs_count_hi, self.bg_used_dirs_count_lo) = split16(count);
    }

    pub fn itable_unused(&self) -> u32 {
        join16(self.bg_itable_unused_hi, self.bg_itable_unused_lo)
    }

    pub fn set_itable_unused(&mut self, count: u32) {
        (self.bg_itable_unused_hi, self.bg_itable_unused_lo) = split16(count);
    }

    pub fn has_flag(&self, flag: BlockGroupFlags) -> bool {
        self.bg_flags.contains(flag)
    }
}

/// Checksum of an encoded descriptor: CRC-16 over the volume UUID, the
/// little-endian group number and the record minus its checksum field.
pub fn group_desc_checksum(uuid: &[u8; 16], bgid: u32, raw: &[u8], desc_size: usize) -> u16 {
    let mut crc = crc16(!0, uuid);
    crc = crc16(crc, &bgid.to_le_bytes());
    crc = crc16(crc, &raw[..Ext4GroupDesc::CHECKSUM_OFFSET]);
    let rest = Ext4GroupDesc::CHECKSUM_OFFSET + 2;
    if desc_size > rest {
        crc = crc16(crc, &raw[rest..desc_size]);
    }
    crc
}

fn is_power_of(mut n: u32, p: u32) -> bool {
    if n == 0 {
        return false;
    }
    while n % p == 0 {
        n /= p;
    }
    n == 1
}

impl Ext4Superblock {
    /// Group containing absolute block `block`.
    pub fn blockaddr_to_group(&self, block: u64) -> u32 {
        ((block - self.s_first_data_block as u64) / self.s_blocks_per_group as u64) as u32
    }

    /// Bit index of absolute block `block` inside its group's bitmap.
    pub fn blockaddr_to_index_in_group(&self, block: u64) -> u32 {
        ((block - self.s_first_data_block as u64) % self.s_blocks_per_group as u64) as u32
    }

    /// Absolute block of bit `index` in group `bgid`.
    pub fn index_in_group_to_blockaddr(&self, index: u32, bgid: u32) -> u64 {
        bgid as u64 * self.s_blocks_per_group as u64 + index as u64 + self.s_first_data_block as u64
    }

    /// Location of group `bgid`'s descriptor: table block and byte offset.
    pub fn group_desc_location(&self, bgid: u32) -> (u64, usize) {
        let per_block = self.descs_per_block();
        let block = self.s_first_data_block as u64 + 1 + (bgid / per_block) as u64;
        let offset = (bgid % per_block) as usize * self.desc_size() as usize;
        (block, offset)
    }

    /// Blocks taken by the primary descriptor table.
    pub fn gdt_blocks(&self) -> u32 {
        let bytes = self.block_group_count() as u64 * self.desc_size() as u64;
        bytes.div_ceil(self.block_size() as u64) as u32
    }

    /// Whether group `bgid` carries a superblock and descriptor table copy.
    pub fn group_has_backup(&self, bgid: u32) -> bool {
        if bgid <= 1 {
            return true;
        }
        if self.has_compat(CompatFeatures::SPARSE_SUPER2) {
            let (g1, g2) = self.backup_groups_sparse2();
            return bgid == g1 || bgid == g2;
        }
        if !self.has_ro_compat(RoCompatFeatures::SPARSE_SUPER) {
            return true;
        }
        bgid & 1 == 1 && (is_power_of(bgid, 3) || is_power_of(bgid, 5) || is_power_of(bgid, 7))
    }

    /// Blocks at the start of group `bgid` reserved for the superblock and
    /// descriptor table copies (zero when the group has none).
    pub fn backup_blocks(&self, bgid: u32) -> u32 {
        if !self.group_has_backup(bgid) {
            return 0;
        }
        let mut count = 0;
        if bgid == 0 && self.block_size() == 1024 {
            // boot block
            count += 1;
        }
        count + 1 + self.gdt_blocks() + self.s_reserved_gdt_blocks as u32
    }

    /// Size of group `bgid`'s inode table in blocks.
    pub fn inode_table_blocks(&self, bgid: u32) -> u32 {
        let bytes = self.inodes_in_group(bgid) as u64 * self.inode_size() as u64;
        bytes.div_ceil(self.block_size() as u64) as u32
    }
}

/// Scoped handle on one group descriptor.
///
/// Reads go through `Deref`; [`BlockGroupRef::desc_mut`] marks the handle
/// dirty. On drop a dirty descriptor is encoded back into its table block
/// together with a recomputed checksum when the volume has `GDT_CSUM`.
pub struct BlockGroupRef<'a, D: BlockDevice> {
    block: BlockRef<'a, D>,
    offset: usize,
    index: u32,
    desc_size: usize,
    csum_uuid: Option<[u8; 16]>,
    desc: Ext4GroupDesc,
    dirty: bool,
}

impl<D: BlockDevice> BlockGroupRef<'_, D> {
    /// Group number.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn desc(&self) -> &Ext4GroupDesc {
        &self.desc
    }

    pub fn desc_mut(&mut self) -> &mut Ext4GroupDesc {
        self.dirty = true;
        &mut self.desc
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl<D: BlockDevice> Deref for BlockGroupRef<'_, D> {
    type Target = Ext4GroupDesc;

    fn deref(&self) -> &Ext4GroupDesc {
        &self.desc
    }
}

impl<D: BlockDevice> Drop for BlockGroupRef<'_, D> {
    fn drop(&mut self) {
        if !self.dirty {
            return;
        }
        let mut data = self.block.data_mut();
        let raw = &mut data[self.offset..self.offset + self.desc_size];
        self.desc.encode(raw, self.desc_size);
        if let Some(uuid) = &self.csum_uuid {
            let csum = group_desc_checksum(uuid, self.index, raw, self.desc_size);
            self.desc.bg_checksum = csum;
            write_u16_le(raw, Ext4GroupDesc::CHECKSUM_OFFSET, csum);
        }
    }
}

impl<D: BlockDevice> Ext4Filesystem<D> {
    /// Acquire group `bgid`'s descriptor, initialising lazily built
    /// bitmaps and inode table first.
    pub fn get_block_group_ref(&self, bgid: u32) -> Ext4Result<BlockGroupRef<'_, D>> {
        let (block_id, offset, desc_size, csum_uuid) = {
            let sb = self.sb();
            if bgid >= sb.block_group_count() {
                error!(
                    "block group {bgid} out of range ({} groups)",
                    sb.block_group_count()
                );
                return Err(Ext4Error::InvalidInput);
            }
            let (block_id, offset) = sb.group_desc_location(bgid);
            let csum_uuid = sb
                .has_ro_compat(RoCompatFeatures::GDT_CSUM)
                .then_some(sb.s_uuid);
            (block_id, offset, sb.desc_size() as usize, csum_uuid)
        };

        let block = self.cache.get(block_id)?;
        let desc = Ext4GroupDesc::decode(&block.data()[offset..offset + desc_size], desc_size);

        if self.options().verify_checksums {
            if let Some(uuid) = &csum_uuid {
                let data = block.data();
                let expected =
                    group_desc_checksum(uuid, bgid, &data[offset..offset + desc_size], desc_size);
                if expected != desc.bg_checksum {
                    error!(
                        "group {bgid} descriptor checksum {:#06x}, expected {expected:#06x}",
                        desc.bg_checksum
                    );
                    return Err(Ext4Error::ChecksumMismatch);
                }
            }
        }

        let mut group = BlockGroupRef {
            block,
            offset,
            index: bgid,
            desc_size,
            csum_uuid,
            desc,
            dirty: false,
        };

        if self.is_read_only() {
            return Ok(group);
        }

        if group.has_flag(BlockGroupFlags::BLOCK_UNINIT) {
            self.init_block_bitmap(&group)?;
            group.desc_mut().bg_flags.remove(BlockGroupFlags::BLOCK_UNINIT);
        }
        if group.has_flag(BlockGroupFlags::INODE_UNINIT) {
            self.init_inode_bitmap(&group)?;
            group.desc_mut().bg_flags.remove(BlockGroupFlags::INODE_UNINIT);
            if !group.has_flag(BlockGroupFlags::ITABLE_ZEROED) {
                self.init_inode_table(&group)?;
                group.desc_mut().bg_flags.insert(BlockGroupFlags::ITABLE_ZEROED);
            }
        }
        Ok(group)
    }

    /// Build the block bitmap of a `BLOCK_UNINIT` group: backups, both
    /// bitmaps and the inode table are in use, everything else is free.
    fn init_block_bitmap(&self, group: &BlockGroupRef<'_, D>) -> Ext4Result<()> {
        let bgid = group.index();
        let sb = self.sb();
        let mut bitmap = self.cache.get_zeroed(group.block_bitmap())?;
        let mut data = bitmap.data_mut();

        for bit in 0..sb.backup_blocks(bgid) {
            crate::bitmap::set_bit(&mut data, bit);
        }
        for block in [group.block_bitmap(), group.inode_bitmap()] {
            if sb.blockaddr_to_group(block) == bgid {
                crate::bitmap::set_bit(&mut data, sb.blockaddr_to_index_in_group(block));
            }
        }
        let itable = group.inode_table();
        for block in itable..itable + sb.inode_table_blocks(bgid) as u64 {
            if sb.blockaddr_to_group(block) == bgid {
                crate::bitmap::set_bit(&mut data, sb.blockaddr_to_index_in_group(block));
            }
        }
        debug!("initialised block bitmap of group {bgid}");
        Ok(())
    }

    /// Build the inode bitmap of an `INODE_UNINIT` group: all inodes free,
    /// padding bits past the group's inode count set.
    fn init_inode_bitmap(&self, group: &BlockGroupRef<'_, D>) -> Ext4Result<()> {
        let ipg = self.sb().inodes_per_group();
        let mut bitmap = self.cache.get_zeroed(group.inode_bitmap())?;
        let mut data = bitmap.data_mut();
        let end = data.len() as u32 * 8;
        crate::bitmap::set_bits(&mut data, ipg, end - ipg);
        debug!("initialised inode bitmap of group {}", group.index());
        Ok(())
    }

    fn init_inode_table(&self, group: &BlockGroupRef<'_, D>) -> Ext4Result<()> {
        let blocks = self.sb().inode_table_blocks(group.index());
        let first = group.inode_table();
        for block in first..first + blocks as u64 {
            drop(self.cache.get_zeroed(block)?);
        }
        debug!(
            "zeroed {blocks} inode table blocks of group {}",
            group.index()
        );
        Ok(())
    }
}
