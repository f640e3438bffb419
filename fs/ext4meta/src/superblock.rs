// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! # Superblock
//!
//! Decoding and encoding of the 1024-byte superblock at byte offset 1024,
//! the feature-flag sets, and the values derived from them (block size,
//! group count, per-group sizes). Fields this engine never interprets are
//! carried through untouched in the raw image, so encoding after decoding
//! is lossless.

use log::{error, warn};

use crate::{
    blockdev::BlockDevice,
    config::*,
    endian::*,
    error::{Ext4Error, Ext4Result},
};

bitflags::bitflags! {
    /// Compatible features: safe to ignore when unknown.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CompatFeatures: u32 {
        const DIR_PREALLOC  = 0x0001;
        const IMAGIC_INODES = 0x0002;
        const HAS_JOURNAL   = 0x0004;
        const EXT_ATTR      = 0x0008;
        const RESIZE_INODE  = 0x0010;
        const DIR_INDEX     = 0x0020;
        const SPARSE_SUPER2 = 0x0200;
    }
}

bitflags::bitflags! {
    /// Incompatible features: an unknown bit makes the volume unmountable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IncompatFeatures: u32 {
        const COMPRESSION = 0x0001;
        const FILETYPE    = 0x0002;
        const RECOVER     = 0x0004;
        const JOURNAL_DEV = 0x0008;
        const META_BG     = 0x0010;
        const EXTENTS     = 0x0040;
        const BIT64       = 0x0080;
        const MMP         = 0x0100;
        const FLEX_BG     = 0x0200;
        const EA_INODE    = 0x0400;
        const DIRDATA     = 0x1000;
        const CSUM_SEED   = 0x2000;
        const LARGEDIR    = 0x4000;
        const INLINE_DATA = 0x8000;
    }
}

bitflags::bitflags! {
    /// Read-only compatible features: an unknown bit forces a read-only mount.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RoCompatFeatures: u32 {
        const SPARSE_SUPER  = 0x0001;
        const LARGE_FILE    = 0x0002;
        const BTREE_DIR     = 0x0004;
        const HUGE_FILE     = 0x0008;
        const GDT_CSUM      = 0x0010;
        const DIR_NLINK     = 0x0020;
        const EXTRA_ISIZE   = 0x0040;
        const QUOTA         = 0x0100;
        const BIGALLOC      = 0x0200;
        const METADATA_CSUM = 0x0400;
    }
}

bitflags::bitflags! {
    /// Miscellaneous superblock flags (`s_flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SuperblockFlags: u32 {
        const SIGNED_HASH   = 0x0001;
        const UNSIGNED_HASH = 0x0002;
        const TEST_FILESYS  = 0x0004;
    }
}

impl CompatFeatures {
    pub const SUPPORTED: Self = Self::DIR_INDEX;
}

impl IncompatFeatures {
    pub const SUPPORTED: Self = Self::FILETYPE
        .union(Self::EXTENTS)
        .union(Self::BIT64)
        .union(Self::FLEX_BG);
}

impl RoCompatFeatures {
    pub const SUPPORTED: Self = Self::SPARSE_SUPER
        .union(Self::DIR_NLINK)
        .union(Self::HUGE_FILE)
        .union(Self::LARGE_FILE)
        .union(Self::GDT_CSUM)
        .union(Self::EXTRA_ISIZE);
}

/// Decoded superblock.
#[derive(Clone)]
pub struct Ext4Superblock {
    pub s_inodes_count: u32,
    pub s_blocks_count_lo: u32,
    pub s_r_blocks_count_lo: u32,
    pub s_free_blocks_count_lo: u32,
    pub s_free_inodes_count: u32,
    pub s_first_data_block: u32,
    pub s_log_block_size: u32,
    pub s_log_cluster_size: u32,
    pub s_blocks_per_group: u32,
    pub s_clusters_per_group: u32,
    pub s_inodes_per_group: u32,
    pub s_mtime: u32,
    pub s_wtime: u32,
    pub s_mnt_count: u16,
    pub s_max_mnt_count: u16,
    pub s_magic: u16,
    pub s_state: u16,
    pub s_errors: u16,
    pub s_minor_rev_level: u16,
    pub s_lastcheck: u32,
    pub s_checkinterval: u32,
    pub s_creator_os: u32,
    pub s_rev_level: u32,
    pub s_def_resuid: u16,
    pub s_def_resgid: u16,
    pub s_first_ino: u32,
    pub s_inode_size: u16,
    pub s_block_group_nr: u16,
    pub s_feature_compat: CompatFeatures,
    pub s_feature_incompat: IncompatFeatures,
    pub s_feature_ro_compat: RoCompatFeatures,
    pub s_uuid: [u8; 16],
    pub s_volume_name: [u8; 16],
    pub s_reserved_gdt_blocks: u16,
    pub s_last_orphan: u32,
    pub s_hash_seed: [u32; 4],
    pub s_def_hash_version: u8,
    pub s_desc_size: u16,
    pub s_mkfs_time: u32,
    pub s_blocks_count_hi: u32,
    pub s_r_blocks_count_hi: u32,
    pub s_free_blocks_count_hi: u32,
    pub s_flags: SuperblockFlags,
    pub s_backup_bgs: [u32; 2],
    raw: [u8; SUPERBLOCK_SIZE],
}

impl Default for Ext4Superblock {
    fn default() -> Self {
        Self::from_disk_bytes(&[0u8; SUPERBLOCK_SIZE])
    }
}

impl core::fmt::Debug for Ext4Superblock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ext4Superblock")
            .field("inodes_count", &self.s_inodes_count)
            .field("blocks_count", &self.blocks_count())
            .field("free_blocks", &self.free_blocks_count())
            .field("free_inodes", &self.s_free_inodes_count)
            .field("block_size", &self.block_size())
            .field("blocks_per_group", &self.s_blocks_per_group)
            .field("inodes_per_group", &self.s_inodes_per_group)
            .field("rev_level", &self.s_rev_level)
            .field("compat", &self.s_feature_compat)
            .field("incompat", &self.s_feature_incompat)
            .field("ro_compat", &self.s_feature_ro_compat)
            .finish_non_exhaustive()
    }
}

impl DiskFormat for Ext4Superblock {
    const DISK_SIZE: usize = SUPERBLOCK_SIZE;

    fn from_disk_bytes(b: &[u8]) -> Self {
        let mut raw = [0u8; SUPERBLOCK_SIZE];
        raw.copy_from_slice(&b[..SUPERBLOCK_SIZE]);

        let mut s_uuid = [0u8; 16];
        s_uuid.copy_from_slice(&b[0x68..0x78]);
        let mut s_volume_name = [0u8; 16];
        s_volume_name.copy_from_slice(&b[0x78..0x88]);
        let mut s_hash_seed = [0u32; 4];
        for (i, word) in s_hash_seed.iter_mut().enumerate() {
            *word = read_u32_le(b, 0xEC + i * 4);
        }

        Self {
            s_inodes_count: read_u32_le(b, 0x00),
            s_blocks_count_lo: read_u32_le(b, 0x04),
            s_r_blocks_count_lo: read_u32_le(b, 0x08),
            s_free_blocks_count_lo: read_u32_le(b, 0x0C),
            s_free_inodes_count: read_u32_le(b, 0x10),
            s_first_data_block: read_u32_le(b, 0x14),
            s_log_block_size: read_u32_le(b, 0x18),
            s_log_cluster_size: read_u32_le(b, 0x1C),
            s_blocks_per_group: read_u32_le(b, 0x20),
            s_clusters_per_group: read_u32_le(b, 0x24),
            s_inodes_per_group: read_u32_le(b, 0x28),
            s_mtime: read_u32_le(b, 0x2C),
            s_wtime: read_u32_le(b, 0x30),
            s_mnt_count: read_u16_le(b, 0x34),
            s_max_mnt_count: read_u16_le(b, 0x36),
            s_magic: read_u16_le(b, 0x38),
            s_state: read_u16_le(b, 0x3A),
            s_errors: read_u16_le(b, 0x3C),
            s_minor_rev_level: read_u16_le(b, 0x3E),
            s_lastcheck: read_u32_le(b, 0x40),
            s_checkinterval: read_u32_le(b, 0x44),
            s_creator_os: read_u32_le(b, 0x48),
            s_rev_level: read_u32_le(b, 0x4C),
            s_def_resuid: read_u16_le(b, 0x50),
            s_def_resgid: read_u16_le(b, 0x52),
            s_first_ino: read_u32_le(b, 0x54),
            s_inode_size: read_u16_le(b, 0x58),
            s_block_group_nr: read_u16_le(b, 0x5A),
            s_feature_compat: CompatFeatures::from_bits_retain(read_u32_le(b, 0x5C)),
            s_feature_incompat: IncompatFeatures::from_bits_retain(read_u32_le(b, 0x60)),
            s_feature_ro_compat: RoCompatFeatures::from_bits_retain(read_u32_le(b, 0x64)),
            s_uuid,
            s_volume_name,
            s_reserved_gdt_blocks: read_u16_le(b, 0xCE),
            s_last_orphan: read_u32_le(b, 0xE8),
            s_hash_seed,
            s_def_hash_version: read_u8(b, 0xFC),
            s_desc_size: read_u16_le(b, 0xFE),
            s_mkfs_time: read_u32_le(b, 0x108),
            s_blocks_count_hi: read_u32_le(b, 0x150),
            s_r_blocks_count_hi: read_u32_le(b, 0x154),
            s_free_blocks_count_hi: read_u32_le(b, 0x158),
            s_flags: SuperblockFlags::from_bits_retain(read_u32_le(b, 0x160)),
            s_backup_bgs: [read_u32_le(b, 0x24C), read_u32_le(b, 0x250)],
            raw,
        }
    }

    fn to_disk_bytes(&self, b: &mut [u8]) {
        b[..SUPERBLOCK_SIZE].copy_from_slice(&self.raw);

        write_u32_le(b, 0x00, self.s_inodes_count);
        write_u32_le(b, 0x04, self.s_blocks_count_lo);
        write_u32_le(b, 0x08, self.s_r_blocks_count_lo);
        write_u32_le(b, 0x0C, self.s_free_blocks_count_lo);
        write_u32_le(b, 0x10, self.s_free_inodes_count);
        write_u32_le(b, 0x14, self.s_first_data_block);
        write_u32_le(b, 0x18, self.s_log_block_size);
        write_u32_le(b, 0x1C, self.s_log_cluster_size);
        write_u32_le(b, 0x20, self.s_blocks_per_group);
        write_u32_le(b, 0x24, self.s_clusters_per_group);
        write_u32_le(b, 0x28, self.s_inodes_per_group);
        write_u32_le(b, 0x2C, self.s_mtime);
        write_u32_le(b, 0x30, self.s_wtime);
        write_u16_le(b, 0x34, self.s_mnt_count);
        write_u16_le(b, 0x36, self.s_max_mnt_count);
        write_u16_le(b, 0x38, self.s_magic);
        write_u16_le(b, 0x3A, self.s_state);
        write_u16_le(b, 0x3C, self.s_errors);
        write_u16_le(b, 0x3E, self.s_minor_rev_level);
        write_u32_le(b, 0x40, self.s_lastcheck);
        write_u32_le(b, 0x44, self.s_checkinterval);
        write_u32_le(b, 0x48, self.s_creator_os);
        write_u32_le(b, 0x4C, self.s_rev_level);
        write_u16_le(b, 0x50, self.s_def_resuid);
        write_u16_le(b, 0x52, self.s_def_resgid);
        write_u32_le(b, 0x54, self.s_first_ino);
        write_u16_le(b, 0x58, self.s_inode_size);
        write_u16_le(b, 0x5A, self.s_block_group_nr);
        write_u32_le(b, 0x5C, self.s_feature_compat.bits());
        write_u32_le(b, 0x60, self.s_feature_incompat.bits());
        write_u32_le(b, 0x64, self.s_feature_ro_compat.bits());
        b[0x68..0x78].copy_from_slice(&self.s_uuid);
        b[0x78..0x88].copy_from_slice(&self.s_volume_name);
        write_u16_le(b, 0xCE, self.s_reserved_gdt_blocks);
        write_u32_le(b, 0xE8, self.s_last_orphan);
        for (i, word) in self.s_hash_seed.iter().enumerate() {
            write_u32_le(b, 0xEC + i * 4, *word);
        }
        write_u8(b, 0xFC, self.s_def_hash_version);
        write_u16_le(b, 0xFE, self.s_desc_size);
        write_u32_le(b, 0x108, self.s_mkfs_time);
        write_u32_le(b, 0x150, self.s_blocks_count_hi);
        write_u32_le(b, 0x154, self.s_r_blocks_count_hi);
        write_u32_le(b, 0x158, self.s_free_blocks_count_hi);
        write_u32_le(b, 0x160, self.s_flags.bits());
        write_u32_le(b, 0x24C, self.s_backup_bgs[0]);
        write_u32_le(b, 0x250, self.s_backup_bgs[1]);
    }
}

impl Ext4Superblock {
    /// Cleanly unmounted.
    pub const STATE_VALID_FS: u16 = 0x0001;
    /// Errors detected.
    pub const STATE_ERROR_FS: u16 = 0x0002;
    /// Orphans being recovered.
    pub const STATE_ORPHAN_FS: u16 = 0x0004;

    /// Read the primary superblock straight from the device.
    pub fn load<D: BlockDevice>(device: &mut D) -> Ext4Result<Self> {
        let sector = device.block_size() as u64;
        if sector == 0 || sector > SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE as u64 {
            return Err(Ext4Error::Unsupported);
        }
        let first = SUPERBLOCK_OFFSET / sector;
        let last = (SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE as u64 - 1) / sector;
        let count = (last - first + 1) as u32;
        let mut buf = alloc::vec![0u8; (count as u64 * sector) as usize];
        device.read(&mut buf, first, count)?;

        let start = (SUPERBLOCK_OFFSET - first * sector) as usize;
        let sb = Self::from_disk_bytes(&buf[start..start + SUPERBLOCK_SIZE]);
        if sb.s_magic != EXT4_SUPER_MAGIC {
            error!("bad superblock magic {:#06x}", sb.s_magic);
            return Err(Ext4Error::Unsupported);
        }
        Ok(sb)
    }

    /// Block holding the superblock, and the superblock's offset inside it.
    pub fn location(&self) -> (u64, usize) {
        let bs = self.block_size() as u64;
        (
            SUPERBLOCK_OFFSET / bs,
            (SUPERBLOCK_OFFSET % bs) as usize,
        )
    }

    pub fn block_size(&self) -> u32 {
        1024u32 << self.s_log_block_size
    }

    pub fn blocks_count(&self) -> u64 {
        join_hi_lo(self.s_blocks_count_hi, self.s_blocks_count_lo)
    }

    pub fn set_blocks_count(&mut self, count: u64) {
        (self.s_blocks_count_hi, self.s_blocks_count_lo) = split_hi_lo(count);
    }

    pub fn reserved_blocks_count(&self) -> u64 {
        join_hi_lo(self.s_r_blocks_count_hi, self.s_r_blocks_count_lo)
    }

    pub fn set_reserved_blocks_count(&mut self, count: u64) {
        (self.s_r_blocks_count_hi, self.s_r_blocks_count_lo) = split_hi_lo(count);
    }

    pub fn free_blocks_count(&self) -> u64 {
        join_hi_lo(self.s_free_blocks_count_hi, self.s_free_blocks_count_lo)
    }

    pub fn set_free_blocks_count(&mut self, count: u64) {
        (self.s_free_blocks_count_hi, self.s_free_blocks_count_lo) = split_hi_lo(count);
    }

    pub fn free_inodes_count(&self) -> u32 {
        self.s_free_inodes_count
    }

    pub fn set_free_inodes_count(&mut self, count: u32) {
        self.s_free_inodes_count = count;
    }

    pub fn blocks_per_group(&self) -> u32 {
        self.s_blocks_per_group
    }

    pub fn inodes_per_group(&self) -> u32 {
        self.s_inodes_per_group
    }

    pub fn first_data_block(&self) -> u32 {
        self.s_first_data_block
    }

    /// Inode record size; revision 0 volumes always use 128 bytes.
    pub fn inode_size(&self) -> u16 {
        if self.s_rev_level == 0 {
            GOOD_OLD_INODE_SIZE
        } else {
            self.s_inode_size
        }
    }

    /// First non-reserved inode.
    pub fn first_inode(&self) -> u32 {
        if self.s_rev_level == 0 {
            GOOD_OLD_FIRST_INO
        } else {
            self.s_first_ino
        }
    }

    /// Size of one group descriptor, never below the 32-byte legacy record.
    pub fn desc_size(&self) -> u16 {
        if !self.has_incompat(IncompatFeatures::BIT64) {
            return GROUP_DESC_SIZE_OLD;
        }
        self.s_desc_size.max(GROUP_DESC_SIZE_OLD)
    }

    /// Group descriptors per block.
    pub fn descs_per_block(&self) -> u32 {
        self.block_size() / self.desc_size() as u32
    }

    /// Number of block groups, rounding the last partial group up.
    pub fn block_group_count(&self) -> u32 {
        let data_blocks = self.blocks_count() - self.s_first_data_block as u64;
        data_blocks.div_ceil(self.s_blocks_per_group as u64) as u32
    }

    /// Blocks in group `bgid`; only the last group may be short.
    pub fn blocks_in_group(&self, bgid: u32) -> u32 {
        let count = self.block_group_count();
        if bgid + 1 < count {
            return self.s_blocks_per_group;
        }
        let before = (count as u64 - 1) * self.s_blocks_per_group as u64;
        (self.blocks_count() - self.s_first_data_block as u64 - before) as u32
    }

    /// Inodes in group `bgid`; only the last group may be short.
    pub fn inodes_in_group(&self, bgid: u32) -> u32 {
        let count = self.block_group_count();
        if bgid + 1 < count {
            return self.s_inodes_per_group;
        }
        self.s_inodes_count
            .saturating_sub((count - 1) * self.s_inodes_per_group)
    }

    pub fn has_compat(&self, feature: CompatFeatures) -> bool {
        self.s_feature_compat.contains(feature)
    }

    pub fn has_incompat(&self, feature: IncompatFeatures) -> bool {
        self.s_feature_incompat.contains(feature)
    }

    pub fn has_ro_compat(&self, feature: RoCompatFeatures) -> bool {
        self.s_feature_ro_compat.contains(feature)
    }

    pub fn has_flag(&self, flag: SuperblockFlags) -> bool {
        self.s_flags.contains(flag)
    }

    /// Directory entries carry a file-type byte instead of a high name-length byte.
    pub fn dirent_has_file_type(&self) -> bool {
        self.s_rev_level > 0 || self.s_minor_rev_level >= 5
    }

    /// Basic structural validation of the decoded fields.
    pub fn check_sanity(&self) -> Ext4Result<()> {
        let bad = |what: &str| {
            error!("superblock sanity check failed: {what}");
            Err(Ext4Error::Unsupported)
        };
        if self.s_magic != EXT4_SUPER_MAGIC {
            return bad("magic");
        }
        if self.s_inodes_count == 0 || self.blocks_count() == 0 {
            return bad("empty volume");
        }
        if self.s_blocks_per_group == 0 || self.s_inodes_per_group == 0 {
            return bad("zero-sized groups");
        }
        if self.s_log_block_size > 6 {
            return bad("block size");
        }
        if self.s_blocks_per_group > self.block_size() * 8
            || self.s_inodes_per_group > self.block_size() * 8
        {
            return bad("group larger than one bitmap block");
        }
        let inode_size = self.inode_size();
        if inode_size < GOOD_OLD_INODE_SIZE
            || !inode_size.is_power_of_two()
            || inode_size as u32 > self.block_size()
        {
            return bad("inode size");
        }
        if self.first_inode() < GOOD_OLD_FIRST_INO {
            return bad("first inode");
        }
        let desc_size = self.desc_size();
        if self.has_incompat(IncompatFeatures::BIT64)
            && (desc_size < GROUP_DESC_SIZE || !desc_size.is_power_of_two())
        {
            return bad("descriptor size");
        }
        if self.s_first_data_block as u64 >= self.blocks_count() {
            return bad("first data block");
        }
        Ok(())
    }

    /// Compare the feature sets against what the engine understands.
    ///
    /// Returns `Ok(true)` when the volume may only be mounted read-only.
    pub fn check_features(&self) -> Ext4Result<bool> {
        if self.s_rev_level == 0 {
            return Ok(false);
        }
        let unknown_incompat = self.s_feature_incompat.difference(IncompatFeatures::SUPPORTED);
        if !unknown_incompat.is_empty() {
            error!(
                "unsupported incompatible features {:#x}",
                unknown_incompat.bits()
            );
            return Err(Ext4Error::Unsupported);
        }
        let unknown_ro = self.s_feature_ro_compat.difference(RoCompatFeatures::SUPPORTED);
        if !unknown_ro.is_empty() {
            warn!(
                "read-only compatible features {:#x} not supported, mounting read-only",
                unknown_ro.bits()
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// The two backup groups named by SPARSE_SUPER2.
    pub fn backup_groups_sparse2(&self) -> (u32, u32) {
        (self.s_backup_bgs[0], self.s_backup_bgs[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::RamDisk;

    fn sample() -> Ext4Superblock {
        let mut sb = Ext4Superblock::default();
        sb.s_magic = EXT4_SUPER_MAGIC;
        sb.s_rev_level = 1;
        sb.s_inodes_count = 2048;
        sb.set_blocks_count(20_000);
        sb.s_blocks_per_group = 8192;
        sb.s_inodes_per_group = 1024;
        sb.s_log_block_size = 0;
        sb.s_first_data_block = 1;
        sb.s_inode_size = 256;
        sb.s_first_ino = 11;
        sb
    }

    #[test]
    fn derived_sizes() {
        let sb = sample();
        assert_eq!(sb.block_size(), 1024);
        assert_eq!(sb.block_group_count(), 3);
        assert_eq!(sb.blocks_in_group(0), 8192);
        assert_eq!(sb.blocks_in_group(2), 20_000 - 1 - 2 * 8192);
        assert_eq!(sb.inodes_in_group(2), 0);
        assert_eq!(sb.desc_size(), 32);
        assert_eq!(sb.location(), (1, 0));
        assert!(sb.check_sanity().is_ok());
    }

    #[test]
    fn encoding_preserves_unknown_fields() {
        let mut bytes = [0u8; SUPERBLOCK_SIZE];
        sample().to_disk_bytes(&mut bytes);
        bytes[0x200] = 0x77;

        let mut sb = Ext4Superblock::from_disk_bytes(&bytes);
        sb.set_free_blocks_count(0x1_0000_0005);
        let mut out = [0u8; SUPERBLOCK_SIZE];
        sb.to_disk_bytes(&mut out);

        assert_eq!(out[0x200], 0x77);
        assert_eq!(read_u32_le(&out, 0x0C), 5);
        assert_eq!(read_u32_le(&out, 0x158), 1);
        assert_eq!(Ext4Superblock::from_disk_bytes(&out).free_blocks_count(), 0x1_0000_0005);
    }

    #[test]
    fn unknown_incompat_feature_rejects_mount() {
        let mut sb = sample();
        sb.s_feature_incompat = IncompatFeatures::EXTENTS | IncompatFeatures::INLINE_DATA;
        assert_eq!(sb.check_features(), Err(Ext4Error::Unsupported));
    }

    #[test]
    fn unknown_ro_compat_feature_forces_read_only() {
        let mut sb = sample();
        sb.s_feature_ro_compat = RoCompatFeatures::SPARSE_SUPER | RoCompatFeatures::METADATA_CSUM;
        assert_eq!(sb.check_features(), Ok(true));
        sb.s_feature_ro_compat = RoCompatFeatures::SPARSE_SUPER;
        assert_eq!(sb.check_features(), Ok(false));
    }

    #[test]
    fn revision_zero_skips_feature_checks() {
        let mut sb = sample();
        sb.s_rev_level = 0;
        sb.s_feature_incompat = IncompatFeatures::INLINE_DATA;
        assert_eq!(sb.check_features(), Ok(false));
        assert_eq!(sb.inode_size(), 128);
        assert!(!sb.dirent_has_file_type());
    }

    #[test]
    fn load_reads_from_byte_offset_1024() {
        let mut disk = RamDisk::new(8192);
        let mut bytes = [0u8; SUPERBLOCK_SIZE];
        sample().to_disk_bytes(&mut bytes);
        disk.as_bytes_mut()[1024..2048].copy_from_slice(&bytes);

        let sb = Ext4Superblock::load(&mut disk).unwrap();
        assert_eq!(sb.s_inodes_count, 2048);
        assert_eq!(sb.blocks_count(), 20_000);
    }

    #[test]
    fn load_rejects_bad_magic() {
        let mut disk = RamDisk::new(8192);
        assert_eq!(
            Ext4Superblock::load(&mut disk).unwrap_err(),
            Ext4Error::Unsupported
        );
    }
}
