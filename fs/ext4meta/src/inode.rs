// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! # Inodes
//!
//! The on-disk inode codec and the [`InodeRef`] guard. The 60-byte block
//! area is decoded into an [`InodeBlocks`]: twelve direct plus three
//! indirect pointers, or the root node of an extent tree, depending on the
//! `EXTENTS` inode flag.

use core::ops::Deref;

use log::{error, trace};

use crate::{
    blockdev::BlockDevice,
    cache::BlockRef,
    config::*,
    endian::*,
    error::{Ext4Error, Ext4Result},
    extent::{EXT4_EXTENT_MAGIC, ExtentHeader},
    filesystem::Ext4Filesystem,
    superblock::{Ext4Superblock, RoCompatFeatures},
};

bitflags::bitflags! {
    /// Inode flags (`i_flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InodeFlags: u32 {
        const SECRM        = 0x0000_0001;
        const UNRM         = 0x0000_0002;
        const COMPR        = 0x0000_0004;
        const SYNC         = 0x0000_0008;
        const IMMUTABLE    = 0x0000_0010;
        const APPEND       = 0x0000_0020;
        const NODUMP       = 0x0000_0040;
        const NOATIME      = 0x0000_0080;
        /// Hash-indexed directory.
        const INDEX        = 0x0000_1000;
        const IMAGIC       = 0x0000_2000;
        const JOURNAL_DATA = 0x0000_4000;
        const NOTAIL       = 0x0000_8000;
        const DIRSYNC      = 0x0001_0000;
        const TOPDIR       = 0x0002_0000;
        /// `i_blocks` counts filesystem blocks instead of 512-byte sectors.
        const HUGE_FILE    = 0x0004_0000;
        /// Block area holds an extent tree root.
        const EXTENTS      = 0x0008_0000;
        const EA_INODE     = 0x0020_0000;
        const INLINE_DATA  = 0x1000_0000;
    }
}

/// Size of the inline block area.
pub const INODE_BLOCK_BYTES: usize = INODE_BLOCK_WORDS * 4;

/// Interpretation of the inode's 60-byte block area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeBlocks {
    /// Classic block map.
    Indirect {
        direct: [u32; DIRECT_BLOCKS],
        indirect: [u32; INDIRECT_LEVELS],
    },
    /// Raw bytes of the extent tree root node.
    Extents([u8; INODE_BLOCK_BYTES]),
}

impl InodeBlocks {
    fn decode(b: &[u8], extents: bool) -> Self {
        if extents {
            let mut raw = [0u8; INODE_BLOCK_BYTES];
            raw.copy_from_slice(&b[..INODE_BLOCK_BYTES]);
            return Self::Extents(raw);
        }
        let mut direct = [0u32; DIRECT_BLOCKS];
        for (i, ptr) in direct.iter_mut().enumerate() {
            *ptr = read_u32_le(b, i * 4);
        }
        let mut indirect = [0u32; INDIRECT_LEVELS];
        for (i, ptr) in indirect.iter_mut().enumerate() {
            *ptr = read_u32_le(b, (DIRECT_BLOCKS + i) * 4);
        }
        Self::Indirect { direct, indirect }
    }

    fn encode(&self, b: &mut [u8]) {
        match self {
            Self::Extents(raw) => b[..INODE_BLOCK_BYTES].copy_from_slice(raw),
            Self::Indirect { direct, indirect } => {
                for (i, ptr) in direct.iter().chain(indirect.iter()).enumerate() {
                    write_u32_le(b, i * 4, *ptr);
                }
            }
        }
    }

    fn empty_indirect() -> Self {
        Self::Indirect {
            direct: [0; DIRECT_BLOCKS],
            indirect: [0; INDIRECT_LEVELS],
        }
    }
}

/// Decoded inode record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ext4Inode {
    pub i_mode: u16,
    pub i_uid: u16,
    pub i_size_lo: u32,
    pub i_atime: u32,
    pub i_ctime: u32,
    pub i_mtime: u32,
    /// Deletion time; doubles as the next-orphan link while on the orphan list.
    pub i_dtime: u32,
    pub i_gid: u16,
    pub i_links_count: u16,
    pub i_blocks_lo: u32,
    pub i_flags: InodeFlags,
    pub i_osd1: u32,
    pub i_block: InodeBlocks,
    pub i_generation: u32,
    pub i_file_acl_lo: u32,
    pub i_size_high: u32,
    pub i_obso_faddr: u32,
    pub l_i_blocks_high: u16,
    pub l_i_file_acl_high: u16,
    pub l_i_uid_high: u16,
    pub l_i_gid_high: u16,
    pub l_i_checksum_lo: u16,
    pub i_extra_isize: u16,
}

impl Default for Ext4Inode {
    fn default() -> Self {
        Self::decode(&[0u8; GOOD_OLD_INODE_SIZE as usize], GOOD_OLD_INODE_SIZE)
    }
}

impl Ext4Inode {
    pub const S_IFMT: u16 = 0xF000;
    pub const S_IFIFO: u16 = 0x1000;
    pub const S_IFCHR: u16 = 0x2000;
    pub const S_IFDIR: u16 = 0x4000;
    pub const S_IFBLK: u16 = 0x6000;
    pub const S_IFREG: u16 = 0x8000;
    pub const S_IFLNK: u16 = 0xA000;
    pub const S_IFSOCK: u16 = 0xC000;

    /// Decode an inode record of `inode_size` bytes.
    pub fn decode(b: &[u8], inode_size: u16) -> Self {
        let i_flags = InodeFlags::from_bits_retain(read_u32_le(b, 0x20));
        Self {
            i_mode: read_u16_le(b, 0x00),
            i_uid: read_u16_le(b, 0x02),
            i_size_lo: read_u32_le(b, 0x04),
            i_atime: read_u32_le(b, 0x08),
            i_ctime: read_u32_le(b, 0x0C),
            i_mtime: read_u32_le(b, 0x10),
            i_dtime: read_u32_le(b, 0x14),
            i_gid: read_u16_le(b, 0x18),
            i_links_count: read_u16_le(b, 0x1A),
            i_blocks_lo: read_u32_le(b, 0x1C),
            i_flags,
            i_osd1: read_u32_le(b, 0x24),
            i_block: InodeBlocks::decode(&b[0x28..0x64], i_flags.contains(InodeFlags::EXTENTS)),
            i_generation: read_u32_le(b, 0x64),
            i_file_acl_lo: read_u32_le(b, 0x68),
            i_size_high: read_u32_le(b, 0x6C),
            i_obso_faddr: read_u32_le(b, 0x70),
            l_i_blocks_high: read_u16_le(b, 0x74),
            l_i_file_acl_high: read_u16_le(b, 0x76),
            l_i_uid_high: read_u16_le(b, 0x78),
            l_i_gid_high: read_u16_le(b, 0x7A),
            l_i_checksum_lo: read_u16_le(b, 0x7C),
            i_extra_isize: if inode_size > GOOD_OLD_INODE_SIZE {
                read_u16_le(b, 0x80)
            } else {
                0
            },
        }
    }

    /// Encode into a record of `inode_size` bytes; bytes of the extended
    /// area past `i_extra_isize` are left untouched.
    pub fn encode(&self, b: &mut [u8], inode_size: u16) {
        write_u16_le(b, 0x00, self.i_mode);
        write_u16_le(b, 0x02, self.i_uid);
        write_u32_le(b, 0x04, self.i_size_lo);
        write_u32_le(b, 0x08, self.i_atime);
        write_u32_le(b, 0x0C, self.i_ctime);
        write_u32_le(b, 0x10, self.i_mtime);
        write_u32_le(b, 0x14, self.i_dtime);
        write_u16_le(b, 0x18, self.i_gid);
        write_u16_le(b, 0x1A, self.i_links_count);
        write_u32_le(b, 0x1C, self.i_blocks_lo);
        write_u32_le(b, 0x20, self.i_flags.bits());
        write_u32_le(b, 0x24, self.i_osd1);
        self.i_block.encode(&mut b[0x28..0x64]);
        write_u32_le(b, 0x64, self.i_generation);
        write_u32_le(b, 0x68, self.i_file_acl_lo);
        write_u32_le(b, 0x6C, self.i_size_high);
        write_u32_le(b, 0x70, self.i_obso_faddr);
        write_u16_le(b, 0x74, self.l_i_blocks_high);
        write_u16_le(b, 0x76, self.l_i_file_acl_high);
        write_u16_le(b, 0x78, self.l_i_uid_high);
        write_u16_le(b, 0x7A, self.l_i_gid_high);
        write_u16_le(b, 0x7C, self.l_i_checksum_lo);
        if inode_size > GOOD_OLD_INODE_SIZE {
            write_u16_le(b, 0x80, self.i_extra_isize);
        }
    }

    pub fn file_type(&self) -> u16 {
        self.i_mode & Self::S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == Self::S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.file_type() == Self::S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == Self::S_IFLNK
    }

    pub fn size(&self) -> u64 {
        join_hi_lo(self.i_size_high, self.i_size_lo)
    }

    pub fn set_size(&mut self, size: u64) {
        (self.i_size_high, self.i_size_lo) = split_hi_lo(size);
    }

    pub fn uid(&self) -> u32 {
        ((self.l_i_uid_high as u32) << 16) | self.i_uid as u32
    }

    pub fn gid(&self) -> u32 {
        ((self.l_i_gid_high as u32) << 16) | self.i_gid as u32
    }

    /// Extended attribute block, zero if none.
    pub fn file_acl(&self) -> u64 {
        ((self.l_i_file_acl_high as u64) << 32) | self.i_file_acl_lo as u64
    }

    pub fn set_file_acl(&mut self, block: u64) {
        self.i_file_acl_lo = block as u32;
        self.l_i_file_acl_high = (block >> 32) as u16;
    }

    pub fn has_flag(&self, flag: InodeFlags) -> bool {
        self.i_flags.contains(flag)
    }

    /// The block area holds an extent tree.
    pub fn uses_extents(&self) -> bool {
        matches!(self.i_block, InodeBlocks::Extents(_))
    }

    /// Allocated space in 512-byte units.
    pub fn blocks_count(&self, sb: &Ext4Superblock) -> u64 {
        if !sb.has_ro_compat(RoCompatFeatures::HUGE_FILE) {
            return self.i_blocks_lo as u64;
        }
        let count = ((self.l_i_blocks_high as u64) << 32) | self.i_blocks_lo as u64;
        if self.has_flag(InodeFlags::HUGE_FILE) {
            count * (sb.block_size() / 512) as u64
        } else {
            count
        }
    }

    /// Store the allocated space, switching to block units when the sector
    /// count no longer fits 48 bits.
    pub fn set_blocks_count(&mut self, sb: &Ext4Superblock, count: u64) -> Ext4Result<()> {
        if count <= u32::MAX as u64 {
            self.i_blocks_lo = count as u32;
            self.l_i_blocks_high = 0;
            self.i_flags.remove(InodeFlags::HUGE_FILE);
            return Ok(());
        }
        if !sb.has_ro_compat(RoCompatFeatures::HUGE_FILE) {
            return Err(Ext4Error::InvalidInput);
        }
        let mut value = count;
        if count >= 1 << 48 {
            value = count / (sb.block_size() / 512) as u64;
            if value >= 1 << 48 {
                return Err(Ext4Error::InvalidInput);
            }
            self.i_flags.insert(InodeFlags::HUGE_FILE);
        } else {
            self.i_flags.remove(InodeFlags::HUGE_FILE);
        }
        self.i_blocks_lo = value as u32;
        self.l_i_blocks_high = (value >> 32) as u16;
        Ok(())
    }

    /// Direct pointer `index`; zero for extent inodes.
    pub fn direct_block(&self, index: usize) -> u32 {
        match &self.i_block {
            InodeBlocks::Indirect { direct, .. } => direct[index],
            InodeBlocks::Extents(_) => 0,
        }
    }

    pub fn set_direct_block(&mut self, index: usize, block: u32) {
        if let InodeBlocks::Indirect { direct, .. } = &mut self.i_block {
            direct[index] = block;
        }
    }

    /// Indirect pointer for `level` (0 single, 1 double, 2 triple).
    pub fn indirect_block(&self, level: usize) -> u32 {
        match &self.i_block {
            InodeBlocks::Indirect { indirect, .. } => indirect[level],
            InodeBlocks::Extents(_) => 0,
        }
    }

    pub fn set_indirect_block(&mut self, level: usize, block: u32) {
        if let InodeBlocks::Indirect { indirect, .. } = &mut self.i_block {
            indirect[level] = block;
        }
    }

    pub fn extent_root(&self) -> Option<&[u8; INODE_BLOCK_BYTES]> {
        match &self.i_block {
            InodeBlocks::Extents(raw) => Some(raw),
            InodeBlocks::Indirect { .. } => None,
        }
    }

    pub fn extent_root_mut(&mut self) -> Option<&mut [u8; INODE_BLOCK_BYTES]> {
        match &mut self.i_block {
            InodeBlocks::Extents(raw) => Some(raw),
            InodeBlocks::Indirect { .. } => None,
        }
    }

    /// Switch to an empty extent tree root.
    pub fn init_extent_root(&mut self) {
        let mut raw = [0u8; INODE_BLOCK_BYTES];
        ExtentHeader {
            magic: EXT4_EXTENT_MAGIC,
            entries: 0,
            max: ExtentHeader::ROOT_MAX_ENTRIES,
            depth: 0,
            generation: 0,
        }
        .to_disk_bytes(&mut raw);
        self.i_flags.insert(InodeFlags::EXTENTS);
        self.i_block = InodeBlocks::Extents(raw);
    }

    /// Reset the block area to an empty classic block map.
    pub fn clear_block_map(&mut self) {
        self.i_flags.remove(InodeFlags::EXTENTS);
        self.i_block = InodeBlocks::empty_indirect();
    }

    /// Append-only and immutable inodes keep their data.
    pub fn can_truncate(&self) -> bool {
        if self.has_flag(InodeFlags::APPEND) || self.has_flag(InodeFlags::IMMUTABLE) {
            return false;
        }
        self.is_file() || self.is_dir()
    }
}

/// Scoped handle on one inode record inside its inode-table block.
pub struct InodeRef<'a, D: BlockDevice> {
    block: BlockRef<'a, D>,
    offset: usize,
    index: u32,
    inode_size: u16,
    inode: Ext4Inode,
    dirty: bool,
}

impl<D: BlockDevice> InodeRef<'_, D> {
    /// Inode number.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn inode(&self) -> &Ext4Inode {
        &self.inode
    }

    pub fn inode_mut(&mut self) -> &mut Ext4Inode {
        self.dirty = true;
        &mut self.inode
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl<D: BlockDevice> Deref for InodeRef<'_, D> {
    type Target = Ext4Inode;

    fn deref(&self) -> &Ext4Inode {
        &self.inode
    }
}

impl<D: BlockDevice> Drop for InodeRef<'_, D> {
    fn drop(&mut self) {
        if self.dirty {
            let mut data = self.block.data_mut();
            let end = self.offset + self.inode_size as usize;
            self.inode.encode(&mut data[self.offset..end], self.inode_size);
        }
    }
}

impl<D: BlockDevice> Ext4Filesystem<D> {
    /// Acquire inode `index` (1-based).
    pub fn get_inode_ref(&self, index: u32) -> Ext4Result<InodeRef<'_, D>> {
        let (ipg, inode_size, block_size) = {
            let sb = self.sb();
            if index == 0 || index > sb.s_inodes_count {
                error!("inode {index} out of range (count {})", sb.s_inodes_count);
                return Err(Ext4Error::InvalidInput);
            }
            (sb.inodes_per_group(), sb.inode_size(), sb.block_size())
        };

        let bgid = (index - 1) / ipg;
        let offset_in_group = (index - 1) % ipg;
        let itable = self.get_block_group_ref(bgid)?.inode_table();

        let byte_offset = offset_in_group as u64 * inode_size as u64;
        let block_id = itable + byte_offset / block_size as u64;
        let offset = (byte_offset % block_size as u64) as usize;

        let block = self.cache.get(block_id)?;
        let inode = Ext4Inode::decode(
            &block.data()[offset..offset + inode_size as usize],
            inode_size,
        );
        trace!("inode {index} at block {block_id} offset {offset}");
        Ok(InodeRef {
            block,
            offset,
            index,
            inode_size,
            inode,
            dirty: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blockdev::RamDisk,
        config::{FormatOptions, MountOptions},
        mkfs,
        superblock::IncompatFeatures,
    };

    fn setup_fs() -> Ext4Filesystem<RamDisk> {
        let opts = FormatOptions {
            block_size: 1024,
            blocks_count: 8192,
            inodes_per_group: 128,
            ..FormatOptions::default()
        };
        let disk = mkfs::format(RamDisk::new(8192 * 1024), &opts).unwrap();
        Ext4Filesystem::open(disk, MountOptions::default()).unwrap()
    }

    #[test]
    fn block_map_follows_extent_flag() {
        let mut raw = [0u8; 256];
        write_u16_le(&mut raw, 0, Ext4Inode::S_IFREG | 0o644);
        write_u32_le(&mut raw, 0x28, 77);
        write_u32_le(&mut raw, 0x28 + 12 * 4, 99);

        let inode = Ext4Inode::decode(&raw, 256);
        assert!(inode.is_file());
        assert!(!inode.uses_extents());
        assert_eq!(inode.direct_block(0), 77);
        assert_eq!(inode.indirect_block(0), 99);

        write_u32_le(&mut raw, 0x20, InodeFlags::EXTENTS.bits());
        let inode = Ext4Inode::decode(&raw, 256);
        assert!(inode.uses_extents());
        assert_eq!(inode.direct_block(0), 0);
        assert_eq!(read_u32_le(inode.extent_root().unwrap(), 0), 77);
    }

    #[test]
    fn encode_keeps_extended_area() {
        let mut raw = [0u8; 256];
        raw[0x90] = 0x42;
        let mut inode = Ext4Inode::decode(&raw, 256);
        inode.set_size(0x1_0000_0010);
        inode.i_extra_isize = 32;
        inode.encode(&mut raw, 256);
        assert_eq!(raw[0x90], 0x42);
        assert_eq!(read_u32_le(&raw, 0x6C), 1);
        assert_eq!(Ext4Inode::decode(&raw, 256).size(), 0x1_0000_0010);
    }

    #[test]
    fn huge_blocks_count_needs_feature() {
        let mut sb = Ext4Superblock::default();
        sb.s_log_block_size = 2;
        let mut inode = Ext4Inode::default();
        inode.set_blocks_count(&sb, 80).unwrap();
        assert_eq!(inode.blocks_count(&sb), 80);
        assert_eq!(
            inode.set_blocks_count(&sb, 1 << 33),
            Err(Ext4Error::InvalidInput)
        );

        sb.s_feature_ro_compat = RoCompatFeatures::HUGE_FILE;
        inode.set_blocks_count(&sb, 1 << 33).unwrap();
        assert_eq!(inode.blocks_count(&sb), 1 << 33);
        inode.set_blocks_count(&sb, 1 << 50).unwrap();
        assert!(inode.has_flag(InodeFlags::HUGE_FILE));
        assert_eq!(inode.blocks_count(&sb), 1 << 50);
    }

    #[test]
    fn extent_root_initialisation() {
        let mut inode = Ext4Inode::default();
        inode.init_extent_root();
        let header = ExtentHeader::from_disk_bytes(inode.extent_root().unwrap());
        assert_eq!(header.magic, EXT4_EXTENT_MAGIC);
        assert_eq!(header.max, 4);
        assert_eq!(header.entries, 0);
        assert!(inode.has_flag(InodeFlags::EXTENTS));
        inode.clear_block_map();
        assert!(!inode.uses_extents());
    }

    #[test]
    fn inode_ref_writes_back_on_drop() {
        let fs = setup_fs();
        {
            let mut inode = fs.get_inode_ref(12).unwrap();
            inode.inode_mut().i_links_count = 3;
            inode.inode_mut().set_size(4096);
        }
        let inode = fs.get_inode_ref(12).unwrap();
        assert_eq!(inode.i_links_count, 3);
        assert_eq!(inode.size(), 4096);
        assert_eq!(inode.index(), 12);
    }

    #[test]
    fn root_inode_is_a_directory() {
        let fs = setup_fs();
        let root = fs.get_inode_ref(ROOT_INODE).unwrap();
        assert!(root.is_dir());
        assert_eq!(root.i_links_count, 2);
        assert_eq!(
            root.uses_extents(),
            fs.sb().has_incompat(IncompatFeatures::EXTENTS)
        );
    }

    #[test]
    fn out_of_range_inode_is_rejected() {
        let fs = setup_fs();
        assert_eq!(fs.get_inode_ref(0).err(), Some(Ext4Error::InvalidInput));
        let count = fs.sb().s_inodes_count;
        assert_eq!(
            fs.get_inode_ref(count + 1).err(),
            Some(Ext4Error::InvalidInput)
        );
    }
}
