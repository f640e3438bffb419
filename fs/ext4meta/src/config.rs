// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! # Configuration
//!
//! Fixed format constants plus the runtime knobs for mounting and
//! formatting a volume.

// ============================================================================
// On-disk format
// ============================================================================

/// Byte offset of the primary superblock from the start of the volume.
pub const SUPERBLOCK_OFFSET: u64 = 1024;
/// Size of the superblock record.
pub const SUPERBLOCK_SIZE: usize = 1024;
/// Superblock magic.
pub const EXT4_SUPER_MAGIC: u16 = 0xEF53;
/// Smallest supported block size.
pub const EXT4_MIN_BLOCK_SIZE: u32 = 1024;
/// Largest supported block size.
pub const EXT4_MAX_BLOCK_SIZE: u32 = 65536;

/// Group descriptor size without the 64BIT feature.
pub const GROUP_DESC_SIZE_OLD: u16 = 32;
/// Group descriptor size with the 64BIT feature.
pub const GROUP_DESC_SIZE: u16 = 64;

/// Inode size of revision 0 volumes.
pub const GOOD_OLD_INODE_SIZE: u16 = 128;
/// First usable inode on revision 0 volumes.
pub const GOOD_OLD_FIRST_INO: u32 = 11;
/// Root directory inode.
pub const ROOT_INODE: u32 = 2;

/// 32-bit words in the inode block array.
pub const INODE_BLOCK_WORDS: usize = 15;
/// Direct pointers in the indirect scheme.
pub const DIRECT_BLOCKS: usize = 12;
/// Single, double and triple indirect pointers.
pub const INDIRECT_LEVELS: usize = 3;

/// Longest directory entry name.
pub const MAX_NAME_LEN: usize = 255;

// ============================================================================
// Runtime
// ============================================================================

/// Default number of blocks the cache keeps before evicting clean ones.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Options for [`Ext4Filesystem::open`](crate::filesystem::Ext4Filesystem::open).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountOptions {
    /// Refuse every mutation.
    pub read_only: bool,
    /// Soft limit on cached blocks.
    pub cache_capacity: usize,
    /// Verify group descriptor checksums when a descriptor is acquired.
    pub verify_checksums: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            verify_checksums: false,
        }
    }
}

/// Options for [`mkfs::format`](crate::mkfs::format).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOptions {
    /// Block size in bytes, a power of two between 1 KiB and 64 KiB.
    pub block_size: u32,
    /// Total blocks on the volume.
    pub blocks_count: u64,
    /// Blocks per group; at most `8 * block_size`.
    pub blocks_per_group: u32,
    /// Inodes per group; a multiple of eight.
    pub inodes_per_group: u32,
    /// Inode record size.
    pub inode_size: u16,
    /// Reserved descriptor-table blocks for online growth.
    pub reserved_gdt_blocks: u16,
    /// New inodes use extent trees.
    pub extents: bool,
    /// Directories may be hash indexed.
    pub dir_index: bool,
    /// 64-byte descriptors and 48-bit block numbers.
    pub bit64: bool,
    /// Group descriptor checksums.
    pub gdt_csum: bool,
    /// Superblock backups only in groups 0, 1 and powers of 3, 5, 7.
    pub sparse_super: bool,
    /// Default directory hash algorithm.
    pub hash_version: u8,
    /// Directory hash seed; all zero selects the built-in default.
    pub hash_seed: [u32; 4],
    /// Use unsigned-char hash variants.
    pub unsigned_hash: bool,
    /// Volume UUID.
    pub uuid: [u8; 16],
    /// Volume label.
    pub volume_name: [u8; 16],
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            blocks_count: 8192,
            blocks_per_group: 8192,
            inodes_per_group: 256,
            inode_size: 256,
            reserved_gdt_blocks: 0,
            extents: true,
            dir_index: true,
            bit64: false,
            gdt_csum: true,
            sparse_super: true,
            hash_version: crate::hash::DX_HASH_HALF_MD4,
            hash_seed: [0x2f8c_1e6b, 0x91d3_44a0, 0x5b7e_c2d9, 0x0e6a_f317],
            unsigned_hash: false,
            uuid: [
                0x5e, 0x1d, 0x8a, 0x31, 0x2c, 0x44, 0x4b, 0x8f, 0x9a, 0x07, 0x6b, 0xd2, 0x3e, 0x11,
                0xc0, 0x7a,
            ],
            volume_name: *b"ext4meta\0\0\0\0\0\0\0\0",
        }
    }
}
