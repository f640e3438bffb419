// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! # ext4meta
//!
//! Metadata engine for ext4 volumes, without data I/O or journaling.
//!
//! The engine keeps the on-disk structures of a mounted volume consistent:
//! - superblock and block group descriptors (superblock, block_group, checksum)
//! - block and inode allocation over the group bitmaps (bitmap, balloc, ialloc)
//! - logical to physical block mapping, both the classic indirect scheme
//!   and extent trees (indirect, extent)
//! - linear and hash-indexed directories (dir, dir_index, hash)
//! - the mount session, inode lifecycle and orphan list (filesystem, inode)
//! - a formatter for fresh images (mkfs)
//!
//! Storage is reached through the [`BlockDevice`] trait and a reference
//! counted [`BlockCache`](cache::BlockCache).

#![no_std]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub use blockdev::{BlockDevice, RamDisk};
pub use config::{FormatOptions, MountOptions, ROOT_INODE};
pub use dir::{DirEntry, DirSearchResult};
pub use error::{BlockDevError, BlockDevResult, Ext4Error, Ext4Result};
pub use filesystem::{Ext4Filesystem, InodeKind};
pub use inode::{Ext4Inode, InodeRef};
pub use mkfs::format;
pub use superblock::Ext4Superblock;

pub mod balloc;
pub mod bitmap;
pub mod block_group;
pub mod blockdev;
pub mod cache;
pub mod checksum;
pub mod config;
pub mod dir;
pub mod dir_index;
pub mod endian;
pub mod error;
pub mod extent;
pub mod filesystem;
pub mod hash;
pub mod ialloc;
pub mod indirect;
pub mod inode;
pub mod mkfs;
pub mod superblock;
