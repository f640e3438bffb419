// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! # Error types
//!
//! Two layers of errors: [`BlockDevError`] for the device and block cache,
//! [`Ext4Error`] for the metadata engine. Device errors travel upward
//! unchanged inside [`Ext4Error::Io`].

use core::fmt;

/// Errors reported by a [`BlockDevice`](crate::blockdev::BlockDevice) or the block cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDevError {
    /// Invalid argument passed to the device.
    InvalidInput,
    /// The device failed to read.
    ReadError,
    /// The device failed to write.
    WriteError,
    /// Block number past the end of the device.
    BlockOutOfRange { block_id: u64, max_blocks: u64 },
    /// Filesystem block size is not a multiple of the device sector size.
    InvalidBlockSize { size: usize, expected: usize },
    /// Caller buffer shorter than the transfer.
    BufferTooSmall { provided: usize, required: usize },
    /// Write attempted on a read-only device.
    ReadOnly,
}

impl fmt::Display for BlockDevError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockDevError::InvalidInput => write!(f, "invalid input"),
            BlockDevError::ReadError => write!(f, "failed to read from block device"),
            BlockDevError::WriteError => write!(f, "failed to write to block device"),
            BlockDevError::BlockOutOfRange {
                block_id,
                max_blocks,
            } => write!(f, "block id {block_id} out of range (max {max_blocks})"),
            BlockDevError::InvalidBlockSize { size, expected } => {
                write!(f, "invalid block size {size} (must be a multiple of {expected})")
            }
            BlockDevError::BufferTooSmall { provided, required } => write!(
                f,
                "buffer too small: provided {provided} bytes, required {required} bytes"
            ),
            BlockDevError::ReadOnly => write!(f, "device is read-only"),
        }
    }
}

/// Result of a device or cache operation.
pub type BlockDevResult<T> = Result<T, BlockDevError>;

/// Errors reported by the metadata engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ext4Error {
    /// No free block or inode left in any group.
    NoSpace,
    /// The volume uses a feature this engine does not understand.
    Unsupported,
    /// An on-disk structure failed validation.
    Corrupted,
    /// Name absent from a directory, or inode absent from the orphan list.
    NotFound,
    /// Invalid argument (bad inode number, growing truncate, oversized name).
    InvalidInput,
    /// Mutation requested on a read-only mount.
    ReadOnly,
    /// The inode is not a directory.
    NotDirectory,
    /// A group descriptor checksum did not match its contents.
    ChecksumMismatch,
    /// The hashed directory index cannot grow past two levels.
    DirectoryIndexFull,
    /// Failure propagated from the block device or cache.
    Io(BlockDevError),
}

impl fmt::Display for Ext4Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ext4Error::NoSpace => write!(f, "no space left on volume"),
            Ext4Error::Unsupported => write!(f, "unsupported filesystem feature"),
            Ext4Error::Corrupted => write!(f, "corrupted on-disk structure"),
            Ext4Error::NotFound => write!(f, "entry not found"),
            Ext4Error::InvalidInput => write!(f, "invalid argument"),
            Ext4Error::ReadOnly => write!(f, "filesystem is mounted read-only"),
            Ext4Error::NotDirectory => write!(f, "not a directory"),
            Ext4Error::ChecksumMismatch => write!(f, "block group descriptor checksum mismatch"),
            Ext4Error::DirectoryIndexFull => write!(f, "directory index is full"),
            Ext4Error::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl From<BlockDevError> for Ext4Error {
    fn from(err: BlockDevError) -> Self {
        Ext4Error::Io(err)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for BlockDevError {}

#[cfg(feature = "std")]
impl std::error::Error for Ext4Error {}

/// Result of an engine operation.
pub type Ext4Result<T> = Result<T, Ext4Error>;
