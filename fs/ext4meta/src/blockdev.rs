// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! # Block device
//!
//! The raw storage collaborator. Implementors move whole device sectors;
//! the [`BlockCache`](crate::cache::BlockCache) maps filesystem blocks onto
//! sectors and never hands a partial sector to the device.

use alloc::{vec, vec::Vec};

use crate::error::{BlockDevError, BlockDevResult};

/// Sector-addressed storage backing a volume.
pub trait BlockDevice {
    /// Write `count` sectors starting at `block_id` from `buffer`.
    fn write(&mut self, buffer: &[u8], block_id: u64, count: u32) -> BlockDevResult<()>;

    /// Read `count` sectors starting at `block_id` into `buffer`.
    fn read(&mut self, buffer: &mut [u8], block_id: u64, count: u32) -> BlockDevResult<()>;

    /// Number of sectors on the device.
    fn total_blocks(&self) -> u64;

    /// Sector size in bytes.
    fn block_size(&self) -> u32 {
        512
    }

    /// Push any device-side write buffering to stable storage.
    fn flush(&mut self) -> BlockDevResult<()> {
        Ok(())
    }

    fn is_readonly(&self) -> bool {
        false
    }
}

/// Memory-backed device, used to build and inspect images.
#[derive(Debug, Clone)]
pub struct RamDisk {
    data: Vec<u8>,
    sector_size: u32,
    readonly: bool,
}

impl RamDisk {
    /// Zero-filled disk of `total_bytes` bytes with 512-byte sectors.
    pub fn new(total_bytes: usize) -> Self {
        Self::with_sector_size(total_bytes, 512)
    }

    pub fn with_sector_size(total_bytes: usize, sector_size: u32) -> Self {
        Self {
            data: vec![0u8; total_bytes],
            sector_size,
            readonly: false,
        }
    }

    pub fn set_readonly(&mut self, readonly: bool) {
        self.readonly = readonly;
    }

    /// Raw image bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn span(&self, block_id: u64, count: u32, buf_len: usize) -> BlockDevResult<(usize, usize)> {
        let required = self.sector_size as usize * count as usize;
        if buf_len < required {
            return Err(BlockDevError::BufferTooSmall {
                provided: buf_len,
                required,
            });
        }
        let start = block_id as usize * self.sector_size as usize;
        let end = start + required;
        if end > self.data.len() {
            return Err(BlockDevError::BlockOutOfRange {
                block_id,
                max_blocks: self.total_blocks(),
            });
        }
        Ok((start, end))
    }
}

impl BlockDevice for RamDisk {
    fn write(&mut self, buffer: &[u8], block_id: u64, count: u32) -> BlockDevResult<()> {
        if self.readonly {
            return Err(BlockDevError::ReadOnly);
        }
        let (start, end) = self.span(block_id, count, buffer.len())?;
        self.data[start..end].copy_from_slice(&buffer[..end - start]);
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8], block_id: u64, count: u32) -> BlockDevResult<()> {
        let (start, end) = self.span(block_id, count, buffer.len())?;
        buffer[..end - start].copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn total_blocks(&self) -> u64 {
        (self.data.len() / self.sector_size as usize) as u64
    }

    fn block_size(&self) -> u32 {
        self.sector_size
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sectors_round_trip() {
        let mut disk = RamDisk::new(4096);
        let data = [0xa5u8; 1024];
        disk.write(&data, 2, 2).unwrap();

        let mut out = [0u8; 1024];
        disk.read(&mut out, 2, 2).unwrap();
        assert_eq!(out, data);
        assert_eq!(disk.as_bytes()[1023], 0);
        assert_eq!(disk.as_bytes()[1024], 0xa5);
    }

    #[test]
    fn rejects_out_of_range_and_short_buffers() {
        let mut disk = RamDisk::new(2048);
        let mut buf = [0u8; 512];
        assert_eq!(
            disk.read(&mut buf, 4, 1),
            Err(BlockDevError::BlockOutOfRange {
                block_id: 4,
                max_blocks: 4
            })
        );
        assert!(matches!(
            disk.read(&mut buf, 0, 2),
            Err(BlockDevError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn readonly_disk_refuses_writes() {
        let mut disk = RamDisk::new(1024);
        disk.set_readonly(true);
        assert_eq!(disk.write(&[0u8; 512], 0, 1), Err(BlockDevError::ReadOnly));
    }
}
