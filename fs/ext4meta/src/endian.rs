// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! # Little-endian field access
//!
//! Every on-disk record is little-endian. The helpers take the record
//! buffer plus a byte offset so codecs read like a field table.

#[inline]
pub fn read_u8(bytes: &[u8], off: usize) -> u8 {
    bytes[off]
}

#[inline]
pub fn read_u16_le(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([bytes[off], bytes[off + 1]])
}

#[inline]
pub fn read_u32_le(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

#[inline]
pub fn write_u8(bytes: &mut [u8], off: usize, value: u8) {
    bytes[off] = value;
}

#[inline]
pub fn write_u16_le(bytes: &mut [u8], off: usize, value: u16) {
    bytes[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_u32_le(bytes: &mut [u8], off: usize, value: u32) {
    bytes[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

/// Join a split `hi:lo` pair into one value.
#[inline]
pub fn join_hi_lo(hi: u32, lo: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

/// Split a value into its `(hi, lo)` 32-bit halves.
#[inline]
pub fn split_hi_lo(value: u64) -> (u32, u32) {
    ((value >> 32) as u32, value as u32)
}

/// A packed on-disk record with a fixed little-endian layout.
pub trait DiskFormat: Sized {
    /// Size of the record on disk, in bytes.
    const DISK_SIZE: usize;

    /// Decode from the first `DISK_SIZE` bytes of `bytes`.
    fn from_disk_bytes(bytes: &[u8]) -> Self;

    /// Encode into the first `DISK_SIZE` bytes of `bytes`.
    fn to_disk_bytes(&self, bytes: &mut [u8]);
}
