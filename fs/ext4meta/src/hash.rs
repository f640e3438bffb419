// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! # Directory name hashes
//!
//! Hashes used to order entries in hash-indexed directories. Each
//! algorithm exists in a signed and an unsigned flavour, which differ only
//! in how name bytes above 0x7F are widened. The final hash has its low
//! bit cleared, and the end-of-tree marker never appears as a real hash.

use log::warn;

use crate::error::{Ext4Error, Ext4Result};

pub const DX_HASH_LEGACY: u8 = 0;
pub const DX_HASH_HALF_MD4: u8 = 1;
pub const DX_HASH_TEA: u8 = 2;
pub const DX_HASH_LEGACY_UNSIGNED: u8 = 3;
pub const DX_HASH_HALF_MD4_UNSIGNED: u8 = 4;
pub const DX_HASH_TEA_UNSIGNED: u8 = 5;

/// Largest 32-bit hash position, reserved to mean "end of directory".
pub const EXT4_HTREE_EOF_32BIT: u32 = 0x7FFF_FFFF;

/// Seed used when the superblock seed is all zero.
pub const DEFAULT_SEED: [u32; 4] = [0x6745_2301, 0xEFCD_AB89, 0x98BA_DCFE, 0x1032_5476];

/// Working state of one name hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DxHashInfo {
    pub hash: u32,
    pub minor_hash: u32,
    pub hash_version: u8,
    pub seed: [u32; 4],
}

impl DxHashInfo {
    pub fn new(hash_version: u8, seed: [u32; 4]) -> Self {
        Self {
            hash: 0,
            minor_hash: 0,
            hash_version,
            seed,
        }
    }

    /// Hash `name` into `hash` and `minor_hash`.
    pub fn compute(&mut self, name: &[u8]) -> Ext4Result<()> {
        let mut buf = if self.seed.iter().any(|&w| w != 0) {
            self.seed
        } else {
            DEFAULT_SEED
        };

        let (hash, minor) = match self.hash_version {
            DX_HASH_LEGACY => (dx_hack_hash(name, true), 0),
            DX_HASH_LEGACY_UNSIGNED => (dx_hack_hash(name, false), 0),
            DX_HASH_HALF_MD4 | DX_HASH_HALF_MD4_UNSIGNED => {
                let signed = self.hash_version == DX_HASH_HALF_MD4;
                let mut input = [0u32; 8];
                for chunk_start in (0..name.len()).step_by(32) {
                    str2hashbuf(&name[chunk_start..], &mut input, signed);
                    half_md4_transform(&mut buf, &input);
                }
                (buf[1], buf[2])
            }
            DX_HASH_TEA | DX_HASH_TEA_UNSIGNED => {
                let signed = self.hash_version == DX_HASH_TEA;
                let mut input = [0u32; 4];
                for chunk_start in (0..name.len()).step_by(16) {
                    str2hashbuf(&name[chunk_start..], &mut input, signed);
                    tea_transform(&mut buf, &input);
                }
                (buf[0], buf[1])
            }
            other => {
                warn!("unknown directory hash version {other}");
                self.hash = 0;
                return Err(Ext4Error::Unsupported);
            }
        };

        let mut hash = hash & !1;
        if hash == EXT4_HTREE_EOF_32BIT << 1 {
            hash = (EXT4_HTREE_EOF_32BIT - 1) << 1;
        }
        self.hash = hash;
        self.minor_hash = minor;
        Ok(())
    }
}

/// Hash `name` with `hash_version` and `seed`, returning `(major, minor)`.
pub fn dx_hash(name: &[u8], hash_version: u8, seed: &[u32; 4]) -> Ext4Result<(u32, u32)> {
    let mut info = DxHashInfo::new(hash_version, *seed);
    info.compute(name)?;
    Ok((info.hash, info.minor_hash))
}

/// Widen a name byte the way the chosen flavour does.
#[inline]
fn widen(byte: u8, signed: bool) -> u32 {
    if signed {
        byte as i8 as i32 as u32
    } else {
        byte as u32
    }
}

fn dx_hack_hash(name: &[u8], signed: bool) -> u32 {
    let (mut hash0, mut hash1): (u32, u32) = (0x12A3_FE2D, 0x37AB_E8F9);
    for &byte in name {
        let mut hash = hash1.wrapping_add(hash0 ^ widen(byte, signed).wrapping_mul(7_152_373));
        if hash & 0x8000_0000 != 0 {
            hash = hash.wrapping_sub(0x7FFF_FFFF);
        }
        hash1 = hash0;
        hash0 = hash;
    }
    hash0 << 1
}

/// Pack up to `4 * out.len()` name bytes into big-endian-ish words, padding
/// with a pattern derived from the remaining length.
fn str2hashbuf(msg: &[u8], out: &mut [u32], signed: bool) {
    let len = msg.len() as u32;
    let mut pad = len | (len << 8);
    pad |= pad << 16;

    let take = msg.len().min(out.len() * 4);
    let mut val = pad;
    let mut slot = 0;
    for (i, &byte) in msg[..take].iter().enumerate() {
        val = widen(byte, signed).wrapping_add(val << 8);
        if i % 4 == 3 {
            out[slot] = val;
            slot += 1;
            val = pad;
        }
    }
    if slot < out.len() {
        out[slot] = val;
        slot += 1;
    }
    out[slot..].fill(pad);
}

const K2: u32 = 0x5A82_7999;
const K3: u32 = 0x6ED9_EBA1;

#[inline]
fn f(x: u32, y: u32, z: u32) -> u32 {
    z ^ (x & (y ^ z))
}

#[inline]
fn g(x: u32, y: u32, z: u32) -> u32 {
    (x & y).wrapping_add((x ^ y) & z)
}

#[inline]
fn h(x: u32, y: u32, z: u32) -> u32 {
    x ^ y ^ z
}

/// Reduced MD4 compression over eight input words.
fn half_md4_transform(buf: &mut [u32; 4], input: &[u32; 8]) {
    let [mut a, mut b, mut c, mut d] = *buf;

    macro_rules! round {
        ($f:ident, $a:ident, $b:ident, $c:ident, $d:ident, $x:expr, $s:expr) => {
            $a = $a.wrapping_add($f($b, $c, $d)).wrapping_add($x).rotate_left($s);
        };
    }

    round!(f, a, b, c, d, input[0], 3);
    round!(f, d, a, b, c, input[1], 7);
    round!(f, c, d, a, b, input[2], 11);
    round!(f, b, c, d, a, input[3], 19);
    round!(f, a, b, c, d, input[4], 3);
    round!(f, d, a, b, c, input[5], 7);
    round!(f, c, d, a, b, input[6], 11);
    round!(f, b, c, d, a, input[7], 19);

    round!(g, a, b, c, d, input[1].wrapping_add(K2), 3);
    round!(g, d, a, b, c, input[3].wrapping_add(K2), 5);
    round!(g, c, d, a, b, input[5].wrapping_add(K2), 9);
    round!(g, b, c, d, a, input[7].wrapping_add(K2), 13);
    round!(g, a, b, c, d, input[0].wrapping_add(K2), 3);
    round!(g, d, a, b, c, input[2].wrapping_add(K2), 5);
    round!(g, c, d, a, b, input[4].wrapping_add(K2), 9);
    round!(g, b, c, d, a, input[6].wrapping_add(K2), 13);

    round!(h, a, b, c, d, input[3].wrapping_add(K3), 3);
    round!(h, d, a, b, c, input[7].wrapping_add(K3), 9);
    round!(h, c, d, a, b, input[2].wrapping_add(K3), 11);
    round!(h, b, c, d, a, input[6].wrapping_add(K3), 15);
    round!(h, a, b, c, d, input[1].wrapping_add(K3), 3);
    round!(h, d, a, b, c, input[5].wrapping_add(K3), 9);
    round!(h, c, d, a, b, input[0].wrapping_add(K3), 11);
    round!(h, b, c, d, a, input[4].wrapping_add(K3), 15);

    buf[0] = buf[0].wrapping_add(a);
    buf[1] = buf[1].wrapping_add(b);
    buf[2] = buf[2].wrapping_add(c);
    buf[3] = buf[3].wrapping_add(d);
}

/// 16 rounds of TEA over four input words, folded into `buf[0..2]`.
fn tea_transform(buf: &mut [u32; 4], input: &[u32; 4]) {
    const DELTA: u32 = 0x9E37_79B9;
    let (mut b0, mut b1) = (buf[0], buf[1]);
    let [a, b, c, d] = *input;
    let mut sum: u32 = 0;

    for _ in 0..16 {
        sum = sum.wrapping_add(DELTA);
        b0 = b0.wrapping_add(
            ((b1 << 4).wrapping_add(a)) ^ b1.wrapping_add(sum) ^ ((b1 >> 5).wrapping_add(b)),
        );
        b1 = b1.wrapping_add(
            ((b0 << 4).wrapping_add(c)) ^ b0.wrapping_add(sum) ^ ((b0 >> 5).wrapping_add(d)),
        );
    }

    buf[0] = buf[0].wrapping_add(b0);
    buf[1] = buf[1].wrapping_add(b1);
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZERO_SEED: [u32; 4] = [0; 4];
    const LONG_NAME: &[u8] = b"a_rather_long_file_name_exceeding_32_bytes.txt";
    /// UTF-8 bytes with the high bit set.
    const HIGH_BYTES: &[u8] = &[0xE4, 0xBD, 0xA0];

    #[test]
    fn empty_name_leaves_seed_words() {
        assert_eq!(dx_hash(b"", DX_HASH_LEGACY, &ZERO_SEED).unwrap(), (0x2547_FC5A, 0));
        assert_eq!(
            dx_hash(b"", DX_HASH_HALF_MD4, &ZERO_SEED).unwrap(),
            (0xEFCD_AB88, 0x98BA_DCFE)
        );
        assert_eq!(
            dx_hash(b"", DX_HASH_TEA, &ZERO_SEED).unwrap(),
            (0x6745_2300, 0xEFCD_AB89)
        );
    }

    #[test]
    fn legacy_vectors() {
        assert_eq!(dx_hash(b"a", DX_HASH_LEGACY, &ZERO_SEED).unwrap().0, 0xE74B_53E2);
        assert_eq!(dx_hash(b"hello", DX_HASH_LEGACY, &ZERO_SEED).unwrap().0, 0x3225_2546);
        assert_eq!(
            dx_hash(b"lost+found", DX_HASH_LEGACY, &ZERO_SEED).unwrap().0,
            0x5E2A_BA24
        );
    }

    #[test]
    fn half_md4_vectors() {
        assert_eq!(
            dx_hash(b"hello", DX_HASH_HALF_MD4, &ZERO_SEED).unwrap(),
            (0x1746_DA32, 0x4200_13B5)
        );
        assert_eq!(
            dx_hash(b"lost+found", DX_HASH_HALF_MD4, &ZERO_SEED).unwrap(),
            (0x591D_E422, 0x6FFC_56E0)
        );
        // two 32-byte rounds
        assert_eq!(
            dx_hash(LONG_NAME, DX_HASH_HALF_MD4, &ZERO_SEED).unwrap(),
            (0x897A_AD4A, 0xB469_74AA)
        );
    }

    #[test]
    fn tea_vectors() {
        assert_eq!(
            dx_hash(b"hello", DX_HASH_TEA, &ZERO_SEED).unwrap(),
            (0x6F5B_B1A8, 0x2319_17C2)
        );
        assert_eq!(
            dx_hash(LONG_NAME, DX_HASH_TEA, &ZERO_SEED).unwrap(),
            (0xBE68_9EE2, 0x0666_41DC)
        );
    }

    #[test]
    fn signedness_only_matters_for_high_bytes() {
        let pairs = [
            (DX_HASH_LEGACY, DX_HASH_LEGACY_UNSIGNED),
            (DX_HASH_HALF_MD4, DX_HASH_HALF_MD4_UNSIGNED),
            (DX_HASH_TEA, DX_HASH_TEA_UNSIGNED),
        ];
        for (signed, unsigned) in pairs {
            assert_eq!(
                dx_hash(b"hello", signed, &ZERO_SEED).unwrap(),
                dx_hash(b"hello", unsigned, &ZERO_SEED).unwrap()
            );
            assert_ne!(
                dx_hash(HIGH_BYTES, signed, &ZERO_SEED).unwrap(),
                dx_hash(HIGH_BYTES, unsigned, &ZERO_SEED).unwrap()
            );
        }
        assert_eq!(
            dx_hash(HIGH_BYTES, DX_HASH_LEGACY, &ZERO_SEED).unwrap().0,
            0xEE4C_7826
        );
        assert_eq!(
            dx_hash(HIGH_BYTES, DX_HASH_LEGACY_UNSIGNED, &ZERO_SEED).unwrap().0,
            0xEB49_3026
        );
    }

    #[test]
    fn zero_seed_selects_default() {
        for version in 0..6 {
            assert_eq!(
                dx_hash(b"seeded", version, &ZERO_SEED).unwrap(),
                dx_hash(b"seeded", version, &DEFAULT_SEED).unwrap()
            );
        }
        assert_eq!(
            dx_hash(b"hello", DX_HASH_HALF_MD4, &[1, 2, 3, 4]).unwrap(),
            (2_749_438_084, 1_847_190_215)
        );
    }

    #[test]
    fn hashes_are_deterministic_and_even() {
        let seed = [0xDEAD_BEEF, 0x0123_4567, 0x89AB_CDEF, 0x0F0F_0F0F];
        for version in 0..6 {
            for name in [&b"x"[..], b"file.txt", LONG_NAME, HIGH_BYTES] {
                let first = dx_hash(name, version, &seed).unwrap();
                assert_eq!(first, dx_hash(name, version, &seed).unwrap());
                assert_eq!(first.0 & 1, 0);
                assert_ne!(first.0, EXT4_HTREE_EOF_32BIT << 1);
            }
        }
    }

    #[test]
    fn unknown_version_is_rejected() {
        assert_eq!(dx_hash(b"a", 6, &ZERO_SEED), Err(Ext4Error::Unsupported));
    }

    #[test]
    fn short_names_are_padded() {
        let mut out = [0u32; 4];
        str2hashbuf(b"abcde", &mut out, false);
        let pad = 0x0505_0505;
        assert_eq!(out[0], u32::from_be_bytes(*b"abcd"));
        assert_eq!(out[1], (pad << 8) | b'e' as u32);
        assert_eq!(out[2..], [pad, pad]);
    }
}
