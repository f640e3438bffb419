// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! # Bitmap operations
//!
//! Bit-level primitives shared by the block and inode allocators. Bit `i`
//! lives in byte `i / 8` at position `i % 8`; a set bit means "in use".

#[inline]
pub fn is_bit_set(data: &[u8], bit: u32) -> bool {
    data[(bit / 8) as usize] & (1 << (bit % 8)) != 0
}

#[inline]
pub fn is_bit_free(data: &[u8], bit: u32) -> bool {
    !is_bit_set(data, bit)
}

#[inline]
pub fn set_bit(data: &mut [u8], bit: u32) {
    data[(bit / 8) as usize] |= 1 << (bit % 8);
}

#[inline]
pub fn clear_bit(data: &mut [u8], bit: u32) {
    data[(bit / 8) as usize] &= !(1 << (bit % 8));
}

/// Set `count` bits starting at `first`, a whole byte at a time where aligned.
pub fn set_bits(data: &mut [u8], first: u32, count: u32) {
    fill_bits(data, first, count, true);
}

/// Clear `count` bits starting at `first`.
pub fn clear_bits(data: &mut [u8], first: u32, count: u32) {
    fill_bits(data, first, count, false);
}

fn fill_bits(data: &mut [u8], first: u32, count: u32, value: bool) {
    let end = first + count;
    let mut bit = first;
    while bit < end {
        if bit % 8 == 0 && end - bit >= 8 {
            let whole = ((end - bit) / 8) as usize;
            let start = (bit / 8) as usize;
            data[start..start + whole].fill(if value { 0xff } else { 0 });
            bit += whole as u32 * 8;
            continue;
        }
        if value {
            set_bit(data, bit);
        } else {
            clear_bit(data, bit);
        }
        bit += 1;
    }
}

/// Find the first free bit in `[start, max)`, mark it used and return it.
pub fn find_free_bit_and_set(data: &mut [u8], start: u32, max: u32) -> Option<u32> {
    let mut bit = start;
    while bit < max {
        // skip fully used bytes
        if bit % 8 == 0 && data[(bit / 8) as usize] == 0xff {
            bit += 8;
            continue;
        }
        if is_bit_free(data, bit) {
            set_bit(data, bit);
            return Some(bit);
        }
        bit += 1;
    }
    None
}

/// Find the first completely free byte at or after `start` (rounded up to
/// a byte boundary) and below `max`, mark its first bit used and return it.
pub fn find_free_byte_and_set_bit(data: &mut [u8], start: u32, max: u32) -> Option<u32> {
    let first_byte = start.div_ceil(8);
    let last_byte = max / 8;
    for byte in first_byte..last_byte {
        if data[byte as usize] == 0 {
            let bit = byte * 8;
            set_bit(data, bit);
            return Some(bit);
        }
    }
    None
}

/// Number of set bits among the first `bits` bits.
pub fn count_set_bits(data: &[u8], bits: u32) -> u32 {
    let whole = (bits / 8) as usize;
    let mut count: u32 = data[..whole].iter().map(|b| b.count_ones()).sum();
    for bit in (whole as u32 * 8)..bits {
        count += is_bit_set(data, bit) as u32;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_bit_operations() {
        let mut data = [0u8; 4];
        set_bit(&mut data, 0);
        set_bit(&mut data, 9);
        assert_eq!(data, [0x01, 0x02, 0, 0]);
        assert!(is_bit_set(&data, 9));
        assert!(is_bit_free(&data, 8));
        clear_bit(&mut data, 9);
        assert_eq!(data[1], 0);
    }

    #[test]
    fn runs_cover_partial_and_whole_bytes() {
        let mut data = [0u8; 4];
        set_bits(&mut data, 3, 20);
        assert_eq!(data, [0xf8, 0xff, 0x7f, 0x00]);
        assert_eq!(count_set_bits(&data, 32), 20);
        clear_bits(&mut data, 4, 12);
        assert_eq!(data, [0x08, 0x00, 0x7f, 0x00]);
    }

    #[test]
    fn free_bit_search_respects_bounds() {
        let mut data = [0xffu8, 0xff, 0b1110_1111, 0x00];
        assert_eq!(find_free_bit_and_set(&mut data, 0, 32), Some(20));
        assert!(is_bit_set(&data, 20));
        assert_eq!(find_free_bit_and_set(&mut data, 0, 24), None);
        assert_eq!(find_free_bit_and_set(&mut data, 25, 32), Some(25));
    }

    #[test]
    fn free_byte_search_rounds_start_up() {
        let mut data = [0u8, 0x01, 0x00, 0x00];
        assert_eq!(find_free_byte_and_set_bit(&mut data, 1, 32), Some(16));
        assert_eq!(data[2], 0x01);
        assert_eq!(find_free_byte_and_set_bit(&mut data, 0, 32), Some(0));
        assert_eq!(find_free_byte_and_set_bit(&mut data, 1, 24), None);
    }

    #[test]
    fn count_stops_at_bit_limit() {
        let data = [0xffu8, 0xff];
        assert_eq!(count_set_bits(&data, 11), 11);
    }
}
