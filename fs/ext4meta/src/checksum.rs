// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! CRC-16 (IBM/ANSI, reflected polynomial 0xA001) for group descriptor checksums.

const CRC16_POLY: u16 = 0xA001;

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC16_POLY
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC16_TABLE: [u16; 256] = build_table();

/// Continue a CRC-16 over `data` starting from `crc`.
pub fn crc16(mut crc: u16, data: &[u8]) -> u16 {
    for byte in data {
        crc = (crc >> 8) ^ CRC16_TABLE[((crc ^ *byte as u16) & 0xff) as usize];
    }
    crc
}
