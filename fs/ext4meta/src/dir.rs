// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! # Directory entries
//!
//! A directory block is tiled by variable-length records:
//!
//! ```text
//! +--------+---------+----------+---------------------+------------+
//! | inode  | rec_len | name_len | file_type / len_hi  | name ...   |
//! | u32 le | u16 le  | u8       | u8                  | padded /4  |
//! +--------+---------+----------+---------------------+------------+
//! ```
//!
//! Each record's `rec_len` reaches the next record, so the last record of a
//! block absorbs the slack. A record with inode 0 is free space. Hash
//! indexed directories use the same records in their leaf blocks.

use alloc::vec::Vec;

use log::{error, trace, warn};

use crate::{
    blockdev::BlockDevice,
    config::MAX_NAME_LEN,
    endian::*,
    error::{Ext4Error, Ext4Result},
    filesystem::Ext4Filesystem,
    inode::{Ext4Inode, InodeFlags, InodeRef},
    superblock::{CompatFeatures, Ext4Superblock},
};

/// Size of the fixed record header.
pub const DIR_ENTRY_HEADER_LEN: usize = 8;

/// Record length of an entry spanning a whole 64 KiB block.
const MAX_REC_LEN: usize = 65536;
/// How [`MAX_REC_LEN`] is stored in the 16-bit field.
const MAX_REC_LEN_ON_DISK: u16 = 0xffff;

pub const EXT4_FT_UNKNOWN: u8 = 0;
pub const EXT4_FT_REG_FILE: u8 = 1;
pub const EXT4_FT_DIR: u8 = 2;
pub const EXT4_FT_CHRDEV: u8 = 3;
pub const EXT4_FT_BLKDEV: u8 = 4;
pub const EXT4_FT_FIFO: u8 = 5;
pub const EXT4_FT_SOCK: u8 = 6;
pub const EXT4_FT_SYMLINK: u8 = 7;

/// Directory file type matching an inode's mode bits.
pub fn file_type_of(inode: &Ext4Inode) -> u8 {
    match inode.file_type() {
        Ext4Inode::S_IFREG => EXT4_FT_REG_FILE,
        Ext4Inode::S_IFDIR => EXT4_FT_DIR,
        Ext4Inode::S_IFCHR => EXT4_FT_CHRDEV,
        Ext4Inode::S_IFBLK => EXT4_FT_BLKDEV,
        Ext4Inode::S_IFIFO => EXT4_FT_FIFO,
        Ext4Inode::S_IFSOCK => EXT4_FT_SOCK,
        Ext4Inode::S_IFLNK => EXT4_FT_SYMLINK,
        _ => EXT4_FT_UNKNOWN,
    }
}

/// Bytes a record with a `name_len` byte name occupies, header included.
pub fn entry_len(name_len: usize) -> usize {
    (DIR_ENTRY_HEADER_LEN + name_len).next_multiple_of(4)
}

/// How the byte after `name_len` is interpreted.
///
/// Old revision 0 volumes (minor revision below 5) store the high byte of a
/// 16-bit name length there. Later volumes store the file type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntryFormat {
    wide_name_len: bool,
}

impl DirEntryFormat {
    pub fn new(sb: &Ext4Superblock) -> Self {
        Self {
            wide_name_len: !sb.dirent_has_file_type(),
        }
    }

    fn name_len(&self, b: &[u8], off: usize) -> usize {
        let low = read_u8(b, off + 6) as usize;
        if self.wide_name_len {
            low | (read_u8(b, off + 7) as usize) << 8
        } else {
            low
        }
    }

    fn file_type(&self, b: &[u8], off: usize) -> u8 {
        if self.wide_name_len {
            EXT4_FT_UNKNOWN
        } else {
            read_u8(b, off + 7)
        }
    }

    fn set_name_len(&self, b: &mut [u8], off: usize, len: usize) {
        write_u8(b, off + 6, len as u8);
        if self.wide_name_len {
            write_u8(b, off + 7, (len >> 8) as u8);
        }
    }

    fn set_file_type(&self, b: &mut [u8], off: usize, file_type: u8) {
        if !self.wide_name_len {
            write_u8(b, off + 7, file_type);
        }
    }
}

/// One decoded directory record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u32,
    pub rec_len: u32,
    pub file_type: u8,
    pub name: Vec<u8>,
}

impl DirEntry {
    /// Bytes the record needs, regardless of the slack it owns.
    pub fn used_len(&self) -> usize {
        entry_len(self.name.len())
    }

    pub fn is_live(&self) -> bool {
        self.inode != 0
    }
}

fn read_rec_len(block: &[u8], off: usize) -> usize {
    match read_u16_le(block, off + 4) {
        MAX_REC_LEN_ON_DISK => MAX_REC_LEN,
        raw => raw as usize,
    }
}

fn write_rec_len(block: &mut [u8], off: usize, rec_len: usize) {
    let raw = if rec_len >= MAX_REC_LEN {
        MAX_REC_LEN_ON_DISK
    } else {
        rec_len as u16
    };
    write_u16_le(block, off + 4, raw);
}

/// Decode the record at `off`, checking that it stays inside `block`.
pub fn read_entry(block: &[u8], off: usize, fmt: DirEntryFormat) -> Ext4Result<DirEntry> {
    let bs = block.len();
    if off % 4 != 0 || off + DIR_ENTRY_HEADER_LEN > bs {
        error!("directory record offset {off} misaligned or past block of {bs}");
        return Err(Ext4Error::Corrupted);
    }
    let rec_len = read_rec_len(block, off);
    let name_len = fmt.name_len(block, off);
    if rec_len < DIR_ENTRY_HEADER_LEN || off + rec_len > bs || name_len > rec_len - DIR_ENTRY_HEADER_LEN
    {
        error!("directory record at {off}: rec_len {rec_len} name_len {name_len} in block of {bs}");
        return Err(Ext4Error::Corrupted);
    }
    let name_start = off + DIR_ENTRY_HEADER_LEN;
    Ok(DirEntry {
        inode: read_u32_le(block, off),
        rec_len: rec_len as u32,
        file_type: fmt.file_type(block, off),
        name: block[name_start..name_start + name_len].to_vec(),
    })
}

/// Encode a record at `off`. The padding after the name is zeroed.
pub fn write_entry(
    block: &mut [u8],
    off: usize,
    fmt: DirEntryFormat,
    inode: u32,
    rec_len: usize,
    file_type: u8,
    name: &[u8],
) {
    write_u32_le(block, off, inode);
    write_rec_len(block, off, rec_len);
    write_u8(block, off + 7, 0);
    fmt.set_name_len(block, off, name.len());
    fmt.set_file_type(block, off, file_type);
    let name_start = off + DIR_ENTRY_HEADER_LEN;
    block[name_start..name_start + name.len()].copy_from_slice(name);
    block[name_start + name.len()..off + entry_len(name.len())].fill(0);
}

/// Turn `block` into a single free record spanning all of it.
pub fn init_empty_block(block: &mut [u8]) {
    block.fill(0);
    let len = block.len();
    write_rec_len(block, 0, len);
}

/// Walks the records of one directory block.
///
/// Yields `(offset, entry)` pairs. A malformed record ends the walk with
/// one `Corrupted` item.
pub struct DirBlockIter<'a> {
    block: &'a [u8],
    fmt: DirEntryFormat,
    offset: usize,
    failed: bool,
}

impl<'a> DirBlockIter<'a> {
    pub fn new(block: &'a [u8], fmt: DirEntryFormat) -> Self {
        Self {
            block,
            fmt,
            offset: 0,
            failed: false,
        }
    }
}

impl Iterator for DirBlockIter<'_> {
    type Item = Ext4Result<(usize, DirEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.block.len() {
            return None;
        }
        match read_entry(self.block, self.offset, self.fmt) {
            Ok(entry) => {
                let off = self.offset;
                self.offset += entry.rec_len as usize;
                Some(Ok((off, entry)))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Find the live record named `name` in `block`.
pub fn find_in_block(
    block: &[u8],
    fmt: DirEntryFormat,
    name: &[u8],
) -> Ext4Result<Option<(usize, DirEntry)>> {
    for item in DirBlockIter::new(block, fmt) {
        let (off, entry) = item?;
        if entry.is_live() && entry.name == name {
            return Ok(Some((off, entry)));
        }
    }
    Ok(None)
}

/// Where a new record goes inside a directory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertSlot {
    offset: usize,
    rec_len: usize,
    /// Bytes kept by the live record being split, if any.
    keep: Option<usize>,
}

/// Look for room for a `name_len` byte name in `block`.
///
/// A free record large enough is reused whole. Otherwise the slack after a
/// live record is split off.
pub fn find_insert_slot(
    block: &[u8],
    fmt: DirEntryFormat,
    name_len: usize,
) -> Ext4Result<Option<InsertSlot>> {
    let required = entry_len(name_len);
    for item in DirBlockIter::new(block, fmt) {
        let (offset, entry) = item?;
        let rec_len = entry.rec_len as usize;
        if !entry.is_live() {
            if rec_len >= required {
                return Ok(Some(InsertSlot {
                    offset,
                    rec_len,
                    keep: None,
                }));
            }
            continue;
        }
        let used = entry.used_len();
        if rec_len >= used && rec_len - used >= required {
            return Ok(Some(InsertSlot {
                offset,
                rec_len,
                keep: Some(used),
            }));
        }
    }
    Ok(None)
}

/// Write the record for `name` into a slot found by [`find_insert_slot`].
pub fn place_entry(
    block: &mut [u8],
    fmt: DirEntryFormat,
    slot: InsertSlot,
    inode: u32,
    file_type: u8,
    name: &[u8],
) {
    match slot.keep {
        None => write_entry(block, slot.offset, fmt, inode, slot.rec_len, file_type, name),
        Some(used) => {
            write_rec_len(block, slot.offset, used);
            let rest = slot.rec_len - used;
            write_entry(block, slot.offset + used, fmt, inode, rest, file_type, name);
        }
    }
}

/// Place a record for `name` into `block` if any record has room.
///
/// Returns `false` when the block is full.
pub fn try_insert_entry(
    block: &mut [u8],
    fmt: DirEntryFormat,
    inode: u32,
    file_type: u8,
    name: &[u8],
) -> Ext4Result<bool> {
    let Some(slot) = find_insert_slot(block, fmt, name.len())? else {
        return Ok(false);
    };
    place_entry(block, fmt, slot, inode, file_type, name);
    Ok(true)
}

/// Where a name was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirSearchResult {
    /// Logical block of the directory holding the record.
    pub iblock: u64,
    /// Physical block holding the record.
    pub fblock: u64,
    /// Byte offset of the record inside the block.
    pub offset: usize,
    pub entry: DirEntry,
}

fn check_name(name: &[u8]) -> Ext4Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        warn!("directory name of {} bytes rejected", name.len());
        return Err(Ext4Error::InvalidInput);
    }
    Ok(())
}

impl<D: BlockDevice> Ext4Filesystem<D> {
    pub(crate) fn dir_format(&self) -> DirEntryFormat {
        DirEntryFormat::new(&self.sb())
    }

    /// Insert a record into directory block `fblock` if it has room.
    ///
    /// The block is only dirtied once a slot is found.
    pub(crate) fn insert_into_block(
        &self,
        fblock: u64,
        child: u32,
        file_type: u8,
        name: &[u8],
    ) -> Ext4Result<bool> {
        let fmt = self.dir_format();
        let mut block = self.cache.get(fblock)?;
        let Some(slot) = find_insert_slot(&block.data(), fmt, name.len())? else {
            return Ok(false);
        };
        place_entry(&mut block.data_mut(), fmt, slot, child, file_type, name);
        Ok(true)
    }

    fn dir_uses_index(&self, dir: &InodeRef<'_, D>) -> bool {
        self.sb().has_compat(CompatFeatures::DIR_INDEX) && dir.has_flag(InodeFlags::INDEX)
    }

    /// Number of whole blocks the directory spans.
    fn dir_block_count(&self, dir: &InodeRef<'_, D>) -> u64 {
        dir.size() / self.sb().block_size() as u64
    }

    /// Look `name` up in directory `dir`.
    ///
    /// Indexed directories go through the hash tree first. A damaged index
    /// falls back to a linear scan and, on a writable mount, loses its
    /// `INDEX` flag.
    pub fn find_entry(&self, dir: &mut InodeRef<'_, D>, name: &[u8]) -> Ext4Result<DirSearchResult> {
        if !dir.is_dir() {
            return Err(Ext4Error::NotDirectory);
        }
        check_name(name)?;

        // dot entries live in block 0 beside the index root
        let dot = name == b"." || name == b"..";
        if self.dir_uses_index(dir) && !dot {
            match self.dx_find_entry(dir, name)? {
                Ok(Some(found)) => return Ok(found),
                Ok(None) => return Err(Ext4Error::NotFound),
                Err(_) => {
                    warn!("directory {}: damaged hash index, scanning linearly", dir.index());
                    if !self.is_read_only() {
                        dir.inode_mut().i_flags.remove(InodeFlags::INDEX);
                    }
                }
            }
        }
        self.linear_find_entry(dir, name)?.ok_or(Ext4Error::NotFound)
    }

    fn linear_find_entry(
        &self,
        dir: &InodeRef<'_, D>,
        name: &[u8],
    ) -> Ext4Result<Option<DirSearchResult>> {
        let fmt = self.dir_format();
        for iblock in 0..self.dir_block_count(dir) {
            let fblock = self.get_inode_data_block(dir, iblock)?;
            if fblock == 0 {
                continue;
            }
            let block = self.cache.get(fblock)?;
            if let Some((offset, entry)) = find_in_block(&block.data(), fmt, name)? {
                return Ok(Some(DirSearchResult {
                    iblock,
                    fblock,
                    offset,
                    entry,
                }));
            }
        }
        Ok(None)
    }

    /// Link `child` into `parent` under `name`.
    ///
    /// Duplicate names are not detected; callers look the name up first.
    pub fn add_entry(
        &self,
        parent: &mut InodeRef<'_, D>,
        name: &[u8],
        child: &InodeRef<'_, D>,
    ) -> Ext4Result<()> {
        self.add_entry_raw(parent, name, child.index(), file_type_of(child))
    }

    pub(crate) fn add_entry_raw(
        &self,
        parent: &mut InodeRef<'_, D>,
        name: &[u8],
        child: u32,
        file_type: u8,
    ) -> Ext4Result<()> {
        self.ensure_writable()?;
        if !parent.is_dir() {
            return Err(Ext4Error::NotDirectory);
        }
        check_name(name)?;

        if self.dir_uses_index(parent) {
            match self.dx_add_entry(parent, name, child, file_type)? {
                Ok(()) => return Ok(()),
                Err(_) => {
                    warn!("directory {}: damaged hash index, inserting linearly", parent.index());
                    parent.inode_mut().i_flags.remove(InodeFlags::INDEX);
                }
            }
        }

        let fmt = self.dir_format();
        for iblock in 0..self.dir_block_count(parent) {
            let fblock = self.get_inode_data_block(parent, iblock)?;
            if fblock == 0 {
                continue;
            }
            if self.insert_into_block(fblock, child, file_type, name)? {
                trace!("directory {}: entry for inode {child} in block {iblock}", parent.index());
                return Ok(());
            }
        }

        let (iblock, fblock) = self.append_inode_block(parent)?;
        let mut block = self.cache.get_zeroed(fblock)?;
        let mut data = block.data_mut();
        let bs = data.len();
        data.fill(0);
        write_entry(&mut data, 0, fmt, child, bs, file_type, name);
        trace!("directory {}: grew to block {iblock} for inode {child}", parent.index());
        Ok(())
    }

    /// Unlink `name` from `parent`.
    ///
    /// The record's inode is cleared and its space is merged into the
    /// preceding record of the same block.
    pub fn remove_entry(&self, parent: &mut InodeRef<'_, D>, name: &[u8]) -> Ext4Result<()> {
        self.ensure_writable()?;
        let found = self.find_entry(parent, name)?;
        let fmt = self.dir_format();

        let mut block = self.cache.get(found.fblock)?;
        let mut data = block.data_mut();
        write_u32_le(&mut data, found.offset, 0);
        if found.offset == 0 {
            return Ok(());
        }

        let mut prev = None;
        for item in DirBlockIter::new(&data, fmt) {
            let (off, entry) = item?;
            if off == found.offset {
                break;
            }
            prev = Some((off, entry.rec_len as usize));
        }
        let Some((prev_off, prev_len)) = prev.filter(|(off, len)| off + len == found.offset) else {
            error!(
                "directory {}: no record ends at offset {}",
                parent.index(),
                found.offset
            );
            return Err(Ext4Error::Corrupted);
        };
        let merged = prev_len + found.entry.rec_len as usize;
        write_rec_len(&mut data, prev_off, merged);
        Ok(())
    }

    /// Write `.` and `..` into an empty directory.
    pub fn init_dir(&self, dir: &mut InodeRef<'_, D>, parent: u32) -> Ext4Result<()> {
        let own = dir.index();
        self.add_entry_raw(dir, b".", own, EXT4_FT_DIR)?;
        self.add_entry_raw(dir, b"..", parent, EXT4_FT_DIR)
    }

    /// Every live record of `dir`, in on-disk order.
    pub fn list_entries(&self, dir: &InodeRef<'_, D>) -> Ext4Result<Vec<DirEntry>> {
        if !dir.is_dir() {
            return Err(Ext4Error::NotDirectory);
        }
        let fmt = self.dir_format();
        let mut entries = Vec::new();
        for iblock in 0..self.dir_block_count(dir) {
            let fblock = self.get_inode_data_block(dir, iblock)?;
            if fblock == 0 {
                continue;
            }
            // index nodes read as one free record and contribute nothing
            let block = self.cache.get(fblock)?;
            let data = block.data();
            for item in DirBlockIter::new(&data, fmt) {
                let (_, entry) = item?;
                if entry.is_live() {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use alloc::{format, vec};

    use super::*;
    use crate::{
        blockdev::RamDisk,
        config::{FormatOptions, MountOptions, ROOT_INODE},
        filesystem::InodeKind,
        mkfs,
    };

    fn setup_fs(opts: FormatOptions) -> Ext4Filesystem<RamDisk> {
        let disk = RamDisk::new(opts.blocks_count as usize * opts.block_size as usize);
        let disk = mkfs::format(disk, &opts).unwrap();
        Ext4Filesystem::open(disk, MountOptions::default()).unwrap()
    }

    fn small_opts() -> FormatOptions {
        FormatOptions {
            block_size: 1024,
            blocks_count: 8192,
            blocks_per_group: 8192,
            inodes_per_group: 128,
            ..FormatOptions::default()
        }
    }

    fn modern() -> DirEntryFormat {
        DirEntryFormat { wide_name_len: false }
    }

    #[test]
    fn record_codec_keeps_type_and_padding() {
        let mut block = vec![0xAAu8; 64];
        init_empty_block(&mut block);
        write_entry(&mut block, 0, modern(), 12, 64, EXT4_FT_DIR, b"abcde");
        let entry = read_entry(&block, 0, modern()).unwrap();
        assert_eq!(entry.inode, 12);
        assert_eq!(entry.rec_len, 64);
        assert_eq!(entry.file_type, EXT4_FT_DIR);
        assert_eq!(entry.name, b"abcde");
        assert_eq!(entry.used_len(), 16);
        assert_eq!(&block[13..16], &[0, 0, 0]);
    }

    #[test]
    fn legacy_revision_uses_high_name_byte() {
        let wide = DirEntryFormat { wide_name_len: true };
        let mut block = vec![0u8; 1024];
        let name = vec![b'x'; 300];
        write_entry(&mut block, 0, wide, 5, 1024, EXT4_FT_REG_FILE, &name);
        assert_eq!(block[7], 1);
        let entry = read_entry(&block, 0, wide).unwrap();
        assert_eq!(entry.name.len(), 300);
        assert_eq!(entry.file_type, EXT4_FT_UNKNOWN);
    }

    #[test]
    fn malformed_records_are_rejected() {
        let mut block = vec![0u8; 64];
        init_empty_block(&mut block);
        // rec_len running past the block
        write_u16_le(&mut block, 4, 68);
        assert_eq!(read_entry(&block, 0, modern()), Err(Ext4Error::Corrupted));
        // name longer than the record
        write_u16_le(&mut block, 4, 12);
        write_u8(&mut block, 6, 5);
        assert_eq!(read_entry(&block, 0, modern()), Err(Ext4Error::Corrupted));
        // zero rec_len would loop forever
        write_u16_le(&mut block, 4, 0);
        assert_eq!(read_entry(&block, 0, modern()), Err(Ext4Error::Corrupted));
        assert_eq!(read_entry(&block, 2, modern()), Err(Ext4Error::Corrupted));

        let mut iter = DirBlockIter::new(&block, modern());
        assert!(matches!(iter.next(), Some(Err(Ext4Error::Corrupted))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn insertion_splits_slack_then_reuses_free_records() {
        let mut block = vec![0u8; 128];
        init_empty_block(&mut block);
        assert!(try_insert_entry(&mut block, modern(), 11, EXT4_FT_REG_FILE, b"first").unwrap());
        assert_eq!(read_entry(&block, 0, modern()).unwrap().rec_len, 128);

        assert!(try_insert_entry(&mut block, modern(), 12, EXT4_FT_REG_FILE, b"second").unwrap());
        let first = read_entry(&block, 0, modern()).unwrap();
        assert_eq!(first.rec_len as usize, entry_len(5));
        let (off, second) = find_in_block(&block, modern(), b"second").unwrap().unwrap();
        assert_eq!(off, 16);
        assert_eq!(second.rec_len, 112);

        let big = vec![b'n'; 120];
        assert!(!try_insert_entry(&mut block, modern(), 13, EXT4_FT_REG_FILE, &big).unwrap());
        assert_eq!(find_in_block(&block, modern(), b"missing").unwrap(), None);
    }

    #[test]
    fn root_lists_dot_entries() {
        let fs = setup_fs(small_opts());
        let root = fs.get_inode_ref(ROOT_INODE).unwrap();
        let names: Vec<_> = fs
            .list_entries(&root)
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.inode))
            .collect();
        assert_eq!(names, vec![(b".".to_vec(), 2), (b"..".to_vec(), 2)]);
    }

    #[test]
    fn add_find_remove_in_linear_directory() {
        let fs = setup_fs(small_opts());
        let child = fs.alloc_inode(InodeKind::File).unwrap();
        let child_index = child.index();
        let mut root = fs.get_inode_ref(ROOT_INODE).unwrap();

        fs.add_entry(&mut root, b"hello.txt", &child).unwrap();
        let found = fs.find_entry(&mut root, b"hello.txt").unwrap();
        assert_eq!(found.entry.inode, child_index);
        assert_eq!(found.entry.file_type, EXT4_FT_REG_FILE);
        assert_eq!(found.iblock, 0);

        fs.remove_entry(&mut root, b"hello.txt").unwrap();
        assert_eq!(fs.find_entry(&mut root, b"hello.txt"), Err(Ext4Error::NotFound));

        // the removed record's space went back to ".."
        let block = fs.cache.get(found.fblock).unwrap();
        let dotdot = read_entry(&block.data(), 12, fs.dir_format()).unwrap();
        assert_eq!(dotdot.rec_len, 1024 - 12);
    }

    #[test]
    fn full_block_grows_directory() {
        let fs = setup_fs(FormatOptions {
            dir_index: false,
            ..small_opts()
        });
        let child = fs.alloc_inode(InodeKind::File).unwrap();
        let mut root = fs.get_inode_ref(ROOT_INODE).unwrap();

        // 36-byte records: 28 fit beside "." and ".." in a 1 KiB block
        let names: Vec<_> = (0..40).map(|i| format!("entry-with-a-long-name-{i:04}")).collect();
        for name in &names {
            fs.add_entry(&mut root, name.as_bytes(), &child).unwrap();
        }
        assert_eq!(root.size(), 2048);
        for name in &names {
            let found = fs.find_entry(&mut root, name.as_bytes()).unwrap();
            assert_eq!(found.entry.inode, child.index());
        }
        assert_eq!(fs.list_entries(&root).unwrap().len(), names.len() + 2);
    }

    #[test]
    fn name_limits_and_kinds_are_checked() {
        let fs = setup_fs(small_opts());
        let mut file = fs.alloc_inode(InodeKind::File).unwrap();
        let mut root = fs.get_inode_ref(ROOT_INODE).unwrap();
        let long = vec![b'a'; MAX_NAME_LEN + 1];
        assert_eq!(fs.find_entry(&mut root, &long), Err(Ext4Error::InvalidInput));
        assert_eq!(fs.find_entry(&mut root, b""), Err(Ext4Error::InvalidInput));
        assert_eq!(fs.find_entry(&mut file, b"x"), Err(Ext4Error::NotDirectory));
        assert_eq!(fs.remove_entry(&mut root, b"ghost"), Err(Ext4Error::NotFound));
    }

    #[test]
    fn new_directory_gets_dot_entries() {
        let fs = setup_fs(small_opts());
        let mut dir = fs.alloc_inode(InodeKind::Directory).unwrap();
        fs.init_dir(&mut dir, ROOT_INODE).unwrap();
        assert_eq!(dir.size(), 1024);
        let dot = fs.find_entry(&mut dir, b".").unwrap();
        let dotdot = fs.find_entry(&mut dir, b"..").unwrap();
        assert_eq!(dot.entry.inode, dir.index());
        assert_eq!((dotdot.offset, dotdot.entry.inode), (12, ROOT_INODE));
    }

    #[test]
    fn whole_block_records_fit_64k_blocks() {
        let mut block = vec![0u8; 65536];
        init_empty_block(&mut block);
        assert_eq!(read_u16_le(&block, 4), 0xffff);
        assert_eq!(read_entry(&block, 0, modern()).unwrap().rec_len, 65536);
        assert!(try_insert_entry(&mut block, modern(), 12, EXT4_FT_REG_FILE, b"only").unwrap());
        assert_eq!(read_entry(&block, 0, modern()).unwrap().rec_len, 65536);

        let fs = setup_fs(FormatOptions {
            block_size: 65536,
            blocks_count: 64,
            ..FormatOptions::default()
        });
        let child = fs.alloc_inode(InodeKind::File).unwrap();
        let mut root = fs.get_inode_ref(ROOT_INODE).unwrap();
        let dotdot = fs.find_entry(&mut root, b"..").unwrap();
        assert_eq!(dotdot.entry.inode, ROOT_INODE);
        assert_eq!(dotdot.entry.rec_len, 65536 - 12);

        fs.add_entry(&mut root, b"big", &child).unwrap();
        assert_eq!(fs.find_entry(&mut root, b"big").unwrap().entry.rec_len, 65536 - 24);
        fs.remove_entry(&mut root, b"big").unwrap();
        let dotdot = fs.find_entry(&mut root, b"..").unwrap();
        assert_eq!(dotdot.entry.rec_len, 65536 - 12);
    }

    #[test]
    fn failed_insert_leaves_block_clean() {
        let fs = setup_fs(FormatOptions {
            dir_index: false,
            ..small_opts()
        });
        let child = fs.alloc_inode(InodeKind::File).unwrap();
        let mut root = fs.get_inode_ref(ROOT_INODE).unwrap();
        let block_size = fs.sb().block_size() as u64;
        let mut i = 0;
        while root.size() == block_size {
            fs.add_entry(&mut root, format!("filler-{i:04}").as_bytes(), &child)
                .unwrap();
            i += 1;
        }

        let first = fs.get_inode_data_block(&root, 0).unwrap();
        fs.flush().unwrap();
        assert!(!fs.cache.is_dirty(first));
        let inserted = fs
            .insert_into_block(first, child.index(), EXT4_FT_REG_FILE, b"filler-9999")
            .unwrap();
        assert!(!inserted);
        assert!(!fs.cache.is_dirty(first));
    }
}
