// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! # Hashed directory index (HTree)
//!
//! Block 0 of an indexed directory keeps `.` and `..`, whose second record
//! spans the rest of the block and hides the index root from linear
//! readers:
//!
//! ```text
//! 0   "." record (12 bytes)
//! 12  ".." record, rec_len = block_size - 12
//! 24  root info: reserved u32, hash_version, info_length (8),
//!     indirect_levels (0 or 1), unused_flags (0)
//! 32  limit u16, count u16, block u32     <- entry 0, hash implied
//! 40  hash u32, block u32                 <- entries 1..count
//! ```
//!
//! Interior nodes start with an empty record spanning the whole block,
//! followed by the same limit/count header at offset 8. Index entries are
//! sorted by hash. Entry `i` covers hashes from its own up to the next
//! entry's. Block numbers in index entries are logical blocks of the
//! directory.

use alloc::{vec, vec::Vec};

use log::{debug, error, info, trace};

use crate::{
    blockdev::BlockDevice,
    dir::{self, DirEntry, DirEntryFormat, DirSearchResult},
    endian::*,
    error::{Ext4Error, Ext4Result},
    filesystem::Ext4Filesystem,
    hash::{DX_HASH_TEA, DxHashInfo},
    inode::{InodeFlags, InodeRef},
    superblock::SuperblockFlags,
};

const DX_ROOT_INFO_OFFSET: usize = 24;
const DX_ROOT_INFO_LEN: u8 = 8;
const DX_ROOT_ENTRIES_OFFSET: usize = 32;
const DX_NODE_ENTRIES_OFFSET: usize = 8;
const DX_ENTRY_SIZE: usize = 8;
/// The index never grows past a root plus one interior level.
const DX_MAX_LEVELS: u8 = 1;

/// Entries that fit in the root block.
pub fn dx_root_limit(block_size: u32) -> u16 {
    ((block_size as usize - DX_ROOT_ENTRIES_OFFSET) / DX_ENTRY_SIZE) as u16
}

/// Entries that fit in an interior node block.
pub fn dx_node_limit(block_size: u32) -> u16 {
    ((block_size as usize - DX_NODE_ENTRIES_OFFSET) / DX_ENTRY_SIZE) as u16
}

/// Hash version to use for a root recording `version`.
///
/// Volumes flagged for unsigned hashing map the three base algorithms to
/// their unsigned variants.
pub fn effective_hash_version(version: u8, unsigned_hash: bool) -> u8 {
    if version <= DX_HASH_TEA && unsigned_hash {
        version + 3
    } else {
        version
    }
}

/// The index could not be used and the caller should scan linearly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BadIndex;

/// Outer error aborts the operation. Inner error asks for a linear fallback.
pub(crate) type DxResult<T> = Ext4Result<Result<T, BadIndex>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DxEntry {
    hash: u32,
    block: u32,
}

/// One index block on the walk from the root to a leaf.
#[derive(Debug, Clone)]
struct DxFrame {
    fblock: u64,
    /// Offset of the limit/count header.
    base: usize,
    limit: u16,
    entries: Vec<DxEntry>,
    /// Entry the walk descended through.
    position: usize,
}

impl DxFrame {
    fn decode(data: &[u8], fblock: u64, base: usize) -> Self {
        let limit = read_u16_le(data, base);
        let count = read_u16_le(data, base + 2) as usize;
        let max = (data.len() - base) / DX_ENTRY_SIZE;
        let entries = (0..count.min(max))
            .map(|i| {
                let off = base + i * DX_ENTRY_SIZE;
                DxEntry {
                    hash: if i == 0 { 0 } else { read_u32_le(data, off) },
                    block: read_u32_le(data, off + 4),
                }
            })
            .collect();
        Self {
            fblock,
            base,
            limit,
            entries,
            position: 0,
        }
    }

    fn encode(&self, data: &mut [u8]) {
        for (i, entry) in self.entries.iter().enumerate() {
            let off = self.base + i * DX_ENTRY_SIZE;
            if i > 0 {
                write_u32_le(data, off, entry.hash);
            }
            write_u32_le(data, off + 4, entry.block);
        }
        write_u16_le(data, self.base, self.limit);
        write_u16_le(data, self.base + 2, self.entries.len() as u16);
    }

    fn is_sane(&self, expected_limit: u16) -> bool {
        !self.entries.is_empty()
            && self.limit == expected_limit
            && self.entries.len() <= self.limit as usize
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= self.limit as usize
    }

    /// Choose the last entry whose hash does not exceed `hash`.
    fn seek(&mut self, hash: u32) {
        self.position = self.entries[1..].partition_point(|e| e.hash <= hash);
    }

    fn current(&self) -> DxEntry {
        self.entries[self.position]
    }

    fn insert_after_position(&mut self, hash: u32, block: u32) {
        self.entries
            .insert(self.position + 1, DxEntry { hash, block });
    }
}

/// Root info fields after validation.
struct DxRoot {
    hash: DxHashInfo,
    levels: u8,
}

/// Repack `entries` into `block`, the last record taking the slack.
fn pack_entries(block: &mut [u8], fmt: DirEntryFormat, entries: &[(u32, DirEntry)]) {
    let bs = block.len();
    block.fill(0);
    let mut offset = 0;
    for (i, (_, entry)) in entries.iter().enumerate() {
        let used = entry.used_len();
        let rec_len = if i + 1 == entries.len() { bs - offset } else { used };
        dir::write_entry(block, offset, fmt, entry.inode, rec_len, entry.file_type, &entry.name);
        offset += used;
    }
}

impl<D: BlockDevice> Ext4Filesystem<D> {
    /// Turn a freshly initialised directory into an indexed one.
    ///
    /// The directory must hold exactly one block containing only `.` and
    /// `..`. A second, empty block becomes the first leaf.
    pub fn dx_init(&self, dir: &mut InodeRef<'_, D>) -> Ext4Result<()> {
        self.ensure_writable()?;
        if !dir.is_dir() {
            return Err(Ext4Error::NotDirectory);
        }
        let (block_size, hash_version) = {
            let sb = self.sb();
            (sb.block_size(), sb.s_def_hash_version)
        };
        let root_fblock = self.get_inode_data_block(dir, 0)?;
        if dir.size() != block_size as u64 || root_fblock == 0 {
            debug!("directory {} is not a fresh single-block directory", dir.index());
            return Err(Ext4Error::InvalidInput);
        }

        let fmt = self.dir_format();
        {
            let block = self.cache.get(root_fblock)?;
            let data = block.data();
            let dot = dir::read_entry(&data, 0, fmt)?;
            let dotdot = dir::read_entry(&data, 12, fmt)?;
            if dot.name != b"." || dot.rec_len != 12 || dotdot.name != b".."
                || dotdot.rec_len != block_size - 12
            {
                debug!("directory {} holds more than dot entries", dir.index());
                return Err(Ext4Error::InvalidInput);
            }
        }

        let (leaf_iblock, leaf_fblock) = self.append_inode_block(dir)?;
        {
            let mut leaf = self.cache.get_zeroed(leaf_fblock)?;
            dir::init_empty_block(&mut leaf.data_mut());
        }

        let mut block = self.cache.get(root_fblock)?;
        let mut data = block.data_mut();
        let info = DX_ROOT_INFO_OFFSET;
        write_u32_le(&mut data, info, 0);
        write_u8(&mut data, info + 4, hash_version);
        write_u8(&mut data, info + 5, DX_ROOT_INFO_LEN);
        write_u8(&mut data, info + 6, 0);
        write_u8(&mut data, info + 7, 0);
        let root = DxFrame {
            fblock: root_fblock,
            base: DX_ROOT_ENTRIES_OFFSET,
            limit: dx_root_limit(block_size),
            entries: vec![DxEntry {
                hash: 0,
                block: leaf_iblock as u32,
            }],
            position: 0,
        };
        root.encode(&mut data);
        drop(data);
        drop(block);

        dir.inode_mut().i_flags.insert(InodeFlags::INDEX);
        info!("directory {} now hash indexed", dir.index());
        Ok(())
    }

    /// Validate the root block and prepare hashing for `name`.
    fn dx_read_root(&self, root: &[u8], name: &[u8]) -> Ext4Result<Option<DxRoot>> {
        let (block_size, seed, unsigned) = {
            let sb = self.sb();
            (
                sb.block_size(),
                sb.s_hash_seed,
                sb.has_flag(SuperblockFlags::UNSIGNED_HASH),
            )
        };
        let info = DX_ROOT_INFO_OFFSET;
        let version = read_u8(root, info + 4);
        let info_len = read_u8(root, info + 5);
        let levels = read_u8(root, info + 6);
        let unused_flags = read_u8(root, info + 7);
        let limit = read_u16_le(root, DX_ROOT_ENTRIES_OFFSET);

        if version > DX_HASH_TEA
            || info_len != DX_ROOT_INFO_LEN
            || levels > DX_MAX_LEVELS
            || unused_flags != 0
            || limit != dx_root_limit(block_size)
        {
            error!(
                "bad index root: version {version} info_len {info_len} levels {levels} \
                 flags {unused_flags:#x} limit {limit}"
            );
            return Ok(None);
        }

        let mut hash = DxHashInfo::new(effective_hash_version(version, unsigned), seed);
        hash.compute(name)?;
        Ok(Some(DxRoot { hash, levels }))
    }

    fn dx_read_frame(&self, fblock: u64, base: usize) -> Ext4Result<DxFrame> {
        let block = self.cache.get(fblock)?;
        Ok(DxFrame::decode(&block.data(), fblock, base))
    }

    fn dx_write_frame(&self, frame: &DxFrame) -> Ext4Result<()> {
        let mut block = self.cache.get(frame.fblock)?;
        frame.encode(&mut block.data_mut());
        Ok(())
    }

    /// Write an interior node into a freshly appended block.
    fn dx_write_new_node(&self, frame: &DxFrame) -> Ext4Result<()> {
        let mut block = self.cache.get_zeroed(frame.fblock)?;
        let mut data = block.data_mut();
        dir::init_empty_block(&mut data);
        frame.encode(&mut data);
        Ok(())
    }

    /// Descend from the root to the index entry covering `hash`.
    fn dx_get_leaf(
        &self,
        dir: &InodeRef<'_, D>,
        root_fblock: u64,
        levels: u8,
        hash: u32,
    ) -> DxResult<Vec<DxFrame>> {
        let block_size = self.sb().block_size();
        let mut frame = self.dx_read_frame(root_fblock, DX_ROOT_ENTRIES_OFFSET)?;
        if !frame.is_sane(dx_root_limit(block_size)) {
            error!("index root of directory {} has a bad count", dir.index());
            return Ok(Err(BadIndex));
        }

        let mut path = Vec::with_capacity(levels as usize + 1);
        for _ in 0..levels {
            frame.seek(hash);
            let child = frame.current().block as u64;
            path.push(frame);

            let fblock = self.get_inode_data_block(dir, child)?;
            if fblock == 0 {
                error!("index of directory {} points at hole {child}", dir.index());
                return Ok(Err(BadIndex));
            }
            frame = self.dx_read_frame(fblock, DX_NODE_ENTRIES_OFFSET)?;
            if !frame.is_sane(dx_node_limit(block_size)) {
                error!("index node {fblock} of directory {} is malformed", dir.index());
                return Ok(Err(BadIndex));
            }
        }
        frame.seek(hash);
        path.push(frame);
        Ok(Ok(path))
    }

    /// Step `path` to the next leaf when it may hold more names hashing to
    /// `hash`. Returns `false` once the index is exhausted or the next leaf
    /// starts a different hash.
    fn dx_next_block(
        &self,
        dir: &InodeRef<'_, D>,
        path: &mut [DxFrame],
        hash: u32,
    ) -> Ext4Result<bool> {
        let mut level = path.len() - 1;
        loop {
            let frame = &mut path[level];
            frame.position += 1;
            if frame.position < frame.entries.len() {
                break;
            }
            if level == 0 {
                return Ok(false);
            }
            level -= 1;
        }

        // a set low bit marks a leaf continuing the previous leaf's hash
        let next_hash = path[level].current().hash;
        if hash & 1 == 0 && next_hash & !1 != hash {
            return Ok(false);
        }

        let block_size = self.sb().block_size();
        while level + 1 < path.len() {
            let child = path[level].current().block as u64;
            let fblock = self.get_inode_data_block(dir, child)?;
            if fblock == 0 {
                error!("index of directory {} points at hole {child}", dir.index());
                return Err(Ext4Error::Corrupted);
            }
            let frame = self.dx_read_frame(fblock, DX_NODE_ENTRIES_OFFSET)?;
            if !frame.is_sane(dx_node_limit(block_size)) {
                error!("index node for block {child} of directory {} is malformed", dir.index());
                return Err(Ext4Error::Corrupted);
            }
            level += 1;
            path[level] = frame;
        }
        Ok(true)
    }

    /// Hash lookup of `name`. `Ok(None)` means the index covers the name's
    /// hash but no leaf holds it.
    pub(crate) fn dx_find_entry(
        &self,
        dir: &InodeRef<'_, D>,
        name: &[u8],
    ) -> DxResult<Option<DirSearchResult>> {
        let root_fblock = self.get_inode_data_block(dir, 0)?;
        if root_fblock == 0 {
            return Ok(Err(BadIndex));
        }
        let root = {
            let block = self.cache.get(root_fblock)?;
            match self.dx_read_root(&block.data(), name)? {
                Some(root) => root,
                None => return Ok(Err(BadIndex)),
            }
        };
        let hash = root.hash.hash;
        let mut path = match self.dx_get_leaf(dir, root_fblock, root.levels, hash)? {
            Ok(path) => path,
            Err(bad) => return Ok(Err(bad)),
        };

        let fmt = self.dir_format();
        loop {
            let iblock = path[path.len() - 1].current().block as u64;
            let fblock = self.get_inode_data_block(dir, iblock)?;
            if fblock == 0 {
                error!("index of directory {} points at hole {iblock}", dir.index());
                return Ok(Err(BadIndex));
            }
            let block = self.cache.get(fblock)?;
            if let Some((offset, entry)) = dir::find_in_block(&block.data(), fmt, name)? {
                return Ok(Ok(Some(DirSearchResult {
                    iblock,
                    fblock,
                    offset,
                    entry,
                })));
            }
            drop(block);

            if !self.dx_next_block(dir, &mut path, hash)? {
                return Ok(Ok(None));
            }
        }
    }

    /// Insert a record through the index, splitting the leaf if needed.
    pub(crate) fn dx_add_entry(
        &self,
        parent: &mut InodeRef<'_, D>,
        name: &[u8],
        child: u32,
        file_type: u8,
    ) -> DxResult<()> {
        let root_fblock = self.get_inode_data_block(parent, 0)?;
        if root_fblock == 0 {
            return Ok(Err(BadIndex));
        }
        let root = {
            let block = self.cache.get(root_fblock)?;
            match self.dx_read_root(&block.data(), name)? {
                Some(root) => root,
                None => return Ok(Err(BadIndex)),
            }
        };
        let mut path = match self.dx_get_leaf(parent, root_fblock, root.levels, root.hash.hash)? {
            Ok(path) => path,
            Err(bad) => return Ok(Err(bad)),
        };

        let leaf_iblock = path[path.len() - 1].current().block as u64;
        let leaf_fblock = self.get_inode_data_block(parent, leaf_iblock)?;
        if leaf_fblock == 0 {
            error!("index of directory {} points at hole {leaf_iblock}", parent.index());
            return Ok(Err(BadIndex));
        }
        if self.insert_into_block(leaf_fblock, child, file_type, name)? {
            return Ok(Ok(()));
        }

        self.dx_split_index(parent, &mut path)?;
        let (new_fblock, split_hash) = self.dx_split_leaf(parent, &root.hash, leaf_fblock, &mut path)?;

        let (first, second) = if root.hash.hash >= split_hash {
            (new_fblock, leaf_fblock)
        } else {
            (leaf_fblock, new_fblock)
        };
        for target in [first, second] {
            if self.insert_into_block(target, child, file_type, name)? {
                return Ok(Ok(()));
            }
        }
        error!("directory {}: no room for entry after leaf split", parent.index());
        Err(Ext4Error::NoSpace)
    }

    /// Make room for one more entry in the lowest index block of `path`.
    ///
    /// A full interior node is halved and the parent gets an entry for the
    /// right half. A full root with no interior level moves its entries
    /// into a new node and becomes a one-entry root over it.
    fn dx_split_index(&self, dir: &mut InodeRef<'_, D>, path: &mut Vec<DxFrame>) -> Ext4Result<()> {
        let last = path.len() - 1;
        if !path[last].is_full() {
            return Ok(());
        }
        if last > 0 && path[0].is_full() {
            debug!("directory {}: index root and node both full", dir.index());
            return Err(Ext4Error::DirectoryIndexFull);
        }

        let block_size = self.sb().block_size();
        let (new_iblock, new_fblock) = self.append_inode_block(dir)?;

        if last > 0 {
            let node = &mut path[last];
            let count_left = node.entries.len() / 2;
            let right_entries = node.entries.split_off(count_left);
            let hash_right = right_entries[0].hash;
            let mut right = DxFrame {
                fblock: new_fblock,
                base: DX_NODE_ENTRIES_OFFSET,
                limit: dx_node_limit(block_size),
                entries: right_entries,
                position: 0,
            };
            let moved_right = node.position >= count_left;
            if moved_right {
                right.position = node.position - count_left;
            }
            self.dx_write_frame(node)?;
            self.dx_write_new_node(&right)?;

            let root = &mut path[0];
            root.insert_after_position(hash_right, new_iblock as u32);
            self.dx_write_frame(root)?;
            if moved_right {
                root.position += 1;
                path[last] = right;
            }
            debug!(
                "directory {}: index node split, right half at block {new_iblock} from hash {hash_right:#x}",
                dir.index()
            );
            return Ok(());
        }

        let root = &mut path[0];
        let node = DxFrame {
            fblock: new_fblock,
            base: DX_NODE_ENTRIES_OFFSET,
            limit: dx_node_limit(block_size),
            entries: core::mem::take(&mut root.entries),
            position: root.position,
        };
        root.entries.push(DxEntry {
            hash: 0,
            block: new_iblock as u32,
        });
        root.position = 0;
        self.dx_write_new_node(&node)?;
        {
            let mut block = self.cache.get(root.fblock)?;
            let mut data = block.data_mut();
            root.encode(&mut data);
            write_u8(&mut data, DX_ROOT_INFO_OFFSET + 6, 1);
        }
        path.push(node);
        debug!(
            "directory {}: index root pushed down into block {new_iblock}",
            dir.index()
        );
        Ok(())
    }

    /// Move the upper half, by hash, of a full leaf into a new block.
    ///
    /// Returns the new block and the hash recorded for it in the index.
    fn dx_split_leaf(
        &self,
        dir: &mut InodeRef<'_, D>,
        hinfo: &DxHashInfo,
        leaf_fblock: u64,
        path: &mut [DxFrame],
    ) -> Ext4Result<(u64, u32)> {
        let fmt = self.dir_format();
        let mut sorted = Vec::new();
        {
            let block = self.cache.get(leaf_fblock)?;
            for item in dir::DirBlockIter::new(&block.data(), fmt) {
                let (_, entry) = item?;
                if entry.is_live() {
                    let mut hash = DxHashInfo::new(hinfo.hash_version, hinfo.seed);
                    hash.compute(&entry.name)?;
                    sorted.push((hash.hash, entry));
                }
            }
        }
        if sorted.len() < 2 {
            error!("full leaf {leaf_fblock} holds {} entries", sorted.len());
            return Err(Ext4Error::Corrupted);
        }
        sorted.sort_by_key(|(hash, _)| *hash);

        let total: usize = sorted.iter().map(|(_, e)| e.used_len()).sum();
        let mut size = 0;
        let mut mid = sorted.len() - 1;
        for (i, (_, entry)) in sorted.iter().enumerate() {
            if size + entry.used_len() > total / 2 {
                mid = i;
                break;
            }
            size += entry.used_len();
        }
        let mid = mid.clamp(1, sorted.len() - 1);
        let split_hash = sorted[mid].0;
        let continued = u32::from(split_hash == sorted[mid - 1].0);

        let (new_iblock, new_fblock) = self.append_inode_block(dir)?;
        {
            let mut block = self.cache.get(leaf_fblock)?;
            pack_entries(&mut block.data_mut(), fmt, &sorted[..mid]);
        }
        {
            let mut block = self.cache.get_zeroed(new_fblock)?;
            pack_entries(&mut block.data_mut(), fmt, &sorted[mid..]);
        }

        let last = path.len() - 1;
        let frame = &mut path[last];
        frame.insert_after_position(split_hash + continued, new_iblock as u32);
        self.dx_write_frame(frame)?;
        trace!(
            "directory {}: leaf {leaf_fblock} split at hash {split_hash:#x}, {} entries moved to block {new_iblock}",
            dir.index(),
            sorted.len() - mid
        );
        Ok((new_fblock, split_hash + continued))
    }
}

#[cfg(test)]
mod tests {
    use alloc::{format, string::String};

    use super::*;
    use crate::{
        blockdev::RamDisk,
        config::{FormatOptions, MountOptions, ROOT_INODE},
        filesystem::InodeKind,
        hash::{DX_HASH_HALF_MD4, DX_HASH_LEGACY, DX_HASH_TEA_UNSIGNED},
        mkfs,
    };

    fn setup_fs() -> Ext4Filesystem<RamDisk> {
        let opts = FormatOptions {
            block_size: 1024,
            blocks_count: 8192,
            blocks_per_group: 8192,
            inodes_per_group: 128,
            ..FormatOptions::default()
        };
        let disk = mkfs::format(RamDisk::new(8192 * 1024), &opts).unwrap();
        Ext4Filesystem::open(disk, MountOptions::default()).unwrap()
    }

    fn indexed_dir(fs: &Ext4Filesystem<RamDisk>) -> InodeRef<'_, RamDisk> {
        let mut dir = fs.alloc_inode(InodeKind::Directory).unwrap();
        fs.init_dir(&mut dir, ROOT_INODE).unwrap();
        fs.dx_init(&mut dir).unwrap();
        dir
    }

    fn root_frame(fs: &Ext4Filesystem<RamDisk>, dir: &InodeRef<'_, RamDisk>) -> DxFrame {
        let fblock = fs.get_inode_data_block(dir, 0).unwrap();
        fs.dx_read_frame(fblock, DX_ROOT_ENTRIES_OFFSET).unwrap()
    }

    fn root_levels(fs: &Ext4Filesystem<RamDisk>, dir: &InodeRef<'_, RamDisk>) -> u8 {
        let fblock = fs.get_inode_data_block(dir, 0).unwrap();
        let block = fs.cache.get(fblock).unwrap();
        read_u8(&block.data(), DX_ROOT_INFO_OFFSET + 6)
    }

    fn assert_sorted(frame: &DxFrame) {
        assert!(frame.entries[1..].windows(2).all(|w| w[0].hash <= w[1].hash));
    }

    #[test]
    fn limits_follow_block_size() {
        assert_eq!(dx_root_limit(1024), 124);
        assert_eq!(dx_node_limit(1024), 127);
        assert_eq!(dx_root_limit(4096), 508);
        assert_eq!(dx_node_limit(4096), 511);
    }

    #[test]
    fn unsigned_flag_promotes_base_versions() {
        assert_eq!(effective_hash_version(DX_HASH_LEGACY, false), DX_HASH_LEGACY);
        assert_eq!(effective_hash_version(DX_HASH_HALF_MD4, true), DX_HASH_HALF_MD4 + 3);
        assert_eq!(effective_hash_version(DX_HASH_TEA, true), DX_HASH_TEA_UNSIGNED);
        assert_eq!(effective_hash_version(DX_HASH_TEA_UNSIGNED, true), DX_HASH_TEA_UNSIGNED);
    }

    #[test]
    fn init_writes_root_over_one_empty_leaf() {
        let fs = setup_fs();
        let mut dir = indexed_dir(&fs);
        assert!(dir.has_flag(InodeFlags::INDEX));
        assert_eq!(dir.size(), 2048);

        let root = root_frame(&fs, &dir);
        assert_eq!(root.limit, 124);
        assert_eq!(root.entries, vec![DxEntry { hash: 0, block: 1 }]);
        assert_eq!(root_levels(&fs, &dir), 0);

        // dot entries stay visible to linear readers
        assert_eq!(fs.find_entry(&mut dir, b"..").unwrap().entry.inode, ROOT_INODE);
        assert_eq!(fs.list_entries(&dir).unwrap().len(), 2);
        assert_eq!(fs.dx_init(&mut dir), Err(Ext4Error::InvalidInput));
    }

    #[test]
    fn full_leaf_splits_once_and_keeps_every_name() {
        let fs = setup_fs();
        let mut dir = indexed_dir(&fs);
        let child = fs.alloc_inode(InodeKind::File).unwrap();

        // 16-byte records: exactly 64 fill a 1 KiB leaf
        let names: Vec<String> = (0..65).map(|i| format!("f-{i:04}")).collect();
        for name in &names[..64] {
            fs.add_entry(&mut dir, name.as_bytes(), &child).unwrap();
        }
        assert_eq!(dir.size(), 2048);
        assert_eq!(root_frame(&fs, &dir).entries.len(), 1);

        fs.add_entry(&mut dir, names[64].as_bytes(), &child).unwrap();
        assert_eq!(dir.size(), 3072);
        let root = root_frame(&fs, &dir);
        assert_eq!(root.entries.len(), 2);
        assert_eq!(root.entries[1].block, 2);

        for name in &names {
            let found = fs.find_entry(&mut dir, name.as_bytes()).unwrap();
            assert_eq!(found.entry.inode, child.index());
        }
        assert!(dir.has_flag(InodeFlags::INDEX));
        assert_eq!(fs.list_entries(&dir).unwrap().len(), names.len() + 2);
    }

    #[test]
    fn leaf_split_conserves_entries() {
        let fs = setup_fs();
        let mut dir = indexed_dir(&fs);
        let child = fs.alloc_inode(InodeKind::File).unwrap();
        let names: Vec<String> = (0..40).map(|i| format!("name-{i}-{}", "x".repeat(i))).collect();
        for name in &names {
            fs.add_entry(&mut dir, name.as_bytes(), &child).unwrap();
        }

        let root = root_frame(&fs, &dir);
        assert!(root.entries.len() > 1);
        assert_sorted(&root);
        let fmt = fs.dir_format();
        let mut seen = Vec::new();
        let mut bytes = 0;
        for entry in &root.entries {
            let fblock = fs.get_inode_data_block(&dir, entry.block as u64).unwrap();
            let block = fs.cache.get(fblock).unwrap();
            for item in dir::DirBlockIter::new(&block.data(), fmt) {
                let (_, e) = item.unwrap();
                if e.is_live() {
                    bytes += e.used_len();
                    seen.push(e.name);
                }
            }
        }
        seen.sort();
        let mut expected: Vec<_> = names.iter().map(|n| n.as_bytes().to_vec()).collect();
        expected.sort();
        assert_eq!(seen, expected);
        let expected_bytes: usize = names.iter().map(|n| dir::entry_len(n.len())).sum();
        assert_eq!(bytes, expected_bytes);
    }

    #[test]
    fn large_directory_grows_a_second_level() {
        let fs = setup_fs();
        let mut dir = indexed_dir(&fs);
        let child = fs.alloc_inode(InodeKind::File).unwrap();

        // ~108-byte records: at most nine per leaf
        let names: Vec<String> = (0..1500).map(|i| format!("{i:06}-{}", "y".repeat(93))).collect();
        for name in &names {
            fs.add_entry(&mut dir, name.as_bytes(), &child).unwrap();
        }
        assert_eq!(root_levels(&fs, &dir), 1);
        let root = root_frame(&fs, &dir);
        assert!(root.entries.len() >= 2);
        for entry in &root.entries {
            let fblock = fs.get_inode_data_block(&dir, entry.block as u64).unwrap();
            let node = fs.dx_read_frame(fblock, DX_NODE_ENTRIES_OFFSET).unwrap();
            assert_eq!(node.limit, 127);
            assert_sorted(&node);
        }

        for name in names.iter().step_by(7) {
            assert!(fs.find_entry(&mut dir, name.as_bytes()).is_ok());
        }
        assert_eq!(fs.find_entry(&mut dir, b"not-there"), Err(Ext4Error::NotFound));
        assert_eq!(fs.list_entries(&dir).unwrap().len(), names.len() + 2);
    }

    #[test]
    fn damaged_root_falls_back_to_linear_scan() {
        let fs = setup_fs();
        let mut dir = indexed_dir(&fs);
        let child = fs.alloc_inode(InodeKind::File).unwrap();
        fs.add_entry(&mut dir, b"survivor", &child).unwrap();

        let fblock = fs.get_inode_data_block(&dir, 0).unwrap();
        {
            let mut block = fs.cache.get(fblock).unwrap();
            write_u8(&mut block.data_mut(), DX_ROOT_INFO_OFFSET + 5, 0);
        }

        let found = fs.find_entry(&mut dir, b"survivor").unwrap();
        assert_eq!(found.entry.inode, child.index());
        assert!(!dir.has_flag(InodeFlags::INDEX));

        fs.add_entry(&mut dir, b"late", &child).unwrap();
        assert!(fs.find_entry(&mut dir, b"late").is_ok());
    }

    #[test]
    fn read_only_lookup_through_damaged_index_writes_nothing() {
        let fs = setup_fs();
        let (dir_index, child_index) = {
            let mut dir = indexed_dir(&fs);
            let child = fs.alloc_inode(InodeKind::File).unwrap();
            fs.add_entry(&mut dir, b"survivor", &child).unwrap();
            let fblock = fs.get_inode_data_block(&dir, 0).unwrap();
            let mut block = fs.cache.get(fblock).unwrap();
            write_u8(&mut block.data_mut(), DX_ROOT_INFO_OFFSET + 5, 0);
            (dir.index(), child.index())
        };
        let disk = fs.close().unwrap();
        let before = disk.as_bytes().to_vec();

        let ro = MountOptions {
            read_only: true,
            ..MountOptions::default()
        };
        let fs = Ext4Filesystem::open(disk, ro).unwrap();
        {
            let mut dir = fs.get_inode_ref(dir_index).unwrap();
            let found = fs.find_entry(&mut dir, b"survivor").unwrap();
            assert_eq!(found.entry.inode, child_index);
            assert!(dir.has_flag(InodeFlags::INDEX));
        }
        let disk = fs.close().unwrap();
        assert!(disk.as_bytes() == before.as_slice());
    }

    #[test]
    fn full_root_above_full_node_refuses_to_grow() {
        let fs = setup_fs();
        let mut dir = indexed_dir(&fs);
        let full = |base, limit: u16| DxFrame {
            fblock: 0,
            base,
            limit,
            entries: (0..limit as u32).map(|i| DxEntry { hash: i * 2, block: i }).collect(),
            position: 0,
        };
        let mut path = vec![
            full(DX_ROOT_ENTRIES_OFFSET, 2),
            full(DX_NODE_ENTRIES_OFFSET, 2),
        ];
        let size = dir.size();
        assert_eq!(
            fs.dx_split_index(&mut dir, &mut path),
            Err(Ext4Error::DirectoryIndexFull)
        );
        assert_eq!(dir.size(), size);
    }

    #[test]
    fn frame_seek_picks_last_entry_not_above_hash() {
        let mut frame = DxFrame {
            fblock: 0,
            base: DX_ROOT_ENTRIES_OFFSET,
            limit: 8,
            entries: vec![
                DxEntry { hash: 0, block: 1 },
                DxEntry { hash: 100, block: 2 },
                DxEntry { hash: 200, block: 3 },
            ],
            position: 0,
        };
        frame.seek(50);
        assert_eq!(frame.current().block, 1);
        frame.seek(100);
        assert_eq!(frame.current().block, 2);
        frame.seek(u32::MAX);
        assert_eq!(frame.current().block, 3);
    }
}
