// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! # Extent tree
//!
//! Logical to physical mapping for inodes with the extents flag. The root
//! node lives in the inode's 60-byte block area and holds up to four
//! entries; deeper nodes fill whole blocks. Every node is a 12-byte
//! [`ExtentHeader`] followed by [`Extent`] records (leaves, depth 0) or
//! [`ExtentIndex`] records (interior nodes).
//!
//! Nodes are decoded into [`ExtentNode`] values, edited in memory and
//! written back whole. A lookup that must mutate the tree records every
//! visited node in an [`ExtentPath`] so parents can be rewritten after
//! their children.

use alloc::{vec, vec::Vec};

use log::{debug, error, trace};

use crate::{
    blockdev::BlockDevice,
    endian::*,
    error::{Ext4Error, Ext4Result},
    filesystem::Ext4Filesystem,
    inode::{INODE_BLOCK_BYTES, InodeRef},
};

/// Magic number opening every extent node.
pub const EXT4_EXTENT_MAGIC: u16 = 0xF30A;

/// Longest initialized extent. Lengths above it mark uninitialized extents.
pub const EXT_INIT_MAX_LEN: u16 = 1 << 15;

/// Deepest tree the engine will walk.
pub const EXT_MAX_DEPTH: u16 = 5;

/// Node header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtentHeader {
    pub magic: u16,
    /// Valid entries following the header.
    pub entries: u16,
    /// Capacity of the node.
    pub max: u16,
    /// Zero for leaves.
    pub depth: u16,
    pub generation: u32,
}

impl ExtentHeader {
    /// Entries that fit in the inode's block area.
    pub const ROOT_MAX_ENTRIES: u16 = ((INODE_BLOCK_BYTES - 12) / 12) as u16;

    /// Entries that fit in a node of `bytes` bytes.
    pub fn capacity(bytes: usize) -> u16 {
        ((bytes - Self::DISK_SIZE) / Extent::DISK_SIZE) as u16
    }

    fn empty(depth: u16, max: u16) -> Self {
        Self {
            magic: EXT4_EXTENT_MAGIC,
            entries: 0,
            max,
            depth,
            generation: 0,
        }
    }
}

impl DiskFormat for ExtentHeader {
    const DISK_SIZE: usize = 12;

    fn from_disk_bytes(b: &[u8]) -> Self {
        Self {
            magic: read_u16_le(b, 0),
            entries: read_u16_le(b, 2),
            max: read_u16_le(b, 4),
            depth: read_u16_le(b, 6),
            generation: read_u32_le(b, 8),
        }
    }

    fn to_disk_bytes(&self, b: &mut [u8]) {
        write_u16_le(b, 0, self.magic);
        write_u16_le(b, 2, self.entries);
        write_u16_le(b, 4, self.max);
        write_u16_le(b, 6, self.depth);
        write_u32_le(b, 8, self.generation);
    }
}

/// Leaf entry: `len` logical blocks from `first_block` map to physical
/// blocks from `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extent {
    pub first_block: u32,
    /// Raw length; values above [`EXT_INIT_MAX_LEN`] mark the extent uninitialized.
    pub len: u16,
    /// 48-bit physical start.
    pub start: u64,
}

impl Extent {
    pub fn new(first_block: u32, start: u64, len: u16) -> Self {
        Self {
            first_block,
            len,
            start,
        }
    }

    /// Blocks covered, ignoring the uninitialized marker.
    pub fn block_count(&self) -> u16 {
        if self.len > EXT_INIT_MAX_LEN {
            self.len - EXT_INIT_MAX_LEN
        } else {
            self.len
        }
    }

    pub fn is_uninit(&self) -> bool {
        self.len > EXT_INIT_MAX_LEN
    }

    /// Change the block count, keeping the uninitialized marker.
    pub fn set_block_count(&mut self, count: u16) {
        self.len = if self.is_uninit() && count > 0 {
            count + EXT_INIT_MAX_LEN
        } else {
            count
        };
    }

    /// First logical block past the extent.
    pub fn end_block(&self) -> u64 {
        self.first_block as u64 + self.block_count() as u64
    }

    /// Physical block for `iblock`, when it falls inside the extent.
    pub fn map(&self, iblock: u64) -> Option<u64> {
        (iblock >= self.first_block as u64 && iblock < self.end_block())
            .then(|| self.start + iblock - self.first_block as u64)
    }
}

impl DiskFormat for Extent {
    const DISK_SIZE: usize = 12;

    fn from_disk_bytes(b: &[u8]) -> Self {
        Self {
            first_block: read_u32_le(b, 0),
            len: read_u16_le(b, 4),
            start: join_hi_lo(read_u16_le(b, 6) as u32, read_u32_le(b, 8)),
        }
    }

    fn to_disk_bytes(&self, b: &mut [u8]) {
        let (hi, lo) = split_hi_lo(self.start);
        write_u32_le(b, 0, self.first_block);
        write_u16_le(b, 4, self.len);
        write_u16_le(b, 6, hi as u16);
        write_u32_le(b, 8, lo);
    }
}

/// Interior entry: the subtree at `leaf` covers logical blocks from
/// `first_block` up to the next entry's `first_block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtentIndex {
    pub first_block: u32,
    pub leaf: u64,
}

impl DiskFormat for ExtentIndex {
    const DISK_SIZE: usize = 12;

    fn from_disk_bytes(b: &[u8]) -> Self {
        Self {
            first_block: read_u32_le(b, 0),
            leaf: join_hi_lo(read_u16_le(b, 8) as u32, read_u32_le(b, 4)),
        }
    }

    fn to_disk_bytes(&self, b: &mut [u8]) {
        let (hi, lo) = split_hi_lo(self.leaf);
        write_u32_le(b, 0, self.first_block);
        write_u32_le(b, 4, lo);
        write_u16_le(b, 8, hi as u16);
        write_u16_le(b, 10, 0);
    }
}

/// Decoded extent tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtentNode {
    Leaf {
        header: ExtentHeader,
        entries: Vec<Extent>,
    },
    Index {
        header: ExtentHeader,
        entries: Vec<ExtentIndex>,
    },
}

/// One record destined for a node, used while growing the tree.
#[derive(Debug, Clone, Copy)]
enum NodeEntry {
    Extent(Extent),
    Index(ExtentIndex),
}

impl ExtentNode {
    /// Decode and validate a node stored in `bytes`.
    pub fn parse(bytes: &[u8]) -> Ext4Result<Self> {
        let header = ExtentHeader::from_disk_bytes(bytes);
        if header.magic != EXT4_EXTENT_MAGIC {
            error!(
                "bad extent header magic {:#x}, expected {:#x}",
                header.magic, EXT4_EXTENT_MAGIC
            );
            return Err(Ext4Error::Corrupted);
        }
        if header.entries > header.max || header.max > ExtentHeader::capacity(bytes.len()) {
            error!(
                "extent node holds {} of {} entries in {} bytes",
                header.entries,
                header.max,
                bytes.len()
            );
            return Err(Ext4Error::Corrupted);
        }
        if header.depth > EXT_MAX_DEPTH {
            error!("extent tree depth {} too large", header.depth);
            return Err(Ext4Error::Corrupted);
        }

        let records = bytes[ExtentHeader::DISK_SIZE..]
            .chunks_exact(Extent::DISK_SIZE)
            .take(header.entries as usize);
        Ok(if header.depth == 0 {
            ExtentNode::Leaf {
                header,
                entries: records.map(Extent::from_disk_bytes).collect(),
            }
        } else {
            ExtentNode::Index {
                header,
                entries: records.map(ExtentIndex::from_disk_bytes).collect(),
            }
        })
    }

    /// Encode into `bytes`, zeroing unused entry slots.
    pub fn write(&self, bytes: &mut [u8]) {
        let mut header = *self.header();
        header.entries = self.len() as u16;
        header.to_disk_bytes(bytes);

        let mut off = ExtentHeader::DISK_SIZE;
        match self {
            ExtentNode::Leaf { entries, .. } => {
                for extent in entries {
                    extent.to_disk_bytes(&mut bytes[off..]);
                    off += Extent::DISK_SIZE;
                }
            }
            ExtentNode::Index { entries, .. } => {
                for index in entries {
                    index.to_disk_bytes(&mut bytes[off..]);
                    off += ExtentIndex::DISK_SIZE;
                }
            }
        }
        bytes[off..].fill(0);
    }

    pub fn header(&self) -> &ExtentHeader {
        match self {
            ExtentNode::Leaf { header, .. } | ExtentNode::Index { header, .. } => header,
        }
    }

    pub fn header_mut(&mut self) -> &mut ExtentHeader {
        match self {
            ExtentNode::Leaf { header, .. } | ExtentNode::Index { header, .. } => header,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ExtentNode::Leaf { entries, .. } => entries.len(),
            ExtentNode::Index { entries, .. } => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.header().max as usize
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, ExtentNode::Leaf { .. })
    }

    /// Entry whose range may contain `iblock`.
    ///
    /// The last entry starting at or before `iblock`, or the first entry
    /// when `iblock` precedes them all. `None` only for an empty node.
    pub fn search(&self, iblock: u32) -> Option<usize> {
        let at = match self {
            ExtentNode::Leaf { entries, .. } => {
                entries.partition_point(|e| e.first_block <= iblock)
            }
            ExtentNode::Index { entries, .. } => {
                entries.partition_point(|e| e.first_block <= iblock)
            }
        };
        (!self.is_empty()).then(|| at.saturating_sub(1))
    }

    fn push(&mut self, entry: NodeEntry) -> Ext4Result<()> {
        match (self, entry) {
            (ExtentNode::Leaf { header, entries }, NodeEntry::Extent(extent)) => {
                entries.push(extent);
                header.entries = entries.len() as u16;
            }
            (ExtentNode::Index { header, entries }, NodeEntry::Index(index)) => {
                entries.push(index);
                header.entries = entries.len() as u16;
            }
            _ => {
                error!("extent record does not match node kind");
                return Err(Ext4Error::Corrupted);
            }
        }
        Ok(())
    }

    fn with_entry(depth: u16, max: u16, entry: NodeEntry) -> Self {
        let mut header = ExtentHeader::empty(depth, max);
        header.entries = 1;
        match entry {
            NodeEntry::Extent(extent) => ExtentNode::Leaf {
                header,
                entries: vec![extent],
            },
            NodeEntry::Index(index) => ExtentNode::Index {
                header,
                entries: vec![index],
            },
        }
    }

    fn empty_root() -> Self {
        ExtentNode::Leaf {
            header: ExtentHeader::empty(0, ExtentHeader::ROOT_MAX_ENTRIES),
            entries: Vec::new(),
        }
    }
}

/// Where a node is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeLocation {
    /// The inode's block area.
    Root,
    /// A whole filesystem block.
    Block(u64),
}

/// One visited node on the way from the root to a leaf.
#[derive(Debug, Clone)]
pub struct ExtentPathNode {
    pub location: NodeLocation,
    pub node: ExtentNode,
    /// Entry chosen by the search, `None` for an empty leaf.
    pub cursor: Option<usize>,
}

/// Root first, leaf last.
pub type ExtentPath = Vec<ExtentPathNode>;

fn logical(iblock: u64) -> Ext4Result<u32> {
    u32::try_from(iblock).map_err(|_| {
        error!("logical block {iblock} beyond extent range");
        Ext4Error::InvalidInput
    })
}

impl<D: BlockDevice> Ext4Filesystem<D> {
    fn load_extent_root(&self, inode: &InodeRef<'_, D>) -> Ext4Result<ExtentNode> {
        let root = inode.extent_root().ok_or(Ext4Error::InvalidInput)?;
        ExtentNode::parse(root)
    }

    fn load_extent_node(&self, block: u64, expected_depth: u16) -> Ext4Result<ExtentNode> {
        let node = {
            let cached = self.cache.get(block)?;
            ExtentNode::parse(&cached.data())?
        };
        if node.header().depth != expected_depth {
            error!(
                "extent node {block} has depth {}, parent expects {expected_depth}",
                node.header().depth
            );
            return Err(Ext4Error::Corrupted);
        }
        Ok(node)
    }

    fn store_extent_node(
        &self,
        inode: &mut InodeRef<'_, D>,
        location: NodeLocation,
        node: &ExtentNode,
    ) -> Ext4Result<()> {
        match location {
            NodeLocation::Root => {
                let root = inode
                    .inode_mut()
                    .extent_root_mut()
                    .ok_or(Ext4Error::InvalidInput)?;
                node.write(root);
            }
            NodeLocation::Block(block) => {
                let mut cached = self.cache.get(block)?;
                node.write(&mut cached.data_mut());
            }
        }
        Ok(())
    }

    fn block_node_capacity(&self) -> u16 {
        ExtentHeader::capacity(self.sb().block_size() as usize)
    }

    /// Physical block mapped at `iblock`, zero when unallocated.
    pub fn extent_find_block(&self, inode: &InodeRef<'_, D>, iblock: u64) -> Ext4Result<u64> {
        let block_size = self.sb().block_size() as u64;
        let size = inode.size();
        if size > 0 && iblock > (size - 1) / block_size {
            return Ok(0);
        }
        let Ok(target) = u32::try_from(iblock) else {
            return Ok(0);
        };

        let mut node = self.load_extent_root(inode)?;
        loop {
            match &node {
                ExtentNode::Index { header, entries } => {
                    let Some(at) = node.search(target) else {
                        error!("empty extent index node in inode {}", inode.index());
                        return Err(Ext4Error::Corrupted);
                    };
                    node = self.load_extent_node(entries[at].leaf, header.depth - 1)?;
                }
                ExtentNode::Leaf { entries, .. } => {
                    return Ok(node
                        .search(target)
                        .and_then(|at| entries[at].map(iblock))
                        .unwrap_or(0));
                }
            }
        }
    }

    /// Walk to the leaf responsible for `iblock`, recording every node.
    pub fn extent_find_path(&self, inode: &InodeRef<'_, D>, iblock: u64) -> Ext4Result<ExtentPath> {
        let target = logical(iblock)?;
        let root = self.load_extent_root(inode)?;
        let mut path = Vec::with_capacity(root.header().depth as usize + 2);
        let mut location = NodeLocation::Root;
        let mut node = root;

        loop {
            let cursor = node.search(target);
            let next = match &node {
                ExtentNode::Index { header, entries } => {
                    let Some(at) = cursor else {
                        error!("empty extent index node in inode {}", inode.index());
                        return Err(Ext4Error::Corrupted);
                    };
                    Some((entries[at].leaf, header.depth - 1))
                }
                ExtentNode::Leaf { .. } => None,
            };
            path.push(ExtentPathNode {
                location,
                node,
                cursor,
            });
            let Some((child, depth)) = next else {
                return Ok(path);
            };
            node = self.load_extent_node(child, depth)?;
            location = NodeLocation::Block(child);
        }
    }

    /// Map the next logical block past the end of the file to a newly
    /// allocated block and grow the size by one block.
    ///
    /// Returns `(logical, physical)`.
    pub fn extent_append_block(&self, inode: &mut InodeRef<'_, D>) -> Ext4Result<(u64, u64)> {
        let block_size = self.sb().block_size() as u64;
        let new_iblock = inode.size().div_ceil(block_size);
        let target = logical(new_iblock)?;
        let mut path = self.extent_find_path(inode, new_iblock)?;

        if let Some(fblock) = self.extend_last_extent(inode, &mut path, target)? {
            inode.inode_mut().set_size((new_iblock + 1) * block_size);
            return Ok((new_iblock, fblock));
        }

        let fblock = self.alloc_block(inode)?;
        let extent = Extent::new(target, fblock, 1);
        if let Err(err) = self.extent_append_extent(inode, &mut path, extent) {
            self.free_block(inode, fblock)?;
            return Err(err);
        }
        inode.inode_mut().set_size((new_iblock + 1) * block_size);
        trace!(
            "inode {}: new extent {new_iblock} -> {fblock}",
            inode.index()
        );
        Ok((new_iblock, fblock))
    }

    /// Grow the leaf's last extent by one block when it ends right at
    /// `target` and the next physical block is free.
    fn extend_last_extent(
        &self,
        inode: &mut InodeRef<'_, D>,
        path: &mut ExtentPath,
        target: u32,
    ) -> Ext4Result<Option<u64>> {
        let Some(leaf) = path.last_mut() else {
            return Ok(None);
        };
        let (Some(at), ExtentNode::Leaf { entries, .. }) = (leaf.cursor, &mut leaf.node) else {
            return Ok(None);
        };
        let mut extent = entries[at];
        if at + 1 != entries.len() || extent.is_uninit() {
            return Ok(None);
        }

        let fblock = if extent.block_count() == 0 {
            let fblock = self.alloc_block(inode)?;
            extent = Extent::new(target, fblock, 1);
            fblock
        } else {
            if extent.block_count() >= EXT_INIT_MAX_LEN || extent.end_block() != target as u64 {
                return Ok(None);
            }
            let fblock = extent.start + extent.block_count() as u64;
            if !self.try_alloc_block(inode, fblock)? {
                return Ok(None);
            }
            extent.set_block_count(extent.block_count() + 1);
            fblock
        };

        entries[at] = extent;
        let (location, node) = (leaf.location, leaf.node.clone());
        self.store_extent_node(inode, location, &node)?;
        Ok(Some(fblock))
    }

    /// Append `extent` after the last entry of the leaf at the end of
    /// `path`, splitting full nodes on the way up and growing the root
    /// when it is full too.
    fn extent_append_extent(
        &self,
        inode: &mut InodeRef<'_, D>,
        path: &mut ExtentPath,
        extent: Extent,
    ) -> Ext4Result<()> {
        let capacity = self.block_node_capacity();
        let mut pending = NodeEntry::Extent(extent);

        for level in (1..path.len()).rev() {
            let entry = &mut path[level];
            if !entry.node.is_full() {
                entry.node.push(pending)?;
                let (location, node) = (entry.location, entry.node.clone());
                return self.store_extent_node(inode, location, &node);
            }

            // full node: start a sibling holding only the new record
            let depth = entry.node.header().depth;
            let sibling = self.alloc_block(inode)?;
            let node = ExtentNode::with_entry(depth, capacity, pending);
            node.write(&mut self.cache.get_zeroed(sibling)?.data_mut());
            debug!(
                "inode {}: extent node at depth {depth} full, new sibling {sibling}",
                inode.index()
            );
            pending = NodeEntry::Index(ExtentIndex {
                first_block: extent.first_block,
                leaf: sibling,
            });
        }

        let root = &mut path[0];
        if !root.node.is_full() {
            root.node.push(pending)?;
            let node = root.node.clone();
            return self.store_extent_node(inode, NodeLocation::Root, &node);
        }

        // full root: move its entries down into a new block
        let child = self.alloc_block(inode)?;
        let mut moved = root.node.clone();
        moved.header_mut().max = capacity;
        moved.push(pending)?;
        moved.write(&mut self.cache.get_zeroed(child)?.data_mut());

        let depth = root.node.header().depth + 1;
        let new_root = ExtentNode::with_entry(
            depth,
            ExtentHeader::ROOT_MAX_ENTRIES,
            NodeEntry::Index(ExtentIndex {
                first_block: 0,
                leaf: child,
            }),
        );
        self.store_extent_node(inode, NodeLocation::Root, &new_root)?;
        debug!(
            "inode {}: extent tree grew to depth {depth}, old root moved to {child}",
            inode.index()
        );

        path[0].node = new_root;
        path[0].cursor = Some(0);
        Ok(())
    }

    /// Unmap and free every block from `iblock_from` on.
    ///
    /// An extent straddling the cut is shortened, later extents and whole
    /// subtrees are freed, and interior nodes left empty are released.
    /// The inode size is left to the caller.
    pub fn extent_release_from(&self, inode: &mut InodeRef<'_, D>, iblock_from: u64) -> Ext4Result<()> {
        let from = logical(iblock_from)?;
        let mut path = self.extent_find_path(inode, iblock_from)?;
        let leaf_level = path.len() - 1;

        let mut remove_parent = false;
        {
            let leaf = &mut path[leaf_level];
            let mut freed: Vec<(u64, u32)> = Vec::new();
            if let (Some(at), ExtentNode::Leaf { header, entries }) = (leaf.cursor, &mut leaf.node)
            {
                let first = &mut entries[at];
                let count = first.block_count() as u32;
                let keep = from.saturating_sub(first.first_block).min(count);
                if count > keep {
                    freed.push((first.start + keep as u64, count - keep));
                }
                first.set_block_count(keep as u16);

                let retained = if keep == 0 { at } else { at + 1 };
                freed.extend(
                    entries[at + 1..]
                        .iter()
                        .map(|e| (e.start, e.block_count() as u32)),
                );
                entries.truncate(retained);
                header.entries = entries.len() as u16;
            }
            for (start, count) in freed {
                if count > 0 {
                    self.free_blocks(inode, start, count)?;
                }
            }
        }

        let leaf = &path[leaf_level];
        let (location, node) = (leaf.location, leaf.node.clone());
        if let (NodeLocation::Block(block), true) = (location, node.is_empty()) {
            self.free_block(inode, block)?;
            remove_parent = true;
        } else {
            self.store_extent_node(inode, location, &node)?;
        }

        for level in (0..leaf_level).rev() {
            let entry = &mut path[level];
            let at = entry.cursor.unwrap_or(0);
            let ExtentNode::Index { header, entries } = &mut entry.node else {
                error!("extent path level {level} is not an index node");
                return Err(Ext4Error::Corrupted);
            };
            let doomed: Vec<u64> = entries.iter().skip(at + 1).map(|i| i.leaf).collect();
            let depth = header.depth - 1;
            entries.truncate(if remove_parent { at } else { at + 1 });
            header.entries = entries.len() as u16;

            let (location, node) = (entry.location, entry.node.clone());
            for child in doomed {
                self.extent_release_branch(inode, child, depth)?;
            }

            remove_parent = false;
            match location {
                NodeLocation::Block(block) if node.is_empty() => {
                    self.free_block(inode, block)?;
                    remove_parent = true;
                }
                NodeLocation::Root if node.is_empty() => {
                    // nothing left below the root: back to an empty leaf
                    self.store_extent_node(inode, location, &ExtentNode::empty_root())?;
                }
                _ => self.store_extent_node(inode, location, &node)?,
            }
        }
        Ok(())
    }

    /// Free the subtree rooted at `block`, data blocks included.
    pub fn extent_release_branch(
        &self,
        inode: &mut InodeRef<'_, D>,
        block: u64,
        depth: u16,
    ) -> Ext4Result<()> {
        match self.load_extent_node(block, depth)? {
            ExtentNode::Index { entries, .. } => {
                for index in entries {
                    self.extent_release_branch(inode, index.leaf, depth - 1)?;
                }
            }
            ExtentNode::Leaf { entries, .. } => {
                for extent in entries.iter().filter(|e| e.block_count() > 0) {
                    self.free_blocks(inode, extent.start, extent.block_count() as u32)?;
                }
            }
        }
        self.free_block(inode, block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bitmap,
        blockdev::RamDisk,
        config::{FormatOptions, MountOptions},
        filesystem::InodeKind,
        mkfs,
    };

    fn setup_fs(blocks_count: u64) -> Ext4Filesystem<RamDisk> {
        let opts = FormatOptions {
            block_size: 1024,
            blocks_count,
            blocks_per_group: 8192,
            inodes_per_group: 128,
            ..FormatOptions::default()
        };
        let disk = mkfs::format(RamDisk::new(blocks_count as usize * 1024), &opts).unwrap();
        Ext4Filesystem::open(disk, MountOptions::default()).unwrap()
    }

    fn block_in_use(fs: &Ext4Filesystem<RamDisk>, block: u64) -> bool {
        let (bgid, index) = {
            let sb = fs.sb();
            (sb.blockaddr_to_group(block), sb.blockaddr_to_index_in_group(block))
        };
        let bitmap_addr = fs.get_block_group_ref(bgid).unwrap().block_bitmap();
        let cached = fs.cache.get(bitmap_addr).unwrap();
        bitmap::is_bit_set(&cached.data(), index)
    }

    fn collect_extents(fs: &Ext4Filesystem<RamDisk>, inode: &InodeRef<'_, RamDisk>) -> Vec<Extent> {
        fn walk(fs: &Ext4Filesystem<RamDisk>, node: &ExtentNode, out: &mut Vec<Extent>) {
            match node {
                ExtentNode::Leaf { entries, .. } => out.extend_from_slice(entries),
                ExtentNode::Index { header, entries } => {
                    for index in entries {
                        let child = fs.load_extent_node(index.leaf, header.depth - 1).unwrap();
                        walk(fs, &child, out);
                    }
                }
            }
        }
        let mut out = Vec::new();
        walk(fs, &fs.load_extent_root(inode).unwrap(), &mut out);
        out
    }

    /// Append `count` blocks, each in its own extent. The block right after
    /// each new one is taken by `blocker` unless the tree already took it.
    fn append_fragmented(
        fs: &Ext4Filesystem<RamDisk>,
        inode: &mut InodeRef<'_, RamDisk>,
        blocker: &mut InodeRef<'_, RamDisk>,
        count: usize,
    ) -> Vec<u64> {
        let mut mapped = Vec::new();
        for _ in 0..count {
            let (_, fblock) = fs.extent_append_block(inode).unwrap();
            fs.try_alloc_block(blocker, fblock + 1).unwrap();
            mapped.push(fblock);
        }
        mapped
    }

    #[test]
    fn codecs_match_disk_layout() {
        let mut raw = [0u8; 12];
        Extent::new(7, 0x1234_5678_9abc, 3).to_disk_bytes(&mut raw);
        assert_eq!(read_u32_le(&raw, 0), 7);
        assert_eq!(read_u16_le(&raw, 4), 3);
        assert_eq!(read_u16_le(&raw, 6), 0x1234);
        assert_eq!(read_u32_le(&raw, 8), 0x5678_9abc);

        ExtentIndex {
            first_block: 9,
            leaf: 0x0001_0000_0002,
        }
        .to_disk_bytes(&mut raw);
        assert_eq!(read_u32_le(&raw, 4), 2);
        assert_eq!(read_u16_le(&raw, 8), 1);
        assert_eq!(ExtentIndex::from_disk_bytes(&raw).leaf, 0x0001_0000_0002);
    }

    #[test]
    fn uninit_marker_is_not_counted() {
        let mut extent = Extent::new(0, 100, EXT_INIT_MAX_LEN + 5);
        assert!(extent.is_uninit());
        assert_eq!(extent.block_count(), 5);
        extent.set_block_count(3);
        assert_eq!(extent.len, EXT_INIT_MAX_LEN + 3);
        assert_eq!(extent.map(102), Some(102));
        assert_eq!(extent.map(103), None);
        assert_eq!(Extent::new(0, 1, EXT_INIT_MAX_LEN).block_count(), EXT_INIT_MAX_LEN);
    }

    #[test]
    fn search_picks_last_entry_not_past_target() {
        let node = ExtentNode::Leaf {
            header: ExtentHeader::empty(0, 4),
            entries: vec![
                Extent::new(0, 100, 4),
                Extent::new(10, 200, 4),
                Extent::new(20, 300, 4),
            ],
        };
        assert_eq!(node.search(0), Some(0));
        assert_eq!(node.search(9), Some(0));
        assert_eq!(node.search(10), Some(1));
        assert_eq!(node.search(1000), Some(2));
        assert_eq!(ExtentNode::empty_root().search(3), None);

        let node = ExtentNode::Leaf {
            header: ExtentHeader::empty(0, 4),
            entries: vec![Extent::new(5, 100, 1)],
        };
        // before the first entry still selects it
        assert_eq!(node.search(2), Some(0));
    }

    #[test]
    fn malformed_headers_are_corruption() {
        let mut raw = [0u8; INODE_BLOCK_BYTES];
        ExtentNode::empty_root().write(&mut raw);
        assert!(ExtentNode::parse(&raw).is_ok());

        write_u16_le(&mut raw, 0, 0xBEEF);
        assert_eq!(ExtentNode::parse(&raw), Err(Ext4Error::Corrupted));

        ExtentNode::empty_root().write(&mut raw);
        write_u16_le(&mut raw, 2, 5);
        assert_eq!(ExtentNode::parse(&raw), Err(Ext4Error::Corrupted));

        ExtentNode::empty_root().write(&mut raw);
        write_u16_le(&mut raw, 4, 9);
        assert_eq!(ExtentNode::parse(&raw), Err(Ext4Error::Corrupted));
    }

    #[test]
    fn empty_root_maps_nothing() {
        let fs = setup_fs(8192);
        let mut inode = fs.alloc_inode(InodeKind::File).unwrap();
        assert!(inode.uses_extents());
        inode.inode_mut().set_size(10 * 1024);
        for iblock in 0..10 {
            assert_eq!(fs.extent_find_block(&inode, iblock).unwrap(), 0);
        }
    }

    #[test]
    fn sequential_appends_grow_one_extent() {
        let fs = setup_fs(8192);
        let mut inode = fs.alloc_inode(InodeKind::File).unwrap();
        let mut mapped = Vec::new();
        for expected in 0..6 {
            let (iblock, fblock) = fs.extent_append_block(&mut inode).unwrap();
            assert_eq!(iblock, expected);
            mapped.push(fblock);
        }
        assert_eq!(inode.size(), 6 * 1024);

        let extents = collect_extents(&fs, &inode);
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].block_count(), 6);
        for (iblock, fblock) in mapped.iter().enumerate() {
            assert_eq!(
                fs.extent_find_block(&inode, iblock as u64).unwrap(),
                *fblock
            );
        }
        assert_eq!(fs.extent_find_block(&inode, 6).unwrap(), 0);
    }

    #[test]
    fn full_root_moves_into_a_leaf_block() {
        let fs = setup_fs(8192);
        let mut inode = fs.alloc_inode(InodeKind::File).unwrap();
        let mut blocker = fs.alloc_inode(InodeKind::File).unwrap();

        let mapped = append_fragmented(&fs, &mut inode, &mut blocker, 4);
        let root = fs.load_extent_root(&inode).unwrap();
        assert_eq!(root.header().depth, 0);
        assert_eq!(root.len(), 4);

        let more = append_fragmented(&fs, &mut inode, &mut blocker, 1);
        let root = fs.load_extent_root(&inode).unwrap();
        assert_eq!(root.header().depth, 1);
        assert_eq!(root.len(), 1);

        let extents = collect_extents(&fs, &inode);
        assert_eq!(extents.len(), 5);
        for (iblock, fblock) in mapped.iter().chain(more.iter()).enumerate() {
            assert_eq!(
                fs.extent_find_block(&inode, iblock as u64).unwrap(),
                *fblock
            );
        }
        // five data blocks and one leaf block
        assert_eq!(inode.blocks_count(&fs.sb()), 6 * 2);
    }

    #[test]
    fn full_leaf_gets_a_sibling_and_order_holds() {
        let fs = setup_fs(8192);
        let mut inode = fs.alloc_inode(InodeKind::File).unwrap();
        let mut blocker = fs.alloc_inode(InodeKind::File).unwrap();
        let capacity = fs.block_node_capacity() as usize;

        let mapped = append_fragmented(&fs, &mut inode, &mut blocker, capacity + 2);
        let root = fs.load_extent_root(&inode).unwrap();
        assert_eq!(root.header().depth, 1);
        assert_eq!(root.len(), 2);

        let extents = collect_extents(&fs, &inode);
        assert_eq!(extents.len(), capacity + 2);
        assert!(extents.windows(2).all(|w| w[0].end_block() <= w[1].first_block as u64));
        for (iblock, fblock) in mapped.iter().enumerate() {
            assert_eq!(
                fs.extent_find_block(&inode, iblock as u64).unwrap(),
                *fblock
            );
        }
    }

    #[test]
    fn release_shortens_straddling_extent() {
        let fs = setup_fs(8192);
        let mut inode = fs.alloc_inode(InodeKind::File).unwrap();
        let mut mapped = Vec::new();
        for _ in 0..5 {
            mapped.push(fs.extent_append_block(&mut inode).unwrap().1);
        }
        let free = fs.superblock().free_blocks_count();

        fs.extent_release_from(&mut inode, 2).unwrap();
        let extents = collect_extents(&fs, &inode);
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].block_count(), 2);
        assert_eq!(fs.superblock().free_blocks_count(), free + 3);
        assert!(block_in_use(&fs, mapped[1]));
        assert!(!block_in_use(&fs, mapped[2]));
        assert!(!block_in_use(&fs, mapped[4]));
    }

    #[test]
    fn release_everything_collapses_the_tree() {
        let fs = setup_fs(8192);
        let mut inode = fs.alloc_inode(InodeKind::File).unwrap();
        let mut blocker = fs.alloc_inode(InodeKind::File).unwrap();
        let free = fs.superblock().free_blocks_count();

        append_fragmented(&fs, &mut inode, &mut blocker, 6);
        assert_eq!(fs.load_extent_root(&inode).unwrap().header().depth, 1);

        fs.extent_release_from(&mut inode, 0).unwrap();
        let root = fs.load_extent_root(&inode).unwrap();
        assert!(root.is_leaf());
        assert!(root.is_empty());
        // only the blocker's blocks stay allocated
        let held = blocker.blocks_count(&fs.sb()) / 2;
        assert_eq!(fs.superblock().free_blocks_count(), free - held);
        assert_eq!(inode.blocks_count(&fs.sb()), 0);

        // the tree is usable again
        inode.inode_mut().set_size(0);
        let (iblock, _) = fs.extent_append_block(&mut inode).unwrap();
        assert_eq!(iblock, 0);
    }

    #[test]
    fn release_inside_a_deep_tree_keeps_the_prefix() {
        let fs = setup_fs(8192);
        let mut inode = fs.alloc_inode(InodeKind::File).unwrap();
        let mut blocker = fs.alloc_inode(InodeKind::File).unwrap();
        let capacity = fs.block_node_capacity() as usize;
        let mapped = append_fragmented(&fs, &mut inode, &mut blocker, capacity + 3);

        fs.extent_release_from(&mut inode, 3).unwrap();
        let root = fs.load_extent_root(&inode).unwrap();
        // the second leaf went away with its index entry
        assert_eq!(root.len(), 1);
        let extents = collect_extents(&fs, &inode);
        assert_eq!(extents.len(), 3);
        assert!(block_in_use(&fs, mapped[2]));
        assert!(!block_in_use(&fs, mapped[capacity + 1]));
    }
}
