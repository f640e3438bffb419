// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! # Formatter
//!
//! Lays out a fresh volume on a block device. Every group gets its backup
//! area (when it carries one), a block bitmap, an inode bitmap and an inode
//! table, in that order; data follows the inode table. With group
//! descriptor checksums enabled the groups between the first and the last
//! are left `*_UNINIT` and are built lazily on first use.
//!
//! The root directory is created by mounting the new volume once and
//! running the ordinary directory code on inode 2.

use alloc::vec::Vec;

use log::{debug, info, warn};

use crate::{
    bitmap,
    block_group::{BlockGroupFlags, Ext4GroupDesc, group_desc_checksum},
    blockdev::BlockDevice,
    cache::BlockCache,
    config::{
        DEFAULT_CACHE_CAPACITY, EXT4_MAX_BLOCK_SIZE, EXT4_MIN_BLOCK_SIZE, EXT4_SUPER_MAGIC,
        FormatOptions, GOOD_OLD_FIRST_INO, GOOD_OLD_INODE_SIZE, GROUP_DESC_SIZE, MountOptions,
        ROOT_INODE, SUPERBLOCK_SIZE,
    },
    endian::{DiskFormat, write_u16_le},
    error::{Ext4Error, Ext4Result},
    filesystem::{Ext4Filesystem, InodeKind},
    hash::DX_HASH_TEA,
    inode::Ext4Inode,
    superblock::{
        CompatFeatures, Ext4Superblock, IncompatFeatures, RoCompatFeatures, SuperblockFlags,
    },
};

/// Where one group's metadata lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GroupLayout {
    start: u64,
    block_bitmap: u64,
    inode_bitmap: u64,
    inode_table: u64,
    /// Blocks from the group start up to the end of the inode table.
    metadata_blocks: u32,
}

impl GroupLayout {
    fn of(sb: &Ext4Superblock, bgid: u32) -> Self {
        let start = sb.index_in_group_to_blockaddr(0, bgid);
        let backup = sb.backup_blocks(bgid);
        let block_bitmap = start + backup as u64;
        Self {
            start,
            block_bitmap,
            inode_bitmap: block_bitmap + 1,
            inode_table: block_bitmap + 2,
            metadata_blocks: backup + 2 + sb.inode_table_blocks(bgid),
        }
    }
}

fn check_options<D: BlockDevice>(device: &D, opts: &FormatOptions) -> Ext4Result<()> {
    let bad = |what: &str| {
        warn!("mkfs: invalid {what}");
        Err(Ext4Error::InvalidInput)
    };
    let bs = opts.block_size;
    if !bs.is_power_of_two() || !(EXT4_MIN_BLOCK_SIZE..=EXT4_MAX_BLOCK_SIZE).contains(&bs) {
        return bad("block size");
    }
    if opts.blocks_per_group == 0
        || opts.blocks_per_group % 8 != 0
        || opts.blocks_per_group > bs * 8
    {
        return bad("blocks per group");
    }
    if opts.inodes_per_group == 0
        || opts.inodes_per_group % 8 != 0
        || opts.inodes_per_group > bs * 8
    {
        return bad("inodes per group");
    }
    if opts.inode_size < GOOD_OLD_INODE_SIZE
        || !opts.inode_size.is_power_of_two()
        || opts.inode_size as u32 > bs
    {
        return bad("inode size");
    }
    if opts.hash_version > DX_HASH_TEA {
        return bad("hash version");
    }
    if !opts.bit64 && opts.blocks_count > u32::MAX as u64 {
        return bad("block count without 64-bit support");
    }
    let device_bytes = device.total_blocks() * device.block_size() as u64;
    if opts.blocks_count.saturating_mul(bs as u64) > device_bytes {
        return bad("block count for the device size");
    }
    Ok(())
}

fn build_superblock(opts: &FormatOptions) -> Ext4Result<Ext4Superblock> {
    let mut sb = Ext4Superblock::default();
    sb.s_magic = EXT4_SUPER_MAGIC;
    sb.s_rev_level = 1;
    sb.s_log_block_size = opts.block_size.trailing_zeros() - 10;
    sb.s_log_cluster_size = sb.s_log_block_size;
    sb.s_first_data_block = if opts.block_size == 1024 { 1 } else { 0 };
    sb.s_blocks_per_group = opts.blocks_per_group;
    sb.s_clusters_per_group = opts.blocks_per_group;
    sb.s_inodes_per_group = opts.inodes_per_group;
    sb.s_inode_size = opts.inode_size;
    sb.s_first_ino = GOOD_OLD_FIRST_INO;
    sb.s_reserved_gdt_blocks = opts.reserved_gdt_blocks;
    sb.s_state = Ext4Superblock::STATE_VALID_FS;
    // continue on errors
    sb.s_errors = 1;
    sb.s_max_mnt_count = u16::MAX;
    sb.s_uuid = opts.uuid;
    sb.s_volume_name = opts.volume_name;
    sb.s_hash_seed = opts.hash_seed;
    sb.s_def_hash_version = opts.hash_version;
    sb.s_flags = if opts.unsigned_hash {
        SuperblockFlags::UNSIGNED_HASH
    } else {
        SuperblockFlags::SIGNED_HASH
    };

    if opts.dir_index {
        sb.s_feature_compat |= CompatFeatures::DIR_INDEX;
    }
    sb.s_feature_incompat = IncompatFeatures::FILETYPE;
    if opts.extents {
        sb.s_feature_incompat |= IncompatFeatures::EXTENTS;
    }
    if opts.bit64 {
        sb.s_feature_incompat |= IncompatFeatures::BIT64;
        sb.s_desc_size = GROUP_DESC_SIZE;
    }
    sb.s_feature_ro_compat = RoCompatFeatures::LARGE_FILE | RoCompatFeatures::DIR_NLINK;
    if opts.sparse_super {
        sb.s_feature_ro_compat |= RoCompatFeatures::SPARSE_SUPER;
    }
    if opts.gdt_csum {
        sb.s_feature_ro_compat |= RoCompatFeatures::GDT_CSUM;
    }

    // a tail group too small for its own metadata is cut off
    let mut blocks_count = opts.blocks_count;
    loop {
        if blocks_count <= sb.s_first_data_block as u64 {
            warn!("mkfs: {} blocks leave no room for a group", opts.blocks_count);
            return Err(Ext4Error::InvalidInput);
        }
        sb.set_blocks_count(blocks_count);
        let groups = sb.block_group_count();
        let Some(inodes) = groups.checked_mul(opts.inodes_per_group) else {
            warn!("mkfs: inode count overflows");
            return Err(Ext4Error::InvalidInput);
        };
        sb.s_inodes_count = inodes;

        let last = groups - 1;
        let size = sb.blocks_in_group(last);
        if size > GroupLayout::of(&sb, last).metadata_blocks {
            break;
        }
        if groups == 1 {
            warn!("mkfs: {blocks_count} blocks cannot hold one group's metadata");
            return Err(Ext4Error::InvalidInput);
        }
        debug!("mkfs: dropping {size}-block tail group {last}");
        blocks_count -= size as u64;
    }

    sb.set_reserved_blocks_count(sb.blocks_count() / 20);
    sb.check_sanity()?;
    Ok(sb)
}

/// Descriptor of group `bgid` as laid out by [`GroupLayout`].
fn build_group_desc(sb: &Ext4Superblock, bgid: u32, uninit: bool) -> Ext4GroupDesc {
    let layout = GroupLayout::of(sb, bgid);
    let ipg = sb.inodes_per_group();
    let reserved_inodes = if bgid == 0 { sb.first_inode() - 1 } else { 0 };

    let mut desc = Ext4GroupDesc::default();
    desc.set_block_bitmap(layout.block_bitmap);
    desc.set_inode_bitmap(layout.inode_bitmap);
    desc.set_inode_table(layout.inode_table);
    desc.set_free_blocks_count(sb.blocks_in_group(bgid) - layout.metadata_blocks);
    desc.set_free_inodes_count(sb.inodes_in_group(bgid) - reserved_inodes);
    desc.set_used_dirs_count(0);

    if sb.has_ro_compat(RoCompatFeatures::GDT_CSUM) {
        if uninit {
            desc.bg_flags = BlockGroupFlags::BLOCK_UNINIT | BlockGroupFlags::INODE_UNINIT;
        } else {
            desc.bg_flags = BlockGroupFlags::ITABLE_ZEROED;
        }
        desc.set_itable_unused(ipg - reserved_inodes);
    }
    desc
}

/// Write the descriptor table starting at block `first`.
fn write_desc_table<D: BlockDevice>(
    cache: &BlockCache<D>,
    sb: &Ext4Superblock,
    descs: &[Ext4GroupDesc],
    first: u64,
) -> Ext4Result<()> {
    let desc_size = sb.desc_size() as usize;
    let per_block = sb.descs_per_block() as usize;
    let csum = sb.has_ro_compat(RoCompatFeatures::GDT_CSUM);

    for (i, chunk) in descs.chunks(per_block).enumerate() {
        let mut block = cache.get_zeroed(first + i as u64)?;
        let mut data = block.data_mut();
        for (j, desc) in chunk.iter().enumerate() {
            let bgid = (i * per_block + j) as u32;
            let raw = &mut data[j * desc_size..(j + 1) * desc_size];
            desc.encode(raw, desc_size);
            if csum {
                let value = group_desc_checksum(&sb.s_uuid, bgid, raw, desc_size);
                write_u16_le(raw, Ext4GroupDesc::CHECKSUM_OFFSET, value);
            }
        }
    }
    Ok(())
}

/// Superblock copy of group `bgid`, tagged with its group number.
fn write_superblock_copy<D: BlockDevice>(
    cache: &BlockCache<D>,
    sb: &Ext4Superblock,
    bgid: u32,
) -> Ext4Result<()> {
    let mut copy = sb.clone();
    copy.s_block_group_nr = bgid as u16;
    let (block_id, offset) = if bgid == 0 {
        sb.location()
    } else {
        (GroupLayout::of(sb, bgid).start, 0)
    };
    let mut block = if offset == 0 {
        cache.get_zeroed(block_id)?
    } else {
        cache.get(block_id)?
    };
    copy.to_disk_bytes(&mut block.data_mut()[offset..offset + SUPERBLOCK_SIZE]);
    Ok(())
}

/// Bitmaps and a zeroed inode table for an initialised group.
fn write_group_metadata<D: BlockDevice>(
    cache: &BlockCache<D>,
    sb: &Ext4Superblock,
    bgid: u32,
) -> Ext4Result<()> {
    let layout = GroupLayout::of(sb, bgid);
    let bits = sb.block_size() * 8;

    {
        let mut block = cache.get_zeroed(layout.block_bitmap)?;
        let mut data = block.data_mut();
        bitmap::set_bits(&mut data, 0, layout.metadata_blocks);
        let in_group = sb.blocks_in_group(bgid);
        bitmap::set_bits(&mut data, in_group, bits - in_group);
    }
    {
        let mut block = cache.get_zeroed(layout.inode_bitmap)?;
        let mut data = block.data_mut();
        if bgid == 0 {
            bitmap::set_bits(&mut data, 0, sb.first_inode() - 1);
        }
        let ipg = sb.inodes_per_group();
        bitmap::set_bits(&mut data, ipg, bits - ipg);
    }
    let table_blocks = sb.inode_table_blocks(bgid) as u64;
    for block in layout.inode_table..layout.inode_table + table_blocks {
        drop(cache.get_zeroed(block)?);
    }
    Ok(())
}

/// Turn the reserved root inode into an empty directory.
fn create_root_dir<D: BlockDevice>(fs: &Ext4Filesystem<D>) -> Ext4Result<()> {
    let mut root = fs.get_inode_ref(ROOT_INODE)?;
    fs.init_inode(&mut root, InodeKind::Directory);
    root.inode_mut().i_mode = Ext4Inode::S_IFDIR | 0o755;
    fs.init_dir(&mut root, ROOT_INODE)?;
    // "." and the parent's entry, which is itself
    root.inode_mut().i_links_count = 2;
    drop(root);

    let mut group = fs.get_block_group_ref(0)?;
    let dirs = group.used_dirs_count();
    group.desc_mut().set_used_dirs_count(dirs + 1);
    Ok(())
}

/// Format `device` according to `opts` and hand it back.
pub fn format<D: BlockDevice>(device: D, opts: &FormatOptions) -> Ext4Result<D> {
    check_options(&device, opts)?;
    let mut sb = build_superblock(opts)?;
    let groups = sb.block_group_count();
    debug!(
        "mkfs: {} blocks of {} bytes, {groups} groups of {} blocks and {} inodes",
        sb.blocks_count(),
        sb.block_size(),
        sb.blocks_per_group(),
        sb.inodes_per_group()
    );

    let lazy = sb.has_ro_compat(RoCompatFeatures::GDT_CSUM);
    let descs: Vec<Ext4GroupDesc> = (0..groups)
        .map(|bgid| build_group_desc(&sb, bgid, lazy && bgid != 0 && bgid + 1 != groups))
        .collect();

    let free_blocks: u64 = descs.iter().map(|d| d.free_blocks_count() as u64).sum();
    let free_inodes: u32 = descs.iter().map(|d| d.free_inodes_count()).sum();
    sb.set_free_blocks_count(free_blocks);
    sb.set_free_inodes_count(free_inodes);

    let cache = BlockCache::new(device, sb.block_size(), DEFAULT_CACHE_CAPACITY)?;
    for (bgid, desc) in descs.iter().enumerate() {
        let bgid = bgid as u32;
        if sb.group_has_backup(bgid) {
            write_superblock_copy(&cache, &sb, bgid)?;
            let start = GroupLayout::of(&sb, bgid).start;
            write_desc_table(&cache, &sb, &descs, start + 1)?;
        }
        if !desc.has_flag(BlockGroupFlags::BLOCK_UNINIT) {
            write_group_metadata(&cache, &sb, bgid)?;
        }
    }
    let device = cache.into_device()?;
    debug!("mkfs: metadata of {groups} groups written");

    let fs = Ext4Filesystem::open(device, MountOptions::default())?;
    create_root_dir(&fs)?;
    fs.sb_mut().s_mnt_count = 0;
    let device = fs.close()?;

    info!(
        "formatted ext4 volume: {} blocks, {groups} groups, {} inodes",
        sb.blocks_count(),
        sb.s_inodes_count
    );
    Ok(device)
}
