// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! # Filesystem session
//!
//! [`Ext4Filesystem`] owns the block cache and the in-memory superblock of
//! one mounted volume. Every other module adds operations to it through its
//! own `impl` block; this one holds mounting, inode lifecycle, logical block
//! dispatch between the two mapping schemes and the orphan list.
//!
//! A session is single threaded. Guards handed out by the session
//! ([`BlockRef`](crate::cache::BlockRef),
//! [`BlockGroupRef`](crate::block_group::BlockGroupRef),
//! [`InodeRef`]) borrow it and write their record back when dropped, so two
//! guards for the same group or inode must never be alive at once.

use alloc::vec::Vec;
use core::cell::{Cell, Ref, RefCell, RefMut};

use log::{debug, error, info, trace, warn};

use crate::{
    blockdev::BlockDevice,
    cache::BlockCache,
    config::{EXT4_MAX_BLOCK_SIZE, MountOptions, ROOT_INODE, SUPERBLOCK_SIZE},
    endian::DiskFormat,
    error::{Ext4Error, Ext4Result},
    indirect::indirect_limits,
    inode::{Ext4Inode, InodeFlags, InodeRef},
    superblock::{Ext4Superblock, IncompatFeatures},
};

/// What a new inode will hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    File,
    Directory,
}

/// A mounted volume.
pub struct Ext4Filesystem<D: BlockDevice> {
    pub(crate) cache: BlockCache<D>,
    sb: RefCell<Ext4Superblock>,
    sb_dirty: Cell<bool>,
    read_only: bool,
    options: MountOptions,
    /// First logical block past each mapping level (direct, single, double,
    /// triple indirect).
    pub(crate) inode_block_limits: [u64; 4],
    /// Data blocks covered by one pointer at each level.
    pub(crate) inode_blocks_per_level: [u64; 4],
}

impl<D: BlockDevice> Ext4Filesystem<D> {
    /// Mount the volume on `device`.
    ///
    /// The superblock must carry the magic, a block size of at most 64 KiB
    /// and a clean state. Unknown incompatible features refuse the mount;
    /// unknown read-only features downgrade it to read-only.
    pub fn open(mut device: D, options: MountOptions) -> Ext4Result<Self> {
        let sb = Ext4Superblock::load(&mut device)?;
        if sb.s_log_block_size > 6 || sb.block_size() > EXT4_MAX_BLOCK_SIZE {
            error!("block size shift {} too large", sb.s_log_block_size);
            return Err(Ext4Error::Unsupported);
        }
        if sb.s_state & Ext4Superblock::STATE_VALID_FS == 0
            || sb.s_state & Ext4Superblock::STATE_ERROR_FS != 0
        {
            error!("volume state {:#06x} is not clean", sb.s_state);
            return Err(Ext4Error::Unsupported);
        }
        sb.check_sanity()?;
        let forced_ro = sb.check_features()?;

        let block_size = sb.block_size();
        let device_ro = device.is_readonly();
        let read_only = options.read_only || forced_ro || device_ro;
        if read_only && !options.read_only {
            warn!("mounting read-only (features: {forced_ro}, device: {device_ro})");
        }

        let mut cache = BlockCache::new(device, block_size, options.cache_capacity)?;
        cache.set_read_only(read_only);
        if cache.device_blocks() < sb.blocks_count() {
            error!(
                "device holds {} blocks, volume claims {}",
                cache.device_blocks(),
                sb.blocks_count()
            );
            return Err(Ext4Error::InvalidInput);
        }

        let (inode_block_limits, inode_blocks_per_level) = indirect_limits(block_size);
        let fs = Self {
            cache,
            sb: RefCell::new(sb),
            sb_dirty: Cell::new(false),
            read_only,
            options,
            inode_block_limits,
            inode_blocks_per_level,
        };

        if !read_only {
            {
                let mut sb = fs.sb_mut();
                sb.s_state &= !Ext4Superblock::STATE_VALID_FS;
                sb.s_mnt_count = sb.s_mnt_count.wrapping_add(1);
            }
            fs.write_superblock()?;
        }

        {
            let sb = fs.sb();
            info!(
                "mounted ext4 volume: {} blocks of {} bytes, {} groups, {} inodes{}",
                sb.blocks_count(),
                block_size,
                sb.block_group_count(),
                sb.s_inodes_count,
                if read_only { " (read-only)" } else { "" }
            );
        }
        Ok(fs)
    }

    /// Mark the volume clean, write everything back and return the device.
    pub fn close(self) -> Ext4Result<D> {
        if !self.read_only {
            self.sb_mut().s_state |= Ext4Superblock::STATE_VALID_FS;
        }
        self.flush()?;
        info!("unmounted ext4 volume");
        Ok(self.cache.into_device()?)
    }

    /// Write the superblock, if changed, and every dirty cached block.
    pub fn flush(&self) -> Ext4Result<()> {
        if self.read_only {
            return Ok(());
        }
        if self.sb_dirty.get() {
            self.write_superblock()?;
        }
        self.cache.flush()?;
        Ok(())
    }

    fn write_superblock(&self) -> Ext4Result<()> {
        let sb = self.sb();
        let (block_id, offset) = sb.location();
        let mut block = self.cache.get(block_id)?;
        sb.to_disk_bytes(&mut block.data_mut()[offset..offset + SUPERBLOCK_SIZE]);
        self.sb_dirty.set(false);
        trace!("superblock staged in block {block_id}");
        Ok(())
    }

    pub fn sb(&self) -> Ref<'_, Ext4Superblock> {
        self.sb.borrow()
    }

    /// Mutable superblock; it is written back on the next flush.
    pub fn sb_mut(&self) -> RefMut<'_, Ext4Superblock> {
        self.sb_dirty.set(true);
        self.sb.borrow_mut()
    }

    /// Snapshot of the in-memory superblock.
    pub fn superblock(&self) -> Ext4Superblock {
        self.sb.borrow().clone()
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn ensure_writable(&self) -> Ext4Result<()> {
        if self.read_only {
            return Err(Ext4Error::ReadOnly);
        }
        Ok(())
    }

    /// The root directory.
    pub fn root(&self) -> Ext4Result<InodeRef<'_, D>> {
        self.get_inode_ref(ROOT_INODE)
    }

    fn inode_uses_extents(&self, inode: &InodeRef<'_, D>) -> bool {
        self.sb().has_incompat(IncompatFeatures::EXTENTS) && inode.uses_extents()
    }

    /// Allocate and initialise a new inode.
    ///
    /// Directories start with mode 0777 and one link for their future `.`
    /// entry; files start with mode 0666 and no links.
    pub fn alloc_inode(&self, kind: InodeKind) -> Ext4Result<InodeRef<'_, D>> {
        self.ensure_writable()?;
        let is_dir = kind == InodeKind::Directory;
        let index = self.alloc_inode_index(is_dir)?;
        let mut inode_ref = match self.get_inode_ref(index) {
            Ok(inode_ref) => inode_ref,
            Err(err) => {
                self.free_inode_index(index, is_dir)?;
                return Err(err);
            }
        };

        self.init_inode(&mut inode_ref, kind);
        debug!("allocated {kind:?} inode {index}");
        Ok(inode_ref)
    }

    /// Reset `inode_ref` to an empty inode of `kind`.
    pub(crate) fn init_inode(&self, inode_ref: &mut InodeRef<'_, D>, kind: InodeKind) {
        let extents = self.sb().has_incompat(IncompatFeatures::EXTENTS);
        let inode = inode_ref.inode_mut();
        let (mode, links) = match kind {
            InodeKind::Directory => (0o777 | Ext4Inode::S_IFDIR, 1),
            InodeKind::File => (0o666 | Ext4Inode::S_IFREG, 0),
        };
        inode.i_mode = mode;
        inode.i_links_count = links;
        inode.i_uid = 0;
        inode.l_i_uid_high = 0;
        inode.i_gid = 0;
        inode.l_i_gid_high = 0;
        inode.set_size(0);
        inode.i_atime = 0;
        inode.i_ctime = 0;
        inode.i_mtime = 0;
        inode.i_dtime = 0;
        inode.i_blocks_lo = 0;
        inode.l_i_blocks_high = 0;
        inode.i_flags = InodeFlags::empty();
        inode.i_generation = 0;
        inode.set_file_acl(0);
        if extents {
            inode.init_extent_root();
        } else {
            inode.clear_block_map();
        }
    }

    /// Release an inode together with every block it owns.
    pub fn free_inode(&self, inode: &mut InodeRef<'_, D>) -> Ext4Result<()> {
        self.ensure_writable()?;
        if self.inode_uses_extents(inode) {
            self.extent_release_from(inode, 0)?;
        } else {
            let block_size = self.sb().block_size() as u64;
            for iblock in 0..inode.size().div_ceil(block_size) {
                self.release_indirect_data_block(inode, iblock)?;
            }
            self.free_indirect_tree(inode)?;
        }
        inode.inode_mut().set_size(0);

        let xattr = inode.file_acl();
        if xattr != 0 {
            self.free_block(inode, xattr)?;
            inode.inode_mut().set_file_acl(0);
        }

        let is_dir = inode.is_dir();
        self.free_inode_index(inode.index(), is_dir)?;
        debug!("freed inode {}", inode.index());
        Ok(())
    }

    /// Shrink `inode` to `new_size` bytes, releasing blocks past the end.
    pub fn truncate_inode(&self, inode: &mut InodeRef<'_, D>, new_size: u64) -> Ext4Result<()> {
        self.ensure_writable()?;
        if !inode.can_truncate() {
            return Err(Ext4Error::InvalidInput);
        }
        let old_size = inode.size();
        if old_size == new_size {
            return Ok(());
        }
        if new_size > old_size {
            debug!("inode {}: truncate cannot grow {old_size} to {new_size}", inode.index());
            return Err(Ext4Error::InvalidInput);
        }

        let block_size = self.sb().block_size() as u64;
        let keep = new_size.div_ceil(block_size);
        let old_blocks = old_size.div_ceil(block_size);
        if self.inode_uses_extents(inode) {
            self.extent_release_from(inode, keep)?;
        } else {
            for iblock in (keep..old_blocks).rev() {
                self.release_indirect_data_block(inode, iblock)?;
            }
            if keep == 0 {
                self.free_indirect_tree(inode)?;
            }
        }
        inode.inode_mut().set_size(new_size);
        trace!("inode {}: truncated {old_size} -> {new_size}", inode.index());
        Ok(())
    }

    /// Physical block behind logical block `iblock` of `inode`; zero for a
    /// hole or a block past the end.
    pub fn get_inode_data_block(&self, inode: &InodeRef<'_, D>, iblock: u64) -> Ext4Result<u64> {
        if inode.size() == 0 {
            return Ok(0);
        }
        if self.inode_uses_extents(inode) {
            self.extent_find_block(inode, iblock)
        } else {
            self.get_indirect_data_block(inode, iblock)
        }
    }

    /// Map `iblock` to `fblock` in a block-mapped inode.
    pub fn set_inode_data_block(
        &self,
        inode: &mut InodeRef<'_, D>,
        iblock: u64,
        fblock: u64,
    ) -> Ext4Result<()> {
        self.ensure_writable()?;
        if self.inode_uses_extents(inode) {
            return Err(Ext4Error::Unsupported);
        }
        let Ok(fblock) = u32::try_from(fblock) else {
            return Err(Ext4Error::InvalidInput);
        };
        self.set_indirect_data_block(inode, iblock, fblock)
    }

    /// Unmap and free logical block `iblock` of a block-mapped inode.
    pub fn release_inode_block(&self, inode: &mut InodeRef<'_, D>, iblock: u64) -> Ext4Result<()> {
        self.ensure_writable()?;
        if self.inode_uses_extents(inode) {
            return Err(Ext4Error::Unsupported);
        }
        self.release_indirect_data_block(inode, iblock)
    }

    /// Add one block at the end of `inode`, growing its size by a block.
    ///
    /// Returns the new logical and physical block numbers.
    pub fn append_inode_block(&self, inode: &mut InodeRef<'_, D>) -> Ext4Result<(u64, u64)> {
        self.ensure_writable()?;
        if self.inode_uses_extents(inode) {
            return self.extent_append_block(inode);
        }

        let block_size = self.sb().block_size() as u64;
        let aligned = inode.size().next_multiple_of(block_size);
        let iblock = aligned / block_size;
        let fblock = self.alloc_block(inode)?;
        if let Err(err) = self.set_inode_data_block(inode, iblock, fblock) {
            self.free_block(inode, fblock)?;
            return Err(err);
        }
        inode.inode_mut().set_size(aligned + block_size);
        trace!("inode {}: appended block {iblock} -> {fblock}", inode.index());
        Ok((iblock, fblock))
    }

    /// Push `inode` onto the superblock's orphan list.
    pub fn add_orphan(&self, inode: &mut InodeRef<'_, D>) -> Ext4Result<()> {
        self.ensure_writable()?;
        let index = inode.index();
        let head = self.sb().s_last_orphan;
        if head == index {
            return Ok(());
        }
        inode.inode_mut().i_dtime = head;
        self.sb_mut().s_last_orphan = index;
        debug!("inode {index} added to orphan list");
        Ok(())
    }

    /// Unlink `inode` from the orphan list, wherever it sits.
    pub fn remove_orphan(&self, inode: &mut InodeRef<'_, D>) -> Ext4Result<()> {
        self.ensure_writable()?;
        let index = inode.index();
        let (head, inodes_count) = {
            let sb = self.sb();
            (sb.s_last_orphan, sb.s_inodes_count)
        };
        if head == index {
            self.sb_mut().s_last_orphan = inode.i_dtime;
            inode.inode_mut().i_dtime = 0;
            return Ok(());
        }

        let mut current = head;
        let mut steps = 0;
        while current != 0 {
            steps += 1;
            if steps > inodes_count {
                error!("orphan list loops at inode {current}");
                return Err(Ext4Error::Corrupted);
            }
            let mut prev = self.get_inode_ref(current)?;
            let next = prev.i_dtime;
            if next == index {
                prev.inode_mut().i_dtime = inode.i_dtime;
                inode.inode_mut().i_dtime = 0;
                debug!("inode {index} removed from orphan list");
                return Ok(());
            }
            current = next;
        }
        Err(Ext4Error::NotFound)
    }

    /// Inode numbers on the orphan list, head first.
    pub fn orphans(&self) -> Ext4Result<Vec<u32>> {
        let (mut current, inodes_count) = {
            let sb = self.sb();
            (sb.s_last_orphan, sb.s_inodes_count)
        };
        let mut list = Vec::new();
        while current != 0 {
            if list.len() as u32 >= inodes_count {
                error!("orphan list loops at inode {current}");
                return Err(Ext4Error::Corrupted);
            }
            list.push(current);
            current = self.get_inode_ref(current)?.i_dtime;
        }
        Ok(list)
    }
}
