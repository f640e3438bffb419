// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! # Block cache
//!
//! Filesystem blocks are shared between every live [`BlockRef`] for the
//! same block number, so two inodes living in one inode-table block see
//! each other's updates. A reference is released when it is dropped; a
//! dirty reference marks its cache slot dirty on the way out. Dirty slots
//! reach the device on [`BlockCache::flush`] or when evicted. A read-only
//! cache never writes: dirty slots are discarded instead.
//!
//! The cache is single threaded. Callers serialize access per volume.

use alloc::{collections::BTreeMap, rc::Rc, vec, vec::Vec};
use core::cell::{Ref, RefCell, RefMut};

use log::{debug, trace, warn};

use crate::{
    blockdev::BlockDevice,
    error::{BlockDevError, BlockDevResult},
};

type SharedBuf = Rc<RefCell<Vec<u8>>>;

struct CachedBlock {
    data: SharedBuf,
    refs: usize,
    dirty: bool,
    last_access: u64,
}

struct CacheInner<D> {
    device: D,
    entries: BTreeMap<u64, CachedBlock>,
    capacity: usize,
    access_counter: u64,
}

/// Reference-counted cache of filesystem blocks over a [`BlockDevice`].
pub struct BlockCache<D: BlockDevice> {
    inner: RefCell<CacheInner<D>>,
    block_size: u32,
    sectors_per_block: u32,
    read_only: bool,
}

impl<D: BlockDevice> BlockCache<D> {
    /// Wrap `device`, addressing it in `block_size` units.
    pub fn new(device: D, block_size: u32, capacity: usize) -> BlockDevResult<Self> {
        let sector = device.block_size();
        if sector == 0 || block_size % sector != 0 {
            return Err(BlockDevError::InvalidBlockSize {
                size: block_size as usize,
                expected: sector as usize,
            });
        }
        Ok(Self {
            inner: RefCell::new(CacheInner {
                device,
                entries: BTreeMap::new(),
                capacity: capacity.max(1),
                access_counter: 0,
            }),
            block_size,
            sectors_per_block: block_size / sector,
            read_only: false,
        })
    }

    /// Stop all writes to the device.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Number of filesystem blocks the device can hold.
    pub fn device_blocks(&self) -> u64 {
        self.inner.borrow().device.total_blocks() / self.sectors_per_block as u64
    }

    /// Acquire block `lba`, reading it from the device on a miss.
    pub fn get(&self, lba: u64) -> BlockDevResult<BlockRef<'_, D>> {
        self.acquire(lba, false)
    }

    /// Acquire block `lba` without reading it and fill it with zeros.
    ///
    /// Used for freshly allocated blocks whose old contents are garbage.
    /// The returned reference is already dirty.
    pub fn get_zeroed(&self, lba: u64) -> BlockDevResult<BlockRef<'_, D>> {
        let mut block = self.acquire(lba, true)?;
        block.data_mut().fill(0);
        Ok(block)
    }

    fn acquire(&self, lba: u64, noread: bool) -> BlockDevResult<BlockRef<'_, D>> {
        let mut inner = self.inner.borrow_mut();
        inner.access_counter += 1;
        let stamp = inner.access_counter;

        if let Some(entry) = inner.entries.get_mut(&lba) {
            entry.refs += 1;
            entry.last_access = stamp;
            let data = Rc::clone(&entry.data);
            return Ok(BlockRef {
                cache: self,
                lba,
                data,
                dirty: false,
            });
        }

        if inner.entries.len() >= inner.capacity {
            self.evict_one(&mut inner)?;
        }

        let mut buf = vec![0u8; self.block_size as usize];
        if !noread {
            let sector = lba * self.sectors_per_block as u64;
            inner.device.read(&mut buf, sector, self.sectors_per_block)?;
            trace!("cache miss: block {lba} read from device");
        }

        let data = Rc::new(RefCell::new(buf));
        inner.entries.insert(
            lba,
            CachedBlock {
                data: Rc::clone(&data),
                refs: 1,
                dirty: false,
                last_access: stamp,
            },
        );
        Ok(BlockRef {
            cache: self,
            lba,
            data,
            dirty: false,
        })
    }

    /// Drop the least recently used unreferenced block, writing it first if
    /// dirty and the cache is writable.
    ///
    /// When every block is referenced the cache simply grows past capacity.
    fn evict_one(&self, inner: &mut CacheInner<D>) -> BlockDevResult<()> {
        let victim = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.refs == 0)
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(lba, _)| *lba);
        let Some(lba) = victim else {
            debug!(
                "block cache over capacity: {} blocks pinned",
                inner.entries.len()
            );
            return Ok(());
        };
        if let Some(entry) = inner.entries.get(&lba) {
            if entry.dirty && self.read_only {
                warn!("read-only cache: discarding changes to block {lba}");
            } else if entry.dirty {
                let sector = lba * self.sectors_per_block as u64;
                let data = entry.data.borrow();
                inner.device.write(&data, sector, self.sectors_per_block)?;
                trace!("evicted dirty block {lba}");
            }
        }
        inner.entries.remove(&lba);
        Ok(())
    }

    fn release(&self, lba: u64, dirty: bool) {
        let mut inner = self.inner.borrow_mut();
        if let Some(entry) = inner.entries.get_mut(&lba) {
            entry.refs = entry.refs.saturating_sub(1);
            entry.dirty |= dirty;
        }
    }

    /// Write every dirty block to the device and flush it.
    ///
    /// A read-only cache clears the dirty marks and leaves the device alone.
    pub fn flush(&self) -> BlockDevResult<()> {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        if self.read_only {
            let mut discarded = 0usize;
            for entry in inner.entries.values_mut().filter(|entry| entry.dirty) {
                entry.dirty = false;
                discarded += 1;
            }
            if discarded > 0 {
                warn!("read-only cache: discarded {discarded} dirty blocks");
            }
            return Ok(());
        }
        let mut written = 0usize;
        for (lba, entry) in inner.entries.iter_mut() {
            if entry.dirty {
                let sector = lba * self.sectors_per_block as u64;
                inner
                    .device
                    .write(&entry.data.borrow(), sector, self.sectors_per_block)?;
                entry.dirty = false;
                written += 1;
            }
        }
        inner.device.flush()?;
        debug!("block cache flushed {written} dirty blocks");
        Ok(())
    }

    /// Number of live references to `lba`.
    pub fn ref_count(&self, lba: u64) -> usize {
        self.inner
            .borrow()
            .entries
            .get(&lba)
            .map_or(0, |entry| entry.refs)
    }

    /// Whether `lba` holds changes not yet written to the device.
    pub fn is_dirty(&self, lba: u64) -> bool {
        self.inner
            .borrow()
            .entries
            .get(&lba)
            .is_some_and(|entry| entry.dirty)
    }

    /// Total live references across the cache.
    pub fn live_refs(&self) -> usize {
        self.inner.borrow().entries.values().map(|e| e.refs).sum()
    }

    /// Raw sector read that bypasses the cache.
    pub fn read_sectors(&self, buf: &mut [u8], sector: u64, count: u32) -> BlockDevResult<()> {
        self.inner.borrow_mut().device.read(buf, sector, count)
    }

    pub fn is_readonly(&self) -> bool {
        self.inner.borrow().device.is_readonly()
    }

    /// Flush and hand the device back.
    pub fn into_device(self) -> BlockDevResult<D> {
        self.flush()?;
        Ok(self.inner.into_inner().device)
    }
}

/// Scoped handle on one cached block.
///
/// Released exactly once, on drop. Mutable access through
/// [`BlockRef::data_mut`] marks the handle dirty.
pub struct BlockRef<'a, D: BlockDevice> {
    cache: &'a BlockCache<D>,
    lba: u64,
    data: SharedBuf,
    dirty: bool,
}

impl<D: BlockDevice> BlockRef<'_, D> {
    /// Block number on the volume.
    pub fn lba(&self) -> u64 {
        self.lba
    }

    pub fn data(&self) -> Ref<'_, [u8]> {
        Ref::map(self.data.borrow(), |v| v.as_slice())
    }

    pub fn data_mut(&mut self) -> RefMut<'_, [u8]> {
        self.dirty = true;
        RefMut::map(self.data.borrow_mut(), |v| v.as_mut_slice())
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl<D: BlockDevice> Drop for BlockRef<'_, D> {
    fn drop(&mut self) {
        self.cache.release(self.lba, self.dirty);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::RamDisk;

    #[test]
    fn references_share_one_buffer() {
        let cache = BlockCache::new(RamDisk::new(16 * 1024), 1024, 8).unwrap();
        let mut a = cache.get(3).unwrap();
        let b = cache.get(3).unwrap();
        assert_eq!(cache.ref_count(3), 2);

        a.data_mut()[10] = 0x5a;
        assert_eq!(b.data()[10], 0x5a);

        drop(a);
        drop(b);
        assert_eq!(cache.ref_count(3), 0);
        assert_eq!(cache.live_refs(), 0);
    }

    #[test]
    fn dirty_blocks_reach_device_on_flush() {
        let cache = BlockCache::new(RamDisk::new(8 * 1024), 2048, 8).unwrap();
        {
            let mut block = cache.get(1).unwrap();
            block.data_mut()[0..4].copy_from_slice(b"ext4");
        }
        let disk = cache.into_device().unwrap();
        assert_eq!(&disk.as_bytes()[2048..2052], b"ext4");
    }

    #[test]
    fn clean_release_does_not_write() {
        let mut disk = RamDisk::new(4096);
        disk.as_bytes_mut()[1024] = 7;
        let cache = BlockCache::new(disk, 1024, 4).unwrap();
        {
            let block = cache.get(1).unwrap();
            assert_eq!(block.data()[0], 7);
        }
        let disk = cache.into_device().unwrap();
        assert_eq!(disk.as_bytes()[1024], 7);
    }

    #[test]
    fn eviction_writes_back_dirty_victim() {
        let cache = BlockCache::new(RamDisk::new(8 * 1024), 1024, 2).unwrap();
        {
            let mut block = cache.get(0).unwrap();
            block.data_mut()[0] = 1;
        }
        drop(cache.get(1).unwrap());
        drop(cache.get(2).unwrap());
        // block 0 was least recently used and has been evicted
        let block = cache.get(0).unwrap();
        assert_eq!(block.data()[0], 1);
    }

    #[test]
    fn read_only_cache_never_writes() {
        let mut cache = BlockCache::new(RamDisk::new(8 * 1024), 1024, 2).unwrap();
        cache.set_read_only(true);
        {
            let mut block = cache.get(0).unwrap();
            block.data_mut()[0] = 1;
        }
        drop(cache.get(1).unwrap());
        drop(cache.get(2).unwrap());
        // the evicted change is gone
        assert_eq!(cache.get(0).unwrap().data()[0], 0);
        {
            let mut block = cache.get(3).unwrap();
            block.data_mut()[0] = 2;
        }
        let disk = cache.into_device().unwrap();
        assert!(disk.as_bytes().iter().all(|b| *b == 0));
    }

    #[test]
    fn zeroed_block_starts_dirty() {
        let mut disk = RamDisk::new(4096);
        disk.as_bytes_mut()[2048..3072].fill(0xff);
        let cache = BlockCache::new(disk, 1024, 4).unwrap();
        {
            let block = cache.get_zeroed(2).unwrap();
            assert!(block.is_dirty());
            assert!(block.data().iter().all(|b| *b == 0));
        }
        let disk = cache.into_device().unwrap();
        assert!(disk.as_bytes()[2048..3072].iter().all(|b| *b == 0));
    }

    #[test]
    fn block_size_must_cover_whole_sectors() {
        let disk = RamDisk::with_sector_size(8192, 4096);
        assert!(matches!(
            BlockCache::new(disk, 1024, 4),
            Err(BlockDevError::InvalidBlockSize { .. })
        ));
    }
}
