//! The open-inode cache: a bounded pool of in-memory inode objects,
//! indexed by a B-tree and recycled through an available list.
//!
//! Exactly one object exists per (filesystem, inode index) while its
//! node has reservations; objects whose node usage dropped to zero sit
//! on the available list, still indexed, until recycled.

use ferrox_abi::fs::{mode_is_regular, mode_is_symlink};
use ferrox_abi::{Errno, KResult};
use ferrox_lib::btree::BTreeMap;
use ferrox_lib::{LinkArena, ListHead, ListLink, klog_error};

use crate::vfs::node::{NodeId, node_usage};

use super::disk::{DiskInode, MAX_INLINE_SYMLINK};
use super::inode;
use super::{Ext2FileSystem, alloc};

pub const INODE_CACHE_SLOTS: usize = 48;
const MAP_NODES: usize = 64;

#[derive(Copy, Clone)]
pub struct CachedInode {
    /// Inode number; 0 marks an empty slot.
    pub index: u32,
    pub disk: DiskInode,
    pub dirty: bool,
    /// The VFS node permanently paired with this slot.
    pub node: NodeId,
    pub link: ListLink,
}

impl CachedInode {
    pub const fn empty() -> Self {
        Self {
            index: 0,
            disk: DiskInode {
                mode: 0,
                uid: 0,
                size: 0,
                atime: 0,
                ctime: 0,
                mtime: 0,
                dtime: 0,
                gid: 0,
                links_count: 0,
                blocks: 0,
                flags: 0,
                block: [0; super::disk::N_BLOCKS],
            },
            dirty: false,
            node: 0,
            link: ListLink::new(),
        }
    }
}

pub struct SlotLinks<'a>(pub &'a mut [CachedInode; INODE_CACHE_SLOTS]);

impl LinkArena for SlotLinks<'_> {
    fn link(&self, index: u16) -> &ListLink {
        &self.0[index as usize].link
    }
    fn link_mut(&mut self, index: u16) -> &mut ListLink {
        &mut self.0[index as usize].link
    }
}

pub struct InodeCache {
    pub slots: [CachedInode; INODE_CACHE_SLOTS],
    pub map: BTreeMap<MAP_NODES>,
    pub available: ListHead,
}

impl InodeCache {
    pub const fn new() -> Self {
        Self {
            slots: [CachedInode::empty(); INODE_CACHE_SLOTS],
            map: BTreeMap::new(),
            available: ListHead::new(),
        }
    }
}

/// Fetch (or load) the cache object for inode `index` and return its
/// slot. The caller reserves the paired node before anything else can
/// run; the kernel is single-context, so nothing intervenes.
pub fn get_by_index(fs: &mut Ext2FileSystem, index: u32) -> KResult<u16> {
    if index == 0 || index > fs.sb.inodes_count {
        return Err(Errno::EINVAL);
    }

    if let Some(slot) = fs.cache.map.lookup(index) {
        let mut available = fs.cache.available;
        if fs.cache.slots[slot as usize].link.is_linked() {
            available.remove(&mut SlotLinks(&mut fs.cache.slots), slot);
        }
        fs.cache.available = available;
        return Ok(slot);
    }

    let mut available = fs.cache.available;
    let slot = available
        .pop_front(&mut SlotLinks(&mut fs.cache.slots))
        .ok_or(Errno::ENOMEM);
    fs.cache.available = available;
    let slot = slot?;

    let rollback = |fs: &mut Ext2FileSystem, slot: u16| {
        let mut available = fs.cache.available;
        available.push_front(&mut SlotLinks(&mut fs.cache.slots), slot);
        fs.cache.available = available;
    };

    // Recycle: the previous tenant was settled at release time, so it is
    // clean and only its index mapping remains.
    let old_index = fs.cache.slots[slot as usize].index;
    if old_index != 0 {
        fs.cache.map.remove(old_index);
        fs.cache.slots[slot as usize].index = 0;
    }

    let disk = match inode::read_inode(fs, index) {
        Ok(disk) => disk,
        Err(e) => {
            rollback(fs, slot);
            return Err(e);
        }
    };

    // Files with holes are refused outright: the block count must match
    // what the size implies, indirection blocks included.
    if mode_is_regular(disk.mode)
        || (mode_is_symlink(disk.mode) && disk.size as usize > MAX_INLINE_SYMLINK)
    {
        let expected = inode::total_blocks_for_size(fs.block_size, disk.size as u64)
            * fs.sectors_per_block as u64;
        if disk.blocks as u64 != expected {
            rollback(fs, slot);
            return Err(Errno::EPERM);
        }
    }

    if fs.cache.map.insert(index, slot).is_err() {
        rollback(fs, slot);
        return Err(Errno::ENOMEM);
    }

    let entry = &mut fs.cache.slots[slot as usize];
    entry.index = index;
    entry.disk = disk;
    entry.dirty = false;
    Ok(slot)
}

/// Settle a slot whose node may have dropped to zero reservations:
/// write back a dirty inode, or free an unlinked one entirely, then
/// park the slot on the available list.
pub fn settle_slot(fs: &mut Ext2FileSystem, slot: u16) {
    let node = fs.cache.slots[slot as usize].node;
    if node_usage(node) > 0 || fs.cache.slots[slot as usize].link.is_linked() {
        return;
    }

    let index = fs.cache.slots[slot as usize].index;
    if index != 0 {
        if fs.cache.slots[slot as usize].disk.links_count == 0 {
            let result = free_unlinked(fs, slot, index);
            if let Err(e) = result {
                klog_error!("ext2: freeing unlinked inode {} failed: {:?}", index, e);
                panic!("ext2 metadata integrity lost");
            }
            fs.cache.map.remove(index);
            fs.cache.slots[slot as usize].index = 0;
        } else if fs.cache.slots[slot as usize].dirty {
            let disk = fs.cache.slots[slot as usize].disk;
            if let Err(e) = inode::write_inode(fs, index, &disk) {
                klog_error!("ext2: inode {} write-back failed: {:?}", index, e);
                panic!("ext2 metadata integrity lost");
            }
            fs.cache.slots[slot as usize].dirty = false;
        }
    }

    let mut available = fs.cache.available;
    available.push_back(&mut SlotLinks(&mut fs.cache.slots), slot);
    fs.cache.available = available;
}

fn free_unlinked(fs: &mut Ext2FileSystem, slot: u16, index: u32) -> KResult<()> {
    inode::free_all_blocks(fs, slot)?;
    let mut cleared = DiskInode::default();
    cleared.dtime = super::now();
    inode::write_inode(fs, index, &cleared)?;
    alloc::release_inode(fs, index);
    Ok(())
}

/// Write back every dirty cached inode (unmount path).
pub fn flush_dirty(fs: &mut Ext2FileSystem) -> KResult<()> {
    let mut result: KResult<()> = Ok(());
    for slot in 0..INODE_CACHE_SLOTS {
        let entry = fs.cache.slots[slot];
        if entry.index != 0 && entry.dirty {
            let write = inode::write_inode(fs, entry.index, &entry.disk);
            if write.is_ok() {
                fs.cache.slots[slot].dirty = false;
            }
            ferrox_abi::errno::retain_first_failure(&mut result, write);
        }
    }
    result
}
