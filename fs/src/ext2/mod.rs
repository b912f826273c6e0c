//! The ext2 filesystem driver.
//!
//! Rev 1 on-disk format, FILETYPE directories, sparse-super plus
//! large-file read-only features. All device access goes through the
//! block cache; inodes are cached in a bounded pool (see `cache`).
//! Writes are synchronous into the cache and reach the device on flush
//! or unmount (no journalling).

pub mod alloc;
pub mod cache;
pub mod dir;
pub mod disk;
pub mod inode;

use ferrox_abi::fs::{Dirent, Stat, mode_is_directory};
use ferrox_abi::{Errno, KResult, PAGE_SIZE};
use ferrox_lib::IrqMutex;
use ferrox_lib::kernel_services::platform::wall_clock_seconds;
use ferrox_lib::klog_info;

use crate::blockcache::{self, BlockRef};
use crate::blockdev::{DeviceId, device_block_size};
use crate::vfs::mount;
use crate::vfs::node::{NodeId, NodeKind, alloc_node, reserve_node};

use cache::{INODE_CACHE_SLOTS, InodeCache, SlotLinks};
use disk::{GroupDescriptor, SuperBlock};

pub const MAX_EXT2_INSTANCES: usize = 2;
pub const MAX_GROUPS: usize = 64;

pub(crate) fn now() -> u32 {
    wall_clock_seconds()
}

pub struct Ext2FileSystem {
    pub(crate) device: DeviceId,
    pub(crate) block_size: u32,
    pub(crate) sectors_per_block: u32,
    pub(crate) sb: SuperBlock,
    pub(crate) sb_dirty: bool,
    pub(crate) groups: [GroupDescriptor; MAX_GROUPS],
    pub(crate) group_count: usize,
    pub(crate) groups_dirty: u64,
    pub(crate) cache: InodeCache,
}

impl Ext2FileSystem {
    pub(crate) fn read_fs_block(&self, block: u32) -> KResult<BlockRef> {
        blockcache::read_and_reserve(
            self.device,
            block * self.sectors_per_block,
            self.sectors_per_block as u16,
        )
    }

    /// Pin without reading; for full-block overwrites.
    pub(crate) fn reserve_fs_block(&self, block: u32) -> KResult<BlockRef> {
        blockcache::reserve(
            self.device,
            block * self.sectors_per_block,
            self.sectors_per_block as u16,
        )
    }
}

struct Ext2Table {
    instances: [Option<Ext2FileSystem>; MAX_EXT2_INSTANCES],
}

static EXT2: IrqMutex<Ext2Table> = IrqMutex::new(Ext2Table {
    instances: [const { None }; MAX_EXT2_INSTANCES],
});

fn with_fs<R>(fs_id: u8, f: impl FnOnce(&mut Ext2FileSystem) -> KResult<R>) -> KResult<R> {
    let mut table = EXT2.lock();
    let fs = table
        .instances
        .get_mut(fs_id as usize)
        .and_then(|i| i.as_mut())
        .ok_or(Errno::EIO)?;
    f(fs)
}

// =============================================================================
// Mount / unmount
// =============================================================================

fn validate_superblock(sb: &SuperBlock) -> KResult<u32> {
    if sb.magic != disk::EXT2_SUPER_MAGIC || sb.rev_level < disk::EXT2_DYNAMIC_REV {
        return Err(Errno::EINVAL);
    }
    if sb.state != disk::EXT2_VALID_FS {
        return Err(Errno::EPERM);
    }
    if sb.feature_incompat & !disk::FEATURE_INCOMPAT_FILETYPE != 0
        || sb.feature_incompat & disk::FEATURE_INCOMPAT_FILETYPE == 0
    {
        return Err(Errno::EPERM);
    }
    let required =
        disk::FEATURE_RO_COMPAT_SPARSE_SUPER | disk::FEATURE_RO_COMPAT_LARGE_FILE;
    if sb.feature_ro_compat & required != required
        || sb.feature_ro_compat & disk::FEATURE_RO_COMPAT_BTREE_DIR != 0
    {
        return Err(Errno::EPERM);
    }
    if sb.log_frag_size != sb.log_block_size {
        return Err(Errno::EPERM);
    }
    let block_size = 1024u32
        .checked_shl(sb.log_block_size)
        .ok_or(Errno::EINVAL)?;
    if block_size as usize > PAGE_SIZE {
        return Err(Errno::EPERM);
    }
    if sb.blocks_per_group == 0 || sb.inodes_per_group == 0 {
        return Err(Errno::EINVAL);
    }
    Ok(block_size)
}

/// Mount the ext2 volume on `device` at `prefix`.
pub fn mount_device(device: DeviceId, prefix: &[u8]) -> KResult<()> {
    let dev_bs = device_block_size(device)?;
    let (buffer, _) = blockcache::read_and_reserve_by_offset(
        device,
        disk::EXT2_SUPERBLOCK_OFFSET,
        (1024 / dev_bs) as u16,
    )?;
    let sb = disk::parse_superblock(buffer.bytes());
    blockcache::release_reservation(buffer, false);

    let block_size = validate_superblock(&sb)?;
    let sectors_per_block = block_size / dev_bs;
    let group_count = (sb.blocks_count - sb.first_data_block)
        .div_ceil(sb.blocks_per_group) as usize;
    if group_count > MAX_GROUPS {
        return Err(Errno::ENOMEM);
    }
    let inode_size = if sb.rev_level >= disk::EXT2_DYNAMIC_REV {
        sb.inode_size
    } else {
        disk::EXT2_GOOD_OLD_INODE_SIZE
    };
    if inode_size == 0 || inode_size as u32 > block_size {
        return Err(Errno::EINVAL);
    }

    let fs_id = {
        let table = EXT2.lock();
        table
            .instances
            .iter()
            .position(|i| i.is_none())
            .ok_or(Errno::ENOMEM)? as u8
    };

    let mut fs = Ext2FileSystem {
        device,
        block_size,
        sectors_per_block,
        sb: SuperBlock { inode_size, ..sb },
        sb_dirty: false,
        groups: [GroupDescriptor::default(); MAX_GROUPS],
        group_count,
        groups_dirty: 0,
        cache: InodeCache::new(),
    };

    // Group descriptor table: the block after the superblock.
    let table_block = sb.first_data_block + 1;
    for group in 0..group_count {
        let byte = group * disk::GROUP_DESC_SIZE;
        let block = table_block + (byte as u32 / block_size);
        let within = byte % block_size as usize;
        let buffer = fs.read_fs_block(block)?;
        fs.groups[group] = disk::parse_group_descriptor(&buffer.bytes()[within..]);
        blockcache::release_reservation(buffer, false);
    }

    // Pair every cache slot with its arena node up front.
    for slot in 0..INODE_CACHE_SLOTS as u16 {
        let node = alloc_node(NodeKind::Ext2 { fs: fs_id, slot })?;
        fs.cache.slots[slot as usize].node = node;
        let mut available = fs.cache.available;
        available.push_back(&mut SlotLinks(&mut fs.cache.slots), slot);
        fs.cache.available = available;
    }

    {
        let mut table = EXT2.lock();
        table.instances[fs_id as usize] = Some(fs);
    }

    let root = with_fs(fs_id, |fs| {
        let slot = cache::get_by_index(fs, disk::EXT2_ROOT_INODE)?;
        Ok(fs.cache.slots[slot as usize].node)
    })?;
    reserve_node(root);
    mount::mount(prefix, root)?;
    klog_info!(
        "ext2: mounted device {} at {} ({} groups, {} byte blocks)",
        device,
        core::str::from_utf8(prefix).unwrap_or("?"),
        group_count,
        block_size
    );
    Ok(())
}

/// Flush every instance's dirty inodes and metadata (primary plus
/// sparse-super backups), then write the block cache out.
pub fn unmount_all() -> KResult<()> {
    let mut result: KResult<()> = Ok(());
    for fs_id in 0..MAX_EXT2_INSTANCES as u8 {
        let exists = EXT2.lock().instances[fs_id as usize].is_some();
        if !exists {
            continue;
        }
        let flush = with_fs(fs_id, |fs| {
            let mut inner: KResult<()> = Ok(());
            ferrox_abi::errno::retain_first_failure(&mut inner, cache::flush_dirty(fs));
            ferrox_abi::errno::retain_first_failure(&mut inner, alloc::write_metadata(fs));
            inner
        });
        ferrox_abi::errno::retain_first_failure(&mut result, flush);
    }
    ferrox_abi::errno::retain_first_failure(&mut result, blockcache::flush());
    result
}

// =============================================================================
// Node-dispatch surface
// =============================================================================

pub fn walk(
    fs_id: u8,
    dir_slot: u16,
    name: &[u8],
    create_mode: Option<u16>,
) -> KResult<(NodeId, bool)> {
    let (node, created) = with_fs(fs_id, |fs| dir::walk_step(fs, dir_slot, name, create_mode))?;
    // Nothing can run between the lookup and this reservation; the
    // kernel is single-context.
    reserve_node(node);
    Ok((node, created))
}

pub fn open_check(fs_id: u8, slot: u16) -> KResult<()> {
    // Hole and block-count validation already ran when the inode entered
    // the cache; an open adds nothing further.
    with_fs(fs_id, |fs| {
        let _ = &fs.cache.slots[slot as usize];
        Ok(())
    })
}

pub fn read(fs_id: u8, slot: u16, offset: u64, buf: &mut [u8]) -> KResult<usize> {
    with_fs(fs_id, |fs| {
        let inode = fs.cache.slots[slot as usize].disk;
        if mode_is_directory(inode.mode) {
            return Err(Errno::EISDIR);
        }
        inode::read_data(fs, &inode, offset, buf)
    })
}

pub fn write(fs_id: u8, slot: u16, offset: u64, buf: &[u8]) -> KResult<usize> {
    with_fs(fs_id, |fs| inode::do_write(fs, slot, offset, Some(buf), buf.len()))
}

pub fn read_directory_entry(
    fs_id: u8,
    slot: u16,
    position: &mut u64,
    out: &mut Dirent,
) -> KResult<bool> {
    with_fs(fs_id, |fs| dir::read_directory_entry(fs, slot, position, out))
}

pub fn status(fs_id: u8, slot: u16, out: &mut Stat) -> KResult<()> {
    with_fs(fs_id, |fs| {
        let entry = &fs.cache.slots[slot as usize];
        *out = Stat {
            st_ino: entry.index,
            st_mode: entry.disk.mode,
            st_nlink: entry.disk.links_count,
            st_size: entry.disk.size,
            st_blocks: entry.disk.blocks,
            st_atime: entry.disk.atime,
            st_mtime: entry.disk.mtime,
            st_ctime: entry.disk.ctime,
        };
        Ok(())
    })
}

pub fn mode(fs_id: u8, slot: u16) -> KResult<u16> {
    with_fs(fs_id, |fs| Ok(fs.cache.slots[slot as usize].disk.mode))
}

pub fn size(fs_id: u8, slot: u16) -> KResult<u64> {
    with_fs(fs_id, |fs| Ok(fs.cache.slots[slot as usize].disk.size as u64))
}

pub fn change_size(fs_id: u8, slot: u16, new_size: u64) -> KResult<()> {
    with_fs(fs_id, |fs| inode::change_size(fs, slot, new_size))
}

pub fn create_directory(fs_id: u8, parent_slot: u16, name: &[u8], mode: u16) -> KResult<()> {
    with_fs(fs_id, |fs| dir::create_directory(fs, parent_slot, name, mode))
}

pub fn create_name(fs_id: u8, parent_slot: u16, name: &[u8], target_slot: u16) -> KResult<()> {
    with_fs(fs_id, |fs| dir::create_name(fs, parent_slot, name, target_slot))
}

pub fn release_name(fs_id: u8, parent_slot: u16, name: &[u8]) -> KResult<()> {
    with_fs(fs_id, |fs| dir::release_name(fs, parent_slot, name))
}

pub fn release_directory(fs_id: u8, parent_slot: u16, name: &[u8]) -> KResult<()> {
    with_fs(fs_id, |fs| dir::release_directory(fs, parent_slot, name))
}

pub fn create_symbolic_link(
    fs_id: u8,
    parent_slot: u16,
    name: &[u8],
    target: &[u8],
) -> KResult<()> {
    with_fs(fs_id, |fs| dir::create_symbolic_link(fs, parent_slot, name, target))
}

pub fn rename(
    fs_id: u8,
    old_parent_slot: u16,
    old_name: &[u8],
    new_parent_slot: u16,
    new_name: &[u8],
) -> KResult<()> {
    with_fs(fs_id, |fs| {
        dir::rename(fs, old_parent_slot, old_name, new_parent_slot, new_name)
    })
}

pub fn read_symlink(fs_id: u8, slot: u16, out: &mut [u8]) -> KResult<usize> {
    with_fs(fs_id, |fs| inode::read_symlink(fs, slot, out))
}

/// (free blocks, free inodes) as the superblock currently sees them.
pub fn statistics(fs_id: u8) -> KResult<(u32, u32)> {
    with_fs(fs_id, |fs| {
        Ok((fs.sb.free_blocks_count, fs.sb.free_inodes_count))
    })
}

/// After-release hook: the node's last reservation is gone.
pub fn node_reservation_released(fs_id: u8, slot: u16) {
    let _ = with_fs(fs_id, |fs| {
        cache::settle_slot(fs, slot);
        Ok(())
    });
}
