//! Inode I/O, data-block addressing, and the indirection machinery.
//!
//! Logical block `k` maps through the classic ext2 scheme: 12 direct
//! slots, then single, double, and triple indirection (`N` pointers per
//! block, `N = block_size / 4`). Appends allocate a level's metadata
//! block exactly when its local index is 0 and removals free it the
//! same way, so `i_blocks` always equals what the file size implies:
//! files never have holes.

use ferrox_abi::fs::{mode_is_directory, mode_is_regular, mode_is_symlink};
use ferrox_abi::{Errno, KResult};

use crate::blockcache;

use super::disk::{
    self, DIND_BLOCK, DiskInode, FILE_MAX_SIZE, IND_BLOCK, MAX_INLINE_SYMLINK, NDIR_BLOCKS,
    TIND_BLOCK,
};
use super::{Ext2FileSystem, now};

// =============================================================================
// Raw inode table access
// =============================================================================

fn inode_location(fs: &Ext2FileSystem, index: u32) -> KResult<(u32, usize)> {
    if index == 0 || index > fs.sb.inodes_count {
        return Err(Errno::EINVAL);
    }
    let position = index - 1;
    let group = (position / fs.sb.inodes_per_group) as usize;
    let within_group = position % fs.sb.inodes_per_group;
    if group >= fs.group_count {
        return Err(Errno::EIO);
    }
    let byte = within_group as u64 * fs.sb.inode_size as u64;
    let block = fs.groups[group].inode_table + (byte / fs.block_size as u64) as u32;
    let offset = (byte % fs.block_size as u64) as usize;
    Ok((block, offset))
}

pub fn read_inode(fs: &Ext2FileSystem, index: u32) -> KResult<DiskInode> {
    let (block, offset) = inode_location(fs, index)?;
    let buffer = fs.read_fs_block(block)?;
    let inode = disk::parse_inode(&buffer.bytes()[offset..offset + fs.sb.inode_size as usize]);
    blockcache::release_reservation(buffer, false);
    Ok(inode)
}

pub fn write_inode(fs: &Ext2FileSystem, index: u32, inode: &DiskInode) -> KResult<()> {
    let (block, offset) = inode_location(fs, index)?;
    let mut buffer = fs.read_fs_block(block)?;
    disk::encode_inode(
        &mut buffer.bytes_mut()[offset..offset + fs.sb.inode_size as usize],
        inode,
    );
    blockcache::release_reservation(buffer, true);
    Ok(())
}

// =============================================================================
// Block count arithmetic
// =============================================================================

#[inline]
fn pointers_per_block(block_size: u32) -> u64 {
    (block_size / 4) as u64
}

pub fn data_blocks_for_size(block_size: u32, size: u64) -> u64 {
    size.div_ceil(block_size as u64)
}

/// Blocks needed to represent `size` bytes, indirection metadata
/// included.
pub fn total_blocks_for_size(block_size: u32, size: u64) -> u64 {
    let n = pointers_per_block(block_size);
    let data = data_blocks_for_size(block_size, size);
    let mut total = data;
    if data > NDIR_BLOCKS as u64 {
        let single = data - NDIR_BLOCKS as u64;
        total += 1;
        if single > n {
            let double = single - n;
            total += 1 + double.div_ceil(n);
            if double > n * n {
                let triple = double - n * n;
                total += 1 + triple.div_ceil(n * n) + triple.div_ceil(n);
            }
        }
    }
    total
}

// =============================================================================
// Pointer-block helpers
// =============================================================================

fn read_ptr(fs: &Ext2FileSystem, table: u32, index: usize) -> KResult<u32> {
    let buffer = fs.read_fs_block(table)?;
    let value = disk::le32(buffer.bytes(), index * 4);
    blockcache::release_reservation(buffer, false);
    Ok(value)
}

fn write_ptr(fs: &Ext2FileSystem, table: u32, index: usize, value: u32) -> KResult<()> {
    let mut buffer = fs.read_fs_block(table)?;
    disk::put32(buffer.bytes_mut(), index * 4, value);
    blockcache::release_reservation(buffer, true);
    Ok(())
}

/// Allocate a block and zero it through the cache (no device read).
fn alloc_zeroed_block(fs: &mut Ext2FileSystem) -> KResult<u32> {
    let block = super::alloc::acquire_block(fs)?;
    let mut buffer = match fs.reserve_fs_block(block) {
        Ok(buffer) => buffer,
        Err(e) => {
            super::alloc::release_block(fs, block);
            return Err(e);
        }
    };
    buffer.bytes_mut().fill(0);
    blockcache::release_reservation(buffer, true);
    Ok(block)
}

// =============================================================================
// Addressing
// =============================================================================

/// Map a logical block index to its on-disk block id (0 for a hole).
pub fn get_data_block_id(fs: &Ext2FileSystem, inode: &DiskInode, logical: u32) -> KResult<u32> {
    let n = pointers_per_block(fs.block_size);
    let k = logical as u64;
    if k < NDIR_BLOCKS as u64 {
        return Ok(inode.block[logical as usize]);
    }
    let k = k - NDIR_BLOCKS as u64;
    if k < n {
        let table = inode.block[IND_BLOCK];
        if table == 0 {
            return Ok(0);
        }
        return read_ptr(fs, table, k as usize);
    }
    let k = k - n;
    if k < n * n {
        let table = inode.block[DIND_BLOCK];
        if table == 0 {
            return Ok(0);
        }
        let inner = read_ptr(fs, table, (k / n) as usize)?;
        if inner == 0 {
            return Ok(0);
        }
        return read_ptr(fs, inner, (k % n) as usize);
    }
    let k = k - n * n;
    if k < n * n * n {
        let table = inode.block[TIND_BLOCK];
        if table == 0 {
            return Ok(0);
        }
        let double = read_ptr(fs, table, (k / (n * n)) as usize)?;
        if double == 0 {
            return Ok(0);
        }
        let single = read_ptr(fs, double, ((k / n) % n) as usize)?;
        if single == 0 {
            return Ok(0);
        }
        return read_ptr(fs, single, (k % n) as usize);
    }
    Err(Errno::EFBIG)
}

/// Wire `data_block` at `index` of an indirection `table` with `level`
/// pointer hops remaining. Allocates the level's metadata block when
/// `index == 0`; failures release whatever this level allocated.
/// Returns how many metadata blocks were allocated.
fn append_indirect(
    fs: &mut Ext2FileSystem,
    table: &mut u32,
    level: u32,
    index: u64,
    data_block: u32,
) -> KResult<u32> {
    let mut allocated = 0u32;
    if index == 0 {
        debug_assert_eq!(*table, 0);
        *table = alloc_zeroed_block(fs)?;
        allocated = 1;
    }

    let unwind = |fs: &mut Ext2FileSystem, table: &mut u32, allocated: u32| {
        if allocated > 0 {
            let t = *table;
            *table = 0;
            super::alloc::release_block(fs, t);
        }
    };

    if level == 1 {
        if let Err(e) = write_ptr(fs, *table, index as usize, data_block) {
            unwind(fs, table, allocated);
            return Err(e);
        }
        return Ok(allocated);
    }

    let per = pointers_per_block(fs.block_size).pow(level - 1);
    let outer = (index / per) as usize;
    let inner = index % per;
    let mut inner_table = if inner == 0 {
        0
    } else {
        match read_ptr(fs, *table, outer) {
            Ok(t) => t,
            Err(e) => {
                unwind(fs, table, allocated);
                return Err(e);
            }
        }
    };

    match append_indirect(fs, &mut inner_table, level - 1, inner, data_block) {
        Ok(below) => {
            if inner == 0 {
                if let Err(e) = write_ptr(fs, *table, outer, inner_table) {
                    super::alloc::release_block(fs, inner_table);
                    unwind(fs, table, allocated);
                    return Err(e);
                }
            }
            Ok(allocated + below)
        }
        Err(e) => {
            unwind(fs, table, allocated);
            Err(e)
        }
    }
}

/// Detach the entry at `index`, freeing the level's metadata block once
/// its first slot goes. Returns (block id that was stored, metadata
/// blocks freed).
fn remove_indirect(
    fs: &mut Ext2FileSystem,
    table: &mut u32,
    level: u32,
    index: u64,
) -> KResult<(u32, u32)> {
    let mut freed = 0u32;
    let value;

    if level == 1 {
        value = read_ptr(fs, *table, index as usize)?;
        write_ptr(fs, *table, index as usize, 0)?;
    } else {
        let per = pointers_per_block(fs.block_size).pow(level - 1);
        let outer = (index / per) as usize;
        let inner = index % per;
        let mut inner_table = read_ptr(fs, *table, outer)?;
        let (below_value, below_freed) = remove_indirect(fs, &mut inner_table, level - 1, inner)?;
        value = below_value;
        freed += below_freed;
        if inner == 0 {
            write_ptr(fs, *table, outer, 0)?;
        }
    }

    if index == 0 {
        let t = *table;
        *table = 0;
        super::alloc::release_block(fs, t);
        freed += 1;
    }
    Ok((value, freed))
}

/// Allocate and wire the next logical block `k`; the new data block
/// reads as zeros. Updates `inode.blocks` for data plus metadata.
pub fn append_data_block(fs: &mut Ext2FileSystem, inode: &mut DiskInode, k: u64) -> KResult<()> {
    let n = pointers_per_block(fs.block_size);
    let data = alloc_zeroed_block(fs)?;

    let wired = if k < NDIR_BLOCKS as u64 {
        inode.block[k as usize] = data;
        Ok(0)
    } else if k < NDIR_BLOCKS as u64 + n {
        let mut table = inode.block[IND_BLOCK];
        let result = append_indirect(fs, &mut table, 1, k - NDIR_BLOCKS as u64, data);
        inode.block[IND_BLOCK] = table;
        result
    } else if k < NDIR_BLOCKS as u64 + n + n * n {
        let mut table = inode.block[DIND_BLOCK];
        let result = append_indirect(fs, &mut table, 2, k - NDIR_BLOCKS as u64 - n, data);
        inode.block[DIND_BLOCK] = table;
        result
    } else if k < NDIR_BLOCKS as u64 + n + n * n + n * n * n {
        let mut table = inode.block[TIND_BLOCK];
        let result = append_indirect(fs, &mut table, 3, k - NDIR_BLOCKS as u64 - n - n * n, data);
        inode.block[TIND_BLOCK] = table;
        result
    } else {
        Err(Errno::EFBIG)
    };

    match wired {
        Ok(metadata) => {
            inode.blocks += fs.sectors_per_block * (1 + metadata);
            Ok(())
        }
        Err(e) => {
            super::alloc::release_block(fs, data);
            Err(e)
        }
    }
}

/// Unwire and free the last logical block `k`.
pub fn remove_data_block(fs: &mut Ext2FileSystem, inode: &mut DiskInode, k: u64) -> KResult<()> {
    let n = pointers_per_block(fs.block_size);
    let (data, metadata_freed) = if k < NDIR_BLOCKS as u64 {
        let data = inode.block[k as usize];
        inode.block[k as usize] = 0;
        (data, 0)
    } else if k < NDIR_BLOCKS as u64 + n {
        let mut table = inode.block[IND_BLOCK];
        let result = remove_indirect(fs, &mut table, 1, k - NDIR_BLOCKS as u64)?;
        inode.block[IND_BLOCK] = table;
        result
    } else if k < NDIR_BLOCKS as u64 + n + n * n {
        let mut table = inode.block[DIND_BLOCK];
        let result = remove_indirect(fs, &mut table, 2, k - NDIR_BLOCKS as u64 - n)?;
        inode.block[DIND_BLOCK] = table;
        result
    } else {
        let mut table = inode.block[TIND_BLOCK];
        let result = remove_indirect(fs, &mut table, 3, k - NDIR_BLOCKS as u64 - n - n * n)?;
        inode.block[TIND_BLOCK] = table;
        result
    };

    if data != 0 {
        super::alloc::release_block(fs, data);
    }
    inode.blocks = inode
        .blocks
        .saturating_sub(fs.sectors_per_block * (1 + metadata_freed));
    Ok(())
}

// =============================================================================
// Data transfer
// =============================================================================

pub fn read_data(
    fs: &Ext2FileSystem,
    inode: &DiskInode,
    offset: u64,
    buf: &mut [u8],
) -> KResult<usize> {
    let size = inode.size as u64;
    if offset >= size || buf.is_empty() {
        return Ok(0);
    }
    let total = core::cmp::min(buf.len() as u64, size - offset) as usize;
    let bs = fs.block_size as u64;
    let mut done = 0usize;
    while done < total {
        let position = offset + done as u64;
        let k = (position / bs) as u32;
        let within = (position % bs) as usize;
        let chunk = core::cmp::min(total - done, fs.block_size as usize - within);
        let block = get_data_block_id(fs, inode, k)?;
        if block == 0 {
            buf[done..done + chunk].fill(0);
        } else {
            let buffer = fs.read_fs_block(block)?;
            buf[done..done + chunk].copy_from_slice(&buffer.bytes()[within..within + chunk]);
            blockcache::release_reservation(buffer, false);
        }
        done += chunk;
    }
    Ok(total)
}

/// Write `source` at `offset`, growing the file as needed. A `None`
/// source writes zeros; since fresh blocks are zeroed at allocation,
/// only the wiring work remains for that case.
pub fn do_write(
    fs: &mut Ext2FileSystem,
    slot: u16,
    offset: u64,
    source: Option<&[u8]>,
    len: usize,
) -> KResult<usize> {
    let mut inode = fs.cache.slots[slot as usize].disk;
    if mode_is_directory(inode.mode) {
        return Err(Errno::EISDIR);
    }
    if !mode_is_regular(inode.mode) {
        return Err(Errno::EPERM);
    }
    if len == 0 {
        return Ok(0);
    }
    if offset >= FILE_MAX_SIZE {
        return Err(Errno::EFBIG);
    }
    let end = core::cmp::min(offset + len as u64, FILE_MAX_SIZE);
    let len = (end - offset) as usize;
    if len == 0 {
        return Err(Errno::EFBIG);
    }

    grow_blocks(fs, &mut inode, end)?;

    if let Some(source) = source {
        let bs = fs.block_size as u64;
        let mut done = 0usize;
        while done < len {
            let position = offset + done as u64;
            let k = (position / bs) as u32;
            let within = (position % bs) as usize;
            let chunk = core::cmp::min(len - done, fs.block_size as usize - within);
            let block = get_data_block_id(fs, &inode, k)?;
            debug_assert!(block != 0);
            let mut buffer = fs.read_fs_block(block)?;
            buffer.bytes_mut()[within..within + chunk]
                .copy_from_slice(&source[done..done + chunk]);
            blockcache::release_reservation(buffer, true);
            done += chunk;
        }
    }

    if end > inode.size as u64 {
        inode.size = end as u32;
    }
    inode.mtime = now();
    let entry = &mut fs.cache.slots[slot as usize];
    entry.disk = inode;
    entry.dirty = true;
    Ok(len)
}

/// Ensure every data block up to `end` bytes exists; rolls freshly
/// appended blocks back on failure so size and `i_blocks` stay
/// consistent.
fn grow_blocks(fs: &mut Ext2FileSystem, inode: &mut DiskInode, end: u64) -> KResult<()> {
    let have = data_blocks_for_size(fs.block_size, inode.size as u64);
    let need = data_blocks_for_size(fs.block_size, end);
    for k in have..need {
        if let Err(e) = append_data_block(fs, inode, k) {
            for undo in (have..k).rev() {
                let _ = remove_data_block(fs, inode, undo);
            }
            return Err(e);
        }
    }
    Ok(())
}

pub fn change_size(fs: &mut Ext2FileSystem, slot: u16, new_size: u64) -> KResult<()> {
    if new_size > FILE_MAX_SIZE {
        return Err(Errno::EFBIG);
    }
    let mut inode = fs.cache.slots[slot as usize].disk;
    if mode_is_directory(inode.mode) {
        return Err(Errno::EISDIR);
    }
    if !mode_is_regular(inode.mode) {
        return Err(Errno::EPERM);
    }

    let old_size = inode.size as u64;
    if new_size > old_size {
        grow_blocks(fs, &mut inode, new_size)?;
    } else if new_size < old_size {
        let keep = data_blocks_for_size(fs.block_size, new_size);
        let have = data_blocks_for_size(fs.block_size, old_size);
        for k in (keep..have).rev() {
            remove_data_block(fs, &mut inode, k)?;
        }
        // The retained tail must read as zeros if the file grows again.
        let within = (new_size % fs.block_size as u64) as usize;
        if within != 0 {
            let block = get_data_block_id(fs, &inode, (keep - 1) as u32)?;
            if block != 0 {
                let mut buffer = fs.read_fs_block(block)?;
                buffer.bytes_mut()[within..].fill(0);
                blockcache::release_reservation(buffer, true);
            }
        }
    }

    inode.size = new_size as u32;
    inode.mtime = now();
    let entry = &mut fs.cache.slots[slot as usize];
    entry.disk = inode;
    entry.dirty = true;
    Ok(())
}

/// Release every data and indirection block (unlinked-inode teardown).
pub fn free_all_blocks(fs: &mut Ext2FileSystem, slot: u16) -> KResult<()> {
    let mut inode = fs.cache.slots[slot as usize].disk;
    if mode_is_symlink(inode.mode) && (inode.size as usize) <= MAX_INLINE_SYMLINK {
        return Ok(());
    }
    let count = data_blocks_for_size(fs.block_size, inode.size as u64);
    for k in (0..count).rev() {
        remove_data_block(fs, &mut inode, k)?;
    }
    fs.cache.slots[slot as usize].disk = inode;
    Ok(())
}

// =============================================================================
// Symbolic links
// =============================================================================

pub fn read_symlink(fs: &Ext2FileSystem, slot: u16, out: &mut [u8]) -> KResult<usize> {
    let inode = fs.cache.slots[slot as usize].disk;
    if !mode_is_symlink(inode.mode) {
        return Err(Errno::EINVAL);
    }
    let len = inode.size as usize;
    if len > out.len() {
        return Err(Errno::ENAMETOOLONG);
    }
    if len <= MAX_INLINE_SYMLINK {
        out[..len].copy_from_slice(&inode.inline_bytes()[..len]);
        return Ok(len);
    }
    let mut done = 0usize;
    let bs = fs.block_size as usize;
    while done < len {
        let block = get_data_block_id(fs, &inode, (done / bs) as u32)?;
        if block == 0 {
            return Err(Errno::EIO);
        }
        let chunk = core::cmp::min(len - done, bs);
        let buffer = fs.read_fs_block(block)?;
        out[done..done + chunk].copy_from_slice(&buffer.bytes()[..chunk]);
        blockcache::release_reservation(buffer, false);
        done += chunk;
    }
    Ok(len)
}
