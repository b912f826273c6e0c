//! Linked directory entries and the namespace operations built on them.
//!
//! Records are packed into directory blocks with `rec_len` chains that
//! always land exactly on a block boundary; a zero inode marks a
//! tombstone. Insertion reuses a wide-enough tombstone, splits a live
//! record's slack, or extends the directory by one block.

use ferrox_abi::fs::{
    DT_DIR, DT_LNK, DT_REG, DT_UNKNOWN, Dirent, S_IFDIR, S_IFLNK, mode_is_directory,
};
use ferrox_abi::{Errno, KResult};

use crate::blockcache;
use crate::vfs::node::NodeId;

use super::cache;
use super::disk::{
    self, DIR_ENTRY_HEADER, DiskInode, EXT2_ROOT_INODE, FT_DIR, FT_REG_FILE, FT_SYMLINK,
    MAX_INLINE_SYMLINK, dir_entry_size,
};
use super::{Ext2FileSystem, inode, now};

const NAME_MAX_ON_DISK: usize = 255;

struct RawEntry {
    inode: u32,
    rec_len: usize,
    name_len: usize,
    file_type: u8,
}

fn parse_header(bytes: &[u8], cursor: usize) -> RawEntry {
    RawEntry {
        inode: disk::le32(bytes, cursor),
        rec_len: disk::le16(bytes, cursor + 4) as usize,
        name_len: bytes[cursor + 6] as usize,
        file_type: bytes[cursor + 7],
    }
}

fn entry_is_sane(entry: &RawEntry, cursor: usize, block_size: usize) -> bool {
    entry.rec_len >= DIR_ENTRY_HEADER
        && entry.rec_len % 4 == 0
        && cursor + entry.rec_len <= block_size
        && DIR_ENTRY_HEADER + entry.name_len <= entry.rec_len
}

fn write_entry(bytes: &mut [u8], cursor: usize, index: u32, name: &[u8], ftype: u8, rec_len: usize) {
    disk::put32(bytes, cursor, index);
    disk::put16(bytes, cursor + 4, rec_len as u16);
    bytes[cursor + 6] = name.len() as u8;
    bytes[cursor + 7] = ftype;
    bytes[cursor + DIR_ENTRY_HEADER..cursor + DIR_ENTRY_HEADER + name.len()]
        .copy_from_slice(name);
}

fn file_type_to_dirent(file_type: u8) -> u8 {
    match file_type {
        FT_REG_FILE => DT_REG,
        FT_DIR => DT_DIR,
        FT_SYMLINK => DT_LNK,
        _ => DT_UNKNOWN,
    }
}

// =============================================================================
// Scanning
// =============================================================================

/// Visit live entries of `dir` until the callback returns false.
fn for_each_entry(
    fs: &Ext2FileSystem,
    dir: &DiskInode,
    f: &mut dyn FnMut(u32, u8, &[u8]) -> bool,
) -> KResult<()> {
    let bs = fs.block_size as usize;
    let block_count = inode::data_blocks_for_size(fs.block_size, dir.size as u64);
    for block_index in 0..block_count {
        let block = inode::get_data_block_id(fs, dir, block_index as u32)?;
        if block == 0 {
            return Err(Errno::EIO);
        }
        let buffer = fs.read_fs_block(block)?;
        let bytes = buffer.bytes();
        let mut cursor = 0usize;
        while cursor + DIR_ENTRY_HEADER <= bs {
            let entry = parse_header(bytes, cursor);
            if !entry_is_sane(&entry, cursor, bs) {
                blockcache::release_reservation(buffer, false);
                return Err(Errno::EIO);
            }
            if entry.inode != 0 {
                let name_start = cursor + DIR_ENTRY_HEADER;
                let name = &bytes[name_start..name_start + entry.name_len];
                if !f(entry.inode, entry.file_type, name) {
                    blockcache::release_reservation(buffer, false);
                    return Ok(());
                }
            }
            cursor += entry.rec_len;
        }
        blockcache::release_reservation(buffer, false);
    }
    Ok(())
}

fn find_entry(
    fs: &Ext2FileSystem,
    dir: &DiskInode,
    name: &[u8],
) -> KResult<Option<(u32, u8)>> {
    let mut found = None;
    for_each_entry(fs, dir, &mut |index, ftype, entry_name| {
        if entry_name == name {
            found = Some((index, ftype));
            return false;
        }
        true
    })?;
    Ok(found)
}

/// Advance `position` past one live entry; false at end of directory.
pub fn read_directory_entry(
    fs: &Ext2FileSystem,
    slot: u16,
    position: &mut u64,
    out: &mut Dirent,
) -> KResult<bool> {
    let dir = fs.cache.slots[slot as usize].disk;
    if !mode_is_directory(dir.mode) {
        return Err(Errno::ENOTDIR);
    }
    let bs = fs.block_size as usize;
    while *position < dir.size as u64 {
        let block_index = (*position / fs.block_size as u64) as u32;
        let within = (*position % fs.block_size as u64) as usize;
        let block = inode::get_data_block_id(fs, &dir, block_index)?;
        if block == 0 {
            return Err(Errno::EIO);
        }
        let buffer = fs.read_fs_block(block)?;
        let bytes = buffer.bytes();
        let entry = parse_header(bytes, within);
        if !entry_is_sane(&entry, within, bs) {
            blockcache::release_reservation(buffer, false);
            return Err(Errno::EIO);
        }
        *position += entry.rec_len as u64;
        if entry.inode != 0 {
            let name_start = within + DIR_ENTRY_HEADER;
            out.d_ino = entry.inode;
            out.d_type = file_type_to_dirent(entry.file_type);
            out.d_name_len = entry.name_len as u8;
            out.d_name[..entry.name_len]
                .copy_from_slice(&bytes[name_start..name_start + entry.name_len]);
            blockcache::release_reservation(buffer, false);
            return Ok(true);
        }
        blockcache::release_reservation(buffer, false);
    }
    Ok(false)
}

fn directory_is_empty(fs: &Ext2FileSystem, dir: &DiskInode) -> KResult<bool> {
    let mut empty = true;
    for_each_entry(fs, dir, &mut |_, _, name| {
        if name != b"." && name != b".." {
            empty = false;
            return false;
        }
        true
    })?;
    Ok(empty)
}

// =============================================================================
// Mutation primitives
// =============================================================================

/// Insert a record for `index` named `name`. Strategy order: reuse a
/// tombstone, split a record's slack, extend by one block.
fn insert_entry(
    fs: &mut Ext2FileSystem,
    parent_slot: u16,
    name: &[u8],
    index: u32,
    ftype: u8,
) -> KResult<()> {
    if name.is_empty() || name.len() > NAME_MAX_ON_DISK {
        return Err(Errno::ENAMETOOLONG);
    }
    let needed = dir_entry_size(name.len());
    let bs = fs.block_size as usize;
    let mut parent = fs.cache.slots[parent_slot as usize].disk;
    let block_count = inode::data_blocks_for_size(fs.block_size, parent.size as u64);

    for block_index in 0..block_count {
        let block = inode::get_data_block_id(fs, &parent, block_index as u32)?;
        if block == 0 {
            return Err(Errno::EIO);
        }
        let mut buffer = fs.read_fs_block(block)?;
        let mut cursor = 0usize;
        while cursor + DIR_ENTRY_HEADER <= bs {
            let entry = parse_header(buffer.bytes(), cursor);
            if !entry_is_sane(&entry, cursor, bs) {
                blockcache::release_reservation(buffer, false);
                return Err(Errno::EIO);
            }
            if entry.inode == 0 && entry.rec_len >= needed {
                write_entry(buffer.bytes_mut(), cursor, index, name, ftype, entry.rec_len);
                blockcache::release_reservation(buffer, true);
                return Ok(());
            }
            if entry.inode != 0 {
                let used = dir_entry_size(entry.name_len);
                if entry.rec_len - used >= needed {
                    let remainder = entry.rec_len - used;
                    disk::put16(buffer.bytes_mut(), cursor + 4, used as u16);
                    write_entry(buffer.bytes_mut(), cursor + used, index, name, ftype, remainder);
                    blockcache::release_reservation(buffer, true);
                    return Ok(());
                }
            }
            cursor += entry.rec_len;
        }
        blockcache::release_reservation(buffer, false);
    }

    // Every block is packed: grow the directory by one block holding a
    // single record that spans it.
    inode::append_data_block(fs, &mut parent, block_count)?;
    let block = inode::get_data_block_id(fs, &parent, block_count as u32)?;
    let mut buffer = match fs.reserve_fs_block(block) {
        Ok(buffer) => buffer,
        Err(e) => {
            let _ = inode::remove_data_block(fs, &mut parent, block_count);
            return Err(e);
        }
    };
    buffer.bytes_mut().fill(0);
    write_entry(buffer.bytes_mut(), 0, index, name, ftype, bs);
    blockcache::release_reservation(buffer, true);

    parent.size += fs.block_size;
    parent.mtime = now();
    let entry = &mut fs.cache.slots[parent_slot as usize];
    entry.disk = parent;
    entry.dirty = true;
    Ok(())
}

/// Tombstone the record named `name`; returns the inode it referenced.
fn remove_entry(fs: &mut Ext2FileSystem, parent_slot: u16, name: &[u8]) -> KResult<u32> {
    let bs = fs.block_size as usize;
    let parent = fs.cache.slots[parent_slot as usize].disk;
    let block_count = inode::data_blocks_for_size(fs.block_size, parent.size as u64);

    for block_index in 0..block_count {
        let block = inode::get_data_block_id(fs, &parent, block_index as u32)?;
        if block == 0 {
            return Err(Errno::EIO);
        }
        let mut buffer = fs.read_fs_block(block)?;
        let mut cursor = 0usize;
        while cursor + DIR_ENTRY_HEADER <= bs {
            let entry = parse_header(buffer.bytes(), cursor);
            if !entry_is_sane(&entry, cursor, bs) {
                blockcache::release_reservation(buffer, false);
                return Err(Errno::EIO);
            }
            if entry.inode != 0 {
                let name_start = cursor + DIR_ENTRY_HEADER;
                if &buffer.bytes()[name_start..name_start + entry.name_len] == name {
                    let index = entry.inode;
                    disk::put32(buffer.bytes_mut(), cursor, 0);
                    blockcache::release_reservation(buffer, true);
                    return Ok(index);
                }
            }
            cursor += entry.rec_len;
        }
        blockcache::release_reservation(buffer, false);
    }
    Err(Errno::ENOENT)
}

fn bump_links(fs: &mut Ext2FileSystem, slot: u16, delta: i32) {
    let entry = &mut fs.cache.slots[slot as usize];
    entry.disk.links_count = if delta > 0 {
        entry.disk.links_count.saturating_add(delta as u16)
    } else {
        entry.disk.links_count.saturating_sub((-delta) as u16)
    };
    entry.disk.ctime = now();
    entry.dirty = true;
}

fn adjust_used_dirs(fs: &mut Ext2FileSystem, index: u32, delta: i32) {
    let group = ((index - 1) / fs.sb.inodes_per_group) as usize;
    let count = &mut fs.groups[group].used_dirs_count;
    *count = if delta > 0 {
        count.saturating_add(1)
    } else {
        count.saturating_sub(1)
    };
    fs.groups_dirty |= 1 << group;
}

// =============================================================================
// Walk and create
// =============================================================================

/// One resolution step: look `name` up under the directory at
/// `dir_slot`, creating a regular file when asked and absent. The
/// caller reserves the returned node.
pub fn walk_step(
    fs: &mut Ext2FileSystem,
    dir_slot: u16,
    name: &[u8],
    create_mode: Option<u16>,
) -> KResult<(NodeId, bool)> {
    let dir = fs.cache.slots[dir_slot as usize].disk;
    if !mode_is_directory(dir.mode) {
        return Err(Errno::ENOTDIR);
    }
    if name.len() > NAME_MAX_ON_DISK {
        return Err(Errno::ENAMETOOLONG);
    }

    if let Some((index, _)) = find_entry(fs, &dir, name)? {
        let slot = cache::get_by_index(fs, index)?;
        return Ok((fs.cache.slots[slot as usize].node, false));
    }

    let Some(mode) = create_mode else {
        return Err(Errno::ENOENT);
    };

    let index = super::alloc::acquire_inode(fs)?;
    let new_inode = DiskInode {
        mode,
        links_count: 1,
        atime: now(),
        ctime: now(),
        mtime: now(),
        ..DiskInode::default()
    };
    if let Err(e) = inode::write_inode(fs, index, &new_inode) {
        super::alloc::release_inode(fs, index);
        return Err(e);
    }
    if let Err(e) = insert_entry(fs, dir_slot, name, index, FT_REG_FILE) {
        super::alloc::release_inode(fs, index);
        return Err(e);
    }
    match cache::get_by_index(fs, index) {
        Ok(slot) => Ok((fs.cache.slots[slot as usize].node, true)),
        Err(e) => {
            let _ = remove_entry(fs, dir_slot, name);
            super::alloc::release_inode(fs, index);
            Err(e)
        }
    }
}

pub fn create_directory(
    fs: &mut Ext2FileSystem,
    parent_slot: u16,
    name: &[u8],
    mode: u16,
) -> KResult<()> {
    let parent = fs.cache.slots[parent_slot as usize].disk;
    if !mode_is_directory(parent.mode) {
        return Err(Errno::ENOTDIR);
    }
    if parent.links_count == u16::MAX {
        return Err(Errno::EMLINK);
    }
    if find_entry(fs, &parent, name)?.is_some() {
        return Err(Errno::EEXIST);
    }

    let parent_index = fs.cache.slots[parent_slot as usize].index;
    let index = super::alloc::acquire_inode(fs)?;
    let mut new_dir = DiskInode {
        mode: S_IFDIR | (mode & 0o7777),
        links_count: 2,
        atime: now(),
        ctime: now(),
        mtime: now(),
        ..DiskInode::default()
    };

    let rollback_inode = |fs: &mut Ext2FileSystem| {
        super::alloc::release_inode(fs, index);
    };

    if let Err(e) = inode::append_data_block(fs, &mut new_dir, 0) {
        rollback_inode(fs);
        return Err(e);
    }
    new_dir.size = fs.block_size;

    // Pre-populate `.` and `..`.
    let block = match inode::get_data_block_id(fs, &new_dir, 0) {
        Ok(block) => block,
        Err(e) => {
            let _ = inode::remove_data_block(fs, &mut new_dir, 0);
            rollback_inode(fs);
            return Err(e);
        }
    };
    match fs.reserve_fs_block(block) {
        Ok(mut buffer) => {
            let bs = fs.block_size as usize;
            buffer.bytes_mut().fill(0);
            let dot = dir_entry_size(1);
            write_entry(buffer.bytes_mut(), 0, index, b".", FT_DIR, dot);
            write_entry(buffer.bytes_mut(), dot, parent_index, b"..", FT_DIR, bs - dot);
            blockcache::release_reservation(buffer, true);
        }
        Err(e) => {
            let _ = inode::remove_data_block(fs, &mut new_dir, 0);
            rollback_inode(fs);
            return Err(e);
        }
    }

    if let Err(e) = inode::write_inode(fs, index, &new_dir) {
        let _ = inode::remove_data_block(fs, &mut new_dir, 0);
        rollback_inode(fs);
        return Err(e);
    }
    if let Err(e) = insert_entry(fs, parent_slot, name, index, FT_DIR) {
        let _ = inode::remove_data_block(fs, &mut new_dir, 0);
        rollback_inode(fs);
        return Err(e);
    }

    bump_links(fs, parent_slot, 1);
    adjust_used_dirs(fs, index, 1);
    Ok(())
}

pub fn create_symbolic_link(
    fs: &mut Ext2FileSystem,
    parent_slot: u16,
    name: &[u8],
    target: &[u8],
) -> KResult<()> {
    let parent = fs.cache.slots[parent_slot as usize].disk;
    if !mode_is_directory(parent.mode) {
        return Err(Errno::ENOTDIR);
    }
    if target.is_empty() || target.len() as u32 > fs.block_size {
        return Err(Errno::ENAMETOOLONG);
    }
    if find_entry(fs, &parent, name)?.is_some() {
        return Err(Errno::EEXIST);
    }

    let index = super::alloc::acquire_inode(fs)?;
    let mut link = DiskInode {
        mode: S_IFLNK | 0o777,
        links_count: 1,
        size: target.len() as u32,
        atime: now(),
        ctime: now(),
        mtime: now(),
        ..DiskInode::default()
    };

    if target.len() <= MAX_INLINE_SYMLINK {
        link.set_inline_bytes(target);
    } else {
        if let Err(e) = inode::append_data_block(fs, &mut link, 0) {
            super::alloc::release_inode(fs, index);
            return Err(e);
        }
        let block = inode::get_data_block_id(fs, &link, 0)?;
        match fs.reserve_fs_block(block) {
            Ok(mut buffer) => {
                buffer.bytes_mut().fill(0);
                buffer.bytes_mut()[..target.len()].copy_from_slice(target);
                blockcache::release_reservation(buffer, true);
            }
            Err(e) => {
                let _ = inode::remove_data_block(fs, &mut link, 0);
                super::alloc::release_inode(fs, index);
                return Err(e);
            }
        }
    }

    if let Err(e) = inode::write_inode(fs, index, &link) {
        if target.len() > MAX_INLINE_SYMLINK {
            let _ = inode::remove_data_block(fs, &mut link, 0);
        }
        super::alloc::release_inode(fs, index);
        return Err(e);
    }
    if let Err(e) = insert_entry(fs, parent_slot, name, index, FT_SYMLINK) {
        if target.len() > MAX_INLINE_SYMLINK {
            let _ = inode::remove_data_block(fs, &mut link, 0);
        }
        super::alloc::release_inode(fs, index);
        return Err(e);
    }
    Ok(())
}

// =============================================================================
// Link / unlink / rmdir
// =============================================================================

pub fn create_name(
    fs: &mut Ext2FileSystem,
    parent_slot: u16,
    name: &[u8],
    target_slot: u16,
) -> KResult<()> {
    let parent = fs.cache.slots[parent_slot as usize].disk;
    if !mode_is_directory(parent.mode) {
        return Err(Errno::ENOTDIR);
    }
    let target = fs.cache.slots[target_slot as usize];
    if mode_is_directory(target.disk.mode) {
        return Err(Errno::EPERM);
    }
    if target.disk.links_count == u16::MAX {
        return Err(Errno::EMLINK);
    }
    if find_entry(fs, &parent, name)?.is_some() {
        return Err(Errno::EEXIST);
    }
    insert_entry(
        fs,
        parent_slot,
        name,
        target.index,
        disk::mode_to_dirent_file_type(target.disk.mode),
    )?;
    bump_links(fs, target_slot, 1);
    Ok(())
}

pub fn release_name(fs: &mut Ext2FileSystem, parent_slot: u16, name: &[u8]) -> KResult<()> {
    let parent = fs.cache.slots[parent_slot as usize].disk;
    if !mode_is_directory(parent.mode) {
        return Err(Errno::ENOTDIR);
    }
    let (index, ftype) = find_entry(fs, &parent, name)?.ok_or(Errno::ENOENT)?;
    if ftype == FT_DIR {
        return Err(Errno::EPERM);
    }
    let slot = cache::get_by_index(fs, index)?;
    remove_entry(fs, parent_slot, name)?;
    bump_links(fs, slot, -1);
    // If nothing holds the node, the blocks and inode go now; otherwise
    // cleanup waits for the last reservation.
    cache::settle_slot(fs, slot);
    Ok(())
}

pub fn release_directory(fs: &mut Ext2FileSystem, parent_slot: u16, name: &[u8]) -> KResult<()> {
    if name == b"." || name == b".." {
        return Err(Errno::EINVAL);
    }
    let parent = fs.cache.slots[parent_slot as usize].disk;
    if !mode_is_directory(parent.mode) {
        return Err(Errno::ENOTDIR);
    }
    let (index, ftype) = find_entry(fs, &parent, name)?.ok_or(Errno::ENOENT)?;
    if ftype != FT_DIR {
        return Err(Errno::ENOTDIR);
    }
    let slot = cache::get_by_index(fs, index)?;
    let target = fs.cache.slots[slot as usize].disk;
    if !directory_is_empty(fs, &target)? {
        cache::settle_slot(fs, slot);
        return Err(Errno::ENOTEMPTY);
    }
    remove_entry(fs, parent_slot, name)?;
    bump_links(fs, parent_slot, -1);
    adjust_used_dirs(fs, index, -1);
    // Drop both the parent entry's link and its own `.`.
    let entry = &mut fs.cache.slots[slot as usize];
    entry.disk.links_count = 0;
    entry.disk.ctime = now();
    entry.dirty = true;
    cache::settle_slot(fs, slot);
    Ok(())
}

// =============================================================================
// Rename
// =============================================================================

fn dotdot_of(fs: &Ext2FileSystem, dir_index: u32) -> KResult<u32> {
    let dir = inode::read_inode(fs, dir_index)?;
    let mut parent = None;
    for_each_entry(fs, &dir, &mut |index, _, name| {
        if name == b".." {
            parent = Some(index);
            return false;
        }
        true
    })?;
    parent.ok_or(Errno::EIO)
}

fn rewrite_dotdot(fs: &mut Ext2FileSystem, dir_index: u32, new_parent: u32) -> KResult<()> {
    let dir = inode::read_inode(fs, dir_index)?;
    let bs = fs.block_size as usize;
    let block = inode::get_data_block_id(fs, &dir, 0)?;
    if block == 0 {
        return Err(Errno::EIO);
    }
    let mut buffer = fs.read_fs_block(block)?;
    let mut cursor = 0usize;
    while cursor + DIR_ENTRY_HEADER <= bs {
        let entry = parse_header(buffer.bytes(), cursor);
        if !entry_is_sane(&entry, cursor, bs) {
            break;
        }
        if entry.inode != 0 && entry.name_len == 2 {
            let name_start = cursor + DIR_ENTRY_HEADER;
            if &buffer.bytes()[name_start..name_start + 2] == b".." {
                disk::put32(buffer.bytes_mut(), cursor, new_parent);
                blockcache::release_reservation(buffer, true);
                return Ok(());
            }
        }
        cursor += entry.rec_len;
    }
    blockcache::release_reservation(buffer, false);
    Err(Errno::EIO)
}

/// Intra-filesystem rename. Walking `..` from the destination parent to
/// the root guards against moving a directory under itself; the walk
/// reads inodes directly, so it pins nothing it could leak.
pub fn rename(
    fs: &mut Ext2FileSystem,
    old_parent_slot: u16,
    old_name: &[u8],
    new_parent_slot: u16,
    new_name: &[u8],
) -> KResult<()> {
    let old_parent = fs.cache.slots[old_parent_slot as usize].disk;
    let new_parent = fs.cache.slots[new_parent_slot as usize].disk;
    if !mode_is_directory(old_parent.mode) || !mode_is_directory(new_parent.mode) {
        return Err(Errno::ENOTDIR);
    }
    let old_parent_index = fs.cache.slots[old_parent_slot as usize].index;
    let new_parent_index = fs.cache.slots[new_parent_slot as usize].index;

    let (src_index, src_ftype) = find_entry(fs, &old_parent, old_name)?.ok_or(Errno::ENOENT)?;
    let src_is_dir = src_ftype == FT_DIR;

    if old_parent_index == new_parent_index && old_name == new_name {
        return Ok(());
    }

    if src_is_dir && old_parent_index != new_parent_index {
        // The moved directory's `..` becomes a new link on the
        // destination parent.
        if new_parent.links_count == u16::MAX {
            return Err(Errno::EMLINK);
        }
        let mut cursor = new_parent_index;
        loop {
            if cursor == src_index {
                return Err(Errno::EINVAL);
            }
            if cursor == EXT2_ROOT_INODE {
                break;
            }
            let up = dotdot_of(fs, cursor)?;
            if up == cursor {
                break;
            }
            cursor = up;
        }
    }

    if let Some((dst_index, dst_ftype)) = find_entry(fs, &new_parent, new_name)? {
        if dst_index == src_index {
            return Ok(());
        }
        if dst_ftype == FT_DIR {
            if !src_is_dir {
                return Err(Errno::EISDIR);
            }
            let dst_slot = cache::get_by_index(fs, dst_index)?;
            let dst_dir = fs.cache.slots[dst_slot as usize].disk;
            if !directory_is_empty(fs, &dst_dir)? {
                cache::settle_slot(fs, dst_slot);
                return Err(Errno::ENOTEMPTY);
            }
            remove_entry(fs, new_parent_slot, new_name)?;
            bump_links(fs, new_parent_slot, -1);
            adjust_used_dirs(fs, dst_index, -1);
            let entry = &mut fs.cache.slots[dst_slot as usize];
            entry.disk.links_count = 0;
            entry.dirty = true;
            cache::settle_slot(fs, dst_slot);
        } else {
            if src_is_dir {
                return Err(Errno::ENOTDIR);
            }
            let dst_slot = cache::get_by_index(fs, dst_index)?;
            remove_entry(fs, new_parent_slot, new_name)?;
            bump_links(fs, dst_slot, -1);
            cache::settle_slot(fs, dst_slot);
        }
    }

    // The new name goes in first; tombstoning the old one before a
    // failed insert would orphan the inode.
    insert_entry(fs, new_parent_slot, new_name, src_index, src_ftype)?;
    remove_entry(fs, old_parent_slot, old_name)?;

    if src_is_dir && old_parent_index != new_parent_index {
        rewrite_dotdot(fs, src_index, new_parent_index)?;
        bump_links(fs, old_parent_slot, -1);
        bump_links(fs, new_parent_slot, 1);
    }
    Ok(())
}
