//! Bitmap allocation for inodes and data blocks, plus the unmount-time
//! metadata write-back (primary and sparse-super backups).

use ferrox_abi::{Errno, KResult};
use ferrox_lib::klog_error;

use crate::blockcache;

use super::Ext2FileSystem;
use super::disk::{self, GROUP_DESC_SIZE};

#[derive(Copy, Clone)]
enum BitmapKind {
    Block,
    Inode,
}

fn bitmap_block(fs: &Ext2FileSystem, group: usize, kind: BitmapKind) -> u32 {
    match kind {
        BitmapKind::Block => fs.groups[group].block_bitmap,
        BitmapKind::Inode => fs.groups[group].inode_bitmap,
    }
}

fn group_free_count(fs: &Ext2FileSystem, group: usize, kind: BitmapKind) -> u16 {
    match kind {
        BitmapKind::Block => fs.groups[group].free_blocks_count,
        BitmapKind::Inode => fs.groups[group].free_inodes_count,
    }
}

fn adjust_counts(fs: &mut Ext2FileSystem, group: usize, kind: BitmapKind, delta: i32) {
    let bump = |value: u16| -> u16 {
        if delta > 0 {
            value.saturating_add(1)
        } else {
            value.saturating_sub(1)
        }
    };
    let bump32 = |value: u32| -> u32 {
        if delta > 0 {
            value.saturating_add(1)
        } else {
            value.saturating_sub(1)
        }
    };
    match kind {
        BitmapKind::Block => {
            fs.groups[group].free_blocks_count = bump(fs.groups[group].free_blocks_count);
            fs.sb.free_blocks_count = bump32(fs.sb.free_blocks_count);
        }
        BitmapKind::Inode => {
            fs.groups[group].free_inodes_count = bump(fs.groups[group].free_inodes_count);
            fs.sb.free_inodes_count = bump32(fs.sb.free_inodes_count);
        }
    }
    fs.groups_dirty |= 1 << group;
    fs.sb_dirty = true;
}

fn per_group(fs: &Ext2FileSystem, kind: BitmapKind) -> u32 {
    match kind {
        BitmapKind::Block => fs.sb.blocks_per_group,
        BitmapKind::Inode => fs.sb.inodes_per_group,
    }
}

fn bit_to_id(fs: &Ext2FileSystem, kind: BitmapKind, group: usize, bit: u32) -> u32 {
    match kind {
        BitmapKind::Block => {
            group as u32 * fs.sb.blocks_per_group + bit + fs.sb.first_data_block
        }
        BitmapKind::Inode => group as u32 * fs.sb.inodes_per_group + bit + 1,
    }
}

fn id_to_bit(fs: &Ext2FileSystem, kind: BitmapKind, id: u32) -> Option<(usize, u32)> {
    match kind {
        BitmapKind::Block => {
            if id < fs.sb.first_data_block || id >= fs.sb.blocks_count {
                return None;
            }
            let base = id - fs.sb.first_data_block;
            Some((
                (base / fs.sb.blocks_per_group) as usize,
                base % fs.sb.blocks_per_group,
            ))
        }
        BitmapKind::Inode => {
            if id == 0 || id > fs.sb.inodes_count {
                return None;
            }
            let base = id - 1;
            Some((
                (base / fs.sb.inodes_per_group) as usize,
                base % fs.sb.inodes_per_group,
            ))
        }
    }
}

fn find_zero_bit(bitmap: &[u8], start: u32, limit: u32) -> Option<u32> {
    let mut bit = start;
    while bit < limit {
        let byte = bitmap[(bit / 8) as usize];
        if byte == 0xFF {
            bit = (bit / 8 + 1) * 8;
            continue;
        }
        if byte & (1 << (bit % 8)) == 0 {
            return Some(bit);
        }
        bit += 1;
    }
    None
}

fn acquire(fs: &mut Ext2FileSystem, kind: BitmapKind) -> KResult<u32> {
    for group in 0..fs.group_count {
        if group_free_count(fs, group, kind) == 0 {
            continue;
        }
        let limit = {
            let per = per_group(fs, kind);
            let total = match kind {
                BitmapKind::Block => fs.sb.blocks_count - fs.sb.first_data_block,
                BitmapKind::Inode => fs.sb.inodes_count,
            };
            core::cmp::min(per, total - core::cmp::min(total, group as u32 * per))
        };
        // Group 0 reserves the low inode numbers for well-known inodes.
        let start = match kind {
            BitmapKind::Inode if group == 0 && fs.sb.first_ino > 0 => fs.sb.first_ino - 1,
            _ => 0,
        };

        let bitmap_blk = bitmap_block(fs, group, kind);
        let mut buffer = fs.read_fs_block(bitmap_blk)?;
        if let Some(bit) = find_zero_bit(buffer.bytes(), start, limit) {
            buffer.bytes_mut()[(bit / 8) as usize] |= 1 << (bit % 8);
            blockcache::release_reservation(buffer, true);
            adjust_counts(fs, group, kind, -1);
            return Ok(bit_to_id(fs, kind, group, bit));
        }
        blockcache::release_reservation(buffer, false);
    }
    Err(Errno::ENOSPC)
}

fn release(fs: &mut Ext2FileSystem, kind: BitmapKind, id: u32) {
    let Some((group, bit)) = id_to_bit(fs, kind, id) else {
        klog_error!("ext2: bitmap release of invalid id {}", id);
        panic!("ext2 metadata integrity lost");
    };
    let bitmap_blk = bitmap_block(fs, group, kind);
    let mut buffer = match fs.read_fs_block(bitmap_blk) {
        Ok(buffer) => buffer,
        Err(e) => {
            // Losing a bitmap read here leaves the allocator blind.
            klog_error!("ext2: bitmap read failed during release: {:?}", e);
            panic!("ext2 metadata integrity lost");
        }
    };
    buffer.bytes_mut()[(bit / 8) as usize] &= !(1 << (bit % 8));
    blockcache::release_reservation(buffer, true);
    adjust_counts(fs, group, kind, 1);
}

pub fn acquire_block(fs: &mut Ext2FileSystem) -> KResult<u32> {
    acquire(fs, BitmapKind::Block)
}

pub fn release_block(fs: &mut Ext2FileSystem, block: u32) {
    release(fs, BitmapKind::Block, block)
}

pub fn acquire_inode(fs: &mut Ext2FileSystem) -> KResult<u32> {
    acquire(fs, BitmapKind::Inode)
}

pub fn release_inode(fs: &mut Ext2FileSystem, inode: u32) {
    release(fs, BitmapKind::Inode, inode)
}

// =============================================================================
// Metadata write-back
// =============================================================================

/// Sparse-super backups live in groups 0, 1, and powers of 3, 5, 7.
pub fn group_has_backup(group: usize) -> bool {
    if group <= 1 {
        return true;
    }
    for base in [3usize, 5, 7] {
        let mut power = base;
        while power <= group {
            if power == group {
                return true;
            }
            power *= base;
        }
    }
    false
}

fn write_superblock_at(fs: &Ext2FileSystem, byte_offset: u64) -> KResult<()> {
    // Read-modify-write: only the mutable fields change, the rest of the
    // primary superblock image is preserved.
    let (mut buffer, _) = blockcache::read_and_reserve_by_offset(
        fs.device,
        byte_offset,
        (1024 / crate::blockdev::device_block_size(fs.device)?) as u16,
    )?;
    let within = (byte_offset as usize) % buffer.bytes().len();
    disk::encode_superblock_updates(&mut buffer.bytes_mut()[within..], &fs.sb);
    blockcache::release_reservation(buffer, true);
    Ok(())
}

fn write_group_descriptors_at(fs: &Ext2FileSystem, table_block: u32) -> KResult<()> {
    for group in 0..fs.group_count {
        let byte = group * GROUP_DESC_SIZE;
        let block = table_block + (byte as u32 / fs.block_size);
        let within = byte % fs.block_size as usize;
        let mut buffer = fs.read_fs_block(block)?;
        disk::encode_group_descriptor(&mut buffer.bytes_mut()[within..], &fs.groups[group]);
        blockcache::release_reservation(buffer, true);
    }
    Ok(())
}

/// Flush the superblock and group descriptors to the primary location
/// and every sparse-super backup.
pub fn write_metadata(fs: &mut Ext2FileSystem) -> KResult<()> {
    if !fs.sb_dirty && fs.groups_dirty == 0 {
        return Ok(());
    }
    let mut result: KResult<()> = Ok(());

    for group in 0..fs.group_count {
        if !group_has_backup(group) {
            continue;
        }
        let group_first = fs.sb.first_data_block + group as u32 * fs.sb.blocks_per_group;
        let sb_offset = if group == 0 {
            disk::EXT2_SUPERBLOCK_OFFSET
        } else {
            group_first as u64 * fs.block_size as u64
        };
        ferrox_abi::errno::retain_first_failure(&mut result, write_superblock_at(fs, sb_offset));

        // The descriptor table sits in the block after the superblock;
        // first_data_block already accounts for the 1 KiB block case.
        let table_block = group_first + 1;
        ferrox_abi::errno::retain_first_failure(
            &mut result,
            write_group_descriptors_at(fs, table_block),
        );
    }

    if result.is_ok() {
        fs.sb_dirty = false;
        fs.groups_dirty = 0;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_super_backup_groups() {
        let with_backup: std::vec::Vec<usize> =
            (0..60).filter(|g| group_has_backup(*g)).collect();
        assert_eq!(with_backup, [0, 1, 3, 5, 7, 9, 25, 27, 49]);
    }
}
