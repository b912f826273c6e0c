//! Kernel-run filesystem smoke tests.
//!
//! Each entry point returns 0 on success so the boot-time harness can
//! report them uniformly; the host test harness drives the same
//! functions. The fixture builds a small ext2 image in memory, mounts
//! it at `/`, and leaves it mounted for the whole sequence.

use core::ffi::c_int;

use ferrox_abi::fs::{OpenFlags, Stat};
use ferrox_abi::{Errno, PATH_MAX};
use ferrox_lib::klog_info;

use crate::blockdev::{MemoryBlockDevice, register_block_device};
use crate::vfs::{self, ofd, resolve};
use crate::{ext2, pipe};

const BLOCK_SIZE: u32 = 1024;
const IMAGE_BLOCKS: u32 = 256;
const IMAGE_INODES: u32 = 64;
const INODE_SIZE: u16 = 128;

// Layout: boot | superblock | descriptors | block bitmap | inode bitmap
// | inode table (8 blocks) | root data.
const ROOT_DATA_BLOCK: u32 = 13;
const USED_BLOCKS: u32 = 14;
const FREE_BLOCKS: u32 = IMAGE_BLOCKS - USED_BLOCKS;
const RESERVED_INODES: u32 = 10;

fn put_u16(block: &mut [u8], offset: usize, value: u16) {
    block[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(block: &mut [u8], offset: usize, value: u32) {
    block[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_image_block(
    device: &MemoryBlockDevice,
    block: u32,
    fill: impl FnOnce(&mut [u8; BLOCK_SIZE as usize]),
) -> bool {
    use crate::blockdev::BlockDevice;
    let mut bytes = [0u8; BLOCK_SIZE as usize];
    fill(&mut bytes);
    device
        .write_at(block as u64 * BLOCK_SIZE as u64, &bytes)
        .is_ok()
}

/// Format a fresh ext2 rev 1 image, one block at a time (the scratch
/// buffer has to fit a kernel stack).
fn format_image(device: &MemoryBlockDevice) -> bool {
    let bs = BLOCK_SIZE as usize;

    let superblock_ok = write_image_block(device, 1, |sb| {
        put_u32(sb, 0, IMAGE_INODES);
        put_u32(sb, 4, IMAGE_BLOCKS);
        put_u32(sb, 12, FREE_BLOCKS);
        put_u32(sb, 16, IMAGE_INODES - RESERVED_INODES);
        put_u32(sb, 20, 1); // first data block
        put_u32(sb, 24, 0); // log block size (1024)
        put_u32(sb, 28, 0); // log fragment size
        put_u32(sb, 32, IMAGE_BLOCKS); // blocks per group
        put_u32(sb, 40, IMAGE_INODES); // inodes per group
        put_u16(sb, 56, 0xEF53);
        put_u16(sb, 58, 1); // VALID_FS
        put_u32(sb, 76, 1); // rev level
        put_u32(sb, 84, 11); // first inode
        put_u16(sb, 88, INODE_SIZE);
        put_u32(sb, 96, 0x0002); // incompat: FILETYPE
        put_u32(sb, 100, 0x0003); // ro_compat: SPARSE_SUPER | LARGE_FILE
    });

    let descriptors_ok = write_image_block(device, 2, |gd| {
        put_u32(gd, 0, 3); // block bitmap
        put_u32(gd, 4, 4); // inode bitmap
        put_u32(gd, 8, 5); // inode table
        put_u16(gd, 12, FREE_BLOCKS as u16);
        put_u16(gd, 14, (IMAGE_INODES - RESERVED_INODES) as u16);
        put_u16(gd, 16, 1); // used dirs (root)
    });

    // Block bitmap: bit b covers block 1 + b; blocks 1..=13 are used.
    let block_bitmap_ok = write_image_block(device, 3, |bitmap| {
        for bit in 0..USED_BLOCKS - 1 {
            bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    });

    // Inode bitmap: inodes 1..=10 are reserved.
    let inode_bitmap_ok = write_image_block(device, 4, |bitmap| {
        for bit in 0..RESERVED_INODES {
            bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    });

    // Root inode (2) lives in the table's first block.
    let root_inode_ok = write_image_block(device, 5, |table| {
        let root = INODE_SIZE as usize;
        put_u16(table, root, 0x4000 | 0o755);
        put_u32(table, root + 4, BLOCK_SIZE);
        put_u16(table, root + 26, 2); // links
        put_u32(table, root + 28, BLOCK_SIZE / 512); // sectors
        put_u32(table, root + 40, ROOT_DATA_BLOCK);
    });

    // Root data: "." and "..".
    let root_data_ok = write_image_block(device, ROOT_DATA_BLOCK, |data| {
        put_u32(data, 0, 2);
        put_u16(data, 4, 12);
        data[6] = 1;
        data[7] = 2; // FT_DIR
        data[8] = b'.';
        put_u32(data, 12, 2);
        put_u16(data, 16, (bs - 12) as u16);
        data[18] = 2;
        data[19] = 2;
        data[20] = b'.';
        data[21] = b'.';
    });

    superblock_ok
        && descriptors_ok
        && block_bitmap_ok
        && inode_bitmap_ok
        && root_inode_ok
        && root_data_ok
}

static ROOT_IMAGE: spin::Once<MemoryBlockDevice> = spin::Once::new();
static MOUNTED: spin::Once<()> = spin::Once::new();

/// Build, register, and mount the test image at `/` exactly once.
pub fn mount_test_root() -> c_int {
    let mut failed = false;
    MOUNTED.call_once(|| {
        let device = ROOT_IMAGE.call_once(|| {
            MemoryBlockDevice::allocate((IMAGE_BLOCKS * BLOCK_SIZE) as usize)
                .expect("test image allocation")
        });
        if !format_image(device) {
            failed = true;
            return;
        }
        let Ok(dev_id) = register_block_device(b"ram0", device) else {
            failed = true;
            return;
        };
        if ext2::mount_device(dev_id, b"/").is_err() {
            failed = true;
        }
    });
    if failed { -1 } else { 0 }
}

pub fn test_file_roundtrip() -> c_int {
    klog_info!("FS_TEST: file roundtrip");
    if mount_test_root() != 0 {
        return -1;
    }
    let flags = OpenFlags::CREAT | OpenFlags::RDWR;
    let Ok(fd) = vfs::open_path(b"/hello.txt", b"/", flags, 0o644) else {
        return -1;
    };
    let payload = b"hello block world";
    if ofd::write(fd, payload) != Ok(payload.len()) {
        return -1;
    }
    if ofd::seek(fd, 0, ferrox_abi::fs::SEEK_SET) != Ok(0) {
        return -1;
    }
    let mut back = [0u8; 32];
    if ofd::read(fd, &mut back) != Ok(payload.len()) {
        return -1;
    }
    if &back[..payload.len()] != payload {
        return -1;
    }
    if ofd::release(fd).is_err() {
        return -1;
    }
    0
}

/// The gap-write scenario: 4097 bytes, then 5000 more at offset 10000.
pub fn test_gap_write_and_block_accounting() -> c_int {
    klog_info!("FS_TEST: gap write");
    if mount_test_root() != 0 {
        return -1;
    }
    if vfs::make_directory(b"/d", b"/", 0o755).is_err() {
        return -1;
    }
    let flags = OpenFlags::CREAT | OpenFlags::RDWR;
    let Ok(fd) = vfs::open_path(b"/d/f", b"/", flags, 0o644) else {
        return -1;
    };

    let first = [0xA5u8; 4097];
    if ofd::write(fd, &first) != Ok(first.len()) {
        return -1;
    }
    if ofd::seek(fd, 10000, ferrox_abi::fs::SEEK_SET) != Ok(10000) {
        return -1;
    }
    let second = [0x5Au8; 5000];
    if ofd::write(fd, &second) != Ok(second.len()) {
        return -1;
    }

    let mut stat = Stat::default();
    if ofd::status(fd, &mut stat).is_err() {
        return -1;
    }
    if stat.st_size != 15000 {
        return -1;
    }
    // 15 data blocks plus one single-indirection block, in 512 sectors.
    if stat.st_blocks != 16 * (BLOCK_SIZE / 512) {
        return -1;
    }

    // The hole reads back as zeros.
    if ofd::seek(fd, 4097, ferrox_abi::fs::SEEK_SET) != Ok(4097) {
        return -1;
    }
    let mut gap = [0xFFu8; 512];
    let mut checked = 0usize;
    while checked < 10000 - 4097 {
        let want = core::cmp::min(gap.len(), 10000 - 4097 - checked);
        match ofd::read(fd, &mut gap[..want]) {
            Ok(got) if got > 0 => {
                if gap[..got].iter().any(|b| *b != 0) {
                    return -1;
                }
                checked += got;
            }
            _ => return -1,
        }
    }
    if ofd::release(fd).is_err() {
        return -1;
    }
    0
}

pub fn test_unlink_reclaims_blocks() -> c_int {
    klog_info!("FS_TEST: unlink reclaim");
    if mount_test_root() != 0 {
        return -1;
    }
    let Ok((free_before, inodes_before)) = ext2::statistics(0) else {
        return -1;
    };
    let flags = OpenFlags::CREAT | OpenFlags::RDWR;
    let Ok(fd) = vfs::open_path(b"/reclaim.bin", b"/", flags, 0o644) else {
        return -1;
    };
    let chunk = [7u8; 3000];
    if ofd::write(fd, &chunk) != Ok(chunk.len()) {
        return -1;
    }
    if vfs::unlink(b"/reclaim.bin", b"/").is_err() {
        return -1;
    }
    // Still open: data remains reachable through the description.
    if ofd::seek(fd, 0, ferrox_abi::fs::SEEK_SET) != Ok(0) {
        return -1;
    }
    let mut back = [0u8; 16];
    if ofd::read(fd, &mut back) != Ok(back.len()) {
        return -1;
    }
    if ofd::release(fd).is_err() {
        return -1;
    }
    // Last reference gone: blocks and inode return to the allocator.
    match ext2::statistics(0) {
        Ok((free_after, inodes_after)) => {
            if free_after != free_before || inodes_after != inodes_before {
                return -1;
            }
        }
        Err(_) => return -1,
    }
    0
}

pub fn test_symlink_resolution_and_loops() -> c_int {
    klog_info!("FS_TEST: symlinks");
    if mount_test_root() != 0 {
        return -1;
    }
    if vfs::symlink(b"/d", b"/dlink", b"/").is_err() {
        return -1;
    }
    let Ok(fd) = vfs::open_path(b"/dlink/f", b"/", OpenFlags::empty(), 0) else {
        return -1;
    };
    if ofd::release(fd).is_err() {
        return -1;
    }

    if vfs::symlink(b"/loop_b", b"/loop_a", b"/").is_err() {
        return -1;
    }
    if vfs::symlink(b"/loop_a", b"/loop_b", b"/").is_err() {
        return -1;
    }
    match vfs::open_path(b"/loop_a", b"/", OpenFlags::empty(), 0) {
        Err(Errno::ELOOP) => {}
        _ => return -1,
    }

    // A non-followed final symlink resolves to the link itself.
    match resolve::resolve_path(b"/dlink", b"/", false, None, false) {
        Ok(resolved) => {
            let mut target = [0u8; PATH_MAX];
            let ok = matches!(
                crate::vfs::node::node_read_symlink(resolved.node, &mut target),
                Ok(2)
            ) && &target[..2] == b"/d";
            crate::vfs::node::release_node(resolved.node);
            if !ok {
                return -1;
            }
        }
        Err(_) => return -1,
    }
    0
}

pub fn test_rename_rules() -> c_int {
    klog_info!("FS_TEST: rename");
    if mount_test_root() != 0 {
        return -1;
    }
    if vfs::make_directory(b"/r1", b"/", 0o755).is_err() {
        return -1;
    }
    if vfs::make_directory(b"/r1/r2", b"/", 0o755).is_err() {
        return -1;
    }
    // A directory cannot move beneath itself.
    match vfs::rename(b"/r1", b"/r1/r2/r1", b"/") {
        Err(Errno::EINVAL) => {}
        _ => return -1,
    }
    // Plain file rename within the filesystem.
    if vfs::rename(b"/d/f", b"/d/g", b"/").is_err() {
        return -1;
    }
    if vfs::open_path(b"/d/f", b"/", OpenFlags::empty(), 0).is_ok() {
        return -1;
    }
    let Ok(fd) = vfs::open_path(b"/d/g", b"/", OpenFlags::empty(), 0) else {
        return -1;
    };
    if ofd::release(fd).is_err() {
        return -1;
    }
    // Moving a directory rewrites its `..`.
    if vfs::rename(b"/r1/r2", b"/r2", b"/").is_err() {
        return -1;
    }
    if vfs::remove_directory(b"/r2", b"/").is_err() {
        return -1;
    }
    0
}

pub fn test_pipe_end_tracking() -> c_int {
    klog_info!("FS_TEST: pipes");
    let Ok((read_fd, write_fd)) = pipe::create() else {
        return -1;
    };
    if ofd::write(write_fd, b"through the ring") != Ok(16) {
        return -1;
    }
    let mut buf = [0u8; 32];
    if ofd::read(read_fd, &mut buf) != Ok(16) {
        return -1;
    }
    if &buf[..16] != b"through the ring" {
        return -1;
    }
    // Writer closes: drained pipe reads as end-of-file.
    if ofd::release(write_fd).is_err() {
        return -1;
    }
    if ofd::read(read_fd, &mut buf) != Ok(0) {
        return -1;
    }
    if ofd::release(read_fd).is_err() {
        return -1;
    }

    // Reader closes: writing breaks the pipe.
    let Ok((read_fd, write_fd)) = pipe::create() else {
        return -1;
    };
    if ofd::release(read_fd).is_err() {
        return -1;
    }
    match ofd::write(write_fd, b"x") {
        Err(Errno::EPIPE) => {}
        _ => return -1,
    }
    if ofd::release(write_fd).is_err() {
        return -1;
    }
    0
}

#[cfg(test)]
mod host {
    use super::*;
    use ferrox_abi::task::{Pid, ProcessState};
    use ferrox_lib::kernel_services::process_runtime::{
        ProcessRuntimeServices, register_process_runtime_services,
    };
    use ferrox_lib::kernel_services::{WaitChannel, WakeOutcome};

    fn stub_block(_channel: WaitChannel, _state: ProcessState) -> WakeOutcome {
        // Host tests never take a blocking path.
        WakeOutcome::Interrupted
    }

    fn register_stubs() {
        register_process_runtime_services(ProcessRuntimeServices {
            current_pid: || 1,
            current_pgid: || 1,
            current_sid: || 1,
            block_current: stub_block,
            wake_channel: |_c: WaitChannel, _all: bool| 0,
            signal_process: |_pid: Pid, _s: u8| true,
            signal_process_group: |_pgid: Pid, _s: u8| true,
            process_group_is_orphaned: |_pgid: Pid| false,
            current_blocks_or_ignores: |_s: u8| false,
            has_pending_signal: || false,
        });
    }

    /// The whole sequence runs in one test: the image, mount table, and
    /// node arena are process-global.
    #[test]
    fn filesystem_smoke_sequence() {
        ferrox_mm::frame_pool_init_host();
        register_stubs();
        assert_eq!(mount_test_root(), 0);
        assert_eq!(test_file_roundtrip(), 0);
        assert_eq!(test_gap_write_and_block_accounting(), 0);
        assert_eq!(test_unlink_reclaims_blocks(), 0);
        assert_eq!(test_symlink_resolution_and_loops(), 0);
        assert_eq!(test_rename_rules(), 0);
        assert_eq!(test_pipe_end_tracking(), 0);
    }
}
