//! The node arena and the per-variant operation dispatch.
//!
//! Every open file, resolved directory, device, and pipe end is a slot
//! here. A node's `usage` counts reservations: open-file-descriptions
//! plus in-flight resolvers. Dropping the count to zero fires the
//! variant's after-release hook, which owns final cleanup (ext2 inode
//! write-back or free, pipe teardown).
//!
//! Operations a variant does not implement answer `EPERM`, except that
//! walking a non-directory answers `ENOTDIR`.

use ferrox_abi::fs::{DT_CHR, DT_DIR, DT_FIFO, Dirent, S_IFCHR, S_IFDIR, S_IFIFO, Stat};
use ferrox_abi::{Errno, KResult};
use ferrox_lib::IrqMutex;
use ferrox_lib::kernel_services::tty_runtime;

use crate::{devfs, ext2, pipe};

pub const MAX_NODES: usize = 192;

pub type NodeId = u16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Unused,
    Ext2 { fs: u8, slot: u16 },
    DevRoot,
    Null,
    Zero,
    Tty { index: u8 },
    Pipe { id: u8 },
}

/// How lseek treats this node's open-file-description offset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RepositionPolicy {
    NotAllowed,
    AlwaysZero,
    BasedOnSize,
    Freely,
}

#[derive(Copy, Clone)]
struct VfsNode {
    kind: NodeKind,
    usage: u32,
}

struct NodeTable {
    nodes: [VfsNode; MAX_NODES],
}

static NODES: IrqMutex<NodeTable> = IrqMutex::new(NodeTable {
    nodes: [VfsNode {
        kind: NodeKind::Unused,
        usage: 0,
    }; MAX_NODES],
});

pub fn alloc_node(kind: NodeKind) -> KResult<NodeId> {
    debug_assert!(kind != NodeKind::Unused);
    let mut table = NODES.lock();
    let slot = table
        .nodes
        .iter()
        .position(|n| n.kind == NodeKind::Unused)
        .ok_or(Errno::ENOMEM)?;
    table.nodes[slot] = VfsNode { kind, usage: 0 };
    Ok(slot as NodeId)
}

pub fn free_node(node: NodeId) {
    let mut table = NODES.lock();
    debug_assert_eq!(table.nodes[node as usize].usage, 0);
    table.nodes[node as usize] = VfsNode {
        kind: NodeKind::Unused,
        usage: 0,
    };
}

pub fn node_kind(node: NodeId) -> NodeKind {
    NODES.lock().nodes[node as usize].kind
}

pub fn node_usage(node: NodeId) -> u32 {
    NODES.lock().nodes[node as usize].usage
}

pub fn reserve_node(node: NodeId) {
    let mut table = NODES.lock();
    let entry = &mut table.nodes[node as usize];
    debug_assert!(entry.kind != NodeKind::Unused);
    entry.usage += 1;
}

/// Drop one reservation. The after-release hook runs outside the table
/// lock so it may call back into the owning filesystem.
pub fn release_node(node: NodeId) {
    let hook_kind = {
        let mut table = NODES.lock();
        let entry = &mut table.nodes[node as usize];
        debug_assert!(entry.usage > 0);
        entry.usage -= 1;
        if entry.usage == 0 { Some(entry.kind) } else { None }
    };
    if let Some(kind) = hook_kind {
        after_reservation_release(node, kind);
    }
}

fn after_reservation_release(node: NodeId, kind: NodeKind) {
    match kind {
        NodeKind::Ext2 { fs, slot } => ext2::node_reservation_released(fs, slot),
        NodeKind::Pipe { id } => pipe::node_reservation_released(id, node),
        _ => {}
    }
}

// =============================================================================
// Operation dispatch
// =============================================================================

/// Look up (and optionally create) `name` under a directory node.
/// Returns the child with its reservation already taken.
pub fn node_walk(
    node: NodeId,
    name: &[u8],
    create_mode: Option<u16>,
) -> KResult<(NodeId, bool)> {
    match node_kind(node) {
        NodeKind::Ext2 { fs, slot } => ext2::walk(fs, slot, name, create_mode),
        NodeKind::DevRoot => {
            match devfs::walk(name) {
                Ok(child) => {
                    reserve_node(child);
                    Ok((child, false))
                }
                // The device namespace is fixed; nothing can be created.
                Err(Errno::ENOENT) if create_mode.is_some() => Err(Errno::EPERM),
                Err(e) => Err(e),
            }
        }
        NodeKind::Unused => Err(Errno::ENOENT),
        _ => Err(Errno::ENOTDIR),
    }
}

pub fn node_open(node: NodeId, noctty: bool) -> KResult<()> {
    match node_kind(node) {
        NodeKind::Ext2 { fs, slot } => ext2::open_check(fs, slot),
        NodeKind::Tty { index } => tty_runtime::tty_open(index, noctty),
        _ => Ok(()),
    }
}

pub fn node_read(node: NodeId, offset: u64, buf: &mut [u8]) -> KResult<usize> {
    match node_kind(node) {
        NodeKind::Ext2 { fs, slot } => ext2::read(fs, slot, offset, buf),
        NodeKind::Null => Ok(0),
        NodeKind::Zero => {
            buf.fill(0);
            Ok(buf.len())
        }
        NodeKind::Tty { index } => tty_runtime::tty_read(index, buf),
        NodeKind::Pipe { id } => pipe::read(id, buf),
        NodeKind::DevRoot => Err(Errno::EISDIR),
        NodeKind::Unused => Err(Errno::EBADF),
    }
}

pub fn node_write(node: NodeId, offset: u64, buf: &[u8]) -> KResult<usize> {
    match node_kind(node) {
        NodeKind::Ext2 { fs, slot } => ext2::write(fs, slot, offset, buf),
        NodeKind::Null | NodeKind::Zero => Ok(buf.len()),
        NodeKind::Tty { index } => tty_runtime::tty_write(index, buf),
        NodeKind::Pipe { id } => pipe::write(id, buf),
        NodeKind::DevRoot => Err(Errno::EISDIR),
        NodeKind::Unused => Err(Errno::EBADF),
    }
}

/// Advance `position` past one directory entry; false at end of directory.
pub fn node_read_directory_entry(
    node: NodeId,
    position: &mut u64,
    out: &mut Dirent,
) -> KResult<bool> {
    match node_kind(node) {
        NodeKind::Ext2 { fs, slot } => ext2::read_directory_entry(fs, slot, position, out),
        NodeKind::DevRoot => devfs::read_directory_entry(position, out),
        NodeKind::Unused => Err(Errno::EBADF),
        _ => Err(Errno::ENOTDIR),
    }
}

pub fn node_status(node: NodeId, out: &mut Stat) -> KResult<()> {
    match node_kind(node) {
        NodeKind::Ext2 { fs, slot } => ext2::status(fs, slot, out),
        NodeKind::DevRoot => {
            *out = Stat {
                st_mode: S_IFDIR | 0o755,
                st_nlink: 2,
                ..Stat::default()
            };
            Ok(())
        }
        NodeKind::Null | NodeKind::Zero | NodeKind::Tty { .. } => {
            *out = Stat {
                st_mode: S_IFCHR | 0o666,
                st_nlink: 1,
                ..Stat::default()
            };
            Ok(())
        }
        NodeKind::Pipe { .. } => {
            *out = Stat {
                st_mode: S_IFIFO | 0o600,
                st_nlink: 1,
                ..Stat::default()
            };
            Ok(())
        }
        NodeKind::Unused => Err(Errno::EBADF),
    }
}

pub fn node_mode(node: NodeId) -> KResult<u16> {
    match node_kind(node) {
        NodeKind::Ext2 { fs, slot } => ext2::mode(fs, slot),
        NodeKind::DevRoot => Ok(S_IFDIR | 0o755),
        NodeKind::Null | NodeKind::Zero | NodeKind::Tty { .. } => Ok(S_IFCHR | 0o666),
        NodeKind::Pipe { .. } => Ok(S_IFIFO | 0o600),
        NodeKind::Unused => Err(Errno::EBADF),
    }
}

pub fn node_size(node: NodeId) -> KResult<u64> {
    match node_kind(node) {
        NodeKind::Ext2 { fs, slot } => ext2::size(fs, slot),
        _ => Ok(0),
    }
}

pub fn node_change_size(node: NodeId, size: u64) -> KResult<()> {
    match node_kind(node) {
        NodeKind::Ext2 { fs, slot } => ext2::change_size(fs, slot, size),
        _ => Err(Errno::EPERM),
    }
}

pub fn node_reposition_policy(node: NodeId) -> RepositionPolicy {
    match node_kind(node) {
        NodeKind::Ext2 { fs, slot } => match ext2::mode(fs, slot) {
            Ok(mode) if ferrox_abi::fs::mode_is_regular(mode) => RepositionPolicy::Freely,
            _ => RepositionPolicy::BasedOnSize,
        },
        NodeKind::Null | NodeKind::Zero => RepositionPolicy::AlwaysZero,
        NodeKind::DevRoot => RepositionPolicy::BasedOnSize,
        NodeKind::Tty { .. } | NodeKind::Pipe { .. } | NodeKind::Unused => {
            RepositionPolicy::NotAllowed
        }
    }
}

/// (readable now, writable now) without blocking.
pub fn node_poll(node: NodeId) -> (bool, bool) {
    match node_kind(node) {
        NodeKind::Tty { index } => tty_runtime::tty_poll(index),
        NodeKind::Pipe { id } => pipe::poll(id),
        NodeKind::Unused => (false, false),
        _ => (true, true),
    }
}

pub fn node_dirent_type(node: NodeId) -> u8 {
    match node_kind(node) {
        NodeKind::DevRoot => DT_DIR,
        NodeKind::Pipe { .. } => DT_FIFO,
        _ => DT_CHR,
    }
}

// Namespace mutation is an ext2 affair; the devices filesystem is a
// read-only namespace.

pub fn node_create_directory(parent: NodeId, name: &[u8], mode: u16) -> KResult<()> {
    match node_kind(parent) {
        NodeKind::Ext2 { fs, slot } => ext2::create_directory(fs, slot, name, mode),
        NodeKind::DevRoot => Err(Errno::EPERM),
        NodeKind::Unused => Err(Errno::EBADF),
        _ => Err(Errno::ENOTDIR),
    }
}

/// Hard-link `target` (a node on the same filesystem) as `name`.
pub fn node_create_name(parent: NodeId, name: &[u8], target: NodeId) -> KResult<()> {
    match (node_kind(parent), node_kind(target)) {
        (NodeKind::Ext2 { fs, slot }, NodeKind::Ext2 { fs: tfs, slot: tslot }) => {
            if fs != tfs {
                return Err(Errno::EXDEV);
            }
            ext2::create_name(fs, slot, name, tslot)
        }
        (NodeKind::Ext2 { .. }, _) | (NodeKind::DevRoot, _) => Err(Errno::EXDEV),
        (NodeKind::Unused, _) => Err(Errno::EBADF),
        _ => Err(Errno::ENOTDIR),
    }
}

pub fn node_release_name(parent: NodeId, name: &[u8]) -> KResult<()> {
    match node_kind(parent) {
        NodeKind::Ext2 { fs, slot } => ext2::release_name(fs, slot, name),
        NodeKind::DevRoot => Err(Errno::EPERM),
        NodeKind::Unused => Err(Errno::EBADF),
        _ => Err(Errno::ENOTDIR),
    }
}

pub fn node_release_directory(parent: NodeId, name: &[u8]) -> KResult<()> {
    match node_kind(parent) {
        NodeKind::Ext2 { fs, slot } => ext2::release_directory(fs, slot, name),
        NodeKind::DevRoot => Err(Errno::EPERM),
        NodeKind::Unused => Err(Errno::EBADF),
        _ => Err(Errno::ENOTDIR),
    }
}

pub fn node_create_symbolic_link(parent: NodeId, name: &[u8], target: &[u8]) -> KResult<()> {
    match node_kind(parent) {
        NodeKind::Ext2 { fs, slot } => ext2::create_symbolic_link(fs, slot, name, target),
        NodeKind::DevRoot => Err(Errno::EPERM),
        NodeKind::Unused => Err(Errno::EBADF),
        _ => Err(Errno::ENOTDIR),
    }
}

pub fn node_rename(
    old_parent: NodeId,
    old_name: &[u8],
    new_parent: NodeId,
    new_name: &[u8],
) -> KResult<()> {
    match (node_kind(old_parent), node_kind(new_parent)) {
        (NodeKind::Ext2 { fs, slot }, NodeKind::Ext2 { fs: nfs, slot: nslot }) => {
            if fs != nfs {
                return Err(Errno::EXDEV);
            }
            ext2::rename(fs, slot, old_name, nslot, new_name)
        }
        (NodeKind::Unused, _) | (_, NodeKind::Unused) => Err(Errno::EBADF),
        (NodeKind::Ext2 { .. }, _) | (_, NodeKind::Ext2 { .. }) => Err(Errno::EXDEV),
        _ => Err(Errno::EPERM),
    }
}

/// Read a symbolic link's target into `out`; EINVAL for non-links.
pub fn node_read_symlink(node: NodeId, out: &mut [u8]) -> KResult<usize> {
    match node_kind(node) {
        NodeKind::Ext2 { fs, slot } => ext2::read_symlink(fs, slot, out),
        NodeKind::Unused => Err(Errno::EBADF),
        _ => Err(Errno::EINVAL),
    }
}
