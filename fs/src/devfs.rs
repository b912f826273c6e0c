//! The devices filesystem: a flat, in-memory namespace of device nodes
//! addressed by short names, mounted at /dev.

use ferrox_abi::fs::{DT_DIR, Dirent};
use ferrox_abi::{Errno, KResult};
use ferrox_lib::IrqMutex;

use crate::vfs::mount;
use crate::vfs::node::{NodeId, NodeKind, alloc_node, node_dirent_type, reserve_node};

pub const MAX_DEV_NODES: usize = 12;
pub const DEV_NAME_MAX: usize = 16;

#[derive(Copy, Clone)]
struct DevEntry {
    name: [u8; DEV_NAME_MAX],
    name_len: usize,
    node: NodeId,
}

struct DevTable {
    entries: [Option<DevEntry>; MAX_DEV_NODES],
}

static DEVFS: IrqMutex<DevTable> = IrqMutex::new(DevTable {
    entries: [None; MAX_DEV_NODES],
});

/// Create the root node and mount it at `/dev`; the mount table holds
/// the root's reservation.
pub fn init() -> KResult<()> {
    let root = alloc_node(NodeKind::DevRoot)?;
    reserve_node(root);
    mount::mount(b"/dev", root)
}

/// Register one device node under its short name.
pub fn register_device_node(name: &[u8], kind: NodeKind) -> KResult<NodeId> {
    if name.is_empty() || name.len() > DEV_NAME_MAX {
        return Err(Errno::EINVAL);
    }
    let node = alloc_node(kind)?;
    let mut table = DEVFS.lock();
    if table
        .entries
        .iter()
        .flatten()
        .any(|e| &e.name[..e.name_len] == name)
    {
        return Err(Errno::EEXIST);
    }
    let slot = table
        .entries
        .iter()
        .position(|e| e.is_none())
        .ok_or(Errno::ENOMEM)?;
    let mut entry = DevEntry {
        name: [0; DEV_NAME_MAX],
        name_len: name.len(),
        node,
    };
    entry.name[..name.len()].copy_from_slice(name);
    table.entries[slot] = Some(entry);
    Ok(node)
}

/// Linear name lookup.
pub fn walk(name: &[u8]) -> KResult<NodeId> {
    let table = DEVFS.lock();
    table
        .entries
        .iter()
        .flatten()
        .find(|e| &e.name[..e.name_len] == name)
        .map(|e| e.node)
        .ok_or(Errno::ENOENT)
}

/// Entries are numbered densely for readdir; `.` and `..` come first.
pub fn read_directory_entry(position: &mut u64, out: &mut Dirent) -> KResult<bool> {
    let table = DEVFS.lock();
    let index = *position as usize;
    if index < 2 {
        let name: &[u8] = if index == 0 { b"." } else { b".." };
        out.d_ino = 0;
        out.d_type = DT_DIR;
        out.d_name_len = name.len() as u8;
        out.d_name[..name.len()].copy_from_slice(name);
        *position += 1;
        return Ok(true);
    }
    let mut seen = 0usize;
    for entry in table.entries.iter().flatten() {
        if seen == index - 2 {
            out.d_ino = entry.node as u32;
            out.d_type = node_dirent_type(entry.node);
            out.d_name_len = entry.name_len as u8;
            out.d_name[..entry.name_len].copy_from_slice(&entry.name[..entry.name_len]);
            *position += 1;
            return Ok(true);
        }
        seen += 1;
    }
    Ok(false)
}
