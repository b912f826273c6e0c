//! The mount table.
//!
//! Entries are kept sorted with longer prefixes first (ties broken
//! lexicographically), so greedy prefix matching always picks the most
//! specific mount.

use core::cmp::Ordering;

use ferrox_abi::{Errno, KResult};
use ferrox_lib::{IrqMutex, SortedArray};

use super::node::NodeId;

pub const MAX_MOUNTS: usize = 8;
pub const MOUNT_PREFIX_MAX: usize = 64;

#[derive(Copy, Clone)]
struct MountedFileSystem {
    prefix: [u8; MOUNT_PREFIX_MAX],
    prefix_len: usize,
    root: NodeId,
}

impl MountedFileSystem {
    fn prefix_bytes(&self) -> &[u8] {
        &self.prefix[..self.prefix_len]
    }
}

static MOUNTS: IrqMutex<SortedArray<MountedFileSystem, MAX_MOUNTS>> =
    IrqMutex::new(SortedArray::new());

fn mount_order(a: &MountedFileSystem, b: &MountedFileSystem) -> Ordering {
    b.prefix_len
        .cmp(&a.prefix_len)
        .then_with(|| a.prefix_bytes().cmp(b.prefix_bytes()))
}

/// Register `root` at `prefix` (an absolute normalized path).
pub fn mount(prefix: &[u8], root: NodeId) -> KResult<()> {
    if prefix.is_empty() || prefix[0] != b'/' || prefix.len() > MOUNT_PREFIX_MAX {
        return Err(Errno::EINVAL);
    }
    let mut mounts = MOUNTS.lock();
    if mounts.iter().any(|m| m.prefix_bytes() == prefix) {
        return Err(Errno::EBUSY);
    }
    let mut entry = MountedFileSystem {
        prefix: [0; MOUNT_PREFIX_MAX],
        prefix_len: prefix.len(),
        root,
    };
    entry.prefix[..prefix.len()].copy_from_slice(prefix);
    if !mounts.insert(entry, mount_order) {
        return Err(Errno::ENOMEM);
    }
    Ok(())
}

/// Pick the mount whose prefix matches `path`, returning its root node
/// and the prefix length to strip. The table is longest-first, so the
/// first match wins.
pub fn resolve_mount(path: &[u8]) -> KResult<(NodeId, usize)> {
    let mounts = MOUNTS.lock();
    for m in mounts.iter() {
        let prefix = m.prefix_bytes();
        let matches = if prefix == b"/" {
            true
        } else {
            path.len() >= prefix.len()
                && &path[..prefix.len()] == prefix
                && (path.len() == prefix.len() || path[prefix.len()] == b'/')
        };
        if matches {
            let strip = if prefix == b"/" { 0 } else { prefix.len() };
            return Ok((m.root, strip));
        }
    }
    Err(Errno::ENOENT)
}

pub fn mount_count() -> usize {
    MOUNTS.lock().len()
}

/// Iterate mount roots (used by unmount-time flushing).
pub fn for_each_mount(f: &mut dyn FnMut(&[u8], NodeId)) {
    let mounts = MOUNTS.lock();
    for m in mounts.iter() {
        f(m.prefix_bytes(), m.root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        // The table is global; use prefixes unique to this test.
        mount(b"/mnt_t", 7).unwrap();
        mount(b"/mnt_t/inner", 8).unwrap();
        assert_eq!(mount(b"/mnt_t", 9), Err(Errno::EBUSY));

        let (root, strip) = resolve_mount(b"/mnt_t/inner/file").unwrap();
        assert_eq!(root, 8);
        assert_eq!(strip, b"/mnt_t/inner".len());

        let (root, strip) = resolve_mount(b"/mnt_t/innerx").unwrap();
        assert_eq!(root, 7);
        assert_eq!(strip, b"/mnt_t".len());
    }
}
