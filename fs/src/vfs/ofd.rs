//! The open-file-description pool.
//!
//! An entry pairs a node reservation with the byte offset and open
//! flags shared by every descriptor that refers to it (across dup and
//! fork). Entries live on an available list or the used list; acquire
//! zeroes a free entry, release returns it once the usage count drops
//! to zero and hands the node reservation back.

use ferrox_abi::fs::{Dirent, OpenFlags, SEEK_CUR, SEEK_END, SEEK_SET, Stat, mode_is_directory};
use ferrox_abi::{Errno, KResult};
use ferrox_lib::{IrqMutex, LinkArena, ListHead, ListLink};

use super::node::{
    NodeId, NodeKind, RepositionPolicy, node_change_size, node_kind, node_mode, node_poll,
    node_read, node_read_directory_entry, node_reposition_policy, node_size, node_status,
    node_write, release_node,
};
use crate::pipe;

pub const MAX_OFDS: usize = 128;

pub type OfdId = u16;

#[derive(Copy, Clone)]
struct Ofd {
    node: NodeId,
    offset: u64,
    flags: OpenFlags,
    usage: u16,
    link: ListLink,
}

impl Ofd {
    const fn empty() -> Self {
        Self {
            node: 0,
            offset: 0,
            flags: OpenFlags::empty(),
            usage: 0,
            link: ListLink::new(),
        }
    }
}

struct OfdLinks<'a>(&'a mut [Ofd; MAX_OFDS]);

impl LinkArena for OfdLinks<'_> {
    fn link(&self, index: u16) -> &ListLink {
        &self.0[index as usize].link
    }
    fn link_mut(&mut self, index: u16) -> &mut ListLink {
        &mut self.0[index as usize].link
    }
}

struct OfdPool {
    entries: [Ofd; MAX_OFDS],
    available: ListHead,
    used: ListHead,
    initialized: bool,
}

static POOL: IrqMutex<OfdPool> = IrqMutex::new(OfdPool {
    entries: [Ofd::empty(); MAX_OFDS],
    available: ListHead::new(),
    used: ListHead::new(),
    initialized: false,
});

fn ensure_init(pool: &mut OfdPool) {
    if pool.initialized {
        return;
    }
    let mut available = pool.available;
    for i in 0..MAX_OFDS as u16 {
        available.push_back(&mut OfdLinks(&mut pool.entries), i);
    }
    pool.available = available;
    pool.initialized = true;
}

/// Take over an existing node reservation and wrap it in a fresh entry.
pub fn acquire(node: NodeId, flags: OpenFlags) -> KResult<OfdId> {
    let mut pool = POOL.lock();
    ensure_init(&mut pool);
    let pool = &mut *pool;

    let mut available = pool.available;
    let id = available
        .pop_front(&mut OfdLinks(&mut pool.entries))
        .ok_or(Errno::ENFILE)?;
    pool.available = available;

    pool.entries[id as usize] = Ofd {
        node,
        offset: 0,
        flags,
        usage: 1,
        link: ListLink::new(),
    };
    let mut used = pool.used;
    used.push_back(&mut OfdLinks(&mut pool.entries), id);
    pool.used = used;
    Ok(id)
}

pub fn add_ref(ofd: OfdId) {
    let mut pool = POOL.lock();
    debug_assert!(pool.entries[ofd as usize].usage > 0);
    pool.entries[ofd as usize].usage += 1;
}

pub fn usage_of(ofd: OfdId) -> u16 {
    POOL.lock().entries[ofd as usize].usage
}

/// Drop one reference; the last one releases the node reservation and
/// notifies pipes so they can track released ends.
pub fn release(ofd: OfdId) -> KResult<()> {
    let last = {
        let mut pool = POOL.lock();
        let entry = &mut pool.entries[ofd as usize];
        debug_assert!(entry.usage > 0);
        entry.usage -= 1;
        if entry.usage > 0 {
            None
        } else {
            let node = entry.node;
            let pool = &mut *pool;
            let mut used = pool.used;
            used.remove(&mut OfdLinks(&mut pool.entries), ofd);
            pool.used = used;
            let mut available = pool.available;
            available.push_back(&mut OfdLinks(&mut pool.entries), ofd);
            pool.available = available;
            Some(node)
        }
    };
    if let Some(node) = last {
        if let NodeKind::Pipe { id } = node_kind(node) {
            pipe::ofd_released(id, ofd);
        }
        release_node(node);
    }
    Ok(())
}

fn snapshot(ofd: OfdId) -> KResult<(NodeId, u64, OpenFlags)> {
    let pool = POOL.lock();
    let entry = &pool.entries[ofd as usize];
    if entry.usage == 0 {
        return Err(Errno::EBADF);
    }
    Ok((entry.node, entry.offset, entry.flags))
}

fn set_offset(ofd: OfdId, offset: u64) {
    POOL.lock().entries[ofd as usize].offset = offset;
}

pub fn node_of(ofd: OfdId) -> KResult<NodeId> {
    snapshot(ofd).map(|(node, _, _)| node)
}

pub fn flags_of(ofd: OfdId) -> KResult<OpenFlags> {
    snapshot(ofd).map(|(_, _, flags)| flags)
}

/// F_SETFL: only the status flags may change.
pub fn set_status_flags(ofd: OfdId, flags: OpenFlags) -> KResult<()> {
    let mut pool = POOL.lock();
    let entry = &mut pool.entries[ofd as usize];
    if entry.usage == 0 {
        return Err(Errno::EBADF);
    }
    let changeable = OpenFlags::APPEND | OpenFlags::NONBLOCK;
    let kept = entry.flags.difference(changeable);
    entry.flags = kept.union(flags.intersection(changeable));
    Ok(())
}

pub fn is_directory(ofd: OfdId) -> KResult<bool> {
    let (node, _, _) = snapshot(ofd)?;
    Ok(mode_is_directory(node_mode(node)?))
}

fn advances_offset(policy: RepositionPolicy) -> bool {
    matches!(
        policy,
        RepositionPolicy::Freely | RepositionPolicy::BasedOnSize
    )
}

pub fn read(ofd: OfdId, buf: &mut [u8]) -> KResult<usize> {
    let (node, offset, flags) = snapshot(ofd)?;
    if !flags.readable() {
        return Err(Errno::EBADF);
    }
    if mode_is_directory(node_mode(node)?) {
        return Err(Errno::EISDIR);
    }
    let count = node_read(node, offset, buf)?;
    if advances_offset(node_reposition_policy(node)) {
        set_offset(ofd, offset + count as u64);
    }
    Ok(count)
}

pub fn write(ofd: OfdId, buf: &[u8]) -> KResult<usize> {
    let (node, mut offset, flags) = snapshot(ofd)?;
    if !flags.writable() {
        return Err(Errno::EBADF);
    }
    if flags.contains(OpenFlags::APPEND) {
        offset = node_size(node)?;
    }
    let count = node_write(node, offset, buf)?;
    if advances_offset(node_reposition_policy(node)) {
        set_offset(ofd, offset + count as u64);
    }
    Ok(count)
}

pub fn seek(ofd: OfdId, offset: i64, whence: u32) -> KResult<u64> {
    let (node, current, _) = snapshot(ofd)?;
    let policy = node_reposition_policy(node);
    if policy == RepositionPolicy::NotAllowed {
        return Err(Errno::ESPIPE);
    }
    let base = match whence {
        SEEK_SET => 0,
        SEEK_CUR => current as i64,
        SEEK_END => node_size(node)? as i64,
        _ => return Err(Errno::EINVAL),
    };
    let target = base.checked_add(offset).ok_or(Errno::EOVERFLOW)?;
    if target < 0 {
        return Err(Errno::EINVAL);
    }
    let target = match policy {
        RepositionPolicy::AlwaysZero => 0,
        RepositionPolicy::BasedOnSize => core::cmp::min(target as u64, node_size(node)?),
        _ => target as u64,
    };
    set_offset(ofd, target);
    Ok(target)
}

pub fn read_directory_entry(ofd: OfdId, out: &mut Dirent) -> KResult<bool> {
    let (node, mut position, _) = snapshot(ofd)?;
    let has_entry = node_read_directory_entry(node, &mut position, out)?;
    set_offset(ofd, position);
    Ok(has_entry)
}

pub fn status(ofd: OfdId, out: &mut Stat) -> KResult<()> {
    let (node, _, _) = snapshot(ofd)?;
    node_status(node, out)
}

pub fn truncate(ofd: OfdId, size: u64) -> KResult<()> {
    let (node, _, flags) = snapshot(ofd)?;
    if !flags.writable() {
        return Err(Errno::EBADF);
    }
    node_change_size(node, size)
}

pub fn poll(ofd: OfdId) -> KResult<(bool, bool)> {
    let (node, _, _) = snapshot(ofd)?;
    Ok(node_poll(node))
}
