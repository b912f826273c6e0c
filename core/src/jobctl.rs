//! Job control: process groups and sessions.
//!
//! Group and session records share the process table's lock; member
//! lists are intrusive through each process's group link. A group id is
//! its first leader's pid; the group dies when the last member leaves
//! and no outstanding reservations (the TTY's foreground reference)
//! remain.

use ferrox_abi::task::{Pid, ProcessState};
use ferrox_abi::{Errno, KResult};
use ferrox_lib::{ListHead, ListLink};

use crate::process::{GroupLinks, NO_SLOT, ProcessTable, TABLE};

pub const MAX_PROCESS_GROUPS: usize = 32;
pub const MAX_SESSIONS: usize = 16;
pub const NO_TTY: i8 = -1;

#[derive(Copy, Clone)]
pub struct ProcessGroup {
    pub id: Pid,
    pub session: u16,
    pub members: ListHead,
    pub reservations: u16,
    pub in_use: bool,
}

impl ProcessGroup {
    pub const fn empty() -> Self {
        Self {
            id: 0,
            session: NO_SLOT,
            members: ListHead::new(),
            reservations: 0,
            in_use: false,
        }
    }
}

#[derive(Copy, Clone)]
pub struct Session {
    pub id: Pid,
    pub leader: Pid,
    pub controlling_tty: i8,
    pub reservations: u16,
    pub in_use: bool,
}

impl Session {
    pub const fn empty() -> Self {
        Self {
            id: 0,
            leader: 0,
            controlling_tty: NO_TTY,
            reservations: 0,
            in_use: false,
        }
    }
}

// =============================================================================
// Locked primitives (callers hold the table lock)
// =============================================================================

pub(crate) fn session_create_locked(table: &mut ProcessTable, leader: Pid) -> KResult<u16> {
    let slot = table
        .sessions
        .iter()
        .position(|s| !s.in_use)
        .ok_or(Errno::ENOMEM)? as u16;
    table.sessions[slot as usize] = Session {
        id: leader,
        leader,
        controlling_tty: NO_TTY,
        reservations: 0,
        in_use: true,
    };
    Ok(slot)
}

pub(crate) fn group_create_locked(
    table: &mut ProcessTable,
    id: Pid,
    session: u16,
) -> KResult<u16> {
    let slot = table
        .groups
        .iter()
        .position(|g| !g.in_use)
        .ok_or(Errno::ENOMEM)? as u16;
    table.groups[slot as usize] = ProcessGroup {
        id,
        session,
        members: ListHead::new(),
        reservations: 0,
        in_use: true,
    };
    table.sessions[session as usize].reservations += 1;
    Ok(slot)
}

/// Move a process into a group, leaving its old one first.
pub(crate) fn group_join_locked(table: &mut ProcessTable, proc_slot: u16, group_slot: u16) {
    group_leave_locked(table, proc_slot);
    let mut members = table.groups[group_slot as usize].members;
    members.push_back(&mut GroupLinks(&mut table.procs), proc_slot);
    table.groups[group_slot as usize].members = members;
    table.procs[proc_slot as usize].group = group_slot;
}

pub(crate) fn group_leave_locked(table: &mut ProcessTable, proc_slot: u16) {
    let group_slot = table.procs[proc_slot as usize].group;
    if group_slot == NO_SLOT {
        return;
    }
    let mut members = table.groups[group_slot as usize].members;
    members.remove(&mut GroupLinks(&mut table.procs), proc_slot);
    table.groups[group_slot as usize].members = members;
    table.procs[proc_slot as usize].group = NO_SLOT;
    table.procs[proc_slot as usize].group_link = ListLink::new();
    maybe_free_group_locked(table, group_slot);
}

fn maybe_free_group_locked(table: &mut ProcessTable, group_slot: u16) {
    let group = &table.groups[group_slot as usize];
    if !group.in_use || !group.members.is_empty() || group.reservations > 0 {
        return;
    }
    let session = group.session;
    table.groups[group_slot as usize] = ProcessGroup::empty();
    if session != NO_SLOT {
        let s = &mut table.sessions[session as usize];
        s.reservations = s.reservations.saturating_sub(1);
        if s.reservations == 0 && table.groups.iter().all(|g| !g.in_use || g.session != session)
        {
            table.sessions[session as usize] = Session::empty();
        }
    }
}

pub(crate) fn group_slot_by_id(table: &ProcessTable, pgid: Pid) -> Option<u16> {
    table
        .groups
        .iter()
        .position(|g| g.in_use && g.id == pgid)
        .map(|slot| slot as u16)
}

/// A group is orphaned iff every member's parent is either in the same
/// group or in a different session. Parentless members count toward
/// orphanhood.
pub(crate) fn group_is_orphaned_locked(table: &ProcessTable, group_slot: u16) -> bool {
    let group = &table.groups[group_slot as usize];
    if !group.in_use {
        return true;
    }
    let session = group.session;
    let mut cursor = group.members.first();
    while let Some(member) = cursor {
        let parent = table.procs[member as usize].parent;
        if parent != NO_SLOT && table.procs[parent as usize].state != ProcessState::Absent {
            let parent_group = table.procs[parent as usize].group;
            if parent_group != group_slot
                && parent_group != NO_SLOT
                && table.groups[parent_group as usize].session == session
            {
                return false;
            }
        }
        cursor = table.procs[member as usize].group_link.next_index();
    }
    true
}

// =============================================================================
// Public surface
// =============================================================================

pub fn getpgid(pid: Pid) -> KResult<Pid> {
    let table = TABLE.lock();
    let slot = resolve_target(&table, pid)?;
    let group = table.procs[slot as usize].group;
    if group == NO_SLOT {
        return Err(Errno::ESRCH);
    }
    Ok(table.groups[group as usize].id)
}

pub fn getsid(pid: Pid) -> KResult<Pid> {
    let table = TABLE.lock();
    let slot = resolve_target(&table, pid)?;
    let group = table.procs[slot as usize].group;
    if group == NO_SLOT {
        return Err(Errno::ESRCH);
    }
    let session = table.groups[group as usize].session;
    Ok(table.sessions[session as usize].id)
}

fn resolve_target(table: &ProcessTable, pid: Pid) -> KResult<u16> {
    if pid == 0 {
        if table.current == NO_SLOT {
            return Err(Errno::ESRCH);
        }
        return Ok(table.current);
    }
    table.slot_by_pid(pid).ok_or(Errno::ESRCH)
}

/// setsid: the caller becomes leader of a fresh session and group.
/// Fails for an existing group leader.
pub fn setsid() -> KResult<Pid> {
    let mut table = TABLE.lock();
    let slot = table.current;
    if slot == NO_SLOT {
        return Err(Errno::ESRCH);
    }
    let pid = table.procs[slot as usize].pid;
    if group_slot_by_id(&table, pid).is_some() {
        return Err(Errno::EPERM);
    }
    let session = session_create_locked(&mut table, pid)?;
    let group = group_create_locked(&mut table, pid, session)?;
    group_join_locked(&mut table, slot, group);
    Ok(pid)
}

/// setpgid: move the caller or one of its children into a group within
/// the caller's session, creating the group when `pgid` names the
/// target itself.
pub fn setpgid(pid: Pid, pgid: Pid) -> KResult<()> {
    let mut table = TABLE.lock();
    let caller = table.current;
    if caller == NO_SLOT {
        return Err(Errno::ESRCH);
    }
    let target = resolve_target(&table, pid)?;
    if target != caller && table.procs[target as usize].parent != caller {
        return Err(Errno::ESRCH);
    }
    let target_pid = table.procs[target as usize].pid;
    let wanted = if pgid == 0 { target_pid } else { pgid };

    let caller_group = table.procs[caller as usize].group;
    let target_group = table.procs[target as usize].group;
    if caller_group == NO_SLOT || target_group == NO_SLOT {
        return Err(Errno::EPERM);
    }
    let session = table.groups[caller_group as usize].session;
    if table.groups[target_group as usize].session != session {
        return Err(Errno::EPERM);
    }
    // A session leader may not move out of its own group.
    if table.sessions[session as usize].leader == target_pid && wanted != target_pid {
        return Err(Errno::EPERM);
    }

    let group_slot = match group_slot_by_id(&table, wanted) {
        Some(slot) => {
            if table.groups[slot as usize].session != session {
                return Err(Errno::EPERM);
            }
            slot
        }
        None => {
            if wanted != target_pid {
                return Err(Errno::EPERM);
            }
            group_create_locked(&mut table, wanted, session)?
        }
    };
    group_join_locked(&mut table, target, group_slot);
    Ok(())
}

pub fn process_group_is_orphaned(pgid: Pid) -> bool {
    let table = TABLE.lock();
    match group_slot_by_id(&table, pgid) {
        Some(slot) => group_is_orphaned_locked(&table, slot),
        None => true,
    }
}

/// Pin a group record (the TTY's foreground reference).
pub fn group_reserve(pgid: Pid) -> bool {
    let mut table = TABLE.lock();
    match group_slot_by_id(&table, pgid) {
        Some(slot) => {
            table.groups[slot as usize].reservations += 1;
            true
        }
        None => false,
    }
}

pub fn group_release(pgid: Pid) {
    let mut table = TABLE.lock();
    if let Some(slot) = group_slot_by_id(&table, pgid) {
        let group = &mut table.groups[slot as usize];
        group.reservations = group.reservations.saturating_sub(1);
        maybe_free_group_locked(&mut table, slot);
    }
}

/// The controlling TTY of the caller's session, if any.
pub fn current_controlling_tty() -> Option<u8> {
    let table = TABLE.lock();
    let slot = table.current;
    if slot == NO_SLOT {
        return None;
    }
    let group = table.procs[slot as usize].group;
    if group == NO_SLOT {
        return None;
    }
    let session = table.groups[group as usize].session;
    let tty = table.sessions[session as usize].controlling_tty;
    if tty < 0 { None } else { Some(tty as u8) }
}

/// First open of a TTY by a session leader without a controlling
/// terminal: associate, if the TTY side is free too.
pub fn try_acquire_controlling_tty(sid: Pid, tty: u8) -> bool {
    let mut table = TABLE.lock();
    let slot = table.current;
    if slot == NO_SLOT {
        return false;
    }
    let pid = table.procs[slot as usize].pid;
    let Some(session_slot) = table.sessions.iter().position(|s| s.in_use && s.id == sid)
    else {
        return false;
    };
    let session = &mut table.sessions[session_slot];
    if session.leader != pid || session.controlling_tty != NO_TTY {
        return false;
    }
    session.controlling_tty = tty as i8;
    true
}

pub fn release_controlling_tty(sid: Pid) {
    let mut table = TABLE.lock();
    if let Some(session) = table.sessions.iter_mut().find(|s| s.in_use && s.id == sid) {
        session.controlling_tty = NO_TTY;
    }
}

pub fn session_of_current() -> Pid {
    let table = TABLE.lock();
    let slot = table.current;
    if slot == NO_SLOT {
        return 0;
    }
    let group = table.procs[slot as usize].group;
    if group == NO_SLOT {
        return 0;
    }
    table.sessions[table.groups[group as usize].session as usize].id
}

pub fn pgid_of_current() -> Pid {
    let table = TABLE.lock();
    let slot = table.current;
    if slot == NO_SLOT {
        return 0;
    }
    let group = table.procs[slot as usize].group;
    if group == NO_SLOT {
        return 0;
    }
    table.groups[group as usize].id
}
