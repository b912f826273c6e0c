//! The process table.
//!
//! Every process is a slot in one static arena; list memberships
//! (runnable, waiting-I/O, siblings, group members) are intrusive links
//! inside the slot, so the invariants tie state to list presence: a
//! process is on the runnable list iff Runnable, and on a wait bucket
//! iff in one of the SuspendedWaiting states.

pub mod lifecycle;
pub mod segments;

use ferrox_abi::signal::{ExitStatus, NSIG, SIG_DFL, SigSet};
use ferrox_abi::task::{MAX_FDS, MAX_POLL_FDS, Pid, ProcessState, UserContext};
use ferrox_abi::{Errno, KResult, PATH_MAX};
use ferrox_fs::vfs::NodeId;
use ferrox_fs::vfs::OfdId;
use ferrox_lib::kernel_services::{WaitChannel, WakeOutcome};
use ferrox_lib::{IrqMutex, LinkArena, ListHead, ListLink};

use segments::{Segment, SegmentKind};

pub use ferrox_abi::task::MAX_PROCESSES;

pub const NO_SLOT: u16 = u16::MAX;
pub const NO_TIMER: u16 = u16::MAX;
pub const WAIT_BUCKETS: usize = 32;

// =============================================================================
// FPU state (FXSAVE area)
// =============================================================================

pub const FPU_STATE_SIZE: usize = 512;

#[repr(C, align(16))]
#[derive(Copy, Clone)]
pub struct FpuState {
    pub data: [u8; FPU_STATE_SIZE],
}

impl FpuState {
    pub const fn zero() -> Self {
        Self {
            data: [0; FPU_STATE_SIZE],
        }
    }
}

// =============================================================================
// Per-process records
// =============================================================================

#[derive(Copy, Clone)]
pub struct SignalRecord {
    /// SIG_DFL, SIG_IGN, or a user handler address.
    pub handler: u32,
    pub sa_flags: u32,
    pub sa_mask: SigSet,
    pub pending: bool,
    /// Generated by an unrecoverable fault; sticky and top priority.
    pub fault: bool,
}

impl SignalRecord {
    pub const fn default_record() -> Self {
        Self {
            handler: SIG_DFL,
            sa_flags: 0,
            sa_mask: 0,
            pending: false,
            fault: false,
        }
    }
}

#[derive(Copy, Clone)]
pub struct FdEntry {
    pub ofd: OfdId,
    pub used: bool,
    pub cloexec: bool,
}

impl FdEntry {
    pub const fn empty() -> Self {
        Self {
            ofd: 0,
            used: false,
            cloexec: false,
        }
    }
}

#[derive(Copy, Clone)]
pub struct PollMonitor {
    pub fd: i32,
    pub events: u16,
    pub node: NodeId,
}

impl PollMonitor {
    pub const fn empty() -> Self {
        Self {
            fd: -1,
            events: 0,
            node: 0,
        }
    }
}

pub struct Process {
    pub pid: Pid,
    pub state: ProcessState,
    pub parent: u16,
    pub children: ListHead,
    pub sibling_link: ListLink,

    pub run_link: ListLink,
    pub wait_link: ListLink,
    pub wait_channel: WaitChannel,
    pub wake_outcome: WakeOutcome,

    pub code: Segment,
    pub data: Segment,
    pub stack: Segment,

    /// State at the last interrupt entry and the last syscall entry;
    /// signal delivery rewrites the latter.
    pub ctx_interrupt: UserContext,
    pub ctx_syscall: UserContext,

    pub exit_status: ExitStatus,
    /// A state change the parent has not collected yet.
    pub notify_parent: Option<ExitStatus>,

    pub blocked: SigSet,
    pub signals: [SignalRecord; NSIG],

    pub fds: [FdEntry; MAX_FDS],
    pub monitors: [PollMonitor; MAX_POLL_FDS],
    pub monitor_count: usize,

    pub cwd: [u8; PATH_MAX],
    pub cwd_len: usize,
    pub umask: u16,

    pub group: u16,
    pub group_link: ListLink,

    pub fpu: FpuState,
    pub fpu_initialized: bool,

    pub sched_iteration: u32,
    pub ticks_this_iteration: u32,

    pub sleep_timer: u16,
}

impl Process {
    pub const fn empty() -> Self {
        Self {
            pid: 0,
            state: ProcessState::Absent,
            parent: NO_SLOT,
            children: ListHead::new(),
            sibling_link: ListLink::new(),
            run_link: ListLink::new(),
            wait_link: ListLink::new(),
            wait_channel: WaitChannel(0),
            wake_outcome: WakeOutcome::Completed,
            code: Segment::new(SegmentKind::Code),
            data: Segment::new(SegmentKind::Data),
            stack: Segment::new(SegmentKind::Stack),
            ctx_interrupt: UserContext::zero(),
            ctx_syscall: UserContext::zero(),
            exit_status: ExitStatus(0),
            notify_parent: None,
            blocked: 0,
            signals: [SignalRecord::default_record(); NSIG],
            fds: [FdEntry::empty(); MAX_FDS],
            monitors: [PollMonitor::empty(); MAX_POLL_FDS],
            monitor_count: 0,
            cwd: [0; PATH_MAX],
            cwd_len: 0,
            umask: ferrox_abi::fs::DEFAULT_UMASK,
            group: NO_SLOT,
            group_link: ListLink::new(),
            fpu: FpuState::zero(),
            fpu_initialized: false,
            sched_iteration: 0,
            ticks_this_iteration: 0,
            sleep_timer: NO_TIMER,
        }
    }

    pub fn cwd_bytes(&self) -> &[u8] {
        if self.cwd_len == 0 {
            b"/"
        } else {
            &self.cwd[..self.cwd_len]
        }
    }

    pub fn set_cwd(&mut self, path: &[u8]) {
        self.cwd[..path.len()].copy_from_slice(path);
        self.cwd_len = path.len();
    }
}

// =============================================================================
// Table and link arenas
// =============================================================================

pub struct ProcessTable {
    pub procs: [Process; MAX_PROCESSES],
    pub runnable: ListHead,
    pub wait_buckets: [ListHead; WAIT_BUCKETS],
    pub current: u16,
    pub iteration: u32,
    pub next_pid: Pid,
    pub groups: [crate::jobctl::ProcessGroup; crate::jobctl::MAX_PROCESS_GROUPS],
    pub sessions: [crate::jobctl::Session; crate::jobctl::MAX_SESSIONS],
}

macro_rules! link_arena {
    ($name:ident, $field:ident) => {
        pub struct $name<'a>(pub &'a mut [Process; MAX_PROCESSES]);

        impl LinkArena for $name<'_> {
            fn link(&self, index: u16) -> &ListLink {
                &self.0[index as usize].$field
            }
            fn link_mut(&mut self, index: u16) -> &mut ListLink {
                &mut self.0[index as usize].$field
            }
        }
    };
}

link_arena!(RunLinks, run_link);
link_arena!(WaitLinks, wait_link);
link_arena!(SiblingLinks, sibling_link);
link_arena!(GroupLinks, group_link);

pub static TABLE: IrqMutex<ProcessTable> = IrqMutex::new(ProcessTable {
    procs: [const { Process::empty() }; MAX_PROCESSES],
    runnable: ListHead::new(),
    wait_buckets: [ListHead::new(); WAIT_BUCKETS],
    current: NO_SLOT,
    iteration: 0,
    next_pid: 1,
    groups: [crate::jobctl::ProcessGroup::empty(); crate::jobctl::MAX_PROCESS_GROUPS],
    sessions: [crate::jobctl::Session::empty(); crate::jobctl::MAX_SESSIONS],
});

pub fn wait_bucket_of(channel: WaitChannel) -> usize {
    channel.0 as usize % WAIT_BUCKETS
}

impl ProcessTable {
    pub fn slot_by_pid(&self, pid: Pid) -> Option<u16> {
        self.procs
            .iter()
            .position(|p| p.state != ProcessState::Absent && p.pid == pid)
            .map(|slot| slot as u16)
    }

    pub fn free_slot(&self) -> Option<u16> {
        self.procs
            .iter()
            .position(|p| p.state == ProcessState::Absent)
            .map(|slot| slot as u16)
    }

    pub fn allocate_pid(&mut self) -> Pid {
        loop {
            let pid = self.next_pid;
            self.next_pid = self.next_pid.wrapping_add(1).max(1);
            if self.slot_by_pid(pid).is_none() {
                return pid;
            }
        }
    }
}

pub fn current_slot() -> u16 {
    TABLE.lock().current
}

pub fn current_pid() -> Pid {
    let table = TABLE.lock();
    if table.current == NO_SLOT {
        0
    } else {
        table.procs[table.current as usize].pid
    }
}

// =============================================================================
// User memory access
// =============================================================================

/// Copy out of the process's address space; EFAULT outside any segment.
pub fn copy_from_user(slot: u16, va: u32, buf: &mut [u8]) -> KResult<()> {
    let table = TABLE.lock();
    let proc = &table.procs[slot as usize];
    let va = va as u64;
    for segment in [&proc.code, &proc.data, &proc.stack] {
        if segment.contains(va) {
            return segment.read_bytes(va, buf);
        }
    }
    Err(Errno::EFAULT)
}

pub fn copy_to_user(slot: u16, va: u32, buf: &[u8]) -> KResult<()> {
    let table = TABLE.lock();
    let proc = &table.procs[slot as usize];
    let va = va as u64;
    for segment in [&proc.code, &proc.data, &proc.stack] {
        if segment.contains(va) {
            return segment.write_bytes(va, buf);
        }
    }
    Err(Errno::EFAULT)
}

/// Copy a NUL-terminated user string into `buf`; returns its length.
pub fn copy_string_from_user(slot: u16, va: u32, buf: &mut [u8]) -> KResult<usize> {
    for i in 0..buf.len() {
        let mut byte = [0u8; 1];
        copy_from_user(slot, va + i as u32, &mut byte)?;
        if byte[0] == 0 {
            return Ok(i);
        }
        buf[i] = byte[0];
    }
    Err(Errno::ENAMETOOLONG)
}

// =============================================================================
// File descriptor table
// =============================================================================

pub fn fd_lookup(slot: u16, fd: u32) -> KResult<OfdId> {
    let table = TABLE.lock();
    let entry = table.procs[slot as usize]
        .fds
        .get(fd as usize)
        .ok_or(Errno::EBADF)?;
    if !entry.used {
        return Err(Errno::EBADF);
    }
    Ok(entry.ofd)
}

/// Install `ofd` at the lowest free descriptor at or above `from`.
pub fn fd_install(slot: u16, ofd: OfdId, cloexec: bool, from: usize) -> KResult<u32> {
    let mut table = TABLE.lock();
    let fds = &mut table.procs[slot as usize].fds;
    for (fd, entry) in fds.iter_mut().enumerate().skip(from) {
        if !entry.used {
            *entry = FdEntry {
                ofd,
                used: true,
                cloexec,
            };
            return Ok(fd as u32);
        }
    }
    Err(Errno::EMFILE)
}

pub fn fd_remove(slot: u16, fd: u32) -> KResult<OfdId> {
    let mut table = TABLE.lock();
    let entry = table.procs[slot as usize]
        .fds
        .get_mut(fd as usize)
        .ok_or(Errno::EBADF)?;
    if !entry.used {
        return Err(Errno::EBADF);
    }
    entry.used = false;
    Ok(entry.ofd)
}
