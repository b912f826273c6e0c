//! Process, signal, and time syscall handlers.

use ferrox_abi::signal::{SigSet, UserSigaction};
use ferrox_abi::task::{DATA_BASE, ProcessState};
use ferrox_abi::{Errno, KResult, PAGE_SIZE, PATH_MAX};
use ferrox_lib::kernel_services::platform;
use ferrox_lib::kernel_services::{WaitChannel, WakeOutcome};

use crate::process::{NO_SLOT, NO_TIMER, TABLE, copy_from_user, copy_string_from_user, copy_to_user};
use crate::process::lifecycle;
use crate::signal::{self, KillScope};
use crate::{command, jobctl, sched};

use super::{SyscallArgs, SyscallOut};

// =============================================================================
// Identity
// =============================================================================

pub fn sys_getpid(slot: u16) -> KResult<SyscallOut> {
    let table = TABLE.lock();
    Ok(SyscallOut(table.procs[slot as usize].pid, 0, 0))
}

pub fn sys_getppid(slot: u16) -> KResult<SyscallOut> {
    let table = TABLE.lock();
    let parent = table.procs[slot as usize].parent;
    let ppid = if parent == NO_SLOT {
        0
    } else {
        table.procs[parent as usize].pid
    };
    Ok(SyscallOut(ppid, 0, 0))
}

// =============================================================================
// Lifecycle
// =============================================================================

pub fn sys_fork(_slot: u16) -> KResult<SyscallOut> {
    let child = lifecycle::fork()?;
    Ok(SyscallOut(child, 0, 0))
}

pub fn sys_exec(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let mut path = [0u8; PATH_MAX];
    let path_len = copy_string_from_user(slot, args.ebx, &mut path)?;
    lifecycle::exec(&path[..path_len], args.ecx, args.edx)?;
    // The dispatcher must not clobber the fresh entry registers: report
    // success by handing back exactly what exec staged.
    let table = TABLE.lock();
    let ctx = &table.procs[slot as usize].ctx_syscall;
    Ok(SyscallOut(ctx.ebx, ctx.ecx, ctx.edx))
}

pub fn sys_exit(_slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    lifecycle::exit_current(args.ebx as u8);
    Ok(SyscallOut::default())
}

pub fn sys_wait(_slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let (pid, status) = lifecycle::wait(args.ebx as i32, args.ecx)?;
    Ok(SyscallOut(status.0 as u32, pid, 0))
}

// =============================================================================
// Memory
// =============================================================================

/// brk: grow or shrink the data segment; returns its new end.
pub fn sys_brk(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let increment = args.ebx as i32;
    let mut table = TABLE.lock();
    let data = &mut table.procs[slot as usize].data;
    let current_end = DATA_BASE as u64 + data.byte_len();
    if increment != 0 {
        let new_end = if increment > 0 {
            current_end + increment as u64
        } else {
            current_end.saturating_sub((-increment) as u64)
        };
        let new_end = new_end.max(DATA_BASE as u64);
        let pages = ((new_end - DATA_BASE as u64) as usize).div_ceil(PAGE_SIZE);
        data.resize(pages)?;
    }
    let end = DATA_BASE as u64 + table.procs[slot as usize].data.byte_len();
    Ok(SyscallOut(end as u32, 0, 0))
}

// =============================================================================
// Time and sleep
// =============================================================================

pub fn sys_time() -> KResult<SyscallOut> {
    Ok(SyscallOut(platform::wall_clock_seconds(), 0, 0))
}

fn sleep_expired(pid: u32) {
    sched::wake_sleeper(pid);
}

/// Sleep for ebx milliseconds; EINTR reports the remainder in ebx.
pub fn sys_sleep(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let ms = args.ebx as u64;
    if ms == 0 {
        return Ok(SyscallOut::default());
    }
    let pid = crate::process::current_pid();
    let timer = command::schedule(ms, None, sleep_expired, pid)?;
    TABLE.lock().procs[slot as usize].sleep_timer = timer;

    let woke = sched::block_current(WaitChannel::sleep(pid), ProcessState::SuspendedSleeping);

    TABLE.lock().procs[slot as usize].sleep_timer = NO_TIMER;
    match woke {
        WakeOutcome::Completed => Ok(SyscallOut::default()),
        WakeOutcome::Interrupted => {
            // The signal cancels the wakeup; the residue goes back to
            // the caller alongside EINTR.
            let remaining = command::cancel(timer).unwrap_or(0);
            let mut table = TABLE.lock();
            table.procs[slot as usize].ctx_syscall.ebx = remaining as u32;
            Err(Errno::EINTR)
        }
    }
}

// =============================================================================
// Signals
// =============================================================================

pub fn sys_sigaction(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let signum = args.ebx as u8;
    let new = if args.ecx != 0 {
        let mut raw = [0u8; core::mem::size_of::<UserSigaction>()];
        copy_from_user(slot, args.ecx, &mut raw)?;
        Some(UserSigaction {
            sa_handler: u32::from_le_bytes(raw[0..4].try_into().unwrap_or_default()),
            sa_flags: u32::from_le_bytes(raw[4..8].try_into().unwrap_or_default()),
            sa_mask: u64::from_le_bytes(raw[8..16].try_into().unwrap_or_default()),
        })
    } else {
        None
    };
    let mut old = UserSigaction::default_action();
    signal::change_signal_action(signum, new.as_ref(), Some(&mut old))?;
    if args.edx != 0 {
        let mut raw = [0u8; core::mem::size_of::<UserSigaction>()];
        raw[0..4].copy_from_slice(&old.sa_handler.to_le_bytes());
        raw[4..8].copy_from_slice(&old.sa_flags.to_le_bytes());
        raw[8..16].copy_from_slice(&old.sa_mask.to_le_bytes());
        copy_to_user(slot, args.edx, &raw)?;
    }
    Ok(SyscallOut::default())
}

pub fn sys_kill(_slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let scope = KillScope::from_raw(args.ebx as i32);
    signal::generate(scope, args.ecx as u8, false)?;
    Ok(SyscallOut::default())
}

pub fn sys_sigprocmask(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let set = if args.ecx != 0 {
        let mut raw = [0u8; 8];
        copy_from_user(slot, args.ecx, &mut raw)?;
        Some(SigSet::from_le_bytes(raw))
    } else {
        None
    };
    let old = signal::change_signals_blockage(args.ebx, set)?;
    if args.edx != 0 {
        copy_to_user(slot, args.edx, &old.to_le_bytes())?;
    }
    Ok(SyscallOut::default())
}

// =============================================================================
// Job control
// =============================================================================

pub fn sys_setsid() -> KResult<SyscallOut> {
    let sid = jobctl::setsid()?;
    Ok(SyscallOut(sid, 0, 0))
}

pub fn sys_getsid(args: SyscallArgs) -> KResult<SyscallOut> {
    let sid = jobctl::getsid(args.ebx)?;
    Ok(SyscallOut(sid, 0, 0))
}

pub fn sys_setpgid(args: SyscallArgs) -> KResult<SyscallOut> {
    jobctl::setpgid(args.ebx, args.ecx)?;
    Ok(SyscallOut::default())
}

pub fn sys_getpgid(args: SyscallArgs) -> KResult<SyscallOut> {
    let pgid = jobctl::getpgid(args.ebx)?;
    Ok(SyscallOut(pgid, 0, 0))
}

// =============================================================================
// Misc
// =============================================================================

pub fn sys_umask(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let mut table = TABLE.lock();
    let proc = &mut table.procs[slot as usize];
    let old = proc.umask;
    proc.umask = (args.ebx as u16) & 0o777;
    Ok(SyscallOut(old as u32, 0, 0))
}

pub fn sys_reboot() -> KResult<SyscallOut> {
    let _ = ferrox_fs::ext2::unmount_all();
    platform::reboot();
}
