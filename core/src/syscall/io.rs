//! File and I/O syscall handlers.

use ferrox_abi::fs::{
    Dirent, F_DUPFD, F_GETFD, F_GETFL, F_SETFD, F_SETFL, FD_CLOEXEC, OpenFlags, POLLERR, POLLHUP,
    POLLIN, POLLOUT, PollFd, Stat,
};
use ferrox_abi::task::{MAX_POLL_FDS, Pid, ProcessState};
use ferrox_abi::termios::{
    TCGETS, TCSETS, TIOCGPGRP, TIOCGWINSZ, TIOCSCTTY, TIOCSPGRP, Termios, Winsize,
};
use ferrox_abi::{Errno, KResult, PAGE_SIZE, PATH_MAX};
use ferrox_fs::vfs::node::{NodeKind, node_kind};
use ferrox_fs::vfs::{self, ofd};
use ferrox_fs::{blockcache, pipe};
use ferrox_lib::kernel_services::tty_runtime;
use ferrox_lib::kernel_services::{WaitChannel, WakeOutcome};
use ferrox_mm::{alloc_kernel_frame, frame_ptr, free_frame};

use crate::process::{
    PollMonitor, TABLE, copy_from_user, copy_string_from_user, copy_to_user, fd_install,
    fd_lookup, fd_remove,
};
use crate::{command, jobctl, sched};

use super::{SyscallArgs, SyscallOut};

fn user_path(slot: u16, va: u32, buf: &mut [u8; PATH_MAX]) -> KResult<usize> {
    copy_string_from_user(slot, va, buf)
}

fn cwd_of(slot: u16) -> ([u8; PATH_MAX], usize) {
    let table = TABLE.lock();
    let mut cwd = [0u8; PATH_MAX];
    let bytes = table.procs[slot as usize].cwd_bytes();
    cwd[..bytes.len()].copy_from_slice(bytes);
    (cwd, bytes.len())
}

fn umask_of(slot: u16) -> u16 {
    TABLE.lock().procs[slot as usize].umask
}

/// A page-sized kernel bounce buffer; frames are the only allocator.
struct Bounce {
    frame: ferrox_mm::FrameId,
}

impl Bounce {
    fn new() -> KResult<Self> {
        let frame = alloc_kernel_frame().ok_or(Errno::ENOMEM)?;
        Ok(Self { frame })
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: the frame is exclusively owned until drop.
        unsafe { core::slice::from_raw_parts_mut(frame_ptr(self.frame), PAGE_SIZE) }
    }
}

impl Drop for Bounce {
    fn drop(&mut self) {
        free_frame(self.frame);
    }
}

// =============================================================================
// open / close / read / write
// =============================================================================

pub fn sys_open(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let mut path = [0u8; PATH_MAX];
    let path_len = user_path(slot, args.ebx, &mut path)?;
    let flags = OpenFlags::from_bits_retain(args.ecx);
    let mode = (args.edx as u16) & !umask_of(slot);
    let (cwd, cwd_len) = cwd_of(slot);

    let ofd_id = vfs::open_path(&path[..path_len], &cwd[..cwd_len], flags, mode)?;
    match fd_install(slot, ofd_id, flags.contains(OpenFlags::CLOEXEC), 0) {
        Ok(fd) => Ok(SyscallOut(fd, 0, 0)),
        Err(e) => {
            let _ = ofd::release(ofd_id);
            Err(e)
        }
    }
}

pub fn sys_close(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let ofd_id = fd_remove(slot, args.ebx)?;
    ofd::release(ofd_id)?;
    Ok(SyscallOut::default())
}

pub fn sys_read(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let ofd_id = fd_lookup(slot, args.ebx)?;
    let user_buf = args.ecx;
    let len = args.edx as usize;
    if len == 0 {
        return Ok(SyscallOut::default());
    }
    let mut bounce = Bounce::new()?;
    let want = core::cmp::min(len, PAGE_SIZE);
    let count = ofd::read(ofd_id, &mut bounce.bytes_mut()[..want])?;
    copy_to_user(slot, user_buf, &bounce.bytes_mut()[..count])?;
    Ok(SyscallOut(count as u32, 0, 0))
}

pub fn sys_write(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let ofd_id = fd_lookup(slot, args.ebx)?;
    let user_buf = args.ecx;
    let len = args.edx as usize;
    let mut written = 0usize;
    let mut bounce = Bounce::new()?;
    while written < len {
        let chunk = core::cmp::min(len - written, PAGE_SIZE);
        copy_from_user(slot, user_buf + written as u32, &mut bounce.bytes_mut()[..chunk])?;
        let count = ofd::write(ofd_id, &bounce.bytes_mut()[..chunk])?;
        written += count;
        if count < chunk {
            break;
        }
    }
    Ok(SyscallOut(written as u32, 0, 0))
}

// =============================================================================
// Metadata
// =============================================================================

pub fn sys_stat(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let ofd_id = fd_lookup(slot, args.ebx)?;
    let mut stat = Stat::default();
    ofd::status(ofd_id, &mut stat)?;
    let bytes = unsafe {
        // SAFETY: Stat is repr(C) plain data.
        core::slice::from_raw_parts(
            (&stat as *const Stat).cast::<u8>(),
            core::mem::size_of::<Stat>(),
        )
    };
    copy_to_user(slot, args.ecx, bytes)?;
    Ok(SyscallOut::default())
}

pub fn sys_readdir(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let ofd_id = fd_lookup(slot, args.ebx)?;
    let mut entry = Dirent::empty();
    let has_entry = ofd::read_directory_entry(ofd_id, &mut entry)?;
    if has_entry {
        let bytes = unsafe {
            // SAFETY: Dirent is repr(C) plain data.
            core::slice::from_raw_parts(
                (&entry as *const Dirent).cast::<u8>(),
                core::mem::size_of::<Dirent>(),
            )
        };
        copy_to_user(slot, args.ecx, bytes)?;
    }
    Ok(SyscallOut(if has_entry { 0 } else { 1 }, 0, 0))
}

pub fn sys_lseek(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let ofd_id = fd_lookup(slot, args.ebx)?;
    let offset = ofd::seek(ofd_id, args.ecx as i32 as i64, args.edx)?;
    Ok(SyscallOut(offset as u32, 0, 0))
}

pub fn sys_ftruncate(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let ofd_id = fd_lookup(slot, args.ebx)?;
    ofd::truncate(ofd_id, args.ecx as u64)?;
    Ok(SyscallOut::default())
}

// =============================================================================
// Namespace
// =============================================================================

pub fn sys_mkdir(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let mut path = [0u8; PATH_MAX];
    let path_len = user_path(slot, args.ebx, &mut path)?;
    let mode = (args.ecx as u16) & !umask_of(slot);
    let (cwd, cwd_len) = cwd_of(slot);
    vfs::make_directory(&path[..path_len], &cwd[..cwd_len], mode)?;
    Ok(SyscallOut::default())
}

pub fn sys_unlink(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let mut path = [0u8; PATH_MAX];
    let path_len = user_path(slot, args.ebx, &mut path)?;
    let (cwd, cwd_len) = cwd_of(slot);
    vfs::unlink(&path[..path_len], &cwd[..cwd_len])?;
    Ok(SyscallOut::default())
}

pub fn sys_rmdir(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let mut path = [0u8; PATH_MAX];
    let path_len = user_path(slot, args.ebx, &mut path)?;
    let (cwd, cwd_len) = cwd_of(slot);
    vfs::remove_directory(&path[..path_len], &cwd[..cwd_len])?;
    Ok(SyscallOut::default())
}

pub fn sys_link(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let mut existing = [0u8; PATH_MAX];
    let existing_len = user_path(slot, args.ebx, &mut existing)?;
    let mut new_path = [0u8; PATH_MAX];
    let new_len = user_path(slot, args.ecx, &mut new_path)?;
    let (cwd, cwd_len) = cwd_of(slot);
    vfs::link(&existing[..existing_len], &new_path[..new_len], &cwd[..cwd_len])?;
    Ok(SyscallOut::default())
}

pub fn sys_symlink(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let mut target = [0u8; PATH_MAX];
    let target_len = user_path(slot, args.ebx, &mut target)?;
    let mut path = [0u8; PATH_MAX];
    let path_len = user_path(slot, args.ecx, &mut path)?;
    let (cwd, cwd_len) = cwd_of(slot);
    vfs::symlink(&target[..target_len], &path[..path_len], &cwd[..cwd_len])?;
    Ok(SyscallOut::default())
}

pub fn sys_rename(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let mut old = [0u8; PATH_MAX];
    let old_len = user_path(slot, args.ebx, &mut old)?;
    let mut new = [0u8; PATH_MAX];
    let new_len = user_path(slot, args.ecx, &mut new)?;
    let (cwd, cwd_len) = cwd_of(slot);
    vfs::rename(&old[..old_len], &new[..new_len], &cwd[..cwd_len])?;
    Ok(SyscallOut::default())
}

// =============================================================================
// Working directory
// =============================================================================

pub fn sys_getcwd(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let (cwd, cwd_len) = cwd_of(slot);
    if cwd_len + 1 > args.ecx as usize {
        return Err(Errno::ERANGE);
    }
    copy_to_user(slot, args.ebx, &cwd[..cwd_len])?;
    copy_to_user(slot, args.ebx + cwd_len as u32, &[0u8])?;
    Ok(SyscallOut(cwd_len as u32, 0, 0))
}

pub fn sys_chdir(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let mut path = [0u8; PATH_MAX];
    let path_len = user_path(slot, args.ebx, &mut path)?;
    let (cwd, cwd_len) = cwd_of(slot);
    let mut canon = [0u8; PATH_MAX];
    let canon_len =
        vfs::canonicalize_directory(&path[..path_len], &cwd[..cwd_len], &mut canon)?;
    TABLE.lock().procs[slot as usize].set_cwd(&canon[..canon_len]);
    Ok(SyscallOut::default())
}

// =============================================================================
// Descriptors
// =============================================================================

pub fn sys_dup(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let ofd_id = fd_lookup(slot, args.ebx)?;
    let target = args.ecx as i32;
    if target < 0 {
        ofd::add_ref(ofd_id);
        match fd_install(slot, ofd_id, false, 0) {
            Ok(fd) => Ok(SyscallOut(fd, 0, 0)),
            Err(e) => {
                let _ = ofd::release(ofd_id);
                Err(e)
            }
        }
    } else {
        let target = target as u32;
        if target as usize >= ferrox_abi::task::MAX_FDS {
            return Err(Errno::EBADF);
        }
        if target == args.ebx {
            return Ok(SyscallOut(target, 0, 0));
        }
        if let Ok(old) = fd_remove(slot, target) {
            let _ = ofd::release(old);
        }
        ofd::add_ref(ofd_id);
        let mut table = TABLE.lock();
        table.procs[slot as usize].fds[target as usize] = crate::process::FdEntry {
            ofd: ofd_id,
            used: true,
            cloexec: false,
        };
        Ok(SyscallOut(target, 0, 0))
    }
}

pub fn sys_fcntl_fd(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let fd = args.ebx;
    let _ = fd_lookup(slot, fd)?;
    match args.ecx {
        F_DUPFD => {
            let ofd_id = fd_lookup(slot, fd)?;
            ofd::add_ref(ofd_id);
            match fd_install(slot, ofd_id, false, args.edx as usize) {
                Ok(new_fd) => Ok(SyscallOut(new_fd, 0, 0)),
                Err(e) => {
                    let _ = ofd::release(ofd_id);
                    Err(e)
                }
            }
        }
        F_GETFD => {
            let table = TABLE.lock();
            let cloexec = table.procs[slot as usize].fds[fd as usize].cloexec;
            Ok(SyscallOut(if cloexec { FD_CLOEXEC } else { 0 }, 0, 0))
        }
        F_SETFD => {
            let mut table = TABLE.lock();
            table.procs[slot as usize].fds[fd as usize].cloexec =
                args.edx & FD_CLOEXEC != 0;
            Ok(SyscallOut::default())
        }
        _ => Err(Errno::EINVAL),
    }
}

/// fcntl on the open-file-description: status flags.
pub fn sys_fcntl_desc(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let ofd_id = fd_lookup(slot, args.ebx)?;
    match args.ecx {
        F_GETFL => Ok(SyscallOut(ofd::flags_of(ofd_id)?.bits(), 0, 0)),
        F_SETFL => {
            ofd::set_status_flags(ofd_id, OpenFlags::from_bits_retain(args.edx))?;
            Ok(SyscallOut::default())
        }
        _ => Err(Errno::EINVAL),
    }
}

pub fn sys_pipe(slot: u16) -> KResult<SyscallOut> {
    let (read_ofd, write_ofd) = pipe::create()?;
    let read_fd = match fd_install(slot, read_ofd, false, 0) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = ofd::release(read_ofd);
            let _ = ofd::release(write_ofd);
            return Err(e);
        }
    };
    let write_fd = match fd_install(slot, write_ofd, false, 0) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = fd_remove(slot, read_fd);
            let _ = ofd::release(read_ofd);
            let _ = ofd::release(write_ofd);
            return Err(e);
        }
    };
    Ok(SyscallOut(read_fd, write_fd, 0))
}

// =============================================================================
// ioctl
// =============================================================================

pub fn sys_ioctl(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let ofd_id = fd_lookup(slot, args.ebx)?;
    let node = ofd::node_of(ofd_id)?;
    let NodeKind::Tty { index } = node_kind(node) else {
        return Err(Errno::ENOTTY);
    };
    match args.ecx {
        TCGETS => {
            let termios = tty_runtime::tty_get_termios(index);
            let bytes = unsafe {
                // SAFETY: Termios is repr(C) plain data.
                core::slice::from_raw_parts(
                    (&termios as *const Termios).cast::<u8>(),
                    core::mem::size_of::<Termios>(),
                )
            };
            copy_to_user(slot, args.edx, bytes)?;
            Ok(SyscallOut::default())
        }
        TCSETS => {
            let mut termios = tty_runtime::tty_get_termios(index);
            let bytes = unsafe {
                // SAFETY: as above, and the kernel copy is private.
                core::slice::from_raw_parts_mut(
                    (&mut termios as *mut Termios).cast::<u8>(),
                    core::mem::size_of::<Termios>(),
                )
            };
            copy_from_user(slot, args.edx, bytes)?;
            tty_runtime::tty_set_termios(index, termios)?;
            Ok(SyscallOut::default())
        }
        TIOCGPGRP => {
            let pgid = tty_runtime::tty_get_pgrp(index);
            copy_to_user(slot, args.edx, &pgid.to_le_bytes())?;
            Ok(SyscallOut::default())
        }
        TIOCSPGRP => {
            let mut pgid_bytes = [0u8; 4];
            copy_from_user(slot, args.edx, &mut pgid_bytes)?;
            tty_runtime::tty_set_pgrp(index, Pid::from_le_bytes(pgid_bytes))?;
            Ok(SyscallOut::default())
        }
        TIOCGWINSZ => {
            let winsize = tty_runtime::tty_get_winsize(index);
            let bytes = unsafe {
                // SAFETY: Winsize is repr(C) plain data.
                core::slice::from_raw_parts(
                    (&winsize as *const Winsize).cast::<u8>(),
                    core::mem::size_of::<Winsize>(),
                )
            };
            copy_to_user(slot, args.edx, bytes)?;
            Ok(SyscallOut::default())
        }
        TIOCSCTTY => {
            let sid = jobctl::session_of_current();
            if tty_runtime::tty_session(index) != 0
                || !jobctl::try_acquire_controlling_tty(sid, index)
            {
                return Err(Errno::EPERM);
            }
            Ok(SyscallOut::default())
        }
        _ => Err(Errno::EINVAL),
    }
}

// =============================================================================
// poll
// =============================================================================

fn poll_scan(slot: u16, fds: &mut [PollFd]) -> usize {
    let mut ready = 0usize;
    for entry in fds.iter_mut() {
        entry.revents = 0;
        if entry.fd < 0 {
            continue;
        }
        match fd_lookup(slot, entry.fd as u32).and_then(ofd::poll) {
            Ok((readable, writable)) => {
                if readable && entry.events & POLLIN != 0 {
                    entry.revents |= POLLIN;
                }
                if writable && entry.events & POLLOUT != 0 {
                    entry.revents |= POLLOUT;
                }
            }
            Err(_) => entry.revents |= POLLERR | POLLHUP,
        }
        if entry.revents != 0 {
            ready += 1;
        }
    }
    ready
}

pub fn sys_poll(slot: u16, args: SyscallArgs) -> KResult<SyscallOut> {
    let nfds = args.ecx as usize;
    if nfds > MAX_POLL_FDS {
        return Err(Errno::EINVAL);
    }
    let timeout_ms = args.edx as i32;

    let mut fds = [PollFd::default(); MAX_POLL_FDS];
    let raw = unsafe {
        // SAFETY: PollFd is repr(C) plain data.
        core::slice::from_raw_parts_mut(
            fds.as_mut_ptr().cast::<u8>(),
            nfds * core::mem::size_of::<PollFd>(),
        )
    };
    copy_from_user(slot, args.ebx, raw)?;

    let mut timer = None;
    loop {
        let ready = poll_scan(slot, &mut fds[..nfds]);
        if ready > 0 || timeout_ms == 0 {
            if let Some(timer) = timer {
                command::cancel(timer);
            }
            write_pollfds_back(slot, args.ebx, &fds[..nfds])?;
            return Ok(SyscallOut(ready as u32, 0, 0));
        }

        // Install monitors and (once) the timeout command.
        {
            let mut table = TABLE.lock();
            let proc = &mut table.procs[slot as usize];
            proc.monitor_count = 0;
            for entry in fds[..nfds].iter() {
                if entry.fd < 0 {
                    continue;
                }
                drop(table);
                let node = fd_lookup(slot, entry.fd as u32).and_then(ofd::node_of)?;
                table = TABLE.lock();
                let proc = &mut table.procs[slot as usize];
                proc.monitors[proc.monitor_count] = PollMonitor {
                    fd: entry.fd,
                    events: entry.events,
                    node,
                };
                proc.monitor_count += 1;
            }
        }
        if timer.is_none() && timeout_ms > 0 {
            let pid = crate::process::current_pid();
            timer = Some(command::schedule(
                timeout_ms as u64,
                None,
                poll_timeout_fired,
                pid,
            )?);
        }

        let pid = crate::process::current_pid();
        let woke = sched::block_current(
            WaitChannel::sleep(pid),
            ProcessState::SuspendedWaitingIoEvent,
        );
        if woke == WakeOutcome::Interrupted {
            if let Some(timer) = timer {
                command::cancel(timer);
            }
            return Err(Errno::EINTR);
        }
        if let Some(id) = timer {
            match command::cancel(id) {
                None => {
                    // The timeout fired; report whatever is ready now.
                    let ready = poll_scan(slot, &mut fds[..nfds]);
                    write_pollfds_back(slot, args.ebx, &fds[..nfds])?;
                    return Ok(SyscallOut(ready as u32, 0, 0));
                }
                Some(remaining) => {
                    // Events woke us early; rearm with the residue.
                    let pid = crate::process::current_pid();
                    timer = Some(command::schedule(
                        remaining.max(1),
                        None,
                        poll_timeout_fired,
                        pid,
                    )?);
                }
            }
        }
    }
}

fn poll_timeout_fired(pid: u32) {
    sched::wake_poller(pid);
}

fn write_pollfds_back(slot: u16, va: u32, fds: &[PollFd]) -> KResult<()> {
    let raw = unsafe {
        // SAFETY: PollFd is repr(C) plain data.
        core::slice::from_raw_parts(
            fds.as_ptr().cast::<u8>(),
            fds.len() * core::mem::size_of::<PollFd>(),
        )
    };
    copy_to_user(slot, va, raw)
}

// =============================================================================
// Cache control
// =============================================================================

pub fn sys_cache_flush() -> KResult<SyscallOut> {
    blockcache::flush()?;
    Ok(SyscallOut::default())
}

pub fn sys_cache_flush_clear() -> KResult<SyscallOut> {
    blockcache::flush()?;
    blockcache::clear();
    Ok(SyscallOut::default())
}
