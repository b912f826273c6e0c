//! Process lifecycle: creation, fork, exec, termination, and wait.

use ferrox_abi::fs::OpenFlags;
use ferrox_abi::signal::{ExitStatus, SIG_DFL, SIGCHLD, SIGCONT, SIGHUP};
use ferrox_abi::task::{
    CODE_BASE, INIT_PID, Pid, ProcessState, STACK_PAGES, UserContext, WCONTINUED,
    WNOHANG, WUNTRACED,
};
use ferrox_abi::{ARG_MAX, Errno, KResult, PAGE_SIZE, PATH_MAX};
use ferrox_fs::vfs::{self, ofd};
use ferrox_lib::kernel_services::tty_runtime;
use ferrox_lib::kernel_services::{WaitChannel, WakeOutcome};
use ferrox_lib::{IrqMutex, klog_debug, klog_error};

use crate::jobctl;
use crate::process::{
    FdEntry, NO_SLOT, NO_TIMER, SiblingLinks, TABLE, copy_from_user, current_slot,
};
use crate::sched;
use crate::signal;

use super::segments::STACK_END;

const MAX_ARGS: usize = 64;
const MAX_SCRIPT_DEPTH: usize = 5;
const SCRIPT_LINE_MAX: usize = 128;

// =============================================================================
// Creation
// =============================================================================

/// Build the init process skeleton: pid 1, its own session and group,
/// cwd at root. The caller execs an image into it and schedules it.
pub fn create_init_process() -> KResult<u16> {
    let mut table = TABLE.lock();
    let slot = table.free_slot().ok_or(Errno::ENOMEM)?;
    let pid = table.allocate_pid();
    debug_assert_eq!(pid, INIT_PID);

    let proc = &mut table.procs[slot as usize];
    *proc = crate::process::Process::empty();
    proc.pid = pid;
    proc.state = ProcessState::Runnable;
    proc.set_cwd(b"/");

    let session = jobctl::session_create_locked(&mut table, pid)?;
    let group = jobctl::group_create_locked(&mut table, pid, session)?;
    jobctl::group_join_locked(&mut table, slot, group);

    sched::make_runnable_locked(&mut table, slot);
    Ok(slot)
}

// =============================================================================
// Fork
// =============================================================================

/// Duplicate the calling process; no copy-on-write, the page frames are
/// copied outright. Returns the child's pid (the child's saved context
/// carries 0 in eax).
pub fn fork() -> KResult<Pid> {
    let parent_slot = current_slot();
    if parent_slot == NO_SLOT {
        return Err(Errno::ESRCH);
    }

    let (child_slot, child_pid) = {
        let mut table = TABLE.lock();
        let child_slot = table.free_slot().ok_or(Errno::ENOMEM)?;
        let child_pid = table.allocate_pid();
        // Claim the slot before the copies happen outside the lock.
        table.procs[child_slot as usize] = crate::process::Process::empty();
        table.procs[child_slot as usize].pid = child_pid;
        table.procs[child_slot as usize].state = ProcessState::SuspendedSleeping;
        (child_slot, child_pid)
    };

    let cleanup = |child_slot: u16| {
        let mut table = TABLE.lock();
        table.procs[child_slot as usize].code.release_all();
        table.procs[child_slot as usize].data.release_all();
        table.procs[child_slot as usize].stack.release_all();
        table.procs[child_slot as usize].state = ProcessState::Absent;
    };

    // Physical copy of all three segments.
    {
        let mut guard = TABLE.lock();
        let table = &mut *guard;
        let (parent, child) = if parent_slot < child_slot {
            let (a, b) = table.procs.split_at_mut(child_slot as usize);
            (&mut a[parent_slot as usize], &mut b[0])
        } else {
            let (a, b) = table.procs.split_at_mut(parent_slot as usize);
            (&mut b[0], &mut a[child_slot as usize])
        };

        let copied = child
            .code
            .clone_from(&parent.code)
            .and_then(|_| child.data.clone_from(&parent.data))
            .and_then(|_| child.stack.clone_from(&parent.stack));
        if let Err(e) = copied {
            drop(guard);
            cleanup(child_slot);
            return Err(e);
        }

        child.ctx_syscall = parent.ctx_syscall;
        child.ctx_interrupt = parent.ctx_interrupt;
        // The child observes a zero return.
        child.ctx_syscall.eax = 0;
        child.ctx_syscall.ebx = 0;

        child.blocked = parent.blocked;
        child.signals = parent.signals;
        for record in child.signals.iter_mut() {
            // Pending signals stay behind, except fault-sticky ones.
            if !record.fault {
                record.pending = false;
            }
        }

        child.fds = parent.fds;
        child.cwd = parent.cwd;
        child.cwd_len = parent.cwd_len;
        child.umask = parent.umask;
        child.fpu = parent.fpu;
        child.fpu_initialized = parent.fpu_initialized;
        child.parent = parent_slot;
    }

    // Each inherited descriptor shares the parent's description.
    let fd_refs: [FdEntry; ferrox_abi::task::MAX_FDS] =
        TABLE.lock().procs[child_slot as usize].fds;
    for entry in fd_refs.iter().filter(|e| e.used) {
        ofd::add_ref(entry.ofd);
    }

    {
        let mut table = TABLE.lock();
        let parent_group = table.procs[parent_slot as usize].group;
        jobctl::group_join_locked(&mut table, child_slot, parent_group);

        let mut children = table.procs[parent_slot as usize].children;
        children.push_back(&mut SiblingLinks(&mut table.procs), child_slot);
        table.procs[parent_slot as usize].children = children;

        sched::make_runnable_locked(&mut table, child_slot);
    }
    klog_debug!("fork: pid {} -> child {}", current_pid_of(parent_slot), child_pid);
    Ok(child_pid)
}

fn current_pid_of(slot: u16) -> Pid {
    TABLE.lock().procs[slot as usize].pid
}

// =============================================================================
// Exec
// =============================================================================

struct ExecStaging {
    bytes: [u8; ARG_MAX],
    used: usize,
    arg_offsets: [u32; MAX_ARGS],
    argc: usize,
    env_offsets: [u32; MAX_ARGS],
    envc: usize,
}

impl ExecStaging {
    const fn new() -> Self {
        Self {
            bytes: [0; ARG_MAX],
            used: 0,
            arg_offsets: [0; MAX_ARGS],
            argc: 0,
            env_offsets: [0; MAX_ARGS],
            envc: 0,
        }
    }

    fn push_string(&mut self, s: &[u8]) -> KResult<u32> {
        if self.used + s.len() + 1 > ARG_MAX {
            return Err(Errno::E2BIG);
        }
        let offset = self.used as u32;
        self.bytes[self.used..self.used + s.len()].copy_from_slice(s);
        self.used += s.len() + 1; // keep the terminator
        Ok(offset)
    }

    fn push_arg(&mut self, s: &[u8]) -> KResult<()> {
        if self.argc == MAX_ARGS {
            return Err(Errno::E2BIG);
        }
        self.arg_offsets[self.argc] = self.push_string(s)?;
        self.argc += 1;
        Ok(())
    }

    fn prepend_arg(&mut self, s: &[u8]) -> KResult<()> {
        if self.argc == MAX_ARGS {
            return Err(Errno::E2BIG);
        }
        let offset = self.push_string(s)?;
        let mut i = self.argc;
        while i > 0 {
            self.arg_offsets[i] = self.arg_offsets[i - 1];
            i -= 1;
        }
        self.arg_offsets[0] = offset;
        self.argc += 1;
        Ok(())
    }

    fn push_env(&mut self, s: &[u8]) -> KResult<()> {
        if self.envc == MAX_ARGS {
            return Err(Errno::E2BIG);
        }
        self.env_offsets[self.envc] = self.push_string(s)?;
        self.envc += 1;
        Ok(())
    }

    fn string_at(&self, offset: u32) -> &[u8] {
        let start = offset as usize;
        let end = self.bytes[start..]
            .iter()
            .position(|b| *b == 0)
            .map(|i| start + i)
            .unwrap_or(start);
        &self.bytes[start..end]
    }
}

static EXEC_STAGING: IrqMutex<ExecStaging> = IrqMutex::new(ExecStaging::new());

/// Read a NUL-terminated array of user string pointers.
fn stage_user_vector(
    slot: u16,
    staging: &mut ExecStaging,
    vector_va: u32,
    env: bool,
) -> KResult<()> {
    if vector_va == 0 {
        return Ok(());
    }
    let mut string_buf = [0u8; PATH_MAX];
    for i in 0..MAX_ARGS as u32 {
        let mut ptr = [0u8; 4];
        copy_from_user(slot, vector_va + i * 4, &mut ptr)?;
        let string_va = u32::from_le_bytes(ptr);
        if string_va == 0 {
            return Ok(());
        }
        let len = crate::process::copy_string_from_user(slot, string_va, &mut string_buf)?;
        if env {
            staging.push_env(&string_buf[..len])?;
        } else {
            staging.push_arg(&string_buf[..len])?;
        }
    }
    Err(Errno::E2BIG)
}

/// Replace the current image with `path`. `#!` scripts prepend their
/// interpreter (bounded nesting); anything else loads as a flat binary
/// at CODE_BASE.
pub fn exec(path: &[u8], argv_va: u32, envp_va: u32) -> KResult<()> {
    let slot = current_slot();
    if slot == NO_SLOT {
        return Err(Errno::ESRCH);
    }
    let mut staging = EXEC_STAGING.lock();
    *staging = ExecStaging::new();
    stage_user_vector(slot, &mut staging, argv_va, false)?;
    stage_user_vector(slot, &mut staging, envp_va, true)?;
    exec_staged(slot, path, staging)
}

/// Exec with kernel-supplied argv: the boot path launching init.
pub fn exec_from_kernel(path: &[u8], argv: &[&[u8]]) -> KResult<()> {
    let slot = current_slot();
    if slot == NO_SLOT {
        return Err(Errno::ESRCH);
    }
    let mut staging = EXEC_STAGING.lock();
    *staging = ExecStaging::new();
    for arg in argv {
        staging.push_arg(arg)?;
    }
    exec_staged(slot, path, staging)
}

fn exec_staged(
    slot: u16,
    path: &[u8],
    mut staging: ferrox_lib::spinlock::IrqMutexGuard<'_, ExecStaging>,
) -> KResult<()> {
    let cwd = {
        let table = TABLE.lock();
        let mut cwd = [0u8; PATH_MAX];
        let len = table.procs[slot as usize].cwd_len.max(1);
        cwd[..len].copy_from_slice(table.procs[slot as usize].cwd_bytes());
        (cwd, len)
    };
    let cwd_bytes = &cwd.0[..cwd.1];

    // Resolve through `#!` chains to the real binary.
    let mut target = [0u8; PATH_MAX];
    let mut target_len = path.len().min(PATH_MAX);
    target[..target_len].copy_from_slice(&path[..target_len]);

    let mut image = None;
    for _depth in 0..=MAX_SCRIPT_DEPTH {
        let fd = vfs::open_path(&target[..target_len], cwd_bytes, OpenFlags::empty(), 0)?;
        let mut head = [0u8; 2];
        let peeked = ofd::read(fd, &mut head)?;
        if peeked == 2 && &head == b"#!" {
            let mut line = [0u8; SCRIPT_LINE_MAX];
            let line_len = ofd::read(fd, &mut line)?;
            ofd::release(fd)?;
            let line_end = line[..line_len]
                .iter()
                .position(|b| *b == b'\n')
                .ok_or(Errno::ENOEXEC)?;
            let (interpreter, argument) = parse_interpreter_line(&line[..line_end])?;

            // The script path becomes the interpreter's argument.
            if staging.argc > 0 {
                let argc = staging.argc;
                staging.arg_offsets.copy_within(1..argc, 0);
                staging.argc -= 1;
            }
            staging.prepend_arg(&target[..target_len])?;
            if let Some(argument) = argument {
                staging.prepend_arg(argument)?;
            }
            let interpreter_owned = {
                let mut buf = [0u8; PATH_MAX];
                buf[..interpreter.len()].copy_from_slice(interpreter);
                (buf, interpreter.len())
            };
            staging.prepend_arg(&interpreter_owned.0[..interpreter_owned.1])?;
            target[..interpreter_owned.1].copy_from_slice(&interpreter_owned.0[..interpreter_owned.1]);
            target_len = interpreter_owned.1;
            continue;
        }
        image = Some(fd);
        break;
    }
    let image = image.ok_or(Errno::ELOOP)?;

    let size = {
        let mut stat = ferrox_abi::fs::Stat::default();
        if let Err(e) = ofd::status(image, &mut stat) {
            let _ = ofd::release(image);
            return Err(e);
        }
        stat.st_size as usize
    };
    if size == 0 {
        let _ = ofd::release(image);
        return Err(Errno::ENOEXEC);
    }
    let code_pages = size.div_ceil(PAGE_SIZE);

    // Past this point the old image is gone; a failure kills the
    // process rather than returning into a half-built address space.
    let rebuilt = rebuild_address_space(slot, image, size, code_pages, &staging);
    let _ = ofd::release(image);
    if let Err(e) = rebuilt {
        klog_error!("exec: image load failed ({:?}), terminating", e);
        drop(staging);
        terminate(slot, ExitStatus::signaled(ferrox_abi::signal::SIGKILL));
        sched::reschedule();
        return Err(e);
    }

    finish_exec(slot);
    Ok(())
}

fn parse_interpreter_line(line: &[u8]) -> KResult<(&[u8], Option<&[u8]>)> {
    let mut rest = line;
    while rest.first() == Some(&b' ') {
        rest = &rest[1..];
    }
    if rest.is_empty() {
        return Err(Errno::ENOEXEC);
    }
    let space = rest.iter().position(|b| *b == b' ');
    match space {
        None => Ok((rest, None)),
        Some(i) => {
            let (interp, mut arg) = rest.split_at(i);
            while arg.first() == Some(&b' ') {
                arg = &arg[1..];
            }
            while arg.last() == Some(&b' ') {
                arg = &arg[..arg.len() - 1];
            }
            Ok((interp, if arg.is_empty() { None } else { Some(arg) }))
        }
    }
}

fn rebuild_address_space(
    slot: u16,
    image: ofd::OfdId,
    size: usize,
    code_pages: usize,
    staging: &ExecStaging,
) -> KResult<()> {
    {
        let mut table = TABLE.lock();
        let proc = &mut table.procs[slot as usize];
        proc.code.release_all();
        proc.data.release_all();
        proc.stack.release_all();
        proc.code.resize(code_pages)?;
        proc.stack.resize(STACK_PAGES)?;
    }

    // Map the file bytewise into the code segment.
    if ofd::seek(image, 0, ferrox_abi::fs::SEEK_SET).is_err() {
        return Err(Errno::EIO);
    }
    let mut chunk = [0u8; 512];
    let mut loaded = 0usize;
    while loaded < size {
        let want = core::cmp::min(chunk.len(), size - loaded);
        let got = ofd::read(image, &mut chunk[..want])?;
        if got == 0 {
            return Err(Errno::EIO);
        }
        crate::process::copy_to_user(slot, CODE_BASE + loaded as u32, &chunk[..got])?;
        loaded += got;
    }

    // argv[] argvStrings envp[] envpStrings at the top of the stack.
    let argv_ptr_bytes = (staging.argc + 1) * 4;
    let envp_ptr_bytes = (staging.envc + 1) * 4;
    let mut string_bytes = 0usize;
    for i in 0..staging.argc {
        string_bytes += staging.string_at(staging.arg_offsets[i]).len() + 1;
    }
    let argv_strings_len = string_bytes;
    for i in 0..staging.envc {
        string_bytes += staging.string_at(staging.env_offsets[i]).len() + 1;
    }
    let total = (argv_ptr_bytes + envp_ptr_bytes + string_bytes + 3) & !3;
    let base = (STACK_END as u32).wrapping_sub(total as u32);

    let argv_table_va = base;
    let argv_strings_va = base + argv_ptr_bytes as u32;
    let envp_table_va = argv_strings_va + argv_strings_len as u32;
    let envp_strings_va = envp_table_va + envp_ptr_bytes as u32;

    let mut cursor = argv_strings_va;
    for i in 0..staging.argc {
        let s = staging.string_at(staging.arg_offsets[i]);
        crate::process::copy_to_user(slot, argv_table_va + i as u32 * 4, &cursor.to_le_bytes())?;
        crate::process::copy_to_user(slot, cursor, s)?;
        crate::process::copy_to_user(slot, cursor + s.len() as u32, &[0u8])?;
        cursor += s.len() as u32 + 1;
    }
    crate::process::copy_to_user(
        slot,
        argv_table_va + staging.argc as u32 * 4,
        &0u32.to_le_bytes(),
    )?;

    let mut cursor = envp_strings_va;
    for i in 0..staging.envc {
        let s = staging.string_at(staging.env_offsets[i]);
        crate::process::copy_to_user(slot, envp_table_va + i as u32 * 4, &cursor.to_le_bytes())?;
        crate::process::copy_to_user(slot, cursor, s)?;
        crate::process::copy_to_user(slot, cursor + s.len() as u32, &[0u8])?;
        cursor += s.len() as u32 + 1;
    }
    crate::process::copy_to_user(
        slot,
        envp_table_va + staging.envc as u32 * 4,
        &0u32.to_le_bytes(),
    )?;

    let mut table = TABLE.lock();
    let proc = &mut table.procs[slot as usize];
    proc.ctx_syscall = UserContext {
        eax: staging.argc as u32,
        ebx: argv_table_va,
        ecx: envp_table_va,
        esp: base,
        eip: CODE_BASE,
        ..UserContext::zero()
    };
    Ok(())
}

/// Post-image bookkeeping: descriptors, handlers, FPU.
fn finish_exec(slot: u16) {
    // Which descriptors go: close-on-exec ones and any directory.
    let mut closing: [Option<ofd::OfdId>; ferrox_abi::task::MAX_FDS] =
        [None; ferrox_abi::task::MAX_FDS];
    {
        let mut table = TABLE.lock();
        let proc = &mut table.procs[slot as usize];
        for (i, entry) in proc.fds.iter_mut().enumerate() {
            if entry.used && entry.cloexec {
                closing[i] = Some(entry.ofd);
                entry.used = false;
            }
        }
    }
    for (i, pending) in closing.iter_mut().enumerate() {
        if pending.is_none() {
            // Directory descriptions close unconditionally across exec.
            let check = {
                let table = TABLE.lock();
                let entry = &table.procs[slot as usize].fds[i];
                if entry.used { Some(entry.ofd) } else { None }
            };
            if let Some(ofd_id) = check {
                if ofd::is_directory(ofd_id).unwrap_or(false) {
                    TABLE.lock().procs[slot as usize].fds[i].used = false;
                    *pending = Some(ofd_id);
                }
            }
        }
    }
    for ofd_id in closing.iter().flatten() {
        let _ = ofd::release(*ofd_id);
    }

    let mut table = TABLE.lock();
    let proc = &mut table.procs[slot as usize];
    for record in proc.signals.iter_mut() {
        if record.handler != SIG_DFL && record.handler != ferrox_abi::signal::SIG_IGN {
            record.handler = SIG_DFL;
            record.sa_flags = 0;
            record.sa_mask = 0;
        }
    }
    proc.fpu_initialized = false;
}

// =============================================================================
// Termination and wait
// =============================================================================

/// Voluntary exit; does not return to the caller's user context.
pub fn exit_current(code: u8) {
    let slot = current_slot();
    if slot == NO_SLOT {
        return;
    }
    terminate(slot, ExitStatus::exited(code));
    sched::reschedule();
}

/// Tear a process down to a zombie awaiting status collection.
pub fn terminate(slot: u16, status: ExitStatus) {
    // Close descriptors and cancel timers outside the table lock; both
    // reach into other subsystems' locks.
    let mut closing: [Option<ofd::OfdId>; ferrox_abi::task::MAX_FDS] =
        [None; ferrox_abi::task::MAX_FDS];
    let sleep_timer = {
        let mut table = TABLE.lock();
        let proc = &mut table.procs[slot as usize];
        for (i, entry) in proc.fds.iter_mut().enumerate() {
            if entry.used {
                closing[i] = Some(entry.ofd);
                entry.used = false;
            }
        }
        let timer = proc.sleep_timer;
        proc.sleep_timer = NO_TIMER;
        timer
    };
    if sleep_timer != NO_TIMER {
        crate::command::cancel(sleep_timer);
    }
    for ofd_id in closing.iter().flatten() {
        let _ = ofd::release(*ofd_id);
    }

    let mut orphan_candidates = [NO_SLOT; 1 + ferrox_abi::task::MAX_PROCESSES];
    let mut candidate_count = 0usize;

    let (parent_slot, leader_sid) = {
        let mut table = TABLE.lock();

        let pid = table.procs[slot as usize].pid;
        if pid == INIT_PID {
            klog_error!("init exited with status {:#x}", status.0);
            panic!("attempted to terminate init");
        }

        // Session leader with a controlling TTY: the terminal hangs up.
        let leader_sid = {
            let group = table.procs[slot as usize].group;
            if group != NO_SLOT {
                let session = table.groups[group as usize].session;
                let s = &table.sessions[session as usize];
                if s.leader == pid && s.controlling_tty != jobctl::NO_TTY {
                    Some(s.id)
                } else {
                    None
                }
            } else {
                None
            }
        };

        // Groups that may become orphaned: the exiting process's own and
        // those of its children.
        let own_group = table.procs[slot as usize].group;
        if own_group != NO_SLOT {
            orphan_candidates[candidate_count] = own_group;
            candidate_count += 1;
        }
        let mut cursor = table.procs[slot as usize].children.first();
        while let Some(child) = cursor {
            let group = table.procs[child as usize].group;
            if group != NO_SLOT && !orphan_candidates[..candidate_count].contains(&group) {
                orphan_candidates[candidate_count] = group;
                candidate_count += 1;
            }
            cursor = table.procs[child as usize].sibling_link.next_index();
        }

        // Children reparent to init.
        let init_slot = table.slot_by_pid(INIT_PID);
        let mut children = table.procs[slot as usize].children;
        if let Some(init_slot) = init_slot {
            loop {
                let popped = children.pop_front(&mut SiblingLinks(&mut table.procs));
                let Some(child) = popped else { break };
                table.procs[child as usize].parent = init_slot;
                let mut init_children = table.procs[init_slot as usize].children;
                init_children.push_back(&mut SiblingLinks(&mut table.procs), child);
                table.procs[init_slot as usize].children = init_children;
                // Zombies move with their pending report.
                if table.procs[child as usize].notify_parent.is_some() {
                    let init_pid = table.procs[init_slot as usize].pid;
                    sched::wake_channel_locked(
                        &mut table,
                        WaitChannel::child_of(init_pid),
                        true,
                    );
                    signal::generate_for_locked(&mut table, init_slot, SIGCHLD, false);
                }
            }
        }
        table.procs[slot as usize].children = children;

        // Off every scheduler structure, into zombie state.
        sched::remove_runnable_locked(&mut table, slot);
        if table.procs[slot as usize].wait_link.is_linked() {
            let channel = table.procs[slot as usize].wait_channel;
            let bucket = crate::process::wait_bucket_of(channel);
            let mut head = table.wait_buckets[bucket];
            head.remove(&mut crate::process::WaitLinks(&mut table.procs), slot);
            table.wait_buckets[bucket] = head;
        }

        table.procs[slot as usize].code.release_all();
        table.procs[slot as usize].data.release_all();
        table.procs[slot as usize].stack.release_all();

        table.procs[slot as usize].state = ProcessState::WaitingExitStatusCollection;
        table.procs[slot as usize].exit_status = status;
        table.procs[slot as usize].notify_parent = Some(status);

        let parent_slot = table.procs[slot as usize].parent;
        if parent_slot != NO_SLOT {
            signal::generate_for_locked(&mut table, parent_slot, SIGCHLD, false);
            signal::notify_parent_waiters_locked(&mut table, parent_slot);
        }
        if table.current == slot {
            table.current = NO_SLOT;
        }
        (parent_slot, leader_sid)
    };
    let _ = parent_slot;

    if let Some(sid) = leader_sid {
        // The TTY side raises SIGHUP at its foreground group and
        // forgets the association; the session side clears its id.
        tty_runtime::tty_hangup_session(sid);
        jobctl::release_controlling_tty(sid);
    }

    // Newly orphaned groups with stopped members get SIGHUP + SIGCONT.
    let mut table = TABLE.lock();
    for i in 0..candidate_count {
        let group_slot = orphan_candidates[i];
        if !table.groups[group_slot as usize].in_use {
            continue;
        }
        if !jobctl::group_is_orphaned_locked(&table, group_slot) {
            continue;
        }
        let mut has_stopped = false;
        let mut cursor = table.groups[group_slot as usize].members.first();
        while let Some(member) = cursor {
            if table.procs[member as usize].state == ProcessState::Stopped {
                has_stopped = true;
                break;
            }
            cursor = table.procs[member as usize].group_link.next_index();
        }
        if has_stopped {
            let mut cursor = table.groups[group_slot as usize].members.first();
            while let Some(member) = cursor {
                let next = table.procs[member as usize].group_link.next_index();
                signal::generate_for_locked(&mut table, member, SIGHUP, false);
                signal::generate_for_locked(&mut table, member, SIGCONT, false);
                cursor = next;
            }
        }
    }
    drop(table);

    // The group membership goes last so the orphan scan above still saw
    // the exiting process's group.
    let mut table = TABLE.lock();
    jobctl::group_leave_locked(&mut table, slot);
}

// =============================================================================
// Wait
// =============================================================================

/// Does `child` fall within the wait scope `pid`?
fn scope_matches(table: &crate::process::ProcessTable, caller: u16, child: u16, pid: i32) -> bool {
    if pid > 0 {
        return table.procs[child as usize].pid == pid as Pid;
    }
    if pid == -1 {
        return true;
    }
    let child_group = table.procs[child as usize].group;
    if child_group == NO_SLOT {
        return false;
    }
    let child_pgid = table.groups[child_group as usize].id;
    if pid == 0 {
        let caller_group = table.procs[caller as usize].group;
        caller_group != NO_SLOT && table.groups[caller_group as usize].id == child_pgid
    } else {
        child_pgid == (-pid) as Pid
    }
}

/// POSIX-shaped wait. Returns (pid, status); WNOHANG yields pid 0 when
/// nothing is reportable yet.
pub fn wait(pid: i32, options: u32) -> KResult<(Pid, ExitStatus)> {
    let caller = current_slot();
    if caller == NO_SLOT {
        return Err(Errno::ESRCH);
    }
    loop {
        let outcome = {
            let mut table = TABLE.lock();
            let mut any_in_scope = false;
            let mut report = None;

            let mut cursor = table.procs[caller as usize].children.first();
            while let Some(child) = cursor {
                let next = table.procs[child as usize].sibling_link.next_index();
                if scope_matches(&table, caller, child, pid) {
                    any_in_scope = true;
                    if let Some(status) = table.procs[child as usize].notify_parent {
                        let wanted = if status.is_stopped() {
                            options & WUNTRACED != 0
                        } else if status.is_continued() {
                            options & WCONTINUED != 0
                        } else {
                            true
                        };
                        if wanted {
                            report = Some((child, status));
                            break;
                        }
                    }
                }
                cursor = next;
            }

            match report {
                Some((child, status)) => {
                    table.procs[child as usize].notify_parent = None;
                    let child_pid = table.procs[child as usize].pid;
                    if table.procs[child as usize].state
                        == ProcessState::WaitingExitStatusCollection
                    {
                        reap_locked(&mut table, caller, child);
                    }
                    Some(Ok((child_pid, status)))
                }
                None if !any_in_scope => Some(Err(Errno::ECHILD)),
                None if options & WNOHANG != 0 => Some(Ok((0, ExitStatus(0)))),
                None => None,
            }
        };

        match outcome {
            Some(result) => return result,
            None => {
                let my_pid = crate::process::current_pid();
                let woke = sched::block_current(
                    WaitChannel::child_of(my_pid),
                    ProcessState::SuspendedWaitingChild,
                );
                if woke == WakeOutcome::Interrupted {
                    return Err(Errno::EINTR);
                }
            }
        }
    }
}

/// Release a zombie's last resources and recycle the slot.
fn reap_locked(table: &mut crate::process::ProcessTable, parent: u16, child: u16) {
    let mut children = table.procs[parent as usize].children;
    children.remove(&mut SiblingLinks(&mut table.procs), child);
    table.procs[parent as usize].children = children;
    jobctl::group_leave_locked(table, child);
    table.procs[child as usize] = crate::process::Process::empty();
}
