//! Signal generation, masking, and delivery.
//!
//! Generation marks a signal pending (fault-generated signals are
//! sticky and override), wakes interruptible waiters, and applies the
//! SIGCONT/stop-signal mutual-discard rules. Delivery runs at every
//! switch toward user space: non-handler actions (terminate, stop,
//! continue, ignore) resolve immediately; a user handler gets a frame
//! pushed onto the user stack and the instruction pointer rewritten.

use ferrox_abi::signal::{
    self, DefaultAction, ExitStatus, NSIG, SA_NODEFER, SA_SIGINFO, SIG_BLOCK, SIG_DFL, SIG_IGN,
    SIG_SETMASK, SIG_STOPPERS, SIG_UNBLOCK, SIG_UNCATCHABLE, SIGCONT, SIGKILL, SIGSTOP, SigSet,
    UserSigaction, default_action, sig_bit, sig_is_valid,
};
use ferrox_abi::task::{INIT_PID, Pid, ProcessState};
use ferrox_abi::{Errno, KResult};
use ferrox_lib::kernel_services::{WaitChannel, WakeOutcome};

use crate::process::{NO_SLOT, Process, SignalRecord, TABLE};
use crate::sched;
use crate::process::lifecycle;

/// Addressing for kill(), mirroring wait's scopes.
#[derive(Copy, Clone, Debug)]
pub enum KillScope {
    Process(Pid),
    CallerGroup,
    Group(Pid),
    All,
}

impl KillScope {
    pub fn from_raw(pid: i32) -> Self {
        if pid > 0 {
            KillScope::Process(pid as Pid)
        } else if pid == 0 {
            KillScope::CallerGroup
        } else if pid == -1 {
            KillScope::All
        } else {
            KillScope::Group((-pid) as Pid)
        }
    }
}

// =============================================================================
// Actions on the per-process records
// =============================================================================

pub fn change_signal_action(
    signum: u8,
    new: Option<&UserSigaction>,
    old: Option<&mut UserSigaction>,
) -> KResult<()> {
    if !sig_is_valid(signum) || signum == SIGKILL || signum == SIGSTOP {
        return Err(Errno::EINVAL);
    }
    let mut table = TABLE.lock();
    let slot = table.current;
    if slot == NO_SLOT {
        return Err(Errno::ESRCH);
    }
    let record = &mut table.procs[slot as usize].signals[signum as usize];
    if let Some(old) = old {
        *old = UserSigaction {
            sa_handler: record.handler,
            sa_flags: record.sa_flags,
            sa_mask: record.sa_mask,
        };
    }
    if let Some(new) = new {
        record.handler = new.sa_handler;
        // siginfo delivery is not implemented; the flag vanishes.
        record.sa_flags = new.sa_flags & !SA_SIGINFO;
        record.sa_mask = new.sa_mask;
    }
    Ok(())
}

pub fn change_signals_blockage(how: u32, set: Option<SigSet>) -> KResult<SigSet> {
    let mut table = TABLE.lock();
    let slot = table.current;
    if slot == NO_SLOT {
        return Err(Errno::ESRCH);
    }
    let proc = &mut table.procs[slot as usize];
    let old = proc.blocked;
    if let Some(set) = set {
        let set = set & !SIG_UNCATCHABLE;
        proc.blocked = match how {
            SIG_BLOCK => proc.blocked | set,
            SIG_UNBLOCK => proc.blocked & !set,
            SIG_SETMASK => set,
            _ => return Err(Errno::EINVAL),
        };
    }
    Ok(old)
}

// =============================================================================
// Generation
// =============================================================================

pub fn generate(scope: KillScope, signum: u8, fault: bool) -> KResult<()> {
    if signum == 0 {
        // Existence probe only.
        return probe(scope);
    }
    if !sig_is_valid(signum) {
        return Err(Errno::EINVAL);
    }
    let mut table = TABLE.lock();
    let mut hit = false;
    match scope {
        KillScope::Process(pid) => {
            let slot = table.slot_by_pid(pid).ok_or(Errno::ESRCH)?;
            generate_for_locked(&mut table, slot, signum, fault);
            hit = true;
        }
        KillScope::CallerGroup | KillScope::Group(_) => {
            let pgid = match scope {
                KillScope::Group(pgid) => pgid,
                _ => {
                    let current = table.current;
                    if current == NO_SLOT {
                        return Err(Errno::ESRCH);
                    }
                    let group = table.procs[current as usize].group;
                    if group == NO_SLOT {
                        return Err(Errno::ESRCH);
                    }
                    table.groups[group as usize].id
                }
            };
            let group_slot =
                crate::jobctl::group_slot_by_id(&table, pgid).ok_or(Errno::ESRCH)?;
            let mut cursor = table.groups[group_slot as usize].members.first();
            while let Some(member) = cursor {
                generate_for_locked(&mut table, member, signum, fault);
                hit = true;
                cursor = table.procs[member as usize].group_link.next_index();
            }
        }
        KillScope::All => {
            for slot in 0..crate::process::MAX_PROCESSES as u16 {
                let proc = &table.procs[slot as usize];
                if proc.state == ProcessState::Absent || proc.pid == INIT_PID {
                    continue;
                }
                generate_for_locked(&mut table, slot, signum, fault);
                hit = true;
            }
        }
    }
    if hit { Ok(()) } else { Err(Errno::ESRCH) }
}

fn probe(scope: KillScope) -> KResult<()> {
    let table = TABLE.lock();
    let found = match scope {
        KillScope::Process(pid) => table.slot_by_pid(pid).is_some(),
        KillScope::Group(pgid) => crate::jobctl::group_slot_by_id(&table, pgid).is_some(),
        KillScope::CallerGroup | KillScope::All => true,
    };
    if found { Ok(()) } else { Err(Errno::ESRCH) }
}

/// Mark `signum` pending for one process and apply the wake rules.
pub(crate) fn generate_for_locked(
    table: &mut crate::process::ProcessTable,
    slot: u16,
    signum: u8,
    fault: bool,
) {
    let proc = &mut table.procs[slot as usize];
    if proc.state == ProcessState::Absent
        || proc.state == ProcessState::WaitingExitStatusCollection
    {
        return;
    }

    // Init only takes signals it asked for.
    if proc.pid == INIT_PID && proc.signals[signum as usize].handler == SIG_DFL {
        return;
    }

    // A stopped process sees only SIGKILL and SIGCONT.
    if proc.state == ProcessState::Stopped && signum != SIGKILL && signum != SIGCONT {
        return;
    }

    if signum == SIGCONT {
        // A continue cancels pending stops...
        for stopper in [SIGSTOP, signal::SIGTSTP, signal::SIGTTIN, signal::SIGTTOU] {
            proc.signals[stopper as usize].pending = false;
        }
    } else if sig_bit(signum) & SIG_STOPPERS != 0 {
        // ...and pending stops cancel a continue.
        proc.signals[SIGCONT as usize].pending = false;
    }

    // Discard outright when the disposition ignores it.
    let record = proc.signals[signum as usize];
    let ignored = record.handler == SIG_IGN
        || (record.handler == SIG_DFL
            && default_action(signum) == DefaultAction::DoNothing
            && !fault);
    let continues = signum == SIGCONT;
    if ignored && !continues {
        return;
    }

    {
        let record = &mut proc.signals[signum as usize];
        if !record.pending || fault {
            record.pending = true;
            if fault {
                record.fault = true;
            }
        }
    }

    let deliverable = fault || proc.blocked & sig_bit(signum) == 0;

    match proc.state {
        ProcessState::Stopped => {
            // Only KILL and CONT reach here; both resume execution.
            sched::make_runnable_locked(table, slot);
            if signum == SIGCONT {
                table.procs[slot as usize].notify_parent = Some(ExitStatus::continued());
                let parent = table.procs[slot as usize].parent;
                if parent != NO_SLOT {
                    generate_for_locked(table, parent, signal::SIGCHLD, false);
                }
                notify_parent_waiters_locked(table, parent);
            }
        }
        ProcessState::SuspendedSleeping if deliverable => {
            sched::wake_locked(table, slot, WakeOutcome::Interrupted);
        }
        state if state.is_suspended_waiting() && deliverable => {
            sched::wake_locked(table, slot, WakeOutcome::Interrupted);
        }
        _ => {}
    }
}

/// Wake a parent blocked in wait().
pub(crate) fn notify_parent_waiters_locked(
    table: &mut crate::process::ProcessTable,
    parent_slot: u16,
) {
    if parent_slot == NO_SLOT {
        return;
    }
    let parent_pid = table.procs[parent_slot as usize].pid;
    sched::wake_channel_locked(table, WaitChannel::child_of(parent_pid), true);
}

/// Turn a CPU fault in user code into a sticky synthetic signal.
pub fn raise_fault_on_current(signum: u8) {
    let mut table = TABLE.lock();
    let slot = table.current;
    if slot != NO_SLOT {
        generate_for_locked(&mut table, slot, signum, true);
    }
}

// =============================================================================
// Delivery
// =============================================================================

enum Action {
    Nothing,
    Terminate(u8),
    Stop(u8),
    Continue(#[allow(dead_code)] u8),
    Handler(u8, SignalRecord, bool),
}

/// Pick the next pending signal to act on and clear its pending bit.
fn take_action_locked(proc: &mut Process) -> Action {
    // Fault-generated signals first; they bypass blocking.
    let mut chosen: Option<(u8, bool)> = None;
    for signum in (1..NSIG as u8).rev() {
        let record = &proc.signals[signum as usize];
        if record.pending && record.fault {
            chosen = Some((signum, true));
            break;
        }
    }
    if chosen.is_none() {
        for signum in (1..NSIG as u8).rev() {
            let record = &proc.signals[signum as usize];
            if record.pending && proc.blocked & sig_bit(signum) == 0 {
                chosen = Some((signum, false));
                break;
            }
        }
    }
    let Some((signum, fault)) = chosen else {
        return Action::Nothing;
    };
    let record = proc.signals[signum as usize];
    proc.signals[signum as usize].pending = false;
    proc.signals[signum as usize].fault = false;

    if record.handler != SIG_DFL && record.handler != SIG_IGN {
        return Action::Handler(signum, record, fault);
    }
    if record.handler == SIG_IGN {
        return Action::Nothing;
    }
    if fault {
        return Action::Terminate(signum);
    }
    match default_action(signum) {
        DefaultAction::DoNothing => Action::Nothing,
        DefaultAction::Terminate => Action::Terminate(signum),
        DefaultAction::Stop => Action::Stop(signum),
        DefaultAction::Continue => Action::Continue(signum),
    }
}

/// Drain pending deliveries for the process about to run. Returns false
/// when the process stopped or died and another pick is needed.
pub fn prepare_delivery(slot: u16) -> bool {
    loop {
        let action = {
            let mut table = TABLE.lock();
            if table.procs[slot as usize].state != ProcessState::Runnable {
                return false;
            }
            take_action_locked(&mut table.procs[slot as usize])
        };
        match action {
            Action::Nothing => return true,
            Action::Continue(_) => continue,
            Action::Terminate(signum) => {
                lifecycle::terminate(slot, ExitStatus::signaled(signum));
                return false;
            }
            Action::Stop(signum) => {
                let mut table = TABLE.lock();
                sched::remove_runnable_locked(&mut table, slot);
                table.procs[slot as usize].state = ProcessState::Stopped;
                table.procs[slot as usize].notify_parent = Some(ExitStatus::stopped(signum));
                let parent = table.procs[slot as usize].parent;
                if parent != NO_SLOT {
                    generate_for_locked(&mut table, parent, signal::SIGCHLD, false);
                }
                notify_parent_waiters_locked(&mut table, parent);
                return false;
            }
            Action::Handler(signum, record, _fault) => {
                if push_handler_frame(slot, signum, &record).is_err() {
                    // No room on the user stack: terminate instead.
                    lifecycle::terminate(slot, ExitStatus::signaled(signum));
                    return false;
                }
                return true;
            }
        }
    }
}

/// Frame layout pushed below the interrupted stack pointer:
/// return EIP, the sigaction, its size, the pre-handler blocked mask,
/// and the signal id. The libc trampoline restores the mask from it.
const SIGFRAME_SIZE: u32 = 4 + 16 + 4 + 8 + 4;

fn push_handler_frame(slot: u16, signum: u8, record: &SignalRecord) -> KResult<()> {
    let mut frame = [0u8; SIGFRAME_SIZE as usize];
    let (esp, saved_mask) = {
        let mut table = TABLE.lock();
        let proc = &mut table.procs[slot as usize];
        let esp = proc.ctx_syscall.esp.checked_sub(SIGFRAME_SIZE).ok_or(Errno::EFAULT)?;

        frame[0..4].copy_from_slice(&proc.ctx_syscall.eip.to_le_bytes());
        frame[4..8].copy_from_slice(&record.handler.to_le_bytes());
        frame[8..12].copy_from_slice(&record.sa_flags.to_le_bytes());
        frame[12..20].copy_from_slice(&record.sa_mask.to_le_bytes());
        frame[20..24].copy_from_slice(&16u32.to_le_bytes());
        let saved_mask = proc.blocked;
        frame[24..32].copy_from_slice(&saved_mask.to_le_bytes());
        frame[32..36].copy_from_slice(&(signum as u32).to_le_bytes());
        (esp, saved_mask)
    };

    crate::process::copy_to_user(slot, esp, &frame)?;

    let mut table = TABLE.lock();
    let proc = &mut table.procs[slot as usize];
    let mut mask = saved_mask | record.sa_mask;
    if record.sa_flags & SA_NODEFER == 0 {
        mask |= sig_bit(signum);
    }
    proc.blocked = mask & !SIG_UNCATCHABLE;
    proc.ctx_syscall.esp = esp;
    proc.ctx_syscall.eip = record.handler;
    proc.ctx_syscall.ecx = signum as u32;
    Ok(())
}

// =============================================================================
// Queries used by the TTY and pipe layers
// =============================================================================

pub fn current_blocks_or_ignores(signum: u8) -> bool {
    let table = TABLE.lock();
    let slot = table.current;
    if slot == NO_SLOT {
        return false;
    }
    let proc = &table.procs[slot as usize];
    proc.blocked & sig_bit(signum) != 0 || proc.signals[signum as usize].handler == SIG_IGN
}

pub fn has_pending_deliverable() -> bool {
    let table = TABLE.lock();
    let slot = table.current;
    if slot == NO_SLOT {
        return false;
    }
    let proc = &table.procs[slot as usize];
    (1..NSIG as u8).any(|signum| {
        let record = &proc.signals[signum as usize];
        record.pending && (record.fault || proc.blocked & sig_bit(signum) == 0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Process {
        Process::empty()
    }

    #[test]
    fn highest_pending_signal_wins() {
        let mut proc = fresh();
        proc.state = ProcessState::Runnable;
        proc.signals[signal::SIGUSR1 as usize].pending = true;
        proc.signals[signal::SIGTERM as usize].pending = true;
        match take_action_locked(&mut proc) {
            Action::Terminate(signum) => assert_eq!(signum, signal::SIGTERM),
            _ => panic!("expected terminate"),
        }
        // The lower one is still pending for the next round.
        match take_action_locked(&mut proc) {
            Action::Terminate(signum) => assert_eq!(signum, signal::SIGUSR1),
            _ => panic!("expected terminate"),
        }
        matches!(take_action_locked(&mut proc), Action::Nothing)
            .then_some(())
            .expect("drained");
    }

    #[test]
    fn blocked_signals_wait_but_faults_do_not() {
        let mut proc = fresh();
        proc.state = ProcessState::Runnable;
        proc.blocked = sig_bit(signal::SIGTERM);
        proc.signals[signal::SIGTERM as usize].pending = true;
        assert!(matches!(take_action_locked(&mut proc), Action::Nothing));

        proc.signals[signal::SIGSEGV as usize].pending = true;
        proc.signals[signal::SIGSEGV as usize].fault = true;
        proc.blocked |= sig_bit(signal::SIGSEGV);
        match take_action_locked(&mut proc) {
            Action::Terminate(signum) => assert_eq!(signum, signal::SIGSEGV),
            _ => panic!("fault must bypass blocking"),
        }
    }

    #[test]
    fn handler_beats_default_and_stops_map_to_stop() {
        let mut proc = fresh();
        proc.state = ProcessState::Runnable;
        proc.signals[signal::SIGINT as usize].handler = 0x4080_0000;
        proc.signals[signal::SIGINT as usize].pending = true;
        assert!(matches!(
            take_action_locked(&mut proc),
            Action::Handler(signal::SIGINT, _, _)
        ));

        proc.signals[signal::SIGTSTP as usize].pending = true;
        assert!(matches!(
            take_action_locked(&mut proc),
            Action::Stop(signal::SIGTSTP)
        ));
    }
}
