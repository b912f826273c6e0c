//! The round-robin scheduler and the blocking primitives.
//!
//! Each runnable process may consume TICKS_PER_ITERATION timer ticks
//! per scheduler iteration; when every runnable has used its quota the
//! iteration id advances and quotas reset. Between switches, pending
//! signal delivery runs against the incoming process.
//!
//! The actual stack/context switch is a platform capability registered
//! at boot: `switch_to(save, load)` returns when `save` is scheduled
//! again, and `idle_wait` halts until an interrupt arrives.

use ferrox_abi::task::{Pid, ProcessState, TICKS_PER_ITERATION};
use ferrox_lib::kernel_services::{WaitChannel, WakeOutcome};

use crate::process::{
    NO_SLOT, RunLinks, TABLE, WaitLinks, current_slot, wait_bucket_of,
};
use crate::signal;

pub struct SchedPlatform {
    /// Suspend the kernel path of `save` and resume `load`'s; returns
    /// when `save` is selected again. A `save` of NO_SLOT is the boot
    /// path entering its first process and never returns.
    pub switch_to: fn(save: u16, load: u16),
    /// Halt until an interrupt arrives (the idle task's body).
    pub idle_wait: fn(),
}

static PLATFORM: spin::Once<SchedPlatform> = spin::Once::new();

pub fn register_platform(platform: SchedPlatform) {
    PLATFORM.call_once(|| platform);
}

fn platform() -> Option<&'static SchedPlatform> {
    PLATFORM.get()
}

// =============================================================================
// Runnable bookkeeping
// =============================================================================

/// Put a process on the runnable list; caller holds the table lock.
pub(crate) fn make_runnable_locked(table: &mut crate::process::ProcessTable, slot: u16) {
    debug_assert!(!table.procs[slot as usize].run_link.is_linked());
    table.procs[slot as usize].state = ProcessState::Runnable;
    let mut runnable = table.runnable;
    runnable.push_back(&mut RunLinks(&mut table.procs), slot);
    table.runnable = runnable;
}

pub(crate) fn remove_runnable_locked(table: &mut crate::process::ProcessTable, slot: u16) {
    if table.procs[slot as usize].run_link.is_linked() {
        let mut runnable = table.runnable;
        runnable.remove(&mut RunLinks(&mut table.procs), slot);
        table.runnable = runnable;
    }
}

/// Round-robin selection honoring per-iteration tick quotas.
fn pick_next_locked(table: &mut crate::process::ProcessTable) -> Option<u16> {
    if table.runnable.is_empty() {
        return None;
    }

    for _round in 0..2 {
        // Start after the current process when it is still on the list.
        let start = if table.current != NO_SLOT
            && table.procs[table.current as usize].run_link.is_linked()
        {
            table
                .runnable
                .next_of(&RunLinks(&mut table.procs), table.current)
                .or(table.runnable.first())
        } else {
            table.runnable.first()
        };

        let mut cursor = start;
        let mut visited = 0usize;
        while let Some(slot) = cursor {
            let iteration = table.iteration;
            let proc = &mut table.procs[slot as usize];
            if proc.sched_iteration != iteration {
                proc.sched_iteration = iteration;
                proc.ticks_this_iteration = 0;
            }
            if proc.ticks_this_iteration < TICKS_PER_ITERATION {
                return Some(slot);
            }
            visited += 1;
            if visited >= table.runnable.len() {
                break;
            }
            cursor = table
                .runnable
                .next_of(&RunLinks(&mut table.procs), slot)
                .or(table.runnable.first());
        }

        // Everyone exhausted their quota: new iteration, quotas reset.
        table.iteration = table.iteration.wrapping_add(1);
    }
    table.runnable.first()
}

/// Select the next process and hand the CPU over. Loops through the
/// platform idle wait while nothing is runnable.
pub fn reschedule() {
    loop {
        let (previous, next) = {
            let mut table = TABLE.lock();
            let previous = table.current;
            match pick_next_locked(&mut table) {
                Some(next) => {
                    table.current = next;
                    (previous, Some(next))
                }
                None => (previous, None),
            }
        };

        match next {
            Some(next) => {
                // Pending signals are considered at every switch toward
                // user space; the pick repeats if delivery stopped or
                // terminated the candidate.
                if !signal::prepare_delivery(next) {
                    continue;
                }
                if next != previous {
                    if let Some(platform) = platform() {
                        (platform.switch_to)(previous, next);
                    }
                }
                return;
            }
            None => {
                let Some(platform) = platform() else { return };
                (platform.idle_wait)();
            }
        }
    }
}

/// PIT tick entry: account the quantum and maybe preempt.
pub fn timer_tick() {
    crate::command::timer_tick();
    let needs_switch = {
        let mut table = TABLE.lock();
        let current = table.current;
        if current == NO_SLOT {
            !table.runnable.is_empty()
        } else {
            let iteration = table.iteration;
            let proc = &mut table.procs[current as usize];
            if proc.sched_iteration != iteration {
                proc.sched_iteration = iteration;
                proc.ticks_this_iteration = 0;
            }
            proc.ticks_this_iteration += 1;
            proc.ticks_this_iteration >= TICKS_PER_ITERATION
        }
    };
    if needs_switch {
        reschedule();
    }
}

// =============================================================================
// Blocking and waking
// =============================================================================

/// Suspend the caller on `channel` in one of the waiting states (or
/// SuspendedSleeping, which joins no list) and reschedule.
pub fn block_current(channel: WaitChannel, state: ProcessState) -> WakeOutcome {
    let slot = {
        let mut table = TABLE.lock();
        let slot = table.current;
        debug_assert!(slot != NO_SLOT);
        remove_runnable_locked(&mut table, slot);
        let proc = &mut table.procs[slot as usize];
        proc.state = state;
        proc.wait_channel = channel;
        proc.wake_outcome = WakeOutcome::Completed;
        // Poll monitoring (WaitingIoEvent) and sleeping stay off the
        // wait lists; their wakers find them directly.
        if state.is_suspended_waiting() && state != ProcessState::SuspendedWaitingIoEvent {
            let bucket = wait_bucket_of(channel);
            let mut head = table.wait_buckets[bucket];
            head.push_back(&mut WaitLinks(&mut table.procs), slot);
            table.wait_buckets[bucket] = head;
        }
        slot
    };

    reschedule();

    TABLE.lock().procs[slot as usize].wake_outcome
}

/// Make a blocked process runnable again; caller holds the lock.
pub(crate) fn wake_locked(
    table: &mut crate::process::ProcessTable,
    slot: u16,
    outcome: WakeOutcome,
) {
    if table.procs[slot as usize].wait_link.is_linked() {
        let bucket = wait_bucket_of(table.procs[slot as usize].wait_channel);
        let mut head = table.wait_buckets[bucket];
        head.remove(&mut WaitLinks(&mut table.procs), slot);
        table.wait_buckets[bucket] = head;
    }
    table.procs[slot as usize].wake_outcome = outcome;
    // Waking clears poll monitors as well; nothing is ever on a wait
    // list and monitoring events at the same time.
    table.procs[slot as usize].monitor_count = 0;
    make_runnable_locked(table, slot);
}

/// Wake processes blocked on `channel`; also scans poll monitors, whose
/// holders sit off the wait lists by design. Returns the number woken.
pub fn wake_channel(channel: WaitChannel, wake_all: bool) -> usize {
    let mut table = TABLE.lock();
    wake_channel_locked(&mut table, channel, wake_all)
}

pub(crate) fn wake_channel_locked(
    table: &mut crate::process::ProcessTable,
    channel: WaitChannel,
    wake_all: bool,
) -> usize {
    let mut woken = 0usize;

    let bucket = wait_bucket_of(channel);
    loop {
        let mut found = None;
        let head = table.wait_buckets[bucket];
        let mut cursor = head.first();
        while let Some(slot) = cursor {
            if table.procs[slot as usize].wait_channel == channel {
                found = Some(slot);
                break;
            }
            cursor = head.next_of(&WaitLinks(&mut table.procs), slot);
        }
        match found {
            Some(slot) => {
                wake_locked(table, slot, WakeOutcome::Completed);
                woken += 1;
                if !wake_all {
                    break;
                }
            }
            None => break,
        }
    }

    // Pollers watching a node this channel names.
    for slot in 0..crate::process::MAX_PROCESSES as u16 {
        if table.procs[slot as usize].state != ProcessState::SuspendedWaitingIoEvent {
            continue;
        }
        let matched = (0..table.procs[slot as usize].monitor_count).any(|i| {
            let node = table.procs[slot as usize].monitors[i].node;
            channel == WaitChannel::vfs_node(node) || monitored_channel(node) == Some(channel)
        });
        if matched {
            wake_locked(table, slot, WakeOutcome::Completed);
            woken += 1;
        }
    }
    woken
}

/// The secondary channel a node's readiness may be announced on (TTY
/// input arrives on a per-TTY channel, not the node's).
fn monitored_channel(node: ferrox_fs::vfs::NodeId) -> Option<WaitChannel> {
    match ferrox_fs::vfs::node::node_kind(node) {
        ferrox_fs::vfs::NodeKind::Tty { index } => Some(WaitChannel::tty_input(index)),
        _ => None,
    }
}

/// Timer-driven wakeup for SLEEP; a no-op unless still sleeping.
pub fn wake_sleeper(pid: Pid) {
    let mut table = TABLE.lock();
    if let Some(slot) = table.slot_by_pid(pid) {
        if table.procs[slot as usize].state == ProcessState::SuspendedSleeping {
            wake_locked(&mut table, slot, WakeOutcome::Completed);
        }
    }
}

/// Timer-driven wakeup for POLL timeouts.
pub fn wake_poller(pid: Pid) {
    let mut table = TABLE.lock();
    if let Some(slot) = table.slot_by_pid(pid) {
        if table.procs[slot as usize].state == ProcessState::SuspendedWaitingIoEvent {
            wake_locked(&mut table, slot, WakeOutcome::Completed);
        }
    }
}

pub fn current_pid() -> Pid {
    crate::process::current_pid()
}

pub fn current_is(slot: u16) -> bool {
    current_slot() == slot
}
