//! The command scheduler: time-based single-shot or repeating
//! callbacks, ordered by expiry in a min-heap. Sleep wakeups and poll
//! timeouts ride on this.

use ferrox_abi::task::MS_PER_TICK;
use ferrox_abi::{Errno, KResult};
use ferrox_lib::{IrqMutex, PriorityQueue};

pub type CommandId = u16;
pub type CommandCallback = fn(u32);

pub const MAX_COMMANDS: usize = 32;

#[derive(Copy, Clone)]
struct Command {
    callback: CommandCallback,
    arg: u32,
    /// Repeat period in ticks; 0 means single-shot.
    interval: u64,
    in_use: bool,
}

#[derive(Copy, Clone, Default)]
struct TimerEntry {
    expiry: u64,
    id: CommandId,
}

fn entry_less(a: &TimerEntry, b: &TimerEntry) -> bool {
    a.expiry < b.expiry
}

fn noop(_arg: u32) {}

struct CommandScheduler {
    commands: [Command; MAX_COMMANDS],
    heap_buf: [TimerEntry; MAX_COMMANDS],
    heap_len: usize,
    ticks: u64,
}

impl CommandScheduler {
    fn with_heap<R>(&mut self, f: impl FnOnce(&mut PriorityQueue<'_, TimerEntry>) -> R) -> R {
        let mut heap = PriorityQueue::with_len(&mut self.heap_buf, self.heap_len, entry_less);
        let result = f(&mut heap);
        self.heap_len = heap.len();
        result
    }
}

static COMMANDS: IrqMutex<CommandScheduler> = IrqMutex::new(CommandScheduler {
    commands: [Command {
        callback: noop,
        arg: 0,
        interval: 0,
        in_use: false,
    }; MAX_COMMANDS],
    heap_buf: [TimerEntry { expiry: 0, id: 0 }; MAX_COMMANDS],
    heap_len: 0,
    ticks: 0,
});

fn ms_to_ticks(ms: u64) -> u64 {
    ms.div_ceil(MS_PER_TICK).max(1)
}

/// Schedule `callback(arg)` after `delay_ms`; with `repeat_ms` it fires
/// periodically until cancelled.
pub fn schedule(
    delay_ms: u64,
    repeat_ms: Option<u64>,
    callback: CommandCallback,
    arg: u32,
) -> KResult<CommandId> {
    let mut scheduler = COMMANDS.lock();
    let id = scheduler
        .commands
        .iter()
        .position(|c| !c.in_use)
        .ok_or(Errno::ENOMEM)? as CommandId;
    scheduler.commands[id as usize] = Command {
        callback,
        arg,
        interval: repeat_ms.map(ms_to_ticks).unwrap_or(0),
        in_use: true,
    };
    let expiry = scheduler.ticks + ms_to_ticks(delay_ms);
    let inserted = scheduler.with_heap(|heap| heap.insert(TimerEntry { expiry, id }));
    if !inserted {
        scheduler.commands[id as usize].in_use = false;
        return Err(Errno::ENOMEM);
    }
    Ok(id)
}

/// Cancel a pending command; returns the milliseconds that remained, or
/// None if it already fired.
pub fn cancel(id: CommandId) -> Option<u64> {
    let mut scheduler = COMMANDS.lock();
    if !scheduler.commands[id as usize].in_use {
        return None;
    }
    scheduler.commands[id as usize].in_use = false;
    let now = scheduler.ticks;
    let entry = scheduler.with_heap(|heap| heap.remove_where(|e| e.id == id))?;
    Some(entry.expiry.saturating_sub(now) * MS_PER_TICK)
}

/// Advance time by one tick and run everything due. Callbacks run with
/// no scheduler lock held.
pub fn timer_tick() {
    let mut due: [Option<(CommandCallback, u32)>; MAX_COMMANDS] = [None; MAX_COMMANDS];
    let mut due_count = 0usize;
    {
        let mut scheduler = COMMANDS.lock();
        scheduler.ticks += 1;
        let now = scheduler.ticks;
        loop {
            let expired = scheduler.with_heap(|heap| match heap.peek() {
                Some(entry) if entry.expiry <= now => heap.remove(),
                _ => None,
            });
            let Some(entry) = expired else { break };
            let command = scheduler.commands[entry.id as usize];
            if !command.in_use {
                continue;
            }
            due[due_count] = Some((command.callback, command.arg));
            due_count += 1;
            if command.interval > 0 {
                let again = TimerEntry {
                    expiry: now + command.interval,
                    id: entry.id,
                };
                let kept = scheduler.with_heap(|heap| heap.insert(again));
                if !kept {
                    scheduler.commands[entry.id as usize].in_use = false;
                }
            } else {
                scheduler.commands[entry.id as usize].in_use = false;
            }
        }
    }
    for entry in due.iter().take(due_count).flatten() {
        (entry.0)(entry.1);
    }
}

pub fn now_ticks() -> u64 {
    COMMANDS.lock().ticks
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static FIRED: AtomicU32 = AtomicU32::new(0);

    fn bump(arg: u32) {
        FIRED.fetch_add(arg, Ordering::Relaxed);
    }

    /// One sequence; the scheduler state is process-global.
    #[test]
    fn one_shot_repeat_and_cancel() {
        FIRED.store(0, Ordering::Relaxed);
        let _fast = schedule(10, None, bump, 1).unwrap();
        let slow = schedule(100, None, bump, 100).unwrap();

        for _ in 0..4 {
            timer_tick();
        }
        assert_eq!(FIRED.load(Ordering::Relaxed), 1);

        let remaining = cancel(slow).unwrap();
        assert!(remaining > 0 && remaining <= 100);
        for _ in 0..20 {
            timer_tick();
        }
        assert_eq!(FIRED.load(Ordering::Relaxed), 1);

        FIRED.store(0, Ordering::Relaxed);
        let id = schedule(10, Some(10), bump, 1).unwrap();
        for _ in 0..35 {
            timer_tick();
        }
        let fired = FIRED.load(Ordering::Relaxed);
        assert!(fired >= 3, "fired {fired} times");
        cancel(id);
    }
}
