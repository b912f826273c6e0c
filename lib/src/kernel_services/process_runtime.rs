//! Process-manager services consumed by the filesystem and TTY layers.
//!
//! Registered by the process manager at boot.

use ferrox_abi::task::{Pid, ProcessState};

use super::{WaitChannel, WakeOutcome};

crate::define_service! {
    process_runtime => ProcessRuntimeServices {
        current_pid() -> Pid;
        current_pgid() -> Pid;
        current_sid() -> Pid;
        /// Suspend the caller on `channel` in the given waiting state and
        /// reschedule; returns once woken.
        block_current(channel: WaitChannel, state: ProcessState) -> WakeOutcome;
        /// Wake one (or all) processes blocked on `channel`; returns the
        /// number made runnable.
        wake_channel(channel: WaitChannel, wake_all: bool) -> usize;
        signal_process(pid: Pid, signum: u8) -> bool;
        signal_process_group(pgid: Pid, signum: u8) -> bool;
        process_group_is_orphaned(pgid: Pid) -> bool;
        /// Whether the calling process blocks or ignores `signum`; decides
        /// the SIGTTIN-versus-EIO rule for background reads.
        current_blocks_or_ignores(signum: u8) -> bool;
        /// A deliverable signal is pending for the caller.
        has_pending_signal() -> bool;
    }
}
