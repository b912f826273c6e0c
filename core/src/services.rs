//! Registration of the process-runtime service table the filesystem
//! and TTY layers call back into.

use ferrox_lib::kernel_services::process_runtime::{
    ProcessRuntimeServices, register_process_runtime_services,
};

use crate::{jobctl, process, sched, signal};

pub fn register() {
    register_process_runtime_services(ProcessRuntimeServices {
        current_pid: process::current_pid,
        current_pgid: jobctl::pgid_of_current,
        current_sid: jobctl::session_of_current,
        block_current: sched::block_current,
        wake_channel: sched::wake_channel,
        signal_process: |pid, signum| {
            signal::generate(signal::KillScope::Process(pid), signum, false).is_ok()
        },
        signal_process_group: |pgid, signum| {
            signal::generate(signal::KillScope::Group(pgid), signum, false).is_ok()
        },
        process_group_is_orphaned: jobctl::process_group_is_orphaned,
        current_blocks_or_ignores: signal::current_blocks_or_ignores,
        has_pending_signal: signal::has_pending_deliverable,
    });
}
