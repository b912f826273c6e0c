//! Platform glue.
//!
//! The hardware-facing machinery (task-state switching, paging, PIC/PIT
//! programming, CMOS) lives in the platform object linked alongside the
//! kernel; this module binds its exported symbols into the service
//! registries and exports the entry points its interrupt stubs call.

use ferrox_abi::task::UserContext;
use ferrox_core::sched::SchedPlatform;
use ferrox_core::{process, sched, signal, syscall};
use ferrox_lib::kernel_services::platform as platform_services;

unsafe extern "C" {
    /// Suspend `save`'s kernel path and resume `load`'s; returns when
    /// `save` is scheduled again. NO_SLOT as `save` enters the first
    /// process and never returns.
    fn ferrox_platform_context_switch(save: u16, load: u16);
    /// Enable interrupts and halt until the next one.
    fn ferrox_platform_idle_wait();
    /// CMOS wall clock, seconds since the epoch.
    fn ferrox_platform_wall_clock() -> u32;
    fn ferrox_platform_reboot() -> !;
}

fn switch_to(save: u16, load: u16) {
    unsafe { ferrox_platform_context_switch(save, load) };
}

fn idle_wait() {
    unsafe { ferrox_platform_idle_wait() };
}

fn wall_clock() -> u32 {
    unsafe { ferrox_platform_wall_clock() }
}

fn reboot() -> ! {
    unsafe { ferrox_platform_reboot() }
}

pub fn register() {
    sched::register_platform(SchedPlatform {
        switch_to,
        idle_wait,
    });
    platform_services::register_wall_clock(wall_clock);
    platform_services::register_reboot(reboot);
}

// =============================================================================
// Entry points for the platform interrupt stubs
// =============================================================================

/// Syscall gate (vector 200): the stub hands over the saved user
/// registers; the dispatcher may rewrite them (signal frames, exec).
#[unsafe(no_mangle)]
pub extern "C" fn ferrox_syscall_entry(frame: *mut UserContext) {
    if frame.is_null() {
        return;
    }
    let slot = process::current_slot();
    if slot == process::NO_SLOT {
        return;
    }
    {
        let mut table = process::TABLE.lock();
        // SAFETY: the stub passes a live, exclusive frame pointer.
        table.procs[slot as usize].ctx_syscall = unsafe { *frame };
    }
    syscall::dispatch();
    let table = process::TABLE.lock();
    let current = table.current;
    if current != process::NO_SLOT {
        // SAFETY: as above.
        unsafe { *frame = table.procs[current as usize].ctx_syscall };
    }
}

/// PIT tick (the preemption clock).
#[unsafe(no_mangle)]
pub extern "C" fn ferrox_timer_interrupt(frame: *mut UserContext) {
    let slot = process::current_slot();
    if slot != process::NO_SLOT && !frame.is_null() {
        let mut table = process::TABLE.lock();
        // SAFETY: the stub passes a live, exclusive frame pointer.
        table.procs[slot as usize].ctx_interrupt = unsafe { *frame };
    }
    ferrox_drivers::timer::handle_tick();
}

/// Translated keyboard bytes feed the focused TTY.
#[unsafe(no_mangle)]
pub extern "C" fn ferrox_keyboard_byte(tty: u8, byte: u8) {
    ferrox_drivers::tty::handle_input_byte(tty, byte);
}

/// User-mode CPU faults arrive as sticky synthetic signals.
#[unsafe(no_mangle)]
pub extern "C" fn ferrox_fault_signal(signum: u8) {
    signal::raise_fault_on_current(signum);
}
