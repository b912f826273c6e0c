//! Platform services: wall-clock time for inode timestamps and the
//! TIME syscall. Registered by the platform driver at boot; before
//! registration the clock reads as zero.

use core::sync::atomic::{AtomicPtr, Ordering};

static WALL_CLOCK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

pub fn register_wall_clock(source: fn() -> u32) {
    WALL_CLOCK.store(source as *mut (), Ordering::Release);
}

/// Seconds since the epoch, or 0 before a clock source registers.
pub fn wall_clock_seconds() -> u32 {
    let ptr = WALL_CLOCK.load(Ordering::Acquire);
    if ptr.is_null() {
        return 0;
    }
    // SAFETY: only register_wall_clock stores here, always a valid fn.
    let source: fn() -> u32 = unsafe { core::mem::transmute(ptr) };
    source()
}

static REBOOT: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

pub fn register_reboot(handler: fn() -> !) {
    REBOOT.store(handler as *mut (), Ordering::Release);
}

/// Reset the machine; falls into a halt spin when no handler exists.
pub fn reboot() -> ! {
    let ptr = REBOOT.load(Ordering::Acquire);
    if !ptr.is_null() {
        // SAFETY: only register_reboot stores here, always a valid fn.
        let handler: fn() -> ! = unsafe { core::mem::transmute(ptr) };
        handler();
    }
    loop {
        core::hint::spin_loop();
    }
}
