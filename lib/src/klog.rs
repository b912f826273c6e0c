//! Kernel logging.
//!
//! Every log line funnels through a single backend function pointer.
//! Before the serial driver registers itself, an early-boot fallback
//! writes raw bytes to COM1. The backend receives the pre-formatted
//! arguments for one line and must append the trailing newline itself.

use core::fmt;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use crate::ports::{COM1, serial_write_bytes};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KlogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

static CURRENT_LEVEL: AtomicU8 = AtomicU8::new(KlogLevel::Info as u8);

pub fn klog_set_level(level: KlogLevel) {
    CURRENT_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Parse a `--log-level=` value; unknown names leave the level alone.
pub fn klog_level_from_name(name: &[u8]) -> Option<KlogLevel> {
    match name {
        b"error" => Some(KlogLevel::Error),
        b"warn" => Some(KlogLevel::Warn),
        b"info" => Some(KlogLevel::Info),
        b"debug" => Some(KlogLevel::Debug),
        _ => None,
    }
}

#[inline(always)]
fn is_enabled(level: KlogLevel) -> bool {
    level as u8 <= CURRENT_LEVEL.load(Ordering::Relaxed)
}

/// Backend contract: write the formatted text and a trailing newline
/// atomically with respect to other log lines.
pub type KlogBackend = fn(fmt::Arguments<'_>);

static BACKEND: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

pub fn klog_register_backend(backend: KlogBackend) {
    BACKEND.store(backend as *mut (), Ordering::Release);
}

fn early_backend(args: fmt::Arguments<'_>) {
    struct EarlyWriter;

    impl fmt::Write for EarlyWriter {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            unsafe { serial_write_bytes(COM1, s.as_bytes()) };
            Ok(())
        }
    }

    let _ = fmt::write(&mut EarlyWriter, args);
    unsafe { serial_write_bytes(COM1, b"\n") };
}

#[doc(hidden)]
pub fn klog_dispatch(level: KlogLevel, args: fmt::Arguments<'_>) {
    if !is_enabled(level) {
        return;
    }
    let ptr = BACKEND.load(Ordering::Acquire);
    if ptr.is_null() {
        early_backend(args);
    } else {
        // SAFETY: only klog_register_backend stores here, and it stores
        // a valid KlogBackend fn pointer.
        let backend: KlogBackend = unsafe { core::mem::transmute(ptr) };
        backend(args);
    }
}

#[macro_export]
macro_rules! klog_error {
    ($($arg:tt)*) => {
        $crate::klog::klog_dispatch($crate::klog::KlogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_warn {
    ($($arg:tt)*) => {
        $crate::klog::klog_dispatch($crate::klog::KlogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_info {
    ($($arg:tt)*) => {
        $crate::klog::klog_dispatch($crate::klog::KlogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_debug {
    ($($arg:tt)*) => {
        $crate::klog::klog_dispatch($crate::klog::KlogLevel::Debug, format_args!($($arg)*))
    };
}
