#![no_std]

#[cfg(test)]
extern crate std;

pub mod errno;
pub mod fs;
pub mod signal;
pub mod syscall;
pub mod task;
pub mod termios;

pub use errno::{Errno, KResult};

/// Longest path the kernel will process, including the terminator the
/// userland C library expects.
pub const PATH_MAX: usize = 1024;

/// Longest single path component, including its terminator.
pub const FILE_NAME_MAX: usize = 256;

/// Most path segments a single resolution will track.
pub const MAX_SEGMENTS: usize = 446;

/// Aggregate byte limit for argv and envp strings passed to exec.
pub const ARG_MAX: usize = 32768;

pub const PAGE_SIZE: usize = 4096;
