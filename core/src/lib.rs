#![no_std]

#[cfg(test)]
extern crate std;

pub mod command;
pub mod jobctl;
pub mod process;
pub mod sched;
pub mod services;
pub mod signal;
pub mod syscall;
