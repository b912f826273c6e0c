#![no_std]

#[cfg(test)]
extern crate std;

pub mod framebuffer;
pub mod serial;
pub mod timer;
pub mod tty;
