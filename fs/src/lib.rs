#![no_std]

#[cfg(test)]
extern crate std;

pub mod blockcache;
pub mod blockdev;
pub mod devfs;
pub mod ext2;
pub mod pipe;
pub mod tests;
pub mod vfs;

pub use blockdev::{BlockDevice, BlockDeviceError, DeviceId, MemoryBlockDevice};
