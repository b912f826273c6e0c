#![no_std]

#[cfg(test)]
extern crate std;

pub mod frame;

pub use frame::{
    FrameId, INVALID_FRAME, alloc_kernel_frame, alloc_user_frame, frame_pool_init, frame_ptr,
    free_frame, free_frame_count,
};

pub use ferrox_abi::PAGE_SIZE;

#[cfg(not(target_os = "none"))]
pub use frame::frame_pool_init_host;
