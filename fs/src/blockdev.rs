//! Block devices and the device name registry.

use ferrox_abi::{Errno, KResult};
use ferrox_lib::IrqMutex;
use ferrox_mm::{FrameId, PAGE_SIZE, alloc_kernel_frame, frame_ptr, free_frame};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockDeviceError {
    OutOfRange,
    Io,
}

/// A device addressable in fixed-size blocks. Implementations
/// synchronize internally; the kernel runs a single execution context,
/// so methods take `&self`.
pub trait BlockDevice: Send + Sync {
    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> Result<(), BlockDeviceError>;
    fn write_at(&self, offset: u64, buffer: &[u8]) -> Result<(), BlockDeviceError>;
    fn capacity(&self) -> u64;
    fn block_size(&self) -> u32 {
        512
    }
}

// =============================================================================
// Memory-backed block device (ramdisks and tests)
// =============================================================================

const MEMDEV_MAX_FRAMES: usize = 384;

/// A byte range carved out of page frames, presented as a block device.
pub struct MemoryBlockDevice {
    frames: [FrameId; MEMDEV_MAX_FRAMES],
    frame_count: usize,
    capacity: u64,
}

impl MemoryBlockDevice {
    /// Allocate a zeroed device of at least `bytes` capacity; frames are
    /// returned to the pool on drop.
    pub fn allocate(bytes: usize) -> Option<Self> {
        let frame_count = bytes.div_ceil(PAGE_SIZE);
        if frame_count > MEMDEV_MAX_FRAMES {
            return None;
        }
        let mut frames = [0 as FrameId; MEMDEV_MAX_FRAMES];
        for (i, slot) in frames.iter_mut().enumerate().take(frame_count) {
            match alloc_kernel_frame() {
                Some(frame) => *slot = frame,
                None => {
                    for released in frames.iter().take(i) {
                        free_frame(*released);
                    }
                    return None;
                }
            }
        }
        Some(Self {
            frames,
            frame_count,
            capacity: bytes as u64,
        })
    }

    fn transfer(&self, offset: u64, len: usize, mut step: impl FnMut(*mut u8, usize, usize)) {
        let mut pos = offset as usize;
        let mut done = 0usize;
        while done < len {
            let frame = self.frames[pos / PAGE_SIZE];
            let within = pos % PAGE_SIZE;
            let chunk = core::cmp::min(len - done, PAGE_SIZE - within);
            // SAFETY: the frame belongs to this device and `within + chunk`
            // stays inside one page.
            let src = unsafe { frame_ptr(frame).add(within) };
            step(src, done, chunk);
            pos += chunk;
            done += chunk;
        }
    }
}

impl Drop for MemoryBlockDevice {
    fn drop(&mut self) {
        for frame in self.frames.iter().take(self.frame_count) {
            free_frame(*frame);
        }
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> Result<(), BlockDeviceError> {
        if offset + buffer.len() as u64 > self.capacity {
            return Err(BlockDeviceError::OutOfRange);
        }
        self.transfer(offset, buffer.len(), |src, done, chunk| {
            // SAFETY: `src` points at `chunk` readable bytes.
            unsafe { core::ptr::copy_nonoverlapping(src, buffer[done..].as_mut_ptr(), chunk) };
        });
        Ok(())
    }

    fn write_at(&self, offset: u64, buffer: &[u8]) -> Result<(), BlockDeviceError> {
        if offset + buffer.len() as u64 > self.capacity {
            return Err(BlockDeviceError::OutOfRange);
        }
        self.transfer(offset, buffer.len(), |dst, done, chunk| {
            // SAFETY: `dst` points at `chunk` writable bytes owned by the
            // device; the kernel runs one execution context.
            unsafe { core::ptr::copy_nonoverlapping(buffer[done..].as_ptr(), dst, chunk) };
        });
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}

// =============================================================================
// Device registry
// =============================================================================

pub type DeviceId = u16;

pub const MAX_BLOCK_DEVICES: usize = 8;
pub const DEVICE_NAME_MAX: usize = 16;

struct DeviceEntry {
    name: [u8; DEVICE_NAME_MAX],
    name_len: usize,
    device: &'static dyn BlockDevice,
}

struct DeviceRegistry {
    entries: [Option<DeviceEntry>; MAX_BLOCK_DEVICES],
}

static REGISTRY: IrqMutex<DeviceRegistry> = IrqMutex::new(DeviceRegistry {
    entries: [const { None }; MAX_BLOCK_DEVICES],
});

pub fn register_block_device(name: &[u8], device: &'static dyn BlockDevice) -> KResult<DeviceId> {
    if name.is_empty() || name.len() > DEVICE_NAME_MAX {
        return Err(Errno::EINVAL);
    }
    let mut registry = REGISTRY.lock();
    if registry
        .entries
        .iter()
        .flatten()
        .any(|e| &e.name[..e.name_len] == name)
    {
        return Err(Errno::EEXIST);
    }
    let slot = registry
        .entries
        .iter()
        .position(|e| e.is_none())
        .ok_or(Errno::ENOMEM)?;
    let mut entry = DeviceEntry {
        name: [0; DEVICE_NAME_MAX],
        name_len: name.len(),
        device,
    };
    entry.name[..name.len()].copy_from_slice(name);
    registry.entries[slot] = Some(entry);
    Ok(slot as DeviceId)
}

pub fn device_by_name(name: &[u8]) -> Option<DeviceId> {
    let registry = REGISTRY.lock();
    registry
        .entries
        .iter()
        .position(|e| matches!(e, Some(e) if &e.name[..e.name_len] == name))
        .map(|i| i as DeviceId)
}

fn with_device<R>(id: DeviceId, f: impl FnOnce(&dyn BlockDevice) -> R) -> KResult<R> {
    let registry = REGISTRY.lock();
    let entry = registry
        .entries
        .get(id as usize)
        .and_then(|e| e.as_ref())
        .ok_or(Errno::ENOENT)?;
    Ok(f(entry.device))
}

pub fn device_read(id: DeviceId, offset: u64, buffer: &mut [u8]) -> KResult<()> {
    with_device(id, |d| d.read_at(offset, buffer))?.map_err(|_| Errno::EIO)
}

pub fn device_write(id: DeviceId, offset: u64, buffer: &[u8]) -> KResult<()> {
    with_device(id, |d| d.write_at(offset, buffer))?.map_err(|_| Errno::EIO)
}

pub fn device_capacity(id: DeviceId) -> KResult<u64> {
    with_device(id, |d| d.capacity())
}

pub fn device_block_size(id: DeviceId) -> KResult<u32> {
    with_device(id, |d| d.block_size())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_device_round_trips_across_frame_boundaries() {
        ferrox_mm::frame_pool_init_host();
        let dev = MemoryBlockDevice::allocate(3 * PAGE_SIZE).unwrap();

        let pattern: std::vec::Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        let offset = PAGE_SIZE as u64 - 100;
        dev.write_at(offset, &pattern).unwrap();

        let mut back = std::vec![0u8; pattern.len()];
        dev.read_at(offset, &mut back).unwrap();
        assert_eq!(back, pattern);

        let mut oob = [0u8; 16];
        assert_eq!(
            dev.read_at(dev.capacity() - 8, &mut oob),
            Err(BlockDeviceError::OutOfRange)
        );
    }
}
