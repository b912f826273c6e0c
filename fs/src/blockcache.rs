//! The block cache: device blocks pinned in page frames.
//!
//! Each slot holds one contiguous run of device blocks. A reservation
//! pins the slot: its frame pointer is stable for the holder and the
//! slot cannot be evicted or repurposed until every reservation is
//! released. Eviction requires `reservations == 0 && !dirty`.
//!
//! Reservation holders must not block; every blocking path in the
//! kernel releases its reservations first.

use core::sync::atomic::{AtomicU64, Ordering};

use ferrox_abi::{Errno, KResult};
use ferrox_lib::IrqMutex;
use ferrox_mm::{FrameId, PAGE_SIZE, alloc_kernel_frame, frame_ptr};

use crate::blockdev::{DeviceId, device_block_size, device_read, device_write};

pub const BLOCK_CACHE_SLOTS: usize = 64;

#[derive(Copy, Clone)]
struct CacheSlot {
    device: DeviceId,
    first_block: u32,
    block_count: u16,
    reservations: u16,
    dirty: bool,
    valid: bool,
    frame: FrameId,
    has_frame: bool,
    /// Eviction picks the least recently released slot.
    last_use: u64,
}

impl CacheSlot {
    const fn empty() -> Self {
        Self {
            device: 0,
            first_block: 0,
            block_count: 0,
            reservations: 0,
            dirty: false,
            valid: false,
            frame: 0,
            has_frame: false,
            last_use: 0,
        }
    }
}

struct BlockCache {
    slots: [CacheSlot; BLOCK_CACHE_SLOTS],
}

static CACHE: IrqMutex<BlockCache> = IrqMutex::new(BlockCache {
    slots: [CacheSlot::empty(); BLOCK_CACHE_SLOTS],
});

static USE_CLOCK: AtomicU64 = AtomicU64::new(1);

/// A held reservation. The buffer spans exactly the reserved run.
#[derive(Debug)]
pub struct BlockRef {
    slot: u16,
    frame: FrameId,
    len: usize,
    device: DeviceId,
    first_block: u32,
}

impl BlockRef {
    pub fn first_block(&self) -> u32 {
        self.first_block
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the reservation pins the frame; the single kernel
        // execution context serializes access to its contents.
        unsafe { core::slice::from_raw_parts(frame_ptr(self.frame), self.len) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; distinct reservations reference distinct
        // block runs.
        unsafe { core::slice::from_raw_parts_mut(frame_ptr(self.frame), self.len) }
    }
}

fn run_bytes(device: DeviceId, block_count: u16) -> KResult<usize> {
    let bs = device_block_size(device)? as usize;
    let len = bs * block_count as usize;
    if len == 0 || len > PAGE_SIZE {
        return Err(Errno::EINVAL);
    }
    Ok(len)
}

/// Find or claim a slot for the run, without touching the device.
fn claim_slot(device: DeviceId, first_block: u32, block_count: u16) -> KResult<(u16, bool)> {
    let mut cache = CACHE.lock();

    // Existing run?
    for (i, slot) in cache.slots.iter_mut().enumerate() {
        if slot.valid
            && slot.device == device
            && slot.first_block == first_block
            && slot.block_count == block_count
        {
            slot.reservations += 1;
            return Ok((i as u16, true));
        }
    }

    // Prefer a never-used slot, then the least recently used evictable one.
    let mut candidate: Option<usize> = None;
    for (i, slot) in cache.slots.iter().enumerate() {
        if !slot.valid && slot.reservations == 0 {
            candidate = Some(i);
            break;
        }
        if slot.reservations == 0 && !slot.dirty {
            match candidate {
                Some(c) if cache.slots[c].last_use <= slot.last_use => {}
                _ => candidate = Some(i),
            }
        }
    }
    let index = candidate.ok_or(Errno::ENOMEM)?;

    let slot = &mut cache.slots[index];
    if !slot.has_frame {
        slot.frame = alloc_kernel_frame().ok_or(Errno::ENOMEM)?;
        slot.has_frame = true;
    }
    slot.device = device;
    slot.first_block = first_block;
    slot.block_count = block_count;
    slot.reservations = 1;
    slot.dirty = false;
    slot.valid = true;
    Ok((index as u16, false))
}

fn make_ref(slot: u16, device: DeviceId, first_block: u32, len: usize) -> BlockRef {
    let frame = CACHE.lock().slots[slot as usize].frame;
    BlockRef {
        slot,
        frame,
        len,
        device,
        first_block,
    }
}

/// Pin a run without reading it; for writers that overwrite the whole run.
pub fn reserve(device: DeviceId, first_block: u32, block_count: u16) -> KResult<BlockRef> {
    let len = run_bytes(device, block_count)?;
    let (slot, _cached) = claim_slot(device, first_block, block_count)?;
    Ok(make_ref(slot, device, first_block, len))
}

/// Pin a run and guarantee its contents are current.
pub fn read_and_reserve(device: DeviceId, first_block: u32, block_count: u16) -> KResult<BlockRef> {
    let len = run_bytes(device, block_count)?;
    let (slot, cached) = claim_slot(device, first_block, block_count)?;
    let mut r = make_ref(slot, device, first_block, len);
    if !cached {
        let bs = device_block_size(device)? as u64;
        if let Err(e) = device_read(device, first_block as u64 * bs, r.bytes_mut()) {
            release_reservation(r, false);
            return Err(e);
        }
    }
    Ok(r)
}

/// Pin the run covering `byte_offset`; returns the buffer and the id of
/// its first block.
pub fn read_and_reserve_by_offset(
    device: DeviceId,
    byte_offset: u64,
    block_count: u16,
) -> KResult<(BlockRef, u32)> {
    let bs = device_block_size(device)? as u64;
    let first_block = (byte_offset / bs) as u32;
    let r = read_and_reserve(device, first_block, block_count)?;
    Ok((r, first_block))
}

/// One-shot read bypassing the cache.
pub fn read_directly(
    device: DeviceId,
    first_block: u32,
    block_count: u16,
    dest: &mut [u8],
) -> KResult<()> {
    let bs = device_block_size(device)? as u64;
    let len = bs as usize * block_count as usize;
    if dest.len() < len {
        return Err(Errno::EINVAL);
    }
    device_read(device, first_block as u64 * bs, &mut dest[..len])
}

/// Drop a reservation; `modified` marks the slot dirty for write-back.
pub fn release_reservation(r: BlockRef, modified: bool) {
    let mut cache = CACHE.lock();
    let slot = &mut cache.slots[r.slot as usize];
    debug_assert!(slot.valid && slot.reservations > 0);
    slot.reservations -= 1;
    if modified {
        slot.dirty = true;
    }
    slot.last_use = USE_CLOCK.fetch_add(1, Ordering::Relaxed);
}

/// Write every dirty slot back to its device. An I/O failure here is a
/// filesystem-integrity loss and is reported as EIO after attempting
/// the remaining slots.
pub fn flush() -> KResult<()> {
    let mut result: KResult<()> = Ok(());
    for i in 0..BLOCK_CACHE_SLOTS {
        let (device, first_block, frame, len) = {
            let cache = CACHE.lock();
            let slot = &cache.slots[i];
            if !slot.valid || !slot.dirty {
                continue;
            }
            let len = match run_bytes(slot.device, slot.block_count) {
                Ok(len) => len,
                Err(e) => {
                    ferrox_abi::errno::retain_first_failure(&mut result, Err(e));
                    continue;
                }
            };
            (slot.device, slot.first_block, slot.frame, len)
        };
        let bs = device_block_size(device)? as u64;
        // SAFETY: the slot stays valid; dirty slots are never evicted.
        let bytes = unsafe { core::slice::from_raw_parts(frame_ptr(frame), len) };
        let write = device_write(device, first_block as u64 * bs, bytes);
        if write.is_ok() {
            CACHE.lock().slots[i].dirty = false;
        }
        ferrox_abi::errno::retain_first_failure(&mut result, write);
    }
    result
}

/// Evict every clean, unreserved slot.
pub fn clear() {
    let mut cache = CACHE.lock();
    for slot in cache.slots.iter_mut() {
        if slot.valid && slot.reservations == 0 && !slot.dirty {
            slot.valid = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::{MemoryBlockDevice, register_block_device};

    fn test_device() -> DeviceId {
        ferrox_mm::frame_pool_init_host();
        static DEV: spin::Once<MemoryBlockDevice> = spin::Once::new();
        static ID: spin::Once<DeviceId> = spin::Once::new();
        *ID.call_once(|| {
            let dev = DEV.call_once(|| MemoryBlockDevice::allocate(64 * 1024).unwrap());
            register_block_device(b"cachetest", dev).unwrap()
        })
    }

    #[test]
    fn dirty_data_reaches_the_device_only_after_flush() {
        let dev = test_device();

        let mut r = reserve(dev, 0, 2).unwrap();
        r.bytes_mut().fill(0x5A);
        release_reservation(r, true);

        // The device still sees zeros; the dirty run lives in the cache.
        let mut probe = [0u8; 16];
        device_read(dev, 0, &mut probe).unwrap();
        assert_eq!(probe, [0u8; 16]);

        flush().unwrap();
        device_read(dev, 0, &mut probe).unwrap();
        assert_eq!(probe, [0x5A; 16]);

        // After clearing, a fresh reservation re-reads device contents.
        clear();
        let r = read_and_reserve(dev, 0, 2).unwrap();
        assert!(r.bytes().iter().all(|b| *b == 0x5A));
        release_reservation(r, false);
    }

    #[test]
    fn by_offset_reports_the_first_block() {
        let dev = test_device();
        let (r, first) = read_and_reserve_by_offset(dev, 1024, 2).unwrap();
        assert_eq!(first, 2);
        assert_eq!(r.bytes().len(), 1024);
        release_reservation(r, false);
    }

    #[test]
    fn reserved_runs_share_one_slot() {
        let dev = test_device();
        let a = read_and_reserve(dev, 8, 1).unwrap();
        let b = read_and_reserve(dev, 8, 1).unwrap();
        assert_eq!(a.first_block(), b.first_block());
        release_reservation(a, false);
        release_reservation(b, false);
    }
}
