//! Address-space segments: ordered sequences of owned page frames.
//!
//! Code grows up from CODE_BASE, data grows up from DATA_BASE under
//! brk, and the stack grows down from just past STACK_TOP. Virtual
//! arithmetic is done in u64 because the stack's end is exactly the
//! 4 GiB boundary.

use ferrox_abi::task::{CODE_BASE, DATA_BASE};
use ferrox_abi::{Errno, KResult, PAGE_SIZE};
use ferrox_mm::{FrameId, alloc_user_frame, frame_ptr, free_frame};

pub const MAX_SEGMENT_PAGES: usize = 256;

/// The byte just past the top stack word.
pub const STACK_END: u64 = 0x1_0000_0000;

#[derive(Copy, Clone, PartialEq, Eq)]
pub enum SegmentKind {
    Code,
    Data,
    Stack,
}

#[derive(Copy, Clone)]
pub struct Segment {
    kind: SegmentKind,
    frames: [FrameId; MAX_SEGMENT_PAGES],
    pages: usize,
}

impl Segment {
    pub const fn new(kind: SegmentKind) -> Self {
        Self {
            kind,
            frames: [0; MAX_SEGMENT_PAGES],
            pages: 0,
        }
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn byte_len(&self) -> u64 {
        (self.pages * PAGE_SIZE) as u64
    }

    /// [start, end) of the virtual range currently backed.
    pub fn range(&self) -> (u64, u64) {
        match self.kind {
            SegmentKind::Code => (CODE_BASE as u64, CODE_BASE as u64 + self.byte_len()),
            SegmentKind::Data => (DATA_BASE as u64, DATA_BASE as u64 + self.byte_len()),
            SegmentKind::Stack => (STACK_END - self.byte_len(), STACK_END),
        }
    }

    pub fn contains(&self, va: u64) -> bool {
        let (start, end) = self.range();
        va >= start && va < end
    }

    fn frame_for(&self, va: u64) -> Option<(FrameId, usize)> {
        let (start, end) = self.range();
        if va < start || va >= end {
            return None;
        }
        let page = match self.kind {
            // Stack frame 0 backs the highest page.
            SegmentKind::Stack => ((STACK_END - 1 - va) / PAGE_SIZE as u64) as usize,
            _ => ((va - start) / PAGE_SIZE as u64) as usize,
        };
        Some((self.frames[page], (va % PAGE_SIZE as u64) as usize))
    }

    /// Grow by one zeroed page; fails with ENOMEM when frames run out.
    pub fn push_page(&mut self) -> KResult<()> {
        if self.pages == MAX_SEGMENT_PAGES {
            return Err(Errno::ENOMEM);
        }
        let frame = alloc_user_frame().ok_or(Errno::ENOMEM)?;
        self.frames[self.pages] = frame;
        self.pages += 1;
        Ok(())
    }

    pub fn pop_page(&mut self) {
        if self.pages > 0 {
            self.pages -= 1;
            free_frame(self.frames[self.pages]);
        }
    }

    pub fn resize(&mut self, pages: usize) -> KResult<()> {
        while self.pages < pages {
            self.push_page()?;
        }
        while self.pages > pages {
            self.pop_page();
        }
        Ok(())
    }

    pub fn release_all(&mut self) {
        while self.pages > 0 {
            self.pop_page();
        }
    }

    /// Copy-in from kernel memory at a virtual address inside this
    /// segment. EFAULT past the backed range.
    pub fn write_bytes(&self, va: u64, bytes: &[u8]) -> KResult<()> {
        let mut done = 0usize;
        while done < bytes.len() {
            let (frame, within) = self.frame_for(va + done as u64).ok_or(Errno::EFAULT)?;
            let chunk = core::cmp::min(bytes.len() - done, PAGE_SIZE - within);
            // SAFETY: the frame belongs to this segment; `within + chunk`
            // stays inside one page.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    bytes[done..].as_ptr(),
                    frame_ptr(frame).add(within),
                    chunk,
                );
            }
            done += chunk;
        }
        Ok(())
    }

    pub fn read_bytes(&self, va: u64, bytes: &mut [u8]) -> KResult<()> {
        let mut done = 0usize;
        while done < bytes.len() {
            let (frame, within) = self.frame_for(va + done as u64).ok_or(Errno::EFAULT)?;
            let chunk = core::cmp::min(bytes.len() - done, PAGE_SIZE - within);
            // SAFETY: as in write_bytes.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    frame_ptr(frame).add(within),
                    bytes[done..].as_mut_ptr(),
                    chunk,
                );
            }
            done += chunk;
        }
        Ok(())
    }

    /// Physical copy of another segment's frames (fork has no
    /// copy-on-write).
    pub fn clone_from(&mut self, other: &Segment) -> KResult<()> {
        self.release_all();
        self.kind = other.kind;
        for page in 0..other.pages {
            self.push_page()?;
            // SAFETY: both frames are page-sized and owned here.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    frame_ptr(other.frames[page]),
                    frame_ptr(self.frames[page]),
                    PAGE_SIZE,
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_addresses_map_top_down() {
        ferrox_mm::frame_pool_init_host();
        let mut stack = Segment::new(SegmentKind::Stack);
        stack.resize(2).unwrap();
        let (start, end) = stack.range();
        assert_eq!(end, STACK_END);
        assert_eq!(end - start, 2 * PAGE_SIZE as u64);

        let payload = [1u8, 2, 3, 4];
        // A write spanning the page boundary near the top.
        let va = STACK_END - PAGE_SIZE as u64 - 2;
        stack.write_bytes(va, &payload).unwrap();
        let mut back = [0u8; 4];
        stack.read_bytes(va, &mut back).unwrap();
        assert_eq!(back, payload);

        assert!(stack.write_bytes(start - 1, &payload).is_err());
        stack.release_all();
    }

    #[test]
    fn clone_copies_contents() {
        ferrox_mm::frame_pool_init_host();
        let mut code = Segment::new(SegmentKind::Code);
        code.resize(1).unwrap();
        code.write_bytes(CODE_BASE as u64 + 100, b"entry").unwrap();

        let mut copy = Segment::new(SegmentKind::Code);
        copy.clone_from(&code).unwrap();
        code.write_bytes(CODE_BASE as u64 + 100, b"xxxxx").unwrap();

        let mut back = [0u8; 5];
        copy.read_bytes(CODE_BASE as u64 + 100, &mut back).unwrap();
        assert_eq!(&back, b"entry");

        code.release_all();
        copy.release_all();
    }
}
