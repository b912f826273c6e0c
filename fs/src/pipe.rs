//! Pipes: a one-page ring buffer between a reader and a writer end.
//!
//! Reads block while the ring is empty and a writer remains; writes of
//! at most PIPE_BUF bytes are atomic (all-or-block); writing after the
//! reader is gone raises SIGPIPE and fails with EPIPE. Blocking always
//! happens with no locks held, via the process-runtime services.

use ferrox_abi::fs::{OpenFlags, PIPE_BUF};
use ferrox_abi::signal::SIGPIPE;
use ferrox_abi::task::ProcessState;
use ferrox_abi::{Errno, KResult};
use ferrox_lib::kernel_services::process_runtime::{
    block_current, current_pid, signal_process, wake_channel,
};
use ferrox_lib::kernel_services::{WaitChannel, WakeOutcome};
use ferrox_lib::{IrqMutex, RingBuffer};

use crate::vfs::node::{NodeId, NodeKind, alloc_node, free_node, reserve_node};
use crate::vfs::ofd::{self, OfdId};

pub const MAX_PIPES: usize = 16;
pub const PIPE_CAPACITY: usize = 4096;

struct Pipe {
    ring: RingBuffer<u8, PIPE_CAPACITY>,
    in_use: bool,
    node: NodeId,
    reader_ofd: OfdId,
    writer_ofd: OfdId,
    reader_released: bool,
    writer_released: bool,
}

impl Pipe {
    const fn empty() -> Self {
        Self {
            ring: RingBuffer::new_with(0),
            in_use: false,
            node: 0,
            reader_ofd: 0,
            writer_ofd: 0,
            reader_released: false,
            writer_released: false,
        }
    }
}

static PIPES: IrqMutex<[Pipe; MAX_PIPES]> = IrqMutex::new([const { Pipe::empty() }; MAX_PIPES]);

/// Create a pipe; returns (read end, write end) descriptions.
pub fn create() -> KResult<(OfdId, OfdId)> {
    let id = {
        let mut pipes = PIPES.lock();
        let id = pipes
            .iter()
            .position(|p| !p.in_use)
            .ok_or(Errno::ENFILE)?;
        pipes[id].in_use = true;
        id as u8
    };

    let release_pipe = || {
        PIPES.lock()[id as usize] = Pipe::empty();
    };

    let node = match alloc_node(NodeKind::Pipe { id }) {
        Ok(node) => node,
        Err(e) => {
            release_pipe();
            return Err(e);
        }
    };

    // One reservation per end; both transfer to the descriptions. The
    // after-release hook tears the pipe down once the count hits zero,
    // so the error paths only have to drop what they hold.
    reserve_node(node);
    let read_ofd = match ofd::acquire(node, OpenFlags::empty()) {
        Ok(ofd) => ofd,
        Err(e) => {
            crate::vfs::node::release_node(node);
            return Err(e);
        }
    };
    reserve_node(node);
    let write_ofd = match ofd::acquire(node, OpenFlags::WRONLY) {
        Ok(ofd) => ofd,
        Err(e) => {
            crate::vfs::node::release_node(node);
            let _ = ofd::release(read_ofd);
            return Err(e);
        }
    };

    let mut pipes = PIPES.lock();
    let pipe = &mut pipes[id as usize];
    pipe.ring.reset();
    pipe.node = node;
    pipe.reader_ofd = read_ofd;
    pipe.writer_ofd = write_ofd;
    pipe.reader_released = false;
    pipe.writer_released = false;
    Ok((read_ofd, write_ofd))
}

pub fn read(id: u8, buf: &mut [u8]) -> KResult<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    loop {
        let (outcome, node) = {
            let mut pipes = PIPES.lock();
            let pipe = &mut pipes[id as usize];
            if !pipe.ring.is_empty() {
                let count = pipe.ring.pop_into(buf);
                (Some(Ok(count)), pipe.node)
            } else if pipe.writer_released {
                (Some(Ok(0)), pipe.node)
            } else {
                (None, pipe.node)
            }
        };
        match outcome {
            Some(result) => {
                // Room appeared: anybody blocked writing may continue.
                wake_channel(WaitChannel::vfs_node(node), true);
                return result;
            }
            None => {
                let woke = block_current(
                    WaitChannel::vfs_node(node),
                    ProcessState::SuspendedWaitingRead,
                );
                if woke == WakeOutcome::Interrupted {
                    return Err(Errno::EINTR);
                }
            }
        }
    }
}

pub fn write(id: u8, buf: &[u8]) -> KResult<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let atomic = buf.len() <= PIPE_BUF;
    let mut written = 0usize;
    loop {
        enum Step {
            Done(usize),
            Gone,
            Wait,
        }
        let (step, node) = {
            let mut pipes = PIPES.lock();
            let pipe = &mut pipes[id as usize];
            let node = pipe.node;
            if pipe.reader_released {
                (Step::Gone, node)
            } else if atomic {
                // All or nothing: never interleave another writer's bytes
                // inside a PIPE_BUF-sized write.
                if pipe.ring.free_space() >= buf.len() {
                    pipe.ring.push_from(buf);
                    (Step::Done(buf.len()), node)
                } else {
                    (Step::Wait, node)
                }
            } else {
                let pushed = pipe.ring.push_from(&buf[written..]);
                written += pushed;
                if written == buf.len() {
                    (Step::Done(written), node)
                } else {
                    (Step::Wait, node)
                }
            }
        };
        match step {
            Step::Done(count) => {
                wake_channel(WaitChannel::vfs_node(node), true);
                return Ok(count);
            }
            Step::Gone => {
                signal_process(current_pid(), SIGPIPE);
                return Err(Errno::EPIPE);
            }
            Step::Wait => {
                if written > 0 {
                    // Partial progress is visible to readers immediately.
                    wake_channel(WaitChannel::vfs_node(node), true);
                }
                let woke = block_current(
                    WaitChannel::vfs_node(node),
                    ProcessState::SuspendedWaitingWrite,
                );
                if woke == WakeOutcome::Interrupted {
                    return if written > 0 {
                        Ok(written)
                    } else {
                        Err(Errno::EINTR)
                    };
                }
            }
        }
    }
}

pub fn poll(id: u8) -> (bool, bool) {
    let pipes = PIPES.lock();
    let pipe = &pipes[id as usize];
    let readable = !pipe.ring.is_empty() || pipe.writer_released;
    let writable = pipe.ring.free_space() > 0 || pipe.reader_released;
    (readable, writable)
}

/// An end's last descriptor closed; blocked peers must observe the
/// end-of-file or broken-pipe condition.
pub fn ofd_released(id: u8, ofd: OfdId) {
    let node = {
        let mut pipes = PIPES.lock();
        let pipe = &mut pipes[id as usize];
        if !pipe.in_use {
            return;
        }
        if ofd == pipe.reader_ofd {
            pipe.reader_released = true;
        } else if ofd == pipe.writer_ofd {
            pipe.writer_released = true;
        }
        pipe.node
    };
    wake_channel(WaitChannel::vfs_node(node), true);
}

/// Both ends are gone (node usage reached zero): tear the pipe down.
pub fn node_reservation_released(id: u8, node: NodeId) {
    let mut pipes = PIPES.lock();
    pipes[id as usize] = Pipe::empty();
    drop(pipes);
    free_node(node);
}
