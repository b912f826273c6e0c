//! TTY services consumed by the VFS (device-node dispatch) and by the
//! process manager (controlling-terminal teardown on exit).
//!
//! Registered by the TTY driver at boot.

use ferrox_abi::KResult;
use ferrox_abi::task::Pid;
use ferrox_abi::termios::{Termios, Winsize};

crate::define_service! {
    tty_runtime => TtyRuntimeServices {
        tty_count() -> u8;
        /// Open hook: may associate the TTY as the caller's controlling
        /// terminal (session leader, no O_NOCTTY, neither side attached).
        tty_open(tty: u8, noctty: bool) -> KResult<()>;
        tty_read(tty: u8, buf: &mut [u8]) -> KResult<usize>;
        tty_write(tty: u8, buf: &[u8]) -> KResult<usize>;
        /// (readable, writable) without blocking.
        tty_poll(tty: u8) -> (bool, bool);
        tty_get_termios(tty: u8) -> Termios;
        tty_set_termios(tty: u8, termios: Termios) -> KResult<()>;
        tty_get_pgrp(tty: u8) -> Pid;
        tty_set_pgrp(tty: u8, pgid: Pid) -> KResult<()>;
        tty_get_winsize(tty: u8) -> Winsize;
        tty_session(tty: u8) -> Pid;
        /// Disassociate the session's controlling TTY and SIGHUP its
        /// foreground group; called when a session leader exits.
        tty_hangup_session(sid: Pid);
    }
}
