//! Terminal ABI: termios, control characters, window size, and the
//! ioctl numbers the TTY layer honors.

use bitflags::bitflags;

pub const NCCS: usize = 11;

pub const VINTR: usize = 0;
pub const VQUIT: usize = 1;
pub const VERASE: usize = 2;
pub const VKILL: usize = 3;
pub const VEOF: usize = 4;
pub const VTIME: usize = 5;
pub const VMIN: usize = 6;
pub const VSUSP: usize = 7;
pub const VEOL: usize = 8;
pub const VWERASE: usize = 9;
pub const VEOL2: usize = 10;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct InputFlags: u32 {
        /// Map CR to NL on input.
        const ICRNL = 0x0100;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct OutputFlags: u32 {
        const OPOST = 0x0001;
        /// Map NL to CR-NL on output.
        const ONLCR = 0x0004;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct LocalFlags: u32 {
        const ISIG    = 0x0001;
        const ICANON  = 0x0002;
        const ECHO    = 0x0008;
        const ECHOE   = 0x0010;
        const ECHOK   = 0x0020;
        const ECHONL  = 0x0040;
        const NOFLSH  = 0x0080;
        const TOSTOP  = 0x0100;
        const ECHOCTL = 0x0200;
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct Termios {
    pub iflag: InputFlags,
    pub oflag: OutputFlags,
    pub lflag: LocalFlags,
    pub cc: [u8; NCCS],
}

impl Termios {
    /// Cooked-mode defaults: canonical input with echo and signals.
    pub const fn cooked() -> Self {
        let mut cc = [0u8; NCCS];
        cc[VINTR] = 0x03; // ^C
        cc[VQUIT] = 0x1C; // ^\
        cc[VERASE] = 0x7F;
        cc[VKILL] = 0x15; // ^U
        cc[VEOF] = 0x04; // ^D
        cc[VSUSP] = 0x1A; // ^Z
        cc[VWERASE] = 0x17; // ^W
        Self {
            iflag: InputFlags::ICRNL,
            oflag: OutputFlags::OPOST.union(OutputFlags::ONLCR),
            lflag: LocalFlags::ISIG
                .union(LocalFlags::ICANON)
                .union(LocalFlags::ECHO)
                .union(LocalFlags::ECHOE)
                .union(LocalFlags::ECHOK)
                .union(LocalFlags::ECHOCTL),
            cc,
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct Winsize {
    pub ws_row: u16,
    pub ws_col: u16,
}

pub const TCGETS: u32 = 0x5401;
pub const TCSETS: u32 = 0x5402;
pub const TIOCSCTTY: u32 = 0x540E;
pub const TIOCGPGRP: u32 = 0x540F;
pub const TIOCSPGRP: u32 = 0x5410;
pub const TIOCGWINSZ: u32 = 0x5413;
pub const TIOCNOTTY: u32 = 0x5422;
