//! The TTY line discipline.
//!
//! Each TTY owns an input ring of cooked bytes, the in-progress edit
//! line (canonical mode), a scrollback output ring plus an alternate
//! screen, a termios, and the job-control pointers (owning session,
//! foreground process group). Keyboard bytes enter through
//! [`handle_input_byte`]; reads and writes arrive from the VFS through
//! the registered service table.

pub mod output;

use ferrox_abi::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTSTP, SIGTTIN, SIGTTOU};
use ferrox_abi::task::{Pid, ProcessState};
use ferrox_abi::termios::{
    LocalFlags, InputFlags, Termios, VEOF, VEOL, VERASE, VINTR, VKILL, VQUIT, VSUSP, VWERASE,
    Winsize,
};
use ferrox_abi::{Errno, KResult};
use ferrox_core::{jobctl, signal};
use ferrox_lib::kernel_services::tty_runtime::{
    TtyRuntimeServices, register_tty_runtime_services,
};
use ferrox_lib::kernel_services::{WaitChannel, WakeOutcome};
use ferrox_lib::{IrqMutex, RingBuffer};

use output::{Cell, ScrollRing, TTY_COLS, TTY_ROWS, process_output_byte, redraw_viewport};

pub const MAX_TTYS: usize = 4;

const INPUT_RING: usize = 1024;
const LINE_MAX: usize = 256;
const ESC_BUFFER: usize = 16;
const TAB_STOP: u16 = 8;

pub(crate) struct EscapeState {
    pub found_escape: bool,
    pub found_square_bracket: bool,
    pub found_question_mark: bool,
    pub buffer: [u8; ESC_BUFFER],
    pub buffer_len: u8,
}

impl EscapeState {
    pub const fn new() -> Self {
        Self {
            found_escape: false,
            found_square_bracket: false,
            found_question_mark: false,
            buffer: [0; ESC_BUFFER],
            buffer_len: 0,
        }
    }
}

pub(crate) struct Tty {
    // Input side.
    pub input: RingBuffer<u8, INPUT_RING>,
    pub line: [u8; LINE_MAX],
    pub line_len: usize,
    pub line_start_col: u16,
    pub complete_lines: u32,
    pub pending_eofs: u32,
    pub termios: Termios,

    // Output side.
    pub main: ScrollRing,
    pub alt: [[Cell; TTY_COLS]; TTY_ROWS],
    pub alt_active: bool,
    pub cursor_row: u16,
    pub cursor_col: u16,
    pub saved_cursor: (u16, u16),
    pub saved_cursor_alt: (u16, u16),
    pub scroll_delta: u16,
    pub fg: u8,
    pub bg: u8,
    pub inverted: bool,
    pub bold: bool,
    pub cursor_visible: bool,
    pub esc: EscapeState,
    pub is_active: bool,

    // Job control.
    pub session: Pid,
    pub foreground_pgrp: Pid,
}

impl Tty {
    const fn new() -> Self {
        Self {
            input: RingBuffer::new_with(0),
            line: [0; LINE_MAX],
            line_len: 0,
            line_start_col: 0,
            complete_lines: 0,
            pending_eofs: 0,
            termios: Termios::cooked(),
            main: ScrollRing::new(),
            alt: [[Cell::blank(); TTY_COLS]; TTY_ROWS],
            alt_active: false,
            cursor_row: 0,
            cursor_col: 0,
            saved_cursor: (0, 0),
            saved_cursor_alt: (0, 0),
            scroll_delta: 0,
            fg: output::DEFAULT_FG,
            bg: output::DEFAULT_BG,
            inverted: false,
            bold: false,
            cursor_visible: true,
            esc: EscapeState::new(),
            is_active: false,
            session: 0,
            foreground_pgrp: 0,
        }
    }
}

static TTYS: IrqMutex<[Tty; MAX_TTYS]> = IrqMutex::new([const { Tty::new() }; MAX_TTYS]);

fn check_index(index: u8) -> KResult<usize> {
    if (index as usize) < MAX_TTYS {
        Ok(index as usize)
    } else {
        Err(Errno::ENOENT)
    }
}

// =============================================================================
// Echo and line editing
// =============================================================================

fn is_control(byte: u8) -> bool {
    byte < 0x20 || byte == 0x7F
}

fn echo_byte(tty: &mut Tty, byte: u8) {
    let lflag = tty.termios.lflag;
    if byte == b'\n' {
        if lflag.contains(LocalFlags::ECHO) || lflag.contains(LocalFlags::ECHONL) {
            process_output_byte(tty, b'\n');
        }
        return;
    }
    if !lflag.contains(LocalFlags::ECHO) {
        return;
    }
    if is_control(byte) && byte != b'\t' {
        if lflag.contains(LocalFlags::ECHOCTL) {
            process_output_byte(tty, b'^');
            process_output_byte(tty, byte.wrapping_add(0x40) & 0x7F);
        }
    } else {
        process_output_byte(tty, byte);
    }
}

/// Display width of one stored byte when it was echoed at `col`.
fn echoed_width(tty: &Tty, byte: u8, col: u16) -> u16 {
    if byte == b'\t' {
        (col / TAB_STOP + 1) * TAB_STOP - col
    } else if is_control(byte) {
        if tty.termios.lflag.contains(LocalFlags::ECHOCTL) {
            2
        } else {
            0
        }
    } else {
        1
    }
}

/// Visual columns of the last stored byte, replaying tab stops from the
/// line's starting column.
fn last_char_width(tty: &Tty) -> u16 {
    let mut col = tty.line_start_col;
    let mut width = 0;
    for i in 0..tty.line_len {
        width = echoed_width(tty, tty.line[i], col);
        col += width;
    }
    width
}

fn erase_one(tty: &mut Tty) {
    if tty.line_len == 0 {
        return;
    }
    let width = last_char_width(tty);
    tty.line_len -= 1;
    if tty.termios.lflag.contains(LocalFlags::ECHO)
        && tty.termios.lflag.contains(LocalFlags::ECHOE)
    {
        for _ in 0..width {
            process_output_byte(tty, 0x08);
            process_output_byte(tty, b' ');
            process_output_byte(tty, 0x08);
        }
    }
}

fn erase_word(tty: &mut Tty) {
    while tty.line_len > 0 && tty.line[tty.line_len - 1] == b' ' {
        erase_one(tty);
    }
    while tty.line_len > 0 && tty.line[tty.line_len - 1] != b' ' {
        erase_one(tty);
    }
}

fn erase_line(tty: &mut Tty) {
    while tty.line_len > 0 {
        erase_one(tty);
    }
}

/// Move the finished line (plus optional terminator) to the input ring.
fn commit_line(tty: &mut Tty, terminator: Option<u8>) {
    for i in 0..tty.line_len {
        let _ = tty.input.try_push(tty.line[i]);
    }
    if let Some(terminator) = terminator {
        let _ = tty.input.try_push(terminator);
        tty.complete_lines += 1;
    }
    tty.line_len = 0;
}

fn flush_queues(tty: &mut Tty) {
    tty.input.reset();
    tty.line_len = 0;
    tty.complete_lines = 0;
    tty.pending_eofs = 0;
}

// =============================================================================
// Keyboard entry
// =============================================================================

/// Feed one translated keyboard byte into a TTY.
pub fn handle_input_byte(index: u8, byte: u8) {
    let Ok(index) = check_index(index) else { return };
    let mut signal_fg: Option<u8> = None;
    {
        let mut ttys = TTYS.lock();
        let tty = &mut ttys[index];
        let mut byte = byte;
        let termios = tty.termios;

        if termios.iflag.contains(InputFlags::ICRNL) && byte == b'\r' {
            byte = b'\n';
        }

        if termios.lflag.contains(LocalFlags::ISIG) {
            let signum = if byte == termios.cc[VINTR] {
                Some(SIGINT)
            } else if byte == termios.cc[VQUIT] {
                Some(SIGQUIT)
            } else if byte == termios.cc[VSUSP] {
                Some(SIGTSTP)
            } else {
                None
            };
            if let Some(signum) = signum {
                echo_byte(tty, byte);
                if !termios.lflag.contains(LocalFlags::NOFLSH) {
                    flush_queues(tty);
                }
                signal_fg = Some(signum);
            }
        }

        if signal_fg.is_none() {
            if !termios.lflag.contains(LocalFlags::ICANON) {
                let _ = tty.input.try_push(byte);
                echo_byte(tty, byte);
            } else if byte == termios.cc[VEOF] && byte != 0 {
                if tty.line_len == 0 {
                    // One zero-length read per press.
                    tty.pending_eofs += 1;
                } else {
                    commit_line(tty, None);
                }
            } else if byte == b'\n' || (termios.cc[VEOL] != 0 && byte == termios.cc[VEOL]) {
                echo_byte(tty, b'\n');
                commit_line(tty, Some(byte));
            } else if byte == termios.cc[VERASE] && byte != 0 {
                erase_one(tty);
            } else if byte == termios.cc[VWERASE] && byte != 0 {
                erase_word(tty);
            } else if byte == termios.cc[VKILL] && byte != 0 {
                erase_line(tty);
            } else if tty.line_len < LINE_MAX - 1 {
                if tty.line_len == 0 {
                    tty.line_start_col = tty.cursor_col;
                }
                tty.line[tty.line_len] = byte;
                tty.line_len += 1;
                echo_byte(tty, byte);
            }
        }
    }

    let fg = TTYS.lock()[index].foreground_pgrp;
    if let Some(signum) = signal_fg {
        if fg != 0 {
            let _ = signal::generate(signal::KillScope::Group(fg), signum, false);
        }
    }
    ferrox_core::sched::wake_channel(WaitChannel::tty_input(index as u8), true);
}

// =============================================================================
// Read / write
// =============================================================================

/// Background-process discipline for reads: SIGTTIN, or EIO when the
/// group is orphaned or the signal cannot be delivered.
fn background_read_check(index: usize) -> KResult<()> {
    let (session, foreground) = {
        let ttys = TTYS.lock();
        (ttys[index].session, ttys[index].foreground_pgrp)
    };
    if session == 0 || foreground == 0 {
        return Ok(());
    }
    if jobctl::session_of_current() != session || jobctl::pgid_of_current() == foreground {
        return Ok(());
    }
    let pgid = jobctl::pgid_of_current();
    if signal::current_blocks_or_ignores(SIGTTIN) || jobctl::process_group_is_orphaned(pgid) {
        return Err(Errno::EIO);
    }
    let _ = signal::generate(signal::KillScope::Group(pgid), SIGTTIN, false);
    Err(Errno::EINTR)
}

fn background_write_check(index: usize) -> KResult<()> {
    let (session, foreground, tostop) = {
        let ttys = TTYS.lock();
        (
            ttys[index].session,
            ttys[index].foreground_pgrp,
            ttys[index].termios.lflag.contains(LocalFlags::TOSTOP),
        )
    };
    if !tostop || session == 0 || foreground == 0 {
        return Ok(());
    }
    if jobctl::session_of_current() != session || jobctl::pgid_of_current() == foreground {
        return Ok(());
    }
    let pgid = jobctl::pgid_of_current();
    if signal::current_blocks_or_ignores(SIGTTOU) || jobctl::process_group_is_orphaned(pgid) {
        return Ok(());
    }
    let _ = signal::generate(signal::KillScope::Group(pgid), SIGTTOU, false);
    Err(Errno::EINTR)
}

pub fn read(index: u8, buf: &mut [u8]) -> KResult<usize> {
    let index = check_index(index)?;
    background_read_check(index)?;
    if buf.is_empty() {
        return Ok(0);
    }
    loop {
        {
            let mut ttys = TTYS.lock();
            let tty = &mut ttys[index];
            if tty.pending_eofs > 0 {
                tty.pending_eofs -= 1;
                return Ok(0);
            }
            if !tty.input.is_empty() {
                let canonical = tty.termios.lflag.contains(LocalFlags::ICANON);
                let mut count = 0usize;
                while count < buf.len() {
                    let Some(byte) = tty.input.try_pop() else { break };
                    buf[count] = byte;
                    count += 1;
                    if canonical && byte == b'\n' {
                        tty.complete_lines = tty.complete_lines.saturating_sub(1);
                        break;
                    }
                }
                return Ok(count);
            }
        }
        let woke = ferrox_core::sched::block_current(
            WaitChannel::tty_input(index as u8),
            ProcessState::SuspendedWaitingRead,
        );
        if woke == WakeOutcome::Interrupted {
            return Err(Errno::EINTR);
        }
    }
}

pub fn write(index: u8, buf: &[u8]) -> KResult<usize> {
    let index = check_index(index)?;
    background_write_check(index)?;
    let mut ttys = TTYS.lock();
    let tty = &mut ttys[index];
    // Fresh output snaps the view back to the live edge.
    if tty.scroll_delta != 0 {
        tty.scroll_delta = 0;
        redraw_viewport(tty);
    }
    for &byte in buf {
        process_output_byte(tty, byte);
    }
    Ok(buf.len())
}

pub fn poll(index: u8) -> (bool, bool) {
    match check_index(index) {
        Ok(index) => {
            let ttys = TTYS.lock();
            let tty = &ttys[index];
            (tty.pending_eofs > 0 || !tty.input.is_empty(), true)
        }
        Err(_) => (false, false),
    }
}

// =============================================================================
// Control surface
// =============================================================================

/// First open by a session leader without a controlling terminal
/// associates the two (unless O_NOCTTY).
pub fn open(index: u8, noctty: bool) -> KResult<()> {
    let index = check_index(index)?;
    if noctty {
        return Ok(());
    }
    let sid = jobctl::session_of_current();
    let pid = ferrox_core::process::current_pid();
    if sid == 0 || sid != pid {
        return Ok(());
    }
    {
        let ttys = TTYS.lock();
        if ttys[index].session != 0 {
            return Ok(());
        }
    }
    if !jobctl::try_acquire_controlling_tty(sid, index as u8) {
        return Ok(());
    }
    let pgid = jobctl::pgid_of_current();
    jobctl::group_reserve(pgid);
    let mut ttys = TTYS.lock();
    ttys[index].session = sid;
    ttys[index].foreground_pgrp = pgid;
    Ok(())
}

pub fn get_termios(index: u8) -> Termios {
    match check_index(index) {
        Ok(index) => TTYS.lock()[index].termios,
        Err(_) => Termios::cooked(),
    }
}

pub fn set_termios(index: u8, termios: Termios) -> KResult<()> {
    let index = check_index(index)?;
    TTYS.lock()[index].termios = termios;
    Ok(())
}

pub fn get_pgrp(index: u8) -> Pid {
    match check_index(index) {
        Ok(index) => TTYS.lock()[index].foreground_pgrp,
        Err(_) => 0,
    }
}

pub fn set_pgrp(index: u8, pgid: Pid) -> KResult<()> {
    let index = check_index(index)?;
    {
        let ttys = TTYS.lock();
        if ttys[index].session != 0 && ttys[index].session != jobctl::session_of_current() {
            return Err(Errno::ENOTTY);
        }
    }
    if !jobctl::group_reserve(pgid) {
        return Err(Errno::EPERM);
    }
    let old = {
        let mut ttys = TTYS.lock();
        let old = ttys[index].foreground_pgrp;
        ttys[index].foreground_pgrp = pgid;
        old
    };
    if old != 0 {
        jobctl::group_release(old);
    }
    Ok(())
}

pub fn get_winsize(index: u8) -> Winsize {
    let _ = check_index(index);
    Winsize {
        ws_row: TTY_ROWS as u16,
        ws_col: TTY_COLS as u16,
    }
}

pub fn session_of(index: u8) -> Pid {
    match check_index(index) {
        Ok(index) => TTYS.lock()[index].session,
        Err(_) => 0,
    }
}

/// A session leader died: SIGHUP its foreground group and disassociate.
pub fn hangup_session(sid: Pid) {
    if sid == 0 {
        return;
    }
    for index in 0..MAX_TTYS {
        let foreground = {
            let mut ttys = TTYS.lock();
            if ttys[index].session != sid {
                continue;
            }
            ttys[index].session = 0;
            let foreground = ttys[index].foreground_pgrp;
            ttys[index].foreground_pgrp = 0;
            foreground
        };
        if foreground != 0 {
            let _ = signal::generate(signal::KillScope::Group(foreground), SIGHUP, false);
            jobctl::group_release(foreground);
        }
    }
}

// =============================================================================
// Focus and scrollback view
// =============================================================================

pub fn set_active(index: u8) {
    let Ok(index) = check_index(index) else { return };
    let mut ttys = TTYS.lock();
    for (i, tty) in ttys.iter_mut().enumerate() {
        tty.is_active = i == index;
    }
    redraw_viewport(&ttys[index]);
}

/// Scroll the view into (or back out of) history; only the main screen
/// scrolls.
pub fn scroll_view(index: u8, up: bool, lines: u16) {
    let Ok(index) = check_index(index) else { return };
    let mut ttys = TTYS.lock();
    let tty = &mut ttys[index];
    if tty.alt_active {
        return;
    }
    let max = tty.main.max_scroll();
    tty.scroll_delta = if up {
        (tty.scroll_delta + lines).min(max)
    } else {
        tty.scroll_delta.saturating_sub(lines)
    };
    redraw_viewport(tty);
}

/// The character currently visible at a viewport position (tests and
/// the boot splash use this).
pub fn viewport_char(index: u8, row: u16, col: u16) -> u8 {
    match check_index(index) {
        Ok(index) => {
            let ttys = TTYS.lock();
            output::viewport_cell(&ttys[index], row as usize, col as usize).ch
        }
        Err(_) => 0,
    }
}

pub fn cursor_position(index: u8) -> (u16, u16) {
    match check_index(index) {
        Ok(index) => {
            let ttys = TTYS.lock();
            (ttys[index].cursor_row, ttys[index].cursor_col)
        }
        Err(_) => (0, 0),
    }
}

// =============================================================================
// Service registration
// =============================================================================

fn tty_count() -> u8 {
    MAX_TTYS as u8
}

pub fn init(initial_active: u8) {
    set_active(initial_active);
    register_tty_runtime_services(TtyRuntimeServices {
        tty_count,
        tty_open: open,
        tty_read: read,
        tty_write: write,
        tty_poll: poll,
        tty_get_termios: get_termios,
        tty_set_termios: set_termios,
        tty_get_pgrp: get_pgrp,
        tty_set_pgrp: set_pgrp,
        tty_get_winsize: get_winsize,
        tty_session: session_of,
        tty_hangup_session: hangup_session,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    // The TTY table is process-global; tests take turns.
    static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn reset(index: usize) {
        let mut ttys = TTYS.lock();
        ttys[index] = Tty::new();
    }

    fn type_line(index: u8, bytes: &[u8]) {
        for &b in bytes {
            handle_input_byte(index, b);
        }
    }

    #[test]
    fn canonical_editing_echo_and_read() {
        let _serial = TEST_LOCK.lock().unwrap();
        reset(0);
        // a, b, backspace (VERASE), c, enter
        type_line(0, b"ab");
        handle_input_byte(0, 0x7F);
        type_line(0, b"c\n");

        let mut buf = [0u8; 16];
        let count = read(0, &mut buf).unwrap();
        assert_eq!(&buf[..count], b"ac\n");

        // Echo shows "ac" on the first row; the erased b is blanked.
        assert_eq!(viewport_char(0, 0, 0), b'a');
        assert_eq!(viewport_char(0, 0, 1), b'c');
        assert_eq!(viewport_char(0, 0, 2), b' ');
        // Cursor sits at the start of a fresh line.
        assert_eq!(cursor_position(0), (1, 0));
    }

    #[test]
    fn eof_yields_one_empty_read() {
        let _serial = TEST_LOCK.lock().unwrap();
        reset(1);
        handle_input_byte(1, 0x04); // VEOF on an empty line
        let mut buf = [0u8; 8];
        assert_eq!(read(1, &mut buf), Ok(0));

        // EOF mid-line flushes the partial line without a newline.
        type_line(1, b"hi");
        handle_input_byte(1, 0x04);
        let count = read(1, &mut buf).unwrap();
        assert_eq!(&buf[..count], b"hi");
    }

    #[test]
    fn reads_stop_at_line_boundaries() {
        let _serial = TEST_LOCK.lock().unwrap();
        reset(2);
        type_line(2, b"one\ntwo\n");
        let mut buf = [0u8; 16];
        let count = read(2, &mut buf).unwrap();
        assert_eq!(&buf[..count], b"one\n");
        let count = read(2, &mut buf).unwrap();
        assert_eq!(&buf[..count], b"two\n");
    }

    #[test]
    fn word_erase_walks_tab_stops() {
        let _serial = TEST_LOCK.lock().unwrap();
        reset(3);
        type_line(3, b"ls\tsrc");
        handle_input_byte(3, 0x17); // VWERASE removes "src"
        type_line(3, b"doc\n");
        let mut buf = [0u8; 16];
        let count = read(3, &mut buf).unwrap();
        assert_eq!(&buf[..count], b"ls\tdoc\n");
        // "doc" was echoed at the tab stop after the erase.
        assert_eq!(viewport_char(3, 0, 8), b'd');
    }

    #[test]
    fn csi_cursor_and_dsr_roundtrip() {
        let _serial = TEST_LOCK.lock().unwrap();
        reset(0);
        write(0, b"\x1b[2J\x1b[5;10Hx").unwrap();
        assert_eq!(viewport_char(0, 4, 9), b'x');

        // DSR lands in the input queue as ESC [ r ; c R.
        write(0, b"\x1b[6n").unwrap();
        // The reply contains no newline; pull bytes directly from the
        // ring.
        let mut ttys = TTYS.lock();
        let mut reply = std::vec::Vec::new();
        while let Some(b) = ttys[0].input.try_pop() {
            reply.push(b);
        }
        drop(ttys);
        assert_eq!(reply, b"\x1b[5;11R");
    }

    #[test]
    fn alternate_screen_preserves_main_contents() {
        let _serial = TEST_LOCK.lock().unwrap();
        reset(1);
        write(1, b"main text").unwrap();
        write(1, b"\x1b[?1049h").unwrap();
        write(1, b"alt").unwrap();
        assert_eq!(viewport_char(1, 0, 0), b'a');
        write(1, b"\x1b[?1049l").unwrap();
        assert_eq!(viewport_char(1, 0, 0), b'm');
    }
}
