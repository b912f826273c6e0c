//! TTY output: the scrollback ring, the alternate screen, and the
//! ECMA-48 control-sequence subset.

use super::{EscapeState, Tty};
use crate::framebuffer::framebuffer;

pub const TTY_ROWS: usize = 25;
pub const TTY_COLS: usize = 80;
pub const SCROLLBACK_ROWS: usize = 200;

pub const DEFAULT_FG: u8 = 7;
pub const DEFAULT_BG: u8 = 0;

const TAB_STOP: u16 = 8;

#[derive(Copy, Clone)]
pub struct Cell {
    pub ch: u8,
    pub fg: u8,
    pub bg: u8,
}

impl Cell {
    pub const fn blank() -> Self {
        Self {
            ch: b' ',
            fg: DEFAULT_FG,
            bg: DEFAULT_BG,
        }
    }
}

/// Ring of rows; the viewport is the tail, offset upward by the scroll
/// delta.
pub struct ScrollRing {
    rows: [[Cell; TTY_COLS]; SCROLLBACK_ROWS],
    first: usize,
    count: usize,
}

impl ScrollRing {
    pub const fn new() -> Self {
        Self {
            rows: [[Cell::blank(); TTY_COLS]; SCROLLBACK_ROWS],
            first: 0,
            count: TTY_ROWS,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    fn ring_index(&self, logical: usize) -> usize {
        (self.first + logical) % SCROLLBACK_ROWS
    }

    pub fn row(&self, logical: usize) -> &[Cell; TTY_COLS] {
        &self.rows[self.ring_index(logical)]
    }

    pub fn row_mut(&mut self, logical: usize) -> &mut [Cell; TTY_COLS] {
        let index = self.ring_index(logical);
        &mut self.rows[index]
    }

    /// Push a blank row at the bottom, consuming history when full.
    pub fn append_row(&mut self) {
        if self.count == SCROLLBACK_ROWS {
            self.first = (self.first + 1) % SCROLLBACK_ROWS;
        } else {
            self.count += 1;
        }
        let last = self.count - 1;
        *self.row_mut(last) = [Cell::blank(); TTY_COLS];
    }

    pub fn reset(&mut self) {
        self.first = 0;
        self.count = TTY_ROWS;
        self.rows = [[Cell::blank(); TTY_COLS]; SCROLLBACK_ROWS];
    }

    /// Logical index of the viewport's top row.
    pub fn viewport_base(&self, scroll_delta: u16) -> usize {
        (self.count - TTY_ROWS).saturating_sub(scroll_delta as usize)
    }

    pub fn max_scroll(&self) -> u16 {
        (self.count - TTY_ROWS) as u16
    }
}

// =============================================================================
// Byte-level processing
// =============================================================================

pub(super) fn process_output_byte(tty: &mut Tty, byte: u8) {
    if tty.esc.found_escape {
        escape_byte(tty, byte);
        return;
    }
    match byte {
        0x1B => {
            tty.esc = EscapeState::new();
            tty.esc.found_escape = true;
        }
        b'\n' => {
            tty.cursor_col = 0;
            line_feed(tty);
        }
        b'\r' => set_cursor(tty, tty.cursor_row, 0),
        b'\t' => {
            let next = (tty.cursor_col / TAB_STOP + 1) * TAB_STOP;
            set_cursor(tty, tty.cursor_row, next.min(TTY_COLS as u16 - 1));
        }
        0x08 => set_cursor(tty, tty.cursor_row, tty.cursor_col.saturating_sub(1)),
        0x07 => {}
        b if (0x20..0x7F).contains(&b) => put_char(tty, b),
        _ => {}
    }
}

fn escape_byte(tty: &mut Tty, byte: u8) {
    if !tty.esc.found_square_bracket {
        match byte {
            b'[' => tty.esc.found_square_bracket = true,
            // ESC 7 / ESC 8: cursor save and restore without a bracket.
            b'7' => {
                tty.saved_cursor_alt = (tty.cursor_row, tty.cursor_col);
                tty.esc = EscapeState::new();
            }
            b'8' => {
                let (row, col) = tty.saved_cursor_alt;
                set_cursor(tty, row, col);
                tty.esc = EscapeState::new();
            }
            _ => tty.esc = EscapeState::new(),
        }
        return;
    }

    match byte {
        b'?' if tty.esc.buffer_len == 0 => tty.esc.found_question_mark = true,
        b'0'..=b'9' | b';' => {
            if (tty.esc.buffer_len as usize) < tty.esc.buffer.len() {
                tty.esc.buffer[tty.esc.buffer_len as usize] = byte;
                tty.esc.buffer_len += 1;
            } else {
                // Oversized sequence: drop it.
                tty.esc = EscapeState::new();
            }
        }
        final_byte => {
            let (params, nparams) = parse_params(&tty.esc.buffer[..tty.esc.buffer_len as usize]);
            let question = tty.esc.found_question_mark;
            tty.esc = EscapeState::new();
            dispatch_csi(tty, final_byte, &params[..nparams], question);
        }
    }
}

fn parse_params(raw: &[u8]) -> ([u16; 4], usize) {
    let mut params = [0u16; 4];
    let mut count = 0usize;
    let mut current = 0u16;
    let mut seen_digit = false;
    for &byte in raw {
        if byte == b';' {
            if count < params.len() {
                params[count] = current;
                count += 1;
            }
            current = 0;
            seen_digit = false;
        } else {
            current = current.saturating_mul(10).saturating_add((byte - b'0') as u16);
            seen_digit = true;
        }
    }
    if seen_digit && count < params.len() {
        params[count] = current;
        count += 1;
    }
    (params, count)
}

fn dispatch_csi(tty: &mut Tty, final_byte: u8, params: &[u16], question: bool) {
    if question {
        let mode = params.first().copied().unwrap_or(0);
        match (mode, final_byte) {
            (25, b'h') => set_cursor_visible(tty, true),
            (25, b'l') => set_cursor_visible(tty, false),
            (1049, b'h') => enter_alternate_screen(tty),
            (1049, b'l') => leave_alternate_screen(tty),
            _ => {}
        }
        return;
    }

    let p0 = params.first().copied().unwrap_or(0);
    let p1 = params.get(1).copied().unwrap_or(0);
    match final_byte {
        b'm' => select_graphic_rendition(tty, params),
        b'H' | b'f' => {
            let row = p0.max(1) - 1;
            let col = p1.max(1) - 1;
            set_cursor(
                tty,
                row.min(TTY_ROWS as u16 - 1),
                col.min(TTY_COLS as u16 - 1),
            );
        }
        b'J' => erase_in_display(tty, p0),
        b'K' => erase_in_line(tty, p0),
        b'A' => set_cursor(tty, tty.cursor_row.saturating_sub(p0.max(1)), tty.cursor_col),
        b'B' => set_cursor(
            tty,
            (tty.cursor_row + p0.max(1)).min(TTY_ROWS as u16 - 1),
            tty.cursor_col,
        ),
        b'C' => set_cursor(
            tty,
            tty.cursor_row,
            (tty.cursor_col + p0.max(1)).min(TTY_COLS as u16 - 1),
        ),
        b'D' => set_cursor(tty, tty.cursor_row, tty.cursor_col.saturating_sub(p0.max(1))),
        b'n' if p0 == 6 => device_status_report(tty),
        b's' => tty.saved_cursor = (tty.cursor_row, tty.cursor_col),
        b'u' => {
            let (row, col) = tty.saved_cursor;
            set_cursor(tty, row, col);
        }
        _ => {}
    }
}

fn select_graphic_rendition(tty: &mut Tty, params: &[u16]) {
    let params: &[u16] = if params.is_empty() { &[0] } else { params };
    for &param in params {
        match param {
            0 => {
                tty.fg = DEFAULT_FG;
                tty.bg = DEFAULT_BG;
                tty.inverted = false;
                tty.bold = false;
            }
            1 => tty.bold = true,
            7 => tty.inverted = true,
            27 => tty.inverted = false,
            30..=37 => tty.fg = (param - 30) as u8,
            39 => tty.fg = DEFAULT_FG,
            40..=47 => tty.bg = (param - 40) as u8,
            49 => tty.bg = DEFAULT_BG,
            _ => {}
        }
    }
}

/// DSR answers through the input queue: `ESC [ row ; col R`, 1-based.
fn device_status_report(tty: &mut Tty) {
    let mut reply = [0u8; 16];
    let mut len = 0usize;
    reply[len] = 0x1B;
    len += 1;
    reply[len] = b'[';
    len += 1;
    len += format_u16(tty.cursor_row + 1, &mut reply[len..]);
    reply[len] = b';';
    len += 1;
    len += format_u16(tty.cursor_col + 1, &mut reply[len..]);
    reply[len] = b'R';
    len += 1;
    for &byte in &reply[..len] {
        let _ = tty.input.try_push(byte);
    }
}

fn format_u16(value: u16, out: &mut [u8]) -> usize {
    let mut digits = [0u8; 5];
    let mut value = value;
    let mut n = 0usize;
    loop {
        digits[n] = b'0' + (value % 10) as u8;
        value /= 10;
        n += 1;
        if value == 0 {
            break;
        }
    }
    for i in 0..n {
        out[i] = digits[n - 1 - i];
    }
    n
}

// =============================================================================
// Screen mutation
// =============================================================================

fn effective_colors(tty: &Tty) -> (u8, u8) {
    let fg = if tty.bold { tty.fg | 8 } else { tty.fg };
    if tty.inverted { (tty.bg, fg) } else { (fg, tty.bg) }
}

fn put_char(tty: &mut Tty, ch: u8) {
    let (fg, bg) = effective_colors(tty);
    let row = tty.cursor_row;
    let col = tty.cursor_col;
    write_cell(tty, row, col, Cell { ch, fg, bg });

    if tty.cursor_col + 1 == TTY_COLS as u16 {
        tty.cursor_col = 0;
        line_feed(tty);
    } else {
        set_cursor(tty, row, col + 1);
    }
}

fn write_cell(tty: &mut Tty, row: u16, col: u16, cell: Cell) {
    if tty.alt_active {
        tty.alt[row as usize][col as usize] = cell;
    } else {
        let base = tty.main.viewport_base(0);
        tty.main.row_mut(base + row as usize)[col as usize] = cell;
    }
    if let Some(surface) = render_target(tty) {
        surface.draw_cell(row, col, cell.ch, cell.fg, cell.bg);
    }
}

fn line_feed(tty: &mut Tty) {
    if (tty.cursor_row as usize) + 1 < TTY_ROWS {
        set_cursor(tty, tty.cursor_row + 1, tty.cursor_col);
        return;
    }
    if tty.alt_active {
        // The alternate screen does not scroll back; rows shift up.
        for row in 1..TTY_ROWS {
            tty.alt[row - 1] = tty.alt[row];
        }
        tty.alt[TTY_ROWS - 1] = [Cell::blank(); TTY_COLS];
    } else {
        tty.main.append_row();
    }
    redraw_viewport(tty);
    move_hw_cursor(tty);
}

fn set_cursor(tty: &mut Tty, row: u16, col: u16) {
    tty.cursor_row = row;
    tty.cursor_col = col;
    move_hw_cursor(tty);
}

fn set_cursor_visible(tty: &mut Tty, visible: bool) {
    tty.cursor_visible = visible;
    if let Some(surface) = render_target(tty) {
        surface.set_cursor_visible(visible);
    }
}

fn erase_in_display(tty: &mut Tty, mode: u16) {
    let (cur_row, cur_col) = (tty.cursor_row as usize, tty.cursor_col as usize);
    let in_range = |row: usize, col: usize| match mode {
        0 => row > cur_row || (row == cur_row && col >= cur_col),
        1 => row < cur_row || (row == cur_row && col <= cur_col),
        _ => true,
    };
    for row in 0..TTY_ROWS {
        for col in 0..TTY_COLS {
            if in_range(row, col) {
                write_cell(tty, row as u16, col as u16, Cell::blank());
            }
        }
    }
    if mode == 3 && !tty.alt_active {
        tty.main.reset();
        tty.scroll_delta = 0;
        redraw_viewport(tty);
    }
}

fn erase_in_line(tty: &mut Tty, mode: u16) {
    let cur_col = tty.cursor_col as usize;
    let range = match mode {
        0 => cur_col..TTY_COLS,
        1 => 0..cur_col + 1,
        _ => 0..TTY_COLS,
    };
    let row = tty.cursor_row;
    for col in range {
        write_cell(tty, row, col as u16, Cell::blank());
    }
}

fn enter_alternate_screen(tty: &mut Tty) {
    if tty.alt_active {
        return;
    }
    tty.alt_active = true;
    tty.alt = [[Cell::blank(); TTY_COLS]; TTY_ROWS];
    tty.saved_cursor = (tty.cursor_row, tty.cursor_col);
    set_cursor(tty, 0, 0);
    redraw_viewport(tty);
}

fn leave_alternate_screen(tty: &mut Tty) {
    if !tty.alt_active {
        return;
    }
    tty.alt_active = false;
    let (row, col) = tty.saved_cursor;
    set_cursor(tty, row, col);
    redraw_viewport(tty);
}

// =============================================================================
// Rendering
// =============================================================================

fn render_target(tty: &Tty) -> Option<&'static dyn crate::framebuffer::Framebuffer> {
    if !tty.is_active || tty.scroll_delta != 0 {
        return None;
    }
    framebuffer()
}

fn move_hw_cursor(tty: &Tty) {
    if let Some(surface) = render_target(tty) {
        surface.move_cursor(tty.cursor_row, tty.cursor_col);
    }
}

/// Repaint the visible grid (scroll, clear, alt switch, focus change).
pub(super) fn redraw_viewport(tty: &Tty) {
    if !tty.is_active {
        return;
    }
    let Some(surface) = framebuffer() else { return };
    for row in 0..TTY_ROWS {
        for col in 0..TTY_COLS {
            let cell = viewport_cell(tty, row, col);
            surface.draw_cell(row as u16, col as u16, cell.ch, cell.fg, cell.bg);
        }
    }
    surface.move_cursor(tty.cursor_row, tty.cursor_col);
}

pub(super) fn viewport_cell(tty: &Tty, row: usize, col: usize) -> Cell {
    if tty.alt_active {
        tty.alt[row][col]
    } else {
        let base = tty.main.viewport_base(tty.scroll_delta);
        tty.main.row(base + row)[col]
    }
}
