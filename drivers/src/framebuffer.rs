//! The character-grid surface the TTY renders onto.
//!
//! The actual device (VGA text mode, a pixel framebuffer with a font
//! renderer) registers one implementation at boot; until then output
//! only lands in the TTY's own rings.

pub trait Framebuffer: Send + Sync {
    fn rows(&self) -> u16;
    fn cols(&self) -> u16;
    fn draw_cell(&self, row: u16, col: u16, ch: u8, fg: u8, bg: u8);
    fn move_cursor(&self, row: u16, col: u16);
    fn set_cursor_visible(&self, visible: bool);
}

static SURFACE: spin::Once<&'static dyn Framebuffer> = spin::Once::new();

pub fn register_framebuffer(surface: &'static dyn Framebuffer) {
    SURFACE.call_once(|| surface);
}

pub fn framebuffer() -> Option<&'static dyn Framebuffer> {
    SURFACE.get().copied()
}
