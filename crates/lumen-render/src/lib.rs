// SPDX-License-Identifier: CEPL-1.0

/// Drawable size of a window surface, in physical pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True while either side is zero (minimized or not yet laid out).
    pub fn is_degenerate(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// The window as seen by the frame scheduler.
pub trait SurfaceWindow {
    /// Current drawable extent. May be 0x0 while minimized.
    fn extent(&self) -> RenderSize;

    /// Whether a resize happened since the flag was last reset.
    fn was_resized(&self) -> bool;

    fn reset_resized_flag(&mut self);

    /// Set once the user or the platform has asked the window to close.
    fn close_requested(&self) -> bool;

    /// Blocks until at least one window event has been processed.
    fn wait_events(&mut self);
}
