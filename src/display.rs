//! Display sink abstraction.
//!
//! The pipeline never talks to panel hardware directly. Concrete drivers
//! (one per supported controller) implement [`DisplaySink`] and are picked
//! once at startup; the pipeline draws through the trait and can be pointed
//! at a different driver by explicit reconfiguration.
//!
//! Implementations own all clipping for the bulk primitives: `draw_block`
//! and `fill_rect` must silently drop the parts of a rectangle that fall
//! outside the viewport.

use embedded_graphics_core::geometry::{Point, Size};
use embedded_graphics_core::pixelcolor::Rgb565;

/// Panel rotation. The frame supports exactly two orientations of the
/// physical panel; which hardware rotation value each maps to is the
/// driver's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    /// Long edge horizontal. The power-on default.
    #[default]
    Landscape,
    /// Long edge vertical.
    Portrait,
}

/// Anchor for text drawn over a rendered image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayPosition {
    Top,
    Bottom,
}

/// Drawing surface consumed by the rendering pipeline.
pub trait DisplaySink {
    /// Select the panel rotation. Takes effect immediately; the viewport
    /// reported by [`size`](DisplaySink::size) changes with it.
    fn set_rotation(&mut self, rotation: Rotation);

    /// Viewport size under the current rotation.
    fn size(&self) -> Size;

    /// Draw one pixel. Out-of-viewport coordinates are silently dropped.
    fn draw_pixel(&mut self, p: Point, color: Rgb565);

    /// Draw a `size.width` x `size.height` block of panel colors, row-major,
    /// with its top-left corner at `p`. Clips to the viewport.
    fn draw_block(&mut self, p: Point, size: Size, pixels: &[Rgb565]);

    /// Fill a rectangle with a solid color. Clips to the viewport.
    fn fill_rect(&mut self, p: Point, size: Size, color: Rgb565);

    /// Show the "loading" indicator drawn while a decode is in flight.
    fn show_loading(&mut self);

    /// Show a user-visible error message.
    fn show_error(&mut self, message: &str);

    /// Draw a line of text over whatever is currently on screen.
    fn overlay_text(&mut self, text: &str, position: OverlayPosition);
}
