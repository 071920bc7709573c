//! Panel color packing.
//!
//! The panel's native pixel format is RGB565: 5 bits red, 6 bits green,
//! 5 bits blue, packed into one `u16`. Packing discards the low-order
//! bits of each 8-bit channel.

use embedded_graphics_core::pixelcolor::Rgb565;
use embedded_graphics_core::pixelcolor::raw::RawU16;

/// Pack 8-bit-per-channel RGB into the panel's RGB565 layout.
#[inline]
pub fn rgb888_to_panel(r: u8, g: u8, b: u8) -> Rgb565 {
    let packed = ((r as u16 & 0xF8) << 8) | ((g as u16 & 0xFC) << 3) | (b as u16 >> 3);
    Rgb565::from(RawU16::new(packed))
}

/// Pack channels supplied blue-first, as stored in BMP pixel rows.
///
/// Produces the identical packed value as [`rgb888_to_panel`] for the
/// same logical color.
#[inline]
pub fn bgr888_to_panel(b: u8, g: u8, r: u8) -> Rgb565 {
    rgb888_to_panel(r, g, b)
}
