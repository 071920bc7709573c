//! JPEG rendering adapter.
//!
//! Thin layer between the pipeline and the streaming decoder: it carries
//! the render-time knobs (decimation factor, byte order), routes decoded
//! tiles into a [`DisplaySink`], stops the decode once tiles fall below
//! the viewport, and maps decoder codes onto [`JpegError`].

mod decoder;

use embedded_graphics_core::geometry::{Point, Size};
use embedded_graphics_core::pixelcolor::raw::RawU16;
use embedded_graphics_core::pixelcolor::{IntoStorage, Rgb565, RgbColor};
use log::warn;

use crate::display::DisplaySink;
use crate::error::JpegError;
use crate::storage::ImageSource;

use decoder::DecodeError;

/// Reply from the tile sink: keep decoding or abort the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileAction {
    Continue,
    Stop,
}

/// Stateful JPEG renderer. One per pipeline; reused across images.
pub struct JpegAdapter {
    scale: u8,
    swap_bytes: bool,
}

impl JpegAdapter {
    pub const fn new() -> Self {
        Self {
            scale: 1,
            swap_bytes: false,
        }
    }

    /// Set the decimation factor for subsequent draws (1, 2, 4 or 8).
    /// Out-of-range values are caught at decode time.
    pub fn set_scale(&mut self, scale: u8) {
        self.scale = scale;
    }

    pub fn scale(&self) -> u8 {
        self.scale
    }

    /// Emit RGB565 with bytes swapped, for sinks that push the buffer to
    /// a big-endian bus without converting.
    pub fn set_swap_bytes(&mut self, swap: bool) {
        self.swap_bytes = swap;
    }

    /// Read the frame dimensions without decoding pixel data.
    pub fn probe_size<S: ImageSource>(&mut self, src: &mut S) -> Result<(u16, u16), JpegError> {
        decoder::probe_size(src).map_err(|e| {
            warn!("jpeg: size probe failed: {e:?}");
            JpegError::MalformedHeader
        })
    }

    /// Decode and draw the image with its top-left corner at `origin`.
    ///
    /// Tiles entirely below the sink's viewport abort the decode early;
    /// that is a success, not an error.
    pub fn draw<S, D>(&mut self, src: &mut S, sink: &mut D, origin: Point) -> Result<(), JpegError>
    where
        S: ImageSource,
        D: DisplaySink,
    {
        let viewport = sink.size();
        let swap = self.swap_bytes;
        let mut swapped = [Rgb565::BLACK; 256];

        let mut push = |p: Point, size: Size, pixels: &[Rgb565]| -> TileAction {
            match tile_action(viewport, p.y) {
                TileAction::Stop => TileAction::Stop,
                TileAction::Continue => {
                    if swap {
                        for (dst, src) in swapped.iter_mut().zip(pixels) {
                            *dst = swap_color(*src);
                        }
                        sink.draw_block(p, size, &swapped[..pixels.len()]);
                    } else {
                        sink.draw_block(p, size, pixels);
                    }
                    TileAction::Continue
                }
            }
        };

        decoder::decode(src, self.scale, origin, &mut push).map_err(map_decode_error)
    }
}

impl Default for JpegAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Decide whether a tile whose top row lands at `tile_y` is worth drawing.
/// Tiles arrive top-to-bottom, so the first one past the bottom edge means
/// nothing visible is left.
fn tile_action(viewport: Size, tile_y: i32) -> TileAction {
    if tile_y >= viewport.height as i32 {
        TileAction::Stop
    } else {
        TileAction::Continue
    }
}

fn swap_color(c: Rgb565) -> Rgb565 {
    Rgb565::from(RawU16::new(c.into_storage().swap_bytes()))
}

fn map_decode_error(e: DecodeError) -> JpegError {
    warn!("jpeg: decode failed: {e:?}");
    match e {
        DecodeError::Memory | DecodeError::Format(_) => JpegError::OutOfMemoryOrFormat,
        DecodeError::Subformat(_) => JpegError::UnsupportedSubformat,
        DecodeError::Data(_) | DecodeError::Input(_) => JpegError::CorruptData,
        DecodeError::Parameter => JpegError::BadParameter,
        DecodeError::Marker(m) => JpegError::Unknown(m),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! JPEG byte fixtures shared across the unit tests.

    use alloc::vec::Vec;

    /// 8x8 grayscale baseline JPEG: flat quant table, 1-bit Huffman codes
    /// for symbol 0, and a single DC-only block (mid-grey, 0x8410 in 565).
    pub(crate) fn tiny_gray_jpeg() -> Vec<u8> {
        let mut v = alloc::vec![0xFF, 0xD8];
        // DQT, table 0, all ones
        v.extend([0xFF, 0xDB, 0x00, 0x43, 0x00]);
        v.extend([1u8; 64]);
        // SOF0: 8-bit, 8x8, one component, 1x1 sampling, quant table 0
        v.extend([
            0xFF, 0xC0, 0x00, 0x0B, 0x08, 0x00, 0x08, 0x00, 0x08, 0x01, 0x01, 0x11, 0x00,
        ]);
        // DHT DC0: one 1-bit code for value 0
        v.extend([0xFF, 0xC4, 0x00, 0x14, 0x00, 0x01]);
        v.extend([0u8; 15]);
        v.push(0x00);
        // DHT AC0: one 1-bit code for value 0 (EOB)
        v.extend([0xFF, 0xC4, 0x00, 0x14, 0x10, 0x01]);
        v.extend([0u8; 15]);
        v.push(0x00);
        // SOS: baseline spectral range
        v.extend([0xFF, 0xDA, 0x00, 0x08, 0x01, 0x01, 0x00, 0x00, 0x3F, 0x00]);
        // entropy: DC '0' + AC EOB '0', zero-padded
        v.push(0x00);
        v.extend([0xFF, 0xD9]);
        v
    }
}
