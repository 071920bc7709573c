//! 24-bit uncompressed BMP decoder.
//!
//! Streams the file one padded row at a time, bottom-up as stored, and
//! pushes converted pixels straight to the display sink. Peak memory is a
//! single row buffer no matter how large the image is.
//!
//! Top-down files (negative height) are rejected rather than rendered
//! upside down; see [`BmpError::TopDownUnsupported`].

extern crate alloc;

use alloc::vec::Vec;

use embedded_graphics_core::geometry::Point;
use log::{info, warn};

use crate::color;
use crate::display::DisplaySink;
use crate::error::BmpError;
use crate::layout::RenderPlan;
use crate::storage::{ImageSource, read_fully};

/// File header plus the info-header fields this decoder cares about.
pub const HEADER_LEN: usize = 54;

/// Fixed-layout header parsed from the first 54 bytes of the file.
///
/// Constructed fresh per decode, read-only once parsed.
#[derive(Debug, Clone, Copy)]
pub struct BmpHeader {
    pub file_size: u32,
    pub data_offset: u32,
    pub header_size: u32,
    /// Signed: the file format allows negative values.
    pub width: i32,
    /// Negative height would mark top-down row order.
    pub height: i32,
    pub planes: u16,
    pub bits_per_pixel: u16,
    pub compression: u32,
    pub image_size: u32,
    pub resolution_x: i32,
    pub resolution_y: i32,
    pub colors_used: u32,
    pub colors_important: u32,
}

impl BmpHeader {
    /// Parse the fixed header. Checks the signature only; use
    /// [`validate`](Self::validate) for format support checks.
    pub fn parse(buf: &[u8]) -> Result<Self, BmpError> {
        if buf.len() < HEADER_LEN {
            return Err(BmpError::TruncatedHeader);
        }
        if &buf[0..2] != b"BM" {
            return Err(BmpError::BadSignature);
        }
        Ok(Self {
            file_size: le_u32(buf, 2),
            // bytes 6..10 are reserved
            data_offset: le_u32(buf, 10),
            header_size: le_u32(buf, 14),
            width: le_u32(buf, 18) as i32,
            height: le_u32(buf, 22) as i32,
            planes: le_u16(buf, 26),
            bits_per_pixel: le_u16(buf, 28),
            compression: le_u32(buf, 30),
            image_size: le_u32(buf, 34),
            resolution_x: le_u32(buf, 38) as i32,
            resolution_y: le_u32(buf, 42) as i32,
            colors_used: le_u32(buf, 46),
            colors_important: le_u32(buf, 50),
        })
    }

    /// Reject everything this decoder cannot render. No pixel is drawn
    /// for a file that fails here.
    pub fn validate(&self) -> Result<(), BmpError> {
        if self.bits_per_pixel != 24 {
            return Err(BmpError::UnsupportedDepth(self.bits_per_pixel));
        }
        if self.compression != 0 {
            return Err(BmpError::UnsupportedCompression(self.compression));
        }
        if self.height < 0 {
            return Err(BmpError::TopDownUnsupported);
        }
        if self.width <= 0
            || self.height == 0
            || self.width > u16::MAX as i32
            || self.height > u16::MAX as i32
        {
            return Err(BmpError::InvalidDimensions);
        }
        Ok(())
    }

    /// Row byte count, padded to a 4-byte boundary.
    pub fn row_stride(&self) -> u32 {
        (self.width as u32 * 3).div_ceil(4) * 4
    }
}

fn read_header<S: ImageSource>(src: &mut S) -> Result<BmpHeader, BmpError> {
    src.seek(0).map_err(BmpError::Source)?;
    let mut buf = [0u8; HEADER_LEN];
    let n = read_fully(src, &mut buf).map_err(BmpError::Source)?;
    if n < HEADER_LEN {
        return Err(BmpError::TruncatedHeader);
    }
    let header = BmpHeader::parse(&buf)?;
    header.validate()?;
    Ok(header)
}

/// Cheap probe: validated pixel dimensions, no pixel data touched.
pub fn probe_size<S: ImageSource>(src: &mut S) -> Result<(u16, u16), BmpError> {
    let header = read_header(src)?;
    Ok((header.width as u16, header.height as u16))
}

/// Decode the file and draw it according to `plan`.
///
/// Rows are stored bottom-up, so decode starts at the visual bottom of
/// the image. On truncated data whatever was already drawn stays on
/// screen and the error reports the partial render; nothing is rolled
/// back. Pixels landing outside the viewport are silently clipped.
pub fn decode<S, D>(src: &mut S, sink: &mut D, plan: &RenderPlan) -> Result<(), BmpError>
where
    S: ImageSource,
    D: DisplaySink,
{
    let header = read_header(src)?;
    let width = header.width as u32;
    let height = header.height as u32;
    let stride = header.row_stride() as usize;

    // exactly one row of scratch, regardless of image size
    let mut row: Vec<u8> = Vec::new();
    row.try_reserve_exact(stride)
        .map_err(|_| BmpError::AllocationFailed)?;
    row.resize(stride, 0);

    src.seek(header.data_offset).map_err(BmpError::Source)?;

    let viewport = sink.size();
    let scale = plan.scale.max(1) as u32;

    info!(
        "bmp: {width}x{height} stride {stride}, scale {scale} at ({},{})",
        plan.x, plan.y
    );

    // first stored row is the bottom of the image
    for y in (0..height).rev() {
        let n = read_fully(src, &mut row).map_err(BmpError::Source)?;
        if n < stride {
            warn!("bmp: data ends at row {y}; keeping pixels already drawn");
            return Err(BmpError::TruncatedData);
        }

        if y % scale != 0 {
            continue;
        }
        let py = plan.y + (y / scale) as i32;
        if py < 0 || py >= viewport.height as i32 {
            continue;
        }

        for x in (0..width).step_by(scale as usize) {
            let px = plan.x + (x / scale) as i32;
            if px < 0 || px >= viewport.width as i32 {
                continue;
            }
            let i = (x * 3) as usize;
            // source order is BGR
            let c = color::bgr888_to_panel(row[i], row[i + 1], row[i + 2]);
            sink.draw_pixel(Point::new(px, py), c);
        }
    }

    Ok(())
}

#[inline]
fn le_u16(d: &[u8], o: usize) -> u16 {
    u16::from_le_bytes([d[o], d[o + 1]])
}

#[inline]
fn le_u32(d: &[u8], o: usize) -> u32 {
    u32::from_le_bytes([d[o], d[o + 1], d[o + 2], d[o + 3]])
}
