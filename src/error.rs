//! Error taxonomy shared across the pipeline.
//!
//! Decoders return a typed failure to the controller; the controller turns
//! it into an overlay message (via `Display`) and propagates it to the poll
//! loop or HTTP handler. Nothing in here is fatal to the device.

use core::fmt;

/// Failures from the uncompressed-bitmap decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BmpError {
    /// The file ended before a complete header could be read.
    TruncatedHeader,
    /// First two bytes were not the `BM` signature.
    BadSignature,
    /// Only 24 bits per pixel is supported; carries the offending depth.
    UnsupportedDepth(u16),
    /// Only uncompressed data is supported; carries the compression tag.
    UnsupportedCompression(u32),
    /// Negative height marks a top-down file, which this decoder rejects.
    TopDownUnsupported,
    /// Width or height is zero, negative, or too large for the panel math.
    InvalidDimensions,
    /// Pixel data ended early; rows above the break were already drawn.
    TruncatedData,
    /// The row scratch buffer could not be allocated.
    AllocationFailed,
    /// The byte source failed underneath the decoder.
    Source(&'static str),
}

impl fmt::Display for BmpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedHeader => f.write_str("BMP header truncated"),
            Self::BadSignature => f.write_str("not a BMP file"),
            Self::UnsupportedDepth(bpp) => write!(f, "unsupported BMP depth: {bpp} bpp"),
            Self::UnsupportedCompression(c) => write!(f, "compressed BMP not supported ({c})"),
            Self::TopDownUnsupported => f.write_str("top-down BMP not supported"),
            Self::InvalidDimensions => f.write_str("bad BMP dimensions"),
            Self::TruncatedData => f.write_str("BMP data truncated"),
            Self::AllocationFailed => f.write_str("out of memory for BMP row"),
            Self::Source(e) => write!(f, "read failed: {e}"),
        }
    }
}

/// Failures from the JPEG path, as interpreted by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JpegError {
    /// The cheap size probe could not find usable frame dimensions.
    MalformedHeader,
    /// Decoder workspace allocation failed or the marker stream is broken.
    OutOfMemoryOrFormat,
    /// Valid JPEG, but a flavor this decoder refuses (progressive,
    /// 12-bit precision, exotic subsampling).
    UnsupportedSubformat,
    /// The entropy-coded data is corrupt or ends early.
    CorruptData,
    /// A caller-supplied parameter (decimation factor) is out of range.
    BadParameter,
    /// Anything the adapter does not recognize; carries the raw code.
    Unknown(u8),
}

impl fmt::Display for JpegError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedHeader => f.write_str("JPEG header malformed"),
            Self::OutOfMemoryOrFormat => f.write_str("out of memory or bad JPEG"),
            Self::UnsupportedSubformat => f.write_str("JPEG flavor not supported"),
            Self::CorruptData => f.write_str("JPEG data corrupt"),
            Self::BadParameter => f.write_str("bad decode parameter"),
            Self::Unknown(code) => write!(f, "unknown decode error {code}"),
        }
    }
}

/// Top-level pipeline failure handed back to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    /// `begin()` has not been called.
    NotInitialized,
    /// A caller argument was rejected before any work happened.
    InvalidArgument(&'static str),
    /// The filename extension matches no known image format.
    UnsupportedFormat,
    /// The storage layer could not produce the file.
    Storage(&'static str),
    Bmp(BmpError),
    Jpeg(JpegError),
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => f.write_str("pipeline not initialized"),
            Self::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            Self::UnsupportedFormat => f.write_str("unsupported image format"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Bmp(e) => e.fmt(f),
            Self::Jpeg(e) => e.fmt(f),
        }
    }
}

impl From<BmpError> for ImageError {
    fn from(e: BmpError) -> Self {
        Self::Bmp(e)
    }
}

impl From<JpegError> for ImageError {
    fn from(e: JpegError) -> Self {
        Self::Jpeg(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_text_is_overlay_ready() {
        let msg = alloc::format!("{}", ImageError::Bmp(BmpError::UnsupportedDepth(16)));
        assert_eq!(msg, "unsupported BMP depth: 16 bpp");

        let msg = alloc::format!("{}", ImageError::Jpeg(JpegError::Unknown(9)));
        assert_eq!(msg, "unknown decode error 9");

        let msg = alloc::format!("{}", ImageError::UnsupportedFormat);
        assert_eq!(msg, "unsupported image format");
    }
}
