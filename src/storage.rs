//! Byte source abstraction for the image store.
//!
//! The firmware keeps images on whatever filesystem the board provides
//! (SD over SPI, on-chip flash, ...). The pipeline only needs to open a
//! file by name and pull bytes out of it; everything else stays in the
//! storage driver. Errors are static strings, to be wrapped by the caller.

/// An open, seekable image file.
///
/// Files are closed by dropping the handle.
pub trait ImageSource {
    /// Read up to `buf.len()` bytes from the current position.
    ///
    /// Returns the number of bytes read; `0` means end of file.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, &'static str>;

    /// Seek to an absolute byte offset from the start of the file.
    fn seek(&mut self, offset: u32) -> Result<(), &'static str>;

    /// Total file size in bytes.
    fn size(&self) -> u32;
}

/// The image store itself.
pub trait Storage {
    type File: ImageSource;

    /// Whether a file with this path exists.
    fn exists(&mut self, path: &str) -> bool;

    /// Open a file for reading.
    fn open(&mut self, path: &str) -> Result<Self::File, &'static str>;
}

/// Read until `buf` is full or the source runs dry; returns bytes read.
///
/// [`ImageSource::read`] may return short counts (sector boundaries,
/// chunked transports), so header and row reads go through this.
pub fn read_fully<S: ImageSource>(src: &mut S, buf: &mut [u8]) -> Result<usize, &'static str> {
    let mut total = 0usize;
    while total < buf.len() {
        let n = src.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}
