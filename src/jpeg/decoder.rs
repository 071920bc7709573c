//! Streaming baseline JPEG decoder.
//!
//! Markers are parsed from a bounded header window, then the entropy data
//! is streamed in 4 KB chunks and decoded MCU by MCU. Each MCU is color
//! converted (YCbCr or grayscale) to RGB565, decimated by the configured
//! factor, and pushed to the caller as one tile; the whole image is never
//! held in memory.
//!
//! Progressive JPEG, 12-bit precision, and sampling factors above 2x2 are
//! rejected as unsupported subformats.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use embedded_graphics_core::geometry::{Point, Size};
use embedded_graphics_core::pixelcolor::{Rgb565, RgbColor};
use log::info;

use super::TileAction;
use crate::color;
use crate::storage::{ImageSource, read_fully};

// JPEG marker bytes

const M_SOF0: u8 = 0xC0;
const M_SOF2: u8 = 0xC2;
const M_DHT: u8 = 0xC4;
const M_SOI: u8 = 0xD8;
const M_EOI: u8 = 0xD9;
const M_SOS: u8 = 0xDA;
const M_DQT: u8 = 0xDB;
const M_DRI: u8 = 0xDD;
const M_RST0: u8 = 0xD0;
const M_RST7: u8 = 0xD7;

// limits

const MAX_COMP: usize = 3;
const MAX_PIXELS: u32 = 4096 * 4096;

// largest MCU is 16x16, so a decimated tile never exceeds this
pub(crate) const MAX_TILE_PIXELS: usize = 256;

// header bytes to read for marker parsing; large APP/EXIF segments are
// skipped by length within this window
const HEADER_READ: usize = 32768;

// chunk size for streaming reads during MCU decode
const CHUNK_SIZE: usize = 4096;

// zig-zag scan order

#[rustfmt::skip]
const ZZ: [usize; 64] = [
     0,  1,  8, 16,  9,  2,  3, 10,
    17, 24, 32, 25, 18, 11,  4,  5,
    12, 19, 26, 33, 40, 48, 41, 34,
    27, 20, 13,  6,  7, 14, 21, 28,
    35, 42, 49, 56, 57, 50, 43, 36,
    29, 22, 15, 23, 30, 37, 44, 51,
    58, 59, 52, 45, 38, 31, 39, 46,
    53, 60, 61, 54, 47, 55, 62, 63,
];

// IDCT constants (IJG ISLOW, CONST_BITS = 13)

const CB: i32 = 13;
const P1: i32 = 2;
const F0298: i32 = 2446;
const F0390: i32 = 3196;
const F0541: i32 = 4433;
const F0765: i32 = 6270;
const F0899: i32 = 7373;
const F1175: i32 = 9633;
const F1501: i32 = 12299;
const F1847: i32 = 15137;
const F1961: i32 = 16069;
const F2053: i32 = 16819;
const F2562: i32 = 20995;
const F3072: i32 = 25172;

/// Decoder result codes. The rendering adapter maps these onto the
/// public error taxonomy; the payload strings are for the log only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecodeError {
    /// Workspace or buffer allocation failed.
    Memory,
    /// The byte source failed underneath the decoder.
    Input(&'static str),
    /// The requested decimation factor is unsupported.
    Parameter,
    /// The stream is not a JPEG this parser understands.
    Format(&'static str),
    /// Valid JPEG, but a flavor this decoder refuses.
    Subformat(&'static str),
    /// The entropy-coded data is broken or ends early.
    Data(&'static str),
    /// An unexpected marker interrupted the scan.
    Marker(u8),
}

// frame state

#[derive(Clone, Copy, Default)]
struct Component {
    id: u8,
    h_samp: u8,
    v_samp: u8,
    qt_idx: u8,
    dc_tbl: u8,
    ac_tbl: u8,
}

struct HuffTable {
    lut: [(u8, u8); 256],
    mincode: [i32; 17],
    maxcode: [i32; 17],
    valptr: [usize; 17],
    values: [u8; 256],
}

struct FrameState {
    width: u16,
    height: u16,
    num_comp: u8,
    comp: [Component; MAX_COMP],
    max_h: u8,
    max_v: u8,
    qt: [[u16; 64]; 4],
    qt_ok: [bool; 4],
    dc_huff: [HuffTable; 4],
    ac_huff: [HuffTable; 4],
    dc_ok: [bool; 4],
    ac_ok: [bool; 4],
    restart_interval: u16,
    // byte offset of entropy data from the start of the file
    scan_start: usize,
    // frame-component index for each scan component
    scan_order: [u8; MAX_COMP],
}

impl FrameState {
    // ~7 KB of tables; zeroed on the heap instead of passing through the
    // stack of whatever task runs the decode
    fn heap_new() -> Result<Box<Self>, DecodeError> {
        let layout = core::alloc::Layout::new::<Self>();
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(DecodeError::Memory);
        }
        let mut st = unsafe { Box::from_raw(ptr as *mut Self) };
        st.max_h = 1;
        st.max_v = 1;
        let inner = &mut *st;
        for ht in inner.dc_huff.iter_mut().chain(inner.ac_huff.iter_mut()) {
            ht.maxcode.fill(-1);
        }
        Ok(st)
    }
}

// byte feed: chunked sequential reads from the image source

trait ByteFeed {
    fn read_byte(&mut self) -> Result<u8, DecodeError>;
    fn is_eof(&self) -> bool;
}

struct ChunkSource<'a, S: ImageSource> {
    src: &'a mut S,
    buf: [u8; CHUNK_SIZE],
    pos: usize,
    len: usize,
    eof: bool,
}

impl<'a, S: ImageSource> ChunkSource<'a, S> {
    fn new(src: &'a mut S) -> Self {
        Self {
            src,
            buf: [0u8; CHUNK_SIZE],
            pos: 0,
            len: 0,
            eof: false,
        }
    }

    fn refill(&mut self) -> Result<(), DecodeError> {
        let n = self.src.read(&mut self.buf).map_err(DecodeError::Input)?;
        self.pos = 0;
        self.len = n;
        if n == 0 {
            self.eof = true;
        }
        Ok(())
    }
}

impl<S: ImageSource> ByteFeed for ChunkSource<'_, S> {
    fn read_byte(&mut self) -> Result<u8, DecodeError> {
        if self.pos >= self.len {
            self.refill()?;
            if self.len == 0 {
                return Err(DecodeError::Data("scan data ends early"));
            }
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn is_eof(&self) -> bool {
        self.eof && self.pos >= self.len
    }
}

// bit reader over the byte feed, with JPEG byte-stuffing handling

struct BitReader<R> {
    source: R,
    buf: u32,
    avail: u8,
    marker: u8, // stashed marker byte (non-zero = seen during next_byte)
}

impl<R: ByteFeed> BitReader<R> {
    fn new(source: R) -> Self {
        Self {
            source,
            buf: 0,
            avail: 0,
            marker: 0,
        }
    }

    // fetch the next entropy-coded byte; pads zeros once a marker is seen
    fn next_byte(&mut self) -> Result<u8, DecodeError> {
        if self.marker != 0 {
            return Ok(0);
        }
        let b = self.source.read_byte()?;
        if b != 0xFF {
            return Ok(b);
        }
        loop {
            if self.source.is_eof() {
                return Ok(0);
            }
            let next = self.source.read_byte()?;
            match next {
                0x00 => return Ok(0xFF),
                0xFF => continue,
                _ => {
                    self.marker = next;
                    return Ok(0);
                }
            }
        }
    }

    fn ensure(&mut self, n: u8) -> Result<(), DecodeError> {
        while self.avail < n {
            let b = self.next_byte()?;
            self.buf |= (b as u32) << (24 - self.avail);
            self.avail += 8;
        }
        Ok(())
    }

    #[inline]
    fn peek(&mut self, n: u8) -> Result<u32, DecodeError> {
        self.ensure(n)?;
        Ok(self.buf >> (32 - n as u32))
    }

    #[inline]
    fn drop_bits(&mut self, n: u8) {
        self.buf <<= n as u32;
        self.avail -= n;
    }

    #[inline]
    fn read_bits(&mut self, n: u8) -> Result<u32, DecodeError> {
        if n == 0 {
            return Ok(0);
        }
        self.ensure(n)?;
        let val = self.buf >> (32 - n as u32);
        self.buf <<= n as u32;
        self.avail -= n;
        Ok(val)
    }

    // discard remaining bits and advance past the expected restart marker
    fn consume_restart(&mut self) -> Result<(), DecodeError> {
        self.buf = 0;
        self.avail = 0;

        if self.marker != 0 {
            let m = self.marker;
            self.marker = 0;
            return if (M_RST0..=M_RST7).contains(&m) {
                Ok(())
            } else {
                Err(DecodeError::Marker(m))
            };
        }

        loop {
            let b = self.source.read_byte()?;
            if b != 0xFF {
                continue;
            }
            loop {
                let m = self.source.read_byte()?;
                match m {
                    0xFF => continue,
                    0x00 => break,
                    M_RST0..=M_RST7 => return Ok(()),
                    other => return Err(DecodeError::Marker(other)),
                }
            }
        }
    }
}

// public (crate) API

/// Find the frame dimensions without decoding any pixel data.
pub(crate) fn probe_size<S: ImageSource>(src: &mut S) -> Result<(u16, u16), DecodeError> {
    let hdr = read_header_window(src)?;
    scan_dimensions(&hdr)
}

/// Decode the image, pushing RGB565 tiles (absolute coordinates, offset
/// by `origin`) through `out`. A [`TileAction::Stop`] reply aborts the
/// decode cleanly.
pub(crate) fn decode<S, F>(
    src: &mut S,
    scale: u8,
    origin: Point,
    out: &mut F,
) -> Result<(), DecodeError>
where
    S: ImageSource,
    F: FnMut(Point, Size, &[Rgb565]) -> TileAction,
{
    if !matches!(scale, 1 | 2 | 4 | 8) {
        return Err(DecodeError::Parameter);
    }

    let hdr = read_header_window(src)?;
    let st = parse_markers(&hdr)?;
    validate_tables(&st)?;
    drop(hdr);

    src.seek(st.scan_start as u32).map_err(DecodeError::Input)?;
    let reader = BitReader::new(ChunkSource::new(src));
    decode_scan(&st, reader, scale, origin, out)
}

fn read_header_window<S: ImageSource>(src: &mut S) -> Result<Vec<u8>, DecodeError> {
    src.seek(0).map_err(DecodeError::Input)?;
    let want = HEADER_READ.min(src.size() as usize);
    let mut hdr = Vec::new();
    hdr.try_reserve_exact(want).map_err(|_| DecodeError::Memory)?;
    hdr.resize(want, 0);
    let n = read_fully(src, &mut hdr).map_err(DecodeError::Input)?;
    hdr.truncate(n);
    Ok(hdr)
}

// light marker walk that stops at the first frame header of any SOF type

fn scan_dimensions(data: &[u8]) -> Result<(u16, u16), DecodeError> {
    if data.len() < 2 || data[0] != 0xFF || data[1] != M_SOI {
        return Err(DecodeError::Format("no SOI signature"));
    }
    let len = data.len();
    let mut pos = 2usize;

    loop {
        while pos < len && data[pos] != 0xFF {
            pos += 1;
        }
        while pos < len && data[pos] == 0xFF {
            pos += 1;
        }
        if pos >= len {
            return Err(DecodeError::Format("no frame header"));
        }
        let marker = data[pos];
        pos += 1;

        match marker {
            0x00 | M_RST0..=M_RST7 => continue,
            M_EOI => return Err(DecodeError::Format("EOI before frame header")),
            M_SOS => return Err(DecodeError::Format("scan before frame header")),
            // any SOF variant carries dimensions at the same offsets
            0xC0..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF => {
                if pos + 7 > len {
                    return Err(DecodeError::Format("frame header truncated"));
                }
                let h = be_u16(data, pos + 3);
                let w = be_u16(data, pos + 5);
                if w == 0 || h == 0 {
                    return Err(DecodeError::Format("zero dimensions"));
                }
                return Ok((w, h));
            }
            _ => {
                if pos + 2 > len {
                    return Err(DecodeError::Format("marker truncated"));
                }
                let seg = be_u16(data, pos) as usize;
                if seg < 2 || pos + seg > len {
                    return Err(DecodeError::Format("bad marker length"));
                }
                pos += seg;
            }
        }
    }
}

// full marker parsing (operates on the header window)

fn parse_markers(data: &[u8]) -> Result<Box<FrameState>, DecodeError> {
    if data.len() < 2 || data[0] != 0xFF || data[1] != M_SOI {
        return Err(DecodeError::Format("no SOI signature"));
    }
    let mut st = FrameState::heap_new()?;
    let mut pos = 2usize;
    let len = data.len();

    loop {
        while pos < len && data[pos] != 0xFF {
            pos += 1;
        }
        while pos < len && data[pos] == 0xFF {
            pos += 1;
        }
        if pos >= len {
            return Err(DecodeError::Format("truncated before scan"));
        }
        let marker = data[pos];
        pos += 1;

        match marker {
            0x00 | M_RST0..=M_RST7 => continue,

            M_SOF0 => parse_sof(data, &mut pos, &mut st)?,
            M_SOF2 => return Err(DecodeError::Subformat("progressive")),
            0xC1 | 0xC3 | 0xC5..=0xCB | 0xCD..=0xCF => {
                return Err(DecodeError::Subformat("non-baseline frame"));
            }
            M_DHT => parse_dht(data, &mut pos, &mut st)?,
            M_DQT => parse_dqt(data, &mut pos, &mut st)?,
            M_DRI => parse_dri(data, &mut pos, &mut st)?,
            M_SOS => {
                parse_sos(data, &mut pos, &mut st)?;
                st.scan_start = pos;
                return Ok(st);
            }
            M_EOI => return Err(DecodeError::Format("EOI before scan")),
            _ => {
                if pos + 2 > len {
                    return Err(DecodeError::Format("marker truncated"));
                }
                let seg = be_u16(data, pos) as usize;
                if seg < 2 || pos + seg > len {
                    return Err(DecodeError::Format("bad marker length"));
                }
                pos += seg;
            }
        }
    }
}

fn parse_sof(data: &[u8], pos: &mut usize, st: &mut FrameState) -> Result<(), DecodeError> {
    if *pos + 2 > data.len() {
        return Err(DecodeError::Format("SOF truncated"));
    }
    let seg = be_u16(data, *pos) as usize;
    *pos += 2;
    // length field + precision + dimensions + component count at minimum
    if seg < 8 || *pos + seg - 2 > data.len() {
        return Err(DecodeError::Format("SOF truncated"));
    }
    let p = *pos;
    if data[p] != 8 {
        return Err(DecodeError::Subformat("12-bit precision"));
    }
    st.height = be_u16(data, p + 1);
    st.width = be_u16(data, p + 3);
    st.num_comp = data[p + 5];
    if st.num_comp != 1 && st.num_comp != 3 {
        return Err(DecodeError::Subformat("component count"));
    }
    if p + 6 + st.num_comp as usize * 3 > data.len() {
        return Err(DecodeError::Format("SOF truncated"));
    }
    let mut off = p + 6;
    st.max_h = 1;
    st.max_v = 1;
    for i in 0..st.num_comp as usize {
        st.comp[i].id = data[off];
        let samp = data[off + 1];
        st.comp[i].h_samp = samp >> 4;
        st.comp[i].v_samp = samp & 0x0F;
        st.comp[i].qt_idx = data[off + 2];
        if !(1..=2).contains(&st.comp[i].h_samp) || !(1..=2).contains(&st.comp[i].v_samp) {
            return Err(DecodeError::Subformat("sampling factor"));
        }
        st.max_h = st.max_h.max(st.comp[i].h_samp);
        st.max_v = st.max_v.max(st.comp[i].v_samp);
        off += 3;
    }
    *pos += seg - 2;
    Ok(())
}

fn parse_dqt(data: &[u8], pos: &mut usize, st: &mut FrameState) -> Result<(), DecodeError> {
    if *pos + 2 > data.len() {
        return Err(DecodeError::Format("DQT truncated"));
    }
    let seg = be_u16(data, *pos) as usize;
    let end = *pos + seg;
    *pos += 2;
    if end > data.len() {
        return Err(DecodeError::Format("DQT truncated"));
    }
    while *pos < end {
        let info = data[*pos];
        *pos += 1;
        let prec = info >> 4;
        let id = (info & 0x0F) as usize;
        if id >= 4 {
            return Err(DecodeError::Format("DQT id out of range"));
        }
        if prec == 0 {
            if *pos + 64 > end {
                return Err(DecodeError::Format("DQT truncated"));
            }
            for i in 0..64 {
                st.qt[id][i] = data[*pos] as u16;
                *pos += 1;
            }
        } else {
            if *pos + 128 > end {
                return Err(DecodeError::Format("DQT truncated"));
            }
            for i in 0..64 {
                st.qt[id][i] = be_u16(data, *pos);
                *pos += 2;
            }
        }
        st.qt_ok[id] = true;
    }
    Ok(())
}

fn parse_dht(data: &[u8], pos: &mut usize, st: &mut FrameState) -> Result<(), DecodeError> {
    if *pos + 2 > data.len() {
        return Err(DecodeError::Format("DHT truncated"));
    }
    let seg = be_u16(data, *pos) as usize;
    let end = *pos + seg;
    *pos += 2;
    if end > data.len() {
        return Err(DecodeError::Format("DHT truncated"));
    }
    while *pos < end {
        if *pos + 17 > end {
            return Err(DecodeError::Format("DHT truncated"));
        }
        let info = data[*pos];
        *pos += 1;
        let class = info >> 4;
        let id = (info & 0x0F) as usize;
        if id >= 4 {
            return Err(DecodeError::Format("DHT id out of range"));
        }
        let mut bits = [0u8; 16];
        bits.copy_from_slice(&data[*pos..*pos + 16]);
        *pos += 16;
        let total: usize = bits.iter().map(|&b| b as usize).sum();
        if total > 256 || *pos + total > end {
            return Err(DecodeError::Format("DHT value overflow"));
        }
        let vals = &data[*pos..*pos + total];
        *pos += total;
        if class == 0 {
            build_huff_table(&mut st.dc_huff[id], &bits, vals);
            st.dc_ok[id] = true;
        } else {
            build_huff_table(&mut st.ac_huff[id], &bits, vals);
            st.ac_ok[id] = true;
        }
    }
    Ok(())
}

fn parse_dri(data: &[u8], pos: &mut usize, st: &mut FrameState) -> Result<(), DecodeError> {
    if *pos + 4 > data.len() {
        return Err(DecodeError::Format("DRI truncated"));
    }
    *pos += 2;
    st.restart_interval = be_u16(data, *pos);
    *pos += 2;
    Ok(())
}

fn parse_sos(data: &[u8], pos: &mut usize, st: &mut FrameState) -> Result<(), DecodeError> {
    if *pos + 2 > data.len() {
        return Err(DecodeError::Format("SOS truncated"));
    }
    let seg = be_u16(data, *pos) as usize;
    // the component count must sit inside the segment and the window
    if seg < 3 || *pos + seg > data.len() {
        return Err(DecodeError::Format("SOS truncated"));
    }
    *pos += 2;
    let scan_comp = data[*pos];
    *pos += 1;
    if seg != 6 + 2 * scan_comp as usize {
        return Err(DecodeError::Format("SOS length mismatch"));
    }
    // baseline color images use one interleaved scan; anything else is a
    // flavor this decoder does not handle
    if scan_comp != st.num_comp {
        return Err(DecodeError::Subformat("non-interleaved scan"));
    }
    for sci in 0..scan_comp as usize {
        let cs = data[*pos];
        let td_ta = data[*pos + 1];
        *pos += 2;
        let mut found = false;
        for j in 0..st.num_comp as usize {
            if st.comp[j].id == cs {
                st.comp[j].dc_tbl = td_ta >> 4;
                st.comp[j].ac_tbl = td_ta & 0x0F;
                st.scan_order[sci] = j as u8;
                found = true;
                break;
            }
        }
        if !found {
            return Err(DecodeError::Format("SOS references unknown component"));
        }
    }
    let ss = data[*pos];
    let se = data[*pos + 1];
    let ah_al = data[*pos + 2];
    *pos += 3;
    if ss != 0 || se != 63 || ah_al != 0 {
        return Err(DecodeError::Subformat("non-baseline scan"));
    }
    Ok(())
}

fn validate_tables(st: &FrameState) -> Result<(), DecodeError> {
    for sci in 0..st.num_comp as usize {
        let c = &st.comp[st.scan_order[sci] as usize];
        if !st.qt_ok[c.qt_idx as usize] {
            return Err(DecodeError::Format("missing quant table"));
        }
        if !st.dc_ok[c.dc_tbl as usize] {
            return Err(DecodeError::Format("missing DC Huffman table"));
        }
        if !st.ac_ok[c.ac_tbl as usize] {
            return Err(DecodeError::Format("missing AC Huffman table"));
        }
    }
    Ok(())
}

// MCU decode loop

fn decode_scan<R, F>(
    st: &FrameState,
    mut reader: BitReader<R>,
    scale: u8,
    origin: Point,
    out: &mut F,
) -> Result<(), DecodeError>
where
    R: ByteFeed,
    F: FnMut(Point, Size, &[Rgb565]) -> TileAction,
{
    let w = st.width as usize;
    let h = st.height as usize;
    if w == 0 || h == 0 {
        return Err(DecodeError::Format("zero dimensions"));
    }
    if (w as u32).saturating_mul(h as u32) > MAX_PIXELS {
        return Err(DecodeError::Subformat("exceeds pixel limit"));
    }

    let s = scale as usize;
    let mcu_w = st.max_h as usize * 8;
    let mcu_h = st.max_v as usize * 8;
    let mcus_x = w.div_ceil(mcu_w);
    let mcus_y = h.div_ceil(mcu_h);
    let total_mcus = (mcus_x * mcus_y) as u32;

    info!(
        "jpeg: baseline {w}x{h}, {} comps, 1/{scale} -> {}x{}",
        st.num_comp,
        w / s,
        h / s
    );

    let mut dc_pred = [0i32; MAX_COMP];
    let mut block = [0i32; 64];
    let mut pix = [0u8; 64];
    // one MCU of samples per plane; chroma stays at its own resolution
    // until upsampled during tile assembly
    let mut ybuf = [0u8; MAX_TILE_PIXELS];
    let mut cbbuf = [128u8; MAX_TILE_PIXELS];
    let mut crbuf = [128u8; MAX_TILE_PIXELS];
    let mut tile = [Rgb565::BLACK; MAX_TILE_PIXELS];

    let mut mcu_cnt: u32 = 0;

    for mcu_row in 0..mcus_y {
        for mcu_col in 0..mcus_x {
            for sci in 0..st.num_comp as usize {
                let ci = st.scan_order[sci] as usize;
                let c = st.comp[ci];
                let stride = if ci == 0 { mcu_w } else { c.h_samp as usize * 8 };

                for bv in 0..c.v_samp as usize {
                    for bh in 0..c.h_samp as usize {
                        decode_block(
                            &mut reader,
                            &st.dc_huff[c.dc_tbl as usize],
                            &st.ac_huff[c.ac_tbl as usize],
                            &mut dc_pred[ci],
                            &st.qt[c.qt_idx as usize],
                            &mut block,
                        )?;
                        idct(&block, &mut pix);

                        let plane = match ci {
                            0 => &mut ybuf,
                            1 => &mut cbbuf,
                            _ => &mut crbuf,
                        };
                        for r in 0..8 {
                            let dst = (bv * 8 + r) * stride + bh * 8;
                            plane[dst..dst + 8].copy_from_slice(&pix[r * 8..r * 8 + 8]);
                        }
                    }
                }
            }
            mcu_cnt += 1;

            // assemble the decimated RGB565 tile for this MCU
            let x0 = mcu_col * mcu_w;
            let y0 = mcu_row * mcu_h;
            let clip_w = mcu_w.min(w - x0);
            let clip_h = mcu_h.min(h - y0);
            let out_w = clip_w.div_ceil(s);
            let out_h = clip_h.div_ceil(s);

            for oy in 0..out_h {
                let sy = oy * s;
                for ox in 0..out_w {
                    let sx = ox * s;
                    let yv = ybuf[sy * mcu_w + sx] as i32;
                    tile[oy * out_w + ox] = if st.num_comp == 1 {
                        let g = yv as u8;
                        color::rgb888_to_panel(g, g, g)
                    } else {
                        let cb = sample_chroma(&cbbuf, &st.comp[1], st.max_h, st.max_v, sx, sy);
                        let cr = sample_chroma(&crbuf, &st.comp[2], st.max_h, st.max_v, sx, sy);
                        let (r, g, b) = ycbcr_to_rgb(yv, cb, cr);
                        color::rgb888_to_panel(r, g, b)
                    };
                }
            }

            let p = Point::new(origin.x + (x0 / s) as i32, origin.y + (y0 / s) as i32);
            let size = Size::new(out_w as u32, out_h as u32);
            if out(p, size, &tile[..out_w * out_h]) == TileAction::Stop {
                info!("jpeg: stopped by sink at MCU row {mcu_row}");
                return Ok(());
            }

            if st.restart_interval > 0
                && mcu_cnt % st.restart_interval as u32 == 0
                && mcu_cnt < total_mcus
            {
                reader.consume_restart()?;
                dc_pred.fill(0);
            }
        }
    }

    Ok(())
}

// nearest-neighbor chroma upsampling within one MCU
#[inline]
fn sample_chroma(plane: &[u8; 256], c: &Component, max_h: u8, max_v: u8, sx: usize, sy: usize) -> i32 {
    let cx = sx * c.h_samp as usize / max_h as usize;
    let cy = sy * c.v_samp as usize / max_v as usize;
    plane[cy * (c.h_samp as usize * 8) + cx] as i32
}

// fixed-point BT.601, scaled by 2^16
#[inline]
fn ycbcr_to_rgb(y: i32, cb: i32, cr: i32) -> (u8, u8, u8) {
    let cb = cb - 128;
    let cr = cr - 128;
    let r = y + ((91881 * cr) >> 16);
    let g = y - ((22554 * cb + 46802 * cr) >> 16);
    let b = y + ((116130 * cb) >> 16);
    (clamp(r), clamp(g), clamp(b))
}

// Huffman table construction

fn build_huff_table(table: &mut HuffTable, bits: &[u8; 16], vals: &[u8]) {
    let total: usize = bits.iter().map(|&b| b as usize).sum();
    table.values[..total].copy_from_slice(&vals[..total]);
    table.lut.fill((0, 0));
    table.maxcode.fill(-1);

    let mut code: u32 = 0;
    let mut si: usize = 0;

    for bl in 1..=16usize {
        let cnt = bits[bl - 1] as usize;
        if cnt > 0 {
            table.valptr[bl] = si;
            table.mincode[bl] = code as i32;
            for _ in 0..cnt {
                if bl <= 8 {
                    let prefix = (code << (8 - bl)) as usize;
                    let fill = 1usize << (8 - bl);
                    for k in 0..fill {
                        if prefix + k < 256 {
                            table.lut[prefix + k] = (vals[si], bl as u8);
                        }
                    }
                }
                si += 1;
                code += 1;
            }
            table.maxcode[bl] = (code - 1) as i32;
        }
        code <<= 1;
    }
}

fn huff_decode<R: ByteFeed>(r: &mut BitReader<R>, t: &HuffTable) -> Result<u8, DecodeError> {
    let peek8 = r.peek(8)? as usize;
    let (sym, nb) = t.lut[peek8];
    if nb > 0 {
        r.drop_bits(nb);
        return Ok(sym);
    }
    let peek16 = r.peek(16)? as i32;
    for bl in 9..=16u8 {
        let code = peek16 >> (16 - bl);
        if t.maxcode[bl as usize] >= 0 && code <= t.maxcode[bl as usize] {
            r.drop_bits(bl);
            let idx = t.valptr[bl as usize] as i32 + code - t.mincode[bl as usize];
            return Ok(t.values[idx as usize]);
        }
    }
    Err(DecodeError::Data("invalid Huffman code"))
}

#[inline]
fn extend(bits: u32, size: u8) -> i32 {
    let half = 1u32 << (size as u32 - 1);
    if bits < half {
        bits as i32 - ((1u32 << size as u32) as i32 - 1)
    } else {
        bits as i32
    }
}

// baseline block decode: DC diff plus full AC run-length sweep

fn decode_block<R: ByteFeed>(
    r: &mut BitReader<R>,
    dc_ht: &HuffTable,
    ac_ht: &HuffTable,
    dc_pred: &mut i32,
    qt: &[u16; 64],
    blk: &mut [i32; 64],
) -> Result<(), DecodeError> {
    blk.fill(0);

    let dc_size = huff_decode(r, dc_ht)?;
    if dc_size > 0 {
        if dc_size > 11 {
            return Err(DecodeError::Data("DC size out of range"));
        }
        let bits = r.read_bits(dc_size)?;
        *dc_pred += extend(bits, dc_size);
    }
    blk[0] = (*dc_pred).wrapping_mul(qt[0] as i32);

    let mut k: usize = 1;
    while k < 64 {
        let sym = huff_decode(r, ac_ht)?;
        let run = (sym >> 4) as usize;
        let size = sym & 0x0F;
        if size == 0 {
            if run == 15 {
                k += 16;
            } else {
                break;
            }
        } else {
            k += run;
            if k > 63 {
                return Err(DecodeError::Data("AC index overflow"));
            }
            let bits = r.read_bits(size)?;
            blk[ZZ[k]] = extend(bits, size).wrapping_mul(qt[k] as i32);
            k += 1;
        }
    }
    Ok(())
}

// integer IDCT (IJG ISLOW, two-pass row + col)

fn idct(block: &[i32; 64], out: &mut [u8; 64]) {
    let mut ws = [0i32; 64];

    for row in 0..8 {
        let b = row * 8;
        let (d0, d1, d2, d3) = (block[b], block[b + 1], block[b + 2], block[b + 3]);
        let (d4, d5, d6, d7) = (block[b + 4], block[b + 5], block[b + 6], block[b + 7]);

        if d1 == 0 && d2 == 0 && d3 == 0 && d4 == 0 && d5 == 0 && d6 == 0 && d7 == 0 {
            let dc = d0 << P1;
            ws[b..b + 8].fill(dc);
            continue;
        }

        let z1 = (d2 + d6).wrapping_mul(F0541);
        let tmp2 = z1 + d6.wrapping_mul(-F1847);
        let tmp3 = z1 + d2.wrapping_mul(F0765);
        let tmp0 = (d0 + d4) << CB;
        let tmp1 = (d0 - d4) << CB;
        let (t10, t13) = (tmp0 + tmp3, tmp0 - tmp3);
        let (t11, t12) = (tmp1 + tmp2, tmp1 - tmp2);

        let (zz1, zz2, zz3, zz4) = (d7 + d1, d5 + d3, d7 + d3, d5 + d1);
        let z5 = (zz3 + zz4).wrapping_mul(F1175);
        let mut o0 = d7.wrapping_mul(F0298);
        let mut o1 = d5.wrapping_mul(F2053);
        let mut o2 = d3.wrapping_mul(F3072);
        let mut o3 = d1.wrapping_mul(F1501);
        let (s1, s2) = (zz1.wrapping_mul(-F0899), zz2.wrapping_mul(-F2562));
        let s3 = zz3.wrapping_mul(-F1961) + z5;
        let s4 = zz4.wrapping_mul(-F0390) + z5;
        o0 += s1 + s3;
        o1 += s2 + s4;
        o2 += s2 + s3;
        o3 += s1 + s4;

        let sh = CB - P1;
        ws[b] = descale(t10 + o3, sh);
        ws[b + 7] = descale(t10 - o3, sh);
        ws[b + 1] = descale(t11 + o2, sh);
        ws[b + 6] = descale(t11 - o2, sh);
        ws[b + 2] = descale(t12 + o1, sh);
        ws[b + 5] = descale(t12 - o1, sh);
        ws[b + 3] = descale(t13 + o0, sh);
        ws[b + 4] = descale(t13 - o0, sh);
    }

    for col in 0..8 {
        let (d0, d1, d2, d3) = (ws[col], ws[col + 8], ws[col + 16], ws[col + 24]);
        let (d4, d5, d6, d7) = (ws[col + 32], ws[col + 40], ws[col + 48], ws[col + 56]);

        if d1 == 0 && d2 == 0 && d3 == 0 && d4 == 0 && d5 == 0 && d6 == 0 && d7 == 0 {
            let v = clamp(descale(d0, P1 + 3) + 128);
            for r in 0..8 {
                out[col + r * 8] = v;
            }
            continue;
        }

        let z1 = (d2 + d6).wrapping_mul(F0541);
        let tmp2 = z1 + d6.wrapping_mul(-F1847);
        let tmp3 = z1 + d2.wrapping_mul(F0765);
        let tmp0 = (d0 + d4) << CB;
        let tmp1 = (d0 - d4) << CB;
        let (t10, t13) = (tmp0 + tmp3, tmp0 - tmp3);
        let (t11, t12) = (tmp1 + tmp2, tmp1 - tmp2);

        let (zz1, zz2, zz3, zz4) = (d7 + d1, d5 + d3, d7 + d3, d5 + d1);
        let z5 = (zz3 + zz4).wrapping_mul(F1175);
        let mut o0 = d7.wrapping_mul(F0298);
        let mut o1 = d5.wrapping_mul(F2053);
        let mut o2 = d3.wrapping_mul(F3072);
        let mut o3 = d1.wrapping_mul(F1501);
        let (s1, s2) = (zz1.wrapping_mul(-F0899), zz2.wrapping_mul(-F2562));
        let s3 = zz3.wrapping_mul(-F1961) + z5;
        let s4 = zz4.wrapping_mul(-F0390) + z5;
        o0 += s1 + s3;
        o1 += s2 + s4;
        o2 += s2 + s3;
        o3 += s1 + s4;

        let sh = CB + P1 + 3;
        out[col] = clamp(descale(t10 + o3, sh) + 128);
        out[col + 56] = clamp(descale(t10 - o3, sh) + 128);
        out[col + 8] = clamp(descale(t11 + o2, sh) + 128);
        out[col + 48] = clamp(descale(t11 - o2, sh) + 128);
        out[col + 16] = clamp(descale(t12 + o1, sh) + 128);
        out[col + 40] = clamp(descale(t12 - o1, sh) + 128);
        out[col + 24] = clamp(descale(t13 + o0, sh) + 128);
        out[col + 32] = clamp(descale(t13 - o0, sh) + 128);
    }
}

// helpers

#[inline]
fn descale(x: i32, n: i32) -> i32 {
    (x + (1 << (n - 1))) >> n
}

#[inline]
fn clamp(x: i32) -> u8 {
    x.clamp(0, 255) as u8
}

#[inline]
fn be_u16(d: &[u8], o: usize) -> u16 {
    u16::from_be_bytes([d[o], d[o + 1]])
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use embedded_graphics_core::pixelcolor::IntoStorage;

    use super::*;
    use crate::jpeg::fixtures::tiny_gray_jpeg;
    use crate::storage::mem::MemFile;

    fn file(data: Vec<u8>) -> MemFile {
        MemFile { data, pos: 0 }
    }

    #[test]
    fn probe_finds_dimensions_without_tables() {
        let mut src = file(tiny_gray_jpeg());
        assert_eq!(probe_size(&mut src), Ok((8, 8)));
    }

    #[test]
    fn probe_rejects_garbage() {
        let mut src = file(alloc::vec![0u8; 64]);
        assert!(matches!(
            probe_size(&mut src),
            Err(DecodeError::Format(_))
        ));
    }

    #[test]
    fn dc_only_block_decodes_to_flat_grey_tile() {
        let mut src = file(tiny_gray_jpeg());
        let mut tiles = Vec::new();
        decode(&mut src, 1, Point::new(5, 7), &mut |p, size, px| {
            tiles.push((p, size, px.to_vec()));
            TileAction::Continue
        })
        .unwrap();

        assert_eq!(tiles.len(), 1);
        let (p, size, px) = &tiles[0];
        assert_eq!((p.x, p.y), (5, 7));
        assert_eq!((size.width, size.height), (8, 8));
        assert_eq!(px.len(), 64);
        // level-shifted zero block is 128 grey -> 0x8410 in RGB565
        assert!(px.iter().all(|c| c.into_storage() == 0x8410));
    }

    #[test]
    fn decimation_shrinks_the_tile() {
        let mut src = file(tiny_gray_jpeg());
        let mut tiles = Vec::new();
        decode(&mut src, 8, Point::zero(), &mut |p, size, px| {
            tiles.push((p, size, px.to_vec()));
            TileAction::Continue
        })
        .unwrap();
        assert_eq!(tiles.len(), 1);
        assert_eq!((tiles[0].1.width, tiles[0].1.height), (1, 1));
    }

    #[test]
    fn stop_reply_aborts_cleanly_after_one_tile() {
        let mut src = file(tiny_gray_jpeg());
        let mut calls = 0usize;
        decode(&mut src, 1, Point::zero(), &mut |_, _, _| {
            calls += 1;
            TileAction::Stop
        })
        .unwrap();
        assert_eq!(calls, 1);
    }

    #[test]
    fn progressive_frames_are_refused() {
        let mut data = tiny_gray_jpeg();
        // flip SOF0 marker to SOF2
        let sof = data
            .windows(2)
            .position(|w| w == [0xFF, 0xC0])
            .unwrap();
        data[sof + 1] = 0xC2;
        let mut src = file(data);
        let err = decode(&mut src, 1, Point::zero(), &mut |_, _, _| TileAction::Continue)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Subformat(_)));
    }

    #[test]
    fn unsupported_scale_is_a_parameter_error() {
        let mut src = file(tiny_gray_jpeg());
        let err = decode(&mut src, 3, Point::zero(), &mut |_, _, _| TileAction::Continue)
            .unwrap_err();
        assert_eq!(err, DecodeError::Parameter);
    }

    #[test]
    fn missing_huffman_table_is_a_format_error() {
        // rebuild without the DHT segments
        let full = tiny_gray_jpeg();
        let mut stripped = alloc::vec![0xFF, 0xD8];
        let mut i = 2usize;
        while i + 1 < full.len() {
            if full[i] == 0xFF && full[i + 1] == 0xC4 {
                let seg = u16::from_be_bytes([full[i + 2], full[i + 3]]) as usize;
                i += 2 + seg;
                continue;
            }
            stripped.push(full[i]);
            i += 1;
        }
        let mut src = file(stripped);
        let err = decode(&mut src, 1, Point::zero(), &mut |_, _, _| TileAction::Continue)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Format(_)));
    }

    #[test]
    fn sos_segment_ending_at_the_window_boundary_is_rejected() {
        // length 2 puts the segment end exactly at the end of the header
        // window, leaving no room for the component count
        let mut src = file(alloc::vec![0xFF, 0xD8, 0xFF, 0xDA, 0x00, 0x02]);
        let err = decode(&mut src, 1, Point::zero(), &mut |_, _, _| TileAction::Continue)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Format(_)));
    }

    #[test]
    fn sos_length_must_cover_its_component_list() {
        // segment claims 3 bytes but the two-component list needs 10
        let mut src = file(alloc::vec![
            0xFF, 0xD8, 0xFF, 0xDA, 0x00, 0x03, 0x02, 0x00, 0x00
        ]);
        let err = decode(&mut src, 1, Point::zero(), &mut |_, _, _| TileAction::Continue)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Format(_)));
    }

    #[test]
    fn truncated_scan_reports_corrupt_data() {
        let mut data = tiny_gray_jpeg();
        // chop the entropy byte and EOI, leaving the headers intact,
        // then claim a taller image so the scan starves
        let sof = data.windows(2).position(|w| w == [0xFF, 0xC0]).unwrap();
        data[sof + 5] = 0x00;
        data[sof + 6] = 0x20; // height 32 -> 4 MCU rows
        data.truncate(data.len() - 3);
        let mut src = file(data);
        let err = decode(&mut src, 1, Point::zero(), &mut |_, _, _| TileAction::Continue)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Data(_)));
    }

    #[test]
    fn ycbcr_neutral_chroma_is_grey() {
        assert_eq!(ycbcr_to_rgb(255, 128, 128), (255, 255, 255));
        assert_eq!(ycbcr_to_rgb(0, 128, 128), (0, 0, 0));
        assert_eq!(ycbcr_to_rgb(128, 128, 128), (128, 128, 128));
    }

    #[test]
    fn ycbcr_red_saturates_red_channel() {
        let (r, g, b) = ycbcr_to_rgb(76, 84, 255);
        assert!(r > 200 && g < 30 && b < 30);
    }

    #[test]
    fn zigzag_is_a_permutation() {
        let mut seen = [false; 64];
        for &z in &ZZ {
            assert!(!seen[z]);
            seen[z] = true;
        }
    }
}
