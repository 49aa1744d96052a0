//! Wire codec
//!
//! Encoders append to a `Vec<u8>`; decoders pull from any [`CmdSource`],
//! the in-memory [`CmdCursor`] or the reader's buffered band stream.
//! Fixed-size values are little-endian, `#` below marks a variable-length
//! unsigned integer (7 bits per byte, low group first, 0x80 continues).

use crate::error::{ClistError, Result};
use crate::device::{ColorSpace, ImageFormat, ImageHeader};
use crate::matrix::Matrix;
use crate::opcodes::{RectForm, COLOR_NONE};
use crate::state::{CmdRect, ColorIndex, NO_COLOR};
use crate::clip::IntRect;
use crate::Fixed;

/// Room the reader keeps available for any command other than a
/// length-prefixed payload
pub const CMD_LARGEST_SIZE: usize = 128;

/// Longest dash pattern carried by set_dash
pub const MAX_DASH: usize = 11;

const DELTA1_24_BIAS: u64 = 0x0008_0808;
const DELTA1_24_MASK: u64 = 0x000f_0f0f;
const DELTA2_24_BIAS: u64 = 0x0010_2010;
const DELTA2_24_MASK: u64 = 0x001f_3f1f;
const DELTA1_32_BIAS: u64 = 0x0404_0404;
const DELTA1_32_MASK: u64 = 0x0707_0707;
const DELTA2_32_BIAS: u64 = 0x0808_0808;
const DELTA2_32_MASK: u64 = 0x0f0f_0f0f;

/// Bytes used by `put_w(v)`
pub fn size_w(mut v: u32) -> usize {
    let mut n = 1;
    while v > 0x7f {
        v >>= 7;
        n += 1;
    }
    n
}

pub fn put_w(mut v: u32, out: &mut Vec<u8>) {
    while v > 0x7f {
        out.push((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

/// Signed values travel as their 32-bit pattern
pub fn put_iw(v: i32, out: &mut Vec<u8>) {
    put_w(v as u32, out)
}

pub fn put_f32(v: f32, out: &mut Vec<u8>) {
    out.extend_from_slice(&v.to_bits().to_le_bytes());
}
pub fn put_i32(v: i32, out: &mut Vec<u8>) {
    out.extend_from_slice(&v.to_le_bytes());
}
pub fn put_u16(v: u16, out: &mut Vec<u8>) {
    out.extend_from_slice(&v.to_le_bytes());
}
pub fn put_u32(v: u32, out: &mut Vec<u8>) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Byte source for command decoding
pub trait CmdSource {
    fn get_u8(&mut self) -> Result<u8>;
    /// Fill `buf` completely or fail with `TruncatedInput`
    fn get_into(&mut self, buf: &mut [u8]) -> Result<()>;
    /// Position of the next byte in the stream
    fn offset(&self) -> usize;

    fn get_w(&mut self) -> Result<u32> {
        let mut v = 0u32;
        let mut shift = 0;
        loop {
            let b = self.get_u8()?;
            if shift > 28 {
                return Err(ClistError::malformed("variable-length integer longer than 5 bytes"));
            }
            v |= u32::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
        }
    }
    fn get_iw(&mut self) -> Result<i32> {
        Ok(self.get_w()? as i32)
    }
    fn get_f32(&mut self) -> Result<f32> {
        let mut b = [0u8; 4];
        self.get_into(&mut b)?;
        Ok(f32::from_bits(u32::from_le_bytes(b)))
    }
    fn get_i32(&mut self) -> Result<i32> {
        let mut b = [0u8; 4];
        self.get_into(&mut b)?;
        Ok(i32::from_le_bytes(b))
    }
    fn get_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.get_into(&mut b)?;
        Ok(u16::from_le_bytes(b))
    }
    fn get_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.get_into(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }
    fn get_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut v = vec![0u8; n];
        self.get_into(&mut v)?;
        Ok(v)
    }
}

/// Decoder over a byte slice; never reads past its end
#[derive(Debug)]
pub struct CmdCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> CmdCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

impl<'a> CmdSource for CmdCursor<'a> {
    fn get_u8(&mut self) -> Result<u8> {
        let b = *self.data.get(self.pos)
            .ok_or(ClistError::TruncatedInput { offset: self.pos, needed: 1 })?;
        self.pos += 1;
        Ok(b)
    }
    fn get_into(&mut self, buf: &mut [u8]) -> Result<()> {
        let n = buf.len();
        if n > self.remaining() {
            return Err(ClistError::TruncatedInput { offset: self.pos, needed: n - self.remaining() });
        }
        buf.copy_from_slice(&self.data[self.pos .. self.pos + n]);
        self.pos += n;
        Ok(())
    }
    fn offset(&self) -> usize {
        self.pos
    }
}

// ---- rectangles

fn in_range(v: i32, min: i32, max: i32) -> bool {
    v >= min && v <= max
}

/// Append a rectangle command relative to `prev`
///
/// `op` is the family base, `FILL_RECT` or `TILE_RECT`; the short and tiny
/// families sit 0x10 and 0x20 above it.
pub fn put_rect(op: u8, rect: &CmdRect, prev: &CmdRect, out: &mut Vec<u8>) {
    let dx = rect.x.wrapping_sub(prev.x);
    let dy = rect.y.wrapping_sub(prev.y);
    let dw = rect.width.wrapping_sub(prev.width);
    let dh = rect.height.wrapping_sub(prev.height);
    let tiny = dh == 0 && in_range(dw, -4, 3);
    if tiny && dx == prev.width && dy == 0 {
        // Continues the previous rectangle
        out.push(op + 0x28 + (dw + 4) as u8);
    } else if tiny && in_range(dx, -8, 7) && in_range(dy, -8, 7) {
        out.push(op + 0x20 + (dw + 4) as u8);
        out.push((((dx + 8) << 4) + (dy + 8)) as u8);
    } else if [dx, dy, dw, dh].iter().all(|&d| in_range(d, -128, 127)) {
        if in_range(dh + 8, 1, 15) && dy == 0 {
            out.push(op + 0x10 + (dh + 8) as u8);
            out.push((dx + 128) as u8);
            out.push((dw + 128) as u8);
        } else {
            out.push(op + 0x10);
            out.push((dx + 128) as u8);
            out.push((dw + 128) as u8);
            out.push((dy + 128) as u8);
            out.push((dh + 128) as u8);
        }
    } else if in_range(dy, -2, 1) && in_range(dh, -2, 1) && dy + dh != -4 {
        out.push(op + (((dy + 2) << 2) + dh + 2) as u8);
        put_iw(rect.x, out);
        put_iw(rect.width, out);
    } else {
        out.push(op);
        put_iw(rect.x, out);
        put_iw(rect.y, out);
        put_iw(rect.width, out);
        put_iw(rect.height, out);
    }
}

fn add_delta(v: i32, d: i32) -> Result<i32> {
    v.checked_add(d).ok_or_else(|| ClistError::malformed(format!("rectangle delta {} from {} overflows", d, v)))
}

/// Rectangle operands of a fill/tile rectangle opcode with low nibble `n`
pub fn get_rect<S: CmdSource>(src: &mut S, form: RectForm, n: u8, prev: &CmdRect) -> Result<CmdRect> {
    let mut r = *prev;
    let n = i32::from(n);
    match form {
        RectForm::Full => {
            r.x = src.get_iw()?;
            if n == 0 {
                r.y = src.get_iw()?;
                r.width = src.get_iw()?;
                r.height = src.get_iw()?;
            } else {
                r.y = add_delta(r.y, ((n >> 2) & 3) - 2)?;
                r.width = src.get_iw()?;
                r.height = add_delta(r.height, (n & 3) - 2)?;
            }
        },
        RectForm::Short => {
            r.x = add_delta(r.x, i32::from(src.get_u8()?) - 128)?;
            r.width = add_delta(r.width, i32::from(src.get_u8()?) - 128)?;
            if n != 0 {
                r.height = add_delta(r.height, n - 8)?;
            } else {
                r.y = add_delta(r.y, i32::from(src.get_u8()?) - 128)?;
                r.height = add_delta(r.height, i32::from(src.get_u8()?) - 128)?;
            }
        },
        RectForm::Tiny => {
            if n & 8 != 0 {
                r.x = add_delta(r.x, prev.width)?;
            } else {
                let b = i32::from(src.get_u8()?);
                r.x = add_delta(r.x, (b >> 4) - 8)?;
                r.y = add_delta(r.y, (b & 15) - 8)?;
            }
            r.width = add_delta(r.width, (n & 7) - 4)?;
        },
    }
    Ok(r)
}

// ---- colors

/// Append the cheapest command changing a color slot from `prev` to `color`
///
/// `op` is the set_color0/1 base and `delta2_op` the matching delta2
/// opcode. Nothing is written when the color is unchanged.
pub fn put_color(op: u8, delta2_op: u8, color: ColorIndex, prev: ColorIndex, depth: u8, out: &mut Vec<u8>) {
    if color == prev {
        return;
    }
    if color == NO_COLOR {
        out.push(op + COLOR_NONE);
        return;
    }
    let diff = color.wrapping_sub(prev);
    match (u32::from(depth) + 15) >> 3 {
        5 => {
            let delta = diff.wrapping_add(DELTA1_32_BIAS);
            if delta & !DELTA1_32_MASK == 0 {
                let operand = ((delta >> 23) + ((delta >> 18) & 1)) as u8;
                if operand != 0 && operand != 15 {
                    out.push(op + operand);
                    out.push((((delta >> 10) & 0o300) + (delta >> 5) + delta) as u8);
                    return;
                }
            }
            let delta = diff.wrapping_add(DELTA2_32_BIAS);
            if delta & !DELTA2_32_MASK == 0 {
                out.push(delta2_op);
                out.push(((delta >> 20) + (delta >> 16)) as u8);
                out.push(((delta >> 4) + delta) as u8);
                return;
            }
            out.push(op);
            out.extend_from_slice(&(color as u32).to_be_bytes());
        },
        4 => {
            let delta = diff.wrapping_add(DELTA1_24_BIAS);
            if delta & !DELTA1_24_MASK == 0 {
                let operand = (delta >> 16) as u8;
                if operand != 0 && operand != 15 {
                    out.push(op + operand);
                    out.push(((delta >> 4) + delta) as u8);
                    return;
                }
            }
            let delta = diff.wrapping_add(DELTA2_24_BIAS);
            if delta & !DELTA2_24_MASK == 0 {
                out.push(delta2_op);
                out.push((((delta >> 13) as u8) & 0xf8) + (((delta >> 11) as u8) & 7));
                out.push((((delta >> 3) & 0xe0) + delta) as u8);
                return;
            }
            out.push(op);
            out.extend_from_slice(&(color as u32).to_be_bytes()[1..]);
        },
        3 => {
            out.push(op);
            out.extend_from_slice(&(color as u16).to_be_bytes());
        },
        _ => {
            let d = diff as i64;
            if d >= -7 && d < 7 {
                out.push(op + (d + 8) as u8);
            } else {
                out.push(op);
                out.push(color as u8);
            }
        },
    }
}

fn get_absolute_color<S: CmdSource>(src: &mut S, depth: u8) -> Result<ColorIndex> {
    let mut color = 0u64;
    for _ in 0 .. (depth as usize + 7) >> 3 {
        color = (color << 8) | u64::from(src.get_u8()?);
    }
    Ok(color)
}

/// Operands of set_color0/1 with low nibble `n`
pub fn get_color<S: CmdSource>(src: &mut S, n: u8, prev: ColorIndex, depth: u8) -> Result<ColorIndex> {
    if n == COLOR_NONE {
        return Ok(NO_COLOR);
    }
    if n == 0 {
        return get_absolute_color(src, depth);
    }
    let n = u64::from(n);
    let color = match (depth as usize + 7) >> 3 {
        4 => {
            let b = (n << 8) + u64::from(src.get_u8()?);
            prev.wrapping_add(((b & 0o7000) << 15) + ((b & 0o700) << 10) + ((b & 0o70) << 5) + (b & 7))
                .wrapping_sub(DELTA1_32_BIAS)
        },
        3 => {
            let b = u64::from(src.get_u8()?);
            prev.wrapping_add((n << 16) + ((b & 0xf0) << 4) + (b & 0x0f))
                .wrapping_sub(DELTA1_24_BIAS)
        },
        2 => get_absolute_color(src, depth)?,
        _ => prev.wrapping_add(n).wrapping_sub(8),
    };
    Ok(color)
}

/// Operands of delta2_color0/1
pub fn get_delta2_color<S: CmdSource>(src: &mut S, prev: ColorIndex, depth: u8) -> Result<ColorIndex> {
    let b = (u64::from(src.get_u8()?) << 8) + u64::from(src.get_u8()?);
    let color = if depth > 24 {
        prev.wrapping_add(((b & 0xf000) << 12) + ((b & 0x0f00) << 8) + ((b & 0x00f0) << 4) + (b & 0x000f))
            .wrapping_sub(DELTA2_32_BIAS)
    } else {
        prev.wrapping_add(((b & 0xf800) << 5) + ((b & 0x07e0) << 3) + (b & 0x001f))
            .wrapping_sub(DELTA2_24_BIAS)
    };
    Ok(color)
}

// ---- matrices

pub fn put_matrix(m: &Matrix, out: &mut Vec<u8>) {
    let c = m.coeffs();
    let at = out.len();
    out.push(0);
    let mut b = 0u8;
    for &i in &[0usize, 2] {
        let (u, v) = (c[i], c[i ^ 3]);
        b <<= 2;
        if u != 0.0 || v != 0.0 {
            put_f32(u, out);
            if v == u {
                b += 1;
            } else if v == -u {
                b += 2;
            } else {
                b += 3;
                put_f32(v, out);
            }
        }
    }
    for &v in &c[4..] {
        b <<= 1;
        if v != 0.0 {
            b += 1;
            put_f32(v, out);
        }
    }
    out[at] = b << 2;
}

pub fn get_matrix<S: CmdSource>(src: &mut S) -> Result<Matrix> {
    let mut b = src.get_u8()?;
    let mut c = [0f32; 6];
    for &i in &[0usize, 2] {
        if b & 0xc0 != 0 {
            let u = src.get_f32()?;
            c[i] = u;
            c[i ^ 3] = match (b >> 6) & 3 {
                1 => u,
                2 => -u,
                _ => src.get_f32()?,
            };
        }
        b <<= 2;
    }
    for v in c[4..].iter_mut() {
        if b & 0x80 != 0 {
            *v = src.get_f32()?;
        }
        b <<= 1;
    }
    Ok(Matrix::from_coeffs(c))
}

// ---- path segment operands

fn is_bits(d: Fixed, n: u32) -> bool {
    let lim = 1i64 << (n - 1);
    let d = i64::from(d);
    d >= -lim && d < lim
}

/// Append fixed-point segment operands in their shortest forms
pub fn put_segment_operands(ops: &[Fixed], out: &mut Vec<u8>) {
    let mut i = 0;
    while i < ops.len() {
        let d = ops[i];
        if is_bits(d, 19) && d & 63 == 0 {
            // quarter-pixel multiple
            let v = ((d >> 6) & 0x1fff) + 0xc000;
            out.push((v >> 8) as u8);
            out.push(v as u8);
        } else if is_bits(d, 19) && i + 1 < ops.len() && is_bits(ops[i + 1], 19) {
            let d2 = ops[i + 1];
            out.push(((d >> 13) & 0x3f) as u8);
            out.push((d >> 5) as u8);
            out.push(((d << 3) + ((d2 >> 16) & 7)) as u8);
            out.push((d2 >> 8) as u8);
            out.push(d2 as u8);
            i += 2;
            continue;
        } else if is_bits(d, 22) {
            out.push((((d >> 16) & 0x3f) + 0x40) as u8);
            out.push((d >> 8) as u8);
            out.push(d as u8);
        } else if is_bits(d, 30) {
            out.push((((d >> 24) & 0x3f) + 0x80) as u8);
            out.push((d >> 16) as u8);
            out.push((d >> 8) as u8);
            out.push(d as u8);
        } else {
            out.push(0xe0);
            out.extend_from_slice(&d.to_be_bytes());
        }
        i += 1;
    }
}

/// Read `n` segment operands
pub fn get_segment_operands<S: CmdSource>(src: &mut S, n: usize) -> Result<[Fixed; 6]> {
    let mut vs = [0 as Fixed; 6];
    let mut i = 0;
    while i < n {
        let b = i32::from(src.get_u8()?);
        match b >> 5 {
            0 | 1 => {
                if i + 1 >= n {
                    return Err(ClistError::malformed("operand pair in the last operand slot"));
                }
                let b1 = i32::from(src.get_u8()?);
                let b2 = i32::from(src.get_u8()?);
                let b3 = i32::from(src.get_u8()?);
                let b4 = i32::from(src.get_u8()?);
                vs[i] = (((b ^ 0x20) - 0x20) << 13) + (b1 << 5) + (b2 >> 3);
                let v = ((b2 & 7) ^ 4) - 4;
                vs[i + 1] = (v << 16) + (b3 << 8) + b4;
                i += 2;
                continue;
            },
            2 | 3 => {
                let v = (b ^ 0x60) - 0x20;
                let b1 = i32::from(src.get_u8()?);
                let b2 = i32::from(src.get_u8()?);
                vs[i] = (v << 16) + (b1 << 8) + b2;
            },
            4 | 5 => {
                let v = (((b ^ 0xa0) - 0x20) << 8) + i32::from(src.get_u8()?);
                let b2 = i32::from(src.get_u8()?);
                let b3 = i32::from(src.get_u8()?);
                vs[i] = (v << 16) + (b2 << 8) + b3;
            },
            6 => {
                let v = (b ^ 0xd0) - 0x10;
                let b1 = i32::from(src.get_u8()?);
                vs[i] = ((v << 8) + b1) << 6;
            },
            _ => {
                let mut q = [0u8; 4];
                src.get_into(&mut q)?;
                vs[i] = i32::from_be_bytes(q);
            },
        }
        i += 1;
    }
    Ok(vs)
}

// ---- image headers

const IMAGE_BPC: [u8; 6] = [1, 1, 2, 4, 8, 12];

fn default_decode(h: &ImageHeader, cs: &ColorSpace) -> Vec<f32> {
    let ncomp = h.num_components(cs);
    if !h.mask && cs.indexed.is_some() {
        return vec![0.0, ((1u32 << h.bits_per_component) - 1) as f32];
    }
    [0.0, 1.0].iter().cycle().take(ncomp * 2).copied().collect()
}

/// Append the begin_image operands
pub fn put_image_header(h: &ImageHeader, cs: &ColorSpace, out: &mut Vec<u8>) -> Result<()> {
    let bpci = if h.mask {
        0
    } else {
        match h.bits_per_component {
            1 => 1, 2 => 2, 4 => 3, 8 => 4, 12 => 5,
            b => return Err(ClistError::malformed(format!("{} bits per component", b))),
        }
    };
    let at = out.len();
    out.push(0);
    let mut b: u8 = bpci << 5;
    if h.format != ImageFormat::Chunky || h.interpolate || h.alpha != 0 {
        b |= 0x10;
        out.push((h.format.code() << 6) | if h.interpolate { 0x20 } else { 0 } | ((h.alpha & 3) << 3));
    }
    put_w(h.width, out);
    put_w(h.height, out);
    if h.matrix != ImageHeader::default_matrix(h.width, h.height) {
        b |= 0x08;
        put_matrix(&h.matrix, out);
    }
    if let Some(decode) = &h.decode {
        let dflt = default_decode(h, cs);
        if decode.len() != dflt.len() {
            return Err(ClistError::malformed(format!("decode array of {} values, {} expected",
                                                     decode.len(), dflt.len())));
        }
        if *decode != dflt {
            b |= 0x04;
            let flags_at = out.len();
            out.push(0);
            let mut flags = 0u8;
            for (d, def) in decode.chunks(2).zip(dflt.chunks(2)) {
                let (u, v) = (d[0], d[1]);
                flags <<= 2;
                if u == 0.0 && v == def[1] {
                } else if u == def[1] && v == 0.0 {
                    flags += 1;
                } else {
                    if u != 0.0 {
                        flags += 1;
                        put_f32(u, out);
                    }
                    flags += 2;
                    put_f32(v, out);
                }
            }
            // first component in the top bits
            flags <<= 2 * (4 - dflt.len() / 2);
            out[flags_at] = flags;
        }
    }
    if h.adjust {
        b |= 0x02;
    }
    if let Some(r) = h.rect {
        b |= 0x01;
        put_iw(r.x1, out);
        put_iw(r.y1, out);
        put_iw(h.width as i32 - r.x2, out);
        put_iw(h.height as i32 - r.y2, out);
    }
    out[at] = b;
    Ok(())
}

pub fn get_image_header<S: CmdSource>(src: &mut S, cs: &ColorSpace) -> Result<ImageHeader> {
    let b = src.get_u8()?;
    let bpci = (b >> 5) as usize;
    if bpci >= IMAGE_BPC.len() {
        return Err(ClistError::malformed(format!("image bits per component index {}", bpci)));
    }
    let mut h = ImageHeader::new(0, 0, IMAGE_BPC[bpci]);
    h.mask = bpci == 0;
    if b & 0x10 != 0 {
        let b2 = src.get_u8()?;
        h.format = ImageFormat::from_code(b2 >> 6)?;
        h.interpolate = b2 & 0x20 != 0;
        h.alpha = (b2 >> 3) & 3;
    }
    h.width = src.get_w()?;
    h.height = src.get_w()?;
    h.matrix = if b & 0x08 != 0 {
        get_matrix(src)?
    } else {
        ImageHeader::default_matrix(h.width, h.height)
    };
    if b & 0x04 != 0 {
        let mut decode = default_decode(&h, cs);
        let mut flags = src.get_u8()?;
        for i in (0 .. decode.len()).step_by(2) {
            match (flags >> 6) & 3 {
                0 => {},
                1 => {
                    decode[i] = decode[i + 1];
                    decode[i + 1] = 0.0;
                },
                3 => {
                    decode[i] = src.get_f32()?;
                    decode[i + 1] = src.get_f32()?;
                },
                _ => decode[i + 1] = src.get_f32()?,
            }
            flags <<= 2;
        }
        h.decode = Some(decode);
    }
    h.adjust = b & 0x02 != 0;
    if b & 0x01 != 0 {
        let x1 = src.get_iw()?;
        let y1 = src.get_iw()?;
        let x2 = h.width as i32 - src.get_iw()?;
        let y2 = h.height as i32 - src.get_iw()?;
        h.rect = Some(IntRect::new(x1, y1, x2, y2));
    }
    Ok(h)
}
