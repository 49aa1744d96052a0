//! Bitmap payloads
//!
//! Bitmaps travel row by row at their short raster, the bytes a row needs
//! with no padding. A payload is compressed when that pays off and the
//! reader can still hold the decompressed rows.

use crate::codec::CmdSource;
use crate::config::{Compression, CompressionMask};
use crate::error::{ClistError, Result};
use crate::{cfax, rle};

/// Smallest payload worth compressing
pub const MIN_COMPRESS_SIZE: usize = 50;

/// Bytes for a row of `width_bits` bits
pub fn short_raster(width_bits: usize) -> usize {
    (width_bits + 7) >> 3
}

fn get_bit(data: &[u8], i: usize) -> bool {
    data[i >> 3] & (0x80 >> (i & 7)) != 0
}

fn put_bit(data: &mut [u8], i: usize, on: bool) {
    let m = 0x80 >> (i & 7);
    if on {
        data[i >> 3] |= m;
    } else {
        data[i >> 3] &= !m;
    }
}

/// Copy `n` bits from `src` starting at bit `src_bit` into `dst` at `dst_bit`
pub fn copy_bits(src: &[u8], src_bit: usize, dst: &mut [u8], dst_bit: usize, n: usize) {
    if src_bit & 7 == 0 && dst_bit & 7 == 0 && n & 7 == 0 {
        let (s, d) = (src_bit >> 3, dst_bit >> 3);
        dst[d .. d + (n >> 3)].copy_from_slice(&src[s .. s + (n >> 3)]);
        return;
    }
    for i in 0 .. n {
        put_bit(dst, dst_bit + i, get_bit(src, src_bit + i));
    }
}

/// Rows of `bit_width` bits starting `bit_x` bits into each source row,
/// repacked at their short raster
pub fn extract_bits(data: &[u8], raster: usize, bit_x: usize, bit_width: usize, rows: usize) -> Result<Vec<u8>> {
    let sraster = short_raster(bit_width);
    if rows > 0 && data.len() < (rows - 1) * raster + short_raster(bit_x + bit_width) {
        return Err(ClistError::malformed(format!("bitmap of {} bytes too short for {} rows of raster {}",
                                                 data.len(), rows, raster)));
    }
    let mut out = vec![0u8; sraster * rows];
    for y in 0 .. rows {
        copy_bits(&data[y * raster ..], bit_x, &mut out[y * sraster ..], 0, bit_width);
    }
    Ok(out)
}

/// Bitmap ready to follow a command
#[derive(Debug,Clone,PartialEq)]
pub struct BitsPayload {
    pub compression: Compression,
    pub data: Vec<u8>,
    /// Uncompressed size in bytes
    pub short_size: usize,
}

/// Pick the encoding for `height` rows of `raster` bytes
///
/// With `DECOMPRESS_ELSEWHERE` the decompressed rows do not have to fit the
/// reader buffer, only the compressed bytes do.
pub fn choose_bits(rows: &[u8], raster: usize, height: usize, mask: CompressionMask, cbuf_size: usize) -> Result<BitsPayload> {
    let short_size = raster * height;
    let elsewhere = mask.contains(CompressionMask::DECOMPRESS_ELSEWHERE);
    if short_size >= MIN_COMPRESS_SIZE && raster > 0 && mask.any_method()
        && (short_size <= cbuf_size || elsewhere)
    {
        let (compression, data) = if mask.allows(Compression::Ccitt) {
            (Compression::Ccitt, cfax::encode(rows, raster, height))
        } else {
            (Compression::Rle, rle::encode(&rows[.. short_size]))
        };
        if data.len() <= short_size / 2 && data.len() <= cbuf_size {
            return Ok(BitsPayload { compression, data, short_size });
        }
    }
    if short_size > cbuf_size {
        return Err(ClistError::BitmapTooLarge { size: short_size, limit: cbuf_size });
    }
    Ok(BitsPayload { compression: Compression::None, data: rows[.. short_size].to_vec(), short_size })
}

/// Read a payload of `height` rows of `raster` bytes
pub fn read_bits<S: CmdSource>(src: &mut S, compression: Compression, raster: usize, height: usize) -> Result<Vec<u8>> {
    match compression {
        Compression::None => src.get_vec(raster * height),
        Compression::Rle => rle::decode(src, raster * height),
        Compression::Ccitt => {
            if raster == 0 {
                return Ok(vec![]);
            }
            cfax::decode(src, raster, height)
        },
    }
}

/// Replicate a `width_bits` x `height` pattern `x_reps` times across and
/// `y_reps` times down
pub fn replicate(rows: &[u8], width_bits: usize, height: usize, x_reps: usize, y_reps: usize) -> Vec<u8> {
    let sraster = short_raster(width_bits);
    let out_raster = short_raster(width_bits * x_reps);
    let mut out = vec![0u8; out_raster * height * y_reps];
    for y in 0 .. height {
        let src = &rows[y * sraster ..];
        for ry in 0 .. y_reps {
            let dst = &mut out[(ry * height + y) * out_raster ..];
            for rx in 0 .. x_reps {
                copy_bits(src, 0, dst, rx * width_bits, width_bits);
            }
        }
    }
    out
}
