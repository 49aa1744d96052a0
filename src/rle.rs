//! RunLength compression
//!
//! Length byte n: 0..=127 copies the next n + 1 bytes, 129..=255 repeats the
//! next byte 257 - n times, 128 ends the data. Payloads are written without
//! the end marker; the decoder stops once the output is full.

use crate::codec::CmdSource;
use crate::error::{ClistError, Result};

const MAX_RUN: usize = 128;

pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 64 + 1);
    let mut i = 0;
    let n = data.len();
    while i < n {
        // Length of the repeat starting at i
        let mut j = i + 1;
        while j < n && j - i < MAX_RUN && data[j] == data[i] {
            j += 1;
        }
        if j - i >= 2 {
            out.push((257 - (j - i)) as u8);
            out.push(data[i]);
            i = j;
            continue;
        }
        // Literal until the next pair of equal bytes
        let start = i;
        while i < n && i - start < MAX_RUN {
            if i + 1 < n && data[i] == data[i + 1] {
                break;
            }
            i += 1;
        }
        out.push((i - start - 1) as u8);
        out.extend_from_slice(&data[start .. i]);
    }
    out
}

/// Decode exactly `size` bytes
pub fn decode<S: CmdSource>(src: &mut S, size: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(size);
    while out.len() < size {
        let n = src.get_u8()? as usize;
        let left = size - out.len();
        match n {
            0 ..= 127 => {
                if n + 1 > left {
                    return Err(ClistError::malformed(format!("run-length literal of {} overruns by {}", n + 1, n + 1 - left)));
                }
                let at = out.len();
                out.resize(at + n + 1, 0);
                src.get_into(&mut out[at..])?;
            },
            128 => return Err(ClistError::malformed(format!("run-length data ended {} bytes short", left))),
            _ => {
                let count = 257 - n;
                if count > left {
                    return Err(ClistError::malformed(format!("run-length repeat of {} overruns by {}", count, count - left)));
                }
                let b = src.get_u8()?;
                out.resize(out.len() + count, b);
            },
        }
    }
    Ok(out)
}
