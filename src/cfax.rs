//! CCITT Group 4 (two-dimensional modified Huffman) compression
//!
//! Rows are coded against the previous row, the first against an all-white
//! row. A set bit is a black pixel and every row starts white. Codes are
//! packed most significant bit first; the data ends with EOFB and is padded
//! to a byte boundary.

use std::collections::HashMap;

use crate::codec::CmdSource;
use crate::error::{ClistError, Result};

/// (code, bit length) for runs 0..=63
const WHITE_TERM: [(u16, u8); 64] = [
    (0x35, 8), (0x07, 6), (0x07, 4), (0x08, 4), (0x0b, 4), (0x0c, 4), (0x0e, 4), (0x0f, 4),
    (0x13, 5), (0x14, 5), (0x07, 5), (0x08, 5), (0x08, 6), (0x03, 6), (0x34, 6), (0x35, 6),
    (0x2a, 6), (0x2b, 6), (0x27, 7), (0x0c, 7), (0x08, 7), (0x17, 7), (0x03, 7), (0x04, 7),
    (0x28, 7), (0x2b, 7), (0x13, 7), (0x24, 7), (0x18, 7), (0x02, 8), (0x03, 8), (0x1a, 8),
    (0x1b, 8), (0x12, 8), (0x13, 8), (0x14, 8), (0x15, 8), (0x16, 8), (0x17, 8), (0x28, 8),
    (0x29, 8), (0x2a, 8), (0x2b, 8), (0x2c, 8), (0x2d, 8), (0x04, 8), (0x05, 8), (0x0a, 8),
    (0x0b, 8), (0x52, 8), (0x53, 8), (0x54, 8), (0x55, 8), (0x24, 8), (0x25, 8), (0x58, 8),
    (0x59, 8), (0x5a, 8), (0x5b, 8), (0x4a, 8), (0x4b, 8), (0x32, 8), (0x33, 8), (0x34, 8),
];

/// Runs 64, 128, .. 1728
const WHITE_MAKEUP: [(u16, u8); 27] = [
    (0x1b, 5), (0x12, 5), (0x17, 6), (0x37, 7), (0x36, 8), (0x37, 8), (0x64, 8), (0x65, 8),
    (0x68, 8), (0x67, 8), (0xcc, 9), (0xcd, 9), (0xd2, 9), (0xd3, 9), (0xd4, 9), (0xd5, 9),
    (0xd6, 9), (0xd7, 9), (0xd8, 9), (0xd9, 9), (0xda, 9), (0xdb, 9), (0x98, 9), (0x99, 9),
    (0x9a, 9), (0x18, 6), (0x9b, 9),
];

const BLACK_TERM: [(u16, u8); 64] = [
    (0x37, 10), (0x02, 3), (0x03, 2), (0x02, 2), (0x03, 3), (0x03, 4), (0x02, 4), (0x03, 5),
    (0x05, 6), (0x04, 6), (0x04, 7), (0x05, 7), (0x07, 7), (0x04, 8), (0x07, 8), (0x18, 9),
    (0x17, 10), (0x18, 10), (0x08, 10), (0x67, 11), (0x68, 11), (0x6c, 11), (0x37, 11), (0x28, 11),
    (0x17, 11), (0x18, 11), (0xca, 12), (0xcb, 12), (0xcc, 12), (0xcd, 12), (0x68, 12), (0x69, 12),
    (0x6a, 12), (0x6b, 12), (0xd2, 12), (0xd3, 12), (0xd4, 12), (0xd5, 12), (0xd6, 12), (0xd7, 12),
    (0x6c, 12), (0x6d, 12), (0xda, 12), (0xdb, 12), (0x54, 12), (0x55, 12), (0x56, 12), (0x57, 12),
    (0x64, 12), (0x65, 12), (0x52, 12), (0x53, 12), (0x24, 12), (0x37, 12), (0x38, 12), (0x27, 12),
    (0x28, 12), (0x58, 12), (0x59, 12), (0x2b, 12), (0x2c, 12), (0x5a, 12), (0x66, 12), (0x67, 12),
];

const BLACK_MAKEUP: [(u16, u8); 27] = [
    (0x0f, 10), (0xc8, 12), (0xc9, 12), (0x5b, 12), (0x33, 12), (0x34, 12), (0x35, 12), (0x6c, 13),
    (0x6d, 13), (0x4a, 13), (0x4b, 13), (0x4c, 13), (0x4d, 13), (0x72, 13), (0x73, 13), (0x74, 13),
    (0x75, 13), (0x76, 13), (0x77, 13), (0x52, 13), (0x53, 13), (0x54, 13), (0x55, 13), (0x5a, 13),
    (0x5b, 13), (0x64, 13), (0x65, 13),
];

/// Runs 1792, 1856, .. 2560, shared by both colors
const EXT_MAKEUP: [(u16, u8); 13] = [
    (0x08, 11), (0x0c, 11), (0x0d, 11), (0x12, 12), (0x13, 12), (0x14, 12), (0x15, 12),
    (0x16, 12), (0x17, 12), (0x1c, 12), (0x1d, 12), (0x1e, 12), (0x1f, 12),
];

const MAX_MAKEUP: usize = 2560;

const MODE_PASS: (u16, u8) = (0x1, 4);
const MODE_HORIZONTAL: (u16, u8) = (0x1, 3);
const EOL: (u16, u8) = (0x1, 12);

/// Vertical modes, a1 - b1 = -3 ..= 3
const MODE_VERTICAL: [(u16, u8); 7] = [
    (0x02, 7), (0x02, 6), (0x02, 3), (0x1, 1), (0x03, 3), (0x03, 6), (0x03, 7),
];

#[derive(Debug,Default)]
struct BitWriter {
    out: Vec<u8>,
    acc: u32,
    nbits: u32,
}

impl BitWriter {
    fn put(&mut self, (code, len): (u16, u8)) {
        self.acc = (self.acc << len) | u32::from(code);
        self.nbits += u32::from(len);
        while self.nbits >= 8 {
            self.nbits -= 8;
            self.out.push((self.acc >> self.nbits) as u8);
        }
        self.acc &= (1 << self.nbits) - 1;
    }
    fn finish(mut self) -> Vec<u8> {
        if self.nbits > 0 {
            self.out.push((self.acc << (8 - self.nbits)) as u8);
        }
        self.out
    }
}

/// Positions where the color changes, starting from white
fn changes(row: &[u8], columns: usize) -> Vec<usize> {
    let mut out = vec![];
    let mut black = false;
    for i in 0 .. columns {
        let bit = row[i >> 3] & (0x80 >> (i & 7)) != 0;
        if bit != black {
            out.push(i);
            black = bit;
        }
    }
    out
}

/// First changing element on the reference line right of `a0` whose color
/// is opposite to `black`, and the one after it
fn b1_b2(refline: &[usize], a0: isize, black: bool, columns: usize) -> (usize, usize) {
    // Even entries change to black, odd entries back to white
    let want = if black { 1 } else { 0 };
    let mut k = 0;
    while k < refline.len() && (refline[k] as isize <= a0 || k & 1 != want) {
        k += 1;
    }
    let b1 = refline.get(k).copied().unwrap_or(columns);
    let b2 = refline.get(k + 1).copied().unwrap_or(columns);
    (b1, b2)
}

fn put_run(w: &mut BitWriter, mut run: usize, black: bool) {
    let (term, makeup) = if black { (&BLACK_TERM, &BLACK_MAKEUP) } else { (&WHITE_TERM, &WHITE_MAKEUP) };
    while run >= MAX_MAKEUP {
        w.put(EXT_MAKEUP[EXT_MAKEUP.len() - 1]);
        run -= MAX_MAKEUP;
    }
    if run >= 64 {
        let m = run / 64;
        if m <= makeup.len() {
            w.put(makeup[m - 1]);
        } else {
            w.put(EXT_MAKEUP[m - 28]);
        }
        run -= m * 64;
    }
    w.put(term[run]);
}

/// Compress `height` rows of `raster` bytes
pub fn encode(data: &[u8], raster: usize, height: usize) -> Vec<u8> {
    let columns = raster * 8;
    let mut w = BitWriter::default();
    let mut refline: Vec<usize> = vec![];
    for row in data.chunks(raster).take(height) {
        let cur = changes(row, columns);
        let mut a0: isize = -1;
        let mut black = false;
        while a0 < columns as isize {
            let a1 = cur.iter().copied().find(|&c| c as isize > a0).unwrap_or(columns);
            let a2 = cur.iter().copied().find(|&c| c > a1).unwrap_or(columns);
            let (b1, b2) = b1_b2(&refline, a0, black, columns);
            if b2 < a1 {
                w.put(MODE_PASS);
                a0 = b2 as isize;
            } else if (a1 as isize - b1 as isize).abs() <= 3 {
                w.put(MODE_VERTICAL[(a1 as isize - b1 as isize + 3) as usize]);
                a0 = a1 as isize;
                black = !black;
            } else {
                w.put(MODE_HORIZONTAL);
                put_run(&mut w, a1 - a0.max(0) as usize, black);
                put_run(&mut w, a2 - a1, !black);
                a0 = a2 as isize;
            }
        }
        refline = cur;
    }
    w.put(EOL);
    w.put(EOL);
    w.finish()
}

#[derive(Debug,Copy,Clone,PartialEq,Eq)]
enum Mode {
    Pass,
    Horizontal,
    Vertical(isize),
    Eol,
}

struct BitReader<'a, S: CmdSource> {
    src: &'a mut S,
    byte: u8,
    left: u32,
}

impl<'a, S: CmdSource> BitReader<'a, S> {
    fn bit(&mut self) -> Result<u16> {
        if self.left == 0 {
            self.byte = self.src.get_u8()?;
            self.left = 8;
        }
        self.left -= 1;
        Ok(u16::from((self.byte >> self.left) & 1))
    }
}

/// Prefix code lookup keyed by (length, code)
struct CodeTable<T> {
    codes: HashMap<(u8, u16), T>,
    max_len: u8,
}

impl<T: Copy> CodeTable<T> {
    fn new() -> Self {
        Self { codes: HashMap::new(), max_len: 0 }
    }
    fn add(&mut self, (code, len): (u16, u8), v: T) {
        self.codes.insert((len, code), v);
        self.max_len = self.max_len.max(len);
    }
    fn read<S: CmdSource>(&self, r: &mut BitReader<S>) -> Result<T> {
        let mut code = 0u16;
        for len in 1 ..= self.max_len {
            code = (code << 1) | r.bit()?;
            if let Some(v) = self.codes.get(&(len, code)) {
                return Ok(*v);
            }
        }
        Err(ClistError::malformed(format!("invalid CCITT code at offset {}", r.src.offset())))
    }
}

fn run_table(term: &[(u16, u8); 64], makeup: &[(u16, u8); 27]) -> CodeTable<usize> {
    let mut t = CodeTable::new();
    for (i, c) in term.iter().enumerate() {
        t.add(*c, i);
    }
    for (i, c) in makeup.iter().enumerate() {
        t.add(*c, (i + 1) * 64);
    }
    for (i, c) in EXT_MAKEUP.iter().enumerate() {
        t.add(*c, 1792 + i * 64);
    }
    t
}

struct Decoder {
    white: CodeTable<usize>,
    black: CodeTable<usize>,
    modes: CodeTable<Mode>,
}

impl Decoder {
    fn new() -> Self {
        let mut modes = CodeTable::new();
        modes.add(MODE_PASS, Mode::Pass);
        modes.add(MODE_HORIZONTAL, Mode::Horizontal);
        for (i, c) in MODE_VERTICAL.iter().enumerate() {
            modes.add(*c, Mode::Vertical(i as isize - 3));
        }
        modes.add(EOL, Mode::Eol);
        Self {
            white: run_table(&WHITE_TERM, &WHITE_MAKEUP),
            black: run_table(&BLACK_TERM, &BLACK_MAKEUP),
            modes,
        }
    }
    /// Makeup codes repeat until a terminating code
    fn run<S: CmdSource>(&self, r: &mut BitReader<S>, black: bool) -> Result<usize> {
        let table = if black { &self.black } else { &self.white };
        let mut total = 0;
        loop {
            let v = table.read(r)?;
            total += v;
            if v < 64 {
                return Ok(total);
            }
        }
    }
}

/// Decompress `height` rows of `raster` bytes
pub fn decode<S: CmdSource>(src: &mut S, raster: usize, height: usize) -> Result<Vec<u8>> {
    let columns = raster * 8;
    let dec = Decoder::new();
    let mut r = BitReader { src, byte: 0, left: 0 };
    let mut out = vec![0u8; raster * height];
    let mut refline: Vec<usize> = vec![];
    for row in out.chunks_mut(raster) {
        let mut cur = vec![];
        let mut a0: isize = -1;
        let mut black = false;
        while a0 < columns as isize {
            let (b1, b2) = b1_b2(&refline, a0, black, columns);
            match dec.modes.read(&mut r)? {
                Mode::Pass => a0 = b2 as isize,
                Mode::Vertical(d) => {
                    let a1 = b1 as isize + d;
                    if a1 <= a0 || a1 > columns as isize {
                        return Err(ClistError::malformed(format!("CCITT vertical mode to {} from {}", a1, a0)));
                    }
                    if a1 < columns as isize {
                        cur.push(a1 as usize);
                    }
                    a0 = a1;
                    black = !black;
                },
                Mode::Horizontal => {
                    let a1 = a0.max(0) as usize + dec.run(&mut r, black)?;
                    let a2 = a1 + dec.run(&mut r, !black)?;
                    if a2 > columns {
                        return Err(ClistError::malformed(format!("CCITT runs end at {} past {} columns", a2, columns)));
                    }
                    for &a in &[a1, a2] {
                        if a < columns {
                            cur.push(a);
                        }
                    }
                    a0 = a2 as isize;
                },
                Mode::Eol => return Err(ClistError::malformed("CCITT data ended early")),
            }
        }
        for pair in cur.chunks(2) {
            let end = pair.get(1).copied().unwrap_or(columns);
            for i in pair[0] .. end {
                row[i >> 3] |= 0x80 >> (i & 7);
            }
        }
        refline = cur;
    }
    for _ in 0 .. 2 {
        if dec.modes.read(&mut r)? != Mode::Eol {
            return Err(ClistError::malformed("CCITT data missing EOFB"));
        }
    }
    Ok(out)
}
