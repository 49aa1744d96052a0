//! Raster target device

use std::ops::Index;
use std::ops::IndexMut;
use std::path::Path as FsPath;

use tracing::debug;

use crate::clip::{ClipList, IntRect};
use crate::device::{Bitmap, DrawingColor, FillRule, TargetDevice};
use crate::error::{ClistError, Result};
use crate::path::{FixedPoint, Path, Segment};
use crate::state::{ColorIndex, ImagerState, NO_COLOR};
use crate::tile_cache::TileBitmap;
use crate::{fixed2float, ppm};

/// Line pieces a curve is flattened into
const CURVE_STEPS: usize = 16;

/// Byte raster of a whole page
///
/// Data is stored as row-major order, `bpp` bytes per pixel holding the
/// color index most significant byte first.
#[derive(Debug,Default)]
pub struct RasterDevice {
    /// Pixel data of the page
    pub data: Vec<u8>,
    /// Page width in pixels
    pub width: usize,
    /// Page height in pixels
    pub height: usize,
    /// Bytes per pixel
    pub bpp: usize,
    /// Color depth in bits
    pub depth: u8,
    clip_box: IntRect,
}

impl RasterDevice {
    /// Create a raster of width, height and color depth, filled with color 0
    pub fn new(width: usize, height: usize, depth: u8) -> Self {
        let bpp = ((depth as usize + 7) / 8).max(1);
        RasterDevice {
            width, height, bpp, depth,
            data: vec![0u8; width * height * bpp],
            clip_box: IntRect::new(0, 0, width as i32, height as i32),
        }
    }
    /// Size of the underlying data
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    /// Set every pixel to `color`
    pub fn clear(&mut self, color: ColorIndex) {
        for y in 0 .. self.height {
            for x in 0 .. self.width {
                self.put(x, y, color);
            }
        }
    }
    /// Color index at (x, y)
    pub fn pixel(&self, x: usize, y: usize) -> ColorIndex {
        self[(x, y)][.. self.bpp].iter().fold(0, |v, &b| (v << 8) | ColorIndex::from(b))
    }
    fn put(&mut self, x: usize, y: usize, color: ColorIndex) {
        let bpp = self.bpp;
        let px = &mut self[(x, y)][.. bpp];
        for (i, b) in px.iter_mut().enumerate() {
            *b = (color >> ((bpp - 1 - i) * 8)) as u8;
        }
    }
    /// Page area within the clipping box
    fn visible(&self, rect: &IntRect) -> Option<IntRect> {
        let page = IntRect::new(0, 0, self.width as i32, self.height as i32);
        rect.intersect(&page)?.intersect(&self.clip_box)
    }
    fn paint<F: FnMut(i32, i32) -> ColorIndex>(&mut self, rect: IntRect, mut color_at: F) {
        let r = match self.visible(&rect) {
            Some(r) => r,
            None => return,
        };
        for y in r.y1 .. r.y2 {
            for x in r.x1 .. r.x2 {
                let c = color_at(x, y);
                if c != NO_COLOR {
                    self.put(x as usize, y as usize, c);
                }
            }
        }
    }
    fn span(&mut self, y: i32, x1: i32, x2: i32, color: ColorIndex, clip: Option<&ClipList>) {
        let row = IntRect::new(x1, y, x2, y + 1);
        let pieces = match clip {
            Some(c) => c.intersections(&row),
            None => vec![row],
        };
        for p in pieces {
            self.paint(p, |_, _| color);
        }
    }
    /// Page as 8 bit RGB
    pub fn to_rgb(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.width * self.height * 3);
        let max = if self.depth >= 8 { 255 } else { (1u64 << self.depth) - 1 };
        for y in 0 .. self.height {
            for x in 0 .. self.width {
                let v = self.pixel(x, y);
                match self.bpp {
                    1 => {
                        let g = (v * 255 / max.max(1)) as u8;
                        out.extend_from_slice(&[g, g, g]);
                    },
                    2 => {
                        // 5-6-5
                        let r = ((v >> 11) & 0x1f) * 255 / 31;
                        let g = ((v >> 5) & 0x3f) * 255 / 63;
                        let b = (v & 0x1f) * 255 / 31;
                        out.extend_from_slice(&[r as u8, g as u8, b as u8]);
                    },
                    _ => {
                        let px = &self[(x, y)][self.bpp - 3 .. self.bpp];
                        out.extend_from_slice(px);
                    },
                }
            }
        }
        out
    }
    /// Write the page as a PNG file
    pub fn write_png<P: AsRef<FsPath>>(&self, filename: P) -> Result<()> {
        debug!(width = self.width, height = self.height, file = %filename.as_ref().display(), "write png");
        ppm::write_file(&self.to_rgb(), self.width, self.height, filename)
    }
}

impl Index<(usize,usize)> for RasterDevice {
    type Output = [u8];
    fn index(&self, index: (usize, usize)) -> &[u8] {
        assert!(index.0 < self.width, "request {} >= {} width :: index", index.0, self.width);
        assert!(index.1 < self.height, "request {} >= {} height :: index", index.1, self.height);
        let i = ((index.1 * self.width) + index.0) * self.bpp;
        &self.data[i..]
    }
}
impl IndexMut<(usize,usize)> for RasterDevice {
    fn index_mut(&mut self, index: (usize, usize)) -> &mut [u8] {
        assert!(index.0 < self.width, "request {} >= {} width :: index_mut", index.0, self.width);
        assert!(index.1 < self.height, "request {} >= {} height :: index_mut", index.1, self.height);
        let i = ((index.1 * self.width) + index.0) * self.bpp;
        &mut self.data[i..]
    }
}

/// `depth` bits at pixel `x` of a bitmap row
fn bits_at(bits: &Bitmap, row: usize, x: usize, depth: usize) -> ColorIndex {
    let line = &bits.data[row * bits.raster ..];
    let start = (bits.data_x + x) * depth;
    let mut v = 0;
    for i in 0 .. depth {
        let b = start + i;
        v = (v << 1) | ColorIndex::from(line[b >> 3] >> (7 - (b & 7)) & 1);
    }
    v
}

/// Bitmap data must hold every row of `rect`
fn check_rows(bits: &Bitmap, rect: &IntRect, depth: usize) -> Result<()> {
    let rows = rect.height().max(0) as usize;
    let need_bits = (bits.data_x + rect.width().max(0) as usize) * depth;
    if rows > 0 && (bits.data.len() < (rows - 1) * bits.raster + (need_bits + 7) / 8) {
        return Err(ClistError::device(format!("bitmap of {} bytes too short for {}x{}",
                                              bits.data.len(), rect.width(), rect.height())));
    }
    Ok(())
}

fn flatten(path: &Path) -> Vec<Vec<(f64, f64)>> {
    let pt = |p: &FixedPoint| (fixed2float(p.x), fixed2float(p.y));
    let mut polys = vec![];
    let mut cur: Vec<(f64, f64)> = vec![];
    for s in &path.segments {
        match s {
            Segment::MoveTo(p) => {
                if cur.len() > 1 {
                    polys.push(std::mem::replace(&mut cur, vec![]));
                }
                cur = vec![pt(p)];
            },
            Segment::LineTo(p, _) => cur.push(pt(p)),
            Segment::CurveTo(c1, c2, end, _) => {
                let p0 = cur.last().copied().unwrap_or((0.0, 0.0));
                let (p1, p2, p3) = (pt(c1), pt(c2), pt(end));
                for i in 1 ..= CURVE_STEPS {
                    let t = i as f64 / CURVE_STEPS as f64;
                    let u = 1.0 - t;
                    let (a, b, c, d) = (u * u * u, 3.0 * u * u * t, 3.0 * u * t * t, t * t * t);
                    cur.push((a * p0.0 + b * p1.0 + c * p2.0 + d * p3.0,
                              a * p0.1 + b * p1.1 + c * p2.1 + d * p3.1));
                }
            },
            Segment::Close => {
                if let Some(&first) = cur.first() {
                    polys.push(std::mem::replace(&mut cur, vec![first]));
                }
            },
        }
    }
    if cur.len() > 1 {
        polys.push(cur);
    }
    polys
}

impl TargetDevice for RasterDevice {
    fn fill_rectangle(&mut self, rect: IntRect, color: ColorIndex) -> Result<()> {
        self.paint(rect, |_, _| color);
        Ok(())
    }
    fn get_clipping_box(&self) -> IntRect {
        self.clip_box
    }
    fn begin_band(&mut self, _band: usize, area: IntRect) -> Result<()> {
        self.clip_box = area;
        Ok(())
    }
    fn copy_mono(&mut self, bits: Bitmap, rect: IntRect, color0: ColorIndex, color1: ColorIndex) -> Result<()> {
        check_rows(&bits, &rect, 1)?;
        self.paint(rect, |x, y| {
            let v = bits_at(&bits, (y - rect.y1) as usize, (x - rect.x1) as usize, 1);
            if v != 0 { color1 } else { color0 }
        });
        Ok(())
    }
    fn copy_color(&mut self, bits: Bitmap, rect: IntRect) -> Result<()> {
        let depth = self.depth as usize;
        check_rows(&bits, &rect, depth)?;
        self.paint(rect, |x, y| bits_at(&bits, (y - rect.y1) as usize, (x - rect.x1) as usize, depth));
        Ok(())
    }
    fn copy_alpha(&mut self, bits: Bitmap, rect: IntRect, color: ColorIndex, depth: u8) -> Result<()> {
        if depth == 0 {
            return Err(ClistError::device("alpha depth 0"));
        }
        let depth = depth as usize;
        check_rows(&bits, &rect, depth)?;
        let half = 1 << (depth - 1);
        // Coverage of at least one half paints the pixel
        self.paint(rect, |x, y| {
            let a = bits_at(&bits, (y - rect.y1) as usize, (x - rect.x1) as usize, depth);
            if a >= half { color } else { NO_COLOR }
        });
        Ok(())
    }
    fn strip_tile_rectangle(&mut self, tile: &TileBitmap, rect: IntRect, color0: ColorIndex,
                            color1: ColorIndex, phase: (i32, i32)) -> Result<()> {
        let mono = tile.size.depth == 1;
        self.paint(rect, |x, y| {
            let v = tile.pixel(x, y, phase);
            if !mono {
                ColorIndex::from(v)
            } else if v != 0 {
                color1
            } else {
                color0
            }
        });
        Ok(())
    }
    fn fill_path(&mut self, _state: &ImagerState, path: &Path, rule: FillRule,
                 color: &DrawingColor, clip: Option<&ClipList>) -> Result<()> {
        let color = match color {
            DrawingColor::Pure(c) => *c,
            DrawingColor::Halftone { colors, .. } => colors[1],
            DrawingColor::Colored { .. } => return Err(ClistError::device("colored halftone fill not supported")),
        };
        let polys = flatten(path);
        let (y1, y2) = match path.row_span() {
            Some((y, h)) => (y.max(self.clip_box.y1), (y + h).min(self.clip_box.y2)),
            None => return Ok(()),
        };
        for y in y1 .. y2 {
            let sy = y as f64 + 0.5;
            // (x, winding direction) of every edge crossing the row center
            let mut xs: Vec<(f64, i32)> = vec![];
            for poly in &polys {
                let n = poly.len();
                for i in 0 .. n {
                    let (a, b) = (poly[i], poly[(i + 1) % n]);
                    if (a.1 <= sy) != (b.1 <= sy) {
                        let x = a.0 + (sy - a.1) * (b.0 - a.0) / (b.1 - a.1);
                        xs.push((x, if b.1 > a.1 { 1 } else { -1 }));
                    }
                }
            }
            xs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
            let mut winding = 0;
            for w in xs.windows(2) {
                winding += w[0].1;
                let inside = match rule {
                    FillRule::NonZero => winding != 0,
                    FillRule::EvenOdd => winding % 2 != 0,
                };
                if inside {
                    let x1 = (w[0].0 - 0.5).ceil() as i32;
                    let x2 = (w[1].0 - 0.5).ceil() as i32;
                    if x2 > x1 {
                        self.span(y, x1, x2, color, clip);
                    }
                }
            }
        }
        Ok(())
    }
}
