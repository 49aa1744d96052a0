//! Drawing intents
//!
//! Each intent is clipped to the page, split into the bands it touches and
//! written band by band under the writer's recovery protocol.
//!
//! Paths are re-encoded for every band. Runs of segments lying wholly above
//! or below the band are skipped; the pen only catches up with a single
//! line (or move) when the path comes back into the band.

use tracing::{debug, trace};

use crate::bits::{choose_bits, extract_bits, short_raster};
use crate::clip::{ClipPath, IntRect};
use crate::codec::{self, put_iw, put_w, CMD_LARGEST_SIZE};
use crate::config::CompressionMask;
use crate::device::{Bitmap, ColorSpace, DrawingColor, FillRule, ImageHeader};
use crate::error::{ClistError, Result};
use crate::opcodes::*;
use crate::path::{FixedPoint, Path, Segment};
use crate::state::{BandState, BitmapId, CmdRect, ColorIndex, ImagerState, Known,
                   LogicalOp, SegmentNotes, NO_COLOR, SN_NONE};
use crate::store::StoreStream;
use crate::tile_cache::{BandMask, TileBitmap, TileSize};
use crate::writer::{ClistWriter, CmdBatch, CmdWriter, ImageEnum, ListId};
use crate::{fixed2int, int2fixed, Fixed};

/// How a copied bitmap is painted
#[derive(Debug,Copy,Clone)]
enum CopyKind<'t> {
    /// 1 bit, color0 for 0 bits and color1 for 1 bits
    Mono([ColorIndex; 2]),
    /// Device depth pixels
    Color,
    /// Coverage of the given depth painting a color
    Alpha(ColorIndex, u8),
    /// 1 bit mask painted with a binary halftone
    Halftone(&'t TileBitmap, [ColorIndex; 2], (i32, i32)),
}

impl<'t> CopyKind<'t> {
    fn depth(&self, device_depth: u8) -> usize {
        match self {
            CopyKind::Mono(_) | CopyKind::Halftone(..) => 1,
            CopyKind::Color => device_depth as usize,
            CopyKind::Alpha(_, d) => *d as usize,
        }
    }
}

/// Rows starting `dy` rows and `dx` pixels into `bits`
fn offset_bits<'a>(bits: &Bitmap<'a>, dx: i32, dy: i32) -> Bitmap<'a> {
    let start = (dy.max(0) as usize * bits.raster).min(bits.data.len());
    Bitmap::new(&bits.data[start ..], bits.data_x + dx.max(0) as usize, bits.raster)
}

impl<S: StoreStream> ClistWriter<S> {
    fn page_rect(&self) -> IntRect {
        IntRect::new(0, 0, self.core.config.width, self.core.config.height)
    }
    /// Parts of `rect` in each band it touches
    fn band_parts(&self, rect: &IntRect) -> Vec<(usize, IntRect)> {
        let cfg = &self.core.config;
        match cfg.bands_for(rect.y1, rect.height()) {
            Some(r) => r.iter()
                .filter_map(|b| rect.intersect(&cfg.band_rect(b)).map(|p| (b, p)))
                .collect(),
            None => vec![],
        }
    }
    pub fn fill_rectangle(&mut self, rect: IntRect, color: ColorIndex) -> Result<()> {
        self.check()?;
        let rect = match rect.intersect(&self.page_rect()) {
            Some(r) => r,
            None => return Ok(()),
        };
        let lop = self.core.imager.log_op;
        for (band, part) in self.band_parts(&rect) {
            self.with_recovery(|cw| cw.fill_rect_band(band, part, color, lop))?;
        }
        Ok(())
    }
    /// Fill with a tile; tiles the cache cannot hold are drawn as copies
    pub fn strip_tile_rectangle(&mut self, tile: &TileBitmap, rect: IntRect, color0: ColorIndex,
                                color1: ColorIndex, phase: (i32, i32)) -> Result<()> {
        self.check()?;
        let rect = match rect.intersect(&self.page_rect()) {
            Some(r) => r,
            None => return Ok(()),
        };
        if tile.width() == 0 || tile.height() == 0 {
            return Err(ClistError::malformed("empty tile"));
        }
        let lop = self.core.imager.log_op;
        let colors = [color0, color1];
        let fits = tile.replicated().size.data_size() <= self.core.tiles.max_tile_size();
        for (band, part) in self.band_parts(&rect) {
            let r = if fits {
                self.with_recovery(|cw| cw.tile_rect_band(band, part, tile, colors, phase, lop))
            } else {
                Err(ClistError::BitmapTooLarge { size: tile.size.data_size(), limit: self.core.tiles.max_tile_size() })
            };
            match r {
                Err(ClistError::BitmapTooLarge { .. }) => self.tile_fallback(tile, part, colors, phase)?,
                r => r?,
            }
        }
        Ok(())
    }
    /// Tile `r` by copying pieces of the tile
    fn tile_fallback(&mut self, tile: &TileBitmap, r: IntRect, colors: [ColorIndex; 2],
                     phase: (i32, i32)) -> Result<()> {
        debug!(id = tile.id, w = tile.width(), h = tile.height(), "tile not cacheable, copying it");
        let (w, h) = (tile.width() as i32, tile.height() as i32);
        let raster = tile.raster();
        let mut y = r.y1;
        while y < r.y2 {
            let ty = (y + phase.1).rem_euclid(h);
            let strips = (y + phase.1).div_euclid(h);
            let rows = (h - ty).min(r.y2 - y);
            let mut x = r.x1;
            while x < r.x2 {
                let tx = (x + phase.0 - strips * tile.size.rep_shift as i32).rem_euclid(w);
                let cols = (w - tx).min(r.x2 - x);
                let bits = Bitmap::new(&tile.data[ty as usize * raster ..], tx as usize, raster);
                let part = IntRect::from_xywh(x, y, cols, rows);
                if tile.size.depth == 1 {
                    self.copy_mono(bits, None, part, colors[0], colors[1])?;
                } else {
                    self.copy_color(bits, None, part)?;
                }
                x += cols;
            }
            y += rows;
        }
        Ok(())
    }
    /// 1 bit bitmap, cached under `id` when given
    pub fn copy_mono(&mut self, bits: Bitmap, id: Option<BitmapId>, rect: IntRect,
                     color0: ColorIndex, color1: ColorIndex) -> Result<()> {
        self.copy_bits(CopyKind::Mono([color0, color1]), bits, id, rect, None, None)
    }
    /// Bitmap of device depth pixels
    pub fn copy_color(&mut self, bits: Bitmap, id: Option<BitmapId>, rect: IntRect) -> Result<()> {
        self.copy_bits(CopyKind::Color, bits, id, rect, None, None)
    }
    /// Coverage values of `depth` bits painting `color`
    pub fn copy_alpha(&mut self, bits: Bitmap, id: Option<BitmapId>, rect: IntRect,
                      color: ColorIndex, depth: u8) -> Result<()> {
        match depth {
            1 | 2 | 4 | 8 => {},
            d => return Err(ClistError::malformed(format!("alpha depth {}", d))),
        }
        self.copy_bits(CopyKind::Alpha(color, depth), bits, id, rect, None, None)
    }
    /// 1 bit mask painted with a pure color or a binary halftone
    pub fn fill_mask(&mut self, bits: Bitmap, id: Option<BitmapId>, rect: IntRect,
                     color: &DrawingColor, depth: u8, clip: Option<&ClipPath>) -> Result<()> {
        if depth != 1 {
            return Err(ClistError::malformed(format!("mask depth {}", depth)));
        }
        let lop = Some(self.core.imager.log_op);
        self.core.check_clip(clip);
        match color {
            DrawingColor::Pure(c) => self.copy_bits(CopyKind::Mono([NO_COLOR, *c]), bits, id, rect, clip, lop),
            DrawingColor::Halftone { tile, colors, phase } =>
                self.copy_bits(CopyKind::Halftone(tile, *colors, *phase), bits, None, rect, clip, lop),
            DrawingColor::Colored { .. } => Err(ClistError::malformed("colored halftone mask")),
        }
    }
    fn copy_bits(&mut self, kind: CopyKind, bits: Bitmap, id: Option<BitmapId>, rect: IntRect,
                 clip: Option<&ClipPath>, lop: Option<LogicalOp>) -> Result<()> {
        self.check()?;
        let r = match rect.intersect(&self.page_rect()) {
            Some(r) => r,
            None => return Ok(()),
        };
        let bits = offset_bits(&bits, r.x1 - rect.x1, r.y1 - rect.y1);
        let parts = self.band_parts(&r);
        // A bitmap split over bands is not the bitmap the id names
        let id = if parts.len() == 1 && r == rect { id } else { None };
        for (band, part) in parts {
            let sub = offset_bits(&bits, 0, part.y1 - r.y1);
            self.with_recovery(|cw| cw.copy_band(band, kind, sub, id, part, clip, lop))?;
        }
        Ok(())
    }
    pub fn fill_path(&mut self, ps: &ImagerState, path: &Path, rule: FillRule, color: &DrawingColor,
                     clip: Option<&ClipPath>) -> Result<()> {
        self.check()?;
        let (y, height) = match path.row_span() {
            Some(s) => s,
            None => return Ok(()),
        };
        let (y0, y1) = (y - 1, y + height + 1);
        self.core.update_imager(ps, Known::FILL_ALL)?;
        self.core.check_clip(clip);
        let bands = match self.core.config.bands_for(y0, y1 - y0) {
            Some(b) => b,
            None => return Ok(()),
        };
        let op: fn(DcType) -> PathOp = match rule {
            FillRule::NonZero => PathOp::Fill,
            FillRule::EvenOdd => PathOp::EoFill,
        };
        let enc = PathEncoding { required: Known::FILL_ALL, implicit_close: true, keep_notes: SN_NONE };
        for band in bands.iter() {
            let area = self.core.config.band_rect(band);
            let ymin = int2fixed((area.y1 - 1).max(y0));
            let ymax = int2fixed((area.y2 + 1).min(y1));
            self.with_recovery(|cw| cw.path_band(band, path, op, &enc, color, clip, (ymin, ymax), ps.log_op))?;
        }
        Ok(())
    }
    pub fn stroke_path(&mut self, ps: &ImagerState, path: &Path, color: &DrawingColor,
                       clip: Option<&ClipPath>) -> Result<()> {
        self.check()?;
        let (y, height) = match path.row_span() {
            Some(s) => s,
            None => return Ok(()),
        };
        self.core.update_imager(ps, Known::STROKE_ALL)?;
        self.core.check_clip(clip);
        let expansion = ps.stroke_expansion();
        let bands = match expansion {
            Some(e) => self.core.config.bands_for(y - e, height + 2 * e),
            None => Some(self.core.config.all_bands()),
        };
        let bands = match bands {
            Some(b) => b,
            None => return Ok(()),
        };
        // Dashes restart at the subpath start, nothing may be skipped
        let skip = if ps.dash.pattern.is_empty() { expansion } else { None };
        let enc = PathEncoding { required: Known::STROKE_ALL, implicit_close: false, keep_notes: !SN_NONE };
        for band in bands.iter() {
            let area = self.core.config.band_rect(band);
            let range = match skip {
                Some(e) => (int2fixed(area.y1 - e), int2fixed(area.y2 + e)),
                None => (Fixed::MIN, Fixed::MAX),
            };
            self.with_recovery(|cw| cw.path_band(band, path, PathOp::Stroke, &enc, color, clip, range, ps.log_op))?;
        }
        Ok(())
    }
    /// Start an image; rows follow with image_data
    ///
    /// Masks are painted with a pure color, other images ignore `color`.
    pub fn begin_image(&mut self, ps: &ImagerState, header: &ImageHeader, cs: &ColorSpace,
                       color: &DrawingColor, clip: Option<&ClipPath>) -> Result<()> {
        self.check()?;
        if !self.core.config.high_level_images {
            return Err(ClistError::ImagesDisabled);
        }
        if self.core.image.is_some() {
            return Err(ClistError::malformed("begin_image inside another image"));
        }
        if header.mask && !matches!(color, DrawingColor::Pure(_)) {
            return Err(ClistError::malformed("image mask needs a pure color"));
        }
        codec::put_image_header(header, cs, &mut vec![])?;
        let bbox = header.device_bbox(&ps.ctm)
            .ok_or_else(|| ClistError::malformed("singular image matrix"))?;
        let bands = bbox.intersect(&self.page_rect())
            .and_then(|r| self.core.config.bands_for(r.y1, r.height()));
        self.core.update_imager(ps, Known::CTM | Known::ALPHA)?;
        self.set_color_space(cs);
        self.core.check_clip(clip);
        debug!(w = header.width, h = header.height, mask = header.mask, ?bands, "begin image");
        self.core.image = Some(ImageEnum {
            header: header.clone(),
            color_space: *cs,
            color: color.clone(),
            clip: clip.cloned(),
            state: ps.clone(),
            bands,
            started: BandMask::new(self.core.config.nbands()),
            rows_sent: 0,
        });
        Ok(())
    }
    /// `height` rows of every plane of the current image
    pub fn image_data(&mut self, planes: &[Bitmap], height: u32) -> Result<()> {
        self.check()?;
        let (header, cs, bands) = match &self.core.image {
            Some(im) => (im.header.clone(), im.color_space, im.bands),
            None => return Err(ClistError::malformed("image_data without begin_image")),
        };
        let nplanes = header.num_planes(&cs);
        if planes.len() != nplanes {
            return Err(ClistError::malformed(format!("{} planes given, image has {}", planes.len(), nplanes)));
        }
        let bands = match bands {
            Some(b) => b,
            None => {
                self.advance_image(height);
                return Ok(());
            },
        };
        let plane_depth = header.plane_depth(&cs);
        let data_width = header.rect.map(|r| r.width() as usize).unwrap_or(header.width as usize);
        let bits_per_row = data_width * plane_depth;
        let bpp = short_raster(bits_per_row);
        let room = self.core.config.cbuf_size - CMD_LARGEST_SIZE;
        if bpp * nplanes > room {
            return Err(ClistError::BitmapTooLarge { size: bpp * nplanes, limit: room });
        }
        let max_rows = if bpp == 0 { height as usize } else { room / (bpp * nplanes) };
        let mut row = 0;
        while row < height as usize {
            let n = (height as usize - row).min(max_rows.max(1));
            let mut data = Vec::with_capacity(bpp * nplanes * n);
            for p in planes {
                let rows = &p.data[(row * p.raster).min(p.data.len()) ..];
                data.extend(extract_bits(rows, p.raster, p.data_x * plane_depth, bits_per_row, n)?);
            }
            for band in bands.iter() {
                self.with_recovery(|cw| cw.image_data_band(band, &data, bpp, n))?;
            }
            self.advance_image(n as u32);
            row += n;
        }
        Ok(())
    }
    fn advance_image(&mut self, rows: u32) {
        if let Some(im) = self.core.image.as_mut() {
            im.rows_sent += rows;
        }
    }
    pub fn end_image(&mut self) -> Result<()> {
        self.check()?;
        let bands = match &self.core.image {
            Some(im) => im.bands,
            None => return Err(ClistError::malformed("end_image without begin_image")),
        };
        if let Some(bands) = bands {
            for band in bands.iter() {
                self.with_recovery(|cw| cw.end_image_band(band))?;
            }
        }
        self.core.image = None;
        Ok(())
    }
}

/// What differs between filling and stroking
#[derive(Debug,Copy,Clone)]
struct PathEncoding {
    required: Known,
    implicit_close: bool,
    keep_notes: SegmentNotes,
}

impl<'a, S: StoreStream> CmdWriter<'a, S> {
    fn fill_rect_band(&mut self, band: usize, r: IntRect, color: ColorIndex, lop: LogicalOp) -> Result<()> {
        let mut st = self.core.states[band];
        let mut b = CmdBatch::new();
        self.write_clip(band, &mut st, None, &mut b);
        self.put_lop(&mut st, lop, true, &mut b);
        self.put_color1(&mut st, color, &mut b);
        let rect = CmdRect::new(r.x1, r.y1, r.width(), r.height());
        b.cmd(|o| codec::put_rect(FILL_RECT, &rect, &st.rect, o));
        st.rect = rect;
        self.commit(band, st, &b, &[])
    }
    fn tile_rect_band(&mut self, band: usize, r: IntRect, tile: &TileBitmap, colors: [ColorIndex; 2],
                      phase: (i32, i32), lop: LogicalOp) -> Result<()> {
        let mut st = self.core.states[band];
        let mut b = CmdBatch::new();
        self.write_clip(band, &mut st, None, &mut b);
        self.put_lop(&mut st, lop, true, &mut b);
        let (index, sent) = self.select_tile(band, &mut st, tile, &mut b)?;
        if tile.size.depth == 1 {
            self.put_tile_colors(&mut st, colors, &mut b);
        }
        self.put_tile_phase(&mut st, phase, &mut b);
        let rect = CmdRect::new(r.x1, r.y1, r.width(), r.height());
        b.cmd(|o| codec::put_rect(TILE_RECT, &rect, &st.rect, o));
        st.rect = rect;
        let marks = if sent { vec![index] } else { vec![] };
        self.commit(band, st, &b, &marks)
    }
    /// Colors, copy mode and tile the copy command relies on
    fn put_copy_setup(&mut self, band: usize, st: &mut BandState, kind: CopyKind,
                      b: &mut CmdBatch) -> Result<Option<usize>> {
        match kind {
            CopyKind::Mono(colors) => self.put_colors(st, colors, b),
            CopyKind::Color => self.put_copy_mode(st, false, b),
            CopyKind::Alpha(color, _) => {
                self.put_copy_mode(st, true, b);
                self.put_color1(st, color, b);
            },
            CopyKind::Halftone(tile, colors, phase) => {
                let (index, sent) = self.select_tile(band, st, tile, b)?;
                self.put_tile_colors(st, colors, b);
                self.put_tile_phase(st, phase, b);
                return Ok(if sent { Some(index) } else { None });
            },
        }
        Ok(None)
    }
    fn copy_band(&mut self, band: usize, kind: CopyKind, bits: Bitmap, id: Option<BitmapId>, r: IntRect,
                 clip: Option<&ClipPath>, lop: Option<LogicalOp>) -> Result<()> {
        let mut st = self.core.states[band];
        let mut b = CmdBatch::new();
        self.write_clip(band, &mut st, clip, &mut b);
        if let Some(lop) = lop {
            self.put_lop(&mut st, lop, false, &mut b);
        }
        let mut marks: Vec<usize> = self.put_copy_setup(band, &mut st, kind, &mut b)?.into_iter().collect();
        if let Some(id) = id {
            if let Some(m) = self.put_cached_copy(band, &mut st, kind, bits, id, r, &mut b)? {
                marks.extend(m);
                return self.commit(band, st, &b, &marks);
            }
        }
        self.put_inline_copies(&mut st, kind, bits, r, &mut b)?;
        self.commit(band, st, &b, &marks)
    }
    fn copy_opcode(kind: CopyKind) -> u8 {
        match kind {
            CopyKind::Mono(_) => COPY_MONO,
            CopyKind::Halftone(..) => COPY_MONO | COPY_HT_COLOR,
            CopyKind::Color | CopyKind::Alpha(..) => COPY_COLOR_ALPHA,
        }
    }
    fn compression_for(&self, kind: CopyKind) -> CompressionMask {
        let mask = self.core.config.compression;
        match kind {
            CopyKind::Mono(_) | CopyKind::Halftone(..) => mask,
            // CCITT only codes 1 bit pixels
            _ => mask - CompressionMask::CCITT,
        }
    }
    /// Copy through the tile cache
    ///
    /// Returns the slots to mark, or None when the bitmap cannot be cached
    /// and must go inline.
    fn put_cached_copy(&mut self, band: usize, st: &mut BandState, kind: CopyKind, bits: Bitmap,
                       id: BitmapId, r: IntRect, b: &mut CmdBatch) -> Result<Option<Vec<usize>>> {
        let depth = kind.depth(self.depth());
        let (w, h) = (r.width() as usize, r.height() as usize);
        let size = TileSize::new(w as u32, h as u32, depth as u8);
        if size.data_size() > self.core.tiles.max_tile_size() {
            return Ok(None);
        }
        let rows = extract_bits(bits.data, bits.raster, bits.data_x * depth, w * depth, h)?;
        let index = match self.core.tiles.find(id) {
            Some(i) => i,
            None => match self.core.tiles.lookup_or_add(id, size, &rows) {
                Ok(l) => l.index(),
                Err(ClistError::BitmapTooLarge { .. }) => return Ok(None),
                Err(e) => return Err(e),
            },
        };
        let slot = match self.core.tiles.entry(index) {
            Some(e) if e.slot.size == size => e.slot,
            _ => return Ok(None),
        };
        let mut marks = vec![];
        if self.core.tiles.band_has(index, band) {
            self.put_tile_index(st, index, b);
        } else {
            let mask = self.compression_for(kind) | CompressionMask::DECOMPRESS_ELSEWHERE;
            let payload = match choose_bits(&rows, size.raster(), h, mask, self.core.config.cbuf_size) {
                Ok(p) => p,
                Err(ClistError::BitmapTooLarge { .. }) => return Ok(None),
                Err(e) => return Err(e),
            };
            trace!(index, id, band, compression = ?payload.compression, "cache bitmap");
            b.cmd(|o| {
                o.push(SET_BITS);
                o.push(((depth as u8) << 2) | payload.compression.code());
                put_w(w as u32, o);
                put_w(h as u32, o);
                put_w(index as u32, o);
                put_w(slot.offset as u32, o);
                o.extend_from_slice(&payload.data);
            });
            st.tile_index = index as u16;
            marks.push(index);
        }
        let op = Self::copy_opcode(kind) | COPY_USE_TILE;
        b.cmd(|o| {
            o.push(op);
            if let CopyKind::Alpha(_, d) = kind {
                o.push(d);
            }
            put_iw(r.x1, o);
            put_iw(r.y1, o);
        });
        st.rect = CmdRect::new(r.x1, r.y1, r.width(), r.height());
        Ok(Some(marks))
    }
    /// Copy commands carrying their bits, split so each payload fits the
    /// reader's buffer
    fn put_inline_copies(&mut self, st: &mut BandState, kind: CopyKind, bits: Bitmap, r: IntRect,
                         b: &mut CmdBatch) -> Result<()> {
        let depth = kind.depth(self.depth());
        let limit = self.core.config.cbuf_size - CMD_LARGEST_SIZE;
        // Widest piece whose row fits, leaving room for a sub-byte shift
        let max_cols = ((limit * 8 - 7) / depth).max(1) as i32;
        let mut x = r.x1;
        while x < r.x2 {
            let cols = (r.x2 - x).min(max_cols);
            let dx = bits.data_x + (x - r.x1) as usize;
            // 1 bit data keeps its position within the first byte
            let shift = if depth == 1 { dx & 7 } else { 0 };
            let bit_w = (shift + cols as usize) * depth;
            let raster = short_raster(bit_w);
            let max_rows = (limit / raster).max(1) as i32;
            let mut y = r.y1;
            while y < r.y2 {
                let rows = (r.y2 - y).min(max_rows);
                let src = offset_bits(&bits, 0, y - r.y1);
                let data = extract_bits(src.data, src.raster, (dx - shift) * depth, bit_w, rows as usize)?;
                let payload = choose_bits(&data, raster, rows as usize, self.compression_for(kind),
                                          self.core.config.cbuf_size)?;
                if shift != 0 {
                    b.cmd(|o| {
                        o.push(SET_MISC);
                        o.push(MISC_DATA_X | shift as u8);
                    });
                }
                let op = Self::copy_opcode(kind) | payload.compression.code();
                b.cmd(|o| {
                    o.push(op);
                    if let CopyKind::Alpha(_, d) = kind {
                        o.push(d);
                    }
                    put_iw(x, o);
                    put_iw(y, o);
                    put_w(cols as u32, o);
                    put_w(rows as u32, o);
                    o.extend_from_slice(&payload.data);
                });
                st.rect = CmdRect::new(x, y, cols, rows);
                y += rows;
            }
            x += cols;
        }
        Ok(())
    }
    fn path_band(&mut self, band: usize, path: &Path, op: fn(DcType) -> PathOp, enc: &PathEncoding,
                 color: &DrawingColor, clip: Option<&ClipPath>, range: (Fixed, Fixed),
                 lop: LogicalOp) -> Result<()> {
        let mut st = self.core.states[band];
        let mut b = CmdBatch::new();
        self.write_unknown(&mut st, enc.required, &mut b);
        self.write_clip(band, &mut st, clip, &mut b);
        self.put_lop(&mut st, lop, false, &mut b);
        let (dc, mark) = self.put_drawing_color(band, &mut st, color, &mut b)?;
        let origin = FixedPoint::new(int2fixed(st.rect.x), int2fixed(st.rect.y));
        let mut walker = PathWalker::new(&mut b, origin, range, enc);
        for seg in &path.segments {
            walker.segment(seg);
        }
        let end = walker.finish();
        st.rect.x = fixed2int(end.x);
        st.rect.y = fixed2int(end.y);
        b.cmd(|o| o.push(op(dc).code()));
        let marks: Vec<usize> = mark.into_iter().collect();
        self.commit(band, st, &b, &marks)
    }
    /// Start the current image in `band`, rows already sent cut from its source rectangle
    fn begin_image_band(&mut self, band: usize, im: &ImageEnum) -> Result<()> {
        self.core.update_imager(&im.state, Known::CTM | Known::ALPHA)?;
        let mut header = im.header.clone();
        if im.rows_sent > 0 {
            let full = IntRect::new(0, 0, header.width as i32, header.height as i32);
            let mut r = header.rect.unwrap_or(full);
            r.y1 += im.rows_sent as i32;
            header.rect = Some(r);
        }
        let mut st = self.core.states[band];
        let mut b = CmdBatch::new();
        self.write_unknown(&mut st, Known::CTM | Known::ALPHA | Known::COLOR_SPACE, &mut b);
        self.write_clip(band, &mut st, im.clip.as_ref(), &mut b);
        self.put_lop(&mut st, im.state.log_op, false, &mut b);
        if let DrawingColor::Pure(c) = im.color {
            if header.mask {
                self.put_color1(&mut st, c, &mut b);
            }
        }
        let cs = im.color_space;
        b.try_cmd(|o| {
            o.push(ExtOp::BeginImage.code());
            codec::put_image_header(&header, &cs, o)
        })?;
        self.commit(band, st, &b, &[])
    }
    fn image_data_band(&mut self, band: usize, data: &[u8], bpp: usize, rows: usize) -> Result<()> {
        let im = match &self.core.image {
            Some(im) => im.clone(),
            None => return Err(ClistError::malformed("image ended")),
        };
        if !im.started.contains(band) {
            if self.core.color_space != im.color_space {
                self.core.color_space = im.color_space;
                self.core.clear_known(Known::COLOR_SPACE);
            }
            self.begin_image_band(band, &im)?;
            if let Some(im) = self.core.image.as_mut() {
                im.started.insert(band);
            }
        }
        let mut b = CmdBatch::new();
        b.cmd(|o| {
            o.push(ExtOp::ImageData.code());
            put_w(rows as u32, o);
            put_w(bpp as u32, o);
            o.extend_from_slice(data);
        });
        self.put_batch(ListId::Band(band), &b)
    }
    fn end_image_band(&mut self, band: usize) -> Result<()> {
        let started = self.core.image.as_ref().map(|im| im.started.contains(band)).unwrap_or(false);
        if !started {
            return Ok(());
        }
        let mut b = CmdBatch::new();
        b.cmd(|o| {
            o.push(ExtOp::ImageData.code());
            put_w(0, o);
        });
        self.put_batch(ListId::Band(band), &b)
    }
}

/// Unflushed start of a merged line sequence
#[derive(Debug,Copy,Clone)]
enum Pending {
    None,
    Move([Fixed; 2]),
    MLine([Fixed; 4], SegmentNotes),
    M2Line([Fixed; 6], SegmentNotes),
}

/// Segment commands for one band, merging moves with the lines after them
struct SegmentWriter<'b> {
    batch: &'b mut CmdBatch,
    notes: SegmentNotes,
    pending: Pending,
}

impl<'b> SegmentWriter<'b> {
    fn new(batch: &'b mut CmdBatch) -> Self {
        Self { batch, notes: SN_NONE, pending: Pending::None }
    }
    fn emit(&mut self, op: SegmentOp, operands: &[Fixed], notes: Option<SegmentNotes>) {
        if let Some(n) = notes {
            if n != self.notes {
                self.batch.cmd(|o| {
                    o.push(ExtOp::SetMisc2.code());
                    o.push(MISC2_NOTES | (n & 0x3f));
                });
                self.notes = n;
            }
        }
        self.batch.cmd(|o| {
            o.push(op.code());
            codec::put_segment_operands(operands, o);
        });
    }
    fn flush(&mut self) {
        match std::mem::replace(&mut self.pending, Pending::None) {
            Pending::None => {},
            Pending::Move(m) => self.emit(SegmentOp::RMoveTo, &m, None),
            Pending::MLine(v, n) => self.emit(SegmentOp::RMLineTo, &v, Some(n)),
            Pending::M2Line(v, n) => self.emit(SegmentOp::RM2LineTo, &v, Some(n)),
        }
    }
    fn rmoveto(&mut self, dx: Fixed, dy: Fixed) {
        self.flush();
        self.pending = Pending::Move([dx, dy]);
    }
    fn rlineto(&mut self, dx: Fixed, dy: Fixed, notes: SegmentNotes) {
        match self.pending {
            Pending::Move(m) if dx != 0 && dy != 0 => {
                self.pending = Pending::MLine([m[0], m[1], dx, dy], notes);
                return;
            },
            Pending::MLine(v, n) if n == notes && dx != 0 && dy != 0 => {
                self.pending = Pending::M2Line([v[0], v[1], v[2], v[3], dx, dy], n);
                return;
            },
            Pending::M2Line(v, n) if n == notes && dx == -v[2] && dy == -v[3] => {
                self.pending = Pending::None;
                self.emit(SegmentOp::RM3LineTo, &v, Some(n));
                return;
            },
            _ => self.flush(),
        }
        if dx == 0 {
            self.emit(SegmentOp::VLineTo, &[dy], Some(notes));
        } else if dy == 0 {
            self.emit(SegmentOp::HLineTo, &[dx], Some(notes));
        } else {
            self.emit(SegmentOp::RLineTo, &[dx, dy], Some(notes));
        }
    }
    /// Curve through control points given relative to the current point
    fn curve(&mut self, p: FixedPoint, c1: FixedPoint, c2: FixedPoint, end: FixedPoint, notes: SegmentNotes) {
        self.flush();
        let (a, b) = (c1.x - p.x, c1.y - p.y);
        let (c, d) = (c2.x - c1.x, c2.y - c1.y);
        let (e, f) = (end.x - c2.x, end.y - c2.y);
        let (op, ops): (SegmentOp, Vec<Fixed>) = if b == 0 && e == 0 {
            if (a ^ d) >= 0 {
                if c == d && f == a {
                    (SegmentOp::HQCurveTo, vec![a, c])
                } else {
                    (SegmentOp::HVCurveTo, vec![a, c, d, f])
                }
            } else if c == -d && f == -a {
                (SegmentOp::HQCurveTo, vec![a, d])
            } else {
                (SegmentOp::HVCurveTo, vec![a, c, d, f])
            }
        } else if a == 0 && f == 0 {
            if (b ^ c) >= 0 {
                if d == c && e == b {
                    (SegmentOp::VQCurveTo, vec![b, c])
                } else {
                    (SegmentOp::VHCurveTo, vec![b, c, d, e])
                }
            } else if d == -c && e == -b {
                (SegmentOp::VQCurveTo, vec![b, c])
            } else {
                (SegmentOp::VHCurveTo, vec![b, c, d, e])
            }
        } else if a == 0 && b == 0 {
            (SegmentOp::NRCurveTo, vec![c, d, e, f])
        } else if e == 0 && f == 0 {
            (SegmentOp::RNCurveTo, vec![a, b, c, d])
        } else {
            (SegmentOp::RRCurveTo, vec![a, b, c, d, e, f])
        };
        self.emit(op, &ops, Some(notes));
    }
    fn closepath(&mut self) {
        self.flush();
        self.emit(SegmentOp::ClosePath, &[], None);
    }
}

/// Side of the band a row lies on
fn side_of(y: Fixed, range: (Fixed, Fixed)) -> i8 {
    if y < range.0 {
        -1
    } else if y >= range.1 {
        1
    } else {
        0
    }
}

/// Walks a path for one band, dropping runs outside the band's rows
struct PathWalker<'b> {
    w: SegmentWriter<'b>,
    range: (Fixed, Fixed),
    enc: PathEncoding,
    /// Current point as the reader sees it
    p: FixedPoint,
    /// Start of the subpath and the side it began on
    start: FixedPoint,
    start_side: i8,
    /// Segments were dropped right after the subpath start
    start_skip: bool,
    side: i8,
    /// End of the last dropped segment
    out: FixedPoint,
    out_notes: SegmentNotes,
    /// Subpath start as last sent
    first: FixedPoint,
    /// -1 after a move, 1 after drawing, 0 closed
    open: i8,
    /// Nothing sent since the path or subpath began
    first_point: bool,
}

impl<'b> PathWalker<'b> {
    fn new(batch: &'b mut CmdBatch, origin: FixedPoint, range: (Fixed, Fixed), enc: &PathEncoding) -> Self {
        Self {
            w: SegmentWriter::new(batch),
            range,
            enc: *enc,
            p: origin,
            start: origin,
            start_side: 0,
            start_skip: false,
            side: 0,
            out: origin,
            out_notes: SN_NONE,
            first: origin,
            open: 0,
            first_point: true,
        }
    }
    fn segment(&mut self, seg: &Segment) {
        match *seg {
            Segment::MoveTo(a) => self.move_to(a),
            Segment::LineTo(a, notes) => self.line_to(a, notes),
            Segment::CurveTo(c1, c2, end, notes) => self.curve_to(c1, c2, end, notes),
            Segment::Close => self.close(),
        }
    }
    /// Bring the pen to the end of the dropped run
    fn catch_up(&mut self) {
        if self.side != 0 && (self.p != self.out || self.first_point) {
            let (dx, dy) = (self.out.x - self.p.x, self.out.y - self.p.y);
            if self.open < 0 {
                self.first = self.out;
                self.w.rmoveto(dx, dy);
            } else {
                self.w.rlineto(dx, dy, self.out_notes);
            }
            self.p = self.out;
            self.first_point = false;
        }
    }
    fn move_to(&mut self, a: FixedPoint) {
        if self.open > 0 && self.enc.implicit_close {
            self.close();
        }
        self.open = -1;
        self.start = a;
        self.start_skip = false;
        self.side = side_of(a.y, self.range);
        self.start_side = self.side;
        if self.side != 0 {
            self.out = a;
            return;
        }
        self.w.rmoveto(a.x - self.p.x, a.y - self.p.y);
        self.first = a;
        self.p = a;
        self.first_point = false;
    }
    fn line_to(&mut self, a: FixedPoint, notes: SegmentNotes) {
        let notes = notes & self.enc.keep_notes;
        let next = side_of(a.y, self.range);
        if next == self.side && self.side != 0 {
            if self.open < 0 {
                self.start_skip = true;
            }
            self.out = a;
            self.out_notes = notes;
            return;
        }
        self.catch_up();
        self.side = next;
        if next != 0 {
            self.out = a;
        }
        self.w.rlineto(a.x - self.p.x, a.y - self.p.y, notes);
        self.p = a;
        self.open = 1;
        self.first_point = false;
    }
    fn curve_to(&mut self, c1: FixedPoint, c2: FixedPoint, end: FixedPoint, notes: SegmentNotes) {
        let notes = notes & self.enc.keep_notes;
        let lo = c1.y.min(c2.y).min(end.y);
        let hi = c1.y.max(c2.y).max(end.y);
        let all_side = if hi < self.range.0 {
            -1
        } else if lo > self.range.1 {
            1
        } else {
            0
        };
        let out_side = if all_side != 0 {
            if all_side == self.side {
                if self.open < 0 {
                    self.start_skip = true;
                }
                self.out = end;
                self.out_notes = notes;
                return;
            }
            all_side
        } else {
            side_of(end.y, self.range)
        };
        self.catch_up();
        self.side = out_side;
        if out_side != 0 {
            self.out = end;
        }
        self.w.curve(self.p, c1, c2, end, notes);
        self.p = end;
        self.open = 1;
        self.first_point = false;
    }
    fn close(&mut self) {
        if self.side != self.start_side {
            if self.side != 0 && (self.p != self.out || self.first_point) {
                self.w.rlineto(self.out.x - self.p.x, self.out.y - self.p.y, self.out_notes);
                self.p = self.out;
                self.first_point = false;
            }
            if self.open > 0 && self.start_skip {
                self.w.rlineto(self.start.x - self.p.x, self.start.y - self.p.y, SN_NONE);
                self.p = self.start;
            }
        }
        if self.enc.implicit_close || self.open <= 0 {
            self.open = 0;
            self.first_point = true;
            self.w.flush();
            return;
        }
        self.open = 0;
        self.p = self.first;
        self.w.closepath();
    }
    /// Close what is left open, returns the final current point
    fn finish(mut self) -> FixedPoint {
        if self.open > 0 && self.enc.implicit_close {
            self.close();
        }
        self.w.flush();
        self.p
    }
}
