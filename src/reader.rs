//! Command list reader
//!
//! Replays one band at a time. Every band starts from a fresh
//! [`BandState`] and rebuilds the imager state, tiles, clip and halftone
//! from its own commands, then draws on a [`TargetDevice`].

use std::convert::TryFrom;
use std::io::Read;

use tracing::{debug, error, trace, warn};

use crate::bits::{read_bits, short_raster};
use crate::clip::{ClipAccumulator, ClipList, IntRect};
use crate::codec::{self, CmdSource, CMD_LARGEST_SIZE, MAX_DASH};
use crate::config::{ClistConfig, Compression};
use crate::device::{Bitmap, ColorSpace, DrawingColor, FillRule, ImageHeader, TargetDevice};
use crate::error::{ClistError, Result};
use crate::halftone::{DeviceHalftone, HtBit, HtComponent, HtOrder, TRANSFER_MAP_SIZE};
use crate::opcodes::*;
use crate::path::{FixedPoint, Path};
use crate::state::{BandState, CmdRect, Dash, ImagerState, Known, LineCap, LineJoin, SegmentNotes, SN_NONE};
use crate::store::{BandStore, StoreStream};
use crate::tile_cache::{TileArena, TileSize};
use crate::{fixed2int, int2fixed, Fixed};

/// Where the reader is in a band's command stream
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum ReaderState {
    Init,
    Decoding,
    /// Buffer ran low and is being topped up from the store
    AwaitingMoreInput,
    EndOfPage,
    Fatal,
}

impl Default for ReaderState {
    fn default() -> ReaderState {
        ReaderState::Init
    }
}

/// Command source reading through a buffer of the reader's size
pub struct BufferedSource<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    len: usize,
    /// Stream offset of `buf[0]`
    base: usize,
    eof: bool,
}

impl<R: Read> BufferedSource<R> {
    pub fn new(inner: R, size: usize) -> Self {
        Self { inner, buf: vec![0u8; size], pos: 0, len: 0, base: 0, eof: false }
    }
    fn available(&self) -> usize {
        self.len - self.pos
    }
    /// Keep at least a command's worth of bytes buffered; false at the end
    /// of the stream
    fn top_up(&mut self) -> Result<bool> {
        if self.available() >= CMD_LARGEST_SIZE || self.eof {
            return Ok(false);
        }
        self.buf.copy_within(self.pos .. self.len, 0);
        self.base += self.pos;
        self.len -= self.pos;
        self.pos = 0;
        while self.len < self.buf.len() {
            let n = self.inner.read(&mut self.buf[self.len ..])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            self.len += n;
        }
        Ok(true)
    }
}

impl<R: Read> CmdSource for BufferedSource<R> {
    fn get_u8(&mut self) -> Result<u8> {
        if self.pos == self.len {
            self.top_up()?;
            if self.pos == self.len {
                return Err(ClistError::TruncatedInput { offset: self.offset(), needed: 1 });
            }
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }
    fn get_into(&mut self, out: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < out.len() {
            if self.pos == self.len {
                self.top_up()?;
                if self.pos == self.len {
                    return Err(ClistError::TruncatedInput { offset: self.offset(), needed: out.len() - done });
                }
            }
            let n = (out.len() - done).min(self.available());
            out[done .. done + n].copy_from_slice(&self.buf[self.pos .. self.pos + n]);
            self.pos += n;
            done += n;
        }
        Ok(())
    }
    fn offset(&self) -> usize {
        self.base + self.pos
    }
}

/// Reader half of the command list
#[derive(Debug)]
pub struct ClistReader {
    config: ClistConfig,
    state: ReaderState,
    known: Known,
}

impl ClistReader {
    pub fn new(config: ClistConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, state: ReaderState::Init, known: Known::empty() })
    }
    pub fn config(&self) -> &ClistConfig {
        &self.config
    }
    pub fn state(&self) -> ReaderState {
        self.state
    }
    /// Imager state fields set by commands of the last band played
    pub fn known(&self) -> Known {
        self.known
    }
    /// Replay every band of the page in order
    pub fn play_page<S: StoreStream, T: TargetDevice>(&mut self, store: &mut BandStore<S>,
                                                      target: &mut T) -> Result<()> {
        for band in 0 .. self.config.nbands() {
            self.play_band(store, band, target)?;
        }
        Ok(())
    }
    /// Replay the runs stored for `band`
    pub fn play_band<S: StoreStream, T: TargetDevice>(&mut self, store: &mut BandStore<S>, band: usize,
                                                      target: &mut T) -> Result<()> {
        if band >= self.config.nbands() {
            return Err(ClistError::malformed(format!("band {} of {}", band, self.config.nbands())));
        }
        let cbuf = self.config.cbuf_size;
        let src = BufferedSource::new(store.band_stream(band), cbuf);
        self.play(band, src, target)
    }
    /// Replay an in-memory command sequence as `band`
    pub fn play_commands<T: TargetDevice>(&mut self, band: usize, cmds: &[u8], target: &mut T) -> Result<()> {
        let src = BufferedSource::new(cmds, self.config.cbuf_size);
        self.play(band, src, target)
    }
    fn play<R: Read, T: TargetDevice>(&mut self, band: usize, mut src: BufferedSource<R>,
                                      target: &mut T) -> Result<()> {
        let area = self.config.band_rect(band);
        target.begin_band(band, area)?;
        debug!(band, y = area.y1, h = area.height(), "play band");
        let mut pb = Playback::new(&self.config, target);
        self.state = ReaderState::Decoding;
        let r = pb.run(&mut src, &mut self.state);
        self.known = pb.st.known;
        match &r {
            Ok(()) => self.state = ReaderState::EndOfPage,
            Err(e) if e.is_fatal_for_page() => {
                error!(band, offset = src.offset(), %e, "command stream corrupt");
                self.state = ReaderState::Fatal;
            },
            Err(e) => {
                warn!(band, %e, "band playback stopped");
                self.state = ReaderState::Fatal;
            },
        }
        r
    }
}

/// Halftone being reassembled from set_ht_order / set_ht_data
#[derive(Debug,Default)]
struct HtBuild {
    ht: DeviceHalftone,
    /// Order the next data goes to
    index: usize,
}

/// Replay of one band
struct Playback<'a> {
    cfg: &'a ClistConfig,
    target: &'a mut dyn TargetDevice,
    depth: u8,
    st: BandState,
    imager: ImagerState,
    color_space: ColorSpace,
    tiles: TileArena,
    tile_size: TileSize,
    /// Colored halftone from the last set_color
    colored: Option<DrawingColor>,
    data_x: usize,
    halftone: Option<HtBuild>,
    clip: Option<ClipList>,
    accum: Option<ClipAccumulator>,
    image: Option<(ImageHeader, ColorSpace)>,
    path: Path,
    /// Segments since the last path command
    in_path: bool,
    p: FixedPoint,
    start: FixedPoint,
    notes: SegmentNotes,
}

impl<'a> Playback<'a> {
    fn new<T: TargetDevice>(cfg: &'a ClistConfig, target: &'a mut T) -> Self {
        Self {
            depth: cfg.depth,
            st: BandState::new(),
            imager: ImagerState::new(),
            color_space: ColorSpace::default(),
            tiles: TileArena::new(cfg.tile_cache_size, cfg.tile_hash_size),
            tile_size: TileSize::default(),
            colored: None,
            data_x: 0,
            halftone: None,
            clip: None,
            accum: None,
            image: None,
            path: Path::new(),
            in_path: false,
            p: FixedPoint::default(),
            start: FixedPoint::default(),
            notes: SN_NONE,
            cfg,
            target,
        }
    }
    fn run<R: Read>(&mut self, src: &mut BufferedSource<R>, state: &mut ReaderState) -> Result<()> {
        loop {
            if src.available() < CMD_LARGEST_SIZE && !src.eof {
                *state = ReaderState::AwaitingMoreInput;
                src.top_up()?;
                *state = ReaderState::Decoding;
            }
            let offset = src.offset();
            let op = src.get_u8()?;
            trace!(offset, op = format_args!("0x{:02x}", op), "command");
            match Op::decode(op, offset)? {
                Op::Misc(MiscOp::EndPage) => return Ok(()),
                Op::Misc(m) => self.misc(m, src)?,
                Op::SetColor(slot, n) => {
                    self.st.colors[slot] = codec::get_color(src, n, self.st.colors[slot], self.depth)?;
                },
                Op::FillRect(form, n) => {
                    self.st.rect = codec::get_rect(src, form, n, &self.st.rect)?;
                    self.fill_rect()?;
                },
                Op::TileRect(form, n) => {
                    self.st.rect = codec::get_rect(src, form, n, &self.st.rect)?;
                    self.tile_rect()?;
                },
                Op::CopyMono(flags) => self.copy_mono(flags, src)?,
                Op::CopyColorAlpha(flags) => self.copy_color_alpha(flags, src)?,
                Op::DeltaTileIndex(n) => {
                    let index = i32::from(self.st.tile_index) + i32::from(n) - 8;
                    if index < 0 {
                        return Err(ClistError::malformed(format!("tile index {}", index)));
                    }
                    self.st.tile_index = index as u16;
                },
                Op::SetTileIndex(n) => {
                    self.st.tile_index = (u16::from(n) << 8) | u16::from(src.get_u8()?);
                },
                Op::Ext(e) => self.ext(e, src)?,
                Op::Segment(s) => self.segment(s, src)?,
                Op::Path(p) => self.draw_path(p)?,
            }
        }
    }

    // ---- control, tile and color commands

    fn misc<R: Read>(&mut self, m: MiscOp, src: &mut BufferedSource<R>) -> Result<()> {
        match m {
            MiscOp::EndRun | MiscOp::EndPage => {},
            MiscOp::SetTileSize => {
                let bd = src.get_u8()?;
                let rep_width = src.get_w()?;
                let rep_height = src.get_w()?;
                let x_reps = if bd & 0x20 != 0 { src.get_w()? } else { 1 };
                let y_reps = if bd & 0x40 != 0 { src.get_w()? } else { 1 };
                let rep_shift = if bd & 0x80 != 0 { src.get_w()? } else { 0 };
                self.tile_size = TileSize { rep_width, rep_height, x_reps, y_reps, rep_shift, depth: (bd & 31) + 1 };
            },
            MiscOp::SetTilePhase => {
                let x = src.get_iw()?;
                let y = src.get_iw()?;
                self.st.tile_phase = (x, y);
            },
            MiscOp::SetTileBits => {
                let index = src.get_w()? as usize;
                let offset = src.get_w()? as usize;
                let bits = src.get_vec(self.tile_size.data_size())?;
                self.tiles.store(index, offset, self.tile_size, &bits)?;
                self.st.tile_index = index as u16;
            },
            MiscOp::SetBits => {
                let b = src.get_u8()?;
                let compression = Compression::from_code(b & 3)?;
                let w = src.get_w()?;
                let h = src.get_w()?;
                let index = src.get_w()? as usize;
                let offset = src.get_w()? as usize;
                let size = TileSize::new(w, h, b >> 2);
                let bits = read_bits(src, compression, size.raster(), h as usize)?;
                self.tiles.store(index, offset, size, &bits)?;
                self.st.tile_index = index as u16;
            },
            MiscOp::SetTileColor => {
                let op = src.get_u8()?;
                let depth = self.depth;
                match op {
                    DELTA2_COLOR0 | DELTA2_COLOR1 => {
                        let slot = (op - DELTA2_COLOR0) as usize;
                        self.st.tile_colors[slot] = codec::get_delta2_color(src, self.st.tile_colors[slot], depth)?;
                    },
                    _ if op >> 4 == SET_COLOR0 >> 4 || op >> 4 == SET_COLOR1 >> 4 => {
                        let slot = ((op >> 4) - 1) as usize;
                        self.st.tile_colors[slot] = codec::get_color(src, op & 15, self.st.tile_colors[slot], depth)?;
                    },
                    _ => return Err(ClistError::malformed(format!("set_tile_color followed by 0x{:02x}", op))),
                }
            },
            MiscOp::SetMisc => self.set_misc(src)?,
            MiscOp::EnableLop => self.st.lop_enabled = true,
            MiscOp::DisableLop => self.st.lop_enabled = false,
            MiscOp::SetHtOrder => self.set_ht_order(src)?,
            MiscOp::SetHtData => self.set_ht_data(src)?,
            MiscOp::Delta2Color(slot) => {
                self.st.colors[slot] = codec::get_delta2_color(src, self.st.colors[slot], self.depth)?;
            },
            MiscOp::SetCopyColor => self.st.color_is_alpha = false,
            MiscOp::SetCopyAlpha => self.st.color_is_alpha = true,
        }
        Ok(())
    }
    fn set_misc<R: Read>(&mut self, src: &mut BufferedSource<R>) -> Result<()> {
        let b = src.get_u8()?;
        match b & 0xc0 {
            MISC_LOP => {
                let lop = u32::from(b & 0x3f) | (src.get_w()? << 6);
                self.st.lop = lop;
                self.imager.log_op = lop;
            },
            MISC_DATA_X => {
                let low = (b & 0x1f) as usize;
                self.data_x = if b & 0x20 != 0 { ((src.get_w()? as usize) << 5) + low } else { low };
            },
            MISC_MAP => {
                let index = (b & 0x1f) as usize;
                let map = if b & 0x20 != 0 {
                    let mut v = Vec::with_capacity(TRANSFER_MAP_SIZE);
                    for _ in 0 .. TRANSFER_MAP_SIZE {
                        v.push(src.get_u16()?);
                    }
                    Some(v)
                } else {
                    None
                };
                self.target.install_transfer(index, &map)?;
            },
            _ => {
                let ht_type = b & 0x3f;
                let ncomp = src.get_w()? as usize;
                let components = (0 .. ncomp).map(|_| HtComponent { cname: 0, order: HtOrder::default() }).collect();
                let ht = DeviceHalftone { ht_type, order: HtOrder::default(), components };
                self.halftone = Some(HtBuild { ht, index: 0 });
            },
        }
        Ok(())
    }
    fn set_ht_order<R: Read>(&mut self, src: &mut BufferedSource<R>) -> Result<()> {
        let index = src.get_w()? as usize;
        let cname = if index > 0 { src.get_w()? } else { 0 };
        let mut v = [0u32; 6];
        for x in v.iter_mut() {
            *x = src.get_w()?;
        }
        let build = self.halftone.as_mut()
            .ok_or_else(|| ClistError::malformed("halftone order before the halftone"))?;
        let order = build.ht.order_mut(index)
            .ok_or_else(|| ClistError::malformed(format!("halftone order {} out of range", index)))?;
        *order = HtOrder {
            width: v[0], height: v[1], raster: v[2], shift: v[3], num_levels: v[4], num_bits: v[5],
            levels: vec![], bits: vec![],
        };
        if index > 0 {
            build.ht.components[index - 1].cname = cname;
        }
        build.index = index;
        Ok(())
    }
    fn set_ht_data<R: Read>(&mut self, src: &mut BufferedSource<R>) -> Result<()> {
        let n = src.get_u8()? as usize;
        let build = self.halftone.as_mut()
            .ok_or_else(|| ClistError::malformed("halftone data before the halftone"))?;
        let index = build.index;
        let order = build.ht.order_mut(index)
            .ok_or_else(|| ClistError::malformed(format!("halftone order {} out of range", index)))?;
        if order.levels.len() < order.num_levels as usize {
            if order.levels.len() + n > order.num_levels as usize {
                return Err(ClistError::malformed("too many halftone levels"));
            }
            for _ in 0 .. n {
                order.levels.push(src.get_u32()?);
            }
        } else {
            if order.bits.len() + n > order.num_bits as usize {
                return Err(ClistError::malformed("too many halftone bits"));
            }
            for _ in 0 .. n {
                let offset = src.get_u32()?;
                let mask = src.get_u32()?;
                order.bits.push(HtBit { offset, mask });
            }
        }
        // The default order comes last
        if index == 0 && order.is_complete() {
            if let Some(build) = self.halftone.take() {
                debug!(components = build.ht.components.len(), "install halftone");
                self.target.install_halftone(&build.ht)?;
            }
        }
        Ok(())
    }

    // ---- extended commands

    fn ext<R: Read>(&mut self, e: ExtOp, src: &mut BufferedSource<R>) -> Result<()> {
        match e {
            ExtOp::SetFlatness => {
                self.imager.flatness = src.get_f32()?;
                self.st.known |= Known::FLATNESS;
            },
            ExtOp::SetFillAdjust => {
                let x = src.get_i32()?;
                let y = src.get_i32()?;
                self.imager.fill_adjust = FixedPoint::new(x, y);
                self.st.known |= Known::FILL_ADJUST;
            },
            ExtOp::SetCtm => {
                self.imager.ctm = codec::get_matrix(src)?;
                self.st.known |= Known::CTM;
            },
            ExtOp::SetLineWidth => {
                self.imager.line_width = src.get_f32()?;
                self.st.known |= Known::LINE_WIDTH;
            },
            ExtOp::SetMiterLimit => {
                self.imager.miter_limit = src.get_f32()?;
                self.st.known |= Known::MITER_LIMIT;
            },
            ExtOp::SetMisc2 => {
                let b = src.get_u8()?;
                match b & 0xc0 {
                    MISC2_CAP_JOIN => {
                        self.imager.cap = LineCap::from_bits(b >> 3);
                        self.imager.join = LineJoin::from_bits(b);
                        self.st.known |= Known::MISC0;
                    },
                    MISC2_AC_OP_SA => {
                        self.imager.accurate_curves = b & 4 != 0;
                        self.imager.overprint = b & 2 != 0;
                        self.imager.stroke_adjust = b & 1 != 0;
                        self.st.known |= Known::MISC1;
                    },
                    MISC2_NOTES => self.notes = b & 0x3f,
                    _ => {
                        self.imager.alpha = src.get_u16()?;
                        self.st.known |= Known::ALPHA;
                    },
                }
            },
            ExtOp::SetDash => {
                let b = src.get_u8()?;
                let n = (b & 0x3f) as usize;
                if n > MAX_DASH {
                    return Err(ClistError::malformed(format!("dash pattern of {} elements", n)));
                }
                let dot_length = src.get_f32()?;
                let offset = src.get_f32()?;
                let mut pattern = Vec::with_capacity(n);
                for _ in 0 .. n {
                    pattern.push(src.get_f32()?);
                }
                self.imager.dash = Dash {
                    pattern, offset, dot_length,
                    adapt: b & 0x80 != 0,
                    dot_length_absolute: b & 0x40 != 0,
                };
                self.st.known |= Known::DASH;
            },
            ExtOp::EnableClip => self.st.clip_enabled = true,
            ExtOp::DisableClip => self.st.clip_enabled = false,
            ExtOp::BeginClip => {
                self.accum = Some(ClipAccumulator::new(self.target.get_clipping_box()));
            },
            ExtOp::EndClip => {
                let outside = src.get_u8()? != 0;
                let acc = self.accum.take()
                    .ok_or_else(|| ClistError::malformed("end_clip without begin_clip"))?;
                let list = acc.finish(outside);
                let area = self.target.get_clipping_box();
                trace!(rects = list.rects.len(), outside, "clip");
                self.clip = if list.covers(&area) { None } else { Some(list) };
                self.st.known |= Known::CLIP_PATH;
            },
            ExtOp::SetColorSpace => {
                let b = src.get_u8()?;
                let hival = if b & 8 != 0 { src.get_w()? } else { 0 };
                self.color_space = ColorSpace::from_code(b, hival)?;
                self.st.known |= Known::COLOR_SPACE;
            },
            ExtOp::BeginImage => {
                let cs = self.color_space;
                let header = codec::get_image_header(src, &cs)?;
                let color = DrawingColor::Pure(self.st.colors[1]);
                self.imager.log_op = self.st.lop;
                let clip = self.active_clip().cloned();
                self.target.begin_image(&self.imager, &header, &cs, &color, clip.as_ref())?;
                self.image = Some((header, cs));
            },
            ExtOp::ImageData => self.image_data(src)?,
            ExtOp::SetColor => {
                let b = src.get_u8()?;
                let mut bases = [0u8; 4];
                if b >= 0x10 {
                    let word = (u32::from(b - 0x10) << 16) | (u32::from(src.get_u8()?) << 8) | u32::from(src.get_u8()?);
                    for (i, base) in bases.iter_mut().enumerate() {
                        *base = ((word >> ((3 - i) * 5)) & 0x1f) as u8;
                    }
                } else {
                    for (i, base) in bases.iter_mut().enumerate() {
                        *base = (b >> (3 - i)) & 1;
                    }
                }
                let mut levels = Vec::with_capacity(self.cfg.num_components());
                for _ in 0 .. self.cfg.num_components() {
                    levels.push(src.get_w()?);
                }
                self.colored = Some(DrawingColor::Colored { bases, levels });
            },
            ExtOp::PutParams => {
                let n = src.get_u32()? as usize;
                let params = src.get_vec(n)?;
                self.target.put_params(&params)?;
            },
        }
        Ok(())
    }
    fn image_data<R: Read>(&mut self, src: &mut BufferedSource<R>) -> Result<()> {
        let height = src.get_w()?;
        if height == 0 {
            if self.image.take().is_none() {
                return Err(ClistError::malformed("end of image outside an image"));
            }
            return self.target.end_image();
        }
        let bpp = src.get_w()? as usize;
        let nplanes = match &self.image {
            Some((h, cs)) => h.num_planes(cs),
            None => return Err(ClistError::malformed("image data outside an image")),
        };
        let size = bpp * nplanes * height as usize;
        if size > self.cfg.cbuf_size {
            return Err(ClistError::BitmapTooLarge { size, limit: self.cfg.cbuf_size });
        }
        let data = src.get_vec(size)?;
        let plane_size = bpp * height as usize;
        let planes: Vec<&[u8]> = if plane_size == 0 {
            vec![&data[..]; nplanes]
        } else {
            data.chunks(plane_size).collect()
        };
        self.target.image_data(&planes, 0, bpp, height)
    }

    // ---- drawing

    fn active_clip(&self) -> Option<&ClipList> {
        if self.st.clip_enabled { self.clip.as_ref() } else { None }
    }
    /// Visible parts of `r` within the band
    fn visible(&self, r: IntRect) -> Vec<IntRect> {
        let r = match r.intersect(&self.target.get_clipping_box()) {
            Some(r) => r,
            None => return vec![],
        };
        match self.active_clip() {
            Some(c) => c.intersections(&r),
            None => vec![r],
        }
    }
    fn rect(&self) -> IntRect {
        let r = self.st.rect;
        IntRect::from_xywh(r.x, r.y, r.width, r.height)
    }
    fn fill_rect(&mut self) -> Result<()> {
        let r = self.rect();
        let color = self.st.colors[1];
        if let Some(acc) = self.accum.as_mut() {
            return acc.fill_rectangle(r, color);
        }
        for piece in self.visible(r) {
            if self.st.lop_enabled {
                self.target.strip_copy_rop(piece, None, [color, color], self.st.tile_phase, self.st.lop)?;
            } else {
                self.target.fill_rectangle(piece, color)?;
            }
        }
        Ok(())
    }
    fn tile_rect(&mut self) -> Result<()> {
        let tile = self.tiles.bitmap(self.st.tile_index as usize)?;
        let [c0, c1] = self.st.tile_colors;
        for piece in self.visible(self.rect()) {
            if self.st.lop_enabled {
                self.target.strip_copy_rop(piece, Some(&tile), [c0, c1], self.st.tile_phase, self.st.lop)?;
            } else {
                self.target.strip_tile_rectangle(&tile, piece, c0, c1, self.st.tile_phase)?;
            }
        }
        Ok(())
    }
    /// Geometry and bits of a copy command: from the current tile, or
    /// inline at `depth` bits per pixel
    fn copy_source<R: Read>(&mut self, flags: u8, depth: usize, src: &mut BufferedSource<R>)
                            -> Result<(IntRect, Vec<u8>, usize, usize)> {
        if flags & COPY_USE_TILE != 0 {
            let x = src.get_iw()?;
            let y = src.get_iw()?;
            let tile = self.tiles.bitmap(self.st.tile_index as usize)?;
            let rect = IntRect::from_xywh(x, y, tile.width() as i32, tile.height() as i32);
            let raster = tile.raster();
            return Ok((rect, tile.data, 0, raster));
        }
        let compression = Compression::from_code(flags & 3)?;
        let x = src.get_iw()?;
        let y = src.get_iw()?;
        let w = src.get_w()?;
        let h = src.get_w()?;
        let data_x = std::mem::replace(&mut self.data_x, 0);
        let raster = short_raster((data_x + w as usize) * depth);
        let size = raster * h as usize;
        if size > self.cfg.cbuf_size {
            return Err(ClistError::BitmapTooLarge { size, limit: self.cfg.cbuf_size });
        }
        let data = read_bits(src, compression, raster, h as usize)?;
        Ok((IntRect::from_xywh(x, y, w as i32, h as i32), data, data_x, raster))
    }
    fn copy_mono<R: Read>(&mut self, flags: u8, src: &mut BufferedSource<R>) -> Result<()> {
        let (rect, data, data_x, raster) = self.copy_source(flags, 1, src)?;
        self.st.rect = CmdRect::new(rect.x1, rect.y1, rect.width(), rect.height());
        if flags & COPY_HT_COLOR != 0 {
            let tile = self.tiles.bitmap(self.st.tile_index as usize)?;
            let color = DrawingColor::Halftone { tile, colors: self.st.tile_colors, phase: self.st.tile_phase };
            let clip = self.active_clip().cloned();
            let bits = Bitmap::new(&data, data_x, raster);
            return self.target.fill_mask(bits, rect, &color, 1, self.st.lop, clip.as_ref());
        }
        let [c0, c1] = self.st.colors;
        for piece in self.visible(rect) {
            let bits = sub_bitmap(&data, data_x, raster, &rect, &piece);
            self.target.copy_mono(bits, piece, c0, c1)?;
        }
        Ok(())
    }
    fn copy_color_alpha<R: Read>(&mut self, flags: u8, src: &mut BufferedSource<R>) -> Result<()> {
        let depth = if self.st.color_is_alpha { src.get_u8()? } else { self.depth };
        if depth == 0 || depth > 32 {
            return Err(ClistError::malformed(format!("copy depth {}", depth)));
        }
        let (rect, data, data_x, raster) = self.copy_source(flags, depth as usize, src)?;
        self.st.rect = CmdRect::new(rect.x1, rect.y1, rect.width(), rect.height());
        let color = self.st.colors[1];
        for piece in self.visible(rect) {
            let bits = sub_bitmap(&data, data_x, raster, &rect, &piece);
            if self.st.color_is_alpha {
                self.target.copy_alpha(bits, piece, color, depth)?;
            } else {
                self.target.copy_color(bits, piece)?;
            }
        }
        Ok(())
    }

    // ---- paths

    fn segment<R: Read>(&mut self, s: SegmentOp, src: &mut BufferedSource<R>) -> Result<()> {
        let v = codec::get_segment_operands(src, s.num_operands())?;
        if !self.in_path {
            // A path starts at the last rectangle's origin
            self.p = FixedPoint::new(int2fixed(self.st.rect.x), int2fixed(self.st.rect.y));
            self.start = self.p;
            self.in_path = true;
        }
        let notes = self.notes;
        let d = widen(&v);
        match s {
            SegmentOp::RMoveTo => self.rmoveto(d[0], d[1])?,
            SegmentOp::RLineTo => self.rlineto(d[0], d[1], notes)?,
            SegmentOp::HLineTo => self.rlineto(d[0], 0, notes)?,
            SegmentOp::VLineTo => self.rlineto(0, d[0], notes)?,
            SegmentOp::RMLineTo => {
                self.rmoveto(d[0], d[1])?;
                self.rlineto(d[2], d[3], notes)?;
            },
            SegmentOp::RM2LineTo => {
                self.rmoveto(d[0], d[1])?;
                self.rlineto(d[2], d[3], notes)?;
                self.rlineto(d[4], d[5], notes)?;
            },
            SegmentOp::RM3LineTo => {
                self.rmoveto(d[0], d[1])?;
                self.rlineto(d[2], d[3], notes)?;
                self.rlineto(d[4], d[5], notes)?;
                self.rlineto(-d[2], -d[3], notes)?;
            },
            SegmentOp::ClosePath => {
                self.path.close_polygon();
                self.p = self.start;
            },
            _ => {
                let c = curve_offsets(s, &v);
                self.ensure_current();
                let p = self.p;
                let c1 = offset_point(p, c[0], c[1])?;
                let c2 = offset_point(p, c[2], c[3])?;
                let end = offset_point(p, c[4], c[5])?;
                self.path.curve_to_notes(c1, c2, end, notes);
                self.p = end;
            },
        }
        Ok(())
    }
    fn rmoveto(&mut self, dx: i64, dy: i64) -> Result<()> {
        self.p = offset_point(self.p, dx, dy)?;
        self.start = self.p;
        self.path.move_to(self.p.x, self.p.y);
        Ok(())
    }
    /// Lines drawn before any move start from the pen position
    fn ensure_current(&mut self) {
        if self.path.current_point().is_none() {
            self.path.move_to(self.p.x, self.p.y);
            self.start = self.p;
        }
    }
    fn rlineto(&mut self, dx: i64, dy: i64, notes: SegmentNotes) -> Result<()> {
        self.ensure_current();
        self.p = offset_point(self.p, dx, dy)?;
        self.path.line_to_notes(self.p.x, self.p.y, notes);
        Ok(())
    }
    fn drawing_color(&self, dc: DcType) -> Result<DrawingColor> {
        Ok(match dc {
            DcType::Pure => DrawingColor::Pure(self.st.colors[1]),
            DcType::Halftone => DrawingColor::Halftone {
                tile: self.tiles.bitmap(self.st.tile_index as usize)?,
                colors: self.st.tile_colors,
                phase: self.st.tile_phase,
            },
            DcType::Colored => self.colored.clone()
                .ok_or_else(|| ClistError::malformed("colored halftone before set_color"))?,
        })
    }
    fn draw_path(&mut self, op: PathOp) -> Result<()> {
        self.imager.log_op = self.st.lop;
        let clip = self.active_clip().cloned();
        let path = std::mem::replace(&mut self.path, Path::new());
        let required = if let PathOp::Stroke(_) = op { Known::STROKE_ALL } else { Known::FILL_ALL };
        let missing = self.st.unknown(required);
        if !missing.is_empty() {
            debug!(?missing, "path drawn with default imager state");
        }
        match op {
            PathOp::Fill(dc) | PathOp::EoFill(dc) => {
                let rule = if let PathOp::Fill(_) = op { FillRule::NonZero } else { FillRule::EvenOdd };
                let color = self.drawing_color(dc)?;
                self.target.fill_path(&self.imager, &path, rule, &color, clip.as_ref())?;
            },
            PathOp::Stroke(dc) => {
                let color = self.drawing_color(dc)?;
                self.target.stroke_path(&self.imager, &path, &color, clip.as_ref())?;
            },
        }
        if self.in_path {
            self.st.rect.x = fixed2int(self.p.x);
            self.st.rect.y = fixed2int(self.p.y);
        }
        self.in_path = false;
        self.notes = SN_NONE;
        Ok(())
    }
}

/// Bits of `piece` within a bitmap covering `rect`
fn sub_bitmap<'d>(data: &'d [u8], data_x: usize, raster: usize, rect: &IntRect, piece: &IntRect) -> Bitmap<'d> {
    let dy = (piece.y1 - rect.y1) as usize;
    let dx = (piece.x1 - rect.x1) as usize;
    Bitmap::new(&data[(dy * raster).min(data.len()) ..], data_x + dx, raster)
}

fn widen(v: &[Fixed; 6]) -> [i64; 6] {
    let mut w = [0i64; 6];
    for (w, &v) in w.iter_mut().zip(v.iter()) {
        *w = i64::from(v);
    }
    w
}

/// `p` moved by a decoded offset, which must stay a fixed coordinate
fn offset_point(p: FixedPoint, dx: i64, dy: i64) -> Result<FixedPoint> {
    match (Fixed::try_from(i64::from(p.x) + dx), Fixed::try_from(i64::from(p.y) + dy)) {
        (Ok(x), Ok(y)) => Ok(FixedPoint::new(x, y)),
        _ => Err(ClistError::malformed(format!("path offset ({}, {}) from ({}, {}) overflows", dx, dy, p.x, p.y))),
    }
}

/// Control and end points of a curve command as offsets from the current
/// point: c1 at [0, 1], c2 at [2, 3], end at [4, 5]
fn curve_offsets(s: SegmentOp, v: &[Fixed; 6]) -> [i64; 6] {
    let [a, b, c, d, e, f] = widen(v);
    match s {
        SegmentOp::HVCurveTo => [a, 0, a + b, c, a + b, c + d],
        SegmentOp::HQCurveTo => {
            if (a ^ b) < 0 {
                [a, 0, a - b, b, a - b, b - a]
            } else {
                [a, 0, a + b, b, a + b, b + a]
            }
        },
        SegmentOp::VHCurveTo => [0, a, b, a + c, b + d, a + c],
        SegmentOp::VQCurveTo => {
            if (a ^ b) < 0 {
                [0, a, b, a - b, b - a, a - b]
            } else {
                [0, a, b, a + b, b + a, a + b]
            }
        },
        SegmentOp::NRCurveTo => [0, 0, a, b, a + c, b + d],
        SegmentOp::RNCurveTo => [a, b, a + c, b + d, a + c, b + d],
        _ => [a, b, a + c, b + d, a + c + e, b + d + f],
    }
}
