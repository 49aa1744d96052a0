//! Command list writer
//!
//! Drawing intents become per-band command batches. A batch is built
//! against a copy of the band's [`BandState`] and committed only once all of
//! its bytes are in the buffer, so a failed write leaves nothing behind and
//! can be repeated.
//!
//! Low memory is handled in two stages:
//!   1. Retry: the [`MemoryHandler`] waits for the renderer to free memory
//!      and the same band operation is tried again.
//!   2. FlushAndRetry: the partial page is closed, handed to the renderer
//!      and the store restarts empty with every band state forgotten.
//!
//! Band operations only see a [`CmdWriter`], which has no way back to the
//! recovery loop, so recovery cannot nest.

use tracing::{debug, error, trace, warn};

use crate::codec::{self, put_f32, put_i32, put_iw, put_u16, put_u32, put_w, MAX_DASH};
use crate::clip::ClipPath;
use crate::config::ClistConfig;
use crate::device::{ColorSpace, DrawingColor};
use crate::error::{ClistError, Recovery, Result};
use crate::halftone::{DeviceHalftone, HtOrder, TransferMap, MAX_TRANSFER_MAPS, TRANSFER_MAP_SIZE};
use crate::opcodes::*;
use crate::state::{BandRange, BandState, CmdRect, ColorIndex, ImagerState, Known, LogicalOp, LOP_DEFAULT};
use crate::store::{BandStore, StoreStream};
use crate::tile_cache::{TileBitmap, TileCache, TileSize};

/// Levels and bits per set_ht_data command
const HT_LEVELS_PER_CMD: usize = 24;
const HT_BITS_PER_CMD: usize = 12;

/// Memory policy consulted by the writer
///
/// The default accepts everything and never frees anything.
pub trait MemoryHandler<S> {
    /// Called before each batch of `requested` bytes is added
    fn reserve(&mut self, _requested: usize) -> Result<()> {
        Ok(())
    }
    /// Wait for the renderer to release memory, false if nothing was freed
    fn free_up(&mut self) -> bool {
        false
    }
    /// Render the partial page just closed in `store` before it is emptied
    fn render_partial_page(&mut self, _store: &mut BandStore<S>) -> Result<()> {
        Ok(())
    }
}

/// Handler without a memory limit
#[derive(Debug,Default)]
pub struct NoMemoryLimit;

impl<S> MemoryHandler<S> for NoMemoryLimit {}

/// Command list a batch is added to
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub(crate) enum ListId {
    Band(usize),
    Range(BandRange),
}

/// Commands added to one list as a unit
#[derive(Debug,Default)]
pub(crate) struct CmdBatch {
    bytes: Vec<u8>,
    ends: Vec<usize>,
}

impl CmdBatch {
    pub fn new() -> Self {
        Self::default()
    }
    /// Append one command
    pub fn cmd<F: FnOnce(&mut Vec<u8>)>(&mut self, f: F) {
        f(&mut self.bytes);
        if self.bytes.len() > self.ends.last().copied().unwrap_or(0) {
            self.ends.push(self.bytes.len());
        }
    }
    pub fn try_cmd<F: FnOnce(&mut Vec<u8>) -> Result<()>>(&mut self, f: F) -> Result<()> {
        let mark = self.bytes.len();
        if let Err(e) = f(&mut self.bytes) {
            self.bytes.truncate(mark);
            return Err(e);
        }
        if self.bytes.len() > mark {
            self.ends.push(self.bytes.len());
        }
        Ok(())
    }
    pub fn len(&self) -> usize {
        self.bytes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
    pub fn commands(&self) -> impl Iterator<Item=&[u8]> {
        let mut start = 0;
        self.ends.iter().map(move |&end| {
            let s = &self.bytes[start .. end];
            start = end;
            s
        })
    }
}

/// Image between begin_image and end_image
#[derive(Debug,Clone)]
pub(crate) struct ImageEnum {
    pub header: crate::device::ImageHeader,
    pub color_space: ColorSpace,
    pub color: DrawingColor,
    pub clip: Option<ClipPath>,
    pub state: ImagerState,
    /// None when the image misses the page
    pub bands: Option<BandRange>,
    /// Bands that have seen begin_image
    pub started: crate::tile_cache::BandMask,
    pub rows_sent: u32,
}

/// Everything a band operation may touch
pub(crate) struct WriterCore<S> {
    pub config: ClistConfig,
    pub store: BandStore<S>,
    pub states: Vec<BandState>,
    lists: Vec<Vec<u8>>,
    range_list: Vec<u8>,
    range: BandRange,
    /// List the last command went to
    ccl: Option<ListId>,
    pending: usize,
    pub tiles: TileCache,
    /// Tile geometry last announced to all bands
    pub tile_size: Option<TileSize>,
    pub imager: ImagerState,
    pub clip_id: Option<u64>,
    pub color_space: ColorSpace,
    pub params: Option<Vec<u8>>,
    pub halftone: Option<DeviceHalftone>,
    pub transfers: Vec<Option<TransferMap>>,
    pub image: Option<ImageEnum>,
}

impl<S: StoreStream> WriterCore<S> {
    fn new(config: ClistConfig, store: BandStore<S>) -> Self {
        let nbands = config.nbands();
        Self {
            states: vec![BandState::new(); nbands],
            lists: vec![vec![]; nbands],
            range_list: vec![],
            range: BandRange::all(nbands),
            ccl: None,
            pending: 0,
            tiles: TileCache::new(config.tile_cache_size, config.tile_hash_size, nbands),
            tile_size: None,
            imager: ImagerState::new(),
            clip_id: None,
            color_space: ColorSpace::default(),
            params: None,
            halftone: None,
            transfers: vec![None; MAX_TRANSFER_MAPS],
            image: None,
            config,
            store,
        }
    }
    fn append(&mut self, list: ListId, batch: &CmdBatch) -> Result<()> {
        // Nothing of a batch is appended unless all of it fits
        if let Some(size) = batch.commands().map(|c| c.len()).max().filter(|&n| n > self.config.buffer_size) {
            return Err(ClistError::CommandTooLarge { size, limit: self.config.buffer_size });
        }
        for cmd in batch.commands() {
            if let ListId::Range(r) = list {
                // Range commands must follow everything already buffered
                if self.ccl.is_some() && self.ccl != Some(list) {
                    self.flush(END_RUN)?;
                }
                self.range = r;
            }
            if self.pending + cmd.len() > self.config.buffer_size {
                self.flush(END_RUN)?;
                if let ListId::Range(r) = list {
                    self.range = r;
                }
            }
            match list {
                ListId::Band(b) => self.lists[b].extend_from_slice(cmd),
                ListId::Range(_) => self.range_list.extend_from_slice(cmd),
            }
            self.pending += cmd.len();
            self.ccl = Some(list);
        }
        Ok(())
    }
    /// Write buffered commands to the store
    ///
    /// Bands with nothing buffered get a record only for a non-default
    /// `end_op`.
    pub fn flush(&mut self, end_op: u8) -> Result<()> {
        let pending = self.pending;
        if !self.range_list.is_empty() {
            self.store.write_run(self.range, &self.range_list, END_RUN)?;
            self.range_list.clear();
        }
        for band in 0 .. self.lists.len() {
            if !self.lists[band].is_empty() || end_op != END_RUN {
                self.store.write_run(BandRange::single(band), &self.lists[band], end_op)?;
                self.lists[band].clear();
            }
        }
        self.pending = 0;
        self.ccl = None;
        debug!(pending, end_op, stored = self.store.command_len(), "flushed command buffer");
        Ok(())
    }
    fn close_page(&mut self) -> Result<()> {
        self.flush(END_PAGE)?;
        self.store.write_sentinel()
    }
    /// Forget every band's state and the tile cache
    fn reset_page(&mut self) {
        self.states.iter_mut().for_each(|s| *s = BandState::new());
        self.lists.iter_mut().for_each(|l| l.clear());
        self.range_list.clear();
        self.pending = 0;
        self.ccl = None;
        self.tiles.reset();
        self.tile_size = None;
        self.clip_id = None;
        if let Some(im) = self.image.as_mut() {
            im.started.clear();
        }
    }
    /// Clear known bits for every band
    pub fn clear_known(&mut self, bits: Known) {
        if bits.is_empty() {
            return;
        }
        self.states.iter_mut().for_each(|s| s.clear_known(bits));
    }
    /// Copy fields selected by `fields` from `ps`, forgetting those that changed
    pub fn update_imager(&mut self, ps: &ImagerState, fields: Known) -> Result<()> {
        let old = &mut self.imager;
        let mut changed = Known::empty();
        if fields.contains(Known::FLATNESS) && old.flatness != ps.flatness {
            old.flatness = ps.flatness;
            changed |= Known::FLATNESS;
        }
        if fields.contains(Known::FILL_ADJUST) && old.fill_adjust != ps.fill_adjust {
            old.fill_adjust = ps.fill_adjust;
            changed |= Known::FILL_ADJUST;
        }
        if fields.contains(Known::CTM) && old.ctm != ps.ctm {
            old.ctm = ps.ctm;
            changed |= Known::CTM;
        }
        if fields.contains(Known::LINE_WIDTH) && old.line_width != ps.line_width {
            old.line_width = ps.line_width;
            changed |= Known::LINE_WIDTH;
        }
        if fields.contains(Known::MITER_LIMIT) && old.miter_limit != ps.miter_limit {
            old.miter_limit = ps.miter_limit;
            changed |= Known::MITER_LIMIT;
        }
        if fields.contains(Known::MISC0) && (old.cap != ps.cap || old.join != ps.join) {
            old.cap = ps.cap;
            old.join = ps.join;
            changed |= Known::MISC0;
        }
        if fields.contains(Known::MISC1) && (old.accurate_curves != ps.accurate_curves
            || old.overprint != ps.overprint || old.stroke_adjust != ps.stroke_adjust)
        {
            old.accurate_curves = ps.accurate_curves;
            old.overprint = ps.overprint;
            old.stroke_adjust = ps.stroke_adjust;
            changed |= Known::MISC1;
        }
        if fields.contains(Known::DASH) && old.dash != ps.dash {
            if ps.dash.pattern.len() > MAX_DASH {
                return Err(ClistError::malformed(format!("dash pattern of {} elements, at most {}",
                                                         ps.dash.pattern.len(), MAX_DASH)));
            }
            old.dash = ps.dash.clone();
            changed |= Known::DASH;
        }
        if fields.contains(Known::ALPHA) && old.alpha != ps.alpha {
            old.alpha = ps.alpha;
            changed |= Known::ALPHA;
        }
        old.log_op = ps.log_op;
        if !changed.is_empty() {
            trace!(?changed, "imager state changed");
        }
        self.clear_known(changed);
        Ok(())
    }
    /// Make `clip` the current clip, forgetting the old one in every band
    pub fn check_clip(&mut self, clip: Option<&ClipPath>) {
        if let Some(c) = clip {
            if self.clip_id != Some(c.id) {
                self.clip_id = Some(c.id);
                self.clear_known(Known::CLIP_PATH);
            }
        }
    }
}

/// Imager state fields in the order they are written
const IMAGER_FIELDS: [Known; 10] = [
    Known::FLATNESS, Known::FILL_ADJUST, Known::CTM, Known::LINE_WIDTH, Known::MITER_LIMIT,
    Known::MISC0, Known::MISC1, Known::DASH, Known::ALPHA, Known::COLOR_SPACE,
];

fn put_imager_field(bit: Known, ps: &ImagerState, cs: &ColorSpace, o: &mut Vec<u8>) {
    if bit == Known::FLATNESS {
        o.push(ExtOp::SetFlatness.code());
        put_f32(ps.flatness, o);
    } else if bit == Known::FILL_ADJUST {
        o.push(ExtOp::SetFillAdjust.code());
        put_i32(ps.fill_adjust.x, o);
        put_i32(ps.fill_adjust.y, o);
    } else if bit == Known::CTM {
        o.push(ExtOp::SetCtm.code());
        codec::put_matrix(&ps.ctm, o);
    } else if bit == Known::LINE_WIDTH {
        o.push(ExtOp::SetLineWidth.code());
        put_f32(ps.line_width, o);
    } else if bit == Known::MITER_LIMIT {
        o.push(ExtOp::SetMiterLimit.code());
        put_f32(ps.miter_limit, o);
    } else if bit == Known::MISC0 {
        o.push(ExtOp::SetMisc2.code());
        o.push(MISC2_CAP_JOIN | (ps.cap.bits() << 3) | ps.join.bits());
    } else if bit == Known::MISC1 {
        o.push(ExtOp::SetMisc2.code());
        o.push(MISC2_AC_OP_SA
               | if ps.accurate_curves { 4 } else { 0 }
               | if ps.overprint { 2 } else { 0 }
               | if ps.stroke_adjust { 1 } else { 0 });
    } else if bit == Known::DASH {
        let d = &ps.dash;
        o.push(ExtOp::SetDash.code());
        o.push(d.pattern.len() as u8
               | if d.adapt { 0x80 } else { 0 }
               | if d.dot_length_absolute { 0x40 } else { 0 });
        put_f32(d.dot_length, o);
        put_f32(d.offset, o);
        for &v in &d.pattern {
            put_f32(v, o);
        }
    } else if bit == Known::ALPHA {
        o.push(ExtOp::SetMisc2.code());
        o.push(MISC2_ALPHA);
        put_u16(ps.alpha, o);
    } else if bit == Known::COLOR_SPACE {
        o.push(ExtOp::SetColorSpace.code());
        o.push(cs.code());
        if let Some(ix) = cs.indexed {
            put_w(ix.hival, o);
        }
    }
}

/// Delta-coded color change for slot 0 or 1
pub(crate) fn put_color_cmd(slot: usize, color: ColorIndex, prev: ColorIndex, depth: u8, o: &mut Vec<u8>) {
    let (op, delta2) = if slot == 0 { (SET_COLOR0, DELTA2_COLOR0) } else { (SET_COLOR1, DELTA2_COLOR1) };
    codec::put_color(op, delta2, color, prev, depth, o);
}

fn put_tile_size(size: &TileSize, o: &mut Vec<u8>) {
    let mut bd = (size.depth - 1) & 31;
    if size.x_reps > 1 { bd |= 0x20; }
    if size.y_reps > 1 { bd |= 0x40; }
    if size.rep_shift != 0 { bd |= 0x80; }
    o.push(SET_TILE_SIZE);
    o.push(bd);
    put_w(size.rep_width, o);
    put_w(size.rep_height, o);
    if size.x_reps > 1 { put_w(size.x_reps, o); }
    if size.y_reps > 1 { put_w(size.y_reps, o); }
    if size.rep_shift != 0 { put_w(size.rep_shift, o); }
}

fn put_ht_order(index: usize, cname: u32, order: &HtOrder, batch: &mut CmdBatch) {
    batch.cmd(|o| {
        o.push(SET_HT_ORDER);
        put_w(index as u32, o);
        if index > 0 {
            put_w(cname, o);
        }
        for &v in &[order.width, order.height, order.raster, order.shift, order.num_levels, order.num_bits] {
            put_w(v, o);
        }
    });
    for chunk in order.levels.chunks(HT_LEVELS_PER_CMD) {
        batch.cmd(|o| {
            o.push(SET_HT_DATA);
            o.push(chunk.len() as u8);
            chunk.iter().for_each(|&l| put_u32(l, o));
        });
    }
    for chunk in order.bits.chunks(HT_BITS_PER_CMD) {
        batch.cmd(|o| {
            o.push(SET_HT_DATA);
            o.push(chunk.len() as u8);
            for b in chunk {
                put_u32(b.offset, o);
                put_u32(b.mask, o);
            }
        });
    }
}

/// Band operations, the only view of the writer inside a recovery scope
pub(crate) struct CmdWriter<'a, S> {
    pub core: &'a mut WriterCore<S>,
    memory: &'a mut dyn MemoryHandler<S>,
}

impl<'a, S: StoreStream> CmdWriter<'a, S> {
    pub fn depth(&self) -> u8 {
        self.core.config.depth
    }
    /// Reserve memory for the batch and add it to `list`
    pub fn put_batch(&mut self, list: ListId, batch: &CmdBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.memory.reserve(batch.len())?;
        self.core.append(list, batch)
    }
    pub fn put_all_bands(&mut self, batch: &CmdBatch) -> Result<()> {
        let all = self.core.config.all_bands();
        self.put_batch(ListId::Range(all), batch)
    }
    /// Imager state fields from `required` the band has not seen
    pub fn write_unknown(&self, st: &mut BandState, required: Known, batch: &mut CmdBatch) {
        let missing = st.unknown(required) - Known::CLIP_PATH;
        for &bit in IMAGER_FIELDS.iter() {
            if missing.contains(bit) {
                batch.cmd(|o| put_imager_field(bit, &self.core.imager, &self.core.color_space, o));
            }
        }
        st.known |= missing;
    }
    /// Send the clip to the band if needed and switch clipping on or off
    pub fn write_clip(&self, band: usize, st: &mut BandState, clip: Option<&ClipPath>, batch: &mut CmdBatch) {
        match clip {
            Some(c) => {
                if !st.known.contains(Known::CLIP_PATH) {
                    let area = self.core.config.band_rect(band);
                    batch.cmd(|o| o.push(ExtOp::BeginClip.code()));
                    for r in c.rects_in_rows(area.y1, area.y2) {
                        let rect = CmdRect::new(r.x1, r.y1, r.width(), r.height());
                        batch.cmd(|o| codec::put_rect(FILL_RECT, &rect, &st.rect, o));
                        st.rect = rect;
                    }
                    batch.cmd(|o| {
                        o.push(ExtOp::EndClip.code());
                        o.push(c.outside as u8);
                    });
                    st.known |= Known::CLIP_PATH;
                }
                if !st.clip_enabled {
                    batch.cmd(|o| o.push(ExtOp::EnableClip.code()));
                    st.clip_enabled = true;
                }
            },
            None => {
                if st.clip_enabled {
                    batch.cmd(|o| o.push(ExtOp::DisableClip.code()));
                    st.clip_enabled = false;
                }
            },
        }
    }
    /// Logical operation, enabled for rectangle fills when `enable`
    pub fn put_lop(&self, st: &mut BandState, lop: LogicalOp, enable: bool, batch: &mut CmdBatch) {
        if lop != st.lop {
            batch.cmd(|o| {
                o.push(SET_MISC);
                o.push(MISC_LOP | (lop & 0x3f) as u8);
                put_w(lop >> 6, o);
            });
            st.lop = lop;
        }
        let on = enable && lop != LOP_DEFAULT;
        if on != st.lop_enabled {
            batch.cmd(|o| o.push(if on { ENABLE_LOP } else { DISABLE_LOP }));
            st.lop_enabled = on;
        }
    }
    pub fn put_color1(&self, st: &mut BandState, color: ColorIndex, batch: &mut CmdBatch) {
        if st.colors[1] != color {
            let depth = self.depth();
            batch.cmd(|o| put_color_cmd(1, color, st.colors[1], depth, o));
            st.colors[1] = color;
        }
    }
    pub fn put_colors(&self, st: &mut BandState, colors: [ColorIndex; 2], batch: &mut CmdBatch) {
        let depth = self.depth();
        for slot in 0 .. 2 {
            if st.colors[slot] != colors[slot] {
                batch.cmd(|o| put_color_cmd(slot, colors[slot], st.colors[slot], depth, o));
                st.colors[slot] = colors[slot];
            }
        }
    }
    pub fn put_tile_colors(&self, st: &mut BandState, colors: [ColorIndex; 2], batch: &mut CmdBatch) {
        let depth = self.depth();
        for slot in 0 .. 2 {
            if st.tile_colors[slot] != colors[slot] {
                batch.cmd(|o| {
                    o.push(SET_TILE_COLOR);
                    put_color_cmd(slot, colors[slot], st.tile_colors[slot], depth, o);
                });
                st.tile_colors[slot] = colors[slot];
            }
        }
    }
    pub fn put_tile_phase(&self, st: &mut BandState, phase: (i32, i32), batch: &mut CmdBatch) {
        if st.tile_phase != phase {
            batch.cmd(|o| {
                o.push(SET_TILE_PHASE);
                put_iw(phase.0, o);
                put_iw(phase.1, o);
            });
            st.tile_phase = phase;
        }
    }
    /// Switch copy commands between color and alpha
    pub fn put_copy_mode(&self, st: &mut BandState, alpha: bool, batch: &mut CmdBatch) {
        if st.color_is_alpha != alpha {
            batch.cmd(|o| o.push(if alpha { SET_COPY_ALPHA } else { SET_COPY_COLOR }));
            st.color_is_alpha = alpha;
        }
    }
    /// Select a cache slot as the band's current tile
    pub fn put_tile_index(&self, st: &mut BandState, index: usize, batch: &mut CmdBatch) {
        if st.tile_index as usize != index {
            let delta = index as i32 - i32::from(st.tile_index);
            batch.cmd(|o| {
                if delta >= -8 && delta < 8 {
                    o.push(DELTA_TILE_INDEX + (delta + 8) as u8);
                } else {
                    o.push(SET_TILE_INDEX + (index >> 8) as u8);
                    o.push(index as u8);
                }
            });
            st.tile_index = index as u16;
        }
    }
    /// Make `tile` the band's current tile
    ///
    /// Returns the slot index and whether the band is receiving its bits,
    /// in which case the caller marks the slot once the batch is in.
    pub fn select_tile(&mut self, band: usize, st: &mut BandState, tile: &TileBitmap,
                       batch: &mut CmdBatch) -> Result<(usize, bool)> {
        let index = match self.core.tiles.find(tile.id) {
            Some(i) => i,
            None => {
                let rep = tile.replicated();
                self.core.tiles.lookup_or_add(rep.id, rep.size, &rep.data)?.index()
            },
        };
        let slot = self.core.tiles.entry(index)
            .map(|e| e.slot)
            .ok_or_else(|| ClistError::malformed(format!("tile slot {} vanished", index)))?;
        st.tile_id = Some(tile.id);
        if self.core.tiles.band_has(index, band) {
            self.put_tile_index(st, index, batch);
            return Ok((index, false));
        }
        if self.core.tile_size != Some(slot.size) {
            let mut b = CmdBatch::new();
            b.cmd(|o| put_tile_size(&slot.size, o));
            self.put_all_bands(&b)?;
            self.core.tile_size = Some(slot.size);
        }
        let bits = self.core.tiles.bits(index)
            .ok_or_else(|| ClistError::malformed(format!("tile slot {} has no bits", index)))?;
        batch.cmd(|o| {
            o.push(SET_TILE_BITS);
            put_w(index as u32, o);
            put_w(slot.offset as u32, o);
            o.extend_from_slice(bits);
        });
        st.tile_index = index as u16;
        Ok((index, true))
    }
    /// Colored halftone as a set_color command
    pub fn put_colored(&self, bases: &[u8; 4], levels: &[u32], batch: &mut CmdBatch) -> Result<()> {
        let ncomp = self.core.config.num_components();
        if levels.len() != ncomp {
            return Err(ClistError::malformed(format!("colored halftone with {} levels for {} components",
                                                     levels.len(), ncomp)));
        }
        let mut word = 0u32;
        for (i, &b) in bases.iter().enumerate() {
            word |= u32::from(b & 0x1f) << ((3 - i) * 5);
        }
        batch.cmd(|o| {
            o.push(ExtOp::SetColor.code());
            if word & 0xf7bde != 0 {
                o.push(0x10 + (word >> 16) as u8);
                o.push((word >> 8) as u8);
                o.push(word as u8);
            } else {
                o.push((bases[0] << 3) | (bases[1] << 2) | (bases[2] << 1) | bases[3]);
            }
            levels.iter().for_each(|&l| put_w(l, o));
        });
        Ok(())
    }
    /// Set up the band for drawing with `color`
    ///
    /// Returns how the draw command refers to the color and the tile slot to
    /// mark once the batch is in.
    pub fn put_drawing_color(&mut self, band: usize, st: &mut BandState, color: &DrawingColor,
                             batch: &mut CmdBatch) -> Result<(DcType, Option<usize>)> {
        match color {
            DrawingColor::Pure(c) => {
                self.put_color1(st, *c, batch);
                Ok((DcType::Pure, None))
            },
            DrawingColor::Halftone { tile, colors, phase } => {
                let (index, sent) = self.select_tile(band, st, tile, batch)?;
                self.put_tile_colors(st, *colors, batch);
                self.put_tile_phase(st, *phase, batch);
                Ok((DcType::Halftone, if sent { Some(index) } else { None }))
            },
            DrawingColor::Colored { bases, levels } => {
                self.put_colored(bases, levels, batch)?;
                Ok((DcType::Colored, None))
            },
        }
    }
    /// Commit a band batch: add it, then keep the new band state
    pub fn commit(&mut self, band: usize, st: BandState, batch: &CmdBatch, marks: &[usize]) -> Result<()> {
        self.put_batch(ListId::Band(band), batch)?;
        self.core.states[band] = st;
        for &m in marks {
            self.core.tiles.mark_band(m, band);
        }
        Ok(())
    }
    pub fn put_params(&mut self, params: &[u8]) -> Result<()> {
        let mut b = CmdBatch::new();
        b.cmd(|o| {
            o.push(ExtOp::PutParams.code());
            put_u32(params.len() as u32, o);
            o.extend_from_slice(params);
        });
        self.put_all_bands(&b)
    }
    pub fn put_halftone(&mut self, ht: &DeviceHalftone) -> Result<()> {
        let mut b = CmdBatch::new();
        b.cmd(|o| {
            o.push(SET_MISC);
            o.push(MISC_HALFTONE | (ht.ht_type & 0x3f));
            put_w(ht.components.len() as u32, o);
        });
        // The default order goes last, its completion installs the halftone
        for (i, c) in ht.components.iter().enumerate().rev() {
            put_ht_order(i + 1, c.cname, &c.order, &mut b);
        }
        put_ht_order(0, 0, &ht.order, &mut b);
        self.put_all_bands(&b)
    }
    pub fn put_transfer(&mut self, index: usize, map: &TransferMap) -> Result<()> {
        let mut b = CmdBatch::new();
        b.cmd(|o| {
            o.push(SET_MISC);
            match map {
                Some(values) => {
                    o.push(MISC_MAP | 0x20 | index as u8);
                    values.iter().for_each(|&v| put_u16(v, o));
                },
                None => o.push(MISC_MAP | index as u8),
            }
        });
        self.put_all_bands(&b)
    }
    /// Page-wide state lost by a flush recovery
    fn reput_page_state(&mut self) -> Result<()> {
        if let Some(p) = self.core.params.clone() {
            self.put_params(&p)?;
        }
        if let Some(ht) = self.core.halftone.clone() {
            self.put_halftone(&ht)?;
        }
        for (i, map) in self.core.transfers.clone().iter().enumerate() {
            if let Some(map) = map {
                self.put_transfer(i, map)?;
            }
        }
        Ok(())
    }
}

/// Writer half of the command list
pub struct ClistWriter<S: StoreStream> {
    pub(crate) core: WriterCore<S>,
    memory: Box<dyn MemoryHandler<S>>,
    permanent_error: bool,
}

impl<S: StoreStream> ClistWriter<S> {
    pub fn new(config: ClistConfig, store: BandStore<S>) -> Result<Self> {
        config.validate()?;
        debug!(nbands = config.nbands(), buffer = config.buffer_size, "open command list");
        Ok(Self {
            core: WriterCore::new(config, store),
            memory: Box::new(NoMemoryLimit),
            permanent_error: false,
        })
    }
    pub fn with_memory_handler(mut self, memory: Box<dyn MemoryHandler<S>>) -> Self {
        self.memory = memory;
        self
    }
    pub fn config(&self) -> &ClistConfig {
        &self.core.config
    }
    pub fn store_mut(&mut self) -> &mut BandStore<S> {
        &mut self.core.store
    }
    pub fn into_store(self) -> BandStore<S> {
        self.core.store
    }
    pub fn band_state(&self, band: usize) -> Option<&BandState> {
        self.core.states.get(band)
    }
    /// Imager state as last sent
    pub fn imager_state(&self) -> &ImagerState {
        &self.core.imager
    }
    pub fn tile_cache(&self) -> &TileCache {
        &self.core.tiles
    }
    /// Set by a failure the writer cannot recover from
    pub fn is_disabled(&self) -> bool {
        self.permanent_error
    }
    pub(crate) fn check(&self) -> Result<()> {
        if self.permanent_error {
            return Err(ClistError::PermanentError);
        }
        Ok(())
    }
    fn latch(&mut self, e: &ClistError) {
        error!(%e, "command list writer disabled");
        self.permanent_error = true;
    }
    /// Next step after a write ran out of memory
    fn next_recovery(&mut self, retries: u32, flushed: bool) -> Recovery {
        if retries < self.core.config.retry_budget && self.memory.free_up() {
            Recovery::Retry
        } else if !flushed {
            Recovery::FlushAndRetry
        } else {
            Recovery::Fatal
        }
    }
    /// Run a band operation under the low-memory protocol
    pub(crate) fn with_recovery<T, F>(&mut self, mut op: F) -> Result<T>
        where F: FnMut(&mut CmdWriter<S>) -> Result<T>
    {
        self.check()?;
        let mut retries = 0;
        let mut flushed = false;
        loop {
            let err = {
                let mut cw = CmdWriter { core: &mut self.core, memory: &mut *self.memory };
                match op(&mut cw) {
                    Ok(v) => return Ok(v),
                    Err(e) => e,
                }
            };
            if let ClistError::Io(_) = err {
                self.latch(&err);
                return Err(err);
            }
            if !err.is_retryable() {
                return Err(err);
            }
            match self.next_recovery(retries, flushed) {
                Recovery::Retry => {
                    retries += 1;
                    warn!(retries, %err, "retrying after memory was freed");
                },
                Recovery::FlushAndRetry => {
                    self.flush_recovery()?;
                    flushed = true;
                    retries = 0;
                },
                Recovery::Fatal => {
                    warn!(%err, "out of memory after flush recovery");
                    return Err(err);
                },
            }
        }
    }
    fn render_partial_page(&mut self) -> Result<()> {
        self.core.close_page()?;
        self.memory.render_partial_page(&mut self.core.store)?;
        self.core.store.truncate()
    }
    /// Close and render the partial page, then restart it empty
    fn flush_recovery(&mut self) -> Result<()> {
        warn!(stored = self.core.store.command_len(), "out of memory, flushing the partial page");
        if let Err(e) = self.render_partial_page() {
            self.latch(&e);
            return Err(e);
        }
        self.core.reset_page();
        let r = CmdWriter { core: &mut self.core, memory: &mut *self.memory }.reput_page_state();
        if let Err(e) = r {
            self.latch(&e);
            return Err(e);
        }
        debug!("page restarted after flush recovery");
        Ok(())
    }
    /// Add one encoded command to a band or a band range
    pub fn put_command(&mut self, bands: BandRange, cmd: &[u8]) -> Result<()> {
        let list = if bands.is_single() { ListId::Band(bands.min) } else { ListId::Range(bands) };
        if bands.max >= self.core.config.nbands() {
            return Err(ClistError::malformed(format!("band {} past the page", bands.max)));
        }
        let mut b = CmdBatch::new();
        b.cmd(|o| o.extend_from_slice(cmd));
        self.with_recovery(|cw| cw.put_batch(list, &b))
    }
    /// Write everything buffered to the store
    pub fn flush(&mut self) -> Result<()> {
        self.check()?;
        let r = self.core.flush(END_RUN);
        if let Err(e) = &r {
            self.latch(e);
        }
        r
    }
    /// Finish the page: every band gets an end_page run, then the sentinel
    pub fn end_page(&mut self) -> Result<()> {
        self.check()?;
        if self.core.image.is_some() {
            self.end_image()?;
        }
        let r = self.core.close_page();
        if let Err(e) = &r {
            self.latch(e);
            return r;
        }
        self.core.reset_page();
        Ok(())
    }
    /// Empty the store for a new page
    pub fn begin_page(&mut self) -> Result<()> {
        self.check()?;
        self.core.store.truncate()?;
        self.core.reset_page();
        let r = CmdWriter { core: &mut self.core, memory: &mut *self.memory }.reput_page_state();
        if let Err(e) = &r {
            self.latch(e);
        }
        r
    }
    /// Embedded parameter list, applied again after a flush recovery
    pub fn put_params(&mut self, params: &[u8]) -> Result<()> {
        self.with_recovery(|cw| cw.put_params(params))?;
        self.core.params = Some(params.to_vec());
        Ok(())
    }
    pub fn set_halftone(&mut self, ht: &DeviceHalftone) -> Result<()> {
        if self.core.halftone.as_ref() == Some(ht) {
            return Ok(());
        }
        self.core.halftone = Some(ht.clone());
        self.with_recovery(|cw| cw.put_halftone(ht))
    }
    pub fn set_transfer_map(&mut self, index: usize, map: TransferMap) -> Result<()> {
        if index >= MAX_TRANSFER_MAPS {
            return Err(ClistError::malformed(format!("transfer map index {}", index)));
        }
        if let Some(v) = &map {
            if v.len() != TRANSFER_MAP_SIZE {
                return Err(ClistError::malformed(format!("transfer map of {} entries", v.len())));
            }
        }
        if self.core.transfers[index].as_ref() == Some(&map) {
            return Ok(());
        }
        self.core.transfers[index] = Some(map.clone());
        self.with_recovery(|cw| cw.put_transfer(index, &map))
    }
    pub fn set_color_space(&mut self, cs: &ColorSpace) {
        if self.core.color_space != *cs {
            self.core.color_space = *cs;
            self.core.clear_known(Known::COLOR_SPACE);
        }
    }
    /// Logical operation used by rectangle, tile and mask intents
    pub fn set_logical_op(&mut self, lop: LogicalOp) {
        self.core.imager.log_op = lop;
    }
}
