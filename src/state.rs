//! Per-band state and imager state
//!
//! Both sides of the command list keep a [`BandState`] for every band:
//! the writer to suppress commands the band has already seen, the reader to
//! rebuild the values those commands set. [`Known`] records which imager
//! state fields have been sent to a band.

use bitflags::bitflags;

use crate::matrix::Matrix;
use crate::FixedPoint;

/// Device color value
pub type ColorIndex = u64;

/// Transparent / unset color
pub const NO_COLOR: ColorIndex = !0;

/// Identity of a cached bitmap
pub type BitmapId = u64;

/// Raster operation, rop3 in the low 8 bits plus transparency flags
pub type LogicalOp = u32;

/// Texture only, opaque
pub const LOP_DEFAULT: LogicalOp = 0xf0;
pub const LOP_S_TRANSPARENT: LogicalOp = 0x100;
pub const LOP_T_TRANSPARENT: LogicalOp = 0x200;

/// Segment notes carried with line and curve segments
pub type SegmentNotes = u8;
pub const SN_NONE: SegmentNotes = 0;
pub const SN_NOT_FIRST: SegmentNotes = 1;

bitflags! {
    /// Imager state fields already transmitted to a band
    pub struct Known: u16 {
        const FLATNESS    = 1 << 0;
        const FILL_ADJUST = 1 << 1;
        const CTM         = 1 << 2;
        const LINE_WIDTH  = 1 << 3;
        const MITER_LIMIT = 1 << 4;
        /// cap and join
        const MISC0       = 1 << 5;
        /// accurate curves, overprint, stroke adjust
        const MISC1       = 1 << 6;
        const DASH        = 1 << 7;
        const ALPHA       = 1 << 8;
        const CLIP_PATH   = 1 << 9;
        const COLOR_SPACE = 1 << 10;

        const FILL_ALL = Self::FLATNESS.bits | Self::FILL_ADJUST.bits
            | Self::ALPHA.bits | Self::CLIP_PATH.bits;
        const STROKE_ALL = Self::FLATNESS.bits | Self::FILL_ADJUST.bits
            | Self::CTM.bits | Self::LINE_WIDTH.bits | Self::MITER_LIMIT.bits
            | Self::MISC0.bits | Self::MISC1.bits | Self::DASH.bits
            | Self::ALPHA.bits | Self::CLIP_PATH.bits;
    }
}

impl Default for Known {
    fn default() -> Known {
        Known::empty()
    }
}

/// Inclusive range of bands
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub struct BandRange {
    pub min: usize,
    pub max: usize,
}

impl BandRange {
    pub fn new(min: usize, max: usize) -> Self {
        let (min, max) = if min > max { (max, min) } else { (min, max) };
        Self { min, max }
    }
    pub fn single(band: usize) -> Self {
        Self { min: band, max: band }
    }
    /// Every band of a page with `nbands` bands
    pub fn all(nbands: usize) -> Self {
        Self { min: 0, max: nbands.saturating_sub(1) }
    }
    pub fn contains(&self, band: usize) -> bool {
        self.min <= band && band <= self.max
    }
    pub fn is_single(&self) -> bool {
        self.min == self.max
    }
    pub fn iter(&self) -> std::ops::RangeInclusive<usize> {
        self.min ..= self.max
    }
}

/// Rectangle as the rectangle commands encode it
#[derive(Debug,Default,Copy,Clone,PartialEq,Eq)]
pub struct CmdRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl CmdRect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }
}

/// Per-band state
#[derive(Debug,Copy,Clone,PartialEq)]
pub struct BandState {
    /// Last color0 / color1
    pub colors: [ColorIndex; 2],
    /// Current tile index and the bitmap it holds
    pub tile_index: u16,
    pub tile_id: Option<BitmapId>,
    pub tile_phase: (i32, i32),
    pub tile_colors: [ColorIndex; 2],
    /// Last rectangle, also the origin of the next path
    pub rect: CmdRect,
    pub lop: LogicalOp,
    pub lop_enabled: bool,
    pub clip_enabled: bool,
    pub color_is_alpha: bool,
    pub known: Known,
}

impl Default for BandState {
    fn default() -> Self {
        Self {
            colors: [NO_COLOR, NO_COLOR],
            tile_index: 0,
            tile_id: None,
            tile_phase: (0, 0),
            tile_colors: [NO_COLOR, NO_COLOR],
            rect: CmdRect::default(),
            lop: LOP_DEFAULT,
            lop_enabled: false,
            clip_enabled: false,
            color_is_alpha: false,
            known: Known::empty(),
        }
    }
}

impl BandState {
    pub fn new() -> Self {
        Self::default()
    }
    /// Forget fields so they are sent again before their next use
    pub fn clear_known(&mut self, bits: Known) {
        self.known.remove(bits);
    }
    /// Fields from `required` not yet sent to this band
    pub fn unknown(&self, required: Known) -> Known {
        required - self.known
    }
}

#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum LineCap {
    Butt,
    Round,
    Square,
    Triangle,
}
impl Default for LineCap {
    fn default() -> LineCap {
        LineCap::Butt
    }
}
impl LineCap {
    pub fn from_bits(v: u8) -> LineCap {
        match v & 7 {
            1 => LineCap::Round,
            2 => LineCap::Square,
            3 => LineCap::Triangle,
            _ => LineCap::Butt,
        }
    }
    pub fn bits(self) -> u8 {
        match self {
            LineCap::Butt => 0,
            LineCap::Round => 1,
            LineCap::Square => 2,
            LineCap::Triangle => 3,
        }
    }
}

#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum LineJoin {
    Miter,
    Round,
    Bevel,
    None,
    Triangle,
}
impl Default for LineJoin {
    fn default() -> LineJoin {
        LineJoin::Miter
    }
}
impl LineJoin {
    pub fn from_bits(v: u8) -> LineJoin {
        match v & 7 {
            1 => LineJoin::Round,
            2 => LineJoin::Bevel,
            3 => LineJoin::None,
            4 => LineJoin::Triangle,
            _ => LineJoin::Miter,
        }
    }
    pub fn bits(self) -> u8 {
        match self {
            LineJoin::Miter => 0,
            LineJoin::Round => 1,
            LineJoin::Bevel => 2,
            LineJoin::None => 3,
            LineJoin::Triangle => 4,
        }
    }
}

/// Dash pattern
#[derive(Debug,Clone,Default,PartialEq)]
pub struct Dash {
    pub pattern: Vec<f32>,
    pub offset: f32,
    pub adapt: bool,
    pub dot_length: f32,
    pub dot_length_absolute: bool,
}

/// Graphics parameters that paths depend on
#[derive(Debug,Clone,PartialEq)]
pub struct ImagerState {
    pub flatness: f32,
    pub fill_adjust: FixedPoint,
    pub ctm: Matrix,
    pub line_width: f32,
    pub miter_limit: f32,
    pub cap: LineCap,
    pub join: LineJoin,
    pub accurate_curves: bool,
    pub overprint: bool,
    pub stroke_adjust: bool,
    pub dash: Dash,
    pub alpha: u16,
    pub log_op: LogicalOp,
}

impl Default for ImagerState {
    fn default() -> Self {
        Self {
            flatness: 1.0,
            fill_adjust: FixedPoint::new(crate::FIXED_HALF, crate::FIXED_HALF),
            ctm: Matrix::new(),
            line_width: 1.0,
            miter_limit: 10.0,
            cap: LineCap::default(),
            join: LineJoin::default(),
            accurate_curves: false,
            overprint: false,
            stroke_adjust: false,
            dash: Dash::default(),
            alpha: 0xffff,
            log_op: LOP_DEFAULT,
        }
    }
}

impl ImagerState {
    pub fn new() -> Self {
        Self::default()
    }
    /// Half the vertical reach of a stroke beyond its path, in pixels
    ///
    /// None when the reach cannot be bounded (miter joins at sharp angles
    /// with a large limit are treated as unbounded past 100 pixels).
    pub fn stroke_expansion(&self) -> Option<i32> {
        let scale = (self.ctm.xy.abs().max(self.ctm.yy.abs())) as f64;
        let mut half = (self.line_width as f64).abs() * 0.5 * scale.max(1.0);
        if self.join == LineJoin::Miter {
            half *= (self.miter_limit as f64).max(1.0);
        }
        if self.cap == LineCap::Square {
            half *= std::f64::consts::SQRT_2;
        }
        if half > 100.0 {
            return None;
        }
        Some(half.ceil() as i32 + 1)
    }
}
