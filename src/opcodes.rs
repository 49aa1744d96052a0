//! Command opcodes
//!
//! The high nibble of an opcode byte selects a family; the low nibble is
//! either a sub-opcode or an operand packed into the opcode.

use crate::error::{ClistError, Result};

pub const END_RUN: u8 = 0x00;
pub const SET_TILE_SIZE: u8 = 0x01;
pub const SET_TILE_PHASE: u8 = 0x02;
pub const SET_TILE_BITS: u8 = 0x03;
pub const SET_BITS: u8 = 0x04;
pub const SET_TILE_COLOR: u8 = 0x05;
pub const SET_MISC: u8 = 0x06;
pub const ENABLE_LOP: u8 = 0x07;
pub const DISABLE_LOP: u8 = 0x08;
pub const SET_HT_ORDER: u8 = 0x09;
pub const SET_HT_DATA: u8 = 0x0a;
pub const END_PAGE: u8 = 0x0b;
pub const DELTA2_COLOR0: u8 = 0x0c;
pub const DELTA2_COLOR1: u8 = 0x0d;
pub const SET_COPY_COLOR: u8 = 0x0e;
pub const SET_COPY_ALPHA: u8 = 0x0f;

pub const SET_COLOR0: u8 = 0x10;
pub const SET_COLOR1: u8 = 0x20;
pub const FILL_RECT: u8 = 0x30;
pub const FILL_RECT_SHORT: u8 = 0x40;
pub const FILL_RECT_TINY: u8 = 0x50;
pub const TILE_RECT: u8 = 0x60;
pub const TILE_RECT_SHORT: u8 = 0x70;
pub const TILE_RECT_TINY: u8 = 0x80;
pub const COPY_MONO: u8 = 0x90;
pub const COPY_COLOR_ALPHA: u8 = 0xa0;
pub const DELTA_TILE_INDEX: u8 = 0xb0;
pub const SET_TILE_INDEX: u8 = 0xc0;
pub const MISC2: u8 = 0xd0;
pub const SEGMENT: u8 = 0xe0;
pub const PATH: u8 = 0xf0;

/// Low nibble of a color op carrying no color
pub const COLOR_NONE: u8 = 15;

/// Copy flags in the low nibble of copy_mono / copy_color_alpha
pub const COPY_HT_COLOR: u8 = 4;
pub const COPY_USE_TILE: u8 = 8;

/// set_misc sub-ops, in the top two bits of the next byte
pub const MISC_LOP: u8 = 0x00;
pub const MISC_DATA_X: u8 = 0x40;
pub const MISC_MAP: u8 = 0x80;
pub const MISC_HALFTONE: u8 = 0xc0;

/// set_misc2 sub-ops
pub const MISC2_CAP_JOIN: u8 = 0x00;
pub const MISC2_AC_OP_SA: u8 = 0x40;
pub const MISC2_NOTES: u8 = 0x80;
pub const MISC2_ALPHA: u8 = 0xc0;

/// Control and tile commands, family 0x0_
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum MiscOp {
    EndRun,
    SetTileSize,
    SetTilePhase,
    SetTileBits,
    SetBits,
    SetTileColor,
    SetMisc,
    EnableLop,
    DisableLop,
    SetHtOrder,
    SetHtData,
    EndPage,
    /// Two byte color delta into slot 0 or 1
    Delta2Color(usize),
    SetCopyColor,
    SetCopyAlpha,
}

impl MiscOp {
    pub fn from_code(op: u8) -> MiscOp {
        match op & 15 {
            0x0 => MiscOp::EndRun,
            0x1 => MiscOp::SetTileSize,
            0x2 => MiscOp::SetTilePhase,
            0x3 => MiscOp::SetTileBits,
            0x4 => MiscOp::SetBits,
            0x5 => MiscOp::SetTileColor,
            0x6 => MiscOp::SetMisc,
            0x7 => MiscOp::EnableLop,
            0x8 => MiscOp::DisableLop,
            0x9 => MiscOp::SetHtOrder,
            0xa => MiscOp::SetHtData,
            0xb => MiscOp::EndPage,
            0xc => MiscOp::Delta2Color(0),
            0xd => MiscOp::Delta2Color(1),
            0xe => MiscOp::SetCopyColor,
            _ => MiscOp::SetCopyAlpha,
        }
    }
}

/// Rectangle operand encodings
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum RectForm {
    Full,
    Short,
    Tiny,
}

/// Extended commands, family 0xd_
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum ExtOp {
    SetFlatness,
    SetFillAdjust,
    SetCtm,
    SetLineWidth,
    SetMisc2,
    SetMiterLimit,
    SetDash,
    EnableClip,
    DisableClip,
    BeginClip,
    EndClip,
    SetColorSpace,
    BeginImage,
    ImageData,
    SetColor,
    PutParams,
}

impl ExtOp {
    pub fn from_code(op: u8) -> ExtOp {
        match op & 15 {
            0x0 => ExtOp::SetFlatness,
            0x1 => ExtOp::SetFillAdjust,
            0x2 => ExtOp::SetCtm,
            0x3 => ExtOp::SetLineWidth,
            0x4 => ExtOp::SetMisc2,
            0x5 => ExtOp::SetMiterLimit,
            0x6 => ExtOp::SetDash,
            0x7 => ExtOp::EnableClip,
            0x8 => ExtOp::DisableClip,
            0x9 => ExtOp::BeginClip,
            0xa => ExtOp::EndClip,
            0xb => ExtOp::SetColorSpace,
            0xc => ExtOp::BeginImage,
            0xd => ExtOp::ImageData,
            0xe => ExtOp::SetColor,
            _ => ExtOp::PutParams,
        }
    }
    pub fn code(self) -> u8 {
        MISC2 + match self {
            ExtOp::SetFlatness => 0x0,
            ExtOp::SetFillAdjust => 0x1,
            ExtOp::SetCtm => 0x2,
            ExtOp::SetLineWidth => 0x3,
            ExtOp::SetMisc2 => 0x4,
            ExtOp::SetMiterLimit => 0x5,
            ExtOp::SetDash => 0x6,
            ExtOp::EnableClip => 0x7,
            ExtOp::DisableClip => 0x8,
            ExtOp::BeginClip => 0x9,
            ExtOp::EndClip => 0xa,
            ExtOp::SetColorSpace => 0xb,
            ExtOp::BeginImage => 0xc,
            ExtOp::ImageData => 0xd,
            ExtOp::SetColor => 0xe,
            ExtOp::PutParams => 0xf,
        }
    }
}

/// Path segment commands, family 0xe_
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum SegmentOp {
    RMoveTo,
    RLineTo,
    HLineTo,
    VLineTo,
    RMLineTo,
    RM2LineTo,
    RM3LineTo,
    RRCurveTo,
    HVCurveTo,
    VHCurveTo,
    NRCurveTo,
    RNCurveTo,
    VQCurveTo,
    HQCurveTo,
    ClosePath,
}

const SEGMENT_OPS: [SegmentOp; 15] = [
    SegmentOp::RMoveTo, SegmentOp::RLineTo, SegmentOp::HLineTo,
    SegmentOp::VLineTo, SegmentOp::RMLineTo, SegmentOp::RM2LineTo,
    SegmentOp::RM3LineTo, SegmentOp::RRCurveTo, SegmentOp::HVCurveTo,
    SegmentOp::VHCurveTo, SegmentOp::NRCurveTo, SegmentOp::RNCurveTo,
    SegmentOp::VQCurveTo, SegmentOp::HQCurveTo, SegmentOp::ClosePath,
];

impl SegmentOp {
    /// None for 0xef, the one hole in the family
    pub fn from_code(op: u8) -> Option<SegmentOp> {
        SEGMENT_OPS.get((op & 15) as usize).copied()
    }
    pub fn code(self) -> u8 {
        SEGMENT + self as u8
    }
    /// Fixed-point operands following the opcode
    pub fn num_operands(self) -> usize {
        match self {
            SegmentOp::RMoveTo | SegmentOp::RLineTo => 2,
            SegmentOp::HLineTo | SegmentOp::VLineTo => 1,
            SegmentOp::RMLineTo => 4,
            SegmentOp::RM2LineTo | SegmentOp::RM3LineTo => 6,
            SegmentOp::RRCurveTo => 6,
            SegmentOp::HVCurveTo | SegmentOp::VHCurveTo |
            SegmentOp::NRCurveTo | SegmentOp::RNCurveTo => 4,
            SegmentOp::VQCurveTo | SegmentOp::HQCurveTo => 2,
            SegmentOp::ClosePath => 0,
        }
    }
}

/// How the drawing color of a path is given
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum DcType {
    /// color1 of the band
    Pure,
    /// Binary halftone: current tile with the tile colors
    Halftone,
    /// Colored halftone set by set_color
    Colored,
}

impl DcType {
    pub fn offset(self) -> u8 {
        match self {
            DcType::Pure => 0,
            DcType::Halftone => 1,
            DcType::Colored => 2,
        }
    }
}

/// Path drawing commands, family 0xf_
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum PathOp {
    Fill(DcType),
    EoFill(DcType),
    Stroke(DcType),
}

impl PathOp {
    pub fn from_code(op: u8) -> Option<PathOp> {
        let n = op & 15;
        let dc = match n % 3 {
            0 => DcType::Pure,
            1 => DcType::Halftone,
            _ => DcType::Colored,
        };
        match n / 3 {
            0 => Some(PathOp::Fill(dc)),
            1 => Some(PathOp::EoFill(dc)),
            2 => Some(PathOp::Stroke(dc)),
            _ => None,
        }
    }
    pub fn code(self) -> u8 {
        match self {
            PathOp::Fill(dc) => PATH + dc.offset(),
            PathOp::EoFill(dc) => PATH + 3 + dc.offset(),
            PathOp::Stroke(dc) => PATH + 6 + dc.offset(),
        }
    }
}

/// One decoded opcode byte
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum Op {
    Misc(MiscOp),
    /// Slot 0 or 1, low nibble of the opcode
    SetColor(usize, u8),
    FillRect(RectForm, u8),
    TileRect(RectForm, u8),
    /// Flags in the low nibble
    CopyMono(u8),
    CopyColorAlpha(u8),
    DeltaTileIndex(u8),
    SetTileIndex(u8),
    Ext(ExtOp),
    Segment(SegmentOp),
    Path(PathOp),
}

impl Op {
    /// Classify an opcode byte read at `offset`
    pub fn decode(op: u8, offset: usize) -> Result<Op> {
        let n = op & 15;
        let out = match op >> 4 {
            0x0 => Op::Misc(MiscOp::from_code(op)),
            0x1 => Op::SetColor(0, n),
            0x2 => Op::SetColor(1, n),
            0x3 => Op::FillRect(RectForm::Full, n),
            0x4 => Op::FillRect(RectForm::Short, n),
            0x5 => Op::FillRect(RectForm::Tiny, n),
            0x6 => Op::TileRect(RectForm::Full, n),
            0x7 => Op::TileRect(RectForm::Short, n),
            0x8 => Op::TileRect(RectForm::Tiny, n),
            0x9 => Op::CopyMono(n),
            0xa => Op::CopyColorAlpha(n),
            0xb => Op::DeltaTileIndex(n),
            0xc => Op::SetTileIndex(n),
            0xd => Op::Ext(ExtOp::from_code(op)),
            0xe => match SegmentOp::from_code(op) {
                Some(s) => Op::Segment(s),
                None => return Err(ClistError::UnrecognizedOpcode { op, offset }),
            },
            _ => match PathOp::from_code(op) {
                Some(p) => Op::Path(p),
                None => return Err(ClistError::UnrecognizedOpcode { op, offset }),
            },
        };
        Ok(out)
    }
}
