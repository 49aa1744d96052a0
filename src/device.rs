//! Target devices
//!
//! [`TargetDevice`] is what playback draws on. Primitives a device does not
//! implement fail with a [`ClistError::TargetDevice`] error.

use crate::clip::{ClipList, IntRect};
use crate::error::{ClistError, Result};
use crate::halftone::{DeviceHalftone, TransferMap};
use crate::matrix::Matrix;
use crate::path::{Path, Segment};
use crate::state::{ColorIndex, ImagerState, LogicalOp};
use crate::tile_cache::TileBitmap;

/// Borrowed bitmap rows
#[derive(Debug,Copy,Clone,PartialEq)]
pub struct Bitmap<'a> {
    pub data: &'a [u8],
    /// First pixel within each row
    pub data_x: usize,
    /// Bytes per row
    pub raster: usize,
}

impl<'a> Bitmap<'a> {
    pub fn new(data: &'a [u8], data_x: usize, raster: usize) -> Self {
        Self { data, data_x, raster }
    }
}

#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum FillRule {
    NonZero,
    EvenOdd,
}

/// Color a path, mask or image is drawn with
#[derive(Debug,Clone,PartialEq)]
pub enum DrawingColor {
    Pure(ColorIndex),
    /// Binary halftone: tile bits select between two colors
    Halftone { tile: TileBitmap, colors: [ColorIndex; 2], phase: (i32, i32) },
    /// Colored halftone: per component base level and halftone level
    Colored { bases: [u8; 4], levels: Vec<u32> },
}

impl DrawingColor {
    pub fn pure(color: ColorIndex) -> Self {
        DrawingColor::Pure(color)
    }
}

#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum ColorSpaceBase {
    Gray,
    Rgb,
    Cmyk,
}

impl ColorSpaceBase {
    pub fn num_components(self) -> usize {
        match self {
            ColorSpaceBase::Gray => 1,
            ColorSpaceBase::Rgb => 3,
            ColorSpaceBase::Cmyk => 4,
        }
    }
}

/// Indexed color space over a base space
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub struct Indexed {
    pub hival: u32,
    /// Lookup through a procedure instead of a table
    pub use_proc: bool,
}

#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub struct ColorSpace {
    pub base: ColorSpaceBase,
    pub indexed: Option<Indexed>,
}

impl Default for ColorSpace {
    fn default() -> Self {
        Self::gray()
    }
}

impl ColorSpace {
    pub fn gray() -> Self {
        Self { base: ColorSpaceBase::Gray, indexed: None }
    }
    pub fn rgb() -> Self {
        Self { base: ColorSpaceBase::Rgb, indexed: None }
    }
    pub fn cmyk() -> Self {
        Self { base: ColorSpaceBase::Cmyk, indexed: None }
    }
    pub fn indexed(base: ColorSpaceBase, hival: u32, use_proc: bool) -> Self {
        Self { base, indexed: Some(Indexed { hival, use_proc }) }
    }
    /// Components of a color value in this space
    pub fn num_components(&self) -> usize {
        if self.indexed.is_some() { 1 } else { self.base.num_components() }
    }
    /// Header byte of set_color_space
    pub fn code(&self) -> u8 {
        let base = match self.base {
            ColorSpaceBase::Gray => 0,
            ColorSpaceBase::Rgb => 1,
            ColorSpaceBase::Cmyk => 2,
        };
        match self.indexed {
            None => base << 4,
            Some(ix) => (base << 4) | 8 | if ix.use_proc { 4 } else { 0 },
        }
    }
    /// Space from the header byte, the hival operand supplied separately
    pub fn from_code(b: u8, hival: u32) -> Result<Self> {
        let base = match b >> 4 {
            0 => ColorSpaceBase::Gray,
            1 => ColorSpaceBase::Rgb,
            2 => ColorSpaceBase::Cmyk,
            i => return Err(ClistError::malformed(format!("color space index {}", i))),
        };
        let indexed = if b & 8 != 0 {
            Some(Indexed { hival, use_proc: b & 4 != 0 })
        } else {
            None
        };
        Ok(Self { base, indexed })
    }
}

/// Sample layout of image data
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum ImageFormat {
    /// All components interleaved in one plane
    Chunky,
    /// One plane per component
    ComponentPlanar,
    /// One plane per bit of each component
    BitPlanar,
}

impl Default for ImageFormat {
    fn default() -> ImageFormat {
        ImageFormat::Chunky
    }
}

impl ImageFormat {
    pub fn code(self) -> u8 {
        match self {
            ImageFormat::Chunky => 0,
            ImageFormat::ComponentPlanar => 1,
            ImageFormat::BitPlanar => 2,
        }
    }
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(ImageFormat::Chunky),
            1 => Ok(ImageFormat::ComponentPlanar),
            2 => Ok(ImageFormat::BitPlanar),
            c => Err(ClistError::malformed(format!("image format {}", c))),
        }
    }
}

/// Description of a sampled image or image mask
#[derive(Debug,Clone,PartialEq)]
pub struct ImageHeader {
    pub width: u32,
    pub height: u32,
    pub bits_per_component: u8,
    /// Stencil mask painted with the drawing color
    pub mask: bool,
    pub format: ImageFormat,
    pub interpolate: bool,
    pub alpha: u8,
    /// User space to image space
    pub matrix: Matrix,
    /// Decode ranges, two per component; None is the default
    pub decode: Option<Vec<f32>>,
    /// Mask adjust, or combine with color for images
    pub adjust: bool,
    /// Part of the source actually supplied
    pub rect: Option<IntRect>,
}

impl ImageHeader {
    pub fn new(width: u32, height: u32, bits_per_component: u8) -> Self {
        Self {
            width, height, bits_per_component,
            mask: false,
            format: ImageFormat::Chunky,
            interpolate: false,
            alpha: 0,
            matrix: Self::default_matrix(width, height),
            decode: None,
            adjust: false,
            rect: None,
        }
    }
    /// Image mask of 1 bit samples
    pub fn mask(width: u32, height: u32) -> Self {
        Self { mask: true, .. Self::new(width, height, 1) }
    }
    /// Unit square to the image, y flipped
    pub fn default_matrix(width: u32, height: u32) -> Matrix {
        Matrix::from_coeffs([width as f32, 0.0, 0.0, -(height as f32), 0.0, height as f32])
    }
    pub fn num_components(&self, cs: &ColorSpace) -> usize {
        if self.mask { 1 } else { cs.num_components() }
    }
    pub fn num_planes(&self, cs: &ColorSpace) -> usize {
        let n = self.num_components(cs);
        match self.format {
            ImageFormat::Chunky => 1,
            ImageFormat::ComponentPlanar => n,
            ImageFormat::BitPlanar => n * self.bits_per_component as usize,
        }
    }
    /// Bits one pixel occupies in each plane
    pub fn plane_depth(&self, cs: &ColorSpace) -> usize {
        match self.format {
            ImageFormat::Chunky => self.num_components(cs) * self.bits_per_component as usize,
            ImageFormat::ComponentPlanar => self.bits_per_component as usize,
            ImageFormat::BitPlanar => 1,
        }
    }
    /// Device pixels the image may touch under `ctm`
    pub fn device_bbox(&self, ctm: &Matrix) -> Option<IntRect> {
        let m = self.matrix.invert()?.multiply(ctm);
        let (w, h) = (self.width as f32, self.height as f32);
        let pts = [m.transform(0.0, 0.0), m.transform(w, 0.0), m.transform(0.0, h), m.transform(w, h)];
        let x1 = pts.iter().map(|p| p.0).fold(f32::INFINITY, f32::min);
        let x2 = pts.iter().map(|p| p.0).fold(f32::NEG_INFINITY, f32::max);
        let y1 = pts.iter().map(|p| p.1).fold(f32::INFINITY, f32::min);
        let y2 = pts.iter().map(|p| p.1).fold(f32::NEG_INFINITY, f32::max);
        if !(x1.is_finite() && x2.is_finite() && y1.is_finite() && y2.is_finite()) {
            return None;
        }
        Some(IntRect::new(x1.floor() as i32, y1.floor() as i32, x2.ceil() as i32, y2.ceil() as i32))
    }
}

fn unsupported(what: &str) -> ClistError {
    ClistError::device(format!("{} not supported", what))
}

/// Primitive drawing operations issued during playback
pub trait TargetDevice {
    fn fill_rectangle(&mut self, rect: IntRect, color: ColorIndex) -> Result<()>;
    /// Area playback may draw in
    fn get_clipping_box(&self) -> IntRect;
    /// Playback of `band` covering `area` is about to start
    fn begin_band(&mut self, _band: usize, _area: IntRect) -> Result<()> {
        Ok(())
    }
    /// 1 bit bitmap, `NO_COLOR` leaves pixels untouched
    fn copy_mono(&mut self, _bits: Bitmap, _rect: IntRect, _color0: ColorIndex, _color1: ColorIndex) -> Result<()> {
        Err(unsupported("copy_mono"))
    }
    /// Bitmap at device depth
    fn copy_color(&mut self, _bits: Bitmap, _rect: IntRect) -> Result<()> {
        Err(unsupported("copy_color"))
    }
    /// Alpha coverage of `depth` bits painting `color`
    fn copy_alpha(&mut self, _bits: Bitmap, _rect: IntRect, _color: ColorIndex, _depth: u8) -> Result<()> {
        Err(unsupported("copy_alpha"))
    }
    fn fill_mask(&mut self, _bits: Bitmap, _rect: IntRect, _color: &DrawingColor, _depth: u8,
                 _lop: LogicalOp, _clip: Option<&ClipList>) -> Result<()> {
        Err(unsupported("fill_mask"))
    }
    fn strip_tile_rectangle(&mut self, _tile: &TileBitmap, _rect: IntRect, _color0: ColorIndex,
                            _color1: ColorIndex, _phase: (i32, i32)) -> Result<()> {
        Err(unsupported("strip_tile_rectangle"))
    }
    fn strip_copy_rop(&mut self, _rect: IntRect, _texture: Option<&TileBitmap>, _tcolors: [ColorIndex; 2],
                      _phase: (i32, i32), _lop: LogicalOp) -> Result<()> {
        Err(unsupported("strip_copy_rop"))
    }
    fn fill_path(&mut self, _state: &ImagerState, _path: &Path, _rule: FillRule,
                 _color: &DrawingColor, _clip: Option<&ClipList>) -> Result<()> {
        Err(unsupported("fill_path"))
    }
    fn stroke_path(&mut self, _state: &ImagerState, _path: &Path,
                   _color: &DrawingColor, _clip: Option<&ClipList>) -> Result<()> {
        Err(unsupported("stroke_path"))
    }
    fn begin_image(&mut self, _state: &ImagerState, _header: &ImageHeader, _cs: &ColorSpace,
                   _color: &DrawingColor, _clip: Option<&ClipList>) -> Result<()> {
        Err(unsupported("begin_image"))
    }
    /// `height` rows of each plane, `raster` bytes per row
    fn image_data(&mut self, _planes: &[&[u8]], _data_x: usize, _raster: usize, _height: u32) -> Result<()> {
        Err(unsupported("image_data"))
    }
    fn end_image(&mut self) -> Result<()> {
        Err(unsupported("end_image"))
    }
    fn put_params(&mut self, _params: &[u8]) -> Result<()> {
        Ok(())
    }
    fn install_halftone(&mut self, _ht: &DeviceHalftone) -> Result<()> {
        Ok(())
    }
    fn install_transfer(&mut self, _index: usize, _map: &TransferMap) -> Result<()> {
        Ok(())
    }
}

/// One primitive call seen by a [`RecordingDevice`]
#[derive(Debug,Clone,PartialEq)]
pub enum DeviceCall {
    FillRectangle { rect: IntRect, color: ColorIndex },
    CopyMono { rect: IntRect, data_x: usize, raster: usize, data: Vec<u8>, colors: [ColorIndex; 2] },
    CopyColor { rect: IntRect, data_x: usize, raster: usize, data: Vec<u8> },
    CopyAlpha { rect: IntRect, data_x: usize, raster: usize, data: Vec<u8>, color: ColorIndex, depth: u8 },
    FillMask { rect: IntRect, data_x: usize, raster: usize, data: Vec<u8>, color: DrawingColor,
               depth: u8, lop: LogicalOp, clip: Option<ClipList> },
    StripTileRectangle { rect: IntRect, tile: TileBitmap, colors: [ColorIndex; 2], phase: (i32, i32) },
    StripCopyRop { rect: IntRect, texture: Option<TileBitmap>, colors: [ColorIndex; 2],
                   phase: (i32, i32), lop: LogicalOp },
    FillPath { segments: Vec<Segment>, rule: FillRule, color: DrawingColor,
               clip: Option<ClipList>, state: ImagerState },
    StrokePath { segments: Vec<Segment>, color: DrawingColor, clip: Option<ClipList>, state: ImagerState },
    BeginImage { header: ImageHeader, color_space: ColorSpace, color: DrawingColor, clip: Option<ClipList> },
    ImageData { planes: Vec<Vec<u8>>, data_x: usize, raster: usize, height: u32 },
    EndImage,
    PutParams(Vec<u8>),
    InstallHalftone(DeviceHalftone),
    InstallTransfer { index: usize, map: TransferMap },
}

/// Target that records every call, for tests
#[derive(Debug,Default)]
pub struct RecordingDevice {
    pub calls: Vec<DeviceCall>,
    clip_box: IntRect,
    /// Fail the call with this sequence number
    fail_at: Option<usize>,
}

impl RecordingDevice {
    pub fn new(clip_box: IntRect) -> Self {
        Self { calls: vec![], clip_box, fail_at: None }
    }
    /// Return a target device error instead of recording call `n` (from 0)
    pub fn with_failure_at(mut self, n: usize) -> Self {
        self.fail_at = Some(n);
        self
    }
    pub fn take(&mut self) -> Vec<DeviceCall> {
        std::mem::replace(&mut self.calls, vec![])
    }
    fn record(&mut self, call: DeviceCall) -> Result<()> {
        if self.fail_at == Some(self.calls.len()) {
            return Err(ClistError::device(format!("injected failure at call {}", self.calls.len())));
        }
        self.calls.push(call);
        Ok(())
    }
}

impl TargetDevice for RecordingDevice {
    fn fill_rectangle(&mut self, rect: IntRect, color: ColorIndex) -> Result<()> {
        self.record(DeviceCall::FillRectangle { rect, color })
    }
    fn get_clipping_box(&self) -> IntRect {
        self.clip_box
    }
    fn begin_band(&mut self, _band: usize, area: IntRect) -> Result<()> {
        self.clip_box = area;
        Ok(())
    }
    fn copy_mono(&mut self, bits: Bitmap, rect: IntRect, color0: ColorIndex, color1: ColorIndex) -> Result<()> {
        self.record(DeviceCall::CopyMono {
            rect, data_x: bits.data_x, raster: bits.raster, data: bits.data.to_vec(), colors: [color0, color1],
        })
    }
    fn copy_color(&mut self, bits: Bitmap, rect: IntRect) -> Result<()> {
        self.record(DeviceCall::CopyColor { rect, data_x: bits.data_x, raster: bits.raster, data: bits.data.to_vec() })
    }
    fn copy_alpha(&mut self, bits: Bitmap, rect: IntRect, color: ColorIndex, depth: u8) -> Result<()> {
        self.record(DeviceCall::CopyAlpha {
            rect, data_x: bits.data_x, raster: bits.raster, data: bits.data.to_vec(), color, depth,
        })
    }
    fn fill_mask(&mut self, bits: Bitmap, rect: IntRect, color: &DrawingColor, depth: u8,
                 lop: LogicalOp, clip: Option<&ClipList>) -> Result<()> {
        self.record(DeviceCall::FillMask {
            rect, data_x: bits.data_x, raster: bits.raster, data: bits.data.to_vec(),
            color: color.clone(), depth, lop, clip: clip.cloned(),
        })
    }
    fn strip_tile_rectangle(&mut self, tile: &TileBitmap, rect: IntRect, color0: ColorIndex,
                            color1: ColorIndex, phase: (i32, i32)) -> Result<()> {
        self.record(DeviceCall::StripTileRectangle { rect, tile: tile.clone(), colors: [color0, color1], phase })
    }
    fn strip_copy_rop(&mut self, rect: IntRect, texture: Option<&TileBitmap>, tcolors: [ColorIndex; 2],
                      phase: (i32, i32), lop: LogicalOp) -> Result<()> {
        self.record(DeviceCall::StripCopyRop { rect, texture: texture.cloned(), colors: tcolors, phase, lop })
    }
    fn fill_path(&mut self, state: &ImagerState, path: &Path, rule: FillRule,
                 color: &DrawingColor, clip: Option<&ClipList>) -> Result<()> {
        self.record(DeviceCall::FillPath {
            segments: path.segments.clone(), rule, color: color.clone(), clip: clip.cloned(), state: state.clone(),
        })
    }
    fn stroke_path(&mut self, state: &ImagerState, path: &Path,
                   color: &DrawingColor, clip: Option<&ClipList>) -> Result<()> {
        self.record(DeviceCall::StrokePath {
            segments: path.segments.clone(), color: color.clone(), clip: clip.cloned(), state: state.clone(),
        })
    }
    fn begin_image(&mut self, _state: &ImagerState, header: &ImageHeader, cs: &ColorSpace,
                   color: &DrawingColor, clip: Option<&ClipList>) -> Result<()> {
        self.record(DeviceCall::BeginImage {
            header: header.clone(), color_space: *cs, color: color.clone(), clip: clip.cloned(),
        })
    }
    fn image_data(&mut self, planes: &[&[u8]], data_x: usize, raster: usize, height: u32) -> Result<()> {
        self.record(DeviceCall::ImageData {
            planes: planes.iter().map(|p| p.to_vec()).collect(), data_x, raster, height,
        })
    }
    fn end_image(&mut self) -> Result<()> {
        self.record(DeviceCall::EndImage)
    }
    fn put_params(&mut self, params: &[u8]) -> Result<()> {
        self.record(DeviceCall::PutParams(params.to_vec()))
    }
    fn install_halftone(&mut self, ht: &DeviceHalftone) -> Result<()> {
        self.record(DeviceCall::InstallHalftone(ht.clone()))
    }
    fn install_transfer(&mut self, index: usize, map: &TransferMap) -> Result<()> {
        self.record(DeviceCall::InstallTransfer { index, map: map.clone() })
    }
}
