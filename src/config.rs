//! Writer and reader configuration

use bitflags::bitflags;

use crate::error::{ClistError, Result};
use crate::state::BandRange;
use crate::clip::IntRect;

/// Bitmap payload compression, as carried in the low 2 opcode bits
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum Compression {
    None,
    /// PostScript RunLength
    Rle,
    /// CCITT Group 4 (2-D modified Huffman)
    Ccitt,
}
impl Default for Compression {
    fn default() -> Compression {
        Compression::None
    }
}

impl Compression {
    pub fn code(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Rle => 1,
            Compression::Ccitt => 2,
        }
    }
    pub fn from_code(code: u8) -> Result<Self> {
        match code & 3 {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Rle),
            2 => Ok(Compression::Ccitt),
            c => Err(ClistError::malformed(format!("compression method {}", c))),
        }
    }
}

bitflags! {
    /// Compression methods a payload may use
    pub struct CompressionMask: u16 {
        const RLE   = 1 << 1;
        const CCITT = 1 << 2;
        /// Decompressed data lands in the tile arena, not the read buffer
        const DECOMPRESS_ELSEWHERE = 1 << 8;
    }
}

impl CompressionMask {
    pub fn allows(&self, c: Compression) -> bool {
        match c {
            Compression::None => true,
            Compression::Rle => self.contains(CompressionMask::RLE),
            Compression::Ccitt => self.contains(CompressionMask::CCITT),
        }
    }
    pub fn any_method(&self) -> bool {
        self.intersects(CompressionMask::RLE | CompressionMask::CCITT)
    }
}

/// Command list configuration
///
/// Passed to the writer and the reader at construction.
#[derive(Debug,Clone,PartialEq)]
pub struct ClistConfig {
    /// Page width in pixels
    pub width: i32,
    /// Page height in pixels
    pub height: i32,
    /// Height of each band in pixels
    pub band_height: i32,
    /// Device color depth in bits
    pub depth: u8,
    /// Capacity of the in-memory command buffer in bytes
    pub buffer_size: usize,
    /// Size of the reader's command and bitmap buffer
    pub cbuf_size: usize,
    /// Bytes available for cached tiles and bitmaps
    pub tile_cache_size: usize,
    /// Entries in the tile index table, a power of two
    pub tile_hash_size: usize,
    /// Compression permitted for inline bitmaps
    pub compression: CompressionMask,
    /// Emit images as image commands instead of failing over
    pub high_level_images: bool,
    /// Local recovery attempts before flush recovery
    pub retry_budget: u32,
}

impl Default for ClistConfig {
    fn default() -> Self {
        Self {
            width: 612,
            height: 792,
            band_height: 64,
            depth: 8,
            buffer_size: 32 * 1024,
            cbuf_size: 800,
            tile_cache_size: 32 * 1024,
            tile_hash_size: 256,
            compression: CompressionMask::RLE | CompressionMask::CCITT,
            high_level_images: true,
            retry_budget: 1,
        }
    }
}

impl ClistConfig {
    pub fn new(width: i32, height: i32, band_height: i32, depth: u8) -> Self {
        Self { width, height, band_height, depth, .. Self::default() }
    }
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
    pub fn with_cbuf_size(mut self, cbuf_size: usize) -> Self {
        self.cbuf_size = cbuf_size;
        self
    }
    pub fn with_tile_cache(mut self, size: usize, hash_size: usize) -> Self {
        self.tile_cache_size = size;
        self.tile_hash_size = hash_size;
        self
    }
    pub fn with_compression(mut self, compression: CompressionMask) -> Self {
        self.compression = compression;
        self
    }
    pub fn with_high_level_images(mut self, on: bool) -> Self {
        self.high_level_images = on;
        self
    }
    pub fn with_retry_budget(mut self, retry_budget: u32) -> Self {
        self.retry_budget = retry_budget;
        self
    }
    /// Check the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.width <= 0 || self.height <= 0 {
            return Err(ClistError::malformed(format!("page size {}x{}", self.width, self.height)));
        }
        if self.band_height <= 0 {
            return Err(ClistError::malformed(format!("band height {}", self.band_height)));
        }
        match self.depth {
            1 | 2 | 4 | 8 | 16 | 24 | 32 => {},
            d => return Err(ClistError::malformed(format!("color depth {}", d))),
        }
        if !self.tile_hash_size.is_power_of_two() || self.tile_hash_size > 4096 {
            return Err(ClistError::malformed(format!("tile hash size {}", self.tile_hash_size)));
        }
        if self.cbuf_size < crate::codec::CMD_LARGEST_SIZE * 2 {
            return Err(ClistError::malformed(format!("reader buffer {} too small", self.cbuf_size)));
        }
        // A cached bitmap fills the reader buffer and still needs its command
        if self.buffer_size < self.cbuf_size + crate::codec::CMD_LARGEST_SIZE {
            return Err(ClistError::malformed(format!("command buffer {} too small for reader buffer {}",
                                                     self.buffer_size, self.cbuf_size)));
        }
        Ok(())
    }
    /// Number of bands on the page
    pub fn nbands(&self) -> usize {
        ((self.height + self.band_height - 1) / self.band_height) as usize
    }
    /// Bytes per color value
    pub fn depth_bytes(&self) -> usize {
        (self.depth as usize + 7) / 8
    }
    /// Color components of a device pixel
    pub fn num_components(&self) -> usize {
        match self.depth {
            32 => 4,
            16 | 24 => 3,
            _ => 1,
        }
    }
    /// Band holding device row y, clamped to the page
    pub fn band_of(&self, y: i32) -> usize {
        let y = y.max(0).min(self.height - 1);
        (y / self.band_height) as usize
    }
    /// Device area covered by a band
    pub fn band_rect(&self, band: usize) -> IntRect {
        let y0 = band as i32 * self.band_height;
        let y1 = (y0 + self.band_height).min(self.height);
        IntRect::new(0, y0, self.width, y1)
    }
    /// Bands touched by rows [y, y + height)
    pub fn bands_for(&self, y: i32, height: i32) -> Option<BandRange> {
        let y0 = y.max(0);
        let y1 = (y + height).min(self.height);
        if y1 <= y0 {
            return None;
        }
        Some(BandRange::new(self.band_of(y0), self.band_of(y1 - 1)))
    }
    pub fn all_bands(&self) -> BandRange {
        BandRange::all(self.nbands())
    }
}
