//! Tile and bitmap cache
//!
//! Tiles and cached bitmaps live in a byte arena and are named by a small
//! index, a slot of an open-addressed table keyed by bitmap id. Readers see
//! `(index, offset)` and keep an [`TileArena`] of their own; the writer's
//! [`TileCache`] adds the hashing, band knowledge, eviction and compaction.

use std::collections::VecDeque;

use tracing::debug;

use crate::bits::{replicate, short_raster};
use crate::error::{ClistError, Result};
use crate::state::BitmapId;

/// Probe step through the index table
const PROBE_STEP: usize = 413;

/// Widest replicated tile row in bytes
pub const MAX_REP_RASTER: usize = 32;
/// Most copies stacked vertically
pub const MAX_Y_REPS: usize = 4;
/// Largest replicated tile in bytes
pub const MAX_REP_SIZE: usize = 256;

/// Tile geometry as set_tile_size carries it
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub struct TileSize {
    pub rep_width: u32,
    pub rep_height: u32,
    pub x_reps: u32,
    pub y_reps: u32,
    /// Horizontal shift of each successive copy down the tile
    pub rep_shift: u32,
    pub depth: u8,
}

impl Default for TileSize {
    fn default() -> Self {
        Self { rep_width: 0, rep_height: 0, x_reps: 1, y_reps: 1, rep_shift: 0, depth: 1 }
    }
}

impl TileSize {
    pub fn new(width: u32, height: u32, depth: u8) -> Self {
        Self { rep_width: width, rep_height: height, depth, .. Self::default() }
    }
    pub fn width(&self) -> u32 {
        self.rep_width * self.x_reps
    }
    pub fn height(&self) -> u32 {
        self.rep_height * self.y_reps
    }
    /// Bytes per row of the stored bits
    pub fn raster(&self) -> usize {
        short_raster(self.width() as usize * self.depth as usize)
    }
    pub fn data_size(&self) -> usize {
        self.raster() * self.height() as usize
    }
}

/// Bitmap with its identity and geometry
#[derive(Debug,Clone,PartialEq)]
pub struct TileBitmap {
    pub id: BitmapId,
    pub size: TileSize,
    /// Rows at `size.raster()` bytes
    pub data: Vec<u8>,
}

impl TileBitmap {
    /// Single copy tile of short-raster rows
    pub fn new(id: BitmapId, width: u32, height: u32, depth: u8, data: Vec<u8>) -> Self {
        Self { id, size: TileSize::new(width, height, depth), data }
    }
    pub fn with_shift(mut self, rep_shift: u32) -> Self {
        self.size.rep_shift = rep_shift;
        self
    }
    pub fn width(&self) -> u32 {
        self.size.width()
    }
    pub fn height(&self) -> u32 {
        self.size.height()
    }
    pub fn raster(&self) -> usize {
        self.size.raster()
    }
    /// Copy replicated up to 32 bytes across and 4 copies down, within 256
    /// bytes; no vertical copies when rows shift
    pub fn replicated(&self) -> TileBitmap {
        let s = self.size;
        if s.x_reps != 1 || s.y_reps != 1 || s.rep_width == 0 || s.rep_height == 0 {
            return self.clone();
        }
        let bits = s.rep_width as usize * s.depth as usize;
        let x_reps = (MAX_REP_RASTER * 8 / bits).max(1);
        let raster = short_raster(bits * x_reps);
        let y_reps = if s.rep_shift != 0 {
            1
        } else {
            let rows = s.rep_height as usize;
            (1 ..= MAX_Y_REPS).rev()
                .find(|&y| raster * rows * y <= MAX_REP_SIZE)
                .unwrap_or(1)
        };
        if raster * s.rep_height as usize * y_reps > MAX_REP_SIZE {
            return self.clone();
        }
        let size = TileSize { x_reps: x_reps as u32, y_reps: y_reps as u32, .. s };
        let data = replicate(&self.data, bits, s.rep_height as usize, x_reps, y_reps);
        TileBitmap { id: self.id, size, data }
    }
    /// Pixel value at device (x, y) when tiled with `phase`
    pub fn pixel(&self, x: i32, y: i32, phase: (i32, i32)) -> u32 {
        let s = self.size;
        let (w, h) = (s.width() as i32, s.height() as i32);
        if w == 0 || h == 0 {
            return 0;
        }
        let ty = (y + phase.1).rem_euclid(h);
        // Each full tile height further down shifts the pattern right
        let strips = (y + phase.1).div_euclid(h);
        let tx = (x + phase.0 - strips * s.rep_shift as i32).rem_euclid(w);
        let depth = s.depth as usize;
        let bit = tx as usize * depth;
        let row = &self.data[ty as usize * s.raster() ..];
        let mut v = 0u32;
        for i in 0 .. depth {
            let b = bit + i;
            v = (v << 1) | u32::from(row[b >> 3] >> (7 - (b & 7)) & 1);
        }
        v
    }
}

/// Location of a tile in an arena
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub struct SlotRef {
    pub offset: usize,
    pub size: TileSize,
}

/// Arena of tile bits addressed by `(index, offset)`
///
/// What the reader rebuilds from set_tile_bits and set_bits.
#[derive(Debug,Clone)]
pub struct TileArena {
    heap: Vec<u8>,
    table: Vec<Option<SlotRef>>,
}

impl TileArena {
    pub fn new(heap_size: usize, table_size: usize) -> Self {
        Self { heap: vec![0u8; heap_size], table: vec![None; table_size] }
    }
    pub fn clear(&mut self) {
        self.table.iter_mut().for_each(|s| *s = None);
    }
    pub fn store(&mut self, index: usize, offset: usize, size: TileSize, bits: &[u8]) -> Result<()> {
        if index >= self.table.len() {
            return Err(ClistError::malformed(format!("tile index {} out of range", index)));
        }
        if bits.len() < size.data_size() {
            return Err(ClistError::malformed(format!("tile bits {} bytes short", size.data_size() - bits.len())));
        }
        let end = offset + bits.len();
        if end > self.heap.len() {
            return Err(ClistError::malformed(format!("tile at {}..{} past the arena", offset, end)));
        }
        self.heap[offset .. end].copy_from_slice(bits);
        self.table[index] = Some(SlotRef { offset, size });
        Ok(())
    }
    pub fn slot(&self, index: usize) -> Option<SlotRef> {
        self.table.get(index).copied().flatten()
    }
    pub fn bitmap(&self, index: usize) -> Result<TileBitmap> {
        let slot = self.slot(index)
            .ok_or_else(|| ClistError::malformed(format!("tile index {} used before its bits", index)))?;
        let n = slot.size.data_size();
        let data = self.heap[slot.offset .. slot.offset + n].to_vec();
        Ok(TileBitmap { id: index as BitmapId, size: slot.size, data })
    }
}

/// Set of bands, one bit each
#[derive(Debug,Clone,Default,PartialEq,Eq)]
pub struct BandMask {
    words: Vec<u64>,
}

impl BandMask {
    pub fn new(nbands: usize) -> Self {
        Self { words: vec![0; (nbands + 63) / 64] }
    }
    pub fn contains(&self, band: usize) -> bool {
        self.words.get(band / 64).map(|w| w & (1u64 << (band % 64)) != 0).unwrap_or(false)
    }
    pub fn insert(&mut self, band: usize) {
        if let Some(w) = self.words.get_mut(band / 64) {
            *w |= 1u64 << (band % 64);
        }
    }
    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }
}

/// Writer-side cache entry
#[derive(Debug,Clone)]
pub struct TileEntry {
    pub id: BitmapId,
    pub slot: SlotRef,
    /// Bands that have received the bits at `slot.offset`
    pub bands: BandMask,
}

#[derive(Debug,Clone)]
enum Entry {
    Empty,
    Deleted,
    Used(TileEntry),
}

/// Result of a cache lookup
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum Lookup {
    Found(usize),
    /// Added at this index, no band has the bits yet
    Added(usize),
}

impl Lookup {
    pub fn index(self) -> usize {
        match self {
            Lookup::Found(i) | Lookup::Added(i) => i,
        }
    }
}

/// Writer-side tile cache
#[derive(Debug)]
pub struct TileCache {
    table: Vec<Entry>,
    heap: Vec<u8>,
    /// First free byte of the arena
    top: usize,
    used: usize,
    /// Indices in insertion order, oldest first
    fifo: VecDeque<usize>,
    nbands: usize,
}

impl TileCache {
    pub fn new(heap_size: usize, hash_size: usize, nbands: usize) -> Self {
        Self {
            table: vec![Entry::Empty; hash_size],
            heap: vec![0u8; heap_size],
            top: 0,
            used: 0,
            fifo: VecDeque::new(),
            nbands,
        }
    }
    /// Drop every entry
    pub fn reset(&mut self) {
        self.table.iter_mut().for_each(|e| *e = Entry::Empty);
        self.top = 0;
        self.used = 0;
        self.fifo.clear();
    }
    pub fn len(&self) -> usize {
        self.used
    }
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }
    /// Largest tile the arena could ever hold
    pub fn max_tile_size(&self) -> usize {
        self.heap.len() / 2
    }
    fn mask(&self) -> usize {
        self.table.len() - 1
    }
    fn probe(&self, id: BitmapId) -> impl Iterator<Item=usize> {
        let mask = self.mask();
        let start = id as usize & mask;
        let n = self.table.len();
        (0 .. n).map(move |k| (start + k * PROBE_STEP) & mask)
    }
    pub fn find(&self, id: BitmapId) -> Option<usize> {
        for i in self.probe(id) {
            match &self.table[i] {
                Entry::Empty => return None,
                Entry::Used(e) if e.id == id => return Some(i),
                _ => {},
            }
        }
        None
    }
    pub fn entry(&self, index: usize) -> Option<&TileEntry> {
        match self.table.get(index) {
            Some(Entry::Used(e)) => Some(e),
            _ => None,
        }
    }
    fn entry_mut(&mut self, index: usize) -> Option<&mut TileEntry> {
        match self.table.get_mut(index) {
            Some(Entry::Used(e)) => Some(e),
            _ => None,
        }
    }
    /// Bits of the entry at `index`
    pub fn bits(&self, index: usize) -> Option<&[u8]> {
        let e = self.entry(index)?;
        Some(&self.heap[e.slot.offset .. e.slot.offset + e.slot.size.data_size()])
    }
    pub fn band_has(&self, index: usize, band: usize) -> bool {
        self.entry(index).map(|e| e.bands.contains(band)).unwrap_or(false)
    }
    pub fn mark_band(&mut self, index: usize, band: usize) {
        if let Some(e) = self.entry_mut(index) {
            e.bands.insert(band);
        }
    }
    /// Forget every band's copy of every tile
    pub fn forget_bands(&mut self) {
        for e in self.table.iter_mut() {
            if let Entry::Used(e) = e {
                e.bands.clear();
            }
        }
    }
    /// Find `id` or add the bits under it, evicting and compacting as needed
    pub fn lookup_or_add(&mut self, id: BitmapId, size: TileSize, bits: &[u8]) -> Result<Lookup> {
        if let Some(i) = self.find(id) {
            return Ok(Lookup::Found(i));
        }
        let need = size.data_size();
        if need > self.max_tile_size() || bits.len() < need {
            return Err(ClistError::BitmapTooLarge { size: need, limit: self.max_tile_size() });
        }
        let max_used = self.table.len() * 3 / 4;
        while self.used + 1 > max_used || self.free_bytes() < need {
            if !self.evict_oldest() {
                return Err(ClistError::BitmapTooLarge { size: need, limit: self.free_bytes() });
            }
        }
        if self.top + need > self.heap.len() {
            self.compact();
        }
        let offset = self.top;
        self.heap[offset .. offset + need].copy_from_slice(&bits[.. need]);
        self.top += need;
        let index = self.probe(id)
            .find(|&i| !matches!(self.table[i], Entry::Used(_)))
            .ok_or_else(|| ClistError::malformed("tile index table full"))?;
        self.table[index] = Entry::Used(TileEntry {
            id,
            slot: SlotRef { offset, size },
            bands: BandMask::new(self.nbands),
        });
        self.used += 1;
        self.fifo.push_back(index);
        Ok(Lookup::Added(index))
    }
    fn live_bytes(&self) -> usize {
        self.table.iter().map(|e| match e {
            Entry::Used(e) => e.slot.size.data_size(),
            _ => 0,
        }).sum()
    }
    fn free_bytes(&self) -> usize {
        self.heap.len() - self.live_bytes()
    }
    fn evict_oldest(&mut self) -> bool {
        while let Some(i) = self.fifo.pop_front() {
            if let Entry::Used(e) = &self.table[i] {
                debug!(index = i, id = e.id, "evict tile");
                self.table[i] = Entry::Deleted;
                self.used -= 1;
                return true;
            }
        }
        false
    }
    /// Slide live slots down to the start of the arena
    ///
    /// Moved slots are forgotten by every band so their bits are sent again
    /// at the new offset. Returns the number of slots moved.
    pub fn compact(&mut self) -> usize {
        let mut live: Vec<usize> = self.table.iter().enumerate()
            .filter_map(|(i, e)| match e { Entry::Used(_) => Some(i), _ => None })
            .collect();
        live.sort_by_key(|&i| self.entry(i).map(|e| e.slot.offset).unwrap_or(0));
        let mut top = 0;
        let mut moved = 0;
        for i in live {
            let (offset, n) = match self.entry(i) {
                Some(e) => (e.slot.offset, e.slot.size.data_size()),
                None => continue,
            };
            if offset != top {
                self.heap.copy_within(offset .. offset + n, top);
                if let Some(e) = self.entry_mut(i) {
                    e.slot.offset = top;
                    e.bands.clear();
                }
                moved += 1;
            }
            top += n;
        }
        debug!(moved, top, "compacted tile arena");
        self.top = top;
        moved
    }
}
