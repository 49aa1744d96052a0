//! Clipping Region

use crate::device::TargetDevice;
use crate::error::Result;
use crate::state::ColorIndex;

/// Rectangle
#[derive(Debug,Default,Copy,Clone,PartialEq,Eq)]
pub struct Rectangle<T: std::cmp::PartialOrd + Copy> {
    /// Minimum x value
    pub x1: T,
    /// Minimum y value
    pub y1: T,
    /// Maximum x value (exclusive)
    pub x2: T,
    /// Maximum y value (exclusive)
    pub y2: T,
}
impl<T> Rectangle<T> where T: std::cmp::PartialOrd + Copy {
    /// Create a new Rectangle
    ///
    /// Values are sorted before storing
    pub fn new(x1: T, y1: T, x2: T, y2: T) -> Self {
        let (x1, x2) = if x1 > x2 { (x2,x1) } else { (x1,x2) };
        let (y1, y2) = if y1 > y2 { (y2,y1) } else { (y1,y2) };
        Self { x1,y1,x2,y2 }
    }
    /// Expand if the point (x,y) is outside
    pub fn expand(&mut self, x: T, y: T) {
        if x < self.x1 { self.x1 = x; }
        if x > self.x2 { self.x2 = x; }
        if y < self.y1 { self.y1 = y; }
        if y > self.y2 { self.y2 = y; }
    }
}

/// Device-space rectangle, half open on the maximum side
pub type IntRect = Rectangle<i32>;

impl Rectangle<i32> {
    /// Rectangle from origin and size
    pub fn from_xywh(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x1: x, y1: y, x2: x + w, y2: y + h }
    }
    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }
    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }
    pub fn is_empty(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }
    pub fn intersect(&self, r: &IntRect) -> Option<IntRect> {
        let out = IntRect {
            x1: self.x1.max(r.x1), y1: self.y1.max(r.y1),
            x2: self.x2.min(r.x2), y2: self.y2.min(r.y2),
        };
        if out.is_empty() { None } else { Some(out) }
    }
    pub fn contains(&self, r: &IntRect) -> bool {
        r.x1 >= self.x1 && r.y1 >= self.y1 && r.x2 <= self.x2 && r.y2 <= self.y2
    }
    /// Pieces of self not covered by r
    pub fn subtract(&self, r: &IntRect) -> Vec<IntRect> {
        let i = match self.intersect(r) {
            Some(i) => i,
            None => return vec![*self],
        };
        let mut out = vec![];
        if i.y1 > self.y1 {
            out.push(IntRect { x1: self.x1, y1: self.y1, x2: self.x2, y2: i.y1 });
        }
        if i.y2 < self.y2 {
            out.push(IntRect { x1: self.x1, y1: i.y2, x2: self.x2, y2: self.y2 });
        }
        if i.x1 > self.x1 {
            out.push(IntRect { x1: self.x1, y1: i.y1, x2: i.x1, y2: i.y2 });
        }
        if i.x2 < self.x2 {
            out.push(IntRect { x1: i.x2, y1: i.y1, x2: self.x2, y2: i.y2 });
        }
        out
    }
}

/// Clip path as seen by the writer
///
/// Identity is carried by `id`: a changed id forces every band to be
/// sent the clip again.
#[derive(Debug,Clone,PartialEq)]
pub struct ClipPath {
    pub id: u64,
    pub rects: Vec<IntRect>,
    /// Clip to the complement of the rectangles
    pub outside: bool,
}

impl ClipPath {
    pub fn new(id: u64, rects: Vec<IntRect>) -> Self {
        Self { id, rects, outside: false }
    }
    pub fn outside(id: u64, rects: Vec<IntRect>) -> Self {
        Self { id, rects, outside: true }
    }
    /// Rectangles touching rows [ymin, ymax)
    pub fn rects_in_rows(&self, ymin: i32, ymax: i32) -> impl Iterator<Item=&IntRect> {
        self.rects.iter()
            .filter(move |r| r.x2 > r.x1 && r.y1 < ymax && r.y2 > ymin)
    }
}

/// Reconstructed clip on the reading side
#[derive(Debug,Clone,Default,PartialEq)]
pub struct ClipList {
    pub rects: Vec<IntRect>,
    pub outside: bool,
}

impl ClipList {
    /// Overlapping rectangles are split so the stored ones are disjoint
    pub fn new(rects: Vec<IntRect>, outside: bool) -> Self {
        let mut disjoint: Vec<IntRect> = Vec::with_capacity(rects.len());
        for r in rects.into_iter().filter(|r| !r.is_empty()) {
            let mut pieces = vec![r];
            for d in &disjoint {
                pieces = pieces.iter().flat_map(|p| p.subtract(d)).collect();
            }
            disjoint.extend(pieces);
        }
        Self { rects: disjoint, outside }
    }
    /// True if nothing in `area` is clipped away
    pub fn covers(&self, area: &IntRect) -> bool {
        if self.outside {
            return self.rects.iter().all(|r| r.intersect(area).is_none());
        }
        if area.is_empty() {
            return true;
        }
        let covered: i64 = self.rects.iter()
            .filter_map(|r| r.intersect(area))
            .map(|i| i64::from(i.width()) * i64::from(i.height()))
            .sum();
        covered == i64::from(area.width()) * i64::from(area.height())
    }
    /// Visible parts of `rect`
    pub fn intersections(&self, rect: &IntRect) -> Vec<IntRect> {
        if self.outside {
            let mut pieces = vec![*rect];
            for c in &self.rects {
                pieces = pieces.iter().flat_map(|p| p.subtract(c)).collect();
            }
            pieces
        } else {
            self.rects.iter().filter_map(|c| c.intersect(rect)).collect()
        }
    }
}

/// Target that collects clip rectangles between begin_clip and end_clip
#[derive(Debug,Default)]
pub struct ClipAccumulator {
    pub rects: Vec<IntRect>,
    target_box: IntRect,
}

impl ClipAccumulator {
    pub fn new(target_box: IntRect) -> Self {
        Self { rects: vec![], target_box }
    }
    pub fn finish(self, outside: bool) -> ClipList {
        ClipList::new(self.rects, outside)
    }
}

impl TargetDevice for ClipAccumulator {
    fn fill_rectangle(&mut self, rect: IntRect, _color: ColorIndex) -> Result<()> {
        if !rect.is_empty() {
            self.rects.push(rect);
        }
        Ok(())
    }
    fn get_clipping_box(&self) -> IntRect {
        self.target_box
    }
}
