//! Fixed-point path storage

use crate::clip::Rectangle;
use crate::state::{SegmentNotes, SN_NONE};
use crate::{Fixed, fixed2int, fixed2int_ceiling};

/// Point in fixed-point device coordinates
#[derive(Debug,Default,Copy,Clone,PartialEq,Eq)]
pub struct FixedPoint {
    pub x: Fixed,
    pub y: Fixed,
}

impl FixedPoint {
    pub fn new(x: Fixed, y: Fixed) -> Self {
        Self { x, y }
    }
}

/// Path element
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum Segment {
    MoveTo(FixedPoint),
    LineTo(FixedPoint, SegmentNotes),
    /// Two control points and the end point
    CurveTo(FixedPoint, FixedPoint, FixedPoint, SegmentNotes),
    Close,
}

/// Path made of subpaths in device space
#[derive(Debug,Default,Clone,PartialEq)]
pub struct Path {
    pub segments: Vec<Segment>,
    start: Option<FixedPoint>,
    current: Option<FixedPoint>,
}

impl Path {
    pub fn new() -> Self {
        Self { segments: vec![], start: None, current: None }
    }
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
    pub fn current_point(&self) -> Option<FixedPoint> {
        self.current
    }
    pub fn move_to(&mut self, x: Fixed, y: Fixed) {
        let p = FixedPoint::new(x, y);
        // Consecutive movetos collapse into the last one
        if let Some(Segment::MoveTo(_)) = self.segments.last() {
            self.segments.pop();
        }
        self.segments.push(Segment::MoveTo(p));
        self.start = Some(p);
        self.current = Some(p);
    }
    pub fn line_to(&mut self, x: Fixed, y: Fixed) {
        self.line_to_notes(x, y, SN_NONE);
    }
    pub fn line_to_notes(&mut self, x: Fixed, y: Fixed, notes: SegmentNotes) {
        self.ensure_start();
        let p = FixedPoint::new(x, y);
        self.segments.push(Segment::LineTo(p, notes));
        self.current = Some(p);
    }
    pub fn curve_to(&mut self, c1: FixedPoint, c2: FixedPoint, end: FixedPoint) {
        self.curve_to_notes(c1, c2, end, SN_NONE);
    }
    pub fn curve_to_notes(&mut self, c1: FixedPoint, c2: FixedPoint, end: FixedPoint, notes: SegmentNotes) {
        self.ensure_start();
        self.segments.push(Segment::CurveTo(c1, c2, end, notes));
        self.current = Some(end);
    }
    /// Close the current subpath, the current point returns to its start
    pub fn close_polygon(&mut self) {
        match self.segments.last() {
            None | Some(Segment::Close) | Some(Segment::MoveTo(_)) => return,
            _ => {},
        }
        self.segments.push(Segment::Close);
        self.current = self.start;
    }
    /// Rectangle as a closed four-sided subpath
    pub fn rectangle(&mut self, x0: Fixed, y0: Fixed, x1: Fixed, y1: Fixed) {
        self.move_to(x0, y0);
        self.line_to(x1, y0);
        self.line_to(x1, y1);
        self.line_to(x0, y1);
        self.close_polygon();
    }
    fn ensure_start(&mut self) {
        if self.current.is_none() {
            self.move_to(0, 0);
        }
    }
    /// Bounds of every point, control points included
    pub fn bounding_rect(&self) -> Option<Rectangle<Fixed>> {
        let mut r : Option<Rectangle<Fixed>> = None;
        let mut add = |p: &FixedPoint| {
            match r.as_mut() {
                Some(r) => r.expand(p.x, p.y),
                None => r = Some(Rectangle::new(p.x, p.y, p.x, p.y)),
            }
        };
        for s in &self.segments {
            match s {
                Segment::MoveTo(p) | Segment::LineTo(p, _) => add(p),
                Segment::CurveTo(a, b, c, _) => { add(a); add(b); add(c); },
                Segment::Close => {},
            }
        }
        r
    }
    /// Device rows [y, y + height) the path may touch
    pub fn row_span(&self) -> Option<(i32, i32)> {
        let r = self.bounding_rect()?;
        let y = fixed2int(r.y1);
        Some((y, fixed2int_ceiling(r.y2) - y))
    }
}
