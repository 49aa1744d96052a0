//! Transformation matrix
//!
//! Stored as single-precision coefficients, the width they travel with on
//! the wire.

#[derive(Debug,Default,Copy,Clone,PartialEq)]
pub struct Matrix {
    pub xx: f32,
    pub xy: f32,
    pub yx: f32,
    pub yy: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Matrix {
    /// Identity
    pub fn new() -> Self {
        Self { xx: 1.0, xy: 0.0,
               yx: 0.0, yy: 1.0,
               tx: 0.0, ty: 0.0,
        }
    }
    pub fn from_coeffs(c: [f32; 6]) -> Self {
        Self { xx: c[0], xy: c[1], yx: c[2], yy: c[3], tx: c[4], ty: c[5] }
    }
    pub fn coeffs(&self) -> [f32; 6] {
        [self.xx, self.xy, self.yx, self.yy, self.tx, self.ty]
    }
    pub fn translate(&mut self, dx: f32, dy: f32) {
        self.tx += dx;
        self.ty += dy;
    }
    pub fn transform(&self, x: f32, y: f32) -> (f32, f32) {
        (x * self.xx + y * self.yx + self.tx,
         x * self.xy + y * self.yy + self.ty)
    }
    /// Apply self, then m
    pub fn multiply(&self, m: &Matrix) -> Matrix {
        Matrix {
            xx: self.xx * m.xx + self.xy * m.yx,
            xy: self.xx * m.xy + self.xy * m.yy,
            yx: self.yx * m.xx + self.yy * m.yx,
            yy: self.yx * m.xy + self.yy * m.yy,
            tx: self.tx * m.xx + self.ty * m.yx + m.tx,
            ty: self.tx * m.xy + self.ty * m.yy + m.ty,
        }
    }
    pub fn determinant(&self) -> f32 {
        self.xx * self.yy - self.xy * self.yx
    }
    /// None for a singular matrix
    pub fn invert(&self) -> Option<Matrix> {
        let d = self.determinant();
        if d == 0.0 || !d.is_finite() {
            return None;
        }
        let xx = self.yy / d;
        let xy = -self.xy / d;
        let yx = -self.yx / d;
        let yy = self.xx / d;
        Some(Matrix {
            xx, xy, yx, yy,
            tx: -(self.tx * xx + self.ty * yx),
            ty: -(self.tx * xy + self.ty * yy),
        })
    }
}
