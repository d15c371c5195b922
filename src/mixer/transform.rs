//! Placement transforms for composited sources.
//!
//! Sources live in normalized device coordinates: the image spans [-1, 1] on
//! both axes with y growing downward, and so does the output frame. A source's
//! placement is a 4×4 homogeneous transform from its own space into the
//! output's space; identity fills the whole frame.

use std::ops::Mul;

/// A column-major 4×4 transform stored as `[[f32; 4]; 4]`.
///
/// Each inner array is one column `[x, y, z, w]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Mat4 {
    pub cols: [[f32; 4]; 4],
}

impl Mat4 {
    pub const IDENTITY: Self = Self {
        cols: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    };

    #[inline]
    #[must_use]
    pub const fn from_cols(cols: [[f32; 4]; 4]) -> Self {
        Self { cols }
    }

    #[inline]
    #[must_use]
    pub const fn from_translation(x: f32, y: f32, z: f32) -> Self {
        Self {
            cols: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [x, y, z, 1.0],
            ],
        }
    }

    #[inline]
    #[must_use]
    pub const fn from_scale(sx: f32, sy: f32, sz: f32) -> Self {
        Self {
            cols: [
                [sx, 0.0, 0.0, 0.0],
                [0.0, sy, 0.0, 0.0],
                [0.0, 0.0, sz, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
        }
    }

    /// Rotation around the Z axis. With y pointing down, positive angles turn
    /// the image clockwise on screen.
    #[inline]
    #[must_use]
    pub fn from_rotation_z(radians: f32) -> Self {
        let (s, c) = radians.sin_cos();
        Self {
            cols: [
                [c, s, 0.0, 0.0],
                [-s, c, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
        }
    }

    /// Place a source inside the output rectangle `[x0, x1] × [y0, y1]`
    /// (normalized coordinates).
    #[must_use]
    pub fn from_rect(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self::from_translation((x0 + x1) * 0.5, (y0 + y1) * 0.5, 0.0)
            * Self::from_scale((x1 - x0) * 0.5, (y1 - y0) * 0.5, 1.0)
    }

    /// Apply to a point on the z = 0 plane, with perspective divide.
    /// Returns `None` when the point maps to infinity.
    pub fn transform_point(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        self.homography().apply(x, y)
    }

    pub fn is_finite(&self) -> bool {
        self.cols.iter().flatten().all(|v| v.is_finite())
    }

    /// The 3×3 homography this transform induces on the z = 0 plane
    /// (columns and rows 0, 1 and 3).
    pub fn homography(&self) -> Homography {
        let c = &self.cols;
        Homography {
            m: [
                [c[0][0], c[1][0], c[3][0]],
                [c[0][1], c[1][1], c[3][1]],
                [c[0][3], c[1][3], c[3][3]],
            ],
        }
    }

    /// Inverse of the z = 0 plane homography, `None` if it is singular.
    pub fn planar_inverse(&self) -> Option<Homography> {
        self.homography().inverse()
    }
}

impl Default for Mat4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mul for Mat4 {
    type Output = Self;

    #[inline]
    fn mul(self, rhs: Self) -> Self {
        let a = &self.cols;
        let b = &rhs.cols;
        let mut out = [[0.0_f32; 4]; 4];
        for (j, col) in out.iter_mut().enumerate() {
            for (i, v) in col.iter_mut().enumerate() {
                *v = a[0][i] * b[j][0] + a[1][i] * b[j][1] + a[2][i] * b[j][2] + a[3][i] * b[j][3];
            }
        }
        Self { cols: out }
    }
}

/// Row-major 3×3 projective map of the plane
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Homography {
    pub m: [[f32; 3]; 3],
}

impl Homography {
    #[inline]
    pub fn apply(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let m = &self.m;
        let w = m[2][0] * x + m[2][1] * y + m[2][2];
        if w.abs() <= f32::EPSILON {
            return None;
        }
        let px = (m[0][0] * x + m[0][1] * y + m[0][2]) / w;
        let py = (m[1][0] * x + m[1][1] * y + m[1][2]) / w;
        Some((px, py))
    }

    pub fn inverse(&self) -> Option<Self> {
        let m = &self.m;
        let cof = [
            [
                m[1][1] * m[2][2] - m[1][2] * m[2][1],
                m[0][2] * m[2][1] - m[0][1] * m[2][2],
                m[0][1] * m[1][2] - m[0][2] * m[1][1],
            ],
            [
                m[1][2] * m[2][0] - m[1][0] * m[2][2],
                m[0][0] * m[2][2] - m[0][2] * m[2][0],
                m[0][2] * m[1][0] - m[0][0] * m[1][2],
            ],
            [
                m[1][0] * m[2][1] - m[1][1] * m[2][0],
                m[0][1] * m[2][0] - m[0][0] * m[2][1],
                m[0][0] * m[1][1] - m[0][1] * m[1][0],
            ],
        ];
        let det = m[0][0] * cof[0][0] + m[0][1] * cof[1][0] + m[0][2] * cof[2][0];
        if !det.is_finite() || det.abs() < 1e-12 {
            return None;
        }
        let inv = 1.0 / det;
        let mut out = [[0.0_f32; 3]; 3];
        for (i, row) in out.iter_mut().enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                *v = cof[i][j] * inv;
            }
        }
        Some(Self { m: out })
    }
}

/// Orientation of a captured buffer, applied before its placement transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Up,
    /// Rotated 90° clockwise
    Right,
    /// Rotated 180°
    Down,
    /// Rotated 270° clockwise
    Left,
}

impl Orientation {
    /// Map a broadcast-extension orientation code (1, 6, 3, 8).
    /// Unknown codes read as upright.
    pub fn from_code(code: u32) -> Self {
        match code {
            6 => Orientation::Right,
            3 => Orientation::Down,
            8 => Orientation::Left,
            _ => Orientation::Up,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Orientation::Up => 1,
            Orientation::Right => 6,
            Orientation::Down => 3,
            Orientation::Left => 8,
        }
    }

    /// Exact quarter-turn rotation in normalized source space
    pub fn matrix(&self) -> Mat4 {
        let (c, s) = match self {
            Orientation::Up => return Mat4::IDENTITY,
            Orientation::Right => (0.0, 1.0),
            Orientation::Down => (-1.0, 0.0),
            Orientation::Left => (0.0, -1.0),
        };
        Mat4::from_cols([
            [c, s, 0.0, 0.0],
            [-s, c, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }
}
