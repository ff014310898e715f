//! Pinhole camera model with per-level intrinsics.

use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

use crate::error::DvoError;

/// Points closer than this to the image plane cannot be projected.
pub const MIN_PROJECTION_DEPTH: f64 = 1e-6;

/// Pinhole intrinsics for the finest pyramid level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    /// Create intrinsics, rejecting non-finite values and non-positive focal lengths.
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Result<Self, DvoError> {
        let camera = Self { fx, fy, cx, cy };
        if camera.is_valid() {
            Ok(camera)
        } else {
            Err(DvoError::InvalidIntrinsics { fx, fy, cx, cy })
        }
    }

    pub fn is_valid(&self) -> bool {
        [self.fx, self.fy, self.cx, self.cy]
            .iter()
            .all(|v| v.is_finite())
            && self.fx > 0.0
            && self.fy > 0.0
    }

    /// Intrinsics for pyramid level `level`, assuming each level is built by
    /// 2x2 block averaging of the one below it.
    ///
    /// Pixel centers shift under averaging, hence `(c + 0.5) / 2^l - 0.5`
    /// for the principal point.
    pub fn at_level(&self, level: usize) -> Self {
        let scale = 1.0 / (1u64 << level) as f64;
        Self {
            fx: self.fx * scale,
            fy: self.fy * scale,
            cx: (self.cx + 0.5) * scale - 0.5,
            cy: (self.cy + 0.5) * scale - 0.5,
        }
    }

    /// Project a camera-frame point to pixel coordinates.
    pub fn project(&self, point: &Point3<f64>) -> Option<Point2<f64>> {
        if point.z <= MIN_PROJECTION_DEPTH || !point.z.is_finite() {
            return None;
        }
        let inv_z = 1.0 / point.z;
        Some(Point2::new(
            self.fx * point.x * inv_z + self.cx,
            self.fy * point.y * inv_z + self.cy,
        ))
    }

    /// Back-project pixel `(u, v)` at depth `z` into the camera frame.
    pub fn back_project(&self, u: f64, v: f64, z: f64) -> Point3<f64> {
        Point3::new((u - self.cx) * z / self.fx, (v - self.cy) * z / self.fy, z)
    }
}
