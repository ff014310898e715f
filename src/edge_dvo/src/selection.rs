//! Selection of reference pixels for direct alignment.
//!
//! Only pixels carrying information about the motion are kept: valid depth
//! and either a strong intensity gradient or membership in the edge map.
//! Selected pixels are back-projected into the reference camera frame.

use nalgebra::{DMatrix, Point2, Point3};
use serde::{Deserialize, Serialize};

use crate::camera::Intrinsics;
use crate::pyramid::PyramidLevel;

/// Parameters controlling which pixels become alignment points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Minimum L1 gradient magnitude `|gx| + |gy|` (intensity units per pixel).
    pub grad_thresh: f64,

    /// Depth range accepted as a valid measurement.
    pub min_depth: f64,
    pub max_depth: f64,

    /// Select edge-map pixels instead of thresholding the intensity gradient.
    pub use_edge_mask: bool,

    /// Cap on the number of points per level. Points are subsampled with a
    /// uniform stride so they stay spread over the image.
    pub max_points: Option<usize>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            grad_thresh: 10.0,
            min_depth: 0.1,
            max_depth: 10.0,
            use_edge_mask: false,
            max_points: None,
        }
    }
}

impl SelectionConfig {
    pub fn is_valid_depth(&self, z: f64) -> bool {
        z.is_finite() && z > 0.0 && z >= self.min_depth && z <= self.max_depth
    }
}

/// Points selected on one level of a reference frame.
///
/// All vectors are parallel and in row-major frame order.
#[derive(Debug, Clone)]
pub struct PointSet {
    pub points_3d: Vec<Point3<f64>>,
    pub points_2d: Vec<Point2<f64>>,
    /// Reference intensity at each selected pixel.
    pub intensities: Vec<f64>,
    /// Pixels backing `points_2d`, one per selected point.
    pub mask: DMatrix<bool>,
}

impl PointSet {
    pub fn empty(rows: usize, cols: usize) -> Self {
        Self {
            points_3d: Vec::new(),
            points_2d: Vec::new(),
            intensities: Vec::new(),
            mask: DMatrix::from_element(rows, cols, false),
        }
    }

    pub fn len(&self) -> usize {
        self.points_3d.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points_3d.is_empty()
    }
}

/// Select alignment points on `level`, back-projected with `camera`
/// (the intrinsics of that level).
///
/// The outermost pixel ring is skipped since gradients there are one-sided.
pub fn select(level: &PyramidLevel, camera: &Intrinsics, config: &SelectionConfig) -> PointSet {
    let (rows, cols) = level.shape();
    let mut set = PointSet::empty(rows, cols);
    if rows < 3 || cols < 3 {
        return set;
    }

    let edge_mask = if config.use_edge_mask {
        level.edges.as_ref().map(|e| &e.mask)
    } else {
        None
    };

    let mut pixels = Vec::new();
    for v in 1..rows - 1 {
        for u in 1..cols - 1 {
            let z = level.depth[(v, u)];
            if !config.is_valid_depth(z) {
                continue;
            }
            let selected = match edge_mask {
                Some(mask) => mask[(v, u)],
                None => {
                    let magnitude = level.gradient_x[(v, u)].abs() + level.gradient_y[(v, u)].abs();
                    magnitude > config.grad_thresh
                }
            };
            if selected {
                pixels.push((u, v));
            }
        }
    }

    let pixels = match config.max_points {
        Some(max) if pixels.len() > max => subsample(&pixels, max),
        _ => pixels,
    };

    set.points_3d.reserve(pixels.len());
    set.points_2d.reserve(pixels.len());
    set.intensities.reserve(pixels.len());
    for (u, v) in pixels {
        set.mask[(v, u)] = true;
        let z = level.depth[(v, u)];
        set.points_3d.push(camera.back_project(u as f64, v as f64, z));
        set.points_2d.push(Point2::new(u as f64, v as f64));
        set.intensities.push(level.intensity[(v, u)]);
    }
    set
}

/// Keep `count` items with a uniform stride, preserving order.
fn subsample<T: Copy>(items: &[T], count: usize) -> Vec<T> {
    let n = items.len();
    (0..count).map(|i| items[i * n / count]).collect()
}
