//! Synthetic RGB-D frames with known ground truth.
//!
//! A [`SyntheticScene`] is a textured fronto-parallel plane at a fixed depth
//! in front of the reference camera. Rendering it from another pose ray-casts
//! every pixel of every pyramid level against the plane, so the intensity and
//! depth of each level are exact and no downsampling filter is involved.

use std::f64::consts::PI;

use nalgebra::{DMatrix, Vector3};

use crate::camera::Intrinsics;
use crate::error::DvoError;
use crate::pose::Pose;
use crate::pyramid::{FramePyramid, PyramidLevel};

/// Texture painted on the plane, in plane coordinates (meters).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SceneTexture {
    /// Sum of sinusoids; smooth gradients everywhere.
    Smooth,
    /// Two-tone checkerboard with square cells of side `cell`. Levels carry
    /// an edge mask along the cell borders.
    Checker { cell: f64 },
}

impl SceneTexture {
    fn intensity(&self, x: f64, y: f64) -> f64 {
        match *self {
            SceneTexture::Smooth => {
                128.0
                    + 50.0 * (2.0 * PI * x / 0.5).sin()
                    + 40.0 * (2.0 * PI * y / 0.45).cos()
                    + 20.0 * (2.0 * PI * (x + y) / 0.9).sin()
            }
            SceneTexture::Checker { cell } => {
                if checker_parity(x, y, cell) {
                    190.0
                } else {
                    60.0
                }
            }
        }
    }
}

fn checker_parity(x: f64, y: f64, cell: f64) -> bool {
    let i = (x / cell).floor() as i64;
    let j = (y / cell).floor() as i64;
    (i + j).rem_euclid(2) == 0
}

/// Textured plane at `depth` meters seen by a pinhole camera.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    pub width: usize,
    pub height: usize,
    pub depth: f64,
    pub texture: SceneTexture,
    pub num_levels: usize,
    /// Level-0 intrinsics.
    pub camera: Intrinsics,
}

impl Default for SyntheticScene {
    fn default() -> Self {
        Self::new(320, 240, 2.0, SceneTexture::Smooth, 3)
    }
}

impl SyntheticScene {
    /// Focal length scales with the width (300 px at 320 px wide).
    pub fn new(
        width: usize,
        height: usize,
        depth: f64,
        texture: SceneTexture,
        num_levels: usize,
    ) -> Self {
        let f = 300.0 * width as f64 / 320.0;
        Self {
            width,
            height,
            depth,
            texture,
            num_levels,
            camera: Intrinsics {
                fx: f,
                fy: f,
                cx: (width as f64 - 1.0) / 2.0,
                cy: (height as f64 - 1.0) / 2.0,
            },
        }
    }

    /// Render the scene seen from `pose` (reference to camera).
    ///
    /// Pixels whose ray misses the plane get depth 0.
    pub fn render(&self, pose: &Pose) -> Result<FramePyramid, DvoError> {
        let levels = (0..self.num_levels)
            .map(|l| self.render_level(pose, l))
            .collect::<Result<Vec<_>, _>>()?;
        FramePyramid::new(levels)
    }

    fn render_level(&self, pose: &Pose, level: usize) -> Result<PyramidLevel, DvoError> {
        let camera = self.camera.at_level(level);
        let cols = self.width >> level;
        let rows = self.height >> level;
        let rt = pose.rotation.transpose();
        let offset = (rt * pose.translation).z;

        // Reference-frame plane coordinates and depth for every pixel.
        let mut plane: DMatrix<Option<(f64, f64, f64)>> = DMatrix::from_element(rows, cols, None);
        for r in 0..rows {
            for c in 0..cols {
                let ray = Vector3::new(
                    (c as f64 - camera.cx) / camera.fx,
                    (r as f64 - camera.cy) / camera.fy,
                    1.0,
                );
                let along = (rt * ray).z;
                if along.abs() < 1e-12 {
                    continue;
                }
                let s = (self.depth + offset) / along;
                if s <= 0.0 {
                    continue;
                }
                let x_ref = rt * (ray * s - pose.translation);
                plane[(r, c)] = Some((x_ref.x, x_ref.y, s));
            }
        }

        let intensity = plane.map(|p| match p {
            Some((x, y, _)) => self.texture.intensity(x, y),
            None => 0.0,
        });
        let depth = plane.map(|p| p.map_or(0.0, |(_, _, z)| z));
        let frame = PyramidLevel::new(intensity, depth)?;

        match self.texture {
            SceneTexture::Smooth => Ok(frame),
            SceneTexture::Checker { cell } => {
                let parity = plane.map(|p| p.map(|(x, y, _)| checker_parity(x, y, cell)));
                let mask = DMatrix::from_fn(rows, cols, |r, c| {
                    let here = parity[(r, c)];
                    let right = (c + 1 < cols).then(|| parity[(r, c + 1)]);
                    let below = (r + 1 < rows).then(|| parity[(r + 1, c)]);
                    here.is_some()
                        && [right, below]
                            .into_iter()
                            .flatten()
                            .any(|n| n.is_some() && n != here)
                });
                frame.with_edges(mask)
            }
        }
    }
}

/// Copy of `pyramid` with every depth of `level` set to 0 (invalid).
pub fn with_invalid_depth(pyramid: &FramePyramid, level: usize) -> FramePyramid {
    let mut out = pyramid.clone();
    if let Some(l) = out.level_mut(level) {
        l.depth.fill(0.0);
    }
    out
}
