//! Image pyramids for reference and current frames.
//!
//! Level 0 is the finest resolution; each following level has half the
//! width and height (rounded either way). Every level stores intensity,
//! depth, intensity gradients and, for the edge formulation, an edge map
//! with its distance transform.
//!
//! Images are `DMatrix<f64>` indexed as `(v, u)`: rows are image rows.
//! A depth of zero (or any non-finite value) marks a missing measurement.

pub mod distance;
pub mod gradient;

pub use distance::distance_transform;
pub use gradient::image_gradient;

use nalgebra::DMatrix;

use crate::error::DvoError;

/// Edge map of one level with its distance transform.
#[derive(Debug, Clone)]
pub struct EdgeField {
    pub mask: DMatrix<bool>,
    /// Distance in pixels to the nearest edge pixel.
    pub distance: DMatrix<f64>,
    pub gradient_x: DMatrix<f64>,
    pub gradient_y: DMatrix<f64>,
    /// Largest value in `distance`, used to rescale to 0..255.
    pub max_distance: f64,
}

impl EdgeField {
    pub fn from_mask(mask: DMatrix<bool>) -> Self {
        let distance = distance_transform(&mask);
        let (gradient_x, gradient_y) = image_gradient(&distance);
        let max_distance = distance.iter().copied().fold(0.0, f64::max);
        Self {
            mask,
            distance,
            gradient_x,
            gradient_y,
            max_distance,
        }
    }

    pub fn num_edges(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }
}

/// One resolution level of a frame.
#[derive(Debug, Clone)]
pub struct PyramidLevel {
    pub intensity: DMatrix<f64>,
    pub depth: DMatrix<f64>,
    pub gradient_x: DMatrix<f64>,
    pub gradient_y: DMatrix<f64>,
    pub edges: Option<EdgeField>,
}

impl PyramidLevel {
    /// Build a level from intensity and depth; gradients are computed here.
    pub fn new(intensity: DMatrix<f64>, depth: DMatrix<f64>) -> Result<Self, DvoError> {
        if intensity.shape() != depth.shape() {
            return Err(DvoError::ShapeMismatch {
                level: 0,
                expected: intensity.shape(),
                actual: depth.shape(),
            });
        }
        let (gradient_x, gradient_y) = image_gradient(&intensity);
        Ok(Self {
            intensity,
            depth,
            gradient_x,
            gradient_y,
            edges: None,
        })
    }

    /// Attach an edge map (e.g. from an external edge detector).
    pub fn with_edges(mut self, mask: DMatrix<bool>) -> Result<Self, DvoError> {
        if mask.shape() != self.intensity.shape() {
            return Err(DvoError::ShapeMismatch {
                level: 0,
                expected: self.intensity.shape(),
                actual: mask.shape(),
            });
        }
        self.edges = Some(EdgeField::from_mask(mask));
        Ok(self)
    }

    pub fn width(&self) -> usize {
        self.intensity.ncols()
    }

    pub fn height(&self) -> usize {
        self.intensity.nrows()
    }

    /// `(height, width)`, matching `DMatrix::shape`.
    pub fn shape(&self) -> (usize, usize) {
        self.intensity.shape()
    }
}

/// All levels of one frame, finest first.
#[derive(Debug, Clone)]
pub struct FramePyramid {
    levels: Vec<PyramidLevel>,
}

impl FramePyramid {
    /// Validate and wrap pre-built levels.
    ///
    /// Each level must have half the size of the previous one (floor or
    /// ceil), so that intrinsics can be derived with [`Intrinsics::at_level`].
    ///
    /// [`Intrinsics::at_level`]: crate::camera::Intrinsics::at_level
    pub fn new(levels: Vec<PyramidLevel>) -> Result<Self, DvoError> {
        if levels.is_empty() {
            return Err(DvoError::EmptyPyramid);
        }
        for (i, pair) in levels.windows(2).enumerate() {
            let (rows, cols) = pair[0].shape();
            let actual = pair[1].shape();
            let halves = |n: usize, m: usize| m == n / 2 || m == n.div_ceil(2);
            if !halves(rows, actual.0) || !halves(cols, actual.1) {
                return Err(DvoError::ShapeMismatch {
                    level: i + 1,
                    expected: (rows / 2, cols / 2),
                    actual,
                });
            }
        }
        Ok(Self { levels })
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, index: usize) -> Option<&PyramidLevel> {
        self.levels.get(index)
    }

    /// Mutable access for in-place edits that keep the level shape.
    pub(crate) fn level_mut(&mut self, index: usize) -> Option<&mut PyramidLevel> {
        self.levels.get_mut(index)
    }

    pub fn levels(&self) -> &[PyramidLevel] {
        &self.levels
    }

    pub fn into_levels(self) -> Vec<PyramidLevel> {
        self.levels
    }

    /// Check that `other` has the same number of levels and level shapes.
    pub fn check_compatible(&self, other: &FramePyramid) -> Result<(), DvoError> {
        if self.num_levels() != other.num_levels() {
            return Err(DvoError::LevelCountMismatch {
                reference: self.num_levels(),
                current: other.num_levels(),
            });
        }
        for (i, (a, b)) in self.levels.iter().zip(&other.levels).enumerate() {
            if a.shape() != b.shape() {
                return Err(DvoError::ShapeMismatch {
                    level: i,
                    expected: a.shape(),
                    actual: b.shape(),
                });
            }
        }
        Ok(())
    }
}
