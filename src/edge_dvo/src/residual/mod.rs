//! Residual fields sampled at reprojected reference points.
//!
//! A [`ResidualField`] decides what is compared once a reference point has
//! been warped into the current image:
//!
//! - [`IntensityField`]: photometric error `I_cur(warp(p)) - I_ref(p)`.
//! - [`DistanceTransformField`]: distance from `warp(p)` to the nearest edge
//!   of the current frame. Reference points are edge pixels, so a perfect
//!   alignment drives every residual to zero.
//!
//! Jacobian assembly and the solver are shared; only sampling differs.

pub mod builder;
pub mod interpolate;

pub use builder::{build_residuals, is_inside_valid_region, ResidualSet, INVALID_RESIDUAL};
pub use interpolate::{bilinear, nearest};

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::pyramid::PyramidLevel;

/// Value and image-space gradient of a residual field at a sub-pixel location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSample {
    pub value: f64,
    pub grad_u: f64,
    pub grad_v: f64,
}

/// Which residual formulation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidualKind {
    #[default]
    Intensity,
    DistanceTransform,
}

/// Strategy for sampling the current frame.
pub trait ResidualField: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> ResidualKind;

    /// Whether pyramid levels must carry an [`EdgeField`](crate::pyramid::EdgeField).
    fn uses_edges(&self) -> bool {
        false
    }

    /// Sample the current level at `(u, v)`; `None` if it cannot be sampled.
    fn sample(&self, level: &PyramidLevel, u: f64, v: f64) -> Option<FieldSample>;

    /// Residual for a sample given the reference intensity of the point.
    fn residual(&self, sample: &FieldSample, reference_intensity: f64) -> f64;
}

/// Photometric residual with bilinear interpolation.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntensityField;

impl ResidualField for IntensityField {
    fn kind(&self) -> ResidualKind {
        ResidualKind::Intensity
    }

    fn sample(&self, level: &PyramidLevel, u: f64, v: f64) -> Option<FieldSample> {
        Some(FieldSample {
            value: bilinear(&level.intensity, u, v)?,
            grad_u: bilinear(&level.gradient_x, u, v)?,
            grad_v: bilinear(&level.gradient_y, u, v)?,
        })
    }

    fn residual(&self, sample: &FieldSample, reference_intensity: f64) -> f64 {
        sample.value - reference_intensity
    }
}

/// Geometric residual read from the distance transform of the edge map.
#[derive(Debug, Clone, Copy, Default)]
pub struct DistanceTransformField {
    /// Bilinear instead of nearest-pixel sampling.
    pub interpolate: bool,
    /// Rescale distances so the largest one maps to 255, putting the
    /// residuals on the same footing as intensity values.
    pub scale_to_byte_range: bool,
}

impl ResidualField for DistanceTransformField {
    fn kind(&self) -> ResidualKind {
        ResidualKind::DistanceTransform
    }

    fn uses_edges(&self) -> bool {
        true
    }

    fn sample(&self, level: &PyramidLevel, u: f64, v: f64) -> Option<FieldSample> {
        let edges = level.edges.as_ref()?;
        let scale = if self.scale_to_byte_range && edges.max_distance > 0.0 {
            255.0 / edges.max_distance
        } else {
            1.0
        };
        let read: fn(&DMatrix<f64>, f64, f64) -> Option<f64> =
            if self.interpolate { bilinear } else { nearest };
        Some(FieldSample {
            value: read(&edges.distance, u, v)? * scale,
            grad_u: read(&edges.gradient_x, u, v)? * scale,
            grad_v: read(&edges.gradient_y, u, v)? * scale,
        })
    }

    fn residual(&self, sample: &FieldSample, _reference_intensity: f64) -> f64 {
        sample.value
    }
}

/// Construct the field for `kind` with the distance-transform options.
pub fn residual_field(
    kind: ResidualKind,
    interpolate_distance_transform: bool,
    scale_distance_transform: bool,
) -> Box<dyn ResidualField> {
    match kind {
        ResidualKind::Intensity => Box::new(IntensityField),
        ResidualKind::DistanceTransform => Box::new(DistanceTransformField {
            interpolate: interpolate_distance_transform,
            scale_to_byte_range: scale_distance_transform,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp_level() -> PyramidLevel {
        let intensity = DMatrix::from_fn(10, 10, |v, u| 10.0 * u as f64 + v as f64);
        let mut mask = DMatrix::from_element(10, 10, false);
        for v in 0..10 {
            mask[(v, 2)] = true;
        }
        PyramidLevel::new(intensity, DMatrix::from_element(10, 10, 1.0))
            .unwrap()
            .with_edges(mask)
            .unwrap()
    }

    #[test]
    fn test_intensity_field() {
        let level = ramp_level();
        let field = IntensityField;
        let s = field.sample(&level, 4.5, 3.25).unwrap();
        assert_relative_eq!(s.value, 48.25, epsilon = 1e-12);
        assert_relative_eq!(s.grad_u, 10.0, epsilon = 1e-12);
        assert_relative_eq!(s.grad_v, 1.0, epsilon = 1e-12);
        assert_relative_eq!(field.residual(&s, 40.0), 8.25, epsilon = 1e-12);
    }

    #[test]
    fn test_distance_field_nearest_and_bilinear() {
        let level = ramp_level();
        let nearest_field = DistanceTransformField::default();
        let s = nearest_field.sample(&level, 5.4, 3.0).unwrap();
        assert_relative_eq!(s.value, 3.0);
        assert_relative_eq!(nearest_field.residual(&s, 123.0), 3.0);

        let smooth = DistanceTransformField {
            interpolate: true,
            scale_to_byte_range: false,
        };
        let s = smooth.sample(&level, 5.4, 3.0).unwrap();
        assert_relative_eq!(s.value, 3.4, epsilon = 1e-12);
        assert_relative_eq!(s.grad_u, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_distance_field_scaling() {
        let level = ramp_level();
        let max = level.edges.as_ref().unwrap().max_distance;
        assert_relative_eq!(max, 7.0);
        let field = DistanceTransformField {
            interpolate: false,
            scale_to_byte_range: true,
        };
        let s = field.sample(&level, 9.0, 0.0).unwrap();
        assert_relative_eq!(s.value, 255.0, epsilon = 1e-12);
    }

    #[test]
    fn test_distance_field_requires_edges() {
        let level = PyramidLevel::new(DMatrix::zeros(4, 4), DMatrix::zeros(4, 4)).unwrap();
        let field = residual_field(ResidualKind::DistanceTransform, false, false);
        assert!(field.uses_edges());
        assert!(field.sample(&level, 1.0, 1.0).is_none());
        assert_eq!(field.kind(), ResidualKind::DistanceTransform);
    }
}
