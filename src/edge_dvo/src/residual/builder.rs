//! Per-point residuals and Jacobian rows under a candidate pose.
//!
//! Output vectors always have one slot per selected point so that indices
//! stay aligned with the [`PointSet`]. Points that cannot be evaluated carry
//! [`INVALID_RESIDUAL`] and `valid[i] == false`; they contribute nothing to
//! the normal equations or the energy.

use nalgebra::{Point2, Vector3, Vector6};
use rayon::prelude::*;

use super::ResidualField;
use crate::camera::{Intrinsics, MIN_PROJECTION_DEPTH};
use crate::pose::Pose;
use crate::pyramid::PyramidLevel;
use crate::selection::PointSet;

/// Sentinel stored for points that are not visible in the current frame.
pub const INVALID_RESIDUAL: f64 = f64::NAN;

/// Half-pixel margin: a reprojection is usable iff
/// `0.5 <= u <= width - 1.5` and `0.5 <= v <= height - 1.5`.
pub fn is_inside_valid_region(u: f64, v: f64, width: usize, height: usize) -> bool {
    u >= 0.5 && v >= 0.5 && u <= width as f64 - 1.5 && v <= height as f64 - 1.5
}

/// Residuals, Jacobians and visibility for one evaluation.
#[derive(Debug, Clone)]
pub struct ResidualSet {
    pub residuals: Vec<f64>,
    pub valid: Vec<bool>,
    /// d(residual)/d(twist), twist ordered `[v, ω]`. Zero for invalid points.
    pub jacobians: Vec<Vector6<f64>>,
    /// Pixel location of each warped point; `None` if it lies behind the camera.
    pub reprojections: Vec<Option<Point2<f64>>>,
    pub num_valid: usize,
    /// `num_valid / num_points`, zero for an empty point set.
    pub visible_ratio: f64,
}

impl ResidualSet {
    pub fn len(&self) -> usize {
        self.residuals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.residuals.is_empty()
    }

    /// Residuals of valid points only.
    pub fn valid_residuals(&self) -> impl Iterator<Item = f64> + '_ {
        self.residuals
            .iter()
            .zip(&self.valid)
            .filter(|(_, &ok)| ok)
            .map(|(&r, _)| r)
    }
}

struct PointEvaluation {
    residual: f64,
    jacobian: Vector6<f64>,
    reprojection: Option<Point2<f64>>,
}

impl PointEvaluation {
    fn invalid(reprojection: Option<Point2<f64>>) -> Self {
        Self {
            residual: INVALID_RESIDUAL,
            jacobian: Vector6::zeros(),
            reprojection,
        }
    }

    fn is_valid(&self) -> bool {
        !self.residual.is_nan()
    }
}

/// Warp every point of `points` into `current` with `pose` and evaluate `field`.
///
/// `camera` must be the intrinsics of the level being evaluated.
pub fn build_residuals(
    field: &dyn ResidualField,
    points: &PointSet,
    current: &PyramidLevel,
    camera: &Intrinsics,
    pose: &Pose,
) -> ResidualSet {
    let width = current.width();
    let height = current.height();

    let evaluations: Vec<PointEvaluation> = points
        .points_3d
        .par_iter()
        .zip(points.intensities.par_iter())
        .map(|(point, &reference_intensity)| {
            let warped = pose.transform_point(point);
            if warped.z <= MIN_PROJECTION_DEPTH {
                return PointEvaluation::invalid(None);
            }
            let Some(uv) = camera.project(&warped) else {
                return PointEvaluation::invalid(None);
            };
            if !is_inside_valid_region(uv.x, uv.y, width, height) {
                return PointEvaluation::invalid(Some(uv));
            }
            let Some(sample) = field.sample(current, uv.x, uv.y) else {
                return PointEvaluation::invalid(Some(uv));
            };
            let residual = field.residual(&sample, reference_intensity);
            if !residual.is_finite() {
                return PointEvaluation::invalid(Some(uv));
            }

            // Chain rule: field gradient (1x2) * projection derivative (2x3)
            // gives g = dr/dX'; a left perturbation moves X' by v + ω × X'.
            let inv_z = 1.0 / warped.z;
            let gu_fx = sample.grad_u * camera.fx;
            let gv_fy = sample.grad_v * camera.fy;
            let g = Vector3::new(
                gu_fx * inv_z,
                gv_fy * inv_z,
                -(gu_fx * warped.x + gv_fy * warped.y) * inv_z * inv_z,
            );
            let rot = warped.coords.cross(&g);

            PointEvaluation {
                residual,
                jacobian: Vector6::new(g.x, g.y, g.z, rot.x, rot.y, rot.z),
                reprojection: Some(uv),
            }
        })
        .collect();

    let n = evaluations.len();
    let mut set = ResidualSet {
        residuals: Vec::with_capacity(n),
        valid: Vec::with_capacity(n),
        jacobians: Vec::with_capacity(n),
        reprojections: Vec::with_capacity(n),
        num_valid: 0,
        visible_ratio: 0.0,
    };
    for eval in evaluations {
        let ok = eval.is_valid();
        set.num_valid += ok as usize;
        set.valid.push(ok);
        set.residuals.push(eval.residual);
        set.jacobians.push(eval.jacobian);
        set.reprojections.push(eval.reprojection);
    }
    if n > 0 {
        set.visible_ratio = set.num_valid as f64 / n as f64;
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::residual::IntensityField;
    use crate::selection::{select, SelectionConfig};
    use crate::test_utils::{SceneTexture, SyntheticScene};
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, Point3};

    fn scene() -> SyntheticScene {
        SyntheticScene::new(64, 48, 2.0, SceneTexture::Smooth, 1)
    }

    #[test]
    fn test_identity_pose_gives_zero_residuals() {
        let scene = scene();
        let frame = scene.render(&Pose::identity()).unwrap();
        let level = frame.level(0).unwrap();
        let camera = scene.camera;
        let points = select(level, &camera, &SelectionConfig::default());
        assert!(!points.is_empty());

        let set = build_residuals(&IntensityField, &points, level, &camera, &Pose::identity());
        assert_eq!(set.len(), points.len());
        assert_eq!(set.num_valid, points.len());
        assert_relative_eq!(set.visible_ratio, 1.0);
        for r in set.valid_residuals() {
            assert!(r.abs() < 1e-9);
        }
    }

    #[test]
    fn test_jacobian_matches_finite_differences() {
        // Fine sampling of the texture keeps the interpolated gradient close
        // to the derivative of the bilinear surface.
        let scene = SyntheticScene::new(320, 240, 2.0, SceneTexture::Smooth, 1);
        let reference = scene.render(&Pose::identity()).unwrap();
        let pose = Pose::exp(&Vector6::new(0.01, -0.005, 0.02, 0.004, -0.006, 0.003));
        let current = scene.render(&pose).unwrap();
        let camera = scene.camera;
        let config = SelectionConfig {
            grad_thresh: 3.0,
            max_points: Some(400),
            ..Default::default()
        };
        let points = select(reference.level(0).unwrap(), &camera, &config);
        let level = current.level(0).unwrap();
        assert_eq!(points.len(), 400);

        let base = build_residuals(&IntensityField, &points, level, &camera, &Pose::identity());
        let eps = 1e-6;
        for k in 0..6 {
            let mut delta = Vector6::zeros();
            delta[k] = eps;
            let plus = build_residuals(&IntensityField, &points, level, &camera, &Pose::exp(&delta));
            let minus =
                build_residuals(&IntensityField, &points, level, &camera, &Pose::exp(&-delta));

            let mut error = 0.0;
            let mut magnitude = 0.0;
            let mut checked = 0;
            for i in 0..points.len() {
                if !(base.valid[i] && plus.valid[i] && minus.valid[i]) {
                    continue;
                }
                let numeric = (plus.residuals[i] - minus.residuals[i]) / (2.0 * eps);
                error += (numeric - base.jacobians[i][k]).abs();
                magnitude += base.jacobians[i][k].abs();
                checked += 1;
            }
            assert!(checked > 100);
            assert!(
                error < 0.1 * magnitude,
                "component {k}: mean error {} vs mean magnitude {}",
                error / checked as f64,
                magnitude / checked as f64
            );
        }
    }

    #[test]
    fn test_out_of_bounds_points_are_invalid() {
        let level = PyramidLevel::new(
            DMatrix::from_fn(20, 20, |_, u| u as f64 * 10.0),
            DMatrix::from_element(20, 20, 1.0),
        )
        .unwrap();
        let camera = Intrinsics::new(20.0, 20.0, 9.5, 9.5).unwrap();
        let points = PointSet {
            points_3d: vec![
                Point3::new(0.0, 0.0, 1.0),
                Point3::new(5.0, 0.0, 1.0),
                Point3::new(0.0, 0.0, -1.0),
                Point3::new(-0.47, 0.0, 1.0),
            ],
            points_2d: vec![Point2::origin(); 4],
            intensities: vec![0.0; 4],
            mask: DMatrix::from_element(20, 20, false),
        };

        let set = build_residuals(&IntensityField, &points, &level, &camera, &Pose::identity());
        assert_eq!(set.valid, vec![true, false, false, false]);
        assert_eq!(set.num_valid, 1);
        assert_relative_eq!(set.visible_ratio, 0.25);
        assert!(set.residuals[1].is_nan());
        assert!(set.reprojections[1].is_some());
        assert!(set.reprojections[2].is_none());
        assert_eq!(set.jacobians[1], Vector6::zeros());
        // u = 9.5 - 9.4 = 0.1 is inside the image but outside the half-pixel margin.
        assert!(!is_inside_valid_region(0.1, 5.0, 20, 20));
        assert!(is_inside_valid_region(0.5, 18.5, 20, 20));
    }

    #[test]
    fn test_empty_point_set() {
        let level = PyramidLevel::new(DMatrix::zeros(8, 8), DMatrix::zeros(8, 8)).unwrap();
        let camera = Intrinsics::new(10.0, 10.0, 3.5, 3.5).unwrap();
        let points = PointSet::empty(8, 8);
        let set = build_residuals(&IntensityField, &points, &level, &camera, &Pose::identity());
        assert!(set.is_empty());
        assert_eq!(set.visible_ratio, 0.0);
    }
}
