//! Rigid-body poses and the se(3) exponential map.
//!
//! A [`Pose`] maps reference-frame coordinates into current-frame
//! coordinates: `X_cur = R * X_ref + t`. The rotation is stored as a raw
//! matrix so that accumulated floating-point drift is observable and can be
//! removed with [`Pose::reorthogonalize`].
//!
//! Twists are ordered `[vx, vy, vz, ωx, ωy, ωz]` (translation first) and are
//! applied on the left: `T ← exp(ξ) · T`.

use std::ops::Mul;

use nalgebra::{Isometry3, Matrix3, Point3, Rotation3, Translation3, UnitQuaternion, Vector3, Vector6};
use serde::{Deserialize, Serialize};

/// Below this rotation angle the exponential map uses Taylor expansions.
const SMALL_ANGLE: f64 = 1e-8;

/// Skew-symmetric matrix such that `skew(a) * b == a.cross(&b)`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Rigid transform from the reference camera frame to the current one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

/// Magnitude of the motion between two poses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseDrift {
    /// Translation distance in scene units.
    pub translation: f64,
    /// Rotation angle in radians.
    pub rotation: f64,
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose {
    pub fn identity() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn from_parts(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn from_isometry(iso: &Isometry3<f64>) -> Self {
        Self {
            rotation: *iso.rotation.to_rotation_matrix().matrix(),
            translation: iso.translation.vector,
        }
    }

    /// Convert to an `Isometry3`, projecting the rotation onto SO(3) first.
    pub fn to_isometry(&self) -> Isometry3<f64> {
        let mut pose = *self;
        pose.reorthogonalize();
        let rotation = Rotation3::from_matrix_unchecked(pose.rotation);
        Isometry3::from_parts(
            Translation3::from(pose.translation),
            UnitQuaternion::from_rotation_matrix(&rotation),
        )
    }

    /// Exponential map from a twist `[v, ω]` to a pose.
    pub fn exp(twist: &Vector6<f64>) -> Self {
        let v = Vector3::new(twist[0], twist[1], twist[2]);
        let w = Vector3::new(twist[3], twist[4], twist[5]);
        let theta_sq = w.norm_squared();
        let theta = theta_sq.sqrt();
        let w_hat = skew(&w);
        let w_hat_sq = w_hat * w_hat;

        let (a, b, c) = if theta < SMALL_ANGLE {
            (
                1.0 - theta_sq / 6.0,
                0.5 - theta_sq / 24.0,
                1.0 / 6.0 - theta_sq / 120.0,
            )
        } else {
            let (sin, cos) = theta.sin_cos();
            (
                sin / theta,
                (1.0 - cos) / theta_sq,
                (theta - sin) / (theta_sq * theta),
            )
        };

        let identity = Matrix3::identity();
        let rotation = identity + w_hat * a + w_hat_sq * b;
        let v_mat = identity + w_hat * b + w_hat_sq * c;
        Self {
            rotation,
            translation: v_mat * v,
        }
    }

    /// Left-compose an incremental twist: `exp(twist) * self`.
    pub fn left_update(&self, twist: &Vector6<f64>) -> Self {
        Self::exp(twist).compose(self)
    }

    /// `self * other`: apply `other` first, then `self`.
    pub fn compose(&self, other: &Pose) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Inverse transform, assuming an orthonormal rotation.
    pub fn inverse(&self) -> Self {
        let rt = self.rotation.transpose();
        Self {
            rotation: rt,
            translation: -(rt * self.translation),
        }
    }

    pub fn transform_point(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.rotation * p.coords + self.translation)
    }

    /// Replace the rotation by the nearest rotation matrix (Frobenius norm).
    ///
    /// Uses `U * Vᵀ` from the SVD; if that is a reflection the last column of
    /// `U` is negated so that `det = +1`.
    pub fn reorthogonalize(&mut self) {
        let svd = self.rotation.svd(true, true);
        let (Some(mut u), Some(v_t)) = (svd.u, svd.v_t) else {
            return;
        };
        let mut rotation = u * v_t;
        if rotation.determinant() < 0.0 {
            u.column_mut(2).neg_mut();
            rotation = u * v_t;
        }
        self.rotation = rotation;
    }

    /// Check `RᵀR ≈ I` and `det(R) ≈ +1` within `tolerance`.
    pub fn is_rotation_valid(&self, tolerance: f64) -> bool {
        let rtr = self.rotation.transpose() * self.rotation;
        (rtr - Matrix3::identity()).amax() < tolerance
            && (self.rotation.determinant() - 1.0).abs() < tolerance
    }

    /// Rotation angle in radians, in `[0, π]`.
    pub fn rotation_angle(&self) -> f64 {
        let cos = ((self.rotation.trace() - 1.0) * 0.5).clamp(-1.0, 1.0);
        cos.acos()
    }

    /// `[tx, ty, tz, rx, ry, rz]` with the rotation as an axis-angle vector.
    pub fn to_vector(&self) -> [f64; 6] {
        let mut pose = *self;
        pose.reorthogonalize();
        let axis_angle = Rotation3::from_matrix_unchecked(pose.rotation).scaled_axis();
        [
            self.translation.x,
            self.translation.y,
            self.translation.z,
            axis_angle.x,
            axis_angle.y,
            axis_angle.z,
        ]
    }

    /// Motion needed to go from `self` to `other`.
    pub fn drift_to(&self, other: &Pose) -> PoseDrift {
        let delta = other.compose(&self.inverse());
        PoseDrift {
            translation: delta.translation.norm(),
            rotation: delta.rotation_angle(),
        }
    }
}

impl Mul for Pose {
    type Output = Pose;

    fn mul(self, rhs: Pose) -> Pose {
        self.compose(&rhs)
    }
}
