//! Gauss-Newton step computation.
//!
//! The step solves the weighted normal equations
//!
//! ```text
//! (JᵀWJ + λI) Δξ = -JᵀWr
//! ```
//!
//! with Cholesky, falling back to an SVD pseudo-inverse when the system is
//! not positive definite.

use nalgebra::{Matrix6, Vector6};
use rayon::prelude::*;

use crate::residual::ResidualSet;

/// Weighted normal equations accumulated over valid residuals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalEquations {
    /// JᵀWJ
    pub hessian: Matrix6<f64>,
    /// JᵀWr
    pub gradient: Vector6<f64>,
    /// Σ w r²
    pub weighted_sq_sum: f64,
    pub num_valid: usize,
}

impl NormalEquations {
    pub fn zeros() -> Self {
        Self {
            hessian: Matrix6::zeros(),
            gradient: Vector6::zeros(),
            weighted_sq_sum: 0.0,
            num_valid: 0,
        }
    }

    /// Add one residual with its Jacobian row and weight.
    #[inline]
    pub fn accumulate(&mut self, jacobian: &Vector6<f64>, residual: f64, weight: f64) {
        self.hessian += jacobian * jacobian.transpose() * weight;
        self.gradient += jacobian * (weight * residual);
        self.weighted_sq_sum += weight * residual * residual;
        self.num_valid += 1;
    }

    pub fn add(mut self, other: Self) -> Self {
        self.hessian += other.hessian;
        self.gradient += other.gradient;
        self.weighted_sq_sum += other.weighted_sq_sum;
        self.num_valid += other.num_valid;
        self
    }

    /// Accumulate all valid entries of `set` with `weights` (index-aligned).
    pub fn assemble(set: &ResidualSet, weights: &[f64]) -> Self {
        (0..set.len())
            .into_par_iter()
            .filter(|&i| set.valid[i])
            .fold(Self::zeros, |mut acc, i| {
                acc.accumulate(&set.jacobians[i], set.residuals[i], weights[i]);
                acc
            })
            .reduce(Self::zeros, Self::add)
    }

    /// Mean weighted squared residual `Σ w r² / n_valid`.
    pub fn energy(&self) -> f64 {
        if self.num_valid == 0 {
            f64::INFINITY
        } else {
            self.weighted_sq_sum / self.num_valid as f64
        }
    }
}

/// Solve `H Δ = -g` by SVD with singular value `tolerance`.
///
/// Returns `None` when `H` is effectively zero or the solve fails.
pub fn solve_svd(
    gradient: &Vector6<f64>,
    hessian: &Matrix6<f64>,
    tolerance: f64,
) -> Option<Vector6<f64>> {
    let svd = hessian.svd(true, true);
    if svd.singular_values.max() < tolerance {
        return None;
    }
    svd.solve(&-gradient, tolerance).ok()
}

/// Solve `H Δ = -g` by Cholesky, falling back to SVD.
pub fn solve_cholesky(
    gradient: &Vector6<f64>,
    hessian: &Matrix6<f64>,
    tolerance: f64,
) -> Option<Vector6<f64>> {
    if let Some(chol) = hessian.cholesky() {
        let step = chol.solve(&-gradient);
        if step.iter().all(|v| v.is_finite()) {
            return Some(step);
        }
    }
    solve_svd(gradient, hessian, tolerance)
}

/// Damping added to the diagonal: `factor * max(trace(H) / 6, 1)`.
pub fn regularization_lambda(hessian: &Matrix6<f64>, factor: f64) -> f64 {
    factor * (hessian.trace() / 6.0).max(1.0)
}

/// Gauss-Newton step for `equations`, optionally regularized.
///
/// Returns `None` if the system is singular.
pub fn solve_step(
    equations: &NormalEquations,
    regularization_factor: Option<f64>,
    tolerance: f64,
) -> Option<Vector6<f64>> {
    let mut hessian = equations.hessian;
    if let Some(factor) = regularization_factor {
        hessian += Matrix6::identity() * regularization_lambda(&hessian, factor);
    }
    solve_cholesky(&equations.gradient, &hessian, tolerance)
}

/// Rescale `step` onto the trust-region sphere if it is longer than `radius`.
///
/// Returns the step to apply and whether it was clamped.
pub fn clamp_to_trust_region(step: &Vector6<f64>, radius: f64) -> (Vector6<f64>, bool) {
    let norm = step.norm();
    if norm > radius {
        (step * (radius / norm), true)
    } else {
        (*step, false)
    }
}

/// Ratio of largest to smallest singular value; infinite when singular.
pub fn condition_number(hessian: &Matrix6<f64>) -> f64 {
    let svd = hessian.svd(false, false);
    let max_sv = svd.singular_values.max();
    let min_sv = svd.singular_values.min();
    if min_sv < 1e-15 {
        f64::INFINITY
    } else {
        max_sv / min_sv
    }
}
