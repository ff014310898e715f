//! Robust M-estimator weights for iteratively reweighted least squares.
//!
//! Residuals are normalized by a scale re-estimated every iteration from the
//! median absolute deviation, then passed through a bounded kernel:
//!
//! - [`RobustKernel::None`]: plain least squares
//! - [`RobustKernel::Huber`]: quadratic core, linear tails (default)
//! - [`RobustKernel::Tukey`]: biweight, rejects gross outliers
//! - [`RobustKernel::Cauchy`]: heavy-tailed
//!
//! Weights of valid residuals lie in `(0, 1]`; invalid residuals get `0`.

use serde::{Deserialize, Serialize};

use crate::residual::ResidualSet;

/// MAD to standard deviation for Gaussian noise.
pub const MAD_TO_SIGMA: f64 = 1.4826;

/// Lower bound on the weight of a valid residual.
pub const MIN_WEIGHT: f64 = 1e-6;

/// Tuning constants giving 95% efficiency under Gaussian noise.
pub const HUBER_K: f64 = 1.345;
pub const TUKEY_C: f64 = 4.685;
pub const CAUCHY_C: f64 = 2.3849;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobustKernel {
    None,
    /// Weight `1` for `|u| <= k`, `k / |u|` beyond.
    #[default]
    Huber,
    /// Weight `(1 - (u/c)²)²` for `|u| < c`, vanishing beyond.
    Tukey,
    /// Weight `1 / (1 + (u/c)²)`.
    Cauchy,
}

impl RobustKernel {
    /// Weight of `residual` under noise scale `scale`, clamped into `[MIN_WEIGHT, 1]`.
    #[inline]
    pub fn weight(&self, residual: f64, scale: f64) -> f64 {
        let u = (residual / scale).abs();
        let w = match self {
            RobustKernel::None => 1.0,
            RobustKernel::Huber => {
                if u <= HUBER_K {
                    1.0
                } else {
                    HUBER_K / u
                }
            }
            RobustKernel::Tukey => {
                if u < TUKEY_C {
                    let t = 1.0 - (u / TUKEY_C).powi(2);
                    t * t
                } else {
                    0.0
                }
            }
            RobustKernel::Cauchy => 1.0 / (1.0 + (u / CAUCHY_C).powi(2)),
        };
        if w.is_nan() {
            MIN_WEIGHT
        } else {
            w.clamp(MIN_WEIGHT, 1.0)
        }
    }
}

/// Median of `values`, reordering them. `None` when empty.
pub fn median_in_place(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let len = values.len();
    let (lower, upper, _) = values.select_nth_unstable_by(len / 2, f64::total_cmp);
    let upper = *upper;
    if len % 2 == 1 {
        Some(upper)
    } else {
        let below = lower.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(0.5 * (below + upper))
    }
}

/// Robust noise scale: `1.4826 · median(|r - median(r)|)`, at least `min_scale`.
pub fn estimate_scale(residuals: impl Iterator<Item = f64>, min_scale: f64) -> f64 {
    let mut values: Vec<f64> = residuals.collect();
    let Some(center) = median_in_place(&mut values) else {
        return min_scale;
    };
    for v in values.iter_mut() {
        *v = (*v - center).abs();
    }
    let mad = median_in_place(&mut values).unwrap_or(0.0);
    (MAD_TO_SIGMA * mad).max(min_scale)
}

/// Kernel plus scale floor, applied to a whole [`ResidualSet`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobustWeighting {
    pub kernel: RobustKernel,
    /// Floor on the estimated scale; stops near-perfect fits from
    /// turning every residual into an outlier.
    pub min_scale: f64,
}

impl Default for RobustWeighting {
    fn default() -> Self {
        Self {
            kernel: RobustKernel::default(),
            min_scale: 1.0,
        }
    }
}

impl RobustWeighting {
    pub fn new(kernel: RobustKernel, min_scale: f64) -> Self {
        Self { kernel, min_scale }
    }

    /// Per-point weights (index-aligned with `set`) and the scale used.
    pub fn compute(&self, set: &ResidualSet) -> (Vec<f64>, f64) {
        let scale = estimate_scale(set.valid_residuals(), self.min_scale);
        let weights = set
            .residuals
            .iter()
            .zip(&set.valid)
            .map(|(&r, &ok)| if ok { self.kernel.weight(r, scale) } else { 0.0 })
            .collect();
        (weights, scale)
    }
}
