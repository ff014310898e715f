//! Distribution statistics of the final residuals of an alignment.
//!
//! The Laplacian scale `b = mean(|r - median(r)|)` is the maximum-likelihood
//! scale of a Laplace distribution fitted to the residuals. A converged
//! alignment has a sharp peak at zero; a wrong one spreads residuals over the
//! whole range and `b` grows.

use serde::Serialize;

use super::histogram::ResidualHistogram;
use crate::robust::median_in_place;

/// Summary of the valid residuals at the returned pose.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResidualStatistics {
    pub num_valid: usize,
    pub median: f64,
    pub laplacian_scale: f64,
    pub max_abs: f64,
    pub histogram: ResidualHistogram,
}

impl ResidualStatistics {
    pub fn empty(num_bins: usize) -> Self {
        Self {
            num_valid: 0,
            median: 0.0,
            laplacian_scale: 0.0,
            max_abs: 0.0,
            histogram: ResidualHistogram::new(&[], num_bins, 1.0),
        }
    }

    /// Statistics over entries with `valid[i] == true`.
    pub fn from_residuals(residuals: &[f64], valid: &[bool], num_bins: usize) -> Self {
        let values: Vec<f64> = residuals
            .iter()
            .zip(valid)
            .filter(|(_, &ok)| ok)
            .map(|(&r, _)| r)
            .collect();
        if values.is_empty() {
            return Self::empty(num_bins);
        }

        let mut scratch = values.clone();
        let median = median_in_place(&mut scratch).unwrap_or(0.0);
        let laplacian_scale =
            values.iter().map(|r| (r - median).abs()).sum::<f64>() / values.len() as f64;
        let max_abs = values.iter().fold(0.0f64, |m, r| m.max(r.abs()));
        let histogram = ResidualHistogram::new(&values, num_bins, max_abs);

        Self {
            num_valid: values.len(),
            median,
            laplacian_scale,
            max_abs,
            histogram,
        }
    }

    /// Whether the residual spread exceeds `laplacian_thresh`.
    pub fn is_degraded(&self, laplacian_thresh: f64) -> bool {
        self.num_valid > 0 && self.laplacian_scale > laplacian_thresh
    }

    /// Fraction of residuals with `|r|` at or above `threshold`.
    pub fn tail_fraction(&self, threshold: f64) -> f64 {
        self.histogram.fraction_at_or_above(threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn test_statistics_ignore_invalid() {
        let residuals = [1.0, f64::NAN, -1.0, 3.0];
        let valid = [true, false, true, true];
        let stats = ResidualStatistics::from_residuals(&residuals, &valid, 10);
        assert_eq!(stats.num_valid, 3);
        assert_relative_eq!(stats.median, 1.0);
        assert_relative_eq!(stats.laplacian_scale, 4.0 / 3.0);
        assert_relative_eq!(stats.max_abs, 3.0);
        assert_eq!(stats.histogram.total(), 3);
    }

    #[test]
    fn test_empty() {
        let stats = ResidualStatistics::from_residuals(&[f64::NAN], &[false], 8);
        assert_eq!(stats.num_valid, 0);
        assert!(!stats.is_degraded(0.0));
    }

    #[test]
    fn test_degraded_spread() {
        let mut rng = StdRng::seed_from_u64(7);
        let tight = Normal::new(0.0, 2.0).unwrap();
        let wide = Normal::new(0.0, 60.0).unwrap();

        let good: Vec<f64> = (0..2000).map(|_| tight.sample(&mut rng)).collect();
        let bad: Vec<f64> = (0..2000).map(|_| wide.sample(&mut rng)).collect();
        let valid = vec![true; 2000];

        let good = ResidualStatistics::from_residuals(&good, &valid, 32);
        let bad = ResidualStatistics::from_residuals(&bad, &valid, 32);
        assert!(!good.is_degraded(15.0));
        assert!(bad.is_degraded(15.0));
        assert!(bad.tail_fraction(15.0) > good.tail_fraction(15.0));
    }
}
