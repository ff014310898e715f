//! Histogram of absolute residuals.

use serde::Serialize;

/// Fixed-width histogram of `|r|` over `[0, upper)`; larger values land in
/// the last bin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResidualHistogram {
    pub bin_width: f64,
    pub counts: Vec<usize>,
}

impl ResidualHistogram {
    pub fn new(values: &[f64], num_bins: usize, upper: f64) -> Self {
        let num_bins = num_bins.max(1);
        let bin_width = if upper > 0.0 {
            upper / num_bins as f64
        } else {
            1.0
        };
        let mut counts = vec![0; num_bins];
        for v in values {
            let bin = ((v.abs() / bin_width) as usize).min(num_bins - 1);
            counts[bin] += 1;
        }
        Self { bin_width, counts }
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Fraction of samples with `|r| >= threshold`, resolved to bin edges.
    pub fn fraction_at_or_above(&self, threshold: f64) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let first = ((threshold / self.bin_width).ceil() as usize).min(self.counts.len());
        let above: usize = self.counts[first..].iter().sum();
        above as f64 / total as f64
    }

    /// Index of the most populated bin.
    pub fn mode_bin(&self) -> usize {
        self.counts
            .iter()
            .enumerate()
            .max_by_key(|(i, &c)| (c, std::cmp::Reverse(*i)))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }
}
