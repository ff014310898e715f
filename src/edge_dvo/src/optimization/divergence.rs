//! Divergence and oscillation detection for the per-level loop.
//!
//! The energy of a robust Gauss-Newton iteration is not guaranteed to
//! decrease. [`DivergenceGuard`] tracks the best energy seen so far and ends
//! the level after too many consecutive iterates fail to beat it; the best
//! iterate, not the last one, is returned.
//!
//! Oscillation analysis looks at the applied twists: consecutive steps
//! pointing in nearly opposite directions mean the optimizer is bouncing
//! around a minimum.

use nalgebra::Vector6;

/// Cosine below which two consecutive steps count as a reversal
/// (about 154 degrees).
const INVERSION_VECTOR_THRESHOLD: f64 = -0.9;

/// Reversal count above which a level is reported as oscillating.
pub const DEFAULT_OSCILLATION_THRESHOLD: usize = 10;

/// Steps shorter than this are ignored by the oscillation count.
const MIN_STEP_NORM: f64 = 1e-12;

/// Tracks the best energy and the number of iterates since it improved.
#[derive(Debug, Clone)]
pub struct DivergenceGuard {
    patience: usize,
    best_energy: f64,
    best_index: Option<usize>,
    since_improvement: usize,
}

impl DivergenceGuard {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best_energy: f64::INFINITY,
            best_index: None,
            since_improvement: 0,
        }
    }

    /// Record the energy of iterate `index`; returns `true` if it is the new best.
    pub fn observe(&mut self, index: usize, energy: f64) -> bool {
        if energy < self.best_energy {
            self.best_energy = energy;
            self.best_index = Some(index);
            self.since_improvement = 0;
            true
        } else {
            self.since_improvement += 1;
            false
        }
    }

    pub fn is_stalled(&self) -> bool {
        self.since_improvement >= self.patience
    }

    pub fn best_index(&self) -> Option<usize> {
        self.best_index
    }

    pub fn best_energy(&self) -> f64 {
        self.best_energy
    }
}

/// Index of the first minimum of `trace`, ignoring NaN entries.
pub fn best_energy_index(trace: &[f64]) -> Option<usize> {
    trace
        .iter()
        .enumerate()
        .filter(|(_, e)| !e.is_nan())
        .fold(None, |best: Option<(usize, f64)>, (i, &e)| match best {
            Some((_, b)) if b <= e => best,
            _ => Some((i, e)),
        })
        .map(|(i, _)| i)
}

/// Result of oscillation analysis.
#[derive(Debug, Clone, Default)]
pub struct OscillationResult {
    /// Longest run of consecutive reversals.
    pub max_oscillation_count: usize,
    /// `max_oscillation_count > threshold`.
    pub is_oscillating: bool,
    /// Indices of steps that reversed the previous one.
    pub oscillation_indices: Vec<usize>,
}

/// Count direction reversals in a sequence of applied twists.
pub fn count_oscillation(steps: &[Vector6<f64>], threshold: usize) -> OscillationResult {
    if steps.len() < 2 {
        return OscillationResult::default();
    }

    let mut count = 0;
    let mut max_count = 0;
    let mut indices = Vec::new();

    for i in 1..steps.len() {
        let current = &steps[i];
        let prev = &steps[i - 1];
        let current_norm = current.norm();
        let prev_norm = prev.norm();
        if current_norm < MIN_STEP_NORM || prev_norm < MIN_STEP_NORM {
            count = 0;
            continue;
        }

        let cosine = current.dot(prev) / (current_norm * prev_norm);
        if cosine < INVERSION_VECTOR_THRESHOLD {
            count += 1;
            indices.push(i);
        } else {
            count = 0;
        }
        max_count = max_count.max(count);
    }

    OscillationResult {
        max_oscillation_count: max_count,
        is_oscillating: max_count > threshold,
        oscillation_indices: indices,
    }
}
