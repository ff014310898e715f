//! Per-phase wall-clock timing of the Gauss-Newton loop.
//!
//! Timers exist only with the `profiling` feature. Without it
//! [`TimingCollector`] is a zero-sized no-op and
//! [`time_phase!`](crate::time_phase) just evaluates its block.

use serde::{Deserialize, Serialize};
#[cfg(feature = "profiling")]
use std::time::Instant;

/// Stages of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Warping, sampling and Jacobian rows.
    Residuals,
    /// Scale estimate and robust weights.
    Weighting,
    /// JᵀWJ and JᵀWr accumulation.
    NormalEquations,
    Solver,
    PoseUpdate,
}

/// Milliseconds spent in each [`Phase`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseDurations {
    pub residuals_ms: f64,
    pub weighting_ms: f64,
    pub normal_equations_ms: f64,
    pub solver_ms: f64,
    pub pose_update_ms: f64,
}

impl PhaseDurations {
    pub fn add(&mut self, phase: Phase, ms: f64) {
        let slot = match phase {
            Phase::Residuals => &mut self.residuals_ms,
            Phase::Weighting => &mut self.weighting_ms,
            Phase::NormalEquations => &mut self.normal_equations_ms,
            Phase::Solver => &mut self.solver_ms,
            Phase::PoseUpdate => &mut self.pose_update_ms,
        };
        *slot += ms;
    }

    pub fn sum(&self) -> f64 {
        self.residuals_ms
            + self.weighting_ms
            + self.normal_equations_ms
            + self.solver_ms
            + self.pose_update_ms
    }
}

/// Timing of one pyramid level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelTiming {
    pub total_ms: f64,
    /// Summed over all iterations.
    pub phases: PhaseDurations,
    pub iterations: Vec<IterationTiming>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationTiming {
    pub iteration: usize,
    pub total_ms: f64,
    pub phases: PhaseDurations,
}

#[cfg(feature = "profiling")]
fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1e3
}

/// Accumulates phase durations while a level runs.
#[cfg(feature = "profiling")]
#[derive(Debug, Default)]
pub struct TimingCollector {
    level_start: Option<Instant>,
    open: Option<(Instant, IterationTiming)>,
    timing: LevelTiming,
}

#[cfg(feature = "profiling")]
impl TimingCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_level(&mut self) {
        *self = Self {
            level_start: Some(Instant::now()),
            ..Self::default()
        };
    }

    pub fn start_iteration(&mut self) {
        let record = IterationTiming {
            iteration: self.timing.iterations.len(),
            ..Default::default()
        };
        self.open = Some((Instant::now(), record));
    }

    pub fn record_phase(&mut self, phase: Phase, ms: f64) {
        self.timing.phases.add(phase, ms);
        if let Some((_, record)) = self.open.as_mut() {
            record.phases.add(phase, ms);
        }
    }

    pub fn end_iteration(&mut self) {
        if let Some((start, mut record)) = self.open.take() {
            record.total_ms = elapsed_ms(start);
            self.timing.iterations.push(record);
        }
    }

    /// Close the level. Always `Some` with profiling enabled.
    pub fn finish(&mut self) -> Option<LevelTiming> {
        self.end_iteration();
        self.timing.total_ms = self.level_start.take().map_or(0.0, elapsed_ms);
        Some(std::mem::take(&mut self.timing))
    }
}

#[cfg(not(feature = "profiling"))]
#[derive(Debug, Default)]
pub struct TimingCollector;

#[cfg(not(feature = "profiling"))]
impl TimingCollector {
    #[inline(always)]
    pub fn new() -> Self {
        Self
    }

    #[inline(always)]
    pub fn start_level(&mut self) {}

    #[inline(always)]
    pub fn start_iteration(&mut self) {}

    #[inline(always)]
    pub fn record_phase(&mut self, _phase: Phase, _ms: f64) {}

    #[inline(always)]
    pub fn end_iteration(&mut self) {}

    #[inline(always)]
    pub fn finish(&mut self) -> Option<LevelTiming> {
        None
    }
}

/// Evaluate `$block`, charging its duration to `$phase` on `$collector`.
///
/// ```ignore
/// let set = time_phase!(collector, Phase::Residuals, {
///     build_residuals(field, points, level, &camera, &pose)
/// });
/// ```
#[macro_export]
macro_rules! time_phase {
    ($collector:expr, $phase:expr, $block:expr) => {{
        #[cfg(feature = "profiling")]
        let __phase_start = ::std::time::Instant::now();
        let __phase_value = $block;
        #[cfg(feature = "profiling")]
        $collector.record_phase($phase, __phase_start.elapsed().as_secs_f64() * 1e3);
        __phase_value
    }};
}
