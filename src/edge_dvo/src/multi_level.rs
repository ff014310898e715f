//! Coarse-to-fine alignment over the image pyramid.
//!
//! Levels run from the coarsest (`L-1`) to the finest (`0`). Each level is
//! seeded with the pose returned by the previous one, so coarse levels with
//! their wide basin of attraction absorb large motions and fine levels add
//! precision.
//!
//! # Example
//!
//! ```ignore
//! use edge_dvo::{DvoConfig, DvoOptimizer, Pose, ReferenceFrame};
//!
//! let optimizer = DvoOptimizer::new(DvoConfig::default())?;
//! let reference = ReferenceFrame::new(ref_pyramid, &camera, &optimizer.config().selection);
//! let result = optimizer.align(&reference, &current_pyramid, &camera, &Pose::identity())?;
//! if result.request_new_reference() {
//!     // pick a new reference frame
//! }
//! ```

use std::ops::ControlFlow;

use tracing::{debug, warn};

use crate::camera::Intrinsics;
use crate::error::DvoError;
use crate::optimization::{
    AlignmentDebug, ConvergenceStatus, DvoOptimizer, LevelDebug, LevelResult,
};
use crate::pose::Pose;
use crate::pyramid::FramePyramid;
use crate::reference::{AlignmentQuality, ReferenceDecision, ReferenceFrame};
use crate::scoring::ResidualStatistics;

/// Result of a full pyramid alignment.
#[derive(Debug, Clone)]
pub struct AlignmentResult {
    /// Refined reference-to-current pose.
    pub pose: Pose,

    pub initial_pose: Pose,

    /// Status of the finest level that evaluated any residuals.
    pub status: ConvergenceStatus,

    /// Per-level results in execution order (coarsest first).
    pub levels: Vec<LevelResult>,

    pub final_visible_ratio: f64,
    pub final_energy: f64,
    pub low_confidence: bool,

    /// Distribution of the final residuals.
    pub residual_stats: ResidualStatistics,

    pub reference_decision: ReferenceDecision,

    /// The observer stopped the alignment before the finest level.
    pub aborted: bool,
}

impl AlignmentResult {
    /// Whether the caller must pick a new reference frame.
    pub fn request_new_reference(&self) -> bool {
        self.reference_decision.requires_new_reference()
    }

    /// Whether the pose may be used by the caller.
    pub fn is_accepted(&self) -> bool {
        match self.reference_decision {
            ReferenceDecision::Keep => true,
            ReferenceDecision::Replace { accept_estimate } => accept_estimate,
        }
    }

    pub fn total_iterations(&self) -> usize {
        self.levels.iter().map(|l| l.iterations).sum()
    }

    pub fn iterations_per_level(&self) -> Vec<usize> {
        self.levels.iter().map(|l| l.iterations).collect()
    }

    /// Energy traces in execution order.
    pub fn energy_traces(&self) -> Vec<&[f64]> {
        self.levels.iter().map(|l| l.energy_trace.as_slice()).collect()
    }

    pub fn to_debug(&self) -> AlignmentDebug {
        let mut debug = AlignmentDebug::new();
        debug.set_initial_pose(&self.initial_pose);
        debug.set_final_pose(&self.pose);
        debug.status = format!("{:?}", self.status);
        debug.final_energy = self.final_energy;
        debug.final_visible_ratio = self.final_visible_ratio;
        debug.laplacian_scale = self.residual_stats.laplacian_scale;
        debug.reference_decision = format!("{:?}", self.reference_decision);
        debug.aborted = self.aborted;
        debug.levels = self
            .levels
            .iter()
            .map(|l| LevelDebug {
                level: l.level,
                num_points: l.num_points,
                status: format!("{:?}", l.status),
                iterations: l.debug.clone(),
                energy_trace: l.energy_trace.clone(),
                best_energy_index: l.best_energy_index,
                final_visible_ratio: l.final_visible_ratio,
                oscillation_count: l.oscillation_count,
                timing: l.timing.clone(),
            })
            .collect();
        debug
    }
}

impl DvoOptimizer {
    /// Align `current` against `reference` starting from `initial`.
    pub fn align(
        &self,
        reference: &ReferenceFrame,
        current: &FramePyramid,
        camera: &Intrinsics,
        initial: &Pose,
    ) -> Result<AlignmentResult, DvoError> {
        self.align_with_observer(reference, current, camera, initial, |_| {
            ControlFlow::Continue(())
        })
    }

    /// Like [`align`](Self::align), calling `observer` after every level.
    ///
    /// Returning [`ControlFlow::Break`] skips the remaining (finer) levels;
    /// the result then reflects the last level that ran.
    pub fn align_with_observer<F>(
        &self,
        reference: &ReferenceFrame,
        current: &FramePyramid,
        camera: &Intrinsics,
        initial: &Pose,
        mut observer: F,
    ) -> Result<AlignmentResult, DvoError>
    where
        F: FnMut(&LevelResult) -> ControlFlow<()>,
    {
        self.check_inputs(reference, current, camera)?;

        let config = self.config();
        let num_levels = current.num_levels();
        let mut pose = *initial;
        let mut levels = Vec::with_capacity(num_levels);
        let mut aborted = false;

        for level in (0..num_levels).rev() {
            let budget = config.iterations_config[level];
            let result = self.run_iterations(reference, current, camera, level, budget, &pose)?;
            pose = result.pose;
            let flow = observer(&result);
            levels.push(result);
            if flow.is_break() && level > 0 {
                debug!(level, "alignment aborted by observer");
                aborted = true;
                break;
            }
        }

        let informative = levels
            .iter()
            .rev()
            .find(|l| l.status != ConvergenceStatus::NoPoints);
        let (status, final_visible_ratio, final_energy, residual_stats) = match informative {
            Some(l) => (
                l.status,
                l.final_visible_ratio,
                l.average_energy,
                ResidualStatistics::from_residuals(
                    &l.final_residuals,
                    &l.final_valid,
                    config.histogram_bins,
                ),
            ),
            None => (
                ConvergenceStatus::NoPoints,
                0.0,
                0.0,
                ResidualStatistics::empty(config.histogram_bins),
            ),
        };
        let low_confidence = final_visible_ratio < config.ratio_of_visible_pts_thresh;

        let quality = AlignmentQuality {
            status,
            visible_ratio: final_visible_ratio,
            laplacian_scale: residual_stats.laplacian_scale,
        };
        let reference_decision = self.policy().decide(&quality);
        if reference_decision.requires_new_reference() {
            warn!(
                visible_ratio = final_visible_ratio,
                laplacian_scale = residual_stats.laplacian_scale,
                status = ?status,
                "alignment quality too low, new reference frame required"
            );
        }
        debug!(
            status = ?status,
            energy = final_energy,
            visible_ratio = final_visible_ratio,
            decision = ?reference_decision,
            "alignment finished"
        );

        Ok(AlignmentResult {
            pose,
            initial_pose: *initial,
            status,
            levels,
            final_visible_ratio,
            final_energy,
            low_confidence,
            residual_stats,
            reference_decision,
            aborted,
        })
    }

    fn check_inputs(
        &self,
        reference: &ReferenceFrame,
        current: &FramePyramid,
        camera: &Intrinsics,
    ) -> Result<(), DvoError> {
        if !camera.is_valid() {
            return Err(DvoError::InvalidIntrinsics {
                fx: camera.fx,
                fy: camera.fy,
                cx: camera.cx,
                cy: camera.cy,
            });
        }
        reference.pyramid().check_compatible(current)?;
        let budgets = self.config().iterations_config.len();
        if budgets != current.num_levels() {
            return Err(DvoError::IterationBudgetMismatch {
                levels: current.num_levels(),
                budgets,
            });
        }
        if self.field().uses_edges() {
            if let Some(level) = current.levels().iter().position(|l| l.edges.is_none()) {
                return Err(DvoError::MissingEdgeField { level });
            }
        }
        Ok(())
    }
}
