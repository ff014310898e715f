//! Type definitions for dense pose refinement.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use super::debug::IterationDebug;
use crate::error::DvoError;
use crate::pose::Pose;
use crate::reference::{ReferencePolicyKind, ReferenceThresholds};
use crate::residual::ResidualKind;
use crate::robust::RobustKernel;
use crate::selection::SelectionConfig;
use crate::timing::LevelTiming;

/// Configuration of the multi-resolution aligner.
///
/// Every field has a default, so a JSON file only needs to name the values it
/// changes (see [`DvoConfig::from_json`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DvoConfig {
    /// Which reference pixels become alignment points.
    pub selection: SelectionConfig,

    /// Gauss-Newton budget per pyramid level, indexed by level (finest first).
    /// Its length must equal the number of pyramid levels.
    pub iterations_config: Vec<usize>,

    /// A level terminates once the solved twist norm falls below this value.
    pub psi_norm_termination_threshold: f64,

    /// Maximum norm of an applied twist; longer steps are rescaled onto the
    /// sphere of this radius.
    pub trust_region_radius: f64,

    /// Consecutive non-improving energies tolerated before a level stops.
    pub divergence_patience: usize,

    /// Intensity or distance-transform residuals.
    pub residual: ResidualKind,

    /// Bilinear (instead of nearest) sampling of the distance transform.
    pub interpolate_distance_transform: bool,

    /// Rescale the distance transform to 0..255. Off by default: unscaled
    /// distances give more accurate poses.
    pub scale_distance_transform: bool,

    pub robust_kernel: RobustKernel,

    /// Lower bound on the robust scale estimate (residual units).
    pub min_robust_scale: f64,

    /// Project the rotation back onto SO(3) after every update.
    pub re_orthogonalize: bool,

    /// Add `λI` to the normal equations, `λ = factor * max(trace(H)/6, 1)`.
    pub regularize: bool,
    pub regularization_factor: f64,

    /// Singular value tolerance for the SVD fallback solve.
    pub svd_tolerance: f64,

    /// Visible ratio below which a result is low-confidence.
    pub ratio_of_visible_pts_thresh: f64,

    /// Laplacian scale of the final residuals above which the reference
    /// frame is considered lost (typically 15-20 for intensities).
    pub laplacian_thresh_exit_cond: f64,

    /// What to do when the reference frame is lost.
    pub reference_policy: ReferencePolicyKind,

    /// Bins of the final residual histogram.
    pub histogram_bins: usize,

    /// Record per-iteration debug entries in level results.
    pub collect_debug: bool,
}

impl Default for DvoConfig {
    fn default() -> Self {
        Self {
            selection: SelectionConfig::default(),
            iterations_config: vec![20, 30, 40],
            psi_norm_termination_threshold: 1e-6,
            trust_region_radius: 0.1,
            divergence_patience: 5,
            residual: ResidualKind::Intensity,
            interpolate_distance_transform: false,
            scale_distance_transform: false,
            robust_kernel: RobustKernel::Huber,
            min_robust_scale: 1.0,
            re_orthogonalize: true,
            regularize: true,
            regularization_factor: 1e-6,
            svd_tolerance: 1e-10,
            ratio_of_visible_pts_thresh: 0.7,
            laplacian_thresh_exit_cond: 15.0,
            reference_policy: ReferencePolicyKind::RejectEstimate,
            histogram_bins: 32,
            collect_debug: false,
        }
    }
}

impl DvoConfig {
    /// Parse a (partial) configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, DvoError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| DvoError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn num_levels(&self) -> usize {
        self.iterations_config.len()
    }

    pub fn reference_thresholds(&self) -> ReferenceThresholds {
        ReferenceThresholds {
            ratio_of_visible_pts_thresh: self.ratio_of_visible_pts_thresh,
            laplacian_thresh_exit_cond: self.laplacian_thresh_exit_cond,
        }
    }

    /// Check value ranges. Level count is checked against actual pyramids
    /// when aligning.
    pub fn validate(&self) -> Result<(), DvoError> {
        let invalid = |msg: &str| Err(DvoError::InvalidConfig(msg.to_string()));
        if self.iterations_config.is_empty() {
            return invalid("iterations_config must name at least one level");
        }
        if !(self.trust_region_radius > 0.0) {
            return invalid("trust_region_radius must be positive");
        }
        if !(self.psi_norm_termination_threshold >= 0.0) {
            return invalid("psi_norm_termination_threshold must be non-negative");
        }
        if !(self.min_robust_scale > 0.0) {
            return invalid("min_robust_scale must be positive");
        }
        if !(0.0..=1.0).contains(&self.ratio_of_visible_pts_thresh) {
            return invalid("ratio_of_visible_pts_thresh must lie in [0, 1]");
        }
        if !(self.regularization_factor >= 0.0) {
            return invalid("regularization_factor must be non-negative");
        }
        if self.divergence_patience == 0 {
            return invalid("divergence_patience must be at least 1");
        }
        if self.selection.min_depth > self.selection.max_depth {
            return invalid("selection depth range is empty");
        }
        Ok(())
    }
}

/// How a pyramid level (or a full alignment) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConvergenceStatus {
    /// Twist norm fell below the termination threshold.
    Converged,

    /// Iteration budget exhausted.
    MaxIterations,

    /// Energy failed to improve for `divergence_patience` iterations.
    Stalled,

    /// Normal equations could not be solved.
    SingularSystem,

    /// The reference level has no selected points; the level was skipped.
    NoPoints,

    /// No selected point reprojects inside the current image.
    NoVisiblePoints,
}

impl ConvergenceStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, ConvergenceStatus::Converged)
    }

    /// Whether the returned pose came out of at least one valid evaluation.
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            ConvergenceStatus::Converged
                | ConvergenceStatus::MaxIterations
                | ConvergenceStatus::Stalled
        )
    }
}

/// Outcome of [`DvoOptimizer::run_iterations`](super::DvoOptimizer::run_iterations)
/// on a single pyramid level.
#[derive(Debug, Clone)]
pub struct LevelResult {
    pub level: usize,

    /// Pose at `best_energy_index`.
    pub pose: Pose,

    pub status: ConvergenceStatus,

    /// Energy of every evaluated iterate; entry 0 is the seed pose.
    pub energy_trace: Vec<f64>,

    /// Index into `energy_trace` of the returned pose.
    pub best_energy_index: Option<usize>,

    /// Mean weighted squared residual at the returned pose.
    pub average_energy: f64,

    /// Residuals at the returned pose, index-aligned with the point set.
    pub final_residuals: Vec<f64>,
    pub final_valid: Vec<bool>,
    pub final_reprojections: Vec<Option<Point2<f64>>>,
    pub final_visible_ratio: f64,

    /// Robust scale used at the returned pose.
    pub robust_scale: f64,

    pub num_points: usize,

    /// Number of pose updates applied.
    pub iterations: usize,

    /// Visible ratio below the configured threshold.
    pub low_confidence: bool,

    /// Longest run of consecutive step reversals.
    pub oscillation_count: usize,

    /// Per-iteration records (only with `collect_debug`).
    pub debug: Vec<IterationDebug>,

    /// Populated with the `profiling` feature.
    pub timing: Option<LevelTiming>,
}

impl LevelResult {
    /// A skipped level: pose passes through unchanged.
    pub fn no_points(level: usize, pose: Pose) -> Self {
        Self {
            level,
            pose,
            status: ConvergenceStatus::NoPoints,
            energy_trace: Vec::new(),
            best_energy_index: None,
            average_energy: 0.0,
            final_residuals: Vec::new(),
            final_valid: Vec::new(),
            final_reprojections: Vec::new(),
            final_visible_ratio: 0.0,
            robust_scale: 0.0,
            num_points: 0,
            iterations: 0,
            low_confidence: true,
            oscillation_count: 0,
            debug: Vec::new(),
            timing: None,
        }
    }

    /// Check if oscillation was detected (count exceeds threshold).
    pub fn is_oscillating(&self) -> bool {
        self.oscillation_count > super::divergence::DEFAULT_OSCILLATION_THRESHOLD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DvoConfig::default();
        assert_eq!(config.num_levels(), 3);
        assert_eq!(config.divergence_patience, 5);
        assert!(config.re_orthogonalize);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_partial_json() {
        let json = r#"{
            "iterations_config": [5, 10],
            "residual": "distance_transform",
            "robust_kernel": "tukey",
            "reference_policy": "replace_reference",
            "selection": { "max_points": 200 }
        }"#;
        let config = DvoConfig::from_json(json).unwrap();
        assert_eq!(config.iterations_config, vec![5, 10]);
        assert_eq!(config.residual, ResidualKind::DistanceTransform);
        assert_eq!(config.robust_kernel, RobustKernel::Tukey);
        assert_eq!(config.reference_policy, ReferencePolicyKind::ReplaceReference);
        assert_eq!(config.selection.max_points, Some(200));
        // Untouched fields keep their defaults.
        assert_eq!(config.selection.grad_thresh, 10.0);
        assert_eq!(config.trust_region_radius, 0.1);
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = DvoConfig {
            trust_region_radius: 0.05,
            regularize: false,
            ..Default::default()
        };
        let json = config.to_json_pretty().unwrap();
        assert_eq!(DvoConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_config_validation() {
        let bad = DvoConfig {
            trust_region_radius: 0.0,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(DvoError::InvalidConfig(_))));

        let bad = DvoConfig {
            iterations_config: vec![],
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        assert!(DvoConfig::from_json("{ not json").is_err());
    }

    #[test]
    fn test_status_usable() {
        assert!(ConvergenceStatus::Converged.is_converged());
        assert!(ConvergenceStatus::Stalled.is_usable());
        assert!(!ConvergenceStatus::NoPoints.is_usable());
        assert!(!ConvergenceStatus::SingularSystem.is_usable());
    }

    #[test]
    fn test_no_points_result() {
        let pose = Pose::exp(&nalgebra::Vector6::new(0.1, 0.0, 0.0, 0.0, 0.0, 0.0));
        let result = LevelResult::no_points(2, pose);
        assert_eq!(result.pose, pose);
        assert!(result.energy_trace.is_empty());
        assert_eq!(result.status, ConvergenceStatus::NoPoints);
    }
}
