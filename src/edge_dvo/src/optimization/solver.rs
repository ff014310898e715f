//! Robust Gauss-Newton solver for a single pyramid level.
//!
//! Each iteration:
//! 1. Warp the reference points with the current pose and sample the residual field
//! 2. Estimate the robust scale and weight every residual
//! 3. Accumulate the weighted normal equations and record the energy
//! 4. Solve for a twist, clamp it to the trust region
//! 5. Left-compose the twist onto the pose and re-orthogonalize
//!
//! The iterate with the lowest energy is returned. All per-call state lives
//! in a context local to the call; the optimizer itself is immutable and can
//! be shared between threads.

use nalgebra::Vector6;
use tracing::{debug, trace, warn};

use super::debug::IterationDebug;
use super::divergence::{count_oscillation, DivergenceGuard, DEFAULT_OSCILLATION_THRESHOLD};
use super::gauss_newton::{clamp_to_trust_region, solve_step, NormalEquations};
use super::types::{ConvergenceStatus, DvoConfig, LevelResult};
use crate::camera::Intrinsics;
use crate::error::DvoError;
use crate::pose::Pose;
use crate::pyramid::FramePyramid;
use crate::reference::{ReferenceFrame, ReferencePolicy};
use crate::residual::{build_residuals, residual_field, ResidualField, ResidualSet};
use crate::robust::RobustWeighting;
use crate::time_phase;
#[cfg(feature = "profiling")]
use crate::timing::Phase;
use crate::timing::TimingCollector;

/// Multi-resolution dense aligner.
///
/// Holds configuration and strategies only; see
/// [`align`](DvoOptimizer::align) for the full pyramid and
/// [`run_iterations`](DvoOptimizer::run_iterations) for a single level.
#[derive(Debug)]
pub struct DvoOptimizer {
    config: DvoConfig,
    field: Box<dyn ResidualField>,
    weighting: RobustWeighting,
    policy: Box<dyn ReferencePolicy>,
}

impl DvoOptimizer {
    /// Create an optimizer; the residual field and reference policy follow
    /// the configuration.
    pub fn new(config: DvoConfig) -> Result<Self, DvoError> {
        config.validate()?;
        let field = residual_field(
            config.residual,
            config.interpolate_distance_transform,
            config.scale_distance_transform,
        );
        let weighting = RobustWeighting::new(config.robust_kernel, config.min_robust_scale);
        let policy = config.reference_policy.build(config.reference_thresholds());
        Ok(Self {
            config,
            field,
            weighting,
            policy,
        })
    }

    pub fn with_defaults() -> Self {
        let config = DvoConfig::default();
        Self {
            field: residual_field(config.residual, false, false),
            weighting: RobustWeighting::new(config.robust_kernel, config.min_robust_scale),
            policy: config.reference_policy.build(config.reference_thresholds()),
            config,
        }
    }

    /// Replace the residual field strategy.
    pub fn with_field(mut self, field: Box<dyn ResidualField>) -> Self {
        self.config.residual = field.kind();
        self.field = field;
        self
    }

    /// Replace the reference replacement policy.
    pub fn with_policy(mut self, policy: Box<dyn ReferencePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &DvoConfig {
        &self.config
    }

    pub fn field(&self) -> &dyn ResidualField {
        self.field.as_ref()
    }

    pub fn policy(&self) -> &dyn ReferencePolicy {
        self.policy.as_ref()
    }

    /// Refine `pose_in` on pyramid level `level` with at most `max_iterations`
    /// pose updates.
    ///
    /// `camera` holds the level-0 intrinsics. An empty point set makes the
    /// level a no-op that returns `pose_in` with status
    /// [`ConvergenceStatus::NoPoints`].
    pub fn run_iterations(
        &self,
        reference: &ReferenceFrame,
        current: &FramePyramid,
        camera: &Intrinsics,
        level: usize,
        max_iterations: usize,
        pose_in: &Pose,
    ) -> Result<LevelResult, DvoError> {
        let levels = reference.num_levels().min(current.num_levels());
        let (Some(points), Some(current_level)) = (reference.points(level), current.level(level))
        else {
            return Err(DvoError::LevelOutOfRange { level, levels });
        };
        if self.field.uses_edges() && current_level.edges.is_none() {
            return Err(DvoError::MissingEdgeField { level });
        }
        if points.is_empty() {
            debug!(level, "no points selected, skipping level");
            return Ok(LevelResult::no_points(level, *pose_in));
        }

        let camera = camera.at_level(level);
        let mut ctx = LevelContext::new(*pose_in, self.config.divergence_patience);
        let mut status = ConvergenceStatus::MaxIterations;
        ctx.timing.start_level();

        for iteration in 0..=max_iterations {
            ctx.timing.start_iteration();
            let set = time_phase!(ctx.timing, Phase::Residuals, {
                build_residuals(self.field.as_ref(), points, current_level, &camera, &ctx.pose)
            });

            if set.num_valid == 0 {
                warn!(level, iteration, "no reference point is visible in the current frame");
                if ctx.best.is_none() {
                    ctx.best = Some(BestIterate::from_set(ctx.pose, set, 0.0));
                }
                status = ConvergenceStatus::NoVisiblePoints;
                break;
            }

            let (weights, scale) =
                time_phase!(ctx.timing, Phase::Weighting, { self.weighting.compute(&set) });
            let equations = time_phase!(ctx.timing, Phase::NormalEquations, {
                NormalEquations::assemble(&set, &weights)
            });
            let energy = equations.energy();
            ctx.energy_trace.push(energy);

            let mut record = self.config.collect_debug.then(|| {
                let mut r = IterationDebug::new(iteration);
                r.set_pose(&ctx.pose);
                r.energy = energy;
                r.num_valid = set.num_valid;
                r.visible_ratio = set.visible_ratio;
                r.robust_scale = scale;
                r.set_gradient(&equations.gradient);
                r
            });

            trace!(
                level,
                iteration,
                energy,
                num_valid = set.num_valid,
                visible_ratio = set.visible_ratio,
                scale,
                "evaluated iterate"
            );

            let improved = ctx.guard.observe(iteration, energy);
            if improved {
                ctx.best = Some(BestIterate::from_set(ctx.pose, set, scale));
            }
            if let Some(r) = record.as_mut() {
                r.improved = improved;
            }

            if ctx.guard.is_stalled() {
                debug!(level, iteration, "energy stopped improving");
                status = ConvergenceStatus::Stalled;
                ctx.finish_iteration(record);
                break;
            }
            if iteration == max_iterations {
                ctx.finish_iteration(record);
                break;
            }

            let regularization = self
                .config
                .regularize
                .then_some(self.config.regularization_factor);
            let step = time_phase!(ctx.timing, Phase::Solver, {
                solve_step(&equations, regularization, self.config.svd_tolerance)
            });
            // No update is possible, so further iterates would repeat this
            // one. After at least one applied step the best iterate stands.
            let Some(step) = step else {
                warn!(level, iteration, "singular normal equations, keeping best pose");
                status = if ctx.steps.is_empty() {
                    ConvergenceStatus::SingularSystem
                } else {
                    ConvergenceStatus::Stalled
                };
                ctx.finish_iteration(record);
                break;
            };
            if let Some(r) = record.as_mut() {
                r.set_twist(&step);
            }

            if step.norm() < self.config.psi_norm_termination_threshold {
                status = ConvergenceStatus::Converged;
                ctx.finish_iteration(record);
                break;
            }

            let (applied, clamped) = clamp_to_trust_region(&step, self.config.trust_region_radius);
            time_phase!(ctx.timing, Phase::PoseUpdate, {
                ctx.pose = ctx.pose.left_update(&applied);
                if self.config.re_orthogonalize {
                    ctx.pose.reorthogonalize();
                }
            });
            ctx.steps.push(applied);
            if let Some(r) = record.as_mut() {
                r.step_clamped = clamped;
                r.step_applied = true;
            }
            ctx.finish_iteration(record);
        }

        let result = ctx.into_result(
            level,
            points.len(),
            status,
            self.config.ratio_of_visible_pts_thresh,
        );
        debug!(
            level,
            status = ?result.status,
            iterations = result.iterations,
            energy = result.average_energy,
            visible_ratio = result.final_visible_ratio,
            "level finished"
        );
        if result.low_confidence {
            warn!(
                level,
                visible_ratio = result.final_visible_ratio,
                "low visible ratio, result is low-confidence"
            );
        }
        Ok(result)
    }
}

/// Best iterate seen so far with the residuals evaluated at it.
struct BestIterate {
    pose: Pose,
    set: ResidualSet,
    scale: f64,
}

impl BestIterate {
    fn from_set(pose: Pose, set: ResidualSet, scale: f64) -> Self {
        Self { pose, set, scale }
    }
}

/// Mutable state of one `run_iterations` call.
struct LevelContext {
    pose: Pose,
    guard: DivergenceGuard,
    best: Option<BestIterate>,
    energy_trace: Vec<f64>,
    steps: Vec<Vector6<f64>>,
    records: Vec<IterationDebug>,
    timing: TimingCollector,
}

impl LevelContext {
    fn new(pose: Pose, patience: usize) -> Self {
        Self {
            pose,
            guard: DivergenceGuard::new(patience),
            best: None,
            energy_trace: Vec::new(),
            steps: Vec::new(),
            records: Vec::new(),
            timing: TimingCollector::new(),
        }
    }

    fn finish_iteration(&mut self, record: Option<IterationDebug>) {
        self.timing.end_iteration();
        if let Some(r) = record {
            self.records.push(r);
        }
    }

    fn into_result(
        mut self,
        level: usize,
        num_points: usize,
        status: ConvergenceStatus,
        ratio_thresh: f64,
    ) -> LevelResult {
        let timing = self.timing.finish();
        if let Some(timing) = &timing {
            for (record, t) in self.records.iter_mut().zip(&timing.iterations) {
                record.timing = Some(t.clone());
            }
        }

        let oscillation = count_oscillation(&self.steps, DEFAULT_OSCILLATION_THRESHOLD);
        let best_energy_index = self.guard.best_index();
        let average_energy = best_energy_index
            .map(|i| self.energy_trace[i])
            .unwrap_or(0.0);

        let mut result = LevelResult::no_points(level, self.pose);
        result.status = status;
        result.num_points = num_points;
        result.iterations = self.steps.len();
        result.energy_trace = self.energy_trace;
        result.best_energy_index = best_energy_index;
        result.average_energy = average_energy;
        result.oscillation_count = oscillation.max_oscillation_count;
        result.debug = self.records;
        result.timing = timing;

        if let Some(best) = self.best {
            result.pose = best.pose;
            result.robust_scale = best.scale;
            result.final_visible_ratio = best.set.visible_ratio;
            result.final_residuals = best.set.residuals;
            result.final_valid = best.set.valid;
            result.final_reprojections = best.set.reprojections;
        }
        result.low_confidence = result.final_visible_ratio < ratio_thresh;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::divergence::best_energy_index;
    use crate::pyramid::PyramidLevel;
    use crate::residual::{
        DistanceTransformField, FieldSample, IntensityField, ResidualKind, INVALID_RESIDUAL,
    };
    use crate::selection::SelectionConfig;
    use crate::test_utils::{with_invalid_depth, SyntheticScene};
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, Matrix3};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn selection() -> SelectionConfig {
        SelectionConfig {
            grad_thresh: 3.0,
            max_points: Some(1500),
            ..Default::default()
        }
    }

    fn optimizer(config: DvoConfig) -> DvoOptimizer {
        DvoOptimizer::new(config).unwrap()
    }

    fn setup(scene: &SyntheticScene, truth: &Pose) -> (ReferenceFrame, FramePyramid) {
        let reference = ReferenceFrame::new(
            scene.render(&Pose::identity()).unwrap(),
            &scene.camera,
            &selection(),
        );
        let current = scene.render(truth).unwrap();
        (reference, current)
    }

    #[test]
    fn test_optimizer_creation() {
        let opt = DvoOptimizer::with_defaults();
        assert_eq!(opt.config().num_levels(), 3);
        assert!(!opt.field().uses_edges());

        let bad = DvoConfig {
            min_robust_scale: -1.0,
            ..Default::default()
        };
        assert!(DvoOptimizer::new(bad).is_err());

        let opt = DvoOptimizer::with_defaults().with_field(Box::new(DistanceTransformField::default()));
        assert!(opt.field().uses_edges());
        assert_eq!(opt.config().residual, crate::residual::ResidualKind::DistanceTransform);
    }

    #[test]
    fn test_single_level_recovers_small_translation() {
        let scene = SyntheticScene::default();
        let truth = Pose::exp(&Vector6::new(0.01, -0.008, 0.0, 0.0, 0.0, 0.0));
        let (reference, current) = setup(&scene, &truth);

        let opt = optimizer(DvoConfig::default());
        let result = opt
            .run_iterations(&reference, &current, &scene.camera, 1, 30, &Pose::identity())
            .unwrap();

        assert!(result.status.is_usable(), "{:?}", result.status);
        assert_relative_eq!(result.pose.translation, truth.translation, epsilon = 2e-3);
        assert!(result.pose.is_rotation_valid(1e-9));
        assert!(result.average_energy < result.energy_trace[0]);
    }

    #[test]
    fn test_returned_pose_is_best_energy_iterate() {
        let scene = SyntheticScene::default();
        let truth = Pose::exp(&Vector6::new(0.02, 0.0, 0.01, 0.0, 0.01, 0.0));
        let (reference, current) = setup(&scene, &truth);

        let config = DvoConfig {
            collect_debug: true,
            ..Default::default()
        };
        let opt = optimizer(config);
        let result = opt
            .run_iterations(&reference, &current, &scene.camera, 2, 15, &Pose::identity())
            .unwrap();

        let best = result.best_energy_index.unwrap();
        assert_eq!(Some(best), best_energy_index(&result.energy_trace));
        let min = result.energy_trace.iter().copied().fold(f64::INFINITY, f64::min);
        assert_eq!(result.average_energy, min);

        // The debug record of the best iterate carries the returned pose.
        let record = &result.debug[best];
        let expected = result.pose.to_vector();
        for k in 0..6 {
            assert_relative_eq!(record.pose[k], expected[k], epsilon = 1e-12);
        }
        assert_eq!(result.debug.len(), result.energy_trace.len());
    }

    #[test]
    fn test_trust_region_caps_every_step() {
        let scene = SyntheticScene::default();
        let truth = Pose::exp(&Vector6::new(0.05, 0.03, 0.0, 0.0, 0.02, 0.0));
        let (reference, current) = setup(&scene, &truth);

        let radius = 0.004;
        let config = DvoConfig {
            trust_region_radius: radius,
            collect_debug: true,
            divergence_patience: 50,
            ..Default::default()
        };
        let result = optimizer(config)
            .run_iterations(&reference, &current, &scene.camera, 2, 10, &Pose::identity())
            .unwrap();

        let applied: Vec<_> = result.debug.iter().filter(|r| r.step_applied).collect();
        assert!(!applied.is_empty());
        assert!(applied.iter().any(|r| r.step_clamped));

        // Consecutive evaluated poses differ by at most the radius.
        let mut previous = Pose::identity();
        for record in result.debug.iter().skip(1) {
            let v = &record.pose;
            let current_pose = Pose::from_parts(
                Pose::exp(&Vector6::new(0.0, 0.0, 0.0, v[3], v[4], v[5])).rotation,
                nalgebra::Vector3::new(v[0], v[1], v[2]),
            );
            let drift = previous.drift_to(&current_pose);
            assert!(drift.translation <= radius * 1.5 + 1e-9);
            assert!(drift.rotation <= radius + 1e-9);
            previous = current_pose;
        }
    }

    #[test]
    fn test_zero_budget_only_evaluates() {
        let scene = SyntheticScene::default();
        let truth = Pose::exp(&Vector6::new(0.01, 0.0, 0.0, 0.0, 0.0, 0.0));
        let (reference, current) = setup(&scene, &truth);
        let seed = Pose::exp(&Vector6::new(0.0, 0.002, 0.0, 0.0, 0.0, 0.0));

        let result = optimizer(DvoConfig::default())
            .run_iterations(&reference, &current, &scene.camera, 0, 0, &seed)
            .unwrap();
        assert_eq!(result.energy_trace.len(), 1);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.pose, seed);
        assert_eq!(result.status, ConvergenceStatus::MaxIterations);
    }

    #[test]
    fn test_invalid_depth_level_is_noop() {
        let scene = SyntheticScene::default();
        let reference_pyramid = with_invalid_depth(&scene.render(&Pose::identity()).unwrap(), 1);
        let reference = ReferenceFrame::new(reference_pyramid, &scene.camera, &selection());
        assert!(reference.points(1).unwrap().is_empty());
        let current = scene.render(&Pose::identity()).unwrap();

        let seed = Pose::exp(&Vector6::new(0.01, 0.02, 0.0, 0.0, 0.01, 0.0));
        let result = optimizer(DvoConfig::default())
            .run_iterations(&reference, &current, &scene.camera, 1, 20, &seed)
            .unwrap();
        assert_eq!(result.status, ConvergenceStatus::NoPoints);
        assert_eq!(result.pose, seed);
        assert!(result.energy_trace.is_empty());
        assert_eq!(result.iterations, 0);
    }

    #[test]
    fn test_no_visible_points() {
        let scene = SyntheticScene::default();
        let (reference, current) = setup(&scene, &Pose::identity());
        // Move everything far outside the field of view.
        let seed = Pose::exp(&Vector6::new(50.0, 0.0, 0.0, 0.0, 0.0, 0.0));

        let result = optimizer(DvoConfig::default())
            .run_iterations(&reference, &current, &scene.camera, 0, 10, &seed)
            .unwrap();
        assert_eq!(result.status, ConvergenceStatus::NoVisiblePoints);
        assert_eq!(result.pose, seed);
        assert_eq!(result.final_visible_ratio, 0.0);
        assert!(result.low_confidence);
        assert_eq!(result.final_residuals.len(), reference.points(0).unwrap().len());
        assert!(result.final_residuals.iter().all(|r| r.is_nan()));
        assert!(INVALID_RESIDUAL.is_nan());
    }

    #[test]
    fn test_singular_system_ends_level() {
        // A constant current image has zero gradient: every Jacobian row vanishes.
        let scene = SyntheticScene::default();
        let (reference, _) = setup(&scene, &Pose::identity());
        let flat: Vec<PyramidLevel> = reference
            .pyramid()
            .levels()
            .iter()
            .map(|l| {
                let (rows, cols) = l.shape();
                PyramidLevel::new(
                    DMatrix::from_element(rows, cols, 128.0),
                    DMatrix::from_element(rows, cols, 2.0),
                )
                .unwrap()
            })
            .collect();
        let current = FramePyramid::new(flat).unwrap();

        let config = DvoConfig {
            regularize: false,
            ..Default::default()
        };
        let result = optimizer(config)
            .run_iterations(&reference, &current, &scene.camera, 1, 10, &Pose::identity())
            .unwrap();
        assert_eq!(result.status, ConvergenceStatus::SingularSystem);
        assert_eq!(result.energy_trace.len(), 1);
        assert_eq!(result.pose.rotation, Matrix3::identity());
    }

    /// Intensity field whose gradient vanishes once `budget` samples are used.
    #[derive(Debug)]
    struct FadingField {
        budget: usize,
        used: AtomicUsize,
    }

    impl ResidualField for FadingField {
        fn kind(&self) -> ResidualKind {
            ResidualKind::Intensity
        }

        fn sample(&self, level: &PyramidLevel, u: f64, v: f64) -> Option<FieldSample> {
            let mut sample = IntensityField.sample(level, u, v)?;
            if self.used.fetch_add(1, Ordering::Relaxed) >= self.budget {
                sample.grad_u = 0.0;
                sample.grad_v = 0.0;
            }
            Some(sample)
        }

        fn residual(&self, sample: &FieldSample, reference_intensity: f64) -> f64 {
            IntensityField.residual(sample, reference_intensity)
        }
    }

    #[test]
    fn test_singular_after_progress_keeps_best_iterate() {
        let scene = SyntheticScene::default();
        let truth = Pose::exp(&Vector6::new(0.02, 0.0, 0.0, 0.0, 0.0, 0.0));
        let (reference, current) = setup(&scene, &truth);
        let num_points = reference.points(1).unwrap().len();

        let config = DvoConfig {
            regularize: false,
            ..Default::default()
        };
        let field = FadingField {
            budget: num_points,
            used: AtomicUsize::new(0),
        };
        let result = optimizer(config)
            .with_field(Box::new(field))
            .run_iterations(&reference, &current, &scene.camera, 1, 10, &Pose::identity())
            .unwrap();

        // One step was applied, then the system went singular.
        assert_eq!(result.status, ConvergenceStatus::Stalled);
        assert!(result.status.is_usable());
        assert_eq!(result.iterations, 1);
        assert_eq!(result.energy_trace.len(), 2);
        let best = result.best_energy_index.unwrap();
        assert_eq!(
            result.average_energy,
            result.energy_trace.iter().copied().fold(f64::INFINITY, f64::min)
        );
        if best == 1 {
            assert_ne!(result.pose, Pose::identity());
        }
    }

    #[test]
    fn test_level_out_of_range() {
        let scene = SyntheticScene::default();
        let (reference, current) = setup(&scene, &Pose::identity());
        let err = optimizer(DvoConfig::default())
            .run_iterations(&reference, &current, &scene.camera, 5, 10, &Pose::identity())
            .unwrap_err();
        assert!(matches!(err, DvoError::LevelOutOfRange { level: 5, levels: 3 }));
    }

    #[test]
    fn test_idempotent_at_converged_pose() {
        let scene = SyntheticScene::default();
        let truth = Pose::exp(&Vector6::new(0.01, 0.0, 0.005, 0.0, 0.005, 0.0));
        let (reference, current) = setup(&scene, &truth);
        let opt = optimizer(DvoConfig {
            collect_debug: true,
            ..Default::default()
        });

        let first = opt
            .run_iterations(&reference, &current, &scene.camera, 0, 30, &truth)
            .unwrap();
        let second = opt
            .run_iterations(&reference, &current, &scene.camera, 0, 30, &first.pose)
            .unwrap();
        assert!(second.debug[0].twist_norm < 1e-4, "{}", second.debug[0].twist_norm);
        assert!(first.pose.drift_to(&second.pose).translation < 1e-4);
    }
}
