//! Frame-to-reference visual odometry on top of [`DvoOptimizer`].
//!
//! # Example
//!
//! ```ignore
//! use edge_dvo::{DvoTracker, ResidualKind};
//!
//! let mut tracker = DvoTracker::builder()
//!     .intrinsics(525.0, 525.0, 319.5, 239.5)
//!     .residual(ResidualKind::Intensity)
//!     .build()?;
//!
//! for frame in frames {
//!     let outcome = tracker.track(frame)?;
//!     println!("{}: {:?}", outcome.frame_index, outcome.camera_from_world.to_vector());
//! }
//! ```

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::camera::Intrinsics;
use crate::multi_level::AlignmentResult;
use crate::optimization::{DvoConfig, DvoOptimizer};
use crate::pose::Pose;
use crate::pyramid::FramePyramid;
use crate::reference::{ReferenceDecision, ReferenceFrame, ReferencePolicyKind};
use crate::residual::ResidualKind;
use crate::robust::RobustKernel;

/// Builder for [`DvoTracker`].
#[derive(Debug, Clone, Default)]
pub struct DvoTrackerBuilder {
    config: DvoConfig,
    camera: Option<Intrinsics>,
}

impl DvoTrackerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole optimizer configuration.
    pub fn config(mut self, config: DvoConfig) -> Self {
        self.config = config;
        self
    }

    /// Level-0 pinhole intrinsics.
    pub fn intrinsics(mut self, fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        self.camera = Some(Intrinsics { fx, fy, cx, cy });
        self
    }

    pub fn camera(mut self, camera: Intrinsics) -> Self {
        self.camera = Some(camera);
        self
    }

    pub fn residual(mut self, kind: ResidualKind) -> Self {
        self.config.residual = kind;
        self
    }

    pub fn robust_kernel(mut self, kernel: RobustKernel) -> Self {
        self.config.robust_kernel = kernel;
        self
    }

    /// Iteration budget per level, finest level first.
    pub fn iterations(mut self, iterations: Vec<usize>) -> Self {
        self.config.iterations_config = iterations;
        self
    }

    pub fn reference_policy(mut self, kind: ReferencePolicyKind) -> Self {
        self.config.reference_policy = kind;
        self
    }

    /// Cap on selected points per level.
    pub fn max_points(mut self, max_points: Option<usize>) -> Self {
        self.config.selection.max_points = max_points;
        self
    }

    pub fn build(self) -> Result<DvoTracker> {
        let Some(camera) = self.camera else {
            bail!("camera intrinsics are required");
        };
        if !camera.is_valid() {
            bail!(
                "invalid camera intrinsics fx={} fy={} cx={} cy={}",
                camera.fx,
                camera.fy,
                camera.cx,
                camera.cy
            );
        }
        let optimizer = DvoOptimizer::new(self.config).context("invalid tracker configuration")?;
        Ok(DvoTracker::with_optimizer(optimizer, camera))
    }
}

/// What happened to one tracked frame.
#[derive(Debug, Clone)]
pub struct TrackingOutcome {
    pub frame_index: usize,

    /// Pose of this frame relative to the reference it was aligned against.
    pub relative_pose: Pose,

    /// World-to-camera pose of this frame. The first frame defines the world.
    pub camera_from_world: Pose,

    /// The alignment was accepted into the trajectory.
    pub accepted: bool,

    /// The reference frame changed while processing this frame.
    pub reference_replaced: bool,

    /// Tracking was lost; this frame became the reference with the last
    /// known pose.
    pub restart: bool,

    /// The frame was re-aligned against a rebuilt reference.
    pub retried: bool,

    /// Diagnostics of the last alignment run for this frame.
    pub alignment: Option<AlignmentResult>,
}

#[derive(Debug)]
struct GoodFrame {
    pyramid: FramePyramid,
    camera_from_world: Pose,
}

/// Tracks a stream of frames against a reference frame.
#[derive(Debug)]
pub struct DvoTracker {
    optimizer: DvoOptimizer,
    camera: Intrinsics,
    reference: Option<ReferenceFrame>,
    reference_from_world: Pose,

    /// Last accepted frame that is not the reference itself.
    last_good: Option<GoodFrame>,

    /// Seed for the next alignment.
    last_relative: Pose,
    camera_from_world: Pose,
    frame_index: usize,
}

impl DvoTracker {
    pub fn builder() -> DvoTrackerBuilder {
        DvoTrackerBuilder::new()
    }

    pub fn with_optimizer(optimizer: DvoOptimizer, camera: Intrinsics) -> Self {
        Self {
            optimizer,
            camera,
            reference: None,
            reference_from_world: Pose::identity(),
            last_good: None,
            last_relative: Pose::identity(),
            camera_from_world: Pose::identity(),
            frame_index: 0,
        }
    }

    pub fn optimizer(&self) -> &DvoOptimizer {
        &self.optimizer
    }

    pub fn camera(&self) -> &Intrinsics {
        &self.camera
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    pub fn reference(&self) -> Option<&ReferenceFrame> {
        self.reference.as_ref()
    }

    /// World-to-camera pose of the last tracked frame.
    pub fn camera_from_world(&self) -> &Pose {
        &self.camera_from_world
    }

    /// Drop the reference; the next frame starts a new trajectory at the
    /// current pose.
    pub fn reset(&mut self) {
        self.reference = None;
        self.last_good = None;
        self.last_relative = Pose::identity();
    }

    /// Align `frame` against the current reference and update the trajectory.
    pub fn track(&mut self, frame: FramePyramid) -> Result<TrackingOutcome> {
        let frame_index = self.frame_index;
        self.frame_index += 1;

        let Some(reference) = self.reference.as_ref() else {
            debug!(frame_index, "first frame becomes the reference");
            self.set_reference(frame, self.camera_from_world);
            return Ok(TrackingOutcome {
                frame_index,
                relative_pose: Pose::identity(),
                camera_from_world: self.camera_from_world,
                accepted: true,
                reference_replaced: true,
                restart: false,
                retried: false,
                alignment: None,
            });
        };

        let result = self
            .optimizer
            .align(reference, &frame, &self.camera, &self.last_relative)
            .with_context(|| format!("failed to align frame {frame_index}"))?;

        match result.reference_decision {
            ReferenceDecision::Keep => {
                Ok(self.accept(frame_index, frame, result, false, false))
            }
            ReferenceDecision::Replace {
                accept_estimate: true,
            } => {
                info!(frame_index, "replacing reference with the current frame");
                Ok(self.accept(frame_index, frame, result, true, false))
            }
            ReferenceDecision::Replace {
                accept_estimate: false,
            } => self.recover(frame_index, frame, result),
        }
    }

    fn accept(
        &mut self,
        frame_index: usize,
        frame: FramePyramid,
        result: AlignmentResult,
        make_reference: bool,
        retried: bool,
    ) -> TrackingOutcome {
        let relative_pose = result.pose;
        self.camera_from_world = relative_pose.compose(&self.reference_from_world);
        if make_reference {
            self.set_reference(frame, self.camera_from_world);
        } else {
            self.last_relative = relative_pose;
            self.last_good = Some(GoodFrame {
                pyramid: frame,
                camera_from_world: self.camera_from_world,
            });
        }
        TrackingOutcome {
            frame_index,
            relative_pose,
            camera_from_world: self.camera_from_world,
            accepted: true,
            reference_replaced: make_reference || retried,
            restart: false,
            retried,
            alignment: Some(result),
        }
    }

    /// Rebuild the reference from the last good frame and align again; if
    /// that fails too, restart from the current frame.
    fn recover(
        &mut self,
        frame_index: usize,
        frame: FramePyramid,
        first: AlignmentResult,
    ) -> Result<TrackingOutcome> {
        let Some(good) = self.last_good.take() else {
            return Ok(self.restart(frame_index, frame, first));
        };

        debug!(frame_index, "rebuilding reference from the last good frame");
        self.set_reference(good.pyramid, good.camera_from_world);
        let Some(reference) = self.reference.as_ref() else {
            return Ok(self.restart(frame_index, frame, first));
        };
        let retry = self
            .optimizer
            .align(reference, &frame, &self.camera, &Pose::identity())
            .with_context(|| format!("failed to re-align frame {frame_index}"))?;

        if retry.is_accepted() {
            let make_reference = retry.request_new_reference();
            Ok(self.accept(frame_index, frame, retry, make_reference, true))
        } else {
            Ok(self.restart(frame_index, frame, retry))
        }
    }

    fn restart(
        &mut self,
        frame_index: usize,
        frame: FramePyramid,
        result: AlignmentResult,
    ) -> TrackingOutcome {
        warn!(
            frame_index,
            visible_ratio = result.final_visible_ratio,
            status = ?result.status,
            "tracking lost, restarting from the current frame"
        );
        self.set_reference(frame, self.camera_from_world);
        TrackingOutcome {
            frame_index,
            relative_pose: Pose::identity(),
            camera_from_world: self.camera_from_world,
            accepted: false,
            reference_replaced: true,
            restart: true,
            retried: false,
            alignment: Some(result),
        }
    }

    fn set_reference(&mut self, pyramid: FramePyramid, camera_from_world: Pose) {
        let selection = &self.optimizer.config().selection;
        self.reference = Some(ReferenceFrame::new(pyramid, &self.camera, selection));
        self.reference_from_world = camera_from_world;
        self.last_relative = Pose::identity();
        self.last_good = None;
    }
}
