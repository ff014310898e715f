//! Dense visual odometry by robust multi-resolution Gauss-Newton alignment.
//!
//! Given a reference RGB-D frame and a current frame, both as image
//! pyramids, the library estimates the rigid pose mapping reference camera
//! coordinates to current camera coordinates. Residuals are either
//! photometric (intensity differences) or geometric (distance to the nearest
//! edge in the current frame).
//!
//! # Architecture
//!
//! The alignment is split into stages:
//! - Point selection: pick reference pixels with strong gradient (or on edges)
//!   and valid depth, once per reference frame
//! - Residuals: warp the points with the pose estimate, sample the residual
//!   field and build the 6-DoF Jacobian rows
//! - Robust weighting: MAD scale estimate and M-estimator weights
//! - Gauss-Newton: weighted normal equations, regularized solve, trust region,
//!   best-iterate tracking
//! - Pyramid schedule: coarsest level first, each level seeded by the previous
//! - Reference management: decide after each alignment whether the reference
//!   frame is still usable
//!
//! # Usage
//!
//! ```ignore
//! use edge_dvo::{DvoConfig, DvoOptimizer, FramePyramid, Intrinsics, Pose, ReferenceFrame};
//!
//! let camera = Intrinsics::new(525.0, 525.0, 319.5, 239.5)?;
//! let optimizer = DvoOptimizer::new(DvoConfig::default())?;
//!
//! let reference = ReferenceFrame::new(reference_pyramid, &camera, &optimizer.config().selection);
//! let result = optimizer.align(&reference, &current_pyramid, &camera, &Pose::identity())?;
//! println!("status: {:?}, energy: {}", result.status, result.final_energy);
//! ```
//!
//! For frame streams, [`DvoTracker`] keeps the reference frame and the pose
//! chain.

pub mod camera;
pub mod error;
pub mod multi_level;
pub mod optimization;
pub mod pose;
pub mod pyramid;
pub mod reference;
pub mod residual;
pub mod robust;
pub mod scoring;
pub mod selection;
pub mod test_utils;
pub mod timing;
pub mod tracker;

pub use camera::Intrinsics;
pub use error::DvoError;
pub use pose::{Pose, PoseDrift};
pub use pyramid::{EdgeField, FramePyramid, PyramidLevel};
pub use selection::{select, PointSet, SelectionConfig};

pub use optimization::{
    AlignmentDebug, ConvergenceStatus, DvoConfig, DvoOptimizer, IterationDebug, LevelResult,
};
pub use residual::{
    build_residuals, residual_field, DistanceTransformField, IntensityField, ResidualField,
    ResidualKind, ResidualSet, INVALID_RESIDUAL,
};
pub use robust::{RobustKernel, RobustWeighting};
pub use scoring::{ResidualHistogram, ResidualStatistics};

// Multi-level alignment and reference handling
pub use multi_level::AlignmentResult;
pub use reference::{
    AlignmentQuality, ReferenceDecision, ReferenceFrame, ReferencePolicy, ReferencePolicyKind,
    ReferenceThresholds, RejectEstimatePolicy, ReplaceReferencePolicy,
};

// High-level API
pub use tracker::{DvoTracker, DvoTrackerBuilder, TrackingOutcome};

pub use timing::{IterationTiming, LevelTiming, PhaseDurations};
