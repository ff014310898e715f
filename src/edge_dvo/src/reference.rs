//! Reference frames and reference replacement policies.
//!
//! A [`ReferenceFrame`] owns a pyramid and the points selected on each of
//! its levels. Points are selected once, when the frame becomes the
//! reference, and reused for every frame aligned against it.
//!
//! After each alignment a [`ReferencePolicy`] inspects the result quality and
//! decides whether the reference must be replaced. Two policies exist:
//!
//! - [`RejectEstimatePolicy`]: a bad alignment is thrown away; the caller
//!   rebuilds the reference from the last good frame and retries.
//! - [`ReplaceReferencePolicy`]: a bad alignment is accepted and the current
//!   frame becomes the new reference.

use serde::{Deserialize, Serialize};

use crate::camera::Intrinsics;
use crate::optimization::ConvergenceStatus;
use crate::pyramid::FramePyramid;
use crate::selection::{select, PointSet, SelectionConfig};

/// Reference pyramid with its per-level point sets.
#[derive(Debug, Clone)]
pub struct ReferenceFrame {
    pyramid: FramePyramid,
    point_sets: Vec<PointSet>,
}

impl ReferenceFrame {
    /// Select points on every level of `pyramid`.
    ///
    /// `camera` holds the intrinsics of level 0.
    pub fn new(pyramid: FramePyramid, camera: &Intrinsics, selection: &SelectionConfig) -> Self {
        let point_sets = pyramid
            .levels()
            .iter()
            .enumerate()
            .map(|(l, level)| select(level, &camera.at_level(l), selection))
            .collect();
        Self {
            pyramid,
            point_sets,
        }
    }

    pub fn pyramid(&self) -> &FramePyramid {
        &self.pyramid
    }

    pub fn num_levels(&self) -> usize {
        self.pyramid.num_levels()
    }

    pub fn points(&self, level: usize) -> Option<&PointSet> {
        self.point_sets.get(level)
    }

    pub fn num_points(&self) -> Vec<usize> {
        self.point_sets.iter().map(PointSet::len).collect()
    }

    pub fn into_pyramid(self) -> FramePyramid {
        self.pyramid
    }
}

/// Quality measures of a finished alignment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignmentQuality {
    pub status: ConvergenceStatus,
    pub visible_ratio: f64,
    pub laplacian_scale: f64,
}

/// Limits separating a trustworthy alignment from a lost reference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferenceThresholds {
    pub ratio_of_visible_pts_thresh: f64,
    pub laplacian_thresh_exit_cond: f64,
}

impl Default for ReferenceThresholds {
    fn default() -> Self {
        Self {
            ratio_of_visible_pts_thresh: 0.7,
            laplacian_thresh_exit_cond: 15.0,
        }
    }
}

impl ReferenceThresholds {
    /// Too few visible points, residuals spread too wide, or no usable pose.
    pub fn is_lost(&self, quality: &AlignmentQuality) -> bool {
        !quality.status.is_usable()
            || quality.visible_ratio < self.ratio_of_visible_pts_thresh
            || quality.laplacian_scale > self.laplacian_thresh_exit_cond
    }
}

/// What to do with the reference after an alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReferenceDecision {
    /// Reference is still good; keep aligning against it.
    Keep,
    /// A new reference is required. `accept_estimate` says whether the pose
    /// just computed may still be used.
    Replace { accept_estimate: bool },
}

impl ReferenceDecision {
    pub fn requires_new_reference(&self) -> bool {
        matches!(self, ReferenceDecision::Replace { .. })
    }
}

/// Decides whether the reference frame must be replaced.
pub trait ReferencePolicy: Send + Sync + std::fmt::Debug {
    fn decide(&self, quality: &AlignmentQuality) -> ReferenceDecision;
}

/// Discard bad estimates; the reference is rebuilt from the last good frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectEstimatePolicy {
    pub thresholds: ReferenceThresholds,
}

impl ReferencePolicy for RejectEstimatePolicy {
    fn decide(&self, quality: &AlignmentQuality) -> ReferenceDecision {
        if self.thresholds.is_lost(quality) {
            ReferenceDecision::Replace {
                accept_estimate: false,
            }
        } else {
            ReferenceDecision::Keep
        }
    }
}

/// Accept bad estimates and make the current frame the new reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceReferencePolicy {
    pub thresholds: ReferenceThresholds,
}

impl ReferencePolicy for ReplaceReferencePolicy {
    fn decide(&self, quality: &AlignmentQuality) -> ReferenceDecision {
        if self.thresholds.is_lost(quality) {
            ReferenceDecision::Replace {
                accept_estimate: quality.status.is_usable(),
            }
        } else {
            ReferenceDecision::Keep
        }
    }
}

/// Configuration-level choice of the built-in policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferencePolicyKind {
    #[default]
    RejectEstimate,
    ReplaceReference,
}

impl ReferencePolicyKind {
    pub fn build(self, thresholds: ReferenceThresholds) -> Box<dyn ReferencePolicy> {
        match self {
            ReferencePolicyKind::RejectEstimate => Box::new(RejectEstimatePolicy { thresholds }),
            ReferencePolicyKind::ReplaceReference => {
                Box::new(ReplaceReferencePolicy { thresholds })
            }
        }
    }
}
