//! Error types for precondition violations.
//!
//! Numerical trouble inside the optimizer (singular systems, no visible
//! points, divergence) is never an error; it is reported through
//! [`ConvergenceStatus`](crate::optimization::ConvergenceStatus) instead.

use thiserror::Error;

/// Errors raised when inputs to the aligner are malformed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DvoError {
    #[error("invalid camera intrinsics: fx={fx}, fy={fy}, cx={cx}, cy={cy}")]
    InvalidIntrinsics { fx: f64, fy: f64, cx: f64, cy: f64 },

    #[error("pyramid has no levels")]
    EmptyPyramid,

    #[error("pyramid level count mismatch: reference has {reference}, current has {current}")]
    LevelCountMismatch { reference: usize, current: usize },

    #[error("level {level} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        level: usize,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("iteration budget has {budgets} entries but the pyramid has {levels} levels")]
    IterationBudgetMismatch { levels: usize, budgets: usize },

    #[error("level {level} out of range for a pyramid with {levels} levels")]
    LevelOutOfRange { level: usize, levels: usize },

    #[error("level {level} carries no edge map but the residual field needs one")]
    MissingEdgeField { level: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
