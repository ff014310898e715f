//! Pose optimization for dense direct alignment.
//!
//! This module implements the robust Gauss-Newton refinement:
//! 1. Residuals and Jacobian rows for every reference point
//! 2. Robust weights from an adaptive scale
//! 3. Weighted normal equations with optional regularization
//! 4. Trust-region clamped twist, left-composed onto the pose
//! 5. Best-energy selection and divergence guard

pub mod debug;
pub mod divergence;
pub mod gauss_newton;
pub mod solver;
pub mod types;

pub use debug::{AlignmentDebug, IterationDebug, LevelDebug};
pub use divergence::{
    best_energy_index, count_oscillation, DivergenceGuard, OscillationResult,
    DEFAULT_OSCILLATION_THRESHOLD,
};
pub use gauss_newton::{
    clamp_to_trust_region, condition_number, solve_step, NormalEquations,
};
pub use solver::DvoOptimizer;
pub use types::{ConvergenceStatus, DvoConfig, LevelResult};
