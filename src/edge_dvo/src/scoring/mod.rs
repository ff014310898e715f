//! Quality metrics for a finished alignment.
//!
//! - **Residual histogram**: distribution of `|r|` at the returned pose
//! - **Laplacian scale**: mean absolute deviation from the median, used to
//!   decide whether the reference frame must be replaced

pub mod histogram;
pub mod statistics;

pub use histogram::ResidualHistogram;
pub use statistics::ResidualStatistics;
