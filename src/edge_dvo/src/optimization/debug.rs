//! Debug records for alignment iteration tracking.
//!
//! Captures the state of every Gauss-Newton iteration so that runs can be
//! dumped as JSON or compact log lines and compared offline.

use nalgebra::Vector6;
use serde::Serialize;

use crate::pose::Pose;
use crate::timing::{IterationTiming, LevelTiming};

/// State captured at one iteration of a level.
#[derive(Debug, Clone, Serialize)]
pub struct IterationDebug {
    /// Iteration number; matches the index into the energy trace.
    pub iteration: usize,

    /// Pose evaluated at this iteration `[tx, ty, tz, rx, ry, rz]`.
    pub pose: Vec<f64>,

    /// Mean weighted squared residual.
    pub energy: f64,

    pub num_valid: usize,
    pub visible_ratio: f64,
    pub robust_scale: f64,

    /// JᵀWr (6 elements).
    pub gradient: Vec<f64>,

    /// Solved twist before the trust-region clamp.
    pub twist: Vec<f64>,
    pub twist_norm: f64,

    /// Whether the twist was rescaled onto the trust region.
    pub step_clamped: bool,

    /// Whether a step was applied after this evaluation.
    pub step_applied: bool,

    /// Whether this iterate became the best one so far.
    pub improved: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<IterationTiming>,
}

impl IterationDebug {
    pub fn new(iteration: usize) -> Self {
        Self {
            iteration,
            pose: vec![0.0; 6],
            energy: 0.0,
            num_valid: 0,
            visible_ratio: 0.0,
            robust_scale: 0.0,
            gradient: vec![0.0; 6],
            twist: vec![0.0; 6],
            twist_norm: 0.0,
            step_clamped: false,
            step_applied: false,
            improved: false,
            timing: None,
        }
    }

    pub fn set_pose(&mut self, pose: &Pose) {
        self.pose = pose.to_vector().to_vec();
    }

    pub fn set_gradient(&mut self, g: &Vector6<f64>) {
        self.gradient = g.iter().copied().collect();
    }

    pub fn set_twist(&mut self, twist: &Vector6<f64>) {
        self.twist = twist.iter().copied().collect();
        self.twist_norm = twist.norm();
    }

    pub fn to_log_line(&self) -> String {
        format!(
            "iter={} pose=[{:.6},{:.6},{:.6},{:.6},{:.6},{:.6}] energy={:.6} valid={} ratio={:.3} scale={:.3} |dx|={:.3e} clamp={}",
            self.iteration,
            self.pose[0], self.pose[1], self.pose[2],
            self.pose[3], self.pose[4], self.pose[5],
            self.energy,
            self.num_valid,
            self.visible_ratio,
            self.robust_scale,
            self.twist_norm,
            self.step_clamped,
        )
    }
}

/// Iteration history of one pyramid level.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LevelDebug {
    pub level: usize,
    pub num_points: usize,
    pub status: String,
    pub iterations: Vec<IterationDebug>,
    pub energy_trace: Vec<f64>,
    pub best_energy_index: Option<usize>,
    pub final_visible_ratio: f64,
    pub oscillation_count: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<LevelTiming>,
}

/// Complete debug history for one multi-level alignment.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlignmentDebug {
    pub initial_pose: Vec<f64>,
    pub final_pose: Vec<f64>,
    pub status: String,
    /// Coarsest level first.
    pub levels: Vec<LevelDebug>,
    pub final_energy: f64,
    pub final_visible_ratio: f64,
    pub laplacian_scale: f64,
    pub reference_decision: String,
    pub aborted: bool,
}

impl AlignmentDebug {
    pub fn new() -> Self {
        Self {
            initial_pose: vec![0.0; 6],
            final_pose: vec![0.0; 6],
            ..Default::default()
        }
    }

    pub fn set_initial_pose(&mut self, pose: &Pose) {
        self.initial_pose = pose.to_vector().to_vec();
    }

    pub fn set_final_pose(&mut self, pose: &Pose) {
        self.final_pose = pose.to_vector().to_vec();
    }

    pub fn total_iterations(&self) -> usize {
        self.levels.iter().map(|l| l.iterations.len()).sum()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Format as compact multi-line log.
    pub fn to_log(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!(
            "=== DVO Alignment status={} levels={} energy={:.6} ratio={:.3} laplace={:.3} ref={} aborted={} ===",
            self.status,
            self.levels.len(),
            self.final_energy,
            self.final_visible_ratio,
            self.laplacian_scale,
            self.reference_decision,
            self.aborted,
        ));
        lines.push(format!("  initial={}", format_pose(&self.initial_pose)));
        for level in &self.levels {
            lines.push(format!(
                "  level={} points={} status={} best={:?} osc={}",
                level.level,
                level.num_points,
                level.status,
                level.best_energy_index,
                level.oscillation_count,
            ));
            for iter in &level.iterations {
                lines.push(format!("    {}", iter.to_log_line()));
            }
        }
        lines.push(format!("  final={}", format_pose(&self.final_pose)));
        lines.join("\n")
    }
}

fn format_pose(pose: &[f64]) -> String {
    let parts: Vec<String> = pose.iter().map(|v| format!("{v:.4}")).collect();
    format!("[{}]", parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iteration_debug_new() {
        let debug = IterationDebug::new(3);
        assert_eq!(debug.iteration, 3);
        assert_eq!(debug.pose.len(), 6);
        assert!(debug.timing.is_none());
    }

    #[test]
    fn test_set_twist() {
        let mut debug = IterationDebug::new(0);
        debug.set_twist(&Vector6::new(3.0, 4.0, 0.0, 0.0, 0.0, 0.0));
        assert_eq!(debug.twist, vec![3.0, 4.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(debug.twist_norm, 5.0);
    }

    #[test]
    fn test_log_line() {
        let mut debug = IterationDebug::new(1);
        debug.energy = 2.5;
        debug.num_valid = 42;
        let line = debug.to_log_line();
        assert!(line.starts_with("iter=1"));
        assert!(line.contains("valid=42"));
    }

    #[test]
    fn test_alignment_debug_json() {
        let mut debug = AlignmentDebug::new();
        debug.status = "Converged".to_string();
        debug.levels.push(LevelDebug {
            level: 0,
            iterations: vec![IterationDebug::new(0), IterationDebug::new(1)],
            ..Default::default()
        });
        debug.set_final_pose(&Pose::exp(&Vector6::new(0.1, 0.0, 0.0, 0.0, 0.0, 0.0)));

        assert_eq!(debug.total_iterations(), 2);
        let json = debug.to_json().unwrap();
        assert!(json.contains("\"status\":\"Converged\""));
        // Timing is skipped when absent.
        assert!(!json.contains("timing"));
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!((value["final_pose"][0].as_f64().unwrap() - 0.1).abs() < 1e-12);

        let log = debug.to_log();
        assert!(log.contains("level=0"));
        assert!(log.lines().count() >= 5);
    }
}
