//! Solver backend contract.
//!
//! The coordinators never look inside a solver. They hand over a
//! [`Model`], get back a [`SolveOutcome`], and classify the status.
//! Backend choice and tuning flags are configuration.

use std::fmt;

use sdm_core::{Model, NodeId, SdmError};
use serde::{Deserialize, Serialize};

/// Classified outcome of a single solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveStatus {
    Optimal,
    Infeasible,
    Unbounded,
    /// Backend failure, numerical trouble, or time limit.
    Error,
}

impl SolveStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, SolveStatus::Optimal)
    }
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveStatus::Optimal => write!(f, "optimal"),
            SolveStatus::Infeasible => write!(f, "infeasible"),
            SolveStatus::Unbounded => write!(f, "unbounded"),
            SolveStatus::Error => write!(f, "error"),
        }
    }
}

/// What a backend returns for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveOutcome {
    pub status: SolveStatus,
    /// Objective value including the constant term (NaN unless optimal).
    pub objective: f64,
    /// Primal values indexed by `VarId`.
    pub primal: Vec<f64>,
    /// Row duals indexed by `ConstraintId`, only for continuous models.
    pub duals: Option<Vec<f64>>,
    pub iterations: usize,
    pub message: Option<String>,
}

impl SolveOutcome {
    /// Non-optimal outcome with no solution attached.
    pub fn failed(status: SolveStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            objective: f64::NAN,
            primal: Vec::new(),
            duals: None,
            iterations: 0,
            message: Some(message.into()),
        }
    }

    /// Map a non-optimal status onto the error taxonomy for `node`.
    pub fn to_error(&self, node: NodeId) -> Option<SdmError> {
        match self.status {
            SolveStatus::Optimal => None,
            SolveStatus::Infeasible => Some(SdmError::Infeasible { node }),
            SolveStatus::Unbounded => Some(SdmError::Unbounded { node }),
            SolveStatus::Error => Some(SdmError::SolverError {
                node: Some(node),
                message: self
                    .message
                    .clone()
                    .unwrap_or_else(|| "backend reported an error".to_string()),
            }),
        }
    }
}

/// Configuration passed to backend solvers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Interior-point iteration cap per relaxation
    pub max_iterations: u32,
    /// Feasibility and gap tolerance
    pub tolerance: f64,
    /// Per-call wall-clock limit in seconds
    pub timeout_seconds: f64,
    /// Branch-and-bound node limit for integer models
    pub max_nodes: usize,
    /// Distance from an integer below which a value counts as integral
    pub integrality_tolerance: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-8,
            timeout_seconds: 300.0,
            max_nodes: 10_000,
            integrality_tolerance: 1e-6,
        }
    }
}

/// Implements the actual solving.
///
/// Implementations must be thread-safe: the subproblem phase calls
/// `solve` concurrently from a worker pool.
pub trait SolverBackend: Send + Sync {
    /// Unique identifier (e.g., "clarabel")
    fn id(&self) -> &str;

    /// Whether integer variables are honoured rather than relaxed
    fn supports_integers(&self) -> bool;

    /// Solve the model
    fn solve(&self, model: &Model, config: &SolverConfig) -> SolveOutcome;
}
