//! Dual state, iteration trace and run reports.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use sdm_core::{NodeId, SdmError, SdmResult};
use serde::{Deserialize, Serialize};

use crate::config::Mode;

/// One cutting plane `θ(λ) <= value + subgradientᵀ(λ − point)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cut {
    pub point: Vec<f64>,
    pub value: f64,
    pub subgradient: Vec<f64>,
}

impl Cut {
    /// Value of this plane at `lambda`.
    pub fn evaluate(&self, lambda: &[f64]) -> f64 {
        self.value
            + self
                .subgradient
                .iter()
                .zip(lambda.iter().zip(&self.point))
                .map(|(g, (l, p))| g * (l - p))
                .sum::<f64>()
    }
}

/// Everything a coordinator needs to continue from between iterations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DualState {
    Admm {
        /// One vector per coupling group, flattened.
        consensus: Vec<f64>,
        /// One vector per group participant, flattened.
        prices: Vec<f64>,
        penalty: f64,
        /// False only before an unpenalized warm-start sweep.
        established: bool,
    },
    Bundle {
        center: Vec<f64>,
        /// Dual value at the center; `None` before the first evaluation.
        center_value: Option<f64>,
        /// Multipliers evaluated by the next subproblem phase.
        candidate: Vec<f64>,
        proximal_weight: f64,
        cuts: Vec<Cut>,
        predicted_increase: Option<f64>,
    },
}

impl DualState {
    pub fn mode(&self) -> Mode {
        match self {
            DualState::Admm { .. } => Mode::Admm,
            DualState::Bundle { .. } => Mode::Bundle,
        }
    }
}

/// Bundle step classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Serious,
    Null,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Serious => write!(f, "serious"),
            StepKind::Null => write!(f, "null"),
        }
    }
}

/// Coordinator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initializing,
    SubproblemSolve,
    ConsensusUpdate,
    DualUpdate,
    SubgradientAggregation,
    BundleUpdate,
    Converged,
    IterationLimitReached,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Phase::Converged | Phase::IterationLimitReached | Phase::Failed
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Initializing => "initializing",
            Phase::SubproblemSolve => "subproblem_solve",
            Phase::ConsensusUpdate => "consensus_update",
            Phase::DualUpdate => "dual_update",
            Phase::SubgradientAggregation => "subgradient_aggregation",
            Phase::BundleUpdate => "bundle_update",
            Phase::Converged => "converged",
            Phase::IterationLimitReached => "iteration_limit_reached",
            Phase::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// One entry of the iteration trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub timestamp: DateTime<Utc>,
    /// Milliseconds since the run started.
    pub elapsed_ms: f64,
    /// Expected stage objective of this iteration's solves.
    pub objective: f64,
    /// Lagrangian dual value θ at the evaluated multipliers (bundle only).
    pub dual_value: Option<f64>,
    /// Best dual bound known after this iteration (bundle only).
    pub bound: Option<f64>,
    pub primal_residual: f64,
    pub dual_residual: f64,
    pub step: Option<StepKind>,
    /// ρ (ADMM) or μ (bundle) used for this iteration's update.
    pub weight: f64,
    pub bundle_size: usize,
    /// Consensus values (ADMM) or center multipliers (bundle) after the update.
    pub consensus: Vec<f64>,
    /// State the iteration started from.
    pub state: DualState,
}

/// Time breakdown by phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseTimes {
    /// Total time spent solving node subproblems.
    pub subproblem_ms: u128,
    /// Consensus averaging or subgradient aggregation.
    pub consensus_ms: u128,
    /// Price updates.
    pub dual_update_ms: u128,
    /// Bundle master problem.
    pub master_ms: u128,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationStatus {
    Converged,
    IterationLimitReached,
    Failed,
}

impl fmt::Display for CoordinationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinationStatus::Converged => write!(f, "converged"),
            CoordinationStatus::IterationLimitReached => write!(f, "iteration limit reached"),
            CoordinationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Where and why a run was aborted.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureReport {
    /// Offending node, when the failure is attributable to one.
    pub node: Option<NodeId>,
    pub iteration: usize,
    pub phase: Phase,
    pub error: SdmError,
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "iteration {} failed in {}: {}",
            self.iteration, self.phase, self.error
        )
    }
}

/// Final values of one node's subproblem.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSolution {
    pub stage_objective: f64,
    /// Variable name to value.
    pub values: BTreeMap<String, f64>,
}

/// Result of a coordination run.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinationReport {
    pub mode: Mode,
    pub status: CoordinationStatus,
    pub iterations: usize,
    /// Consensus values (ADMM) or multipliers (bundle center).
    pub consensus: Vec<f64>,
    /// Expected stage objective of the last accepted solves.
    ///
    /// The copies behind it only agree up to `solution_residual`. In bundle
    /// mode they come from the last serious step, so a run stopped away
    /// from a primal-feasible point can report an objective below `bound`.
    pub objective: Option<f64>,
    /// `‖u_child − y_parent‖` over the coupling constraints of the accepted
    /// solves; `None` before any solve is accepted.
    pub solution_residual: Option<f64>,
    /// Best Lagrangian dual bound (bundle only).
    pub bound: Option<f64>,
    pub primal_residual: f64,
    pub dual_residual: f64,
    /// Last accepted subproblem solutions keyed by node.
    pub solution: BTreeMap<NodeId, NodeSolution>,
    pub trace: Vec<IterationRecord>,
    pub final_state: DualState,
    pub solve_time_ms: u128,
    pub phase_times_ms: PhaseTimes,
    #[serde(skip)]
    pub failure: Option<FailureReport>,
}

impl CoordinationReport {
    pub fn converged(&self) -> bool {
        self.status == CoordinationStatus::Converged
    }

    /// Turn a failed report into its underlying error.
    pub fn into_result(self) -> SdmResult<Self> {
        match self.failure {
            Some(failure) => Err(failure.error),
            None => Ok(self),
        }
    }

    /// Value of a named variable in a node's final solution.
    pub fn value(&self, node: NodeId, variable: &str) -> Option<f64> {
        self.solution
            .get(&node)
            .and_then(|s| s.values.get(variable).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cut_evaluate() {
        let cut = Cut {
            point: vec![1.0, 0.0],
            value: 2.0,
            subgradient: vec![0.5, -1.0],
        };
        assert_eq!(cut.evaluate(&[1.0, 0.0]), 2.0);
        assert!((cut.evaluate(&[3.0, 1.0]) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_dual_state_serde_tag() {
        let state = DualState::Admm {
            consensus: vec![1.0],
            prices: vec![0.0, 0.0],
            penalty: 2.0,
            established: true,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"mode\":\"admm\""));
        let back: DualState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        assert_eq!(back.mode(), Mode::Admm);
    }

    #[test]
    fn test_phase_terminal() {
        assert!(Phase::Failed.is_terminal());
        assert!(!Phase::DualUpdate.is_terminal());
        assert_eq!(Phase::SubproblemSolve.to_string(), "subproblem_solve");
    }
}
