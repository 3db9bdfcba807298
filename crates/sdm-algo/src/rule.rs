//! The update-rule strategy shared by both coordinators.
//!
//! The coordinator loop owns the subproblem phase (build, solve, barrier);
//! an [`UpdateRule`] decides which coordination terms each node sees and
//! how the dual state moves once every solve has landed.

use std::collections::BTreeMap;

use sdm_core::{NodeId, SdmResult};

use crate::config::{CoordinatorConfig, Mode};
use crate::consensus::ConsensusLayer;
use crate::registry::{CoordinationTerm, NodeSolve};
use crate::state::{DualState, Phase, PhaseTimes, StepKind};

/// Inputs to one dual update.
pub struct UpdateContext<'a> {
    pub layer: &'a ConsensusLayer,
    pub solves: &'a BTreeMap<NodeId, NodeSolve>,
    /// Unconditional probability of every solved node.
    pub weights: &'a BTreeMap<NodeId, f64>,
    pub config: &'a CoordinatorConfig,
    pub times: &'a mut PhaseTimes,
}

/// What an update produced.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    pub dual_value: Option<f64>,
    pub bound: Option<f64>,
    pub primal_residual: f64,
    pub dual_residual: f64,
    pub step: Option<StepKind>,
    pub converged: bool,
    /// Whether these solves become the reported primal solution.
    pub accepted: bool,
    /// Penalty or proximal weight in effect.
    pub weight: f64,
    pub bundle_size: usize,
    /// Consensus values or center multipliers after the update.
    pub consensus: Vec<f64>,
}

/// Master-algorithm strategy.
///
/// `update` must leave the rule untouched when it returns an error so a
/// failed iteration never advances the dual state.
pub trait UpdateRule: Send {
    fn mode(&self) -> Mode;

    /// Coordination terms node `node` solves with in the next phase.
    fn node_terms(&self, layer: &ConsensusLayer, node: NodeId) -> Vec<CoordinationTerm>;

    /// Phase reported when `update` fails.
    fn update_phase(&self) -> Phase;

    fn update(&mut self, ctx: UpdateContext<'_>) -> SdmResult<UpdateOutcome>;

    /// Snapshot sufficient to resume from this point.
    fn state(&self) -> DualState;

    /// Current consensus values or center multipliers.
    fn estimate(&self) -> Vec<f64>;
}

pub(crate) fn all_finite(values: &[f64]) -> bool {
    values.iter().all(|v| v.is_finite())
}

pub(crate) fn norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}
