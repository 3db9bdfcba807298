//! Consensus ADMM (progressive hedging) update rule.
//!
//! # Algorithm Overview
//!
//! Every coupled vector has one copy per participant and one consensus
//! value `z` per group:
//!
//! ```text
//!   min  Σ_n P_n f_n(x_n)
//!   s.t. x_i = z_g        for every participant i of group g
//! ```
//!
//! ADMM iterates:
//! 1. **x-update**: each node solves `f_n + λᵀ(x − z) + (ρ/2)‖x − z‖²`
//! 2. **z-update**: probability-weighted average of the copies
//! 3. **λ-update**: `λ ← λ + ρ(x − z)`
//!
//! The first sweep is penalized toward the seed consensus (zero when no
//! seed is given) with zero prices. With `warm_start` and no seed, the
//! first sweep solves the plain models instead and their weighted average
//! becomes the starting consensus.
//!
//! # Convergence
//!
//! - Primal: `‖x − z‖ < primal_tolerance * sqrt(n)`
//! - Dual: `ρ‖z⁺ − z‖` (counted per participant) `< dual_tolerance * sqrt(n)`
//!
//! where `n` is the number of consensus components.

use sdm_core::{NodeId, SdmError, SdmResult};
use tracing::warn;
use web_time::Instant;

use crate::config::{CoordinatorConfig, Mode};
use crate::consensus::ConsensusLayer;
use crate::registry::CoordinationTerm;
use crate::rule::{all_finite, UpdateContext, UpdateOutcome, UpdateRule};
use crate::state::{DualState, Phase};

/// ADMM dual state and update.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmmRule {
    consensus: Vec<f64>,
    prices: Vec<f64>,
    penalty: f64,
    established: bool,
}

impl AdmmRule {
    /// Fresh state: zero prices, consensus from the seed (or zero).
    ///
    /// Iteration 0 is penalized unless `warm_start` is set without a seed.
    pub fn new(layer: &ConsensusLayer, config: &CoordinatorConfig) -> SdmResult<Self> {
        let consensus = match &config.seed {
            Some(seed) if seed.len() != layer.consensus_dim() => {
                return Err(SdmError::InvalidConfig(format!(
                    "seed has {} values, ADMM consensus has {}",
                    seed.len(),
                    layer.consensus_dim()
                )))
            }
            Some(seed) => seed.clone(),
            None => vec![0.0; layer.consensus_dim()],
        };
        Ok(Self {
            consensus,
            prices: vec![0.0; layer.price_dim()],
            penalty: config.rho,
            established: config.seed.is_some() || !config.warm_start,
        })
    }

    /// Continue from a saved state.
    pub fn from_state(layer: &ConsensusLayer, state: DualState) -> SdmResult<Self> {
        let DualState::Admm {
            consensus,
            prices,
            penalty,
            established,
        } = state
        else {
            return Err(SdmError::InvalidConfig(
                "cannot resume ADMM from a bundle state".to_string(),
            ));
        };
        if consensus.len() != layer.consensus_dim() || prices.len() != layer.price_dim() {
            return Err(SdmError::InvalidConfig(format!(
                "saved ADMM state has {}/{} values, layout needs {}/{}",
                consensus.len(),
                prices.len(),
                layer.consensus_dim(),
                layer.price_dim()
            )));
        }
        if !(penalty.is_finite() && penalty > 0.0) {
            return Err(SdmError::InvalidConfig(format!(
                "saved penalty {} is not positive",
                penalty
            )));
        }
        Ok(Self {
            consensus,
            prices,
            penalty,
            established,
        })
    }

    pub fn penalty(&self) -> f64 {
        self.penalty
    }

    pub fn prices(&self) -> &[f64] {
        &self.prices
    }

    /// Residual balancing: keep primal and dual residuals within 10x.
    fn update_penalty(&self, config: &CoordinatorConfig, primal: f64, dual: f64) -> f64 {
        let ratio = primal / dual.max(1e-10);

        let new_penalty = if ratio > 10.0 {
            (self.penalty * config.penalty_scale).min(config.max_penalty)
        } else if ratio < 0.1 {
            (self.penalty / config.penalty_scale).max(config.min_penalty)
        } else {
            self.penalty
        };

        if new_penalty == self.penalty && (ratio > 10.0 || ratio < 0.1) {
            warn!(
                penalty = self.penalty,
                ratio, "penalty adaptation is pinned at its limit"
            );
        }
        new_penalty
    }
}

impl UpdateRule for AdmmRule {
    fn mode(&self) -> Mode {
        Mode::Admm
    }

    fn node_terms(&self, layer: &ConsensusLayer, node: NodeId) -> Vec<CoordinationTerm> {
        if !self.established {
            return Vec::new();
        }
        layer.penalty_terms(node, &self.prices, &self.consensus, self.penalty)
    }

    fn update_phase(&self) -> Phase {
        Phase::DualUpdate
    }

    fn update(&mut self, ctx: UpdateContext<'_>) -> SdmResult<UpdateOutcome> {
        let layer = ctx.layer;
        let config = ctx.config;

        // Z-update: average the copies
        let z_start = Instant::now();
        let values = layer.participant_values(ctx.solves)?;
        let consensus = layer.weighted_average(&values);
        let primal_residual = layer.primal_residual(&values, &consensus);
        let dual_residual = layer.dual_residual(&consensus, &self.consensus, self.penalty);
        ctx.times.consensus_ms += z_start.elapsed().as_millis();

        // Lambda-update
        let dual_start = Instant::now();
        let mut prices = self.prices.clone();
        for group in layer.groups() {
            for p in &group.participants {
                for k in 0..group.dim {
                    prices[p.offset + k] +=
                        self.penalty * (values[p.offset + k] - consensus[group.offset + k]);
                }
            }
        }
        ctx.times.dual_update_ms += dual_start.elapsed().as_millis();

        if !all_finite(&consensus)
            || !all_finite(&prices)
            || !primal_residual.is_finite()
            || !dual_residual.is_finite()
        {
            return Err(SdmError::NumericalInstability(format!(
                "ADMM update produced non-finite values at penalty {}",
                self.penalty
            )));
        }

        let n = (layer.consensus_dim().max(1) as f64).sqrt();
        let converged = primal_residual <= config.primal_tolerance * n
            && dual_residual <= config.dual_tolerance * n;

        let weight = self.penalty;
        let penalty = if config.adaptive_penalty && !converged {
            self.update_penalty(config, primal_residual, dual_residual)
        } else {
            self.penalty
        };

        self.consensus = consensus;
        self.prices = prices;
        self.penalty = penalty;
        self.established = true;

        Ok(UpdateOutcome {
            dual_value: None,
            bound: None,
            primal_residual,
            dual_residual,
            step: None,
            converged,
            accepted: true,
            weight,
            bundle_size: 0,
            consensus: self.consensus.clone(),
        })
    }

    fn state(&self) -> DualState {
        DualState::Admm {
            consensus: self.consensus.clone(),
            prices: self.prices.clone(),
            penalty: self.penalty,
            established: self.established,
        }
    }

    fn estimate(&self) -> Vec<f64> {
        self.consensus.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SolveStatus;
    use crate::registry::{BuilderTarget, NodeSolve, SubproblemRegistry};
    use crate::state::PhaseTimes;
    use sdm_core::{Model, Realization, ScenarioTree, SlotKey, Subproblem};
    use std::collections::BTreeMap;

    fn layer() -> ConsensusLayer {
        let tree = ScenarioTree::two_stage(
            Realization::new(),
            vec![(Realization::new(), 0.5), (Realization::new(), 0.5)],
        )
        .unwrap();
        let mut registry = SubproblemRegistry::new();
        registry.register_fn(BuilderTarget::Stage(1), |_| {
            let mut model = Model::new();
            let x = model.add_var("x", -10.0, 10.0);
            Ok(Subproblem::new(model).with_input("x", vec![x]))
        });
        registry.materialize(&tree).unwrap();
        ConsensusLayer::new(&tree, &registry).unwrap()
    }

    fn solves(x1: f64, x2: f64) -> BTreeMap<NodeId, NodeSolve> {
        [(1, x1), (2, x2)]
            .into_iter()
            .map(|(id, x)| {
                let node = NodeId::new(id);
                let solve = NodeSolve {
                    node,
                    status: SolveStatus::Optimal,
                    objective: 0.0,
                    stage_objective: 0.0,
                    primal: vec![x],
                    duals: None,
                    slots: [(SlotKey::input("x"), vec![x])].into_iter().collect(),
                };
                (node, solve)
            })
            .collect()
    }

    fn run_update(
        rule: &mut AdmmRule,
        layer: &ConsensusLayer,
        config: &CoordinatorConfig,
        x1: f64,
        x2: f64,
    ) -> SdmResult<UpdateOutcome> {
        let solves = solves(x1, x2);
        let weights: BTreeMap<NodeId, f64> =
            [(NodeId::new(1), 0.5), (NodeId::new(2), 0.5)].into_iter().collect();
        let mut times = PhaseTimes::default();
        rule.update(UpdateContext {
            layer,
            solves: &solves,
            weights: &weights,
            config,
            times: &mut times,
        })
    }

    #[test]
    fn test_first_sweep_is_penalized_toward_zero() {
        let layer = layer();
        let config = CoordinatorConfig::admm(2.0);
        let rule = AdmmRule::new(&layer, &config).unwrap();
        let terms = rule.node_terms(&layer, NodeId::new(1));
        assert_eq!(terms.len(), 1);
        match &terms[0] {
            CoordinationTerm::Penalty {
                price, target, rho, ..
            } => {
                assert_eq!(price, &vec![0.0]);
                assert_eq!(target, &vec![0.0]);
                assert_eq!(*rho, 2.0);
            }
            other => panic!("expected a penalty term, got {:?}", other),
        }
    }

    #[test]
    fn test_warm_start_skips_first_penalty() {
        let layer = layer();
        let config = CoordinatorConfig::admm(2.0).with_warm_start(true);
        let mut rule = AdmmRule::new(&layer, &config).unwrap();
        assert!(rule.node_terms(&layer, NodeId::new(1)).is_empty());

        // Penalized from the second sweep on, toward the plain average
        run_update(&mut rule, &layer, &config, 1.0, 3.0).unwrap();
        assert_eq!(rule.node_terms(&layer, NodeId::new(1)).len(), 1);
        assert_eq!(rule.estimate(), vec![2.0]);

        // A seed always wins over the warm start
        let seeded = AdmmRule::new(&layer, &config.clone().with_seed(vec![1.0])).unwrap();
        assert_eq!(seeded.node_terms(&layer, NodeId::new(1)).len(), 1);
    }

    #[test]
    fn test_update_averages_and_moves_prices() {
        let layer = layer();
        let config = CoordinatorConfig::admm(2.0);
        let mut rule = AdmmRule::new(&layer, &config).unwrap();

        let outcome = run_update(&mut rule, &layer, &config, 1.0, 3.0).unwrap();
        assert_eq!(outcome.consensus, vec![2.0]);
        assert!((outcome.primal_residual - 2.0f64.sqrt()).abs() < 1e-12);
        // ρ * sqrt(2 participants) * |2 − 0|
        assert!((outcome.dual_residual - 2.0 * 2.0f64.sqrt() * 2.0).abs() < 1e-12);
        assert_eq!(rule.prices(), &[-2.0, 2.0]);
        assert!(!outcome.converged);

        // Prices stay probability-balanced
        let sum: f64 = rule.prices().iter().map(|p| 0.5 * p).sum();
        assert!(sum.abs() < 1e-12);
    }

    #[test]
    fn test_converges_when_copies_agree() {
        let layer = layer();
        let config = CoordinatorConfig::admm(2.0).with_seed(vec![1.5]);
        let mut rule = AdmmRule::new(&layer, &config).unwrap();
        let outcome = run_update(&mut rule, &layer, &config, 1.5, 1.5).unwrap();
        assert!(outcome.converged);
        assert_eq!(outcome.primal_residual, 0.0);
    }

    #[test]
    fn test_non_finite_leaves_state_untouched() {
        let layer = layer();
        let config = CoordinatorConfig::admm(2.0);
        let mut rule = AdmmRule::new(&layer, &config).unwrap();
        let before = rule.state();
        let err = run_update(&mut rule, &layer, &config, f64::NAN, 1.0).unwrap_err();
        assert!(matches!(err, SdmError::NumericalInstability(_)));
        assert_eq!(rule.state(), before);
    }

    #[test]
    fn test_adaptive_penalty_increases_on_large_primal() {
        let layer = layer();
        let config = CoordinatorConfig::admm(1.0)
            .with_seed(vec![0.0])
            .with_adaptive_penalty(true);
        let mut rule = AdmmRule::new(&layer, &config).unwrap();
        // z stays 0, copies disagree: primal large, dual zero
        let outcome = run_update(&mut rule, &layer, &config, -4.0, 4.0).unwrap();
        assert_eq!(outcome.weight, 1.0);
        assert_eq!(rule.penalty(), 2.0);
    }

    #[test]
    fn test_seed_length_checked() {
        let layer = layer();
        let config = CoordinatorConfig::admm(1.0).with_seed(vec![0.0, 1.0]);
        assert!(matches!(
            AdmmRule::new(&layer, &config),
            Err(SdmError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_resume_rejects_bundle_state() {
        let layer = layer();
        let state = DualState::Bundle {
            center: vec![0.0, 0.0],
            center_value: None,
            candidate: vec![0.0, 0.0],
            proximal_weight: 1.0,
            cuts: Vec::new(),
            predicted_increase: None,
        };
        assert!(AdmmRule::from_state(&layer, state).is_err());
    }
}
