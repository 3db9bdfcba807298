//! Lagrangian relaxation maximised by a proximal bundle method.
//!
//! # Algorithm Overview
//!
//! Relaxing every coupling constraint `u_c = y_p` with multiplier `λ_c`
//! (scaled by the child's probability) gives the concave dual function
//!
//! ```text
//!   θ(λ) = Σ_n P_n min_x [ f_n(x) + Σ_{c = n} λ_cᵀu_n − Σ_{parent(c) = n} q_c λ_cᵀy_n ]
//! ```
//!
//! with subgradient `P_c (u_c − y_p)`. Each evaluation adds a cutting plane
//! to the bundle; the next candidate maximises the cutting-plane model
//! minus the proximal term `(1/2μ)‖λ − λ_center‖²`:
//!
//! ```text
//!   max  t − (1/2μ)‖λ − c‖²
//!   s.t. t <= θ_i + g_iᵀ(λ − λ_i)     for every cut i
//!        Σ_c P_c λ_c = 0              for every free consensus group
//! ```
//!
//! The master QP is solved with Clarabel.
//!
//! # Steps
//!
//! A candidate becomes the new center (serious step) when it realises at
//! least `serious_fraction` of the increase the model predicted for it;
//! μ then grows by `weight_scale`. Otherwise the center stays and μ
//! shrinks (null step). The method stops when the predicted increase
//! `v = t* − θ(center)` is below `dual_tolerance * (1 + |θ(center)|)`.

use sdm_core::{Model, NodeId, Sense, SdmError, SdmResult, VarId};
use tracing::debug;
use web_time::Instant;

use crate::backend::{ClarabelBackend, SolveStatus, SolverBackend, SolverConfig};
use crate::config::{BundleConfig, CoordinatorConfig, Mode};
use crate::consensus::ConsensusLayer;
use crate::registry::CoordinationTerm;
use crate::rule::{all_finite, norm, UpdateContext, UpdateOutcome, UpdateRule};
use crate::state::{Cut, DualState, Phase, StepKind};

/// Feasibility slack for the free-group balance rows of a seed.
const BALANCE_TOLERANCE: f64 = 1e-6;

/// Cutting planes collected so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bundle {
    cuts: Vec<Cut>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_cuts(cuts: Vec<Cut>) -> Self {
        Self { cuts }
    }

    pub fn cuts(&self) -> &[Cut] {
        &self.cuts
    }

    pub fn len(&self) -> usize {
        self.cuts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cuts.is_empty()
    }

    pub fn add(&mut self, cut: Cut) {
        self.cuts.push(cut);
    }

    /// Piecewise-linear upper model `min_i θ_i + g_iᵀ(λ − λ_i)`.
    pub fn model_value(&self, lambda: &[f64]) -> f64 {
        self.cuts
            .iter()
            .map(|c| c.evaluate(lambda))
            .fold(f64::INFINITY, f64::min)
    }

    /// Drop cuts until at most `max_size` remain, oldest inactive first.
    ///
    /// A cut is inactive at `at` when it lies strictly above the model
    /// there. The newest cut is never dropped.
    pub fn compress(&mut self, max_size: usize, at: &[f64]) {
        while self.cuts.len() > max_size.max(1) {
            let model = self.model_value(at);
            let newest = self.cuts.len() - 1;
            let slack = 1e-9 * (1.0 + model.abs());
            let victim = (0..newest)
                .find(|&i| self.cuts[i].evaluate(at) > model + slack)
                .unwrap_or(0);
            self.cuts.remove(victim);
        }
    }
}

/// Proximal bundle dual state and update.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleRule {
    bundle: Bundle,
    center: Vec<f64>,
    center_value: Option<f64>,
    candidate: Vec<f64>,
    weight: f64,
    predicted_increase: Option<f64>,
    /// Balance rows for free consensus groups.
    balance_rows: Vec<Vec<(usize, f64)>>,
}

impl BundleRule {
    /// Fresh state at the seed multipliers (or zero).
    pub fn new(layer: &ConsensusLayer, config: &CoordinatorConfig) -> SdmResult<Self> {
        let balance_rows = layer.free_group_rows();
        let start = match &config.seed {
            Some(seed) if seed.len() != layer.multiplier_dim() => {
                return Err(SdmError::InvalidConfig(format!(
                    "seed has {} values, bundle multipliers have {}",
                    seed.len(),
                    layer.multiplier_dim()
                )))
            }
            Some(seed) => {
                for row in &balance_rows {
                    let balance: f64 = row.iter().map(|&(j, w)| w * seed[j]).sum();
                    if balance.abs() > BALANCE_TOLERANCE {
                        return Err(SdmError::InvalidConfig(format!(
                            "seed multipliers of a consensus group must balance to zero, got {:.3e}",
                            balance
                        )));
                    }
                }
                seed.clone()
            }
            None => vec![0.0; layer.multiplier_dim()],
        };
        Ok(Self {
            bundle: Bundle::new(),
            center: start.clone(),
            center_value: None,
            candidate: start,
            weight: config.bundle.proximal_weight,
            predicted_increase: None,
            balance_rows,
        })
    }

    /// Continue from a saved state.
    pub fn from_state(layer: &ConsensusLayer, state: DualState) -> SdmResult<Self> {
        let DualState::Bundle {
            center,
            center_value,
            candidate,
            proximal_weight,
            cuts,
            predicted_increase,
        } = state
        else {
            return Err(SdmError::InvalidConfig(
                "cannot resume the bundle method from an ADMM state".to_string(),
            ));
        };
        let m = layer.multiplier_dim();
        let cuts_ok = cuts
            .iter()
            .all(|c| c.point.len() == m && c.subgradient.len() == m);
        if center.len() != m || candidate.len() != m || !cuts_ok {
            return Err(SdmError::InvalidConfig(format!(
                "saved bundle state does not match {} multipliers",
                m
            )));
        }
        if !(proximal_weight.is_finite() && proximal_weight > 0.0) {
            return Err(SdmError::InvalidConfig(format!(
                "saved proximal weight {} is not positive",
                proximal_weight
            )));
        }
        Ok(Self {
            bundle: Bundle::from_cuts(cuts),
            center,
            center_value,
            candidate,
            weight: proximal_weight,
            predicted_increase,
            balance_rows: layer.free_group_rows(),
        })
    }

    pub fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    pub fn candidate(&self) -> &[f64] {
        &self.candidate
    }

    pub fn center_value(&self) -> Option<f64> {
        self.center_value
    }

    /// Serious-step test and proximal weight adjustment.
    fn classify(&self, value: f64, cfg: &BundleConfig) -> (StepKind, f64) {
        let Some(center_value) = self.center_value else {
            return (StepKind::Serious, self.weight);
        };
        let predicted = self.predicted_increase.unwrap_or(0.0);
        if value - center_value >= cfg.serious_fraction * predicted {
            (
                StepKind::Serious,
                (self.weight * cfg.weight_scale).min(cfg.max_weight),
            )
        } else {
            (
                StepKind::Null,
                (self.weight / cfg.weight_scale).max(cfg.min_weight),
            )
        }
    }
}

impl UpdateRule for BundleRule {
    fn mode(&self) -> Mode {
        Mode::Bundle
    }

    fn node_terms(&self, layer: &ConsensusLayer, node: NodeId) -> Vec<CoordinationTerm> {
        layer.multiplier_terms(node, &self.candidate)
    }

    fn update_phase(&self) -> Phase {
        Phase::BundleUpdate
    }

    fn update(&mut self, ctx: UpdateContext<'_>) -> SdmResult<UpdateOutcome> {
        let config = ctx.config;

        // Subgradient aggregation
        let agg_start = Instant::now();
        let mut value = 0.0;
        for (node, solve) in ctx.solves {
            let weight = ctx.weights.get(node).copied().unwrap_or(0.0);
            value += weight * solve.objective;
        }
        let residuals = ctx.layer.constraint_residuals(ctx.solves)?;
        let subgradient = ctx.layer.subgradient(&residuals);
        ctx.times.consensus_ms += agg_start.elapsed().as_millis();

        if !value.is_finite() || !all_finite(&subgradient) {
            return Err(SdmError::NumericalInstability(
                "dual function evaluation produced non-finite values".to_string(),
            ));
        }

        // Bundle update
        let master_start = Instant::now();
        let (step, weight) = self.classify(value, &config.bundle);
        let (center, center_value) = match step {
            StepKind::Serious => (self.candidate.clone(), value),
            StepKind::Null => (
                self.center.clone(),
                self.center_value.unwrap_or(value),
            ),
        };

        let mut bundle = self.bundle.clone();
        bundle.add(Cut {
            point: self.candidate.clone(),
            value,
            subgradient,
        });
        bundle.compress(config.bundle.max_bundle_size, &self.candidate);

        let (next, predicted) = if center.is_empty() {
            (Vec::new(), 0.0)
        } else {
            let (next, t) = solve_master(
                &bundle,
                &center,
                weight,
                &self.balance_rows,
                &config.solver,
            )?;
            (next, (t - center_value).max(0.0))
        };
        ctx.times.master_ms += master_start.elapsed().as_millis();

        if !all_finite(&next) || !predicted.is_finite() {
            return Err(SdmError::NumericalInstability(
                "bundle master problem produced non-finite values".to_string(),
            ));
        }
        let converged = predicted <= config.dual_tolerance * (1.0 + center_value.abs());

        debug!(
            step = %step,
            value,
            center_value,
            predicted,
            weight,
            cuts = bundle.len(),
            "bundle update"
        );

        self.bundle = bundle;
        self.center = center;
        self.center_value = Some(center_value);
        self.candidate = next;
        self.weight = weight;
        self.predicted_increase = Some(predicted);

        Ok(UpdateOutcome {
            dual_value: Some(value),
            bound: Some(center_value),
            primal_residual: norm(&residuals),
            dual_residual: predicted,
            step: Some(step),
            converged,
            accepted: step == StepKind::Serious,
            weight,
            bundle_size: self.bundle.len(),
            consensus: self.center.clone(),
        })
    }

    fn state(&self) -> DualState {
        DualState::Bundle {
            center: self.center.clone(),
            center_value: self.center_value,
            candidate: self.candidate.clone(),
            proximal_weight: self.weight,
            cuts: self.bundle.cuts().to_vec(),
            predicted_increase: self.predicted_increase,
        }
    }

    fn estimate(&self) -> Vec<f64> {
        self.center.clone()
    }
}

/// Solve the proximal master QP; returns `(λ*, t*)`.
///
/// Minimises `(1/2μ)‖λ‖² − (1/μ)cᵀλ + (1/2μ)‖c‖² − t` subject to the cuts
/// `t − g_iᵀλ <= θ_i − g_iᵀλ_i` and the balance rows.
fn solve_master(
    bundle: &Bundle,
    center: &[f64],
    weight: f64,
    balance_rows: &[Vec<(usize, f64)>],
    solver: &SolverConfig,
) -> SdmResult<(Vec<f64>, f64)> {
    let m = center.len();
    let mut model = Model::new();
    let lambda: Vec<VarId> = (0..m)
        .map(|j| model.add_var(format!("lambda[{}]", j), f64::NEG_INFINITY, f64::INFINITY))
        .collect();
    let t = model.add_var("t", f64::NEG_INFINITY, f64::INFINITY);

    let inv = 1.0 / weight;
    for (&var, &c) in lambda.iter().zip(center) {
        model.add_quadratic_cost(var, var, 0.5 * inv);
        model.add_linear_cost(var, -c * inv);
        model.add_constant_cost(0.5 * inv * c * c);
    }
    model.add_linear_cost(t, -1.0);

    for (i, cut) in bundle.cuts().iter().enumerate() {
        let mut terms = vec![(t, 1.0)];
        let mut rhs = cut.value;
        for ((&var, &g), &p) in lambda.iter().zip(&cut.subgradient).zip(&cut.point) {
            if g != 0.0 {
                terms.push((var, -g));
                rhs -= g * p;
            }
        }
        model.add_constraint(format!("cut[{}]", i), terms, Sense::Le, rhs);
    }
    for (k, row) in balance_rows.iter().enumerate() {
        let terms = row.iter().map(|&(j, w)| (lambda[j], w)).collect();
        model.add_constraint(format!("balance[{}]", k), terms, Sense::Eq, 0.0);
    }

    let outcome = ClarabelBackend.solve(&model, solver);
    if outcome.status != SolveStatus::Optimal {
        return Err(SdmError::NumericalInstability(format!(
            "bundle master problem is {}: {}",
            outcome.status,
            outcome.message.unwrap_or_default()
        )));
    }
    let t_value = outcome.primal[m];
    let mut next = outcome.primal;
    next.truncate(m);
    Ok((next, t_value))
}
