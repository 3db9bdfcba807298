//! The coordination loop shared by ADMM and the bundle method.
//!
//! One iteration:
//! 1. **SubproblemSolve**: every node with a model is built with its
//!    coordination terms and solved, in parallel on a rayon pool. Each task
//!    reads the dual state snapshot and writes only its own result.
//! 2. **Barrier**: all results are collected in node order. The first
//!    failure aborts the run without touching the dual state.
//! 3. **Update**: the [`UpdateRule`] advances the dual state.
//!
//! The loop ends when the rule reports convergence, after `kmax`
//! iterations, or when the `tmax` wall-clock budget is spent.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use sdm_core::{NodeId, ScenarioTree, SdmError, SdmResult};
use tracing::{debug, info, warn};
use web_time::Instant;

use crate::admm::AdmmRule;
use crate::backend::SolverBackend;
use crate::bundle::BundleRule;
use crate::config::{CoordinatorConfig, Mode};
use crate::consensus::ConsensusLayer;
use crate::registry::{CoordinationTerm, NodeSolve, SubproblemRegistry};
use crate::rule::{norm, UpdateContext, UpdateOutcome, UpdateRule};
use crate::state::{
    CoordinationReport, CoordinationStatus, DualState, FailureReport, IterationRecord,
    NodeSolution, Phase, PhaseTimes,
};

/// Drives subproblem solves and dual updates until a terminal state.
pub struct Coordinator {
    registry: SubproblemRegistry,
    backend: Arc<dyn SolverBackend>,
    config: CoordinatorConfig,
    layer: ConsensusLayer,
    rule: Box<dyn UpdateRule>,
    /// Unconditional probability of every node with a model.
    weights: BTreeMap<NodeId, f64>,
    pool: Option<ThreadPool>,
    phase: Phase,
    iteration: usize,
    trace: Vec<IterationRecord>,
    /// Solves behind the reported primal solution.
    accepted: BTreeMap<NodeId, NodeSolve>,
    last: Option<UpdateOutcome>,
    failure: Option<FailureReport>,
    phase_times: PhaseTimes,
    started: Instant,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("mode", &self.config.mode)
            .field("backend", &self.backend.id())
            .field("phase", &self.phase)
            .field("iteration", &self.iteration)
            .finish()
    }
}

impl Coordinator {
    /// Validate everything and build every subproblem once.
    ///
    /// Tree, builder-contract and configuration errors are returned here,
    /// before any solve.
    pub fn new(
        tree: &ScenarioTree,
        registry: SubproblemRegistry,
        backend: Arc<dyn SolverBackend>,
        config: CoordinatorConfig,
    ) -> SdmResult<Self> {
        Self::setup(tree, registry, backend, config, None)
    }

    /// Continue from a saved [`DualState`] (e.g. `IterationRecord::state`).
    ///
    /// With identical inputs the next iteration reproduces the update that
    /// followed the saved state.
    pub fn resume(
        tree: &ScenarioTree,
        registry: SubproblemRegistry,
        backend: Arc<dyn SolverBackend>,
        config: CoordinatorConfig,
        state: DualState,
    ) -> SdmResult<Self> {
        if state.mode() != config.mode {
            return Err(SdmError::InvalidConfig(format!(
                "saved state is for {} but the configuration selects {}",
                state.mode(),
                config.mode
            )));
        }
        Self::setup(tree, registry, backend, config, Some(state))
    }

    fn setup(
        tree: &ScenarioTree,
        mut registry: SubproblemRegistry,
        backend: Arc<dyn SolverBackend>,
        config: CoordinatorConfig,
        state: Option<DualState>,
    ) -> SdmResult<Self> {
        config.validate()?;
        registry.materialize(tree)?;
        let layer = ConsensusLayer::new(tree, &registry)?;

        let rule: Box<dyn UpdateRule> = match (config.mode, state) {
            (Mode::Admm, None) => Box::new(AdmmRule::new(&layer, &config)?),
            (Mode::Admm, Some(state)) => Box::new(AdmmRule::from_state(&layer, state)?),
            (Mode::Bundle, None) => Box::new(BundleRule::new(&layer, &config)?),
            (Mode::Bundle, Some(state)) => Box::new(BundleRule::from_state(&layer, state)?),
        };

        let weights = registry
            .model_nodes()
            .into_iter()
            .map(|node| Ok((node, tree.path_probability(node)?)))
            .collect::<SdmResult<BTreeMap<_, _>>>()?;

        if !backend.supports_integers()
            && weights
                .keys()
                .filter_map(|n| registry.subproblem(*n))
                .any(|s| s.model.has_integers())
        {
            warn!(
                backend = backend.id(),
                "backend relaxes integer variables; results are for the relaxation"
            );
        }

        let pool = match config.threads {
            Some(n) => Some(
                ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| SdmError::InvalidConfig(format!("thread pool: {}", e)))?,
            ),
            None => None,
        };

        info!(
            mode = %config.mode,
            backend = backend.id(),
            nodes = weights.len(),
            groups = layer.groups().len(),
            constraints = layer.constraints().len(),
            "coordinator initialized"
        );

        Ok(Self {
            registry,
            backend,
            config,
            layer,
            rule,
            weights,
            pool,
            phase: Phase::Initializing,
            iteration: 0,
            trace: Vec::new(),
            accepted: BTreeMap::new(),
            last: None,
            failure: None,
            phase_times: PhaseTimes::default(),
            started: Instant::now(),
        })
    }

    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Iterations completed so far.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Current dual state (consensus and prices, or bundle state).
    pub fn state(&self) -> DualState {
        self.rule.state()
    }

    pub fn layer(&self) -> &ConsensusLayer {
        &self.layer
    }

    pub fn registry(&self) -> &SubproblemRegistry {
        &self.registry
    }

    pub fn trace(&self) -> &[IterationRecord] {
        &self.trace
    }

    /// Run one iteration.
    pub fn step(&mut self) -> Result<IterationRecord, FailureReport> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        let iteration = self.iteration;
        let state = self.rule.state();

        // X-update: solve all node subproblems in parallel
        self.phase = Phase::SubproblemSolve;
        let solve_start = Instant::now();
        let solves = match self.solve_phase() {
            Ok(solves) => solves,
            Err(error) => return Err(self.fail(iteration, Phase::SubproblemSolve, error)),
        };
        let solve_elapsed = solve_start.elapsed();
        self.phase_times.subproblem_ms += solve_elapsed.as_millis();

        if let Some(limit) = self.config.phase_timeout {
            if solve_elapsed.as_secs_f64() > limit {
                let error = SdmError::SolverError {
                    node: None,
                    message: format!(
                        "subproblem phase took {:.3}s, limit is {}s",
                        solve_elapsed.as_secs_f64(),
                        limit
                    ),
                };
                return Err(self.fail(iteration, Phase::SubproblemSolve, error));
            }
        }

        self.phase = match self.config.mode {
            Mode::Admm => Phase::ConsensusUpdate,
            Mode::Bundle => Phase::SubgradientAggregation,
        };
        let result = self.rule.update(UpdateContext {
            layer: &self.layer,
            solves: &solves,
            weights: &self.weights,
            config: &self.config,
            times: &mut self.phase_times,
        });
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(error) => {
                let phase = self.rule.update_phase();
                return Err(self.fail(iteration, phase, error));
            }
        };

        let objective = expected_objective(&solves, &self.weights);
        let record = IterationRecord {
            iteration,
            timestamp: Utc::now(),
            elapsed_ms: self.started.elapsed().as_secs_f64() * 1000.0,
            objective,
            dual_value: outcome.dual_value,
            bound: outcome.bound,
            primal_residual: outcome.primal_residual,
            dual_residual: outcome.dual_residual,
            step: outcome.step,
            weight: outcome.weight,
            bundle_size: outcome.bundle_size,
            consensus: outcome.consensus.clone(),
            state,
        };

        info!(
            iteration,
            objective,
            primal = outcome.primal_residual,
            dual = outcome.dual_residual,
            weight = outcome.weight,
            converged = outcome.converged,
            "iteration complete"
        );

        if outcome.accepted {
            self.accepted = solves;
        }
        self.phase = if outcome.converged {
            Phase::Converged
        } else {
            self.rule.update_phase()
        };
        self.iteration += 1;
        self.last = Some(outcome);
        self.trace.push(record.clone());
        Ok(record)
    }

    fn solve_phase(&self) -> SdmResult<BTreeMap<NodeId, NodeSolve>> {
        let jobs: Vec<(NodeId, Vec<CoordinationTerm>)> = self
            .weights
            .keys()
            .map(|&node| (node, self.rule.node_terms(&self.layer, node)))
            .collect();

        let registry = &self.registry;
        let backend = self.backend.as_ref();
        let solver = &self.config.solver;
        let run = || {
            jobs.par_iter()
                .map(|(node, terms)| registry.solve(*node, terms, backend, solver))
                .collect::<Vec<_>>()
        };
        let results = match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        };

        // Barrier: results arrive in node order, first failure wins
        let mut solves = BTreeMap::new();
        for result in results {
            let solve = result?;
            solves.insert(solve.node, solve);
        }
        debug!(solved = solves.len(), "subproblem phase complete");
        Ok(solves)
    }

    fn fail(&mut self, iteration: usize, phase: Phase, error: SdmError) -> FailureReport {
        let report = FailureReport {
            node: error.node(),
            iteration,
            phase,
            error,
        };
        warn!(%report, "coordination aborted");
        self.phase = Phase::Failed;
        self.failure = Some(report.clone());
        report
    }

    /// Iterate until convergence, failure, `kmax` or `tmax`.
    ///
    /// The `tmax` budget is measured from this call.
    pub fn run(&mut self) -> CoordinationReport {
        self.started = Instant::now();
        let status = loop {
            if self.failure.is_some() {
                break CoordinationStatus::Failed;
            }
            if self.phase == Phase::Converged {
                break CoordinationStatus::Converged;
            }
            if self.iteration >= self.config.kmax {
                break CoordinationStatus::IterationLimitReached;
            }
            if let Some(tmax) = self.config.tmax {
                if self.started.elapsed().as_secs_f64() >= tmax {
                    info!(tmax, "wall-clock budget exhausted");
                    break CoordinationStatus::IterationLimitReached;
                }
            }
            // Failures are recorded and picked up at the top of the loop
            let _ = self.step();
        };
        if status == CoordinationStatus::IterationLimitReached {
            self.phase = Phase::IterationLimitReached;
        }

        info!(
            status = %status,
            iterations = self.iteration,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "coordination finished"
        );
        self.report(status)
    }

    fn report(&self, status: CoordinationStatus) -> CoordinationReport {
        let objective =
            (!self.accepted.is_empty()).then(|| expected_objective(&self.accepted, &self.weights));
        let solution_residual = if self.accepted.is_empty() {
            None
        } else {
            self.layer
                .constraint_residuals(&self.accepted)
                .ok()
                .map(|r| norm(&r))
        };
        let solution = self
            .accepted
            .iter()
            .filter_map(|(node, solve)| {
                let sub = self.registry.subproblem(*node)?;
                let values = sub
                    .model
                    .variables
                    .iter()
                    .zip(&solve.primal)
                    .map(|(var, &value)| (var.name.clone(), value))
                    .collect();
                Some((
                    *node,
                    NodeSolution {
                        stage_objective: solve.stage_objective,
                        values,
                    },
                ))
            })
            .collect();

        CoordinationReport {
            mode: self.config.mode,
            status,
            iterations: self.iteration,
            consensus: self.rule.estimate(),
            objective,
            solution_residual,
            bound: self.last.as_ref().and_then(|o| o.bound),
            primal_residual: self
                .last
                .as_ref()
                .map_or(f64::INFINITY, |o| o.primal_residual),
            dual_residual: self
                .last
                .as_ref()
                .map_or(f64::INFINITY, |o| o.dual_residual),
            solution,
            trace: self.trace.clone(),
            final_state: self.rule.state(),
            solve_time_ms: self.started.elapsed().as_millis(),
            phase_times_ms: self.phase_times.clone(),
            failure: self.failure.clone(),
        }
    }
}

fn expected_objective(solves: &BTreeMap<NodeId, NodeSolve>, weights: &BTreeMap<NodeId, f64>) -> f64 {
    solves
        .iter()
        .map(|(node, s)| weights.get(node).copied().unwrap_or(0.0) * s.stage_objective)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SolveOutcome, SolveStatus, SolverConfig};
    use crate::registry::BuilderTarget;
    use sdm_core::{Model, Realization, Subproblem};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend returning each variable's lower bound; fails on models named
    /// with a single variable called "broken".
    struct LowerBoundBackend {
        calls: AtomicUsize,
    }

    impl SolverBackend for LowerBoundBackend {
        fn id(&self) -> &str {
            "lower-bound"
        }
        fn supports_integers(&self) -> bool {
            true
        }
        fn solve(&self, model: &Model, _config: &SolverConfig) -> SolveOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if model.variables.iter().any(|v| v.name == "broken") {
                return SolveOutcome::failed(SolveStatus::Error, "mock failure");
            }
            let primal: Vec<f64> = model.variables.iter().map(|v| v.lower).collect();
            SolveOutcome {
                status: SolveStatus::Optimal,
                objective: model.objective.evaluate(&primal),
                primal,
                duals: None,
                iterations: 1,
                message: None,
            }
        }
    }

    fn tree() -> ScenarioTree {
        ScenarioTree::two_stage(
            Realization::new(),
            vec![
                (Realization::new().with_scalar("lo", 1.0), 0.5),
                (Realization::new().with_scalar("lo", 1.0), 0.5),
            ],
        )
        .unwrap()
    }

    fn registry(broken: Option<NodeId>) -> SubproblemRegistry {
        let mut registry = SubproblemRegistry::new();
        registry.register_fn(BuilderTarget::Stage(1), move |ctx| {
            let mut model = Model::new();
            let name = if Some(ctx.node) == broken { "broken" } else { "x" };
            let lo = ctx.realization.scalar("lo").unwrap_or(0.0);
            let x = model.add_var(name, lo, 10.0);
            model.add_linear_cost(x, 1.0);
            Ok(Subproblem::new(model).with_input("x", vec![x]))
        });
        registry
    }

    fn backend() -> Arc<LowerBoundBackend> {
        Arc::new(LowerBoundBackend {
            calls: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_agreeing_nodes_converge_in_two_iterations() {
        let tree = tree();
        let backend = backend();
        let mut coordinator = Coordinator::new(
            &tree,
            registry(None),
            backend.clone(),
            CoordinatorConfig::admm(1.0).with_kmax(10),
        )
        .unwrap();
        assert_eq!(coordinator.phase(), Phase::Initializing);

        let report = coordinator.run();
        assert_eq!(report.status, CoordinationStatus::Converged);
        assert_eq!(report.iterations, 2);
        assert_eq!(report.consensus, vec![1.0]);
        assert_eq!(report.value(NodeId::new(1), "x"), Some(1.0));
        assert_eq!(report.objective, Some(1.0));
        assert_eq!(report.solution_residual, Some(0.0));
        assert_eq!(coordinator.phase(), Phase::Converged);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_kmax_zero_performs_no_iterations() {
        let tree = tree();
        let backend = backend();
        let mut coordinator = Coordinator::new(
            &tree,
            registry(None),
            backend.clone(),
            CoordinatorConfig::admm(1.0).with_kmax(0),
        )
        .unwrap();
        let report = coordinator.run();
        assert_eq!(report.status, CoordinationStatus::IterationLimitReached);
        assert_eq!(report.iterations, 0);
        assert!(report.trace.is_empty());
        assert_eq!(report.consensus, vec![0.0]);
        assert_eq!(report.solution_residual, None);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_node_failure_reports_and_keeps_state() {
        let tree = tree();
        let mut coordinator = Coordinator::new(
            &tree,
            registry(Some(NodeId::new(2))),
            backend(),
            CoordinatorConfig::admm(1.0),
        )
        .unwrap();
        let before = coordinator.state();

        let report = coordinator.run();
        assert_eq!(report.status, CoordinationStatus::Failed);
        assert_eq!(report.iterations, 0);
        let failure = report.failure.clone().unwrap();
        assert_eq!(failure.node, Some(NodeId::new(2)));
        assert_eq!(failure.iteration, 0);
        assert_eq!(failure.phase, Phase::SubproblemSolve);
        assert_eq!(coordinator.state(), before);
        assert_eq!(coordinator.phase(), Phase::Failed);
        assert!(matches!(
            report.into_result(),
            Err(SdmError::SolverError { .. })
        ));
    }

    #[test]
    fn test_setup_errors_surface_before_solving() {
        let tree = tree();
        let err = Coordinator::new(
            &tree,
            SubproblemRegistry::new(),
            backend(),
            CoordinatorConfig::default(),
        )
        .unwrap_err();
        assert!(err.is_setup_error());

        let err = Coordinator::new(
            &tree,
            registry(None),
            backend(),
            CoordinatorConfig::admm(-1.0),
        )
        .unwrap_err();
        assert!(matches!(err, SdmError::InvalidConfig(_)));
    }

    #[test]
    fn test_resume_checks_mode() {
        let tree = tree();
        let coordinator = Coordinator::new(
            &tree,
            registry(None),
            backend(),
            CoordinatorConfig::admm(1.0),
        )
        .unwrap();
        let state = coordinator.state();
        let err = Coordinator::resume(
            &tree,
            registry(None),
            backend(),
            CoordinatorConfig::bundle(),
            state,
        )
        .unwrap_err();
        assert!(matches!(err, SdmError::InvalidConfig(_)));
    }

    #[test]
    fn test_solution_residual_measures_disagreeing_copies() {
        let tree = ScenarioTree::two_stage(
            Realization::new(),
            vec![
                (Realization::new().with_scalar("lo", 1.0), 0.5),
                (Realization::new().with_scalar("lo", 3.0), 0.5),
            ],
        )
        .unwrap();
        let mut coordinator = Coordinator::new(
            &tree,
            registry(None),
            backend(),
            CoordinatorConfig::bundle().with_kmax(1),
        )
        .unwrap();
        let report = coordinator.run();

        // Copies 1 and 3 around their average 2
        assert_eq!(report.objective, Some(2.0));
        let residual = report.solution_residual.unwrap();
        assert!((residual - 2.0f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_time_budget_starts_with_run() {
        let tree = tree();
        let mut coordinator = Coordinator::new(
            &tree,
            registry(None),
            backend(),
            CoordinatorConfig::admm(1.0).with_tmax(0.5),
        )
        .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(600));

        let report = coordinator.run();
        assert_eq!(report.status, CoordinationStatus::Converged);
        assert_eq!(report.iterations, 2);
    }

    #[test]
    fn test_local_thread_pool() {
        let tree = tree();
        let mut coordinator = Coordinator::new(
            &tree,
            registry(None),
            backend(),
            CoordinatorConfig::bundle().with_threads(2),
        )
        .unwrap();
        let report = coordinator.run();
        assert!(report.converged());
        assert_eq!(report.bound, Some(1.0));
    }
}
