//! Subproblem registry: binds tree nodes to builders, caches their models
//! and folds coordination terms into them before each solve.
//!
//! Builders run exactly once per node ([`SubproblemRegistry::materialize`]).
//! Every later solve clones the cached model and appends the current
//! multiplier or penalty terms to its objective, so builders never see the
//! coordinator's state.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use sdm_core::{
    Model, NodeId, Realization, ScenarioTree, SdmError, SdmResult, SlotKey, SlotSide, Subproblem,
};
use tracing::debug;

use crate::backend::{SolveStatus, SolverBackend, SolverConfig};

/// What a builder is told about the node it builds.
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    pub node: NodeId,
    pub stage: usize,
    /// Conditional probability given the parent.
    pub probability: f64,
    /// Unconditional probability of reaching this node.
    pub path_probability: f64,
    pub realization: &'a Realization,
    /// Problem-wide parameters shared by every builder call.
    pub params: &'a Realization,
    pub parent: Option<NodeId>,
    pub is_leaf: bool,
}

/// Produces a node's model and its coupling slots.
///
/// Builders must be referentially transparent in `ctx`: they are called
/// once per node, possibly from several threads over a run's lifetime.
pub trait SubproblemBuilder: Send + Sync {
    fn build(&self, ctx: &BuildContext<'_>) -> SdmResult<Subproblem>;
}

impl<F> SubproblemBuilder for F
where
    F: Fn(&BuildContext<'_>) -> SdmResult<Subproblem> + Send + Sync,
{
    fn build(&self, ctx: &BuildContext<'_>) -> SdmResult<Subproblem> {
        self(ctx)
    }
}

/// Scope of a registered builder. Node builders take precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuilderTarget {
    Node(NodeId),
    Stage(usize),
}

/// Objective contribution folded into a node model before a solve.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinationTerm {
    /// `coefficientsᵀ x_slot`
    Multiplier {
        slot: SlotKey,
        coefficients: Vec<f64>,
    },
    /// `priceᵀ(x_slot − target) + (rho/2)‖x_slot − target‖²`
    Penalty {
        slot: SlotKey,
        price: Vec<f64>,
        target: Vec<f64>,
        rho: f64,
    },
}

impl CoordinationTerm {
    pub fn slot(&self) -> &SlotKey {
        match self {
            CoordinationTerm::Multiplier { slot, .. } | CoordinationTerm::Penalty { slot, .. } => {
                slot
            }
        }
    }
}

/// Result of one node solve.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSolve {
    pub node: NodeId,
    pub status: SolveStatus,
    /// Objective including coordination terms.
    pub objective: f64,
    /// Objective of the builder's model alone.
    pub stage_objective: f64,
    pub primal: Vec<f64>,
    /// Row duals (continuous models only).
    pub duals: Option<Vec<f64>>,
    /// Values of every declared slot.
    pub slots: BTreeMap<SlotKey, Vec<f64>>,
}

impl NodeSolve {
    pub fn slot(&self, key: &SlotKey) -> Option<&[f64]> {
        self.slots.get(key).map(Vec::as_slice)
    }
}

/// Holds builders and the models they produced.
#[derive(Clone, Default)]
pub struct SubproblemRegistry {
    node_builders: HashMap<NodeId, Arc<dyn SubproblemBuilder>>,
    stage_builders: HashMap<usize, Arc<dyn SubproblemBuilder>>,
    params: Arc<Realization>,
    cache: BTreeMap<NodeId, Subproblem>,
    /// Roots without a builder whose outputs are free consensus variables.
    consensus_roots: Vec<NodeId>,
    materialized: bool,
}

impl std::fmt::Debug for SubproblemRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubproblemRegistry")
            .field("node_builders", &self.node_builders.len())
            .field("stage_builders", &self.stage_builders.len())
            .field("cached", &self.cache.len())
            .field("materialized", &self.materialized)
            .finish()
    }
}

impl SubproblemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach problem-wide parameters passed to every builder.
    pub fn with_params(mut self, params: Realization) -> Self {
        self.params = Arc::new(params);
        self.invalidate();
        self
    }

    pub fn params(&self) -> &Realization {
        &self.params
    }

    /// Register a builder for one node or a whole stage.
    pub fn register_builder(
        &mut self,
        target: BuilderTarget,
        builder: impl SubproblemBuilder + 'static,
    ) {
        let builder: Arc<dyn SubproblemBuilder> = Arc::new(builder);
        match target {
            BuilderTarget::Node(id) => {
                self.node_builders.insert(id, builder);
            }
            BuilderTarget::Stage(stage) => {
                self.stage_builders.insert(stage, builder);
            }
        }
        self.invalidate();
    }

    /// Register a closure builder for one node or a whole stage.
    pub fn register_fn<F>(&mut self, target: BuilderTarget, builder: F)
    where
        F: Fn(&BuildContext<'_>) -> SdmResult<Subproblem> + Send + Sync + 'static,
    {
        self.register_builder(target, builder);
    }

    fn invalidate(&mut self) {
        self.cache.clear();
        self.consensus_roots.clear();
        self.materialized = false;
    }

    fn builder_for(&self, node: NodeId, stage: usize) -> Option<&Arc<dyn SubproblemBuilder>> {
        self.node_builders
            .get(&node)
            .or_else(|| self.stage_builders.get(&stage))
    }

    pub fn is_materialized(&self) -> bool {
        self.materialized
    }

    /// Cached subproblem for `node`, if it has a model.
    pub fn subproblem(&self, node: NodeId) -> Option<&Subproblem> {
        self.cache.get(&node)
    }

    pub fn has_model(&self, node: NodeId) -> bool {
        self.cache.contains_key(&node)
    }

    pub fn is_consensus_root(&self, node: NodeId) -> bool {
        self.consensus_roots.contains(&node)
    }

    /// Nodes that have a model, in id order.
    pub fn model_nodes(&self) -> Vec<NodeId> {
        self.cache.keys().copied().collect()
    }

    /// Run every builder once and check the slot contract.
    ///
    /// A root without a builder becomes a consensus root when it has
    /// children; any other node without a builder is a contract violation.
    pub fn materialize(&mut self, tree: &ScenarioTree) -> SdmResult<()> {
        if self.materialized {
            return Ok(());
        }
        tree.validate()?;

        let mut cache = BTreeMap::new();
        let mut consensus_roots = Vec::new();
        for node in tree.iter() {
            let Some(builder) = self.builder_for(node.id, node.stage) else {
                if node.is_root() && !node.is_leaf() {
                    consensus_roots.push(node.id);
                    continue;
                }
                return Err(SdmError::BuilderContractViolation {
                    node: node.id,
                    message: format!("no builder registered for node or stage {}", node.stage),
                });
            };

            let ctx = BuildContext {
                node: node.id,
                stage: node.stage,
                probability: node.probability,
                path_probability: tree.path_probability(node.id)?,
                realization: &node.realization,
                params: &self.params,
                parent: node.parent,
                is_leaf: node.is_leaf(),
            };
            let sub = builder.build(&ctx)?;
            check_subproblem(node.id, &sub)?;
            if node.is_root() && !sub.inputs.is_empty() {
                return Err(SdmError::BuilderContractViolation {
                    node: node.id,
                    message: "the root node cannot declare inputs".to_string(),
                });
            }
            debug!(
                node = node.id.value(),
                vars = sub.model.num_vars(),
                constraints = sub.model.num_constraints(),
                "built subproblem"
            );
            cache.insert(node.id, sub);
        }

        // Child inputs must line up with the parent's outputs
        for node in tree.iter() {
            let Some(parent) = node.parent else { continue };
            let Some(sub) = cache.get(&node.id) else { continue };
            match cache.get(&parent) {
                Some(parent_sub) => {
                    for (name, vars) in &sub.inputs {
                        let Some(offered) = parent_sub.output(name) else {
                            return Err(SdmError::BuilderContractViolation {
                                node: node.id,
                                message: format!(
                                    "input '{}' is not an output of parent {}",
                                    name, parent
                                ),
                            });
                        };
                        if offered.len() != vars.len() {
                            return Err(SdmError::BuilderContractViolation {
                                node: node.id,
                                message: format!(
                                    "input '{}' has dimension {} but parent {} offers {}",
                                    name,
                                    vars.len(),
                                    parent,
                                    offered.len()
                                ),
                            });
                        }
                    }
                }
                None => {
                    // Consensus root: siblings must agree on slot dimensions
                    for sibling in tree.children(parent)? {
                        if *sibling >= node.id {
                            break;
                        }
                        let Some(sibling_sub) = cache.get(sibling) else { continue };
                        for (name, vars) in &sub.inputs {
                            if let Some(other) = sibling_sub.input(name) {
                                if other.len() != vars.len() {
                                    return Err(SdmError::BuilderContractViolation {
                                        node: node.id,
                                        message: format!(
                                            "input '{}' has dimension {} but sibling {} declares {}",
                                            name,
                                            vars.len(),
                                            sibling,
                                            other.len()
                                        ),
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }

        self.cache = cache;
        self.consensus_roots = consensus_roots;
        self.materialized = true;
        Ok(())
    }

    /// Cached model of `node` with `terms` folded into its objective.
    pub fn build(&self, node: NodeId, terms: &[CoordinationTerm]) -> SdmResult<Model> {
        let sub = self.cache.get(&node).ok_or_else(|| {
            if self.is_consensus_root(node) {
                SdmError::BuilderContractViolation {
                    node,
                    message: "consensus root has no model to build".to_string(),
                }
            } else {
                SdmError::UnknownNode(node)
            }
        })?;

        let mut model = sub.model.clone();
        for term in terms {
            let vars = sub.slot(term.slot()).ok_or_else(|| SdmError::BuilderContractViolation {
                node,
                message: format!("coordination term targets undeclared slot {}", term.slot()),
            })?;
            match term {
                CoordinationTerm::Multiplier { coefficients, .. } => {
                    check_len(node, term.slot(), vars.len(), coefficients.len())?;
                    for (&var, &c) in vars.iter().zip(coefficients) {
                        model.add_linear_cost(var, c);
                    }
                }
                CoordinationTerm::Penalty {
                    price,
                    target,
                    rho,
                    ..
                } => {
                    check_len(node, term.slot(), vars.len(), price.len())?;
                    check_len(node, term.slot(), vars.len(), target.len())?;
                    // λ(x − z) + ρ/2 (x − z)² = ρ/2 x² + (λ − ρz) x + (ρ/2 z² − λz)
                    for ((&var, &lambda), &z) in vars.iter().zip(price).zip(target) {
                        model.add_linear_cost(var, lambda - rho * z);
                        model.add_quadratic_cost(var, var, 0.5 * rho);
                        model.add_constant_cost(0.5 * rho * z * z - lambda * z);
                    }
                }
            }
        }
        Ok(model)
    }

    /// Build and solve `node`, classifying non-optimal outcomes as errors.
    pub fn solve(
        &self,
        node: NodeId,
        terms: &[CoordinationTerm],
        backend: &dyn SolverBackend,
        config: &SolverConfig,
    ) -> SdmResult<NodeSolve> {
        let model = self.build(node, terms)?;
        let outcome = backend.solve(&model, config);
        if let Some(err) = outcome.to_error(node) {
            debug!(node = node.value(), status = %outcome.status, "subproblem failed");
            return Err(err);
        }
        if outcome.primal.len() != model.num_vars() || outcome.primal.iter().any(|v| !v.is_finite())
        {
            return Err(SdmError::SolverError {
                node: Some(node),
                message: format!(
                    "backend '{}' returned an invalid primal vector ({} values for {} variables)",
                    backend.id(),
                    outcome.primal.len(),
                    model.num_vars()
                ),
            });
        }

        let sub = &self.cache[&node];
        let stage_objective = sub.model.objective.evaluate(&outcome.primal);
        let objective = model.objective.evaluate(&outcome.primal);
        let slots = sub
            .inputs
            .iter()
            .map(|(name, vars)| (SlotKey::input(name.clone()), vars))
            .chain(
                sub.outputs
                    .iter()
                    .map(|(name, vars)| (SlotKey::output(name.clone()), vars)),
            )
            .map(|(key, vars)| {
                let values = vars.iter().map(|v| outcome.primal[v.value()]).collect();
                (key, values)
            })
            .collect();

        debug!(
            node = node.value(),
            objective,
            stage_objective,
            iterations = outcome.iterations,
            "subproblem solved"
        );

        Ok(NodeSolve {
            node,
            status: outcome.status,
            objective,
            stage_objective,
            primal: outcome.primal,
            duals: outcome.duals,
            slots,
        })
    }
}

fn check_subproblem(node: NodeId, sub: &Subproblem) -> SdmResult<()> {
    sub.model.validate(node)?;
    let n = sub.model.num_vars();
    let slots = sub
        .inputs
        .iter()
        .map(|(name, vars)| (SlotSide::Input, name, vars))
        .chain(sub.outputs.iter().map(|(name, vars)| (SlotSide::Output, name, vars)));
    for (side, name, vars) in slots {
        let key = SlotKey {
            side,
            name: name.clone(),
        };
        if vars.is_empty() {
            return Err(SdmError::BuilderContractViolation {
                node,
                message: format!("slot {} is empty", key),
            });
        }
        if let Some(v) = vars.iter().find(|v| v.value() >= n) {
            return Err(SdmError::BuilderContractViolation {
                node,
                message: format!("slot {} references unknown variable {}", key, v),
            });
        }
    }
    Ok(())
}

fn check_len(node: NodeId, slot: &SlotKey, expected: usize, got: usize) -> SdmResult<()> {
    if expected == got {
        Ok(())
    } else {
        Err(SdmError::BuilderContractViolation {
            node,
            message: format!(
                "coordination term for slot {} has {} values, slot has {}",
                slot, got, expected
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SolveOutcome;
    use sdm_core::{Sense, VarId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend that returns the midpoint of every variable's bounds.
    struct MidpointBackend;

    impl SolverBackend for MidpointBackend {
        fn id(&self) -> &str {
            "midpoint"
        }
        fn supports_integers(&self) -> bool {
            false
        }
        fn solve(&self, model: &Model, _config: &SolverConfig) -> SolveOutcome {
            SolveOutcome {
                status: SolveStatus::Optimal,
                objective: 0.0,
                primal: model
                    .variables
                    .iter()
                    .map(|v| 0.5 * (v.lower + v.upper))
                    .collect(),
                duals: None,
                iterations: 1,
                message: None,
            }
        }
    }

    fn two_scenario_tree() -> ScenarioTree {
        ScenarioTree::two_stage(
            Realization::new(),
            vec![
                (Realization::new().with_scalar("a", 1.0), 0.5),
                (Realization::new().with_scalar("a", 3.0), 0.5),
            ],
        )
        .unwrap()
    }

    fn scenario_builder(ctx: &BuildContext<'_>) -> SdmResult<Subproblem> {
        let mut model = Model::new();
        let x = model.add_var("x", 0.0, 4.0);
        let a = ctx.realization.scalar("a").unwrap_or(0.0);
        model.add_linear_cost(x, a);
        Ok(Subproblem::new(model).with_input("x", vec![x]))
    }

    #[test]
    fn test_stage_builder_and_consensus_root() {
        let tree = two_scenario_tree();
        let mut registry = SubproblemRegistry::new();
        registry.register_builder(BuilderTarget::Stage(1), scenario_builder);
        registry.materialize(&tree).unwrap();

        assert!(registry.is_consensus_root(NodeId::new(0)));
        assert!(!registry.has_model(NodeId::new(0)));
        assert_eq!(registry.model_nodes(), vec![NodeId::new(1), NodeId::new(2)]);
    }

    #[test]
    fn test_node_builder_overrides_stage_builder() {
        let tree = two_scenario_tree();
        let mut registry = SubproblemRegistry::new();
        registry.register_builder(BuilderTarget::Stage(1), scenario_builder);
        registry.register_fn(BuilderTarget::Node(NodeId::new(2)), |_| {
            let mut model = Model::new();
            let x = model.add_var("x", 0.0, 1.0);
            let _spare = model.add_var("spare", 0.0, 1.0);
            Ok(Subproblem::new(model).with_input("x", vec![x]))
        });
        registry.materialize(&tree).unwrap();

        assert_eq!(registry.subproblem(NodeId::new(1)).unwrap().model.num_vars(), 1);
        assert_eq!(registry.subproblem(NodeId::new(2)).unwrap().model.num_vars(), 2);
    }

    #[test]
    fn test_builders_run_once() {
        let tree = two_scenario_tree();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = SubproblemRegistry::new();
        registry.register_fn(BuilderTarget::Stage(1), move |ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            scenario_builder(ctx)
        });
        registry.materialize(&tree).unwrap();
        registry.materialize(&tree).unwrap();
        for node in registry.model_nodes() {
            registry.build(node, &[]).unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_builder_is_violation() {
        let tree = two_scenario_tree();
        let mut registry = SubproblemRegistry::new();
        registry.register_builder(BuilderTarget::Node(NodeId::new(1)), scenario_builder);
        let err = registry.materialize(&tree).unwrap_err();
        assert_eq!(err.node(), Some(NodeId::new(2)));
        assert!(matches!(err, SdmError::BuilderContractViolation { .. }));
    }

    #[test]
    fn test_input_must_match_parent_output() {
        let mut tree = ScenarioTree::new();
        let root = tree.create_root(Realization::new()).unwrap();
        let child = tree.add_child(root, Realization::new(), 1.0).unwrap();

        let mut registry = SubproblemRegistry::new();
        registry.register_fn(BuilderTarget::Stage(0), |_| {
            let mut model = Model::new();
            let s = model.add_var("stock", 0.0, 10.0);
            Ok(Subproblem::new(model).with_output("stock", vec![s]))
        });
        registry.register_fn(BuilderTarget::Stage(1), |_| {
            let mut model = Model::new();
            let a = model.add_var("a", 0.0, 10.0);
            let b = model.add_var("b", 0.0, 10.0);
            Ok(Subproblem::new(model).with_input("stock", vec![a, b]))
        });
        let err = registry.materialize(&tree).unwrap_err();
        assert_eq!(err.node(), Some(child));
        assert!(err.to_string().contains("dimension"));
    }

    #[test]
    fn test_unknown_input_name_is_violation() {
        let mut tree = ScenarioTree::new();
        let root = tree.create_root(Realization::new()).unwrap();
        tree.add_child(root, Realization::new(), 1.0).unwrap();

        let mut registry = SubproblemRegistry::new();
        registry.register_fn(BuilderTarget::Stage(0), |_| {
            let mut model = Model::new();
            let s = model.add_var("stock", 0.0, 10.0);
            Ok(Subproblem::new(model).with_output("stock", vec![s]))
        });
        registry.register_fn(BuilderTarget::Stage(1), |_| {
            let mut model = Model::new();
            let a = model.add_var("a", 0.0, 10.0);
            Ok(Subproblem::new(model).with_input("cash", vec![a]))
        });
        assert!(matches!(
            registry.materialize(&tree),
            Err(SdmError::BuilderContractViolation { .. })
        ));
    }

    #[test]
    fn test_slot_with_dangling_variable() {
        let tree = two_scenario_tree();
        let mut registry = SubproblemRegistry::new();
        registry.register_fn(BuilderTarget::Stage(1), |_| {
            let model = Model::new();
            Ok(Subproblem::new(model).with_input("x", vec![VarId::new(3)]))
        });
        assert!(registry.materialize(&tree).is_err());
    }

    #[test]
    fn test_penalty_folding_matches_augmented_term() {
        let tree = two_scenario_tree();
        let mut registry = SubproblemRegistry::new();
        registry.register_builder(BuilderTarget::Stage(1), scenario_builder);
        registry.materialize(&tree).unwrap();

        let node = NodeId::new(1);
        let term = CoordinationTerm::Penalty {
            slot: SlotKey::input("x"),
            price: vec![0.7],
            target: vec![2.0],
            rho: 3.0,
        };
        let model = registry.build(node, &[term]).unwrap();
        for x in [0.0, 1.5, 4.0] {
            // a = 1 for node 1
            let expected = x + 0.7 * (x - 2.0) + 1.5 * (x - 2.0) * (x - 2.0);
            assert!((model.objective.evaluate(&[x]) - expected).abs() < 1e-12);
        }

        let bad = CoordinationTerm::Multiplier {
            slot: SlotKey::input("x"),
            coefficients: vec![1.0, 2.0],
        };
        assert!(registry.build(node, &[bad]).is_err());
    }

    #[test]
    fn test_solve_reports_slots_and_objectives() {
        let tree = two_scenario_tree();
        let mut registry = SubproblemRegistry::new();
        registry.register_builder(BuilderTarget::Stage(1), scenario_builder);
        registry.materialize(&tree).unwrap();

        let term = CoordinationTerm::Multiplier {
            slot: SlotKey::input("x"),
            coefficients: vec![0.5],
        };
        let solve = registry
            .solve(NodeId::new(2), &[term], &MidpointBackend, &SolverConfig::default())
            .unwrap();
        // midpoint x = 2, a = 3
        assert_eq!(solve.slot(&SlotKey::input("x")), Some(&[2.0][..]));
        assert!((solve.stage_objective - 6.0).abs() < 1e-12);
        assert!((solve.objective - 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_solve_classifies_infeasible() {
        let tree = two_scenario_tree();
        let mut registry = SubproblemRegistry::new();
        registry.register_fn(BuilderTarget::Stage(1), |_| {
            let mut model = Model::new();
            let x = model.add_var("x", 0.0, 1.0);
            model.add_constraint("floor", vec![(x, 1.0)], Sense::Ge, 5.0);
            Ok(Subproblem::new(model).with_input("x", vec![x]))
        });
        registry.materialize(&tree).unwrap();
        let err = registry
            .solve(
                NodeId::new(1),
                &[],
                &crate::backend::ClarabelBackend,
                &SolverConfig::default(),
            )
            .unwrap_err();
        assert_eq!(
            err,
            SdmError::Infeasible {
                node: NodeId::new(1)
            }
        );
    }
}
