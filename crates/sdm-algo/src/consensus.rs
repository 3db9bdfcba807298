//! Consensus layer: coupling groups, coupling constraints and residuals.
//!
//! Two views of the same coupling structure are kept:
//!
//! - **Groups** (ADMM): one per `(parent, output slot)` that at least one
//!   child inputs. Participants are the parent's output (when the parent
//!   has a model) followed by every child input, weighted by unconditional
//!   path probability. Each group owns one consensus vector.
//! - **Constraints** (Lagrangian): one per child input, `u_child = y_parent`.
//!   Each constraint owns one multiplier vector.
//!
//! Groups are ordered by `(owner stage, owner id, slot)`, constraints by
//! `(child stage, child id, slot)`. Flattened vectors follow that order,
//! and it never changes across iterations.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use sdm_core::{NodeId, ScenarioTree, SdmError, SdmResult, SlotKey};

use crate::registry::{CoordinationTerm, NodeSolve, SubproblemRegistry};

/// One copy of a coupled vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub node: NodeId,
    pub slot: SlotKey,
    /// Unconditional probability of `node`.
    pub weight: f64,
    /// Offset of this participant's price vector.
    pub offset: usize,
}

/// All copies of one parent output.
#[derive(Debug, Clone, PartialEq)]
pub struct CouplingGroup {
    pub owner: NodeId,
    pub stage: usize,
    pub slot: String,
    pub dim: usize,
    /// Offset of the group's consensus vector.
    pub offset: usize,
    /// True when the owner has no model (free consensus variable).
    pub free: bool,
    pub participants: Vec<Participant>,
}

impl CouplingGroup {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.dim
    }

    pub fn total_weight(&self) -> f64 {
        self.participants.iter().map(|p| p.weight).sum()
    }
}

/// `u_child[slot] = y_parent[slot]`, relaxed with one multiplier vector.
#[derive(Debug, Clone, PartialEq)]
pub struct CouplingConstraint {
    pub child: NodeId,
    pub parent: NodeId,
    pub stage: usize,
    pub slot: String,
    pub dim: usize,
    /// Offset of the multiplier vector.
    pub offset: usize,
    /// Unconditional probability of the child.
    pub weight: f64,
    /// Conditional probability of the child given the parent.
    pub conditional: f64,
    /// Index of the group this constraint belongs to.
    pub group: usize,
}

impl CouplingConstraint {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.dim
    }
}

/// Deterministic coupling layout over a materialized registry.
#[derive(Debug, Clone, Default)]
pub struct ConsensusLayer {
    groups: Vec<CouplingGroup>,
    constraints: Vec<CouplingConstraint>,
    /// `(group, participant)` pairs per node.
    by_node: BTreeMap<NodeId, Vec<(usize, usize)>>,
    consensus_dim: usize,
    price_dim: usize,
    multiplier_dim: usize,
}

impl ConsensusLayer {
    pub fn new(tree: &ScenarioTree, registry: &SubproblemRegistry) -> SdmResult<Self> {
        if !registry.is_materialized() {
            return Err(SdmError::InvalidTreeState(
                "registry must be materialized before building the consensus layer".to_string(),
            ));
        }

        let mut owners: Vec<_> = tree.iter().filter(|n| !n.is_leaf()).collect();
        owners.sort_by_key(|n| (n.stage, n.id));

        let mut groups = Vec::new();
        let mut consensus_dim = 0;
        let mut price_dim = 0;
        for owner in owners {
            let owner_sub = registry.subproblem(owner.id);
            let mut children: Vec<NodeId> = owner.children.clone();
            children.sort();

            // Slots that at least one child inputs
            let mut slots = BTreeSet::new();
            for child in &children {
                if let Some(sub) = registry.subproblem(*child) {
                    slots.extend(sub.inputs.keys().cloned());
                }
            }

            for slot in slots {
                let mut participants = Vec::new();
                let mut dim = None;
                if let Some(sub) = owner_sub {
                    // materialize guarantees the output exists
                    if let Some(vars) = sub.output(&slot) {
                        dim = Some(vars.len());
                        participants.push(Participant {
                            node: owner.id,
                            slot: SlotKey::output(slot.clone()),
                            weight: tree.path_probability(owner.id)?,
                            offset: 0,
                        });
                    }
                }
                for child in &children {
                    let Some(vars) = registry.subproblem(*child).and_then(|s| s.input(&slot)) else {
                        continue;
                    };
                    dim.get_or_insert(vars.len());
                    participants.push(Participant {
                        node: *child,
                        slot: SlotKey::input(slot.clone()),
                        weight: tree.path_probability(*child)?,
                        offset: 0,
                    });
                }
                let dim = dim.unwrap_or(0);
                for p in participants.iter_mut() {
                    p.offset = price_dim;
                    price_dim += dim;
                }
                groups.push(CouplingGroup {
                    owner: owner.id,
                    stage: owner.stage,
                    slot,
                    dim,
                    offset: consensus_dim,
                    free: owner_sub.is_none(),
                    participants,
                });
                consensus_dim += dim;
            }
        }

        let mut by_node: BTreeMap<NodeId, Vec<(usize, usize)>> = BTreeMap::new();
        let mut constraints = Vec::new();
        for (g, group) in groups.iter().enumerate() {
            for (p, participant) in group.participants.iter().enumerate() {
                by_node.entry(participant.node).or_default().push((g, p));
                if participant.node == group.owner {
                    continue;
                }
                let child = tree.node(participant.node)?;
                constraints.push(CouplingConstraint {
                    child: child.id,
                    parent: group.owner,
                    stage: child.stage,
                    slot: group.slot.clone(),
                    dim: group.dim,
                    offset: 0,
                    weight: participant.weight,
                    conditional: child.probability,
                    group: g,
                });
            }
        }
        constraints.sort_by(|a, b| {
            (a.stage, a.child, &a.slot).cmp(&(b.stage, b.child, &b.slot))
        });
        let mut multiplier_dim = 0;
        for c in constraints.iter_mut() {
            c.offset = multiplier_dim;
            multiplier_dim += c.dim;
        }

        Ok(Self {
            groups,
            constraints,
            by_node,
            consensus_dim,
            price_dim,
            multiplier_dim,
        })
    }

    pub fn groups(&self) -> &[CouplingGroup] {
        &self.groups
    }

    pub fn constraints(&self) -> &[CouplingConstraint] {
        &self.constraints
    }

    pub fn consensus_dim(&self) -> usize {
        self.consensus_dim
    }

    pub fn price_dim(&self) -> usize {
        self.price_dim
    }

    pub fn multiplier_dim(&self) -> usize {
        self.multiplier_dim
    }

    /// `(group, participant)` pairs a node takes part in.
    pub fn participations(&self, node: NodeId) -> &[(usize, usize)] {
        self.by_node.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Slot values of every participant, flattened in price order.
    pub fn participant_values(&self, solves: &BTreeMap<NodeId, NodeSolve>) -> SdmResult<Vec<f64>> {
        let mut values = vec![0.0; self.price_dim];
        for group in &self.groups {
            for p in &group.participants {
                let slice = slot_values(solves, p.node, &p.slot)?;
                values[p.offset..p.offset + group.dim].copy_from_slice(slice);
            }
        }
        Ok(values)
    }

    /// Probability-weighted average of each group's participants.
    pub fn weighted_average(&self, values: &[f64]) -> Vec<f64> {
        let mut z = vec![0.0; self.consensus_dim];
        for group in &self.groups {
            let total = group.total_weight();
            for p in &group.participants {
                for k in 0..group.dim {
                    z[group.offset + k] += p.weight * values[p.offset + k];
                }
            }
            for k in group.range() {
                z[k] /= total;
            }
        }
        z
    }

    /// `‖x − z‖` over every participant.
    pub fn primal_residual(&self, values: &[f64], consensus: &[f64]) -> f64 {
        let mut sum_sq = 0.0;
        for group in &self.groups {
            for p in &group.participants {
                for k in 0..group.dim {
                    sum_sq += (values[p.offset + k] - consensus[group.offset + k]).powi(2);
                }
            }
        }
        sum_sq.sqrt()
    }

    /// `ρ‖z − z_prev‖` counted once per participant.
    pub fn dual_residual(&self, consensus: &[f64], previous: &[f64], rho: f64) -> f64 {
        let mut sum_sq = 0.0;
        for group in &self.groups {
            let count = group.participants.len() as f64;
            for k in group.range() {
                sum_sq += rho.powi(2) * count * (consensus[k] - previous[k]).powi(2);
            }
        }
        sum_sq.sqrt()
    }

    /// Augmented-Lagrangian terms for `node`'s participations.
    pub fn penalty_terms(
        &self,
        node: NodeId,
        prices: &[f64],
        consensus: &[f64],
        rho: f64,
    ) -> Vec<CoordinationTerm> {
        self.participations(node)
            .iter()
            .map(|&(g, p)| {
                let group = &self.groups[g];
                let participant = &group.participants[p];
                CoordinationTerm::Penalty {
                    slot: participant.slot.clone(),
                    price: prices[participant.offset..participant.offset + group.dim].to_vec(),
                    target: consensus[group.range()].to_vec(),
                    rho,
                }
            })
            .collect()
    }

    /// Lagrangian terms for `node`: `+λ_c` on each input it declares,
    /// `−Σ q_c λ_c` on each output its children input.
    pub fn multiplier_terms(&self, node: NodeId, multipliers: &[f64]) -> Vec<CoordinationTerm> {
        let mut by_slot: BTreeMap<SlotKey, Vec<f64>> = BTreeMap::new();
        for c in &self.constraints {
            let lambda = &multipliers[c.range()];
            if c.child == node {
                let entry = by_slot
                    .entry(SlotKey::input(c.slot.clone()))
                    .or_insert_with(|| vec![0.0; c.dim]);
                for (e, l) in entry.iter_mut().zip(lambda) {
                    *e += l;
                }
            }
            if c.parent == node && !self.groups[c.group].free {
                let entry = by_slot
                    .entry(SlotKey::output(c.slot.clone()))
                    .or_insert_with(|| vec![0.0; c.dim]);
                for (e, l) in entry.iter_mut().zip(lambda) {
                    *e -= c.conditional * l;
                }
            }
        }
        by_slot
            .into_iter()
            .map(|(slot, coefficients)| CoordinationTerm::Multiplier { slot, coefficients })
            .collect()
    }

    /// `u_child − y_parent` per constraint, flattened in multiplier order.
    ///
    /// For a free group the parent value is the group's weighted average.
    pub fn constraint_residuals(&self, solves: &BTreeMap<NodeId, NodeSolve>) -> SdmResult<Vec<f64>> {
        let values = self.participant_values(solves)?;
        let averages = self.weighted_average(&values);
        let mut residuals = vec![0.0; self.multiplier_dim];
        for c in &self.constraints {
            let group = &self.groups[c.group];
            let child = slot_values(solves, c.child, &SlotKey::input(c.slot.clone()))?;
            let parent: &[f64] = if group.free {
                &averages[group.range()]
            } else {
                slot_values(solves, c.parent, &SlotKey::output(c.slot.clone()))?
            };
            for k in 0..c.dim {
                residuals[c.offset + k] = child[k] - parent[k];
            }
        }
        Ok(residuals)
    }

    /// Probability-weighted subgradient `P_c (u_c − y_p)` of the dual function.
    pub fn subgradient(&self, residuals: &[f64]) -> Vec<f64> {
        let mut g = residuals.to_vec();
        for c in &self.constraints {
            for k in c.range() {
                g[k] *= c.weight;
            }
        }
        g
    }

    /// Rows `Σ_c P_c λ_c[k] = 0` for every free group component.
    ///
    /// Returned as sparse `(multiplier index, coefficient)` rows.
    pub fn free_group_rows(&self) -> Vec<Vec<(usize, f64)>> {
        let mut rows = Vec::new();
        for (g, group) in self.groups.iter().enumerate() {
            if !group.free {
                continue;
            }
            for k in 0..group.dim {
                let row: Vec<(usize, f64)> = self
                    .constraints
                    .iter()
                    .filter(|c| c.group == g)
                    .map(|c| (c.offset + k, c.weight))
                    .collect();
                rows.push(row);
            }
        }
        rows
    }
}

fn slot_values<'a>(
    solves: &'a BTreeMap<NodeId, NodeSolve>,
    node: NodeId,
    slot: &SlotKey,
) -> SdmResult<&'a [f64]> {
    solves
        .get(&node)
        .ok_or(SdmError::UnknownNode(node))?
        .slot(slot)
        .ok_or_else(|| SdmError::BuilderContractViolation {
            node,
            message: format!("solve is missing slot {}", slot),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SolveStatus;
    use crate::registry::BuilderTarget;
    use sdm_core::{Model, Realization, Subproblem};

    fn solve_with(node: NodeId, slots: Vec<(SlotKey, Vec<f64>)>) -> NodeSolve {
        NodeSolve {
            node,
            status: SolveStatus::Optimal,
            objective: 0.0,
            stage_objective: 0.0,
            primal: Vec::new(),
            duals: None,
            slots: slots.into_iter().collect(),
        }
    }

    /// Root with two scenarios of probability 0.25 / 0.75, slot "x" of dim 2.
    fn consensus_setup() -> (ScenarioTree, SubproblemRegistry) {
        let tree = ScenarioTree::two_stage(
            Realization::new(),
            vec![(Realization::new(), 0.25), (Realization::new(), 0.75)],
        )
        .unwrap();
        let mut registry = SubproblemRegistry::new();
        registry.register_fn(BuilderTarget::Stage(1), |_| {
            let mut model = Model::new();
            let a = model.add_var("a", 0.0, 10.0);
            let b = model.add_var("b", 0.0, 10.0);
            Ok(Subproblem::new(model).with_input("x", vec![a, b]))
        });
        registry.materialize(&tree).unwrap();
        (tree, registry)
    }

    /// Three-stage chain-of-two: root outputs "s", two children input "s".
    fn multistage_setup() -> (ScenarioTree, SubproblemRegistry) {
        let mut tree = ScenarioTree::new();
        let root = tree.create_root(Realization::new()).unwrap();
        tree.add_child(root, Realization::new(), 0.4).unwrap();
        tree.add_child(root, Realization::new(), 0.6).unwrap();
        let mut registry = SubproblemRegistry::new();
        registry.register_fn(BuilderTarget::Stage(0), |_| {
            let mut model = Model::new();
            let s = model.add_var("s", 0.0, 10.0);
            Ok(Subproblem::new(model).with_output("s", vec![s]))
        });
        registry.register_fn(BuilderTarget::Stage(1), |_| {
            let mut model = Model::new();
            let s = model.add_var("s_in", 0.0, 10.0);
            Ok(Subproblem::new(model).with_input("s", vec![s]))
        });
        registry.materialize(&tree).unwrap();
        (tree, registry)
    }

    #[test]
    fn test_consensus_root_layout() {
        let (tree, registry) = consensus_setup();
        let layer = ConsensusLayer::new(&tree, &registry).unwrap();

        assert_eq!(layer.groups().len(), 1);
        let group = &layer.groups()[0];
        assert!(group.free);
        assert_eq!(group.dim, 2);
        assert_eq!(group.participants.len(), 2);
        assert_eq!(layer.consensus_dim(), 2);
        assert_eq!(layer.price_dim(), 4);
        assert_eq!(layer.multiplier_dim(), 4);
        assert_eq!(layer.constraints()[1].offset, 2);
    }

    #[test]
    fn test_weighted_average_is_exact() {
        let (tree, registry) = consensus_setup();
        let layer = ConsensusLayer::new(&tree, &registry).unwrap();
        let mut solves = BTreeMap::new();
        solves.insert(
            NodeId::new(1),
            solve_with(NodeId::new(1), vec![(SlotKey::input("x"), vec![4.0, 0.0])]),
        );
        solves.insert(
            NodeId::new(2),
            solve_with(NodeId::new(2), vec![(SlotKey::input("x"), vec![0.0, 8.0])]),
        );

        let values = layer.participant_values(&solves).unwrap();
        assert_eq!(values, vec![4.0, 0.0, 0.0, 8.0]);
        let z = layer.weighted_average(&values);
        assert!((z[0] - 1.0).abs() < 1e-12);
        assert!((z[1] - 6.0).abs() < 1e-12);

        // Σ w (x − z) = 0 per component
        for k in 0..2 {
            let s = 0.25 * (values[k] - z[k]) + 0.75 * (values[2 + k] - z[k]);
            assert!(s.abs() < 1e-12);
        }

        let r = layer.primal_residual(&values, &z);
        let expected = (9.0f64 + 36.0 + 1.0 + 4.0).sqrt();
        assert!((r - expected).abs() < 1e-12);
    }

    #[test]
    fn test_dual_residual_scales_with_participants() {
        let (tree, registry) = consensus_setup();
        let layer = ConsensusLayer::new(&tree, &registry).unwrap();
        let r = layer.dual_residual(&[1.0, 0.0], &[0.0, 0.0], 3.0);
        assert!((r - (9.0f64 * 2.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_multistage_group_includes_parent_output() {
        let (tree, registry) = multistage_setup();
        let layer = ConsensusLayer::new(&tree, &registry).unwrap();

        let group = &layer.groups()[0];
        assert!(!group.free);
        assert_eq!(group.participants[0].slot, SlotKey::output("s"));
        assert_eq!(group.participants[0].weight, 1.0);
        assert_eq!(layer.constraints().len(), 2);
        assert!(layer.free_group_rows().is_empty());

        // Parent gets −Σ q_c λ_c on its output
        let terms = layer.multiplier_terms(NodeId::new(0), &[2.0, 1.0]);
        assert_eq!(
            terms,
            vec![CoordinationTerm::Multiplier {
                slot: SlotKey::output("s"),
                coefficients: vec![-(0.4 * 2.0 + 0.6 * 1.0)],
            }]
        );
        let terms = layer.multiplier_terms(NodeId::new(2), &[2.0, 1.0]);
        assert_eq!(
            terms,
            vec![CoordinationTerm::Multiplier {
                slot: SlotKey::input("s"),
                coefficients: vec![1.0],
            }]
        );
    }

    #[test]
    fn test_residuals_and_subgradient() {
        let (tree, registry) = multistage_setup();
        let layer = ConsensusLayer::new(&tree, &registry).unwrap();
        let mut solves = BTreeMap::new();
        solves.insert(
            NodeId::new(0),
            solve_with(NodeId::new(0), vec![(SlotKey::output("s"), vec![5.0])]),
        );
        solves.insert(
            NodeId::new(1),
            solve_with(NodeId::new(1), vec![(SlotKey::input("s"), vec![3.0])]),
        );
        solves.insert(
            NodeId::new(2),
            solve_with(NodeId::new(2), vec![(SlotKey::input("s"), vec![6.0])]),
        );
        let r = layer.constraint_residuals(&solves).unwrap();
        assert_eq!(r, vec![-2.0, 1.0]);
        let g = layer.subgradient(&r);
        assert!((g[0] + 0.8).abs() < 1e-12);
        assert!((g[1] - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_free_group_rows() {
        let (tree, registry) = consensus_setup();
        let layer = ConsensusLayer::new(&tree, &registry).unwrap();
        let rows = layer.free_group_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec![(0, 0.25), (2, 0.75)]);
        assert_eq!(rows[1], vec![(1, 0.25), (3, 0.75)]);
    }

    #[test]
    fn test_penalty_terms_slice_layout() {
        let (tree, registry) = consensus_setup();
        let layer = ConsensusLayer::new(&tree, &registry).unwrap();
        let prices = [1.0, 2.0, 3.0, 4.0];
        let z = [9.0, 8.0];
        let terms = layer.penalty_terms(NodeId::new(2), &prices, &z, 5.0);
        assert_eq!(
            terms,
            vec![CoordinationTerm::Penalty {
                slot: SlotKey::input("x"),
                price: vec![3.0, 4.0],
                target: vec![9.0, 8.0],
                rho: 5.0,
            }]
        );
        assert!(layer.penalty_terms(NodeId::new(0), &prices, &z, 5.0).is_empty());
    }
}
