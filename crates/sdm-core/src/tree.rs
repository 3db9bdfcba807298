//! Scenario tree stored as an arena of node records.
//!
//! Nodes are addressed by [`NodeId`], an index into the arena, and child
//! lists are plain index vectors. Construction is iterative, so tree depth
//! never translates into call-stack depth.
//!
//! ```text
//!            root (stage 0, p = 1)
//!           /        |         \
//!     s1 (p=1/3)  s2 (p=1/3)  s3 (p=1/3)     stage 1
//! ```
//!
//! Each root-to-leaf path is one scenario. Probabilities stored on the
//! nodes are conditional on the parent; [`ScenarioTree::path_probability`]
//! gives the unconditional weight used when aggregating.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{SdmError, SdmResult};
use crate::realization::Realization;

/// Tolerance used when checking that sibling probabilities sum to one.
pub const PROBABILITY_TOLERANCE: f64 = 1e-8;

/// Arena index of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(usize);

impl NodeId {
    #[inline]
    pub fn new(value: usize) -> Self {
        NodeId(value)
    }
    #[inline]
    pub fn value(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One node of the scenario tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Absent for the root.
    pub parent: Option<NodeId>,
    /// Children in insertion order.
    pub children: Vec<NodeId>,
    /// Root is stage 0.
    pub stage: usize,
    /// Probability conditional on the parent, in (0, 1].
    pub probability: f64,
    pub realization: Realization,
    /// Optional human-readable label (scenario files, reports).
    pub name: Option<String>,
}

impl Node {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Label for logs and reports: the name if set, otherwise the id.
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("node{}", self.id))
    }
}

/// Scenario tree built once before solving and read-only afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioTree {
    nodes: Vec<Node>,
}

impl ScenarioTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for single-stage scenario decomposition: one
    /// root and one child per `(realization, probability)` pair.
    pub fn two_stage(
        root: Realization,
        scenarios: impl IntoIterator<Item = (Realization, f64)>,
    ) -> SdmResult<Self> {
        let mut tree = Self::new();
        let root_id = tree.create_root(root)?;
        for (data, probability) in scenarios {
            tree.add_child(root_id, data, probability)?;
        }
        Ok(tree)
    }

    /// Create the root node. Fails if a root already exists.
    pub fn create_root(&mut self, realization: Realization) -> SdmResult<NodeId> {
        if !self.nodes.is_empty() {
            return Err(SdmError::InvalidTreeState(
                "tree already has a root".to_string(),
            ));
        }
        let id = NodeId::new(0);
        self.nodes.push(Node {
            id,
            parent: None,
            children: Vec::new(),
            stage: 0,
            probability: 1.0,
            realization,
            name: None,
        });
        Ok(id)
    }

    /// Attach a child to `parent` with the given conditional probability.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        realization: Realization,
        probability: f64,
    ) -> SdmResult<NodeId> {
        let stage = self.node(parent)?.stage + 1;
        if !(probability > 0.0 && probability <= 1.0) {
            return Err(SdmError::InvalidProbability { probability });
        }

        let id = NodeId::new(self.nodes.len());
        self.nodes.push(Node {
            id,
            parent: Some(parent),
            children: Vec::new(),
            stage,
            probability,
            realization,
            name: None,
        });
        self.nodes[parent.value()].children.push(id);
        Ok(id)
    }

    /// Attach a label to a node during construction.
    pub fn set_name(&mut self, id: NodeId, name: impl Into<String>) -> SdmResult<()> {
        let node = self
            .nodes
            .get_mut(id.value())
            .ok_or(SdmError::UnknownNode(id))?;
        node.name = Some(name.into());
        Ok(())
    }

    pub fn root(&self) -> Option<NodeId> {
        self.nodes.first().map(|n| n.id)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.value())
    }

    pub fn node(&self, id: NodeId) -> SdmResult<&Node> {
        self.get(id).ok_or(SdmError::UnknownNode(id))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id.value() < self.nodes.len()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in arena (creation) order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().map(|n| n.id)
    }

    /// Number of stages (depth of the deepest node plus one).
    pub fn num_stages(&self) -> usize {
        self.nodes.iter().map(|n| n.stage + 1).max().unwrap_or(0)
    }

    /// All nodes of a stage in creation order.
    pub fn nodes_at_stage(&self, stage: usize) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.stage == stage)
            .map(|n| n.id)
            .collect()
    }

    pub fn children(&self, id: NodeId) -> SdmResult<&[NodeId]> {
        Ok(&self.node(id)?.children)
    }

    pub fn leaves(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.is_leaf())
            .map(|n| n.id)
            .collect()
    }

    /// Ordered path from `id` up to the root, `id` first.
    pub fn path_to_root(&self, id: NodeId) -> SdmResult<Vec<NodeId>> {
        let mut path = vec![id];
        let mut current = self.node(id)?;
        while let Some(parent) = current.parent {
            path.push(parent);
            current = self.node(parent)?;
        }
        Ok(path)
    }

    /// Unconditional probability of reaching `id` from the root.
    pub fn path_probability(&self, id: NodeId) -> SdmResult<f64> {
        let mut prob = 1.0;
        for node_id in self.path_to_root(id)? {
            prob *= self.node(node_id)?.probability;
        }
        Ok(prob)
    }

    /// Root-to-leaf paths, one per scenario, ordered by leaf id.
    pub fn scenarios(&self) -> SdmResult<Vec<Vec<NodeId>>> {
        self.leaves()
            .into_iter()
            .map(|leaf| {
                let mut path = self.path_to_root(leaf)?;
                path.reverse();
                Ok(path)
            })
            .collect()
    }

    /// Check the structural invariants required before coordination.
    ///
    /// - a root exists
    /// - children probabilities of every internal node sum to one
    /// - parent/child links are mutually consistent
    pub fn validate(&self) -> SdmResult<()> {
        if self.nodes.is_empty() {
            return Err(SdmError::InvalidTreeState("tree has no root".to_string()));
        }

        for node in &self.nodes {
            if let Some(parent) = node.parent {
                let parent_node = self.node(parent)?;
                if !parent_node.children.contains(&node.id) {
                    return Err(SdmError::InvalidTreeState(format!(
                        "node {} is not listed among the children of {}",
                        node.id, parent
                    )));
                }
            } else if node.id != NodeId::new(0) {
                return Err(SdmError::InvalidTreeState(format!(
                    "node {} has no parent but is not the root",
                    node.id
                )));
            }

            if node.is_leaf() {
                continue;
            }
            let total: f64 = node
                .children
                .iter()
                .map(|&c| self.node(c).map(|n| n.probability))
                .sum::<SdmResult<f64>>()?;
            if (total - 1.0).abs() > PROBABILITY_TOLERANCE {
                return Err(SdmError::InvalidTreeState(format!(
                    "children of node {} have total probability {:.6}, expected 1",
                    node.id, total
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_scenarios() -> ScenarioTree {
        ScenarioTree::two_stage(
            Realization::new(),
            (0..3).map(|i| (Realization::new().with_scalar("s", i as f64), 1.0 / 3.0)),
        )
        .unwrap()
    }

    #[test]
    fn test_create_root_twice_fails() {
        let mut tree = ScenarioTree::new();
        tree.create_root(Realization::new()).unwrap();
        let err = tree.create_root(Realization::new()).unwrap_err();
        assert!(matches!(err, SdmError::InvalidTreeState(_)));
    }

    #[test]
    fn test_add_child_unknown_parent() {
        let mut tree = ScenarioTree::new();
        tree.create_root(Realization::new()).unwrap();
        let err = tree
            .add_child(NodeId::new(42), Realization::new(), 0.5)
            .unwrap_err();
        assert_eq!(err, SdmError::UnknownNode(NodeId::new(42)));
    }

    #[test]
    fn test_add_child_invalid_probability() {
        let mut tree = ScenarioTree::new();
        let root = tree.create_root(Realization::new()).unwrap();
        for bad in [0.0, -0.1, 1.5, f64::NAN] {
            let err = tree.add_child(root, Realization::new(), bad).unwrap_err();
            assert!(matches!(err, SdmError::InvalidProbability { .. }));
        }
        // Nothing was attached by the failed calls
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_stages_and_paths() {
        let mut tree = ScenarioTree::new();
        let root = tree.create_root(Realization::new()).unwrap();
        let a = tree.add_child(root, Realization::new(), 0.5).unwrap();
        let b = tree.add_child(root, Realization::new(), 0.5).unwrap();
        let a1 = tree.add_child(a, Realization::new(), 0.25).unwrap();
        let a2 = tree.add_child(a, Realization::new(), 0.75).unwrap();

        assert_eq!(tree.nodes_at_stage(0), vec![root]);
        assert_eq!(tree.nodes_at_stage(1), vec![a, b]);
        assert_eq!(tree.nodes_at_stage(2), vec![a1, a2]);
        assert_eq!(tree.num_stages(), 3);
        assert_eq!(tree.path_to_root(a2).unwrap(), vec![a2, a, root]);
        assert!((tree.path_probability(a2).unwrap() - 0.375).abs() < 1e-12);
        assert_eq!(tree.leaves(), vec![b, a1, a2]);
        assert_eq!(tree.scenarios().unwrap()[1], vec![root, a, a1]);
        tree.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_sibling_sum() {
        let mut tree = ScenarioTree::new();
        let root = tree.create_root(Realization::new()).unwrap();
        tree.add_child(root, Realization::new(), 0.5).unwrap();
        tree.add_child(root, Realization::new(), 0.4).unwrap();
        let err = tree.validate().unwrap_err();
        assert!(matches!(err, SdmError::InvalidTreeState(_)));
    }

    #[test]
    fn test_validate_empty_tree() {
        assert!(ScenarioTree::new().validate().is_err());
    }

    #[test]
    fn test_two_stage_helper() {
        let tree = three_scenarios();
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.leaves().len(), 3);
        tree.validate().unwrap();
        let s2 = tree.node(NodeId::new(2)).unwrap();
        assert_eq!(s2.realization.scalar("s"), Some(1.0));
        assert_eq!(s2.label(), "node2");
    }

    #[test]
    fn test_deep_chain_is_iterative() {
        let mut tree = ScenarioTree::new();
        let mut current = tree.create_root(Realization::new()).unwrap();
        for _ in 0..50_000 {
            current = tree.add_child(current, Realization::new(), 1.0).unwrap();
        }
        assert_eq!(tree.path_to_root(current).unwrap().len(), 50_001);
        tree.validate().unwrap();
    }
}
