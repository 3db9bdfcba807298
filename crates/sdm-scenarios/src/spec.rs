use anyhow::{anyhow, Context, Result};
use sdm_core::{NodeId, Realization, ScenarioTree};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;

/// A scenario tree as written in a YAML or JSON file.
///
/// ```yaml
/// version: 1
/// defaults:
///   data: { price: 10.0 }
/// nodes:
///   - id: root
///   - id: low
///     parent: root
///     probability: 0.4
///     data: { demand: 80.0 }
///   - id: high
///     parent: root
///     data: { demand: [120.0, 130.0] }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeSpec {
    pub version: Option<u32>,
    pub description: Option<String>,
    #[serde(default)]
    pub defaults: TreeDefaults,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeDefaults {
    /// Conditional probability for children that declare none.
    pub probability: Option<f64>,
    /// Parameters every node starts from; node data overrides them.
    #[serde(default)]
    pub data: Realization,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    pub parent: Option<String>,
    pub probability: Option<f64>,
    pub description: Option<String>,
    #[serde(default)]
    pub data: Realization,
}

/// A validated tree plus the mapping from file ids to arena ids.
#[derive(Debug, Clone)]
pub struct LoadedTree {
    pub tree: ScenarioTree,
    pub ids: BTreeMap<String, NodeId>,
}

impl LoadedTree {
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.tree.get(id).and_then(|n| n.name.as_deref())
    }
}

pub fn load_tree_spec(path: &Path) -> Result<TreeSpec> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading scenario tree '{}'", path.display()))?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
            serde_yaml::from_str(&data).context("parsing scenario tree yaml")
        }
        Some(ext) if ext.eq_ignore_ascii_case("json") => {
            serde_json::from_str(&data).context("parsing scenario tree json")
        }
        _ => serde_yaml::from_str(&data)
            .or_else(|_| serde_json::from_str(&data))
            .context("parsing scenario tree"),
    }
}

/// Build the arena tree described by `spec`.
///
/// Nodes are numbered breadth-first from the root, siblings in file order.
pub fn resolve_tree(spec: &TreeSpec) -> Result<LoadedTree> {
    if spec.nodes.is_empty() {
        return Err(anyhow!("scenario tree contains no nodes"));
    }

    let mut seen = HashSet::new();
    for node in &spec.nodes {
        if node.id.trim().is_empty() {
            return Err(anyhow!("node id cannot be empty"));
        }
        if !seen.insert(node.id.as_str()) {
            return Err(anyhow!("duplicate node id '{}' in tree", node.id));
        }
    }

    let mut root = None;
    let mut children: HashMap<&str, Vec<&NodeSpec>> = HashMap::new();
    for node in &spec.nodes {
        match node.parent.as_deref() {
            None => {
                if let Some(first) = root.replace(node) {
                    return Err(anyhow!(
                        "tree has more than one root: '{}' and '{}'",
                        first.id,
                        node.id
                    ));
                }
            }
            Some(parent) if parent == node.id => {
                return Err(anyhow!("node '{}' is its own parent", node.id));
            }
            Some(parent) if !seen.contains(parent) => {
                return Err(anyhow!(
                    "node '{}' references undeclared parent '{}'",
                    node.id,
                    parent
                ));
            }
            Some(parent) => children.entry(parent).or_default().push(node),
        }
    }
    let root = root.ok_or_else(|| anyhow!("tree has no root (a node without parent)"))?;
    if let Some(p) = root.probability {
        if (p - 1.0).abs() > sdm_core::PROBABILITY_TOLERANCE {
            return Err(anyhow!(
                "root '{}' must have probability 1, got {}",
                root.id,
                p
            ));
        }
    }

    let mut tree = ScenarioTree::new();
    let mut ids = BTreeMap::new();
    let root_id = tree.create_root(node_data(&spec.defaults, root))?;
    tree.set_name(root_id, root.id.clone())?;
    ids.insert(root.id.clone(), root_id);

    let mut queue = VecDeque::from([(root, root_id)]);
    while let Some((parent, parent_id)) = queue.pop_front() {
        let Some(kids) = children.get(parent.id.as_str()) else {
            continue;
        };
        let uniform = 1.0 / kids.len() as f64;
        for child in kids {
            let probability = child
                .probability
                .or(spec.defaults.probability)
                .unwrap_or(uniform);
            let id = tree
                .add_child(parent_id, node_data(&spec.defaults, child), probability)
                .with_context(|| format!("adding node '{}'", child.id))?;
            tree.set_name(id, child.id.clone())?;
            ids.insert(child.id.clone(), id);
            queue.push_back((child, id));
        }
    }

    if ids.len() != spec.nodes.len() {
        let unreachable: Vec<&str> = spec
            .nodes
            .iter()
            .filter(|n| !ids.contains_key(&n.id))
            .map(|n| n.id.as_str())
            .collect();
        return Err(anyhow!(
            "nodes not reachable from root '{}' (parent cycle): {}",
            root.id,
            unreachable.join(", ")
        ));
    }

    tree.validate().context("validating scenario tree")?;
    Ok(LoadedTree { tree, ids })
}

pub fn validate(spec: &TreeSpec) -> Result<()> {
    resolve_tree(spec).map(|_| ())
}

fn node_data(defaults: &TreeDefaults, node: &NodeSpec) -> Realization {
    let mut data = defaults.data.clone();
    for (name, value) in node.data.iter() {
        data.insert(name, value.clone());
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, parent: Option<&str>, probability: Option<f64>) -> NodeSpec {
        NodeSpec {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            probability,
            description: None,
            data: Realization::new(),
        }
    }

    fn spec(nodes: Vec<NodeSpec>) -> TreeSpec {
        TreeSpec {
            version: Some(1),
            description: None,
            defaults: TreeDefaults::default(),
            nodes,
        }
    }

    #[test]
    fn test_uniform_probability_when_omitted() {
        let loaded = resolve_tree(&spec(vec![
            node("r", None, None),
            node("a", Some("r"), None),
            node("b", Some("r"), None),
            node("c", Some("r"), None),
        ]))
        .unwrap();
        let a = loaded.node_id("a").unwrap();
        let p = loaded.tree.node(a).unwrap().probability;
        assert!((p - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(loaded.name(a), Some("a"));
    }

    #[test]
    fn test_breadth_first_numbering() {
        let loaded = resolve_tree(&spec(vec![
            node("leaf", Some("mid"), None),
            node("mid", Some("r"), Some(0.5)),
            node("other", Some("r"), Some(0.5)),
            node("r", None, None),
        ]))
        .unwrap();
        assert_eq!(loaded.node_id("r"), Some(NodeId::new(0)));
        assert_eq!(loaded.node_id("mid"), Some(NodeId::new(1)));
        assert_eq!(loaded.node_id("other"), Some(NodeId::new(2)));
        assert_eq!(loaded.node_id("leaf"), Some(NodeId::new(3)));
        assert_eq!(loaded.tree.num_stages(), 3);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = resolve_tree(&spec(vec![
            node("r", None, None),
            node("a", Some("b"), None),
            node("b", Some("a"), None),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_two_roots_rejected() {
        let err = resolve_tree(&spec(vec![node("r", None, None), node("s", None, None)]))
            .unwrap_err();
        assert!(err.to_string().contains("more than one root"));
    }

    #[test]
    fn test_defaults_merge_into_node_data() {
        let mut s = spec(vec![node("r", None, None), node("a", Some("r"), None)]);
        s.defaults.data = Realization::new().with_scalar("price", 10.0).with_scalar("demand", 1.0);
        s.nodes[1].data = Realization::new().with_scalar("demand", 5.0);
        let loaded = resolve_tree(&s).unwrap();
        let a = loaded.tree.node(loaded.node_id("a").unwrap()).unwrap();
        assert_eq!(a.realization.scalar("price"), Some(10.0));
        assert_eq!(a.realization.scalar("demand"), Some(5.0));
    }
}
