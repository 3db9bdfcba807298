use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sdm_core::{Realization, ScenarioTree};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::Path;

/// One tree node as written to a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeArtifact {
    pub id: usize,
    pub name: String,
    pub parent: Option<usize>,
    pub stage: usize,
    pub probability: f64,
    pub path_probability: f64,
    #[serde(default)]
    pub data: Realization,
}

/// Flattened view of a scenario tree for downstream tools.
///
/// **Output structure:**
/// ```text
/// {
///   "generated_at": "...",
///   "stages": 3,
///   "scenarios": 4,
///   "nodes": [ { "id": 0, "name": "root", ... }, ... ]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeManifest {
    pub generated_at: DateTime<Utc>,
    pub stages: usize,
    pub scenarios: usize,
    pub nodes: Vec<NodeArtifact>,
}

pub fn describe_tree(tree: &ScenarioTree) -> Result<TreeManifest> {
    let mut nodes = Vec::with_capacity(tree.len());
    for node in tree.iter() {
        nodes.push(NodeArtifact {
            id: node.id.value(),
            name: node.label(),
            parent: node.parent.map(|p| p.value()),
            stage: node.stage,
            probability: node.probability,
            path_probability: tree.path_probability(node.id)?,
            data: node.realization.clone(),
        });
    }
    Ok(TreeManifest {
        generated_at: Utc::now(),
        stages: tree.num_stages(),
        scenarios: tree.leaves().len(),
        nodes,
    })
}

pub fn write_manifest(path: &Path, manifest: &TreeManifest) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating manifest directory '{}'", dir.display()))?;
    }
    let file = File::create(path)
        .with_context(|| format!("creating tree manifest '{}'", path.display()))?;
    serde_json::to_writer_pretty(file, manifest)
        .with_context(|| format!("writing tree manifest '{}'", path.display()))?;
    Ok(())
}

pub fn load_manifest(path: &Path) -> Result<TreeManifest> {
    let file =
        File::open(path).with_context(|| format!("opening tree manifest '{}'", path.display()))?;
    serde_json::from_reader(file)
        .with_context(|| format!("parsing tree manifest '{}'", path.display()))
}
