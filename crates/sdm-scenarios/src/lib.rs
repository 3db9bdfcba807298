pub mod manifest;
pub mod spec;

pub use manifest::{describe_tree, load_manifest, write_manifest, NodeArtifact, TreeManifest};
pub use spec::{
    load_tree_spec, resolve_tree, validate, LoadedTree, NodeSpec, TreeDefaults, TreeSpec,
};
