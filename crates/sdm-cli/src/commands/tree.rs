use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use sdm_cli::cli::OutputFormat;
use sdm_core::Param;
use sdm_scenarios::{describe_tree, load_tree_spec, resolve_tree, write_manifest, TreeManifest};
use tabwriter::TabWriter;
use tracing::info;

pub fn handle(file: &Path, out: Option<&Path>, format: OutputFormat) -> Result<()> {
    let spec = load_tree_spec(file)?;
    let loaded = resolve_tree(&spec)
        .with_context(|| format!("resolving scenario tree '{}'", file.display()))?;
    let manifest = describe_tree(&loaded.tree)?;
    info!(
        nodes = manifest.nodes.len(),
        stages = manifest.stages,
        scenarios = manifest.scenarios,
        "scenario tree validated"
    );

    if let Some(path) = out {
        write_manifest(path, &manifest)?;
        info!(path = %path.display(), "wrote tree manifest");
    }

    match format {
        OutputFormat::Plain => print_tree_table(&manifest),
        OutputFormat::Json => {
            serde_json::to_writer_pretty(io::stdout(), &manifest)
                .context("serializing tree manifest")?;
            println!();
            Ok(())
        }
    }
}

fn print_tree_table(manifest: &TreeManifest) -> Result<()> {
    let mut writer = TabWriter::new(io::stdout());
    writeln!(writer, "ID\tNAME\tPARENT\tSTAGE\tPROB\tPATH PROB\tDATA")?;
    for node in &manifest.nodes {
        let parent = node
            .parent
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let data: Vec<String> = node
            .data
            .iter()
            .map(|(name, value)| match value {
                Param::Scalar(v) => format!("{}={}", name, v),
                Param::Vector(v) => format!("{}={:?}", name, v),
            })
            .collect();
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{:.4}\t{:.4}\t{}",
            node.id,
            node.name,
            parent,
            node.stage,
            node.probability,
            node.path_probability,
            data.join(" ")
        )?;
    }
    writer.flush()?;
    println!(
        "{} nodes, {} stages, {} scenarios",
        manifest.nodes.len(),
        manifest.stages,
        manifest.scenarios
    );
    Ok(())
}
