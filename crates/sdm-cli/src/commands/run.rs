use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use sdm_algo::{
    load_config, ClarabelBackend, CoordinationReport, Coordinator, CoordinatorConfig,
    IterationRecord,
};
use sdm_cli::cli::{DemoProblem, OutputFormat, RunArgs};
use sdm_cli::demos;
use sdm_core::{Realization, ScenarioTree};
use sdm_scenarios::{load_tree_spec, resolve_tree};
use serde::Serialize;
use tabwriter::TabWriter;
use tracing::info;

/// One CSV row of the iteration trace.
#[derive(Debug, Serialize)]
struct TraceRow {
    iteration: usize,
    elapsed_ms: f64,
    objective: f64,
    dual_value: Option<f64>,
    bound: Option<f64>,
    primal_residual: f64,
    dual_residual: f64,
    step: Option<String>,
    weight: f64,
    bundle_size: usize,
}

impl From<&IterationRecord> for TraceRow {
    fn from(record: &IterationRecord) -> Self {
        Self {
            iteration: record.iteration,
            elapsed_ms: record.elapsed_ms,
            objective: record.objective,
            dual_value: record.dual_value,
            bound: record.bound,
            primal_residual: record.primal_residual,
            dual_residual: record.dual_residual,
            step: record.step.map(|s| s.to_string()),
            weight: record.weight,
            bundle_size: record.bundle_size,
        }
    }
}

pub fn handle(args: &RunArgs) -> Result<()> {
    let config = build_config(args)?;

    let tree = match &args.tree {
        Some(path) => {
            let spec = load_tree_spec(path)?;
            resolve_tree(&spec)
                .with_context(|| format!("resolving scenario tree '{}'", path.display()))?
                .tree
        }
        None => match args.problem {
            DemoProblem::Integer => demos::integer_tree()?,
            DemoProblem::Inventory => demos::inventory_tree()?,
        },
    };
    let registry = match args.problem {
        DemoProblem::Integer => {
            demos::integer_registry(demos::apply_params(Realization::new(), &args.params)?)
        }
        DemoProblem::Inventory => demos::inventory_registry(
            demos::apply_params(demos::inventory_params(), &args.params)?,
            tree.num_stages(),
        ),
    };

    info!(
        problem = ?args.problem,
        mode = %config.mode,
        nodes = tree.len(),
        stages = tree.num_stages(),
        "starting coordination"
    );
    let mut coordinator = Coordinator::new(&tree, registry, Arc::new(ClarabelBackend), config)
        .context("setting up coordinator")?;
    let report = coordinator.run();

    if let Some(path) = &args.trace_out {
        write_trace(path, &report.trace)?;
        info!(path = %path.display(), records = report.trace.len(), "wrote iteration trace");
    }

    match args.format {
        OutputFormat::Plain => print_summary(&tree, &report)?,
        OutputFormat::Json => {
            serde_json::to_writer_pretty(io::stdout(), &report)
                .context("serializing coordination report")?;
            println!();
        }
    }

    if let Some(failure) = &report.failure {
        bail!("coordination failed: {}", failure);
    }
    Ok(())
}

fn build_config(args: &RunArgs) -> Result<CoordinatorConfig> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => CoordinatorConfig::default(),
    };
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(rho) = args.rho {
        config.rho = rho;
    }
    if let Some(kmax) = args.kmax {
        config.kmax = kmax;
    }
    if let Some(tmax) = args.tmax {
        config.tmax = Some(tmax);
    }
    if let Some(tol) = args.primal_tol {
        config.primal_tolerance = tol;
    }
    if let Some(tol) = args.dual_tol {
        config.dual_tolerance = tol;
    }
    if args.adaptive_penalty {
        config.adaptive_penalty = true;
    }
    if args.warm_start {
        config.warm_start = true;
    }
    if let Some(threads) = args.threads {
        config.threads = Some(threads);
    }
    Ok(config)
}

fn write_trace(path: &Path, trace: &[IterationRecord]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating trace directory '{}'", dir.display()))?;
    }
    let is_csv = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));

    if is_csv {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("creating trace file '{}'", path.display()))?;
        for record in trace {
            writer.serialize(TraceRow::from(record))?;
        }
        writer.flush()?;
    } else {
        let file = File::create(path)
            .with_context(|| format!("creating trace file '{}'", path.display()))?;
        serde_json::to_writer_pretty(file, trace)
            .with_context(|| format!("writing trace file '{}'", path.display()))?;
    }
    Ok(())
}

fn fmt_opt(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.6}", v))
        .unwrap_or_else(|| "-".to_string())
}

fn print_summary(tree: &ScenarioTree, report: &CoordinationReport) -> Result<()> {
    let mut writer = TabWriter::new(io::stdout());
    writeln!(writer, "mode\t{}", report.mode)?;
    writeln!(writer, "status\t{}", report.status)?;
    writeln!(writer, "iterations\t{}", report.iterations)?;
    writeln!(writer, "objective\t{}", fmt_opt(report.objective))?;
    writeln!(writer, "bound\t{}", fmt_opt(report.bound))?;
    writeln!(writer, "primal residual\t{:.3e}", report.primal_residual)?;
    writeln!(writer, "dual residual\t{:.3e}", report.dual_residual)?;
    if let Some(residual) = report.solution_residual {
        writeln!(writer, "solution residual\t{:.3e}", residual)?;
    }
    writeln!(writer, "solve time\t{} ms", report.solve_time_ms)?;
    if let Some(failure) = &report.failure {
        writeln!(writer, "failure\t{}", failure)?;
    }
    writer.flush()?;

    if report.solution.is_empty() {
        return Ok(());
    }
    println!();
    let mut writer = TabWriter::new(io::stdout());
    writeln!(writer, "NODE\tSTAGE\tVARIABLE\tVALUE")?;
    for (id, solution) in &report.solution {
        let (label, stage) = tree
            .get(*id)
            .map(|n| (n.label(), n.stage))
            .unwrap_or_else(|| (id.to_string(), 0));
        for (name, value) in &solution.values {
            writeln!(writer, "{}\t{}\t{}\t{:.4}", label, stage, name, value)?;
        }
    }
    writer.flush()?;
    Ok(())
}
