use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum, ValueHint};
use sdm_algo::Mode;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "sdm",
    author,
    version,
    about = "Scenario decomposition with consensus ADMM or a Lagrangian bundle method",
    long_about = None
)]
pub struct Cli {
    /// Set the logging level
    #[arg(long, default_value = "info")]
    pub log_level: tracing::Level,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Solve a bundled demo problem with a coordinator
    Run(RunArgs),
    /// Validate a scenario-tree file and list its nodes
    Tree {
        /// Scenario tree (YAML or JSON)
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
        /// Write a JSON manifest of the resolved tree
        #[arg(long, value_hint = ValueHint::FilePath)]
        out: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
        format: OutputFormat,
    },
    /// Validate a coordinator config file and print it with defaults filled in
    Config {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Demo problem to solve
    #[arg(value_enum)]
    pub problem: DemoProblem,

    /// Coordinator config file (YAML or JSON); flags below override it
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Scenario tree file replacing the demo's built-in tree
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub tree: Option<PathBuf>,

    /// Coordinator: admm or bundle
    #[arg(long)]
    pub mode: Option<Mode>,

    /// ADMM penalty
    #[arg(long)]
    pub rho: Option<f64>,

    /// Iteration cap
    #[arg(long)]
    pub kmax: Option<usize>,

    /// Wall-clock budget in seconds
    #[arg(long)]
    pub tmax: Option<f64>,

    #[arg(long)]
    pub primal_tol: Option<f64>,

    #[arg(long)]
    pub dual_tol: Option<f64>,

    /// Residual balancing for the ADMM penalty
    #[arg(long)]
    pub adaptive_penalty: bool,

    /// Start ADMM from the average of unpenalized first solves
    #[arg(long)]
    pub warm_start: bool,

    /// Worker threads for the subproblem phase
    #[arg(long)]
    pub threads: Option<usize>,

    /// Model parameter override, repeatable
    #[arg(long = "param", value_name = "NAME=VALUE")]
    pub params: Vec<String>,

    /// Write the iteration trace (.csv or .json)
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub trace_out: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
    pub format: OutputFormat,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum DemoProblem {
    /// Three-scenario integer program sharing the first-stage `x`
    Integer,
    /// Three-stage production and inventory problem
    Inventory,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Plain,
    Json,
}

pub fn build_cli_command() -> clap::Command {
    Cli::command()
}
