use std::io;

use clap::Parser;
use sdm_cli::cli::{Cli, Commands};
use tracing::error;

mod commands;

fn main() {
    let cli = Cli::parse();

    // Respects RUST_LOG; --log-level sets the floor
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(cli.log_level.into()),
        )
        .with_writer(io::stderr)
        .init();

    let result = match &cli.command {
        Commands::Run(args) => commands::run::handle(args),
        Commands::Tree { file, out, format } => {
            commands::tree::handle(file, out.as_deref(), *format)
        }
        Commands::Config { file } => commands::config::handle(file),
    };

    if let Err(err) = result {
        error!("{:#}", err);
        std::process::exit(1);
    }
}
