use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use sdm_algo::load_config;

pub fn handle(file: &Path) -> Result<()> {
    let config = load_config(file)?;
    serde_json::to_writer_pretty(io::stdout(), &config)
        .context("serializing coordinator config")?;
    println!();
    Ok(())
}
