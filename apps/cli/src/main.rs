//! CodeKB CLI: turn a source tree into a searchable knowledge base.
//!
//! Runs the pipeline server or drives a single pipeline run locally.

mod commands;
mod signal;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
