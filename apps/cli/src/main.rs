//! PostForge CLI: keyword batches in, scheduled articles out.
//!
//! Submits keyword batches to the generation pipeline, runs the publish
//! scheduler, and inspects drafts and failures.

mod commands;

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
