//! Renderflow command-line entry point.

use anyhow::Result;
use clap::Parser;

use renderflow_logging::{init_logging, LogConfig};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    init_logging(LogConfig {
        app_name: args.command.app_name(),
        verbose: args.verbose,
    })?;

    cli::run(args).await
}
