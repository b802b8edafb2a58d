//! Database cluster monitoring tool.
//!
//! Reads the monitored databases from a JSON configuration file, then
//! discovers nodes, samples sessions or captures snapshots and prints the
//! result as JSON.
//!
//! # Guarantees
//! - Only read-only queries are sent to monitored databases
//! - Passwords are never logged or written to snapshots

use clap::Parser;
use dbsentinel::{Cli, run};
use dbsentinel_core::logging::init_logging;
use tracing::error;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.global.verbose, cli.global.quiet, cli.global.json_logs)?;

    run(&cli).await.inspect_err(|e| error!("{:#}", e))
}
