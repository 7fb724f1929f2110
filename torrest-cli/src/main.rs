//! Torrest CLI - Command-line interface
//!
//! Runs the streaming server and offers small helpers around it.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use torrest_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "torrest")]
#[command(about = "Stream torrents over HTTP while they download")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level
    #[arg(long, global = true, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory receiving the full trace of the run
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())?;

    commands::handle_command(cli.command).await
}
