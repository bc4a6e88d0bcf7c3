//! Intogif CLI - Command-line interface
//!
//! Converts a video file into an animated GIF.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use intogif_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "intogif")]
#[command(about = "Convert videos into palette-optimized animated GIFs")]
#[command(version)]
struct Cli {
    /// Console log level (RUST_LOG overrides)
    #[arg(long, value_enum, default_value_t = CliLogLevel::Warn, global = true)]
    log_level: CliLogLevel,

    /// Directory for the full trace of the last run
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())?;

    commands::handle_command(cli.command).await
}
