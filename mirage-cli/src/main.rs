//! Mirage CLI - Command-line interface
//!
//! Seeds torrents towards their trackers and helps validate client files.

mod commands;

use std::path::PathBuf;

use anyhow::anyhow;
use clap::Parser;
use mirage_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "mirage")]
#[command(about = "Emulates a BitTorrent client towards trackers")]
struct Cli {
    /// Console log level, overridden by RUST_LOG
    #[arg(long, global = true, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory receiving the full trace log
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .map_err(|e| anyhow!("Failed to initialize logging: {e}"))?;

    commands::handle_command(cli.command).await
}
