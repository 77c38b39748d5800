use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "warden")]
#[command(version = "0.1.0")]
#[command(
    about = "Risk-controlled execution and position lifecycle engine",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding default.toml and per-environment overrides
    #[arg(short, long, default_value = "config", env = "WARDEN_CONFIG_DIR")]
    pub config_dir: PathBuf,

    /// Override the state store directory
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Replay a JSONL file of signals and ticks against the paper exchange
    Replay {
        /// Event file, one `{"type": "signal" | "tick", ...}` object per line
        #[arg(short, long)]
        events: PathBuf,
    },
    /// Read JSONL market events from stdin until EOF or a shutdown signal
    Run,
    /// Load and validate the configuration
    CheckConfig,
    /// Print persisted positions, trades and equity
    Status,
}
