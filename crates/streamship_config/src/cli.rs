use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Command-line flags, the last and highest-precedence layer of the merge
/// order in `spec.md` §6. Mirrors the `clap` `derive` + `env` feature usage
/// already present in the pack's `opensub-aa`/`opensub-keeper` crates.
#[derive(Debug, Parser)]
#[command(name = "streamship", about = "Log-shipping agent core")]
pub struct Cli {
    /// Path to a YAML configuration file.
    #[arg(long, env = "SSW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override dispatcher.queue_size.
    #[arg(long)]
    pub queue_size: Option<usize>,

    /// Override dispatcher.worker_count.
    #[arg(long)]
    pub worker_count: Option<usize>,

    /// Override positions.directory.
    #[arg(long)]
    pub positions_directory: Option<PathBuf>,

    /// Override dlq.directory.
    #[arg(long)]
    pub dlq_directory: Option<PathBuf>,

    /// `RUST_LOG`-style filter override for the tracing subscriber.
    #[arg(long, env = "SSW_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

pub fn apply_cli_overrides(config: &mut Config, cli: &Cli) {
    if let Some(v) = cli.queue_size {
        config.dispatcher.queue_size = v;
    }
    if let Some(v) = cli.worker_count {
        config.dispatcher.worker_count = v;
    }
    if let Some(v) = cli.positions_directory.clone() {
        config.positions.directory = v;
    }
    if let Some(v) = cli.dlq_directory.clone() {
        config.dlq.directory = v;
    }
}
