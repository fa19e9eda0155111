//! CLI entrypoint. Parses flags, loads and validates configuration, wires up
//! tracing, then hands off to [`supervisor::run`] for the lifetime of the
//! process. Exit codes per `spec.md` §6: 0 clean, 1 configuration error, 2
//! unrecoverable runtime fault.

mod supervisor;

use std::process::ExitCode;

use clap::Parser;
use streamship_config::{
    Cli,
    Config,
};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(1);
        },
    };

    init_tracing(&cli.log_level);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start tokio runtime: {e:#}");
            return ExitCode::from(2);
        },
    };

    match runtime.block_on(supervisor::run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            streamship_common::report_error(&e);
            ExitCode::from(2)
        },
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
