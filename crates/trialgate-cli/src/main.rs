//! trialgate entry point.
//!
//! Thin by intent: load the environment, set up tracing, resolve
//! configuration and run one cycle. Pipeline failures surface as log
//! entries only; the process exits cleanly so the external scheduler keeps
//! retriggering it on the next interval.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use trialgate_cli::{AppConfig, Cli};

fn main() -> ExitCode {
    // Load .env if present (dev convenience). Silent when the file does
    // not exist; production injects env vars directly.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = match AppConfig::from_env(&cli) {
        Ok(config) => config,
        Err(err) => {
            error!("invalid configuration: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    match trialgate_cli::run(&config) {
        Ok(report) => {
            info!(?report, "cycle complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("cycle failed: {err:#}");
            ExitCode::SUCCESS
        }
    }
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}
