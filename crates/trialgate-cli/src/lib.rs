//! Command surface for the relay binary.
//!
//! One invocation runs exactly one cycle and exits; the cadence comes from
//! an external scheduler (cron or similar), which expects exit code 0 on
//! every normal completion, including "no new events".

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use trialgate_core::RetryPolicy;
use trialgate_engine::{
    ClickHouseSource, CycleReport, HttpPostbackClient, Pipeline, WarehouseConfig,
};
use trialgate_store_sqlite::{TrialLedger, WatermarkFile};

#[derive(Debug, Parser)]
#[command(name = "trialgate")]
#[command(about = "Attribution event reconciliation and postback relay")]
pub struct Cli {
    /// Pending-trial ledger database.
    #[arg(long, default_value = "./trialgate.sqlite3")]
    pub db: PathBuf,

    /// Row-count watermark file.
    #[arg(long, default_value = "./watermark.json")]
    pub watermark: PathBuf,

    /// Fully qualified warehouse table.
    #[arg(long, default_value = "analytics.appsflyer_export")]
    pub table: String,

    /// `media_source` value selecting this relay's traffic.
    #[arg(long, default_value = "Popunder")]
    pub source_tag: String,

    /// Postback attempts before a call is abandoned for the cycle.
    #[arg(long, default_value_t = 10)]
    pub retries: u32,

    /// Fixed delay between postback attempts, in seconds.
    #[arg(long, default_value_t = 6)]
    pub retry_delay_secs: u64,

    /// Trial confirmation grace period, in seconds.
    #[arg(long, default_value_t = 3600)]
    pub grace_secs: u64,

    /// Raise log verbosity to debug.
    #[arg(long)]
    pub debug: bool,
}

/// Fully resolved configuration: CLI flags plus the environment-supplied
/// credentials and endpoint secrets.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub warehouse: WarehouseConfig,
    pub tracker_base_url: String,
    pub retry: RetryPolicy,
    pub grace_period: Duration,
    pub db_path: PathBuf,
    pub watermark_path: PathBuf,
}

impl AppConfig {
    /// Resolves configuration from the parsed CLI and the environment.
    ///
    /// # Errors
    /// Fails when a required variable is missing or malformed; nothing has
    /// touched the network or the disk at that point.
    pub fn from_env(cli: &Cli) -> Result<Self> {
        let host = required_env("CLICKHOUSE_HOST")?;
        let user = required_env("CLICKHOUSE_USER")?;
        let password = required_env("CLICKHOUSE_PASS")?;
        let tracker_base_url = required_env("TRACKER_BASE_URL")?;

        let port: u16 = match std::env::var("CLICKHOUSE_PORT") {
            Ok(value) => value
                .parse()
                .with_context(|| format!("invalid CLICKHOUSE_PORT: {value}"))?,
            Err(_) => 8123,
        };

        let retry = RetryPolicy {
            attempts: cli.retries,
            delay: Duration::from_secs(cli.retry_delay_secs),
        };
        retry.validate()?;

        Ok(Self {
            warehouse: WarehouseConfig {
                endpoint: format!("http://{host}:{port}/"),
                user,
                password,
                table: cli.table.clone(),
                source_tag: cli.source_tag.clone(),
            },
            tracker_base_url,
            retry,
            grace_period: Duration::from_secs(cli.grace_secs),
            db_path: cli.db.clone(),
            watermark_path: cli.watermark.clone(),
        })
    }
}

fn required_env(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("missing required environment variable {name}"))
}

/// Runs one full cycle. The warehouse client is constructed here and
/// dropped when this scope ends, on success and on every error path alike.
pub fn run(config: &AppConfig) -> Result<CycleReport> {
    let ledger = TrialLedger::open(&config.db_path)?;
    let watermark = WatermarkFile::new(&config.watermark_path);
    let sink = HttpPostbackClient::new(config.tracker_base_url.clone(), config.retry)?;
    let source = ClickHouseSource::new(config.warehouse.clone())?;

    let pipeline = Pipeline::new(&source, &sink, &ledger, &watermark, config.grace_period);
    pipeline.run_cycle()
}
