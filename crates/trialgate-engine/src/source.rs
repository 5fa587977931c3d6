//! Warehouse access: qualifying row count and newest-N row fetch.
//!
//! The ClickHouse implementation speaks the HTTP interface directly and is
//! constructed at cycle start and dropped at cycle end, so the connection
//! scope is explicit on every exit path.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tracing::debug;
use trialgate_core::{parse_warehouse_datetime, Event, EventName};

/// Read-only view of the warehouse used by the engine.
pub trait EventSource {
    /// Total number of qualifying rows currently in the warehouse.
    fn count_events(&self) -> Result<u64>;

    /// The `limit` newest qualifying rows, ordered by descending event time.
    fn fetch_latest(&self, limit: u64) -> Result<Vec<Event>>;
}

#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    /// HTTP interface endpoint, e.g. `http://warehouse.internal:8123/`.
    pub endpoint: String,
    pub user: String,
    pub password: String,
    /// Fully qualified table, e.g. `analytics.appsflyer_export`.
    pub table: String,
    /// `media_source` value selecting this relay's traffic.
    pub source_tag: String,
}

/// ClickHouse-backed [`EventSource`].
pub struct ClickHouseSource {
    config: WarehouseConfig,
    http: reqwest::blocking::Client,
}

#[derive(Debug, Deserialize)]
struct WarehouseRow {
    event_time: String,
    event_name: String,
    af_sub1: String,
}

impl ClickHouseSource {
    pub fn new(config: WarehouseConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build warehouse http client")?;
        Ok(Self { config, http })
    }

    fn run_query(&self, sql: &str) -> Result<String> {
        let response = self
            .http
            .post(&self.config.endpoint)
            .header("X-ClickHouse-User", &self.config.user)
            .header("X-ClickHouse-Key", &self.config.password)
            .body(sql.to_string())
            .send()
            .context("warehouse request failed")?;

        let status = response.status();
        let body = response
            .text()
            .context("failed to read warehouse response body")?;
        if !status.is_success() {
            return Err(anyhow!(
                "warehouse http error status={} body={}",
                status.as_u16(),
                body.trim()
            ));
        }
        Ok(body)
    }

    fn filter_clause(&self) -> String {
        let names = EventName::ALL
            .iter()
            .map(|name| format!("'{}'", name.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "WHERE media_source = '{}' AND event_name IN ({names})",
            self.config.source_tag
        )
    }
}

impl EventSource for ClickHouseSource {
    fn count_events(&self) -> Result<u64> {
        let sql = format!(
            "SELECT count() FROM {} {}",
            self.config.table,
            self.filter_clause()
        );
        let body = self.run_query(&sql)?;
        body.trim()
            .parse::<u64>()
            .with_context(|| format!("invalid warehouse count response: {}", body.trim()))
    }

    fn fetch_latest(&self, limit: u64) -> Result<Vec<Event>> {
        let sql = format!(
            "SELECT event_time, event_name, af_sub1 FROM {} {} \
             ORDER BY event_time DESC LIMIT {limit} FORMAT JSONEachRow",
            self.config.table,
            self.filter_clause()
        );
        let body = self.run_query(&sql)?;

        let mut events = Vec::new();
        for line in body.lines().filter(|line| !line.trim().is_empty()) {
            let row: WarehouseRow = serde_json::from_str(line)
                .with_context(|| format!("invalid warehouse row: {line}"))?;

            let Some(event_name) = EventName::parse(&row.event_name) else {
                debug!(event_name = %row.event_name, "skipping unknown event name");
                continue;
            };

            events.push(Event {
                event_time: parse_warehouse_datetime(&row.event_time)?,
                event_name,
                subscriber_id: row.af_sub1,
            });
        }
        Ok(events)
    }
}
