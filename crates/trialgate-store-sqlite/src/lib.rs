#![allow(clippy::missing_errors_doc)]

mod watermark;

pub use watermark::WatermarkFile;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use trialgate_core::{format_rfc3339, parse_rfc3339_utc, CoreError, EventName, PendingTrial};

const SCHEMA_CACHETAB: &str = r"
CREATE TABLE IF NOT EXISTS cachetab (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  date TEXT NOT NULL,
  event_time TEXT NOT NULL,
  event_name TEXT NOT NULL,
  af_sub1 TEXT NOT NULL
);
";

/// Durable holding area for trials awaiting confirmation or cancellation.
///
/// Uniqueness on `af_sub1` is enforced by application logic (a select before
/// each insert, inside one transaction), not by a storage constraint. Every
/// logical operation opens its own connection and closes it on return; no
/// transaction spans two operations.
pub struct TrialLedger {
    db_path: PathBuf,
}

impl TrialLedger {
    /// Opens the ledger, creating the backing table when missing.
    pub fn open(path: &Path) -> Result<Self> {
        let ledger = Self {
            db_path: path.to_path_buf(),
        };
        let conn = ledger.connect()?;
        conn.execute_batch(SCHEMA_CACHETAB)
            .context("failed to ensure ledger schema")?;
        Ok(ledger)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path).with_context(|| {
            format!(
                "failed to open ledger database at {}",
                self.db_path.display()
            )
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 10000;",
        )
        .context("failed to configure ledger pragmas")?;

        Ok(conn)
    }

    /// Inserts a pending trial unless one already exists for the same
    /// subscriber. Returns whether an insertion occurred; repeated calls
    /// with the same key are idempotent from the caller's perspective.
    pub fn insert_if_absent(&self, record: &PendingTrial) -> Result<bool> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction()
            .context("failed to start ledger insert transaction")?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM cachetab WHERE af_sub1 = ?1",
                params![record.subscriber_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to probe ledger for existing record")?;

        if existing.is_some() {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO cachetab (date, event_time, event_name, af_sub1)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                format_rfc3339(record.inserted_at)?,
                format_rfc3339(record.event_time)?,
                record.event_name.as_str(),
                record.subscriber_id,
            ],
        )
        .context("failed to insert pending trial")?;

        tx.commit().context("failed to commit ledger insert")?;
        Ok(true)
    }

    /// Removes the record for a subscriber. An absent key is a no-op, not
    /// an error; cancellations may legitimately arrive with nothing pending.
    pub fn delete_by_key(&self, subscriber_id: &str) -> Result<bool> {
        let conn = self.connect()?;
        let deleted = conn
            .execute(
                "DELETE FROM cachetab WHERE af_sub1 = ?1",
                params![subscriber_id],
            )
            .context("failed to delete pending trial")?;
        Ok(deleted > 0)
    }

    /// All pending trials whose `event_time` is at or before `cutoff`.
    ///
    /// The scan never deletes; removal happens only after the downstream
    /// notification for a record succeeds.
    pub fn scan_matured(&self, cutoff: OffsetDateTime) -> Result<Vec<PendingTrial>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(
                "SELECT date, event_time, event_name, af_sub1 FROM cachetab
                 WHERE event_name = ?1 AND datetime(event_time) <= datetime(?2)
                 ORDER BY event_time ASC",
            )
            .context("failed to prepare maturity scan")?;

        let rows = stmt.query_map(
            params![EventName::TrialStarted.as_str(), format_rfc3339(cutoff)?],
            parse_trial_row,
        )?;

        collect_rows(rows)
    }

    /// Number of records currently held, for diagnostics and tests.
    pub fn pending_count(&self) -> Result<usize> {
        let conn = self.connect()?;
        let count = conn
            .query_row("SELECT COUNT(*) FROM cachetab", [], |row| {
                row.get::<_, i64>(0)
            })
            .context("failed to count pending trials")?;
        usize::try_from(count).with_context(|| format!("invalid pending trial count: {count}"))
    }
}

fn parse_trial_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingTrial> {
    let inserted_at_raw: String = row.get(0)?;
    let event_time_raw: String = row.get(1)?;
    let event_name_raw: String = row.get(2)?;

    let event_name = EventName::parse(&event_name_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid event_name: {event_name_raw}"),
            )),
        )
    })?;

    Ok(PendingTrial {
        subscriber_id: row.get(3)?,
        event_time: parse_rfc3339_utc(&event_time_raw).map_err(to_sql_error)?,
        event_name,
        inserted_at: parse_rfc3339_utc(&inserted_at_raw).map_err(to_sql_error)?,
    })
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: CoreError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
