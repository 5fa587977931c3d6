//! Row-count watermark persistence.
//!
//! A single scalar, stored as a one-key JSON file. The file is replaced
//! atomically (write to a sibling temp file, then rename) so a crashed save
//! can never leave a half-written value that would silently reset the
//! watermark to zero and re-deliver all historical events as new.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct WatermarkRecord {
    prev_rows_number: u64,
}

/// File-backed count of warehouse rows observed as of the last successful
/// poll. Read once at cycle start, written once per advancing cycle.
pub struct WatermarkFile {
    path: PathBuf,
}

impl WatermarkFile {
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Returns the persisted count, or 0 when nothing has been persisted
    /// yet. A file that exists but cannot be read or decoded is an error,
    /// never a silent zero.
    pub fn load(&self) -> Result<u64> {
        if !self.path.exists() {
            return Ok(0);
        }

        let body = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read watermark file {}", self.path.display()))?;
        let record: WatermarkRecord = serde_json::from_str(&body)
            .with_context(|| format!("invalid watermark file {}", self.path.display()))?;
        Ok(record.prev_rows_number)
    }

    /// Overwrites the persisted count atomically.
    pub fn save(&self, count: u64) -> Result<()> {
        let body = serde_json::to_string(&WatermarkRecord {
            prev_rows_number: count,
        })
        .context("failed to serialize watermark")?;

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, body).with_context(|| {
            format!(
                "failed to write watermark temp file {}",
                tmp_path.display()
            )
        })?;
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!("failed to replace watermark file {}", self.path.display())
        })?;
        Ok(())
    }
}
