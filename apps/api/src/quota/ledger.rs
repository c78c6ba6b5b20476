//! Usage ledger: the persisted record behind `QuotaTracker`.
//!
//! On-disk shape (JSON, one object):
//!   daily_requests, monthly_tokens, date (YYYY-MM-DD), month (1-12),
//!   requests_log: [{timestamp, tokens}] capped at MAX_LOG_ENTRIES.
//!
//! Writes go to a sibling temp file which is then renamed over the ledger,
//! so a crash mid-write leaves the previous ledger intact.

use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Most recent request entries kept in the log (oldest evicted first).
pub const MAX_LOG_ENTRIES: usize = 100;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ledger replace failed: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// One recorded call against the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub timestamp: NaiveDateTime,
    pub tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLedger {
    #[serde(rename = "daily_requests")]
    pub daily_request_count: u64,
    #[serde(rename = "monthly_tokens")]
    pub monthly_token_count: u64,
    #[serde(rename = "date")]
    pub current_date: NaiveDate,
    #[serde(rename = "month")]
    pub current_month: u32,
    #[serde(rename = "requests_log", default)]
    pub recent_requests: VecDeque<UsageEntry>,
}

impl UsageLedger {
    /// An empty ledger stamped with `today`.
    pub fn fresh(today: NaiveDate) -> Self {
        Self {
            daily_request_count: 0,
            monthly_token_count: 0,
            current_date: today,
            current_month: today.month(),
            recent_requests: VecDeque::new(),
        }
    }

    /// Reads the ledger at `path`. `Ok(None)` when no ledger exists yet.
    pub fn read(path: &Path) -> Result<Option<Self>, LedgerError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Applies period rollover relative to `today`.
    ///
    /// A new day zeroes the request counter and clears the log; a new month
    /// zeroes the token counter. Returns true if anything was reset.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        let mut changed = false;

        if self.current_date != today {
            self.daily_request_count = 0;
            self.recent_requests.clear();
            self.current_date = today;
            changed = true;
        }

        if self.current_month != today.month() {
            self.monthly_token_count = 0;
            self.current_month = today.month();
            changed = true;
        }

        changed
    }

    /// Counts one request and appends it to the bounded log.
    pub fn record(&mut self, timestamp: NaiveDateTime, tokens: u64) {
        self.daily_request_count += 1;
        self.monthly_token_count += tokens;
        self.recent_requests.push_back(UsageEntry { timestamp, tokens });
        while self.recent_requests.len() > MAX_LOG_ENTRIES {
            self.recent_requests.pop_front();
        }
    }

    /// Writes the ledger to `path` via write-to-temp-then-rename.
    pub fn persist(&self, path: &Path) -> Result<(), LedgerError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.flush()?;
        tmp.persist(path)?;
        Ok(())
    }
}
