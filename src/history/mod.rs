//! Append-only ledger of completed fetches.
//!
//! Stored as a JSON document:
//!
//! ```json
//! {
//!   "events": [
//!     { "source": "anz", "accountNumber": "123456789", "fetchedThrough": "2024-03-09" }
//!   ]
//! }
//! ```
//!
//! The whole document is rewritten on every save.

mod lock;

pub use lock::HistoryLock;

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Failed to read history file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write history file {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse history file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid history file {path}: event {index}: {reason}")]
    Invalid {
        path: PathBuf,
        index: usize,
        reason: String,
    },

    #[error("History file {path} is locked by another run (lock file {lock})")]
    Locked { path: PathBuf, lock: PathBuf },
}

/// A history record whose date could not be read.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("corrupt history record for {source_name}/{account_number}: fetchedThrough {value:?} is not a date")]
pub struct CorruptRecord {
    pub source_name: String,
    pub account_number: String,
    pub value: String,
}

/// Transactions through `fetched_through` (inclusive) have been fetched
/// for this source/account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEvent {
    pub source: String,
    pub account_number: String,
    pub fetched_through: NaiveDate,
}

impl HistoryEvent {
    pub fn new(
        source: impl Into<String>,
        account_number: impl Into<String>,
        fetched_through: NaiveDate,
    ) -> Self {
        Self {
            source: source.into(),
            account_number: account_number.into(),
            fetched_through,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct HistoryRecord {
    source: String,
    account_number: String,
    fetched_through: String,
}

impl HistoryRecord {
    fn matches(&self, source: &str, account_number: &str) -> bool {
        self.source == source && self.account_number == account_number
    }

    fn to_event(&self) -> Result<HistoryEvent, CorruptRecord> {
        parse_fetched_through(&self.fetched_through)
            .map(|date| HistoryEvent::new(&self.source, &self.account_number, date))
            .ok_or_else(|| CorruptRecord {
                source_name: self.source.clone(),
                account_number: self.account_number.clone(),
                value: self.fetched_through.clone(),
            })
    }
}

impl From<&HistoryEvent> for HistoryRecord {
    fn from(event: &HistoryEvent) -> Self {
        Self {
            source: event.source.clone(),
            account_number: event.account_number.clone(),
            fetched_through: event.fetched_through.format(DATE_FORMAT).to_string(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct HistoryDocument {
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    schema: Option<String>,
    #[serde(default)]
    events: Vec<HistoryRecord>,
}

/// Accepts `YYYY-MM-DD` or an RFC 3339 timestamp (reduced to the
/// calendar date as written).
fn parse_fetched_through(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(value).ok().map(|dt| dt.date_naive()))
}

/// In-memory history, optionally backed by a file.
///
/// Records with unreadable dates are kept as-is so that only the affected
/// source/account pair fails when it is scheduled.
#[derive(Debug, Default)]
pub struct HistoryStore {
    path: Option<PathBuf>,
    schema: Option<String>,
    records: Vec<HistoryRecord>,
}

impl HistoryStore {
    /// A history that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load history from `path`. A missing file is an empty history.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let path = path.as_ref().to_path_buf();

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No history file yet; starting empty");
                return Ok(Self {
                    path: Some(path),
                    ..Self::default()
                });
            }
            Err(source) => return Err(HistoryError::Read { path, source }),
        };

        let document: HistoryDocument = if content.trim().is_empty() {
            HistoryDocument::default()
        } else {
            serde_json::from_str(&content).map_err(|source| HistoryError::Parse {
                path: path.clone(),
                source,
            })?
        };

        for (index, record) in document.events.iter().enumerate() {
            let reason = if record.source.trim().is_empty() {
                Some("source is empty")
            } else if record.account_number.trim().is_empty() {
                Some("accountNumber is empty")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(HistoryError::Invalid {
                    path,
                    index,
                    reason: reason.to_string(),
                });
            }
        }

        tracing::info!(path = %path.display(), events = document.events.len(), "History loaded");

        Ok(Self {
            path: Some(path),
            schema: document.schema,
            records: document.events,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every record in append order, corrupt ones included.
    pub fn all(&self) -> Vec<Result<HistoryEvent, CorruptRecord>> {
        self.records.iter().map(HistoryRecord::to_event).collect()
    }

    /// Events for one source/account in append order.
    ///
    /// Fails if any of that pair's records is corrupt.
    pub fn events(
        &self,
        source: &str,
        account_number: &str,
    ) -> Result<Vec<HistoryEvent>, CorruptRecord> {
        self.records
            .iter()
            .filter(|r| r.matches(source, account_number))
            .map(HistoryRecord::to_event)
            .collect()
    }

    /// The authoritative event for a pair: greatest `fetched_through`,
    /// later append winning ties.
    pub fn latest(
        &self,
        source: &str,
        account_number: &str,
    ) -> Result<Option<HistoryEvent>, CorruptRecord> {
        let mut latest: Option<HistoryEvent> = None;
        for event in self.events(source, account_number)? {
            let newer = latest
                .as_ref()
                .map(|l| event.fetched_through >= l.fetched_through)
                .unwrap_or(true);
            if newer {
                latest = Some(event);
            }
        }
        Ok(latest)
    }

    /// Append an event. Call [`HistoryStore::save`] to persist it.
    pub fn record(&mut self, event: HistoryEvent) {
        tracing::debug!(
            source = %event.source,
            account = %event.account_number,
            fetched_through = %event.fetched_through,
            "Recording history event"
        );
        self.records.push(HistoryRecord::from(&event));
    }

    /// Write the whole history back to its file, atomically.
    ///
    /// No-op for in-memory stores.
    pub fn save(&self) -> Result<(), HistoryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let write_err = |source| HistoryError::Write {
            path: path.clone(),
            source,
        };

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(write_err)?;

        let document = HistoryDocument {
            schema: self.schema.clone(),
            events: self.records.clone(),
        };
        let mut content = serde_json::to_string_pretty(&document)
            .map_err(|e| write_err(std::io::Error::other(e)))?;
        content.push('\n');

        let mut tmp = NamedTempFile::new_in(&dir).map_err(write_err)?;
        tmp.write_all(content.as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(path).map_err(|e| write_err(e.error))?;

        tracing::debug!(path = %path.display(), events = self.records.len(), "History saved");
        Ok(())
    }
}
