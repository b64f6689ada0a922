//! rollcall-store — SQLite persistence for identities, rosters, sessions
//! and the attendance ledger.
//!
//! Every query is a free function over a `rusqlite::Connection` so the same
//! code runs on the ledger writer thread, inside reconciliation
//! transactions, and directly from the CLI.

pub mod identities;
pub mod ledger;
pub mod roster;
pub mod schema;
pub mod sessions;
pub mod writer;

use chrono::{DateTime, Local, NaiveDate};
use rollcall_core::{CatalogError, Identity, IdentitySource};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use ledger::{
    AbsentMark, AbsentOutcome, AttendanceKey, AttendanceRecord, AttendanceStatus, PresentMark,
    PresentOutcome, ReconcileBatch, ReconcileReport,
};
pub use roster::RosterEntry;
pub use sessions::{SessionRow, SessionStatus};
pub use writer::{spawn_writer, LedgerError, LedgerHandle, WriterOptions};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("migration failed: {0}")]
    Migration(String),
    #[error("corrupt {field}: {reason}")]
    Corrupt { field: &'static str, reason: String },
}

/// Owned SQLite connection with the schema applied.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let conn = Connection::open(path)?;
        if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
            tracing::warn!(error = %err, "failed to enable WAL mode");
        }
        let store = Self::prepare(conn)?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(mut conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        schema::run_migrations(&mut conn)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

impl IdentitySource for Store {
    fn load_identities(&self) -> Result<Vec<Identity>, CatalogError> {
        identities::load_identities(&self.conn)
            .map_err(|e| CatalogError::Unavailable(e.to_string()))
    }
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn parse_date(value: &str, field: &'static str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|e| StoreError::Corrupt {
        field,
        reason: format!("'{value}': {e}"),
    })
}

pub(crate) fn parse_datetime(
    value: &str,
    field: &'static str,
) -> Result<DateTime<Local>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Local))
        .map_err(|e| StoreError::Corrupt {
            field,
            reason: format!("'{value}': {e}"),
        })
}

pub(crate) fn parse_optional_datetime(
    value: Option<String>,
    field: &'static str,
) -> Result<Option<DateTime<Local>>, StoreError> {
    value.map(|raw| parse_datetime(&raw, field)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/attendance.db");
        let store = Store::open(&path).unwrap();
        assert!(path.exists());
        drop(store);

        // Reopening an existing database skips applied migrations.
        Store::open(&path).unwrap();
    }

    #[test]
    fn test_store_is_identity_source() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.load_identities().unwrap().is_empty());
    }

    #[test]
    fn test_date_round_trip() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        assert_eq!(format_date(date), "2026-10-19");
        assert_eq!(parse_date("2026-10-19", "date").unwrap(), date);
        assert!(parse_date("19/10/2026", "date").is_err());
    }
}
