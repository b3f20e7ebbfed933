#![forbid(unsafe_code)]

mod error;
mod jobs;
mod stats;
mod support;
mod types;

pub use error::StoreError;
pub use types::*;

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use support::*;

pub const DB_FILENAME: &str = "triage.db";

/// Durable job queue plus the resolved-fingerprint ledger.
///
/// One connection per handle. Processes (or threads) that share a storage
/// directory each open their own handle; every write goes through an
/// immediate transaction so SQLite serializes them.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    storage_dir: PathBuf,
}

impl SqliteStore {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;

        let db_path = storage_dir.join(DB_FILENAME);
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;

        preflight_gate(&conn)?;
        install_sqlite_schema(&conn)?;

        Ok(Self { conn, storage_dir })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn write_tx(&mut self) -> Result<Transaction<'_>, StoreError> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }
}

/// Refuses to run against a database written by an incompatible schema.
fn preflight_gate(conn: &Connection) -> Result<(), StoreError> {
    let has_meta = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='meta'",
            [],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !has_meta {
        return Ok(());
    }

    let version = conn
        .query_row(
            "SELECT value FROM meta WHERE key='schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?;

    match version {
        Some(v) if v == SCHEMA_VERSION => Ok(()),
        Some(_) => Err(StoreError::InvalidInput(
            "RESET_REQUIRED: schema version mismatch",
        )),
        None => Ok(()),
    }
}
