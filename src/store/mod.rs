//! Local persistent store for catalog items, brands, notes and user statuses.
//!
//! A single SQLite connection behind a mutex. Every write goes through that
//! mutex, so find-or-create on a natural key can never race with itself and
//! a page upsert runs as one transaction.

mod catalog;
mod meta;
pub mod schema;
mod status;

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::model::UserStatus;

/// Errors with a recognizable shape, carried inside `eyre::Report`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// A persisted value could not be decoded.
  #[error("corrupt record in {table} ({key}): {detail}")]
  CorruptRecord {
    table: &'static str,
    key: String,
    detail: String,
  },
}

/// SQLite-backed local store.
pub struct LocalStore {
  conn: Mutex<Connection>,
}

impl LocalStore {
  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a throwaway store (tests, `--offline` dry runs).
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::from_connection(conn)
  }

  /// Get the default store path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("scentshelf").join("cache.db"))
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Run schema migrations and record the status encoding version.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    catalog::migrate_name_key(&conn)?;

    conn
      .execute(
        "INSERT OR IGNORE INTO sync_meta (key, value) VALUES ('status_encoding', ?)",
        params![UserStatus::ENCODING_VERSION.to_string()],
      )
      .map_err(|e| eyre!("Failed to record status encoding: {}", e))?;

    let version: String = conn
      .query_row(
        "SELECT value FROM sync_meta WHERE key = 'status_encoding'",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to read status encoding: {}", e))?;
    if version != UserStatus::ENCODING_VERSION.to_string() {
      return Err(eyre!(
        "Store uses status encoding v{}, this build reads v{}",
        version,
        UserStatus::ENCODING_VERSION
      ));
    }

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Format a timestamp so that lexical order equals chronological order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(table: &'static str, key: &str, s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| {
      StoreError::CorruptRecord {
        table,
        key: key.to_string(),
        detail: format!("bad timestamp '{}': {}", s, e),
      }
      .into()
    })
}
