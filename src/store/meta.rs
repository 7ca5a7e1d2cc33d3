//! Scalar sync state.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::{format_datetime, parse_datetime, LocalStore};

const LAST_SYNC_KEY: &str = "last_catalog_sync";

pub(super) fn write_last_sync(conn: &Connection, at: &DateTime<Utc>) -> Result<()> {
  conn
    .execute(
      "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?, ?)",
      params![LAST_SYNC_KEY, format_datetime(at)],
    )
    .map_err(|e| eyre!("Failed to store sync timestamp: {}", e))?;
  Ok(())
}

impl LocalStore {
  /// When the catalog was last cached from a complete remote page.
  pub fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
    let conn = self.lock()?;
    let value: Option<String> = conn
      .query_row(
        "SELECT value FROM sync_meta WHERE key = ?",
        params![LAST_SYNC_KEY],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read sync timestamp: {}", e))?;

    value
      .map(|v| parse_datetime("sync_meta", LAST_SYNC_KEY, &v))
      .transpose()
  }
}
