//! Per-user status records and their pending flags.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;

use super::{format_datetime, parse_datetime, LocalStore, StoreError};
use crate::model::{RemoteStatus, StatusRecord, UserStatus};

const STATUS_COLUMNS: &str = "s.user_id, s.item_id, s.status, s.created_at, s.personal_notes, s.pending";

type RawStatus = (String, String, String, String, Option<String>, bool);

fn raw_status(row: &Row<'_>) -> rusqlite::Result<RawStatus> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
  ))
}

/// Decode a row, failing on values outside the status encoding.
fn decode((user_id, item_id, status, created_at, personal_notes, pending): RawStatus) -> Result<StatusRecord> {
  let status = status
    .parse::<UserStatus>()
    .map_err(|e| StoreError::CorruptRecord {
      table: "user_statuses",
      key: format!("{}/{}", user_id, item_id),
      detail: e.to_string(),
    })?;
  let created_at = parse_datetime("user_statuses", &item_id, &created_at)?;
  Ok(StatusRecord {
    user_id,
    item_id,
    status,
    created_at,
    personal_notes,
    pending,
  })
}

fn read_status(conn: &Connection, user_id: &str, item_id: &str) -> Result<Option<StatusRecord>> {
  let raw = conn
    .query_row(
      &format!("SELECT {STATUS_COLUMNS} FROM user_statuses s WHERE s.user_id = ? AND s.item_id = ?"),
      params![user_id, item_id],
      raw_status,
    )
    .optional()
    .map_err(|e| eyre!("Failed to query status of {}: {}", item_id, e))?;
  raw.map(decode).transpose()
}

fn read_statuses(conn: &Connection, sql: &str, user_id: &str) -> Result<Vec<StatusRecord>> {
  let mut stmt = conn
    .prepare(sql)
    .map_err(|e| eyre!("Failed to prepare status query: {}", e))?;
  let rows: Vec<RawStatus> = stmt
    .query_map(params![user_id], raw_status)
    .map_err(|e| eyre!("Failed to query statuses: {}", e))?
    .collect::<rusqlite::Result<_>>()
    .map_err(|e| eyre!("Failed to read statuses: {}", e))?;
  rows.into_iter().map(decode).collect()
}

impl LocalStore {
  /// Status of one item for one user.
  pub fn status(&self, user_id: &str, item_id: &str) -> Result<Option<StatusRecord>> {
    let conn = self.lock()?;
    read_status(&conn, user_id, item_id)
  }

  /// Statuses of a user for every locally known item, keyed by item id.
  pub fn statuses_for_user(&self, user_id: &str) -> Result<HashMap<String, StatusRecord>> {
    let conn = self.lock()?;
    let records = read_statuses(
      &conn,
      &format!(
        "SELECT {STATUS_COLUMNS} FROM user_statuses s
         INNER JOIN catalog_items i ON i.id = s.item_id
         WHERE s.user_id = ?"
      ),
      user_id,
    )?;
    Ok(
      records
        .into_iter()
        .map(|r| (r.item_id.clone(), r))
        .collect(),
    )
  }

  /// Records whose value is not yet acknowledged remotely.
  ///
  /// Includes items missing from the local catalog (toggled from uncached
  /// search or filter results).
  pub fn pending_statuses(&self, user_id: &str) -> Result<Vec<StatusRecord>> {
    let conn = self.lock()?;
    read_statuses(
      &conn,
      &format!(
        "SELECT {STATUS_COLUMNS} FROM user_statuses s
         WHERE s.user_id = ? AND s.pending = 1
         ORDER BY s.item_id"
      ),
      user_id,
    )
  }

  /// Record a user-initiated change, marking it pending.
  ///
  /// `UserStatus::None` is kept as a row so that the delete can be uploaded.
  pub fn set_local_status(
    &self,
    user_id: &str,
    item_id: &str,
    status: UserStatus,
    now: DateTime<Utc>,
  ) -> Result<StatusRecord> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO user_statuses (user_id, item_id, status, created_at, pending)
         VALUES (?1, ?2, ?3, ?4, 1)
         ON CONFLICT(user_id, item_id) DO UPDATE SET status = excluded.status, pending = 1",
        params![user_id, item_id, status.as_str(), format_datetime(&now)],
      )
      .map_err(|e| eyre!("Failed to store status of {}: {}", item_id, e))?;

    read_status(&conn, user_id, item_id)?
      .ok_or_else(|| eyre!("Status of {} vanished after write", item_id))
  }

  /// Set the free-text notes of an existing status record. Local only.
  pub fn set_personal_notes(&self, user_id: &str, item_id: &str, notes: Option<&str>) -> Result<bool> {
    let conn = self.lock()?;
    let changed = conn
      .execute(
        "UPDATE user_statuses SET personal_notes = ? WHERE user_id = ? AND item_id = ?",
        params![notes, user_id, item_id],
      )
      .map_err(|e| eyre!("Failed to store notes of {}: {}", item_id, e))?;
    Ok(changed > 0)
  }

  /// Mark an upload of `uploaded` as acknowledged.
  ///
  /// The pending flag is cleared only if the record still holds `uploaded`;
  /// an acknowledged `none` removes the record. Returns whether anything changed.
  pub fn confirm_upload(&self, user_id: &str, item_id: &str, uploaded: UserStatus) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let current = read_status(&tx, user_id, item_id)?;
    let changed = match current {
      Some(record) if record.status == uploaded => {
        if uploaded.is_none() {
          tx.execute(
            "DELETE FROM user_statuses WHERE user_id = ? AND item_id = ?",
            params![user_id, item_id],
          )
          .map_err(|e| eyre!("Failed to remove status of {}: {}", item_id, e))?;
        } else {
          tx.execute(
            "UPDATE user_statuses SET pending = 0 WHERE user_id = ? AND item_id = ?",
            params![user_id, item_id],
          )
          .map_err(|e| eyre!("Failed to clear pending flag of {}: {}", item_id, e))?;
        }
        true
      }
      _ => false,
    };

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(changed)
  }

  /// Overwrite the local value with the remote one, unless a local change is pending.
  ///
  /// Returns false when the record was pending and left untouched.
  pub fn apply_remote_status(&self, user_id: &str, remote: &RemoteStatus) -> Result<bool> {
    let conn = self.lock()?;
    let changed = conn
      .execute(
        "INSERT INTO user_statuses (user_id, item_id, status, created_at, pending)
         VALUES (?1, ?2, ?3, ?4, 0)
         ON CONFLICT(user_id, item_id) DO UPDATE SET
           status = excluded.status,
           created_at = excluded.created_at
         WHERE user_statuses.pending = 0",
        params![
          user_id,
          remote.item_id,
          remote.status.as_str(),
          format_datetime(&remote.created_at)
        ],
      )
      .map_err(|e| eyre!("Failed to apply remote status of {}: {}", remote.item_id, e))?;
    Ok(changed > 0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::fixtures::item;
  use chrono::TimeZone;

  fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
  }

  fn store() -> LocalStore {
    let store = LocalStore::open_in_memory().unwrap();
    store
      .upsert_page(&[item("a", "A", None, 1), item("b", "B", None, 2)], None)
      .unwrap();
    store
  }

  #[test]
  fn test_local_change_is_pending() {
    let store = store();
    let record = store
      .set_local_status("u1", "a", UserStatus::Owned, now())
      .unwrap();
    assert!(record.pending);
    assert_eq!(record.status, UserStatus::Owned);
    assert_eq!(store.pending_statuses("u1").unwrap().len(), 1);
    assert!(store.pending_statuses("u2").unwrap().is_empty());
  }

  #[test]
  fn test_pending_includes_uncached_items() {
    let store = store();
    store
      .set_local_status("u1", "not-cached", UserStatus::Wishlist, now())
      .unwrap();
    let pending = store.pending_statuses("u1").unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].item_id, "not-cached");
    // Not part of the download view
    assert!(store.statuses_for_user("u1").unwrap().is_empty());
  }

  #[test]
  fn test_confirm_only_matching_value() {
    let store = store();
    store
      .set_local_status("u1", "a", UserStatus::Owned, now())
      .unwrap();
    store
      .set_local_status("u1", "a", UserStatus::Wishlist, now())
      .unwrap();

    // A stale acknowledgement must not clear the newer value
    assert!(!store.confirm_upload("u1", "a", UserStatus::Owned).unwrap());
    assert!(store.status("u1", "a").unwrap().unwrap().pending);

    assert!(store.confirm_upload("u1", "a", UserStatus::Wishlist).unwrap());
    assert!(!store.status("u1", "a").unwrap().unwrap().pending);
  }

  #[test]
  fn test_confirmed_none_removes_record() {
    let store = store();
    store
      .set_local_status("u1", "b", UserStatus::None, now())
      .unwrap();
    assert!(store.confirm_upload("u1", "b", UserStatus::None).unwrap());
    assert!(store.status("u1", "b").unwrap().is_none());
  }

  #[test]
  fn test_remote_never_overwrites_pending() {
    let store = store();
    store
      .set_local_status("u1", "a", UserStatus::Owned, now())
      .unwrap();
    let remote = RemoteStatus {
      item_id: "a".into(),
      status: UserStatus::Consumed,
      created_at: now(),
    };
    assert!(!store.apply_remote_status("u1", &remote).unwrap());
    assert_eq!(
      store.status("u1", "a").unwrap().unwrap().status,
      UserStatus::Owned
    );

    let remote_b = RemoteStatus {
      item_id: "b".into(),
      ..remote
    };
    assert!(store.apply_remote_status("u1", &remote_b).unwrap());
    let record = store.status("u1", "b").unwrap().unwrap();
    assert_eq!(record.status, UserStatus::Consumed);
    assert!(!record.pending);
  }

  #[test]
  fn test_personal_notes() {
    let store = store();
    assert!(!store.set_personal_notes("u1", "a", Some("gift")).unwrap());
    store
      .set_local_status("u1", "a", UserStatus::Owned, now())
      .unwrap();
    assert!(store.set_personal_notes("u1", "a", Some("gift")).unwrap());
    assert_eq!(
      store.status("u1", "a").unwrap().unwrap().personal_notes.as_deref(),
      Some("gift")
    );
  }

  #[test]
  fn test_unknown_status_is_corrupt_record() {
    let store = store();
    {
      let conn = store.lock().unwrap();
      conn
        .execute(
          "INSERT INTO user_statuses (user_id, item_id, status, created_at, pending)
           VALUES ('u1', 'a', 'favourite', '2024-05-01T09:00:00.000000Z', 0)",
          [],
        )
        .unwrap();
    }
    let err = store.status("u1", "a").unwrap_err();
    assert!(matches!(
      err.downcast_ref::<StoreError>(),
      Some(StoreError::CorruptRecord { table: "user_statuses", .. })
    ));
  }
}
