//! Catalog items, brands and notes.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_datetime, parse_datetime, LocalStore, StoreError};
use crate::model::{Brand, CatalogItem, Note, NoteRole, SortOption};
use crate::pattern;

const ITEM_COLUMNS: &str = "i.id, i.name, i.brand_name, b.country, i.concentration, i.longevity,
  i.sillage, i.performance_score, i.description, i.image_url, i.occasions, i.created_at";

/// Columns of one `catalog_items` row, before notes are attached.
struct ItemRow {
  id: String,
  name: String,
  brand_name: Option<String>,
  brand_country: Option<String>,
  concentration: Option<String>,
  longevity: Option<String>,
  sillage: Option<String>,
  performance: f64,
  description: Option<String>,
  image_url: Option<String>,
  occasions: String,
  created_at: String,
}

impl ItemRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      name: row.get(1)?,
      brand_name: row.get(2)?,
      brand_country: row.get(3)?,
      concentration: row.get(4)?,
      longevity: row.get(5)?,
      sillage: row.get(6)?,
      performance: row.get(7)?,
      description: row.get(8)?,
      image_url: row.get(9)?,
      occasions: row.get(10)?,
      created_at: row.get(11)?,
    })
  }

  fn into_item(self, conn: &Connection) -> Result<CatalogItem> {
    let occasions: Vec<String> =
      serde_json::from_str(&self.occasions).map_err(|e| StoreError::CorruptRecord {
        table: "catalog_items",
        key: self.id.clone(),
        detail: format!("bad occasions list: {}", e),
      })?;
    let created_at = parse_datetime("catalog_items", &self.id, &self.created_at)?;

    let mut item = CatalogItem {
      id: self.id,
      name: self.name,
      brand: self.brand_name.map(|name| Brand {
        name,
        country: self.brand_country,
      }),
      concentration: self.concentration,
      longevity: self.longevity,
      sillage: self.sillage,
      performance: self.performance,
      description: self.description,
      image_url: self.image_url,
      occasions,
      top_notes: Vec::new(),
      mid_notes: Vec::new(),
      base_notes: Vec::new(),
      created_at,
    };
    attach_notes(conn, &mut item)?;
    Ok(item)
  }
}

fn attach_notes(conn: &Connection, item: &mut CatalogItem) -> Result<()> {
  let mut stmt = conn
    .prepare_cached(
      "SELECT inote.role, n.name, n.category FROM item_notes inote
       INNER JOIN notes n ON n.name = inote.note_name
       WHERE inote.item_id = ?
       ORDER BY inote.role, inote.position",
    )
    .map_err(|e| eyre!("Failed to prepare note query: {}", e))?;

  let rows: Vec<(String, String, Option<String>)> = stmt
    .query_map(params![item.id], |row| {
      Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    })
    .map_err(|e| eyre!("Failed to query notes: {}", e))?
    .collect::<rusqlite::Result<_>>()
    .map_err(|e| eyre!("Failed to read notes: {}", e))?;

  for (role, name, category) in rows {
    let role = NoteRole::parse(&role).ok_or_else(|| StoreError::CorruptRecord {
      table: "item_notes",
      key: item.id.clone(),
      detail: format!("unknown note role '{}'", role),
    })?;
    item.notes_mut(role).push(Note { name, category });
  }
  Ok(())
}

fn query_items(
  conn: &Connection,
  sql: &str,
  params: impl rusqlite::Params,
) -> Result<Vec<CatalogItem>> {
  let mut stmt = conn
    .prepare(sql)
    .map_err(|e| eyre!("Failed to prepare item query: {}", e))?;

  let rows: Vec<ItemRow> = stmt
    .query_map(params, ItemRow::from_row)
    .map_err(|e| eyre!("Failed to query items: {}", e))?
    .collect::<rusqlite::Result<_>>()
    .map_err(|e| eyre!("Failed to read items: {}", e))?;

  rows.into_iter().map(|row| row.into_item(conn)).collect()
}

// ============================================================================
// Find-or-create on natural keys
// ============================================================================

/// Return the brand named `brand.name`, creating it if absent.
///
/// An existing brand's country is refreshed when the incoming value has one.
fn brand_find_or_create(conn: &Connection, brand: &Brand) -> Result<Brand> {
  conn
    .execute(
      "INSERT INTO brands (name, country) VALUES (?1, ?2)
       ON CONFLICT(name) DO UPDATE SET country = COALESCE(excluded.country, brands.country)",
      params![brand.name, brand.country],
    )
    .map_err(|e| eyre!("Failed to store brand {}: {}", brand.name, e))?;

  conn
    .query_row(
      "SELECT name, country FROM brands WHERE name = ?",
      params![brand.name],
      |row| {
        Ok(Brand {
          name: row.get(0)?,
          country: row.get(1)?,
        })
      },
    )
    .map_err(|e| eyre!("Failed to read brand {}: {}", brand.name, e))
}

/// Return the note named `note.name`, creating it if absent.
fn note_find_or_create(conn: &Connection, note: &Note) -> Result<Note> {
  conn
    .execute(
      "INSERT INTO notes (name, category) VALUES (?1, ?2)
       ON CONFLICT(name) DO UPDATE SET category = COALESCE(excluded.category, notes.category)",
      params![note.name, note.category],
    )
    .map_err(|e| eyre!("Failed to store note {}: {}", note.name, e))?;

  conn
    .query_row(
      "SELECT name, category FROM notes WHERE name = ?",
      params![note.name],
      |row| {
        Ok(Note {
          name: row.get(0)?,
          category: row.get(1)?,
        })
      },
    )
    .map_err(|e| eyre!("Failed to read note {}: {}", note.name, e))
}

/// Key used to search and order by name, case-folded beyond ASCII.
pub(crate) fn name_key(name: &str) -> String {
  name.to_lowercase()
}

/// Add and backfill `catalog_items.name_key` on stores that predate it.
pub(super) fn migrate_name_key(conn: &Connection) -> Result<()> {
  let has_column: bool = conn
    .query_row(
      "SELECT COUNT(*) > 0 FROM pragma_table_info('catalog_items') WHERE name = 'name_key'",
      [],
      |row| row.get(0),
    )
    .map_err(|e| eyre!("Failed to inspect catalog_items: {}", e))?;

  if !has_column {
    tracing::info!(target: "scentshelf::store", "Adding name_key to catalog_items");
    conn
      .execute(
        "ALTER TABLE catalog_items ADD COLUMN name_key TEXT NOT NULL DEFAULT ''",
        [],
      )
      .map_err(|e| eyre!("Failed to add name_key column: {}", e))?;
  }

  let stale: Vec<(String, String)> = {
    let mut stmt = conn
      .prepare("SELECT id, name FROM catalog_items WHERE name_key = ''")
      .map_err(|e| eyre!("Failed to prepare name_key backfill: {}", e))?;
    let rows = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to query name_key backfill: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read name_key backfill: {}", e))?;
    rows
  };
  for (id, name) in stale {
    conn
      .execute(
        "UPDATE catalog_items SET name_key = ? WHERE id = ?",
        params![name_key(&name), id],
      )
      .map_err(|e| eyre!("Failed to backfill name_key of {}: {}", id, e))?;
  }

  conn
    .execute(super::schema::NAME_KEY_INDEX, [])
    .map_err(|e| eyre!("Failed to index name_key: {}", e))?;
  Ok(())
}

/// Insert or update one item and re-resolve its brand and note groups.
fn upsert_item(conn: &Connection, item: &CatalogItem) -> Result<()> {
  if item.name.trim().is_empty() {
    return Err(eyre!("Refusing to store item {} with an empty name", item.id));
  }

  let brand_name = match &item.brand {
    Some(brand) => Some(brand_find_or_create(conn, brand)?.name),
    None => None,
  };
  let occasions =
    serde_json::to_string(&item.occasions).map_err(|e| eyre!("Failed to encode occasions: {}", e))?;

  conn
    .execute(
      "INSERT INTO catalog_items (id, name, brand_name, concentration, longevity, sillage,
         performance_score, description, image_url, occasions, created_at, name_key)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
       ON CONFLICT(id) DO UPDATE SET
         name = excluded.name,
         name_key = excluded.name_key,
         brand_name = excluded.brand_name,
         concentration = excluded.concentration,
         longevity = excluded.longevity,
         sillage = excluded.sillage,
         performance_score = excluded.performance_score,
         description = excluded.description,
         image_url = excluded.image_url,
         occasions = excluded.occasions,
         created_at = excluded.created_at",
      params![
        item.id,
        item.name,
        brand_name,
        item.concentration,
        item.longevity,
        item.sillage,
        item.performance,
        item.description,
        item.image_url,
        occasions,
        format_datetime(&item.created_at),
        name_key(&item.name),
      ],
    )
    .map_err(|e| eyre!("Failed to store item {}: {}", item.id, e))?;

  conn
    .execute("DELETE FROM item_notes WHERE item_id = ?", params![item.id])
    .map_err(|e| eyre!("Failed to clear notes of {}: {}", item.id, e))?;

  for role in NoteRole::ALL {
    for (position, note) in item.notes(role).iter().enumerate() {
      let note = note_find_or_create(conn, note)?;
      conn
        .execute(
          "INSERT OR IGNORE INTO item_notes (item_id, role, note_name, position)
           VALUES (?1, ?2, ?3, ?4)",
          params![item.id, role.as_str(), note.name, position],
        )
        .map_err(|e| eyre!("Failed to link note {} to {}: {}", note.name, item.id, e))?;
    }
  }

  Ok(())
}

impl LocalStore {
  /// One page of items ordered by `sort`, ties broken by id.
  pub fn find_page(&self, sort: SortOption, offset: usize, limit: usize) -> Result<Vec<CatalogItem>> {
    let conn = self.lock()?;
    let (column, ascending) = sort.order();
    let direction = if ascending { "ASC" } else { "DESC" };
    let column = match column {
      crate::model::SortColumn::Name => "name_key",
      other => other.column(),
    };

    let sql = format!(
      "SELECT {ITEM_COLUMNS} FROM catalog_items i
       LEFT JOIN brands b ON b.name = i.brand_name
       ORDER BY i.{} {}, i.id ASC
       LIMIT ? OFFSET ?",
      column, direction
    );
    query_items(&conn, &sql, params![limit as i64, offset as i64])
  }

  /// One page of items whose name contains `text` (case-insensitive), by name then id.
  pub fn search_page(&self, text: &str, offset: usize, limit: usize) -> Result<Vec<CatalogItem>> {
    let conn = self.lock()?;
    let sql = format!(
      "SELECT {ITEM_COLUMNS} FROM catalog_items i
       LEFT JOIN brands b ON b.name = i.brand_name
       WHERE i.name_key LIKE ?1 ESCAPE '\\'
       ORDER BY i.name_key ASC, i.id ASC
       LIMIT ?2 OFFSET ?3"
    );
    query_items(
      &conn,
      &sql,
      params![
        pattern::contains_pattern(&name_key(text)),
        limit as i64,
        offset as i64
      ],
    )
  }

  /// Look up one item by identifier.
  pub fn get_item(&self, id: &str) -> Result<Option<CatalogItem>> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        &format!(
          "SELECT {ITEM_COLUMNS} FROM catalog_items i
           LEFT JOIN brands b ON b.name = i.brand_name
           WHERE i.id = ?"
        ),
        params![id],
        ItemRow::from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to query item {}: {}", id, e))?;

    row.map(|r| r.into_item(&conn)).transpose()
  }

  /// Look up one item by its name.
  pub fn find_by_name(&self, name: &str) -> Result<Option<CatalogItem>> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        &format!(
          "SELECT {ITEM_COLUMNS} FROM catalog_items i
           LEFT JOIN brands b ON b.name = i.brand_name
           WHERE i.name = ? ORDER BY i.id LIMIT 1"
        ),
        params![name],
        ItemRow::from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to query item named {}: {}", name, e))?;

    row.map(|r| r.into_item(&conn)).transpose()
  }

  /// Identifiers of every locally known item.
  pub fn item_ids(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT id FROM catalog_items ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare id query: {}", e))?;
    let ids = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query ids: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read ids: {}", e))?;
    Ok(ids)
  }

  /// Items referencing a brand, computed by index scan.
  pub fn items_for_brand(&self, brand: &str) -> Result<Vec<CatalogItem>> {
    let conn = self.lock()?;
    let sql = format!(
      "SELECT {ITEM_COLUMNS} FROM catalog_items i
       LEFT JOIN brands b ON b.name = i.brand_name
       WHERE i.brand_name = ?
       ORDER BY i.name_key, i.id"
    );
    query_items(&conn, &sql, params![brand])
  }

  /// Insert or update a single item.
  pub fn upsert(&self, item: &CatalogItem) -> Result<()> {
    self.upsert_page(std::slice::from_ref(item), None)
  }

  /// Upsert a batch of items in one transaction, optionally stamping the
  /// last successful sync time in the same transaction.
  ///
  /// Nothing is written if any item fails.
  pub fn upsert_page(&self, items: &[CatalogItem], synced_at: Option<DateTime<Utc>>) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for item in items {
      upsert_item(&tx, item)?;
    }

    if let Some(at) = synced_at {
      super::meta::write_last_sync(&tx, &at)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  /// Find or create a brand by name.
  pub fn find_or_create_brand(&self, brand: &Brand) -> Result<Brand> {
    let conn = self.lock()?;
    brand_find_or_create(&conn, brand)
  }

  /// Find or create a note by name.
  pub fn find_or_create_note(&self, note: &Note) -> Result<Note> {
    let conn = self.lock()?;
    note_find_or_create(&conn, note)
  }

  /// Row counts of (items, brands, notes).
  pub fn counts(&self) -> Result<(usize, usize, usize)> {
    let conn = self.lock()?;
    let count = |table: &str| -> Result<usize> {
      conn
        .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
          row.get::<_, i64>(0)
        })
        .map(|n| n as usize)
        .map_err(|e| eyre!("Failed to count {}: {}", table, e))
    };
    Ok((count("catalog_items")?, count("brands")?, count("notes")?))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::fixtures::{item, note};

  fn store_with(n: i64) -> LocalStore {
    let store = LocalStore::open_in_memory().unwrap();
    let items: Vec<CatalogItem> = (0..n)
      .map(|i| item(&format!("id-{:02}", i), &format!("Scent {}", i % 4), Some("Acme"), i % 3))
      .collect();
    store.upsert_page(&items, None).unwrap();
    store
  }

  #[test]
  fn test_upsert_roundtrips_associations() {
    let store = LocalStore::open_in_memory().unwrap();
    let mut perfume = item("p1", "Aventus", Some("Creed"), 5);
    perfume.mid_notes = vec![note("Birch"), note("Jasmine")];
    store.upsert(&perfume).unwrap();

    let loaded = store.get_item("p1").unwrap().unwrap();
    assert_eq!(loaded, perfume);
    assert_eq!(
      store.find_by_name("Aventus").unwrap().map(|i| i.id),
      Some("p1".to_string())
    );
  }

  #[test]
  fn test_upsert_updates_in_place() {
    let store = LocalStore::open_in_memory().unwrap();
    let mut perfume = item("p1", "Aventus", Some("Creed"), 5);
    store.upsert(&perfume).unwrap();

    perfume.name = "Aventus Cologne".into();
    perfume.brand = None;
    perfume.top_notes.clear();
    store.upsert(&perfume).unwrap();

    let loaded = store.get_item("p1").unwrap().unwrap();
    assert_eq!(loaded.name, "Aventus Cologne");
    assert!(loaded.brand.is_none());
    assert!(loaded.top_notes.is_empty());
    assert_eq!(store.counts().unwrap().0, 1);
  }

  #[test]
  fn test_shared_brand_and_note_deduplicated() {
    let store = LocalStore::open_in_memory().unwrap();
    let mut a = item("a", "One", Some("Shared"), 1);
    let mut b = item("b", "Two", Some("Shared"), 2);
    // Same note in different roles
    a.top_notes = vec![note("Bergamot")];
    b.top_notes.clear();
    b.base_notes = vec![note("Bergamot")];
    store.upsert_page(&[a, b], None).unwrap();

    let (items, brands, notes) = store.counts().unwrap();
    assert_eq!(items, 2);
    assert_eq!(brands, 1);
    // Bergamot, Rose, Musk
    assert_eq!(notes, 3);
    assert_eq!(store.items_for_brand("Shared").unwrap().len(), 2);
  }

  #[test]
  fn test_find_or_create_refreshes_attributes() {
    let store = LocalStore::open_in_memory().unwrap();
    let created = store
      .find_or_create_brand(&Brand {
        name: "Guerlain".into(),
        country: None,
      })
      .unwrap();
    assert_eq!(created.country, None);

    let found = store
      .find_or_create_brand(&Brand {
        name: "Guerlain".into(),
        country: Some("France".into()),
      })
      .unwrap();
    assert_eq!(found.country.as_deref(), Some("France"));

    let kept = store
      .find_or_create_brand(&Brand {
        name: "Guerlain".into(),
        country: None,
      })
      .unwrap();
    assert_eq!(kept.country.as_deref(), Some("France"));
    assert_eq!(store.counts().unwrap().1, 1);

    let n = store
      .find_or_create_note(&Note {
        name: "Iris".into(),
        category: Some("floral".into()),
      })
      .unwrap();
    assert_eq!(n.category.as_deref(), Some("floral"));
  }

  #[test]
  fn test_pagination_is_stable() {
    let store = store_with(12);
    for sort in [
      SortOption::NameAsc,
      SortOption::NameDesc,
      SortOption::RatingDesc,
      SortOption::RatingAsc,
      SortOption::Newest,
      SortOption::Popular,
    ] {
      let mut paged = store.find_page(sort, 0, 5).unwrap();
      paged.extend(store.find_page(sort, 5, 5).unwrap());
      let whole = store.find_page(sort, 0, 10).unwrap();
      let ids = |v: &[CatalogItem]| v.iter().map(|i| i.id.clone()).collect::<Vec<_>>();
      assert_eq!(ids(&paged), ids(&whole), "sort {:?}", sort);
    }
  }

  #[test]
  fn test_sort_order_and_tiebreak() {
    let store = store_with(6);
    let page = store.find_page(SortOption::RatingDesc, 0, 6).unwrap();
    let scores: Vec<f64> = page.iter().map(|i| i.performance).collect();
    assert_eq!(scores, vec![2.0, 2.0, 1.0, 1.0, 0.0, 0.0]);
    // Equal scores fall back to id order
    assert_eq!(page[0].id, "id-02");
    assert_eq!(page[1].id, "id-05");
  }

  #[test]
  fn test_search_is_case_insensitive_and_literal() {
    let store = LocalStore::open_in_memory().unwrap();
    store
      .upsert_page(
        &[
          item("1", "Rose Absolue", None, 1),
          item("2", "Tuberose 50% Off_", None, 2),
          item("3", "Vetiver", None, 3),
        ],
        None,
      )
      .unwrap();

    let hits = store.search_page("ROSE", 0, 10).unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].name, "Rose Absolue");

    let hits = store.search_page("50% Off_", 0, 10).unwrap();
    assert_eq!(hits.len(), 1);
    assert!(store.search_page("5_%", 0, 10).unwrap().is_empty());
  }

  #[test]
  fn test_search_folds_accented_names() {
    let store = LocalStore::open_in_memory().unwrap();
    store
      .upsert_page(
        &[
          item("1", "Élixir Néroli", None, 1),
          item("2", "eau de Lune", None, 2),
          item("3", "Ambre Nuit", None, 3),
        ],
        None,
      )
      .unwrap();

    for query in ["élixir", "ÉLIXIR", "NÉROLI", "xir né"] {
      let hits = store.search_page(query, 0, 10).unwrap();
      assert_eq!(hits.len(), 1, "query {:?}", query);
      assert_eq!(hits[0].id, "1");
    }

    // Case does not split the name ordering
    let names: Vec<String> = store
      .find_page(SortOption::NameAsc, 0, 10)
      .unwrap()
      .into_iter()
      .map(|i| i.name)
      .collect();
    assert_eq!(names, vec!["Ambre Nuit", "eau de Lune", "Élixir Néroli"]);
  }

  #[test]
  fn test_name_key_backfilled_on_open() {
    let store = store_with(2);
    {
      let conn = store.lock().unwrap();
      conn
        .execute("UPDATE catalog_items SET name = 'ÉTÉ', name_key = ''", [])
        .unwrap();
      migrate_name_key(&conn).unwrap();
    }
    assert_eq!(store.search_page("été", 0, 10).unwrap().len(), 2);
  }

  #[test]
  fn test_failed_page_writes_nothing() {
    let store = LocalStore::open_in_memory().unwrap();
    let good = item("ok", "Fine", Some("Brand"), 1);
    let bad = item("bad", "  ", Some("Other"), 2);
    assert!(store.upsert_page(&[good, bad], Some(Utc::now())).is_err());

    assert_eq!(store.counts().unwrap(), (0, 0, 0));
    assert!(store.last_sync().unwrap().is_none());
  }
}
