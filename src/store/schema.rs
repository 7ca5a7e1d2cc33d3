/// Schema for the local catalog store.
///
/// The `name_key` index is created by the migration that backfills the column
/// on stores written before it existed.
pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Brands and notes are keyed by their natural key (name)
CREATE TABLE IF NOT EXISTS brands (
    name TEXT PRIMARY KEY NOT NULL,
    country TEXT
);

CREATE TABLE IF NOT EXISTS notes (
    name TEXT PRIMARY KEY NOT NULL,
    category TEXT
);

CREATE TABLE IF NOT EXISTS catalog_items (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL CHECK (length(name) > 0),
    -- Lowercased name for search and ordering; SQLite folds ASCII only
    name_key TEXT NOT NULL DEFAULT '',
    brand_name TEXT REFERENCES brands(name),
    concentration TEXT,
    longevity TEXT,
    sillage TEXT,
    performance_score REAL NOT NULL DEFAULT 0,
    description TEXT,
    image_url TEXT,
    occasions TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_catalog_items_score ON catalog_items(performance_score, id);
CREATE INDEX IF NOT EXISTS idx_catalog_items_created ON catalog_items(created_at, id);
CREATE INDEX IF NOT EXISTS idx_catalog_items_brand ON catalog_items(brand_name);

-- Note groups (top/mid/base), position preserves catalog order within a group
CREATE TABLE IF NOT EXISTS item_notes (
    item_id TEXT NOT NULL REFERENCES catalog_items(id) ON DELETE CASCADE,
    role TEXT NOT NULL CHECK (role IN ('top', 'mid', 'base')),
    note_name TEXT NOT NULL REFERENCES notes(name),
    position INTEGER NOT NULL,
    PRIMARY KEY (item_id, role, note_name)
);

CREATE INDEX IF NOT EXISTS idx_item_notes_note ON item_notes(note_name);

CREATE TABLE IF NOT EXISTS user_statuses (
    user_id TEXT NOT NULL,
    item_id TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    personal_notes TEXT,
    pending INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, item_id)
);

CREATE INDEX IF NOT EXISTS idx_user_statuses_pending ON user_statuses(user_id, pending);

-- Scalar state (last successful catalog sync, status encoding version)
CREATE TABLE IF NOT EXISTS sync_meta (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
"#;

pub const NAME_KEY_INDEX: &str =
  "CREATE INDEX IF NOT EXISTS idx_catalog_items_name_key ON catalog_items(name_key, id)";
