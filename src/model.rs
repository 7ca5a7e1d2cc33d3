//! Domain types shared by the store, the remote sources and the services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Catalog entities
// ============================================================================

/// A brand, identified by its name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Brand {
  pub name: String,
  pub country: Option<String>,
}

/// A note, identified by its name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
  pub name: String,
  pub category: Option<String>,
}

/// The group a note belongs to within one catalog item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteRole {
  Top,
  Mid,
  Base,
}

impl NoteRole {
  pub const ALL: [NoteRole; 3] = [NoteRole::Top, NoteRole::Mid, NoteRole::Base];

  pub fn as_str(self) -> &'static str {
    match self {
      NoteRole::Top => "top",
      NoteRole::Mid => "mid",
      NoteRole::Base => "base",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "top" => Some(NoteRole::Top),
      "mid" | "middle" | "heart" => Some(NoteRole::Mid),
      "base" => Some(NoteRole::Base),
      _ => None,
    }
  }
}

/// A catalog entry as materialized from either the local store or the remote catalog.
///
/// Brand and notes are carried by value; the store keeps them as natural-key
/// references so there is no back-pointer from a brand or note to its items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
  pub id: String,
  pub name: String,
  pub brand: Option<Brand>,
  pub concentration: Option<String>,
  pub longevity: Option<String>,
  pub sillage: Option<String>,
  pub performance: f64,
  pub description: Option<String>,
  pub image_url: Option<String>,
  #[serde(default)]
  pub occasions: Vec<String>,
  #[serde(default)]
  pub top_notes: Vec<Note>,
  #[serde(default)]
  pub mid_notes: Vec<Note>,
  #[serde(default)]
  pub base_notes: Vec<Note>,
  pub created_at: DateTime<Utc>,
}

impl CatalogItem {
  /// Notes of one group, in catalog order.
  pub fn notes(&self, role: NoteRole) -> &[Note] {
    match role {
      NoteRole::Top => &self.top_notes,
      NoteRole::Mid => &self.mid_notes,
      NoteRole::Base => &self.base_notes,
    }
  }

  pub fn notes_mut(&mut self, role: NoteRole) -> &mut Vec<Note> {
    match role {
      NoteRole::Top => &mut self.top_notes,
      NoteRole::Mid => &mut self.mid_notes,
      NoteRole::Base => &mut self.base_notes,
    }
  }

  /// Names of all notes across the three groups.
  pub fn all_note_names(&self) -> impl Iterator<Item = &str> {
    NoteRole::ALL
      .into_iter()
      .flat_map(move |role| self.notes(role).iter().map(|n| n.name.as_str()))
  }
}

// ============================================================================
// User status
// ============================================================================

/// Per-user shelf status of a catalog item. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
  #[default]
  None,
  Wishlist,
  Owned,
  Consumed,
}

/// Error returned when a status string is not part of the encoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized status value '{0}'")]
pub struct UnknownStatus(pub String);

impl UserStatus {
  /// Version of the string encoding below. Stored alongside the local schema.
  pub const ENCODING_VERSION: u32 = 1;

  /// Encoding used at the storage and wire boundaries.
  pub fn as_str(self) -> &'static str {
    match self {
      UserStatus::None => "none",
      UserStatus::Wishlist => "wishlist",
      UserStatus::Owned => "owned",
      UserStatus::Consumed => "consumed",
    }
  }

  pub fn is_none(self) -> bool {
    self == UserStatus::None
  }
}

impl FromStr for UserStatus {
  type Err = UnknownStatus;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "none" => Ok(UserStatus::None),
      "wishlist" => Ok(UserStatus::Wishlist),
      "owned" => Ok(UserStatus::Owned),
      "consumed" => Ok(UserStatus::Consumed),
      other => Err(UnknownStatus(other.to_string())),
    }
  }
}

impl fmt::Display for UserStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Locally persisted status of one item for one user.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRecord {
  pub user_id: String,
  pub item_id: String,
  pub status: UserStatus,
  pub created_at: DateTime<Utc>,
  pub personal_notes: Option<String>,
  /// Set while the current value has not been acknowledged by the remote store.
  pub pending: bool,
}

/// A status row as reported by the remote user-status source.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStatus {
  pub item_id: String,
  pub status: UserStatus,
  pub created_at: DateTime<Utc>,
}

// ============================================================================
// Reviews
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
  pub id: String,
  pub item_id: String,
  /// None for legacy or anonymous reviews.
  pub author_id: Option<String>,
  pub author_name: String,
  pub title: String,
  pub body: String,
  /// 1 through 5 inclusive.
  pub rating: u8,
  pub created_at: DateTime<Utc>,
}

// ============================================================================
// Filtering and sorting
// ============================================================================

/// Filter selection exposed to the presentation layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerfumeFilter {
  pub brand: Option<String>,
  pub concentration: Option<String>,
  pub longevity: Option<String>,
  pub sillage: Option<String>,
  pub notes: Vec<String>,
  pub occasions: Vec<String>,
  pub min_rating: Option<f64>,
  pub max_rating: Option<f64>,
}

impl PerfumeFilter {
  pub fn is_empty(&self) -> bool {
    self.active_count() == 0
  }

  /// Number of active selections; each note and occasion counts on its own.
  pub fn active_count(&self) -> usize {
    let scalars = [
      &self.brand,
      &self.concentration,
      &self.longevity,
      &self.sillage,
    ]
    .iter()
    .filter(|v| v.is_some())
    .count();
    let range = usize::from(self.min_rating.is_some() || self.max_rating.is_some());
    scalars + self.notes.len() + self.occasions.len() + range
  }

  /// Deterministic key: fields in fixed order, list components sorted.
  pub fn cache_key(&self) -> String {
    fn sorted(list: &[String]) -> String {
      let mut v: Vec<&str> = list.iter().map(String::as_str).collect();
      v.sort_unstable();
      v.join(",")
    }
    fn bound(v: Option<f64>) -> String {
      v.map(|x| x.to_string()).unwrap_or_default()
    }

    format!(
      "brand={}|concentration={}|longevity={}|sillage={}|notes={}|occasions={}|min={}|max={}",
      self.brand.as_deref().unwrap_or(""),
      self.concentration.as_deref().unwrap_or(""),
      self.longevity.as_deref().unwrap_or(""),
      self.sillage.as_deref().unwrap_or(""),
      sorted(&self.notes),
      sorted(&self.occasions),
      bound(self.min_rating),
      bound(self.max_rating),
    )
  }

  /// SHA-256 of `cache_key` combined with a search text, hex encoded.
  pub fn cache_hash(&self, search: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.cache_key().as_bytes());
    hasher.update(b"|search=");
    hasher.update(search.trim().to_lowercase().as_bytes());
    hex::encode(hasher.finalize())
  }

  /// True when some predicate can only be evaluated after fetching.
  pub fn has_client_side_predicates(&self) -> bool {
    !self.notes.is_empty()
      || !self.occasions.is_empty()
      || self.min_rating.is_some()
      || self.max_rating.is_some()
  }

  /// Evaluate the predicates the remote query language cannot express.
  ///
  /// Note and occasion lists match when any selected value is present
  /// (case-insensitive); the rating range is inclusive on both ends.
  pub fn matches_client_side(&self, item: &CatalogItem) -> bool {
    if !self.notes.is_empty() {
      let wanted: Vec<String> = self.notes.iter().map(|n| n.to_lowercase()).collect();
      let hit = item
        .all_note_names()
        .any(|name| wanted.contains(&name.to_lowercase()));
      if !hit {
        return false;
      }
    }

    if !self.occasions.is_empty() {
      let wanted: Vec<String> = self.occasions.iter().map(|o| o.to_lowercase()).collect();
      let hit = item
        .occasions
        .iter()
        .any(|tag| wanted.contains(&tag.to_lowercase()));
      if !hit {
        return false;
      }
    }

    if let Some(min) = self.min_rating {
      if item.performance < min {
        return false;
      }
    }
    if let Some(max) = self.max_rating {
      if item.performance > max {
        return false;
      }
    }

    true
  }
}

/// Column a listing is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortColumn {
  Name,
  Performance,
  CreatedAt,
}

impl SortColumn {
  /// Column name, identical locally and remotely.
  pub fn column(self) -> &'static str {
    match self {
      SortColumn::Name => "name",
      SortColumn::Performance => "performance_score",
      SortColumn::CreatedAt => "created_at",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOption {
  #[default]
  NameAsc,
  NameDesc,
  RatingDesc,
  RatingAsc,
  Newest,
  Popular,
}

impl SortOption {
  /// The (column, ascending) pair each option maps to.
  pub fn order(self) -> (SortColumn, bool) {
    match self {
      SortOption::NameAsc => (SortColumn::Name, true),
      SortOption::NameDesc => (SortColumn::Name, false),
      SortOption::RatingDesc => (SortColumn::Performance, false),
      SortOption::RatingAsc => (SortColumn::Performance, true),
      SortOption::Newest => (SortColumn::CreatedAt, false),
      SortOption::Popular => (SortColumn::Performance, false),
    }
  }
}

impl FromStr for SortOption {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().replace(['-', '_'], "").as_str() {
      "nameasc" | "name" => Ok(SortOption::NameAsc),
      "namedesc" => Ok(SortOption::NameDesc),
      "ratingdesc" | "rating" => Ok(SortOption::RatingDesc),
      "ratingasc" => Ok(SortOption::RatingAsc),
      "newest" => Ok(SortOption::Newest),
      "popular" => Ok(SortOption::Popular),
      other => Err(format!("unknown sort option '{}'", other)),
    }
  }
}

/// Columns with a facet lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Facet {
  Brand,
  Concentration,
}

impl FromStr for Facet {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "brand" | "brands" => Ok(Facet::Brand),
      "concentration" | "concentrations" => Ok(Facet::Concentration),
      other => Err(format!("unknown facet '{}'", other)),
    }
  }
}
