//! Serde types matching the REST rows.
//!
//! Kept apart from the domain types so wire quirks (embedded relations,
//! nullable lists, unknown enum strings) stay at the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Brand, CatalogItem, Note, NoteRole, RemoteStatus, Review, UserStatus};

// ============================================================================
// Catalog rows
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiBrand {
  pub name: String,
  pub country: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiNote {
  pub name: String,
  pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiPerfumeNote {
  pub role: String,
  #[serde(default)]
  pub position: Option<i64>,
  pub note: Option<ApiNote>,
}

#[derive(Debug, Deserialize)]
pub struct ApiPerfume {
  pub id: String,
  pub name: String,
  pub concentration: Option<String>,
  pub longevity: Option<String>,
  pub sillage: Option<String>,
  #[serde(default)]
  pub performance_score: Option<f64>,
  pub description: Option<String>,
  pub image_url: Option<String>,
  #[serde(default)]
  pub occasions: Option<Vec<String>>,
  pub created_at: DateTime<Utc>,
  pub brand: Option<ApiBrand>,
  #[serde(default)]
  pub perfume_notes: Vec<ApiPerfumeNote>,
}

/// Single-column rows used by facet lookups.
#[derive(Debug, Deserialize)]
pub struct ApiNameRow {
  pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiConcentrationRow {
  pub concentration: Option<String>,
}

// ============================================================================
// User status rows
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiUserPerfume {
  pub perfume_id: String,
  pub status: String,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ApiPerfumeIdRow {
  pub perfume_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiStatusRow {
  pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ApiUserPerfumeUpsert<'a> {
  pub user_id: &'a str,
  pub perfume_id: &'a str,
  pub status: &'a str,
  pub created_at: DateTime<Utc>,
}

// ============================================================================
// Reviews
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiReview {
  pub id: String,
  pub perfume_id: String,
  pub user_id: Option<String>,
  #[serde(default)]
  pub author_name: String,
  #[serde(default)]
  pub title: String,
  #[serde(default)]
  pub body: String,
  pub rating: i64,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ApiReviewWrite<'a> {
  pub id: &'a str,
  pub perfume_id: &'a str,
  pub user_id: Option<&'a str>,
  pub author_name: &'a str,
  pub title: &'a str,
  pub body: &'a str,
  pub rating: u8,
  pub created_at: DateTime<Utc>,
}

// ============================================================================
// Conversions to domain types
// ============================================================================

impl ApiPerfume {
  /// Convert, dropping rows the local store would refuse (empty name).
  pub fn into_item(self) -> Option<CatalogItem> {
    if self.name.trim().is_empty() {
      tracing::warn!(target: "scentshelf::remote", item_id = %self.id, "Ignoring catalog row without a name");
      return None;
    }

    let mut item = CatalogItem {
      id: self.id,
      name: self.name,
      brand: self.brand.map(|b| Brand {
        name: b.name,
        country: b.country,
      }),
      concentration: self.concentration,
      longevity: self.longevity,
      sillage: self.sillage,
      performance: self.performance_score.unwrap_or_default(),
      description: self.description,
      image_url: self.image_url,
      occasions: self.occasions.unwrap_or_default(),
      top_notes: Vec::new(),
      mid_notes: Vec::new(),
      base_notes: Vec::new(),
      created_at: self.created_at,
    };

    let mut links = self.perfume_notes;
    links.sort_by_key(|link| link.position.unwrap_or(i64::MAX));
    for link in links {
      let (Some(role), Some(note)) = (NoteRole::parse(&link.role), link.note) else {
        tracing::debug!(target: "scentshelf::remote", item_id = %item.id, role = %link.role, "Skipping unusable note link");
        continue;
      };
      item.notes_mut(role).push(Note {
        name: note.name,
        category: note.category,
      });
    }

    Some(item)
  }
}

impl ApiUserPerfume {
  /// Convert, dropping rows whose status is outside the known encoding.
  pub fn into_remote_status(self) -> Option<RemoteStatus> {
    match self.status.parse::<UserStatus>() {
      Ok(UserStatus::None) => None,
      Ok(status) => Some(RemoteStatus {
        item_id: self.perfume_id,
        status,
        created_at: self.created_at,
      }),
      Err(e) => {
        tracing::warn!(target: "scentshelf::remote", item_id = %self.perfume_id, error = %e, "Ignoring remote status row");
        None
      }
    }
  }
}

impl ApiReview {
  pub fn into_review(self) -> Review {
    Review {
      id: self.id,
      item_id: self.perfume_id,
      author_id: self.user_id,
      author_name: self.author_name,
      title: self.title,
      body: self.body,
      rating: self.rating.clamp(1, 5) as u8,
      created_at: self.created_at,
    }
  }
}
