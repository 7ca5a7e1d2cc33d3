//! Remote catalog and user-status sources.
//!
//! The services only see the two traits below; `PostgrestClient` is the
//! HTTP implementation used by the binary, tests substitute in-memory fakes.

mod api_types;
mod error;
#[cfg(test)]
pub(crate) mod fake;
mod postgrest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};

use crate::model::{CatalogItem, Facet, PerfumeFilter, RemoteStatus, SortOption, UserStatus};

pub use error::RemoteError;
pub use postgrest::PostgrestClient;

/// One page request against the remote catalog.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogQuery {
  pub page: usize,
  pub page_size: usize,
  pub search: Option<String>,
  pub filter: PerfumeFilter,
  pub sort: SortOption,
}

impl CatalogQuery {
  /// Inclusive row range `[from, to]` of this page.
  pub fn range(&self) -> (usize, usize) {
    let from = self.page * self.page_size;
    (from, from + self.page_size.max(1) - 1)
  }

  /// Search text if it has any non-whitespace content.
  pub fn search_text(&self) -> Option<&str> {
    self
      .search
      .as_deref()
      .map(str::trim)
      .filter(|s| !s.is_empty())
  }
}

/// Paginated, filterable read access to the remote catalog.
#[async_trait]
pub trait RemoteCatalogSource: Send + Sync {
  /// Number of rows matching the same predicate as `fetch_page`.
  async fn total_count(
    &self,
    search: Option<&str>,
    filter: &PerfumeFilter,
  ) -> Result<usize, RemoteError>;

  /// One page of items; client-side predicates are applied after the server page.
  async fn fetch_page(&self, query: &CatalogQuery) -> Result<Vec<CatalogItem>, RemoteError>;

  /// Distinct, sorted values of a filterable column.
  async fn list_facet_values(&self, facet: Facet) -> Result<Vec<String>, RemoteError>;
}

/// Per-user status records held by the remote store.
#[async_trait]
pub trait RemoteUserStatusSource: Send + Sync {
  /// Idempotent upsert keyed by (user, item). `UserStatus::None` is rejected; use `delete`.
  async fn upsert(
    &self,
    user_id: &str,
    item_id: &str,
    status: UserStatus,
    created_at: DateTime<Utc>,
  ) -> Result<(), RemoteError>;

  /// Remove the record. Deleting an absent record succeeds.
  async fn delete(&self, user_id: &str, item_id: &str) -> Result<(), RemoteError>;

  async fn list_by_status(
    &self,
    user_id: &str,
    status: UserStatus,
  ) -> Result<HashSet<String>, RemoteError>;

  async fn list_all(&self, user_id: &str) -> Result<Vec<RemoteStatus>, RemoteError>;

  async fn get_status(
    &self,
    user_id: &str,
    item_id: &str,
  ) -> Result<Option<UserStatus>, RemoteError>;
}

/// Drop items failing the predicates the server could not evaluate.
pub fn apply_client_filters(items: Vec<CatalogItem>, filter: &PerfumeFilter) -> Vec<CatalogItem> {
  if !filter.has_client_side_predicates() {
    return items;
  }
  items
    .into_iter()
    .filter(|item| filter.matches_client_side(item))
    .collect()
}

/// Deduplicate and sort facet values, discarding nulls and blanks.
pub fn normalize_facets(values: impl IntoIterator<Item = Option<String>>) -> Vec<String> {
  values
    .into_iter()
    .flatten()
    .map(|v| v.trim().to_string())
    .filter(|v| !v.is_empty())
    .collect::<BTreeSet<_>>()
    .into_iter()
    .collect()
}
