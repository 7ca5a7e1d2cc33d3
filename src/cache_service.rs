//! Cache policy over the local store.
//!
//! Decides staleness and writes remote pages into the store. Reads never
//! reach the network; the list orchestrator decides when to fetch.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use std::sync::Arc;

use crate::clock::Clock;
use crate::model::{CatalogItem, SortOption};
use crate::store::LocalStore;

/// Default age, in minutes, after which the catalog cache is refreshed.
pub const DEFAULT_STALE_MINUTES: i64 = 5;

/// Indicates where a displayed page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, considered stale but network fetch failed
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
}

pub struct CacheService {
  store: Arc<LocalStore>,
  clock: Arc<dyn Clock>,
  stale_time: Duration,
}

impl CacheService {
  pub fn new(store: Arc<LocalStore>, clock: Arc<dyn Clock>) -> Self {
    Self {
      store,
      clock,
      stale_time: Duration::minutes(DEFAULT_STALE_MINUTES),
    }
  }

  /// Set the stale time for the catalog cache.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn store(&self) -> &Arc<LocalStore> {
    &self.store
  }

  pub fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
    self.store.last_sync()
  }

  /// True if the catalog was never cached or the last cache is older than the stale time.
  pub fn needs_refresh(&self) -> Result<bool> {
    Ok(match self.store.last_sync()? {
      Some(at) => self.clock.now() - at > self.stale_time,
      None => true,
    })
  }

  /// Upsert a fully fetched remote page and stamp the sync time.
  ///
  /// Items and timestamp commit together; on error neither is written, so
  /// the next access retries.
  pub fn cache_page(&self, items: &[CatalogItem]) -> Result<()> {
    let now = self.clock.now();
    self.store.upsert_page(items, Some(now))?;
    tracing::debug!(target: "scentshelf::cache", items = items.len(), "Cached catalog page");
    Ok(())
  }

  pub fn load_page(&self, sort: SortOption, page: usize, page_size: usize) -> Result<Vec<CatalogItem>> {
    self.store.find_page(sort, page * page_size, page_size)
  }

  pub fn search_page(&self, text: &str, page: usize, page_size: usize) -> Result<Vec<CatalogItem>> {
    self.store.search_page(text, page * page_size, page_size)
  }
}
