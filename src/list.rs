//! Paginated, searchable catalog list built on the cache and the remote catalog.
//!
//! One `ListSession` per visible list. Reads go to the local store first and
//! the remote catalog is only consulted when the cache is stale, a refresh is
//! forced, or the list is filtered. Every search or filter change bumps a
//! generation counter; a load that finishes under an older generation is
//! dropped instead of overwriting newer results.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache_service::{CacheService, CacheSource};
use crate::connectivity::ConnectivityMonitor;
use crate::model::{CatalogItem, Facet, PerfumeFilter, SortOption};
use crate::remote::{CatalogQuery, RemoteCatalogSource, RemoteError};

/// Quiet period before a search text change triggers a reload.
pub const SEARCH_DEBOUNCE: Duration = Duration::from_millis(300);

pub const DEFAULT_PAGE_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListPhase {
  #[default]
  Idle,
  Loading,
  Ready,
  LoadingMore,
  Refreshing,
}

/// User-visible failure of a list load.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ListError {
  #[error("No internet connection and nothing cached yet")]
  Offline,
  #[error("{0}")]
  Remote(#[from] RemoteError),
  #[error("Could not read the local catalog: {0}")]
  Storage(String),
}

impl ListError {
  /// Network classification of the failure, if it was a network failure.
  pub fn classification(&self) -> Option<RemoteError> {
    match self {
      ListError::Offline => Some(RemoteError::NoConnection),
      ListError::Remote(e) => Some(e.clone()),
      ListError::Storage(_) => None,
    }
  }
}

/// What the presentation layer renders.
#[derive(Debug, Clone, Default)]
pub struct ListSnapshot {
  pub phase: ListPhase,
  pub items: Vec<CatalogItem>,
  pub has_more: bool,
  pub error: Option<ListError>,
  pub total_count: Option<usize>,
  pub source: Option<CacheSource>,
  pub search_text: String,
  pub filter: PerfumeFilter,
  pub sort: SortOption,
}

#[derive(Default)]
struct ListState {
  view: ListSnapshot,
  next_page: usize,
  generation: u64,
}

impl ListState {
  fn query(&self, page: usize, page_size: usize) -> CatalogQuery {
    CatalogQuery {
      page,
      page_size,
      search: Some(self.view.search_text.clone()).filter(|s| !s.trim().is_empty()),
      filter: self.view.filter.clone(),
      sort: self.view.sort,
    }
  }
}

/// Browsing the unfiltered catalog is the only listing written to the cache.
fn is_browsing(query: &CatalogQuery) -> bool {
  query.search_text().is_none() && query.filter.is_empty()
}

struct SearchTask {
  token: CancellationToken,
  handle: JoinHandle<()>,
}

struct Inner {
  cache: Arc<CacheService>,
  remote: Arc<dyn RemoteCatalogSource>,
  connectivity: Arc<ConnectivityMonitor>,
  page_size: usize,
  debounce: Duration,
  state: Mutex<ListState>,
  search_task: Mutex<Option<SearchTask>>,
  total_counts: Mutex<HashMap<String, usize>>,
  facets: Mutex<HashMap<Facet, Vec<String>>>,
}

/// Controller of one catalog list.
#[derive(Clone)]
pub struct ListSession {
  inner: Arc<Inner>,
}

impl ListSession {
  pub fn new(
    cache: Arc<CacheService>,
    remote: Arc<dyn RemoteCatalogSource>,
    connectivity: Arc<ConnectivityMonitor>,
    page_size: usize,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        cache,
        remote,
        connectivity,
        page_size: page_size.max(1),
        debounce: SEARCH_DEBOUNCE,
        state: Mutex::new(ListState::default()),
        search_task: Mutex::new(None),
        total_counts: Mutex::new(HashMap::new()),
        facets: Mutex::new(HashMap::new()),
      }),
    }
  }

  /// Set filter and sort without loading; used before the first `load_data`.
  pub fn with_view(self, filter: PerfumeFilter, sort: SortOption) -> Self {
    if let Ok(mut state) = self.inner.state.lock() {
      state.view.filter = filter;
      state.view.sort = sort;
      state.generation += 1;
    }
    self
  }

  pub fn snapshot(&self) -> ListSnapshot {
    self
      .inner
      .state()
      .map(|s| s.view.clone())
      .unwrap_or_default()
  }

  /// Load the first page: local first, remote when stale or forced.
  ///
  /// Network failures end up in the snapshot; storage failures are returned.
  pub async fn load_data(&self, force: bool) -> Result<ListSnapshot> {
    self.inner.clone().load_first_page(force).await?;
    Ok(self.snapshot())
  }

  /// Pull-to-refresh.
  pub async fn refresh(&self) -> Result<ListSnapshot> {
    self.load_data(true).await
  }

  /// Retry after a surfaced error.
  pub async fn retry(&self) -> Result<ListSnapshot> {
    self.load_data(false).await
  }

  /// Load the next page when `item_id` is the last item shown.
  ///
  /// Returns whether a page load ran.
  pub async fn load_more_if_needed(&self, item_id: &str) -> Result<bool> {
    self.inner.clone().load_next_page(item_id).await
  }

  /// Change the search text; the reload runs after the debounce period and
  /// cancels any reload started by an earlier keystroke.
  pub fn set_search_text(&self, text: impl Into<String>) -> Result<()> {
    let text = text.into();
    {
      let mut state = self.inner.state()?;
      if state.view.search_text == text {
        return Ok(());
      }
      state.view.search_text = text;
      state.generation += 1;
    }

    let token = CancellationToken::new();
    let mut slot = self
      .inner
      .search_task
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if let Some(previous) = slot.take() {
      previous.token.cancel();
    }

    let inner = self.inner.clone();
    let task_token = token.clone();
    let handle = tokio::spawn(async move {
      tokio::select! {
        _ = task_token.cancelled() => return,
        _ = tokio::time::sleep(inner.debounce) => {}
      }
      tokio::select! {
        _ = task_token.cancelled() => {
          tracing::debug!(target: "scentshelf::list", "Search reload superseded");
        }
        result = inner.clone().load_first_page(false) => {
          if let Err(e) = result {
            tracing::error!(target: "scentshelf::list", error = %e, "Search reload failed");
          }
        }
      }
    });
    *slot = Some(SearchTask { token, handle });
    Ok(())
  }

  /// Wait for the pending debounced search, if any.
  pub async fn settle(&self) {
    let task = match self.inner.search_task.lock() {
      Ok(mut slot) => slot.take(),
      Err(_) => None,
    };
    if let Some(task) = task {
      let _ = task.handle.await;
    }
  }

  pub async fn set_filter(&self, filter: PerfumeFilter) -> Result<ListSnapshot> {
    {
      let mut state = self.inner.state()?;
      state.view.filter = filter;
      state.generation += 1;
    }
    self.load_data(false).await
  }

  pub async fn set_sort(&self, sort: SortOption) -> Result<ListSnapshot> {
    {
      let mut state = self.inner.state()?;
      state.view.sort = sort;
      state.generation += 1;
    }
    self.load_data(false).await
  }

  /// Facet values for filter pickers, remembered for the session.
  pub async fn facet_values(&self, facet: Facet) -> Result<Vec<String>, RemoteError> {
    if let Some(values) = self
      .inner
      .facets
      .lock()
      .ok()
      .and_then(|f| f.get(&facet).cloned())
    {
      return Ok(values);
    }
    if !self.inner.connectivity.is_connected() {
      return Err(RemoteError::NoConnection);
    }
    let values = self.inner.remote.list_facet_values(facet).await?;
    if let Ok(mut facets) = self.inner.facets.lock() {
      facets.insert(facet, values.clone());
    }
    Ok(values)
  }
}

impl Inner {
  fn state(&self) -> Result<MutexGuard<'_, ListState>> {
    self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Apply `f` unless a newer generation has started. Returns whether it applied.
  fn apply(&self, generation: u64, f: impl FnOnce(&mut ListState)) -> bool {
    match self.state.lock() {
      Ok(mut state) if state.generation == generation => {
        f(&mut state);
        true
      }
      Ok(_) => {
        tracing::debug!(target: "scentshelf::list", generation, "Discarding stale result");
        false
      }
      Err(_) => false,
    }
  }

  fn is_current(&self, generation: u64) -> bool {
    self
      .state
      .lock()
      .map(|s| s.generation == generation)
      .unwrap_or(false)
  }

  /// Local page for the query, or nothing when the query is filtered.
  fn read_local(&self, query: &CatalogQuery) -> Result<Vec<CatalogItem>> {
    if !query.filter.is_empty() {
      return Ok(Vec::new());
    }
    match query.search_text() {
      Some(text) => self.cache.search_page(text, query.page, query.page_size),
      None => self.cache.load_page(query.sort, query.page, query.page_size),
    }
  }

  /// Fetch a remote page and return what should be shown for it.
  ///
  /// Browsing pages are cached and re-read from the store; search and
  /// filter results are shown as fetched.
  async fn fetch_remote(
    &self,
    generation: u64,
    query: &CatalogQuery,
  ) -> Result<Option<Result<(Vec<CatalogItem>, usize), RemoteError>>> {
    let fetched = match self.remote.fetch_page(query).await {
      Ok(items) => items,
      Err(e) => return Ok(Some(Err(e))),
    };
    let fetched_len = fetched.len();

    // Checked before the storage write
    if !self.is_current(generation) {
      return Ok(None);
    }

    if is_browsing(query) {
      self.cache.cache_page(&fetched)?;
      let local = self.read_local(query)?;
      Ok(Some(Ok((local, fetched_len))))
    } else {
      Ok(Some(Ok((fetched, fetched_len))))
    }
  }

  fn fail_storage(&self, generation: u64, error: &color_eyre::Report) {
    tracing::error!(target: "scentshelf::list", error = %error, "Local catalog read failed");
    let message = error.to_string();
    self.apply(generation, |s| {
      s.view.phase = ListPhase::Ready;
      s.view.error = Some(ListError::Storage(message));
    });
  }

  async fn load_first_page(self: Arc<Self>, force: bool) -> Result<()> {
    let page_size = self.page_size;
    let (generation, query) = {
      let mut state = self.state()?;
      state.generation += 1;
      state.view.phase = if force && !state.view.items.is_empty() {
        ListPhase::Refreshing
      } else {
        ListPhase::Loading
      };
      state.view.error = None;
      (state.generation, state.query(0, page_size))
    };

    // 1. Local page
    let local = match self.read_local(&query) {
      Ok(items) => items,
      Err(e) => {
        self.fail_storage(generation, &e);
        return Err(e);
      }
    };
    let shown_local = !local.is_empty();
    if shown_local {
      let has_more = local.len() == page_size;
      self.apply(generation, |s| {
        s.view.items = local;
        s.view.has_more = has_more;
        s.next_page = 1;
      });
    }

    // 2. Offline: the local page is all there is
    if !self.connectivity.is_connected() {
      self.apply(generation, |s| {
        s.view.phase = ListPhase::Ready;
        if shown_local {
          s.view.source = Some(CacheSource::Offline);
        } else {
          s.view.items.clear();
          s.view.has_more = false;
          s.view.source = None;
          s.view.error = Some(ListError::Offline);
        }
      });
      return Ok(());
    }

    // 3. Fresh cache
    let stale = match self.cache.needs_refresh() {
      Ok(stale) => stale,
      Err(e) => {
        tracing::warn!(target: "scentshelf::list", error = %e, "Could not read cache age, treating as stale");
        true
      }
    };
    if shown_local && !force && !stale {
      self.apply(generation, |s| {
        s.view.phase = ListPhase::Ready;
        s.view.source = Some(CacheSource::CacheFresh);
      });
      return Ok(());
    }

    // 4. Remote
    self.spawn_total_count(generation, &query);
    if !self.is_current(generation) {
      return Ok(());
    }
    let outcome = match self.fetch_remote(generation, &query).await {
      Ok(outcome) => outcome,
      Err(e) => {
        self.fail_storage(generation, &e);
        return Err(e);
      }
    };

    match outcome {
      None => {}
      Some(Ok((items, fetched_len))) => {
        self.apply(generation, |s| {
          s.view.items = items;
          s.view.has_more = fetched_len == page_size;
          s.view.phase = ListPhase::Ready;
          s.view.source = Some(CacheSource::Network);
          s.view.error = None;
          s.next_page = 1;
        });
      }
      // 5. Offline tolerant when something is on screen
      Some(Err(e)) => {
        tracing::warn!(target: "scentshelf::list", error = %e, shown_local, "Catalog fetch failed");
        self.apply(generation, |s| {
          s.view.phase = ListPhase::Ready;
          if shown_local {
            s.view.source = Some(CacheSource::CacheStale);
          } else {
            s.view.items.clear();
            s.view.has_more = false;
            s.view.source = None;
            s.view.error = Some(ListError::Remote(e));
          }
        });
      }
    }
    Ok(())
  }

  async fn load_next_page(self: Arc<Self>, item_id: &str) -> Result<bool> {
    let page_size = self.page_size;
    let (generation, query) = {
      let mut state = self.state()?;
      let is_last = state.view.items.last().map(|i| i.id.as_str()) == Some(item_id);
      if state.view.phase != ListPhase::Ready || !state.view.has_more || !is_last {
        return Ok(false);
      }
      state.view.phase = ListPhase::LoadingMore;
      (state.generation, state.query(state.next_page, page_size))
    };

    let finish = |s: &mut ListState| s.view.phase = ListPhase::Ready;

    let local = match self.read_local(&query) {
      Ok(items) => items,
      Err(e) => {
        self.fail_storage(generation, &e);
        return Err(e);
      }
    };
    let connected = self.connectivity.is_connected();
    let stale = self.cache.needs_refresh().unwrap_or(true);

    if !local.is_empty() && (!connected || !stale) {
      let has_more = local.len() == page_size;
      self.apply(generation, |s| {
        s.view.items.extend(local);
        s.view.has_more = has_more;
        s.next_page += 1;
        finish(s);
      });
      return Ok(true);
    }

    if !connected {
      tracing::info!(target: "scentshelf::list", page = query.page, "Offline, no cached page to append");
      self.apply(generation, finish);
      return Ok(true);
    }

    let outcome = match self.fetch_remote(generation, &query).await {
      Ok(outcome) => outcome,
      Err(e) => {
        self.fail_storage(generation, &e);
        return Err(e);
      }
    };
    match outcome {
      None => {}
      Some(Ok((items, fetched_len))) => {
        self.apply(generation, |s| {
          s.view.items.extend(items);
          s.view.has_more = fetched_len == page_size;
          s.next_page += 1;
          finish(s);
        });
      }
      Some(Err(e)) => {
        // Earlier pages are on screen, so the failure is only logged
        tracing::warn!(target: "scentshelf::list", page = query.page, error = %e, "Next page fetch failed");
        let has_more = local.len() == page_size;
        self.apply(generation, |s| {
          if !local.is_empty() {
            s.view.items.extend(local);
            s.view.has_more = has_more;
            s.next_page += 1;
          }
          finish(s);
        });
      }
    }
    Ok(true)
  }

  /// Fetch the total count in the background; a remembered count is shown at once.
  fn spawn_total_count(self: &Arc<Self>, generation: u64, query: &CatalogQuery) {
    let search = query.search_text().map(str::to_string);
    let filter = query.filter.clone();
    let key = filter.cache_hash(search.as_deref().unwrap_or(""));

    let known = self
      .total_counts
      .lock()
      .ok()
      .and_then(|counts| counts.get(&key).copied());
    if let Some(total) = known {
      self.apply(generation, |s| s.view.total_count = Some(total));
    } else {
      self.apply(generation, |s| s.view.total_count = None);
    }

    let inner = self.clone();
    tokio::spawn(async move {
      match inner.remote.total_count(search.as_deref(), &filter).await {
        Ok(total) => {
          if let Ok(mut counts) = inner.total_counts.lock() {
            counts.insert(key, total);
          }
          inner.apply(generation, |s| s.view.total_count = Some(total));
        }
        Err(e) => {
          tracing::debug!(target: "scentshelf::list", error = %e, "Total count unavailable");
        }
      }
    });
  }
}
