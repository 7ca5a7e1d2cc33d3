//! In-memory remote sources for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{
  apply_client_filters, normalize_facets, CatalogQuery, RemoteCatalogSource, RemoteError,
  RemoteUserStatusSource,
};
use crate::model::{CatalogItem, Facet, PerfumeFilter, RemoteStatus, SortColumn, UserStatus};

/// Catalog held in memory; every call can be made to fail.
#[derive(Default)]
pub struct FakeCatalog {
  items: Mutex<Vec<CatalogItem>>,
  failure: Mutex<Option<RemoteError>>,
  pub fetch_calls: AtomicUsize,
  pub count_calls: AtomicUsize,
}

impl FakeCatalog {
  pub fn with_items(items: Vec<CatalogItem>) -> Self {
    Self {
      items: Mutex::new(items),
      ..Default::default()
    }
  }

  pub fn set_items(&self, items: Vec<CatalogItem>) {
    *self.items.lock().unwrap() = items;
  }

  pub fn fail_with(&self, error: Option<RemoteError>) {
    *self.failure.lock().unwrap() = error;
  }

  fn check(&self) -> Result<(), RemoteError> {
    match self.failure.lock().unwrap().clone() {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }

  fn server_matches(item: &CatalogItem, search: Option<&str>, filter: &PerfumeFilter) -> bool {
    let contains = |value: &Option<String>, wanted: &str| {
      value
        .as_deref()
        .map(|v| v.to_lowercase().contains(&wanted.to_lowercase()))
        .unwrap_or(false)
    };
    search.map_or(true, |s| {
      item.name.to_lowercase().contains(&s.to_lowercase())
    }) && filter.brand.as_deref().map_or(true, |b| {
      item.brand.as_ref().map(|x| x.name.as_str()) == Some(b)
    }) && filter
      .concentration
      .as_deref()
      .map_or(true, |c| item.concentration.as_deref() == Some(c))
      && filter
        .longevity
        .as_deref()
        .map_or(true, |l| contains(&item.longevity, l))
      && filter
        .sillage
        .as_deref()
        .map_or(true, |s| contains(&item.sillage, s))
  }

  fn matching(&self, search: Option<&str>, filter: &PerfumeFilter) -> Vec<CatalogItem> {
    self
      .items
      .lock()
      .unwrap()
      .iter()
      .filter(|item| Self::server_matches(item, search, filter))
      .cloned()
      .collect()
  }
}

#[async_trait]
impl RemoteCatalogSource for FakeCatalog {
  async fn total_count(
    &self,
    search: Option<&str>,
    filter: &PerfumeFilter,
  ) -> Result<usize, RemoteError> {
    self.count_calls.fetch_add(1, Ordering::SeqCst);
    self.check()?;
    Ok(apply_client_filters(self.matching(search, filter), filter).len())
  }

  async fn fetch_page(&self, query: &CatalogQuery) -> Result<Vec<CatalogItem>, RemoteError> {
    self.fetch_calls.fetch_add(1, Ordering::SeqCst);
    self.check()?;

    let mut items = self.matching(query.search_text(), &query.filter);
    let (column, ascending) = query.sort.order();
    items.sort_by(|a, b| {
      let ord = match column {
        SortColumn::Name => a.name.cmp(&b.name),
        SortColumn::Performance => a.performance.total_cmp(&b.performance),
        SortColumn::CreatedAt => a.created_at.cmp(&b.created_at),
      };
      let ord = if ascending { ord } else { ord.reverse() };
      ord.then_with(|| a.id.cmp(&b.id))
    });

    let (from, to) = query.range();
    let page: Vec<CatalogItem> = items.into_iter().skip(from).take(to + 1 - from).collect();
    Ok(apply_client_filters(page, &query.filter))
  }

  async fn list_facet_values(&self, facet: Facet) -> Result<Vec<String>, RemoteError> {
    self.check()?;
    let items = self.items.lock().unwrap();
    Ok(match facet {
      Facet::Brand => normalize_facets(items.iter().map(|i| i.brand.as_ref().map(|b| b.name.clone()))),
      Facet::Concentration => normalize_facets(items.iter().map(|i| i.concentration.clone())),
    })
  }
}

/// Recorded call against `FakeStatusRemote`.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusCall {
  Upsert(String, UserStatus),
  Delete(String),
}

/// Status records held in memory, with scripted failures.
#[derive(Default)]
pub struct FakeStatusRemote {
  records: Mutex<HashMap<(String, String), (UserStatus, DateTime<Utc>)>>,
  /// Errors returned by the next write calls, in order.
  scripted: Mutex<VecDeque<RemoteError>>,
  /// Items whose writes always fail with the given error.
  failing_items: Mutex<HashMap<String, RemoteError>>,
  list_failure: Mutex<Option<RemoteError>>,
  pub calls: Mutex<Vec<StatusCall>>,
  pub attempts: AtomicUsize,
}

impl FakeStatusRemote {
  pub fn insert(&self, user_id: &str, item_id: &str, status: UserStatus) {
    self.records.lock().unwrap().insert(
      (user_id.to_string(), item_id.to_string()),
      (status, Utc::now()),
    );
  }

  pub fn get(&self, user_id: &str, item_id: &str) -> Option<UserStatus> {
    self
      .records
      .lock()
      .unwrap()
      .get(&(user_id.to_string(), item_id.to_string()))
      .map(|(s, _)| *s)
  }

  pub fn script_failures(&self, errors: impl IntoIterator<Item = RemoteError>) {
    self.scripted.lock().unwrap().extend(errors);
  }

  pub fn fail_item(&self, item_id: &str, error: RemoteError) {
    self
      .failing_items
      .lock()
      .unwrap()
      .insert(item_id.to_string(), error);
  }

  pub fn fail_listing(&self, error: Option<RemoteError>) {
    *self.list_failure.lock().unwrap() = error;
  }

  pub fn successful_calls(&self) -> Vec<StatusCall> {
    self.calls.lock().unwrap().clone()
  }

  fn check_write(&self, item_id: &str) -> Result<(), RemoteError> {
    self.attempts.fetch_add(1, Ordering::SeqCst);
    if let Some(e) = self.scripted.lock().unwrap().pop_front() {
      return Err(e);
    }
    if let Some(e) = self.failing_items.lock().unwrap().get(item_id) {
      return Err(e.clone());
    }
    Ok(())
  }

  fn check_list(&self) -> Result<(), RemoteError> {
    match self.list_failure.lock().unwrap().clone() {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }
}

#[async_trait]
impl RemoteUserStatusSource for FakeStatusRemote {
  async fn upsert(
    &self,
    user_id: &str,
    item_id: &str,
    status: UserStatus,
    created_at: DateTime<Utc>,
  ) -> Result<(), RemoteError> {
    if status.is_none() {
      return Err(RemoteError::Unknown("none must be deleted".into()));
    }
    self.check_write(item_id)?;
    self.records.lock().unwrap().insert(
      (user_id.to_string(), item_id.to_string()),
      (status, created_at),
    );
    self
      .calls
      .lock()
      .unwrap()
      .push(StatusCall::Upsert(item_id.to_string(), status));
    Ok(())
  }

  async fn delete(&self, user_id: &str, item_id: &str) -> Result<(), RemoteError> {
    self.check_write(item_id)?;
    self
      .records
      .lock()
      .unwrap()
      .remove(&(user_id.to_string(), item_id.to_string()));
    self
      .calls
      .lock()
      .unwrap()
      .push(StatusCall::Delete(item_id.to_string()));
    Ok(())
  }

  async fn list_by_status(
    &self,
    user_id: &str,
    status: UserStatus,
  ) -> Result<HashSet<String>, RemoteError> {
    self.check_list()?;
    Ok(
      self
        .records
        .lock()
        .unwrap()
        .iter()
        .filter(|((user, _), (s, _))| user == user_id && *s == status)
        .map(|((_, item), _)| item.clone())
        .collect(),
    )
  }

  async fn list_all(&self, user_id: &str) -> Result<Vec<RemoteStatus>, RemoteError> {
    self.check_list()?;
    Ok(
      self
        .records
        .lock()
        .unwrap()
        .iter()
        .filter(|((user, _), _)| user == user_id)
        .map(|((_, item), (status, created_at))| RemoteStatus {
          item_id: item.clone(),
          status: *status,
          created_at: *created_at,
        })
        .collect(),
    )
  }

  async fn get_status(
    &self,
    user_id: &str,
    item_id: &str,
  ) -> Result<Option<UserStatus>, RemoteError> {
    self.check_list()?;
    Ok(self.get(user_id, item_id))
  }
}
