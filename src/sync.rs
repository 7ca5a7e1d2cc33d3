//! Reconciliation of local user statuses with the remote status source.
//!
//! A pass always uploads pending local changes first and downloads second.
//! The download never touches a record that is still pending, so a change
//! the server has not acknowledged is never lost.

use color_eyre::Result;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthContext;
use crate::clock::Clock;
use crate::model::{RemoteStatus, StatusRecord, UserStatus};
use crate::remote::{RemoteError, RemoteUserStatusSource};
use crate::retry::RetryPolicy;
use crate::store::LocalStore;

/// Minimum time between a toggle and its upload.
pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_millis(500);

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
  pub uploaded: usize,
  /// (item id, error message) of uploads that stayed pending.
  pub upload_failures: Vec<(String, String)>,
  pub downloaded: usize,
  pub skipped_pending: usize,
}

impl SyncReport {
  pub fn is_clean(&self) -> bool {
    self.upload_failures.is_empty()
  }
}

/// The upload currently responsible for an item's pending value.
struct Upload {
  generation: u64,
  token: CancellationToken,
  /// None when a sync pass runs the upload inline.
  handle: Option<JoinHandle<()>>,
}

type Inflight = Arc<Mutex<HashMap<String, Upload>>>;

/// Removes its `inflight` entry on drop, unless a newer upload replaced it.
struct Claim {
  inflight: Inflight,
  item_id: String,
  generation: u64,
}

impl Drop for Claim {
  fn drop(&mut self) {
    let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
    if inflight
      .get(&self.item_id)
      .map_or(false, |u| u.generation == self.generation)
    {
      inflight.remove(&self.item_id);
    }
  }
}

/// Per-item locks held around a remote write, so two writes of one item
/// never overlap and reach the server out of order.
#[derive(Clone, Default)]
struct WriteGates(Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>);

impl WriteGates {
  fn for_item(&self, item_id: &str) -> Arc<AsyncMutex<()>> {
    let mut gates = self.0.lock().unwrap_or_else(PoisonError::into_inner);
    gates.entry(item_id.to_string()).or_default().clone()
  }
}

pub struct SyncService {
  store: Arc<LocalStore>,
  remote: Arc<dyn RemoteUserStatusSource>,
  auth: Arc<dyn AuthContext>,
  clock: Arc<dyn Clock>,
  retry: RetryPolicy,
  commit_interval: Duration,
  inflight: Inflight,
  gates: WriteGates,
  generation: AtomicU64,
}

/// Push one record to the remote, as a delete when its status is `none`.
async fn upload_record(
  remote: &dyn RemoteUserStatusSource,
  retry: &RetryPolicy,
  record: &StatusRecord,
) -> Result<(), RemoteError> {
  let user_id = record.user_id.as_str();
  let item_id = record.item_id.as_str();
  let status = record.status;
  let created_at = record.created_at;

  if status.is_none() {
    retry
      .run("status_delete", || async move {
        remote.delete(user_id, item_id).await
      })
      .await
  } else {
    retry
      .run("status_upsert", || async move {
        remote.upsert(user_id, item_id, status, created_at).await
      })
      .await
  }
}

impl SyncService {
  pub fn new(
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteUserStatusSource>,
    auth: Arc<dyn AuthContext>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      store,
      remote,
      auth,
      clock,
      retry: RetryPolicy::default(),
      commit_interval: DEFAULT_COMMIT_INTERVAL,
      inflight: Arc::new(Mutex::new(HashMap::new())),
      gates: WriteGates::default(),
      generation: AtomicU64::new(0),
    }
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_commit_interval(mut self, interval: Duration) -> Self {
    self.commit_interval = interval;
    self
  }

  /// Run a full upload-then-download pass for the signed-in user.
  pub async fn sync_all(&self) -> Result<SyncReport> {
    let user_id = self.auth.current_user_id()?;
    let mut report = SyncReport::default();

    // Phase 1: upload
    for record in self.store.pending_statuses(&user_id)? {
      let item_id = record.item_id;
      let Some((_claim, token)) = self.claim_for_sync(&item_id)? else {
        tracing::debug!(target: "scentshelf::sync", item_id = %item_id, "Upload already scheduled by a toggle");
        continue;
      };

      let _write = tokio::select! {
        _ = token.cancelled() => continue,
        guard = self.gates.for_item(&item_id).lock_owned() => guard,
      };
      // Re-read under the gate; the value may have moved on since the listing
      let current = match self.store.status(&user_id, &item_id)? {
        Some(current) if current.pending => current,
        _ => continue,
      };

      let result = tokio::select! {
        _ = token.cancelled() => {
          tracing::debug!(target: "scentshelf::sync", item_id = %item_id, "Upload superseded by a toggle");
          continue;
        }
        result = upload_record(self.remote.as_ref(), &self.retry, &current) => result,
      };

      match result {
        Ok(()) => match self.store.confirm_upload(&user_id, &item_id, current.status) {
          Ok(true) => report.uploaded += 1,
          Ok(false) => {
            tracing::debug!(target: "scentshelf::sync", item_id = %item_id, "Uploaded value superseded, still pending")
          }
          Err(e) => {
            tracing::error!(target: "scentshelf::sync", item_id = %item_id, error = %e, "Failed to record upload");
            report.upload_failures.push((item_id, e.to_string()));
          }
        },
        Err(e) => {
          tracing::warn!(target: "scentshelf::sync", item_id = %item_id, error = %e, "Upload failed, keeping local change pending");
          report.upload_failures.push((item_id, e.to_string()));
        }
      }
    }

    // Phase 2: download
    let remote = self
      .retry
      .run("status_list", || self.remote.list_all(&user_id))
      .await?;
    let remote: HashMap<String, RemoteStatus> = remote
      .into_iter()
      .map(|r| (r.item_id.clone(), r))
      .collect();
    let local = self.store.statuses_for_user(&user_id)?;

    for item_id in self.store.item_ids()? {
      let current = local.get(&item_id);
      if current.map_or(false, |r| r.pending) {
        report.skipped_pending += 1;
        continue;
      }
      // Absence remotely never clears a local status
      let Some(theirs) = remote.get(&item_id) else {
        continue;
      };
      if current.map(|r| r.status) == Some(theirs.status) {
        continue;
      }
      if self.store.apply_remote_status(&user_id, theirs)? {
        report.downloaded += 1;
      } else {
        // A toggle landed between the snapshot and the write
        report.skipped_pending += 1;
      }
    }

    tracing::info!(
      target: "scentshelf::sync",
      uploaded = report.uploaded,
      failed = report.upload_failures.len(),
      downloaded = report.downloaded,
      skipped = report.skipped_pending,
      "Sync pass finished"
    );
    Ok(report)
  }

  /// Register a sync-pass upload of `item_id`, unless a toggle already owns it.
  fn claim_for_sync(&self, item_id: &str) -> Result<Option<(Claim, CancellationToken)>> {
    let mut inflight = self
      .inflight
      .lock()
      .map_err(|e| color_eyre::eyre::eyre!("Lock poisoned: {}", e))?;
    if inflight.contains_key(item_id) {
      return Ok(None);
    }

    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let token = CancellationToken::new();
    inflight.insert(
      item_id.to_string(),
      Upload {
        generation,
        token: token.clone(),
        handle: None,
      },
    );
    let claim = Claim {
      inflight: self.inflight.clone(),
      item_id: item_id.to_string(),
      generation,
    };
    Ok(Some((claim, token)))
  }

  /// Record a user's status change locally and schedule its upload.
  ///
  /// A newer toggle on the same item cancels the scheduled upload of the
  /// previous one, or the upload a sync pass is running for it. The upload
  /// waits for the commit interval first.
  pub fn toggle_status(&self, item_id: &str, status: UserStatus) -> Result<StatusRecord> {
    let user_id = self.auth.current_user_id()?;
    let record = self
      .store
      .set_local_status(&user_id, item_id, status, self.clock.now())?;

    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let token = CancellationToken::new();
    let mut inflight = self
      .inflight
      .lock()
      .map_err(|e| color_eyre::eyre::eyre!("Lock poisoned: {}", e))?;

    if let Some(previous) = inflight.remove(item_id) {
      tracing::debug!(target: "scentshelf::sync", item_id, "Superseding scheduled upload");
      previous.token.cancel();
      if let Some(handle) = previous.handle {
        handle.abort();
      }
    }

    let handle = tokio::spawn(commit_upload(
      CommitContext {
        store: self.store.clone(),
        remote: self.remote.clone(),
        retry: self.retry,
        delay: self.commit_interval,
        gates: self.gates.clone(),
        _claim: Claim {
          inflight: self.inflight.clone(),
          item_id: item_id.to_string(),
          generation,
        },
      },
      record.clone(),
      token.clone(),
    ));
    inflight.insert(
      item_id.to_string(),
      Upload {
        generation,
        token,
        handle: Some(handle),
      },
    );

    Ok(record)
  }

  /// Wait for every scheduled upload to finish.
  pub async fn flush(&self) {
    let handles: Vec<JoinHandle<()>> = match self.inflight.lock() {
      Ok(mut inflight) => inflight
        .drain()
        .filter_map(|(_, upload)| upload.handle)
        .collect(),
      Err(_) => return,
    };
    join_all(handles).await;
  }

  /// Remote item ids the signed-in user has in one status.
  pub async fn shelf(&self, status: UserStatus) -> Result<HashSet<String>> {
    let user_id = self.auth.current_user_id()?;
    let ids = self
      .retry
      .run("status_shelf", || self.remote.list_by_status(&user_id, status))
      .await?;
    Ok(ids)
  }

  /// Status of one item as the remote store has it.
  pub async fn remote_status(&self, item_id: &str) -> Result<Option<UserStatus>> {
    let user_id = self.auth.current_user_id()?;
    let status = self
      .retry
      .run("status_get", || self.remote.get_status(&user_id, item_id))
      .await?;
    Ok(status)
  }

  /// Run a pass every time the session goes from signed out to signed in.
  pub fn watch_auth(self: Arc<Self>, mut rx: watch::Receiver<Option<String>>) -> JoinHandle<()> {
    // Read before spawning so a sign-in that lands first still counts as a change
    let mut signed_in = rx.borrow_and_update().is_some();
    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let now_signed_in = rx.borrow_and_update().is_some();
        if now_signed_in && !signed_in {
          match self.sync_all().await {
            Ok(report) => {
              tracing::info!(target: "scentshelf::sync", uploaded = report.uploaded, "Synced after sign-in")
            }
            Err(e) => tracing::warn!(target: "scentshelf::sync", error = %e, "Sync after sign-in failed"),
          }
        }
        signed_in = now_signed_in;
      }
    })
  }
}

struct CommitContext {
  store: Arc<LocalStore>,
  remote: Arc<dyn RemoteUserStatusSource>,
  retry: RetryPolicy,
  delay: Duration,
  gates: WriteGates,
  _claim: Claim,
}

async fn commit_upload(ctx: CommitContext, record: StatusRecord, token: CancellationToken) {
  tokio::select! {
    _ = token.cancelled() => return,
    _ = tokio::time::sleep(ctx.delay) => {}
  }

  let _write = tokio::select! {
    _ = token.cancelled() => return,
    guard = ctx.gates.for_item(&record.item_id).lock_owned() => guard,
  };

  let result = tokio::select! {
    _ = token.cancelled() => return,
    result = upload_record(ctx.remote.as_ref(), &ctx.retry, &record) => result,
  };

  match result {
    Ok(()) if !token.is_cancelled() => {
      if let Err(e) = ctx
        .store
        .confirm_upload(&record.user_id, &record.item_id, record.status)
      {
        tracing::error!(target: "scentshelf::sync", item_id = %record.item_id, error = %e, "Failed to record upload");
      }
    }
    Ok(()) => {}
    Err(e) => {
      tracing::warn!(target: "scentshelf::sync", item_id = %record.item_id, error = %e, "Status upload failed, left pending");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::auth::Session;
  use crate::clock::SystemClock;
  use crate::model::fixtures::item;
  use crate::remote::fake::{FakeStatusRemote, StatusCall};
  use chrono::Utc;

  const USER: &str = "u1";

  struct Harness {
    store: Arc<LocalStore>,
    remote: Arc<FakeStatusRemote>,
    session: Arc<Session>,
    sync: Arc<SyncService>,
  }

  fn harness() -> Harness {
    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    store
      .upsert_page(
        &[
          item("a", "Alpha", None, 1),
          item("b", "Beta", None, 2),
          item("c", "Gamma", None, 3),
        ],
        None,
      )
      .unwrap();
    let remote = Arc::new(FakeStatusRemote::default());
    let session = Arc::new(Session::new(Some(USER.to_string())));
    let sync = Arc::new(SyncService::new(
      store.clone(),
      remote.clone(),
      session.clone(),
      Arc::new(SystemClock),
    ));
    Harness {
      store,
      remote,
      session,
      sync,
    }
  }

  fn local(h: &Harness, item_id: &str) -> Option<StatusRecord> {
    h.store.status(USER, item_id).unwrap()
  }

  fn confirmed(h: &Harness, item_id: &str, status: UserStatus) {
    h.store
      .apply_remote_status(
        USER,
        &RemoteStatus {
          item_id: item_id.to_string(),
          status,
          created_at: Utc::now(),
        },
      )
      .unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn test_pending_local_change_wins() {
    let h = harness();
    h.store
      .set_local_status(USER, "a", UserStatus::Owned, Utc::now())
      .unwrap();
    h.remote.insert(USER, "a", UserStatus::Consumed);
    h.remote.fail_item("a", RemoteError::Timeout);

    let report = h.sync.sync_all().await.unwrap();

    let record = local(&h, "a").unwrap();
    assert_eq!(record.status, UserStatus::Owned);
    assert!(record.pending);
    assert_eq!(report.upload_failures.len(), 1);
    assert_eq!(report.skipped_pending, 1);
    // Three attempts for a timeout
    assert_eq!(h.remote.attempts.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_upload_clears_pending() {
    let h = harness();
    h.store
      .set_local_status(USER, "a", UserStatus::Wishlist, Utc::now())
      .unwrap();
    h.remote.insert(USER, "a", UserStatus::Owned);

    let report = h.sync.sync_all().await.unwrap();

    assert_eq!(report.uploaded, 1);
    assert_eq!(h.remote.get(USER, "a"), Some(UserStatus::Wishlist));
    let record = local(&h, "a").unwrap();
    assert_eq!(record.status, UserStatus::Wishlist);
    assert!(!record.pending);
  }

  #[tokio::test]
  async fn test_pending_none_deletes_remote() {
    let h = harness();
    confirmed(&h, "b", UserStatus::Owned);
    h.remote.insert(USER, "b", UserStatus::Owned);
    h.store
      .set_local_status(USER, "b", UserStatus::None, Utc::now())
      .unwrap();

    h.sync.sync_all().await.unwrap();

    assert_eq!(h.remote.get(USER, "b"), None);
    assert!(local(&h, "b").is_none());
    assert_eq!(
      h.remote.successful_calls(),
      vec![StatusCall::Delete("b".into())]
    );
  }

  #[tokio::test]
  async fn test_download_overwrites_confirmed_and_keeps_absent() {
    let h = harness();
    confirmed(&h, "a", UserStatus::Owned);
    confirmed(&h, "b", UserStatus::Wishlist);
    h.remote.insert(USER, "a", UserStatus::Consumed);
    h.remote.insert(USER, "c", UserStatus::Owned);
    // Remote-only record for an item never cached
    h.remote.insert(USER, "zzz", UserStatus::Owned);

    let report = h.sync.sync_all().await.unwrap();

    assert_eq!(local(&h, "a").unwrap().status, UserStatus::Consumed);
    assert_eq!(local(&h, "b").unwrap().status, UserStatus::Wishlist);
    assert_eq!(local(&h, "c").unwrap().status, UserStatus::Owned);
    assert!(h.store.status(USER, "zzz").unwrap().is_none());
    assert_eq!(report.downloaded, 2);
  }

  #[tokio::test]
  async fn test_single_failure_does_not_abort_batch() {
    let h = harness();
    h.store
      .set_local_status(USER, "a", UserStatus::Owned, Utc::now())
      .unwrap();
    h.store
      .set_local_status(USER, "b", UserStatus::Consumed, Utc::now())
      .unwrap();
    h.remote.fail_item("a", RemoteError::NoConnection);

    let report = h.sync.sync_all().await.unwrap();

    assert_eq!(report.uploaded, 1);
    assert_eq!(report.upload_failures[0].0, "a");
    assert!(local(&h, "a").unwrap().pending);
    assert!(!local(&h, "b").unwrap().pending);
    // No connection is not retried
    assert_eq!(h.remote.attempts.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_upload_recovers() {
    let h = harness();
    h.store
      .set_local_status(USER, "c", UserStatus::Owned, Utc::now())
      .unwrap();
    h.remote
      .script_failures([RemoteError::Timeout, RemoteError::ServerError(503)]);

    let report = h.sync.sync_all().await.unwrap();

    assert_eq!(report.uploaded, 1);
    assert_eq!(h.remote.attempts.load(Ordering::SeqCst), 3);
    assert!(!local(&h, "c").unwrap().pending);
  }

  #[tokio::test]
  async fn test_listing_failure_after_upload() {
    let h = harness();
    h.store
      .set_local_status(USER, "a", UserStatus::Owned, Utc::now())
      .unwrap();
    h.remote.fail_listing(Some(RemoteError::ServerError(401)));

    assert!(h.sync.sync_all().await.is_err());
    // The upload phase already ran
    assert!(!local(&h, "a").unwrap().pending);
  }

  #[tokio::test]
  async fn test_requires_signed_in_user() {
    let h = harness();
    h.session.sign_out();
    assert!(h.sync.sync_all().await.is_err());
    assert!(h.sync.toggle_status("a", UserStatus::Owned).is_err());
  }

  #[tokio::test(start_paused = true)]
  async fn test_rapid_toggle_uploads_once() {
    let h = harness();

    h.sync.toggle_status("a", UserStatus::Owned).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.sync.toggle_status("a", UserStatus::Wishlist).unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    h.sync.flush().await;

    assert_eq!(
      h.remote.successful_calls(),
      vec![StatusCall::Upsert("a".into(), UserStatus::Wishlist)]
    );
    assert_eq!(h.remote.attempts.load(Ordering::SeqCst), 1);
    let record = local(&h, "a").unwrap();
    assert_eq!(record.status, UserStatus::Wishlist);
    assert!(!record.pending);
  }

  #[tokio::test(start_paused = true)]
  async fn test_toggle_waits_for_commit_interval() {
    let h = harness();
    h.sync.toggle_status("b", UserStatus::Consumed).unwrap();

    assert!(local(&h, "b").unwrap().pending);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(h.remote.successful_calls().is_empty());

    tokio::time::sleep(Duration::from_millis(200)).await;
    h.sync.flush().await;
    assert_eq!(h.remote.successful_calls().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_sign_in_triggers_sync() {
    let h = harness();
    h.session.sign_out();
    let watcher = h.sync.clone().watch_auth(h.session.subscribe());

    h.store
      .set_local_status(USER, "c", UserStatus::Owned, Utc::now())
      .unwrap();
    h.session.sign_in(USER);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.remote.get(USER, "c"), Some(UserStatus::Owned));
    assert!(!local(&h, "c").unwrap().pending);
    watcher.abort();
  }

  #[tokio::test(start_paused = true)]
  async fn test_toggle_during_sync_upload_wins() {
    let h = harness();
    h.store
      .set_local_status(USER, "a", UserStatus::Owned, Utc::now())
      .unwrap();
    // The pass's first attempt times out and waits to retry
    h.remote.script_failures([RemoteError::Timeout]);

    let pass = tokio::spawn({
      let sync = h.sync.clone();
      async move { sync.sync_all().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.sync.toggle_status("a", UserStatus::Wishlist).unwrap();

    let report = pass.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    h.sync.flush().await;

    assert_eq!(report.uploaded, 0);
    assert!(report.upload_failures.is_empty());
    assert_eq!(
      h.remote.successful_calls(),
      vec![StatusCall::Upsert("a".into(), UserStatus::Wishlist)]
    );
    assert_eq!(h.remote.get(USER, "a"), Some(UserStatus::Wishlist));
    let record = local(&h, "a").unwrap();
    assert_eq!(record.status, UserStatus::Wishlist);
    assert!(!record.pending);
  }

  #[tokio::test(start_paused = true)]
  async fn test_sync_leaves_scheduled_toggle_alone() {
    let h = harness();
    h.sync.toggle_status("b", UserStatus::Owned).unwrap();

    let report = h.sync.sync_all().await.unwrap();
    assert_eq!(report.uploaded, 0);
    assert!(h.remote.successful_calls().is_empty());
    assert!(local(&h, "b").unwrap().pending);

    tokio::time::sleep(Duration::from_secs(1)).await;
    h.sync.flush().await;
    assert_eq!(
      h.remote.successful_calls(),
      vec![StatusCall::Upsert("b".into(), UserStatus::Owned)]
    );
    assert!(!local(&h, "b").unwrap().pending);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_toggle_on_uncached_item_is_retried_by_sync() {
    let h = harness();
    h.remote.script_failures([RemoteError::NoConnection]);
    h.sync.toggle_status("search-hit", UserStatus::Owned).unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    h.sync.flush().await;
    assert!(local(&h, "search-hit").unwrap().pending);
    assert_eq!(h.remote.get(USER, "search-hit"), None);

    let report = h.sync.sync_all().await.unwrap();
    assert_eq!(report.uploaded, 1);
    assert_eq!(h.remote.get(USER, "search-hit"), Some(UserStatus::Owned));
    assert!(!local(&h, "search-hit").unwrap().pending);
  }

  #[tokio::test]
  async fn test_shelf_and_remote_status() {
    let h = harness();
    h.remote.insert(USER, "a", UserStatus::Wishlist);
    h.remote.insert(USER, "b", UserStatus::Wishlist);
    h.remote.insert(USER, "c", UserStatus::Owned);

    let shelf = h.sync.shelf(UserStatus::Wishlist).await.unwrap();
    assert_eq!(shelf, HashSet::from(["a".to_string(), "b".to_string()]));
    assert_eq!(
      h.sync.remote_status("c").await.unwrap(),
      Some(UserStatus::Owned)
    );
    assert_eq!(h.sync.remote_status("zzz").await.unwrap(), None);
  }
}
