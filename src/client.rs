//! Caller-facing facade that wires the components together.

use chrono::Duration;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::api::{FetchError, ReadApi, WriteApi};
use crate::cache::{CacheResult, CacheStats, ReadCache};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, Reachability, Subscription};
use crate::error::Result;
use crate::prefetch::{NavigationAnalytics, Prefetcher};
use crate::queue::{DeadLetter, PendingAction, PendingActionQueue};
use crate::store::{DurableStore, SqliteStore};
use crate::sync::{Submission, SyncEngine, SyncStatus};

/// Platform and remote collaborators the core depends on.
pub struct Collaborators {
  pub write_api: Arc<dyn WriteApi>,
  pub read_api: Arc<dyn ReadApi>,
  pub reachability: Arc<dyn Reachability>,
}

/// Offline-first client.
///
/// Construct once at startup, call [`OfflineClient::start`] inside the
/// runtime, and [`OfflineClient::shutdown`] on exit.
pub struct OfflineClient {
  store: Arc<dyn DurableStore>,
  monitor: Arc<ConnectivityMonitor>,
  engine: Arc<SyncEngine>,
  cache: Arc<ReadCache>,
  prefetcher: Arc<Prefetcher>,
  read_api: Arc<dyn ReadApi>,
  poll_interval: Option<std::time::Duration>,
  subscription: Mutex<Option<Subscription>>,
  poller: Mutex<Option<JoinHandle<()>>>,
}

impl OfflineClient {
  /// Open the configured SQLite store and build every component on it.
  pub fn open(config: &Config, collaborators: Collaborators) -> Result<Self> {
    let store = match &config.storage.path {
      Some(path) => SqliteStore::open_at(path)?,
      None => SqliteStore::open()?,
    };
    info!(path = %store.path().display(), "opened offline store");
    Self::with_store(Arc::new(store), Arc::new(SystemClock), config, collaborators)
  }

  /// Build on an explicit store and clock.
  pub fn with_store(
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    config: &Config,
    collaborators: Collaborators,
  ) -> Result<Self> {
    let queue = Arc::new(PendingActionQueue::open(store.clone(), clock.clone())?);
    let monitor = Arc::new(ConnectivityMonitor::new(collaborators.reachability));
    let engine = SyncEngine::new(
      queue,
      collaborators.write_api,
      monitor.clone(),
      clock.clone(),
      config.retry_policy(),
    );
    let cache = Arc::new(
      ReadCache::open(store.clone(), clock.clone())?
        .with_default_ttl(config.default_ttl())
        .with_max_entries(config.cache.max_entries),
    );
    let prefetcher = Arc::new(Prefetcher::open(
      cache.clone(),
      collaborators.read_api.clone(),
      store.clone(),
      clock,
      config.prefetch_options(),
    )?);

    let poll_interval = (config.sync.poll_interval_ms > 0)
      .then(|| std::time::Duration::from_millis(config.sync.poll_interval_ms));

    Ok(Self {
      store,
      monitor,
      engine,
      cache,
      prefetcher,
      read_api: collaborators.read_api,
      poll_interval,
      subscription: Mutex::new(None),
      poller: Mutex::new(None),
    })
  }

  /// Begin draining on reconnect, and polling reachability if configured.
  pub fn start(&self) {
    let subscription = self.engine.start();
    if let Ok(mut slot) = self.subscription.lock() {
      *slot = Some(subscription);
    }
    if let Some(interval) = self.poll_interval {
      let handle = self.monitor.spawn_poller(interval);
      if let Ok(mut slot) = self.poller.lock() {
        *slot = Some(handle);
      }
    }
  }

  /// Submit a write. `queued = false` means it was delivered synchronously.
  pub async fn submit_action(&self, kind: &str, payload: Value) -> Result<Submission> {
    self.engine.submit_action(kind, payload).await
  }

  /// Read through the cache with a caller-supplied fetcher.
  pub async fn read<F, Fut>(&self, key: &str, ttl: Duration, fetcher: F) -> Result<CacheResult>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<Value, FetchError>> + Send + 'static,
  {
    let result = self.cache.read(key, ttl, fetcher).await;
    self.prefetcher.on_read(key);
    result
  }

  /// Read through the cache using the configured read API.
  pub async fn read_key(&self, key: &str, ttl: Duration) -> Result<CacheResult> {
    let api = Arc::clone(&self.read_api);
    let fetch_key = key.to_string();
    self
      .read(key, ttl, move || async move { api.fetch(&fetch_key).await })
      .await
  }

  pub fn invalidate(&self, key: &str) -> Result<()> {
    self.cache.invalidate(key)
  }

  pub fn write(&self, key: &str, value: Value) -> Result<()> {
    self.cache.write(key, value)
  }

  pub fn pending_action_count(&self) -> usize {
    self.engine.pending_action_count()
  }

  pub fn dead_letter_count(&self) -> usize {
    self.engine.dead_letter_count()
  }

  pub fn pending_actions(&self) -> Vec<PendingAction> {
    self.engine.queue().all()
  }

  pub fn dead_letters(&self) -> Vec<DeadLetter> {
    self.engine.queue().dead_letters()
  }

  pub fn retry_dead_letters(&self) -> Result<usize> {
    self.engine.retry_dead_letters()
  }

  pub fn sync_status(&self) -> SyncStatus {
    self.engine.status()
  }

  pub fn watch_sync_status(&self) -> watch::Receiver<SyncStatus> {
    self.engine.watch_status()
  }

  pub fn cache_stats(&self) -> CacheStats {
    self.cache.stats()
  }

  pub fn navigation_analytics(&self) -> NavigationAnalytics {
    self.prefetcher.analytics()
  }

  pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
    &self.monitor
  }

  pub fn engine(&self) -> &Arc<SyncEngine> {
    &self.engine
  }

  pub fn cache(&self) -> &Arc<ReadCache> {
    &self.cache
  }

  pub fn prefetcher(&self) -> &Arc<Prefetcher> {
    &self.prefetcher
  }

  /// Stop background work, let running drains and prefetches finish, and
  /// flush navigation history and the store.
  pub async fn shutdown(&self) -> Result<()> {
    if let Ok(mut slot) = self.subscription.lock() {
      slot.take();
    }
    if let Ok(mut slot) = self.poller.lock() {
      if let Some(handle) = slot.take() {
        handle.abort();
      }
    }
    self.engine.stop();
    self.engine.wait_idle().await;
    self.prefetcher.wait_idle().await;
    self.prefetcher.flush()?;
    self.store.flush()?;
    info!(
      pending = self.pending_action_count(),
      dead_letters = self.dead_letter_count(),
      "offline client shut down"
    );
    Ok(())
  }
}
