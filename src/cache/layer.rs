//! Read cache that serves stale data immediately and refreshes it behind
//! the caller.

use chrono::Duration;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::types::{CacheEntry, CacheResult, CacheStats, Freshness};
use crate::api::FetchError;
use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::store::{self, DurableStore, NS_CACHE};

/// Storage key for a read key. SHA256 keeps keys stable and fixed-length.
fn storage_key(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  hex::encode(hasher.finalize())
}

struct Slot {
  entry: CacheEntry,
  last_access: u64,
}

#[derive(Default)]
struct CacheState {
  entries: HashMap<String, Slot>,
  /// Keys with a background refresh in flight, and that refresh's token.
  /// Anything that rewrites or drops a key removes it here, which voids
  /// the refresh.
  refreshing: HashMap<String, u64>,
  generation: u64,
  access_tick: u64,
}

impl CacheState {
  /// Void any refresh in flight for `key`.
  fn supersede(&mut self, key: &str) {
    self.refreshing.remove(key);
  }

  fn tick(&mut self) -> u64 {
    self.access_tick += 1;
    self.access_tick
  }
}

#[derive(Default)]
struct Counters {
  fresh_hits: AtomicU64,
  stale_hits: AtomicU64,
  misses: AtomicU64,
  refreshes: AtomicU64,
  refresh_failures: AtomicU64,
  discarded_refreshes: AtomicU64,
  evictions: AtomicU64,
}

/// Staleness-aware read cache.
pub struct ReadCache {
  store: Arc<dyn DurableStore>,
  clock: Arc<dyn Clock>,
  state: Mutex<CacheState>,
  counters: Counters,
  default_ttl: Duration,
  max_entries: Option<usize>,
  in_flight: watch::Sender<usize>,
}

impl ReadCache {
  /// Load every persisted entry and build the cache.
  pub fn open(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Result<Self> {
    let entries: Vec<CacheEntry> = store::load_all(store.as_ref(), NS_CACHE)?;

    let mut state = CacheState::default();
    for entry in entries {
      let tick = state.tick();
      state.entries.insert(
        entry.key.clone(),
        Slot {
          entry,
          last_access: tick,
        },
      );
    }
    debug!(entries = state.entries.len(), "loaded read cache");

    let (in_flight, _) = watch::channel(0);
    Ok(Self {
      store,
      clock,
      state: Mutex::new(state),
      counters: Counters::default(),
      default_ttl: Duration::minutes(5),
      max_entries: None,
      in_flight,
    })
  }

  /// TTL used by `write` for keys that have no entry yet.
  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  /// Cap the number of entries; least recently read entries go first.
  pub fn with_max_entries(mut self, max_entries: Option<usize>) -> Self {
    self.max_entries = max_entries;
    self
  }

  fn lock(&self) -> Result<MutexGuard<'_, CacheState>> {
    self
      .state
      .lock()
      .map_err(|e| SyncError::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }

  /// Read with stale-while-revalidate semantics.
  ///
  /// 1. Fresh hit: return immediately
  /// 2. Stale hit: return immediately, refresh once in the background
  /// 3. Absent: await `fetcher`, store and return its value
  ///
  /// Only the absent path surfaces fetch or storage errors.
  pub async fn read<F, Fut>(
    self: &Arc<Self>,
    key: &str,
    ttl: Duration,
    fetcher: F,
  ) -> Result<CacheResult>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<Value, FetchError>> + Send + 'static,
  {
    let hit = {
      let mut state = self.lock()?;
      let now = self.clock.now();
      let tick = state.tick();
      match state.entries.get_mut(key) {
        Some(slot) => {
          slot.last_access = tick;
          let freshness = slot.entry.freshness_with(now, ttl);
          Some((slot.entry.clone(), freshness))
        }
        None => None,
      }
    };

    match hit {
      Some((entry, Freshness::Fresh)) => {
        self.counters.fresh_hits.fetch_add(1, Ordering::Relaxed);
        Ok(CacheResult::from_cache(&entry, false))
      }
      Some((entry, _)) => {
        self.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
        self.schedule_refresh(key, ttl, fetcher);
        Ok(CacheResult::from_cache(&entry, true))
      }
      None => {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let value = fetcher().await.map_err(|e| SyncError::Fetch {
          key: key.to_string(),
          reason: e.0,
        })?;
        let entry = self.insert(key, value, ttl)?;
        Ok(CacheResult::from_network(&entry))
      }
    }
  }

  /// Spawn a refresh unless one is already in flight for `key`.
  fn schedule_refresh<F, Fut>(self: &Arc<Self>, key: &str, ttl: Duration, fetcher: F)
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<Value, FetchError>> + Send + 'static,
  {
    let token = {
      let Ok(mut state) = self.lock() else {
        return;
      };
      if state.refreshing.contains_key(key) {
        return;
      }
      state.generation += 1;
      let token = state.generation;
      state.refreshing.insert(key.to_string(), token);
      token
    };

    self.counters.refreshes.fetch_add(1, Ordering::Relaxed);
    self.in_flight.send_modify(|n| *n += 1);

    let cache = Arc::clone(self);
    let key = key.to_string();
    tokio::spawn(async move {
      let result = fetcher().await;
      cache.finish_refresh(&key, ttl, token, result);
      cache.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    });
  }

  fn finish_refresh(
    &self,
    key: &str,
    ttl: Duration,
    token: u64,
    result: std::result::Result<Value, FetchError>,
  ) {
    let Ok(mut state) = self.lock() else {
      return;
    };
    let current = state.refreshing.get(key) == Some(&token);
    if current {
      state.refreshing.remove(key);
    }

    let value = match result {
      Ok(value) => value,
      Err(e) => {
        self.counters.refresh_failures.fetch_add(1, Ordering::Relaxed);
        debug!(key, error = %e, "background refresh failed, keeping stale entry");
        return;
      }
    };

    if !current {
      self
        .counters
        .discarded_refreshes
        .fetch_add(1, Ordering::Relaxed);
      debug!(key, "key changed during refresh, discarding result");
      return;
    }

    let entry = CacheEntry {
      key: key.to_string(),
      value,
      fetched_at: self.clock.now(),
      ttl_ms: ttl.num_milliseconds(),
    };
    if let Err(e) = store::put_json(self.store.as_ref(), NS_CACHE, &storage_key(key), &entry) {
      warn!(key, error = %e, "could not persist refreshed entry");
      return;
    }
    let tick = state.tick();
    state.entries.insert(
      key.to_string(),
      Slot {
        entry,
        last_access: tick,
      },
    );
  }

  /// Persist and install an entry, superseding any in-flight refresh.
  fn insert(&self, key: &str, value: Value, ttl: Duration) -> Result<CacheEntry> {
    let entry = CacheEntry {
      key: key.to_string(),
      value,
      fetched_at: self.clock.now(),
      ttl_ms: ttl.num_milliseconds(),
    };

    let mut state = self.lock()?;
    store::put_json(self.store.as_ref(), NS_CACHE, &storage_key(key), &entry)?;
    state.supersede(key);
    let tick = state.tick();
    state.entries.insert(
      key.to_string(),
      Slot {
        entry: entry.clone(),
        last_access: tick,
      },
    );
    self.evict_over_capacity(&mut state, key);
    Ok(entry)
  }

  fn evict_over_capacity(&self, state: &mut CacheState, keep: &str) {
    let Some(max) = self.max_entries else {
      return;
    };
    while state.entries.len() > max {
      let victim = state
        .entries
        .iter()
        .filter(|(k, _)| k.as_str() != keep)
        .min_by_key(|(_, slot)| slot.last_access)
        .map(|(k, _)| k.clone());
      let Some(victim) = victim else {
        break;
      };
      if let Err(e) = self.store.delete(NS_CACHE, &storage_key(&victim)) {
        warn!(key = %victim, error = %e, "could not evict entry");
        break;
      }
      state.entries.remove(&victim);
      state.supersede(&victim);
      self.counters.evictions.fetch_add(1, Ordering::Relaxed);
      debug!(key = %victim, "evicted least recently read entry");
    }
  }

  /// Store a value the caller already knows is current.
  pub fn write(&self, key: &str, value: Value) -> Result<()> {
    let ttl = self
      .peek(key)
      .map(|e| e.ttl())
      .unwrap_or(self.default_ttl);
    self.insert(key, value, ttl)?;
    Ok(())
  }

  /// Drop an entry. A refresh already in flight for it is discarded.
  pub fn invalidate(&self, key: &str) -> Result<()> {
    let mut state = self.lock()?;
    self.store.delete(NS_CACHE, &storage_key(key))?;
    state.entries.remove(key);
    state.supersede(key);
    debug!(key, "invalidated");
    Ok(())
  }

  /// Drop every entry.
  pub fn clear(&self) -> Result<()> {
    let mut state = self.lock()?;
    self.store.clear_namespace(NS_CACHE)?;
    state.entries.clear();
    state.refreshing.clear();
    Ok(())
  }

  /// Delete entries that have been stale for longer than `grace`.
  pub fn sweep(&self, grace: Duration) -> Result<usize> {
    let now = self.clock.now();
    let mut state = self.lock()?;
    let expired: Vec<String> = state
      .entries
      .values()
      .filter(|slot| slot.entry.age(now) > slot.entry.ttl() + grace)
      .map(|slot| slot.entry.key.clone())
      .collect();

    for key in &expired {
      self.store.delete(NS_CACHE, &storage_key(key))?;
      state.entries.remove(key);
      state.supersede(key);
    }
    if !expired.is_empty() {
      debug!(count = expired.len(), "swept expired cache entries");
    }
    Ok(expired.len())
  }

  /// Current entry for a key, without counting as a read.
  pub fn peek(&self, key: &str) -> Option<CacheEntry> {
    self
      .lock()
      .ok()?
      .entries
      .get(key)
      .map(|slot| slot.entry.clone())
  }

  /// Freshness of a key against its stored TTL.
  pub fn freshness(&self, key: &str) -> Freshness {
    let now = self.clock.now();
    self
      .peek(key)
      .map(|e| e.freshness(now))
      .unwrap_or(Freshness::Absent)
  }

  pub fn len(&self) -> usize {
    self.lock().map(|s| s.entries.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn refreshes_in_flight(&self) -> usize {
    *self.in_flight.borrow()
  }

  /// Wait until no background refresh is running.
  pub async fn wait_for_refreshes(&self) {
    let mut rx = self.in_flight.subscribe();
    let _ = rx.wait_for(|n| *n == 0).await;
  }

  pub fn stats(&self) -> CacheStats {
    CacheStats {
      fresh_hits: self.counters.fresh_hits.load(Ordering::Relaxed),
      stale_hits: self.counters.stale_hits.load(Ordering::Relaxed),
      misses: self.counters.misses.load(Ordering::Relaxed),
      refreshes: self.counters.refreshes.load(Ordering::Relaxed),
      refresh_failures: self.counters.refresh_failures.load(Ordering::Relaxed),
      discarded_refreshes: self.counters.discarded_refreshes.load(Ordering::Relaxed),
      evictions: self.counters.evictions.load(Ordering::Relaxed),
      entries: self.len(),
    }
  }
}
