//! Prediction-driven prefetching.
//!
//! Every read key is recorded as a transition from the previously read key.
//! After each read the most likely next keys, by observed transition count,
//! are pulled into the read cache in the background. Ties go to the
//! transition seen most recently, so a newly popular path is not shadowed by
//! older volume. Prefetch failures are logged and otherwise ignored.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::api::ReadApi;
use crate::cache::{Freshness, ReadCache};
use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::store::{self, DurableStore, NS_NAVIGATION};

const HISTORY_KEY: &str = "history";

/// One observed move from one read key to the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationEvent {
  pub from: String,
  pub to: String,
  pub at: DateTime<Utc>,
}

/// A candidate next key.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
  pub key: String,
  pub count: usize,
  /// count(from→key) / count(from→*)
  pub probability: f64,
}

/// Aggregated transition counts.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionPattern {
  pub from: String,
  pub to: String,
  pub count: usize,
  /// Share of this transition among all transitions out of `from`
  pub probability: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NavigationAnalytics {
  pub total_transitions: usize,
  /// Most frequent first
  pub patterns: Vec<TransitionPattern>,
  /// Most visited destination keys, at most ten
  pub frequent_keys: Vec<(String, usize)>,
}

/// Bounded sliding window of transitions with count-based prediction.
#[derive(Debug, Clone)]
pub struct TransitionModel {
  history: VecDeque<NavigationEvent>,
  capacity: usize,
}

impl TransitionModel {
  pub fn new(capacity: usize) -> Self {
    Self {
      history: VecDeque::with_capacity(capacity),
      capacity: capacity.max(1),
    }
  }

  /// Rebuild from persisted events, keeping only the newest `capacity`.
  pub fn from_events(events: Vec<NavigationEvent>, capacity: usize) -> Self {
    let mut model = Self::new(capacity);
    for event in events {
      model.push(event);
    }
    model
  }

  fn push(&mut self, event: NavigationEvent) {
    self.history.push_back(event);
    while self.history.len() > self.capacity {
      self.history.pop_front();
    }
  }

  pub fn record(&mut self, from: &str, to: &str, at: DateTime<Utc>) {
    self.push(NavigationEvent {
      from: from.to_string(),
      to: to.to_string(),
      at,
    });
  }

  pub fn len(&self) -> usize {
    self.history.len()
  }

  pub fn is_empty(&self) -> bool {
    self.history.is_empty()
  }

  pub fn events(&self) -> Vec<NavigationEvent> {
    self.history.iter().cloned().collect()
  }

  pub fn clear(&mut self) {
    self.history.clear();
  }

  /// Top `top_n` next keys after `from`.
  pub fn predict(&self, from: &str, top_n: usize) -> Vec<Prediction> {
    // key -> (count, position of most recent observation)
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    let mut total = 0;
    for (pos, event) in self.history.iter().enumerate() {
      if event.from != from {
        continue;
      }
      total += 1;
      let slot = counts.entry(event.to.as_str()).or_insert((0, pos));
      slot.0 += 1;
      slot.1 = pos;
    }
    if total == 0 {
      return Vec::new();
    }

    let mut ranked: Vec<(&str, usize, usize)> = counts
      .into_iter()
      .map(|(key, (count, last_seen))| (key, count, last_seen))
      .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)));

    ranked
      .into_iter()
      .take(top_n)
      .map(|(key, count, _)| Prediction {
        key: key.to_string(),
        count,
        probability: count as f64 / total as f64,
      })
      .collect()
  }

  pub fn analytics(&self) -> NavigationAnalytics {
    let mut pairs: HashMap<(&str, &str), usize> = HashMap::new();
    let mut outgoing: HashMap<&str, usize> = HashMap::new();
    let mut destinations: HashMap<&str, usize> = HashMap::new();
    for event in &self.history {
      *pairs
        .entry((event.from.as_str(), event.to.as_str()))
        .or_default() += 1;
      *outgoing.entry(event.from.as_str()).or_default() += 1;
      *destinations.entry(event.to.as_str()).or_default() += 1;
    }

    let mut patterns: Vec<TransitionPattern> = pairs
      .into_iter()
      .map(|((from, to), count)| TransitionPattern {
        from: from.to_string(),
        to: to.to_string(),
        count,
        probability: count as f64 / outgoing[from] as f64,
      })
      .collect();
    patterns.sort_by(|a, b| {
      b.count
        .cmp(&a.count)
        .then_with(|| a.from.cmp(&b.from))
        .then_with(|| a.to.cmp(&b.to))
    });

    let mut frequent_keys: Vec<(String, usize)> = destinations
      .into_iter()
      .map(|(key, count)| (key.to_string(), count))
      .collect();
    frequent_keys.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    frequent_keys.truncate(10);

    NavigationAnalytics {
      total_transitions: self.history.len(),
      patterns,
      frequent_keys,
    }
  }
}

/// Prefetcher settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchOptions {
  pub enabled: bool,
  /// How many predicted keys to prefetch after each read
  pub top_n: usize,
  /// Transitions kept in the sliding window
  pub history_size: usize,
  /// TTL used for prefetched entries
  pub ttl: Duration,
}

impl Default for PrefetchOptions {
  fn default() -> Self {
    Self {
      enabled: true,
      top_n: 3,
      history_size: 100,
      ttl: Duration::minutes(5),
    }
  }
}

struct PrefetchState {
  model: TransitionModel,
  last_key: Option<String>,
}

/// Learns read-key sequences and warms the cache ahead of need.
pub struct Prefetcher {
  cache: Arc<ReadCache>,
  api: Arc<dyn ReadApi>,
  store: Arc<dyn DurableStore>,
  clock: Arc<dyn Clock>,
  options: PrefetchOptions,
  state: Arc<Mutex<PrefetchState>>,
  /// A history write is queued and has not snapshotted the model yet
  persist_pending: Arc<AtomicBool>,
  /// Held across snapshot and write so writes land in model order
  persist_lock: Arc<Mutex<()>>,
  in_flight: Arc<watch::Sender<usize>>,
}

impl Prefetcher {
  pub fn open(
    cache: Arc<ReadCache>,
    api: Arc<dyn ReadApi>,
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    options: PrefetchOptions,
  ) -> Result<Self> {
    let events: Vec<NavigationEvent> =
      store::get_json(store.as_ref(), NS_NAVIGATION, HISTORY_KEY)?.unwrap_or_default();
    let model = TransitionModel::from_events(events, options.history_size);
    debug!(transitions = model.len(), "loaded navigation history");

    let (in_flight, _) = watch::channel(0);
    Ok(Self {
      cache,
      api,
      store,
      clock,
      options,
      state: Arc::new(Mutex::new(PrefetchState {
        model,
        last_key: None,
      })),
      persist_pending: Arc::new(AtomicBool::new(false)),
      persist_lock: Arc::new(Mutex::new(())),
      in_flight: Arc::new(in_flight),
    })
  }

  /// Record a read of `key` and prefetch its likely successors.
  ///
  /// Returns the keys a prefetch was started for. Never waits on the network
  /// or the disk; the updated history is written on a blocking thread.
  pub fn on_read(&self, key: &str) -> Vec<String> {
    let (recorded, predictions) = {
      let Ok(mut state) = self.state.lock() else {
        return Vec::new();
      };
      let mut recorded = false;
      if let Some(previous) = state.last_key.take() {
        if previous != key {
          let now = self.clock.now();
          state.model.record(&previous, key, now);
          recorded = true;
        }
      }
      state.last_key = Some(key.to_string());

      let predictions = if self.options.enabled {
        state.model.predict(key, self.options.top_n)
      } else {
        Vec::new()
      };
      (recorded, predictions)
    };

    if recorded {
      self.schedule_persist();
    }

    let mut started = Vec::new();
    for prediction in predictions {
      if prediction.key == key || self.cache.freshness(&prediction.key) == Freshness::Fresh {
        continue;
      }
      self.spawn_prefetch(prediction.key.clone());
      started.push(prediction.key);
    }
    if !started.is_empty() {
      debug!(from = key, next = ?started, "prefetching");
    }
    started
  }

  fn spawn_prefetch(&self, key: String) {
    let cache = Arc::clone(&self.cache);
    let api = Arc::clone(&self.api);
    let ttl = self.options.ttl;
    let in_flight = Arc::clone(&self.in_flight);

    in_flight.send_modify(|n| *n += 1);
    tokio::spawn(async move {
      let fetch_key = key.clone();
      let result = cache
        .read(&key, ttl, move || async move { api.fetch(&fetch_key).await })
        .await;
      if let Err(e) = result {
        debug!(key = %key, error = %e, "prefetch failed");
      }
      in_flight.send_modify(|n| *n = n.saturating_sub(1));
    });
  }

  /// Queue a history write unless one is already waiting.
  fn schedule_persist(&self) {
    if self.persist_pending.swap(true, Ordering::AcqRel) {
      return;
    }

    let state = Arc::clone(&self.state);
    let store = Arc::clone(&self.store);
    let pending = Arc::clone(&self.persist_pending);
    let lock = Arc::clone(&self.persist_lock);
    let in_flight = Arc::clone(&self.in_flight);

    in_flight.send_modify(|n| *n += 1);
    tokio::task::spawn_blocking(move || {
      {
        let _guard = lock.lock();
        pending.store(false, Ordering::Release);
        if let Err(e) = write_history(store.as_ref(), &state) {
          warn!(error = %e, "could not persist navigation history");
        }
      }
      in_flight.send_modify(|n| *n = n.saturating_sub(1));
    });
  }

  /// Write the current history to the store now.
  pub fn flush(&self) -> Result<()> {
    let _guard = self.persist_lock.lock();
    write_history(self.store.as_ref(), &self.state)
  }

  pub fn predict(&self, from: &str, top_n: usize) -> Vec<Prediction> {
    self
      .state
      .lock()
      .map(|s| s.model.predict(from, top_n))
      .unwrap_or_default()
  }

  pub fn analytics(&self) -> NavigationAnalytics {
    self
      .state
      .lock()
      .map(|s| s.model.analytics())
      .unwrap_or_default()
  }

  /// Forget every recorded transition.
  pub fn reset_history(&self) -> Result<()> {
    let _guard = self.persist_lock.lock();
    if let Ok(mut state) = self.state.lock() {
      state.model.clear();
      state.last_key = None;
    }
    self.store.delete(NS_NAVIGATION, HISTORY_KEY)
  }

  /// Wait until every started prefetch and queued history write has finished.
  pub async fn wait_idle(&self) {
    let mut rx = self.in_flight.subscribe();
    let _ = rx.wait_for(|n| *n == 0).await;
  }
}

fn write_history(store: &dyn DurableStore, state: &Mutex<PrefetchState>) -> Result<()> {
  let events = state
    .lock()
    .map_err(|e| SyncError::StorageUnavailable(format!("Lock poisoned: {}", e)))?
    .model
    .events();
  store::put_json(store, NS_NAVIGATION, HISTORY_KEY, &events)
}
