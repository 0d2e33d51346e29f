//! Persisted FIFO of write intents that have not been acknowledged yet.
//!
//! Each action is stored under a zero-padded sequence number so the store's
//! lexical key order matches enqueue order across restarts. Actions that
//! exhaust their attempts move to a separate dead-letter namespace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::store::{self, DurableStore, NS_DEAD_LETTER, NS_PENDING};

/// A write intent accepted by the core but not yet confirmed delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
  /// Unique id, also the idempotency key for the write API
  pub id: String,
  /// Insertion order, breaks ties between equal `enqueued_at` values
  pub seq: u64,
  /// Action type tag, e.g. "participate"
  pub kind: String,
  /// Opaque payload understood by the write API
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
  /// Delivery attempts so far
  pub attempts: u32,
  /// Reason of the most recent failed attempt
  #[serde(default)]
  pub last_error: Option<String>,
}

/// An action that was given up on after exhausting its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
  pub action: PendingAction,
  pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
  /// Live actions, oldest first
  live: Vec<PendingAction>,
  dead: Vec<DeadLetter>,
  next_seq: u64,
}

impl QueueState {
  fn sort(&mut self) {
    self
      .live
      .sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then(a.seq.cmp(&b.seq)));
  }
}

fn storage_key(seq: u64) -> String {
  format!("{:020}", seq)
}

/// Ordered, persisted list of not-yet-acknowledged write intents.
pub struct PendingActionQueue {
  store: Arc<dyn DurableStore>,
  clock: Arc<dyn Clock>,
  state: Mutex<QueueState>,
}

impl PendingActionQueue {
  /// Rebuild the queue from whatever the store holds.
  pub fn open(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Result<Self> {
    let mut live: Vec<PendingAction> = store::load_all(store.as_ref(), NS_PENDING)?;
    let dead: Vec<DeadLetter> = store::load_all(store.as_ref(), NS_DEAD_LETTER)?;

    // An interrupted dead_letter leaves the action in both namespaces
    let dead_ids: HashSet<&str> = dead.iter().map(|d| d.action.id.as_str()).collect();
    let mut stale = Vec::new();
    live.retain(|a| {
      let keep = !dead_ids.contains(a.id.as_str());
      if !keep {
        stale.push(a.seq);
      }
      keep
    });
    for seq in stale {
      warn!(seq, "dropping pending action that was already dead-lettered");
      store.delete(NS_PENDING, &storage_key(seq))?;
    }

    let next_seq = live
      .iter()
      .map(|a| a.seq)
      .chain(dead.iter().map(|d| d.action.seq))
      .max()
      .map(|s| s + 1)
      .unwrap_or(0);

    debug!(
      pending = live.len(),
      dead = dead.len(),
      "loaded pending action queue"
    );

    let mut state = QueueState {
      live,
      dead,
      next_seq,
    };
    state.sort();

    Ok(Self {
      store,
      clock,
      state: Mutex::new(state),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
    self
      .state
      .lock()
      .map_err(|e| SyncError::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }

  /// Persist a new action at the tail and return it.
  pub fn enqueue(&self, kind: &str, payload: Value) -> Result<PendingAction> {
    let mut state = self.lock()?;
    let action = PendingAction {
      id: Uuid::new_v4().to_string(),
      seq: state.next_seq,
      kind: kind.to_string(),
      payload,
      enqueued_at: self.clock.now(),
      attempts: 0,
      last_error: None,
    };

    store::put_json(
      self.store.as_ref(),
      NS_PENDING,
      &storage_key(action.seq),
      &action,
    )?;

    state.next_seq += 1;
    state.live.push(action.clone());
    state.sort();

    debug!(id = %action.id, kind = %action.kind, "enqueued action");
    Ok(action)
  }

  /// Oldest live action, by `enqueued_at` then insertion order.
  pub fn peek_oldest(&self) -> Option<PendingAction> {
    self.lock().ok()?.live.first().cloned()
  }

  pub fn get(&self, id: &str) -> Option<PendingAction> {
    self.lock().ok()?.live.iter().find(|a| a.id == id).cloned()
  }

  /// Remove an action. Returns false if it was already gone.
  pub fn remove(&self, id: &str) -> Result<bool> {
    let mut state = self.lock()?;
    let Some(pos) = state.live.iter().position(|a| a.id == id) else {
      return Ok(false);
    };
    self
      .store
      .delete(NS_PENDING, &storage_key(state.live[pos].seq))?;
    state.live.remove(pos);
    Ok(true)
  }

  /// Count a failed attempt against an action and persist it.
  pub fn record_failure(&self, id: &str, reason: &str) -> Result<Option<PendingAction>> {
    let mut state = self.lock()?;
    let Some(pos) = state.live.iter().position(|a| a.id == id) else {
      return Ok(None);
    };

    let mut updated = state.live[pos].clone();
    updated.attempts += 1;
    updated.last_error = Some(reason.to_string());

    store::put_json(
      self.store.as_ref(),
      NS_PENDING,
      &storage_key(updated.seq),
      &updated,
    )?;
    state.live[pos] = updated.clone();
    Ok(Some(updated))
  }

  /// Move an action out of the live queue into dead-letter storage.
  pub fn dead_letter(&self, id: &str) -> Result<Option<DeadLetter>> {
    let mut state = self.lock()?;
    let Some(pos) = state.live.iter().position(|a| a.id == id) else {
      return Ok(None);
    };

    let letter = DeadLetter {
      action: state.live[pos].clone(),
      dead_lettered_at: self.clock.now(),
    };
    let key = storage_key(letter.action.seq);

    // Dead letter first, so a crash in between leaves a duplicate, never a loss
    store::put_json(self.store.as_ref(), NS_DEAD_LETTER, &key, &letter)?;
    self.store.delete(NS_PENDING, &key)?;

    state.live.remove(pos);
    state.dead.push(letter.clone());

    warn!(
      id = %letter.action.id,
      kind = %letter.action.kind,
      attempts = letter.action.attempts,
      "action dead-lettered"
    );
    Ok(Some(letter))
  }

  /// Live actions, oldest first.
  pub fn all(&self) -> Vec<PendingAction> {
    self.lock().map(|s| s.live.clone()).unwrap_or_default()
  }

  pub fn len(&self) -> usize {
    self.lock().map(|s| s.live.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn dead_letters(&self) -> Vec<DeadLetter> {
    self.lock().map(|s| s.dead.clone()).unwrap_or_default()
  }

  pub fn dead_letter_count(&self) -> usize {
    self.lock().map(|s| s.dead.len()).unwrap_or(0)
  }

  /// Return every dead letter to the tail of the live queue.
  ///
  /// Each one comes back as a new action with a fresh id and zero attempts;
  /// an id that left the queue is never reused.
  pub fn requeue_dead_letters(&self) -> Result<usize> {
    let letters = self.dead_letters();
    let mut requeued = 0;
    for letter in letters {
      self.enqueue(&letter.action.kind, letter.action.payload.clone())?;

      let mut state = self.lock()?;
      self
        .store
        .delete(NS_DEAD_LETTER, &storage_key(letter.action.seq))?;
      state.dead.retain(|d| d.action.id != letter.action.id);
      requeued += 1;
    }
    Ok(requeued)
  }

  /// Drop every live and dead-lettered action.
  pub fn clear(&self) -> Result<()> {
    let mut state = self.lock()?;
    self.store.clear_namespace(NS_PENDING)?;
    self.store.clear_namespace(NS_DEAD_LETTER)?;
    state.live.clear();
    state.dead.clear();
    Ok(())
  }
}
