//! Observable sync state and per-action outcomes.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Snapshot of the sync engine, published on every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStatus {
  /// A drain pass is running
  pub is_syncing: bool,
  pub pending_count: usize,
  pub dead_letter_count: usize,
  /// End of the last completed drain pass
  pub last_sync_at: Option<DateTime<Utc>>,
  /// Most recent delivery failure, cleared by the next success
  pub last_error: Option<String>,
}

/// Where an action sits in its delivery lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
  /// Waiting in the live queue
  Queued,
  /// Handed to the write API, awaiting a response
  Sending,
}

/// Result of handling one failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
  /// Back in the queue, eligible again after `delay`
  Retry { attempts: u32, delay: Duration },
  /// Attempts exhausted, moved to dead-letter storage
  DeadLettered,
  /// The action was no longer in the queue
  Gone,
}

/// Summary of one `drain` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Another drain was running; this trigger was folded into it
  pub coalesced: bool,
  pub sent: usize,
  pub failed: usize,
  pub dead_lettered: usize,
  /// A pass stopped because connectivity dropped
  pub interrupted: bool,
  /// The head of the queue is backing off for this long
  pub backoff: Option<Duration>,
}

impl DrainReport {
  pub(crate) fn coalesced() -> Self {
    Self {
      coalesced: true,
      ..Self::default()
    }
  }

  pub(crate) fn merge(&mut self, other: DrainReport) {
    self.sent += other.sent;
    self.failed += other.failed;
    self.dead_lettered += other.dead_lettered;
    self.interrupted = other.interrupted;
    self.backoff = other.backoff;
  }
}
