//! Drain loop that delivers queued actions to the write API.
//!
//! At most one drain runs at a time. A trigger that arrives while a drain is
//! running is folded into "drain again after this pass". Within a pass the
//! queue is processed strictly oldest-first, one action in flight, so a
//! backed-off head of queue holds back everything behind it.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::retry::RetryPolicy;
use super::status::{ActionState, DeliveryOutcome, DrainReport, SyncStatus};
use crate::api::{WriteApi, WriteRequest};
use crate::clock::Clock;
use crate::connectivity::{ConnectivityMonitor, Subscription};
use crate::error::Result;
use crate::queue::{PendingAction, PendingActionQueue};

/// Result of `submit_action`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
  /// True if the action was written to the queue instead of sent directly
  pub queued: bool,
  /// Idempotency key the write API saw or will see
  pub action_id: String,
}

#[derive(Default)]
struct DrainFlags {
  running: bool,
  rerun: bool,
}

/// Sync engine.
pub struct SyncEngine {
  queue: Arc<PendingActionQueue>,
  api: Arc<dyn WriteApi>,
  monitor: Arc<ConnectivityMonitor>,
  clock: Arc<dyn Clock>,
  policy: RetryPolicy,
  flags: Mutex<DrainFlags>,
  /// Earliest instant each backed-off action may be retried
  backoff: Mutex<HashMap<String, Instant>>,
  sending: Mutex<Option<String>>,
  retry_timer: Mutex<Option<JoinHandle<()>>>,
  status: watch::Sender<SyncStatus>,
}

impl SyncEngine {
  pub fn new(
    queue: Arc<PendingActionQueue>,
    api: Arc<dyn WriteApi>,
    monitor: Arc<ConnectivityMonitor>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
  ) -> Arc<Self> {
    let (status, _) = watch::channel(SyncStatus {
      pending_count: queue.len(),
      dead_letter_count: queue.dead_letter_count(),
      ..SyncStatus::default()
    });

    Arc::new(Self {
      queue,
      api,
      monitor,
      clock,
      policy,
      flags: Mutex::new(DrainFlags::default()),
      backoff: Mutex::new(HashMap::new()),
      sending: Mutex::new(None),
      retry_timer: Mutex::new(None),
      status,
    })
  }

  /// Drain whenever connectivity comes back, and once now.
  ///
  /// Must be called from within a tokio runtime. Dropping the returned
  /// subscription stops the automatic drains.
  pub fn start(self: &Arc<Self>) -> Subscription {
    let weak = Arc::downgrade(self);
    let runtime = tokio::runtime::Handle::current();
    let subscription = self.monitor.subscribe(move |online| {
      if !online {
        return;
      }
      if let Some(engine) = weak.upgrade() {
        debug!("connectivity restored, scheduling drain");
        runtime.spawn(async move {
          engine.drain().await;
        });
      }
    });

    self.trigger();
    subscription
  }

  /// Accept a write from the caller.
  ///
  /// When online with nothing queued ahead of it, the action is sent
  /// directly. Otherwise, or if the direct send fails, it stays queued and a
  /// drain is triggered. An error means the action could not even be queued.
  ///
  /// A direct send occupies the same lane as a drain pass, and its action
  /// holds the head of the queue while in flight, so later submissions queue
  /// up behind it whatever the send's outcome.
  pub async fn submit_action(self: &Arc<Self>, kind: &str, payload: Value) -> Result<Submission> {
    if self.claim_direct_lane() {
      return self.send_direct(kind, payload).await;
    }

    let action = self.queue.enqueue(kind, payload)?;
    self.publish_counts();
    self.trigger();
    Ok(Submission {
      queued: true,
      action_id: action.id,
    })
  }

  /// Take the drain lane for a direct send if online, idle and empty.
  fn claim_direct_lane(&self) -> bool {
    let Ok(mut flags) = self.flags.lock() else {
      return false;
    };
    if flags.running || !self.monitor.is_online() || !self.queue.is_empty() {
      return false;
    }
    flags.running = true;
    true
  }

  /// Give the lane back, draining if anything arrived meanwhile.
  fn release_direct_lane(self: &Arc<Self>) {
    let rerun = match self.flags.lock() {
      Ok(mut flags) => {
        flags.running = false;
        std::mem::take(&mut flags.rerun)
      }
      Err(_) => false,
    };
    if rerun {
      self.trigger();
    }
  }

  async fn send_direct(self: &Arc<Self>, kind: &str, payload: Value) -> Result<Submission> {
    let action = match self.queue.enqueue(kind, payload) {
      Ok(action) => action,
      Err(e) => {
        self.release_direct_lane();
        return Err(e);
      }
    };
    let request = WriteRequest {
      id: action.id.clone(),
      kind: action.kind.clone(),
      payload: action.payload.clone(),
    };

    self.set_sending(Some(action.id.clone()));
    let result = self.api.send(&request).await;
    self.set_sending(None);

    let queued = match result {
      Ok(()) => {
        debug!(id = %action.id, kind, "sent action directly");
        self.status.send_modify(|s| s.last_error = None);
        if let Err(e) = self.queue.remove(&action.id) {
          warn!(id = %action.id, error = %e, "delivered but could not remove from queue");
        }
        false
      }
      Err(e) => {
        debug!(id = %action.id, kind, error = %e, "direct send failed, keeping queued");
        if let Err(e) = self.handle_failure(&action, &e.0) {
          warn!(id = %action.id, error = %e, "could not record delivery failure");
        }
        true
      }
    };

    self.publish_counts();
    self.release_direct_lane();
    if queued {
      self.schedule_pending_retry();
    }
    Ok(Submission {
      queued,
      action_id: action.id,
    })
  }

  /// Start a drain in the background if online.
  pub fn trigger(self: &Arc<Self>) {
    if !self.monitor.is_online() {
      return;
    }
    let engine = Arc::clone(self);
    tokio::spawn(async move {
      engine.drain().await;
    });
  }

  /// Run drain passes until the queue is empty, blocked or offline.
  ///
  /// If a drain is already running this returns at once with
  /// `coalesced = true`, and the running drain makes one more pass.
  pub async fn drain(self: &Arc<Self>) -> DrainReport {
    {
      let Ok(mut flags) = self.flags.lock() else {
        return DrainReport::default();
      };
      if flags.running {
        flags.rerun = true;
        return DrainReport::coalesced();
      }
      flags.running = true;
    }
    self.status.send_modify(|s| s.is_syncing = true);

    let mut report = DrainReport::default();
    loop {
      report.merge(self.drain_pass().await);

      let Ok(mut flags) = self.flags.lock() else {
        break;
      };
      if flags.rerun {
        flags.rerun = false;
        continue;
      }
      flags.running = false;
      break;
    }

    let now = self.clock.now();
    self.status.send_modify(|s| {
      s.is_syncing = false;
      s.last_sync_at = Some(now);
    });
    self.publish_counts();

    info!(
      sent = report.sent,
      failed = report.failed,
      dead_lettered = report.dead_lettered,
      remaining = self.queue.len(),
      "drain finished"
    );
    report
  }

  async fn drain_pass(self: &Arc<Self>) -> DrainReport {
    let mut report = DrainReport::default();

    loop {
      if !self.monitor.is_online() {
        debug!("offline, stopping drain pass");
        report.interrupted = true;
        break;
      }

      let Some(action) = self.queue.peek_oldest() else {
        break;
      };

      if let Some(wait) = self.backoff_remaining(&action.id) {
        debug!(id = %action.id, ?wait, "head of queue backing off");
        report.backoff = Some(wait);
        self.schedule_retry(wait);
        break;
      }

      let request = WriteRequest {
        id: action.id.clone(),
        kind: action.kind.clone(),
        payload: action.payload.clone(),
      };

      self.set_sending(Some(action.id.clone()));
      let result = self.api.send(&request).await;
      self.set_sending(None);

      match result {
        Ok(()) => {
          if let Err(e) = self.queue.remove(&action.id) {
            warn!(id = %action.id, error = %e, "delivered but could not remove from queue");
            break;
          }
          self.clear_backoff(&action.id);
          self.status.send_modify(|s| s.last_error = None);
          debug!(id = %action.id, kind = %action.kind, "action acked");
          report.sent += 1;
        }
        Err(e) => match self.handle_failure(&action, &e.0) {
          Ok(DeliveryOutcome::DeadLettered) => report.dead_lettered += 1,
          Ok(_) => report.failed += 1,
          Err(e) => {
            warn!(id = %action.id, error = %e, "could not record delivery failure");
            break;
          }
        },
      }

      self.publish_counts();
    }

    report
  }

  /// Count a failed attempt and either back off or dead-letter.
  fn handle_failure(&self, action: &PendingAction, reason: &str) -> Result<DeliveryOutcome> {
    self
      .status
      .send_modify(|s| s.last_error = Some(reason.to_string()));

    let Some(updated) = self.queue.record_failure(&action.id, reason)? else {
      return Ok(DeliveryOutcome::Gone);
    };

    if self.policy.is_exhausted(updated.attempts) {
      self.queue.dead_letter(&updated.id)?;
      self.clear_backoff(&updated.id);
      return Ok(DeliveryOutcome::DeadLettered);
    }

    let delay = self.policy.delay_for_attempt(updated.attempts);
    if let Ok(mut backoff) = self.backoff.lock() {
      backoff.insert(updated.id.clone(), Instant::now() + delay);
    }
    debug!(
      id = %updated.id,
      attempts = updated.attempts,
      ?delay,
      reason,
      "delivery failed, will retry"
    );
    Ok(DeliveryOutcome::Retry {
      attempts: updated.attempts,
      delay,
    })
  }

  fn backoff_remaining(&self, id: &str) -> Option<Duration> {
    let backoff = self.backoff.lock().ok()?;
    let until = *backoff.get(id)?;
    let now = Instant::now();
    (until > now).then(|| until - now)
  }

  fn clear_backoff(&self, id: &str) {
    if let Ok(mut backoff) = self.backoff.lock() {
      backoff.remove(id);
    }
  }

  /// Arm the retry timer for whatever the head of the queue is waiting on.
  fn schedule_pending_retry(self: &Arc<Self>) {
    let wait = self
      .queue
      .peek_oldest()
      .and_then(|head| self.backoff_remaining(&head.id))
      .unwrap_or(Duration::ZERO);
    self.schedule_retry(wait);
  }

  /// Trigger a drain after `wait`, replacing any earlier timer.
  fn schedule_retry(self: &Arc<Self>, wait: Duration) {
    let weak: Weak<Self> = Arc::downgrade(self);
    let handle = tokio::spawn(async move {
      tokio::time::sleep(wait).await;
      if let Some(engine) = weak.upgrade() {
        engine.trigger();
      }
    });

    if let Ok(mut timer) = self.retry_timer.lock() {
      if let Some(previous) = timer.replace(handle) {
        previous.abort();
      }
    }
  }

  /// Cancel the retry timer. Queued actions stay queued.
  pub fn stop(&self) {
    if let Ok(mut timer) = self.retry_timer.lock() {
      if let Some(handle) = timer.take() {
        handle.abort();
      }
    }
  }

  fn set_sending(&self, id: Option<String>) {
    if let Ok(mut sending) = self.sending.lock() {
      *sending = id;
    }
  }

  fn publish_counts(&self) {
    let pending = self.queue.len();
    let dead = self.queue.dead_letter_count();
    self.status.send_modify(|s| {
      s.pending_count = pending;
      s.dead_letter_count = dead;
    });
  }

  pub fn is_draining(&self) -> bool {
    self.flags.lock().map(|f| f.running).unwrap_or(false)
  }

  /// Lifecycle position of an action, or None once it has left the queue.
  pub fn action_state(&self, id: &str) -> Option<ActionState> {
    let sending = self.sending.lock().ok()?;
    if sending.as_deref() == Some(id) {
      return Some(ActionState::Sending);
    }
    self.queue.get(id).map(|_| ActionState::Queued)
  }

  /// Wait until no drain is running.
  pub async fn wait_idle(&self) {
    let mut rx = self.status.subscribe();
    let _ = rx.wait_for(|s| !s.is_syncing).await;
  }

  /// Requeue every dead letter and drain.
  pub fn retry_dead_letters(self: &Arc<Self>) -> Result<usize> {
    let count = self.queue.requeue_dead_letters()?;
    self.publish_counts();
    if count > 0 {
      info!(count, "requeued dead letters");
      self.trigger();
    }
    Ok(count)
  }

  pub fn status(&self) -> SyncStatus {
    self.status.borrow().clone()
  }

  pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
    self.status.subscribe()
  }

  pub fn queue(&self) -> &Arc<PendingActionQueue> {
    &self.queue
  }

  pub fn pending_action_count(&self) -> usize {
    self.queue.len()
  }

  pub fn dead_letter_count(&self) -> usize {
    self.queue.dead_letter_count()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::SendError;
  use crate::clock::ManualClock;
  use crate::connectivity::ManualReachability;
  use crate::error::SyncError;
  use crate::store::MemoryStore;
  use async_trait::async_trait;
  use serde_json::json;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use tokio::sync::{Notify, Semaphore};

  /// Records every request; fails a kind a set number of times first.
  #[derive(Default)]
  struct RecordingApi {
    calls: Mutex<Vec<WriteRequest>>,
    failures: Mutex<HashMap<String, u32>>,
  }

  impl RecordingApi {
    fn failing(kind: &str, times: u32) -> Self {
      let api = Self::default();
      api.failures.lock().unwrap().insert(kind.to_string(), times);
      api
    }

    fn calls(&self) -> Vec<WriteRequest> {
      self.calls.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl WriteApi for RecordingApi {
    async fn send(&self, request: &WriteRequest) -> std::result::Result<(), SendError> {
      self.calls.lock().unwrap().push(request.clone());
      let mut failures = self.failures.lock().unwrap();
      match failures.get_mut(&request.kind) {
        Some(left) if *left > 0 => {
          *left -= 1;
          Err(SendError("503".into()))
        }
        _ => Ok(()),
      }
    }
  }

  struct Harness {
    store: Arc<MemoryStore>,
    monitor: Arc<ConnectivityMonitor>,
    engine: Arc<SyncEngine>,
  }

  fn harness(api: Arc<dyn WriteApi>, online: bool, policy: RetryPolicy) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let queue = Arc::new(PendingActionQueue::open(store.clone(), clock.clone()).unwrap());
    let monitor = Arc::new(ConnectivityMonitor::new(Arc::new(
      ManualReachability::new(online),
    )));
    let engine = SyncEngine::new(queue, api, monitor.clone(), clock, policy);
    Harness {
      store,
      monitor,
      engine,
    }
  }

  fn instant_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
      max_attempts,
      base_delay: Duration::ZERO,
      max_delay: Duration::ZERO,
    }
  }

  #[tokio::test]
  async fn test_offline_submit_is_queued_then_drained() {
    let api = Arc::new(RecordingApi::default());
    let h = harness(api.clone(), false, RetryPolicy::default());
    let _sub = h.engine.start();

    let submission = h
      .engine
      .submit_action("participate", json!({ "eventId": 7 }))
      .await
      .unwrap();
    assert!(submission.queued);
    assert_eq!(h.engine.pending_action_count(), 1);
    assert!(api.calls().is_empty());

    let report = h.engine.drain().await;
    assert_eq!(report, DrainReport {
      interrupted: true,
      ..DrainReport::default()
    });

    h.monitor.report(true);
    tokio::task::yield_now().await;
    h.engine.wait_idle().await;
    // The transition may have spawned its drain after wait_idle returned
    h.engine.drain().await;

    let calls = api.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].kind, "participate");
    assert_eq!(calls[0].payload, json!({ "eventId": 7 }));
    assert_eq!(calls[0].id, submission.action_id);
    assert_eq!(h.engine.pending_action_count(), 0);
  }

  #[tokio::test]
  async fn test_online_submit_sends_directly() {
    let api = Arc::new(RecordingApi::default());
    let h = harness(api.clone(), true, RetryPolicy::default());

    let submission = h
      .engine
      .submit_action("participate", json!({ "eventId": 1 }))
      .await
      .unwrap();
    assert!(!submission.queued);
    assert_eq!(api.calls().len(), 1);
    assert_eq!(h.engine.pending_action_count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_direct_send_keeps_its_id() {
    let api = Arc::new(RecordingApi::failing("participate", 1));
    let h = harness(api.clone(), true, RetryPolicy::default());

    let submission = h
      .engine
      .submit_action("participate", json!({ "eventId": 2 }))
      .await
      .unwrap();
    assert!(submission.queued);
    assert_eq!(h.engine.queue().peek_oldest().unwrap().attempts, 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    h.engine.wait_idle().await;

    let calls = api.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| c.id == submission.action_id));
    assert_eq!(h.engine.pending_action_count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retries_preserve_enqueue_order() {
    let api = Arc::new(RecordingApi::failing("a", 2));
    let h = harness(api.clone(), false, RetryPolicy::default());

    h.engine.submit_action("a", json!("A")).await.unwrap();
    h.engine.submit_action("b", json!("B")).await.unwrap();

    h.monitor.report(true);
    let report = h.engine.drain().await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.backoff, Some(Duration::from_secs(1)));
    assert_eq!(api.calls().len(), 1);

    // Backoff timers fire as paused time auto-advances
    tokio::time::sleep(Duration::from_secs(30)).await;
    h.engine.wait_idle().await;

    let kinds: Vec<String> = api.calls().into_iter().map(|c| c.kind).collect();
    assert_eq!(kinds, vec!["a", "a", "a", "b"]);
    assert_eq!(h.engine.pending_action_count(), 0);
  }

  #[tokio::test]
  async fn test_dead_letter_after_max_attempts() {
    let api = Arc::new(RecordingApi::failing("participate", u32::MAX));
    let h = harness(api.clone(), false, instant_retries(5));

    h.engine
      .submit_action("participate", json!({}))
      .await
      .unwrap();
    h.engine.submit_action("other", json!({})).await.unwrap();
    h.monitor.report(true);

    let report = h.engine.drain().await;
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.sent, 1);

    let attempts = api
      .calls()
      .iter()
      .filter(|c| c.kind == "participate")
      .count();
    assert_eq!(attempts, 5);
    assert_eq!(h.engine.pending_action_count(), 0);
    assert_eq!(h.engine.dead_letter_count(), 1);

    let letter = &h.engine.queue().dead_letters()[0];
    assert_eq!(letter.action.attempts, 5);
    assert_eq!(letter.action.last_error.as_deref(), Some("503"));
    assert_eq!(h.engine.status().dead_letter_count, 1);
  }

  /// Succeeds, but drops connectivity on the first call.
  struct DisconnectingApi {
    monitor: Arc<ConnectivityMonitor>,
    calls: Mutex<usize>,
  }

  #[async_trait]
  impl WriteApi for DisconnectingApi {
    async fn send(&self, _request: &WriteRequest) -> std::result::Result<(), SendError> {
      *self.calls.lock().unwrap() += 1;
      self.monitor.report(false);
      Ok(())
    }
  }

  #[tokio::test]
  async fn test_going_offline_stops_the_pass() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let queue = Arc::new(PendingActionQueue::open(store, clock.clone()).unwrap());
    let monitor = Arc::new(ConnectivityMonitor::new(Arc::new(
      ManualReachability::new(false),
    )));
    let api = Arc::new(DisconnectingApi {
      monitor: monitor.clone(),
      calls: Mutex::new(0),
    });
    let engine = SyncEngine::new(
      queue,
      api.clone(),
      monitor.clone(),
      clock,
      RetryPolicy::default(),
    );

    for n in 0..3 {
      engine.submit_action("participate", json!(n)).await.unwrap();
    }
    monitor.report(true);

    let report = engine.drain().await;
    assert!(report.interrupted);
    assert_eq!(report.sent, 1);
    assert_eq!(*api.calls.lock().unwrap(), 1);
    assert_eq!(engine.pending_action_count(), 2);
  }

  /// Blocks every send until permits are released.
  struct GatedApi {
    started: Notify,
    gate: Semaphore,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail_first: AtomicBool,
  }

  impl GatedApi {
    fn new(fail_first: bool) -> Self {
      Self {
        started: Notify::new(),
        gate: Semaphore::new(0),
        calls: Mutex::new(Vec::new()),
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
        fail_first: AtomicBool::new(fail_first),
      }
    }

    fn kinds(&self) -> Vec<String> {
      self.calls.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl WriteApi for GatedApi {
    async fn send(&self, request: &WriteRequest) -> std::result::Result<(), SendError> {
      self.calls.lock().unwrap().push(request.kind.clone());
      let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
      self.max_in_flight.fetch_max(now, Ordering::SeqCst);
      self.started.notify_one();

      let permit = self.gate.acquire().await;
      self.in_flight.fetch_sub(1, Ordering::SeqCst);
      permit.map_err(|e| SendError(e.to_string()))?.forget();

      if self.fail_first.swap(false, Ordering::SeqCst) {
        return Err(SendError("connection reset".into()));
      }
      Ok(())
    }
  }

  /// Drain until no other drain is left running.
  async fn settle(engine: &Arc<SyncEngine>) {
    loop {
      tokio::task::yield_now().await;
      engine.wait_idle().await;
      if !engine.drain().await.coalesced {
        break;
      }
    }
  }

  #[tokio::test]
  async fn test_concurrent_triggers_are_coalesced() {
    let api = Arc::new(GatedApi::new(false));
    let h = harness(api.clone(), false, RetryPolicy::default());
    h.engine.submit_action("participate", json!(1)).await.unwrap();
    h.monitor.report(true);

    h.engine.trigger();
    api.started.notified().await;
    assert!(h.engine.is_draining());

    let id = h.engine.queue().peek_oldest().unwrap().id;
    assert_eq!(h.engine.action_state(&id), Some(ActionState::Sending));

    let second = h.engine.drain().await;
    assert!(second.coalesced);

    api.gate.add_permits(10);
    h.engine.wait_idle().await;

    assert_eq!(api.kinds().len(), 1);
    assert_eq!(h.engine.action_state(&id), None);
    assert_eq!(h.engine.pending_action_count(), 0);
  }

  #[tokio::test]
  async fn test_submit_during_direct_send_waits_its_turn() {
    let api = Arc::new(GatedApi::new(false));
    let h = harness(api.clone(), true, RetryPolicy::default());

    let engine = Arc::clone(&h.engine);
    let first = tokio::spawn(async move { engine.submit_action("a", json!("A")).await });
    api.started.notified().await;
    assert!(h.engine.is_draining());

    let second = h.engine.submit_action("b", json!("B")).await.unwrap();
    assert!(second.queued);
    assert_eq!(api.kinds(), vec!["a"]);

    api.gate.add_permits(10);
    let first = first.await.unwrap().unwrap();
    assert!(!first.queued);
    settle(&h.engine).await;

    assert_eq!(api.kinds(), vec!["a", "b"]);
    assert_eq!(api.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.pending_action_count(), 0);
  }

  #[tokio::test]
  async fn test_failed_direct_send_stays_ahead_of_later_submits() {
    let api = Arc::new(GatedApi::new(true));
    let h = harness(api.clone(), true, instant_retries(5));

    let engine = Arc::clone(&h.engine);
    let first = tokio::spawn(async move { engine.submit_action("a", json!("A")).await });
    api.started.notified().await;

    // Connection drops mid-request; the next write is queued offline
    h.monitor.report(false);
    let second = h.engine.submit_action("b", json!("B")).await.unwrap();
    assert!(second.queued);

    api.gate.add_permits(10);
    let first = first.await.unwrap().unwrap();
    assert!(first.queued);
    let head = h.engine.queue().peek_oldest().unwrap();
    assert_eq!(head.id, first.action_id);
    assert_eq!(head.attempts, 1);

    h.monitor.report(true);
    settle(&h.engine).await;

    assert_eq!(api.kinds(), vec!["a", "a", "b"]);
    assert_eq!(api.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.pending_action_count(), 0);
  }

  #[tokio::test]
  async fn test_submit_fails_when_queue_cannot_be_written() {
    let api = Arc::new(RecordingApi::default());
    let h = harness(api, false, RetryPolicy::default());
    h.store.set_fail_writes(true);

    let err = h
      .engine
      .submit_action("participate", json!({}))
      .await
      .unwrap_err();
    assert!(matches!(err, SyncError::StorageUnavailable(_)));
    assert_eq!(h.engine.pending_action_count(), 0);
  }

  #[tokio::test]
  async fn test_retry_dead_letters_delivers_them() {
    let api = Arc::new(RecordingApi::failing("participate", 2));
    let h = harness(api.clone(), false, instant_retries(2));
    h.engine
      .submit_action("participate", json!({ "eventId": 3 }))
      .await
      .unwrap();
    h.monitor.report(true);
    h.engine.drain().await;
    assert_eq!(h.engine.dead_letter_count(), 1);

    assert_eq!(h.engine.retry_dead_letters().unwrap(), 1);
    h.engine.drain().await;

    assert_eq!(h.engine.dead_letter_count(), 0);
    assert_eq!(h.engine.pending_action_count(), 0);
    assert_eq!(api.calls().len(), 3);
  }
}
