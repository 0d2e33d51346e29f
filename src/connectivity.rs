//! Network reachability tracking.
//!
//! The monitor turns a platform [`Reachability`] source into a deduplicated
//! stream of online/offline transitions. Listeners registered through
//! [`ConnectivityMonitor::subscribe`] are invoked once per actual change,
//! never on a repeated report of the current state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Platform primitive reporting current connectivity.
pub trait Reachability: Send + Sync {
  /// Point-in-time check. An error is treated as "offline".
  fn check(&self) -> Result<bool, String>;
}

/// Reachability source backed by a flag the host flips.
#[derive(Debug, Default)]
pub struct ManualReachability {
  online: AtomicBool,
}

impl ManualReachability {
  pub fn new(online: bool) -> Self {
    Self {
      online: AtomicBool::new(online),
    }
  }

  pub fn set(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }
}

impl Reachability for ManualReachability {
  fn check(&self) -> Result<bool, String> {
    Ok(self.online.load(Ordering::SeqCst))
  }
}

type Listener = Arc<dyn Fn(bool) + Send + Sync>;
type Listeners = Mutex<BTreeMap<u64, Listener>>;

/// Observes reachability transitions and fans them out to subscribers.
pub struct ConnectivityMonitor {
  source: Arc<dyn Reachability>,
  online: Mutex<bool>,
  listeners: Arc<Listeners>,
  next_id: AtomicU64,
  /// Serializes compare-and-notify so each transition is delivered once, in order.
  notify: Mutex<()>,
}

impl ConnectivityMonitor {
  /// Create a monitor, seeding the current state from `source`.
  pub fn new(source: Arc<dyn Reachability>) -> Self {
    let online = source.check().unwrap_or(false);
    Self {
      source,
      online: Mutex::new(online),
      listeners: Arc::new(Mutex::new(BTreeMap::new())),
      next_id: AtomicU64::new(1),
      notify: Mutex::new(()),
    }
  }

  /// Ask the source directly. Fails fast to `false`.
  pub fn is_online_now(&self) -> bool {
    match self.source.check() {
      Ok(online) => online,
      Err(e) => {
        debug!(error = %e, "reachability check failed, assuming offline");
        false
      }
    }
  }

  /// Last observed state.
  pub fn is_online(&self) -> bool {
    self.online.lock().map(|s| *s).unwrap_or(false)
  }

  /// Record an observed state. Returns true if it was a transition.
  ///
  /// Listeners run synchronously on the calling thread and must not call
  /// `report` themselves.
  pub fn report(&self, online: bool) -> bool {
    let Ok(_guard) = self.notify.lock() else {
      return false;
    };

    {
      let Ok(mut state) = self.online.lock() else {
        return false;
      };
      if *state == online {
        return false;
      }
      *state = online;
    }

    info!(online, "connectivity changed");

    let listeners: Vec<Listener> = match self.listeners.lock() {
      Ok(l) => l.values().cloned().collect(),
      Err(_) => return true,
    };
    for listener in listeners {
      listener(online);
    }
    true
  }

  /// Query the source and report whatever it says.
  pub fn poll(&self) -> bool {
    let online = self.is_online_now();
    self.report(online)
  }

  /// Register a transition callback. Dropping the handle unsubscribes.
  pub fn subscribe<F>(&self, callback: F) -> Subscription
  where
    F: Fn(bool) + Send + Sync + 'static,
  {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    if let Ok(mut listeners) = self.listeners.lock() {
      listeners.insert(id, Arc::new(callback));
    }
    Subscription {
      id,
      listeners: Arc::downgrade(&self.listeners),
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self.listeners.lock().map(|l| l.len()).unwrap_or(0)
  }

  /// Poll the source on a fixed interval until the monitor is dropped.
  pub fn spawn_poller(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
    let weak = Arc::downgrade(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        match weak.upgrade() {
          Some(monitor) => {
            monitor.poll();
          }
          None => break,
        }
      }
    })
  }
}

/// Handle returned by [`ConnectivityMonitor::subscribe`].
pub struct Subscription {
  id: u64,
  listeners: Weak<Listeners>,
}

impl Subscription {
  /// Stop receiving transitions.
  pub fn unsubscribe(self) {
    // Drop does the work
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(listeners) = self.listeners.upgrade() {
      if let Ok(mut listeners) = listeners.lock() {
        listeners.remove(&self.id);
      }
    }
  }
}
