//! In-memory store, used for tests and for hosts without stable storage.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::DurableStore;
use crate::error::{Result, SyncError};

/// Store that keeps everything in process memory.
///
/// Sharing one instance between successive component instances simulates a
/// process restart. `set_fail_writes(true)` makes every write fail with
/// `StorageUnavailable`, standing in for an exhausted quota.
#[derive(Default)]
pub struct MemoryStore {
  data: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
  fail_writes: AtomicBool,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Toggle simulated write failures.
  pub fn set_fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  fn check_writable(&self) -> Result<()> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(SyncError::StorageUnavailable("quota exceeded".into()));
    }
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, Vec<u8>>>>> {
    self
      .data
      .lock()
      .map_err(|e| SyncError::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }
}

impl DurableStore for MemoryStore {
  fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
    self.check_writable()?;
    self
      .lock()?
      .entry(namespace.to_string())
      .or_default()
      .insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
    Ok(self.lock()?.get(namespace).and_then(|ns| ns.get(key).cloned()))
  }

  fn delete(&self, namespace: &str, key: &str) -> Result<()> {
    self.check_writable()?;
    if let Some(ns) = self.lock()?.get_mut(namespace) {
      ns.remove(key);
    }
    Ok(())
  }

  fn list_keys(&self, namespace: &str) -> Result<Vec<String>> {
    Ok(
      self
        .lock()?
        .get(namespace)
        .map(|ns| ns.keys().cloned().collect())
        .unwrap_or_default(),
    )
  }
}
