//! Durable key-value persistence for the pending-action queue, dead letters,
//! read-cache entries and navigation history.
//!
//! Every component keeps an in-memory projection and writes through to a
//! [`DurableStore`] on mutation. Namespaces partition the keyspace so that the
//! sync engine and the read cache never write the same keys.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::Result;

/// Namespace holding the live pending-action queue.
pub const NS_PENDING: &str = "pending_actions";
/// Namespace holding actions that exhausted their delivery attempts.
pub const NS_DEAD_LETTER: &str = "dead_letters";
/// Namespace holding read-cache entries.
pub const NS_CACHE: &str = "read_cache";
/// Namespace holding the prefetcher's navigation history.
pub const NS_NAVIGATION: &str = "navigation";

/// Trait for durable storage backends.
///
/// All operations are atomic per key. A successful `put` is durable before
/// the call returns. Failures map to [`crate::SyncError::StorageUnavailable`].
pub trait DurableStore: Send + Sync {
  /// Insert or replace the value stored under `namespace`/`key`.
  fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()>;

  /// Get the value stored under `namespace`/`key`.
  fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

  /// Delete a key. Deleting a missing key is not an error.
  fn delete(&self, namespace: &str, key: &str) -> Result<()>;

  /// List every key in a namespace in ascending lexical order.
  fn list_keys(&self, namespace: &str) -> Result<Vec<String>>;

  /// Delete every key in a namespace.
  fn clear_namespace(&self, namespace: &str) -> Result<()> {
    for key in self.list_keys(namespace)? {
      self.delete(namespace, &key)?;
    }
    Ok(())
  }

  /// Flush any buffered state to the medium.
  fn flush(&self) -> Result<()> {
    Ok(())
  }
}

/// Serialize `value` as JSON and store it.
pub fn put_json<T: Serialize>(
  store: &dyn DurableStore,
  namespace: &str,
  key: &str,
  value: &T,
) -> Result<()> {
  let data = serde_json::to_vec(value)?;
  store.put(namespace, key, &data)
}

/// Load and deserialize a JSON value.
pub fn get_json<T: DeserializeOwned>(
  store: &dyn DurableStore,
  namespace: &str,
  key: &str,
) -> Result<Option<T>> {
  match store.get(namespace, key)? {
    Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
    None => Ok(None),
  }
}

/// Load every value in a namespace in key order.
///
/// Records that no longer decode are skipped with a warning rather than
/// failing the whole load.
pub fn load_all<T: DeserializeOwned>(store: &dyn DurableStore, namespace: &str) -> Result<Vec<T>> {
  let mut out = Vec::new();
  for key in store.list_keys(namespace)? {
    let Some(data) = store.get(namespace, &key)? else {
      continue;
    };
    match serde_json::from_slice(&data) {
      Ok(value) => out.push(value),
      Err(e) => tracing::warn!(namespace, key = %key, error = %e, "skipping undecodable record"),
    }
  }
  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;

  #[derive(Debug, PartialEq, Serialize, Deserialize)]
  struct Record {
    n: u32,
  }

  #[test]
  fn test_json_helpers_round_trip_through_store() {
    let store = MemoryStore::new();
    put_json(&store, "ns", "a", &Record { n: 1 }).unwrap();
    let loaded: Option<Record> = get_json(&store, "ns", "a").unwrap();
    assert_eq!(loaded, Some(Record { n: 1 }));
    let missing: Option<Record> = get_json(&store, "ns", "b").unwrap();
    assert!(missing.is_none());
  }

  #[test]
  fn test_load_all_skips_garbage() {
    let store = MemoryStore::new();
    put_json(&store, "ns", "1", &Record { n: 1 }).unwrap();
    store.put("ns", "2", b"not json").unwrap();
    put_json(&store, "ns", "3", &Record { n: 3 }).unwrap();

    let all: Vec<Record> = load_all(&store, "ns").unwrap();
    assert_eq!(all, vec![Record { n: 1 }, Record { n: 3 }]);
  }

  #[test]
  fn test_clear_namespace_leaves_others() {
    let store = MemoryStore::new();
    store.put("a", "k", b"1").unwrap();
    store.put("b", "k", b"2").unwrap();
    store.clear_namespace("a").unwrap();
    assert!(store.list_keys("a").unwrap().is_empty());
    assert_eq!(store.get("b", "k").unwrap(), Some(b"2".to_vec()));
  }
}
