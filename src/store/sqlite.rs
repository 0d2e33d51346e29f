//! SQLite-backed durable store.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::DurableStore;
use crate::error::{Result, SyncError};

/// SQLite-based durable store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  path: PathBuf,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        SyncError::StorageUnavailable(format!("Failed to create store directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::StorageUnavailable(format!(
        "Failed to open store at {}: {}",
        path.display(),
        e
      ))
    })?;

    let store = Self {
      conn: Mutex::new(conn),
      path: path.to_path_buf(),
    };
    store.run_migrations()?;

    tracing::debug!(path = %path.display(), "opened sqlite store");
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| SyncError::StorageUnavailable("Could not determine data directory".into()))?;

    Ok(data_dir.join("offline-sync").join("store.db"))
  }

  /// Location of the database file.
  pub fn path(&self) -> &Path {
    &self.path
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| SyncError::StorageUnavailable(format!("Failed to run migrations: {}", e)))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }
}

const STORE_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;

CREATE TABLE IF NOT EXISTS kv_store (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, key)
);
"#;

impl DurableStore for SqliteStore {
  fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
    self.lock()?.execute(
      "INSERT OR REPLACE INTO kv_store (namespace, key, value, updated_at)
       VALUES (?, ?, ?, datetime('now'))",
      params![namespace, key, value],
    )?;
    Ok(())
  }

  fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
    let value = self
      .lock()?
      .query_row(
        "SELECT value FROM kv_store WHERE namespace = ? AND key = ?",
        params![namespace, key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn delete(&self, namespace: &str, key: &str) -> Result<()> {
    self.lock()?.execute(
      "DELETE FROM kv_store WHERE namespace = ? AND key = ?",
      params![namespace, key],
    )?;
    Ok(())
  }

  fn list_keys(&self, namespace: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT key FROM kv_store WHERE namespace = ? ORDER BY key")?;
    let keys = stmt
      .query_map(params![namespace], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(keys)
  }

  fn clear_namespace(&self, namespace: &str) -> Result<()> {
    self
      .lock()?
      .execute("DELETE FROM kv_store WHERE namespace = ?", params![namespace])?;
    Ok(())
  }

  fn flush(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
    Ok(())
  }
}
