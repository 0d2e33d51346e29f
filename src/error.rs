//! Error types shared by every component.

use thiserror::Error;

/// Errors surfaced to callers of the offline-sync core.
#[derive(Debug, Error)]
pub enum SyncError {
  /// The durable store could not be read or written (quota, locked file, I/O).
  #[error("storage unavailable: {0}")]
  StorageUnavailable(String),

  /// A persisted record could not be encoded or decoded.
  #[error("serialization failed: {0}")]
  Serialization(#[from] serde_json::Error),

  /// The absent-path fetch of a read key failed and no cached value exists.
  #[error("fetch failed for '{key}': {reason}")]
  Fetch { key: String, reason: String },

  /// Configuration could not be loaded.
  #[error("invalid configuration: {0}")]
  Config(String),
}

impl From<rusqlite::Error> for SyncError {
  fn from(e: rusqlite::Error) -> Self {
    SyncError::StorageUnavailable(e.to_string())
  }
}

pub type Result<T> = std::result::Result<T, SyncError>;
