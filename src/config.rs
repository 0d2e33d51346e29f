use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::prefetch::PrefetchOptions;
use crate::sync::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub prefetch: PrefetchConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Database file (defaults to $XDG_DATA_HOME/offline-sync/store.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Attempts before an action is dead-lettered
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  /// Reachability poll interval; 0 disables polling
  pub poll_interval_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      base_delay_ms: 1_000,
      max_delay_ms: 60_000,
      poll_interval_ms: 0,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub default_ttl_ms: i64,
  /// Entry cap with least-recently-read eviction; unbounded when unset
  pub max_entries: Option<usize>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_ms: 5 * 60 * 1000,
      max_entries: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
  pub enabled: bool,
  pub top_n: usize,
  pub history_size: usize,
  pub ttl_ms: i64,
}

impl Default for PrefetchConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      top_n: 3,
      history_size: 100,
      ttl_ms: 5 * 60 * 1000,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-sync/config.yaml
  ///
  /// Without a file the defaults apply. `OFFLINE_SYNC_STORE` overrides the
  /// storage path either way.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(SyncError::Config(format!(
          "Config file not found: {}",
          p.display()
        )));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    if let Some(store) = Self::store_override() {
      config.storage.path = Some(store);
    }
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      SyncError::Config(format!(
        "Failed to read config file {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::from_yaml(&contents).map_err(|e| match e {
      SyncError::Config(msg) => SyncError::Config(format!("{}: {}", path.display(), msg)),
      other => other,
    })
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)
      .map_err(|e| SyncError::Config(format!("Failed to parse config: {}", e)))?;

    if config.sync.max_attempts == 0 {
      return Err(SyncError::Config(
        "sync.max_attempts must be at least 1".into(),
      ));
    }
    Ok(config)
  }

  fn store_override() -> Option<PathBuf> {
    std::env::var_os("OFFLINE_SYNC_STORE").map(PathBuf::from)
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.sync.max_attempts,
      base_delay: Duration::from_millis(self.sync.base_delay_ms),
      max_delay: Duration::from_millis(self.sync.max_delay_ms),
    }
  }

  pub fn prefetch_options(&self) -> PrefetchOptions {
    PrefetchOptions {
      enabled: self.prefetch.enabled,
      top_n: self.prefetch.top_n,
      history_size: self.prefetch.history_size,
      ttl: chrono::Duration::milliseconds(self.prefetch.ttl_ms),
    }
  }

  pub fn default_ttl(&self) -> chrono::Duration {
    chrono::Duration::milliseconds(self.cache.default_ttl_ms)
  }
}
