//! Tracing setup for the diagnostic binary.

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::error::{Result, SyncError};

/// Environment variable holding the log filter, e.g. `offline_sync=debug`.
pub const LOG_ENV: &str = "OFFLINE_SYNC_LOG";

/// Default log directory, next to the store.
pub fn default_log_dir() -> Option<PathBuf> {
  dirs::data_dir().map(|d| d.join("offline-sync").join("logs"))
}

/// Install a global subscriber writing to a daily rolling file in `dir`.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes buffered log lines.
pub fn init(dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(dir)
    .map_err(|e| SyncError::Config(format!("Failed to create log directory: {}", e)))?;

  let appender = tracing_appender::rolling::daily(dir, "offline-sync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| SyncError::Config(format!("Failed to install log subscriber: {}", e)))?;

  Ok(guard)
}
