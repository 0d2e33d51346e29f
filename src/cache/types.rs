//! Core types for the read cache.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Last-known-good value for a read key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: String,
  pub value: Value,
  /// When the value was fetched from its origin
  pub fetched_at: DateTime<Utc>,
  /// Freshness window in milliseconds
  pub ttl_ms: i64,
}

impl CacheEntry {
  pub fn ttl(&self) -> Duration {
    Duration::milliseconds(self.ttl_ms)
  }

  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    now - self.fetched_at
  }

  /// Classify against an explicit freshness window.
  pub fn freshness_with(&self, now: DateTime<Utc>, ttl: Duration) -> Freshness {
    if self.age(now) < ttl {
      Freshness::Fresh
    } else {
      Freshness::Stale
    }
  }

  /// Classify against the entry's own window.
  pub fn freshness(&self, now: DateTime<Utc>) -> Freshness {
    self.freshness_with(now, self.ttl())
  }
}

/// Freshness of a read key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
  /// Younger than its TTL
  Fresh,
  /// At or past its TTL, still served
  Stale,
  /// Nothing cached
  Absent,
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched from the read API on this call
  Network,
  /// From cache, still considered fresh
  CacheFresh,
  /// From cache, past its TTL; a background refresh was scheduled
  CacheStale,
}

/// Result of a cache read, including data and metadata about the source.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheResult {
  pub value: Value,
  pub source: CacheSource,
  pub fetched_at: DateTime<Utc>,
}

impl CacheResult {
  pub fn from_network(entry: &CacheEntry) -> Self {
    Self {
      value: entry.value.clone(),
      source: CacheSource::Network,
      fetched_at: entry.fetched_at,
    }
  }

  pub fn from_cache(entry: &CacheEntry, is_stale: bool) -> Self {
    Self {
      value: entry.value.clone(),
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      fetched_at: entry.fetched_at,
    }
  }

  pub fn is_stale(&self) -> bool {
    self.source == CacheSource::CacheStale
  }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub fresh_hits: u64,
  pub stale_hits: u64,
  pub misses: u64,
  pub refreshes: u64,
  pub refresh_failures: u64,
  /// Refresh results dropped because the key was invalidated or rewritten
  pub discarded_refreshes: u64,
  pub evictions: u64,
  pub entries: usize,
}

impl CacheStats {
  pub fn hit_rate(&self) -> f64 {
    let hits = self.fresh_hits + self.stale_hits;
    let total = hits + self.misses;
    if total == 0 {
      0.0
    } else {
      hits as f64 / total as f64
    }
  }
}
