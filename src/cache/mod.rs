//! Staleness-aware read cache.
//!
//! This module provides a transport-agnostic caching mechanism that:
//! - Serves the last-known-good value for a key immediately, fresh or stale
//! - Refreshes stale keys in the background, one refresh per key at a time
//! - Blocks only when nothing is cached for a key
//! - Never lets a refresh resurrect a key invalidated while it was in flight

mod layer;
mod types;

pub use layer::ReadCache;
pub use types::{CacheEntry, CacheResult, CacheSource, CacheStats, Freshness};
