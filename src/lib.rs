//! Offline-first write synchronization and staleness-aware read cache.
//!
//! Writes go through [`SyncEngine`]: sent directly when possible, otherwise
//! persisted in a [`PendingActionQueue`] and delivered oldest-first once
//! connectivity returns. Reads go through [`ReadCache`], which answers from
//! the last-known-good value and refreshes stale keys in the background,
//! while a [`Prefetcher`] warms keys it expects to be read next.
//! [`OfflineClient`] wires everything together.

pub mod api;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod logging;
pub mod prefetch;
pub mod queue;
pub mod store;
pub mod sync;

pub use api::{FetchError, HandlerRegistry, ReadApi, SendError, WriteApi, WriteRequest};
pub use cache::{CacheEntry, CacheResult, CacheSource, Freshness, ReadCache};
pub use client::{Collaborators, OfflineClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use connectivity::{ConnectivityMonitor, ManualReachability, Reachability, Subscription};
pub use error::{Result, SyncError};
pub use prefetch::{Prefetcher, TransitionModel};
pub use queue::{DeadLetter, PendingAction, PendingActionQueue};
pub use store::{DurableStore, MemoryStore, SqliteStore};
pub use sync::{RetryPolicy, Submission, SyncEngine, SyncStatus};
