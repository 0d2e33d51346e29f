//! Reconciles the pending-action queue with the remote write API.

mod engine;
mod retry;
mod status;

pub use engine::{Submission, SyncEngine};
pub use retry::RetryPolicy;
pub use status::{ActionState, DeliveryOutcome, DrainReport, SyncStatus};
