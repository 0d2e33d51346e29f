//! Bounded retry with exponential backoff.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How many times an action is attempted and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
  /// Attempts before an action is dead-lettered
  pub max_attempts: u32,
  /// Delay after the first failure
  pub base_delay: Duration,
  /// Upper bound for any single delay
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(60),
    }
  }
}

impl RetryPolicy {
  /// Delay to wait after `attempts` failed attempts.
  pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
    if attempts == 0 {
      return Duration::ZERO;
    }

    let base_ms = self.base_delay.as_millis() as u64;
    let factor = 2u64.checked_pow(attempts - 1).unwrap_or(u64::MAX);
    let exp_delay = base_ms.saturating_mul(factor);
    let capped = exp_delay.min(self.max_delay.as_millis() as u64);

    Duration::from_millis(capped)
  }

  /// Whether an action with `attempts` failures has used up its budget.
  pub fn is_exhausted(&self, attempts: u32) -> bool {
    attempts >= self.max_attempts
  }
}
