//! Retry policy and transient retry bookkeeping.
//!
//! Retry state is deliberately in-memory only: pending timers are lost on
//! process exit and the manifest's last durable statuses are the recovery
//! truth.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::ErrorClass;
use crate::queue::Job;

/// Exponential backoff policy for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `base × 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }

    /// Whether another attempt is allowed after `attempts` tries.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// One parked job awaiting re-enqueue.
#[derive(Debug)]
pub struct RetryEntry {
    pub job: Job,
    pub attempts: u32,
    pub last_error: ErrorClass,
    pub not_before: Instant,
}
