//! Consecutive-failure tracking for backend health checks
//!
//! A connection is demoted after `failure_threshold` health checks fail in a
//! row. Any successful check resets the count and stamps the last-healthy
//! time.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// Consecutive failed checks that demote a ready connection
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

pub struct HealthTracker {
    failure_threshold: u32,
    consecutive_failures: AtomicU32,
    last_healthy: RwLock<Option<DateTime<Utc>>>,
}

impl HealthTracker {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold,
            consecutive_failures: AtomicU32::new(0),
            last_healthy: RwLock::new(None),
        }
    }

    /// Record a successful check - resets the failure count
    pub async fn record_success(&self) {
        let previous = self.consecutive_failures.swap(0, Ordering::SeqCst);
        if previous > 0 {
            tracing::debug!(previous_failures = previous, "Health check recovered");
        }
        *self.last_healthy.write().await = Some(Utc::now());
    }

    /// Record a failed check. Returns true once the threshold is reached.
    pub fn record_failure(&self) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        failures >= self.failure_threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub async fn last_healthy(&self) -> Option<DateTime<Utc>> {
        *self.last_healthy.read().await
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}
