//! Dispatch metrics.
//!
//! Counters are shared by every unit in flight, so they are atomics rather
//! than a locked struct.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`DispatchMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Requests dispatched
    pub requests: u64,
    /// Units resolved from the registry without submission
    pub cached: u64,
    /// Units submitted to the backend
    pub submitted: u64,
    /// Units sharing a `dataId` with another unit of the same level
    pub deduplicated: u64,
    /// Units that lost the claim and waited on the winner
    pub waited: u64,
    /// Submitted units that completed
    pub completed: u64,
    /// Units that failed
    pub failed: u64,
    /// Retried registry or backend calls
    pub retries: u64,
    /// Handles cancelled
    pub cancelled: u64,
}

impl MetricsSnapshot {
    /// Completed share of submitted units (1.0 when nothing was submitted)
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.submitted == 0 {
            return 1.0;
        }
        self.completed as f64 / self.submitted as f64
    }

    /// Cached share of resolved units
    #[must_use]
    pub fn cache_hit_rate(&self) -> f64 {
        let resolved = self.cached + self.submitted + self.waited;
        if resolved == 0 {
            return 0.0;
        }
        self.cached as f64 / resolved as f64
    }
}

/// Counters aggregated across requests
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    requests: AtomicU64,
    cached: AtomicU64,
    submitted: AtomicU64,
    deduplicated: AtomicU64,
    waited: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    cancelled: AtomicU64,
}

impl DispatchMetrics {
    /// Create zeroed metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a dispatched request
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cache hit
    pub fn record_cached(&self) {
        self.cached.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a submission
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `count` deduplicated units
    pub fn record_deduplicated(&self, count: u64) {
        self.deduplicated.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a lost claim that was waited on
    pub fn record_waited(&self) {
        self.waited.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed submission
    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed unit
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a retried call
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cancelled handle
    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current values
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            cached: self.cached.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            waited: self.waited.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.requests,
            &self.cached,
            &self.submitted,
            &self.deduplicated,
            &self.waited,
            &self.completed,
            &self.failed,
            &self.retries,
            &self.cancelled,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
