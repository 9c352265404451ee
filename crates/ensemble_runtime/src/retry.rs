//! Retry and polling policies.
//!
//! Registry writes and backend submissions are retried a bounded number of
//! times with a fixed pause. Polling an execution handle backs off
//! exponentially up to a ceiling and gives up once the per-unit timeout
//! budget is spent.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Bounded retry with a fixed pause between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first (minimum 1)
    pub max_attempts: u32,
    /// Pause between attempts in milliseconds
    pub backoff_ms: u64,
}

impl RetryPolicy {
    /// Create a new policy
    #[must_use]
    pub const fn new(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_ms,
        }
    }

    /// A single attempt, no retries
    #[must_use]
    pub const fn once() -> Self {
        Self::new(1, 0)
    }

    /// Pause between attempts
    #[must_use]
    pub const fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Run `op` until it succeeds or attempts run out
    ///
    /// # Errors
    ///
    /// Returns the last error once every attempt has failed
    pub async fn run<T, E, F, Fut>(&self, what: &str, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.run_if(what, op, |_| true).await
    }

    /// Like [`RetryPolicy::run`], but only errors accepted by `retryable`
    /// are retried; any other error is returned at once
    ///
    /// # Errors
    ///
    /// Returns the first permanent error or the last transient one
    pub async fn run_if<T, E, F, Fut, R>(&self, what: &str, mut op: F, retryable: R) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        R: Fn(&E) -> bool,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts && retryable(&err) => {
                    tracing::warn!(operation = what, attempt, max_attempts = attempts, error = %err, "retrying");
                    attempt += 1;
                    tokio::time::sleep(self.backoff()).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 100)
    }
}

/// Backoff schedule for polling an execution handle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    /// First pause in milliseconds
    pub initial_interval_ms: u64,
    /// Ceiling on the pause in milliseconds
    pub max_interval_ms: u64,
    /// Growth factor per poll (1.0 = fixed interval)
    pub multiplier: f64,
    /// Budget per unit in milliseconds
    pub timeout_ms: u64,
}

impl PollPolicy {
    /// Fixed interval polling
    #[must_use]
    pub const fn fixed(interval_ms: u64, timeout_ms: u64) -> Self {
        Self {
            initial_interval_ms: interval_ms,
            max_interval_ms: interval_ms,
            multiplier: 1.0,
            timeout_ms,
        }
    }

    /// Set the timeout budget
    #[must_use]
    pub const fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Timeout budget
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Iterator over successive pauses
    #[must_use]
    pub fn intervals(&self) -> Backoff {
        Backoff {
            next_ms: self.initial_interval_ms as f64,
            max_ms: self.max_interval_ms.max(self.initial_interval_ms) as f64,
            multiplier: self.multiplier.max(1.0),
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: 200,
            max_interval_ms: 5_000,
            multiplier: 2.0,
            timeout_ms: 3_600_000,
        }
    }
}

/// Exponential backoff iterator, never ends
#[derive(Debug, Clone)]
pub struct Backoff {
    next_ms: f64,
    max_ms: f64,
    multiplier: f64,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next_ms.min(self.max_ms);
        self.next_ms = (current * self.multiplier).min(self.max_ms);
        Some(Duration::from_millis(current as u64))
    }
}
