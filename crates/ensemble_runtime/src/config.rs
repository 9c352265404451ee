//! Dispatch and engine configuration.

use crate::retry::{PollPolicy, RetryPolicy};
use ensemble_core::{CoreError, CoreResult};
use ensemble_plan::DEFAULT_MAX_CHAINS;
use ensemble_storage::{LocatorConfig, DEFAULT_STORAGE_BASE};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default number of units dispatched concurrently within a level
pub const DEFAULT_FAN_OUT: usize = 8;

/// Dispatch coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Units in flight at once within a level
    pub fan_out: usize,
    /// Cap on chains summed over all levels (0 = unlimited)
    pub max_chains: usize,
    /// Base URI for storage locators
    pub storage_base: String,
    /// Polling of execution handles
    pub poll: PollPolicy,
    /// Backend submission retries
    pub submit_retry: RetryPolicy,
    /// Registry read/write retries
    pub registry_retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            fan_out: DEFAULT_FAN_OUT,
            max_chains: DEFAULT_MAX_CHAINS,
            storage_base: DEFAULT_STORAGE_BASE.to_string(),
            poll: PollPolicy::default(),
            submit_retry: RetryPolicy::new(3, 500),
            registry_retry: RetryPolicy::new(3, 100),
        }
    }
}

impl DispatchConfig {
    /// Set the fan-out limit (minimum 1)
    #[must_use]
    pub fn with_fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = fan_out.max(1);
        self
    }

    /// Set the chain cap
    #[must_use]
    pub fn with_max_chains(mut self, max_chains: usize) -> Self {
        self.max_chains = max_chains;
        self
    }

    /// Set the storage base
    #[must_use]
    pub fn with_storage_base(mut self, base: impl Into<String>) -> Self {
        self.storage_base = base.into();
        self
    }

    /// Set the polling policy
    #[must_use]
    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Set the submission retry policy
    #[must_use]
    pub fn with_submit_retry(mut self, retry: RetryPolicy) -> Self {
        self.submit_retry = retry;
        self
    }

    /// Set the registry retry policy
    #[must_use]
    pub fn with_registry_retry(mut self, retry: RetryPolicy) -> Self {
        self.registry_retry = retry;
        self
    }

    /// Locator configuration for the storage base
    #[must_use]
    pub fn locator(&self) -> LocatorConfig {
        LocatorConfig::new(self.storage_base.clone())
    }
}

/// Engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Dispatch settings
    pub dispatch: DispatchConfig,
}

impl EngineConfig {
    /// Wrap a dispatch configuration
    #[must_use]
    pub fn new(dispatch: DispatchConfig) -> Self {
        Self { dispatch }
    }

    /// Parse from JSON
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed
    pub fn from_json(json: &str) -> CoreResult<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::Validation {
            field: "config".to_string(),
            reason: e.to_string(),
        })
    }

    /// Load from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| CoreError::Validation {
            field: "config".to_string(),
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_json(&json)
    }
}
