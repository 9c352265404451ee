//! Registry backend contract.
//!
//! The registry is the durable record of registered services and of every
//! data description that has been requested. Claims give each `dataId` a
//! single submitter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ensemble_core::{DataDescription, Service};
use serde::{Deserialize, Serialize};

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No data record for the given id
    #[error("Data record not found: {0}")]
    NotFound(String),

    /// A write was rejected or did not complete
    #[error("Registry write failed: {0}")]
    WriteFailed(String),

    /// The underlying store reported an error
    #[error("Registry backend error: {0}")]
    Backend(String),

    /// A stored value could not be encoded or decoded
    #[error("Registry encoding error: {0}")]
    Encoding(String),
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}

/// Result alias for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Lifecycle of a data record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    /// Requested, output not yet written
    Pending,
    /// Output written
    Completed,
    /// Execution failed
    Failed,
}

impl RecordState {
    /// Check if no further transition is expected
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A stored data description with its state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRecord {
    /// The description as submitted
    pub description: DataDescription,
    /// Current state
    pub state: RecordState,
    /// When the description was first stored
    pub requested_at: DateTime<Utc>,
}

impl DataRecord {
    /// A fresh pending record
    #[must_use]
    pub fn pending(description: DataDescription) -> Self {
        Self {
            description,
            state: RecordState::Pending,
            requested_at: Utc::now(),
        }
    }

    /// Check if the record can serve as a cache hit
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state == RecordState::Completed
    }
}

/// Outcome of [`Registry::claim`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Caller now owns the submission
    Won,
    /// Someone else already holds the claim
    Lost,
}

/// Registry backend
#[async_trait]
pub trait Registry: Send + Sync {
    /// Store or replace a service description
    async fn put_service(&self, service: &Service) -> RegistryResult<()>;

    /// Look up a service by name
    async fn get_service(&self, name: &str) -> RegistryResult<Option<Service>>;

    /// Every stored service
    async fn list_services(&self) -> RegistryResult<Vec<Service>>;

    /// Store a data description as pending
    ///
    /// Idempotent: an existing record for the same `dataId` is left as is.
    async fn put_data(&self, description: &DataDescription) -> RegistryResult<()>;

    /// Look up the record for `data_id`
    async fn get_data(&self, data_id: &str) -> RegistryResult<Option<DataRecord>>;

    /// Move the record for `data_id` to `state`
    ///
    /// Fails with [`RegistryError::NotFound`] if no record exists.
    async fn set_state(&self, data_id: &str, state: RecordState) -> RegistryResult<()>;

    /// Atomically claim `data_id`
    async fn claim(&self, data_id: &str) -> RegistryResult<ClaimOutcome>;

    /// Check if `data_id` is currently claimed
    async fn is_claimed(&self, data_id: &str) -> RegistryResult<bool>;

    /// Drop the claim on `data_id`, if any
    async fn release(&self, data_id: &str) -> RegistryResult<()>;
}
