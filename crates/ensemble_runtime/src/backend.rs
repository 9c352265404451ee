//! Execution backend contract.

use async_trait::async_trait;
use ensemble_core::DataDescription;
use serde::{Deserialize, Serialize};

/// Opaque handle returned by [`ExecutionBackend::submit`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionHandle(String);

impl ExecutionHandle {
    /// Wrap a backend-specific identifier
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The backend-specific identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// State reported by [`ExecutionBackend::poll`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    /// Accepted, not started
    Pending,
    /// Started
    Running,
    /// Output written
    Completed,
    /// Ended without output
    Failed(String),
}

impl ExecutionState {
    /// Check if the state is final
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

/// Execution backend errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The backend refused or could not take the submission
    #[error("Submission failed: {0}")]
    SubmissionFailed(String),

    /// The handle is not known to this backend
    #[error("Unknown execution handle: {0}")]
    UnknownHandle(String),

    /// The service has no usable execution template
    #[error("Invalid execution template for {service}: {reason}")]
    InvalidTemplate {
        /// Service name
        service: String,
        /// What is wrong with it
        reason: String,
    },

    /// A transient failure talking to the backend
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// Whether another attempt could succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SubmissionFailed(_) | Self::Unavailable(_))
    }
}

/// Executes data descriptions
///
/// `submit` starts the work and returns at once; completion is observed by
/// polling the handle.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Start executing `description`
    async fn submit(&self, description: &DataDescription) -> Result<ExecutionHandle, BackendError>;

    /// Current state of `handle`
    async fn poll(&self, handle: &ExecutionHandle) -> Result<ExecutionState, BackendError>;

    /// Ask the backend to stop `handle`; best effort
    async fn cancel(&self, handle: &ExecutionHandle) -> Result<(), BackendError>;
}
