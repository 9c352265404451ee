//! Loopback execution backend.
//!
//! Runs nothing. Each submission reports `Running` for a configured number
//! of polls and then `Completed`, unless its service was marked as failing
//! or stalled. Used for dry runs and tests.

use crate::backend::{BackendError, ExecutionBackend, ExecutionHandle, ExecutionState};
use async_trait::async_trait;
use ensemble_core::DataDescription;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;

struct Job {
    data_id: String,
    service: String,
    polls: u32,
    cancelled: bool,
}

#[derive(Default)]
struct State {
    jobs: HashMap<String, Job>,
    submitted: Vec<String>,
    cancelled: Vec<String>,
}

/// In-process backend that only pretends to execute
#[derive(Default)]
pub struct LoopbackBackend {
    polls_to_complete: u32,
    failing: HashSet<String>,
    stalled: HashSet<String>,
    rejections_left: AtomicU32,
    state: Mutex<State>,
}

impl LoopbackBackend {
    /// Backend that completes every submission on its first poll
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `Running` for `polls` polls before completing
    #[must_use]
    pub fn with_polls_to_complete(mut self, polls: u32) -> Self {
        self.polls_to_complete = polls;
        self
    }

    /// Every submission for `service` ends `Failed`
    #[must_use]
    pub fn with_failing_service(mut self, service: impl Into<String>) -> Self {
        self.failing.insert(service.into());
        self
    }

    /// Every submission for `service` stays `Running` until cancelled
    #[must_use]
    pub fn with_stalled_service(mut self, service: impl Into<String>) -> Self {
        self.stalled.insert(service.into());
        self
    }

    /// Reject the next `count` submissions
    #[must_use]
    pub fn with_rejected_submissions(mut self, count: u32) -> Self {
        self.rejections_left = AtomicU32::new(count);
        self
    }

    /// Number of accepted submissions
    pub async fn submission_count(&self) -> usize {
        self.state.lock().await.submitted.len()
    }

    /// `dataId`s of accepted submissions, in order
    pub async fn submitted(&self) -> Vec<String> {
        self.state.lock().await.submitted.clone()
    }

    /// `dataId`s of cancelled submissions
    pub async fn cancelled(&self) -> Vec<String> {
        self.state.lock().await.cancelled.clone()
    }
}

#[async_trait]
impl ExecutionBackend for LoopbackBackend {
    async fn submit(&self, description: &DataDescription) -> Result<ExecutionHandle, BackendError> {
        let rejected = self
            .rejections_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(BackendError::SubmissionFailed("loopback rejection".to_string()));
        }

        let mut state = self.state.lock().await;
        let id = format!("loopback-{}", state.submitted.len());
        state.submitted.push(description.data_id.clone());
        state.jobs.insert(
            id.clone(),
            Job {
                data_id: description.data_id.clone(),
                service: description.service.clone(),
                polls: 0,
                cancelled: false,
            },
        );
        Ok(ExecutionHandle::new(id))
    }

    async fn poll(&self, handle: &ExecutionHandle) -> Result<ExecutionState, BackendError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(handle.as_str())
            .ok_or_else(|| BackendError::UnknownHandle(handle.to_string()))?;

        if job.cancelled {
            return Ok(ExecutionState::Failed("cancelled".to_string()));
        }
        if self.stalled.contains(&job.service) {
            return Ok(ExecutionState::Running);
        }

        job.polls += 1;
        if job.polls <= self.polls_to_complete {
            Ok(ExecutionState::Running)
        } else if self.failing.contains(&job.service) {
            Ok(ExecutionState::Failed(format!("{} configured to fail", job.service)))
        } else {
            Ok(ExecutionState::Completed)
        }
    }

    async fn cancel(&self, handle: &ExecutionHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(handle.as_str())
            .ok_or_else(|| BackendError::UnknownHandle(handle.to_string()))?;
        job.cancelled = true;
        let data_id = job.data_id.clone();
        state.cancelled.push(data_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::Binding;
    use std::collections::BTreeMap;

    fn description(service: &str) -> DataDescription {
        DataDescription {
            data_id: format!("{}:h", service),
            service: service.to_string(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            parameters: Binding::new(),
        }
    }

    #[tokio::test]
    async fn test_completes_after_polls() {
        let backend = LoopbackBackend::new().with_polls_to_complete(2);
        let handle = backend.submit(&description("A")).await.unwrap();

        assert_eq!(backend.poll(&handle).await.unwrap(), ExecutionState::Running);
        assert_eq!(backend.poll(&handle).await.unwrap(), ExecutionState::Running);
        assert_eq!(backend.poll(&handle).await.unwrap(), ExecutionState::Completed);
        assert_eq!(backend.submitted().await, vec!["A:h"]);
    }

    #[tokio::test]
    async fn test_failing_service() {
        let backend = LoopbackBackend::new().with_failing_service("A");
        let handle = backend.submit(&description("A")).await.unwrap();
        assert!(matches!(backend.poll(&handle).await.unwrap(), ExecutionState::Failed(_)));
    }

    #[tokio::test]
    async fn test_stalled_then_cancelled() {
        let backend = LoopbackBackend::new().with_stalled_service("A");
        let handle = backend.submit(&description("A")).await.unwrap();
        assert_eq!(backend.poll(&handle).await.unwrap(), ExecutionState::Running);

        backend.cancel(&handle).await.unwrap();
        assert!(backend.poll(&handle).await.unwrap().is_terminal());
        assert_eq!(backend.cancelled().await, vec!["A:h"]);
    }

    #[tokio::test]
    async fn test_rejected_submissions() {
        let backend = LoopbackBackend::new().with_rejected_submissions(1);
        assert!(backend.submit(&description("A")).await.is_err());
        assert!(backend.submit(&description("A")).await.is_ok());
        assert_eq!(backend.submission_count().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let backend = LoopbackBackend::new();
        let result = backend.poll(&ExecutionHandle::new("nope")).await;
        assert_eq!(result, Err(BackendError::UnknownHandle("nope".to_string())));
    }
}
