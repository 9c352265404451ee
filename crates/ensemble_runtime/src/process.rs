//! Local process execution backend.
//!
//! A service's `execution_template` names the program to run:
//!
//! ```json
//! { "command": ["python3", "bias_correction.py"], "env": { "MODE": "fast" } }
//! ```
//!
//! The data description is written as JSON to the child's stdin. Exit
//! status zero means `Completed`, anything else `Failed`.

use crate::backend::{BackendError, ExecutionBackend, ExecutionHandle, ExecutionState};
use async_trait::async_trait;
use ensemble_core::{DataDescription, Service};
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};

/// Argv and environment for one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    /// Program followed by its arguments
    pub argv: Vec<String>,
    /// Extra environment variables
    pub env: BTreeMap<String, String>,
}

impl CommandTemplate {
    /// Read the template from a service description
    ///
    /// # Errors
    ///
    /// Returns error if `command` is missing, empty or not an array of strings
    pub fn from_service(service: &Service) -> Result<Self, BackendError> {
        let invalid = |reason: &str| BackendError::InvalidTemplate {
            service: service.name.clone(),
            reason: reason.to_string(),
        };

        let argv: Vec<String> = service
            .execution_template
            .get("command")
            .and_then(|c| c.as_array())
            .ok_or_else(|| invalid("missing command array"))?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<_>>()
            .ok_or_else(|| invalid("command entries must be strings"))?;
        if argv.is_empty() {
            return Err(invalid("empty command"));
        }

        let env = service
            .execution_template
            .get("env")
            .and_then(|e| e.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self { argv, env })
    }
}

/// Runs each submission as a local child process
#[derive(Default)]
pub struct ProcessBackend {
    templates: RwLock<HashMap<String, CommandTemplate>>,
    children: Mutex<HashMap<String, Child>>,
    next_id: AtomicU64,
}

impl ProcessBackend {
    /// Create a backend with no known services
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Learn how to run `service`
    ///
    /// Services without a command template are skipped with a warning;
    /// submitting them later fails.
    pub async fn register_service(&self, service: &Service) {
        match CommandTemplate::from_service(service) {
            Ok(template) => {
                self.templates.write().await.insert(service.name.clone(), template);
            }
            Err(e) => tracing::warn!(service = %service.name, error = %e, "service cannot run locally"),
        }
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    async fn submit(&self, description: &DataDescription) -> Result<ExecutionHandle, BackendError> {
        let template = self
            .templates
            .read()
            .await
            .get(&description.service)
            .cloned()
            .ok_or_else(|| BackendError::InvalidTemplate {
                service: description.service.clone(),
                reason: "no command registered".to_string(),
            })?;

        let payload =
            serde_json::to_vec(description).map_err(|e| BackendError::SubmissionFailed(e.to_string()))?;

        let mut child = Command::new(&template.argv[0])
            .args(&template.argv[1..])
            .envs(&template.env)
            .env("ENSEMBLE_DATA_ID", &description.data_id)
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::SubmissionFailed(format!("{}: {}", template.argv[0], e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let data_id = description.data_id.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    tracing::debug!(data_id = %data_id, error = %e, "child closed stdin early");
                }
            });
        }

        let id = format!("process-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(handle = %id, pid = ?child.id(), data_id = %description.data_id, "spawned");
        self.children.lock().await.insert(id.clone(), child);
        Ok(ExecutionHandle::new(id))
    }

    async fn poll(&self, handle: &ExecutionHandle) -> Result<ExecutionState, BackendError> {
        let mut children = self.children.lock().await;
        let child = children
            .get_mut(handle.as_str())
            .ok_or_else(|| BackendError::UnknownHandle(handle.to_string()))?;

        match child.try_wait() {
            Ok(None) => Ok(ExecutionState::Running),
            Ok(Some(status)) => {
                children.remove(handle.as_str());
                if status.success() {
                    Ok(ExecutionState::Completed)
                } else {
                    Ok(ExecutionState::Failed(format!("exited with {}", status)))
                }
            }
            Err(e) => Err(BackendError::Unavailable(e.to_string())),
        }
    }

    async fn cancel(&self, handle: &ExecutionHandle) -> Result<(), BackendError> {
        let Some(mut child) = self.children.lock().await.remove(handle.as_str()) else {
            // Already reaped
            return Ok(());
        };
        let killed = child.start_kill();
        let id = handle.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::debug!(handle = %id, %status, "cancelled child reaped"),
                Err(e) => tracing::warn!(handle = %id, error = %e, "cancelled child not reaped"),
            }
        });
        killed.map_err(|e| BackendError::Unavailable(e.to_string()))
    }
}

impl ProcessBackend {
    /// Children still tracked
    pub async fn running_count(&self) -> usize {
        self.children.lock().await.len()
    }
}
