//! ENSEMBLE Runtime
//!
//! Dispatches chain plans level by level against a registry and an
//! execution backend, with content-addressed caching, per-`dataId` claims,
//! bounded fan-out, polling with backoff and cancellation.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod loopback;
pub mod monitor;
pub mod process;
pub mod retry;

pub use backend::{BackendError, ExecutionBackend, ExecutionHandle, ExecutionState};
pub use config::{DispatchConfig, EngineConfig, DEFAULT_FAN_OUT};
pub use coordinator::{level_units, DispatchCoordinator, DispatchError, DispatchReport, LevelReport, LevelUnits};
pub use engine::{Engine, LevelPreview, PlanPreview};
pub use loopback::LoopbackBackend;
pub use monitor::{DispatchMetrics, MetricsSnapshot};
pub use process::{CommandTemplate, ProcessBackend};
pub use retry::{Backoff, PollPolicy, RetryPolicy};
