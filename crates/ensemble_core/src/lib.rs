//! ENSEMBLE Core Types
//!
//! This crate contains pure types and logic with no I/O.
//! Everything that takes part in content addressing has a canonical,
//! cross-platform encoding so identities survive process restarts.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod binding;
pub mod chain;
pub mod data;
pub mod error;
pub mod hash;
pub mod id;
pub mod request;
pub mod service;

// Re-exports
pub use binding::{Binding, ParamValue, TaskUnit};
pub use chain::Chain;
pub use data::DataDescription;
pub use error::{CoreError, CoreResult};
pub use hash::{Hash, HashError};
pub use id::RunId;
pub use request::{Axis, ExecutionRequest, RequestAxes, ServiceAxes};
pub use service::Service;
