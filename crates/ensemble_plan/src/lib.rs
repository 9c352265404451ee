//! ENSEMBLE Planner
//!
//! Derives the dependency DAG from registered services, expands parameter
//! axes into bindings and enumerates every concretely-parameterized chain
//! from the most upstream services down to a target.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chains;
pub mod expand;
pub mod graph;
pub mod validate;

pub use chains::{ChainBuilder, ChainPlan, DEFAULT_MAX_CHAINS};
pub use expand::ParameterExpander;
pub use graph::{LevelAssignment, ServiceGraph};
pub use validate::{RequestValidator, ValidationWarning};
