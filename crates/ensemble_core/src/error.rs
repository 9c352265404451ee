//! Core error types for ENSEMBLE.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
///
/// Registration and planning failures. All of them are raised before any
/// state is mutated, so a caller can retry after fixing the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A service declares an input that is not registered
    UnknownDependency {
        /// Service being registered
        service: String,
        /// Missing input
        dependency: String,
    },

    /// Lookup of a service that is not registered
    UnknownService {
        /// Requested name
        name: String,
    },

    /// Registration would close a cycle in the service graph
    CycleDetected {
        /// Service whose edges closed the cycle
        service: String,
    },

    /// No axes were supplied for a service reachable from the target
    MissingParameterAxes {
        /// Service lacking axes
        service: String,
        /// Declared parameter without an axis, if the service was present at all
        parameter: Option<String>,
    },

    /// An axis with no candidate values
    EmptyAxis {
        /// Service owning the axis
        service: String,
        /// Parameter name
        parameter: String,
    },

    /// Invalid hash format
    InvalidHash {
        /// Why parsing failed
        reason: String,
    },

    /// Validation error
    Validation {
        /// Offending field
        field: String,
        /// Why it is invalid
        reason: String,
    },

    /// Capacity exceeded
    CapacityExceeded {
        /// Resource that ran out
        resource: String,
        /// Configured limit
        limit: u64,
    },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownDependency {
                service,
                dependency,
            } => write!(
                f,
                "Unknown dependency: {} requires unregistered service {}",
                service, dependency
            ),
            Self::UnknownService { name } => write!(f, "Unknown service: {}", name),
            Self::CycleDetected { service } => {
                write!(f, "Cycle detected: registering {} would close a cycle", service)
            }
            Self::MissingParameterAxes { service, parameter } => match parameter {
                Some(p) => write!(f, "Missing parameter axes for {}: no axis for {}", service, p),
                None => write!(f, "Missing parameter axes for {}", service),
            },
            Self::EmptyAxis { service, parameter } => {
                write!(f, "Empty axis {} for service {}", parameter, service)
            }
            Self::InvalidHash { reason } => write!(f, "Invalid hash: {}", reason),
            Self::Validation { field, reason } => {
                write!(f, "Validation failed for {}: {}", field, reason)
            }
            Self::CapacityExceeded { resource, limit } => {
                write!(f, "Capacity exceeded for {}: {}", resource, limit)
            }
        }
    }
}

impl std::error::Error for CoreError {}
