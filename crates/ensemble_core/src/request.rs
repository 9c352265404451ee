//! Execution requests and parameter axes.

use crate::binding::ParamValue;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Candidate values for one parameter in one request
///
/// On the wire an axis is a JSON array of candidates. A bare non-array value
/// is accepted as a single-candidate axis, so `"locations": "Dhaka"` and
/// `"locations": ["Dhaka"]` are equivalent. A parameter whose single
/// candidate is itself an array must therefore be wrapped:
/// `"window": [[1980, 2020]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Axis(Vec<ParamValue>);

impl Axis {
    /// Create an axis from candidates
    #[must_use]
    pub fn new(values: Vec<ParamValue>) -> Self {
        Self(values)
    }

    /// Candidate values in request order
    #[must_use]
    pub fn values(&self) -> &[ParamValue] {
        &self.0
    }

    /// Number of candidates
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the axis has no candidates
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for Axis {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match ParamValue::deserialize(deserializer)? {
            ParamValue::Array(values) => Ok(Self(values)),
            single => Ok(Self(vec![single])),
        }
    }
}

impl From<Vec<ParamValue>> for Axis {
    fn from(values: Vec<ParamValue>) -> Self {
        Self(values)
    }
}

/// Parameter name to axis, for one service
pub type ServiceAxes = BTreeMap<String, Axis>;

/// Service name to its axes
pub type RequestAxes = BTreeMap<String, ServiceAxes>;

/// A request to execute `target_service` over every parameter combination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Service whose outputs are wanted
    pub target_service: String,
    /// Axes for the target and its ancestors
    #[serde(default)]
    pub parameters: RequestAxes,
    /// Recompute even when a cached result exists
    #[serde(default)]
    pub force_rerun: bool,
}

impl ExecutionRequest {
    /// Create a request with no axes
    #[must_use]
    pub fn new(target_service: impl Into<String>) -> Self {
        Self {
            target_service: target_service.into(),
            parameters: RequestAxes::new(),
            force_rerun: false,
        }
    }

    /// Add an axis for `service.parameter`
    #[must_use]
    pub fn with_axis(
        mut self,
        service: impl Into<String>,
        parameter: impl Into<String>,
        values: Vec<ParamValue>,
    ) -> Self {
        self.parameters
            .entry(service.into())
            .or_default()
            .insert(parameter.into(), Axis::new(values));
        self
    }

    /// Set the force-rerun flag
    #[must_use]
    pub fn with_force_rerun(mut self, force: bool) -> Self {
        self.force_rerun = force;
        self
    }
}
