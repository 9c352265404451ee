//! Registered services.

use serde::{Deserialize, Serialize};

/// A named unit of computation
///
/// This is also the registration request shape:
/// `{name, parameters: [names], inputs: [service names], execution_template}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Unique service name
    pub name: String,
    /// Parameter names this service introduces
    #[serde(default)]
    pub parameters: Vec<String>,
    /// Direct upstream services
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Opaque execution reference, handed to the execution backend untouched
    #[serde(default)]
    pub execution_template: serde_json::Value,
}

impl Service {
    /// Create a service with no parameters or inputs
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
            inputs: Vec::new(),
            execution_template: serde_json::Value::Null,
        }
    }

    /// Declare parameters
    #[must_use]
    pub fn with_parameters<I, S>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters = parameters.into_iter().map(Into::into).collect();
        self
    }

    /// Declare inputs
    #[must_use]
    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    /// Set the execution template
    #[must_use]
    pub fn with_template(mut self, template: serde_json::Value) -> Self {
        self.execution_template = template;
        self
    }

    /// Whether this service declares the given parameter
    #[must_use]
    pub fn declares(&self, parameter: &str) -> bool {
        self.parameters.iter().any(|p| p == parameter)
    }
}
