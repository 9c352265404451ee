//! Execution request validation.
//!
//! Collects every problem with a request up front instead of failing on the
//! first ancestor the chain builder happens to expand.

use crate::graph::ServiceGraph;
use ensemble_core::{CoreError, ExecutionRequest};

/// Non-fatal findings about a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    /// Axes given for a service that is not an ancestor of the target
    UnusedService {
        /// Service name
        service: String,
    },
    /// Axis given for a parameter the service does not declare
    UndeclaredParameter {
        /// Service name
        service: String,
        /// Parameter name
        parameter: String,
    },
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnusedService { service } => {
                write!(f, "Axes for {} ignored: not upstream of the target", service)
            }
            Self::UndeclaredParameter { service, parameter } => {
                write!(f, "Axis {} ignored: not declared by {}", parameter, service)
            }
        }
    }
}

/// Validator for execution requests
pub struct RequestValidator<'g> {
    graph: &'g ServiceGraph,
}

impl<'g> RequestValidator<'g> {
    /// Create a validator over `graph`
    #[must_use]
    pub fn new(graph: &'g ServiceGraph) -> Self {
        Self { graph }
    }

    /// Validate a request
    ///
    /// # Errors
    ///
    /// Returns every error found: unknown target, missing axes, empty axes
    pub fn validate(&self, request: &ExecutionRequest) -> Result<Vec<ValidationWarning>, Vec<CoreError>> {
        let ancestors = match self.graph.ancestors_inclusive(&request.target_service) {
            Ok(a) => a,
            Err(e) => return Err(vec![e]),
        };

        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for name in &ancestors {
            let Ok(service) = self.graph.resolve(name) else {
                continue;
            };
            let own = request.parameters.get(name);

            for parameter in &service.parameters {
                match own.and_then(|axes| axes.get(parameter)) {
                    None => errors.push(CoreError::MissingParameterAxes {
                        service: name.clone(),
                        parameter: own.map(|_| parameter.clone()),
                    }),
                    Some(axis) if axis.is_empty() => errors.push(CoreError::EmptyAxis {
                        service: name.clone(),
                        parameter: parameter.clone(),
                    }),
                    Some(_) => {}
                }
            }

            if let Some(axes) = own {
                for parameter in axes.keys().filter(|p| !service.declares(p)) {
                    warnings.push(ValidationWarning::UndeclaredParameter {
                        service: name.clone(),
                        parameter: parameter.clone(),
                    });
                }
            }
        }

        for service in request.parameters.keys() {
            if !ancestors.contains(service) {
                warnings.push(ValidationWarning::UnusedService {
                    service: service.clone(),
                });
            }
        }

        // One error per service is enough when the whole entry is absent
        errors.dedup();

        if errors.is_empty() {
            Ok(warnings)
        } else {
            Err(errors)
        }
    }
}
