//! Parameter axis expansion.
//!
//! Turns the multi-valued axes of one service into concrete bindings via
//! Cartesian product. Parameter names are walked in lexicographic order and
//! the last name varies fastest, so the output order is deterministic.

use ensemble_core::{Binding, CoreError, CoreResult, RequestAxes, Service, ServiceAxes, TaskUnit};

/// Expands per-service axes into task units
#[derive(Debug, Clone, Default)]
pub struct ParameterExpander {
    /// Upper bound on bindings per service (0 = unlimited)
    max_bindings: usize,
}

impl ParameterExpander {
    /// Create an expander without a binding limit
    #[must_use]
    pub fn new() -> Self {
        Self { max_bindings: 0 }
    }

    /// Limit the number of bindings a single service may expand to
    #[must_use]
    pub fn with_max_bindings(mut self, max: usize) -> Self {
        self.max_bindings = max;
        self
    }

    /// Expand the axes given for `service` in `axes`
    ///
    /// # Errors
    ///
    /// - `MissingParameterAxes` if `service` has no entry in `axes`
    /// - `EmptyAxis` if an axis has no candidates
    /// - `CapacityExceeded` if the product exceeds the binding limit
    pub fn expand(&self, service: &str, axes: &RequestAxes) -> CoreResult<Vec<TaskUnit>> {
        let own = axes
            .get(service)
            .ok_or_else(|| CoreError::MissingParameterAxes {
                service: service.to_string(),
                parameter: None,
            })?;
        self.expand_axes(service, own)
    }

    /// Expand only the parameters `service` declares
    ///
    /// Axes for undeclared names are skipped. A service declaring no
    /// parameters may be absent from `axes` and yields one empty binding.
    ///
    /// # Errors
    ///
    /// - `MissingParameterAxes` if a declared parameter has no axis
    /// - otherwise as [`ParameterExpander::expand`]
    pub fn expand_declared(&self, service: &Service, axes: &RequestAxes) -> CoreResult<Vec<TaskUnit>> {
        let Some(own) = axes.get(&service.name) else {
            if service.parameters.is_empty() {
                return Ok(vec![TaskUnit::new(service.name.clone(), Binding::new())]);
            }
            return Err(CoreError::MissingParameterAxes {
                service: service.name.clone(),
                parameter: None,
            });
        };

        let mut scoped = ServiceAxes::new();
        for parameter in &service.parameters {
            let axis = own
                .get(parameter)
                .ok_or_else(|| CoreError::MissingParameterAxes {
                    service: service.name.clone(),
                    parameter: Some(parameter.clone()),
                })?;
            scoped.insert(parameter.clone(), axis.clone());
        }

        for name in own.keys().filter(|n| !service.declares(n)) {
            tracing::warn!(service = %service.name, parameter = %name, "ignoring axis for undeclared parameter");
        }

        self.expand_axes(&service.name, &scoped)
    }

    /// Cartesian product over one service's axes
    ///
    /// # Errors
    ///
    /// - `EmptyAxis` if an axis has no candidates
    /// - `CapacityExceeded` if the product exceeds the binding limit
    pub fn expand_axes(&self, service: &str, axes: &ServiceAxes) -> CoreResult<Vec<TaskUnit>> {
        let mut total: usize = 1;
        for (name, axis) in axes {
            if axis.is_empty() {
                return Err(CoreError::EmptyAxis {
                    service: service.to_string(),
                    parameter: name.clone(),
                });
            }
            total = total
                .checked_mul(axis.len())
                .filter(|t| self.max_bindings == 0 || *t <= self.max_bindings)
                .ok_or_else(|| CoreError::CapacityExceeded {
                    resource: format!("bindings for {}", service),
                    limit: self.max_bindings as u64,
                })?;
        }

        let columns: Vec<(&String, &[ensemble_core::ParamValue])> =
            axes.iter().map(|(n, a)| (n, a.values())).collect();
        let mut cursor = vec![0usize; columns.len()];
        let mut units = Vec::with_capacity(total);

        loop {
            let binding: Binding = columns
                .iter()
                .zip(&cursor)
                .map(|((name, values), &i)| ((*name).clone(), values[i].clone()))
                .collect();
            units.push(TaskUnit::new(service, binding));

            // Odometer step, last column fastest
            let mut column = columns.len();
            loop {
                if column == 0 {
                    return Ok(units);
                }
                column -= 1;
                cursor[column] += 1;
                if cursor[column] < columns[column].1.len() {
                    break;
                }
                cursor[column] = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::Axis;
    use serde_json::json;
    use std::collections::HashSet;

    fn axes(entries: &[(&str, Vec<serde_json::Value>)]) -> ServiceAxes {
        entries
            .iter()
            .map(|(n, v)| (n.to_string(), Axis::new(v.clone())))
            .collect()
    }

    #[test]
    fn test_expand_cartesian_product() {
        let own = axes(&[("m", vec![json!(1), json!(2)]), ("l", vec![json!("A"), json!("B")])]);
        let units = ParameterExpander::new().expand_axes("svc", &own).unwrap();

        assert_eq!(units.len(), 4);
        let hashes: HashSet<_> = units.iter().map(|u| u.hash).collect();
        assert_eq!(hashes.len(), 4);
    }

    #[test]
    fn test_expand_order_last_name_fastest() {
        let own = axes(&[("a", vec![json!(1), json!(2)]), ("b", vec![json!("x"), json!("y")])]);
        let units = ParameterExpander::new().expand_axes("svc", &own).unwrap();

        let rendered: Vec<(i64, String)> = units
            .iter()
            .map(|u| {
                (
                    u.binding.get("a").and_then(|v| v.as_i64()).unwrap(),
                    u.binding.get("b").and_then(|v| v.as_str()).unwrap().to_string(),
                )
            })
            .collect();
        assert_eq!(
            rendered,
            vec![
                (1, "x".to_string()),
                (1, "y".to_string()),
                (2, "x".to_string()),
                (2, "y".to_string()),
            ]
        );
    }

    #[test]
    fn test_expand_no_axes_single_empty_binding() {
        let units = ParameterExpander::new().expand_axes("svc", &ServiceAxes::new()).unwrap();
        assert_eq!(units.len(), 1);
        assert!(units[0].binding.is_empty());
    }

    #[test]
    fn test_expand_empty_axis() {
        let own = axes(&[("m", vec![])]);
        let result = ParameterExpander::new().expand_axes("svc", &own);
        assert_eq!(
            result,
            Err(CoreError::EmptyAxis {
                service: "svc".to_string(),
                parameter: "m".to_string()
            })
        );
    }

    #[test]
    fn test_expand_missing_service() {
        let result = ParameterExpander::new().expand("svc", &RequestAxes::new());
        assert!(matches!(result, Err(CoreError::MissingParameterAxes { parameter: None, .. })));
    }

    #[test]
    fn test_expand_binding_limit() {
        let own = axes(&[("m", vec![json!(1), json!(2), json!(3)]), ("l", vec![json!(1), json!(2)])]);
        let result = ParameterExpander::new().with_max_bindings(5).expand_axes("svc", &own);
        assert!(matches!(result, Err(CoreError::CapacityExceeded { limit: 5, .. })));
    }

    #[test]
    fn test_expand_declared_scopes_axes() {
        let service = Service::new("BiasCorrection").with_parameters(["thresholds"]);
        let mut request = RequestAxes::new();
        request.insert(
            "BiasCorrection".to_string(),
            axes(&[("thresholds", vec![json!("1"), json!("2")]), ("stray", vec![json!(1), json!(2)])]),
        );

        let units = ParameterExpander::new().expand_declared(&service, &request).unwrap();
        assert_eq!(units.len(), 2);
        assert!(units.iter().all(|u| u.binding.get("stray").is_none()));
    }

    #[test]
    fn test_expand_declared_missing_parameter() {
        let service = Service::new("BiasCorrection").with_parameters(["thresholds", "methods"]);
        let mut request = RequestAxes::new();
        request.insert("BiasCorrection".to_string(), axes(&[("thresholds", vec![json!("1")])]));

        let result = ParameterExpander::new().expand_declared(&service, &request);
        assert_eq!(
            result,
            Err(CoreError::MissingParameterAxes {
                service: "BiasCorrection".to_string(),
                parameter: Some("methods".to_string()),
            })
        );
    }

    #[test]
    fn test_expand_declared_parameterless_service_may_be_absent() {
        let service = Service::new("Collect");
        let units = ParameterExpander::new()
            .expand_declared(&service, &RequestAxes::new())
            .unwrap();
        assert_eq!(units.len(), 1);

        let needs = Service::new("Collect").with_parameters(["x"]);
        assert!(ParameterExpander::new().expand_declared(&needs, &RequestAxes::new()).is_err());
    }

    #[test]
    fn test_expand_stable_across_calls() {
        let own = axes(&[("m", vec![json!(1), json!(2)]), ("l", vec![json!("A"), json!("B")])]);
        let first = ParameterExpander::new().expand_axes("svc", &own).unwrap();
        let second = ParameterExpander::new().expand_axes("svc", &own).unwrap();
        assert_eq!(first, second);
    }
}
