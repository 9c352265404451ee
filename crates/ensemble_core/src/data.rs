//! Data descriptions - the durable unit of execution.

use crate::binding::Binding;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The record submitted for execution and persisted to the registry
///
/// One data description exists per (service, output hash). It is built at
/// dispatch time and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataDescription {
    /// Content-addressed identifier of this output
    #[serde(rename = "dataId")]
    pub data_id: String,
    /// Service that produces the output
    pub service: String,
    /// Upstream service name to storage locator
    pub inputs: BTreeMap<String, String>,
    /// Output name to storage locator
    pub outputs: BTreeMap<String, String>,
    /// The binding for this service only
    pub parameters: Binding,
}

impl DataDescription {
    /// Storage locator of the named output
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&str> {
        self.outputs.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_data_description_serde_field_names() {
        let desc = DataDescription {
            data_id: "SelectLocation:abc".to_string(),
            service: "SelectLocation".to_string(),
            inputs: BTreeMap::new(),
            outputs: [("output".to_string(), "s3://bucket/SelectLocation/abc".to_string())]
                .into_iter()
                .collect(),
            parameters: Binding::new().with("locations", json!("Dhaka")),
        };

        let value = serde_json::to_value(&desc).unwrap();
        assert_eq!(value["dataId"], "SelectLocation:abc");
        assert_eq!(value["parameters"]["locations"], "Dhaka");
        assert_eq!(desc.output("output"), Some("s3://bucket/SelectLocation/abc"));

        let back: DataDescription = serde_json::from_value(value).unwrap();
        assert_eq!(back, desc);
    }
}
