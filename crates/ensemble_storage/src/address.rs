//! Content addressing for chain outputs.
//!
//! A chain prefix is identified by the ordered join of its unit hashes, so
//! two chains that share an identical prefix share the same `dataId` and
//! storage locators for every unit in that prefix.

use ensemble_core::{Chain, CoreError, CoreResult, DataDescription, TaskUnit};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Delimiter between unit hashes in a chain hash
pub const CHAIN_HASH_DELIMITER: &str = "-";

/// Separator between service name and output hash in a `dataId`
pub const DATA_ID_SEPARATOR: &str = ":";

/// Name of the single output every data description declares
pub const DEFAULT_OUTPUT: &str = "output";

/// Default storage base
pub const DEFAULT_STORAGE_BASE: &str = "file://./ensemble-data";

/// Where outputs are written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatorConfig {
    /// URI prefix for every locator
    pub base: String,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            base: DEFAULT_STORAGE_BASE.to_string(),
        }
    }
}

impl LocatorConfig {
    /// Create with a custom base; trailing slashes are dropped
    #[must_use]
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    /// Locator for `hash` produced by `service`
    #[must_use]
    pub fn locate(&self, hash: &str, service: &str) -> String {
        storage_locator(&self.base, hash, service)
    }
}

/// Join the hashes of `units` in order
#[must_use]
pub fn chain_hash(units: &[TaskUnit]) -> String {
    units
        .iter()
        .map(|u| u.hash.to_hex())
        .collect::<Vec<_>>()
        .join(CHAIN_HASH_DELIMITER)
}

/// Chain hash over the whole chain
#[must_use]
pub fn output_hash(chain: &Chain) -> String {
    chain_hash(chain.units())
}

/// `service` and `output_hash` joined by [`DATA_ID_SEPARATOR`]
#[must_use]
pub fn data_id(service: &str, output_hash: &str) -> String {
    format!("{}{}{}", service, DATA_ID_SEPARATOR, output_hash)
}

/// `<base>/<service>/<hash>`
#[must_use]
pub fn storage_locator(base: &str, hash: &str, service: &str) -> String {
    format!("{}/{}/{}", base.trim_end_matches('/'), service, hash)
}

/// Data description for the chain's final unit
///
/// # Errors
///
/// Returns error if the chain is empty
pub fn build_data_description(
    chain: &Chain,
    locator: &LocatorConfig,
    is_upstream: impl Fn(&str) -> bool,
) -> CoreResult<DataDescription> {
    let last = chain.len().checked_sub(1).ok_or_else(|| CoreError::Validation {
        field: "chain".to_string(),
        reason: "cannot describe an empty chain".to_string(),
    })?;
    build_data_description_at(chain, last, locator, is_upstream)
}

/// Data description for the unit at `position`
///
/// Every earlier unit whose service satisfies `is_upstream` contributes an
/// input locator built from its own prefix hash.
///
/// # Errors
///
/// Returns error if `position` is out of bounds
pub fn build_data_description_at(
    chain: &Chain,
    position: usize,
    locator: &LocatorConfig,
    is_upstream: impl Fn(&str) -> bool,
) -> CoreResult<DataDescription> {
    let units = chain.units();
    let unit = units.get(position).ok_or_else(|| CoreError::Validation {
        field: "position".to_string(),
        reason: format!("{} out of bounds for chain of {}", position, units.len()),
    })?;

    let inputs: BTreeMap<String, String> = units[..position]
        .iter()
        .enumerate()
        .filter(|(_, u)| is_upstream(&u.service))
        .map(|(i, u)| (u.service.clone(), locator.locate(&chain_hash(&units[..=i]), &u.service)))
        .collect();

    let hash = chain_hash(&units[..=position]);
    let mut outputs = BTreeMap::new();
    outputs.insert(DEFAULT_OUTPUT.to_string(), locator.locate(&hash, &unit.service));

    Ok(DataDescription {
        data_id: data_id(&unit.service, &hash),
        service: unit.service.clone(),
        inputs,
        outputs,
        parameters: unit.binding.clone(),
    })
}
