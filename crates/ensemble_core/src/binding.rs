//! Parameter bindings and task units.
//!
//! A binding maps each parameter of one service to exactly one value. Its
//! content hash is taken over a canonical JSON rendering: object keys in
//! lexicographic order, no whitespace, strings escaped by serde_json. The
//! rendering never depends on map iteration order, so the same binding
//! hashes identically in every process.

use crate::hash::Hash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single candidate value for a parameter
pub type ParamValue = serde_json::Value;

/// Hash domain for bindings. Bump the version to invalidate every cached
/// result after a canonicalization change.
pub const BINDING_HASH_DOMAIN: &str = "ensemble/binding/v1";

/// One concrete value per parameter, scoped to one service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Binding(BTreeMap<String, ParamValue>);

impl Binding {
    /// Create an empty binding
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Bind a parameter, replacing any previous value
    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        self.0.insert(name.into(), value);
    }

    /// Builder form of [`Binding::insert`]
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.insert(name, value);
        self
    }

    /// Value bound to `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    /// Iterate in parameter-name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    /// Number of bound parameters
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if nothing is bound
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical byte rendering used for hashing
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push('{');
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_json_string(&mut out, name);
            out.push(':');
            write_canonical(&mut out, value);
        }
        out.push('}');
        out.into_bytes()
    }

    /// Deterministic content hash of this binding
    #[must_use]
    pub fn content_hash(&self) -> Hash {
        Hash::compute_tagged(BINDING_HASH_DOMAIN, &self.canonical_bytes())
    }
}

impl FromIterator<(String, ParamValue)> for Binding {
    fn from_iter<T: IntoIterator<Item = (String, ParamValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn write_canonical(out: &mut String, value: &ParamValue) {
    match value {
        serde_json::Value::Object(map) => {
            // serde_json may be built with `preserve_order`; sort explicitly.
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(out, k);
                out.push(':');
                write_canonical(out, v);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, v);
            }
            out.push(']');
        }
        serde_json::Value::String(s) => write_json_string(out, s),
        other => out.push_str(&other.to_string()),
    }
}

fn write_json_string(out: &mut String, s: &str) {
    out.push_str(&serde_json::Value::String(s.to_string()).to_string());
}

/// A binding plus its content hash, scoped to one service
///
/// Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUnit {
    /// Service this unit belongs to
    pub service: String,
    /// Content hash of `binding`
    pub hash: Hash,
    /// The concrete parameters
    pub binding: Binding,
}

impl TaskUnit {
    /// Create a task unit, hashing the binding
    #[must_use]
    pub fn new(service: impl Into<String>, binding: Binding) -> Self {
        let hash = binding.content_hash();
        Self {
            service: service.into(),
            hash,
            binding,
        }
    }
}
