//! Execution chains.

use crate::binding::TaskUnit;
use serde::{Deserialize, Serialize};

/// An ordered sequence of task units, oldest first
///
/// A chain holds exactly one unit per service on its path. Chains are never
/// mutated; [`Chain::extended`] returns a new chain with one more unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Chain {
    units: Vec<TaskUnit>,
}

impl Chain {
    /// Create a chain holding a single unit
    #[must_use]
    pub fn singleton(unit: TaskUnit) -> Self {
        Self { units: vec![unit] }
    }

    /// Copy of this chain with `unit` appended
    #[must_use]
    pub fn extended(&self, unit: TaskUnit) -> Self {
        let mut units = Vec::with_capacity(self.units.len() + 1);
        units.extend(self.units.iter().cloned());
        units.push(unit);
        Self { units }
    }

    /// All units, oldest first
    #[must_use]
    pub fn units(&self) -> &[TaskUnit] {
        &self.units
    }

    /// The unit at `index`
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&TaskUnit> {
        self.units.get(index)
    }

    /// The most recently appended unit
    #[must_use]
    pub fn tip(&self) -> Option<&TaskUnit> {
        self.units.last()
    }

    /// Position of the unit belonging to `service`
    #[must_use]
    pub fn position_of(&self, service: &str) -> Option<usize> {
        self.units.iter().position(|u| u.service == service)
    }

    /// Number of units
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Check if the chain has no units
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}
