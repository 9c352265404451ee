//! Combinatorial chain construction.
//!
//! Every chain through level k is extended by every task unit of every
//! service newly introduced at level k, so the chain count grows as the
//! product of the binding counts of all ancestor services. The builder
//! refuses to materialize a level once the chains of every level so far
//! would exceed `max_chains` in total.

use crate::expand::ParameterExpander;
use crate::graph::{LevelAssignment, ServiceGraph};
use ensemble_core::{Chain, CoreError, CoreResult, RequestAxes, TaskUnit};
use indexmap::IndexMap;

/// Default hard cap on chains summed over all levels
pub const DEFAULT_MAX_CHAINS: usize = 10_000;

/// Builds level-ordered chains for a target service
pub struct ChainBuilder<'g> {
    graph: &'g ServiceGraph,
    expander: ParameterExpander,
    max_chains: usize,
}

impl<'g> ChainBuilder<'g> {
    /// Create a builder over `graph`
    #[must_use]
    pub fn new(graph: &'g ServiceGraph) -> Self {
        Self {
            graph,
            expander: ParameterExpander::new(),
            max_chains: DEFAULT_MAX_CHAINS,
        }
    }

    /// Set the cap on chains summed over all levels (0 = unlimited)
    #[must_use]
    pub fn with_max_chains(mut self, max: usize) -> Self {
        self.max_chains = max;
        self
    }

    /// Use a custom expander
    #[must_use]
    pub fn with_expander(mut self, expander: ParameterExpander) -> Self {
        self.expander = expander;
        self
    }

    /// Build every chain from the most upstream services down to `target`
    ///
    /// # Errors
    ///
    /// - `UnknownService` if `target` is not registered
    /// - expansion errors for any ancestor
    /// - `CapacityExceeded` if the chains of all levels would exceed the cap
    pub fn build(&self, target: &str, axes: &RequestAxes) -> CoreResult<ChainPlan> {
        let levels = self.graph.level_assignment(target)?;

        let mut units: IndexMap<String, Vec<TaskUnit>> = IndexMap::new();
        for (_, services) in levels.iter() {
            for name in services {
                let service = self.graph.resolve(name)?;
                units.insert(name.clone(), self.expander.expand_declared(service, axes)?);
            }
        }

        let mut chains: Vec<Vec<Chain>> = Vec::with_capacity(levels.len());
        let mut total = 0;
        for (level, services) in levels.iter() {
            let base = chains.last().map_or(1, Vec::len);
            total = self.check_capacity(total, base, services.iter().map(|s| units_len(&units, s)))?;

            let mut current: Vec<Chain> = chains.last().cloned().unwrap_or_default();
            for name in services {
                let introduced = units.get(name).map(Vec::as_slice).unwrap_or(&[]);
                current = if current.is_empty() {
                    introduced.iter().cloned().map(Chain::singleton).collect()
                } else {
                    let mut joined = Vec::with_capacity(current.len() * introduced.len());
                    for unit in introduced {
                        for chain in &current {
                            joined.push(chain.extended(unit.clone()));
                        }
                    }
                    joined
                };
            }

            tracing::debug!(level, services = services.len(), chains = current.len(), "built chain level");
            chains.push(current);
        }

        Ok(ChainPlan {
            target: target.to_string(),
            levels,
            units,
            chains,
        })
    }

    /// Running chain total once the next level is added
    fn check_capacity(&self, total: usize, base: usize, counts: impl Iterator<Item = usize>) -> CoreResult<usize> {
        let mut projected = Some(base);
        for count in counts {
            projected = projected.and_then(|p| p.checked_mul(count));
        }
        match projected.and_then(|n| n.checked_add(total)) {
            Some(n) if self.max_chains == 0 || n <= self.max_chains => Ok(n),
            _ => Err(CoreError::CapacityExceeded {
                resource: "chains".to_string(),
                limit: self.max_chains as u64,
            }),
        }
    }
}

fn units_len(units: &IndexMap<String, Vec<TaskUnit>>, service: &str) -> usize {
    units.get(service).map_or(0, Vec::len)
}

/// Output of [`ChainBuilder::build`]
#[derive(Debug, Clone)]
pub struct ChainPlan {
    target: String,
    levels: LevelAssignment,
    units: IndexMap<String, Vec<TaskUnit>>,
    chains: Vec<Vec<Chain>>,
}

impl ChainPlan {
    /// Target service
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The level assignment the chains were built over
    #[must_use]
    pub fn levels(&self) -> &LevelAssignment {
        &self.levels
    }

    /// Task units expanded for `service`
    #[must_use]
    pub fn units_for(&self, service: &str) -> &[TaskUnit] {
        self.units.get(service).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Chains built through `level`
    #[must_use]
    pub fn chains_at(&self, level: usize) -> &[Chain] {
        self.chains.get(level).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Chains ending at the target
    #[must_use]
    pub fn final_chains(&self) -> &[Chain] {
        self.chains.last().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of levels
    #[must_use]
    pub fn level_count(&self) -> usize {
        self.chains.len()
    }
}
