//! Service dependency graph.
//!
//! Nodes are registered services; an edge points from a dependency to its
//! dependent. The graph is acyclic at all times: a registration whose edges
//! would close a cycle is rejected before anything is touched.

use ensemble_core::{CoreError, CoreResult, Service};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Directed acyclic graph of registered services
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceGraph {
    /// All services, in first-registration order
    services: IndexMap<String, Service>,
    /// Reverse edges: dependency -> services that list it as an input
    dependents: IndexMap<String, IndexSet<String>>,
}

impl ServiceGraph {
    /// Create a new empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a service
    ///
    /// Re-registering a name replaces its attributes and incoming edges;
    /// services that depend on it keep their edges.
    ///
    /// # Errors
    ///
    /// - `UnknownDependency` if an input is not registered
    /// - `CycleDetected` if the new edges would close a cycle
    ///
    /// On error the graph is unchanged.
    pub fn register(&mut self, service: Service) -> CoreResult<()> {
        let inputs = unique_inputs(&service);

        if inputs.contains(&service.name) {
            return Err(CoreError::CycleDetected {
                service: service.name,
            });
        }

        for input in &inputs {
            if !self.services.contains_key(input) {
                return Err(CoreError::UnknownDependency {
                    service: service.name.clone(),
                    dependency: input.clone(),
                });
            }
        }

        // An edge input -> service closes a cycle iff service already reaches input.
        if self.services.contains_key(&service.name) {
            let downstream = self.descendants(&service.name);
            if inputs.iter().any(|i| downstream.contains(i)) {
                return Err(CoreError::CycleDetected {
                    service: service.name,
                });
            }
        }

        if let Some(previous) = self.services.get(&service.name) {
            for old in unique_inputs(previous) {
                if let Some(set) = self.dependents.get_mut(&old) {
                    set.shift_remove(&service.name);
                }
            }
        }

        for input in &inputs {
            self.dependents
                .entry(input.clone())
                .or_default()
                .insert(service.name.clone());
        }

        self.services.insert(service.name.clone(), service);
        Ok(())
    }

    /// Copy of this graph with `service` registered
    ///
    /// # Errors
    ///
    /// Same as [`ServiceGraph::register`]
    pub fn with_registered(&self, service: Service) -> CoreResult<Self> {
        let mut next = self.clone();
        next.register(service)?;
        Ok(next)
    }

    /// Look up a service
    ///
    /// # Errors
    ///
    /// Returns `UnknownService` if the name is not registered
    pub fn resolve(&self, name: &str) -> CoreResult<&Service> {
        self.services
            .get(name)
            .ok_or_else(|| CoreError::UnknownService {
                name: name.to_string(),
            })
    }

    /// Check if a service is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Direct inputs of a service
    #[must_use]
    pub fn dependencies(&self, name: &str) -> Vec<String> {
        self.services
            .get(name)
            .map(|s| unique_inputs(s).into_iter().collect())
            .unwrap_or_default()
    }

    /// Services that list `name` as a direct input
    #[must_use]
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.dependents
            .get(name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every service reachable backward from `name`, plus `name` itself
    ///
    /// # Errors
    ///
    /// Returns `UnknownService` if the name is not registered
    pub fn ancestors_inclusive(&self, name: &str) -> CoreResult<IndexSet<String>> {
        self.resolve(name)?;

        let mut visited = IndexSet::new();
        let mut stack = vec![name.to_string()];

        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(service) = self.services.get(&current) {
                for input in &service.inputs {
                    if !visited.contains(input) {
                        stack.push(input.clone());
                    }
                }
            }
        }

        Ok(visited)
    }

    /// Every service reachable forward from `name`, excluding `name`
    fn descendants(&self, name: &str) -> IndexSet<String> {
        let mut visited = IndexSet::new();
        let mut stack: Vec<String> = self.dependents(name);

        while let Some(current) = stack.pop() {
            if visited.insert(current.clone()) {
                stack.extend(self.dependents(&current));
            }
        }

        visited
    }

    /// Assign dependency levels to `target` and its ancestors
    ///
    /// Each ancestor gets the longest edge distance at which it reaches
    /// `target`; levels are then flipped so level 0 is the most upstream and
    /// the last level holds only `target`. A service reachable along paths of
    /// different length lands above every one of its own predecessors.
    ///
    /// # Errors
    ///
    /// Returns `UnknownService` if `target` is not registered
    pub fn level_assignment(&self, target: &str) -> CoreResult<LevelAssignment> {
        self.resolve(target)?;

        let mut distance: IndexMap<String, usize> = IndexMap::new();
        distance.insert(target.to_string(), 0);
        let mut queue = VecDeque::from([target.to_string()]);

        while let Some(current) = queue.pop_front() {
            let d = distance.get(&current).copied().unwrap_or(0);
            for input in self.dependencies(&current) {
                let longer = distance.get(&input).is_none_or(|&known| d + 1 > known);
                if longer {
                    distance.insert(input.clone(), d + 1);
                    queue.push_back(input);
                }
            }
        }

        let depth = distance.values().copied().max().unwrap_or(0);
        let mut levels: Vec<Vec<String>> = vec![Vec::new(); depth + 1];
        for (name, d) in &distance {
            levels[depth - d].push(name.clone());
        }
        for level in &mut levels {
            level.sort();
        }

        Ok(LevelAssignment::from_levels(levels))
    }

    /// Iterate services in first-registration order
    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    /// Get total node count
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.services.len()
    }

    /// Get total edge count
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.dependents.values().map(IndexSet::len).sum()
    }

    /// Check if the graph is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

fn unique_inputs(service: &Service) -> IndexSet<String> {
    service.inputs.iter().cloned().collect()
}

/// Services grouped by dependency level, level 0 first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelAssignment {
    levels: Vec<Vec<String>>,
    level_of: IndexMap<String, usize>,
}

impl LevelAssignment {
    fn from_levels(levels: Vec<Vec<String>>) -> Self {
        let level_of = levels
            .iter()
            .enumerate()
            .flat_map(|(i, names)| names.iter().map(move |n| (n.clone(), i)))
            .collect();
        Self { levels, level_of }
    }

    /// Level of a service, if it is on a path to the target
    #[must_use]
    pub fn level_of(&self, service: &str) -> Option<usize> {
        self.level_of.get(service).copied()
    }

    /// Services at `level`, sorted by name
    #[must_use]
    pub fn services_at(&self, level: usize) -> &[String] {
        self.levels.get(level).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Iterate `(level, services)` from upstream to target
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[String])> {
        self.levels.iter().enumerate().map(|(i, s)| (i, s.as_slice()))
    }

    /// Number of levels
    #[must_use]
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Check if there are no levels
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Index of the level holding the target
    #[must_use]
    pub fn target_level(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    /// Total number of services across all levels
    #[must_use]
    pub fn service_count(&self) -> usize {
        self.level_of.len()
    }
}
