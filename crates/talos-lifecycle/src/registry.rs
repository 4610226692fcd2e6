//! The active-service registry.
//!
//! Services are arena-allocated nodes addressed by stable indices;
//! dependency and dependent relations are index edges. Cycles are rejected
//! at edge-insertion time, so the registry always holds a DAG and
//! topological traversal cannot loop.

use std::collections::HashMap;

use semver::Version;

use talos_core::{Recipe, RunWith};

use crate::error::{LifecycleError, Result};
use crate::state::ServiceState;

/// Stable index of a service node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceIndex(usize);

/// One managed service.
#[derive(Debug, Clone)]
pub struct ServiceNode {
    /// Service (component) name.
    pub name: String,

    /// Active version.
    pub version: Version,

    /// Lifecycle state.
    pub state: ServiceState,

    /// The platform-resolved recipe.
    pub recipe: Recipe,

    /// Identity/limits override from the deployment document.
    pub run_with: Option<RunWith>,

    /// Remaining retry budget for the current deployment.
    pub retries_left: u32,

    /// Index edges to dependencies (must be running first).
    pub dependencies: Vec<ServiceIndex>,

    /// Index edges to dependents.
    pub dependents: Vec<ServiceIndex>,
}

/// The arena of managed services.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    nodes: Vec<Option<ServiceNode>>,
    by_name: HashMap<String, ServiceIndex>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Returns true if no services are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Inserts a service in state [`ServiceState::New`] with no edges.
    pub fn insert(
        &mut self,
        recipe: Recipe,
        run_with: Option<RunWith>,
        retry_budget: u32,
    ) -> ServiceIndex {
        let name = recipe.component_name.clone();
        let node = ServiceNode {
            name: name.clone(),
            version: recipe.component_version.clone(),
            state: ServiceState::New,
            recipe,
            run_with,
            retries_left: retry_budget,
            dependencies: Vec::new(),
            dependents: Vec::new(),
        };

        let index = ServiceIndex(self.nodes.len());
        self.nodes.push(Some(node));
        self.by_name.insert(name, index);
        index
    }

    /// Looks up a service index by name.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<ServiceIndex> {
        self.by_name.get(name).copied()
    }

    /// Returns the node at `index`, if it still exists.
    #[must_use]
    pub fn get(&self, index: ServiceIndex) -> Option<&ServiceNode> {
        self.nodes.get(index.0).and_then(Option::as_ref)
    }

    /// Returns the node by name.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<&ServiceNode> {
        self.index_of(name).and_then(|idx| self.get(idx))
    }

    /// Returns a mutable node by name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut ServiceNode> {
        let index = self.index_of(name)?;
        self.nodes.get_mut(index.0).and_then(Option::as_mut)
    }

    /// Adds a dependency edge `from -> to`, rejecting cycles.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::DependencyCycle`] if `from` is reachable
    /// from `to`, and [`LifecycleError::UnknownService`] for dangling names.
    pub fn add_dependency(&mut self, from: &str, to: &str) -> Result<()> {
        let from_idx = self
            .index_of(from)
            .ok_or_else(|| LifecycleError::UnknownService {
                service: from.to_string(),
            })?;
        let to_idx = self
            .index_of(to)
            .ok_or_else(|| LifecycleError::UnknownService {
                service: to.to_string(),
            })?;

        if from_idx == to_idx || self.reaches(to_idx, from_idx) {
            return Err(LifecycleError::DependencyCycle {
                service: from.to_string(),
                dependency: to.to_string(),
            });
        }

        if let Some(node) = self.nodes[from_idx.0].as_mut() {
            if !node.dependencies.contains(&to_idx) {
                node.dependencies.push(to_idx);
            }
        }
        if let Some(node) = self.nodes[to_idx.0].as_mut() {
            if !node.dependents.contains(&from_idx) {
                node.dependents.push(from_idx);
            }
        }
        Ok(())
    }

    /// DFS reachability over dependency edges.
    fn reaches(&self, from: ServiceIndex, target: ServiceIndex) -> bool {
        let mut stack = vec![from];
        let mut seen = vec![false; self.nodes.len()];
        while let Some(idx) = stack.pop() {
            if idx == target {
                return true;
            }
            if seen[idx.0] {
                continue;
            }
            seen[idx.0] = true;
            if let Some(node) = self.get(idx) {
                stack.extend(&node.dependencies);
            }
        }
        false
    }

    /// Removes a service and unlinks its edges.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::UnknownService`] if absent.
    pub fn remove(&mut self, name: &str) -> Result<ServiceNode> {
        let index = self
            .index_of(name)
            .ok_or_else(|| LifecycleError::UnknownService {
                service: name.to_string(),
            })?;

        let node = self.nodes[index.0]
            .take()
            .ok_or_else(|| LifecycleError::UnknownService {
                service: name.to_string(),
            })?;
        self.by_name.remove(name);

        for other in self.nodes.iter_mut().flatten() {
            other.dependencies.retain(|&idx| idx != index);
            other.dependents.retain(|&idx| idx != index);
        }
        Ok(node)
    }

    /// Transitions a service, enforcing the state machine. Returns the
    /// previous state.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown services or illegal transitions.
    pub fn transition(&mut self, name: &str, to: ServiceState) -> Result<ServiceState> {
        let node = self
            .get_mut(name)
            .ok_or_else(|| LifecycleError::UnknownService {
                service: name.to_string(),
            })?;

        let from = node.state;
        if !from.can_transition_to(to) {
            return Err(LifecycleError::InvalidTransition {
                service: name.to_string(),
                from,
                to,
            });
        }
        node.state = to;
        Ok(from)
    }

    /// Iterates live nodes.
    pub fn iter(&self) -> impl Iterator<Item = &ServiceNode> {
        self.nodes.iter().flatten()
    }

    /// Names of live services in topological order, dependencies first.
    ///
    /// The registry is cycle-free by construction, so this always covers
    /// every node.
    #[must_use]
    pub fn topological_order(&self) -> Vec<String> {
        let mut indegree: HashMap<usize, usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|node| (i, node.dependencies.len())))
            .collect();

        let mut ready: Vec<usize> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(&i, _)| i)
            .collect();
        ready.sort_unstable();

        let mut order = Vec::with_capacity(indegree.len());
        while let Some(i) = ready.pop() {
            let Some(node) = self.nodes[i].as_ref() else {
                continue;
            };
            order.push(node.name.clone());
            for &ServiceIndex(dependent) in &node.dependents {
                if let Some(degree) = indegree.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(dependent);
                    }
                }
            }
        }
        order
    }
}
