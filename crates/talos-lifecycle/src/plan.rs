//! Update plan computation.
//!
//! The plan is the diff between the resolved target set and the currently
//! active set: which services stop, which install, which only need a
//! configuration change. Execution order is stop removals (reverse
//! dependency order), install (dependency order), reconfigure, then start
//! new or changed services (dependency order). An identical re-deployment
//! yields an empty plan and therefore no service transitions.

use std::collections::{BTreeMap, HashMap, HashSet};

use semver::Version;

use talos_core::{ComponentId, Recipe, RunWith};

/// One component of the resolved target set.
#[derive(Debug, Clone)]
pub struct TargetComponent {
    /// The pinned component.
    pub id: ComponentId,

    /// Platform-resolved recipe.
    pub recipe: Recipe,

    /// Fully merged and interpolated configuration.
    pub configuration: serde_json::Value,

    /// Identity/limits from the deployment document.
    pub run_with: Option<RunWith>,

    /// Names of dependencies within the target set.
    pub dependencies: Vec<String>,

    /// Extra environment the engine injects into lifecycle scripts.
    pub environment: BTreeMap<String, String>,
}

/// A currently-active component, as the executor sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveComponent {
    /// Active version.
    pub version: Version,

    /// Live configuration.
    pub configuration: serde_json::Value,

    /// Identity/limits it was started with.
    pub run_with: Option<RunWith>,
}

/// The computed difference between current and target state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatePlan {
    /// Services to stop and remove, reverse dependency order.
    pub to_remove: Vec<String>,

    /// Components to install (new, or version changed), dependency order.
    pub to_install: Vec<String>,

    /// Same name+version but changed configuration or run-with.
    pub to_reconfigure: Vec<String>,

    /// Services to (re)start, dependency order.
    pub to_start: Vec<String>,
}

impl UpdatePlan {
    /// Returns true when the deployment changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_remove.is_empty()
            && self.to_install.is_empty()
            && self.to_reconfigure.is_empty()
            && self.to_start.is_empty()
    }
}

/// Topologically sorts `names` so that dependencies come before dependents.
///
/// `dependencies` maps each name to its dependency names; edges leaving the
/// set are ignored. The input is expected to be cycle-free (the resolver
/// rejects cycles); any residual nodes are appended in name order so the
/// output always covers the input.
#[must_use]
pub fn topological_order(
    names: &[String],
    dependencies: &HashMap<String, Vec<String>>,
) -> Vec<String> {
    let in_set: HashSet<&String> = names.iter().collect();

    let mut indegree: BTreeMap<&String, usize> = names.iter().map(|n| (n, 0)).collect();
    let mut dependents: HashMap<&String, Vec<&String>> = HashMap::new();
    for name in names {
        for dep in dependencies.get(name).into_iter().flatten() {
            if in_set.contains(dep) {
                *indegree.entry(name).or_default() += 1;
                dependents.entry(dep).or_default().push(name);
            }
        }
    }

    let mut ready: Vec<&String> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(&name, _)| name)
        .collect();

    let mut order = Vec::with_capacity(names.len());
    let mut placed: HashSet<&String> = HashSet::new();
    while let Some(name) = ready.pop() {
        order.push(name.clone());
        placed.insert(name);
        for &dependent in dependents.get(name).into_iter().flatten() {
            if let Some(degree) = indegree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(dependent);
                }
            }
        }
    }

    for name in names {
        if !placed.contains(name) {
            order.push(name.clone());
        }
    }
    order
}

/// Computes the update plan from the active set to the target set.
///
/// `current_dependencies` is the dependency graph of the active set; it
/// orders the removals so dependents stop before their dependencies.
#[must_use]
pub fn compute_plan(
    current: &BTreeMap<String, ActiveComponent>,
    current_dependencies: &HashMap<String, Vec<String>>,
    targets: &BTreeMap<String, TargetComponent>,
) -> UpdatePlan {
    let dependency_map: HashMap<String, Vec<String>> = targets
        .values()
        .map(|t| (t.id.name.clone(), t.dependencies.clone()))
        .collect();
    let target_names: Vec<String> = targets.keys().cloned().collect();
    let target_order = topological_order(&target_names, &dependency_map);

    let mut to_install = Vec::new();
    let mut to_reconfigure = Vec::new();
    let mut to_start = Vec::new();

    for name in &target_order {
        let Some(target) = targets.get(name) else {
            continue;
        };
        match current.get(name) {
            None => {
                to_install.push(name.clone());
                if target.recipe.is_service() {
                    to_start.push(name.clone());
                }
            }
            Some(active) if active.version != target.id.version => {
                to_install.push(name.clone());
                if target.recipe.is_service() {
                    to_start.push(name.clone());
                }
            }
            Some(active) => {
                let changed = active.configuration != target.configuration
                    || active.run_with != target.run_with;
                if changed {
                    to_reconfigure.push(name.clone());
                    if target.recipe.is_service() {
                        to_start.push(name.clone());
                    }
                }
            }
        }
    }

    // Removals: active services with no counterpart in the target set,
    // stopped dependents-first.
    let current_names: Vec<String> = current
        .keys()
        .filter(|name| !targets.contains_key(*name))
        .cloned()
        .collect();
    let mut to_remove = topological_order(&current_names, current_dependencies);
    to_remove.reverse();

    UpdatePlan {
        to_remove,
        to_install,
        to_reconfigure,
        to_start,
    }
}
