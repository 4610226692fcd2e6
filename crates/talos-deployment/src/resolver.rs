//! The dependency resolver.
//!
//! Input is the effective root set: every contributing group's version
//! requirements plus the current document's. The resolver picks, per
//! component, the highest version satisfying every constraint (including
//! constraints contributed transitively by chosen recipes), then rejects
//! dependency cycles and emits the pinned set in reverse topological order
//! (leaves first).

use std::collections::{BTreeMap, HashMap, HashSet};

use semver::Version;

use talos_core::{ComponentId, ComponentRequirement, Recipe};
use talos_lifecycle::topological_order;
use talos_store::{ComponentFetcher, ComponentStore};

use crate::error::{DeploymentError, Result};

/// Bound on choose/verify rounds; reaching it means the constraint set
/// cannot stabilize.
const MAX_ROUNDS: usize = 256;

/// One version constraint and where it came from.
#[derive(Debug, Clone)]
pub struct Requirement {
    /// Contributing group id, or `name@version` for a recipe dependency.
    pub source: String,

    /// The constraint itself.
    pub requirement: ComponentRequirement,
}

impl Requirement {
    /// Creates a requirement.
    #[must_use]
    pub fn new(source: impl Into<String>, requirement: ComponentRequirement) -> Self {
        Self {
            source: source.into(),
            requirement,
        }
    }

    fn describe(&self) -> String {
        format!("{} ({})", self.source, self.requirement)
    }
}

/// A fully pinned component, ready for fetching and planning.
#[derive(Debug, Clone)]
pub struct ResolvedComponent {
    /// The chosen (name, version).
    pub id: ComponentId,

    /// Its platform-resolved recipe.
    pub recipe: Recipe,

    /// Dependency names within the resolved set.
    pub dependencies: Vec<String>,
}

/// Resolves root requirements into a pinned component list.
pub struct ComponentResolver<'a> {
    store: &'a ComponentStore,
    fetcher: &'a dyn ComponentFetcher,
}

impl<'a> ComponentResolver<'a> {
    /// Creates a resolver over the local store and a fetcher.
    #[must_use]
    pub const fn new(store: &'a ComponentStore, fetcher: &'a dyn ComponentFetcher) -> Self {
        Self { store, fetcher }
    }

    /// Resolves `roots` into a pinned, cycle-free, leaves-first list.
    ///
    /// # Errors
    ///
    /// Returns [`DeploymentError::NoViableVersion`] naming a conflicting
    /// requirement pair, [`DeploymentError::CircularDependency`] on a
    /// dependency cycle, or a fetch error.
    pub async fn resolve(
        &self,
        roots: &BTreeMap<String, Vec<Requirement>>,
    ) -> Result<Vec<ResolvedComponent>> {
        let mut chosen: BTreeMap<String, Recipe> = BTreeMap::new();

        for _ in 0..MAX_ROUNDS {
            let requirements = Self::collect_requirements(roots, &chosen);

            // Drop any choice a newly contributed constraint invalidates.
            let invalidated: Vec<String> = chosen
                .iter()
                .filter(|(name, recipe)| {
                    requirements.get(*name).is_some_and(|reqs| {
                        reqs.iter()
                            .any(|r| !r.requirement.matches(&recipe.component_version))
                    })
                })
                .map(|(name, _)| name.clone())
                .collect();
            for name in &invalidated {
                tracing::debug!(component = %name, "re-resolving after new constraints");
                chosen.remove(name);
            }

            let unresolved: Vec<String> = requirements
                .keys()
                .filter(|name| !chosen.contains_key(*name))
                .cloned()
                .collect();
            if invalidated.is_empty() && unresolved.is_empty() {
                return Self::finish(chosen);
            }

            for name in unresolved {
                let reqs = &requirements[&name];
                let version = self.choose_version(&name, reqs).await?;
                let id = ComponentId::new(name.clone(), version);
                let recipe = if self.store.has_recipe(&id) {
                    self.store.load_recipe(&id)?
                } else {
                    self.fetcher.fetch_recipe(&id).await?
                };
                tracing::debug!(component = %id, "version pinned");
                chosen.insert(name, recipe);
            }
        }

        Err(DeploymentError::CircularDependency {
            cycle: "constraint set failed to stabilize".to_string(),
        })
    }

    /// Roots plus every chosen recipe's dependency constraints.
    fn collect_requirements(
        roots: &BTreeMap<String, Vec<Requirement>>,
        chosen: &BTreeMap<String, Recipe>,
    ) -> BTreeMap<String, Vec<Requirement>> {
        let mut requirements = roots.clone();
        for recipe in chosen.values() {
            let parent = recipe.id().to_string();
            for (dep, spec) in &recipe.dependencies {
                requirements
                    .entry(dep.clone())
                    .or_default()
                    .push(Requirement::new(
                        parent.clone(),
                        spec.version_requirement.clone(),
                    ));
            }
        }
        requirements
    }

    /// Picks the highest candidate satisfying every requirement.
    async fn choose_version(&self, name: &str, reqs: &[Requirement]) -> Result<Version> {
        let mut candidates: Vec<Version> = self.store.list_versions(name);
        for version in self.fetcher.available_versions(name).await? {
            if !candidates.contains(&version) {
                candidates.push(version);
            }
        }
        candidates.sort_by(|a, b| b.cmp(a));

        if let Some(version) = candidates
            .iter()
            .find(|v| reqs.iter().all(|r| r.requirement.matches(v)))
        {
            return Ok(version.clone());
        }

        Err(Self::conflict_error(name, reqs, &candidates))
    }

    /// Names the pair of constraints no candidate satisfies together.
    fn conflict_error(
        name: &str,
        reqs: &[Requirement],
        candidates: &[Version],
    ) -> DeploymentError {
        if candidates.is_empty() || reqs.len() < 2 {
            let first = reqs
                .first()
                .map_or_else(|| "(no requirement)".to_string(), Requirement::describe);
            return DeploymentError::NoViableVersion {
                component: name.to_string(),
                first,
                second: format!("available versions [{}]", render_versions(candidates)),
            };
        }

        for (i, a) in reqs.iter().enumerate() {
            for b in &reqs[i + 1..] {
                let compatible = candidates
                    .iter()
                    .any(|v| a.requirement.matches(v) && b.requirement.matches(v));
                if !compatible {
                    return DeploymentError::NoViableVersion {
                        component: name.to_string(),
                        first: a.describe(),
                        second: b.describe(),
                    };
                }
            }
        }

        // Constraints pairwise compatible but jointly unsatisfiable.
        DeploymentError::NoViableVersion {
            component: name.to_string(),
            first: reqs[0].describe(),
            second: reqs[reqs.len() - 1].describe(),
        }
    }

    /// Cycle check and leaves-first ordering.
    fn finish(chosen: BTreeMap<String, Recipe>) -> Result<Vec<ResolvedComponent>> {
        let dependency_map: HashMap<String, Vec<String>> = chosen
            .iter()
            .map(|(name, recipe)| {
                let deps: Vec<String> = recipe
                    .dependencies
                    .keys()
                    .filter(|dep| chosen.contains_key(*dep))
                    .cloned()
                    .collect();
                (name.clone(), deps)
            })
            .collect();

        detect_cycle(&dependency_map)?;

        let names: Vec<String> = chosen.keys().cloned().collect();
        let order = topological_order(&names, &dependency_map);

        Ok(order
            .into_iter()
            .filter_map(|name| {
                let recipe = chosen.get(&name)?.clone();
                let dependencies = dependency_map.get(&name).cloned().unwrap_or_default();
                Some(ResolvedComponent {
                    id: recipe.id(),
                    recipe,
                    dependencies,
                })
            })
            .collect())
    }
}

/// DFS back-edge detection over the chosen dependency graph.
fn detect_cycle(dependency_map: &HashMap<String, Vec<String>>) -> Result<()> {
    let mut visited: HashSet<&String> = HashSet::new();
    let mut in_stack: Vec<&String> = Vec::new();

    fn visit<'a>(
        node: &'a String,
        dependency_map: &'a HashMap<String, Vec<String>>,
        visited: &mut HashSet<&'a String>,
        in_stack: &mut Vec<&'a String>,
    ) -> Result<()> {
        if let Some(pos) = in_stack.iter().position(|n| *n == node) {
            let mut cycle: Vec<&str> = in_stack[pos..].iter().map(|n| n.as_str()).collect();
            cycle.push(node.as_str());
            return Err(DeploymentError::CircularDependency {
                cycle: cycle.join(" -> "),
            });
        }
        if visited.contains(node) {
            return Ok(());
        }

        in_stack.push(node);
        for dep in dependency_map.get(node).into_iter().flatten() {
            visit(dep, dependency_map, visited, in_stack)?;
        }
        in_stack.pop();
        visited.insert(node);
        Ok(())
    }

    for node in dependency_map.keys() {
        visit(node, dependency_map, &mut visited, &mut in_stack)?;
    }
    Ok(())
}

fn render_versions(versions: &[Version]) -> String {
    versions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use talos_core::PlatformInfo;
    use talos_store::LocalStoreFetcher;

    fn setup() -> (tempfile::TempDir, ComponentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ComponentStore::open(
            dir.path().join("packages"),
            PlatformInfo::new("linux", "x86_64"),
        )
        .unwrap();
        (dir, store)
    }

    fn save(store: &ComponentStore, yaml: &str) {
        let recipe = Recipe::from_yaml(yaml, &PlatformInfo::new("linux", "x86_64")).unwrap();
        store.save_recipe(&recipe).unwrap();
    }

    fn roots(entries: &[(&str, &str, &str)]) -> BTreeMap<String, Vec<Requirement>> {
        let mut map: BTreeMap<String, Vec<Requirement>> = BTreeMap::new();
        for (name, source, req) in entries {
            map.entry((*name).to_string()).or_default().push(
                Requirement::new(*source, ComponentRequirement::parse(req).unwrap()),
            );
        }
        map
    }

    async fn resolve(
        store: &ComponentStore,
        roots: &BTreeMap<String, Vec<Requirement>>,
    ) -> Result<Vec<ResolvedComponent>> {
        let fetcher = LocalStoreFetcher::new(store.clone());
        ComponentResolver::new(store, &fetcher).resolve(roots).await
    }

    #[tokio::test]
    async fn test_picks_highest_satisfying_version() {
        let (_dir, store) = setup();
        for version in ["1.0.0", "1.5.0", "2.0.0"] {
            save(
                &store,
                &format!("componentName: app\ncomponentVersion: {version}\n"),
            );
        }

        let resolved = resolve(&store, &roots(&[("app", "fleet-a", ">=1.0.0, <2.0.0")]))
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id.version, Version::new(1, 5, 0));
    }

    #[tokio::test]
    async fn test_multiple_groups_constrain_together() {
        let (_dir, store) = setup();
        for version in ["1.0.0", "1.5.0", "2.0.0"] {
            save(
                &store,
                &format!("componentName: app\ncomponentVersion: {version}\n"),
            );
        }

        let resolved = resolve(
            &store,
            &roots(&[("app", "fleet-a", ">=1.0.0"), ("app", "fleet-b", "<2.0.0")]),
        )
        .await
        .unwrap();
        assert_eq!(resolved[0].id.version, Version::new(1, 5, 0));
    }

    #[tokio::test]
    async fn test_conflict_names_the_pair() {
        let (_dir, store) = setup();
        for version in ["1.0.0", "2.0.0"] {
            save(
                &store,
                &format!("componentName: app\ncomponentVersion: {version}\n"),
            );
        }

        let err = resolve(
            &store,
            &roots(&[("app", "fleet-a", ">=2.0.0"), ("app", "fleet-b", "1.0.0")]),
        )
        .await
        .unwrap_err();

        match err {
            DeploymentError::NoViableVersion { component, first, second } => {
                assert_eq!(component, "app");
                assert!(first.contains("fleet-a"));
                assert!(second.contains("fleet-b"));
            }
            other => panic!("expected NoViableVersion, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_transitive_dependencies_resolved_leaves_first() {
        let (_dir, store) = setup();
        save(
            &store,
            "componentName: main\ncomponentVersion: 1.0.0\ndependencies:\n  svc:\n    versionRequirement: '>=1.0.0'\n",
        );
        save(
            &store,
            "componentName: svc\ncomponentVersion: 1.2.0\ndependencies:\n  svc2:\n    versionRequirement: '1.0.0'\n",
        );
        save(&store, "componentName: svc2\ncomponentVersion: 1.0.0\n");

        let resolved = resolve(&store, &roots(&[("main", "fleet-a", "1.0.0")]))
            .await
            .unwrap();

        let order: Vec<&str> = resolved.iter().map(|r| r.id.name.as_str()).collect();
        let pos = |name: &str| order.iter().position(|n| *n == name).unwrap();
        assert_eq!(resolved.len(), 3);
        assert!(pos("svc2") < pos("svc"));
        assert!(pos("svc") < pos("main"));
    }

    #[tokio::test]
    async fn test_dependency_constraint_forces_downgrade() {
        let (_dir, store) = setup();
        for version in ["1.0.0", "2.0.0"] {
            save(
                &store,
                &format!("componentName: lib\ncomponentVersion: {version}\n"),
            );
        }
        save(
            &store,
            "componentName: main\ncomponentVersion: 1.0.0\ndependencies:\n  lib:\n    versionRequirement: '<2.0.0'\n",
        );

        // Without the dependency constraint lib would resolve to 2.0.0.
        let resolved = resolve(
            &store,
            &roots(&[("main", "fleet-a", "1.0.0"), ("lib", "fleet-a", ">=1.0.0")]),
        )
        .await
        .unwrap();

        let lib = resolved.iter().find(|r| r.id.name == "lib").unwrap();
        assert_eq!(lib.id.version, Version::new(1, 0, 0));
    }

    #[tokio::test]
    async fn test_cycle_detected() {
        let (_dir, store) = setup();
        save(
            &store,
            "componentName: a\ncomponentVersion: 1.0.0\ndependencies:\n  b:\n    versionRequirement: '1.0.0'\n",
        );
        save(
            &store,
            "componentName: b\ncomponentVersion: 1.0.0\ndependencies:\n  a:\n    versionRequirement: '1.0.0'\n",
        );

        let err = resolve(&store, &roots(&[("a", "fleet-a", "1.0.0")]))
            .await
            .unwrap_err();
        match err {
            DeploymentError::CircularDependency { cycle } => {
                assert!(cycle.contains("a"));
                assert!(cycle.contains("b"));
            }
            other => panic!("expected CircularDependency, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_component_reports_no_candidates() {
        let (_dir, store) = setup();
        let err = resolve(&store, &roots(&[("ghost", "fleet-a", "1.0.0")]))
            .await
            .unwrap_err();
        match err {
            DeploymentError::NoViableVersion { component, second, .. } => {
                assert_eq!(component, "ghost");
                assert!(second.contains("available versions"));
            }
            other => panic!("expected NoViableVersion, got {other}"),
        }
    }
}
