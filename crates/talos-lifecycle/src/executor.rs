//! The lifecycle executor.
//!
//! Drives the update plan against the service registry: stop removals in
//! reverse dependency order, install in dependency order, then start new or
//! changed services in dependency order. Failed phases consume the service's
//! retry budget (running the `recover` script between attempts); an
//! exhausted budget leaves the service `Broken` and aborts the apply pass;
//! the coordinator decides whether that means rollback.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use semver::Version;
use tokio::sync::Mutex;

use talos_core::{ComponentUpdatePolicy, LifecyclePhase, RunWith, ScriptSpec, UpdateAction};

use crate::error::{LifecycleError, Result};
use crate::events::{LifecycleEventHub, ServiceStateChanged};
use crate::gate::{wait_for_update_clearance, UpdateGate};
use crate::plan::{TargetComponent, UpdatePlan};
use crate::registry::ServiceRegistry;
use crate::runner::{PhaseContext, PhaseOutcome, ScriptRunner, ServiceHandle};
use crate::state::ServiceState;

/// Default retry budget per service per deployment.
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// A point-in-time view of one managed service.
#[derive(Debug, Clone)]
pub struct ServiceSummary {
    /// Service name.
    pub name: String,

    /// Active version.
    pub version: Version,

    /// Current state.
    pub state: ServiceState,

    /// Identity/limits the service was deployed with.
    pub run_with: Option<RunWith>,
}

/// Drives service lifecycles for the deployment pipeline.
pub struct LifecycleExecutor {
    registry: Mutex<ServiceRegistry>,
    handles: Mutex<HashMap<String, ServiceHandle>>,
    runner: Arc<dyn ScriptRunner>,
    events: Arc<LifecycleEventHub>,
    retry_budget: u32,
}

impl LifecycleExecutor {
    /// Creates an executor over `runner`, publishing to `events`.
    #[must_use]
    pub fn new(runner: Arc<dyn ScriptRunner>, events: Arc<LifecycleEventHub>) -> Self {
        Self {
            registry: Mutex::new(ServiceRegistry::new()),
            handles: Mutex::new(HashMap::new()),
            runner,
            events,
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }

    /// Overrides the per-service retry budget.
    #[must_use]
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Snapshot of every managed service.
    pub async fn snapshot(&self) -> Vec<ServiceSummary> {
        let registry = self.registry.lock().await;
        registry
            .iter()
            .map(|node| ServiceSummary {
                name: node.name.clone(),
                version: node.version.clone(),
                state: node.state,
                run_with: node.run_with.clone(),
            })
            .collect()
    }

    /// The dependency graph of the active set, by name.
    pub async fn dependency_map(&self) -> HashMap<String, Vec<String>> {
        let registry = self.registry.lock().await;
        registry
            .iter()
            .map(|node| {
                let deps = node
                    .dependencies
                    .iter()
                    .filter_map(|&idx| registry.get(idx))
                    .map(|dep| dep.name.clone())
                    .collect();
                (node.name.clone(), deps)
            })
            .collect()
    }

    /// The state of one service, if managed.
    pub async fn service_state(&self, name: &str) -> Option<ServiceState> {
        let registry = self.registry.lock().await;
        registry.get_by_name(name).map(|node| node.state)
    }

    /// Applies an update plan.
    ///
    /// Runs the disruption gate first (unless the plan is empty or the
    /// policy skips notification), then executes stop/install/start in plan
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::ComponentBroken`] when a service exhausts
    /// its retry budget; earlier plan steps stay applied.
    pub async fn apply(
        &self,
        deployment_id: &str,
        plan: &UpdatePlan,
        targets: &BTreeMap<String, TargetComponent>,
        gate: &dyn UpdateGate,
        policy: &ComponentUpdatePolicy,
    ) -> Result<()> {
        if plan.is_empty() {
            tracing::info!(deployment_id = %deployment_id, "update plan is empty, nothing to do");
            return Ok(());
        }

        let outcome = wait_for_update_clearance(gate, deployment_id, policy).await;
        tracing::debug!(deployment_id = %deployment_id, ?outcome, "update gate cleared");
        if policy.action == UpdateAction::NotifyComponents {
            gate.post_update(deployment_id).await;
        }

        // Stop and drop services leaving the device.
        for name in &plan.to_remove {
            self.stop_service(name).await?;
            let mut registry = self.registry.lock().await;
            if registry.get_by_name(name).is_some() {
                registry.remove(name)?;
            }
            tracing::info!(deployment_id = %deployment_id, service = %name, "service removed");
        }

        // Services being replaced or reconfigured go down before installs,
        // dependents first.
        for name in plan.to_start.iter().rev() {
            if self.is_registered(name).await {
                self.stop_service(name).await?;
            }
        }

        for name in &plan.to_install {
            let Some(target) = targets.get(name) else {
                continue;
            };
            self.install_component(target).await?;
        }

        self.rebuild_edges(targets).await?;

        for name in &plan.to_start {
            let Some(target) = targets.get(name) else {
                continue;
            };
            self.start_service(target).await?;
        }

        Ok(())
    }

    /// Stops every managed service, dependents first; used at engine
    /// shutdown.
    ///
    /// # Errors
    ///
    /// Returns the first stop failure encountered.
    pub async fn stop_all(&self) -> Result<()> {
        let order = {
            let registry = self.registry.lock().await;
            registry.topological_order()
        };
        for name in order.iter().rev() {
            self.stop_service(name).await?;
        }
        Ok(())
    }

    async fn is_registered(&self, name: &str) -> bool {
        self.registry.lock().await.get_by_name(name).is_some()
    }

    async fn transition(&self, name: &str, to: ServiceState) -> Result<()> {
        let old = {
            let mut registry = self.registry.lock().await;
            registry.transition(name, to)?
        };
        self.events.publish(ServiceStateChanged {
            service: name.to_string(),
            old,
            new: to,
        });
        Ok(())
    }

    /// Installs (or replaces) one component.
    async fn install_component(&self, target: &TargetComponent) -> Result<()> {
        let name = &target.id.name;

        // Replacing an existing version: the service was already stopped,
        // now drop its registration.
        {
            let mut registry = self.registry.lock().await;
            if registry.get_by_name(name).is_some() {
                registry.remove(name)?;
            }
            registry.insert(
                target.recipe.clone(),
                target.run_with.clone(),
                self.retry_budget,
            );
        }

        self.transition(name, ServiceState::Installing).await?;

        if let Some(script) = target.recipe.lifecycle.install.clone() {
            self.run_bounded_phase(target, LifecyclePhase::Install, &script, ServiceState::Installing)
                .await?;
        }
        self.transition(name, ServiceState::Installed).await?;
        tracing::info!(component = %target.id, "component installed");
        Ok(())
    }

    /// Starts one service: startup phase, then the spawned run phase.
    async fn start_service(&self, target: &TargetComponent) -> Result<()> {
        let name = &target.id.name;
        let lifecycle = &target.recipe.lifecycle;

        if !target.recipe.is_service() {
            // Library components finish after install.
            if self.service_state(name).await == Some(ServiceState::Installed) {
                self.transition(name, ServiceState::Finished).await?;
            }
            return Ok(());
        }

        self.transition(name, ServiceState::Starting).await?;

        if let Some(script) = lifecycle.startup.clone() {
            self.run_bounded_phase(target, LifecyclePhase::Startup, &script, ServiceState::Starting)
                .await?;
        }

        if let Some(script) = lifecycle.run.clone() {
            let handle = self
                .runner
                .spawn_run(PhaseContext {
                    component: name,
                    phase: LifecyclePhase::Run,
                    script: &script,
                    environment: &target.environment,
                    run_with: target.run_with.as_ref(),
                })
                .await?;
            self.handles.lock().await.insert(name.clone(), handle);
        }

        self.transition(name, ServiceState::Running).await?;
        tracing::info!(component = %target.id, "service running");
        Ok(())
    }

    /// Stops one service if it has anything to stop.
    async fn stop_service(&self, name: &str) -> Result<()> {
        let (state, shutdown, environment, run_with) = {
            let registry = self.registry.lock().await;
            let Some(node) = registry.get_by_name(name) else {
                return Ok(());
            };
            (
                node.state,
                node.recipe.lifecycle.shutdown.clone(),
                BTreeMap::new(),
                node.run_with.clone(),
            )
        };

        if !matches!(state, ServiceState::Running | ServiceState::Errored) {
            return Ok(());
        }

        self.transition(name, ServiceState::Stopping).await?;

        if let Some(script) = shutdown {
            let outcome = self
                .runner
                .run_phase(PhaseContext {
                    component: name,
                    phase: LifecyclePhase::Shutdown,
                    script: &script,
                    environment: &environment,
                    run_with: run_with.as_ref(),
                })
                .await?;
            if outcome != PhaseOutcome::Success {
                tracing::warn!(service = %name, ?outcome, "shutdown script did not succeed");
            }
        }

        if let Some(mut handle) = self.handles.lock().await.remove(name) {
            self.runner.stop(name, &mut handle).await?;
        }

        self.transition(name, ServiceState::Finished).await?;
        Ok(())
    }

    /// Runs a bounded phase with the service's retry budget, re-entering
    /// `retry_state` between attempts and consulting the recover script.
    async fn run_bounded_phase(
        &self,
        target: &TargetComponent,
        phase: LifecyclePhase,
        script: &ScriptSpec,
        retry_state: ServiceState,
    ) -> Result<()> {
        let name = &target.id.name;

        loop {
            let outcome = self
                .runner
                .run_phase(PhaseContext {
                    component: name,
                    phase,
                    script,
                    environment: &target.environment,
                    run_with: target.run_with.as_ref(),
                })
                .await?;

            let reason = match outcome {
                PhaseOutcome::Success => return Ok(()),
                PhaseOutcome::Failed { exit_code } => {
                    format!("exit code {}", exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string()))
                }
                PhaseOutcome::TimedOut => "phase timed out".to_string(),
            };

            self.transition(name, ServiceState::Errored).await?;
            tracing::warn!(component = %target.id, phase = %phase, reason = %reason, "lifecycle phase failed");

            let retries_left = {
                let mut registry = self.registry.lock().await;
                let node = registry
                    .get_mut(name)
                    .ok_or_else(|| LifecycleError::UnknownService {
                        service: name.clone(),
                    })?;
                node.retries_left = node.retries_left.saturating_sub(1);
                node.retries_left
            };

            if retries_left == 0 {
                self.transition(name, ServiceState::Broken).await?;
                return Err(LifecycleError::ComponentBroken {
                    component: name.clone(),
                    phase: phase.to_string(),
                    reason,
                });
            }

            if let Some(recover) = target.recipe.lifecycle.recover.clone() {
                let _ = self
                    .runner
                    .run_phase(PhaseContext {
                        component: name,
                        phase: LifecyclePhase::Recover,
                        script: &recover,
                        environment: &target.environment,
                        run_with: target.run_with.as_ref(),
                    })
                    .await;
            }

            self.transition(name, retry_state).await?;
        }
    }

    /// Re-links dependency edges from the target set.
    async fn rebuild_edges(&self, targets: &BTreeMap<String, TargetComponent>) -> Result<()> {
        let mut registry = self.registry.lock().await;
        for target in targets.values() {
            for dep in &target.dependencies {
                if registry.get_by_name(&target.id.name).is_some()
                    && registry.get_by_name(dep).is_some()
                {
                    registry.add_dependency(&target.id.name, dep)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::NoopUpdateGate;
    use crate::plan::{compute_plan, ActiveComponent};
    use crate::runner::InstantScriptRunner;
    use serde_json::json;
    use std::time::Duration;
    use talos_core::{ComponentId, PlatformInfo, Recipe};

    fn recipe(name: &str, version: &str) -> Recipe {
        Recipe::from_yaml(
            &format!("componentName: {name}\ncomponentVersion: {version}\nlifecycle:\n  install: setup\n  run: ./{name}\n"),
            &PlatformInfo::new("linux", "x86_64"),
        )
        .unwrap()
    }

    fn target(name: &str, version: &str, deps: &[&str]) -> (String, TargetComponent) {
        (
            name.to_string(),
            TargetComponent {
                id: ComponentId::parse(name, version).unwrap(),
                recipe: recipe(name, version),
                configuration: json!({}),
                run_with: None,
                dependencies: deps.iter().map(ToString::to_string).collect(),
                environment: BTreeMap::new(),
            },
        )
    }

    fn policy() -> ComponentUpdatePolicy {
        ComponentUpdatePolicy {
            action: UpdateAction::SkipNotifyComponents,
            timeout: Duration::from_secs(1),
        }
    }

    fn executor(runner: Arc<dyn ScriptRunner>) -> LifecycleExecutor {
        LifecycleExecutor::new(runner, Arc::new(LifecycleEventHub::new()))
    }

    async fn current_view(
        executor: &LifecycleExecutor,
    ) -> BTreeMap<String, ActiveComponent> {
        executor
            .snapshot()
            .await
            .into_iter()
            .map(|s| {
                (
                    s.name,
                    ActiveComponent {
                        version: s.version,
                        configuration: json!({}),
                        run_with: s.run_with,
                    },
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_apply_installs_and_starts_in_dependency_order() {
        let runner = Arc::new(InstantScriptRunner::new());
        let events = Arc::new(LifecycleEventHub::new());
        let executor = LifecycleExecutor::new(runner, events.clone());
        let mut rx = events.subscribe();

        let targets: BTreeMap<_, _> = [
            target("main", "1.0.0", &["svc"]),
            target("svc", "1.0.0", &[]),
        ]
        .into_iter()
        .collect();
        let plan = compute_plan(&BTreeMap::new(), &HashMap::new(), &targets);

        executor
            .apply("d-1", &plan, &targets, &NoopUpdateGate, &policy())
            .await
            .unwrap();

        assert_eq!(
            executor.service_state("main").await,
            Some(ServiceState::Running)
        );
        assert_eq!(
            executor.service_state("svc").await,
            Some(ServiceState::Running)
        );

        // The dependency reaches Running before the dependent.
        let mut running_order = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.new == ServiceState::Running {
                running_order.push(event.service);
            }
        }
        assert_eq!(running_order, vec!["svc", "main"]);
    }

    #[tokio::test]
    async fn test_apply_empty_plan_makes_no_transitions() {
        let runner = Arc::new(InstantScriptRunner::new());
        let events = Arc::new(LifecycleEventHub::new());
        let executor = LifecycleExecutor::new(runner, events.clone());

        let targets: BTreeMap<_, _> = [target("main", "1.0.0", &[])].into_iter().collect();
        let plan = compute_plan(&BTreeMap::new(), &HashMap::new(), &targets);
        executor
            .apply("d-1", &plan, &targets, &NoopUpdateGate, &policy())
            .await
            .unwrap();

        let mut rx = events.subscribe();
        let current = current_view(&executor).await;
        let deps = executor.dependency_map().await;
        let plan = compute_plan(&current, &deps, &targets);
        assert!(plan.is_empty());

        executor
            .apply("d-2", &plan, &targets, &NoopUpdateGate, &policy())
            .await
            .unwrap();
        assert!(rx.try_recv().is_err(), "no transitions expected");
    }

    #[tokio::test]
    async fn test_apply_removes_obsolete_service() {
        let runner = Arc::new(InstantScriptRunner::new());
        let executor = executor(runner);

        let targets: BTreeMap<_, _> =
            [target("main", "1.0.0", &[]), target("old", "1.0.0", &[])]
                .into_iter()
                .collect();
        let plan = compute_plan(&BTreeMap::new(), &HashMap::new(), &targets);
        executor
            .apply("d-1", &plan, &targets, &NoopUpdateGate, &policy())
            .await
            .unwrap();

        let next: BTreeMap<_, _> = [target("main", "1.0.0", &[])].into_iter().collect();
        let current = current_view(&executor).await;
        let deps = executor.dependency_map().await;
        let plan = compute_plan(&current, &deps, &next);
        assert_eq!(plan.to_remove, vec!["old"]);

        executor
            .apply("d-2", &plan, &next, &NoopUpdateGate, &policy())
            .await
            .unwrap();
        assert_eq!(executor.service_state("old").await, None);
        assert_eq!(
            executor.service_state("main").await,
            Some(ServiceState::Running)
        );
    }

    #[tokio::test]
    async fn test_install_failure_exhausts_retries_and_breaks() {
        let runner = Arc::new(InstantScriptRunner::new());
        runner.fail_phase("main", LifecyclePhase::Install);
        let executor =
            LifecycleExecutor::new(runner, Arc::new(LifecycleEventHub::new()))
                .with_retry_budget(2);

        let targets: BTreeMap<_, _> = [target("main", "1.0.0", &[])].into_iter().collect();
        let plan = compute_plan(&BTreeMap::new(), &HashMap::new(), &targets);

        let err = executor
            .apply("d-1", &plan, &targets, &NoopUpdateGate, &policy())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::ComponentBroken { .. }));
        assert_eq!(
            executor.service_state("main").await,
            Some(ServiceState::Broken)
        );
    }

    #[tokio::test]
    async fn test_version_upgrade_replaces_service() {
        let runner = Arc::new(InstantScriptRunner::new());
        let executor = executor(runner);

        let v1: BTreeMap<_, _> = [target("main", "1.0.0", &[])].into_iter().collect();
        let plan = compute_plan(&BTreeMap::new(), &HashMap::new(), &v1);
        executor
            .apply("d-1", &plan, &v1, &NoopUpdateGate, &policy())
            .await
            .unwrap();

        let v2: BTreeMap<_, _> = [target("main", "2.0.0", &[])].into_iter().collect();
        let current = current_view(&executor).await;
        let deps = executor.dependency_map().await;
        let plan = compute_plan(&current, &deps, &v2);
        assert_eq!(plan.to_install, vec!["main"]);

        executor
            .apply("d-2", &plan, &v2, &NoopUpdateGate, &policy())
            .await
            .unwrap();

        let snapshot = executor.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].version, Version::new(2, 0, 0));
        assert_eq!(snapshot[0].state, ServiceState::Running);
    }

    #[tokio::test]
    async fn test_stop_all_leaves_services_finished() {
        let runner = Arc::new(InstantScriptRunner::new());
        let executor = executor(runner);

        let targets: BTreeMap<_, _> = [
            target("main", "1.0.0", &["svc"]),
            target("svc", "1.0.0", &[]),
        ]
        .into_iter()
        .collect();
        let plan = compute_plan(&BTreeMap::new(), &HashMap::new(), &targets);
        executor
            .apply("d-1", &plan, &targets, &NoopUpdateGate, &policy())
            .await
            .unwrap();

        executor.stop_all().await.unwrap();
        assert_eq!(
            executor.service_state("main").await,
            Some(ServiceState::Finished)
        );
        assert_eq!(
            executor.service_state("svc").await,
            Some(ServiceState::Finished)
        );
    }
}
