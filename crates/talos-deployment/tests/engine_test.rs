//! End-to-end engine tests.
//!
//! These drive the coordinator against an in-process harness: an instant
//! script runner, a scripted membership oracle and the real configuration
//! store, component store and IPC hub.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use talos_config::paths as config_paths;
use talos_core::{
    ComponentRequirement, ComponentSpec, ComponentUpdatePolicy, ConfigurationUpdate, Deployment,
    DeploymentDocument, DeploymentSource, DeploymentStatus, DetailedStatus, LifecyclePhase,
    PlatformInfo, Recipe, UpdateAction,
};
use talos_deployment::{
    DeploymentCoordinator, DeploymentSnapshot, EngineContext, MembershipOracle,
    MemoryStatusConsumer, OracleUnavailable,
};
use talos_ipc::{Event, SubscriptionHub, ValidityStatus};
use talos_lifecycle::{InstantScriptRunner, ServiceState};

/// Oracle whose answers the tests script.
#[derive(Default)]
struct ScriptedOracle {
    not_member: Mutex<HashSet<String>>,
    offline: AtomicBool,
}

impl ScriptedOracle {
    fn leave_group(&self, group: &str) {
        self.not_member.lock().unwrap().insert(group.to_string());
    }

    fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MembershipOracle for ScriptedOracle {
    async fn is_member(&self, group_id: &str) -> Result<bool, OracleUnavailable> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(OracleUnavailable {
                reason: "no cloud connection".to_string(),
            });
        }
        Ok(!self.not_member.lock().unwrap().contains(group_id))
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    ctx: Arc<EngineContext>,
    coordinator: Arc<DeploymentCoordinator>,
    runner: Arc<InstantScriptRunner>,
    oracle: Arc<ScriptedOracle>,
    hub: Arc<SubscriptionHub>,
    statuses: Arc<MemoryStatusConsumer>,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(InstantScriptRunner::new());
    let oracle = Arc::new(ScriptedOracle::default());
    let hub = Arc::new(SubscriptionHub::new().with_response_window(Duration::from_millis(30)));

    let ctx = Arc::new(
        EngineContext::builder(dir.path())
            .platform(PlatformInfo::new("linux", "x86_64"))
            .runner(runner.clone())
            .oracle(oracle.clone())
            .ipc_hub(hub.clone())
            .build()
            .unwrap(),
    );

    let statuses = Arc::new(MemoryStatusConsumer::new());
    ctx.statuses.register(statuses.clone());

    Harness {
        _dir: dir,
        coordinator: Arc::new(DeploymentCoordinator::new(ctx.clone())),
        ctx,
        runner,
        oracle,
        hub,
        statuses,
    }
}

fn seed_recipe(h: &Harness, yaml: &str) {
    let recipe = Recipe::from_yaml(yaml, &PlatformInfo::new("linux", "x86_64")).unwrap();
    h.ctx.store.save_recipe(&recipe).unwrap();
}

fn seed_service(h: &Harness, name: &str, version: &str) {
    seed_recipe(
        h,
        &format!("componentName: {name}\ncomponentVersion: {version}\nlifecycle:\n  run: ./{name}\n"),
    );
}

fn document(seq: i64, components: &[(&str, &str)]) -> DeploymentDocument {
    let mut doc = DeploymentDocument {
        creation_timestamp: Utc.timestamp_millis_opt(1_700_000_000_000 + seq).single().unwrap(),
        ..DeploymentDocument::default()
    };
    for (name, requirement) in components {
        doc.components.insert(
            (*name).to_string(),
            ComponentSpec::new(ComponentRequirement::parse(requirement).unwrap()),
        );
    }
    doc
}

fn local(id: &str, doc: DeploymentDocument) -> Deployment {
    Deployment::new(id, DeploymentSource::Local, "LOCAL_DEPLOYMENT", doc)
}

fn cloud(id: &str, group: &str, doc: DeploymentDocument) -> Deployment {
    Deployment::new(id, DeploymentSource::CloudJobs, group, doc)
}

async fn state(h: &Harness, name: &str) -> Option<ServiceState> {
    h.ctx.executor.service_state(name).await
}

fn final_status(h: &Harness, id: &str) -> (DeploymentStatus, Option<DetailedStatus>) {
    let record = h.coordinator.status(id).unwrap();
    (record.status, record.detailed_status)
}

#[tokio::test]
async fn test_add_dependency_starts_in_topological_order() {
    let h = harness();
    seed_service(&h, "main", "1.0.0");
    seed_service(&h, "new_service", "1.0.0");
    seed_recipe(
        &h,
        "componentName: main\ncomponentVersion: 1.1.0\nlifecycle:\n  run: ./main\ndependencies:\n  new_service:\n    versionRequirement: '1.0.0'\n",
    );

    h.coordinator.execute(local("d-1", document(1, &[("main", "1.0.0")]))).await;
    assert_eq!(state(&h, "main").await, Some(ServiceState::Running));

    let mut events = h.ctx.events.subscribe();
    h.coordinator.execute(local("d-2", document(2, &[("main", "1.1.0")]))).await;

    assert_eq!(final_status(&h, "d-2").0, DeploymentStatus::Succeeded);
    assert_eq!(state(&h, "new_service").await, Some(ServiceState::Running));

    let mut running_order = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.new == ServiceState::Running {
            running_order.push(event.service);
        }
    }
    assert_eq!(running_order, vec!["new_service", "main"]);
}

#[tokio::test]
async fn test_nested_dependencies_run_leaves_first() {
    let h = harness();
    seed_recipe(
        &h,
        "componentName: main\ncomponentVersion: 1.0.0\nlifecycle:\n  run: ./main\ndependencies:\n  new_service:\n    versionRequirement: '1.0.0'\n",
    );
    seed_recipe(
        &h,
        "componentName: new_service\ncomponentVersion: 1.0.0\nlifecycle:\n  run: ./svc\ndependencies:\n  new_service2:\n    versionRequirement: '1.0.0'\n",
    );
    seed_service(&h, "new_service2", "1.0.0");

    let mut events = h.ctx.events.subscribe();
    h.coordinator.execute(local("d-1", document(1, &[("main", "1.0.0")]))).await;

    let mut running_order = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.new == ServiceState::Running {
            running_order.push(event.service);
        }
    }
    assert_eq!(running_order, vec!["new_service2", "new_service", "main"]);
}

#[tokio::test]
async fn test_identical_redeploy_is_a_noop() {
    let h = harness();
    seed_recipe(
        &h,
        "componentName: main\ncomponentVersion: 1.0.0\nlifecycle:\n  run: ./main\ndependencies:\n  new_service:\n    versionRequirement: '1.0.0'\n",
    );
    seed_recipe(
        &h,
        "componentName: new_service\ncomponentVersion: 1.0.0\nlifecycle:\n  run: ./svc\ndependencies:\n  new_service2:\n    versionRequirement: '1.0.0'\n",
    );
    seed_service(&h, "new_service2", "1.0.0");

    // Same document both times, including its creation timestamp.
    h.coordinator.execute(local("d-1", document(1, &[("main", "1.0.0")]))).await;

    let mut events = h.ctx.events.subscribe();
    h.coordinator.execute(local("d-2", document(1, &[("main", "1.0.0")]))).await;

    assert_eq!(final_status(&h, "d-2").0, DeploymentStatus::Succeeded);
    assert!(
        events.try_recv().is_err(),
        "second deployment must not transition any service"
    );
}

#[tokio::test]
async fn test_deferral_delays_then_post_update_fires() {
    let h = harness();
    seed_service(&h, "main", "1.0.0");
    h.coordinator.execute(local("d-1", document(1, &[("main", "1.0.0")]))).await;

    // The running component subscribes and defers the first two polls.
    let (tx, mut rx) = SubscriptionHub::event_channel();
    h.hub.subscribe_component_updates("main", tx);
    let hub = h.hub.clone();
    let client = tokio::spawn(async move {
        let mut pre_updates = 0u32;
        let mut post_update = false;
        while let Some(event) = rx.recv().await {
            match event {
                Event::PreUpdate { deployment_id } => {
                    pre_updates += 1;
                    if pre_updates <= 2 {
                        hub.record_deferral(
                            &deployment_id,
                            "main",
                            Duration::from_millis(100),
                            Some("finishing batch".to_string()),
                        );
                    }
                }
                Event::PostUpdate { .. } => {
                    post_update = true;
                    break;
                }
                Event::ValidateConfiguration { .. } => {}
            }
        }
        (pre_updates, post_update)
    });

    // A config change forces a restart, which consults the update gate.
    let mut doc = document(2, &[("main", "1.0.0")]);
    doc.component_update_policy = ComponentUpdatePolicy {
        action: UpdateAction::NotifyComponents,
        timeout: Duration::from_secs(2),
    };
    if let Some(spec) = doc.components.get_mut("main") {
        spec.configuration_update = Some(ConfigurationUpdate {
            merge: Some(serde_json::json!({"interval": 5})),
            reset: None,
        });
    }
    h.coordinator.execute(local("d-2", doc)).await;
    assert_eq!(final_status(&h, "d-2").0, DeploymentStatus::Succeeded);

    let (pre_updates, post_update) = client.await.unwrap();
    assert!(pre_updates >= 3, "two deferrals need a third clear poll");
    assert!(post_update, "post_update must fire once the gate clears");
    assert_eq!(state(&h, "main").await, Some(ServiceState::Running));
}

#[tokio::test]
async fn test_group_removal_releases_version_constraint() {
    let h = harness();
    seed_service(&h, "SimpleApp", "1.0.0");
    seed_service(&h, "SimpleApp", "2.0.0");

    h.coordinator
        .execute(cloud("d-1", "fleet-g1", document(1, &[("SimpleApp", "1.0.0")])))
        .await;
    assert_eq!(final_status(&h, "d-1").0, DeploymentStatus::Succeeded);

    // The device leaves G1; G2 then deploys 2.0.0.
    h.oracle.leave_group("fleet-g1");
    h.coordinator
        .execute(cloud("d-2", "fleet-g2", document(2, &[("SimpleApp", "2.0.0")])))
        .await;

    assert_eq!(final_status(&h, "d-2").0, DeploymentStatus::Succeeded);
    let snapshot = h.ctx.executor.snapshot().await;
    let app = snapshot.iter().find(|s| s.name == "SimpleApp").unwrap();
    assert_eq!(app.version.to_string(), "2.0.0");
    assert_eq!(app.state, ServiceState::Running);

    let mappings = h.coordinator.group_mappings().await;
    assert!(mappings.contribution("fleet-g1").is_none());
    assert!(mappings.contribution("fleet-g2").is_some());
}

#[tokio::test]
async fn test_offline_local_deployment_preserves_cloud_components() {
    let h = harness();
    for name in ["RedSignal", "YellowSignal", "HelloWorld"] {
        seed_service(&h, name, "1.0.0");
    }

    h.coordinator
        .execute(cloud("d-1", "fleet-a", document(1, &[("RedSignal", "1.0.0")])))
        .await;
    h.coordinator
        .execute(cloud("d-2", "fleet-b", document(2, &[("YellowSignal", "1.0.0")])))
        .await;

    // Device goes offline; a local override arrives.
    h.oracle.go_offline();
    h.coordinator
        .execute(local(
            "d-3",
            document(3, &[("HelloWorld", "1.0.0"), ("YellowSignal", "1.0.0")]),
        ))
        .await;

    assert_eq!(final_status(&h, "d-3").0, DeploymentStatus::Succeeded);
    for name in ["RedSignal", "YellowSignal", "HelloWorld"] {
        assert_eq!(
            state(&h, name).await,
            Some(ServiceState::Running),
            "{name} must stay active when membership cannot be confirmed"
        );
    }

    let mappings = h.coordinator.group_mappings().await;
    assert!(mappings.contribution("fleet-a").is_some());
    assert!(mappings.contribution("fleet-b").is_some());
}

#[tokio::test]
async fn test_broken_install_rolls_back_to_previous_version() {
    let h = harness();
    seed_service(&h, "main", "1.0.0");
    seed_recipe(
        &h,
        "componentName: main\ncomponentVersion: 2.0.0\nlifecycle:\n  run: ./main\ndependencies:\n  flaky:\n    versionRequirement: '1.0.0'\n",
    );
    seed_recipe(
        &h,
        "componentName: flaky\ncomponentVersion: 1.0.0\nlifecycle:\n  install: ./setup\n  run: ./flaky\n",
    );

    h.coordinator.execute(local("d-1", document(1, &[("main", "1.0.0")]))).await;

    h.runner.fail_phase("flaky", LifecyclePhase::Install);
    h.coordinator.execute(local("d-2", document(2, &[("main", "2.0.0")]))).await;

    let (status, detail) = final_status(&h, "d-2");
    assert_eq!(status, DeploymentStatus::Failed);
    assert_eq!(detail, Some(DetailedStatus::FailedRollbackComplete));

    // The pre-deployment service is running again at its old version (I3).
    let snapshot = h.ctx.executor.snapshot().await;
    let main = snapshot.iter().find(|s| s.name == "main").unwrap();
    assert_eq!(main.version.to_string(), "1.0.0");
    assert_eq!(main.state, ServiceState::Running);
    assert!(snapshot.iter().all(|s| s.name != "flaky"));
}

#[tokio::test]
async fn test_do_nothing_policy_keeps_partial_state() {
    let h = harness();
    seed_recipe(
        &h,
        "componentName: solo\ncomponentVersion: 1.0.0\nlifecycle:\n  install: ./setup\n  run: ./solo\n",
    );
    h.runner.fail_phase("solo", LifecyclePhase::Install);

    let mut doc = document(1, &[("solo", "1.0.0")]);
    doc.failure_handling_policy = talos_core::FailureHandlingPolicy::DoNothing;
    h.coordinator.execute(local("d-1", doc)).await;

    let (status, detail) = final_status(&h, "d-1");
    assert_eq!(status, DeploymentStatus::Failed);
    assert_eq!(detail, Some(DetailedStatus::FailedRollbackNotRequested));
    assert_eq!(state(&h, "solo").await, Some(ServiceState::Broken));
}

#[tokio::test]
async fn test_runtime_values_survive_rollback() {
    let h = harness();
    seed_service(&h, "main", "1.0.0");
    h.coordinator.execute(local("d-1", document(1, &[("main", "1.0.0")]))).await;

    let snapshot = DeploymentSnapshot {
        deployment_id: "d-2".to_string(),
        taken_at: Utc::now(),
        config_tree: h.ctx.config.snapshot(),
        group_mappings: h.coordinator.group_mappings().await,
    };

    // After the snapshot: a runtime-scoped write (rollback-safe) and an
    // ordinary configuration write (reverted).
    let now = Utc::now().timestamp_millis();
    h.ctx
        .config
        .write(
            &[config_paths::SERVICES, "main", config_paths::RUNTIME, "lastProcessedSeq"],
            talos_config::Value::Int(4211),
            now,
        )
        .unwrap();
    h.ctx
        .config
        .merge_json(
            &[config_paths::SERVICES, "main", config_paths::CONFIGURATION],
            &serde_json::json!({"interval": 5}),
            now,
        )
        .unwrap();

    talos_deployment::run_rollback(&h.ctx, &snapshot).await.unwrap();

    assert_eq!(
        h.ctx.config.get_value(&[
            config_paths::SERVICES,
            "main",
            config_paths::RUNTIME,
            "lastProcessedSeq"
        ]),
        Some(talos_config::Value::Int(4211)),
        "runtime values are rollback-safe"
    );
    assert_eq!(
        h.ctx
            .config
            .to_json(&[config_paths::SERVICES, "main", config_paths::CONFIGURATION])
            .and_then(|v| v.get("interval").cloned()),
        None,
        "plain configuration reverts to the snapshot"
    );
}

#[tokio::test]
async fn test_gc_reclaims_replaced_version_but_not_active() {
    let h = harness();
    seed_service(&h, "main", "1.0.0");
    seed_service(&h, "main", "2.0.0");

    h.coordinator.execute(local("d-1", document(1, &[("main", "1.0.0")]))).await;
    h.coordinator.execute(local("d-2", document(2, &[("main", "2.0.0")]))).await;

    let stored = h.ctx.store.list_versions("main");
    assert_eq!(stored.len(), 1, "old version reclaimed: {stored:?}");
    assert_eq!(stored[0].to_string(), "2.0.0");
}

#[tokio::test]
async fn test_configuration_rejection_aborts_without_state_change() {
    let h = harness();
    seed_service(&h, "main", "1.0.0");
    h.coordinator.execute(local("d-1", document(1, &[("main", "1.0.0")]))).await;
    let before = h
        .ctx
        .config
        .to_json(&[config_paths::SERVICES, "main", config_paths::CONFIGURATION]);

    // The running component subscribes to validation and rejects.
    let (tx, mut rx) = SubscriptionHub::event_channel();
    h.hub.subscribe_validate_configuration("main", tx);
    let hub = h.hub.clone();
    let client = tokio::spawn(async move {
        if let Some(Event::ValidateConfiguration { deployment_id, .. }) = rx.recv().await {
            hub.record_validity_report(
                &deployment_id,
                "main",
                ValidityStatus::Rejected,
                Some("port 9200 already bound".to_string()),
            );
        }
    });

    let mut doc = document(2, &[("main", "1.0.0")]);
    if let Some(spec) = doc.components.get_mut("main") {
        spec.configuration_update = Some(ConfigurationUpdate {
            merge: Some(serde_json::json!({"port": 9200})),
            reset: None,
        });
    }
    h.coordinator.execute(local("d-2", doc)).await;
    client.await.unwrap();

    let record = h.coordinator.status("d-2").unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert_eq!(
        record.detailed_status,
        Some(DetailedStatus::FailedNoStateChange)
    );
    assert!(record.failure_cause.unwrap().contains("port 9200 already bound"));

    // Nothing was written.
    let after = h
        .ctx
        .config
        .to_json(&[config_paths::SERVICES, "main", config_paths::CONFIGURATION]);
    assert_eq!(after, before);
    assert_eq!(state(&h, "main").await, Some(ServiceState::Running));
}

#[tokio::test]
async fn test_unsupported_capability_fails_cleanly() {
    let h = harness();
    seed_service(&h, "main", "1.0.0");

    let mut doc = document(1, &[("main", "1.0.0")]);
    doc.required_capabilities.insert("TIME_TRAVEL".to_string());
    h.coordinator.execute(local("d-1", doc)).await;

    let record = h.coordinator.status("d-1").unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record.failure_cause.unwrap().contains("TIME_TRAVEL"));
    assert_eq!(state(&h, "main").await, None);
}

#[tokio::test]
async fn test_queued_deployment_superseded_by_same_source() {
    let h = harness();
    seed_service(&h, "main", "1.0.0");
    seed_service(&h, "main", "2.0.0");

    h.coordinator.submit(local("d-1", document(1, &[("main", "1.0.0")]))).unwrap();
    h.coordinator.submit(local("d-2", document(2, &[("main", "2.0.0")]))).unwrap();

    let (status, _) = final_status(&h, "d-1");
    assert_eq!(status, DeploymentStatus::Superseded);

    // Only d-2 is left to execute.
    let queued = h.coordinator.queue();
    assert_eq!(queued.len(), 1);

    let records = h.statuses.records();
    let superseded: Vec<_> = records
        .iter()
        .filter(|r| r.status == DeploymentStatus::Superseded)
        .collect();
    assert_eq!(superseded.len(), 1);
}

#[tokio::test]
async fn test_version_conflict_reports_both_groups() {
    let h = harness();
    seed_service(&h, "SimpleApp", "1.0.0");
    seed_service(&h, "SimpleApp", "2.0.0");

    h.coordinator
        .execute(cloud("d-1", "fleet-g1", document(1, &[("SimpleApp", "1.0.0")])))
        .await;
    // Still a member of G1, so its exact pin conflicts with G2's.
    h.coordinator
        .execute(cloud("d-2", "fleet-g2", document(2, &[("SimpleApp", "2.0.0")])))
        .await;

    let record = h.coordinator.status("d-2").unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    let cause = record.failure_cause.unwrap();
    assert!(cause.contains("no viable version"), "{cause}");
    assert!(cause.contains("fleet-g1"), "{cause}");

    // The previous deployment's state is untouched.
    let snapshot = h.ctx.executor.snapshot().await;
    let app = snapshot.iter().find(|s| s.name == "SimpleApp").unwrap();
    assert_eq!(app.version.to_string(), "1.0.0");
}

#[tokio::test]
async fn test_startup_recovery_restores_services() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(InstantScriptRunner::new());

    // First engine lifetime: deploy and stop.
    {
        let ctx = Arc::new(
            EngineContext::builder(dir.path())
                .platform(PlatformInfo::new("linux", "x86_64"))
                .runner(runner.clone())
                .build()
                .unwrap(),
        );
        let recipe = Recipe::from_yaml(
            "componentName: main\ncomponentVersion: 1.0.0\nlifecycle:\n  run: ./main\n",
            &PlatformInfo::new("linux", "x86_64"),
        )
        .unwrap();
        ctx.store.save_recipe(&recipe).unwrap();

        let coordinator = Arc::new(DeploymentCoordinator::new(ctx.clone()));
        coordinator.execute(local("d-1", document(1, &[("main", "1.0.0")]))).await;
        assert_eq!(
            ctx.executor.service_state("main").await,
            Some(ServiceState::Running)
        );
        ctx.config.flush().unwrap();
    }

    // Second lifetime: recovery replays the tlog and restarts services.
    let ctx = Arc::new(
        EngineContext::builder(dir.path())
            .platform(PlatformInfo::new("linux", "x86_64"))
            .runner(runner)
            .build()
            .unwrap(),
    );
    let coordinator = Arc::new(DeploymentCoordinator::new(ctx.clone()));
    coordinator.recover().await.unwrap();

    assert_eq!(
        ctx.executor.service_state("main").await,
        Some(ServiceState::Running)
    );
    let mappings = coordinator.group_mappings().await;
    assert!(mappings.contribution("LOCAL_DEPLOYMENT").is_some());
}
