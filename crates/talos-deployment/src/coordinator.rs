//! The deployment coordinator.
//!
//! One pipeline task owns deployment execution: it drains the queue,
//! resolves, fetches, validates, merges and applies exactly one deployment
//! at a time. Cancellation and supersession are observed at the pipeline's
//! suspension points; once a deployment enters the merging phase it runs to
//! an apply verdict and failure handling takes over.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use talos_config::{interpolate, paths as config_paths, proposed_configuration, InterpolationContext};
use talos_core::{
    ComponentId, ComponentRequirement, Deployment, DeploymentStatus, DetailedStatus,
    FailureHandlingPolicy, StatusRecord,
};
use talos_lifecycle::{compute_plan, TargetComponent};
use talos_store::collect_garbage;

use crate::context::EngineContext;
use crate::error::{DeploymentError, Result};
use crate::groups::GroupMappings;
use crate::queue::{DeploymentQueue, OfferOutcome};
use crate::resolver::{ComponentResolver, Requirement, ResolvedComponent};
use crate::rollback::run_rollback;
use crate::snapshot::{DeploymentSnapshot, OngoingMarker};

/// Phases of the deployment pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeploymentPhase {
    /// Waiting in the queue.
    Queued,

    /// Version selection in progress.
    Resolving,

    /// Making components present locally.
    Fetching,

    /// Awaiting component verdicts on proposed configurations.
    Validating,

    /// Writing the configuration store; no longer preemptible.
    Merging,

    /// Driving service lifecycles.
    Applying,
}

impl DeploymentPhase {
    /// True while the deployment may still be cancelled with no observable
    /// effect.
    #[must_use]
    pub const fn is_preemptible(&self) -> bool {
        matches!(
            self,
            Self::Queued | Self::Resolving | Self::Fetching | Self::Validating
        )
    }

    /// Returns a string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Resolving => "resolving",
            Self::Fetching => "fetching",
            Self::Validating => "validating",
            Self::Merging => "merging",
            Self::Applying => "applying",
        }
    }
}

impl std::fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why an in-flight deployment was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelKind {
    /// Operator cancellation.
    Cancelled,

    /// A newer deployment arrived on the same source channel.
    Superseded,
}

#[derive(Debug)]
struct ExecutionState {
    deployment_id: String,
    source: talos_core::DeploymentSource,
    phase: DeploymentPhase,
    cancel: Option<CancelKind>,
}

enum PipelineOutcome {
    Applied,
    Cancelled(CancelKind),
}

/// The deployment coordinator.
pub struct DeploymentCoordinator {
    ctx: Arc<EngineContext>,
    queue: Arc<DeploymentQueue>,
    mappings: tokio::sync::Mutex<GroupMappings>,
    executing: Mutex<Option<ExecutionState>>,
    halted: AtomicBool,
}

impl DeploymentCoordinator {
    /// Creates a coordinator over `ctx` with an empty queue.
    #[must_use]
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            queue: Arc::new(DeploymentQueue::default()),
            mappings: tokio::sync::Mutex::new(GroupMappings::new()),
            executing: Mutex::new(None),
            halted: AtomicBool::new(false),
        }
    }

    /// The queue handle for source adapters.
    #[must_use]
    pub fn queue(&self) -> Arc<DeploymentQueue> {
        self.queue.clone()
    }

    /// Submits a deployment, applying source ordering and supersession.
    ///
    /// # Errors
    ///
    /// Returns [`DeploymentError::EngineHalted`] after an incomplete
    /// rollback, or [`DeploymentError::QueueFull`].
    pub fn submit(&self, deployment: Deployment) -> Result<()> {
        if self.halted.load(Ordering::SeqCst) {
            return Err(DeploymentError::EngineHalted);
        }

        let id = deployment.id.clone();
        let source = deployment.source;

        match self.queue.offer(deployment)? {
            OfferOutcome::Accepted => {
                self.ctx
                    .statuses
                    .publish(StatusRecord::new(&id, DeploymentStatus::Queued));
            }
            OfferOutcome::Superseded { previous_id } => {
                if previous_id != id {
                    self.ctx.statuses.publish(StatusRecord::terminal(
                        &previous_id,
                        DeploymentStatus::Superseded,
                        DetailedStatus::FailedNoStateChange,
                        None,
                    ));
                }
                self.ctx
                    .statuses
                    .publish(StatusRecord::new(&id, DeploymentStatus::Queued));
            }
            OfferOutcome::DuplicateDiscarded | OfferOutcome::StaleDiscarded => return Ok(()),
        }

        // A same-source deployment still short of merging is superseded
        // even if the pipeline already picked it up.
        if let Ok(mut executing) = self.executing.lock() {
            if let Some(state) = executing.as_mut() {
                if state.source == source
                    && state.deployment_id != id
                    && state.phase.is_preemptible()
                    && state.cancel.is_none()
                {
                    state.cancel = Some(CancelKind::Superseded);
                }
            }
        }
        Ok(())
    }

    /// The last known status of a deployment.
    #[must_use]
    pub fn status(&self, deployment_id: &str) -> Option<StatusRecord> {
        self.ctx.statuses.status(deployment_id)
    }

    /// Cancels a queued or in-flight deployment. Returns false if the
    /// deployment is unknown or already terminal.
    pub fn cancel(&self, deployment_id: &str) -> bool {
        if self.queue.remove(deployment_id).is_some() {
            self.ctx.statuses.publish(StatusRecord::terminal(
                deployment_id,
                DeploymentStatus::Cancelled,
                DetailedStatus::FailedNoStateChange,
                None,
            ));
            return true;
        }

        if let Ok(mut executing) = self.executing.lock() {
            if let Some(state) = executing.as_mut() {
                if state.deployment_id == deployment_id {
                    if state.cancel.is_none() {
                        state.cancel = Some(CancelKind::Cancelled);
                    }
                    return true;
                }
            }
        }
        false
    }

    /// Returns true when the engine refuses deployments pending operator
    /// intervention.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// A copy of the current group mappings.
    pub async fn group_mappings(&self) -> GroupMappings {
        self.mappings.lock().await.clone()
    }

    /// Startup recovery: reload group mappings, roll back an interrupted
    /// deployment, then re-drive services recorded in the configuration
    /// store.
    ///
    /// # Errors
    ///
    /// Returns an error if recovery state cannot be read or the re-drive
    /// fails.
    pub async fn recover(&self) -> Result<()> {
        // Persisted group mappings.
        let groups_path = self.ctx.paths.groups_path();
        if groups_path.is_file() {
            let data = std::fs::read(&groups_path).map_err(|e| DeploymentError::Io {
                path: groups_path,
                source: e,
            })?;
            *self.mappings.lock().await = serde_json::from_slice(&data)?;
        }

        // A deployment died mid-apply: restore its snapshot before anything
        // else runs.
        if let Some(marker) = OngoingMarker::load(&self.ctx.paths)? {
            tracing::warn!(
                deployment_id = %marker.deployment_id,
                "found interrupted deployment, rolling back"
            );
            if let Some(snapshot) = DeploymentSnapshot::load(&self.ctx.paths, &marker.deployment_id)?
            {
                *self.mappings.lock().await = snapshot.group_mappings.clone();
                run_rollback(&self.ctx, &snapshot).await?;
                self.ctx.statuses.publish(StatusRecord::terminal(
                    &marker.deployment_id,
                    DeploymentStatus::Failed,
                    DetailedStatus::FailedRollbackComplete,
                    Some("engine restarted during deployment".to_string()),
                ));
            }
            OngoingMarker::clear(&self.ctx.paths)?;
            return Ok(());
        }

        // Normal start: bring recorded services up.
        let targets = self.ctx.targets_from_config()?;
        if targets.is_empty() {
            return Ok(());
        }
        let (current, deps) = self.ctx.active_view().await;
        let plan = compute_plan(&current, &deps, &targets);
        let policy = talos_core::ComponentUpdatePolicy {
            action: talos_core::UpdateAction::SkipNotifyComponents,
            timeout: std::time::Duration::ZERO,
        };
        self.ctx
            .executor
            .apply("startup", &plan, &targets, &talos_lifecycle::NoopUpdateGate, &policy)
            .await?;
        Ok(())
    }

    /// Runs the pipeline task until the process exits.
    pub async fn run(self: Arc<Self>) {
        loop {
            let deployment = self.queue.take().await;
            self.execute(deployment).await;
        }
    }

    /// Executes one deployment to a terminal status.
    pub async fn execute(&self, deployment: Deployment) {
        let id = deployment.id.clone();
        self.ctx
            .statuses
            .publish(StatusRecord::new(&id, DeploymentStatus::InProgress));

        if let Ok(mut executing) = self.executing.lock() {
            *executing = Some(ExecutionState {
                deployment_id: id.clone(),
                source: deployment.source,
                phase: DeploymentPhase::Resolving,
                cancel: None,
            });
        }

        let result = self.execute_pipeline(&deployment).await;

        if let Ok(mut executing) = self.executing.lock() {
            *executing = None;
        }

        match result {
            Ok(PipelineOutcome::Applied) => {
                self.ctx.statuses.publish(StatusRecord::terminal(
                    &id,
                    DeploymentStatus::Succeeded,
                    DetailedStatus::Successful,
                    None,
                ));
            }
            Ok(PipelineOutcome::Cancelled(kind)) => {
                let status = match kind {
                    CancelKind::Cancelled => DeploymentStatus::Cancelled,
                    CancelKind::Superseded => DeploymentStatus::Superseded,
                };
                self.ctx.statuses.publish(StatusRecord::terminal(
                    &id,
                    status,
                    DetailedStatus::FailedNoStateChange,
                    None,
                ));
            }
            Err(error) => self.handle_failure(&deployment, error).await,
        }
    }

    fn set_phase(&self, phase: DeploymentPhase) {
        if let Ok(mut executing) = self.executing.lock() {
            if let Some(state) = executing.as_mut() {
                tracing::debug!(
                    deployment_id = %state.deployment_id,
                    phase = %phase,
                    "pipeline phase"
                );
                state.phase = phase;
            }
        }
    }

    fn cancel_requested(&self) -> Option<CancelKind> {
        self.executing
            .lock()
            .ok()
            .and_then(|executing| executing.as_ref().and_then(|s| s.cancel))
    }

    async fn execute_pipeline(&self, deployment: &Deployment) -> Result<PipelineOutcome> {
        let ctx = &self.ctx;
        let doc = &deployment.document;

        for capability in &doc.required_capabilities {
            if !ctx.capabilities.contains(capability) {
                return Err(DeploymentError::UnsupportedCapability {
                    capability: capability.clone(),
                });
            }
        }

        self.prune_departed_groups(deployment).await;

        // Resolve.
        self.set_phase(DeploymentPhase::Resolving);
        if let Some(kind) = self.cancel_requested() {
            return Ok(PipelineOutcome::Cancelled(kind));
        }
        let roots = self.effective_roots(deployment).await;
        let resolver = ComponentResolver::new(&ctx.store, ctx.fetcher.as_ref());
        let resolved = resolver.resolve(&roots).await?;
        tracing::info!(
            deployment_id = %deployment.id,
            components = resolved.len(),
            "resolution complete"
        );

        // Fetch.
        self.set_phase(DeploymentPhase::Fetching);
        if let Some(kind) = self.cancel_requested() {
            return Ok(PipelineOutcome::Cancelled(kind));
        }
        for component in &resolved {
            if !ctx.store.has_recipe(&component.id) {
                ctx.store.save_recipe(&component.recipe)?;
            }
            ctx.fetcher
                .prepare_artifacts(&component.recipe)
                .await
                .map_err(|e| DeploymentError::DownloadFailed {
                    component: component.id.to_string(),
                    reason: e.to_string(),
                })?;
        }

        // Propose and render configurations.
        let rendered = self.render_configurations(doc, &resolved);

        // Validate with running components.
        self.set_phase(DeploymentPhase::Validating);
        if let Some(kind) = self.cancel_requested() {
            return Ok(PipelineOutcome::Cancelled(kind));
        }
        ctx.validator
            .validate(
                &deployment.id,
                &rendered,
                doc.configuration_validation_policy.timeout,
            )
            .await
            .map_err(|failures| {
                let reasons: Vec<String> = failures
                    .iter()
                    .map(|f| format!("{}: {}", f.component, f.reason))
                    .collect();
                DeploymentError::ConfigurationRejected {
                    component: failures
                        .first()
                        .map_or_else(String::new, |f| f.component.clone()),
                    reason: reasons.join("; "),
                }
            })?;
        if let Some(kind) = self.cancel_requested() {
            return Ok(PipelineOutcome::Cancelled(kind));
        }

        // Point of no preemption: snapshot, mark ongoing, merge.
        let snapshot = DeploymentSnapshot {
            deployment_id: deployment.id.clone(),
            taken_at: Utc::now(),
            config_tree: ctx.config.snapshot(),
            group_mappings: self.mappings.lock().await.clone(),
        };
        snapshot.save(&ctx.paths)?;
        OngoingMarker {
            deployment_id: deployment.id.clone(),
            stage: deployment.stage,
        }
        .save(&ctx.paths)?;

        self.set_phase(DeploymentPhase::Merging);

        // The planner compares against the pre-merge view.
        let (current, current_deps) = ctx.active_view().await;

        let ts = doc.creation_timestamp.timestamp_millis();
        for component in &resolved {
            let name = &component.id.name;
            ctx.config.write(
                &[config_paths::SERVICES, name, config_paths::VERSION],
                talos_config::Value::from(component.id.version.to_string()),
                ts,
            )?;
            ctx.config.replace_json(
                &[config_paths::SERVICES, name, config_paths::CONFIGURATION],
                &rendered[name],
                ts,
            )?;

            let run_with = doc.components.get(name).and_then(|s| s.run_with.as_ref());
            if let Some(run_with) = run_with {
                ctx.config.replace_json(
                    &[config_paths::SERVICES, name, "runWith"],
                    &serde_json::to_value(run_with)?,
                    ts,
                )?;
            }
        }

        // Apply.
        self.set_phase(DeploymentPhase::Applying);
        let targets = self.build_targets(doc, &resolved, &rendered);
        let plan = compute_plan(&current, &current_deps, &targets);
        tracing::info!(
            deployment_id = %deployment.id,
            to_remove = plan.to_remove.len(),
            to_install = plan.to_install.len(),
            to_reconfigure = plan.to_reconfigure.len(),
            "update plan computed"
        );

        ctx.executor
            .apply(
                &deployment.id,
                &plan,
                &targets,
                ctx.gate.as_ref(),
                &doc.component_update_policy,
            )
            .await
            .map_err(|e| {
                let component = match &e {
                    talos_lifecycle::LifecycleError::ComponentBroken { component, .. } => {
                        component.clone()
                    }
                    _ => String::new(),
                };
                DeploymentError::ServiceUpdateFailed {
                    component,
                    reason: e.to_string(),
                }
            })?;

        // Drop configuration of services that left the device.
        for name in &plan.to_remove {
            ctx.config.remove(&[config_paths::SERVICES, name], ts)?;
        }

        // Best-effort cancellation during merge/apply: the phase finished,
        // now roll back.
        if let Some(kind) = self.cancel_requested() {
            run_rollback(ctx, &snapshot).await?;
            OngoingMarker::clear(&ctx.paths)?;
            return Ok(PipelineOutcome::Cancelled(kind));
        }

        self.commit_success(deployment, &resolved).await?;
        Ok(PipelineOutcome::Applied)
    }

    /// Confirms cloud group membership, never removing groups the oracle
    /// cannot vouch for (device-offline rule).
    async fn prune_departed_groups(&self, deployment: &Deployment) {
        let mut mappings = self.mappings.lock().await;
        for group in mappings.cloud_groups() {
            if group == deployment.group_id {
                continue;
            }
            match self.ctx.oracle.is_member(&group).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(group = %group, "device no longer in group, dropping contribution");
                    mappings.remove_group(&group);
                }
                Err(e) => {
                    tracing::warn!(
                        group = %group,
                        error = %e,
                        "membership unconfirmed, keeping last-known contribution"
                    );
                }
            }
        }
    }

    /// The effective root set: every valid group's contribution, with this
    /// deployment's document replacing its own group's.
    async fn effective_roots(
        &self,
        deployment: &Deployment,
    ) -> BTreeMap<String, Vec<Requirement>> {
        let mut roots: BTreeMap<String, Vec<Requirement>> = BTreeMap::new();

        let mappings = self.mappings.lock().await;
        for (component, contributions) in mappings.root_requirements() {
            for (group, requirement) in contributions {
                if group == deployment.group_id {
                    continue;
                }
                match ComponentRequirement::parse(&requirement) {
                    Ok(parsed) => roots
                        .entry(component.clone())
                        .or_default()
                        .push(Requirement::new(group, parsed)),
                    Err(e) => {
                        tracing::warn!(
                            component = %component,
                            group = %group,
                            error = %e,
                            "skipping unparseable stored requirement"
                        );
                    }
                }
            }
        }
        drop(mappings);

        for (component, spec) in &deployment.document.components {
            roots
                .entry(component.clone())
                .or_default()
                .push(Requirement::new(
                    deployment.group_id.clone(),
                    spec.version_requirement.clone(),
                ));
        }
        roots
    }

    /// Computes each component's proposed configuration and renders
    /// interpolation tokens in a single pass.
    fn render_configurations(
        &self,
        doc: &talos_core::DeploymentDocument,
        resolved: &[ResolvedComponent],
    ) -> BTreeMap<String, serde_json::Value> {
        let ctx = &self.ctx;
        let mut proposals: BTreeMap<String, serde_json::Value> = BTreeMap::new();

        for component in resolved {
            let name = &component.id.name;
            let current = ctx.config.to_json(&[
                config_paths::SERVICES,
                name,
                config_paths::CONFIGURATION,
            ]);
            let update = doc
                .components
                .get(name)
                .and_then(|spec| spec.configuration_update.as_ref());
            proposals.insert(
                name.clone(),
                proposed_configuration(
                    current.as_ref(),
                    &component.recipe.default_configuration,
                    update,
                ),
            );
        }

        resolved
            .iter()
            .map(|component| {
                let name = &component.id.name;
                let ictx = InterpolationContext::new(name, &proposals)
                    .with_system("kernel:rootPath", ctx.paths.root().display().to_string())
                    .with_system(
                        "artifacts:path",
                        ctx.store.artifact_dir(&component.id).display().to_string(),
                    )
                    .with_system(
                        "artifacts:decompressedPath",
                        ctx.store.unarchived_dir(&component.id).display().to_string(),
                    );
                (name.clone(), interpolate(&proposals[name], &ictx))
            })
            .collect()
    }

    fn build_targets(
        &self,
        doc: &talos_core::DeploymentDocument,
        resolved: &[ResolvedComponent],
        rendered: &BTreeMap<String, serde_json::Value>,
    ) -> BTreeMap<String, TargetComponent> {
        resolved
            .iter()
            .map(|component| {
                let name = component.id.name.clone();
                let run_with = doc
                    .components
                    .get(&name)
                    .and_then(|spec| spec.run_with.clone());
                let environment = self.ctx.service_environment(&component.id);
                (
                    name.clone(),
                    TargetComponent {
                        id: component.id.clone(),
                        recipe: component.recipe.clone(),
                        configuration: rendered[&name].clone(),
                        run_with,
                        dependencies: component.dependencies.clone(),
                        environment,
                    },
                )
            })
            .collect()
    }

    /// Post-apply bookkeeping: group mappings, snapshot retention, GC.
    async fn commit_success(
        &self,
        deployment: &Deployment,
        resolved: &[ResolvedComponent],
    ) -> Result<()> {
        let ctx = &self.ctx;

        // Record this group's contribution; both index sides move together.
        {
            let mut mappings = self.mappings.lock().await;
            let roots: BTreeMap<String, String> = deployment
                .document
                .components
                .iter()
                .map(|(name, spec)| (name.clone(), spec.version_requirement.as_str().to_string()))
                .collect();
            mappings.apply(&deployment.group_id, deployment.source, roots);

            let json = serde_json::to_vec_pretty(&*mappings)?;
            let path = ctx.paths.groups_path();
            std::fs::write(&path, json)
                .map_err(|e| DeploymentError::Io { path, source: e })?;
        }

        // Prior snapshots are obsolete once this deployment has succeeded.
        let deployments_dir = ctx.paths.deployments();
        if let Ok(entries) = std::fs::read_dir(&deployments_dir) {
            for entry in entries.filter_map(std::result::Result::ok) {
                let dir_name = entry.file_name();
                if entry.path().is_dir() && dir_name.to_string_lossy() != deployment.id {
                    let _ = DeploymentSnapshot::delete(
                        &ctx.paths,
                        dir_name.to_string_lossy().as_ref(),
                    );
                }
            }
        }

        OngoingMarker::clear(&ctx.paths)?;

        // Reclaim unreferenced component versions.
        let mut retained: HashSet<ComponentId> =
            resolved.iter().map(|c| c.id.clone()).collect();
        for summary in ctx.executor.snapshot().await {
            retained.insert(ComponentId::new(summary.name, summary.version));
        }
        for document in self.queue.queued_documents() {
            for (name, spec) in &document.components {
                for version in ctx.store.list_versions(name) {
                    if spec.version_requirement.matches(&version) {
                        retained.insert(ComponentId::new(name.clone(), version));
                    }
                }
            }
        }
        collect_garbage(&ctx.store, &retained)?;

        Ok(())
    }

    /// Terminal failure handling, honoring the document's policy.
    async fn handle_failure(&self, deployment: &Deployment, error: DeploymentError) {
        let ctx = &self.ctx;
        let id = &deployment.id;
        let cause = error.to_string();
        tracing::error!(deployment_id = %id, error = %cause, "deployment failed");

        // State was only touched if the ongoing marker points at us.
        let past_merge = OngoingMarker::load(&ctx.paths)
            .ok()
            .flatten()
            .is_some_and(|marker| marker.deployment_id == *id);

        if !past_merge {
            self.ctx.statuses.publish(StatusRecord::terminal(
                id,
                DeploymentStatus::Failed,
                error.detailed_status(),
                Some(cause),
            ));
            return;
        }

        let record = match deployment.document.failure_handling_policy {
            FailureHandlingPolicy::DoNothing => StatusRecord::terminal(
                id,
                DeploymentStatus::Failed,
                DetailedStatus::FailedRollbackNotRequested,
                Some(cause),
            ),
            FailureHandlingPolicy::Rollback => {
                match DeploymentSnapshot::load(&ctx.paths, id) {
                    Ok(Some(snapshot)) => match run_rollback(ctx, &snapshot).await {
                        Ok(()) => {
                            *self.mappings.lock().await = snapshot.group_mappings;
                            StatusRecord::terminal(
                                id,
                                DeploymentStatus::Failed,
                                DetailedStatus::FailedRollbackComplete,
                                Some(cause),
                            )
                        }
                        Err(e) => {
                            self.halted.store(true, Ordering::SeqCst);
                            StatusRecord::terminal(
                                id,
                                DeploymentStatus::Failed,
                                DetailedStatus::FailedRollbackIncomplete,
                                Some(e.to_string()),
                            )
                        }
                    },
                    _ => {
                        self.halted.store(true, Ordering::SeqCst);
                        StatusRecord::terminal(
                            id,
                            DeploymentStatus::Failed,
                            DetailedStatus::FailedRollbackIncomplete,
                            Some(format!("{cause}; snapshot missing")),
                        )
                    }
                }
            }
        };

        if let Err(e) = OngoingMarker::clear(&ctx.paths) {
            tracing::warn!(error = %e, "failed to clear ongoing marker");
        }
        self.ctx.statuses.publish(record);
    }
}
