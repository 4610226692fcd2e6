//! The rollback manager.
//!
//! Restores the pre-deployment snapshot: configuration tree (preserving
//! rollback-safe runtime values written since the snapshot), group
//! mappings, and the service set, re-driven through the lifecycle executor
//! without component notification.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;

use talos_config::{paths as config_paths, Leaf};
use talos_core::{ComponentUpdatePolicy, UpdateAction};
use talos_lifecycle::{compute_plan, topological_order, NoopUpdateGate, ServiceState};

use crate::context::EngineContext;
use crate::error::{DeploymentError, Result};
use crate::snapshot::DeploymentSnapshot;

/// Restores `snapshot` and re-drives services to the pre-deployment state.
///
/// Values under any service's `runtime` namespace written after the
/// snapshot was taken survive the restore; everything else reverts exactly.
///
/// # Errors
///
/// Returns [`DeploymentError::RollbackIncomplete`] when the restore or the
/// lifecycle re-drive fails; the engine must then refuse new deployments.
pub async fn run_rollback(ctx: &EngineContext, snapshot: &DeploymentSnapshot) -> Result<()> {
    let deployment_id = snapshot.deployment_id.clone();
    tracing::warn!(deployment_id = %deployment_id, "rolling back deployment");

    rollback_inner(ctx, snapshot)
        .await
        .map_err(|e| DeploymentError::RollbackIncomplete {
            deployment_id,
            reason: e.to_string(),
        })
}

async fn rollback_inner(ctx: &EngineContext, snapshot: &DeploymentSnapshot) -> Result<()> {
    // The planner must see the state the deployment actually applied, so
    // capture the view before the tree reverts.
    let (current, current_deps) = ctx.active_view().await;

    // Runtime-scoped values are rollback-safe: collect every
    // services/<name>/runtime leaf written on top of the snapshot.
    let live = ctx.config.snapshot();
    let mut runtime_leaves: Vec<(Vec<String>, Leaf)> = Vec::new();
    live.for_each_leaf(|path, leaf| {
        if path.len() > 2 && path[0] == config_paths::SERVICES && path[2] == config_paths::RUNTIME
        {
            runtime_leaves.push((path.iter().map(ToString::to_string).collect(), leaf.clone()));
        }
    });

    ctx.config
        .restore(snapshot.config_tree.clone(), Utc::now().timestamp_millis())?;

    for (path, leaf) in runtime_leaves {
        let segments: Vec<&str> = path.iter().map(String::as_str).collect();
        ctx.config.write(&segments, leaf.value, leaf.timestamp)?;
    }

    // Re-drive the lifecycle to the snapshotted service set.
    let targets = ctx.targets_from_config()?;
    let mut plan = compute_plan(&current, &current_deps, &targets);

    // The failed apply may have stopped services without reinstalling
    // them; version and configuration look unchanged, but they still need
    // a start.
    for (name, target) in &targets {
        if target.recipe.is_service()
            && !plan.to_start.contains(name)
            && ctx.executor.service_state(name).await != Some(ServiceState::Running)
        {
            plan.to_start.push(name.clone());
        }
    }
    let dependency_map: HashMap<String, Vec<String>> = targets
        .values()
        .map(|t| (t.id.name.clone(), t.dependencies.clone()))
        .collect();
    plan.to_start = topological_order(&plan.to_start, &dependency_map);
    tracing::info!(
        deployment_id = %snapshot.deployment_id,
        to_remove = plan.to_remove.len(),
        to_install = plan.to_install.len(),
        to_start = plan.to_start.len(),
        "rollback plan computed"
    );

    let policy = ComponentUpdatePolicy {
        action: UpdateAction::SkipNotifyComponents,
        timeout: Duration::ZERO,
    };
    ctx.executor
        .apply(
            &snapshot.deployment_id,
            &plan,
            &targets,
            &NoopUpdateGate,
            &policy,
        )
        .await?;

    tracing::info!(deployment_id = %snapshot.deployment_id, "rollback complete");
    Ok(())
}
