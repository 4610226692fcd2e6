//! The `run` command: the engine daemon.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use talos_core::{Deployment, DeploymentDocument, DeploymentSource};
use talos_deployment::{DeploymentCoordinator, EngineContext};
use talos_ipc::SubscriptionHub;

use super::resolve_root;

/// How often the local drop-in directory is scanned.
const LOCAL_SCAN_INTERVAL: Duration = Duration::from_secs(2);

/// Group id attributed to drop-in deployments.
const LOCAL_GROUP: &str = "LOCAL_DEPLOYMENT";

/// Arguments for `talos run`.
#[derive(Args)]
pub struct RunArgs {
    /// Engine root directory.
    #[arg(long)]
    pub root: Option<PathBuf>,
}

/// Starts the engine and blocks until interrupted.
pub async fn execute(args: RunArgs) -> Result<()> {
    let root = resolve_root(args.root);
    tracing::info!(root = ?root, "starting engine");

    let hub = Arc::new(SubscriptionHub::new());
    let ctx = Arc::new(
        EngineContext::builder(&root)
            .ipc_hub(hub.clone())
            .build()
            .context("failed to initialize engine state")?,
    );

    #[cfg(unix)]
    {
        let server =
            talos_ipc::IpcServer::bind(ctx.paths.ipc_socket(), hub, ctx.auth.clone())
                .context("failed to bind IPC socket")?;
        tokio::spawn(server.run());
    }

    let coordinator = Arc::new(DeploymentCoordinator::new(ctx.clone()));
    coordinator
        .recover()
        .await
        .context("startup recovery failed")?;

    tokio::spawn(coordinator.clone().run());
    tokio::spawn(watch_local_deployments(
        root.join("deployments").join("local-queue"),
        coordinator.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");

    ctx.executor.stop_all().await?;
    ctx.config.flush()?;
    Ok(())
}

/// Polls the drop-in directory for local desired-state documents.
///
/// Each `*.json` file is submitted once as a local deployment; processed
/// files are renamed with a `.accepted` suffix.
async fn watch_local_deployments(dir: PathBuf, coordinator: Arc<DeploymentCoordinator>) {
    let mut seen: HashSet<PathBuf> = HashSet::new();

    loop {
        tokio::time::sleep(LOCAL_SCAN_INTERVAL).await;
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };

        for entry in entries.filter_map(std::result::Result::ok) {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") || seen.contains(&path) {
                continue;
            }
            seen.insert(path.clone());

            let document = match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|text| {
                    DeploymentDocument::from_json(&text).map_err(|e| e.to_string())
                }) {
                Ok(document) => document,
                Err(e) => {
                    tracing::warn!(path = ?path, error = %e, "rejected local document");
                    continue;
                }
            };

            let id = uuid::Uuid::now_v7().to_string();
            let deployment =
                Deployment::new(id.clone(), DeploymentSource::Local, LOCAL_GROUP, document);
            match coordinator.submit(deployment) {
                Ok(()) => {
                    tracing::info!(deployment_id = %id, path = ?path, "local deployment submitted");
                    let _ = std::fs::rename(&path, path.with_extension("json.accepted"));
                }
                Err(e) => {
                    tracing::warn!(path = ?path, error = %e, "local deployment not accepted");
                }
            }
        }
    }
}
