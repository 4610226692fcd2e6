//! The `deploy` command: one-shot local deployment.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;

use talos_core::{Deployment, DeploymentDocument, DeploymentSource, DeploymentStatus};
use talos_deployment::{DeploymentCoordinator, EngineContext};

use super::resolve_root;

/// Arguments for `talos deploy`.
#[derive(Args)]
pub struct DeployArgs {
    /// Engine root directory.
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Path to the desired-state document (JSON).
    pub document: PathBuf,
}

/// Applies the document against the engine root and waits for the terminal
/// status.
pub async fn execute(args: DeployArgs) -> Result<()> {
    let root = resolve_root(args.root);

    let text = std::fs::read_to_string(&args.document)
        .with_context(|| format!("failed to read {}", args.document.display()))?;
    let document = DeploymentDocument::from_json(&text)?;

    let ctx = Arc::new(
        EngineContext::builder(&root)
            .build()
            .context("failed to initialize engine state")?,
    );
    let coordinator = Arc::new(DeploymentCoordinator::new(ctx.clone()));
    coordinator
        .recover()
        .await
        .context("startup recovery failed")?;

    let id = uuid::Uuid::now_v7().to_string();
    let deployment = Deployment::new(
        id.clone(),
        DeploymentSource::Local,
        "LOCAL_DEPLOYMENT",
        document,
    );
    coordinator.execute(deployment).await;

    let record = coordinator
        .status(&id)
        .context("deployment produced no status record")?;
    println!("{}", serde_json::to_string_pretty(&record)?);

    ctx.config.flush()?;
    if record.status != DeploymentStatus::Succeeded {
        bail!(
            "deployment {id} ended {}: {}",
            record.status,
            record.failure_cause.unwrap_or_default()
        );
    }
    Ok(())
}
