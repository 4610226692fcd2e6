//! The `status` command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use talos_core::StatusRecord;
use talos_deployment::EnginePaths;

use super::resolve_root;

/// Arguments for `talos status`.
#[derive(Args)]
pub struct StatusArgs {
    /// Engine root directory.
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Deployment id to look up.
    pub deployment_id: String,
}

/// Prints the persisted status record of a deployment.
pub fn run(args: &StatusArgs) -> Result<()> {
    let root = resolve_root(args.root.clone());
    let paths = EnginePaths::new(root);

    let path = paths.status_path(&args.deployment_id);
    let text = std::fs::read_to_string(&path).with_context(|| {
        format!(
            "no status record for deployment '{}' under {}",
            args.deployment_id,
            paths.deployments().display()
        )
    })?;
    let record: StatusRecord = serde_json::from_str(&text)?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
