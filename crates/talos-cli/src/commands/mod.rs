//! CLI command definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod components;
pub mod deploy;
pub mod run;
pub mod status;

/// Talos - edge component orchestrator.
#[derive(Parser)]
#[command(name = "talos", version, about)]
pub struct Cli {
    /// The command to run.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine: recover state, serve IPC, process deployments.
    Run(run::RunArgs),

    /// Apply a local desired-state document and wait for the result.
    Deploy(deploy::DeployArgs),

    /// Print the status record of a deployment.
    Status(status::StatusArgs),

    /// List installed component versions.
    Components(components::ComponentsArgs),

    /// Print the version.
    Version,
}

/// Resolves the engine root directory from `--root` or the platform
/// default.
#[must_use]
pub fn resolve_root(root: Option<PathBuf>) -> PathBuf {
    root.unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("talos")
    })
}
