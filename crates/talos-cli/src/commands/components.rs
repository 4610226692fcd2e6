//! The `components` command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use talos_core::PlatformInfo;
use talos_deployment::EnginePaths;
use talos_store::ComponentStore;

use super::resolve_root;

/// Arguments for `talos components`.
#[derive(Args)]
pub struct ComponentsArgs {
    /// Engine root directory.
    #[arg(long)]
    pub root: Option<PathBuf>,
}

/// Lists every component version present in the store.
pub fn run(args: &ComponentsArgs) -> Result<()> {
    let root = resolve_root(args.root.clone());
    let paths = EnginePaths::new(root);

    let store = ComponentStore::open(paths.packages(), PlatformInfo::current())
        .context("failed to open component store")?;

    let ids = store.list_all();
    if ids.is_empty() {
        println!("no components installed");
        return Ok(());
    }
    for id in ids {
        println!("{}\t{}", id.name, id.version);
    }
    Ok(())
}
