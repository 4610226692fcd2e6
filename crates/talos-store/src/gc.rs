//! Component store garbage collection.
//!
//! Runs between deployments only. A stored (name, version) survives when it
//! is active, or referenced by a queued deployment; everything else has its
//! recipe and artifact directories removed. The active set always includes
//! the currently-running versions, so a running version is never reclaimed.

use std::collections::HashSet;

use talos_core::ComponentId;

use crate::error::Result;
use crate::store::ComponentStore;

/// Statistics from one collection pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    /// Component versions removed.
    pub removed_versions: usize,

    /// Bytes reclaimed.
    pub reclaimed_bytes: u64,
}

/// Removes every stored component version not present in `retained`.
///
/// `retained` must contain the active versions and every version referenced
/// by a queued deployment.
///
/// # Errors
///
/// Returns an error if a removal fails; versions already removed stay
/// removed.
pub fn collect_garbage(
    store: &ComponentStore,
    retained: &HashSet<ComponentId>,
) -> Result<GcStats> {
    let mut stats = GcStats::default();

    for id in store.list_all() {
        if retained.contains(&id) {
            continue;
        }
        let reclaimed = store.remove_version(&id)?;
        stats.removed_versions += 1;
        stats.reclaimed_bytes += reclaimed;
        tracing::info!(component = %id, "garbage collected component version");
    }

    if stats.removed_versions > 0 {
        tracing::info!(
            removed = stats.removed_versions,
            reclaimed_bytes = stats.reclaimed_bytes,
            "component store garbage collection complete"
        );
    }
    Ok(stats)
}
