//! Deployment snapshots and crash-recovery markers.
//!
//! Before a deployment mutates anything it persists the configuration tree
//! and group mappings to `deployments/<id>/snapshot.json`; the rollback
//! manager restores from there. `deployments/ongoing.json` marks the
//! deployment currently past the point of no return, so a crashed engine
//! knows to roll back at startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use talos_config::ConfigTree;
use talos_core::DeploymentStage;

use crate::context::EnginePaths;
use crate::error::{DeploymentError, Result};
use crate::groups::GroupMappings;

/// The persisted pre-deployment state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSnapshot {
    /// Deployment this snapshot protects against.
    pub deployment_id: String,

    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,

    /// The configuration tree, timestamps included.
    pub config_tree: ConfigTree,

    /// Group contributions before the deployment.
    pub group_mappings: GroupMappings,
}

impl DeploymentSnapshot {
    /// Persists the snapshot under its deployment directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn save(&self, paths: &EnginePaths) -> Result<()> {
        let dir = paths.deployment_dir(&self.deployment_id);
        std::fs::create_dir_all(&dir).map_err(|e| DeploymentError::Io {
            path: dir.clone(),
            source: e,
        })?;

        let path = paths.snapshot_path(&self.deployment_id);
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(&path, json).map_err(|e| DeploymentError::Io { path, source: e })?;
        tracing::debug!(deployment_id = %self.deployment_id, "snapshot persisted");
        Ok(())
    }

    /// Loads the snapshot for a deployment, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or decoded.
    pub fn load(paths: &EnginePaths, deployment_id: &str) -> Result<Option<Self>> {
        let path = paths.snapshot_path(deployment_id);
        if !path.is_file() {
            return Ok(None);
        }
        let data = std::fs::read(&path).map_err(|e| DeploymentError::Io {
            path: path.clone(),
            source: e,
        })?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Deletes the snapshot file of a deployment, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal fails.
    pub fn delete(paths: &EnginePaths, deployment_id: &str) -> Result<()> {
        let path = paths.snapshot_path(deployment_id);
        if path.is_file() {
            std::fs::remove_file(&path)
                .map_err(|e| DeploymentError::Io { path, source: e })?;
        }
        Ok(())
    }
}

/// Marker for the deployment currently being applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OngoingMarker {
    /// The in-flight deployment.
    pub deployment_id: String,

    /// Its execution stage.
    pub stage: DeploymentStage,
}

impl OngoingMarker {
    /// Writes the marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn save(&self, paths: &EnginePaths) -> Result<()> {
        let path = paths.ongoing_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DeploymentError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(&path, json).map_err(|e| DeploymentError::Io { path, source: e })
    }

    /// Reads the marker, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or decoded.
    pub fn load(paths: &EnginePaths) -> Result<Option<Self>> {
        let path = paths.ongoing_path();
        if !path.is_file() {
            return Ok(None);
        }
        let data = std::fs::read(&path).map_err(|e| DeploymentError::Io {
            path: path.clone(),
            source: e,
        })?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Removes the marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal fails.
    pub fn clear(paths: &EnginePaths) -> Result<()> {
        let path = paths.ongoing_path();
        if path.is_file() {
            std::fs::remove_file(&path)
                .map_err(|e| DeploymentError::Io { path, source: e })?;
        }
        Ok(())
    }
}
