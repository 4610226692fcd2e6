//! Deployment records.
//!
//! A [`Deployment`] is an immutable request produced by a source adapter
//! (cloud job channel, device shadow channel, or local override channel) and
//! consumed exactly once by the coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::document::DeploymentDocument;

/// The channel a deployment arrived on.
///
/// Ordering semantics differ per source: cloud jobs are strictly ordered and
/// deduplicated by id, shadow deployments are last-writer-wins by timestamp,
/// and local deployments are FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentSource {
    /// Cloud job channel.
    CloudJobs,

    /// Device shadow channel.
    Shadow,

    /// Local operator override channel.
    Local,
}

impl DeploymentSource {
    /// Returns a string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CloudJobs => "cloud_jobs",
            Self::Shadow => "shadow",
            Self::Local => "local",
        }
    }

    /// Returns true for the device-local override channel.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }
}

impl std::fmt::Display for DeploymentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stage of a deployment's execution across engine restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStage {
    /// Normal single-pass deployment.
    #[default]
    Default,

    /// Deployment resumed after an engine restart it requested.
    Bootstrap,

    /// Rollback resumed after an engine restart.
    RollbackBootstrap,
}

/// An immutable deployment request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    /// Identifier, unique within the source channel.
    pub id: String,

    /// The channel this deployment arrived on.
    pub source: DeploymentSource,

    /// Logical group the deployment is attributed to.
    pub group_id: String,

    /// When the source produced this deployment.
    pub timestamp: DateTime<Utc>,

    /// The desired-state document.
    pub document: DeploymentDocument,

    /// Execution stage.
    #[serde(default)]
    pub stage: DeploymentStage,
}

impl Deployment {
    /// Creates a deployment stamped with the current time.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        source: DeploymentSource,
        group_id: impl Into<String>,
        document: DeploymentDocument,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            group_id: group_id.into(),
            timestamp: Utc::now(),
            document,
            stage: DeploymentStage::Default,
        }
    }

    /// Overrides the source timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Overrides the execution stage.
    #[must_use]
    pub const fn with_stage(mut self, stage: DeploymentStage) -> Self {
        self.stage = stage;
        self
    }
}
