//! Deployment status records.
//!
//! Every deployment moves through `Queued → InProgress` and ends in exactly
//! one terminal status, published once to every registered consumer.

use serde::{Deserialize, Serialize};

/// Coarse deployment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    /// Accepted, waiting for the pipeline task.
    Queued,

    /// Being executed by the pipeline task.
    InProgress,

    /// Applied completely.
    Succeeded,

    /// Ended with a failure; see the detailed status.
    Failed,

    /// Replaced by a newer deployment from the same source before merging.
    Superseded,

    /// Cancelled before any observable effect.
    Cancelled,
}

impl DeploymentStatus {
    /// Returns true once no further status change is possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Superseded | Self::Cancelled
        )
    }

    /// Returns a string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Superseded => "superseded",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fine-grained outcome of a terminal deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetailedStatus {
    /// Every phase completed and the live state matches the document.
    Successful,

    /// The deployment failed before any state was written.
    FailedNoStateChange,

    /// A component broke and the document asked to keep partial state.
    FailedRollbackNotRequested,

    /// A component broke and the pre-deployment snapshot was restored.
    FailedRollbackComplete,

    /// Rollback itself failed; operator intervention is required.
    FailedRollbackIncomplete,

    /// The document was rejected at parse/validation time.
    RejectedInvalidDocument,
}

impl DetailedStatus {
    /// Returns true when the engine must refuse further deployments until an
    /// operator resets the deployment directory.
    #[must_use]
    pub const fn requires_operator_reset(&self) -> bool {
        matches!(self, Self::FailedRollbackIncomplete)
    }
}

/// The status record published for a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    /// Deployment this record describes.
    pub deployment_id: String,

    /// Coarse status.
    pub status: DeploymentStatus,

    /// Terminal detail, present once the deployment ends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detailed_status: Option<DetailedStatus>,

    /// Human-readable failure cause.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_cause: Option<String>,
}

impl StatusRecord {
    /// Creates a non-terminal record.
    #[must_use]
    pub fn new(deployment_id: impl Into<String>, status: DeploymentStatus) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            status,
            detailed_status: None,
            failure_cause: None,
        }
    }

    /// Creates a terminal record.
    #[must_use]
    pub fn terminal(
        deployment_id: impl Into<String>,
        status: DeploymentStatus,
        detailed_status: DetailedStatus,
        failure_cause: Option<String>,
    ) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            status,
            detailed_status: Some(detailed_status),
            failure_cause,
        }
    }
}
