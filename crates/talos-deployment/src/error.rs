//! Error types for the deployment engine.

use std::path::PathBuf;

use thiserror::Error;

use talos_core::DetailedStatus;

/// Result type alias for deployment operations.
pub type Result<T> = std::result::Result<T, DeploymentError>;

/// Errors surfaced at deployment scope.
#[derive(Error, Debug)]
pub enum DeploymentError {
    /// The desired-state document was rejected at parse/validation time.
    #[error("invalid deployment document: {reason}")]
    InvalidDocument {
        /// Why the document was rejected.
        reason: String,
    },

    /// No version satisfies every constraint on a component.
    #[error("no viable version for '{component}': {first} conflicts with {second}")]
    NoViableVersion {
        /// Component under resolution.
        component: String,
        /// One side of the conflicting pair, `source (requirement)`.
        first: String,
        /// The other side of the conflicting pair.
        second: String,
    },

    /// The chosen versions form a dependency cycle.
    #[error("circular dependency: {cycle}")]
    CircularDependency {
        /// The cycle, rendered `a -> b -> a`.
        cycle: String,
    },

    /// The document requires a capability this engine lacks.
    #[error("unsupported capability '{capability}'")]
    UnsupportedCapability {
        /// The missing capability tag.
        capability: String,
    },

    /// A component could not be made present locally.
    #[error("package download failed for '{component}': {reason}")]
    DownloadFailed {
        /// Component name (and version when known).
        component: String,
        /// Failure reason.
        reason: String,
    },

    /// A running component rejected (or failed to validate) its proposed
    /// configuration.
    #[error("configuration rejected by '{component}': {reason}")]
    ConfigurationRejected {
        /// The rejecting component.
        component: String,
        /// Rejection or timeout reason.
        reason: String,
    },

    /// A service broke while the plan was being applied.
    #[error("service update failed: {reason}")]
    ServiceUpdateFailed {
        /// Broken component.
        component: String,
        /// Failure reason.
        reason: String,
    },

    /// Rollback itself failed; operator intervention required.
    #[error("rollback of deployment '{deployment_id}' incomplete: {reason}")]
    RollbackIncomplete {
        /// The deployment that was being rolled back.
        deployment_id: String,
        /// Failure reason.
        reason: String,
    },

    /// The engine refuses work until the deployment directory is reset.
    #[error("engine halted after an incomplete rollback; reset the deployment directory")]
    EngineHalted,

    /// The deployment queue is at capacity.
    #[error("deployment queue is full")]
    QueueFull,

    /// Filesystem error against the deployment directory.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path the operation touched.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration store error.
    #[error(transparent)]
    Config(#[from] talos_config::ConfigError),

    /// Component store error.
    #[error(transparent)]
    Store(#[from] talos_store::StoreError),

    /// Lifecycle error.
    #[error(transparent)]
    Lifecycle(#[from] talos_lifecycle::LifecycleError),

    /// Core model error.
    #[error(transparent)]
    Core(#[from] talos_core::Error),
}

impl DeploymentError {
    /// Maps this error to the terminal detailed status of its deployment,
    /// before failure-handling policy is applied.
    #[must_use]
    pub const fn detailed_status(&self) -> DetailedStatus {
        match self {
            Self::InvalidDocument { .. } => DetailedStatus::RejectedInvalidDocument,
            Self::RollbackIncomplete { .. } => DetailedStatus::FailedRollbackIncomplete,
            Self::ServiceUpdateFailed { .. } | Self::Lifecycle(_) => {
                DetailedStatus::FailedRollbackNotRequested
            }
            _ => DetailedStatus::FailedNoStateChange,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_viable_version_names_conflict() {
        let err = DeploymentError::NoViableVersion {
            component: "SimpleApp".to_string(),
            first: "fleet-a (>=2.0.0)".to_string(),
            second: "fleet-b (1.0.0)".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("SimpleApp"));
        assert!(rendered.contains("fleet-a (>=2.0.0)"));
        assert!(rendered.contains("fleet-b (1.0.0)"));
    }

    #[test]
    fn test_detailed_status_mapping() {
        assert_eq!(
            DeploymentError::InvalidDocument {
                reason: "x".to_string()
            }
            .detailed_status(),
            DetailedStatus::RejectedInvalidDocument
        );
        assert_eq!(
            DeploymentError::UnsupportedCapability {
                capability: "FANCY".to_string()
            }
            .detailed_status(),
            DetailedStatus::FailedNoStateChange
        );
        assert_eq!(
            DeploymentError::ServiceUpdateFailed {
                component: "c".to_string(),
                reason: "broken".to_string()
            }
            .detailed_status(),
            DetailedStatus::FailedRollbackNotRequested
        );
    }
}
