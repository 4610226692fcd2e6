//! Error types for the lifecycle crate.

use thiserror::Error;

use crate::state::ServiceState;

/// Result type alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Errors that can occur while driving service lifecycles.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// A state change violated the service state machine.
    #[error("service '{service}' cannot transition {from} -> {to}")]
    InvalidTransition {
        /// Service name.
        service: String,
        /// Current state.
        from: ServiceState,
        /// Requested state.
        to: ServiceState,
    },

    /// No service with the given name is registered.
    #[error("unknown service '{service}'")]
    UnknownService {
        /// Service name.
        service: String,
    },

    /// Adding a dependency edge would create a cycle.
    #[error("dependency from '{service}' to '{dependency}' creates a cycle")]
    DependencyCycle {
        /// Depending service.
        service: String,
        /// The dependency that closes the cycle.
        dependency: String,
    },

    /// A component exhausted its retry budget and is broken.
    #[error("component '{component}' broke in the {phase} phase: {reason}")]
    ComponentBroken {
        /// Component name.
        component: String,
        /// Lifecycle phase that failed.
        phase: String,
        /// Last failure reason.
        reason: String,
    },

    /// A lifecycle script could not be launched.
    #[error("failed to run {phase} script for '{component}': {reason}")]
    Script {
        /// Component name.
        component: String,
        /// Lifecycle phase.
        phase: String,
        /// Failure reason.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_display() {
        let err = LifecycleError::InvalidTransition {
            service: "signal-hub".to_string(),
            from: ServiceState::New,
            to: ServiceState::Running,
        };
        assert!(err.to_string().contains("new -> running"));
    }

    #[test]
    fn test_component_broken_display() {
        let err = LifecycleError::ComponentBroken {
            component: "cam-feed".to_string(),
            phase: "startup".to_string(),
            reason: "exit code 1".to_string(),
        };
        assert!(err.to_string().contains("cam-feed"));
        assert!(err.to_string().contains("startup"));
    }
}
