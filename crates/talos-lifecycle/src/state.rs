//! The service state machine.
//!
//! ```text
//! NEW -> INSTALLING -> INSTALLED -> STARTING -> RUNNING <-> STOPPING -> FINISHED
//!            |                         |           |
//!            v                         v           v
//!         ERRORED                   ERRORED     ERRORED --(retries exhausted)--> BROKEN
//! ```
//!
//! `FINISHED` is the terminal success state for one-shot services; `BROKEN`
//! means the retry budget is exhausted and the service will not start again
//! in this deployment.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    /// Just discovered; nothing has run yet.
    New,

    /// Install script executing.
    Installing,

    /// Install succeeded; awaiting start.
    Installed,

    /// Startup script executing.
    Starting,

    /// Steady state for long-running services.
    Running,

    /// Shutdown script executing.
    Stopping,

    /// One-shot success, or cleanly stopped.
    Finished,

    /// A phase failed; the retry budget decides what happens next.
    Errored,

    /// Retries exhausted; not eligible to start in this deployment.
    Broken,
}

impl ServiceState {
    /// Returns true for states with no further transitions (other than
    /// removal).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Broken)
    }

    /// Returns true while the service counts as healthy steady-state.
    #[must_use]
    pub const fn is_steady(&self) -> bool {
        matches!(self, Self::Running | Self::Finished)
    }

    /// Returns the set of legal next states.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Installing)
                | (Self::Installing, Self::Installed | Self::Errored)
                | (Self::Installed, Self::Starting | Self::Finished)
                | (Self::Starting, Self::Running | Self::Finished | Self::Errored)
                | (Self::Running, Self::Stopping | Self::Errored)
                | (Self::Stopping, Self::Finished | Self::Errored)
                | (Self::Finished, Self::Starting | Self::Installing)
                | (Self::Errored, Self::Installing | Self::Starting | Self::Stopping | Self::Broken)
        )
    }

    /// Returns a string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Finished => "finished",
            Self::Errored => "errored",
            Self::Broken => "broken",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The awaited condition arrived.
    Completed,

    /// The budget elapsed first.
    TimedOut,

    /// The wait was cancelled.
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            ServiceState::New,
            ServiceState::Installing,
            ServiceState::Installed,
            ServiceState::Starting,
            ServiceState::Running,
            ServiceState::Stopping,
            ServiceState::Finished,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_error_paths() {
        assert!(ServiceState::Installing.can_transition_to(ServiceState::Errored));
        assert!(ServiceState::Starting.can_transition_to(ServiceState::Errored));
        assert!(ServiceState::Running.can_transition_to(ServiceState::Errored));
        assert!(ServiceState::Errored.can_transition_to(ServiceState::Broken));
        assert!(ServiceState::Errored.can_transition_to(ServiceState::Starting));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!ServiceState::New.can_transition_to(ServiceState::Running));
        assert!(!ServiceState::Broken.can_transition_to(ServiceState::Starting));
        assert!(!ServiceState::Running.can_transition_to(ServiceState::Installing));
        assert!(!ServiceState::Finished.can_transition_to(ServiceState::Broken));
    }

    #[test]
    fn test_finished_can_restart() {
        assert!(ServiceState::Finished.can_transition_to(ServiceState::Starting));
    }

    #[test]
    fn test_terminality() {
        assert!(ServiceState::Broken.is_terminal());
        assert!(!ServiceState::Finished.is_terminal());
        assert!(ServiceState::Finished.is_steady());
        assert!(ServiceState::Running.is_steady());
    }
}
