//! The update-disruption policy.
//!
//! Before a disruptive deployment proceeds, running components that
//! subscribed to component-update events are polled with a `pre_update`
//! event and may defer the update. The executor waits the longest requested
//! recheck interval (never past the policy budget) and repolls; when no
//! deferrals remain or the budget elapses it proceeds and publishes
//! `post_update`.

use std::time::Duration;

use async_trait::async_trait;

use talos_core::{ComponentUpdatePolicy, UpdateAction};

use crate::state::WaitOutcome;

/// A subscriber's request to postpone the update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deferral {
    /// Component that deferred.
    pub component: String,

    /// How long it asked to wait before the next poll.
    pub recheck_after: Duration,

    /// Operator-facing reason.
    pub message: Option<String>,
}

/// The component-facing side of the disruption policy.
///
/// Implemented by the IPC subscription hub; disconnected subscribers are
/// treated as responding with no deferral.
#[async_trait]
pub trait UpdateGate: Send + Sync {
    /// Publishes a `pre_update` event and collects deferrals.
    async fn poll_pre_update(&self, deployment_id: &str) -> Vec<Deferral>;

    /// Publishes the `post_update` event.
    async fn post_update(&self, deployment_id: &str);
}

/// Gate with no subscribers; every poll comes back clear.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUpdateGate;

#[async_trait]
impl UpdateGate for NoopUpdateGate {
    async fn poll_pre_update(&self, _deployment_id: &str) -> Vec<Deferral> {
        Vec::new()
    }

    async fn post_update(&self, _deployment_id: &str) {}
}

/// Runs the deferral loop for a deployment.
///
/// Returns [`WaitOutcome::Completed`] when a poll comes back with no
/// deferrals, or [`WaitOutcome::TimedOut`] once the policy budget is
/// exhausted; the caller proceeds in both cases. With
/// [`UpdateAction::SkipNotifyComponents`] no events are published at all.
pub async fn wait_for_update_clearance(
    gate: &dyn UpdateGate,
    deployment_id: &str,
    policy: &ComponentUpdatePolicy,
) -> WaitOutcome {
    if policy.action == UpdateAction::SkipNotifyComponents {
        return WaitOutcome::Completed;
    }

    let deadline = tokio::time::Instant::now() + policy.timeout;

    loop {
        let deferrals = gate.poll_pre_update(deployment_id).await;
        if deferrals.is_empty() {
            return WaitOutcome::Completed;
        }

        let longest = deferrals
            .iter()
            .map(|d| d.recheck_after)
            .max()
            .unwrap_or(Duration::ZERO);
        for deferral in &deferrals {
            tracing::info!(
                deployment_id = %deployment_id,
                component = %deferral.component,
                recheck_ms = deferral.recheck_after.as_millis() as u64,
                message = deferral.message.as_deref().unwrap_or(""),
                "component deferred update"
            );
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return WaitOutcome::TimedOut;
        }
        let wait = longest.min(deadline - now);
        tokio::time::sleep(wait).await;

        if tokio::time::Instant::now() >= deadline {
            return WaitOutcome::TimedOut;
        }
    }
}
