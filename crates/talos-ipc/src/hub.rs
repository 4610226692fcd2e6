//! The in-process subscription hub.
//!
//! Connection handlers register their service's event channels here; the
//! engine talks to the hub, never to sockets. The hub implements the
//! lifecycle executor's [`UpdateGate`] (pre/post update with deferrals) and
//! the merger's [`ConfigurationValidator`] (validation round-trip).
//! A disconnected subscriber is treated as having answered with no deferral,
//! and a missing validation verdict counts as a timeout for that component.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Notify;

use talos_lifecycle::{Deferral, UpdateGate};

use crate::protocol::{Event, ValidityStatus};

/// Default window granted to subscribers to answer a `pre_update` poll.
pub const DEFAULT_RESPONSE_WINDOW: Duration = Duration::from_secs(1);

/// Capacity of each subscriber's event channel.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 16;

/// A component's rejection (or non-answer) during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    /// Component that rejected or failed to answer.
    pub component: String,

    /// Reason, as reported or synthesized on timeout.
    pub reason: String,
}

/// Validates proposed configurations with subscribed running components.
#[async_trait]
pub trait ConfigurationValidator: Send + Sync {
    /// Sends each component its proposed configuration and awaits verdicts.
    ///
    /// # Errors
    ///
    /// Returns every rejection and timeout; an empty error list never
    /// occurs.
    async fn validate(
        &self,
        deployment_id: &str,
        proposals: &BTreeMap<String, serde_json::Value>,
        timeout: Duration,
    ) -> std::result::Result<(), Vec<ValidationFailure>>;
}

#[derive(Debug, Default)]
struct HubState {
    update_subscribers: HashMap<String, mpsc::Sender<Event>>,
    validate_subscribers: HashMap<String, mpsc::Sender<Event>>,
    deferrals: HashMap<String, Vec<Deferral>>,
    reports: HashMap<String, HashMap<String, (ValidityStatus, Option<String>)>>,
}

/// Fan-out hub between the engine and connected components.
#[derive(Debug)]
pub struct SubscriptionHub {
    state: Mutex<HubState>,
    report_arrived: Notify,
    response_window: Duration,
}

impl Default for SubscriptionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionHub {
    /// Creates a hub with the default response window.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            report_arrived: Notify::new(),
            response_window: DEFAULT_RESPONSE_WINDOW,
        }
    }

    /// Overrides the `pre_update` response window.
    #[must_use]
    pub const fn with_response_window(mut self, window: Duration) -> Self {
        self.response_window = window;
        self
    }

    /// Creates the event channel for a subscriber registration.
    #[must_use]
    pub fn event_channel() -> (mpsc::Sender<Event>, mpsc::Receiver<Event>) {
        mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY)
    }

    /// Registers `service` for component-update events.
    pub fn subscribe_component_updates(&self, service: &str, tx: mpsc::Sender<Event>) {
        if let Ok(mut state) = self.state.lock() {
            state.update_subscribers.insert(service.to_string(), tx);
        }
        tracing::debug!(service = %service, "subscribed to component updates");
    }

    /// Registers `service` for configuration validation round-trips.
    pub fn subscribe_validate_configuration(&self, service: &str, tx: mpsc::Sender<Event>) {
        if let Ok(mut state) = self.state.lock() {
            state.validate_subscribers.insert(service.to_string(), tx);
        }
        tracing::debug!(service = %service, "subscribed to configuration validation");
    }

    /// Drops every subscription of `service` (connection closed).
    pub fn unsubscribe_all(&self, service: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.update_subscribers.remove(service);
            state.validate_subscribers.remove(service);
        }
    }

    /// Records a deferral from `service` for `deployment_id`.
    pub fn record_deferral(
        &self,
        deployment_id: &str,
        service: &str,
        recheck_after: Duration,
        message: Option<String>,
    ) {
        if let Ok(mut state) = self.state.lock() {
            state
                .deferrals
                .entry(deployment_id.to_string())
                .or_default()
                .push(Deferral {
                    component: service.to_string(),
                    recheck_after,
                    message,
                });
        }
    }

    /// Records a configuration validity verdict from `service`.
    pub fn record_validity_report(
        &self,
        deployment_id: &str,
        service: &str,
        status: ValidityStatus,
        message: Option<String>,
    ) {
        if let Ok(mut state) = self.state.lock() {
            state
                .reports
                .entry(deployment_id.to_string())
                .or_default()
                .insert(service.to_string(), (status, message));
        }
        self.report_arrived.notify_waiters();
    }

    /// True if any component subscribed to update events.
    #[must_use]
    pub fn has_update_subscribers(&self) -> bool {
        self.state
            .lock()
            .map(|state| !state.update_subscribers.is_empty())
            .unwrap_or(false)
    }

    fn send_to(subscribers: &mut HashMap<String, mpsc::Sender<Event>>, event: &Event) {
        // A full or closed channel means the subscriber is effectively gone;
        // it is treated as answering with nothing.
        subscribers.retain(|service, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(service = %service, "subscriber event channel full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(service = %service, "subscriber disconnected");
                false
            }
        });
    }
}

#[async_trait]
impl UpdateGate for SubscriptionHub {
    async fn poll_pre_update(&self, deployment_id: &str) -> Vec<Deferral> {
        let had_subscribers = {
            let Ok(mut state) = self.state.lock() else {
                return Vec::new();
            };
            state.deferrals.remove(deployment_id);
            if state.update_subscribers.is_empty() {
                false
            } else {
                Self::send_to(
                    &mut state.update_subscribers,
                    &Event::PreUpdate {
                        deployment_id: deployment_id.to_string(),
                    },
                );
                true
            }
        };

        if !had_subscribers {
            return Vec::new();
        }

        tokio::time::sleep(self.response_window).await;

        self.state
            .lock()
            .ok()
            .and_then(|mut state| state.deferrals.remove(deployment_id))
            .unwrap_or_default()
    }

    async fn post_update(&self, deployment_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            Self::send_to(
                &mut state.update_subscribers,
                &Event::PostUpdate {
                    deployment_id: deployment_id.to_string(),
                },
            );
        }
    }
}

#[async_trait]
impl ConfigurationValidator for SubscriptionHub {
    async fn validate(
        &self,
        deployment_id: &str,
        proposals: &BTreeMap<String, serde_json::Value>,
        timeout: Duration,
    ) -> std::result::Result<(), Vec<ValidationFailure>> {
        let targets: Vec<String> = {
            let Ok(mut state) = self.state.lock() else {
                return Ok(());
            };
            state.reports.remove(deployment_id);

            let targets: Vec<String> = proposals
                .keys()
                .filter(|name| state.validate_subscribers.contains_key(*name))
                .cloned()
                .collect();

            for name in &targets {
                if let Some(tx) = state.validate_subscribers.get(name) {
                    let event = Event::ValidateConfiguration {
                        deployment_id: deployment_id.to_string(),
                        proposed_configuration: proposals[name].clone(),
                    };
                    if tx.try_send(event).is_err() {
                        tracing::debug!(service = %name, "validation subscriber unreachable");
                    }
                }
            }
            targets
        };

        if targets.is_empty() {
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let (rejections, missing) = {
                let Ok(mut state) = self.state.lock() else {
                    return Ok(());
                };
                let reports = state.reports.entry(deployment_id.to_string()).or_default();

                let rejections: Vec<ValidationFailure> = targets
                    .iter()
                    .filter_map(|name| match reports.get(name) {
                        Some((ValidityStatus::Rejected, message)) => Some(ValidationFailure {
                            component: name.clone(),
                            reason: message
                                .clone()
                                .unwrap_or_else(|| "configuration rejected".to_string()),
                        }),
                        _ => None,
                    })
                    .collect();
                let missing: Vec<String> = targets
                    .iter()
                    .filter(|name| !reports.contains_key(*name))
                    .cloned()
                    .collect();
                (rejections, missing)
            };

            if !rejections.is_empty() {
                return Err(rejections);
            }
            if missing.is_empty() {
                return Ok(());
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(missing
                    .into_iter()
                    .map(|component| ValidationFailure {
                        component,
                        reason: "validation timed out".to_string(),
                    })
                    .collect());
            }

            let _ = tokio::time::timeout_at(deadline, self.report_arrived.notified()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> SubscriptionHub {
        SubscriptionHub::new().with_response_window(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_poll_without_subscribers_is_immediate() {
        let hub = hub();
        let deferrals = hub.poll_pre_update("d-1").await;
        assert!(deferrals.is_empty());
    }

    #[tokio::test]
    async fn test_poll_collects_deferral() {
        let hub = std::sync::Arc::new(hub());
        let (tx, mut rx) = SubscriptionHub::event_channel();
        hub.subscribe_component_updates("signal-hub", tx);

        // Client side: receive the event and defer within the window.
        let responder = {
            let hub = hub.clone();
            tokio::spawn(async move {
                let event = rx.recv().await.unwrap();
                assert!(matches!(event, Event::PreUpdate { .. }));
                hub.record_deferral(
                    "d-1",
                    "signal-hub",
                    Duration::from_secs(7),
                    Some("busy".to_string()),
                );
            })
        };

        let deferrals = hub.poll_pre_update("d-1").await;
        responder.await.unwrap();

        assert_eq!(deferrals.len(), 1);
        assert_eq!(deferrals[0].component, "signal-hub");
        assert_eq!(deferrals[0].recheck_after, Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_disconnected_subscriber_treated_as_no_deferral() {
        let hub = hub();
        let (tx, rx) = SubscriptionHub::event_channel();
        hub.subscribe_component_updates("signal-hub", tx);
        drop(rx);

        let deferrals = hub.poll_pre_update("d-1").await;
        assert!(deferrals.is_empty());
        assert!(!hub.has_update_subscribers());
    }

    #[tokio::test]
    async fn test_post_update_delivered() {
        let hub = hub();
        let (tx, mut rx) = SubscriptionHub::event_channel();
        hub.subscribe_component_updates("signal-hub", tx);

        hub.post_update("d-1").await;
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            Event::PostUpdate {
                deployment_id: "d-1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_validate_without_subscribers_accepts() {
        let hub = hub();
        let mut proposals = BTreeMap::new();
        proposals.insert("signal-hub".to_string(), serde_json::json!({"a": 1}));

        hub.validate("d-1", &proposals, Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_validate_accepted() {
        let hub = hub();
        let (tx, mut rx) = SubscriptionHub::event_channel();
        hub.subscribe_validate_configuration("signal-hub", tx);

        let mut proposals = BTreeMap::new();
        proposals.insert("signal-hub".to_string(), serde_json::json!({"a": 1}));

        let hub = std::sync::Arc::new(hub);
        let responder = {
            let hub = hub.clone();
            tokio::spawn(async move {
                let event = rx.recv().await.unwrap();
                assert!(matches!(event, Event::ValidateConfiguration { .. }));
                hub.record_validity_report("d-1", "signal-hub", ValidityStatus::Accepted, None);
            })
        };

        hub.validate("d-1", &proposals, Duration::from_secs(1))
            .await
            .unwrap();
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_validate_rejection_carries_reason() {
        let hub = std::sync::Arc::new(hub());
        let (tx, mut rx) = SubscriptionHub::event_channel();
        hub.subscribe_validate_configuration("signal-hub", tx);

        let mut proposals = BTreeMap::new();
        proposals.insert("signal-hub".to_string(), serde_json::json!({"a": 1}));

        let responder = {
            let hub = hub.clone();
            tokio::spawn(async move {
                let _ = rx.recv().await;
                hub.record_validity_report(
                    "d-1",
                    "signal-hub",
                    ValidityStatus::Rejected,
                    Some("port already bound".to_string()),
                );
            })
        };

        let failures = hub
            .validate("d-1", &proposals, Duration::from_secs(1))
            .await
            .unwrap_err();
        responder.await.unwrap();

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].component, "signal-hub");
        assert_eq!(failures[0].reason, "port already bound");
    }

    #[tokio::test(start_paused = true)]
    async fn test_validate_timeout_names_silent_component() {
        let hub = hub();
        let (tx, _rx) = SubscriptionHub::event_channel();
        hub.subscribe_validate_configuration("signal-hub", tx);

        let mut proposals = BTreeMap::new();
        proposals.insert("signal-hub".to_string(), serde_json::json!({"a": 1}));

        let failures = hub
            .validate("d-1", &proposals, Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].reason, "validation timed out");
    }
}
