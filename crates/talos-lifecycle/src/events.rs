//! Typed lifecycle event hub.
//!
//! Service state changes fan out to consumers over a bounded broadcast
//! channel; consumers that fall behind skip events rather than blocking the
//! pipeline.

use tokio::sync::broadcast;

use crate::state::ServiceState;

/// Capacity of the event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A service changed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStateChanged {
    /// Service name.
    pub service: String,

    /// Previous state.
    pub old: ServiceState,

    /// New state.
    pub new: ServiceState,
}

/// Fan-out hub for lifecycle events.
#[derive(Debug)]
pub struct LifecycleEventHub {
    tx: broadcast::Sender<ServiceStateChanged>,
}

impl Default for LifecycleEventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleEventHub {
    /// Creates a hub with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribes to state-change events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceStateChanged> {
        self.tx.subscribe()
    }

    /// Publishes a state change.
    pub fn publish(&self, event: ServiceStateChanged) {
        tracing::debug!(
            service = %event.service,
            old = %event.old,
            new = %event.new,
            "service state changed"
        );
        if self.tx.receiver_count() > 0 {
            let _ = self.tx.send(event);
        }
    }
}
