//! The deployment queue.
//!
//! Sources hand deployments in through a bounded queue with per-source
//! semantics: cloud jobs are strictly ordered and deduplicated by id, shadow
//! deployments are last-writer-wins by timestamp, local deployments are
//! FIFO. A queued deployment that has not yet started merging is superseded
//! when a newer one arrives on the same source channel.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use talos_core::{Deployment, DeploymentDocument, DeploymentSource};

use crate::error::{DeploymentError, Result};

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// What happened to an offered deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Queued for execution.
    Accepted,

    /// Queued, and a previously queued deployment from the same source was
    /// superseded.
    Superseded {
        /// The replaced deployment's id.
        previous_id: String,
    },

    /// Discarded: a cloud job with an id the engine has already seen.
    DuplicateDiscarded,

    /// Discarded: a shadow deployment older than the newest one seen.
    StaleDiscarded,
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<Deployment>,
    seen_cloud_ids: HashSet<String>,
    latest_shadow: Option<DateTime<Utc>>,
}

/// Bounded multi-source deployment queue.
#[derive(Debug)]
pub struct DeploymentQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    available: Notify,
}

impl Default for DeploymentQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl DeploymentQueue {
    /// Creates a queue with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity,
            available: Notify::new(),
        }
    }

    /// Offers a deployment, applying the source's ordering semantics.
    ///
    /// # Errors
    ///
    /// Returns [`DeploymentError::QueueFull`] when at capacity.
    pub fn offer(&self, deployment: Deployment) -> Result<OfferOutcome> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| DeploymentError::QueueFull)?;

        match deployment.source {
            DeploymentSource::CloudJobs => {
                if state.seen_cloud_ids.contains(&deployment.id) {
                    tracing::debug!(deployment_id = %deployment.id, "duplicate cloud job discarded");
                    return Ok(OfferOutcome::DuplicateDiscarded);
                }
            }
            DeploymentSource::Shadow => {
                if let Some(latest) = state.latest_shadow {
                    if deployment.timestamp < latest {
                        tracing::debug!(
                            deployment_id = %deployment.id,
                            "stale shadow deployment discarded"
                        );
                        return Ok(OfferOutcome::StaleDiscarded);
                    }
                }
            }
            DeploymentSource::Local => {}
        }

        // One pending deployment per source channel: a newer arrival
        // supersedes whatever is still waiting.
        let previous = state
            .queue
            .iter()
            .position(|d| d.source == deployment.source)
            .and_then(|idx| state.queue.remove(idx));

        if state.queue.len() >= self.capacity {
            return Err(DeploymentError::QueueFull);
        }

        if deployment.source == DeploymentSource::CloudJobs {
            state.seen_cloud_ids.insert(deployment.id.clone());
        }
        if deployment.source == DeploymentSource::Shadow {
            state.latest_shadow = Some(deployment.timestamp);
        }

        tracing::info!(
            deployment_id = %deployment.id,
            source = %deployment.source,
            group = %deployment.group_id,
            "deployment queued"
        );
        state.queue.push_back(deployment);
        drop(state);
        self.available.notify_one();

        Ok(previous.map_or(OfferOutcome::Accepted, |d| OfferOutcome::Superseded {
            previous_id: d.id,
        }))
    }

    /// Takes the next deployment, waiting until one is available.
    pub async fn take(&self) -> Deployment {
        loop {
            if let Ok(mut state) = self.state.lock() {
                if let Some(deployment) = state.queue.pop_front() {
                    return deployment;
                }
            }
            self.available.notified().await;
        }
    }

    /// Removes a queued deployment by id (operator cancellation).
    #[must_use]
    pub fn remove(&self, deployment_id: &str) -> Option<Deployment> {
        let mut state = self.state.lock().ok()?;
        let idx = state.queue.iter().position(|d| d.id == deployment_id)?;
        state.queue.remove(idx)
    }

    /// Number of queued deployments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.queue.len()).unwrap_or(0)
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Documents of every queued deployment; the garbage collector uses
    /// these to keep referenced versions on disk.
    #[must_use]
    pub fn queued_documents(&self) -> Vec<DeploymentDocument> {
        self.state
            .lock()
            .map(|s| s.queue.iter().map(|d| d.document.clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn deployment(id: &str, source: DeploymentSource) -> Deployment {
        Deployment::new(id, source, "group", DeploymentDocument::default())
    }

    #[test]
    fn test_offer_and_take_order() {
        let queue = DeploymentQueue::new(10);
        queue
            .offer(deployment("c-1", DeploymentSource::CloudJobs))
            .unwrap();
        queue
            .offer(deployment("l-1", DeploymentSource::Local))
            .unwrap();

        assert_eq!(queue.len(), 2);
        let first = futures::executor::block_on(queue.take());
        assert_eq!(first.id, "c-1");
    }

    #[test]
    fn test_cloud_duplicate_discarded() {
        let queue = DeploymentQueue::new(10);
        queue
            .offer(deployment("c-1", DeploymentSource::CloudJobs))
            .unwrap();
        let outcome = queue
            .offer(deployment("c-1", DeploymentSource::CloudJobs))
            .unwrap();
        assert_eq!(outcome, OfferOutcome::DuplicateDiscarded);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_cloud_duplicate_discarded_after_dequeue() {
        let queue = DeploymentQueue::new(10);
        queue
            .offer(deployment("c-1", DeploymentSource::CloudJobs))
            .unwrap();
        let _ = futures::executor::block_on(queue.take());

        let outcome = queue
            .offer(deployment("c-1", DeploymentSource::CloudJobs))
            .unwrap();
        assert_eq!(outcome, OfferOutcome::DuplicateDiscarded);
    }

    #[test]
    fn test_same_source_supersedes_queued() {
        let queue = DeploymentQueue::new(10);
        queue
            .offer(deployment("c-1", DeploymentSource::CloudJobs))
            .unwrap();
        let outcome = queue
            .offer(deployment("c-2", DeploymentSource::CloudJobs))
            .unwrap();

        assert_eq!(
            outcome,
            OfferOutcome::Superseded {
                previous_id: "c-1".to_string()
            }
        );
        assert_eq!(queue.len(), 1);
        let next = futures::executor::block_on(queue.take());
        assert_eq!(next.id, "c-2");
    }

    #[test]
    fn test_different_sources_coexist() {
        let queue = DeploymentQueue::new(10);
        queue
            .offer(deployment("c-1", DeploymentSource::CloudJobs))
            .unwrap();
        let outcome = queue
            .offer(deployment("l-1", DeploymentSource::Local))
            .unwrap();
        assert_eq!(outcome, OfferOutcome::Accepted);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_stale_shadow_discarded() {
        let queue = DeploymentQueue::new(10);
        let newer = deployment("s-2", DeploymentSource::Shadow)
            .with_timestamp(Utc.timestamp_millis_opt(2_000).single().unwrap());
        let older = deployment("s-1", DeploymentSource::Shadow)
            .with_timestamp(Utc.timestamp_millis_opt(1_000).single().unwrap());

        queue.offer(newer).unwrap();
        let outcome = queue.offer(older).unwrap();
        assert_eq!(outcome, OfferOutcome::StaleDiscarded);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_queue_capacity() {
        let queue = DeploymentQueue::new(1);
        queue
            .offer(deployment("c-1", DeploymentSource::CloudJobs))
            .unwrap();
        // A second source would exceed capacity (the first is still queued).
        let err = queue
            .offer(deployment("l-1", DeploymentSource::Local))
            .unwrap_err();
        assert!(matches!(err, DeploymentError::QueueFull));
    }

    #[test]
    fn test_remove_queued() {
        let queue = DeploymentQueue::new(10);
        queue
            .offer(deployment("l-1", DeploymentSource::Local))
            .unwrap();

        let removed = queue.remove("l-1").unwrap();
        assert_eq!(removed.id, "l-1");
        assert!(queue.is_empty());
        assert!(queue.remove("l-1").is_none());
    }

    #[tokio::test]
    async fn test_take_waits_for_offer() {
        let queue = std::sync::Arc::new(DeploymentQueue::new(10));
        let taker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take().await })
        };

        tokio::task::yield_now().await;
        queue
            .offer(deployment("l-1", DeploymentSource::Local))
            .unwrap();

        let taken = taker.await.unwrap();
        assert_eq!(taken.id, "l-1");
    }
}
