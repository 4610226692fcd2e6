//! Deployment status fan-out.
//!
//! Every status change is recorded and delivered to the registered
//! consumers; a deployment's terminal status is published exactly once even
//! if the pipeline reports it twice (e.g. cancellation racing completion).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};
use std::sync::Arc;

use talos_core::StatusRecord;

/// Receives deployment status records.
pub trait StatusConsumer: Send + Sync {
    /// Called for every accepted status change.
    fn on_status(&self, record: &StatusRecord);
}

/// Records statuses and fans them out to consumers.
#[derive(Default)]
pub struct StatusBroadcaster {
    consumers: RwLock<Vec<Arc<dyn StatusConsumer>>>,
    records: Mutex<HashMap<String, StatusRecord>>,
}

impl StatusBroadcaster {
    /// Creates a broadcaster with no consumers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a consumer for all future records.
    pub fn register(&self, consumer: Arc<dyn StatusConsumer>) {
        if let Ok(mut consumers) = self.consumers.write() {
            consumers.push(consumer);
        }
    }

    /// Publishes a record, unless the deployment is already terminal.
    pub fn publish(&self, record: StatusRecord) {
        {
            let Ok(mut records) = self.records.lock() else {
                return;
            };
            if let Some(existing) = records.get(&record.deployment_id) {
                if existing.status.is_terminal() {
                    tracing::debug!(
                        deployment_id = %record.deployment_id,
                        "terminal status already published, dropping"
                    );
                    return;
                }
            }
            records.insert(record.deployment_id.clone(), record.clone());
        }

        tracing::info!(
            deployment_id = %record.deployment_id,
            status = %record.status,
            detail = ?record.detailed_status,
            cause = record.failure_cause.as_deref().unwrap_or(""),
            "deployment status"
        );

        if let Ok(consumers) = self.consumers.read() {
            for consumer in consumers.iter() {
                consumer.on_status(&record);
            }
        }
    }

    /// The last published record for a deployment.
    #[must_use]
    pub fn status(&self, deployment_id: &str) -> Option<StatusRecord> {
        self.records
            .lock()
            .ok()
            .and_then(|records| records.get(deployment_id).cloned())
    }
}

/// Persists each record to `deployments/<id>/status.json`.
pub struct FileStatusConsumer {
    deployments_dir: PathBuf,
}

impl FileStatusConsumer {
    /// Creates a consumer writing under `deployments_dir`.
    #[must_use]
    pub const fn new(deployments_dir: PathBuf) -> Self {
        Self { deployments_dir }
    }
}

impl StatusConsumer for FileStatusConsumer {
    fn on_status(&self, record: &StatusRecord) {
        let dir = self.deployments_dir.join(&record.deployment_id);
        let result = std::fs::create_dir_all(&dir)
            .and_then(|()| {
                let json = serde_json::to_vec_pretty(record)?;
                std::fs::write(dir.join("status.json"), json)
            });
        if let Err(e) = result {
            tracing::warn!(
                deployment_id = %record.deployment_id,
                error = %e,
                "failed to persist status record"
            );
        }
    }
}

/// Collects records in memory; test harness consumer.
#[derive(Default)]
pub struct MemoryStatusConsumer {
    records: Mutex<Vec<StatusRecord>>,
}

impl MemoryStatusConsumer {
    /// Creates an empty consumer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything received so far.
    #[must_use]
    pub fn records(&self) -> Vec<StatusRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl StatusConsumer for MemoryStatusConsumer {
    fn on_status(&self, record: &StatusRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }
}
