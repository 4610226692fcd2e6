//! The process-wide configuration store.
//!
//! A single writer mutates the timestamped tree under a synchronous lock;
//! readers take cheap snapshots. Subscribers register on any subtree and
//! receive change events over a bounded broadcast channel. When opened with
//! a transaction log, every accepted mutation is appended and the tree is
//! rebuilt by replay at startup.

use std::path::Path;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::tlog::{TlogOp, TlogRecord, TransactionLog};
use crate::tree::{ConfigTree, WriteOutcome};
use crate::value::Value;

/// Capacity of the change-event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Well-known path segments used by the engine.
pub mod paths {
    /// Root grouping for per-service state.
    pub const SERVICES: &str = "services";

    /// Component configuration subtree.
    pub const CONFIGURATION: &str = "configuration";

    /// Runtime-scoped values written by the service itself; these survive
    /// rollback.
    pub const RUNTIME: &str = "runtime";

    /// The active version leaf.
    pub const VERSION: &str = "version";
}

/// What happened at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigEventKind {
    /// A leaf was written.
    Written,

    /// A subtree was removed.
    Removed,

    /// The whole tree was replaced (rollback restore).
    Replaced,
}

/// A change notification delivered to subscribers.
#[derive(Debug, Clone)]
pub struct ConfigEvent {
    /// Path of the change; empty for whole-tree replacement.
    pub path: Vec<String>,

    /// What happened.
    pub kind: ConfigEventKind,

    /// Timestamp of the mutation.
    pub timestamp: i64,
}

/// A prefix-filtered subscription to store changes.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<ConfigEvent>,
    prefix: Vec<String>,
}

impl Subscription {
    /// Receives the next event under the subscribed prefix.
    ///
    /// Returns `None` when the store is dropped. Missed events due to
    /// channel lag are skipped.
    pub async fn recv(&mut self) -> Option<ConfigEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "configuration subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn matches(&self, event: &ConfigEvent) -> bool {
        if event.kind == ConfigEventKind::Replaced {
            return true;
        }
        // A change counts if it happens at, below, or above the prefix.
        let len = self.prefix.len().min(event.path.len());
        self.prefix[..len] == event.path[..len]
    }
}

/// The configuration store.
#[derive(Debug)]
pub struct ConfigStore {
    tree: RwLock<ConfigTree>,
    tlog: Mutex<Option<TransactionLog>>,
    events: broadcast::Sender<ConfigEvent>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    /// Creates an in-memory store with no persistence.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tree: RwLock::new(ConfigTree::new()),
            tlog: Mutex::new(None),
            events,
        }
    }

    /// Opens a store backed by the transaction log at `path`, replaying any
    /// existing records into the tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be opened or replayed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (log, records) = TransactionLog::open(path.as_ref().to_path_buf())?;

        let mut tree = ConfigTree::new();
        for record in &records {
            let path: Vec<&str> = record.path.iter().map(String::as_str).collect();
            match (&record.op, &record.value) {
                (TlogOp::Write, Some(value)) => {
                    tree.set(&path, value.clone(), record.ts)?;
                }
                (TlogOp::Remove, _) => {
                    tree.remove(&path);
                }
                (TlogOp::Write, None) => {}
            }
        }

        tracing::info!(
            records = records.len(),
            path = ?path.as_ref(),
            "configuration store replayed"
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            tree: RwLock::new(tree),
            tlog: Mutex::new(Some(log)),
            events,
        })
    }

    /// Subscribes to changes under `prefix` (empty prefix = everything).
    #[must_use]
    pub fn subscribe(&self, prefix: &[&str]) -> Subscription {
        Subscription {
            rx: self.events.subscribe(),
            prefix: prefix.iter().map(ToString::to_string).collect(),
        }
    }

    /// Writes a leaf value.
    ///
    /// # Errors
    ///
    /// Returns an error on a path conflict or a tlog failure.
    pub fn write(&self, path: &[&str], value: Value, timestamp: i64) -> Result<WriteOutcome> {
        let outcome = self.tree.write().set(path, value.clone(), timestamp)?;
        if outcome == WriteOutcome::Written {
            self.log(TlogRecord::write(
                path.iter().map(ToString::to_string).collect(),
                value,
                timestamp,
            ))?;
            self.publish(path, ConfigEventKind::Written, timestamp);
        }
        Ok(outcome)
    }

    /// Deep-merges a JSON document at `path`; returns the paths written.
    ///
    /// # Errors
    ///
    /// Returns an error on a path conflict or a tlog failure.
    pub fn merge_json(
        &self,
        path: &[&str],
        json: &serde_json::Value,
        timestamp: i64,
    ) -> Result<Vec<Vec<String>>> {
        let written = self.tree.write().merge_json(path, json, timestamp)?;
        for changed in &written {
            let segments: Vec<&str> = changed.iter().map(String::as_str).collect();
            let value = self
                .tree
                .read()
                .get_value(&segments)
                .cloned()
                .unwrap_or(Value::Null);
            self.log(TlogRecord::write(changed.clone(), value, timestamp))?;
            self.publish(&segments, ConfigEventKind::Written, timestamp);
        }
        Ok(written)
    }

    /// Replaces the subtree at `path` with a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error on a path conflict or a tlog failure.
    pub fn replace_json(
        &self,
        path: &[&str],
        json: &serde_json::Value,
        timestamp: i64,
    ) -> Result<()> {
        self.tree.write().replace_json(path, json, timestamp)?;
        self.log(TlogRecord::remove(
            path.iter().map(ToString::to_string).collect(),
            timestamp,
        ))?;
        // Compaction is cheaper than logging every leaf of the new subtree.
        self.compact()?;
        self.publish(path, ConfigEventKind::Written, timestamp);
        Ok(())
    }

    /// Removes the subtree at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error on a tlog failure.
    pub fn remove(&self, path: &[&str], timestamp: i64) -> Result<bool> {
        let removed = self.tree.write().remove(path);
        if removed {
            self.log(TlogRecord::remove(
                path.iter().map(ToString::to_string).collect(),
                timestamp,
            ))?;
            self.publish(path, ConfigEventKind::Removed, timestamp);
        }
        Ok(removed)
    }

    /// Replaces the whole tree (rollback restore) and compacts the log.
    ///
    /// # Errors
    ///
    /// Returns an error on a tlog failure.
    pub fn restore(&self, tree: ConfigTree, timestamp: i64) -> Result<()> {
        *self.tree.write() = tree;
        self.compact()?;
        if self.events.receiver_count() > 0 {
            let _ = self.events.send(ConfigEvent {
                path: Vec::new(),
                kind: ConfigEventKind::Replaced,
                timestamp,
            });
        }
        Ok(())
    }

    /// Returns a cloned leaf value.
    #[must_use]
    pub fn get_value(&self, path: &[&str]) -> Option<Value> {
        self.tree.read().get_value(path).cloned()
    }

    /// Renders the subtree at `path` as JSON.
    #[must_use]
    pub fn to_json(&self, path: &[&str]) -> Option<serde_json::Value> {
        self.tree.read().to_json(path)
    }

    /// Runs `f` against a read-locked view of the tree.
    pub fn read<R>(&self, f: impl FnOnce(&ConfigTree) -> R) -> R {
        f(&self.tree.read())
    }

    /// Returns a full copy of the tree (a point-in-time snapshot).
    #[must_use]
    pub fn snapshot(&self) -> ConfigTree {
        self.tree.read().clone()
    }

    /// Flushes the transaction log; called on shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn flush(&self) -> Result<()> {
        if let Some(log) = self.tlog.lock().as_mut() {
            log.flush()?;
        }
        Ok(())
    }

    /// Rewrites the transaction log from the live tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the rewrite fails.
    pub fn compact(&self) -> Result<()> {
        if let Some(log) = self.tlog.lock().as_mut() {
            let tree = self.tree.read().clone();
            log.compact(&tree)?;
        }
        Ok(())
    }

    fn log(&self, record: TlogRecord) -> Result<()> {
        if let Some(log) = self.tlog.lock().as_mut() {
            log.append(&record)?;
        }
        Ok(())
    }

    fn publish(&self, path: &[&str], kind: ConfigEventKind, timestamp: i64) {
        if self.events.receiver_count() == 0 {
            return;
        }
        let _ = self.events.send(ConfigEvent {
            path: path.iter().map(ToString::to_string).collect(),
            kind,
            timestamp,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_and_read_back() {
        let store = ConfigStore::new();
        store
            .write(&["services", "hub", "version"], Value::from("1.0.0"), 1)
            .unwrap();

        assert_eq!(
            store.get_value(&["services", "hub", "version"]),
            Some(Value::from("1.0.0"))
        );
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let tlog = dir.path().join("config").join("config.tlog");

        {
            let store = ConfigStore::open(&tlog).unwrap();
            store
                .merge_json(&["cfg"], &json!({"a": 1, "b": {"c": 2}}), 5)
                .unwrap();
            store.remove(&["cfg", "a"], 6).unwrap();
            store.flush().unwrap();
        }

        let store = ConfigStore::open(&tlog).unwrap();
        assert_eq!(store.get_value(&["cfg", "a"]), None);
        assert_eq!(store.get_value(&["cfg", "b", "c"]), Some(Value::Int(2)));
    }

    #[test]
    fn test_restore_replaces_and_compacts() {
        let dir = tempfile::tempdir().unwrap();
        let tlog = dir.path().join("config.tlog");

        let store = ConfigStore::open(&tlog).unwrap();
        store.merge_json(&["cfg"], &json!({"a": 1}), 5).unwrap();

        let snapshot = store.snapshot();
        store.merge_json(&["cfg"], &json!({"a": 2, "b": 3}), 6).unwrap();

        store.restore(snapshot, 7).unwrap();
        assert_eq!(store.to_json(&["cfg"]), Some(json!({"a": 1})));

        // After compaction a replay must converge to the restored state.
        drop(store);
        let store = ConfigStore::open(&tlog).unwrap();
        assert_eq!(store.to_json(&["cfg"]), Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_subscription_prefix_filtering() {
        let store = ConfigStore::new();
        let mut sub = store.subscribe(&["services", "hub"]);

        store
            .write(&["services", "other", "x"], Value::Int(1), 1)
            .unwrap();
        store
            .write(&["services", "hub", "interval"], Value::Int(30), 2)
            .unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.path, vec!["services", "hub", "interval"]);
        assert_eq!(event.kind, ConfigEventKind::Written);
    }

    #[tokio::test]
    async fn test_subscription_sees_whole_tree_replacement() {
        let store = ConfigStore::new();
        let mut sub = store.subscribe(&["services", "hub"]);

        store.restore(ConfigTree::new(), 9).unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.kind, ConfigEventKind::Replaced);
    }

    #[test]
    fn test_stale_write_not_logged() {
        let store = ConfigStore::new();
        store.write(&["a"], Value::Int(2), 10).unwrap();
        let outcome = store.write(&["a"], Value::Int(1), 5).unwrap();
        assert_eq!(outcome, WriteOutcome::IgnoredOlder);
        assert_eq!(store.get_value(&["a"]), Some(Value::Int(2)));
    }
}
