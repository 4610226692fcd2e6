//! # Talos Config
//!
//! The hierarchical configuration store of the Talos engine.
//!
//! The store is a tree of named groupings with timestamped leaves: for any
//! path, the newest write wins. It is the only process-wide mutable state in
//! the engine and follows a single-writer discipline: one task applies
//! mutations while readers take snapshots. Running services observe changes
//! through subtree subscriptions.
//!
//! This crate provides:
//!
//! - [`ConfigStore`] / [`ConfigTree`] - the store and its tree
//! - [`TransactionLog`] - append-only persistence with replay and compaction
//! - [`merge`] - MERGE/RESET semantics for component configuration updates
//! - [`interpolate`] - configuration token substitution

#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod interpolate;
pub mod merge;
pub mod store;
pub mod tlog;
pub mod tree;
pub mod value;

// Re-export main types at crate root
pub use error::{ConfigError, Result};
pub use interpolate::{interpolate, interpolate_str, InterpolationContext};
pub use merge::{deep_merge, proposed_configuration};
pub use store::{paths, ConfigEvent, ConfigEventKind, ConfigStore, Subscription};
pub use tlog::{TlogOp, TlogRecord, TransactionLog};
pub use tree::{ConfigTree, Leaf, Node, WriteOutcome};
pub use value::Value;
