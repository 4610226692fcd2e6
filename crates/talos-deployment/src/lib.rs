//! # Talos Deployment
//!
//! The deployment engine: turns declarative desired-state documents into
//! the running set of services on one device.
//!
//! ```text
//!  cloud jobs ──┐
//!  shadow ──────┼──> DeploymentQueue ──> DeploymentCoordinator
//!  local ───────┘                          │
//!                 resolve -> fetch -> validate -> merge -> apply
//!                                          │
//!                      success: groups + GC        failure: rollback
//! ```
//!
//! One pipeline task executes a single deployment at a time. Deployments
//! not yet merging can be superseded by newer arrivals on their source
//! channel or cancelled outright; past that point failure handling decides
//! between keeping partial state and restoring the pre-deployment
//! snapshot.

pub mod context;
pub mod coordinator;
pub mod error;
pub mod groups;
pub mod queue;
pub mod resolver;
pub mod rollback;
pub mod snapshot;
pub mod status;

// Re-export main types at crate root
pub use context::{EngineContext, EngineContextBuilder, EnginePaths, SUPPORTED_CAPABILITIES};
pub use coordinator::{DeploymentCoordinator, DeploymentPhase};
pub use error::{DeploymentError, Result};
pub use groups::{AlwaysMember, GroupContribution, GroupMappings, MembershipOracle, OracleUnavailable};
pub use queue::{DeploymentQueue, OfferOutcome, DEFAULT_QUEUE_CAPACITY};
pub use resolver::{ComponentResolver, Requirement, ResolvedComponent};
pub use rollback::run_rollback;
pub use snapshot::{DeploymentSnapshot, OngoingMarker};
pub use status::{FileStatusConsumer, MemoryStatusConsumer, StatusBroadcaster, StatusConsumer};
