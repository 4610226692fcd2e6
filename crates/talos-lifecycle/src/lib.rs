//! # Talos Lifecycle
//!
//! Service lifecycle execution for the Talos engine.
//!
//! A deployment ends in an update plan: services to stop, components to
//! install, services to start. This crate owns everything between the plan
//! and the running processes:
//!
//! - [`ServiceState`] - the nine-state service machine
//! - [`ServiceRegistry`] - arena-allocated service graph with
//!   insertion-time cycle detection
//! - [`ScriptRunner`] - lifecycle script execution
//!   ([`ProcessScriptRunner`] on `tokio::process`, [`InstantScriptRunner`]
//!   for harnesses)
//! - [`compute_plan`] - the current-vs-target diff
//! - [`LifecycleExecutor`] - plan execution with retry budgets and the
//!   update-disruption policy ([`UpdateGate`])
//! - [`LifecycleEventHub`] - typed `ServiceStateChanged` fan-out

pub mod error;
pub mod events;
pub mod executor;
pub mod gate;
pub mod plan;
pub mod registry;
pub mod runner;
pub mod state;

// Re-export main types at crate root
pub use error::{LifecycleError, Result};
pub use events::{LifecycleEventHub, ServiceStateChanged};
pub use executor::{LifecycleExecutor, ServiceSummary, DEFAULT_RETRY_BUDGET};
pub use gate::{wait_for_update_clearance, Deferral, NoopUpdateGate, UpdateGate};
pub use plan::{compute_plan, topological_order, ActiveComponent, TargetComponent, UpdatePlan};
pub use registry::{ServiceIndex, ServiceNode, ServiceRegistry};
pub use runner::{
    InstantScriptRunner, PhaseContext, PhaseOutcome, ProcessScriptRunner, ScriptRunner,
    ServiceHandle,
};
pub use state::{ServiceState, WaitOutcome};
