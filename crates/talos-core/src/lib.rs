//! # Talos Core
//!
//! Core types for the Talos edge component orchestrator.
//!
//! This crate provides the foundational data structures used throughout the
//! Talos ecosystem, including:
//!
//! - [`ComponentId`] / [`ComponentRequirement`] - Component identity and
//!   semver requirements
//! - [`Deployment`] - Immutable deployment request with source and stage
//! - [`DeploymentDocument`] - Normalized desired-state document and its
//!   camelCase JSON wire form
//! - [`Recipe`] - Canonical, platform-resolved component recipe
//! - [`StatusRecord`] - Deployment status reporting
//!
//! ## Example
//!
//! ```rust
//! use talos_core::DeploymentDocument;
//!
//! let doc = DeploymentDocument::from_json(
//!     r#"{ "creationTimestamp": 1700000000000,
//!          "components": { "signal-hub": { "version": ">=1.0.0" } } }"#,
//! )
//! .unwrap();
//! assert!(doc.components.contains_key("signal-hub"));
//! ```

pub mod component;
pub mod deployment;
pub mod document;
pub mod error;
pub mod recipe;
pub mod status;

// Re-export main types at crate root
pub use component::{validate_component_name, ComponentId, ComponentRequirement};
pub use deployment::{Deployment, DeploymentSource, DeploymentStage};
pub use document::{
    ComponentSpec, ComponentUpdatePolicy, ConfigurationUpdate, ConfigurationValidationPolicy,
    DeploymentDocument, FailureHandlingPolicy, RunWith, SystemResourceLimits, UpdateAction,
};
pub use error::{Error, Result};
pub use recipe::{
    ArtifactSpec, DependencySpec, DependencyType, Lifecycle, LifecyclePhase, PlatformInfo, Recipe,
    ScriptSpec, Unarchive,
};
pub use status::{DeploymentStatus, DetailedStatus, StatusRecord};
