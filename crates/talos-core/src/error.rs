//! Error types shared across the Talos data model.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while parsing or validating the shared data model.
#[derive(Error, Debug)]
pub enum Error {
    /// A desired-state document failed to parse or validate.
    #[error("invalid deployment document: {reason}")]
    InvalidDocument {
        /// Why the document was rejected.
        reason: String,
    },

    /// A component recipe failed to parse or validate.
    #[error("invalid recipe for '{component}': {reason}")]
    InvalidRecipe {
        /// Component the recipe belongs to.
        component: String,
        /// Why the recipe was rejected.
        reason: String,
    },

    /// A component name contains illegal characters or is empty.
    #[error("invalid component name '{name}'")]
    InvalidComponentName {
        /// The offending name.
        name: String,
    },

    /// A version or version requirement string could not be parsed.
    #[error("invalid version requirement '{value}': {reason}")]
    InvalidVersionRequirement {
        /// The offending requirement string.
        value: String,
        /// Parser diagnostic.
        reason: String,
    },

    /// No recipe manifest matches the device platform.
    #[error("component '{component}' does not support platform {os}/{architecture}")]
    UnsupportedPlatform {
        /// Component whose recipe was inspected.
        component: String,
        /// Device operating system.
        os: String,
        /// Device CPU architecture.
        architecture: String,
    },

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
