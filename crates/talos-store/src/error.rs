//! Error types for the component store.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in the component store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem error.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path the operation touched.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// No recipe is stored for the requested component version.
    #[error("recipe for '{component}' not found in the store")]
    RecipeNotFound {
        /// Component id rendered as `name@version`.
        component: String,
    },

    /// An artifact's content did not match its declared digest.
    #[error("artifact '{artifact}' digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Artifact file name.
        artifact: String,
        /// Digest declared in the recipe.
        expected: String,
        /// Digest computed from disk.
        actual: String,
    },

    /// A required artifact is missing from the store.
    #[error("artifact '{artifact}' for '{component}' is not present locally")]
    ArtifactMissing {
        /// Component id rendered as `name@version`.
        component: String,
        /// Artifact file name.
        artifact: String,
    },

    /// Fetching a component from its source failed.
    #[error("download failed for '{component}': {reason}")]
    DownloadFailed {
        /// Component name (and version when known).
        component: String,
        /// Failure reason.
        reason: String,
    },

    /// An archive could not be unpacked.
    #[error("failed to unarchive '{archive}': {reason}")]
    Unarchive {
        /// Archive path.
        archive: PathBuf,
        /// Failure reason.
        reason: String,
    },

    /// Core model error (recipe parse/validation).
    #[error(transparent)]
    Core(#[from] talos_core::Error),
}
