//! Component fetching.
//!
//! Artifact transport is an external collaborator; the engine only needs a
//! [`ComponentFetcher`] that can enumerate candidate versions and make a
//! component present locally. [`LocalStoreFetcher`] is the offline
//! implementation backed entirely by the on-disk store.

use async_trait::async_trait;
use semver::Version;

use talos_core::{ComponentId, Recipe, Unarchive};

use crate::archive::unpack_tar_gz;
use crate::error::{Result, StoreError};
use crate::store::ComponentStore;

/// Makes components present locally.
#[async_trait]
pub trait ComponentFetcher: Send + Sync {
    /// Enumerates candidate versions of `name`, newest first.
    async fn available_versions(&self, name: &str) -> Result<Vec<Version>>;

    /// Ensures the recipe for `id` is present locally and returns it.
    async fn fetch_recipe(&self, id: &ComponentId) -> Result<Recipe>;

    /// Ensures every artifact of `recipe` is present locally, verifying
    /// digests and unarchiving where the recipe asks for it.
    async fn prepare_artifacts(&self, recipe: &Recipe) -> Result<()>;
}

/// Fetcher that only ever consults the local store.
///
/// Used when the device is offline and in tests; candidates are whatever is
/// already on disk.
#[derive(Debug, Clone)]
pub struct LocalStoreFetcher {
    store: ComponentStore,
}

impl LocalStoreFetcher {
    /// Creates a local-only fetcher over `store`.
    #[must_use]
    pub const fn new(store: ComponentStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ComponentFetcher for LocalStoreFetcher {
    async fn available_versions(&self, name: &str) -> Result<Vec<Version>> {
        Ok(self.store.list_versions(name))
    }

    async fn fetch_recipe(&self, id: &ComponentId) -> Result<Recipe> {
        self.store.load_recipe(id).map_err(|e| match e {
            StoreError::RecipeNotFound { component } => StoreError::DownloadFailed {
                component,
                reason: "not present locally and no remote registry configured".to_string(),
            },
            other => other,
        })
    }

    async fn prepare_artifacts(&self, recipe: &Recipe) -> Result<()> {
        let id = recipe.id();
        for artifact in &recipe.artifacts {
            let path = self.store.artifact_dir(&id).join(artifact.file_name());
            if !path.is_file() {
                return Err(StoreError::ArtifactMissing {
                    component: id.to_string(),
                    artifact: artifact.file_name().to_string(),
                });
            }

            if let Some(digest) = &artifact.digest {
                self.store.verify_artifact(&path, digest)?;
            }

            if artifact.unarchive == Unarchive::TarGz {
                let stem = artifact
                    .file_name()
                    .trim_end_matches(".tar.gz")
                    .to_string();
                let dest = self.store.unarchived_dir(&id).join(stem);
                if !dest.is_dir() {
                    unpack_tar_gz(&path, &dest)?;
                }
            }
        }
        Ok(())
    }
}
