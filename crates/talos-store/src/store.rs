//! The on-disk component store.
//!
//! Layout under the packages directory:
//!
//! ```text
//! packages/
//!   recipes/<name>-<version>.yaml
//!   artifacts/<name>/<version>/...
//!   artifacts-unarchived/<name>/<version>/...
//! ```
//!
//! A component may be present in the store without being active; retention
//! is the garbage collector's job.

use std::path::{Path, PathBuf};

use semver::Version;
use sha2::{Digest, Sha256};

use talos_core::{ComponentId, PlatformInfo, Recipe};

use crate::error::{Result, StoreError};

const RECIPES_DIR: &str = "recipes";
const ARTIFACTS_DIR: &str = "artifacts";
const UNARCHIVED_DIR: &str = "artifacts-unarchived";

/// The component store rooted at a packages directory.
#[derive(Debug, Clone)]
pub struct ComponentStore {
    root: PathBuf,
    platform: PlatformInfo,
}

impl ComponentStore {
    /// Opens (creating if needed) the store at `root`, resolving recipes for
    /// `platform`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory structure cannot be created.
    pub fn open(root: impl Into<PathBuf>, platform: PlatformInfo) -> Result<Self> {
        let root = root.into();
        for dir in [RECIPES_DIR, ARTIFACTS_DIR, UNARCHIVED_DIR] {
            let path = root.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| StoreError::Io { path, source: e })?;
        }
        Ok(Self { root, platform })
    }

    /// The packages directory this store is rooted at.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The platform recipes are resolved for.
    #[must_use]
    pub const fn platform(&self) -> &PlatformInfo {
        &self.platform
    }

    /// Path of the recipe file for a component version.
    #[must_use]
    pub fn recipe_path(&self, id: &ComponentId) -> PathBuf {
        self.root
            .join(RECIPES_DIR)
            .join(format!("{}.yaml", id.file_stem()))
    }

    /// Artifact directory for a component version.
    #[must_use]
    pub fn artifact_dir(&self, id: &ComponentId) -> PathBuf {
        self.root
            .join(ARTIFACTS_DIR)
            .join(&id.name)
            .join(id.version.to_string())
    }

    /// Unarchived-artifact directory for a component version.
    #[must_use]
    pub fn unarchived_dir(&self, id: &ComponentId) -> PathBuf {
        self.root
            .join(UNARCHIVED_DIR)
            .join(&id.name)
            .join(id.version.to_string())
    }

    /// Returns true if a recipe for `id` is stored.
    #[must_use]
    pub fn has_recipe(&self, id: &ComponentId) -> bool {
        self.recipe_path(id).is_file()
    }

    /// Persists a canonical recipe.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_recipe(&self, recipe: &Recipe) -> Result<()> {
        let path = self.recipe_path(&recipe.id());
        let yaml = recipe.to_yaml()?;
        std::fs::write(&path, yaml).map_err(|e| StoreError::Io { path, source: e })?;
        tracing::debug!(component = %recipe.id(), "stored recipe");
        Ok(())
    }

    /// Loads and platform-resolves the recipe for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecipeNotFound`] if absent, or a parse error.
    pub fn load_recipe(&self, id: &ComponentId) -> Result<Recipe> {
        let path = self.recipe_path(id);
        if !path.is_file() {
            return Err(StoreError::RecipeNotFound {
                component: id.to_string(),
            });
        }
        let yaml =
            std::fs::read_to_string(&path).map_err(|e| StoreError::Io { path, source: e })?;
        Ok(Recipe::from_yaml(&yaml, &self.platform)?)
    }

    /// Lists stored versions of `name` in descending order.
    #[must_use]
    pub fn list_versions(&self, name: &str) -> Vec<Version> {
        let mut versions: Vec<Version> = self
            .list_all()
            .into_iter()
            .filter(|id| id.name == name)
            .map(|id| id.version)
            .collect();
        versions.sort_by(|a, b| b.cmp(a));
        versions
    }

    /// Lists every component version present in the store.
    #[must_use]
    pub fn list_all(&self) -> Vec<ComponentId> {
        let recipes = self.root.join(RECIPES_DIR);
        let mut ids: Vec<ComponentId> = walkdir::WalkDir::new(recipes)
            .max_depth(1)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "yaml"))
            .filter_map(|e| {
                e.path()
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(ComponentId::from_file_stem)
            })
            .collect();
        ids.sort();
        ids
    }

    /// Verifies an artifact file against an expected SHA-256 hex digest.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DigestMismatch`] on a mismatch, or an IO error.
    pub fn verify_artifact(&self, path: &Path, expected: &str) -> Result<()> {
        let data = std::fs::read(path).map_err(|e| StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut hasher = Sha256::new();
        hasher.update(&data);
        let actual = hex::encode(hasher.finalize());

        let expected_hex = expected.strip_prefix("sha256:").unwrap_or(expected);
        if actual != expected_hex {
            return Err(StoreError::DigestMismatch {
                artifact: path
                    .file_name()
                    .map_or_else(|| path.display().to_string(), |n| {
                        n.to_string_lossy().into_owned()
                    }),
                expected: expected_hex.to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// Total bytes used by the store.
    #[must_use]
    pub fn size(&self) -> u64 {
        walkdir::WalkDir::new(&self.root)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }

    /// Removes every trace of a component version: recipe, artifacts and
    /// unarchived artifacts. Returns the bytes reclaimed.
    ///
    /// # Errors
    ///
    /// Returns an error if a removal fails.
    pub fn remove_version(&self, id: &ComponentId) -> Result<u64> {
        let mut reclaimed = 0;

        let recipe = self.recipe_path(id);
        if recipe.is_file() {
            reclaimed += recipe.metadata().map(|m| m.len()).unwrap_or(0);
            std::fs::remove_file(&recipe).map_err(|e| StoreError::Io {
                path: recipe,
                source: e,
            })?;
        }

        for dir in [self.artifact_dir(id), self.unarchived_dir(id)] {
            if dir.is_dir() {
                reclaimed += dir_size(&dir);
                std::fs::remove_dir_all(&dir).map_err(|e| StoreError::Io {
                    path: dir.clone(),
                    source: e,
                })?;
            }
        }

        tracing::debug!(component = %id, reclaimed, "removed component version");
        Ok(reclaimed)
    }
}

fn dir_size(dir: &Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, ComponentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ComponentStore::open(
            dir.path().join("packages"),
            PlatformInfo::new("linux", "x86_64"),
        )
        .unwrap();
        (dir, store)
    }

    fn recipe(name: &str, version: &str) -> Recipe {
        let yaml = format!(
            "componentName: {name}\ncomponentVersion: {version}\nlifecycle:\n  run: ./{name}\n"
        );
        Recipe::from_yaml(&yaml, &PlatformInfo::new("linux", "x86_64")).unwrap()
    }

    #[test]
    fn test_open_creates_layout() {
        let (_dir, store) = test_store();
        assert!(store.root().join("recipes").is_dir());
        assert!(store.root().join("artifacts").is_dir());
        assert!(store.root().join("artifacts-unarchived").is_dir());
    }

    #[test]
    fn test_save_and_load_recipe() {
        let (_dir, store) = test_store();
        let recipe = recipe("signal-hub", "1.2.0");
        store.save_recipe(&recipe).unwrap();

        let id = recipe.id();
        assert!(store.has_recipe(&id));

        let loaded = store.load_recipe(&id).unwrap();
        assert_eq!(loaded, recipe);
    }

    #[test]
    fn test_load_missing_recipe() {
        let (_dir, store) = test_store();
        let id = ComponentId::parse("ghost", "1.0.0").unwrap();
        let err = store.load_recipe(&id).unwrap_err();
        assert!(matches!(err, StoreError::RecipeNotFound { .. }));
    }

    #[test]
    fn test_list_versions_descending() {
        let (_dir, store) = test_store();
        for version in ["1.0.0", "2.1.0", "1.5.3"] {
            store.save_recipe(&recipe("signal-hub", version)).unwrap();
        }
        store.save_recipe(&recipe("other", "9.9.9")).unwrap();

        let versions = store.list_versions("signal-hub");
        assert_eq!(
            versions,
            vec![
                Version::new(2, 1, 0),
                Version::new(1, 5, 3),
                Version::new(1, 0, 0)
            ]
        );
    }

    #[test]
    fn test_verify_artifact() {
        let (_dir, store) = test_store();
        let id = ComponentId::parse("signal-hub", "1.0.0").unwrap();
        let dir = store.artifact_dir(&id);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("payload.bin");
        std::fs::write(&path, b"hello").unwrap();

        // sha256("hello")
        let good = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        assert!(store.verify_artifact(&path, good).is_ok());
        assert!(store
            .verify_artifact(&path, &format!("sha256:{good}"))
            .is_ok());

        let err = store.verify_artifact(&path, "deadbeef").unwrap_err();
        assert!(matches!(err, StoreError::DigestMismatch { .. }));
    }

    #[test]
    fn test_remove_version_reclaims_everything() {
        let (_dir, store) = test_store();
        let recipe = recipe("signal-hub", "1.0.0");
        store.save_recipe(&recipe).unwrap();

        let id = recipe.id();
        let artifacts = store.artifact_dir(&id);
        std::fs::create_dir_all(&artifacts).unwrap();
        std::fs::write(artifacts.join("blob"), vec![0u8; 128]).unwrap();

        let reclaimed = store.remove_version(&id).unwrap();
        assert!(reclaimed >= 128);
        assert!(!store.has_recipe(&id));
        assert!(!artifacts.exists());
    }
}
