//! Component recipes.
//!
//! A recipe describes how a component is installed and run: its lifecycle
//! scripts, dependencies, default configuration and artifacts. Recipes are
//! authored as YAML and may carry several platform manifests; loading selects
//! the manifest matching the device and produces a single canonical
//! [`Recipe`]; the multi-platform form is never kept in memory.

use std::collections::BTreeMap;
use std::time::Duration;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::component::{validate_component_name, ComponentId, ComponentRequirement};
use crate::error::{Error, Result};

/// Default timeout for a lifecycle phase script.
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(120);

/// The lifecycle phases a recipe may script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    /// Runs once when the component version is installed.
    Install,

    /// Runs before `run`; completion signals readiness.
    Startup,

    /// The long-running (or one-shot) service process.
    Run,

    /// Runs when the service is stopped.
    Shutdown,

    /// Runs after an `errored` transition before a retry.
    Recover,
}

impl LifecyclePhase {
    /// Returns the phase name as written in recipes.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Startup => "startup",
            Self::Run => "run",
            Self::Shutdown => "shutdown",
            Self::Recover => "recover",
        }
    }
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A lifecycle phase script with its execution options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireScript", into = "WireScript")]
pub struct ScriptSpec {
    /// Shell command to execute.
    pub script: String,

    /// Phase timeout.
    pub timeout: Duration,

    /// Whether the script runs with elevated privileges.
    pub requires_privilege: bool,

    /// Extra environment for the script.
    pub environment: BTreeMap<String, String>,
}

impl ScriptSpec {
    /// Creates a script spec with default options.
    #[must_use]
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            timeout: DEFAULT_PHASE_TIMEOUT,
            requires_privilege: false,
            environment: BTreeMap::new(),
        }
    }

    /// Overrides the phase timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Marks the script as privileged.
    #[must_use]
    pub const fn privileged(mut self) -> Self {
        self.requires_privilege = true;
        self
    }
}

// Recipes may write a phase as either a bare command string or a mapping
// with options.
#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
enum WireScript {
    Plain(String),
    Full {
        script: String,
        #[serde(rename = "timeoutSeconds", skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
        #[serde(rename = "requiresPrivilege", default, skip_serializing_if = "std::ops::Not::not")]
        requires_privilege: bool,
        #[serde(rename = "setenv", default, skip_serializing_if = "BTreeMap::is_empty")]
        environment: BTreeMap<String, String>,
    },
}

impl From<WireScript> for ScriptSpec {
    fn from(wire: WireScript) -> Self {
        match wire {
            WireScript::Plain(script) => Self::new(script),
            WireScript::Full {
                script,
                timeout_seconds,
                requires_privilege,
                environment,
            } => Self {
                script,
                timeout: timeout_seconds.map_or(DEFAULT_PHASE_TIMEOUT, Duration::from_secs),
                requires_privilege,
                environment,
            },
        }
    }
}

impl From<ScriptSpec> for WireScript {
    fn from(spec: ScriptSpec) -> Self {
        Self::Full {
            script: spec.script,
            timeout_seconds: if spec.timeout == DEFAULT_PHASE_TIMEOUT {
                None
            } else {
                Some(spec.timeout.as_secs())
            },
            requires_privilege: spec.requires_privilege,
            environment: spec.environment,
        }
    }
}

/// The scripted lifecycle of a component.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lifecycle {
    /// Install phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install: Option<ScriptSpec>,

    /// Startup phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup: Option<ScriptSpec>,

    /// Run phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<ScriptSpec>,

    /// Shutdown phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<ScriptSpec>,

    /// Recover phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recover: Option<ScriptSpec>,
}

impl Lifecycle {
    /// Returns the script for a phase, if the recipe defines one.
    #[must_use]
    pub const fn phase(&self, phase: LifecyclePhase) -> Option<&ScriptSpec> {
        match phase {
            LifecyclePhase::Install => self.install.as_ref(),
            LifecyclePhase::Startup => self.startup.as_ref(),
            LifecyclePhase::Run => self.run.as_ref(),
            LifecyclePhase::Shutdown => self.shutdown.as_ref(),
            LifecyclePhase::Recover => self.recover.as_ref(),
        }
    }

    /// Returns true if no phase is scripted.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.install.is_none()
            && self.startup.is_none()
            && self.run.is_none()
            && self.shutdown.is_none()
            && self.recover.is_none()
    }
}

/// Hard dependencies restart with their dependency; soft ones do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyType {
    /// Lifecycle-coupled dependency.
    #[default]
    Hard,

    /// Start-order-only dependency.
    Soft,
}

/// A dependency declaration in a recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencySpec {
    /// Version requirement on the dependency.
    pub version_requirement: ComponentRequirement,

    /// Coupling type.
    #[serde(default)]
    pub dependency_type: DependencyType,
}

/// How an artifact is treated after download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Unarchive {
    /// Keep the artifact file as-is.
    #[default]
    None,

    /// Unpack a gzipped tarball into the unarchived-artifacts directory.
    TarGz,
}

/// An artifact the component needs on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSpec {
    /// Source URI of the artifact.
    pub uri: String,

    /// Expected SHA-256 digest (hex), if integrity is enforced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// Post-download treatment.
    #[serde(default)]
    pub unarchive: Unarchive,
}

impl ArtifactSpec {
    /// The file name portion of the artifact URI.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.uri.rsplit('/').next().unwrap_or(&self.uri)
    }
}

/// A canonical, platform-resolved component recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    /// Component name.
    pub component_name: String,

    /// Component version.
    pub component_version: Version,

    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Publisher identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,

    /// Default configuration subtree.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub default_configuration: serde_json::Value,

    /// Scripted lifecycle.
    #[serde(default)]
    pub lifecycle: Lifecycle,

    /// Dependencies by component name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, DependencySpec>,

    /// Artifacts required on disk.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactSpec>,
}

impl Recipe {
    /// Returns the component id this recipe describes.
    #[must_use]
    pub fn id(&self) -> ComponentId {
        ComponentId::new(self.component_name.clone(), self.component_version.clone())
    }

    /// Returns the store file name: `<name>-<version>.yaml`.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}-{}.yaml", self.component_name, self.component_version)
    }

    /// Returns true if this component runs as a long-lived or one-shot
    /// service (has a `run` or `startup` phase).
    #[must_use]
    pub const fn is_service(&self) -> bool {
        self.lifecycle.run.is_some() || self.lifecycle.startup.is_some()
    }

    /// Parses a recipe from YAML, selecting the manifest for `platform`.
    ///
    /// # Errors
    ///
    /// Returns an error for unparseable YAML, an invalid name/version, or
    /// when no manifest supports the platform.
    pub fn from_yaml(input: &str, platform: &PlatformInfo) -> Result<Self> {
        let wire: WireRecipe = serde_yaml::from_str(input)?;
        Self::from_wire(wire, platform)
    }

    /// Serializes the canonical recipe to YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn from_wire(wire: WireRecipe, platform: &PlatformInfo) -> Result<Self> {
        validate_component_name(&wire.component_name)?;

        let component_version =
            Version::parse(&wire.component_version).map_err(|e| Error::InvalidRecipe {
                component: wire.component_name.clone(),
                reason: format!("bad componentVersion '{}': {e}", wire.component_version),
            })?;

        // Platform resolution: an explicit manifest list must contain a
        // matching entry; absent manifests mean the top-level lifecycle and
        // artifacts apply everywhere.
        let (lifecycle, artifacts) = if wire.manifests.is_empty() {
            (wire.lifecycle.unwrap_or_default(), wire.artifacts)
        } else {
            let manifest = wire
                .manifests
                .into_iter()
                .find(|m| m.platform.as_ref().is_none_or(|p| p.matches(platform)))
                .ok_or_else(|| Error::UnsupportedPlatform {
                    component: wire.component_name.clone(),
                    os: platform.os.clone(),
                    architecture: platform.architecture.clone(),
                })?;
            (
                manifest.lifecycle.or(wire.lifecycle).unwrap_or_default(),
                if manifest.artifacts.is_empty() {
                    wire.artifacts
                } else {
                    manifest.artifacts
                },
            )
        };

        Ok(Self {
            component_name: wire.component_name,
            component_version,
            description: wire.description,
            publisher: wire.publisher,
            default_configuration: wire.default_configuration,
            lifecycle,
            dependencies: wire.dependencies,
            artifacts,
        })
    }
}

/// The device platform a recipe is resolved against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    /// Operating system name (`linux`, `macos`, `windows`, ...).
    pub os: String,

    /// CPU architecture (`x86_64`, `aarch64`, ...).
    pub architecture: String,
}

impl PlatformInfo {
    /// Returns the platform of the running device.
    #[must_use]
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
        }
    }

    /// Creates a platform descriptor.
    #[must_use]
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlatformSelector {
    os: Option<String>,
    architecture: Option<String>,
}

impl PlatformSelector {
    fn matches(&self, platform: &PlatformInfo) -> bool {
        let os_ok = self
            .os
            .as_ref()
            .is_none_or(|os| os == "all" || os == "*" || *os == platform.os);
        let arch_ok = self
            .architecture
            .as_ref()
            .is_none_or(|a| a == "all" || a == "*" || *a == platform.architecture);
        os_ok && arch_ok
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireManifest {
    platform: Option<PlatformSelector>,
    lifecycle: Option<Lifecycle>,
    #[serde(default)]
    artifacts: Vec<ArtifactSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRecipe {
    component_name: String,
    component_version: String,
    description: Option<String>,
    publisher: Option<String>,
    #[serde(default)]
    default_configuration: serde_json::Value,
    lifecycle: Option<Lifecycle>,
    #[serde(default)]
    dependencies: BTreeMap<String, DependencySpec>,
    #[serde(default)]
    artifacts: Vec<ArtifactSpec>,
    #[serde(default)]
    manifests: Vec<WireManifest>,
}
