//! Desired-state documents.
//!
//! The wire form is the camelCase JSON produced by the deployment sources
//! (see `DeploymentDocument::from_json`). Documents that fail to parse or
//! validate are rejected before any engine state changes.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::component::{validate_component_name, ComponentRequirement};
use crate::error::{Error, Result};

/// Default budget for the component-update deferral loop.
pub const DEFAULT_UPDATE_POLICY_TIMEOUT: Duration = Duration::from_secs(60);

/// Default budget for the configuration validation round-trip.
pub const DEFAULT_VALIDATION_POLICY_TIMEOUT: Duration = Duration::from_secs(20);

/// What to do when a deployment leaves a component broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureHandlingPolicy {
    /// Keep the partially-applied state.
    DoNothing,

    /// Restore the pre-deployment snapshot.
    #[default]
    Rollback,
}

/// Whether running components are told about an update and may defer it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateAction {
    /// Publish pre/post update events and honor deferrals.
    #[default]
    NotifyComponents,

    /// Apply the update without notifying anyone.
    SkipNotifyComponents,
}

/// The update-disruption policy for a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentUpdatePolicy {
    /// Whether components are notified.
    pub action: UpdateAction,

    /// Hard cap on the total deferral wait.
    pub timeout: Duration,
}

impl Default for ComponentUpdatePolicy {
    fn default() -> Self {
        Self {
            action: UpdateAction::default(),
            timeout: DEFAULT_UPDATE_POLICY_TIMEOUT,
        }
    }
}

/// Budget for the dynamic configuration validation round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationValidationPolicy {
    /// Per-deployment validation budget.
    pub timeout: Duration,
}

impl Default for ConfigurationValidationPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_VALIDATION_POLICY_TIMEOUT,
        }
    }
}

/// A requested configuration change for one component.
///
/// `reset` paths are applied before `merge`. An empty `reset` list restores
/// the entire configuration to recipe defaults.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfigurationUpdate {
    /// Subtree to overlay onto the current configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge: Option<serde_json::Value>,

    /// JSON Pointer paths to restore to recipe defaults.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset: Option<Vec<String>>,
}

impl ConfigurationUpdate {
    /// Returns true if neither a merge nor a reset was requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.merge.is_none() && self.reset.is_none()
    }
}

/// System resource limits for a service process.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemResourceLimits {
    /// Maximum resident memory in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,

    /// Maximum CPU share (fractional cores).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
}

/// Posix/Windows identity and limits a service runs with.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunWith {
    /// `uid` or `uid:gid` to run as on posix systems.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub posix_user: Option<String>,

    /// Account to run as on Windows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub windows_user: Option<String>,

    /// Resource limits for the service process tree.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_resource_limits: Option<SystemResourceLimits>,
}

/// One component entry in a desired-state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    /// Version requirement contributed by this document.
    pub version_requirement: ComponentRequirement,

    /// Requested configuration change, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration_update: Option<ConfigurationUpdate>,

    /// Identity/limits override, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_with: Option<RunWith>,
}

impl ComponentSpec {
    /// Creates a spec carrying only a version requirement.
    #[must_use]
    pub const fn new(version_requirement: ComponentRequirement) -> Self {
        Self {
            version_requirement,
            configuration_update: None,
            run_with: None,
        }
    }

    /// Attaches a configuration update.
    #[must_use]
    pub fn with_configuration_update(mut self, update: ConfigurationUpdate) -> Self {
        self.configuration_update = Some(update);
        self
    }

    /// Attaches a run-with override.
    #[must_use]
    pub fn with_run_with(mut self, run_with: RunWith) -> Self {
        self.run_with = Some(run_with);
        self
    }
}

/// The normalized desired state carried by a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentDocument {
    /// Source-assigned identifier for the configuration revision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration_arn: Option<String>,

    /// When the source created this revision.
    pub creation_timestamp: DateTime<Utc>,

    /// Root components requested by this document.
    pub components: BTreeMap<String, ComponentSpec>,

    /// What to do when the deployment breaks a component.
    #[serde(default)]
    pub failure_handling_policy: FailureHandlingPolicy,

    /// Disruption policy for running components.
    #[serde(default)]
    pub component_update_policy: ComponentUpdatePolicy,

    /// Budget for the validation round-trip.
    #[serde(default)]
    pub configuration_validation_policy: ConfigurationValidationPolicy,

    /// Capability tags the engine must support to run this deployment.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub required_capabilities: BTreeSet<String>,

    /// Group identifier the deployment acts on behalf of.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_behalf_of: Option<String>,
}

impl Default for DeploymentDocument {
    fn default() -> Self {
        Self {
            configuration_arn: None,
            creation_timestamp: Utc::now(),
            components: BTreeMap::new(),
            failure_handling_policy: FailureHandlingPolicy::default(),
            component_update_policy: ComponentUpdatePolicy::default(),
            configuration_validation_policy: ConfigurationValidationPolicy::default(),
            required_capabilities: BTreeSet::new(),
            on_behalf_of: None,
        }
    }
}

impl DeploymentDocument {
    /// Parses and validates a desired-state document from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDocument`] for malformed JSON, bad component
    /// names, unparseable version requirements, or reset paths that are not
    /// JSON Pointers.
    pub fn from_json(input: &str) -> Result<Self> {
        let wire: WireDocument =
            serde_json::from_str(input).map_err(|e| Error::InvalidDocument {
                reason: e.to_string(),
            })?;
        Self::from_wire(wire)
    }

    /// Serializes this document back to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&WireDocument::from(self))?)
    }

    fn from_wire(wire: WireDocument) -> Result<Self> {
        let creation_timestamp = Utc
            .timestamp_millis_opt(wire.creation_timestamp)
            .single()
            .ok_or_else(|| Error::InvalidDocument {
                reason: format!("creationTimestamp {} out of range", wire.creation_timestamp),
            })?;

        let mut components = BTreeMap::new();
        for (name, entry) in wire.components {
            validate_component_name(&name).map_err(|e| Error::InvalidDocument {
                reason: e.to_string(),
            })?;

            let version_requirement =
                ComponentRequirement::parse(&entry.version).map_err(|e| {
                    Error::InvalidDocument {
                        reason: format!("component '{name}': {e}"),
                    }
                })?;

            if let Some(update) = &entry.configuration_update {
                if let Some(reset) = &update.reset {
                    for path in reset {
                        if !path.is_empty() && !path.starts_with('/') {
                            return Err(Error::InvalidDocument {
                                reason: format!(
                                    "component '{name}': reset path '{path}' is not a JSON Pointer"
                                ),
                            });
                        }
                    }
                }
            }

            components.insert(
                name,
                ComponentSpec {
                    version_requirement,
                    configuration_update: entry.configuration_update,
                    run_with: entry.run_with,
                },
            );
        }

        Ok(Self {
            configuration_arn: wire.configuration_arn,
            creation_timestamp,
            components,
            failure_handling_policy: wire.failure_handling_policy,
            component_update_policy: ComponentUpdatePolicy {
                action: wire.component_update_policy.action,
                timeout: Duration::from_secs(wire.component_update_policy.timeout_in_seconds),
            },
            configuration_validation_policy: ConfigurationValidationPolicy {
                timeout: Duration::from_secs(
                    wire.configuration_validation_policy.timeout_in_seconds,
                ),
            },
            required_capabilities: wire.required_capabilities,
            on_behalf_of: wire.on_behalf_of,
        })
    }
}

// Wire form. Keys are camelCase and case-sensitive.

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    configuration_arn: Option<String>,

    creation_timestamp: i64,

    #[serde(default)]
    components: BTreeMap<String, WireComponent>,

    #[serde(default)]
    failure_handling_policy: FailureHandlingPolicy,

    #[serde(default)]
    component_update_policy: WireUpdatePolicy,

    #[serde(default)]
    configuration_validation_policy: WireValidationPolicy,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    required_capabilities: BTreeSet<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    on_behalf_of: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireComponent {
    version: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    configuration_update: Option<ConfigurationUpdate>,

    #[serde(skip_serializing_if = "Option::is_none")]
    run_with: Option<RunWith>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireUpdatePolicy {
    #[serde(default)]
    action: UpdateAction,

    timeout_in_seconds: u64,
}

impl Default for WireUpdatePolicy {
    fn default() -> Self {
        Self {
            action: UpdateAction::default(),
            timeout_in_seconds: DEFAULT_UPDATE_POLICY_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireValidationPolicy {
    timeout_in_seconds: u64,
}

impl Default for WireValidationPolicy {
    fn default() -> Self {
        Self {
            timeout_in_seconds: DEFAULT_VALIDATION_POLICY_TIMEOUT.as_secs(),
        }
    }
}

impl From<&DeploymentDocument> for WireDocument {
    fn from(doc: &DeploymentDocument) -> Self {
        Self {
            configuration_arn: doc.configuration_arn.clone(),
            creation_timestamp: doc.creation_timestamp.timestamp_millis(),
            components: doc
                .components
                .iter()
                .map(|(name, spec)| {
                    (
                        name.clone(),
                        WireComponent {
                            version: spec.version_requirement.as_str().to_string(),
                            configuration_update: spec.configuration_update.clone(),
                            run_with: spec.run_with.clone(),
                        },
                    )
                })
                .collect(),
            failure_handling_policy: doc.failure_handling_policy,
            component_update_policy: WireUpdatePolicy {
                action: doc.component_update_policy.action,
                timeout_in_seconds: doc.component_update_policy.timeout.as_secs(),
            },
            configuration_validation_policy: WireValidationPolicy {
                timeout_in_seconds: doc.configuration_validation_policy.timeout.as_secs(),
            },
            required_capabilities: doc.required_capabilities.clone(),
            on_behalf_of: doc.on_behalf_of.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "configurationArn": "arn:groups/fleet-a/configurations/9",
        "creationTimestamp": 1700000000000,
        "components": {
            "signal-hub": {
                "version": ">=1.0.0, <2.0.0",
                "configurationUpdate": {
                    "merge": { "interval": 30 },
                    "reset": ["/thresholds"]
                },
                "runWith": { "posixUser": "1000:1000" }
            },
            "cam-feed": { "version": "2.1.0" }
        },
        "failureHandlingPolicy": "ROLLBACK",
        "componentUpdatePolicy": { "action": "NOTIFY_COMPONENTS", "timeoutInSeconds": 30 },
        "configurationValidationPolicy": { "timeoutInSeconds": 25 },
        "requiredCapabilities": ["LARGE_CONFIGURATION"]
    }"#;

    #[test]
    fn test_parse_full_document() {
        let doc = DeploymentDocument::from_json(SAMPLE).unwrap();

        assert_eq!(doc.components.len(), 2);
        assert_eq!(
            doc.creation_timestamp.timestamp_millis(),
            1_700_000_000_000
        );
        assert_eq!(doc.failure_handling_policy, FailureHandlingPolicy::Rollback);
        assert_eq!(
            doc.component_update_policy.timeout,
            Duration::from_secs(30)
        );
        assert_eq!(
            doc.configuration_validation_policy.timeout,
            Duration::from_secs(25)
        );
        assert!(doc.required_capabilities.contains("LARGE_CONFIGURATION"));

        let hub = &doc.components["signal-hub"];
        let update = hub.configuration_update.as_ref().unwrap();
        assert_eq!(update.reset.as_ref().unwrap()[0], "/thresholds");
        assert_eq!(
            hub.run_with.as_ref().unwrap().posix_user.as_deref(),
            Some("1000:1000")
        );
    }

    #[test]
    fn test_parse_defaults() {
        let doc = DeploymentDocument::from_json(
            r#"{ "creationTimestamp": 1700000000000, "components": {} }"#,
        )
        .unwrap();

        assert_eq!(doc.failure_handling_policy, FailureHandlingPolicy::Rollback);
        assert_eq!(doc.component_update_policy.action, UpdateAction::NotifyComponents);
        assert_eq!(
            doc.component_update_policy.timeout,
            DEFAULT_UPDATE_POLICY_TIMEOUT
        );
        assert_eq!(
            doc.configuration_validation_policy.timeout,
            DEFAULT_VALIDATION_POLICY_TIMEOUT
        );
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        let err = DeploymentDocument::from_json("{ not json").unwrap_err();
        assert!(matches!(err, Error::InvalidDocument { .. }));
    }

    #[test]
    fn test_parse_rejects_bad_component_name() {
        let input = r#"{
            "creationTimestamp": 1700000000000,
            "components": { "bad name": { "version": "1.0.0" } }
        }"#;
        let err = DeploymentDocument::from_json(input).unwrap_err();
        assert!(err.to_string().contains("bad name"));
    }

    #[test]
    fn test_parse_rejects_bad_version_requirement() {
        let input = r#"{
            "creationTimestamp": 1700000000000,
            "components": { "signal-hub": { "version": "one.two" } }
        }"#;
        let err = DeploymentDocument::from_json(input).unwrap_err();
        assert!(matches!(err, Error::InvalidDocument { .. }));
    }

    #[test]
    fn test_parse_rejects_non_pointer_reset_path() {
        let input = r#"{
            "creationTimestamp": 1700000000000,
            "components": {
                "signal-hub": {
                    "version": "1.0.0",
                    "configurationUpdate": { "reset": ["thresholds"] }
                }
            }
        }"#;
        let err = DeploymentDocument::from_json(input).unwrap_err();
        assert!(err.to_string().contains("JSON Pointer"));
    }

    #[test]
    fn test_empty_reset_path_allowed() {
        // An empty pointer resets the whole component configuration.
        let input = r#"{
            "creationTimestamp": 1700000000000,
            "components": {
                "signal-hub": {
                    "version": "1.0.0",
                    "configurationUpdate": { "reset": [""] }
                }
            }
        }"#;
        assert!(DeploymentDocument::from_json(input).is_ok());
    }

    #[test]
    fn test_wire_round_trip() {
        let doc = DeploymentDocument::from_json(SAMPLE).unwrap();
        let json = doc.to_json().unwrap();
        let back = DeploymentDocument::from_json(&json).unwrap();
        assert_eq!(back, doc);
    }
}
