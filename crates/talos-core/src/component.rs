//! Component identity and version requirements.
//!
//! A component is identified by the pair (name, version). Desired-state
//! documents and recipe dependencies express constraints as semver
//! requirements; a bare `x.y.z` is treated as an exact pin.

use std::cmp::Ordering;
use std::fmt;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Characters permitted in component names besides ASCII alphanumerics.
const NAME_EXTRA_CHARS: &[char] = &['-', '_', '.'];

/// Validates a component name.
///
/// # Errors
///
/// Returns [`Error::InvalidComponentName`] if the name is empty or contains
/// characters outside `[A-Za-z0-9._-]`.
pub fn validate_component_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || NAME_EXTRA_CHARS.contains(&c))
    {
        return Err(Error::InvalidComponentName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// A pinned component identity: name plus exact semantic version.
///
/// # Examples
///
/// ```rust
/// use talos_core::ComponentId;
///
/// let id = ComponentId::parse("signal-hub", "1.2.0").unwrap();
/// assert_eq!(id.to_string(), "signal-hub@1.2.0");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentId {
    /// Component name.
    pub name: String,

    /// Exact semantic version.
    pub version: Version,
}

impl ComponentId {
    /// Creates a component id from a name and an already-parsed version.
    #[must_use]
    pub const fn new(name: String, version: Version) -> Self {
        Self { name, version }
    }

    /// Parses a component id from name and version strings.
    ///
    /// # Errors
    ///
    /// Returns an error if the name or version is invalid.
    pub fn parse(name: &str, version: &str) -> Result<Self> {
        validate_component_name(name)?;
        let version = Version::parse(version).map_err(|e| Error::InvalidVersionRequirement {
            value: version.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            name: name.to_string(),
            version,
        })
    }

    /// Recovers a component id from a store file stem of the form
    /// `<name>-<version>`.
    ///
    /// Component names may themselves contain dashes, so the split point is
    /// the last dash whose suffix parses as a semantic version.
    #[must_use]
    pub fn from_file_stem(stem: &str) -> Option<Self> {
        for (idx, _) in stem.match_indices('-') {
            if let Ok(version) = Version::parse(&stem[idx + 1..]) {
                let name = &stem[..idx];
                if validate_component_name(name).is_ok() {
                    return Some(Self {
                        name: name.to_string(),
                        version,
                    });
                }
            }
        }
        None
    }

    /// Returns the store file stem for this id: `<name>-<version>`.
    #[must_use]
    pub fn file_stem(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

impl Ord for ComponentId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.version.cmp(&other.version))
    }
}

impl PartialOrd for ComponentId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A version requirement on a component.
///
/// Wraps [`semver::VersionReq`] but keeps the original source string so that
/// conflict diagnostics and status records show what the contributing group
/// actually asked for. A bare version such as `1.0.0` pins exactly that
/// version.
#[derive(Debug, Clone)]
pub struct ComponentRequirement {
    req: VersionReq,
    raw: String,
}

impl ComponentRequirement {
    /// Parses a version requirement string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is neither a semver version nor a
    /// semver range.
    pub fn parse(input: &str) -> Result<Self> {
        let raw = input.trim().to_string();
        if raw.is_empty() {
            return Err(Error::InvalidVersionRequirement {
                value: raw,
                reason: "empty requirement".to_string(),
            });
        }

        // Bare versions pin exactly; everything else is a range expression.
        let req = if let Ok(version) = Version::parse(&raw) {
            VersionReq::parse(&format!("={version}")).map_err(|e| {
                Error::InvalidVersionRequirement {
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?
        } else {
            VersionReq::parse(&raw).map_err(|e| Error::InvalidVersionRequirement {
                value: raw.clone(),
                reason: e.to_string(),
            })?
        };

        Ok(Self { req, raw })
    }

    /// Returns a requirement that any version satisfies.
    #[must_use]
    pub fn any() -> Self {
        Self {
            req: VersionReq::STAR,
            raw: "*".to_string(),
        }
    }

    /// Returns true if `version` satisfies this requirement.
    #[must_use]
    pub fn matches(&self, version: &Version) -> bool {
        self.req.matches(version)
    }

    /// The requirement string as originally written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for ComponentRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl PartialEq for ComponentRequirement {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for ComponentRequirement {}

impl Serialize for ComponentRequirement {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for ComponentRequirement {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
