//! Group contribution tracking.
//!
//! A device may belong to several logical groups (cloud fleet groups, its
//! own shadow channel, local overrides); each contributes a set of root
//! components. [`GroupMappings`] is the dual index over those
//! contributions, group to roots and component to groups, mutated only as
//! one atomic structure so the two sides can never disagree.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use talos_core::DeploymentSource;

/// The membership oracle was unreachable (device offline).
#[derive(Error, Debug, Clone)]
#[error("membership oracle unreachable: {reason}")]
pub struct OracleUnavailable {
    /// Why membership could not be confirmed.
    pub reason: String,
}

/// Confirms whether the device is still a member of a cloud group.
#[async_trait]
pub trait MembershipOracle: Send + Sync {
    /// Returns whether the device belongs to `group_id`.
    ///
    /// # Errors
    ///
    /// Returns [`OracleUnavailable`] when membership cannot be confirmed;
    /// the engine then proceeds on last-known membership.
    async fn is_member(&self, group_id: &str) -> std::result::Result<bool, OracleUnavailable>;
}

/// Oracle that confirms every membership; used when no cloud connection is
/// configured and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysMember;

#[async_trait]
impl MembershipOracle for AlwaysMember {
    async fn is_member(&self, _group_id: &str) -> std::result::Result<bool, OracleUnavailable> {
        Ok(true)
    }
}

/// One group's root-component contribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupContribution {
    /// The channel the group's last successful deployment arrived on.
    pub source: DeploymentSource,

    /// Root components and their version requirements, as written.
    pub roots: BTreeMap<String, String>,
}

/// The dual index of group contributions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMappings {
    group_to_roots: BTreeMap<String, GroupContribution>,
    components_to_groups: BTreeMap<String, BTreeSet<String>>,
}

impl GroupMappings {
    /// Creates an empty mapping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces `group_id`'s contribution after its deployment succeeded.
    /// Both sides of the index update together.
    pub fn apply(
        &mut self,
        group_id: &str,
        source: DeploymentSource,
        roots: BTreeMap<String, String>,
    ) {
        self.group_to_roots.insert(
            group_id.to_string(),
            GroupContribution { source, roots },
        );
        self.rebuild_inverse();
    }

    /// Drops a group's contribution (device left the group).
    pub fn remove_group(&mut self, group_id: &str) {
        if self.group_to_roots.remove(group_id).is_some() {
            self.rebuild_inverse();
        }
    }

    /// Group ids with a recorded contribution.
    #[must_use]
    pub fn groups(&self) -> Vec<&str> {
        self.group_to_roots.keys().map(String::as_str).collect()
    }

    /// Cloud-attributed groups, the only ones the membership oracle governs.
    #[must_use]
    pub fn cloud_groups(&self) -> Vec<String> {
        self.group_to_roots
            .iter()
            .filter(|(_, c)| c.source == DeploymentSource::CloudJobs)
            .map(|(g, _)| g.clone())
            .collect()
    }

    /// The contribution of one group.
    #[must_use]
    pub fn contribution(&self, group_id: &str) -> Option<&GroupContribution> {
        self.group_to_roots.get(group_id)
    }

    /// Groups that require `component`.
    #[must_use]
    pub fn groups_for_component(&self, component: &str) -> Option<&BTreeSet<String>> {
        self.components_to_groups.get(component)
    }

    /// The union of every group's roots: component name to the
    /// `(group, requirement)` pairs that want it.
    #[must_use]
    pub fn root_requirements(&self) -> BTreeMap<String, Vec<(String, String)>> {
        let mut roots: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
        for (group, contribution) in &self.group_to_roots {
            for (component, requirement) in &contribution.roots {
                roots
                    .entry(component.clone())
                    .or_default()
                    .push((group.clone(), requirement.clone()));
            }
        }
        roots
    }

    /// Returns true if no group contributes anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.group_to_roots.is_empty()
    }

    fn rebuild_inverse(&mut self) {
        self.components_to_groups.clear();
        for (group, contribution) in &self.group_to_roots {
            for component in contribution.roots.keys() {
                self.components_to_groups
                    .entry(component.clone())
                    .or_default()
                    .insert(group.clone());
            }
        }
    }
}
