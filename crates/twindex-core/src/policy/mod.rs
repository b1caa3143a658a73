//! Authorization policies.
//!
//! A policy is a set of entries; each entry binds a set of subjects to
//! grants and revokes on `(resource type, resource path)` targets. The
//! compiled, query-ready form is the trie-based [`trie::Enforcer`].

pub mod trie;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::id::PolicyId;
use crate::pointer::JsonPointer;

/// A permission that can be granted or revoked on a resource.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Permission {
    /// Permission to read a resource (the one search projection needs).
    Read,
    /// Permission to modify a resource.
    Write,
}

/// A grant/revoke target inside a policy entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyResource {
    /// The resource type (e.g. `thing`, `policy`, `message`).
    pub resource_type: String,

    /// Path below the resource root that this target scopes.
    pub path: JsonPointer,

    /// Permissions granted on this target.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub grant: BTreeSet<Permission>,

    /// Permissions revoked on this target.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub revoke: BTreeSet<Permission>,
}

/// A labeled policy entry binding subjects to resource targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEntry {
    /// The entry label (unique within the policy).
    pub label: String,

    /// Subject ids this entry applies to.
    pub subjects: Vec<String>,

    /// Resource targets with their grants and revokes.
    pub resources: Vec<PolicyResource>,
}

impl PolicyEntry {
    /// Creates an empty entry with the given label.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            subjects: Vec::new(),
            resources: Vec::new(),
        }
    }

    /// Adds a subject id.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subjects.push(subject.into());
        self
    }

    /// Grants permissions on a resource path.
    #[must_use]
    pub fn with_grant(
        mut self,
        resource_type: impl Into<String>,
        path: JsonPointer,
        permissions: impl IntoIterator<Item = Permission>,
    ) -> Self {
        self.resources.push(PolicyResource {
            resource_type: resource_type.into(),
            path,
            grant: permissions.into_iter().collect(),
            revoke: BTreeSet::new(),
        });
        self
    }

    /// Revokes permissions on a resource path.
    #[must_use]
    pub fn with_revoke(
        mut self,
        resource_type: impl Into<String>,
        path: JsonPointer,
        permissions: impl IntoIterator<Item = Permission>,
    ) -> Self {
        self.resources.push(PolicyResource {
            resource_type: resource_type.into(),
            path,
            grant: BTreeSet::new(),
            revoke: permissions.into_iter().collect(),
        });
        self
    }
}

/// An authorization document granting and revoking permissions on
/// resource paths to subjects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// The policy's namespaced id.
    pub policy_id: PolicyId,

    /// Strictly monotonic policy revision.
    pub revision: i64,

    /// The policy entries.
    pub entries: Vec<PolicyEntry>,
}

impl Policy {
    /// Creates an empty policy.
    #[must_use]
    pub fn new(policy_id: PolicyId, revision: i64) -> Self {
        Self {
            policy_id,
            revision,
            entries: Vec::new(),
        }
    }

    /// Adds an entry.
    #[must_use]
    pub fn with_entry(mut self, entry: PolicyEntry) -> Self {
        self.entries.push(entry);
        self
    }
}
