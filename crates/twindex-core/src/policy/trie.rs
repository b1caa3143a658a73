//! Trie-based policy evaluation.
//!
//! Policy entries are indexed by resource pointer into a trie per resource
//! type. Evaluation walks the pointer from the resource root, combining
//! grants and revokes along the path: a deeper (more specific) grant
//! overrides a shallower revoke, and at the same depth a revoke overrides
//! a grant.
//!
//! The enforcer is stateless and cheap to clone; compiled tries are shared
//! behind an `Arc` so that cache projections hand out capability-narrowed
//! copies without re-compilation.

use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::{Permission, Policy};

#[derive(Debug, Default)]
struct GrantRelation {
    granted: BTreeSet<String>,
    revoked: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct TrieNode {
    relations: HashMap<Permission, GrantRelation>,
    children: HashMap<String, TrieNode>,
}

impl TrieNode {
    fn descend_mut(&mut self, segments: &[String]) -> &mut Self {
        let mut node = self;
        for segment in segments {
            node = node.children.entry(segment.clone()).or_default();
        }
        node
    }

    /// Folds this node's relation into the inherited effective subject set.
    ///
    /// Revoke overrides grant at the same depth, so grants at this node are
    /// reduced by this node's revokes before being added.
    fn combine(&self, permission: Permission, effective: &mut BTreeSet<String>) {
        if let Some(relation) = self.relations.get(&permission) {
            for revoked in &relation.revoked {
                effective.remove(revoked);
            }
            for granted in &relation.granted {
                if !relation.revoked.contains(granted) {
                    effective.insert(granted.clone());
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct CompiledPolicy {
    roots: HashMap<String, TrieNode>,
}

/// Compiled form of a [`Policy`] answering access queries.
///
/// Obtained from [`PolicyEnforcer::compile`] or narrowed out of a cached
/// [`PolicyEnforcer`] via [`PolicyEnforcer::enforcer`].
#[derive(Debug, Clone, Default)]
pub struct Enforcer {
    compiled: Arc<CompiledPolicy>,
}

impl Enforcer {
    /// Decides whether any of `subjects` holds `permission` on the given
    /// resource path.
    #[must_use]
    pub fn authorize(
        &self,
        subjects: &[String],
        resource_type: &str,
        path: &[String],
        permission: Permission,
    ) -> bool {
        let mut effective = BTreeSet::new();
        let Some(mut node) = self.compiled.roots.get(resource_type) else {
            return false;
        };
        node.combine(permission, &mut effective);
        for segment in path {
            match node.children.get(segment) {
                Some(child) => {
                    node = child;
                    node.combine(permission, &mut effective);
                }
                // No deeper relations; the inherited set is final.
                None => break,
            }
        }
        subjects.iter().any(|s| effective.contains(s))
    }

    /// Collects every subject granted `permission` anywhere under the
    /// given resource type.
    ///
    /// Projecting with this set yields the maximal sub-view any holder of
    /// the permission may see, which is what the search index stores.
    #[must_use]
    pub fn subjects_with_permission(
        &self,
        resource_type: &str,
        permission: Permission,
    ) -> Vec<String> {
        let mut subjects = BTreeSet::new();
        if let Some(root) = self.compiled.roots.get(resource_type) {
            collect_granted(root, permission, &mut subjects);
        }
        subjects.into_iter().collect()
    }

    /// Projects the maximal sub-view of `json` that `subjects` may see
    /// with `permission` on the given resource type.
    ///
    /// Objects are filtered recursively; scalars and arrays are kept
    /// whole when the path to them is allowed.
    #[must_use]
    pub fn project(
        &self,
        subjects: &[String],
        resource_type: &str,
        json: &Value,
        permission: Permission,
    ) -> Value {
        let mut effective = BTreeSet::new();
        let node = self.compiled.roots.get(resource_type);
        if let Some(node) = node {
            node.combine(permission, &mut effective);
        }
        project_value(node, &effective, subjects, json, permission)
            .unwrap_or(Value::Object(Map::new()))
    }
}

fn collect_granted(node: &TrieNode, permission: Permission, out: &mut BTreeSet<String>) {
    if let Some(relation) = node.relations.get(&permission) {
        out.extend(relation.granted.iter().cloned());
    }
    for child in node.children.values() {
        collect_granted(child, permission, out);
    }
}

fn allowed(effective: &BTreeSet<String>, subjects: &[String]) -> bool {
    subjects.iter().any(|s| effective.contains(s))
}

fn project_value(
    node: Option<&TrieNode>,
    effective: &BTreeSet<String>,
    subjects: &[String],
    value: &Value,
    permission: Permission,
) -> Option<Value> {
    match value {
        Value::Object(map) if !map.is_empty() => {
            let mut out = Map::new();
            for (key, child_value) in map {
                let child_node = node.and_then(|n| n.children.get(key));
                let mut child_effective = effective.clone();
                if let Some(child_node) = child_node {
                    child_node.combine(permission, &mut child_effective);
                }
                if let Some(projected) = project_value(
                    child_node,
                    &child_effective,
                    subjects,
                    child_value,
                    permission,
                ) {
                    out.insert(key.clone(), projected);
                }
            }
            if out.is_empty() {
                allowed(effective, subjects).then(|| Value::Object(Map::new()))
            } else {
                Some(Value::Object(out))
            }
        }
        other => allowed(effective, subjects).then(|| other.clone()),
    }
}

/// A policy together with its compiled enforcer.
///
/// This is the value the policy cache stores; consumers that only need to
/// answer access queries are handed the narrowed [`Enforcer`].
#[derive(Debug, Clone)]
pub struct PolicyEnforcer {
    policy: Policy,
    enforcer: Enforcer,
}

impl PolicyEnforcer {
    /// Compiles a policy into its trie form.
    #[must_use]
    pub fn compile(policy: Policy) -> Self {
        let mut compiled = CompiledPolicy::default();
        for entry in &policy.entries {
            for resource in &entry.resources {
                let node = compiled
                    .roots
                    .entry(resource.resource_type.clone())
                    .or_default()
                    .descend_mut(resource.path.segments());
                for permission in &resource.grant {
                    let relation = node.relations.entry(*permission).or_default();
                    relation.granted.extend(entry.subjects.iter().cloned());
                }
                for permission in &resource.revoke {
                    let relation = node.relations.entry(*permission).or_default();
                    relation.revoked.extend(entry.subjects.iter().cloned());
                }
            }
        }
        Self {
            policy,
            enforcer: Enforcer {
                compiled: Arc::new(compiled),
            },
        }
    }

    /// Returns the underlying policy.
    #[must_use]
    pub const fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Returns the policy revision.
    #[must_use]
    pub const fn revision(&self) -> i64 {
        self.policy.revision
    }

    /// Returns the capability-narrowed enforcer (shared, cheap clone).
    #[must_use]
    pub fn enforcer(&self) -> Enforcer {
        self.enforcer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyEntry;
    use crate::pointer::JsonPointer;
    use serde_json::json;

    fn pointer(s: &str) -> JsonPointer {
        s.parse().unwrap()
    }

    fn subjects(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    fn default_policy() -> Policy {
        Policy::new("namespace:id".parse().unwrap(), 1).with_entry(
            PolicyEntry::new("DEFAULT")
                .with_subject("dummy:test")
                .with_grant("thing", pointer("/"), [Permission::Read, Permission::Write]),
        )
    }

    #[test]
    fn root_grant_authorizes_all_paths() {
        let enforcer = PolicyEnforcer::compile(default_policy()).enforcer();
        assert!(enforcer.authorize(
            &subjects(&["dummy:test"]),
            "thing",
            &["attributes".into(), "x".into()],
            Permission::Read,
        ));
        assert!(!enforcer.authorize(
            &subjects(&["someone:else"]),
            "thing",
            &[],
            Permission::Read,
        ));
    }

    #[test]
    fn unknown_subject_sees_nothing() {
        let enforcer = PolicyEnforcer::compile(default_policy()).enforcer();
        let view = enforcer.project(
            &subjects(&["itsMe"]),
            "thing",
            &json!({"attributes": {"x": 1}}),
            Permission::Read,
        );
        assert_eq!(view, json!({}));
    }

    #[test]
    fn deeper_grant_overrides_shallower_revoke() {
        let policy = Policy::new("ns:p".parse().unwrap(), 1).with_entry(
            PolicyEntry::new("MIXED")
                .with_subject("viewer")
                .with_revoke("thing", pointer("/attributes"), [Permission::Read])
                .with_grant("thing", pointer("/attributes/public"), [Permission::Read])
                .with_grant("thing", pointer("/"), [Permission::Read]),
        );
        let enforcer = PolicyEnforcer::compile(policy).enforcer();
        let s = subjects(&["viewer"]);

        assert!(!enforcer.authorize(&s, "thing", &["attributes".into()], Permission::Read));
        assert!(enforcer.authorize(
            &s,
            "thing",
            &["attributes".into(), "public".into()],
            Permission::Read
        ));
        assert!(enforcer.authorize(&s, "thing", &["features".into()], Permission::Read));
    }

    #[test]
    fn same_depth_revoke_overrides_grant() {
        let policy = Policy::new("ns:p".parse().unwrap(), 1).with_entry(
            PolicyEntry::new("CONFLICT")
                .with_subject("viewer")
                .with_grant("thing", pointer("/secret"), [Permission::Read])
                .with_revoke("thing", pointer("/secret"), [Permission::Read]),
        );
        let enforcer = PolicyEnforcer::compile(policy).enforcer();
        assert!(!enforcer.authorize(
            &subjects(&["viewer"]),
            "thing",
            &["secret".into()],
            Permission::Read
        ));
    }

    #[test]
    fn projection_filters_revoked_subtrees() {
        let policy = Policy::new("ns:p".parse().unwrap(), 1).with_entry(
            PolicyEntry::new("PARTIAL")
                .with_subject("viewer")
                .with_grant("thing", pointer("/"), [Permission::Read])
                .with_revoke("thing", pointer("/attributes/secret"), [Permission::Read]),
        );
        let enforcer = PolicyEnforcer::compile(policy).enforcer();
        let view = enforcer.project(
            &subjects(&["viewer"]),
            "thing",
            &json!({
                "attributes": {"secret": "hidden", "public": 1},
                "features": {"lamp": {"properties": {"on": true}}}
            }),
            Permission::Read,
        );
        assert_eq!(
            view,
            json!({
                "attributes": {"public": 1},
                "features": {"lamp": {"properties": {"on": true}}}
            })
        );
    }

    #[test]
    fn projection_keeps_arrays_whole() {
        let enforcer = PolicyEnforcer::compile(default_policy()).enforcer();
        let view = enforcer.project(
            &subjects(&["dummy:test"]),
            "thing",
            &json!({"attributes": {"tags": [1, 2, 3]}}),
            Permission::Read,
        );
        assert_eq!(view, json!({"attributes": {"tags": [1, 2, 3]}}));
    }

    #[test]
    fn permissions_are_independent() {
        let policy = Policy::new("ns:p".parse().unwrap(), 1).with_entry(
            PolicyEntry::new("WRITE_ONLY")
                .with_subject("writer")
                .with_grant("thing", pointer("/"), [Permission::Write]),
        );
        let enforcer = PolicyEnforcer::compile(policy).enforcer();
        let s = subjects(&["writer"]);
        assert!(enforcer.authorize(&s, "thing", &[], Permission::Write));
        assert!(!enforcer.authorize(&s, "thing", &[], Permission::Read));
    }

    #[test]
    fn unknown_resource_type_denies() {
        let enforcer = PolicyEnforcer::compile(default_policy()).enforcer();
        assert!(!enforcer.authorize(
            &subjects(&["dummy:test"]),
            "message",
            &[],
            Permission::Read
        ));
    }
}
