//! The twin model: the authoritative JSON representation of a device.
//!
//! A twin carries free-form `attributes`, named `features` with their own
//! properties and definition, a reference to the authorization policy, and
//! a strictly monotonic revision. The pipeline mostly operates on the raw
//! JSON form (the enrichment facade caches JSON snapshots); this typed
//! model is the contract for constructing and inspecting those snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::id::{PolicyId, TwinId};

/// JSON field names of the twin document.
pub mod fields {
    /// The twin id field.
    pub const TWIN_ID: &str = "thingId";
    /// The policy id field.
    pub const POLICY_ID: &str = "policyId";
    /// The revision field.
    pub const REVISION: &str = "_revision";
    /// The modified timestamp field.
    pub const MODIFIED: &str = "_modified";
    /// The attributes object.
    pub const ATTRIBUTES: &str = "attributes";
    /// The features object.
    pub const FEATURES: &str = "features";
    /// The metadata object.
    pub const METADATA: &str = "_metadata";
}

/// A named aspect of a twin with its own properties and definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    /// Definition URIs describing the feature's model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<Vec<String>>,

    /// Reported property values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,

    /// Desired (target) property values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_properties: Option<Value>,
}

/// The authoritative representation of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Twin {
    /// The twin's namespaced id.
    #[serde(rename = "thingId")]
    pub twin_id: TwinId,

    /// The id of the policy authorizing access to this twin.
    #[serde(rename = "policyId", skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<PolicyId>,

    /// Strictly monotonic revision, starting at 1.
    #[serde(rename = "_revision")]
    pub revision: i64,

    /// Free-form attribute object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Value>,

    /// Features keyed by feature id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub features: BTreeMap<String, Feature>,

    /// Timestamp of the last modification.
    #[serde(rename = "_modified", skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,

    /// Free-form metadata object.
    #[serde(rename = "_metadata", default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Twin {
    /// Creates a twin at revision 1 with no attributes or features.
    #[must_use]
    pub fn new(twin_id: TwinId) -> Self {
        Self {
            twin_id,
            policy_id: None,
            revision: 1,
            attributes: None,
            features: BTreeMap::new(),
            modified: None,
            metadata: None,
        }
    }

    /// Sets the policy id.
    #[must_use]
    pub fn with_policy_id(mut self, policy_id: PolicyId) -> Self {
        self.policy_id = Some(policy_id);
        self
    }

    /// Sets the revision.
    #[must_use]
    pub const fn with_revision(mut self, revision: i64) -> Self {
        self.revision = revision;
        self
    }

    /// Sets the attributes object.
    #[must_use]
    pub fn with_attributes(mut self, attributes: Value) -> Self {
        self.attributes = Some(attributes);
        self
    }

    /// Adds a feature.
    #[must_use]
    pub fn with_feature(mut self, feature_id: impl Into<String>, feature: Feature) -> Self {
        self.features.insert(feature_id.into(), feature);
        self
    }

    /// Serializes this twin into its JSON document form.
    ///
    /// # Errors
    ///
    /// Returns a serialization error when the twin cannot be represented
    /// as JSON (never for well-formed twins).
    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Deserializes a twin from its JSON document form.
    ///
    /// # Errors
    ///
    /// Returns a serialization error when required fields are missing or
    /// malformed.
    pub fn from_json(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Reads the policy id field out of a raw twin JSON document.
///
/// Returns `None` when the field is absent or not a valid policy id; the
/// pipeline treats both as an orphaned twin.
#[must_use]
pub fn policy_id_of(twin_json: &Value) -> Option<PolicyId> {
    twin_json
        .get(fields::POLICY_ID)?
        .as_str()?
        .parse()
        .ok()
}

/// Reads the revision field out of a raw twin JSON document.
#[must_use]
pub fn revision_of(twin_json: &Value) -> Option<i64> {
    twin_json.get(fields::REVISION)?.as_i64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn twin_id() -> TwinId {
        "org.acme:sensor-1".parse().unwrap()
    }

    #[test]
    fn json_roundtrip() {
        let twin = Twin::new(twin_id())
            .with_policy_id("org.acme:policy".parse().unwrap())
            .with_revision(7)
            .with_attributes(json!({"location": "basement"}))
            .with_feature(
                "thermostat",
                Feature {
                    definition: Some(vec!["org.acme:thermostat:1.0.0".into()]),
                    properties: Some(json!({"temperature": 21.5})),
                    desired_properties: None,
                },
            );

        let value = twin.to_json().unwrap();
        assert_eq!(value["thingId"], json!("org.acme:sensor-1"));
        assert_eq!(value["policyId"], json!("org.acme:policy"));
        assert_eq!(value["_revision"], json!(7));
        assert_eq!(
            value["features"]["thermostat"]["properties"]["temperature"],
            json!(21.5)
        );

        let back = Twin::from_json(value).unwrap();
        assert_eq!(back, twin);
    }

    #[test]
    fn policy_id_extraction() {
        let doc = json!({"thingId": "a:b", "policyId": "a:p", "_revision": 1});
        assert_eq!(policy_id_of(&doc), Some("a:p".parse().unwrap()));

        let orphan = json!({"thingId": "a:b", "_revision": 1});
        assert_eq!(policy_id_of(&orphan), None);

        let invalid = json!({"thingId": "a:b", "policyId": "not an id", "_revision": 1});
        assert_eq!(policy_id_of(&invalid), None);
    }

    #[test]
    fn revision_extraction() {
        let doc = json!({"_revision": 42});
        assert_eq!(revision_of(&doc), Some(42));
        assert_eq!(revision_of(&json!({})), None);
    }
}
