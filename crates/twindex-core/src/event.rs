//! Twin change events and their application to twin JSON snapshots.
//!
//! Events for one twin form a total order by revision (strictly monotonic,
//! starting at 1). Applying an event to a snapshot always stamps the
//! event's revision and modification timestamp before the payload-specific
//! change, so a snapshot's `_revision` field is the single source of truth
//! for how much history it reflects.
//!
//! Revision gating (dropping stale events, detecting gaps) is the caller's
//! concern; [`TwinEvent::apply_to`] applies unconditionally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{PolicyId, TwinId};
use crate::pointer::JsonPointer;
use crate::twin::fields;

/// The kind of a twin change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TwinEventKind {
    /// The twin was created.
    Created,
    /// The whole twin was replaced.
    Modified,
    /// The twin was deleted.
    Deleted,
    /// A single attribute value was set.
    AttributeModified,
    /// A feature was created or replaced.
    FeatureCreated,
    /// A feature's properties object was replaced.
    FeaturePropertiesCreated,
    /// A single feature property value was set.
    FeaturePropertyModified,
    /// A feature's definition was replaced.
    FeatureDefinitionCreated,
    /// The twin's policy reference changed.
    PolicyIdChanged,
}

/// Payload of a twin change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TwinEventPayload {
    /// The twin was created with the given JSON document.
    Created {
        /// The full twin document.
        twin: Value,
    },
    /// The whole twin was replaced by the given JSON document.
    Modified {
        /// The full twin document.
        twin: Value,
    },
    /// The twin was deleted.
    Deleted,
    /// A single attribute value was set.
    AttributeModified {
        /// Pointer below the attributes object.
        pointer: JsonPointer,
        /// The new attribute value.
        value: Value,
    },
    /// A feature was created or replaced.
    FeatureCreated {
        /// The feature id.
        feature_id: String,
        /// The full feature JSON.
        feature: Value,
    },
    /// A feature's properties object was replaced.
    FeaturePropertiesCreated {
        /// The feature id.
        feature_id: String,
        /// The new properties object.
        properties: Value,
    },
    /// A single feature property value was set.
    FeaturePropertyModified {
        /// The feature id.
        feature_id: String,
        /// Pointer below the feature's properties object.
        pointer: JsonPointer,
        /// The new property value.
        value: Value,
    },
    /// A feature's definition was replaced.
    FeatureDefinitionCreated {
        /// The feature id.
        feature_id: String,
        /// The new definition URIs.
        definition: Vec<String>,
    },
    /// The twin's policy reference changed.
    PolicyIdChanged {
        /// The new policy id.
        policy_id: PolicyId,
    },
}

impl TwinEventPayload {
    /// Returns the kind of this payload.
    #[must_use]
    pub const fn kind(&self) -> TwinEventKind {
        match self {
            Self::Created { .. } => TwinEventKind::Created,
            Self::Modified { .. } => TwinEventKind::Modified,
            Self::Deleted => TwinEventKind::Deleted,
            Self::AttributeModified { .. } => TwinEventKind::AttributeModified,
            Self::FeatureCreated { .. } => TwinEventKind::FeatureCreated,
            Self::FeaturePropertiesCreated { .. } => TwinEventKind::FeaturePropertiesCreated,
            Self::FeaturePropertyModified { .. } => TwinEventKind::FeaturePropertyModified,
            Self::FeatureDefinitionCreated { .. } => TwinEventKind::FeatureDefinitionCreated,
            Self::PolicyIdChanged { .. } => TwinEventKind::PolicyIdChanged,
        }
    }
}

/// A single change to a twin, totally ordered per twin by revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwinEvent {
    /// The twin this event belongs to.
    pub twin_id: TwinId,

    /// The revision this event produces.
    pub revision: i64,

    /// When the change happened; may be absent for events from old
    /// persistence formats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    /// The payload describing the change.
    #[serde(flatten)]
    pub payload: TwinEventPayload,
}

impl TwinEvent {
    /// Creates a new event.
    #[must_use]
    pub fn new(
        twin_id: TwinId,
        revision: i64,
        timestamp: Option<DateTime<Utc>>,
        payload: TwinEventPayload,
    ) -> Self {
        Self {
            twin_id,
            revision,
            timestamp,
            payload,
        }
    }

    /// Returns the kind of this event.
    #[must_use]
    pub const fn kind(&self) -> TwinEventKind {
        self.payload.kind()
    }

    /// Returns true if this event deletes the twin.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        matches!(self.payload, TwinEventPayload::Deleted)
    }

    /// Applies this event to a twin JSON snapshot.
    ///
    /// The snapshot's `_revision` and `_modified` fields are stamped first,
    /// then the payload-specific change is applied. `Deleted` stamps only;
    /// dropping the snapshot is the caller's responsibility.
    pub fn apply_to(&self, twin_json: &mut Value) {
        match &self.payload {
            TwinEventPayload::Created { twin } | TwinEventPayload::Modified { twin } => {
                *twin_json = twin.clone();
            }
            TwinEventPayload::Deleted => {}
            TwinEventPayload::AttributeModified { pointer, value } => {
                attribute_pointer(pointer).set(twin_json, value.clone());
            }
            TwinEventPayload::FeatureCreated {
                feature_id,
                feature,
            } => {
                feature_pointer(feature_id).set(twin_json, feature.clone());
            }
            TwinEventPayload::FeaturePropertiesCreated {
                feature_id,
                properties,
            } => {
                feature_pointer(feature_id)
                    .child("properties")
                    .set(twin_json, properties.clone());
            }
            TwinEventPayload::FeaturePropertyModified {
                feature_id,
                pointer,
                value,
            } => {
                property_pointer(feature_id, pointer).set(twin_json, value.clone());
            }
            TwinEventPayload::FeatureDefinitionCreated {
                feature_id,
                definition,
            } => {
                feature_pointer(feature_id)
                    .child("definition")
                    .set(twin_json, Value::from(definition.clone()));
            }
            TwinEventPayload::PolicyIdChanged { policy_id } => {
                JsonPointer::from_segments(vec![fields::POLICY_ID.into()])
                    .set(twin_json, Value::from(policy_id.as_str()));
            }
        }
        stamp(twin_json, self);
    }
}

fn stamp(twin_json: &mut Value, event: &TwinEvent) {
    JsonPointer::from_segments(vec![fields::REVISION.into()])
        .set(twin_json, Value::from(event.revision));
    if let Some(timestamp) = event.timestamp {
        JsonPointer::from_segments(vec![fields::MODIFIED.into()])
            .set(twin_json, Value::from(timestamp.to_rfc3339()));
    }
}

fn attribute_pointer(pointer: &JsonPointer) -> JsonPointer {
    let mut segments = vec![fields::ATTRIBUTES.to_string()];
    segments.extend(pointer.segments().iter().cloned());
    JsonPointer::from_segments(segments)
}

fn feature_pointer(feature_id: &str) -> JsonPointer {
    JsonPointer::from_segments(vec![fields::FEATURES.into(), feature_id.into()])
}

fn property_pointer(feature_id: &str, pointer: &JsonPointer) -> JsonPointer {
    let mut segments = vec![
        fields::FEATURES.to_string(),
        feature_id.to_string(),
        "properties".to_string(),
    ];
    segments.extend(pointer.segments().iter().cloned());
    JsonPointer::from_segments(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn twin_id() -> TwinId {
        "org.acme:sensor-1".parse().unwrap()
    }

    fn attribute_event(revision: i64, pointer: &str, value: Value) -> TwinEvent {
        TwinEvent::new(
            twin_id(),
            revision,
            None,
            TwinEventPayload::AttributeModified {
                pointer: pointer.parse().unwrap(),
                value,
            },
        )
    }

    #[test]
    fn attribute_modified_sets_pointer_and_revision() {
        let mut doc = json!({"thingId": "org.acme:sensor-1", "_revision": 4});
        attribute_event(5, "/x", json!(7)).apply_to(&mut doc);
        assert_eq!(doc["attributes"]["x"], json!(7));
        assert_eq!(doc["_revision"], json!(5));
    }

    #[test]
    fn feature_property_modified_sets_single_pointer() {
        let mut doc = json!({
            "_revision": 1,
            "features": {"lamp": {"properties": {"on": false, "color": "red"}}}
        });
        let event = TwinEvent::new(
            twin_id(),
            2,
            None,
            TwinEventPayload::FeaturePropertyModified {
                feature_id: "lamp".into(),
                pointer: "/on".parse().unwrap(),
                value: json!(true),
            },
        );
        event.apply_to(&mut doc);
        assert_eq!(doc["features"]["lamp"]["properties"]["on"], json!(true));
        assert_eq!(
            doc["features"]["lamp"]["properties"]["color"],
            json!("red"),
            "sibling properties survive"
        );
    }

    #[test]
    fn feature_properties_created_replaces_properties() {
        let mut doc = json!({
            "_revision": 1,
            "features": {"lamp": {"properties": {"on": false, "color": "red"}}}
        });
        let event = TwinEvent::new(
            twin_id(),
            2,
            None,
            TwinEventPayload::FeaturePropertiesCreated {
                feature_id: "lamp".into(),
                properties: json!({"on": true}),
            },
        );
        event.apply_to(&mut doc);
        assert_eq!(
            doc["features"]["lamp"]["properties"],
            json!({"on": true}),
            "previous properties are replaced wholesale"
        );
    }

    #[test]
    fn policy_id_changed_updates_reference() {
        let mut doc = json!({"_revision": 1, "policyId": "org.acme:old"});
        let event = TwinEvent::new(
            twin_id(),
            2,
            None,
            TwinEventPayload::PolicyIdChanged {
                policy_id: "org.acme:new".parse().unwrap(),
            },
        );
        event.apply_to(&mut doc);
        assert_eq!(doc["policyId"], json!("org.acme:new"));
    }

    #[test]
    fn timestamp_is_stamped_when_present() {
        let ts: DateTime<Utc> = "2024-05-01T12:00:00Z".parse().unwrap();
        let mut doc = json!({"_revision": 1});
        let mut event = attribute_event(2, "/x", json!(1));
        event.timestamp = Some(ts);
        event.apply_to(&mut doc);
        assert_eq!(doc["_modified"], json!("2024-05-01T12:00:00+00:00"));
    }

    #[test]
    fn serde_roundtrip_with_tagged_payload() {
        let event = attribute_event(9, "/location/lat", json!(52.5));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], json!("attributeModified"));
        let back: TwinEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
