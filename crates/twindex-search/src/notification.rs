//! Inbound change notifications from the cluster bus.
//!
//! Senders deliver at-most-once; processing is idempotent because the
//! updater gates on revisions. A notification is the wire form of the
//! per-twin [`Metadata`] accumulated by the pipeline.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use twindex_core::event::TwinEvent;
use twindex_core::id::{PolicyId, TwinId};

use crate::write_model::{Metadata, UpdateReason};

/// A change notification for one twin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    /// The changed twin.
    pub twin_id: TwinId,

    /// The highest twin revision covered by this notification.
    pub thing_revision: i64,

    /// The policy to project with, when the sender knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<PolicyId>,

    /// The policy revision the projection must not be older than.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_revision: Option<i64>,

    /// The events that make up the change, in revision order.
    #[serde(default)]
    pub events: Vec<TwinEvent>,

    /// Why the update is happening.
    #[serde(default)]
    pub update_reasons: BTreeSet<UpdateReason>,

    /// Forces a full twin re-fetch instead of incremental application.
    #[serde(default)]
    pub invalidate_thing: bool,

    /// Forces a policy-cache reload before projecting.
    #[serde(default)]
    pub invalidate_policy: bool,
}

impl ChangeNotification {
    /// Wraps a single event into a notification.
    #[must_use]
    pub fn from_event(event: TwinEvent) -> Self {
        Self {
            twin_id: event.twin_id.clone(),
            thing_revision: event.revision,
            policy_id: None,
            policy_revision: None,
            events: vec![event],
            update_reasons: BTreeSet::from([UpdateReason::ChangeEvent]),
            invalidate_thing: false,
            invalidate_policy: false,
        }
    }

    /// Converts this notification into pipeline metadata, starting one
    /// consistency-lag timer per carried event.
    #[must_use]
    pub fn into_metadata(self) -> Metadata {
        let mut metadata = Metadata::new(self.twin_id, self.thing_revision);
        metadata.policy_id = self.policy_id;
        metadata.policy_revision = self.policy_revision;
        metadata.update_reasons = self.update_reasons;
        metadata.invalidate_thing = self.invalidate_thing;
        metadata.invalidate_policy = self.invalidate_policy;
        for event in self.events {
            metadata.push_event(event);
        }
        metadata.thing_revision = metadata.thing_revision.max(self.thing_revision);
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use twindex_core::event::TwinEventPayload;

    fn event(revision: i64) -> TwinEvent {
        TwinEvent::new(
            "org.acme:sensor-1".parse().unwrap(),
            revision,
            None,
            TwinEventPayload::AttributeModified {
                pointer: "/x".parse().unwrap(),
                value: json!(1),
            },
        )
    }

    #[test]
    fn serde_roundtrip() {
        let notification = ChangeNotification::from_event(event(5));
        let json = serde_json::to_value(&notification).unwrap();
        assert_eq!(json["twinId"], json!("org.acme:sensor-1"));
        assert_eq!(json["thingRevision"], json!(5));
        let back: ChangeNotification = serde_json::from_value(json).unwrap();
        assert_eq!(back.thing_revision, 5);
        assert_eq!(back.events.len(), 1);
    }

    #[test]
    fn into_metadata_carries_everything() {
        let mut notification = ChangeNotification::from_event(event(5));
        notification.invalidate_policy = true;
        notification.policy_revision = Some(3);
        notification.policy_id = Some("org.acme:policy".parse().unwrap());

        let metadata = notification.into_metadata();
        assert_eq!(metadata.thing_revision, 5);
        assert_eq!(metadata.events.len(), 1);
        assert_eq!(metadata.timers.len(), 1);
        assert!(metadata.invalidate_policy);
        assert_eq!(metadata.policy_revision, Some(3));
        assert!(metadata.update_reasons.contains(&UpdateReason::ChangeEvent));
    }

    #[test]
    fn missing_optional_fields_default() {
        let parsed: ChangeNotification = serde_json::from_value(json!({
            "twinId": "a:b",
            "thingRevision": 1
        }))
        .unwrap();
        assert!(parsed.events.is_empty());
        assert!(!parsed.invalidate_thing);
        assert!(parsed.policy_id.is_none());
    }
}
