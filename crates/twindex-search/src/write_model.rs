//! Write models: descriptions of pending search-index changes.
//!
//! A write model carries the [`Metadata`] accumulated for one twin during
//! a flush window plus the change itself: a full replacement, a
//! conditional partial update, or a deletion. The differ (see
//! [`crate::differ`]) turns a (previous, next) pair into the cheapest
//! model that reaches the next state.

use std::collections::BTreeSet;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use twindex_core::event::TwinEvent;
use twindex_core::id::{PolicyId, TwinId};
use twindex_core::policy::Permission;
use twindex_core::policy::trie::Enforcer;
use twindex_core::twin;

use crate::differ::UpdateDoc;

/// Field names of the search-index document.
pub mod doc_fields {
    /// Document id (the twin id).
    pub const ID: &str = "_id";
    /// Twin revision the document reflects.
    pub const REVISION: &str = "_revision";
    /// Policy revision used for the projection.
    pub const POLICY_REVISION: &str = "_policyRevision";
    /// Array of feature ids for fast feature queries.
    pub const FEATURES: &str = "f";
    /// The projected twin JSON.
    pub const THING: &str = "t";
    /// Pointers of arrays truncated by the size bound.
    pub const TRUNCATED: &str = "tr";
}

/// Why a twin is being reindexed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateReason {
    /// A twin change event arrived.
    ChangeEvent,
    /// An operator requested reindexing.
    ManualReindexing,
    /// The twin's policy changed.
    PolicyUpdate,
    /// The background sync detected divergence.
    BackgroundSync,
    /// A previous write failed and is being retried.
    RetryFailure,
}

/// Per-twin state carried through the pipeline during one flush window.
#[derive(Debug, Clone)]
pub struct Metadata {
    /// The twin being updated.
    pub twin_id: TwinId,
    /// The highest twin revision covered by this metadata.
    pub thing_revision: i64,
    /// The policy the projection must use, when known.
    pub policy_id: Option<PolicyId>,
    /// The policy revision the projection must not be older than.
    pub policy_revision: Option<i64>,
    /// Events accumulated since the last flush, in revision order.
    pub events: Vec<TwinEvent>,
    /// Consistency-lag timers, one started per merged change.
    pub timers: Vec<Instant>,
    /// Why this update is happening.
    pub update_reasons: BTreeSet<UpdateReason>,
    /// Forces a full twin re-fetch instead of incremental application.
    pub invalidate_thing: bool,
    /// Forces a policy-cache reload before projecting.
    pub invalidate_policy: bool,
}

impl Metadata {
    /// Creates metadata for a twin at the given revision.
    #[must_use]
    pub fn new(twin_id: TwinId, thing_revision: i64) -> Self {
        Self {
            twin_id,
            thing_revision,
            policy_id: None,
            policy_revision: None,
            events: Vec::new(),
            timers: Vec::new(),
            update_reasons: BTreeSet::new(),
            invalidate_thing: false,
            invalidate_policy: false,
        }
    }

    /// Sets the policy reference.
    #[must_use]
    pub fn with_policy(mut self, policy_id: PolicyId, policy_revision: i64) -> Self {
        self.policy_id = Some(policy_id);
        self.policy_revision = Some(policy_revision);
        self
    }

    /// Adds an update reason.
    #[must_use]
    pub fn with_reason(mut self, reason: UpdateReason) -> Self {
        self.update_reasons.insert(reason);
        self
    }

    /// Adds an event, keeping the revision watermark and starting a timer.
    pub fn push_event(&mut self, event: TwinEvent) {
        self.thing_revision = self.thing_revision.max(event.revision);
        self.events.push(event);
        self.timers.push(Instant::now());
        self.update_reasons.insert(UpdateReason::ChangeEvent);
    }

    /// Merges newer metadata into this one.
    ///
    /// The highest revision wins, events concatenate in revision order,
    /// update reasons union, and invalidation flags are sticky.
    pub fn merge(&mut self, mut newer: Self) {
        self.thing_revision = self.thing_revision.max(newer.thing_revision);
        if newer.policy_revision >= self.policy_revision {
            if let Some(policy_id) = newer.policy_id.take() {
                self.policy_id = Some(policy_id);
                self.policy_revision = newer.policy_revision;
            }
        }
        self.events.append(&mut newer.events);
        self.events.sort_by_key(|e| e.revision);
        self.events.dedup_by_key(|e| e.revision);
        self.timers.append(&mut newer.timers);
        self.update_reasons.extend(newer.update_reasons);
        self.invalidate_thing |= newer.invalidate_thing;
        self.invalidate_policy |= newer.invalidate_policy;
    }

    /// Returns the latest accumulated event.
    ///
    /// Ordered by timestamp, then revision; events without a timestamp
    /// sort before all timestamped events.
    #[must_use]
    pub fn latest_event(&self) -> Option<&TwinEvent> {
        self.events
            .iter()
            .max_by_key(|e| (e.timestamp, e.revision))
    }
}

/// A tagged description of a pending change to the search index.
#[derive(Debug, Clone)]
pub enum WriteModel {
    /// Remove the twin's document from the index.
    Delete {
        /// Pipeline state for this twin.
        metadata: Metadata,
    },
    /// Replace the twin's document wholesale.
    Put {
        /// Pipeline state for this twin.
        metadata: Metadata,
        /// The full search-index document.
        document: Value,
    },
    /// Apply a partial update if the persisted revision still matches.
    Patch {
        /// Pipeline state for this twin.
        metadata: Metadata,
        /// The incremental update document.
        update: UpdateDoc,
        /// Revision the update was computed against.
        filter_revision: i64,
    },
}

impl WriteModel {
    /// Returns the metadata of this write model.
    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        match self {
            Self::Delete { metadata }
            | Self::Put { metadata, .. }
            | Self::Patch { metadata, .. } => metadata,
        }
    }

    /// Returns the twin id of this write model.
    #[must_use]
    pub fn twin_id(&self) -> &TwinId {
        &self.metadata().twin_id
    }

    /// Returns the twin revision this model produces.
    #[must_use]
    pub const fn revision(&self) -> i64 {
        self.metadata().thing_revision
    }

    /// Returns true for conditional partial updates.
    #[must_use]
    pub const fn is_patch(&self) -> bool {
        matches!(self, Self::Patch { .. })
    }
}

/// Reads the revision field of a search-index document.
#[must_use]
pub fn doc_revision(document: &Value) -> Option<i64> {
    document.get(doc_fields::REVISION)?.as_i64()
}

/// Builds the search-index document for a twin.
///
/// The twin JSON is projected to the maximal view readable under the
/// policy, arrays are truncated to `max_array_size` (truncated pointers
/// are recorded under [`doc_fields::TRUNCATED`]), and the standard index
/// fields are added.
#[must_use]
pub fn build_search_document(
    metadata: &Metadata,
    twin_json: &Value,
    enforcer: &Enforcer,
    policy_revision: i64,
    max_array_size: usize,
) -> Value {
    let read_subjects = enforcer.subjects_with_permission("thing", Permission::Read);
    let mut projected = enforcer.project(&read_subjects, "thing", twin_json, Permission::Read);

    let mut truncated = Vec::new();
    truncate_arrays(&mut projected, max_array_size, &mut String::new(), &mut truncated);

    let feature_ids: Vec<Value> = projected
        .get(twin::fields::FEATURES)
        .and_then(Value::as_object)
        .map(|features| features.keys().map(|k| Value::from(k.clone())).collect())
        .unwrap_or_default();

    let revision = twin::revision_of(twin_json).unwrap_or(metadata.thing_revision);

    let mut document = Map::new();
    document.insert(
        doc_fields::ID.to_string(),
        Value::from(metadata.twin_id.as_str()),
    );
    document.insert(doc_fields::REVISION.to_string(), Value::from(revision));
    document.insert(
        doc_fields::POLICY_REVISION.to_string(),
        Value::from(policy_revision),
    );
    document.insert(doc_fields::FEATURES.to_string(), Value::Array(feature_ids));
    document.insert(doc_fields::THING.to_string(), projected);
    if !truncated.is_empty() {
        document.insert(
            doc_fields::TRUNCATED.to_string(),
            Value::Array(truncated.into_iter().map(Value::from).collect()),
        );
    }
    Value::Object(document)
}

fn truncate_arrays(
    value: &mut Value,
    max_array_size: usize,
    path: &mut String,
    truncated: &mut Vec<String>,
) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let len = path.len();
                path.push('/');
                path.push_str(key);
                truncate_arrays(child, max_array_size, path, truncated);
                path.truncate(len);
            }
        }
        Value::Array(items) => {
            if items.len() > max_array_size {
                items.truncate(max_array_size);
                truncated.push(path.clone());
            }
            for (index, child) in items.iter_mut().enumerate() {
                let len = path.len();
                path.push('/');
                path.push_str(&index.to_string());
                truncate_arrays(child, max_array_size, path, truncated);
                path.truncate(len);
            }
        }
        _ => {}
    }
}
