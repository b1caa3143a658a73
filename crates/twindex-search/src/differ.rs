//! Incremental update computation for search-index documents.
//!
//! Given the last persisted document and the next one, the differ emits
//! the cheapest write that reaches the next state: nothing when they are
//! semantically equal, a conditional patch when the diff is small, or a
//! full replacement when the diff would be larger than the configured
//! threshold (or when there is no usable previous state).
//!
//! Scalar comparison is semantic: numbers are compared by value, not by
//! representation, so `1`, `1.0`, and `1e0` never produce a patch.

use std::collections::BTreeMap;

use serde_json::{Map, Number, Value};

use crate::write_model::WriteModel;

/// Root pointer used when a non-object document is replaced wholesale.
const ROOT_POINTER: &str = "/";

/// A minimal update document: `$set` for added or changed paths and
/// `$unset` for removed paths.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateDoc {
    set: BTreeMap<String, Value>,
    unset: Vec<String>,
}

impl UpdateDoc {
    /// Returns true when the update changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    /// Returns the `$set` paths and values.
    #[must_use]
    pub const fn set_paths(&self) -> &BTreeMap<String, Value> {
        &self.set
    }

    /// Returns the `$unset` paths.
    #[must_use]
    pub fn unset_paths(&self) -> &[String] {
        &self.unset
    }

    /// Renders the wire form: `{"$set": {...}, "$unset": {...}}`.
    #[must_use]
    pub fn to_update_json(&self) -> Value {
        let mut update = Map::new();
        if !self.set.is_empty() {
            update.insert(
                "$set".to_string(),
                Value::Object(
                    self.set
                        .iter()
                        .map(|(path, value)| (path.clone(), value.clone()))
                        .collect(),
                ),
            );
        }
        if !self.unset.is_empty() {
            update.insert(
                "$unset".to_string(),
                Value::Object(
                    self.unset
                        .iter()
                        .map(|path| (path.clone(), Value::from("")))
                        .collect(),
                ),
            );
        }
        Value::Object(update)
    }

    /// Returns the serialized size of the wire form in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        serde_json::to_string(&self.to_update_json()).map_or(usize::MAX, |s| s.len())
    }

    /// Applies this update to a document.
    ///
    /// Used by the in-memory store and by the round-trip law tests; the
    /// production store applies the wire form natively.
    pub fn apply_to(&self, document: &mut Value) {
        for (path, value) in &self.set {
            if path == ROOT_POINTER {
                *document = value.clone();
            } else if let Ok(pointer) = path.parse::<twindex_core::pointer::JsonPointer>() {
                pointer.set(document, value.clone());
            }
        }
        for path in &self.unset {
            if let Ok(pointer) = path.parse::<twindex_core::pointer::JsonPointer>() {
                pointer.remove(document);
            }
        }
    }
}

/// Computes the minimal update turning `previous` into `next`.
#[must_use]
pub fn diff_documents(previous: &Value, next: &Value) -> UpdateDoc {
    let mut update = UpdateDoc::default();
    match (previous, next) {
        (Value::Object(prev_map), Value::Object(next_map)) => {
            diff_objects(prev_map, next_map, &mut String::new(), &mut update);
        }
        _ if semantically_equal(previous, next) => {}
        _ => {
            update.set.insert(ROOT_POINTER.to_string(), next.clone());
        }
    }
    update
}

fn diff_objects(
    previous: &Map<String, Value>,
    next: &Map<String, Value>,
    path: &mut String,
    update: &mut UpdateDoc,
) {
    for (key, next_value) in next {
        let len = path.len();
        path.push('/');
        path.push_str(key);
        match previous.get(key) {
            Some(prev_value) => match (prev_value, next_value) {
                (Value::Object(prev_map), Value::Object(next_map)) => {
                    diff_objects(prev_map, next_map, path, update);
                }
                _ if semantically_equal(prev_value, next_value) => {}
                _ => {
                    update.set.insert(path.clone(), next_value.clone());
                }
            },
            None => {
                update.set.insert(path.clone(), next_value.clone());
            }
        }
        path.truncate(len);
    }
    for key in previous.keys() {
        if !next.contains_key(key) {
            update.unset.push(format!("{path}/{key}"));
        }
    }
}

/// Compares two JSON values semantically.
///
/// Numbers are equal when they denote the same value regardless of
/// representation; everything else compares structurally.
#[must_use]
pub fn semantically_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, xv)| y.get(k).is_some_and(|yv| semantically_equal(xv, yv)))
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len()
                && x.iter()
                    .zip(y.iter())
                    .all(|(xv, yv)| semantically_equal(xv, yv))
        }
        _ => a == b,
    }
}

fn numbers_equal(x: &Number, y: &Number) -> bool {
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (x.as_u64(), y.as_u64()) {
        return a == b;
    }
    match (x.as_f64(), y.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => x == y,
    }
}

/// Turns a (previous, next) write-model pair into the cheapest write.
///
/// - `next` is `Delete`: emitted unless the previous state is already
///   deleted (equal states are dropped)
/// - no usable previous state: full `Put`
/// - empty diff: dropped
/// - diff larger than `patch_size_threshold` bytes: full `Put`
/// - otherwise: `Patch` guarded by the previous document's revision
#[must_use]
pub fn diff_write_models(
    previous: Option<&WriteModel>,
    next: WriteModel,
    patch_size_threshold: usize,
) -> Option<WriteModel> {
    match next {
        WriteModel::Delete { metadata } => match previous {
            Some(WriteModel::Delete { .. }) => None,
            _ => Some(WriteModel::Delete { metadata }),
        },
        WriteModel::Put { metadata, document } => {
            let Some(WriteModel::Put {
                document: previous_document,
                metadata: previous_metadata,
            }) = previous
            else {
                return Some(WriteModel::Put { metadata, document });
            };

            let update = diff_documents(previous_document, &document);
            if update.is_empty() {
                return None;
            }
            if update.size_bytes() > patch_size_threshold {
                return Some(WriteModel::Put { metadata, document });
            }
            let filter_revision = crate::write_model::doc_revision(previous_document)
                .unwrap_or(previous_metadata.thing_revision);
            Some(WriteModel::Patch {
                metadata,
                update,
                filter_revision,
            })
        }
        // Already differed; pass through.
        patch @ WriteModel::Patch { .. } => Some(patch),
    }
}
