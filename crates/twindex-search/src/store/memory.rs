//! In-memory search-index store for testing and the dev harness.
//!
//! Reproduces the semantics the bulk writer relies on: patches are
//! applied only when the persisted `_revision` matches the filter, and
//! operations within a bulk fail independently. Supports failure
//! injection for exercising retry and error-classification paths.
//!
//! Not suitable for production: no durability, single process only.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use twindex_core::id::TwinId;

use super::{OpOutcome, SearchIndexStore, StoreOp};
use crate::error::{Error, Result};
use crate::write_model::doc_revision;

/// In-memory store with failure injection.
#[derive(Debug, Default)]
pub struct InMemoryIndex {
    documents: RwLock<HashMap<TwinId, Value>>,
    fail_transient_bulks: AtomicU32,
    permanent_failures: RwLock<HashSet<TwinId>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::transient_store("lock poisoned")
}

impl InMemoryIndex {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` bulk round-trips fail with a transient
    /// transport error.
    pub fn fail_next_bulks(&self, count: u32) {
        self.fail_transient_bulks.store(count, Ordering::SeqCst);
    }

    /// Makes every operation on `twin_id` fail permanently.
    ///
    /// # Panics
    ///
    /// Panics when the internal lock is poisoned (test-only helper).
    pub fn fail_permanently(&self, twin_id: TwinId) {
        self.permanent_failures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(twin_id);
    }

    /// Returns the persisted document for a twin, if any.
    ///
    /// # Panics
    ///
    /// Panics when the internal lock is poisoned (test-only helper).
    #[must_use]
    pub fn document(&self, twin_id: &TwinId) -> Option<Value> {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(twin_id)
            .cloned()
    }

    /// Returns the number of persisted documents.
    ///
    /// # Panics
    ///
    /// Panics when the internal lock is poisoned (test-only helper).
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true when no documents are persisted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seeds a document directly, bypassing the bulk path.
    ///
    /// # Panics
    ///
    /// Panics when the internal lock is poisoned (test-only helper).
    pub fn seed(&self, twin_id: TwinId, document: Value) {
        self.documents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(twin_id, document);
    }

    fn apply(&self, op: &StoreOp, documents: &mut HashMap<TwinId, Value>) -> OpOutcome {
        match op {
            StoreOp::Put { twin_id, document } => {
                documents.insert(twin_id.clone(), document.clone());
                OpOutcome::Applied
            }
            StoreOp::Patch {
                twin_id,
                filter_revision,
                update,
            } => match documents.get_mut(twin_id) {
                Some(document) if doc_revision(document) == Some(*filter_revision) => {
                    update.apply_to(document);
                    OpOutcome::Applied
                }
                _ => OpOutcome::Conflict,
            },
            StoreOp::Delete { twin_id } => {
                documents.remove(twin_id);
                OpOutcome::Applied
            }
        }
    }
}

#[async_trait]
impl SearchIndexStore for InMemoryIndex {
    async fn bulk_write(&self, ops: &[StoreOp]) -> Result<Vec<OpOutcome>> {
        let pending = self.fail_transient_bulks.load(Ordering::SeqCst);
        if pending > 0
            && self
                .fail_transient_bulks
                .compare_exchange(pending, pending - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(Error::transient_store("injected transport failure"));
        }

        let permanent = self
            .permanent_failures
            .read()
            .map_err(poison_err)?
            .clone();
        let mut documents = self.documents.write().map_err(poison_err)?;

        Ok(ops
            .iter()
            .map(|op| {
                if permanent.contains(op.twin_id()) {
                    OpOutcome::Permanent {
                        reason: "injected permanent rejection".to_string(),
                    }
                } else {
                    self.apply(op, &mut documents)
                }
            })
            .collect())
    }

    async fn load(&self, twin_id: &TwinId) -> Result<Option<Value>> {
        Ok(self
            .documents
            .read()
            .map_err(poison_err)?
            .get(twin_id)
            .cloned())
    }
}
