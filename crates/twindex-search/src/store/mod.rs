//! Pluggable persistence for the search index.
//!
//! The [`SearchIndexStore`] trait is the seam to the document store. The
//! production implementation wraps a MongoDB collection; it is an external
//! collaborator and lives outside this crate. The in-memory
//! implementation ([`memory::InMemoryIndex`]) reproduces the filter
//! semantics the bulk writer relies on and is used by tests and the dev
//! harness.
//!
//! ## Classification
//!
//! A bulk returns one [`OpOutcome`] per operation. A transport-level
//! failure of the whole round-trip is an `Err` instead and is treated as
//! transient by the writer.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

use twindex_core::id::TwinId;

use crate::differ::UpdateDoc;
use crate::error::Result;
use crate::write_model::WriteModel;

/// One operation inside a bulk write.
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Replace the document wholesale (upsert).
    Put {
        /// Document id.
        twin_id: TwinId,
        /// The full document.
        document: Value,
    },
    /// Apply a partial update if the persisted revision matches.
    Patch {
        /// Document id.
        twin_id: TwinId,
        /// Revision the update was computed against.
        filter_revision: i64,
        /// The update document.
        update: UpdateDoc,
    },
    /// Remove the document.
    Delete {
        /// Document id.
        twin_id: TwinId,
    },
}

impl StoreOp {
    /// Converts a write model into its store operation.
    #[must_use]
    pub fn from_write_model(model: &WriteModel) -> Self {
        match model {
            WriteModel::Delete { metadata } => Self::Delete {
                twin_id: metadata.twin_id.clone(),
            },
            WriteModel::Put { metadata, document } => Self::Put {
                twin_id: metadata.twin_id.clone(),
                document: document.clone(),
            },
            WriteModel::Patch {
                metadata,
                update,
                filter_revision,
            } => Self::Patch {
                twin_id: metadata.twin_id.clone(),
                filter_revision: *filter_revision,
                update: update.clone(),
            },
        }
    }

    /// Returns the document id this operation targets.
    #[must_use]
    pub const fn twin_id(&self) -> &TwinId {
        match self {
            Self::Put { twin_id, .. }
            | Self::Patch { twin_id, .. }
            | Self::Delete { twin_id } => twin_id,
        }
    }
}

/// Classified result of one operation inside a bulk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    /// Durably applied.
    Applied,
    /// A patch filter did not match the persisted revision.
    Conflict,
    /// Failed but may succeed when retried (timeout, broken connection).
    Transient {
        /// Description of the failure.
        reason: String,
    },
    /// Rejected permanently (validation, irreconcilable duplicate key).
    Permanent {
        /// Description of the rejection.
        reason: String,
    },
}

/// Persistence abstraction for the search index.
///
/// Implementations must apply operations of one bulk independently:
/// a rejected operation never prevents the others from being applied.
#[async_trait]
pub trait SearchIndexStore: Send + Sync + 'static {
    /// Applies a bulk of operations, returning one outcome per operation
    /// in input order.
    ///
    /// # Errors
    ///
    /// Returns an error only for transport-level failures of the whole
    /// round-trip; per-operation failures are reported as outcomes.
    async fn bulk_write(&self, ops: &[StoreOp]) -> Result<Vec<OpOutcome>>;

    /// Loads the persisted document for a twin, if any.
    ///
    /// Used by updater tasks to recover their last written state.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be reached.
    async fn load(&self, twin_id: &TwinId) -> Result<Option<Value>>;
}
