//! Observation hook for search updates.
//!
//! Deployments can plug in an observer that sees every (metadata, twin
//! JSON) pair right before write-model computation, e.g. to feed audit
//! trails or custom metrics. The default observer does nothing.

use serde_json::Value;

use crate::write_model::Metadata;

/// Sees every update before its write model is computed.
pub trait SearchUpdateObserver: Send + Sync + 'static {
    /// Called with the accumulated metadata and the fetched twin JSON
    /// (`None` when the twin does not exist or could not be fetched).
    fn process(&self, metadata: &Metadata, twin_json: Option<&Value>);
}

/// The default observer; does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl SearchUpdateObserver for NoopObserver {
    fn process(&self, _metadata: &Metadata, _twin_json: Option<&Value>) {}
}
