//! Lazy registry of per-twin updater tasks.
//!
//! Updater tasks are created on first reference and terminate themselves
//! on idle timeout; the registry transparently respawns a task whose twin
//! is referenced again. Shutdown is cooperative, either for the whole
//! registry or scoped to one namespace (purge).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use twindex_core::id::TwinId;

use crate::bulk::BulkSubmitter;
use crate::enforcement::EnforcementFlow;
use crate::error::{Error, Result};
use crate::metrics::SearchMetrics;
use crate::notification::ChangeNotification;
use crate::store::SearchIndexStore;
use crate::updater::{UpdaterConfig, UpdaterHandle, UpdaterMessage, spawn_updater};
use crate::write_model::UpdateReason;

/// Registry owning the updater task per twin id.
pub struct UpdaterRegistry {
    flow: Arc<EnforcementFlow>,
    store: Arc<dyn SearchIndexStore>,
    submitter: BulkSubmitter,
    config: UpdaterConfig,
    metrics: SearchMetrics,
    updaters: Mutex<HashMap<TwinId, UpdaterHandle>>,
}

impl UpdaterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(
        flow: Arc<EnforcementFlow>,
        store: Arc<dyn SearchIndexStore>,
        submitter: BulkSubmitter,
        config: UpdaterConfig,
        metrics: SearchMetrics,
    ) -> Self {
        Self {
            flow,
            store,
            submitter,
            config,
            metrics,
            updaters: Mutex::new(HashMap::new()),
        }
    }

    /// Routes a change notification to the twin's updater, spawning it if
    /// needed.
    ///
    /// The notification is carried wholesale: events, policy reference,
    /// update reasons, and the invalidation hints all reach the updater.
    ///
    /// # Errors
    ///
    /// Returns an error when the updater cannot accept messages even
    /// after a respawn.
    pub async fn dispatch(&self, notification: ChangeNotification) -> Result<()> {
        let twin_id = notification.twin_id.clone();
        let mut metadata = notification.into_metadata();
        if metadata.events.is_empty()
            && metadata.policy_revision.is_none()
            && metadata.update_reasons.is_empty()
        {
            // A bare notification is a sync request.
            metadata.update_reasons.insert(UpdateReason::BackgroundSync);
        }
        self.send(&twin_id, UpdaterMessage::Changes(metadata)).await
    }

    /// Sends a message to a twin's updater, spawning or respawning the
    /// task as needed.
    ///
    /// # Errors
    ///
    /// Returns an error when the updater cannot accept messages even
    /// after a respawn.
    pub async fn send(&self, twin_id: &TwinId, message: UpdaterMessage) -> Result<()> {
        // One respawn: the task may terminate on idle timeout between
        // lookup and send.
        for _ in 0..2 {
            let mut updaters = self.updaters.lock().await;
            let stale = updaters
                .get(twin_id)
                .map_or(true, UpdaterHandle::is_finished);
            if stale {
                let handle = spawn_updater(
                    twin_id.clone(),
                    Arc::clone(&self.flow),
                    Arc::clone(&self.store),
                    self.submitter.clone(),
                    self.config.clone(),
                    self.metrics.clone(),
                );
                updaters.insert(twin_id.clone(), handle);
                self.metrics.set_active_updaters(updaters.len());
            }
            if let Some(handle) = updaters.get(twin_id) {
                if handle.send(message.clone()).await.is_ok() {
                    return Ok(());
                }
                updaters.remove(twin_id);
            }
        }
        Err(Error::UpdaterStopped {
            twin_id: twin_id.clone(),
        })
    }

    /// Requests an out-of-band update for one twin.
    ///
    /// # Errors
    ///
    /// Returns an error when the updater cannot accept messages.
    pub async fn update_twin(
        &self,
        twin_id: &TwinId,
        reason: UpdateReason,
        force_update: bool,
    ) -> Result<()> {
        self.send(
            twin_id,
            UpdaterMessage::Update {
                reason,
                force_update,
            },
        )
        .await
    }

    /// Shuts down every updater whose twin is in the given namespace.
    pub async fn purge_namespace(&self, namespace: &str) {
        let purged = {
            let mut updaters = self.updaters.lock().await;
            let ids: Vec<TwinId> = updaters
                .keys()
                .filter(|id| id.namespace() == namespace)
                .cloned()
                .collect();
            let purged: Vec<UpdaterHandle> = ids
                .iter()
                .filter_map(|id| updaters.remove(id))
                .collect();
            self.metrics.set_active_updaters(updaters.len());
            purged
        };
        for handle in &purged {
            let _ = handle.send(UpdaterMessage::Shutdown).await;
        }
        for handle in purged {
            handle.join().await;
        }
        tracing::info!(namespace, "purged namespace updaters");
    }

    /// Returns the number of live updater tasks, pruning finished ones.
    pub async fn active_count(&self) -> usize {
        let mut updaters = self.updaters.lock().await;
        updaters.retain(|_, handle| !handle.is_finished());
        self.metrics.set_active_updaters(updaters.len());
        updaters.len()
    }

    /// Cooperatively shuts down all updaters, draining in-flight writes.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        let drained = {
            let mut updaters = self.updaters.lock().await;
            let drained: Vec<UpdaterHandle> =
                updaters.drain().map(|(_, handle)| handle).collect();
            self.metrics.set_active_updaters(0);
            drained
        };
        for handle in &drained {
            let _ = handle.send(UpdaterMessage::Shutdown).await;
        }
        for handle in drained {
            if tokio::time::timeout(drain_timeout, handle.join())
                .await
                .is_err()
            {
                tracing::warn!("updater did not drain within the timeout");
            }
        }
    }
}
