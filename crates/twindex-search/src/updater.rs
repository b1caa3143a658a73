//! The per-twin update task.
//!
//! One cooperative task per twin id coordinates recovery, event merging,
//! persistence handoff, retry, and shutdown:
//!
//! | State | Accepts | Emits |
//! |-------|---------|-------|
//! | Recovering | recovered last write model, shutdown | `Ready` with `last_model` |
//! | Ready | change notifications, manual update commands, shutdown, idle timeout | flush into `Persisting` |
//! | Persisting | writer acknowledgement; stashes new messages | `Ready` on ok, re-persist on conflict |
//! | Retrying | timer tick, shutdown | `Persisting` again, or `Ready` on give-up |
//! | ShuttingDown | drains in-flight only | terminates |
//!
//! The task is single-threaded from its own perspective: one message at a
//! time, with messages arriving during persistence stashed and replayed.
//! Revision gating makes processing idempotent: an event at or below the
//! last persisted revision never causes a write unless a force-update
//! replaced the last model with a virtual delete.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use twindex_core::event::TwinEventKind;
use twindex_core::id::TwinId;
use twindex_core::observability::updater_span;

use crate::bulk::{BulkSubmitter, WriteOutcome};
use crate::config::SearchConfig;
use crate::enforcement::EnforcementFlow;
use crate::error::{Error, Result};
use crate::metrics::SearchMetrics;
use crate::retry::backoff_for;
use crate::store::SearchIndexStore;
use crate::write_model::{Metadata, UpdateReason, WriteModel, doc_revision};

/// Inbox capacity of one updater task.
const INBOX_CAPACITY: usize = 64;

/// Messages accepted by an updater task.
#[derive(Debug, Clone)]
pub enum UpdaterMessage {
    /// Accumulated changes from one bus notification: events, policy
    /// reference, invalidation hints.
    Changes(Metadata),
    /// A manual update command.
    Update {
        /// Why the update was requested.
        reason: UpdateReason,
        /// Replaces the cached last model with a virtual delete so the
        /// next write is a full overwrite.
        force_update: bool,
    },
    /// Cooperative shutdown: drain in-flight work, then stop.
    Shutdown,
}

/// Limits governing one updater task.
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Idle time after which the task terminates itself.
    pub idle_timeout: Duration,
    /// Diff size above which a full replacement is written.
    pub patch_size_threshold: usize,
    /// Bounded stash size; overflow drops the stash and forces a full
    /// refresh on the next attempt.
    pub stash_capacity: usize,
    /// Retries after a transient write failure before giving up.
    pub max_retries: u32,
    /// Base delay between retries; doubles per attempt.
    pub retry_delay: Duration,
    /// Time allowed for draining the in-flight write at shutdown.
    pub drain_timeout: Duration,
}

impl From<&SearchConfig> for UpdaterConfig {
    fn from(config: &SearchConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout,
            patch_size_threshold: config.patch_size_threshold,
            stash_capacity: config.stash_capacity,
            max_retries: config.write_max_retries,
            retry_delay: config.write_retry_delay,
            drain_timeout: config.drain_timeout,
        }
    }
}

/// Handle to a running updater task.
pub struct UpdaterHandle {
    twin_id: TwinId,
    sender: mpsc::Sender<UpdaterMessage>,
    task: JoinHandle<()>,
}

impl UpdaterHandle {
    /// Sends a message to the task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UpdaterStopped`] when the task has terminated.
    pub async fn send(&self, message: UpdaterMessage) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| Error::UpdaterStopped {
                twin_id: self.twin_id.clone(),
            })
    }

    /// Returns true once the task has terminated.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the task to terminate.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Spawns the update task for one twin.
#[must_use]
pub fn spawn_updater(
    twin_id: TwinId,
    flow: Arc<EnforcementFlow>,
    store: Arc<dyn SearchIndexStore>,
    submitter: BulkSubmitter,
    config: UpdaterConfig,
    metrics: SearchMetrics,
) -> UpdaterHandle {
    let (sender, inbox) = mpsc::channel(INBOX_CAPACITY);
    let span = updater_span("run", twin_id.as_str());
    let updater = TwinUpdater {
        twin_id: twin_id.clone(),
        inbox,
        flow,
        store,
        submitter,
        config,
        metrics,
        last_model: None,
        pending: None,
        needs_flush: false,
        force_full_refresh: false,
        stash: Vec::new(),
    };
    let task = tokio::spawn(updater.run().instrument(span));
    UpdaterHandle {
        twin_id,
        sender,
        task,
    }
}

enum Progress {
    Continue,
    Stop,
}

struct TwinUpdater {
    twin_id: TwinId,
    inbox: mpsc::Receiver<UpdaterMessage>,
    flow: Arc<EnforcementFlow>,
    store: Arc<dyn SearchIndexStore>,
    submitter: BulkSubmitter,
    config: UpdaterConfig,
    metrics: SearchMetrics,
    /// Exactly what the writer last acknowledged (or recovery loaded).
    last_model: Option<WriteModel>,
    /// Changes accumulated since the last acknowledged write.
    pending: Option<Metadata>,
    needs_flush: bool,
    /// Set by stash overflow; the next metadata does a full re-fetch.
    force_full_refresh: bool,
    stash: Vec<UpdaterMessage>,
}

impl TwinUpdater {
    async fn run(mut self) {
        if matches!(self.recover().await, Progress::Stop) {
            return;
        }
        self.replay_stash();

        loop {
            while self.needs_flush {
                if matches!(self.persist().await, Progress::Stop) {
                    return;
                }
            }

            match tokio::time::timeout(self.config.idle_timeout, self.inbox.recv()).await {
                Err(_idle) => {
                    tracing::debug!("updater idle, terminating");
                    return;
                }
                Ok(None) => return,
                Ok(Some(UpdaterMessage::Shutdown)) => {
                    tracing::debug!("shutdown requested");
                    return;
                }
                Ok(Some(message)) => {
                    self.absorb(message);
                    // Merge whatever else arrived in the same burst into
                    // one flush.
                    while let Ok(message) = self.inbox.try_recv() {
                        if matches!(message, UpdaterMessage::Shutdown) {
                            return;
                        }
                        self.absorb(message);
                    }
                }
            }
        }
    }

    /// Recovers the last written model from the persisted document.
    ///
    /// Shutdown during recovery stops immediately; other messages are
    /// stashed and replayed once recovery completes.
    async fn recover(&mut self) -> Progress {
        let store = Arc::clone(&self.store);
        let twin_id = self.twin_id.clone();
        let load = store.load(&twin_id);
        tokio::pin!(load);

        loop {
            tokio::select! {
                result = &mut load => {
                    match result {
                        Ok(Some(document)) => {
                            let revision = doc_revision(&document).unwrap_or(0);
                            self.last_model = Some(WriteModel::Put {
                                metadata: Metadata::new(self.twin_id.clone(), revision),
                                document,
                            });
                        }
                        Ok(None) => {
                            self.last_model = Some(WriteModel::Delete {
                                metadata: Metadata::new(self.twin_id.clone(), 0),
                            });
                        }
                        Err(error) => {
                            // Without a recovered model the next write is a
                            // full put, which is always safe.
                            tracing::warn!(%error, "recovery load failed");
                            self.last_model = None;
                        }
                    }
                    return Progress::Continue;
                }
                message = self.inbox.recv() => {
                    match message {
                        None | Some(UpdaterMessage::Shutdown) => return Progress::Stop,
                        Some(message) => self.stash_message(message),
                    }
                }
            }
        }
    }

    fn replay_stash(&mut self) {
        let stash = std::mem::take(&mut self.stash);
        for message in stash {
            self.absorb(message);
        }
    }

    fn last_revision(&self) -> i64 {
        self.last_model.as_ref().map_or(0, WriteModel::revision)
    }

    fn pending_metadata(&mut self) -> &mut Metadata {
        let twin_id = self.twin_id.clone();
        let revision = self.last_revision();
        let force_full_refresh = self.force_full_refresh;
        self.pending.get_or_insert_with(|| {
            let mut metadata = Metadata::new(twin_id, revision);
            metadata.invalidate_thing = force_full_refresh;
            metadata
        })
    }

    fn absorb(&mut self, message: UpdaterMessage) {
        match message {
            UpdaterMessage::Changes(mut incoming) => {
                if !matches!(self.last_model, Some(WriteModel::Delete { .. })) {
                    let last_revision = self.last_revision();
                    incoming.events.retain(|event| {
                        let fresh = event.revision > last_revision;
                        if !fresh {
                            tracing::debug!(
                                event_revision = event.revision,
                                last_revision,
                                "dropping already-persisted event"
                            );
                        }
                        fresh
                    });
                }
                // Nothing left to do once every event turned out stale
                // and no reload or sync was requested.
                let stale_only = incoming.events.is_empty()
                    && incoming.policy_revision.is_none()
                    && !incoming.invalidate_thing
                    && !incoming.invalidate_policy
                    && incoming
                        .update_reasons
                        .iter()
                        .all(|reason| *reason == UpdateReason::ChangeEvent);
                if stale_only {
                    return;
                }
                if incoming
                    .events
                    .iter()
                    .any(|event| event.kind() == TwinEventKind::PolicyIdChanged)
                {
                    incoming.invalidate_policy = true;
                }
                if incoming.policy_revision.is_some() {
                    incoming.update_reasons.insert(UpdateReason::PolicyUpdate);
                }
                self.pending_metadata().merge(incoming);
                self.needs_flush = true;
            }
            UpdaterMessage::Update {
                reason,
                force_update,
            } => {
                if force_update {
                    // Virtual delete: the differ will emit a full put.
                    self.last_model = Some(WriteModel::Delete {
                        metadata: Metadata::new(self.twin_id.clone(), self.last_revision()),
                    });
                }
                let metadata = self.pending_metadata();
                metadata.update_reasons.insert(reason);
                metadata.invalidate_thing = true;
                self.needs_flush = true;
            }
            UpdaterMessage::Shutdown => {}
        }
    }

    fn stash_message(&mut self, message: UpdaterMessage) {
        if self.stash.len() >= self.config.stash_capacity {
            tracing::warn!(
                dropped = self.stash.len(),
                "stash overflow, forcing full refresh on next attempt"
            );
            self.metrics.record_stash_overflow();
            self.stash.clear();
            self.force_full_refresh = true;
            if let Some(pending) = &mut self.pending {
                pending.invalidate_thing = true;
            }
            return;
        }
        self.stash.push(message);
    }

    /// Computes and persists the pending changes: `Ready` → `Persisting`
    /// (→ `Retrying`) → `Ready`.
    async fn persist(&mut self) -> Progress {
        self.needs_flush = false;
        let Some(metadata) = self.pending.clone() else {
            return Progress::Continue;
        };

        let mut attempt: u32 = 0;
        loop {
            let Some(next) = self.flow.compute_write_model(metadata.clone()).await else {
                // Fetch failure: keep the pending changes, a future
                // message retries the whole computation.
                tracing::debug!("twin fetch failed, deferring update");
                return Progress::Continue;
            };

            let canonical = next.clone();
            let Some(model) = crate::differ::diff_write_models(
                self.last_model.as_ref(),
                next,
                self.config.patch_size_threshold,
            ) else {
                self.metrics.record_update("dropped");
                self.settle(canonical);
                return Progress::Continue;
            };

            let Ok(mut acknowledgement) = self.submitter.submit(model).await else {
                tracing::debug!("bulk writer gone, stopping updater");
                return Progress::Stop;
            };

            // Persisting: wait for the acknowledgement, stashing any
            // messages that arrive meanwhile.
            let outcome = loop {
                tokio::select! {
                    outcome = &mut acknowledgement => break outcome,
                    message = self.inbox.recv() => match message {
                        None | Some(UpdaterMessage::Shutdown) => {
                            // ShuttingDown: drain the in-flight write only.
                            let _ = tokio::time::timeout(
                                self.config.drain_timeout,
                                &mut acknowledgement,
                            )
                            .await;
                            return Progress::Stop;
                        }
                        Some(message) => self.stash_message(message),
                    }
                }
            };

            match outcome {
                Ok(WriteOutcome::Acknowledged { .. }) => {
                    self.settle(canonical);
                    return Progress::Continue;
                }
                Ok(WriteOutcome::Conflict) => {
                    // The persisted revision moved under us; re-project
                    // with a virtual delete so the next write is a full
                    // put.
                    tracing::debug!("patch precondition failed, forcing full put");
                    self.last_model = Some(WriteModel::Delete {
                        metadata: Metadata::new(self.twin_id.clone(), self.last_revision()),
                    });
                    continue;
                }
                Ok(WriteOutcome::Failed { reason, permanent }) => {
                    if permanent {
                        tracing::error!(%reason, "write rejected permanently");
                        self.pending = None;
                        self.replay_stash();
                        return Progress::Continue;
                    }
                    if attempt < self.config.max_retries {
                        // Retrying: back off, then persist again.
                        tracing::warn!(%reason, attempt, "write failed, retrying");
                        tokio::time::sleep(backoff_for(self.config.retry_delay, attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    tracing::warn!(%reason, "write retries exhausted, reverting to ready");
                    if let Some(pending) = &mut self.pending {
                        pending.update_reasons.insert(UpdateReason::RetryFailure);
                    }
                    self.replay_stash();
                    return Progress::Continue;
                }
                Err(_writer_gone) => {
                    tracing::debug!("bulk writer dropped the acknowledgement, stopping");
                    return Progress::Stop;
                }
            }
        }
    }

    /// Records a successful (or dropped-as-equal) write: the canonical
    /// model becomes the last model and stashed messages are replayed.
    fn settle(&mut self, canonical: WriteModel) {
        self.last_model = Some(canonical);
        self.pending = None;
        self.force_full_refresh = false;
        self.replay_stash();
    }
}
