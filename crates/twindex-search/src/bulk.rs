//! Partitioned bulk writer for the search index.
//!
//! Write models are routed to `P` bounded channels by twin-id hash; one
//! consumer task per channel collects batches and issues bulk writes, so
//! writes for one partition are strictly serialized while partitions
//! proceed in parallel.
//!
//! A batch is flushed when it reaches `max_bulk_size` items, when
//! `max_bulk_delay` has elapsed since its first item, or when the channel
//! closes (end of batch). Every write model is acknowledged individually:
//! applied, conflicted (patch precondition failed), or failed. Transient
//! failures are retried with exponential backoff bounded by the
//! configured retry count; permanent rejections surface immediately.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::SearchConfig;
use crate::error::{Error, Result};
use crate::metrics::SearchMetrics;
use crate::partition::partition_for;
use crate::retry::backoff_for;
use crate::store::{OpOutcome, SearchIndexStore, StoreOp};
use crate::write_model::WriteModel;

/// Per-model acknowledgement from the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Durably applied at the given twin revision.
    Acknowledged {
        /// The twin revision that is now persisted.
        revision: i64,
    },
    /// The patch precondition failed; the sender should force a full
    /// refresh on its next attempt.
    Conflict,
    /// The write failed.
    Failed {
        /// Description of the failure.
        reason: String,
        /// True when retrying cannot help.
        permanent: bool,
    },
}

/// Batching and retry limits for the writer.
#[derive(Debug, Clone)]
pub struct BulkWriterConfig {
    /// Partition count and maximum batch size.
    pub max_bulk_size: usize,
    /// Maximum latency before a partial batch is flushed.
    pub max_bulk_delay: Duration,
    /// Retries for transient failures.
    pub max_retries: u32,
    /// Base delay between retries; doubles per attempt.
    pub retry_delay: Duration,
}

impl From<&SearchConfig> for BulkWriterConfig {
    fn from(config: &SearchConfig) -> Self {
        Self {
            max_bulk_size: config.max_bulk_size,
            max_bulk_delay: config.max_bulk_delay,
            max_retries: config.write_max_retries,
            retry_delay: config.write_retry_delay,
        }
    }
}

struct WriteItem {
    model: WriteModel,
    ack: oneshot::Sender<WriteOutcome>,
    submitted: Instant,
}

/// Cheap-to-clone handle for submitting write models to the writer.
#[derive(Clone)]
pub struct BulkSubmitter {
    senders: Arc<Vec<mpsc::Sender<WriteItem>>>,
}

impl BulkSubmitter {
    /// Submits a write model, returning the acknowledgement channel.
    ///
    /// Applies backpressure: when the target partition's queue is full,
    /// this call waits until there is room.
    ///
    /// # Errors
    ///
    /// Returns an error when the writer has shut down.
    pub async fn submit(&self, model: WriteModel) -> Result<oneshot::Receiver<WriteOutcome>> {
        let partition = partition_for(model.twin_id(), self.senders.len());
        let (ack, ack_rx) = oneshot::channel();
        let item = WriteItem {
            model,
            ack,
            submitted: Instant::now(),
        };
        self.senders[partition]
            .send(item)
            .await
            .map_err(|_| Error::transient_store("bulk writer has shut down"))?;
        Ok(ack_rx)
    }

    /// Returns the partition count.
    #[must_use]
    pub fn partitions(&self) -> usize {
        self.senders.len()
    }
}

/// The partitioned bulk writer; owns one consumer task per partition.
pub struct BulkWriter {
    submitter: BulkSubmitter,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BulkWriter {
    /// Spawns the writer over the given store.
    #[must_use]
    pub fn spawn(
        store: Arc<dyn SearchIndexStore>,
        config: BulkWriterConfig,
        metrics: SearchMetrics,
    ) -> Self {
        let partitions = config.max_bulk_size.max(1);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut senders = Vec::with_capacity(partitions);
        let mut tasks = Vec::with_capacity(partitions);
        for index in 0..partitions {
            let (tx, rx) = mpsc::channel(config.max_bulk_size.max(1));
            senders.push(tx);
            tasks.push(tokio::spawn(
                run_partition(
                    Arc::clone(&store),
                    config.clone(),
                    rx,
                    shutdown_rx.clone(),
                    metrics.clone(),
                )
                .instrument(twindex_core::observability::bulk_span("write", index)),
            ));
        }
        Self {
            submitter: BulkSubmitter {
                senders: Arc::new(senders),
            },
            shutdown,
            tasks,
        }
    }

    /// Returns a submit handle.
    #[must_use]
    pub fn submitter(&self) -> BulkSubmitter {
        self.submitter.clone()
    }

    /// Closes the writer and drains in-flight batches.
    ///
    /// Consumers exit once their channels are closed and drained; each
    /// partition gets at most `drain_timeout` to finish.
    pub async fn shutdown(self, drain_timeout: Duration) {
        drop(self.submitter);
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if tokio::time::timeout(drain_timeout, task).await.is_err() {
                tracing::warn!("bulk partition did not drain within the timeout");
            }
        }
    }
}

async fn run_partition(
    store: Arc<dyn SearchIndexStore>,
    config: BulkWriterConfig,
    mut rx: mpsc::Receiver<WriteItem>,
    mut shutdown: watch::Receiver<bool>,
    metrics: SearchMetrics,
) {
    loop {
        let first = tokio::select! {
            item = rx.recv() => match item {
                Some(item) => item,
                None => return,
            },
            _ = shutdown.changed() => {
                // Stop accepting new items, drain what is queued.
                rx.close();
                match rx.recv().await {
                    Some(item) => item,
                    None => return,
                }
            }
        };
        let deadline = tokio::time::Instant::now() + config.max_bulk_delay;
        let mut batch = vec![first];
        while batch.len() < config.max_bulk_size {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(item)) => batch.push(item),
                // Channel closed: flush what we have, then exit the loop.
                Ok(None) | Err(_) => break,
            }
        }
        flush(&*store, &config, batch, &metrics).await;
    }
}

async fn flush(
    store: &dyn SearchIndexStore,
    config: &BulkWriterConfig,
    batch: Vec<WriteItem>,
    metrics: &SearchMetrics,
) {
    let size = batch.len();
    let mut pending = batch;
    let mut attempt: u32 = 0;

    loop {
        let ops: Vec<StoreOp> = pending
            .iter()
            .map(|item| StoreOp::from_write_model(&item.model))
            .collect();

        let outcomes = match store.bulk_write(&ops).await {
            Ok(outcomes) => outcomes,
            Err(error) if error.is_transient() && attempt < config.max_retries => {
                tracing::warn!(%error, attempt, "bulk round-trip failed, retrying");
                metrics.record_bulk("retried", size);
                tokio::time::sleep(backoff_for(config.retry_delay, attempt)).await;
                attempt += 1;
                continue;
            }
            Err(error) => {
                let permanent = !error.is_transient();
                tracing::error!(%error, "bulk round-trip failed");
                metrics.record_bulk("failed", size);
                for item in pending {
                    acknowledge(
                        item,
                        WriteOutcome::Failed {
                            reason: error.to_string(),
                            permanent,
                        },
                        metrics,
                    );
                }
                return;
            }
        };

        let mut retry = Vec::new();
        for (item, outcome) in pending.into_iter().zip(outcomes) {
            match outcome {
                OpOutcome::Applied => {
                    let revision = item.model.revision();
                    metrics.record_update("ok");
                    acknowledge(item, WriteOutcome::Acknowledged { revision }, metrics);
                }
                OpOutcome::Conflict => {
                    metrics.record_update("conflict");
                    acknowledge(item, WriteOutcome::Conflict, metrics);
                }
                OpOutcome::Transient { reason } => retry.push((item, reason)),
                OpOutcome::Permanent { reason } => {
                    metrics.record_update("failed");
                    acknowledge(
                        item,
                        WriteOutcome::Failed {
                            reason,
                            permanent: true,
                        },
                        metrics,
                    );
                }
            }
        }

        if retry.is_empty() {
            metrics.record_bulk("success", size);
            return;
        }
        if attempt >= config.max_retries {
            metrics.record_bulk("retries_exhausted", size);
            for (item, reason) in retry {
                metrics.record_update("failed");
                acknowledge(
                    item,
                    WriteOutcome::Failed {
                        reason,
                        permanent: false,
                    },
                    metrics,
                );
            }
            return;
        }
        tracing::warn!(
            remaining = retry.len(),
            attempt,
            "transient write failures, retrying subset"
        );
        tokio::time::sleep(backoff_for(config.retry_delay, attempt)).await;
        attempt += 1;
        pending = retry.into_iter().map(|(item, _)| item).collect();
    }
}

fn acknowledge(item: WriteItem, outcome: WriteOutcome, metrics: &SearchMetrics) {
    metrics.observe_persist_duration(item.submitted.elapsed());
    // The updater may already be gone (idle timeout); that is fine.
    let _ = item.ack.send(outcome);
}
