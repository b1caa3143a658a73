//! Caching signal-enrichment facade for twin JSON snapshots.
//!
//! The facade answers "give me the current JSON of this twin" without a
//! round-trip when possible: snapshots are cached (coalesced through the
//! entity-keyed cache), and a change notification's known events are
//! applied incrementally when they line up with the cached revision.
//! Gaps in the event sequence, stale caches, and deletions fall back to a
//! full fetch through the retriever seam.
//!
//! Fetch failures surface as errors; the surrounding pipeline treats them
//! as "skip this twin for now" and relies on the next event to retry.

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use twindex_core::event::TwinEvent;
use twindex_core::id::TwinId;
use twindex_core::twin;

use crate::cache::{Cache, CacheLoader, Entry, LoadFailed};
use crate::config::{AskRetrySettings, CacheSettings};
use crate::error::Result;
use crate::metrics::SearchMetrics;
use crate::retry::ask_with_retry;

/// Expected revision signaling "any revision; do a full fetch".
pub const ANY_REVISION: i64 = -1;

/// Seam to the twins service: authoritative snapshot retrieval.
#[async_trait]
pub trait TwinRetriever: Send + Sync + 'static {
    /// Fetches the current JSON of a twin; `None` when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error when the twins service cannot be reached.
    async fn sudo_retrieve_twin(&self, twin_id: &TwinId) -> Result<Option<Value>>;
}

struct RetrieverLoader {
    retriever: Arc<dyn TwinRetriever>,
    ask: AskRetrySettings,
    metrics: SearchMetrics,
}

impl CacheLoader<TwinId, Value> for RetrieverLoader {
    fn load(&self, key: TwinId) -> BoxFuture<'static, std::result::Result<Entry<Value>, LoadFailed>> {
        let retriever = Arc::clone(&self.retriever);
        let ask = self.ask.clone();
        let metrics = self.metrics.clone();
        async move {
            let fetched = ask_with_retry(&ask, "sudo_retrieve_twin", || {
                let retriever = Arc::clone(&retriever);
                let key = key.clone();
                async move { retriever.sudo_retrieve_twin(&key).await }
            })
            .await;
            match fetched {
                Ok(Some(twin_json)) => {
                    metrics.record_cache_load("thing", "loaded");
                    let revision = twin::revision_of(&twin_json).unwrap_or(0);
                    Ok(Entry::existent(revision, twin_json))
                }
                Ok(None) => {
                    metrics.record_cache_load("thing", "nonexistent");
                    Ok(Entry::nonexistent())
                }
                Err(error) => {
                    metrics.record_cache_load("thing", "error");
                    Err(LoadFailed::new(error.to_string()))
                }
            }
        }
        .boxed()
    }
}

/// Retrieves a twin's current JSON, optionally incrementally from a list
/// of known events and an expected revision.
pub struct CachingEnrichmentFacade {
    cache: Cache<TwinId, Value>,
}

impl CachingEnrichmentFacade {
    /// Creates a facade over the given retriever.
    #[must_use]
    pub fn new(
        retriever: Arc<dyn TwinRetriever>,
        cache_settings: CacheSettings,
        ask: AskRetrySettings,
        metrics: SearchMetrics,
    ) -> Self {
        let loader = RetrieverLoader {
            retriever,
            ask,
            metrics,
        };
        Self {
            cache: Cache::new(cache_settings, Arc::new(loader)),
        }
    }

    /// Returns the twin's current JSON, `Ok(None)` when the twin does not
    /// exist, or an error when it cannot be fetched right now (the caller
    /// skips the twin and relies on the next event to retry).
    ///
    /// With `expected_revision == ANY_REVISION` or no known events, a full
    /// (cached, coalesced) fetch is issued. Otherwise the known events are
    /// applied on top of the cached snapshot when they line up; missing
    /// intermediate revisions force a full re-fetch.
    ///
    /// # Errors
    ///
    /// Returns a cache-load error when the retriever could not be reached.
    pub async fn retrieve_twin(
        &self,
        twin_id: &TwinId,
        known_events: &[TwinEvent],
        expected_revision: i64,
    ) -> Result<Option<Value>> {
        if expected_revision == ANY_REVISION || known_events.is_empty() {
            return self.fetch(twin_id).await;
        }

        let entry = self
            .cache
            .get(twin_id)
            .await
            .map_err(|e| crate::error::Error::cache_load(e.to_string()))?;
        let Some(snapshot) = entry.value() else {
            return Ok(None);
        };

        let mut updated = snapshot.clone();
        let mut revision = entry.revision();
        let mut events: Vec<&TwinEvent> = known_events.iter().collect();
        events.sort_by_key(|e| e.revision);

        for event in events {
            if event.revision <= revision {
                continue;
            }
            if event.revision != revision + 1 {
                tracing::debug!(
                    %twin_id,
                    cached_revision = revision,
                    event_revision = event.revision,
                    "revision gap, falling back to full fetch"
                );
                return self.refetch(twin_id).await;
            }
            if event.is_deleted() {
                self.cache.invalidate(twin_id);
                return Ok(None);
            }
            event.apply_to(&mut updated);
            revision = event.revision;
        }

        if revision < expected_revision {
            return self.refetch(twin_id).await;
        }

        self.cache
            .insert(twin_id.clone(), Entry::existent(revision, updated.clone()));
        Ok(Some(updated))
    }

    async fn fetch(&self, twin_id: &TwinId) -> Result<Option<Value>> {
        let entry = self
            .cache
            .get(twin_id)
            .await
            .map_err(|e| crate::error::Error::cache_load(e.to_string()))?;
        Ok(entry.into_value())
    }

    async fn refetch(&self, twin_id: &TwinId) -> Result<Option<Value>> {
        self.cache.invalidate(twin_id);
        self.fetch(twin_id).await
    }
}
