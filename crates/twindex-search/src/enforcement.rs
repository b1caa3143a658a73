//! Converts twin changes into write models by retrieving data and
//! applying enforcement via an enforcer cache.
//!
//! For every changed twin, the flow fetches the twin JSON through the
//! enrichment facade, resolves the authorization policy through the
//! coalescing enforcer cache, and emits either an upsert of the projected
//! search document or a deletion. A fetch failure for a single twin never
//! poisons the batch; that twin is skipped and retried when its next
//! event arrives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::Instrument;

use twindex_core::event::TwinEvent;
use twindex_core::id::PolicyId;
use twindex_core::observability::enforcement_span;
use twindex_core::policy::Policy;
use twindex_core::policy::trie::{Enforcer, PolicyEnforcer};
use twindex_core::twin;

use crate::cache::{Cache, CacheLoader, Entry, LoadFailed, ProjectedCache};
use crate::config::{AskRetrySettings, CacheSettings};
use crate::enrichment::{ANY_REVISION, CachingEnrichmentFacade};
use crate::error::Result;
use crate::metrics::SearchMetrics;
use crate::observer::SearchUpdateObserver;
use crate::retry::ask_with_retry;
use crate::write_model::{Metadata, WriteModel, build_search_document};

/// Seam to the policies service: authoritative policy retrieval.
#[async_trait]
pub trait PolicyLoader: Send + Sync + 'static {
    /// Fetches a policy; `None` when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error when the policies service cannot be reached.
    async fn load_policy(&self, policy_id: &PolicyId) -> Result<Option<Policy>>;
}

struct PolicyCacheLoader {
    loader: Arc<dyn PolicyLoader>,
    ask: AskRetrySettings,
    metrics: SearchMetrics,
}

impl CacheLoader<PolicyId, PolicyEnforcer> for PolicyCacheLoader {
    fn load(&self, key: PolicyId) -> BoxFuture<'static, std::result::Result<Entry<PolicyEnforcer>, LoadFailed>> {
        let loader = Arc::clone(&self.loader);
        let ask = self.ask.clone();
        let metrics = self.metrics.clone();
        async move {
            let fetched = ask_with_retry(&ask, "load_policy", || {
                let loader = Arc::clone(&loader);
                let key = key.clone();
                async move { loader.load_policy(&key).await }
            })
            .await;
            match fetched {
                Ok(Some(policy)) => {
                    metrics.record_cache_load("policy", "loaded");
                    let revision = policy.revision;
                    Ok(Entry::existent(revision, PolicyEnforcer::compile(policy)))
                }
                Ok(None) => {
                    metrics.record_cache_load("policy", "nonexistent");
                    Ok(Entry::nonexistent())
                }
                Err(error) => {
                    metrics.record_cache_load("policy", "error");
                    Err(LoadFailed::new(error.to_string()))
                }
            }
        }
        .boxed()
    }
}

/// The enforcement flow: twin changes in, write models out.
pub struct EnforcementFlow {
    facade: Arc<CachingEnrichmentFacade>,
    enforcers: ProjectedCache<PolicyId, PolicyEnforcer, Enforcer>,
    cache_retry_delay: Duration,
    max_array_size: usize,
    observer: Arc<dyn SearchUpdateObserver>,
}

impl EnforcementFlow {
    /// Creates an enforcement flow over the given collaborator seams.
    #[must_use]
    pub fn new(
        facade: Arc<CachingEnrichmentFacade>,
        policy_loader: Arc<dyn PolicyLoader>,
        policy_cache: CacheSettings,
        ask: AskRetrySettings,
        max_array_size: usize,
        observer: Arc<dyn SearchUpdateObserver>,
        metrics: SearchMetrics,
    ) -> Self {
        let cache_retry_delay = policy_cache.retry_delay;
        let cache: Cache<PolicyId, PolicyEnforcer> = Cache::new(
            policy_cache,
            Arc::new(PolicyCacheLoader {
                loader: policy_loader,
                ask,
                metrics,
            }),
        );
        Self {
            facade,
            enforcers: cache.project_values(|policy_enforcer| policy_enforcer.enforcer()),
            cache_retry_delay,
            max_array_size,
            observer,
        }
    }

    /// Computes the write model for one twin's accumulated changes.
    ///
    /// Returns `None` when the twin should be skipped for now (fetch
    /// failure); a missing twin, a deletion event, an orphaned twin, and
    /// a missing enforcer all yield `Delete`.
    pub async fn compute_write_model(&self, metadata: Metadata) -> Option<WriteModel> {
        let span = enforcement_span("compute_write_model", metadata.twin_id.as_str());
        self.compute_write_model_inner(metadata).instrument(span).await
    }

    async fn compute_write_model_inner(&self, mut metadata: Metadata) -> Option<WriteModel> {
        let fetched = if metadata.invalidate_thing {
            self.facade
                .retrieve_twin(&metadata.twin_id, &[], ANY_REVISION)
                .await
        } else {
            self.facade
                .retrieve_twin(&metadata.twin_id, &metadata.events, metadata.thing_revision)
                .await
        };

        let twin_json = match fetched {
            Ok(twin_json) => twin_json,
            Err(error) => {
                tracing::error!(
                    twin_id = %metadata.twin_id,
                    %error,
                    "unexpected response retrieving twin via cache"
                );
                return None;
            }
        };

        self.observer.process(&metadata, twin_json.as_ref());

        let Some(twin_json) = twin_json else {
            return Some(WriteModel::Delete { metadata });
        };

        if metadata.latest_event().is_some_and(TwinEvent::is_deleted) {
            return Some(WriteModel::Delete { metadata });
        }

        // A twin without a (valid) policy reference is orphaned and must
        // not be searchable.
        let Some(policy_id) = twin::policy_id_of(&twin_json) else {
            return Some(WriteModel::Delete { metadata });
        };

        let entry = self.read_cached_enforcer(&metadata, &policy_id, 0).await;
        let policy_revision = entry.revision();
        match entry.into_value() {
            Some(enforcer) => {
                metadata.policy_id = Some(policy_id);
                metadata.policy_revision = Some(policy_revision);
                let document = build_search_document(
                    &metadata,
                    &twin_json,
                    &enforcer,
                    policy_revision,
                    self.max_array_size,
                );
                Some(WriteModel::Put { metadata, document })
            }
            None => Some(WriteModel::Delete { metadata }),
        }
    }

    /// Reads the enforcer entry through the cache, reloading at most once.
    ///
    /// An entry is reloaded when it is out-of-date, nonexistent, or a
    /// reload was requested; the reload is an invalidate followed by a
    /// delayed re-get.
    async fn read_cached_enforcer(
        &self,
        metadata: &Metadata,
        policy_id: &PolicyId,
        mut iteration: u32,
    ) -> Entry<Enforcer> {
        loop {
            match self.enforcers.get(policy_id).await {
                Ok(entry) => {
                    if should_reload_cache(Some(&entry), metadata, iteration) {
                        self.enforcers.invalidate(policy_id);
                        tokio::time::sleep(self.cache_retry_delay).await;
                        iteration += 1;
                        continue;
                    }
                    return entry;
                }
                Err(error) => {
                    tracing::error!(%policy_id, %error, "failed to read policy enforcer cache");
                    return Entry::nonexistent();
                }
            }
        }
    }
}

/// Decides whether to reload an enforcer entry.
///
/// An entry is reloaded if it is out-of-date, nonexistent, or corresponds
/// to a nonexistent entity; never more than once per request. A request
/// without a required policy revision treats any cached entry as
/// potentially stale, matching the authoritative lookup behavior of the
/// twins service.
fn should_reload_cache<V>(entry: Option<&Entry<V>>, metadata: &Metadata, iteration: u32) -> bool {
    if iteration > 0 {
        return false;
    }
    metadata.invalidate_policy
        || match entry {
            None => true,
            Some(e) => !e.exists() || e.revision() < metadata.policy_revision.unwrap_or(i64::MAX),
        }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use twindex_core::event::TwinEventPayload;
    use twindex_core::policy::{Permission, PolicyEntry};

    use twindex_core::id::TwinId;

    use crate::enrichment::TwinRetriever;
    use crate::observer::NoopObserver;
    use crate::write_model::doc_fields;

    struct FakeTwins {
        snapshot: Mutex<Option<Value>>,
    }

    #[async_trait]
    impl TwinRetriever for FakeTwins {
        async fn sudo_retrieve_twin(&self, _twin_id: &TwinId) -> Result<Option<Value>> {
            Ok(self.snapshot.lock().unwrap().clone())
        }
    }

    struct FakePolicies {
        policy: Mutex<Option<Policy>>,
    }

    #[async_trait]
    impl PolicyLoader for FakePolicies {
        async fn load_policy(&self, _policy_id: &PolicyId) -> Result<Option<Policy>> {
            Ok(self.policy.lock().unwrap().clone())
        }
    }

    fn twin_id() -> TwinId {
        "org.acme:sensor-1".parse().unwrap()
    }

    fn read_policy(revision: i64) -> Policy {
        Policy::new("org.acme:policy".parse().unwrap(), revision).with_entry(
            PolicyEntry::new("DEFAULT")
                .with_subject("reader")
                .with_grant("thing", "/".parse().unwrap(), [Permission::Read]),
        )
    }

    fn snapshot(revision: i64) -> Value {
        json!({
            "thingId": "org.acme:sensor-1",
            "policyId": "org.acme:policy",
            "_revision": revision,
            "attributes": {"x": 5}
        })
    }

    fn settings() -> (CacheSettings, AskRetrySettings) {
        (
            CacheSettings {
                capacity: 16,
                ttl: std::time::Duration::from_secs(60),
                retry_delay: std::time::Duration::from_millis(1),
            },
            AskRetrySettings {
                timeout: std::time::Duration::from_millis(100),
                retries: 0,
                backoff: std::time::Duration::from_millis(1),
            },
        )
    }

    fn flow(twin: Option<Value>, policy: Option<Policy>) -> EnforcementFlow {
        let (cache_settings, ask) = settings();
        let facade = Arc::new(CachingEnrichmentFacade::new(
            Arc::new(FakeTwins {
                snapshot: Mutex::new(twin),
            }),
            cache_settings.clone(),
            ask.clone(),
            SearchMetrics::new(),
        ));
        EnforcementFlow::new(
            facade,
            Arc::new(FakePolicies {
                policy: Mutex::new(policy),
            }),
            cache_settings,
            ask,
            100,
            Arc::new(NoopObserver),
            SearchMetrics::new(),
        )
    }

    fn metadata(revision: i64) -> Metadata {
        let mut metadata = Metadata::new(twin_id(), revision);
        metadata.invalidate_thing = true;
        metadata
    }

    #[tokio::test]
    async fn existing_twin_yields_put_with_projection() {
        let flow = flow(Some(snapshot(7)), Some(read_policy(3)));
        let model = flow.compute_write_model(metadata(7)).await.unwrap();
        match model {
            WriteModel::Put { metadata, document } => {
                assert_eq!(document[doc_fields::REVISION], json!(7));
                assert_eq!(document[doc_fields::POLICY_REVISION], json!(3));
                assert_eq!(metadata.policy_revision, Some(3));
            }
            other => panic!("expected put, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_twin_yields_delete() {
        let flow = flow(None, Some(read_policy(1)));
        let model = flow.compute_write_model(metadata(1)).await.unwrap();
        assert!(matches!(model, WriteModel::Delete { .. }));
    }

    #[tokio::test]
    async fn deleted_event_yields_delete() {
        let flow = flow(Some(snapshot(8)), Some(read_policy(1)));
        let mut md = metadata(8);
        md.push_event(TwinEvent::new(twin_id(), 8, None, TwinEventPayload::Deleted));
        let model = flow.compute_write_model(md).await.unwrap();
        assert!(matches!(model, WriteModel::Delete { .. }));
    }

    #[tokio::test]
    async fn orphaned_twin_yields_delete() {
        let orphan = json!({"thingId": "org.acme:sensor-1", "_revision": 2});
        let flow = flow(Some(orphan), Some(read_policy(1)));
        let model = flow.compute_write_model(metadata(2)).await.unwrap();
        assert!(matches!(model, WriteModel::Delete { .. }));
    }

    #[tokio::test]
    async fn missing_enforcer_yields_delete() {
        let flow = flow(Some(snapshot(2)), None);
        let model = flow.compute_write_model(metadata(2)).await.unwrap();
        assert!(matches!(model, WriteModel::Delete { .. }));
    }

    #[test]
    fn reload_policy_matches_contract() {
        let entry: Entry<u8> = Entry::existent(3, 1);
        let mut md = Metadata::new(twin_id(), 1);

        // Required revision newer than the cached entry: reload once.
        md.policy_revision = Some(5);
        assert!(should_reload_cache(Some(&entry), &md, 0));
        assert!(!should_reload_cache(Some(&entry), &md, 1));

        // Cached entry new enough: no reload.
        md.policy_revision = Some(2);
        assert!(!should_reload_cache(Some(&entry), &md, 0));

        // Explicit invalidation always reloads once.
        md.invalidate_policy = true;
        assert!(should_reload_cache(Some(&entry), &md, 0));
        assert!(!should_reload_cache(Some(&entry), &md, 1));

        // Nonexistent entries reload once.
        md.invalidate_policy = false;
        md.policy_revision = Some(2);
        let missing: Entry<u8> = Entry::nonexistent();
        assert!(should_reload_cache(Some(&missing), &md, 0));
        assert!(should_reload_cache(None::<&Entry<u8>>, &md, 0));
    }
}
