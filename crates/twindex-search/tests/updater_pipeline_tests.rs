//! End-to-end tests for the per-twin update pipeline.
//!
//! Each test assembles the full pipeline (enrichment facade, enforcement
//! flow, bulk writer, updater registry) over controllable fakes: a store
//! that can gate loads and writes, a twins service serving one base
//! snapshot, and a policies service serving one read policy.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Semaphore;

use twindex_core::event::{TwinEvent, TwinEventPayload};
use twindex_core::id::{PolicyId, TwinId};
use twindex_core::policy::{Permission, Policy, PolicyEntry};

use twindex_search::config::{AskRetrySettings, CacheSettings, SearchConfig};
use twindex_search::enforcement::PolicyLoader;
use twindex_search::enrichment::TwinRetriever;
use twindex_search::error::Result;
use twindex_search::notification::ChangeNotification;
use twindex_search::observer::SearchUpdateObserver;
use twindex_search::service::SearchUpdateService;
use twindex_search::store::memory::InMemoryIndex;
use twindex_search::store::{OpOutcome, SearchIndexStore, StoreOp};
use twindex_search::write_model::{Metadata, UpdateReason, doc_revision};

const REVISION: i64 = 1234;

fn twin_id() -> TwinId {
    "thing:id".parse().unwrap()
}

fn policy_id() -> PolicyId {
    "thing:id".parse().unwrap()
}

fn attribute_event(revision: i64, value: i64) -> TwinEvent {
    TwinEvent::new(
        twin_id(),
        revision,
        None,
        TwinEventPayload::AttributeModified {
            pointer: "/x".parse().unwrap(),
            value: json!(value),
        },
    )
}

fn base_snapshot() -> Value {
    json!({
        "thingId": "thing:id",
        "policyId": "thing:id",
        "_revision": REVISION,
        "attributes": {"x": 5}
    })
}

/// A recorded store operation: kind plus the revision it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RecordedOp {
    kind: &'static str,
    revision: Option<i64>,
}

/// Store wrapper with operation recording and gating for loads/writes.
struct TestStore {
    inner: InMemoryIndex,
    recorded: Mutex<Vec<RecordedOp>>,
    bulks_started: AtomicU32,
    write_permits: Semaphore,
    load_permits: Semaphore,
}

impl TestStore {
    fn new(write_permits: usize, load_permits: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryIndex::new(),
            recorded: Mutex::new(Vec::new()),
            bulks_started: AtomicU32::new(0),
            write_permits: Semaphore::new(write_permits),
            load_permits: Semaphore::new(load_permits),
        })
    }

    fn open() -> Arc<Self> {
        Self::new(Semaphore::MAX_PERMITS, Semaphore::MAX_PERMITS)
    }

    fn with_gated_writes() -> Arc<Self> {
        Self::new(0, Semaphore::MAX_PERMITS)
    }

    fn with_gated_loads() -> Arc<Self> {
        Self::new(Semaphore::MAX_PERMITS, 0)
    }

    fn release_write(&self) {
        self.write_permits.add_permits(1);
    }

    fn release_load(&self) {
        self.load_permits.add_permits(1);
    }

    fn bulks_started(&self) -> u32 {
        self.bulks_started.load(Ordering::SeqCst)
    }

    fn recorded(&self) -> Vec<RecordedOp> {
        self.recorded.lock().unwrap().clone()
    }

    async fn wait_for_bulks(&self, count: u32) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.bulks_started() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("expected bulk round-trip did not start");
    }

    async fn wait_for_revision(&self, twin_id: &TwinId, revision: i64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(document) = self.inner.document(twin_id) {
                    if doc_revision(&document) == Some(revision) {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("expected revision was never persisted");
    }
}

#[async_trait]
impl SearchIndexStore for TestStore {
    async fn bulk_write(&self, ops: &[StoreOp]) -> Result<Vec<OpOutcome>> {
        if !ops.is_empty() {
            self.bulks_started.fetch_add(1, Ordering::SeqCst);
            self.write_permits.acquire().await.map_err(|_| {
                twindex_search::error::Error::transient_store("gate closed")
            })?
            .forget();
            let mut recorded = self.recorded.lock().unwrap();
            for op in ops {
                recorded.push(match op {
                    StoreOp::Put { document, .. } => RecordedOp {
                        kind: "put",
                        revision: doc_revision(document),
                    },
                    StoreOp::Patch {
                        filter_revision, ..
                    } => RecordedOp {
                        kind: "patch",
                        revision: Some(*filter_revision),
                    },
                    StoreOp::Delete { .. } => RecordedOp {
                        kind: "delete",
                        revision: None,
                    },
                });
            }
        }
        self.inner.bulk_write(ops).await
    }

    async fn load(&self, twin_id: &TwinId) -> Result<Option<Value>> {
        self.load_permits
            .acquire()
            .await
            .map_err(|_| twindex_search::error::Error::transient_store("gate closed"))?
            .forget();
        self.inner.load(twin_id).await
    }
}

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

/// Observer capturing the metadata of every processed update.
#[derive(Default)]
struct RecordingObserver {
    seen: Mutex<Vec<Metadata>>,
}

impl SearchUpdateObserver for RecordingObserver {
    fn process(&self, metadata: &Metadata, _twin_json: Option<&Value>) {
        self.seen.lock().unwrap().push(metadata.clone());
    }
}

fn read_policy(revision: i64) -> Policy {
    Policy::new(policy_id(), revision).with_entry(
        PolicyEntry::new("DEFAULT")
            .with_subject("reader")
            .with_grant("thing", "/".parse().unwrap(), [Permission::Read]),
    )
}

fn test_config() -> SearchConfig {
    SearchConfig {
        max_array_size: 100,
        max_bulk_size: 4,
        max_bulk_delay: Duration::from_millis(10),
        parallelism: 4,
        patch_size_threshold: 16_384,
        thing_cache: CacheSettings {
            capacity: 64,
            ttl: Duration::from_secs(60),
            retry_delay: Duration::from_millis(1),
        },
        policy_cache: CacheSettings {
            capacity: 64,
            ttl: Duration::from_secs(60),
            retry_delay: Duration::from_millis(1),
        },
        ask: AskRetrySettings {
            timeout: Duration::from_millis(500),
            retries: 0,
            backoff: Duration::from_millis(1),
        },
        write_max_retries: 2,
        write_retry_delay: Duration::from_millis(5),
        idle_timeout: Duration::from_secs(60),
        drain_timeout: Duration::from_secs(5),
        stash_capacity: 100,
    }
}

struct Pipeline {
    service: SearchUpdateService,
    store: Arc<TestStore>,
    observer: Arc<RecordingObserver>,
}

fn pipeline(store: Arc<TestStore>) -> Pipeline {
    let observer = Arc::new(RecordingObserver::default());
    let service = SearchUpdateService::start(
        test_config(),
        Arc::clone(&store) as Arc<dyn SearchIndexStore>,
        Arc::new(FakeTwins {
            snapshot: Mutex::new(Some(base_snapshot())),
        }),
        Arc::new(FakePolicies {
            policy: Mutex::new(Some(read_policy(1))),
        }),
        Arc::clone(&observer) as Arc<dyn SearchUpdateObserver>,
    );
    Pipeline {
        service,
        store,
        observer,
    }
}

fn seeded_document() -> Value {
    json!({
        "_id": "thing:id",
        "_revision": REVISION,
        "f": [],
        "t": {"attributes": {"x": 5}}
    })
}

#[tokio::test]
async fn recover_then_noop() {
    let store = TestStore::open();
    store.inner.seed(twin_id(), seeded_document());
    let pipeline = pipeline(Arc::clone(&store));

    // An event at the recovered revision must not produce a write.
    pipeline
        .service
        .dispatch(ChangeNotification::from_event(attribute_event(REVISION, 5)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.bulks_started(), 0, "no update may be sent");
    assert_eq!(store.inner.document(&twin_id()), Some(seeded_document()));
    pipeline.service.shutdown().await;
}

#[tokio::test]
async fn two_events_merge_into_one_write() {
    let store = TestStore::with_gated_loads();
    store.inner.seed(twin_id(), seeded_document());
    let pipeline = pipeline(Arc::clone(&store));

    // Both events arrive while recovery is still loading, so they merge
    // into a single flush.
    pipeline
        .service
        .dispatch(ChangeNotification::from_event(attribute_event(
            REVISION + 1,
            6,
        )))
        .await
        .unwrap();
    pipeline
        .service
        .dispatch(ChangeNotification::from_event(attribute_event(
            REVISION + 2,
            7,
        )))
        .await
        .unwrap();
    store.release_load();

    store.wait_for_revision(&twin_id(), REVISION + 2).await;
    assert_eq!(store.bulks_started(), 1, "exactly one write for both events");
    let document = store.inner.document(&twin_id()).unwrap();
    assert_eq!(document["t"]["attributes"]["x"], json!(7));
    pipeline.service.shutdown().await;
}

#[tokio::test]
async fn events_are_stashed_during_persistence() {
    let store = TestStore::with_gated_writes();
    store.inner.seed(twin_id(), seeded_document());
    let pipeline = pipeline(Arc::clone(&store));

    pipeline
        .service
        .dispatch(ChangeNotification::from_event(attribute_event(
            REVISION + 1,
            6,
        )))
        .await
        .unwrap();
    store.wait_for_bulks(1).await;

    // A second event arrives while the first write is in flight.
    pipeline
        .service
        .dispatch(ChangeNotification::from_event(attribute_event(
            REVISION + 2,
            7,
        )))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        store.bulks_started(),
        1,
        "no second write until the first one acknowledges"
    );

    store.release_write();
    store.wait_for_bulks(2).await;
    store.release_write();
    store.wait_for_revision(&twin_id(), REVISION + 2).await;
    let document = store.inner.document(&twin_id()).unwrap();
    assert_eq!(document["t"]["attributes"]["x"], json!(7));
    pipeline.service.shutdown().await;
}

#[tokio::test]
async fn policy_change_triggers_write_at_current_revision() {
    let store = TestStore::open();
    store.inner.seed(twin_id(), seeded_document());
    let pipeline = pipeline(Arc::clone(&store));

    let notification = ChangeNotification {
        twin_id: twin_id(),
        thing_revision: REVISION,
        policy_id: Some(policy_id()),
        policy_revision: Some(1),
        events: Vec::new(),
        update_reasons: Default::default(),
        invalidate_thing: false,
        invalidate_policy: true,
    };
    pipeline.service.dispatch(notification).await.unwrap();

    store.wait_for_bulks(1).await;
    let document = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(document) = store.inner.document(&twin_id()) {
                if document.get("_policyRevision").is_some() {
                    return document;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("policy update was never persisted");
    assert_eq!(document["_policyRevision"], json!(1));
    assert_eq!(document["_revision"], json!(REVISION));

    let seen = pipeline.observer.seen.lock().unwrap();
    let metadata = seen.last().expect("observer saw the update");
    assert!(metadata.update_reasons.contains(&UpdateReason::PolicyUpdate));
    assert_eq!(metadata.policy_revision, Some(1));
    assert_eq!(metadata.thing_revision, REVISION);
    drop(seen);
    pipeline.service.shutdown().await;
}

#[tokio::test]
async fn manual_reindex_force_update_writes_full_put() {
    let store = TestStore::open();
    let pipeline = pipeline(Arc::clone(&store));

    // First manual update writes the canonical document.
    pipeline
        .service
        .registry()
        .update_twin(&twin_id(), UpdateReason::ManualReindexing, false)
        .await
        .unwrap();
    store.wait_for_bulks(1).await;
    store.wait_for_revision(&twin_id(), REVISION).await;

    // A second one without force finds nothing to change.
    pipeline
        .service
        .registry()
        .update_twin(&twin_id(), UpdateReason::ManualReindexing, false)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.bulks_started(), 1, "equal state is dropped");

    // With force-update the last model becomes a virtual delete and the
    // next write is a full put.
    pipeline
        .service
        .registry()
        .update_twin(&twin_id(), UpdateReason::ManualReindexing, true)
        .await
        .unwrap();
    store.wait_for_bulks(2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let recorded = store.recorded();
    assert_eq!(recorded.len(), 2);
    assert!(
        recorded.iter().all(|op| op.kind == "put"),
        "forced refresh must be a full put, got {recorded:?}"
    );
    pipeline.service.shutdown().await;
}

#[tokio::test]
async fn shutdown_during_persistence_drains_in_flight() {
    let store = TestStore::with_gated_writes();
    store.inner.seed(twin_id(), seeded_document());
    let pipeline = pipeline(Arc::clone(&store));

    pipeline
        .service
        .dispatch(ChangeNotification::from_event(attribute_event(
            REVISION + 1,
            6,
        )))
        .await
        .unwrap();
    store.wait_for_bulks(1).await;

    // Shut down while the write is in flight; release the gate so the
    // drain can complete.
    let shutdown = tokio::spawn(async move { pipeline.service.shutdown().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    store.release_write();
    tokio::time::timeout(Duration::from_secs(5), shutdown)
        .await
        .expect("shutdown must finish after the drain")
        .unwrap();

    store.wait_for_revision(&twin_id(), REVISION + 1).await;
}

#[tokio::test]
async fn replaying_events_is_idempotent() {
    let store = TestStore::open();
    store.inner.seed(twin_id(), seeded_document());
    let pipeline = pipeline(Arc::clone(&store));

    let events = [attribute_event(REVISION + 1, 6), attribute_event(REVISION + 2, 7)];
    for event in &events {
        pipeline
            .service
            .dispatch(ChangeNotification::from_event(event.clone()))
            .await
            .unwrap();
    }
    store.wait_for_revision(&twin_id(), REVISION + 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let document = store.inner.document(&twin_id()).unwrap();
    let bulks = store.bulks_started();

    // Replaying the same events yields no further writes and the same
    // document.
    for event in &events {
        pipeline
            .service
            .dispatch(ChangeNotification::from_event(event.clone()))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.bulks_started(), bulks);
    assert_eq!(store.inner.document(&twin_id()), Some(document));
    pipeline.service.shutdown().await;
}

#[tokio::test]
async fn writes_for_one_twin_are_observed_in_revision_order() {
    let store = TestStore::open();
    store.inner.seed(twin_id(), seeded_document());
    let pipeline = pipeline(Arc::clone(&store));

    for i in 1..=6 {
        pipeline
            .service
            .dispatch(ChangeNotification::from_event(attribute_event(
                REVISION + i,
                i,
            )))
            .await
            .unwrap();
        store.wait_for_revision(&twin_id(), REVISION + i).await;
    }

    let recorded = store.recorded();
    let put_revisions: Vec<i64> = recorded
        .iter()
        .filter(|op| op.kind == "put")
        .filter_map(|op| op.revision)
        .collect();
    let mut sorted = put_revisions.clone();
    sorted.sort_unstable();
    assert_eq!(put_revisions, sorted, "puts must be revision-ordered");

    let patch_filters: Vec<i64> = recorded
        .iter()
        .filter(|op| op.kind == "patch")
        .filter_map(|op| op.revision)
        .collect();
    let mut sorted_filters = patch_filters.clone();
    sorted_filters.sort_unstable();
    assert_eq!(
        patch_filters, sorted_filters,
        "patch preconditions must be revision-ordered"
    );
    pipeline.service.shutdown().await;
}

#[tokio::test]
async fn purge_namespace_stops_matching_updaters() {
    let store = TestStore::open();
    let pipeline = pipeline(Arc::clone(&store));

    let other: TwinId = "elsewhere:id".parse().unwrap();
    pipeline
        .service
        .registry()
        .update_twin(&twin_id(), UpdateReason::BackgroundSync, false)
        .await
        .unwrap();
    pipeline
        .service
        .registry()
        .update_twin(&other, UpdateReason::BackgroundSync, false)
        .await
        .unwrap();
    assert_eq!(pipeline.service.registry().active_count().await, 2);

    pipeline.service.registry().purge_namespace("thing").await;
    assert_eq!(pipeline.service.registry().active_count().await, 1);
    pipeline.service.shutdown().await;
}
