//! Entity-keyed, loader-backed caches with single-flight coalescing.
//!
//! Concurrent `get` calls for the same key share one loader invocation:
//! the first call installs a shared future, later calls await the same
//! future. Completed loads are promoted into a TTL- and capacity-bounded
//! map; failed loads are removed so that nothing is cached and the error
//! propagates to every waiter.
//!
//! [`Cache::project_values`] yields a view with a different value type,
//! used to narrow cached policy enforcers to the query capability.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::config::CacheSettings;

/// A cache entry: existence marker, revision, and the value when present.
///
/// `nonexistent` entries are cached too, so that repeated lookups of a
/// missing entity do not hammer the loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<V> {
    exists: bool,
    revision: i64,
    value: Option<V>,
}

impl<V> Entry<V> {
    /// Creates an entry for an existing entity.
    #[must_use]
    pub const fn existent(revision: i64, value: V) -> Self {
        Self {
            exists: true,
            revision,
            value: Some(value),
        }
    }

    /// Creates an entry recording that the entity does not exist.
    #[must_use]
    pub const fn nonexistent() -> Self {
        Self {
            exists: false,
            revision: -1,
            value: None,
        }
    }

    /// Returns true when the entity exists.
    #[must_use]
    pub const fn exists(&self) -> bool {
        self.exists
    }

    /// Returns the entity revision (meaningful only when it exists).
    #[must_use]
    pub const fn revision(&self) -> i64 {
        self.revision
    }

    /// Returns the value, if the entity exists.
    #[must_use]
    pub const fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// Consumes the entry, returning the value if the entity exists.
    #[must_use]
    pub fn into_value(self) -> Option<V> {
        self.value
    }

    /// Maps the value type, preserving existence and revision.
    #[must_use]
    pub fn map<W>(self, f: impl FnOnce(V) -> W) -> Entry<W> {
        Entry {
            exists: self.exists,
            revision: self.revision,
            value: self.value.map(f),
        }
    }
}

/// Clonable load failure shared by all waiters of one coalesced load.
#[derive(Debug, Clone, thiserror::Error)]
#[error("cache load failed: {message}")]
pub struct LoadFailed {
    /// Description of the loader failure.
    pub message: String,
}

impl LoadFailed {
    /// Creates a load failure with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Asynchronous loader backing a cache.
pub trait CacheLoader<K, V>: Send + Sync + 'static {
    /// Loads the entry for a key.
    fn load(&self, key: K) -> BoxFuture<'static, Result<Entry<V>, LoadFailed>>;
}

type SharedLoad<V> = Shared<BoxFuture<'static, Result<Entry<V>, LoadFailed>>>;

enum SlotState<V> {
    Loading(SharedLoad<V>),
    Ready { entry: Entry<V>, inserted: Instant },
}

struct Slot<V> {
    generation: u64,
    state: SlotState<V>,
}

struct CacheShared<K, V> {
    settings: CacheSettings,
    loader: Arc<dyn CacheLoader<K, V>>,
    slots: Mutex<HashMap<K, Slot<V>>>,
    generations: AtomicU64,
}

/// Loader-backed cache with single-flight coalescing, TTL, and a
/// capacity bound.
pub struct Cache<K, V> {
    shared: Arc<CacheShared<K, V>>,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache over the given loader.
    #[must_use]
    pub fn new(settings: CacheSettings, loader: Arc<dyn CacheLoader<K, V>>) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                settings,
                loader,
                slots: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the entry for a key, loading it if needed.
    ///
    /// Concurrent calls for the same key share one loader invocation.
    ///
    /// # Errors
    ///
    /// Propagates the loader failure to every waiter of the coalesced
    /// load; nothing is cached in that case.
    pub async fn get(&self, key: &K) -> Result<Entry<V>, LoadFailed> {
        let load = {
            let mut slots = lock(&self.shared.slots);
            match slots.get(key) {
                Some(Slot {
                    state: SlotState::Ready { entry, inserted },
                    ..
                }) if inserted.elapsed() <= self.shared.settings.ttl => {
                    return Ok(entry.clone());
                }
                Some(Slot {
                    state: SlotState::Loading(load),
                    ..
                }) => load.clone(),
                _ => {
                    let generation = self.shared.generations.fetch_add(1, Ordering::Relaxed);
                    let load = self.start_load(key.clone(), generation);
                    slots.insert(
                        key.clone(),
                        Slot {
                            generation,
                            state: SlotState::Loading(load.clone()),
                        },
                    );
                    load
                }
            }
        };
        load.await
    }

    /// Drops the entry for a key, forcing the next `get` to reload.
    pub fn invalidate(&self, key: &K) {
        lock(&self.shared.slots).remove(key);
    }

    /// Inserts a fresh entry directly, replacing whatever was cached.
    pub fn insert(&self, key: K, entry: Entry<V>) {
        let generation = self.shared.generations.fetch_add(1, Ordering::Relaxed);
        let mut slots = lock(&self.shared.slots);
        slots.insert(
            key,
            Slot {
                generation,
                state: SlotState::Ready {
                    entry,
                    inserted: Instant::now(),
                },
            },
        );
        evict_over_capacity(&mut slots, self.shared.settings.capacity);
    }

    /// Returns a view of this cache with a narrowed value type.
    #[must_use]
    pub fn project_values<W>(
        &self,
        project: impl Fn(V) -> W + Send + Sync + 'static,
    ) -> ProjectedCache<K, V, W> {
        ProjectedCache {
            cache: self.clone(),
            project: Arc::new(project),
        }
    }

    fn start_load(&self, key: K, generation: u64) -> SharedLoad<V> {
        let shared = Arc::clone(&self.shared);
        async move {
            let result = shared.loader.load(key.clone()).await;
            let mut slots = lock(&shared.slots);
            // Only the load that still owns the slot may publish; a
            // concurrent invalidate discards the result.
            let owns_slot = matches!(
                slots.get(&key),
                Some(Slot {
                    generation: g,
                    state: SlotState::Loading(_),
                }) if *g == generation
            );
            if owns_slot {
                match &result {
                    Ok(entry) => {
                        slots.insert(
                            key,
                            Slot {
                                generation,
                                state: SlotState::Ready {
                                    entry: entry.clone(),
                                    inserted: Instant::now(),
                                },
                            },
                        );
                        evict_over_capacity(&mut slots, shared.settings.capacity);
                    }
                    Err(_) => {
                        slots.remove(&key);
                    }
                }
            }
            result
        }
        .boxed()
        .shared()
    }
}

fn lock<K, V>(slots: &Mutex<HashMap<K, Slot<V>>>) -> std::sync::MutexGuard<'_, HashMap<K, Slot<V>>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

fn evict_over_capacity<K: Eq + Hash + Clone, V>(slots: &mut HashMap<K, Slot<V>>, capacity: usize) {
    while slots.len() > capacity {
        let oldest = slots
            .iter()
            .filter_map(|(key, slot)| match &slot.state {
                SlotState::Ready { inserted, .. } => Some((key.clone(), *inserted)),
                SlotState::Loading(_) => None,
            })
            .min_by_key(|(_, inserted)| *inserted);
        match oldest {
            Some((key, _)) => {
                slots.remove(&key);
            }
            // Only in-flight loads left; nothing evictable.
            None => break,
        }
    }
}

/// A cache view handing out values narrowed by a projection function.
pub struct ProjectedCache<K, V, W> {
    cache: Cache<K, V>,
    project: Arc<dyn Fn(V) -> W + Send + Sync>,
}

impl<K, V, W> Clone for ProjectedCache<K, V, W> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            project: Arc::clone(&self.project),
        }
    }
}

impl<K, V, W> ProjectedCache<K, V, W>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Returns the projected entry for a key, loading it if needed.
    ///
    /// # Errors
    ///
    /// Propagates loader failures like [`Cache::get`].
    pub async fn get(&self, key: &K) -> Result<Entry<W>, LoadFailed> {
        let entry = self.cache.get(key).await?;
        Ok(entry.map(|value| (self.project)(value)))
    }

    /// Drops the entry for a key, forcing the next `get` to reload.
    pub fn invalidate(&self, key: &K) {
        self.cache.invalidate(key);
    }
}
