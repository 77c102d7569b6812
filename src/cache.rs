//! In-memory caching decorator for entity stores.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio::time::Instant;
use uuid::Uuid;

use crate::aggregate::EventSourced;
use crate::command::CommandContext;
use crate::config::StoreSettings;
use crate::entity::Entity;
use crate::error::StoreError;
use crate::lock::EntityLockGuard;
use crate::store::{Saved, Store};

struct CacheEntry<T: EventSourced> {
    entity: Entity<T>,
    last_access: Instant,
}

/// Memoizes loaded entities with sliding expiration and LRU eviction.
///
/// Readers always receive their own clone, so a caller mutating what `get`
/// returned can never corrupt the cached copy. `save` hands the inner store
/// a borrowed entity and caches the returned copy; the caller's instance is
/// left untouched whatever the outcome.
///
/// Only entities that exist (version > 0) are cached. A failed save evicts
/// the entry so the next `get` reloads from durable storage.
pub struct CachedStore<T: EventSourced, S> {
    inner: S,
    entries: Mutex<LruCache<Uuid, CacheEntry<T>>>,
    sliding_expiration: Duration,
}

impl<T: EventSourced, S> std::fmt::Debug for CachedStore<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedStore")
            .field("kind", &T::KIND)
            .field("len", &self.len())
            .field("sliding_expiration", &self.sliding_expiration)
            .finish()
    }
}

impl<T: EventSourced, S: Store<T>> CachedStore<T, S> {
    pub fn new(inner: S, settings: &StoreSettings) -> Self {
        let capacity = NonZeroUsize::new(settings.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            entries: Mutex::new(LruCache::new(capacity)),
            sliding_expiration: settings.cache_sliding_expiration,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Drop the cached copy of `id`, if any.
    pub fn evict(&self, id: Uuid) {
        self.entries().pop(&id);
    }

    fn lookup(&self, id: Uuid) -> Option<Entity<T>> {
        let mut entries = self.entries();
        let now = Instant::now();
        match entries.get_mut(&id) {
            None => return None,
            Some(entry) if now.duration_since(entry.last_access) < self.sliding_expiration => {
                entry.last_access = now;
                return Some(entry.entity.clone());
            }
            Some(_) => {}
        }
        entries.pop(&id);
        None
    }

    /// Cache `entity` unless a newer copy is already there.
    fn remember(&self, entity: &Entity<T>) {
        let mut entries = self.entries();
        if let Some(existing) = entries.peek(&entity.id())
            && existing.entity.version() > entity.version()
        {
            return;
        }
        entries.put(
            entity.id(),
            CacheEntry {
                entity: entity.clone(),
                last_access: Instant::now(),
            },
        );
    }
}

impl<T: EventSourced, S> CachedStore<T, S> {
    fn entries(&self) -> MutexGuard<'_, LruCache<Uuid, CacheEntry<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of cached entities, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<T, S> Store<T> for CachedStore<T, S>
where
    T: EventSourced,
    S: Store<T>,
{
    async fn get(&self, id: Uuid) -> Result<Entity<T>, StoreError> {
        if let Some(entity) = self.lookup(id) {
            tracing::debug!(kind = T::KIND, %id, version = entity.version(), "cache hit");
            return Ok(entity);
        }

        tracing::debug!(kind = T::KIND, %id, "cache miss");
        let entity = self.inner.get(id).await?;
        if !entity.is_new() && !entity.is_completed() {
            self.remember(&entity);
        }
        Ok(entity)
    }

    async fn save(
        &self,
        entity: &Entity<T>,
        ctx: &CommandContext,
        lock: &EntityLockGuard,
    ) -> Result<Saved<T>, StoreError> {
        match self.inner.save(entity, ctx, lock).await {
            Ok(saved) => {
                if saved.commit.is_some() && !saved.entity.is_completed() {
                    self.remember(&saved.entity);
                } else {
                    self.evict(entity.id());
                }
                Ok(saved)
            }
            Err(e) => {
                if e.is_concurrency() {
                    tracing::debug!(
                        kind = T::KIND,
                        id = %entity.id(),
                        "evicting stale entity after conflict"
                    );
                }
                self.evict(entity.id());
                Err(e)
            }
        }
    }

    async fn purge(&self) -> Result<(), StoreError> {
        self.entries().clear();
        self.inner.purge().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Counter, CounterEvent};
    use crate::store::EventSourcedStore;
    use crate::store::test_support::Backends;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts how often the wrapped store is asked to load.
    struct CountingStore {
        inner: EventSourcedStore<Counter>,
        gets: AtomicUsize,
    }

    #[async_trait]
    impl Store<Counter> for CountingStore {
        async fn get(&self, id: Uuid) -> Result<Entity<Counter>, StoreError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(id).await
        }

        async fn save(
            &self,
            entity: &Entity<Counter>,
            ctx: &CommandContext,
            lock: &EntityLockGuard,
        ) -> Result<Saved<Counter>, StoreError> {
            self.inner.save(entity, ctx, lock).await
        }

        async fn purge(&self) -> Result<(), StoreError> {
            self.inner.purge().await
        }
    }

    fn cached(backends: &Backends, settings: StoreSettings) -> CachedStore<Counter, CountingStore> {
        CachedStore::new(
            CountingStore {
                inner: backends.store::<Counter>(10),
                gets: AtomicUsize::new(0),
            },
            &settings,
        )
    }

    fn gets(store: &CachedStore<Counter, CountingStore>) -> usize {
        store.inner().gets.load(Ordering::SeqCst)
    }

    async fn increment(
        backends: &Backends,
        store: &CachedStore<Counter, CountingStore>,
        id: Uuid,
    ) -> Saved<Counter> {
        let lock = backends.lock::<Counter>(id).await;
        let mut entity = store.get(id).await.expect("get");
        entity.raise(CounterEvent::Incremented);
        store
            .save(&entity, &CommandContext::default(), &lock)
            .await
            .expect("save")
    }

    #[tokio::test]
    async fn absent_entities_are_not_cached() {
        let backends = Backends::new();
        let store = cached(&backends, StoreSettings::default());
        let id = Uuid::new_v4();

        assert!(store.get(id).await.expect("get").is_new());
        assert!(store.get(id).await.expect("get").is_new());
        assert_eq!(gets(&store), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn saved_entity_is_served_from_cache() {
        let backends = Backends::new();
        let store = cached(&backends, StoreSettings::default());
        let id = Uuid::new_v4();
        increment(&backends, &store, id).await;
        let loads = gets(&store);

        let entity = store.get(id).await.expect("get");
        assert_eq!(entity.version(), 1);
        assert_eq!(entity.state().value, 1);
        assert_eq!(gets(&store), loads, "served without reloading");
    }

    #[tokio::test]
    async fn mutating_a_returned_entity_does_not_touch_the_cache() {
        let backends = Backends::new();
        let store = cached(&backends, StoreSettings::default());
        let id = Uuid::new_v4();
        increment(&backends, &store, id).await;

        let mut first = store.get(id).await.expect("get");
        first.raise(CounterEvent::Added { amount: 100 });

        let second = store.get(id).await.expect("get");
        assert_eq!(second.state().value, 1);
        assert!(second.uncommitted().is_empty());
    }

    #[tokio::test]
    async fn conflict_evicts_entry() {
        let backends = Backends::new();
        let store = cached(&backends, StoreSettings::default());
        let id = Uuid::new_v4();
        increment(&backends, &store, id).await;

        // A stale copy at version 0 loses the race for version 1.
        let mut stale = Entity::<Counter>::new(id);
        stale.raise(CounterEvent::Incremented);
        let lock = backends.lock::<Counter>(id).await;
        let result = store.save(&stale, &CommandContext::default(), &lock).await;
        assert!(matches!(result, Err(ref e) if e.is_concurrency()), "got: {result:?}");
        drop(lock);

        assert!(store.is_empty());
        assert_eq!(stale.uncommitted().len(), 1, "caller's entity untouched");
        let before = gets(&store);
        store.get(id).await.expect("get");
        assert_eq!(gets(&store), before + 1, "reloaded after eviction");
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_idle_period() {
        let backends = Backends::new();
        let settings =
            StoreSettings::default().with_cache_sliding_expiration(Duration::from_secs(60));
        let store = cached(&backends, settings);
        let id = Uuid::new_v4();
        increment(&backends, &store, id).await;
        let loads = gets(&store);

        tokio::time::advance(Duration::from_secs(45)).await;
        store.get(id).await.expect("get");
        assert_eq!(gets(&store), loads, "access within window slides expiry");

        tokio::time::advance(Duration::from_secs(45)).await;
        store.get(id).await.expect("get");
        assert_eq!(gets(&store), loads, "still within the slid window");

        tokio::time::advance(Duration::from_secs(61)).await;
        store.get(id).await.expect("get");
        assert_eq!(gets(&store), loads + 1, "expired entry reloaded");
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let backends = Backends::new();
        let store = cached(&backends, StoreSettings::default().with_cache_capacity(2));
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            increment(&backends, &store, *id).await;
        }
        assert_eq!(store.len(), 2);

        let before = gets(&store);
        store.get(ids[0]).await.expect("get");
        assert_eq!(gets(&store), before + 1, "oldest entry was evicted");
    }

    #[tokio::test]
    async fn purge_empties_cache_and_storage() {
        let backends = Backends::new();
        let store = cached(&backends, StoreSettings::default());
        let id = Uuid::new_v4();
        increment(&backends, &store, id).await;

        store.purge().await.expect("purge");
        assert!(store.is_empty());
        assert!(store.get(id).await.expect("get").is_new());
    }
}
