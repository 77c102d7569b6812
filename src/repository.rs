//! Lock-scoped units of work over an entity store.

use std::marker::PhantomData;

use uuid::Uuid;

use crate::aggregate::{Aggregate, EventSourced};
use crate::backoff::{RetryPolicy, retry_on_conflict};
use crate::command::CommandContext;
use crate::entity::{Entity, EntityKey};
use crate::error::{ExecuteError, StoreError};
use crate::lock::{EntityLockGuard, EntityLockRegistry, LockOwner};
use crate::store::{Saved, Store};

/// Entry point for mutating entities of type `T`.
///
/// Every mutation runs as one unit of work: acquire the entity lock, load,
/// change, save, release. The store `S` is usually the decorated chain
/// `HookedStore<CachedStore<EventSourcedStore>>`.
pub struct Repository<T: EventSourced, S> {
    store: S,
    locks: EntityLockRegistry,
    retry: RetryPolicy,
    _marker: PhantomData<fn() -> T>,
}

impl<T: EventSourced, S> std::fmt::Debug for Repository<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("kind", &T::KIND)
            .field("retry", &self.retry)
            .finish()
    }
}

impl<T: EventSourced, S: Store<T>> Repository<T, S> {
    /// Create a repository over `store`.
    ///
    /// Pass the same `locks` registry to every component that mutates `T`
    /// in this process; that is what serializes them.
    pub fn new(store: S, locks: EntityLockRegistry) -> Self {
        Self {
            store,
            locks,
            retry: RetryPolicy::default(),
            _marker: PhantomData,
        }
    }

    /// Override how [`execute`](Repository::execute) retries conflicts.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn locks(&self) -> &EntityLockRegistry {
        &self.locks
    }

    /// Load the current state of `id` without taking the lock.
    ///
    /// The result is a snapshot for reading; mutate only through the
    /// methods below.
    pub async fn get(&self, id: Uuid) -> Result<Entity<T>, StoreError> {
        self.store.get(id).await
    }

    /// Acquire the lock for `id` as a fresh unit of work.
    pub async fn lock(&self, id: Uuid) -> Result<EntityLockGuard, StoreError> {
        Ok(self
            .locks
            .acquire(LockOwner::new(), EntityKey::of::<T>(id))
            .await?)
    }

    /// Create the entity `id` by raising events on a fresh instance.
    ///
    /// # Arguments
    ///
    /// * `init` - Raises the initial events via [`Entity::raise`].
    ///
    /// # Errors
    ///
    /// * [`StoreError::AlreadyExists`] -- the entity already has commits.
    pub async fn create<F>(
        &self,
        id: Uuid,
        ctx: &CommandContext,
        init: F,
    ) -> Result<Saved<T>, StoreError>
    where
        F: FnOnce(&mut Entity<T>) + Send,
    {
        let lock = self.lock(id).await?;
        let mut entity = self.store.get(id).await?;
        if !entity.is_new() {
            return Err(StoreError::AlreadyExists { kind: T::KIND, id });
        }
        init(&mut entity);
        let saved = self.store.save(&entity, ctx, &lock).await?;
        lock.release()?;
        tracing::info!(kind = T::KIND, %id, "entity created");
        Ok(saved)
    }

    /// Return the entity `id`, creating it with `init` if it does not
    /// exist yet. The lock is held across the check and the save, so two
    /// callers never both create it.
    ///
    /// `commit` in the result is `None` when the entity already existed.
    pub async fn get_or_create<F>(
        &self,
        id: Uuid,
        ctx: &CommandContext,
        init: F,
    ) -> Result<Saved<T>, StoreError>
    where
        F: FnOnce(&mut Entity<T>) + Send,
    {
        let lock = self.lock(id).await?;
        let mut entity = self.store.get(id).await?;
        if !entity.is_new() {
            lock.release()?;
            return Ok(Saved {
                entity,
                commit: None,
            });
        }
        init(&mut entity);
        let saved = self.store.save(&entity, ctx, &lock).await?;
        lock.release()?;
        tracing::info!(kind = T::KIND, %id, "entity created");
        Ok(saved)
    }
}

impl<T, S> Repository<T, S>
where
    T: Aggregate,
    T::Command: Clone,
    S: Store<T>,
{
    /// Run `cmd` against the aggregate `id` and persist the resulting
    /// events.
    ///
    /// Concurrency conflicts (another process committed first) reload the
    /// aggregate and run the command again, backing off per the retry
    /// policy.
    ///
    /// # Returns
    ///
    /// The saved aggregate and its new commit. A command that produces no
    /// events saves nothing and returns `commit: None`.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Domain`] -- the aggregate rejected the command.
    /// * [`ExecuteError::Store`] -- loading or saving failed, including
    ///   [`StoreError::RetryExhausted`] when conflicts never resolved.
    pub async fn execute(
        &self,
        id: Uuid,
        cmd: T::Command,
        ctx: &CommandContext,
    ) -> Result<Saved<T>, ExecuteError<T::Error>> {
        let cmd = &cmd;
        retry_on_conflict(EntityKey::of::<T>(id), self.retry, move || {
            self.execute_once(id, cmd.clone(), ctx)
        })
        .await
    }

    #[tracing::instrument(level = "info", name = "execute", skip_all, fields(kind = T::KIND, %id))]
    async fn execute_once(
        &self,
        id: Uuid,
        cmd: T::Command,
        ctx: &CommandContext,
    ) -> Result<Saved<T>, ExecuteError<T::Error>> {
        let lock = self.lock(id).await?;
        let mut entity = self.store.get(id).await?;
        let events = entity.state().handle(cmd).map_err(ExecuteError::Domain)?;
        for event in events {
            entity.raise(event);
        }
        let saved = self.store.save(&entity, ctx, &lock).await?;
        lock.release().map_err(StoreError::from)?;
        Ok(saved)
    }
}
