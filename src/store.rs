//! The entity store contract and its event-sourced implementation.
//!
//! [`EventSourcedStore`] rebuilds an entity from its newest snapshot plus
//! the commit tail, and saves raised events as the next commit under
//! optimistic concurrency. Decorators ([`CachedStore`](crate::CachedStore),
//! [`HookedStore`](crate::HookedStore)) implement the same [`Store`] trait
//! and wrap it.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::aggregate::EventSourced;
use crate::command::CommandContext;
use crate::config::StoreSettings;
use crate::entity::{Entity, EntityKey};
use crate::error::{CommitError, StoreError};
use crate::event::{Commit, decode_event, encode_event};
use crate::lock::EntityLockGuard;
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::storage::CommitStore;

/// Result of a successful save.
#[derive(Clone)]
pub struct Saved<T: EventSourced> {
    /// The entity as stored: version bumped, no uncommitted events.
    pub entity: Entity<T>,
    /// The new commit, for downstream event dispatch. `None` when nothing
    /// new was stored: either no events were raised, or the commit turned
    /// out to be a duplicate of one already stored.
    pub commit: Option<Commit>,
}

impl<T: EventSourced> std::fmt::Debug for Saved<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Saved")
            .field("id", &self.entity.id())
            .field("version", &self.entity.version())
            .field("commit", &self.commit.as_ref().map(|c| c.commit_id))
            .finish()
    }
}

/// Load and save entities of type `T`.
#[async_trait]
pub trait Store<T: EventSourced>: Send + Sync {
    /// Rebuild the entity `id`. An entity that was never saved comes back
    /// with version 0.
    async fn get(&self, id: Uuid) -> Result<Entity<T>, StoreError>;

    /// Persist the events raised on `entity` as its next commit.
    ///
    /// `lock` must be the caller's guard for this entity; the lock is held
    /// for the whole save so the version check is observed by every other
    /// writer in the process.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Lock`] if `lock` does not cover the entity.
    /// - [`StoreError::Concurrency`] if another writer already used the
    ///   version; reload and re-apply.
    async fn save(
        &self,
        entity: &Entity<T>,
        ctx: &CommandContext,
        lock: &EntityLockGuard,
    ) -> Result<Saved<T>, StoreError>;

    /// Delete all durable state (and anything cached from it).
    async fn purge(&self) -> Result<(), StoreError>;
}

#[async_trait]
impl<T, S> Store<T> for Arc<S>
where
    T: EventSourced,
    S: Store<T> + ?Sized,
{
    async fn get(&self, id: Uuid) -> Result<Entity<T>, StoreError> {
        (**self).get(id).await
    }

    async fn save(
        &self,
        entity: &Entity<T>,
        ctx: &CommandContext,
        lock: &EntityLockGuard,
    ) -> Result<Saved<T>, StoreError> {
        (**self).save(entity, ctx, lock).await
    }

    async fn purge(&self) -> Result<(), StoreError> {
        (**self).purge().await
    }
}

/// Snapshot-accelerated, optimistically concurrent event-sourced store.
pub struct EventSourcedStore<T> {
    commits: Arc<dyn CommitStore>,
    snapshots: Arc<dyn SnapshotStore>,
    snapshot_interval: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for EventSourcedStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSourcedStore")
            .field("snapshot_interval", &self.snapshot_interval)
            .finish()
    }
}

impl<T: EventSourced> EventSourcedStore<T> {
    pub fn new(
        commits: Arc<dyn CommitStore>,
        snapshots: Arc<dyn SnapshotStore>,
        settings: &StoreSettings,
    ) -> Self {
        Self {
            commits,
            snapshots,
            snapshot_interval: settings.snapshot_interval,
            _marker: PhantomData,
        }
    }

    /// Starting point for replay: the newest readable snapshot, or a fresh
    /// instance.
    async fn replay_base(&self, key: EntityKey) -> Result<Entity<T>, StoreError> {
        let Some(snapshot) = self.snapshots.get_snapshot(key, u64::MAX).await? else {
            return Ok(Entity::new(key.id));
        };

        match serde_json::from_value::<T>(snapshot.state) {
            Ok(state) => Ok(Entity::from_parts(
                key.id,
                snapshot.version,
                snapshot.version,
                state,
            )),
            Err(e) => {
                tracing::warn!(
                    %key,
                    version = snapshot.version,
                    error = %e,
                    "snapshot state unreadable; replaying full stream"
                );
                Ok(Entity::new(key.id))
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(kind = T::KIND))]
    async fn load(&self, id: Uuid) -> Result<Entity<T>, StoreError> {
        let key = EntityKey::of::<T>(id);
        let mut entity = self.replay_base(key).await?;
        let base = entity.version();

        let tail = self.commits.get_stream(key.stream_id(), base + 1).await?;
        for commit in &tail {
            let expected = entity.version() + 1;
            if commit.version != expected {
                return Err(StoreError::CorruptStream {
                    kind: T::KIND,
                    id,
                    expected,
                    actual: commit.version,
                });
            }
            for data in &commit.events {
                if let Some(event) = decode_event::<T>(data) {
                    entity.apply(&event);
                }
            }
            entity.set_version(commit.version);
        }

        tracing::debug!(
            snapshot_version = base,
            replayed = tail.len(),
            version = entity.version(),
            "entity rebuilt"
        );
        Ok(entity)
    }

    async fn write_snapshot(&self, entity: &Entity<T>) -> Result<(), StoreError> {
        let snapshot = Snapshot {
            kind: T::KIND.to_owned(),
            id: entity.id(),
            version: entity.version(),
            state: serde_json::to_value(entity.state())?,
        };
        self.snapshots.save(&snapshot).await?;
        Ok(())
    }

    fn snapshot_due(&self, entity: &Entity<T>) -> bool {
        self.snapshot_interval > 0
            && entity.version() - entity.snapshot_version() >= self.snapshot_interval
    }

    #[tracing::instrument(level = "debug", skip_all, fields(kind = T::KIND, id = %entity.id()))]
    async fn append(
        &self,
        entity: &Entity<T>,
        ctx: &CommandContext,
    ) -> Result<Saved<T>, StoreError> {
        if entity.uncommitted().is_empty() {
            return Ok(Saved {
                entity: entity.clone(),
                commit: None,
            });
        }

        let key = entity.key();
        let events = entity
            .uncommitted()
            .iter()
            .map(encode_event::<T>)
            .collect::<Result<Vec<_>, _>>()?;
        let commit = Commit {
            commit_id: ctx.command_id.unwrap_or_else(Uuid::new_v4),
            stream_id: key.stream_id(),
            version: entity.version() + 1,
            timestamp: Utc::now(),
            headers: ctx.commit_headers(T::KIND),
            events,
        };

        match self.commits.save(&commit).await {
            Ok(()) => {}
            Err(CommitError::Duplicate { commit_id, .. }) => {
                tracing::info!(%commit_id, "commit already stored; skipping");
                let current = self.load(key.id).await?;
                return Ok(Saved {
                    entity: current,
                    commit: None,
                });
            }
            Err(CommitError::Conflict { version, head, .. }) => {
                tracing::debug!(version, head, "commit version already taken");
                return Err(StoreError::Concurrency {
                    kind: T::KIND,
                    id: key.id,
                    version,
                });
            }
            Err(e) => return Err(e.into()),
        }

        let mut saved = entity.clone().committed(commit.version);
        tracing::info!(
            version = commit.version,
            events = commit.events.len(),
            "commit appended"
        );

        if self.snapshot_due(&saved) {
            match self.write_snapshot(&saved).await {
                Ok(()) => {
                    tracing::info!(version = saved.version(), "snapshot saved");
                    let version = saved.version();
                    saved = saved.with_snapshot_version(version);
                }
                Err(e) => {
                    tracing::warn!(
                        version = saved.version(),
                        error = %e,
                        "snapshot save failed; continuing"
                    );
                }
            }
        }

        Ok(Saved {
            entity: saved,
            commit: Some(commit),
        })
    }
}

#[async_trait]
impl<T: EventSourced> Store<T> for EventSourcedStore<T> {
    async fn get(&self, id: Uuid) -> Result<Entity<T>, StoreError> {
        self.load(id).await
    }

    async fn save(
        &self,
        entity: &Entity<T>,
        ctx: &CommandContext,
        lock: &EntityLockGuard,
    ) -> Result<Saved<T>, StoreError> {
        lock.ensure_covers(entity.key())?;
        self.append(entity, ctx).await
    }

    async fn purge(&self) -> Result<(), StoreError> {
        self.commits.purge().await?;
        self.snapshots.purge().await?;
        Ok(())
    }
}
