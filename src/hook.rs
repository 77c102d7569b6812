//! Ordered extension points around entity loads and saves.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::aggregate::EventSourced;
use crate::command::CommandContext;
use crate::entity::{Entity, EntityKey};
use crate::error::{HookError, StoreError};
use crate::event::Commit;
use crate::lock::EntityLockGuard;
use crate::store::{Saved, Store};

/// Which extension points a hook implements.
///
/// Declared up front so the pipeline never dispatches to a hook that would
/// do nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookCapabilities {
    pub pre_get: bool,
    pub post_get: bool,
    pub pre_save: bool,
    pub post_save: bool,
}

impl HookCapabilities {
    pub const NONE: Self = Self {
        pre_get: false,
        post_get: false,
        pre_save: false,
        post_save: false,
    };

    pub const ALL: Self = Self {
        pre_get: true,
        post_get: true,
        pre_save: true,
        post_save: true,
    };

    pub fn with_pre_get(mut self) -> Self {
        self.pre_get = true;
        self
    }

    pub fn with_post_get(mut self) -> Self {
        self.post_get = true;
        self
    }

    pub fn with_pre_save(mut self) -> Self {
        self.pre_save = true;
        self
    }

    pub fn with_post_save(mut self) -> Self {
        self.post_save = true;
        self
    }
}

/// An extension that runs around store operations for entities of type `T`.
///
/// Pre-hooks run in ascending `(order, name)`, post-hooks in the reverse of
/// that, so the first hook to set something up is the last to tear it down.
/// Only the methods flagged in [`capabilities`](PipelineHook::capabilities)
/// are ever called.
#[async_trait]
pub trait PipelineHook<T: EventSourced>: Send + Sync {
    /// Stable name, used as the ordering tie-breaker and in errors.
    fn name(&self) -> &str;

    fn order(&self) -> i32 {
        0
    }

    fn capabilities(&self) -> HookCapabilities;

    /// Before the entity is loaded. An error aborts the load.
    async fn pre_get(&self, _key: EntityKey) -> Result<(), HookError> {
        Ok(())
    }

    /// After the entity was loaded successfully.
    async fn post_get(&self, _entity: &Entity<T>) -> Result<(), HookError> {
        Ok(())
    }

    /// Before the entity is saved. An error aborts the save.
    async fn pre_save(&self, _entity: &Entity<T>, _ctx: &CommandContext) -> Result<(), HookError> {
        Ok(())
    }

    /// After every save attempt: the saved entity and its commit on
    /// success, the entity as submitted plus the error on failure.
    async fn post_save(
        &self,
        _entity: &Entity<T>,
        _commit: Option<&Commit>,
        _error: Option<&StoreError>,
    ) -> Result<(), HookError> {
        Ok(())
    }
}

/// A hook with the capabilities it declared when registered.
struct Registered<T: EventSourced> {
    capabilities: HookCapabilities,
    hook: Arc<dyn PipelineHook<T>>,
}

/// Store decorator running [`PipelineHook`]s around an inner store.
pub struct HookedStore<T: EventSourced, S> {
    inner: S,
    hooks: Vec<Registered<T>>,
}

impl<T: EventSourced, S> std::fmt::Debug for HookedStore<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.hooks.iter().map(|r| r.hook.name()).collect();
        f.debug_struct("HookedStore")
            .field("kind", &T::KIND)
            .field("hooks", &names)
            .finish()
    }
}

fn hook_failed<T: EventSourced>(hook: &dyn PipelineHook<T>, source: HookError) -> StoreError {
    StoreError::Hook {
        hook: hook.name().to_owned(),
        source,
    }
}

impl<T: EventSourced, S: Store<T>> HookedStore<T, S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            hooks: Vec::new(),
        }
    }

    /// Register a hook. Registration order does not matter.
    pub fn with_hook(mut self, hook: impl PipelineHook<T> + 'static) -> Self {
        self.register(Arc::new(hook));
        self
    }

    /// Register a hook. Its [`capabilities`](PipelineHook::capabilities)
    /// are read once, here.
    pub fn register(&mut self, hook: Arc<dyn PipelineHook<T>>) {
        self.hooks.push(Registered {
            capabilities: hook.capabilities(),
            hook,
        });
        self.hooks.sort_by(|a, b| {
            (a.hook.order(), a.hook.name()).cmp(&(b.hook.order(), b.hook.name()))
        });
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn ascending(
        &self,
        capable: impl Fn(HookCapabilities) -> bool,
    ) -> impl DoubleEndedIterator<Item = &Arc<dyn PipelineHook<T>>> {
        self.hooks
            .iter()
            .filter(move |r| capable(r.capabilities))
            .map(|r| &r.hook)
    }

    async fn run_post_save(
        &self,
        entity: &Entity<T>,
        commit: Option<&Commit>,
        error: Option<&StoreError>,
    ) -> Option<StoreError> {
        let mut first = None;
        for hook in self.ascending(|c| c.post_save).rev() {
            if let Err(source) = hook.post_save(entity, commit, error).await {
                let err = hook_failed(&**hook, source);
                if first.is_none() {
                    first = Some(err);
                } else {
                    tracing::warn!(
                        kind = T::KIND,
                        id = %entity.id(),
                        error = %err,
                        "additional post-save hook failure"
                    );
                }
            }
        }
        first
    }
}

#[async_trait]
impl<T, S> Store<T> for HookedStore<T, S>
where
    T: EventSourced,
    S: Store<T>,
{
    async fn get(&self, id: Uuid) -> Result<Entity<T>, StoreError> {
        let key = EntityKey::of::<T>(id);
        for hook in self.ascending(|c| c.pre_get) {
            hook.pre_get(key)
                .await
                .map_err(|source| hook_failed(&**hook, source))?;
        }

        let entity = self.inner.get(id).await?;

        let mut first = None;
        for hook in self.ascending(|c| c.post_get).rev() {
            if let Err(source) = hook.post_get(&entity).await {
                let err = hook_failed(&**hook, source);
                if first.is_none() {
                    first = Some(err);
                } else {
                    tracing::warn!(%key, error = %err, "additional post-get hook failure");
                }
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(entity),
        }
    }

    async fn save(
        &self,
        entity: &Entity<T>,
        ctx: &CommandContext,
        lock: &EntityLockGuard,
    ) -> Result<Saved<T>, StoreError> {
        let mut aborted = None;
        for hook in self.ascending(|c| c.pre_save) {
            if let Err(source) = hook.pre_save(entity, ctx).await {
                aborted = Some(hook_failed(&**hook, source));
                break;
            }
        }

        let result = match aborted {
            Some(err) => Err(err),
            None => self.inner.save(entity, ctx, lock).await,
        };

        let post_error = match &result {
            Ok(saved) => {
                self.run_post_save(&saved.entity, saved.commit.as_ref(), None)
                    .await
            }
            Err(err) => self.run_post_save(entity, None, Some(err)).await,
        };

        match (result, post_error) {
            (Err(err), Some(post)) => {
                tracing::warn!(
                    kind = T::KIND,
                    id = %entity.id(),
                    error = %post,
                    "post-save hook failed after save error"
                );
                Err(err)
            }
            (Err(err), None) => Err(err),
            (Ok(_), Some(post)) => Err(post),
            (Ok(saved), None) => Ok(saved),
        }
    }

    async fn purge(&self) -> Result<(), StoreError> {
        self.inner.purge().await
    }
}
