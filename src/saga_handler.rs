//! Saga event and timeout handling.
//!
//! Each event or elapsed timeout is one unit of work on one saga instance:
//! lock, load (or start), decide, record, save, reschedule. Concurrency
//! conflicts replay the whole unit with backoff.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::backoff::{RetryPolicy, retry_on_conflict};
use crate::command::{CommandContext, CommandEnvelope};
use crate::config::SagaSettings;
use crate::entity::{Entity, EntityKey};
use crate::error::StoreError;
use crate::event::{Commit, stream_id};
use crate::lock::{EntityLockRegistry, LockOwner};
use crate::saga::{Saga, SagaEvent, SagaInstance, SagaStore, SagaTimeout, scheduled_timeout};
use crate::store::Store;
use crate::timeout::{TimeoutCache, TimeoutDispatcher};

/// Result of handing one event or timeout to a saga.
pub enum SagaOutcome<S: Saga> {
    /// No saga instance applies (not found and not a start event), or the
    /// timeout is stale.
    Ignored,
    Handled {
        saga: Entity<SagaInstance<S>>,
        /// `None` when the save was a redelivered duplicate.
        commit: Option<Commit>,
        /// Commands for the dispatch layer. Empty for duplicates.
        commands: Vec<CommandEnvelope>,
    },
}

impl<S: Saga> std::fmt::Debug for SagaOutcome<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SagaOutcome::Ignored => f.write_str("Ignored"),
            SagaOutcome::Handled {
                saga,
                commit,
                commands,
            } => f
                .debug_struct("Handled")
                .field("id", &saga.id())
                .field("version", &saga.version())
                .field("commit", &commit.as_ref().map(|c| c.commit_id))
                .field("commands", &commands.len())
                .finish(),
        }
    }
}

impl<S: Saga> SagaOutcome<S> {
    pub fn is_ignored(&self) -> bool {
        matches!(self, SagaOutcome::Ignored)
    }

    /// Commands produced, consuming the outcome.
    pub fn into_commands(self) -> Vec<CommandEnvelope> {
        match self {
            SagaOutcome::Ignored => Vec::new(),
            SagaOutcome::Handled { commands, .. } => commands,
        }
    }
}

enum Trigger<'a, E> {
    Event(&'a E),
    Timeout(&'a SagaTimeout),
}

impl<E> Clone for Trigger<'_, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for Trigger<'_, E> {}

impl<E> Trigger<'_, E> {
    fn name(&self) -> &'static str {
        match self {
            Trigger::Event(_) => "event",
            Trigger::Timeout(_) => "timeout",
        }
    }
}

/// Routes events and elapsed timeouts into sagas of type `S`.
pub struct SagaEventHandler<S: Saga, St> {
    store: SagaStore<S, St>,
    locks: EntityLockRegistry,
    timeouts: Arc<TimeoutCache>,
    retry: RetryPolicy,
}

impl<S: Saga, St> std::fmt::Debug for SagaEventHandler<S, St> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaEventHandler")
            .field("kind", &S::KIND)
            .field("retry", &self.retry)
            .finish()
    }
}

impl<S, St> SagaEventHandler<S, St>
where
    S: Saga,
    St: Store<SagaInstance<S>>,
{
    /// Create a handler.
    ///
    /// `locks` must be the registry every other writer of these sagas
    /// uses, and `timeouts` the cache the process's [`TimeoutScheduler`]
    /// drains.
    ///
    /// [`TimeoutScheduler`]: crate::TimeoutScheduler
    pub fn new(
        store: SagaStore<S, St>,
        locks: EntityLockRegistry,
        timeouts: Arc<TimeoutCache>,
        settings: &SagaSettings,
    ) -> Self {
        Self {
            store,
            locks,
            timeouts,
            retry: RetryPolicy::from(settings),
        }
    }

    pub fn store(&self) -> &SagaStore<S, St> {
        &self.store
    }

    /// Hand `event` to the saga it correlates with.
    ///
    /// # Errors
    ///
    /// Any [`StoreError`] from loading or saving the saga, including
    /// [`StoreError::RetryExhausted`] when conflicts outlast the retry
    /// budget.
    pub async fn handle(
        &self,
        event: &S::Event,
        ctx: &CommandContext,
    ) -> Result<SagaOutcome<S>, StoreError> {
        let id = S::correlation_id(event);
        retry_on_conflict(EntityKey::new(S::KIND, id), self.retry, move || {
            self.handle_once(id, Trigger::Event(event), ctx)
        })
        .await
    }

    /// Fire `timeout` on its saga. Stale timeouts (the saga has since
    /// moved or cleared its timeout) are ignored.
    pub async fn handle_timeout(
        &self,
        timeout: &SagaTimeout,
        ctx: &CommandContext,
    ) -> Result<SagaOutcome<S>, StoreError> {
        let id = timeout.id;
        retry_on_conflict(EntityKey::new(S::KIND, id), self.retry, move || {
            self.handle_once(id, Trigger::Timeout(timeout), ctx)
        })
        .await
    }

    #[tracing::instrument(
        level = "debug",
        name = "saga",
        skip_all,
        fields(kind = S::KIND, %id, trigger = trigger.name())
    )]
    async fn handle_once(
        &self,
        id: Uuid,
        trigger: Trigger<'_, S::Event>,
        ctx: &CommandContext,
    ) -> Result<SagaOutcome<S>, StoreError> {
        let lock = self
            .locks
            .acquire(LockOwner::new(), EntityKey::new(S::KIND, id))
            .await?;

        let mut saga = match self.store.try_get_saga(id).await? {
            Some(saga) => saga,
            None if matches!(trigger, Trigger::Event(event) if S::is_start(event)) => {
                tracing::info!("saga started");
                self.store.create_saga(id)
            }
            None => {
                tracing::warn!("no saga instance; ignored");
                lock.release()?;
                return Ok(SagaOutcome::Ignored);
            }
        };

        if saga.is_completed() {
            tracing::warn!(version = saga.version(), "saga already completed; ignored");
            lock.release()?;
            return Ok(SagaOutcome::Ignored);
        }

        let commands = match trigger {
            Trigger::Event(event) => {
                let commands = saga.state().saga.handle(event);
                saga.raise(SagaEvent::Event(event.clone()));
                commands
            }
            Trigger::Timeout(timeout) => {
                if saga.state().saga.timeout() != Some(timeout.timeout) {
                    tracing::warn!(scheduled = %timeout.timeout, "stale saga timeout; ignored");
                    lock.release()?;
                    return Ok(SagaOutcome::Ignored);
                }
                let commands = saga.state().saga.handle_timeout(timeout.timeout);
                saga.raise(SagaEvent::TimeoutElapsed {
                    scheduled: timeout.timeout,
                });
                commands
            }
        };

        let cleared = self.timeouts.clear_timeout(S::KIND, id);
        let saved = match self.store.save(&saga, ctx, &lock).await {
            Ok(saved) => saved,
            Err(e) => {
                // Nothing was stored, so the old timeout still stands.
                if let Some(pending) = cleared {
                    self.timeouts.schedule_timeout(pending);
                }
                return Err(e);
            }
        };
        if let Some(next) = scheduled_timeout(&saved.entity) {
            self.timeouts.schedule_timeout(next);
        }
        lock.release()?;

        let commands = if saved.commit.is_some() {
            commands
        } else {
            tracing::debug!("duplicate delivery; no commands issued");
            Vec::new()
        };
        Ok(SagaOutcome::Handled {
            saga: saved.entity,
            commit: saved.commit,
            commands,
        })
    }
}

/// Type-erased receiver of elapsed timeouts for one saga kind.
#[async_trait]
pub trait TimeoutHandler: Send + Sync {
    /// Fire `timeout` and return the commands its saga issued.
    async fn handle_timeout(
        &self,
        timeout: &SagaTimeout,
    ) -> Result<Vec<CommandEnvelope>, StoreError>;
}

/// Context a fired timeout is saved under. The command id is derived from
/// the saga version that scheduled it, so a timeout redelivered after a
/// crash is detected as a duplicate commit.
fn timeout_context(timeout: &SagaTimeout) -> CommandContext {
    let name = format!("timeout/{}/{}", timeout.version, timeout.timeout.to_rfc3339());
    let command_id = Uuid::new_v5(&stream_id(&timeout.kind, timeout.id), name.as_bytes());
    CommandContext::default()
        .with_correlation_id(timeout.id.to_string())
        .with_command_id(command_id)
        .with_header("trigger", "timeout")
}

#[async_trait]
impl<S, St> TimeoutHandler for SagaEventHandler<S, St>
where
    S: Saga,
    St: Store<SagaInstance<S>>,
{
    async fn handle_timeout(
        &self,
        timeout: &SagaTimeout,
    ) -> Result<Vec<CommandEnvelope>, StoreError> {
        let ctx = timeout_context(timeout);
        let outcome = SagaEventHandler::handle_timeout(self, timeout, &ctx).await?;
        Ok(outcome.into_commands())
    }
}

/// [`TimeoutDispatcher`] that routes each timeout to the handler registered
/// for its saga kind and forwards the resulting commands to an outbox.
pub struct TimeoutRouter {
    handlers: HashMap<String, Arc<dyn TimeoutHandler>>,
    outbox: mpsc::UnboundedSender<CommandEnvelope>,
}

impl std::fmt::Debug for TimeoutRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("TimeoutRouter").field("kinds", &kinds).finish()
    }
}

impl TimeoutRouter {
    /// Create a router and the receiving end of its command outbox.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CommandEnvelope>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        let router = Self {
            handlers: HashMap::new(),
            outbox,
        };
        (router, rx)
    }

    /// Route timeouts of saga `kind` to `handler`, replacing any previous
    /// registration.
    pub fn register(mut self, kind: impl Into<String>, handler: Arc<dyn TimeoutHandler>) -> Self {
        self.handlers.insert(kind.into(), handler);
        self
    }

    /// Shorthand for registering a [`SagaEventHandler`] under its saga kind.
    pub fn register_saga<S, St>(self, handler: Arc<SagaEventHandler<S, St>>) -> Self
    where
        S: Saga,
        St: Store<SagaInstance<S>> + 'static,
    {
        self.register(S::KIND, handler)
    }
}

#[async_trait]
impl TimeoutDispatcher for TimeoutRouter {
    async fn dispatch(&self, timeout: &SagaTimeout) -> Result<(), StoreError> {
        let Some(handler) = self.handlers.get(&timeout.kind) else {
            tracing::warn!(
                kind = %timeout.kind,
                id = %timeout.id,
                "no handler for saga timeout; dropped"
            );
            return Ok(());
        };
        let commands = handler.handle_timeout(timeout).await?;
        for command in commands {
            if self.outbox.send(command).is_err() {
                tracing::warn!(kind = %timeout.kind, id = %timeout.id, "command outbox closed");
                break;
            }
        }
        Ok(())
    }
}
