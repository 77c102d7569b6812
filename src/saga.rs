//! Sagas: long-running, event-driven processes with optional timeouts.
//!
//! A saga is event sourced through the same store stack as aggregates. The
//! events it reacts to are recorded in its own stream wrapped in
//! [`SagaEvent`], and the time at which it wants to be woken up is mirrored
//! into a [`TimeoutStore`] so a scheduler can find it without loading every
//! saga.

use std::collections::HashMap;
use std::io;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::aggregate::EventSourced;
use crate::command::{CommandContext, CommandEnvelope};
use crate::entity::Entity;
use crate::error::StoreError;
use crate::lock::EntityLockGuard;
use crate::store::{Saved, Store};

/// A long-running process that reacts to events by issuing commands.
///
/// # Contract
///
/// - [`handle`](Saga::handle) decides which commands to issue; it must not
///   perform I/O. [`apply`](Saga::apply) then records the event.
/// - [`timeout`](Saga::timeout) is the instant the saga next wants to be
///   woken, if any. It is read after every save.
pub trait Saga: Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable type tag, as for [`EventSourced::KIND`].
    const KIND: &'static str;

    /// Events this saga reacts to.
    type Event: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Id of the saga instance `event` belongs to.
    fn correlation_id(event: &Self::Event) -> Uuid;

    /// Whether `event` starts a new saga instance when none exists.
    fn is_start(event: &Self::Event) -> bool;

    /// Commands to issue in reaction to `event`.
    fn handle(&self, event: &Self::Event) -> Vec<CommandEnvelope>;

    fn apply(self, event: &Self::Event) -> Self;

    /// Commands to issue when the timeout scheduled for `scheduled` fires.
    fn handle_timeout(&self, _scheduled: DateTime<Utc>) -> Vec<CommandEnvelope> {
        Vec::new()
    }

    /// Record that the timeout scheduled for `scheduled` fired. Usually
    /// clears or moves [`timeout`](Saga::timeout).
    fn apply_timeout(self, _scheduled: DateTime<Utc>) -> Self {
        self
    }

    fn timeout(&self) -> Option<DateTime<Utc>>;

    fn is_completed(&self) -> bool;
}

/// What gets recorded in a saga's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent<E> {
    /// An event the saga handled.
    Event(E),
    /// The timeout scheduled for `scheduled` fired.
    TimeoutElapsed { scheduled: DateTime<Utc> },
}

/// Adapts a [`Saga`] to [`EventSourced`] so it can be stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SagaInstance<S> {
    pub saga: S,
}

impl<S: Saga> EventSourced for SagaInstance<S> {
    const KIND: &'static str = S::KIND;

    type Event = SagaEvent<S::Event>;

    fn apply(self, event: &Self::Event) -> Self {
        let saga = match event {
            SagaEvent::Event(e) => self.saga.apply(e),
            SagaEvent::TimeoutElapsed { scheduled } => self.saga.apply_timeout(*scheduled),
        };
        Self { saga }
    }

    fn is_completed(&self) -> bool {
        self.saga.is_completed()
    }
}

/// A scheduled wake-up for one saga.
///
/// Ordered by `timeout`; the timeout cache breaks ties by insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaTimeout {
    pub kind: String,
    pub id: Uuid,
    /// Saga version that scheduled it.
    pub version: u64,
    pub timeout: DateTime<Utc>,
}

/// Durable index of pending saga timeouts, one per saga.
#[async_trait]
pub trait TimeoutStore: Send + Sync {
    /// All timeouts strictly before `before`, earliest first.
    async fn get_scheduled_timeouts(&self, before: DateTime<Utc>) -> io::Result<Vec<SagaTimeout>>;

    /// Insert or replace the timeout of `timeout.kind`/`timeout.id`.
    async fn upsert(&self, timeout: &SagaTimeout) -> io::Result<()>;

    async fn remove(&self, kind: &str, id: Uuid) -> io::Result<()>;

    async fn purge(&self) -> io::Result<()>;
}

/// Process-local [`TimeoutStore`].
#[derive(Debug, Default)]
pub struct InMemoryTimeoutStore {
    timeouts: Mutex<HashMap<(String, Uuid), SagaTimeout>>,
}

impl InMemoryTimeoutStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.timeouts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TimeoutStore for InMemoryTimeoutStore {
    async fn get_scheduled_timeouts(&self, before: DateTime<Utc>) -> io::Result<Vec<SagaTimeout>> {
        let timeouts = self.timeouts.lock().unwrap_or_else(PoisonError::into_inner);
        let mut due: Vec<SagaTimeout> = timeouts
            .values()
            .filter(|t| t.timeout < before)
            .cloned()
            .collect();
        due.sort_by_key(|t| t.timeout);
        Ok(due)
    }

    async fn upsert(&self, timeout: &SagaTimeout) -> io::Result<()> {
        self.timeouts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((timeout.kind.clone(), timeout.id), timeout.clone());
        Ok(())
    }

    async fn remove(&self, kind: &str, id: Uuid) -> io::Result<()> {
        self.timeouts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(kind.to_owned(), id));
        Ok(())
    }

    async fn purge(&self) -> io::Result<()> {
        self.timeouts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

/// Saga persistence: an entity store for [`SagaInstance<S>`] plus the
/// durable timeout index it keeps in step.
pub struct SagaStore<S: Saga, St> {
    store: St,
    timeouts: Arc<dyn TimeoutStore>,
    _marker: PhantomData<fn() -> S>,
}

impl<S: Saga, St> std::fmt::Debug for SagaStore<S, St> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaStore").field("kind", &S::KIND).finish()
    }
}

impl<S, St> SagaStore<S, St>
where
    S: Saga,
    St: Store<SagaInstance<S>>,
{
    pub fn new(store: St, timeouts: Arc<dyn TimeoutStore>) -> Self {
        Self {
            store,
            timeouts,
            _marker: PhantomData,
        }
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    /// A fresh, unsaved saga instance.
    pub fn create_saga(&self, id: Uuid) -> Entity<SagaInstance<S>> {
        Entity::new(id)
    }

    /// The saga `id`, or `None` if it was never saved.
    pub async fn try_get_saga(
        &self,
        id: Uuid,
    ) -> Result<Option<Entity<SagaInstance<S>>>, StoreError> {
        let saga = self.store.get(id).await?;
        Ok((!saga.is_new()).then_some(saga))
    }

    /// Pending timeouts of this saga type due before `before`.
    pub async fn get_scheduled_timeouts(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<SagaTimeout>, StoreError> {
        let mut timeouts = self.timeouts.get_scheduled_timeouts(before).await?;
        timeouts.retain(|t| t.kind == S::KIND);
        Ok(timeouts)
    }

    /// Save the saga and bring its durable timeout in line with it.
    pub async fn save(
        &self,
        saga: &Entity<SagaInstance<S>>,
        ctx: &CommandContext,
        lock: &EntityLockGuard,
    ) -> Result<Saved<SagaInstance<S>>, StoreError> {
        let saved = self.store.save(saga, ctx, lock).await?;
        if !saved.entity.is_new() {
            self.sync_timeout(&saved.entity).await?;
        }
        Ok(saved)
    }

    async fn sync_timeout(&self, saga: &Entity<SagaInstance<S>>) -> Result<(), StoreError> {
        match scheduled_timeout(saga) {
            Some(timeout) => {
                tracing::debug!(
                    kind = S::KIND,
                    id = %saga.id(),
                    at = %timeout.timeout,
                    "timeout stored"
                );
                self.timeouts.upsert(&timeout).await?;
            }
            None => self.timeouts.remove(S::KIND, saga.id()).await?,
        }
        Ok(())
    }

    /// Delete every saga of every type and all pending timeouts.
    pub async fn purge(&self) -> Result<(), StoreError> {
        self.store.purge().await?;
        self.timeouts.purge().await?;
        Ok(())
    }
}

/// The timeout `saga` currently wants, if it is still running.
pub(crate) fn scheduled_timeout<S: Saga>(saga: &Entity<SagaInstance<S>>) -> Option<SagaTimeout> {
    if saga.is_completed() {
        return None;
    }
    saga.state().saga.timeout().map(|timeout| SagaTimeout {
        kind: S::KIND.to_owned(),
        id: saga.id(),
        version: saga.version(),
        timeout,
    })
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::{Reminder, ReminderEvent};
    use super::*;
    use crate::entity::EntityKey;
    use crate::event::{decode_event, encode_event};
    use crate::store::EventSourcedStore;
    use crate::store::test_support::Backends;
    use chrono::TimeDelta;

    type Reminders = SagaStore<Reminder, EventSourcedStore<SagaInstance<Reminder>>>;

    fn saga_store(backends: &Backends, timeouts: &Arc<InMemoryTimeoutStore>) -> Reminders {
        SagaStore::new(backends.store(10), timeouts.clone())
    }

    #[test]
    fn saga_events_roundtrip_through_commit_encoding() {
        let scheduled = Utc::now();
        let event = SagaEvent::<ReminderEvent>::TimeoutElapsed { scheduled };
        let data = encode_event::<SagaInstance<Reminder>>(&event).expect("encode");
        assert_eq!(data.event_type, "TimeoutElapsed");
        assert_eq!(decode_event::<SagaInstance<Reminder>>(&data), Some(event));

        let wrapped = SagaEvent::Event(ReminderEvent::Cancelled {
            reminder_id: Uuid::nil(),
        });
        let data = encode_event::<SagaInstance<Reminder>>(&wrapped).expect("encode");
        assert_eq!(decode_event::<SagaInstance<Reminder>>(&data), Some(wrapped));
    }

    #[tokio::test]
    async fn try_get_unknown_saga_is_none() {
        let backends = Backends::new();
        let timeouts = Arc::new(InMemoryTimeoutStore::new());
        let store = saga_store(&backends, &timeouts);
        assert!(store.try_get_saga(Uuid::new_v4()).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn save_mirrors_timeout_into_timeout_store() {
        let backends = Backends::new();
        let timeouts = Arc::new(InMemoryTimeoutStore::new());
        let store = saga_store(&backends, &timeouts);
        let id = Uuid::new_v4();
        let due = Utc::now() + TimeDelta::minutes(1);

        let lock = backends.lock::<SagaInstance<Reminder>>(id).await;
        let mut saga = store.create_saga(id);
        saga.raise(SagaEvent::Event(ReminderEvent::Requested {
            reminder_id: id,
            due,
        }));
        let saved = store
            .save(&saga, &CommandContext::default(), &lock)
            .await
            .expect("save");

        let pending = store
            .get_scheduled_timeouts(due + TimeDelta::seconds(1))
            .await
            .expect("timeouts");
        assert_eq!(
            pending,
            vec![SagaTimeout {
                kind: "reminder".to_owned(),
                id,
                version: 1,
                timeout: due,
            }]
        );
        assert!(
            store
                .get_scheduled_timeouts(due)
                .await
                .expect("timeouts")
                .is_empty(),
            "bound is exclusive"
        );

        let mut saga = saved.entity;
        saga.raise(SagaEvent::Event(ReminderEvent::Cancelled { reminder_id: id }));
        let saved = store
            .save(&saga, &CommandContext::default(), &lock)
            .await
            .expect("save");
        assert!(saved.entity.is_completed());
        assert!(timeouts.is_empty(), "completed saga has no timeout");
    }

    #[tokio::test]
    async fn timeouts_of_other_saga_types_are_filtered() {
        let backends = Backends::new();
        let timeouts = Arc::new(InMemoryTimeoutStore::new());
        let store = saga_store(&backends, &timeouts);
        let soon = Utc::now();
        timeouts
            .upsert(&SagaTimeout {
                kind: "shipment".to_owned(),
                id: Uuid::new_v4(),
                version: 3,
                timeout: soon,
            })
            .await
            .expect("upsert");

        let pending = store
            .get_scheduled_timeouts(soon + TimeDelta::hours(1))
            .await
            .expect("timeouts");
        assert!(pending.is_empty());
        assert_eq!(timeouts.len(), 1);
    }

    #[tokio::test]
    async fn purge_removes_sagas_and_timeouts() {
        let backends = Backends::new();
        let timeouts = Arc::new(InMemoryTimeoutStore::new());
        let store = saga_store(&backends, &timeouts);
        let id = Uuid::new_v4();

        let lock = backends.lock::<SagaInstance<Reminder>>(id).await;
        let mut saga = store.create_saga(id);
        saga.raise(SagaEvent::Event(ReminderEvent::Requested {
            reminder_id: id,
            due: Utc::now(),
        }));
        store
            .save(&saga, &CommandContext::default(), &lock)
            .await
            .expect("save");
        assert_eq!(timeouts.len(), 1);

        store.purge().await.expect("purge");
        assert!(timeouts.is_empty());
        assert!(store.try_get_saga(id).await.expect("get").is_none());
        assert_eq!(EntityKey::of::<SagaInstance<Reminder>>(id).kind, "reminder");
    }
}
