//! Event-sourced write side: aggregates and sagas persisted as commit
//! streams, with snapshots, entity locks, a caching and hook pipeline,
//! saga timeouts and a partitioned dispatcher.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use eventfold_domain::{
//!     Aggregate, CommandContext, EntityLockRegistry, EventSourced, EventSourcedStore,
//!     InMemoryCommitStore, InMemorySnapshotStore, Repository, StoreSettings,
//! };
//! use serde::{Deserialize, Serialize};
//! use uuid::Uuid;
//!
//! #[derive(Debug, Clone, Default, Serialize, Deserialize)]
//! struct Account {
//!     balance: u64,
//! }
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! #[serde(tag = "type", content = "data")]
//! enum AccountEvent {
//!     Deposited { amount: u64 },
//! }
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("deposit must be positive")]
//! struct ZeroDeposit;
//!
//! impl EventSourced for Account {
//!     const KIND: &'static str = "account";
//!     type Event = AccountEvent;
//!
//!     fn apply(mut self, event: &AccountEvent) -> Self {
//!         match event {
//!             AccountEvent::Deposited { amount } => self.balance += amount,
//!         }
//!         self
//!     }
//! }
//!
//! impl Aggregate for Account {
//!     type Command = u64;
//!     type Error = ZeroDeposit;
//!
//!     fn handle(&self, amount: u64) -> Result<Vec<AccountEvent>, ZeroDeposit> {
//!         if amount == 0 {
//!             return Err(ZeroDeposit);
//!         }
//!         Ok(vec![AccountEvent::Deposited { amount }])
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = EventSourcedStore::<Account>::new(
//!     Arc::new(InMemoryCommitStore::new()),
//!     Arc::new(InMemorySnapshotStore::new()),
//!     &StoreSettings::default(),
//! );
//! let accounts = Repository::new(store, EntityLockRegistry::new());
//!
//! let id = Uuid::new_v4();
//! let saved = accounts.execute(id, 25, &CommandContext::default()).await?;
//! assert_eq!(saved.entity.state().balance, 25);
//! assert_eq!(saved.entity.version(), 1);
//! # Ok(())
//! # }
//! ```

mod aggregate;
mod backoff;
mod cache;
mod command;
mod config;
mod entity;
mod error;
mod event;
mod hook;
mod lock;
mod partition;
mod repository;
mod saga;
mod saga_handler;
mod snapshot;
mod storage;
mod store;
mod timeout;

pub use aggregate::{Aggregate, EventSourced};
pub use backoff::{Backoff, RetryPolicy};
pub use cache::CachedStore;
pub use command::{CommandContext, CommandEnvelope};
pub use config::{
    MIN_TIMEOUT_CACHE_DURATION, SagaSettings, SchedulerSettings, Settings, StoreSettings,
};
pub use entity::{Entity, EntityKey};
pub use error::{CommitError, ExecuteError, HookError, LockError, SchedulerError, StoreError};
pub use event::{Commit, EventData, decode_event, encode_event, stream_id};
pub use hook::{HookCapabilities, HookedStore, PipelineHook};
pub use lock::{EntityLockGuard, EntityLockRegistry, LockOwner};
pub use partition::{PartitionedScheduler, hash_partition_key};
pub use repository::Repository;
pub use saga::{
    InMemoryTimeoutStore, Saga, SagaEvent, SagaInstance, SagaStore, SagaTimeout, TimeoutStore,
};
pub use saga_handler::{SagaEventHandler, SagaOutcome, TimeoutHandler, TimeoutRouter};
pub use snapshot::{FileSnapshotStore, InMemorySnapshotStore, Snapshot, SnapshotStore};
pub use storage::{CommitStore, FileCommitStore, InMemoryCommitStore};
pub use store::{EventSourcedStore, Saved, Store};
pub use timeout::{
    FAILURE_RETRY_DELAY, MAX_TIMER_DELAY, MIN_TIMER_DELAY, TimeoutCache, TimeoutDispatcher,
    TimeoutScheduler, TimeoutSchedulerHandle, timer_delay,
};
