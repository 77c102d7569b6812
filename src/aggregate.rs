//! Event-sourced entity traits.

use serde::{Serialize, de::DeserializeOwned};

/// An entity whose state is derived by folding its event stream.
///
/// The implementing type itself serves as the state. `Default` is the
/// factory for a never-persisted instance and `Clone` is the deep-copy
/// capability the caching layer relies on.
///
/// # Contract
///
/// - [`apply`](EventSourced::apply) must be a pure, total function. It takes
///   ownership of the current state and a reference to an event, returning
///   the next state.
/// - `Event` must use adjacently tagged serde
///   (`#[serde(tag = "type", content = "data")]`); stored events whose type
///   is unknown are skipped on replay for forward compatibility.
pub trait EventSourced:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Stable identifier for this entity type (e.g. "order"). Used in lock,
    /// cache and stream keys, so it must never change once data exists.
    const KIND: &'static str;

    /// The set of events this entity applies.
    type Event: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::Event) -> Self;

    /// Whether the entity has reached a terminal state. Completed entities
    /// are evicted from caches after saving.
    fn is_completed(&self) -> bool {
        false
    }
}

/// A domain aggregate: an event-sourced entity that decides on commands.
///
/// # Contract
///
/// [`handle`](Aggregate::handle) must be a pure decision function: no I/O,
/// no side effects. It validates a command against the current state and
/// returns zero or more events.
pub trait Aggregate: EventSourced {
    /// The set of commands this aggregate can handle.
    type Command: Send + 'static;

    /// Command rejection / validation error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate a command against the current state and produce events.
    ///
    /// Returns `Ok(vec![])` if the command is a no-op.
    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::Event>, Self::Error>;
}
