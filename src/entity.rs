//! Entity identity and the versioned in-memory instance.

use std::fmt;

use uuid::Uuid;

use crate::aggregate::EventSourced;
use crate::event::stream_id;

/// Identity of an entity: its kind tag plus a 128-bit id.
///
/// Used as the key for entity locks, caches and timeout indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub kind: &'static str,
    pub id: Uuid,
}

impl EntityKey {
    pub fn new(kind: &'static str, id: Uuid) -> Self {
        Self { kind, id }
    }

    /// Key of the entity of type `T` with the given id.
    pub fn of<T: EventSourced>(id: Uuid) -> Self {
        Self { kind: T::KIND, id }
    }

    /// The durable stream this entity's commits live in.
    pub fn stream_id(&self) -> Uuid {
        stream_id(self.kind, self.id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// A reconstructed entity: state, committed version, and the events raised
/// since it was loaded.
///
/// Version 0 means the entity has never been persisted. Instances are
/// mutated through [`raise`](Entity::raise) only, and only while the
/// entity's lock is held; saving turns the raised events into the next
/// commit.
#[derive(Debug, Clone)]
pub struct Entity<T: EventSourced> {
    id: Uuid,
    version: u64,
    snapshot_version: u64,
    state: T,
    uncommitted: Vec<T::Event>,
}

impl<T: EventSourced> Entity<T> {
    /// A fresh, never-persisted instance.
    pub fn new(id: Uuid) -> Self {
        Self::from_parts(id, 0, 0, T::default())
    }

    pub(crate) fn from_parts(id: Uuid, version: u64, snapshot_version: u64, state: T) -> Self {
        Self {
            id,
            version,
            snapshot_version,
            state,
            uncommitted: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::of::<T>(self.id)
    }

    /// Version of the last commit folded into this instance.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Version of the snapshot this instance was rebuilt from, or of the
    /// last snapshot written for it (0 if none).
    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version
    }

    pub fn state(&self) -> &T {
        &self.state
    }

    /// `true` until the first commit is stored.
    pub fn is_new(&self) -> bool {
        self.version == 0
    }

    pub fn is_completed(&self) -> bool {
        self.state.is_completed()
    }

    /// Events raised since the entity was loaded, in order.
    pub fn uncommitted(&self) -> &[T::Event] {
        &self.uncommitted
    }

    /// Apply `event` to the state and record it for the next commit.
    pub fn raise(&mut self, event: T::Event) {
        self.apply(&event);
        self.uncommitted.push(event);
    }

    /// Fold an already-committed event into the state.
    pub(crate) fn apply(&mut self, event: &T::Event) {
        let state = std::mem::take(&mut self.state);
        self.state = state.apply(event);
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Mark the raised events as stored under `version`.
    pub(crate) fn committed(mut self, version: u64) -> Self {
        self.version = version;
        self.uncommitted.clear();
        self
    }

    pub(crate) fn with_snapshot_version(mut self, version: u64) -> Self {
        self.snapshot_version = version;
        self
    }
}
