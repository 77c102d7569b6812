//! Process-wide keyed mutual exclusion for entities.
//!
//! The registry maps each [`EntityKey`] that somebody holds or waits for to
//! a shared async mutex plus a reference count. The coarse registry lock is
//! only taken for short bookkeeping; waiting happens on the per-key mutex,
//! so unrelated keys never contend with each other. Entries disappear as
//! soon as the last holder or waiter lets go.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OwnedMutexGuard;

use crate::entity::EntityKey;
use crate::error::LockError;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Identity of a lock caller (a unit of work).
///
/// Entity locks are not reentrant: an owner that acquires a key it already
/// holds gets [`LockError::Reentrant`] instead of deadlocking on itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockOwner(u64);

impl LockOwner {
    /// A new, process-unique owner.
    pub fn new() -> Self {
        Self(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for LockOwner {
    fn default() -> Self {
        Self::new()
    }
}

struct LockEntry {
    mutex: Arc<tokio::sync::Mutex<()>>,
    /// Holders plus waiters.
    ref_count: usize,
    holder: Option<LockOwner>,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            mutex: Arc::new(tokio::sync::Mutex::new(())),
            ref_count: 0,
            holder: None,
        }
    }
}

/// Registry of per-entity exclusive locks.
///
/// `Clone` is cheap and clones share the same registry.
#[derive(Clone, Default)]
pub struct EntityLockRegistry {
    entries: Arc<Mutex<HashMap<EntityKey, LockEntry>>>,
}

impl std::fmt::Debug for EntityLockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityLockRegistry")
            .field("entries", &self.len())
            .finish()
    }
}

impl EntityLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<EntityKey, LockEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for exclusive ownership of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Reentrant`] immediately if `owner` already
    /// holds `key`.
    pub async fn acquire(
        &self,
        owner: LockOwner,
        key: EntityKey,
    ) -> Result<EntityLockGuard, LockError> {
        let mutex = {
            let mut entries = self.entries();
            let entry = entries.entry(key).or_insert_with(LockEntry::new);
            if entry.holder == Some(owner) {
                return Err(LockError::Reentrant {
                    kind: key.kind,
                    id: key.id,
                });
            }
            entry.ref_count += 1;
            Arc::clone(&entry.mutex)
        };

        // Gives the reference back if this future is dropped while waiting.
        let mut pending = PendingAcquire {
            registry: self,
            key,
            armed: true,
        };
        let guard = match Arc::clone(&mutex).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!(kind = key.kind, id = %key.id, "waiting for entity lock");
                mutex.lock_owned().await
            }
        };
        pending.armed = false;

        if let Some(entry) = self.entries().get_mut(&key) {
            entry.holder = Some(owner);
        }

        Ok(EntityLockGuard {
            registry: self.clone(),
            key,
            owner,
            guard: Some(guard),
        })
    }

    /// Number of keys currently held or waited for.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether some owner currently holds `key`.
    pub fn is_held(&self, key: EntityKey) -> bool {
        self.entries()
            .get(&key)
            .is_some_and(|entry| entry.holder.is_some())
    }

    fn release_ref(entries: &mut HashMap<EntityKey, LockEntry>, key: EntityKey) {
        if let Some(entry) = entries.get_mut(&key) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count == 0 {
                entries.remove(&key);
            }
        }
    }
}

struct PendingAcquire<'a> {
    registry: &'a EntityLockRegistry,
    key: EntityKey,
    armed: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.armed {
            EntityLockRegistry::release_ref(&mut self.registry.entries(), self.key);
        }
    }
}

/// Exclusive ownership of one entity.
///
/// Released by [`release`](EntityLockGuard::release) or on drop.
#[must_use = "the entity lock is released as soon as the guard is dropped"]
pub struct EntityLockGuard {
    registry: EntityLockRegistry,
    key: EntityKey,
    owner: LockOwner,
    guard: Option<OwnedMutexGuard<()>>,
}

impl std::fmt::Debug for EntityLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityLockGuard")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("held", &self.guard.is_some())
            .finish()
    }
}

impl EntityLockGuard {
    pub fn key(&self) -> EntityKey {
        self.key
    }

    pub fn owner(&self) -> LockOwner {
        self.owner
    }

    /// Fail unless this guard currently holds the lock for `key`.
    pub(crate) fn ensure_covers(&self, key: EntityKey) -> Result<(), LockError> {
        if self.key == key && self.guard.is_some() {
            Ok(())
        } else {
            Err(LockError::NotHeld {
                kind: key.kind,
                id: key.id,
            })
        }
    }

    /// Relinquish the lock.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotHeld`] if the registry no longer records this
    /// owner as the holder.
    pub fn release(mut self) -> Result<(), LockError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), LockError> {
        let not_held = LockError::NotHeld {
            kind: self.key.kind,
            id: self.key.id,
        };
        let Some(guard) = self.guard.take() else {
            return Err(not_held);
        };

        let mut entries = self.registry.entries();
        let holds = entries
            .get(&self.key)
            .is_some_and(|entry| entry.holder == Some(self.owner));
        if let Some(entry) = entries.get_mut(&self.key)
            && holds
        {
            entry.holder = None;
        }
        // Unblock the next waiter before dropping our reference; it records
        // itself as holder only once it can take the registry lock.
        drop(guard);
        if !holds {
            return Err(not_held);
        }
        EntityLockRegistry::release_ref(&mut entries, self.key);
        Ok(())
    }
}

impl Drop for EntityLockGuard {
    fn drop(&mut self) {
        if self.guard.is_some()
            && let Err(e) = self.release_inner()
        {
            tracing::error!(key = %self.key, error = %e, "entity lock release failed");
        }
    }
}
