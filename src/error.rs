//! Crate-level error types for loading, saving, locking and dispatch.

use std::io;
use std::time::Duration;

use uuid::Uuid;

/// Boxed error produced by a [`PipelineHook`](crate::PipelineHook).
pub type HookError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Misuse of the [`EntityLockRegistry`](crate::EntityLockRegistry) protocol.
///
/// Both variants indicate a caller bug and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// The owner tried to acquire a lock it already holds. Entity locks
    /// are not reentrant.
    #[error("lock on {kind}/{id} is already held by this owner")]
    Reentrant { kind: &'static str, id: Uuid },

    /// A release, or a save, was attempted without holding the lock for
    /// the entity in question.
    #[error("lock on {kind}/{id} is not held by this owner")]
    NotHeld { kind: &'static str, id: Uuid },
}

/// Outcome reported by a durable [`CommitStore`](crate::CommitStore) when an
/// append is refused or fails.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// The very same commit (same commit id) is already stored.
    #[error("commit {commit_id} already stored in stream {stream_id}")]
    Duplicate { stream_id: Uuid, commit_id: Uuid },

    /// A different commit already occupies this version, or the version
    /// does not follow the current head.
    #[error("stream {stream_id} cannot accept version {version}: head is {head}")]
    Conflict {
        stream_id: Uuid,
        version: u64,
        head: u64,
    },

    /// Disk I/O failure in a file-backed store.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A stored commit could not be encoded or decoded.
    #[error("commit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error returned by the entity stores and everything layered on them.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Another writer committed this version first. The caller must reload
    /// the entity and re-apply its change.
    #[error("concurrency conflict saving {kind}/{id} at version {version}")]
    Concurrency {
        kind: &'static str,
        id: Uuid,
        version: u64,
    },

    /// The commit tail does not continue from the snapshot (or from the
    /// previous commit). Never retried.
    #[error("corrupt stream {kind}/{id}: expected version {expected}, found {actual}")]
    CorruptStream {
        kind: &'static str,
        id: Uuid,
        expected: u64,
        actual: u64,
    },

    /// `create` was called for an entity that already has commits.
    #[error("{kind}/{id} already exists")]
    AlreadyExists { kind: &'static str, id: Uuid },

    /// Entity lock protocol violation.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The durable commit store failed.
    #[error("commit store error: {0}")]
    Commit(#[from] CommitError),

    /// Snapshot or timeout storage I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Entity state or an event could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A pipeline hook rejected or failed the operation.
    #[error("hook '{hook}' failed: {source}")]
    Hook {
        hook: String,
        #[source]
        source: HookError,
    },

    /// Concurrency conflicts kept recurring until the retry budget ran out.
    #[error(
        "unresolved concurrency conflict on {kind}/{id} after {attempts} attempts in {elapsed:?}"
    )]
    RetryExhausted {
        kind: &'static str,
        id: Uuid,
        attempts: u32,
        elapsed: Duration,
    },
}

impl StoreError {
    /// Returns `true` for a version race that a reload-and-retry may resolve.
    pub fn is_concurrency(&self) -> bool {
        matches!(self, StoreError::Concurrency { .. })
    }
}

/// Error returned when executing a command against an aggregate fails.
///
/// Generic over `E`, the domain-specific error type that the aggregate's
/// command handler may produce (e.g., "insufficient funds").
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by aggregate logic.
    #[error(transparent)]
    Domain(E),

    /// Loading or persisting the aggregate failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error returned by the [`PartitionedScheduler`](crate::PartitionedScheduler).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// The scheduler is shutting down and no longer admits work.
    #[error("scheduler is shut down")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal domain error for testing `ExecuteError<E>`.
    #[derive(Debug, thiserror::Error)]
    #[error("test domain error")]
    struct TestDomainError;

    #[test]
    fn execute_error_domain_displays_inner() {
        let err: ExecuteError<TestDomainError> = ExecuteError::Domain(TestDomainError);
        assert_eq!(err.to_string(), "test domain error");
    }

    #[test]
    fn execute_error_wraps_store_error() {
        let id = Uuid::nil();
        let err: ExecuteError<TestDomainError> = StoreError::AlreadyExists {
            kind: "counter",
            id,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "counter/00000000-0000-0000-0000-000000000000 already exists"
        );
    }

    #[test]
    fn corrupt_stream_reports_expected_and_actual() {
        let err = StoreError::CorruptStream {
            kind: "counter",
            id: Uuid::nil(),
            expected: 11,
            actual: 12,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected version 11"), "got: {msg}");
        assert!(msg.contains("found 12"), "got: {msg}");
    }

    #[test]
    fn only_concurrency_is_retryable() {
        let conflict = StoreError::Concurrency {
            kind: "counter",
            id: Uuid::nil(),
            version: 3,
        };
        assert!(conflict.is_concurrency());

        let lock = StoreError::from(LockError::NotHeld {
            kind: "counter",
            id: Uuid::nil(),
        });
        assert!(!lock.is_concurrency());
    }

    #[test]
    fn retry_exhausted_names_entity() {
        let id = Uuid::new_v4();
        let err = StoreError::RetryExhausted {
            kind: "reminder",
            id,
            attempts: 4,
            elapsed: Duration::from_millis(250),
        };
        let msg = err.to_string();
        assert!(msg.contains(&format!("reminder/{id}")));
        assert!(msg.contains("4 attempts"));
    }

    #[test]
    fn io_error_converts_into_store_error() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = StoreError::from(io_err);
        assert!(err.to_string().contains("access denied"));
    }

    // Errors cross task boundaries (hook futures, spawned timers).
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<ExecuteError<TestDomainError>>();
            assert_send_sync::<StoreError>();
            assert_send_sync::<CommitError>();
        }
    };
}
