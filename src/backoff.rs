//! Exponential backoff for concurrency-conflict retries.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::SagaSettings;
use crate::entity::EntityKey;
use crate::error::{ExecuteError, StoreError};

/// How long, and how eagerly, to retry after a concurrency conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the second retry. The first retry is immediate.
    pub initial_delay: Duration,
    /// Total time allowed across all attempts.
    pub budget: Duration,
}

impl From<&SagaSettings> for RetryPolicy {
    fn from(settings: &SagaSettings) -> Self {
        Self {
            initial_delay: settings.retry_initial_delay,
            budget: settings.retry_timeout,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&SagaSettings::default())
    }
}

/// Delay sequence `0, d, 2d, 4d, ...` bounded by a time budget.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    started: Instant,
    retries: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            started: Instant::now(),
            retries: 0,
        }
    }

    /// Delay to wait before the next retry, or `None` once waiting it would
    /// overrun the budget.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = match self.retries {
            0 => Duration::ZERO,
            n => {
                let factor = 1u32.checked_shl(n - 1).unwrap_or(u32::MAX);
                self.policy.initial_delay.saturating_mul(factor)
            }
        };
        if self.started.elapsed().saturating_add(delay) > self.policy.budget {
            return None;
        }
        self.retries += 1;
        Some(delay)
    }

    /// Retries handed out so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Errors that may signal a retryable version race.
pub(crate) trait ConflictError: From<StoreError> {
    fn is_conflict(&self) -> bool;
}

impl ConflictError for StoreError {
    fn is_conflict(&self) -> bool {
        self.is_concurrency()
    }
}

impl<E: std::error::Error + Send + Sync + 'static> ConflictError for ExecuteError<E> {
    fn is_conflict(&self) -> bool {
        matches!(self, ExecuteError::Store(e) if e.is_concurrency())
    }
}

/// Run `op` until it succeeds or fails with something other than a
/// conflict. Once the budget is spent the conflict is surfaced as
/// [`StoreError::RetryExhausted`].
pub(crate) async fn retry_on_conflict<T, E, F, Fut>(
    key: EntityKey,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, E>
where
    E: ConflictError,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = Backoff::new(policy);
    loop {
        match op().await {
            Err(e) if e.is_conflict() => match backoff.next_delay() {
                Some(delay) => {
                    tracing::warn!(
                        %key,
                        retry = backoff.retries(),
                        delay_ms = delay.as_millis() as u64,
                        "concurrency conflict; retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                None => {
                    let attempts = backoff.retries() + 1;
                    let elapsed = backoff.elapsed();
                    tracing::error!(%key, attempts, ?elapsed, "retry budget exhausted");
                    return Err(StoreError::RetryExhausted {
                        kind: key.kind,
                        id: key.id,
                        attempts,
                        elapsed,
                    }
                    .into());
                }
            },
            other => return other,
        }
    }
}
