//! In-memory saga timeout cache and the timer that fires it.
//!
//! The cache holds the pending timeouts due before a rolling `horizon`.
//! Everything later lives only in the durable [`TimeoutStore`] until the
//! horizon passes and the next window is loaded.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Notify, watch};
use uuid::Uuid;

use crate::config::SagaSettings;
use crate::error::StoreError;
use crate::saga::{SagaTimeout, TimeoutStore};

/// Shortest wait between two timer runs.
pub const MIN_TIMER_DELAY: Duration = Duration::from_millis(100);
/// Longest wait between two timer runs.
pub const MAX_TIMER_DELAY: Duration = Duration::from_secs(60);
/// Wait after a failed run before trying again.
pub const FAILURE_RETRY_DELAY: Duration = Duration::from_secs(10);

type Slot = (DateTime<Utc>, u64);

struct CacheState {
    /// Pending timeouts by `(timeout, insertion sequence)`.
    pending: BTreeMap<Slot, SagaTimeout>,
    index: HashMap<(String, Uuid), Slot>,
    horizon: DateTime<Utc>,
    next_seq: u64,
}

impl CacheState {
    fn remove(&mut self, kind: &str, id: Uuid) -> Option<SagaTimeout> {
        let slot = self.index.remove(&(kind.to_owned(), id))?;
        self.pending.remove(&slot)
    }

    /// Insert `timeout`, replacing any older entry for the same saga.
    fn insert(&mut self, timeout: SagaTimeout) {
        let key = (timeout.kind.clone(), timeout.id);
        if let Some(slot) = self.index.get(&key)
            && let Some(existing) = self.pending.get(slot)
            && existing.version > timeout.version
        {
            return;
        }
        self.remove(&timeout.kind, timeout.id);
        let slot = (timeout.timeout, self.next_seq);
        self.next_seq += 1;
        self.index.insert(key, slot);
        self.pending.insert(slot, timeout);
    }
}

/// Sorted set of the saga timeouts due before the current horizon.
///
/// Every change wakes the [`TimeoutScheduler`] so it can recompute its next
/// fire time.
pub struct TimeoutCache {
    state: Mutex<CacheState>,
    store: Arc<dyn TimeoutStore>,
    window: TimeDelta,
    changed: Arc<Notify>,
}

impl std::fmt::Debug for TimeoutCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("TimeoutCache")
            .field("pending", &state.pending.len())
            .field("horizon", &state.horizon)
            .field("window", &self.window)
            .finish()
    }
}

impl TimeoutCache {
    /// Create an empty cache. The first
    /// [`get_elapsed_timeouts`](TimeoutCache::get_elapsed_timeouts) loads
    /// the initial window from `store`.
    pub fn new(store: Arc<dyn TimeoutStore>, settings: &SagaSettings) -> Self {
        let window = TimeDelta::from_std(settings.effective_timeout_cache_duration())
            .unwrap_or(TimeDelta::MAX);
        Self {
            state: Mutex::new(CacheState {
                pending: BTreeMap::new(),
                index: HashMap::new(),
                horizon: DateTime::<Utc>::MIN_UTC,
                next_seq: 0,
            }),
            store,
            window,
            changed: Arc::new(Notify::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn changed(&self) -> Arc<Notify> {
        Arc::clone(&self.changed)
    }

    /// Track `timeout` if it falls before the horizon.
    ///
    /// Returns `false` for later timeouts, which are picked up from durable
    /// storage once the horizon reaches them. Any earlier entry for the same
    /// saga is dropped either way.
    pub fn schedule_timeout(&self, timeout: SagaTimeout) -> bool {
        let accepted = {
            let mut state = self.state();
            if timeout.timeout < state.horizon {
                state.insert(timeout);
                true
            } else {
                state.remove(&timeout.kind, timeout.id);
                false
            }
        };
        self.changed.notify_one();
        accepted
    }

    /// Put drained timeouts back without waking the timer.
    fn restore(&self, timeouts: impl IntoIterator<Item = SagaTimeout>) {
        let mut state = self.state();
        for timeout in timeouts {
            state.insert(timeout);
        }
    }

    /// Forget the pending timeout of saga `kind`/`id`.
    pub fn clear_timeout(&self, kind: &str, id: Uuid) -> Option<SagaTimeout> {
        let removed = self.state().remove(kind, id);
        if removed.is_some() {
            self.changed.notify_one();
        }
        removed
    }

    /// Remove and return every timeout due at or before `now`, earliest
    /// first. Advances the horizon and reloads from durable storage first
    /// if `now` has reached it.
    pub async fn get_elapsed_timeouts(
        &self,
        now: DateTime<Utc>,
    ) -> io::Result<Vec<SagaTimeout>> {
        let refill = {
            let mut state = self.state();
            if state.horizon <= now {
                let previous = state.horizon;
                // Raised before the read so schedules made meanwhile are kept.
                state.horizon = now
                    .checked_add_signed(self.window)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                Some((previous, state.horizon))
            } else {
                None
            }
        };
        if let Some((previous, next_horizon)) = refill {
            let loaded = match self.store.get_scheduled_timeouts(next_horizon).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    let mut state = self.state();
                    if state.horizon == next_horizon {
                        state.horizon = previous;
                    }
                    return Err(e);
                }
            };
            let mut state = self.state();
            tracing::debug!(
                loaded = loaded.len(),
                horizon = %state.horizon,
                "timeout window refilled"
            );
            for timeout in loaded {
                if timeout.timeout < state.horizon {
                    state.insert(timeout);
                }
            }
        }

        let mut elapsed = Vec::new();
        let mut state = self.state();
        while let Some(entry) = state.pending.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let timeout = entry.remove();
            state.index.remove(&(timeout.kind.clone(), timeout.id));
            elapsed.push(timeout);
        }
        Ok(elapsed)
    }

    /// The earliest pending timeout, or the horizon if nothing is pending.
    pub fn get_next_scheduled_timeout(&self) -> DateTime<Utc> {
        let state = self.state();
        state
            .pending
            .keys()
            .next()
            .map_or(state.horizon, |(timeout, _)| *timeout)
    }

    /// Number of timeouts held in memory.
    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sink the timer hands elapsed timeouts to.
#[async_trait]
pub trait TimeoutDispatcher: Send + Sync {
    async fn dispatch(&self, timeout: &SagaTimeout) -> Result<(), StoreError>;
}

/// Delay until `next`, kept within the timer bounds.
pub fn timer_delay(next: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (next - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
        .clamp(MIN_TIMER_DELAY, MAX_TIMER_DELAY)
}

/// Self-rescheduling timer that drains the [`TimeoutCache`] into a
/// [`TimeoutDispatcher`].
pub struct TimeoutScheduler;

impl TimeoutScheduler {
    /// Spawn the timer task on the current runtime.
    pub fn start(
        cache: Arc<TimeoutCache>,
        dispatcher: Arc<dyn TimeoutDispatcher>,
    ) -> TimeoutSchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let wake = cache.changed();
        let task = tokio::spawn(run_timer(cache, dispatcher, Arc::clone(&wake), shutdown_rx));
        TimeoutSchedulerHandle {
            shutdown_tx,
            wake,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }
}

/// Drain and dispatch everything due now. A timeout whose dispatch fails is
/// put back so the next run retries it.
async fn fire_elapsed(
    cache: &TimeoutCache,
    dispatcher: &dyn TimeoutDispatcher,
) -> Result<usize, StoreError> {
    let elapsed = cache.get_elapsed_timeouts(Utc::now()).await?;
    for (i, timeout) in elapsed.iter().enumerate() {
        if let Err(e) = dispatcher.dispatch(timeout).await {
            cache.restore(elapsed[i..].iter().cloned());
            return Err(e);
        }
    }
    Ok(elapsed.len())
}

async fn run_timer(
    cache: Arc<TimeoutCache>,
    dispatcher: Arc<dyn TimeoutDispatcher>,
    wake: Arc<Notify>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let delay = match fire_elapsed(&cache, dispatcher.as_ref()).await {
            Ok(fired) => {
                if fired > 0 {
                    tracing::debug!(fired, "saga timeouts dispatched");
                }
                timer_delay(cache.get_next_scheduled_timeout(), Utc::now())
            }
            Err(e) => {
                tracing::error!(error = %e, "saga timeout dispatch failed; retrying later");
                FAILURE_RETRY_DELAY
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wake.notified() => {
                tracing::debug!("saga timer rescheduled");
            }
            _ = shutdown_rx.changed() => break,
        }
    }
    tracing::debug!("saga timer stopped");
}

/// Controls a running [`TimeoutScheduler`].
///
/// `Clone` is cheap. Dropping the handle does not stop the timer; call
/// [`shutdown`](TimeoutSchedulerHandle::shutdown).
#[derive(Clone)]
pub struct TimeoutSchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    wake: Arc<Notify>,
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl std::fmt::Debug for TimeoutSchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutSchedulerHandle")
            .field("stopping", &*self.shutdown_tx.borrow())
            .finish()
    }
}

impl TimeoutSchedulerHandle {
    /// Make the timer recompute its next fire time now.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// Stop the timer and wait for it to exit. A dispatch already in
    /// progress completes first.
    ///
    /// Calling `shutdown` more than once is safe.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the timer task panicked.
    pub async fn shutdown(&self) -> io::Result<()> {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        match task {
            Some(join_handle) => join_handle
                .await
                .map_err(|e| io::Error::other(format!("saga timer task panicked: {e}"))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::InMemoryTimeoutStore;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    fn timeout(kind: &str, at: DateTime<Utc>) -> SagaTimeout {
        SagaTimeout {
            kind: kind.to_owned(),
            id: Uuid::new_v4(),
            version: 1,
            timeout: at,
        }
    }

    fn cache(store: &Arc<InMemoryTimeoutStore>) -> TimeoutCache {
        TimeoutCache::new(store.clone(), &SagaSettings::default())
    }

    #[tokio::test]
    async fn first_drain_loads_window_from_store() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let now = Utc::now();
        let due = timeout("reminder", now - TimeDelta::seconds(5));
        let later = timeout("reminder", now + TimeDelta::minutes(1));
        let beyond = timeout("reminder", now + TimeDelta::hours(2));
        for t in [&due, &later, &beyond] {
            store.upsert(t).await.expect("upsert");
        }

        let cache = cache(&store);
        let elapsed = cache.get_elapsed_timeouts(now).await.expect("drain");
        assert_eq!(elapsed, vec![due]);
        assert_eq!(cache.len(), 1, "only the in-window timeout stays cached");
        assert_eq!(cache.get_next_scheduled_timeout(), later.timeout);
    }

    #[tokio::test]
    async fn never_returns_future_timeouts_or_duplicates() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let cache = cache(&store);
        let now = Utc::now();
        cache.get_elapsed_timeouts(now).await.expect("initial load");

        let a = timeout("reminder", now + TimeDelta::seconds(1));
        let b = timeout("reminder", now + TimeDelta::seconds(2));
        assert!(cache.schedule_timeout(a.clone()));
        assert!(cache.schedule_timeout(b.clone()));

        assert!(cache.get_elapsed_timeouts(now).await.expect("drain").is_empty());
        let at_a = cache
            .get_elapsed_timeouts(a.timeout)
            .await
            .expect("drain");
        assert_eq!(at_a, vec![a.clone()]);
        let again = cache
            .get_elapsed_timeouts(a.timeout)
            .await
            .expect("drain");
        assert!(again.is_empty(), "drained entries are gone");
        let at_b = cache
            .get_elapsed_timeouts(b.timeout)
            .await
            .expect("drain");
        assert_eq!(at_b, vec![b]);
    }

    #[tokio::test]
    async fn equal_timeouts_drain_in_insertion_order() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let cache = cache(&store);
        let now = Utc::now();
        cache.get_elapsed_timeouts(now).await.expect("initial load");

        let at = now + TimeDelta::seconds(1);
        let first = timeout("reminder", at);
        let second = timeout("shipment", at);
        cache.schedule_timeout(first.clone());
        cache.schedule_timeout(second.clone());

        let elapsed = cache.get_elapsed_timeouts(at).await.expect("drain");
        assert_eq!(elapsed, vec![first, second]);
    }

    #[tokio::test]
    async fn schedule_beyond_horizon_is_left_to_storage() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let cache = cache(&store);
        let now = Utc::now();
        cache.get_elapsed_timeouts(now).await.expect("initial load");

        let far = timeout("reminder", now + TimeDelta::days(1));
        assert!(!cache.schedule_timeout(far));
        assert!(cache.is_empty());
        // Horizon is now + 20 minutes by default.
        let horizon = cache.get_next_scheduled_timeout();
        assert_eq!(horizon, now + TimeDelta::minutes(20));
    }

    #[tokio::test]
    async fn rescheduling_a_saga_replaces_its_entry() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let cache = cache(&store);
        let now = Utc::now();
        cache.get_elapsed_timeouts(now).await.expect("initial load");

        let mut t = timeout("reminder", now + TimeDelta::seconds(30));
        cache.schedule_timeout(t.clone());
        t.version = 2;
        t.timeout = now + TimeDelta::seconds(10);
        cache.schedule_timeout(t.clone());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_next_scheduled_timeout(), t.timeout);

        assert_eq!(cache.clear_timeout("reminder", t.id), Some(t));
        assert!(cache.is_empty());
    }

    #[test]
    fn timer_delay_is_clamped() {
        let now = Utc::now();
        assert_eq!(timer_delay(now - TimeDelta::seconds(5), now), MIN_TIMER_DELAY);
        assert_eq!(timer_delay(now + TimeDelta::hours(1), now), MAX_TIMER_DELAY);
        assert_eq!(
            timer_delay(now + TimeDelta::seconds(3), now),
            Duration::from_secs(3)
        );
    }

    struct ChannelDispatcher {
        tx: mpsc::UnboundedSender<SagaTimeout>,
    }

    #[async_trait]
    impl TimeoutDispatcher for ChannelDispatcher {
        async fn dispatch(&self, timeout: &SagaTimeout) -> Result<(), StoreError> {
            let _ = self.tx.send(timeout.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn timer_fires_scheduled_timeout_and_shuts_down() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let cache = Arc::new(cache(&store));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = TimeoutScheduler::start(cache.clone(), Arc::new(ChannelDispatcher { tx }));

        // Let the first run load the window so the schedule is accepted.
        tokio::time::timeout(Duration::from_secs(5), async {
            while cache.get_next_scheduled_timeout() <= Utc::now() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("initial window loaded");

        let due = timeout("reminder", Utc::now() + TimeDelta::milliseconds(150));
        assert!(cache.schedule_timeout(due.clone()));

        let fired = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timer fired in time")
            .expect("dispatcher alive");
        assert_eq!(fired, due);
        assert!(Utc::now() >= due.timeout);

        handle.shutdown().await.expect("clean shutdown");
        handle.shutdown().await.expect("second shutdown is a no-op");
    }

    struct FailingDispatcher;

    #[async_trait]
    impl TimeoutDispatcher for FailingDispatcher {
        async fn dispatch(&self, timeout: &SagaTimeout) -> Result<(), StoreError> {
            Err(StoreError::AlreadyExists {
                kind: "reminder",
                id: timeout.id,
            })
        }
    }

    #[tokio::test]
    async fn failed_dispatch_puts_timeout_back() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let due = timeout("reminder", Utc::now() - TimeDelta::seconds(1));
        store.upsert(&due).await.expect("upsert");
        let cache = cache(&store);

        let result = fire_elapsed(&cache, &FailingDispatcher).await;
        assert!(result.is_err());
        assert_eq!(cache.len(), 1, "timeout retained for the next run");
    }

    /// Fails the first `failures` attempts; reports every attempt with the
    /// (paused) clock reading.
    struct FlakyDispatcher {
        failures: AtomicU32,
        tx: mpsc::UnboundedSender<(Instant, SagaTimeout)>,
    }

    #[async_trait]
    impl TimeoutDispatcher for FlakyDispatcher {
        async fn dispatch(&self, timeout: &SagaTimeout) -> Result<(), StoreError> {
            let _ = self.tx.send((Instant::now(), timeout.clone()));
            let fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(StoreError::AlreadyExists {
                    kind: "reminder",
                    id: timeout.id,
                });
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timer_waits_failure_delay_before_retrying() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let due = timeout("reminder", Utc::now() - TimeDelta::seconds(1));
        store.upsert(&due).await.expect("upsert");
        let cache = Arc::new(cache(&store));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = FlakyDispatcher {
            failures: AtomicU32::new(1),
            tx,
        };
        let handle = TimeoutScheduler::start(cache.clone(), Arc::new(dispatcher));

        let (first_at, first) = rx.recv().await.expect("first attempt");
        let (second_at, second) = rx.recv().await.expect("retry");
        assert_eq!(first, due);
        assert_eq!(second, due);
        assert!(second_at - first_at >= FAILURE_RETRY_DELAY);
        assert!(cache.is_empty(), "retry succeeded");

        handle.shutdown().await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn later_drain_loads_the_next_window() {
        let store = Arc::new(InMemoryTimeoutStore::new());
        let cache = cache(&store);
        let now = Utc::now();
        cache.get_elapsed_timeouts(now).await.expect("initial load");

        let next = timeout("reminder", now + TimeDelta::minutes(30));
        store.upsert(&next).await.expect("upsert");
        assert!(!cache.schedule_timeout(next.clone()), "beyond the first window");

        let later = now + TimeDelta::minutes(25);
        assert!(cache.get_elapsed_timeouts(later).await.expect("drain").is_empty());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_next_scheduled_timeout(), next.timeout);

        let fired = cache
            .get_elapsed_timeouts(next.timeout)
            .await
            .expect("drain");
        assert_eq!(fired, vec![next]);
    }

    /// Holds `get_scheduled_timeouts` open after reading until released.
    #[derive(Default)]
    struct GatedStore {
        inner: InMemoryTimeoutStore,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl TimeoutStore for GatedStore {
        async fn get_scheduled_timeouts(
            &self,
            before: DateTime<Utc>,
        ) -> io::Result<Vec<SagaTimeout>> {
            let loaded = self.inner.get_scheduled_timeouts(before).await?;
            self.entered.notify_one();
            self.release.notified().await;
            Ok(loaded)
        }

        async fn upsert(&self, timeout: &SagaTimeout) -> io::Result<()> {
            self.inner.upsert(timeout).await
        }

        async fn remove(&self, kind: &str, id: Uuid) -> io::Result<()> {
            self.inner.remove(kind, id).await
        }

        async fn purge(&self) -> io::Result<()> {
            self.inner.purge().await
        }
    }

    #[tokio::test]
    async fn schedule_during_refill_is_kept() {
        let store = Arc::new(GatedStore::default());
        let cache = Arc::new(TimeoutCache::new(store.clone(), &SagaSettings::default()));
        let now = Utc::now();
        let refill = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get_elapsed_timeouts(now).await }
        });
        store.entered.notified().await;

        // Persisted after the window was read, so only the schedule call
        // brings it into memory.
        let soon = timeout("reminder", now + TimeDelta::minutes(1));
        store.upsert(&soon).await.expect("upsert");
        assert!(cache.schedule_timeout(soon.clone()));
        store.release.notify_one();

        let elapsed = refill.await.expect("join").expect("drain");
        assert!(elapsed.is_empty());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_next_scheduled_timeout(), soon.timeout);
        let fired = cache
            .get_elapsed_timeouts(soon.timeout)
            .await
            .expect("drain");
        assert_eq!(fired, vec![soon]);
    }

    /// Fails the next window read when armed.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryTimeoutStore,
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl TimeoutStore for FlakyStore {
        async fn get_scheduled_timeouts(
            &self,
            before: DateTime<Utc>,
        ) -> io::Result<Vec<SagaTimeout>> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(io::Error::other("timeout table unavailable"));
            }
            self.inner.get_scheduled_timeouts(before).await
        }

        async fn upsert(&self, timeout: &SagaTimeout) -> io::Result<()> {
            self.inner.upsert(timeout).await
        }

        async fn remove(&self, kind: &str, id: Uuid) -> io::Result<()> {
            self.inner.remove(kind, id).await
        }

        async fn purge(&self) -> io::Result<()> {
            self.inner.purge().await
        }
    }

    #[tokio::test]
    async fn failed_refill_is_retried_on_next_drain() {
        let store = Arc::new(FlakyStore::default());
        let now = Utc::now();
        let due = timeout("reminder", now - TimeDelta::seconds(1));
        store.upsert(&due).await.expect("upsert");
        store.fail_next.store(true, Ordering::SeqCst);
        let cache = TimeoutCache::new(store.clone(), &SagaSettings::default());

        assert!(cache.get_elapsed_timeouts(now).await.is_err());
        let soon = timeout("reminder", now + TimeDelta::minutes(1));
        assert!(!cache.schedule_timeout(soon), "horizon stays put after a failed read");

        let elapsed = cache.get_elapsed_timeouts(now).await.expect("drain");
        assert_eq!(elapsed, vec![due]);
    }
}
