//! Partitioned work scheduler: per-key FIFO order, cross-key parallelism,
//! bounded admission.
//!
//! Items are hashed into `concurrency_level` partitions. Each non-empty
//! partition is drained by exactly one worker, spawned when the partition
//! goes from empty to non-empty and gone once it is empty again.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::SchedulerSettings;
use crate::error::SchedulerError;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Stable 64-bit FNV-1a hash used to pick a partition.
pub fn hash_partition_key(key: impl AsRef<[u8]>) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    key.as_ref().iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

struct Item {
    job: Job,
    /// Admission slot, returned when the item finishes.
    permit: OwnedSemaphorePermit,
}

/// Partition queues. A partition present in the map has a live worker,
/// even while its queue is momentarily empty.
#[derive(Default)]
struct Partitions {
    queues: Mutex<HashMap<usize, VecDeque<Item>>>,
}

impl Partitions {
    fn queues(&self) -> MutexGuard<'_, HashMap<usize, VecDeque<Item>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next item for `partition`, or `None` after retiring the partition.
    fn next(&self, partition: usize) -> Option<Item> {
        let mut queues = self.queues();
        let item = queues.get_mut(&partition).and_then(VecDeque::pop_front);
        if item.is_none() {
            queues.remove(&partition);
        }
        item
    }
}

async fn drain(partitions: Arc<Partitions>, partition: usize) {
    tracing::debug!(partition, "partition worker started");
    while let Some(item) = partitions.next(partition) {
        if AssertUnwindSafe(item.job).catch_unwind().await.is_err() {
            tracing::error!(partition, "scheduled item panicked");
        }
        drop(item.permit);
    }
    tracing::debug!(partition, "partition worker finished");
}

/// Runs submitted futures with per-partition ordering.
///
/// Items whose keys hash to the same partition run one at a time in
/// submission order; different partitions run concurrently. At most
/// `bounded_capacity` items may be queued or running; further submissions
/// wait for a slot.
///
/// # Examples
///
/// ```
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// use eventfold_domain::{PartitionedScheduler, SchedulerSettings};
///
/// let scheduler = PartitionedScheduler::new(&SchedulerSettings::default());
/// scheduler.submit("order-17", async { /* handle */ }).await?;
/// scheduler.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct PartitionedScheduler {
    partitions: Arc<Partitions>,
    admission: Arc<Semaphore>,
    concurrency_level: usize,
    capacity: u32,
    closed: AtomicBool,
}

impl std::fmt::Debug for PartitionedScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedScheduler")
            .field("concurrency_level", &self.concurrency_level)
            .field("capacity", &self.capacity)
            .field("outstanding", &self.outstanding())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl PartitionedScheduler {
    pub fn new(settings: &SchedulerSettings) -> Self {
        let capacity = u32::try_from(settings.bounded_capacity.max(1)).unwrap_or(u32::MAX);
        Self {
            partitions: Arc::new(Partitions::default()),
            admission: Arc::new(Semaphore::new(capacity as usize)),
            concurrency_level: settings.concurrency_level.max(1),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    pub fn concurrency_level(&self) -> usize {
        self.concurrency_level
    }

    /// Partition an item with `key` runs on.
    pub fn partition_of(&self, key: impl AsRef<[u8]>) -> usize {
        (hash_partition_key(key) % self.concurrency_level as u64) as usize
    }

    /// Items admitted and not yet finished.
    pub fn outstanding(&self) -> usize {
        (self.capacity as usize).saturating_sub(self.admission.available_permits())
    }

    /// Queue `job` on the partition of `key`, waiting for capacity first.
    ///
    /// Returns once the job is queued, not when it has run.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Closed`] after [`shutdown`](Self::shutdown).
    pub async fn submit<F>(&self, key: impl AsRef<[u8]>, job: F) -> Result<(), SchedulerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.enqueue(key.as_ref(), Box::pin(job), false).await
    }

    /// Like [`submit`](Self::submit), but if this item starts a new worker
    /// it gets a dedicated blocking thread instead of a pooled task.
    /// Use for items that block or run for a long time.
    pub async fn submit_long_running<F>(
        &self,
        key: impl AsRef<[u8]>,
        job: F,
    ) -> Result<(), SchedulerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.enqueue(key.as_ref(), Box::pin(job), true).await
    }

    async fn enqueue(
        &self,
        key: &[u8],
        job: Job,
        long_running: bool,
    ) -> Result<(), SchedulerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchedulerError::Closed);
        }
        let permit = match Arc::clone(&self.admission).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::debug!(outstanding = self.outstanding(), "scheduler at capacity; waiting");
                Arc::clone(&self.admission)
                    .acquire_owned()
                    .await
                    .map_err(|_| SchedulerError::Closed)?
            }
        };

        let partition = self.partition_of(key);
        let start_worker = {
            let mut queues = self.partitions.queues();
            let start = !queues.contains_key(&partition);
            queues
                .entry(partition)
                .or_default()
                .push_back(Item { job, permit });
            start
        };

        if start_worker {
            let partitions = Arc::clone(&self.partitions);
            if long_running {
                let handle = tokio::runtime::Handle::current();
                tokio::task::spawn_blocking(move || handle.block_on(drain(partitions, partition)));
            } else {
                tokio::spawn(drain(partitions, partition));
            }
        }
        Ok(())
    }

    /// Stop admitting work and wait until every admitted item has finished.
    ///
    /// Calling `shutdown` more than once is safe.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(all) = self.admission.acquire_many(self.capacity).await {
            self.admission.close();
            drop(all);
            tracing::debug!("partitioned scheduler drained");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::{Barrier, oneshot};

    fn scheduler(level: usize, capacity: usize) -> PartitionedScheduler {
        PartitionedScheduler::new(
            &SchedulerSettings::default()
                .with_concurrency_level(level)
                .with_bounded_capacity(capacity),
        )
    }

    #[test]
    fn fnv_hash_matches_reference_values() {
        assert_eq!(hash_partition_key(""), 0xcbf29ce484222325);
        assert_eq!(hash_partition_key("a"), 0xaf63dc4c8601ec8c);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_partition_runs_in_submission_order() {
        let scheduler = scheduler(4, 16);
        let log = Arc::new(Mutex::new(Vec::new()));

        // Earlier items sleep longer; only serial execution keeps the order.
        for (name, delay_ms) in [("A1", 30), ("A2", 10), ("A3", 0)] {
            let log = Arc::clone(&log);
            scheduler
                .submit("A", async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    log.lock().unwrap().push(name);
                })
                .await
                .expect("submit");
        }
        scheduler.shutdown().await;

        assert_eq!(*log.lock().unwrap(), vec!["A1", "A2", "A3"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn distinct_partitions_run_concurrently() {
        const K: usize = 4;
        let scheduler = scheduler(K, 16);

        let mut keys: Vec<String> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for i in 0.. {
            let key = format!("key-{i}");
            if seen.insert(scheduler.partition_of(&key)) {
                keys.push(key);
            }
            if keys.len() == K {
                break;
            }
        }

        // Every item waits for all K to arrive; serial execution would hang.
        let barrier = Arc::new(Barrier::new(K));
        let done = Arc::new(AtomicUsize::new(0));
        for key in &keys {
            let barrier = Arc::clone(&barrier);
            let done = Arc::clone(&done);
            scheduler
                .submit(key, async move {
                    barrier.wait().await;
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .await
                .expect("submit");
        }

        tokio::time::timeout(Duration::from_secs(5), scheduler.shutdown())
            .await
            .expect("all partitions ran at once");
        assert_eq!(done.load(Ordering::SeqCst), K);
    }

    #[tokio::test]
    async fn full_scheduler_blocks_submit_until_an_item_completes() {
        let scheduler = scheduler(1, 1);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let ran = Arc::new(AtomicBool::new(false));

        scheduler
            .submit("first", async move {
                let _ = release_rx.await;
            })
            .await
            .expect("submit");
        assert_eq!(scheduler.outstanding(), 1);

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            scheduler.submit("second", async {}),
        )
        .await;
        assert!(blocked.is_err(), "second submit must wait for capacity");

        release_tx.send(()).expect("first item waiting");
        let ran_flag = Arc::clone(&ran);
        tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.submit("second", async move {
                ran_flag.store(true, Ordering::SeqCst);
            }),
        )
        .await
        .expect("capacity freed")
        .expect("submit");

        scheduler.shutdown().await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_item_does_not_stop_its_partition() {
        let scheduler = scheduler(1, 4);
        let ran = Arc::new(AtomicBool::new(false));

        scheduler
            .submit("p", async { panic!("boom"); })
            .await
            .expect("submit");
        let ran_flag = Arc::clone(&ran);
        scheduler
            .submit("p", async move { ran_flag.store(true, Ordering::SeqCst) })
            .await
            .expect("submit");
        scheduler.shutdown().await;

        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(scheduler.outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn long_running_items_execute() {
        let scheduler = scheduler(2, 4);
        let ran = Arc::new(AtomicBool::new(false));
        let ran_flag = Arc::clone(&ran);
        scheduler
            .submit_long_running("slow", async move {
                std::thread::sleep(Duration::from_millis(10));
                ran_flag.store(true, Ordering::SeqCst);
            })
            .await
            .expect("submit");
        scheduler.shutdown().await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_refused() {
        let scheduler = scheduler(2, 4);
        scheduler.shutdown().await;
        scheduler.shutdown().await;
        let result = scheduler.submit("late", async {}).await;
        assert_eq!(result, Err(SchedulerError::Closed));
    }
}
