//! Runtime settings for stores, sagas and the partitioned scheduler.
//!
//! All settings are plain values with defaults. They derive `Deserialize`
//! so the host application can load them from whatever configuration
//! source it uses; every field is optional in the serialized form.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lower bound for [`SagaSettings::timeout_cache_duration`].
pub const MIN_TIMEOUT_CACHE_DURATION: Duration = Duration::from_secs(5 * 60);

/// Settings for the event-sourced store and its caching decorator.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_domain::StoreSettings;
///
/// let settings = StoreSettings::default().with_snapshot_interval(50);
/// assert_eq!(settings.snapshot_interval, 50);
/// assert_eq!(settings.cache_sliding_expiration, Duration::from_secs(600));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Number of commits after the last snapshot that triggers a new one.
    /// Zero disables snapshotting.
    ///
    /// Default: 10.
    pub snapshot_interval: u64,

    /// How long a cached entity survives without being read.
    ///
    /// Default: 10 minutes.
    pub cache_sliding_expiration: Duration,

    /// Maximum number of entities a single cache holds before evicting the
    /// least recently used one.
    ///
    /// Default: 10,000.
    pub cache_capacity: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            snapshot_interval: 10,
            cache_sliding_expiration: Duration::from_secs(10 * 60),
            cache_capacity: 10_000,
        }
    }
}

impl StoreSettings {
    /// Set the snapshot interval.
    pub fn with_snapshot_interval(mut self, interval: u64) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Set the cache sliding expiration.
    pub fn with_cache_sliding_expiration(mut self, expiration: Duration) -> Self {
        self.cache_sliding_expiration = expiration;
        self
    }

    /// Set the cache capacity. Values below one are raised to one.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity.max(1);
        self
    }
}

/// Settings for saga timeout caching and conflict retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SagaSettings {
    /// Width of the window of pending timeouts held in memory. Read through
    /// [`effective_timeout_cache_duration`](Self::effective_timeout_cache_duration),
    /// which enforces [`MIN_TIMEOUT_CACHE_DURATION`].
    ///
    /// Default: 20 minutes.
    pub timeout_cache_duration: Duration,

    /// Total time budget for retrying a saga event after concurrency
    /// conflicts.
    ///
    /// Default: 10 seconds.
    pub retry_timeout: Duration,

    /// Delay before the second retry; doubles on every further retry. The
    /// first retry is always immediate.
    ///
    /// Default: 10 milliseconds.
    pub retry_initial_delay: Duration,
}

impl Default for SagaSettings {
    fn default() -> Self {
        Self {
            timeout_cache_duration: Duration::from_secs(20 * 60),
            retry_timeout: Duration::from_secs(10),
            retry_initial_delay: Duration::from_millis(10),
        }
    }
}

impl SagaSettings {
    /// Set the timeout cache window.
    pub fn with_timeout_cache_duration(mut self, duration: Duration) -> Self {
        self.timeout_cache_duration = duration;
        self
    }

    /// Set the conflict retry budget.
    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = timeout;
        self
    }

    /// Set the initial retry delay.
    pub fn with_retry_initial_delay(mut self, delay: Duration) -> Self {
        self.retry_initial_delay = delay;
        self
    }

    /// The timeout cache window, never shorter than five minutes.
    pub fn effective_timeout_cache_duration(&self) -> Duration {
        self.timeout_cache_duration.max(MIN_TIMEOUT_CACHE_DURATION)
    }
}

/// Settings for the [`PartitionedScheduler`](crate::PartitionedScheduler).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Number of partitions, and therefore the maximum number of items
    /// executing at once.
    ///
    /// Default: available parallelism of the host.
    pub concurrency_level: usize,

    /// Maximum number of queued plus executing items before `submit`
    /// waits for capacity.
    ///
    /// Default: 1024.
    pub bounded_capacity: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            concurrency_level: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            bounded_capacity: 1024,
        }
    }
}

impl SchedulerSettings {
    /// Set the concurrency level. Values below one are raised to one.
    pub fn with_concurrency_level(mut self, level: usize) -> Self {
        self.concurrency_level = level.max(1);
        self
    }

    /// Set the bounded capacity. Values below one are raised to one.
    pub fn with_bounded_capacity(mut self, capacity: usize) -> Self {
        self.bounded_capacity = capacity.max(1);
        self
    }
}

/// All runtime settings, grouped by component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub store: StoreSettings,
    pub saga: SagaSettings,
    pub scheduler: SchedulerSettings,
}
