use core::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Computes the sleep inserted before retry attempt `attempt` (1-based)
/// of a failed segment renewal.
pub type RetryDelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Tuning knobs shared by every engine of a [`Builder`].
///
/// A config is supplied once at builder construction and never mutated
/// afterwards. All values have workable defaults; none are validated beyond
/// the min/max clamping applied by the adaptive segment sizing itself.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use segid::Config;
///
/// let config = Config::default()
///     .with_initial_quantum(1_000)
///     .with_max_quantum(100_000)
///     .with_segment_duration(Duration::from_secs(60));
/// assert_eq!(config.initial_quantum, 1_000);
/// ```
///
/// [`Builder`]: crate::Builder
#[derive(Clone)]
pub struct Config {
    /// Ceiling on dispensable IDs. Crossing it is permanent:
    /// [`Error::LimitReached`] with no recovery path.
    ///
    /// [`Error::LimitReached`]: crate::Error::LimitReached
    pub limitation: u64,
    /// Starting high-water mark seeded when a previously unknown domain is
    /// auto-created in the store, reserving headroom below it.
    pub offset_on_create: u64,
    /// Percentage of the active segment that may be consumed before a
    /// background renewal is triggered.
    pub renew_percent: u64,
    /// Deadline applied to each individual renewal attempt against the
    /// store.
    pub renew_timeout: Duration,
    /// Maximum number of attempts per renewal before it is abandoned.
    pub renew_retries: u32,
    /// Backoff between renewal attempts, as a function of the attempt
    /// index.
    pub renew_retry_delay: RetryDelayFn,
    /// Target wall-clock lifetime of one segment. The adaptive sizing
    /// steers lease sizes so a segment drains in roughly this long.
    pub segment_duration: Duration,
    /// Lower clamp for adaptive lease sizes.
    pub min_quantum: u64,
    /// Upper clamp for adaptive lease sizes. Wins over `min_quantum` on
    /// conflict, capping how many reserved IDs a crash can forfeit.
    pub max_quantum: u64,
    /// Lease size used for an engine's first-ever renewal.
    pub initial_quantum: u64,
    /// Dispense calls slower than this are logged as slow. `None` disables
    /// the warning.
    pub slow_threshold: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            limitation: u64::MAX,
            offset_on_create: 30_000_000,
            renew_percent: 20,
            renew_timeout: Duration::from_secs(5),
            renew_retries: 99,
            renew_retry_delay: Arc::new(|attempt| Duration::from_millis(10) * attempt),
            segment_duration: Duration::from_secs(900),
            min_quantum: 30,
            max_quantum: 3_000,
            initial_quantum: 30,
            slow_threshold: Some(Duration::from_millis(30)),
        }
    }
}

impl Config {
    pub fn with_limitation(mut self, limitation: u64) -> Self {
        self.limitation = limitation;
        self
    }

    pub fn with_offset_on_create(mut self, offset: u64) -> Self {
        self.offset_on_create = offset;
        self
    }

    pub fn with_renew_percent(mut self, percent: u64) -> Self {
        self.renew_percent = percent;
        self
    }

    pub fn with_renew_timeout(mut self, timeout: Duration) -> Self {
        self.renew_timeout = timeout;
        self
    }

    pub fn with_renew_retries(mut self, retries: u32) -> Self {
        self.renew_retries = retries;
        self
    }

    pub fn with_renew_retry_delay(
        mut self,
        delay: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.renew_retry_delay = Arc::new(delay);
        self
    }

    pub fn with_segment_duration(mut self, duration: Duration) -> Self {
        self.segment_duration = duration;
        self
    }

    pub fn with_min_quantum(mut self, quantum: u64) -> Self {
        self.min_quantum = quantum;
        self
    }

    pub fn with_max_quantum(mut self, quantum: u64) -> Self {
        self.max_quantum = quantum;
        self
    }

    pub fn with_initial_quantum(mut self, quantum: u64) -> Self {
        self.initial_quantum = quantum;
        self
    }

    pub fn with_slow_threshold(mut self, threshold: Option<Duration>) -> Self {
        self.slow_threshold = threshold;
        self
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("limitation", &self.limitation)
            .field("offset_on_create", &self.offset_on_create)
            .field("renew_percent", &self.renew_percent)
            .field("renew_timeout", &self.renew_timeout)
            .field("renew_retries", &self.renew_retries)
            .field("segment_duration", &self.segment_duration)
            .field("min_quantum", &self.min_quantum)
            .field("max_quantum", &self.max_quantum)
            .field("initial_quantum", &self.initial_quantum)
            .field("slow_threshold", &self.slow_threshold)
            .finish_non_exhaustive()
    }
}
