mod quantum;

use crate::{Config, Deadline, Error, LeaseStore, Result, Stats, StoreError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use quantum::next_quantum;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Instant;
#[cfg(feature = "tracing")]
use tracing::instrument;

/// Active segment of one domain.
///
/// `n` is the last dispensed value and only ever increases for the lifetime
/// of the engine; `max` is the exclusive upper bound of the current lease.
/// `critical` is the value of `n` at which the next renewal is triggered,
/// recomputed on every promotion so a renewal fires exactly once per
/// segment.
struct Bucket {
    n: u64,
    max: u64,
    quantum: u64,
    activated_at: Option<Instant>,
    critical: u64,
}

/// Lease obtained by a renewal but not yet promoted into the active bucket.
struct Staged {
    n: u64,
    max: u64,
    quantum: u64,
}

struct RenewState {
    staged: Option<Staged>,
    /// True from the moment a renewal is triggered until its outcome is
    /// recorded. Promotion waits on this, never on the renewal thread
    /// itself.
    in_flight: bool,
}

struct EngineShared<S> {
    domain: String,
    offset_on_create: u64,
    store: Arc<S>,
    config: Arc<Config>,
    bucket: Mutex<Bucket>,
    renew: Mutex<RenewState>,
    renew_done: Condvar,
    renew_count: AtomicU64,
    renew_err_count: AtomicU64,
}

/// Per-domain ID dispenser.
///
/// An engine serves strictly increasing IDs from an in-memory segment and
/// renews that segment through the builder's [`LeaseStore`] — synchronously
/// for the engine's first-ever lease (there is nothing to dispense yet),
/// in the background afterwards, triggered early enough that the active
/// segment keeps serving callers while the next one is fetched.
///
/// Engines are cheap clone handles over shared state; clones dispense from
/// the same segment. Dispensing for one domain is fully serialized by an
/// exclusive lock: callers needing more throughput than one lock allows
/// should shard across multiple domains.
///
/// Obtained from [`Builder::build`]; engines live as long as their builder
/// and are never individually destroyed.
///
/// # Example
///
/// ```
/// use segid::{Builder, Config, Deadline, MemoryLeaseStore};
///
/// let builder = Builder::new(MemoryLeaseStore::new(), Config::default());
/// builder.prepare(Deadline::none())?;
///
/// let orders = builder.build_with_offset("order", 0)?;
/// assert_eq!(orders.next()?, 1);
/// assert_eq!(orders.next()?, 2);
/// assert_eq!(orders.next_n(5)?, 7); // last ID of the batch
/// # Ok::<(), segid::Error>(())
/// ```
///
/// [`Builder::build`]: crate::Builder::build
pub struct SegmentEngine<S> {
    shared: Arc<EngineShared<S>>,
}

impl<S> Clone for SegmentEngine<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: LeaseStore> SegmentEngine<S> {
    pub(crate) fn new(
        domain: String,
        offset_on_create: u64,
        store: Arc<S>,
        config: Arc<Config>,
    ) -> Self {
        let initial_quantum = config.initial_quantum;
        Self {
            shared: Arc::new(EngineShared {
                domain,
                offset_on_create,
                store,
                config,
                bucket: Mutex::new(Bucket {
                    n: 0,
                    max: 0,
                    // Seeded so the first-ever renewal sizes its lease from
                    // the configured initial quantum.
                    quantum: initial_quantum,
                    activated_at: None,
                    critical: 0,
                }),
                renew: Mutex::new(RenewState {
                    staged: None,
                    in_flight: false,
                }),
                renew_done: Condvar::new(),
                renew_count: AtomicU64::new(0),
                renew_err_count: AtomicU64::new(0),
            }),
        }
    }

    /// The domain this engine dispenses for.
    pub fn domain(&self) -> &str {
        &self.shared.domain
    }

    /// Returns the next unique ID for this domain.
    ///
    /// Equivalent to `next_n(1)`. IDs are strictly increasing across all
    /// clones of this engine; uniqueness across processes is guaranteed by
    /// the lease store.
    pub fn next(&self) -> Result<u64> {
        self.next_n(1)
    }

    /// Reserves `count` consecutive IDs and returns the **last** of them.
    ///
    /// A `count` of zero is treated as one. The whole batch runs under one
    /// critical section. On failure no partial result is returned, but
    /// progress made before the failing step is retained in engine state: a
    /// failed `next_n(5)` that completed 3 steps still advanced the counter
    /// by 3, and the error applies only to the unfulfilled remainder.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    pub fn next_n(&self, count: usize) -> Result<u64> {
        let count = count.max(1);
        let started = Instant::now();

        let mut bucket = self.shared.bucket.lock();
        let mut last = 0;
        let mut failure = None;
        for _ in 0..count {
            match self.next_one(&mut bucket) {
                Ok(id) => last = id,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        drop(bucket);

        self.report_dispense(count, started);
        match failure {
            Some(err) => Err(err),
            None => Ok(last),
        }
    }

    /// Like [`next`], but panics on error.
    ///
    /// Intended only for call sites with no recovery story.
    ///
    /// # Panics
    ///
    /// Panics if the engine cannot dispense, e.g. the segment is exhausted
    /// with no renewed segment available, or the limitation ceiling was
    /// reached.
    ///
    /// [`next`]: Self::next
    pub fn must_next(&self) -> u64 {
        self.must_next_n(1)
    }

    /// Like [`next_n`], but panics on error.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`must_next`].
    ///
    /// [`next_n`]: Self::next_n
    /// [`must_next`]: Self::must_next
    pub fn must_next_n(&self, count: usize) -> u64 {
        match self.next_n(count) {
            Ok(id) => id,
            Err(err) => panic!("next failed for domain {:?}: {err}", self.shared.domain),
        }
    }

    /// Consistent snapshot of the engine's dispensing state.
    ///
    /// Taken under the dispensing lock, so it never observes a bucket
    /// mid-promotion.
    pub fn stats(&self) -> Stats {
        let bucket = self.shared.bucket.lock();
        Stats {
            current: bucket.n,
            max: bucket.max,
            renew_count: self.shared.renew_count.load(Ordering::Relaxed),
            renew_err_count: self.shared.renew_err_count.load(Ordering::Relaxed),
        }
    }

    /// Single-ID step; runs with the dispensing lock held.
    fn next_one(&self, bucket: &mut MutexGuard<'_, Bucket>) -> Result<u64> {
        if bucket.n == bucket.critical {
            // Lease size is decided at trigger time, while the bucket state
            // is at hand; the renewal itself never touches the bucket lock.
            let quantum = next_quantum(
                bucket.quantum,
                bucket.activated_at,
                self.shared.config.segment_duration,
                self.shared.config.min_quantum,
                self.shared.config.max_quantum,
            );
            self.shared.begin_renewal();
            if bucket.activated_at.is_none() {
                // First-ever renewal: no usable bucket exists, the caller
                // blocks until a lease is obtained or the budget runs out.
                self.shared.run_renewal(quantum);
            } else {
                let shared = Arc::clone(&self.shared);
                thread::spawn(move || shared.run_renewal(quantum));
            }
        }

        if bucket.n >= bucket.max {
            let mut renew = self.shared.renew.lock();
            while renew.in_flight {
                self.shared.renew_done.wait(&mut renew);
            }
            let Some(staged) = renew.staged.take() else {
                #[cfg(feature = "tracing")]
                tracing::error!(domain = %self.shared.domain, "id segment run out");
                return Err(Error::IdExhausted);
            };
            drop(renew);

            bucket.n = staged.n;
            bucket.max = staged.max;
            bucket.quantum = staged.quantum;
            bucket.activated_at = Some(Instant::now());
            // The trigger point must stay strictly ahead of n; a step of
            // zero would re-trigger renewal on every call indefinitely.
            let step = ((bucket.max - bucket.n)
                .saturating_mul(self.shared.config.renew_percent)
                / 100)
                .max(1);
            bucket.critical = bucket.n.saturating_add(step);
        }

        let next = bucket
            .n
            .checked_add(1)
            .filter(|next| *next <= self.shared.config.limitation)
            .ok_or_else(|| {
                #[cfg(feature = "tracing")]
                tracing::error!(domain = %self.shared.domain, "id limitation reached");
                Error::LimitReached
            })?;
        bucket.n = next;
        Ok(next)
    }

    fn report_dispense(&self, count: usize, started: Instant) {
        #[cfg(feature = "tracing")]
        if let Some(threshold) = self.shared.config.slow_threshold {
            let elapsed = started.elapsed();
            if elapsed >= threshold {
                tracing::warn!(
                    domain = %self.shared.domain,
                    count,
                    ?elapsed,
                    "slow id dispense"
                );
            }
        }
    }
}

impl<S: LeaseStore> EngineShared<S> {
    /// Marks a renewal as in flight. Exhausted callers wait on this flag
    /// instead of racing the renewal for the staged slot.
    fn begin_renewal(&self) {
        self.renew.lock().in_flight = true;
    }

    /// Obtains a lease and records the outcome in the staged slot.
    ///
    /// Runs on the dispensing thread for the first-ever renewal, on a
    /// spawned thread afterwards. Never takes the bucket lock.
    fn run_renewal(&self, quantum: u64) {
        let outcome = self.reserve_with_retry(quantum).and_then(|prev| {
            prev.checked_add(quantum)
                .map(|max| Staged {
                    n: prev,
                    max,
                    quantum,
                })
                .ok_or_else(|| StoreError::contract("reserved range overflows u64"))
        });

        let mut renew = self.renew.lock();
        match outcome {
            Ok(staged) => {
                self.renew_count.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    domain = %self.domain,
                    next_n = staged.n,
                    next_max = staged.max,
                    quantum = staged.quantum,
                    "segment renewed"
                );
                renew.staged = Some(staged);
            }
            Err(_err) => {
                self.renew_err_count.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "tracing")]
                tracing::error!(domain = %self.domain, error = %_err, "segment renewal failed");
            }
        }
        renew.in_flight = false;
        drop(renew);
        self.renew_done.notify_all();
    }

    /// Bounded retry loop around the store's lease operation.
    ///
    /// Each attempt gets a fresh deadline; a panicking store is converted
    /// into a failed attempt so a misbehaving driver cannot take the
    /// renewal state machine down with it.
    fn reserve_with_retry(&self, quantum: u64) -> Result<u64, StoreError> {
        let attempts = self.config.renew_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let deadline = Deadline::after(self.config.renew_timeout);
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                self.store
                    .lease(&self.domain, quantum, self.offset_on_create, deadline)
            }))
            .unwrap_or_else(|panic| Err(StoreError::contract(panic_reason(panic))));

            match outcome {
                Ok(prev) => return Ok(prev),
                Err(_err) if attempt < attempts => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        domain = %self.domain,
                        attempt,
                        error = %_err,
                        "renew attempt failed, retrying"
                    );
                    thread::sleep((self.config.renew_retry_delay)(attempt));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn panic_reason(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(reason) = panic.downcast_ref::<&str>() {
        format!("store panicked: {reason}")
    } else if let Some(reason) = panic.downcast_ref::<String>() {
        format!("store panicked: {reason}")
    } else {
        "store panicked".to_owned()
    }
}
