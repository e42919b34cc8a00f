mod memory;

pub use memory::MemoryLeaseStore;

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Boxed error carried by [`StoreError::Backend`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by [`LeaseStore`] implementations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The domain has no row/entry in the store. Sentinel consumed by
    /// [`LeaseStore::lease`]; it never escapes the store boundary.
    #[error("domain not found")]
    DomainNotFound,

    /// The store misbehaved in a way that violates the contract (e.g. an
    /// update affecting anything other than exactly one row). Treated like
    /// any other failed attempt by the renewal retry loop.
    #[error("store contract violation: {reason}")]
    Contract { reason: String },

    /// The operation's deadline elapsed.
    #[error("store operation timed out")]
    Timeout,

    /// Infrastructure failure in the underlying store client.
    #[error("{0}")]
    Backend(BoxError),
}

impl StoreError {
    pub fn backend(err: impl Into<BoxError>) -> Self {
        Self::Backend(err.into())
    }

    pub fn contract(reason: impl Into<String>) -> Self {
        Self::Contract {
            reason: reason.into(),
        }
    }
}

/// Optional point in time by which a store operation should complete.
///
/// This is the caller-supplied deadline for store calls: engines derive one
/// from the configured renewal timeout for every `reserve` attempt, while
/// lifecycle calls may pass [`Deadline::none`] and let the driver apply its
/// own default via [`Deadline::or_default`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use segid::Deadline;
///
/// let deadline = Deadline::after(Duration::from_secs(5));
/// assert!(!deadline.expired());
/// assert!(deadline.remaining().unwrap() <= Duration::from_secs(5));
///
/// // Unset deadlines resolve to the driver's default.
/// let deadline = Deadline::none().or_default(Duration::from_secs(15));
/// assert!(deadline.remaining().is_some());
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline; drivers substitute their default timeout.
    pub const fn none() -> Self {
        Self(None)
    }

    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self(Some(Instant::now() + timeout))
    }

    /// Deadline at an absolute instant.
    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    /// Returns `self` if a deadline is set, otherwise a deadline `timeout`
    /// from now.
    pub fn or_default(self, timeout: Duration) -> Self {
        if self.0.is_some() {
            self
        } else {
            Self::after(timeout)
        }
    }

    /// Time left until the deadline; zero if already past, `None` if unset.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Whether a set deadline has passed. Unset deadlines never expire.
    pub fn expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }
}

/// Contract between domain engines and a shared backing store.
///
/// An implementation holds one high-water mark per domain and must make
/// [`reserve`] atomic per domain across arbitrary concurrent callers in any
/// number of processes: two racing reservations for the same domain return
/// disjoint ranges. That atomicity is the *only* thing global uniqueness
/// rests on; engines add no cross-process coordination of their own.
///
/// [`reserve`]: LeaseStore::reserve
pub trait LeaseStore: Send + Sync + 'static {
    /// Idempotent setup: create schema/collection if absent. Safe to call
    /// multiple times.
    fn prepare(&self, deadline: Deadline) -> Result<(), StoreError>;

    /// Releases the underlying connection/resources. Called at most once by
    /// a correctly used builder.
    fn destroy(&self, deadline: Deadline) -> Result<(), StoreError>;

    /// Atomically reserves `quantum` additional IDs for `domain`, returning
    /// the value immediately preceding the reserved range; the usable range
    /// is `(prev, prev + quantum]`.
    ///
    /// Returns [`StoreError::DomainNotFound`] when the domain has no entry;
    /// implementations must not create one implicitly.
    fn reserve(&self, domain: &str, quantum: u64, deadline: Deadline) -> Result<u64, StoreError>;

    /// Best-effort creation of `domain` with its high-water mark seeded to
    /// `offset`. Must not disturb an existing entry: when a racing creator
    /// already inserted the domain, this call is a no-op.
    fn create_domain(
        &self,
        domain: &str,
        offset: u64,
        deadline: Deadline,
    ) -> Result<(), StoreError>;

    /// Reserves a range, transparently creating unknown domains.
    ///
    /// The create-on-miss dance is deliberately layered above [`reserve`]:
    /// none of the target stores offer an atomic insert-or-update primitive
    /// that seeds inserts with a *different* value than the update applies.
    /// On [`StoreError::DomainNotFound`] this seeds the domain with
    /// `offset_on_create` — ignoring insert failures, since a racing
    /// creator may have won — and retries the reservation exactly once.
    fn lease(
        &self,
        domain: &str,
        quantum: u64,
        offset_on_create: u64,
        deadline: Deadline,
    ) -> Result<u64, StoreError> {
        match self.reserve(domain, quantum, deadline) {
            Err(StoreError::DomainNotFound) => {
                let _ = self.create_domain(domain, offset_on_create, deadline);
                self.reserve(domain, quantum, deadline)
            }
            outcome => outcome,
        }
    }
}

/// A shared store can back several builders (e.g. one per simulated
/// process in tests).
impl<S: LeaseStore> LeaseStore for Arc<S> {
    fn prepare(&self, deadline: Deadline) -> Result<(), StoreError> {
        (**self).prepare(deadline)
    }

    fn destroy(&self, deadline: Deadline) -> Result<(), StoreError> {
        (**self).destroy(deadline)
    }

    fn reserve(&self, domain: &str, quantum: u64, deadline: Deadline) -> Result<u64, StoreError> {
        (**self).reserve(domain, quantum, deadline)
    }

    fn create_domain(
        &self,
        domain: &str,
        offset: u64,
        deadline: Deadline,
    ) -> Result<(), StoreError> {
        (**self).create_domain(domain, offset, deadline)
    }

    fn lease(
        &self,
        domain: &str,
        quantum: u64,
        offset_on_create: u64,
        deadline: Deadline,
    ) -> Result<u64, StoreError> {
        (**self).lease(domain, quantum, offset_on_create, deadline)
    }
}
