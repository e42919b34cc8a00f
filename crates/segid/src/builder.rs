use crate::{Config, Deadline, Error, LeaseStore, Result, SegmentEngine};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

const UNINITIALIZED: u8 = 0;
const READY: u8 = 1;
const CLOSED: u8 = 2;

/// Owns the lease store connection and the per-domain engines built on it.
///
/// A builder moves through a tri-state lifecycle: it starts uninitialized,
/// becomes ready once [`prepare`] succeeds, and is closed by [`destroy`].
/// Outside the ready state every operation fails fast without touching the
/// store. [`build`] lazily creates one [`SegmentEngine`] per domain; the
/// first caller constructs it and every later (or concurrent) caller
/// receives the same shared instance. Engines are never evicted — they live
/// until the builder is destroyed, after which all of them permanently
/// refuse to renew.
///
/// The store is injected at construction; any [`LeaseStore`] implementation
/// works, including an `Arc`-shared one backing several builders.
///
/// # Example
///
/// ```
/// use segid::{Builder, Config, Deadline, MemoryLeaseStore};
///
/// let builder = Builder::new(MemoryLeaseStore::new(), Config::default());
/// builder.prepare(Deadline::none())?;
///
/// let players = builder.build("player")?;
/// let orders = builder.build("order")?;
/// assert!(players.next().is_ok());
/// assert!(orders.next().is_ok());
///
/// builder.destroy(Deadline::none())?;
/// assert!(builder.build("player").is_err());
/// # Ok::<(), segid::Error>(())
/// ```
///
/// [`prepare`]: Self::prepare
/// [`destroy`]: Self::destroy
/// [`build`]: Self::build
pub struct Builder<S> {
    store: Arc<S>,
    config: Arc<Config>,
    state: AtomicU8,
    engines: RwLock<HashMap<String, SegmentEngine<S>>>,
}

impl<S: LeaseStore> Builder<S> {
    pub fn new(store: S, config: Config) -> Self {
        Self {
            store: Arc::new(store),
            config: Arc::new(config),
            state: AtomicU8::new(UNINITIALIZED),
            engines: RwLock::new(HashMap::new()),
        }
    }

    /// Prepares the backing store (idempotent schema setup) and marks the
    /// builder ready.
    ///
    /// Calling `prepare` on an already-ready builder is a no-op success. If
    /// the store's own preparation fails, the builder returns to the
    /// uninitialized state so the call can be retried.
    pub fn prepare(&self, deadline: Deadline) -> Result<()> {
        match self
            .state
            .compare_exchange(UNINITIALIZED, READY, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                if let Err(err) = self.store.prepare(deadline) {
                    let _ = self.state.compare_exchange(
                        READY,
                        UNINITIALIZED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    return Err(err.into());
                }
                Ok(())
            }
            Err(READY) => Ok(()),
            Err(_) => Err(Error::Closed),
        }
    }

    /// Tears down the shared store connection.
    ///
    /// After `destroy`, every engine of this builder permanently refuses to
    /// renew and the builder rejects all operations with [`Error::Closed`].
    /// Calling `destroy` again is a no-op success; destroying a builder that
    /// was never prepared is an error.
    pub fn destroy(&self, deadline: Deadline) -> Result<()> {
        match self
            .state
            .compare_exchange(READY, CLOSED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => self.store.destroy(deadline).map_err(Error::from),
            Err(CLOSED) => Ok(()),
            Err(_) => Err(Error::NotPrepared),
        }
    }

    /// Returns the engine for `domain`, constructing it on first access.
    ///
    /// Unknown domains are auto-created in the store on their first lease,
    /// seeded with the configured [`offset_on_create`].
    ///
    /// [`offset_on_create`]: Config::offset_on_create
    pub fn build(&self, domain: &str) -> Result<SegmentEngine<S>> {
        self.build_with_offset(domain, self.config.offset_on_create)
    }

    /// Like [`build`], but seeds auto-creation with an explicit offset.
    ///
    /// The offset is captured when the domain's engine is first built; for
    /// an already-built domain the cached engine is returned and
    /// `offset_on_create` is ignored.
    ///
    /// [`build`]: Self::build
    pub fn build_with_offset(&self, domain: &str, offset_on_create: u64) -> Result<SegmentEngine<S>> {
        self.ensure_ready()?;

        if let Some(engine) = self.engines.read().get(domain) {
            return Ok(engine.clone());
        }

        let mut engines = self.engines.write();
        // Another caller may have published the engine while we waited for
        // the write lock.
        if let Some(engine) = engines.get(domain) {
            return Ok(engine.clone());
        }
        let engine = SegmentEngine::new(
            domain.to_owned(),
            offset_on_create,
            Arc::clone(&self.store),
            Arc::clone(&self.config),
        );
        engines.insert(domain.to_owned(), engine.clone());
        Ok(engine)
    }

    /// Visits every engine built so far, e.g. to collect [`Stats`].
    ///
    /// [`Stats`]: crate::Stats
    pub fn for_each(&self, mut f: impl FnMut(&str, &SegmentEngine<S>)) {
        for (domain, engine) in self.engines.read().iter() {
            f(domain, engine);
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state.load(Ordering::Acquire) {
            READY => Ok(()),
            UNINITIALIZED => Err(Error::NotPrepared),
            _ => Err(Error::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryLeaseStore, StoreError};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::thread::scope;
    use std::time::Duration;

    fn config() -> Config {
        Config::default()
            .with_offset_on_create(0)
            .with_initial_quantum(10)
            .with_min_quantum(10)
            .with_max_quantum(10)
            .with_slow_threshold(None)
    }

    #[test]
    fn build_before_prepare_is_rejected() {
        let builder = Builder::new(MemoryLeaseStore::new(), config());
        assert!(matches!(builder.build("player"), Err(Error::NotPrepared)));
    }

    #[test]
    fn prepare_is_idempotent() {
        let builder = Builder::new(MemoryLeaseStore::new(), config());
        builder.prepare(Deadline::none()).unwrap();
        builder.prepare(Deadline::none()).unwrap();
        assert!(builder.build("player").is_ok());
    }

    #[test]
    fn operations_after_destroy_are_rejected() {
        let builder = Builder::new(MemoryLeaseStore::new(), config());
        builder.prepare(Deadline::none()).unwrap();
        builder.destroy(Deadline::none()).unwrap();

        assert!(matches!(builder.build("player"), Err(Error::Closed)));
        assert!(matches!(builder.prepare(Deadline::none()), Err(Error::Closed)));
        // Repeated destroy is a no-op.
        assert!(builder.destroy(Deadline::none()).is_ok());
    }

    #[test]
    fn destroy_before_prepare_is_rejected() {
        let builder = Builder::new(MemoryLeaseStore::new(), config());
        assert!(matches!(
            builder.destroy(Deadline::none()),
            Err(Error::NotPrepared)
        ));
    }

    #[test]
    fn failed_prepare_rolls_back_to_uninitialized() {
        struct FailingPrepareStore {
            fail: AtomicBool,
            inner: MemoryLeaseStore,
        }

        impl LeaseStore for FailingPrepareStore {
            fn prepare(&self, deadline: Deadline) -> Result<(), StoreError> {
                if self.fail.swap(false, Ordering::SeqCst) {
                    return Err(StoreError::backend("schema creation failed"));
                }
                self.inner.prepare(deadline)
            }

            fn destroy(&self, deadline: Deadline) -> Result<(), StoreError> {
                self.inner.destroy(deadline)
            }

            fn reserve(
                &self,
                domain: &str,
                quantum: u64,
                deadline: Deadline,
            ) -> Result<u64, StoreError> {
                self.inner.reserve(domain, quantum, deadline)
            }

            fn create_domain(
                &self,
                domain: &str,
                offset: u64,
                deadline: Deadline,
            ) -> Result<(), StoreError> {
                self.inner.create_domain(domain, offset, deadline)
            }
        }

        let builder = Builder::new(
            FailingPrepareStore {
                fail: AtomicBool::new(true),
                inner: MemoryLeaseStore::new(),
            },
            config(),
        );

        assert!(builder.prepare(Deadline::none()).is_err());
        assert!(matches!(builder.build("player"), Err(Error::NotPrepared)));

        // The failure was transient; a retry succeeds.
        builder.prepare(Deadline::none()).unwrap();
        assert!(builder.build("player").is_ok());
    }

    #[test]
    fn build_returns_the_same_engine_per_domain() {
        let builder = Builder::new(MemoryLeaseStore::new(), config());
        builder.prepare(Deadline::none()).unwrap();

        let first = builder.build("player").unwrap();
        let second = builder.build("player").unwrap();

        // Same shared segment: the sequence continues across handles.
        assert_eq!(first.next().unwrap(), 1);
        assert_eq!(second.next().unwrap(), 2);
    }

    #[test]
    fn domains_are_independent() {
        let builder = Builder::new(MemoryLeaseStore::new(), config());
        builder.prepare(Deadline::none()).unwrap();

        let players = builder.build_with_offset("player", 0).unwrap();
        let orders = builder.build_with_offset("order", 1_000).unwrap();

        assert_eq!(players.next().unwrap(), 1);
        assert_eq!(orders.next().unwrap(), 1_001);
        assert_eq!(players.next().unwrap(), 2);
    }

    #[test]
    fn concurrent_first_access_constructs_one_engine() {
        const THREADS: usize = 8;
        const IDS_PER_THREAD: usize = 100;

        let builder = Builder::new(MemoryLeaseStore::new(), config());
        builder.prepare(Deadline::none()).unwrap();
        let seen = Mutex::new(HashSet::new());

        scope(|s| {
            for _ in 0..THREADS {
                let builder = &builder;
                let seen = &seen;
                s.spawn(move || {
                    let engine = builder.build("player").unwrap();
                    for _ in 0..IDS_PER_THREAD {
                        assert!(seen.lock().unwrap().insert(engine.next().unwrap()));
                    }
                });
            }
        });

        // One engine, one segment chain: all IDs are globally unique.
        assert_eq!(seen.lock().unwrap().len(), THREADS * IDS_PER_THREAD);
    }

    #[test]
    fn engines_from_separate_builders_never_overlap() {
        const IDS_PER_ENGINE: usize = 1_000;

        // Two builders over one shared store simulate two processes.
        let store = Arc::new(MemoryLeaseStore::new());
        let left = Builder::new(Arc::clone(&store), config());
        let right = Builder::new(Arc::clone(&store), config());
        left.prepare(Deadline::none()).unwrap();
        right.prepare(Deadline::none()).unwrap();

        let seen = Mutex::new(HashSet::new());
        scope(|s| {
            for builder in [&left, &right] {
                let seen = &seen;
                s.spawn(move || {
                    let engine = builder.build("player").unwrap();
                    for _ in 0..IDS_PER_ENGINE {
                        let id = engine.next().unwrap();
                        assert!(seen.lock().unwrap().insert(id), "duplicate id {id}");
                    }
                });
            }
        });

        assert_eq!(seen.lock().unwrap().len(), 2 * IDS_PER_ENGINE);
    }

    #[test]
    fn for_each_visits_built_engines() {
        let builder = Builder::new(MemoryLeaseStore::new(), config());
        builder.prepare(Deadline::none()).unwrap();
        builder.build("player").unwrap().next().unwrap();
        builder.build("order").unwrap();

        let mut domains = Vec::new();
        builder.for_each(|domain, engine| {
            domains.push((domain.to_owned(), engine.stats().current));
        });
        domains.sort();

        assert_eq!(domains, vec![("order".into(), 0), ("player".into(), 1)]);
    }

    #[test]
    fn destroyed_builder_reports_closed_from_engines_too() {
        // Engines built before destroy keep serving their cached segment;
        // the lifecycle gate is the builder's, not the engine's.
        let builder = Builder::new(MemoryLeaseStore::new(), config());
        builder.prepare(Deadline::none()).unwrap();
        let engine = builder.build("player").unwrap();
        assert_eq!(engine.next().unwrap(), 1);

        builder.destroy(Deadline::none()).unwrap();
        assert!(matches!(builder.build("order"), Err(Error::Closed)));
        // The already-leased remainder stays dispensable.
        assert_eq!(engine.next().unwrap(), 2);
    }

    #[test]
    fn retry_delay_config_is_honored() {
        // A renewal with three fast-failing attempts completes well within
        // the test budget when the delay function is zero.
        struct AlwaysFailStore {
            attempts: AtomicU32,
        }

        impl LeaseStore for AlwaysFailStore {
            fn prepare(&self, _deadline: Deadline) -> Result<(), StoreError> {
                Ok(())
            }

            fn destroy(&self, _deadline: Deadline) -> Result<(), StoreError> {
                Ok(())
            }

            fn reserve(
                &self,
                _domain: &str,
                _quantum: u64,
                _deadline: Deadline,
            ) -> Result<u64, StoreError> {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::backend("unreachable"))
            }

            fn create_domain(
                &self,
                _domain: &str,
                _offset: u64,
                _deadline: Deadline,
            ) -> Result<(), StoreError> {
                Ok(())
            }
        }

        let store = Arc::new(AlwaysFailStore {
            attempts: AtomicU32::new(0),
        });
        let builder = Builder::new(
            Arc::clone(&store),
            config()
                .with_renew_retries(3)
                .with_renew_retry_delay(|_| Duration::ZERO),
        );
        builder.prepare(Deadline::none()).unwrap();
        let engine = builder.build("player").unwrap();

        assert!(matches!(engine.next(), Err(Error::IdExhausted)));
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(engine.stats().renew_err_count, 1);
    }
}
