//! SQLite-backed [`LeaseStore`] for `segid`.
//!
//! One row per domain holds the domain's high-water mark. Reservations run
//! inside an immediate-mode write transaction: the transaction takes the
//! database write lock up front, reads the current mark, bumps it by the
//! requested quantum and commits — so reservations are serialized and any
//! number of processes sharing the database file receive disjoint ranges.
//! Writers for *different* domains queue behind the same database-level
//! write lock (SQLite locks the database, not rows); waits are bounded by
//! the configured busy timeout.
//!
//! Unknown domains are not created here: [`reserve`] reports
//! [`StoreError::DomainNotFound`] and the generic lease wrapper layers the
//! create-then-retry dance on top, because SQLite (like the other target
//! stores) has no atomic upsert that seeds inserts with a different value
//! than the update applies.
//!
//! [`reserve`]: LeaseStore::reserve
//!
//! # Example
//!
//! ```no_run
//! use segid::{Builder, Config, Deadline};
//! use segid_sqlite::SqliteLeaseStore;
//!
//! let store = SqliteLeaseStore::open("/var/lib/myapp/segid.db")?;
//! let builder = Builder::new(store, Config::default());
//! builder.prepare(Deadline::none())?;
//! let id = builder.build("player")?.next()?;
//! # Ok::<(), segid::Error>(())
//! ```

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use segid::{Deadline, LeaseStore, StoreError};
use std::path::Path;
use std::time::Duration;

/// Connection settings for [`SqliteLeaseStore`].
#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    /// Table holding one row per domain.
    pub table: String,
    /// Default per-operation timeout, applied when the caller supplies no
    /// deadline. Also bounds how long a reservation waits on the database
    /// write lock.
    pub default_timeout: Duration,
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            table: "segid".to_owned(),
            default_timeout: Duration::from_secs(15),
        }
    }
}

/// Reference [`LeaseStore`] over a SQLite database file.
///
/// The connection is owned for the lifetime of the store and closed by
/// [`destroy`]; afterwards every operation fails with a backend error. Open
/// one store per process and share the database file between processes.
///
/// [`destroy`]: LeaseStore::destroy
pub struct SqliteLeaseStore {
    conn: Mutex<Option<Connection>>,
    table: String,
    default_timeout: Duration,
}

impl SqliteLeaseStore {
    /// Opens (or creates) the database at `path` with default settings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with(path, SqliteStoreConfig::default())
    }

    /// Opens (or creates) the database at `path`.
    pub fn open_with(
        path: impl AsRef<Path>,
        config: SqliteStoreConfig,
    ) -> Result<Self, StoreError> {
        // The table name is spliced into SQL; restrict it to a plain
        // identifier.
        let valid = !config.table.is_empty()
            && !config.table.starts_with(|c: char| c.is_ascii_digit())
            && config
                .table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(StoreError::contract(format!(
                "invalid table name {:?}",
                config.table
            )));
        }

        let conn = Connection::open(path).map_err(StoreError::backend)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            table: config.table,
            default_timeout: config.default_timeout,
        })
    }

    /// Runs `f` against the live connection with the deadline's remaining
    /// time applied as the busy timeout.
    fn with_conn<T>(
        &self,
        deadline: Deadline,
        f: impl FnOnce(&mut Connection, &str) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let deadline = deadline.or_default(self.default_timeout);
        if deadline.expired() {
            return Err(StoreError::Timeout);
        }
        let mut guard = self.conn.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| StoreError::backend("connection has been closed"))?;
        let timeout = deadline.remaining().unwrap_or(self.default_timeout);
        conn.busy_timeout(timeout).map_err(StoreError::backend)?;
        f(conn, &self.table)
    }
}

impl LeaseStore for SqliteLeaseStore {
    fn prepare(&self, deadline: Deadline) -> Result<(), StoreError> {
        self.with_conn(deadline, |conn, table| {
            // WAL keeps readers off the writer's back across processes;
            // FULL makes a committed reservation durable before it is
            // handed out.
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StoreError::backend)?;
            conn.pragma_update(None, "synchronous", "FULL")
                .map_err(StoreError::backend)?;
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        domain TEXT PRIMARY KEY,
                        id INTEGER NOT NULL
                    )"
                ),
                [],
            )
            .map_err(StoreError::backend)?;

            #[cfg(feature = "tracing")]
            tracing::debug!(table, "sqlite lease store prepared");
            Ok(())
        })
    }

    fn destroy(&self, _deadline: Deadline) -> Result<(), StoreError> {
        match self.conn.lock().take() {
            Some(conn) => conn.close().map_err(|(_conn, err)| StoreError::backend(err)),
            None => Ok(()),
        }
    }

    fn reserve(&self, domain: &str, quantum: u64, deadline: Deadline) -> Result<u64, StoreError> {
        let quantum = i64::try_from(quantum)
            .map_err(|_| StoreError::contract("quantum exceeds the store's integer range"))?;

        self.with_conn(deadline, |conn, table| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(StoreError::backend)?;

            let current: Option<i64> = tx
                .query_row(
                    &format!("SELECT id FROM {table} WHERE domain = ?1"),
                    params![domain],
                    |row| row.get(0),
                )
                .optional()
                .map_err(StoreError::backend)?;
            // Dropping the transaction rolls back; nothing is created on a
            // missing domain.
            let Some(current) = current else {
                return Err(StoreError::DomainNotFound);
            };

            // The increment is computed here rather than in SQL: SQLite
            // silently promotes overflowing integer arithmetic to REAL,
            // which would corrupt the mark.
            let next = current.checked_add(quantum).ok_or_else(|| {
                StoreError::contract("high-water mark overflows the store's integer range")
            })?;
            let affected = tx
                .execute(
                    &format!("UPDATE {table} SET id = ?1 WHERE domain = ?2"),
                    params![next, domain],
                )
                .map_err(StoreError::backend)?;
            if affected != 1 {
                return Err(StoreError::contract(format!(
                    "expected to update 1 row for domain {domain:?}, updated {affected}"
                )));
            }
            tx.commit().map_err(StoreError::backend)?;

            u64::try_from(current)
                .map_err(|_| StoreError::contract("negative high-water mark in store"))
        })
    }

    fn create_domain(
        &self,
        domain: &str,
        offset: u64,
        deadline: Deadline,
    ) -> Result<(), StoreError> {
        let offset = i64::try_from(offset)
            .map_err(|_| StoreError::contract("offset exceeds the store's integer range"))?;

        self.with_conn(deadline, |conn, table| {
            // OR IGNORE: a racing creator keeps its row, we keep going.
            conn.execute(
                &format!("INSERT OR IGNORE INTO {table} (domain, id) VALUES (?1, ?2)"),
                params![domain, offset],
            )
            .map_err(StoreError::backend)?;

            #[cfg(feature = "tracing")]
            tracing::debug!(domain, offset, "domain created");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::thread::scope;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> SqliteLeaseStore {
        let store = SqliteLeaseStore::open(dir.path().join("segid.db")).unwrap();
        store.prepare(Deadline::none()).unwrap();
        store
    }

    #[test]
    fn prepare_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.prepare(Deadline::none()).unwrap();
        store.prepare(Deadline::none()).unwrap();
    }

    #[test]
    fn reserve_unknown_domain_reports_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(matches!(
            store.reserve("player", 100, Deadline::none()),
            Err(StoreError::DomainNotFound)
        ));
        // The miss created nothing.
        assert!(matches!(
            store.reserve("player", 100, Deadline::none()),
            Err(StoreError::DomainNotFound)
        ));
    }

    #[test]
    fn reserve_returns_pre_increment_value() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store
            .create_domain("player", 30_000_000, Deadline::none())
            .unwrap();

        assert_eq!(
            store.reserve("player", 1_000, Deadline::none()).unwrap(),
            30_000_000
        );
        assert_eq!(
            store.reserve("player", 1_000, Deadline::none()).unwrap(),
            30_001_000
        );
    }

    #[test]
    fn create_domain_loses_to_existing_row() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.create_domain("player", 100, Deadline::none()).unwrap();
        store.create_domain("player", 999, Deadline::none()).unwrap();

        assert_eq!(store.reserve("player", 1, Deadline::none()).unwrap(), 100);
    }

    #[test]
    fn lease_dance_creates_and_reserves() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let prev = store
            .lease("player", 1_000, 30_000_000, Deadline::none())
            .unwrap();
        assert_eq!(prev, 30_000_000);
    }

    #[test]
    fn values_beyond_i64_are_contract_errors() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(matches!(
            store.create_domain("player", u64::MAX, Deadline::none()),
            Err(StoreError::Contract { .. })
        ));

        store
            .create_domain("player", i64::MAX as u64 - 5, Deadline::none())
            .unwrap();
        assert!(matches!(
            store.reserve("player", 100, Deadline::none()),
            Err(StoreError::Contract { .. })
        ));
    }

    #[test]
    fn invalid_table_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let config = SqliteStoreConfig {
            table: "segid; DROP TABLE segid".to_owned(),
            ..SqliteStoreConfig::default()
        };
        assert!(matches!(
            SqliteLeaseStore::open_with(dir.path().join("segid.db"), config),
            Err(StoreError::Contract { .. })
        ));
    }

    #[test]
    fn destroyed_store_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.destroy(Deadline::none()).unwrap();
        assert!(store.reserve("player", 1, Deadline::none()).is_err());
    }

    #[test]
    fn concurrent_same_domain_reserves_are_disjoint() {
        const THREADS: usize = 4;
        const RESERVES_PER_THREAD: usize = 25;
        const QUANTUM: u64 = 10;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("segid.db");
        open_store(&dir)
            .create_domain("player", 0, Deadline::none())
            .unwrap();

        let previous_values = StdMutex::new(HashSet::new());
        scope(|s| {
            for _ in 0..THREADS {
                let path = &path;
                let previous_values = &previous_values;
                s.spawn(move || {
                    // Each thread is its own "process" with its own
                    // connection.
                    let store = SqliteLeaseStore::open(path).unwrap();
                    for _ in 0..RESERVES_PER_THREAD {
                        let prev = store.reserve("player", QUANTUM, Deadline::none()).unwrap();
                        assert!(previous_values.lock().unwrap().insert(prev));
                    }
                });
            }
        });

        let previous_values = previous_values.into_inner().unwrap();
        let total = THREADS * RESERVES_PER_THREAD;
        assert_eq!(previous_values.len(), total);
        // Serialized increments leave no holes: the range bases are exactly
        // 0, 10, 20, ...
        assert_eq!(
            previous_values.iter().max().copied(),
            Some((total as u64 - 1) * QUANTUM)
        );
    }
}
