use anyhow::{Context, Result, anyhow};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;
use ulid::Generator;

use courier_types::OrderingKey;

use crate::sqlite_util::open_secure_db;

/// SQLite-backed storage for one actor instance.
///
/// The connection sits behind a mutex so the store can be shared with detached
/// tasks; callers still serialize logical transitions through the actor's turn.
pub struct ActorStore {
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
}

pub(crate) struct Inner {
    pub(crate) db: Connection,
    keys: Generator,
}

impl Inner {
    /// Next ordering key, monotonic for the lifetime of this store handle.
    pub(crate) fn next_key(&mut self, at: SystemTime) -> Result<OrderingKey> {
        self.keys
            .generate_from_datetime(at)
            .map(OrderingKey::from_ulid)
            .map_err(|e| anyhow!("Failed to generate ordering key: {e}"))
    }
}

impl ActorStore {
    const SCHEMA: &'static str = r"
        CREATE TABLE IF NOT EXISTS fetch_queue (
            ordering_key TEXT PRIMARY KEY,
            req_id TEXT NOT NULL UNIQUE,
            state TEXT NOT NULL CHECK (state IN ('queued', 'in_flight')),
            not_before_ms INTEGER NOT NULL,
            payload_json TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_fetch_queue_state
        ON fetch_queue(state, ordering_key);

        CREATE TABLE IF NOT EXISTS wakeups (
            req_id TEXT PRIMARY KEY,
            fires_at_ms INTEGER NOT NULL,
            payload_json TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_wakeups_fires_at
        ON wakeups(fires_at_ms);

        CREATE TABLE IF NOT EXISTS queue_alarm (
            slot INTEGER PRIMARY KEY CHECK (slot = 0),
            fires_at_ms INTEGER NOT NULL
        );
    ";

    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = open_secure_db(path)?;
        Self::initialize(db, Some(path.to_path_buf()))
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory().context("Failed to open in-memory actor store")?;
        Self::initialize(db, None)
    }

    fn initialize(db: Connection, path: Option<PathBuf>) -> Result<Self> {
        db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .context("Failed to set actor store pragmas")?;
        db.execute_batch(Self::SCHEMA)
            .context("Failed to create actor store schema")?;
        Ok(Self {
            inner: Mutex::new(Inner {
                db,
                keys: Generator::new(),
            }),
            path,
        })
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("actor store lock poisoned"))
    }

    /// Earliest persisted deadline: a race wake-up or the queue alarm.
    pub fn next_alarm_at(&self) -> Result<Option<u64>> {
        let inner = self.lock()?;
        let next: Option<i64> = inner
            .db
            .query_row(
                "SELECT MIN(fires_at_ms) FROM (
                     SELECT fires_at_ms FROM wakeups
                     UNION ALL
                     SELECT fires_at_ms FROM queue_alarm
                 )",
                [],
                |row| row.get(0),
            )
            .context("Failed to query next alarm")?;
        Ok(next.map(crate::sqlite_util::from_sql_ms))
    }
}
