//! Queue table: FIFO fetch entries moving `queued → in_flight → deleted`.

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};
use std::time::SystemTime;
use thiserror::Error;

use courier_types::{FetchRequest, OrderingKey, ReqId};

use crate::ActorStore;
use crate::sqlite_util::{from_sql_ms, to_sql_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Queued,
    InFlight,
}

impl EntryState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InFlight => "in_flight",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "in_flight" => Some(Self::InFlight),
            _ => None,
        }
    }
}

/// A queue row as persisted, decoded lazily so one bad row cannot poison a batch.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub raw_key: String,
    pub req_id: String,
    pub state: String,
    pub not_before_ms: u64,
    pub payload_json: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub ordering_key: OrderingKey,
    pub state: EntryState,
    pub not_before_ms: u64,
    pub request: FetchRequest,
}

/// A row that could not be decoded.
#[derive(Debug, Clone, Error)]
#[error("corrupt queue entry {raw_key} (req {req_id}): {reason}")]
pub struct CorruptEntry {
    pub raw_key: String,
    pub req_id: String,
    pub reason: String,
}

impl StoredEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            raw_key: row.get(0)?,
            req_id: row.get(1)?,
            state: row.get(2)?,
            not_before_ms: from_sql_ms(row.get(3)?),
            payload_json: row.get(4)?,
        })
    }

    pub fn decode(&self) -> Result<QueueEntry, CorruptEntry> {
        let corrupt = |reason: String| CorruptEntry {
            raw_key: self.raw_key.clone(),
            req_id: self.req_id.clone(),
            reason,
        };
        let ordering_key: OrderingKey = self.raw_key.parse().map_err(|e| corrupt(format!("{e}")))?;
        let state = EntryState::parse(&self.state)
            .ok_or_else(|| corrupt(format!("unknown state {:?}", self.state)))?;
        let request: FetchRequest = serde_json::from_str(&self.payload_json)
            .map_err(|e| corrupt(format!("payload: {e}")))?;
        if request.req_id.as_str() != self.req_id {
            return Err(corrupt(format!(
                "payload req_id {} does not match row",
                request.req_id
            )));
        }
        Ok(QueueEntry {
            ordering_key,
            state,
            not_before_ms: self.not_before_ms,
            request,
        })
    }
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("request {0} already has an active queue entry")]
    Duplicate(ReqId),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub queued: u64,
    pub in_flight: u64,
}

const ENTRY_COLUMNS: &str = "ordering_key, req_id, state, not_before_ms, payload_json";

impl ActorStore {
    /// Append `request` as a queued entry created at `at`, eligible from `not_before_ms`.
    pub fn enqueue(
        &self,
        request: &FetchRequest,
        at: SystemTime,
        not_before_ms: u64,
    ) -> Result<OrderingKey, EnqueueError> {
        let payload = serde_json::to_string(request).context("Failed to serialize fetch request")?;
        let mut inner = self.lock()?;
        let key = inner.next_key(at)?;
        let tx = inner
            .db
            .transaction()
            .context("Failed to start enqueue transaction")?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM fetch_queue WHERE req_id = ?1",
                params![request.req_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to check for active entry")?;
        if exists.is_some() {
            return Err(EnqueueError::Duplicate(request.req_id.clone()));
        }

        tx.execute(
            "INSERT INTO fetch_queue (ordering_key, req_id, state, not_before_ms, payload_json)
             VALUES (?1, ?2, 'queued', ?3, ?4)",
            params![
                key.to_string(),
                request.req_id.as_str(),
                to_sql_ms(not_before_ms),
                payload
            ],
        )
        .with_context(|| format!("Failed to insert queue entry for {}", request.req_id))?;
        tx.commit().context("Failed to commit enqueue")?;
        Ok(key)
    }

    /// Move up to `limit` eligible queued entries to in-flight, oldest key first.
    pub fn claim_batch(&self, limit: usize, now_ms: u64) -> Result<Vec<StoredEntry>> {
        let mut inner = self.lock()?;
        let tx = inner
            .db
            .transaction()
            .context("Failed to start claim transaction")?;

        let entries = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM fetch_queue
                     WHERE state = 'queued' AND not_before_ms <= ?1
                     ORDER BY ordering_key ASC LIMIT ?2"
                ))
                .context("Failed to prepare claim query")?;
            let rows = stmt
                .query_map(
                    params![to_sql_ms(now_ms), i64::try_from(limit).unwrap_or(i64::MAX)],
                    StoredEntry::from_row,
                )
                .context("Failed to query queued entries")?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read queued entries")?
        };

        for entry in &entries {
            tx.execute(
                "UPDATE fetch_queue SET state = 'in_flight' WHERE ordering_key = ?1",
                params![entry.raw_key],
            )
            .with_context(|| format!("Failed to mark {} in flight", entry.raw_key))?;
        }
        tx.commit().context("Failed to commit claim")?;

        Ok(entries
            .into_iter()
            .map(|mut entry| {
                entry.state = EntryState::InFlight.as_str().to_string();
                entry
            })
            .collect())
    }

    /// Replace the in-flight entry `key` with a fresh queued entry for `next`.
    ///
    /// Returns `None` when `key` is no longer in flight; nothing is inserted then.
    pub fn requeue(
        &self,
        key: &OrderingKey,
        next: &FetchRequest,
        at: SystemTime,
        not_before_ms: u64,
    ) -> Result<Option<OrderingKey>> {
        let payload = serde_json::to_string(next).context("Failed to serialize fetch request")?;
        let mut inner = self.lock()?;
        let new_key = inner.next_key(at)?;
        let tx = inner
            .db
            .transaction()
            .context("Failed to start requeue transaction")?;

        let removed = tx
            .execute(
                "DELETE FROM fetch_queue WHERE ordering_key = ?1 AND state = 'in_flight'",
                params![key.to_string()],
            )
            .with_context(|| format!("Failed to remove in-flight entry {key}"))?;
        if removed == 0 {
            return Ok(None);
        }

        tx.execute(
            "INSERT INTO fetch_queue (ordering_key, req_id, state, not_before_ms, payload_json)
             VALUES (?1, ?2, 'queued', ?3, ?4)",
            params![
                new_key.to_string(),
                next.req_id.as_str(),
                to_sql_ms(not_before_ms),
                payload
            ],
        )
        .with_context(|| format!("Failed to requeue {}", next.req_id))?;
        tx.commit().context("Failed to commit requeue")?;
        Ok(Some(new_key))
    }

    /// Delete the in-flight entry `key`. `true` means this caller removed it.
    pub fn complete(&self, key: &OrderingKey) -> Result<bool> {
        let inner = self.lock()?;
        let removed = inner
            .db
            .execute(
                "DELETE FROM fetch_queue WHERE ordering_key = ?1 AND state = 'in_flight'",
                params![key.to_string()],
            )
            .with_context(|| format!("Failed to complete entry {key}"))?;
        Ok(removed > 0)
    }

    pub fn in_flight_entries(&self) -> Result<Vec<StoredEntry>> {
        let inner = self.lock()?;
        let mut stmt = inner
            .db
            .prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM fetch_queue
                 WHERE state = 'in_flight' ORDER BY ordering_key ASC"
            ))
            .context("Failed to prepare in-flight query")?;
        let rows = stmt
            .query_map([], StoredEntry::from_row)
            .context("Failed to query in-flight entries")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read in-flight entries")
    }

    /// Return an orphaned in-flight entry to the queue, keeping its position.
    pub fn restore_queued(&self, key: &OrderingKey) -> Result<bool> {
        let inner = self.lock()?;
        let updated = inner
            .db
            .execute(
                "UPDATE fetch_queue SET state = 'queued'
                 WHERE ordering_key = ?1 AND state = 'in_flight'",
                params![key.to_string()],
            )
            .with_context(|| format!("Failed to restore entry {key}"))?;
        Ok(updated > 0)
    }

    /// Drop a row by its raw key, whatever its state or payload.
    pub fn discard(&self, raw_key: &str) -> Result<bool> {
        let inner = self.lock()?;
        let removed = inner
            .db
            .execute(
                "DELETE FROM fetch_queue WHERE ordering_key = ?1",
                params![raw_key],
            )
            .with_context(|| format!("Failed to discard entry {raw_key}"))?;
        Ok(removed > 0)
    }

    /// The active entry for `req_id`, if any.
    pub fn entry_for(&self, req_id: &ReqId) -> Result<Option<StoredEntry>> {
        let inner = self.lock()?;
        inner
            .db
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM fetch_queue WHERE req_id = ?1"),
                params![req_id.as_str()],
                StoredEntry::from_row,
            )
            .optional()
            .context("Failed to query queue entry")
    }

    /// Earliest `not_before_ms` among queued entries.
    pub fn next_eligible_at(&self) -> Result<Option<u64>> {
        let inner = self.lock()?;
        let next: Option<i64> = inner
            .db
            .query_row(
                "SELECT MIN(not_before_ms) FROM fetch_queue WHERE state = 'queued'",
                [],
                |row| row.get(0),
            )
            .context("Failed to query next eligible entry")?;
        Ok(next.map(from_sql_ms))
    }

    pub fn queue_stats(&self) -> Result<QueueStats> {
        let inner = self.lock()?;
        let (queued, in_flight): (i64, i64) = inner
            .db
            .query_row(
                "SELECT
                     COALESCE(SUM(state = 'queued'), 0),
                     COALESCE(SUM(state = 'in_flight'), 0)
                 FROM fetch_queue",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Failed to query queue stats")?;
        Ok(QueueStats {
            queued: u64::try_from(queued).unwrap_or_default(),
            in_flight: u64::try_from(in_flight).unwrap_or_default(),
        })
    }

    pub fn alarm_at(&self) -> Result<Option<u64>> {
        let inner = self.lock()?;
        let at: Option<i64> = inner
            .db
            .query_row(
                "SELECT fires_at_ms FROM queue_alarm WHERE slot = 0",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query queue alarm")?;
        Ok(at.map(from_sql_ms))
    }

    /// Make sure the queue alarm fires no later than `at_ms`.
    pub fn set_alarm_no_later_than(&self, at_ms: u64) -> Result<()> {
        let inner = self.lock()?;
        inner
            .db
            .execute(
                "INSERT INTO queue_alarm (slot, fires_at_ms) VALUES (0, ?1)
                 ON CONFLICT(slot) DO UPDATE SET fires_at_ms = MIN(fires_at_ms, excluded.fires_at_ms)",
                params![to_sql_ms(at_ms)],
            )
            .context("Failed to pull queue alarm forward")?;
        Ok(())
    }

    /// Consume the queue alarm if it is due. `true` means this caller owns the firing.
    pub fn take_due_alarm(&self, now_ms: u64) -> Result<bool> {
        let inner = self.lock()?;
        let removed = inner
            .db
            .execute(
                "DELETE FROM queue_alarm WHERE slot = 0 AND fires_at_ms <= ?1",
                params![to_sql_ms(now_ms)],
            )
            .context("Failed to take queue alarm")?;
        Ok(removed > 0)
    }
}
