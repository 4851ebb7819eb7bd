//! Scheduled wake-ups: one durable timer per raced request.
//!
//! The row's existence is the authorization to deliver. Whoever deletes it
//! first (executor callback, timer expiry, or explicit cancel) owns the outcome;
//! every later attempt finds nothing.

use anyhow::{Context, Result, bail};
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use courier_types::{Continuation, FetchFailure, ReqId};

use crate::ActorStore;
use crate::sqlite_util::{from_sql_ms, to_sql_ms};

/// What a wake-up carries so it can deliver on its own after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WakeupPayload {
    pub continuation: Continuation,
    /// Delivered if the deadline passes before the executor reports back.
    pub timeout: FetchFailure,
    #[serde(default)]
    pub submitted_at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ScheduledWakeup {
    pub req_id: String,
    pub fires_at_ms: u64,
    pub payload_json: String,
}

impl ScheduledWakeup {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            req_id: row.get(0)?,
            fires_at_ms: from_sql_ms(row.get(1)?),
            payload_json: row.get(2)?,
        })
    }

    pub fn payload(&self) -> Result<WakeupPayload, serde_json::Error> {
        serde_json::from_str(&self.payload_json)
    }
}

impl ActorStore {
    /// Persist a wake-up for `req_id`. Fails if one is already pending.
    pub fn schedule_wakeup(
        &self,
        req_id: &ReqId,
        fires_at_ms: u64,
        payload: &WakeupPayload,
    ) -> Result<()> {
        let payload_json =
            serde_json::to_string(payload).context("Failed to serialize wake-up payload")?;
        let inner = self.lock()?;
        let inserted = inner
            .db
            .execute(
                "INSERT OR IGNORE INTO wakeups (req_id, fires_at_ms, payload_json)
                 VALUES (?1, ?2, ?3)",
                params![req_id.as_str(), to_sql_ms(fires_at_ms), payload_json],
            )
            .with_context(|| format!("Failed to schedule wake-up for {req_id}"))?;
        if inserted == 0 {
            bail!("Wake-up for {req_id} is already pending");
        }
        Ok(())
    }

    /// Atomically delete and return the wake-up for `req_id`.
    ///
    /// At most one caller ever receives `Some` for a given schedule.
    /// Takes the raw id so rows that no longer parse can still be cleared.
    pub fn claim_wakeup(&self, req_id: &str) -> Result<Option<ScheduledWakeup>> {
        let inner = self.lock()?;
        inner
            .db
            .query_row(
                "DELETE FROM wakeups WHERE req_id = ?1
                 RETURNING req_id, fires_at_ms, payload_json",
                params![req_id],
                ScheduledWakeup::from_row,
            )
            .optional()
            .with_context(|| format!("Failed to claim wake-up for {req_id}"))
    }

    /// Wake-ups whose deadline is at or before `now_ms`, earliest first. Does not claim.
    pub fn due_wakeups(&self, now_ms: u64) -> Result<Vec<ScheduledWakeup>> {
        let inner = self.lock()?;
        let mut stmt = inner
            .db
            .prepare(
                "SELECT req_id, fires_at_ms, payload_json FROM wakeups
                 WHERE fires_at_ms <= ?1 ORDER BY fires_at_ms ASC, req_id ASC",
            )
            .context("Failed to prepare due wake-up query")?;
        let rows = stmt
            .query_map(params![to_sql_ms(now_ms)], ScheduledWakeup::from_row)
            .context("Failed to query due wake-ups")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read due wake-ups")
    }

    /// Peek at the pending wake-up for `req_id` without claiming it.
    pub fn pending_wakeup(&self, req_id: &ReqId) -> Result<Option<ScheduledWakeup>> {
        let inner = self.lock()?;
        inner
            .db
            .query_row(
                "SELECT req_id, fires_at_ms, payload_json FROM wakeups WHERE req_id = ?1",
                params![req_id.as_str()],
                ScheduledWakeup::from_row,
            )
            .optional()
            .with_context(|| format!("Failed to query wake-up for {req_id}"))
    }

    pub fn pending_wakeup_count(&self) -> Result<u64> {
        let inner = self.lock()?;
        let count: i64 = inner
            .db
            .query_row("SELECT COUNT(*) FROM wakeups", [], |row| row.get(0))
            .context("Failed to count wake-ups")?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}
