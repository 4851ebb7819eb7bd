//! Durable FIFO queue processor.
//!
//! One processor per executor binding, hosted on its own cell. Entries move
//! `queued → in_flight → deleted`; a retry replaces the in-flight row with a new
//! queued row carrying a fresh ordering key and a `not_before_ms` backoff.
//!
//! The queue's turn is never held while an outcome is delivered to an origin,
//! so origin → queue submissions and queue → origin deliveries cannot deadlock.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use courier_fetch::{is_retryable, retry_delay};
use futures_util::FutureExt;
use courier_store::{EnqueueError, QueueEntry, epoch_ms};
use courier_types::{FetchRequest, FetchResult, OrderingKey, ReqId};

use crate::cell::Cell;
use crate::delivery;
use crate::error::SubmitError;
use crate::system::SystemInner;

/// Instance name of every queue processor's cell.
pub const QUEUE_INSTANCE: &str = "queue";

/// Turn-guarded state of a queue processor.
#[derive(Default)]
pub(crate) struct QueueState {
    /// Entries executing in this process; recovery must leave them alone.
    running: HashSet<OrderingKey>,
}

pub(crate) type QueueCell = Cell<QueueState>;

/// What a recovery pass did with orphaned in-flight entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub expired: usize,
    pub corrupt: usize,
    /// Executions started by the processing pass that follows recovery.
    pub launched: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub queued: u64,
    pub in_flight: u64,
    pub alarm_at_ms: Option<u64>,
}

/// Route a validated request to its queue processor.
pub(crate) async fn submit(
    system: &Arc<SystemInner>,
    request: FetchRequest,
) -> Result<ReqId, SubmitError> {
    let cell = system
        .activate_queue(&request.options.executor_binding)
        .await?;
    enqueue(system, &cell, request).await
}

async fn enqueue(
    system: &Arc<SystemInner>,
    cell: &Arc<QueueCell>,
    request: FetchRequest,
) -> Result<ReqId, SubmitError> {
    let mut state = cell.turn.lock().await;
    let now = SystemTime::now();
    let key = match cell.store.enqueue(&request, now, epoch_ms(now)) {
        Ok(key) => key,
        Err(EnqueueError::Duplicate(req_id)) => return Err(SubmitError::Duplicate(req_id)),
        Err(EnqueueError::Storage(e)) => return Err(SubmitError::Storage(e)),
    };
    tracing::info!(
        req_id = %request.req_id,
        ordering_key = %key,
        queue = %cell.id,
        origin = %request.origin,
        "Fetch enqueued"
    );

    if let Err(e) = process_in_turn(system, cell, &mut state) {
        // The entry is durable; make sure a later pass picks it up.
        tracing::warn!(queue = %cell.id, "Processing pass failed: {e:#}");
        if cell.store.set_alarm_no_later_than(epoch_ms(now)).is_ok() {
            cell.alarm_changed();
        }
    }
    Ok(request.req_id)
}

/// Move one batch of eligible entries in flight and launch them.
fn process_in_turn(
    system: &Arc<SystemInner>,
    cell: &Arc<QueueCell>,
    state: &mut QueueState,
) -> anyhow::Result<usize> {
    let now = epoch_ms(SystemTime::now());
    let batch_size = system.config().batch_size();
    let claimed = cell.store.claim_batch(batch_size, now)?;
    let full = claimed.len() >= batch_size;

    let mut launched = 0;
    for stored in claimed {
        match stored.decode() {
            Ok(entry) => {
                state.running.insert(entry.ordering_key);
                let task = execute_guarded(Arc::clone(system), Arc::clone(cell), entry);
                cell.tasks.spawn(task);
                launched += 1;
            }
            Err(corrupt) => {
                tracing::warn!("Discarding {corrupt}");
                if let Err(e) = cell.store.discard(&corrupt.raw_key) {
                    tracing::error!(queue = %cell.id, "Failed to discard corrupt entry: {e:#}");
                }
            }
        }
    }

    if full {
        let follow_up = now.saturating_add(
            u64::try_from(system.config().follow_up_delay().as_millis()).unwrap_or(u64::MAX),
        );
        // A pending backoff alarm must not postpone the next batch.
        cell.store.set_alarm_no_later_than(follow_up)?;
        cell.alarm_changed();
    } else if let Some(next) = cell.store.next_eligible_at()? {
        cell.store.set_alarm_no_later_than(next)?;
        cell.alarm_changed();
    }

    if launched > 0 {
        tracing::debug!(queue = %cell.id, launched, full, "Processing pass");
    }
    Ok(launched)
}

/// [`execute`], releasing the entry's running mark if the attempt panics.
///
/// The entry stays in flight, so the next recovery pass requeues it.
async fn execute_guarded(system: Arc<SystemInner>, cell: Arc<QueueCell>, entry: QueueEntry) {
    let ordering_key = entry.ordering_key;
    let req_id = entry.request.req_id.clone();
    let attempt = AssertUnwindSafe(execute(system, Arc::clone(&cell), entry))
        .catch_unwind()
        .await;
    if attempt.is_err() {
        cell.turn.lock().await.running.remove(&ordering_key);
        tracing::error!(
            %req_id,
            %ordering_key,
            queue = %cell.id,
            "Execution panicked; entry left in flight for recovery"
        );
    }
}

/// One attempt of one entry, then retry or deliver.
async fn execute(system: Arc<SystemInner>, cell: Arc<QueueCell>, entry: QueueEntry) {
    let QueueEntry {
        ordering_key,
        request,
        ..
    } = entry;
    let started = Instant::now();
    let attempt = system
        .fetcher()
        .execute(&request.target, request.options.timeout())
        .await;
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    if is_retryable(&attempt, request.options.retry_on_5xx) && request.has_retry_budget() {
        let delay = retry_delay(
            request.retry_count,
            &request.options,
            system.config().retry_jitter(),
            attempt.as_ref().ok(),
        );
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let next = request.next_attempt();

        let mut state = cell.turn.lock().await;
        state.running.remove(&ordering_key);
        let now = SystemTime::now();
        let not_before = epoch_ms(now).saturating_add(delay_ms);
        match cell.store.requeue(&ordering_key, &next, now, not_before) {
            Ok(Some(new_key)) => {
                if let Err(e) = cell.store.set_alarm_no_later_than(not_before) {
                    tracing::error!(req_id = %next.req_id, "Failed to schedule retry alarm: {e:#}");
                }
                cell.alarm_changed();
                tracing::info!(
                    req_id = %next.req_id,
                    ordering_key = %new_key,
                    retry_count = next.retry_count,
                    delay_ms,
                    outcome = %describe(&attempt),
                    "Fetch requeued for retry"
                );
            }
            Ok(None) => {
                tracing::debug!(req_id = %request.req_id, "Entry left the queue before retry");
            }
            Err(e) => {
                tracing::error!(req_id = %request.req_id, "Failed to requeue fetch: {e:#}");
            }
        }
        return;
    }

    // Claimed before delivery: at most one delivery per entry, even across a crash.
    let claimed = {
        let mut state = cell.turn.lock().await;
        state.running.remove(&ordering_key);
        cell.store.complete(&ordering_key)
    };
    match claimed {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(req_id = %request.req_id, "Entry already settled");
            return;
        }
        Err(e) => {
            tracing::error!(req_id = %request.req_id, "Failed to complete entry: {e:#}");
            return;
        }
    }

    let FetchRequest {
        req_id,
        origin,
        continuation,
        retry_count,
        ..
    } = request;
    tracing::info!(
        %req_id,
        retry_count,
        outcome = %describe(&attempt),
        "Fetch finished"
    );
    let Some(continuation) = continuation else {
        tracing::debug!(%req_id, "No continuation; outcome dropped");
        return;
    };
    let result = FetchResult::new(req_id, attempt, retry_count, duration_ms);
    if let Err(e) = delivery::deliver(&system, &origin, continuation, &result).await {
        tracing::warn!(req_id = %result.req_id, actor = %origin, "Dropped queued delivery: {e:#}");
    }
}

fn describe(attempt: &Result<courier_types::ResponseSnapshot, courier_types::FetchFailure>) -> String {
    match attempt {
        Ok(response) => format!("HTTP {}", response.status),
        Err(failure) => failure.to_string(),
    }
}

/// Requeue or discard orphaned in-flight entries, then run a processing pass.
pub(crate) async fn recover(
    system: &Arc<SystemInner>,
    cell: &Arc<QueueCell>,
) -> anyhow::Result<RecoveryReport> {
    let mut state = cell.turn.lock().await;
    let now = epoch_ms(SystemTime::now());
    let max_age =
        u64::try_from(system.config().max_in_flight_age().as_millis()).unwrap_or(u64::MAX);
    let mut report = RecoveryReport::default();

    for stored in cell.store.in_flight_entries()? {
        let entry = match stored.decode() {
            Ok(entry) => entry,
            Err(corrupt) => {
                tracing::warn!("Discarding {corrupt}");
                if let Err(e) = cell.store.discard(&corrupt.raw_key) {
                    tracing::error!(queue = %cell.id, "Failed to discard corrupt entry: {e:#}");
                }
                report.corrupt += 1;
                continue;
            }
        };
        if state.running.contains(&entry.ordering_key) {
            continue;
        }

        let age_ms = entry.ordering_key.age_ms(now);
        if age_ms > max_age {
            tracing::warn!(
                req_id = %entry.request.req_id,
                ordering_key = %entry.ordering_key,
                age_ms,
                "Discarding expired in-flight entry"
            );
            if let Err(e) = cell.store.discard(&stored.raw_key) {
                tracing::error!(req_id = %entry.request.req_id, "Failed to discard expired entry: {e:#}");
                continue;
            }
            report.expired += 1;
        } else if cell.store.restore_queued(&entry.ordering_key)? {
            tracing::info!(
                req_id = %entry.request.req_id,
                ordering_key = %entry.ordering_key,
                "Recovered in-flight entry"
            );
            report.requeued += 1;
        }
    }

    report.launched = process_in_turn(system, cell, &mut state)?;
    Ok(report)
}

/// Timer callback: consume the due alarm and run a processing pass.
pub(crate) async fn on_alarm(
    system: Arc<SystemInner>,
    cell: Arc<QueueCell>,
    now_ms: u64,
) -> anyhow::Result<()> {
    let mut state = cell.turn.lock().await;
    if cell.store.take_due_alarm(now_ms)? {
        process_in_turn(&system, &cell, &mut state)?;
    }
    Ok(())
}

/// An activated queue processor.
#[derive(Clone)]
pub struct QueueHandle {
    system: Arc<SystemInner>,
    cell: Arc<QueueCell>,
}

impl QueueHandle {
    pub(crate) fn new(system: Arc<SystemInner>, cell: Arc<QueueCell>) -> Self {
        Self { system, cell }
    }

    #[must_use]
    pub fn binding(&self) -> &str {
        self.cell.id.binding()
    }

    /// Rerun orphan recovery. Entries executing in this process are untouched.
    pub async fn recover(&self) -> anyhow::Result<RecoveryReport> {
        recover(&self.system, &self.cell).await
    }

    /// Run one processing pass now. Returns how many executions it started.
    pub async fn process(&self) -> anyhow::Result<usize> {
        let mut state = self.cell.turn.lock().await;
        process_in_turn(&self.system, &self.cell, &mut state)
    }

    pub fn stats(&self) -> anyhow::Result<QueueStatus> {
        let counts = self.cell.store.queue_stats()?;
        Ok(QueueStatus {
            queued: counts.queued,
            in_flight: counts.in_flight,
            alarm_at_ms: self.cell.store.alarm_at()?,
        })
    }

    /// The active entry for `req_id`. Corrupt rows read as absent.
    pub fn entry(&self, req_id: &ReqId) -> anyhow::Result<Option<QueueEntry>> {
        Ok(self
            .cell
            .store
            .entry_for(req_id)?
            .and_then(|stored| stored.decode().ok()))
    }

    /// Wait for executions launched by this processor.
    pub async fn idle(&self) {
        self.cell.tasks.drain().await;
    }
}
