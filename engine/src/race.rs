//! Race coordinator: an offloaded call against a durable wake-up.
//!
//! Submission persists a wake-up in the origin's store and dispatches the call
//! to an execution context. Both the executor's reply and the wake-up's expiry
//! funnel into a claim of that wake-up inside the origin's turn; the claim is a
//! single `DELETE … RETURNING`, so exactly one of them delivers.

use std::sync::Arc;
use std::time::SystemTime;

use courier_store::{ScheduledWakeup, WakeupPayload, epoch_ms};
use courier_types::{FetchFailure, FetchRequest, FetchResult, ReqId, ValidationError};

use crate::actor::{Actor, ActorCell};
use crate::delivery::{encode, invoke_in_turn};
use crate::error::{DeliveryError, SubmitError};
use crate::executor::{DeliveryPort, ExecutionTask};
use crate::system::SystemInner;

/// Persist the wake-up, then dispatch. The caller holds the origin's turn.
pub(crate) fn submit(
    system: &Arc<SystemInner>,
    cell: &Arc<ActorCell>,
    request: FetchRequest,
) -> Result<ReqId, SubmitError> {
    let FetchRequest {
        req_id,
        target,
        continuation,
        options,
        ..
    } = request;
    let continuation = continuation.ok_or_else(|| {
        ValidationError::MalformedContinuation("a raced fetch needs a continuation".to_string())
    })?;
    let executor = system
        .executor(&options.executor_binding)
        .ok_or_else(|| SubmitError::UnknownExecutor(options.executor_binding.clone()))?;

    let now = epoch_ms(SystemTime::now());
    let deadline = now.saturating_add(options.timeout_ms);
    let payload = WakeupPayload {
        continuation,
        timeout: FetchFailure::timeout(options.timeout_ms),
        submitted_at_ms: now,
    };
    if cell.store.pending_wakeup(&req_id)?.is_some() {
        return Err(SubmitError::Duplicate(req_id));
    }
    cell.store.schedule_wakeup(&req_id, deadline, &payload)?;
    cell.alarm_changed();

    let task = ExecutionTask {
        req_id: req_id.clone(),
        target,
        timeout: options.timeout(),
        reply: DeliveryPort::new(Arc::downgrade(system), cell.id.clone(), req_id.clone()),
    };
    if let Err(err) = executor.dispatch(task) {
        if let Err(e) = cell.store.claim_wakeup(req_id.as_str()) {
            tracing::error!(%req_id, "Failed to cancel wake-up after dispatch failure: {e:#}");
        }
        cell.alarm_changed();
        tracing::warn!(
            %req_id,
            actor = %cell.id,
            executor = %options.executor_binding,
            "Dispatch failed: {err}"
        );
        return Err(err.into());
    }

    tracing::info!(
        %req_id,
        actor = %cell.id,
        executor = %options.executor_binding,
        deadline_ms = deadline,
        "Raced fetch dispatched"
    );
    Ok(req_id)
}

/// Claim the wake-up without delivering. The caller holds the origin's turn.
pub(crate) fn cancel(cell: &ActorCell, req_id: &ReqId) -> anyhow::Result<bool> {
    let cancelled = cell.store.claim_wakeup(req_id.as_str())?.is_some();
    if cancelled {
        cell.alarm_changed();
        tracing::debug!(%req_id, actor = %cell.id, "Race cancelled");
    }
    Ok(cancelled)
}

/// Executor side of the race: deliver `result` if the wake-up is still pending.
pub(crate) async fn deliver(
    system: &Arc<SystemInner>,
    cell: &Arc<ActorCell>,
    req_id: &ReqId,
    result: FetchResult,
) -> Result<bool, DeliveryError> {
    let value = encode(&result)?;
    let mut actor = cell.turn.lock().await;
    let Some(wakeup) = cell.store.claim_wakeup(req_id.as_str())? else {
        return Ok(false);
    };
    cell.alarm_changed();

    let payload = decode(&wakeup)?;
    let invocation = payload.continuation.resolve(value);
    invoke_in_turn(system, cell, &mut actor, invocation).await?;
    tracing::debug!(%req_id, actor = %cell.id, "Race settled by executor");
    Ok(true)
}

/// Wake-up side of the race for one request, regardless of its deadline.
pub(crate) async fn expire(
    system: &Arc<SystemInner>,
    cell: &Arc<ActorCell>,
    req_id: &ReqId,
) -> Result<bool, DeliveryError> {
    let mut actor = cell.turn.lock().await;
    let Some(wakeup) = cell.store.claim_wakeup(req_id.as_str())? else {
        return Ok(false);
    };
    cell.alarm_changed();
    deliver_timeout(system, cell, &mut actor, &wakeup).await?;
    Ok(true)
}

/// Fire every overdue wake-up. Individual delivery failures are logged and dropped.
pub(crate) async fn expire_due(
    system: &Arc<SystemInner>,
    cell: &Arc<ActorCell>,
) -> Result<usize, DeliveryError> {
    let due = cell.store.due_wakeups(epoch_ms(SystemTime::now()))?;
    let mut delivered = 0;

    for pending in due {
        let mut actor = cell.turn.lock().await;
        let Some(wakeup) = cell.store.claim_wakeup(&pending.req_id)? else {
            continue;
        };
        cell.alarm_changed();
        match deliver_timeout(system, cell, &mut actor, &wakeup).await {
            Ok(()) => delivered += 1,
            Err(e) => {
                tracing::warn!(req_id = %wakeup.req_id, actor = %cell.id, "Dropped timeout delivery: {e:#}");
            }
        }
    }
    Ok(delivered)
}

/// Timer callback for an actor cell.
pub(crate) async fn on_alarm(
    system: Arc<SystemInner>,
    cell: Arc<ActorCell>,
    _now_ms: u64,
) -> anyhow::Result<()> {
    expire_due(&system, &cell).await?;
    Ok(())
}

async fn deliver_timeout(
    system: &Arc<SystemInner>,
    cell: &Arc<ActorCell>,
    actor: &mut Box<dyn Actor>,
    wakeup: &ScheduledWakeup,
) -> Result<(), DeliveryError> {
    let req_id = ReqId::new(wakeup.req_id.as_str()).map_err(|e| DeliveryError::MalformedWakeup {
        req_id: wakeup.req_id.clone(),
        reason: e.to_string(),
    })?;
    let payload = decode(wakeup)?;
    let elapsed = epoch_ms(SystemTime::now()).saturating_sub(payload.submitted_at_ms);

    tracing::info!(%req_id, actor = %cell.id, "Race settled by wake-up");
    let result = FetchResult::new(req_id, Err(payload.timeout), 0, elapsed);
    let invocation = payload.continuation.resolve(encode(&result)?);
    invoke_in_turn(system, cell, actor, invocation).await
}

fn decode(wakeup: &ScheduledWakeup) -> Result<WakeupPayload, DeliveryError> {
    wakeup.payload().map_err(|e| DeliveryError::MalformedWakeup {
        req_id: wakeup.req_id.clone(),
        reason: e.to_string(),
    })
}
