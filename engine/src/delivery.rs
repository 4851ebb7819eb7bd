//! Inbound half of the delivery adapter: routing outcomes back to origin actors.

use std::sync::Arc;

use courier_types::{ActorRef, Continuation, FetchResult, Invocation};

use crate::actor::{Actor, ActorCell, ActorContext};
use crate::error::DeliveryError;
use crate::system::SystemInner;

/// Invoke `invocation` on an actor whose turn the caller already holds.
pub(crate) async fn invoke_in_turn(
    system: &Arc<SystemInner>,
    cell: &Arc<ActorCell>,
    actor: &mut Box<dyn Actor>,
    invocation: Invocation,
) -> Result<(), DeliveryError> {
    if !cell.accepts(invocation.method()) {
        return Err(DeliveryError::UnknownMethod {
            actor: cell.id.clone(),
            method: invocation.method().to_string(),
        });
    }
    let method = invocation.method().to_string();
    let ctx = ActorContext::new(Arc::clone(system), Arc::clone(cell));
    actor
        .invoke(&ctx, invocation)
        .await
        .map_err(|source| DeliveryError::Handler {
            actor: cell.id.clone(),
            method,
            source,
        })
}

/// Wire form of `result` for a continuation's placeholder.
pub(crate) fn encode(result: &FetchResult) -> Result<serde_json::Value, DeliveryError> {
    result.to_value().map_err(|source| DeliveryError::Encode {
        req_id: result.req_id.clone(),
        source,
    })
}

/// Resolve `continuation` with `result` and run it in a new turn of `origin`.
///
/// The caller must not hold any turn.
pub(crate) async fn deliver(
    system: &Arc<SystemInner>,
    origin: &ActorRef,
    continuation: Continuation,
    result: &FetchResult,
) -> Result<(), DeliveryError> {
    let cell = system.activate_actor(origin).await?;
    let invocation = continuation.resolve(encode(result)?);
    let mut actor = cell.turn.lock().await;
    invoke_in_turn(system, &cell, &mut actor, invocation).await?;
    tracing::debug!(
        req_id = %result.req_id,
        actor = %origin,
        "Delivered fetch outcome"
    );
    Ok(())
}
