//! Actor contract and the handles used to talk to a live actor.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use courier_types::{
    ActorRef, Continuation, FetchOptions, FetchRequest, FetchTarget, Invocation, ReqId,
};

use crate::cell::Cell;
use crate::error::{DeliveryError, HandlerError, SubmitError};
use crate::system::{ActorSystem, SystemInner};
use crate::{delivery, queue, race};

/// A single-writer unit of state that receives continuations.
///
/// Handlers run one at a time per actor. Anything a handler needs to survive a
/// restart belongs in durable storage, not in `self`.
pub trait Actor: Send + 'static {
    /// Handler names this actor accepts; continuations naming anything else are
    /// rejected at submission.
    fn methods(&self) -> &'static [&'static str];

    fn invoke<'a>(
        &'a mut self,
        ctx: &'a ActorContext,
        invocation: Invocation,
    ) -> BoxFuture<'a, Result<(), HandlerError>>;
}

pub(crate) type ActorCell = Cell<Box<dyn Actor>>;

/// Capabilities available to a handler while it holds its actor's turn.
pub struct ActorContext {
    system: Arc<SystemInner>,
    cell: Arc<ActorCell>,
}

impl ActorContext {
    pub(crate) fn new(system: Arc<SystemInner>, cell: Arc<ActorCell>) -> Self {
        Self { system, cell }
    }

    #[must_use]
    pub fn id(&self) -> &ActorRef {
        &self.cell.id
    }

    #[must_use]
    pub fn system(&self) -> ActorSystem {
        ActorSystem::from_inner(Arc::clone(&self.system))
    }

    /// Hand a call to the durable queue named by `options.executor_binding`.
    ///
    /// With no continuation the call is fire-and-forget.
    pub async fn enqueue_fetch(
        &self,
        target: FetchTarget,
        continuation: Option<Continuation>,
        options: FetchOptions,
    ) -> Result<ReqId, SubmitError> {
        let request = prepare(&self.cell, target, continuation, options)?;
        queue::submit(&self.system, request).await
    }

    /// Race the call against a durable wake-up; whichever reports first is delivered.
    pub fn race_fetch(
        &self,
        target: FetchTarget,
        continuation: Continuation,
        options: FetchOptions,
    ) -> Result<ReqId, SubmitError> {
        let request = prepare(&self.cell, target, Some(continuation), options)?;
        race::submit(&self.system, &self.cell, request)
    }

    /// Withdraw a pending race. `true` if a wake-up was still pending.
    pub fn cancel_fetch(&self, req_id: &ReqId) -> Result<bool, SubmitError> {
        race::cancel(&self.cell, req_id).map_err(SubmitError::Storage)
    }

    /// Run `future` as detached work owned by this actor.
    pub fn wait_until<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cell.tasks.spawn(future);
    }
}

/// Validate a submission and stamp it with a fresh request id.
fn prepare(
    cell: &ActorCell,
    target: FetchTarget,
    continuation: Option<Continuation>,
    options: FetchOptions,
) -> Result<FetchRequest, SubmitError> {
    options.validate()?;
    ActorRef::new(options.executor_binding.as_str(), queue::QUEUE_INSTANCE)?;
    if let Some(continuation) = &continuation {
        continuation.validate()?;
        if !cell.accepts(continuation.method()) {
            return Err(SubmitError::UnknownMethod {
                actor: cell.id.clone(),
                method: continuation.method().to_string(),
            });
        }
    }
    Ok(FetchRequest::new(target, cell.id.clone(), continuation, options))
}

/// An activated actor, usable from outside any turn.
#[derive(Clone)]
pub struct ActorHandle {
    system: Arc<SystemInner>,
    cell: Arc<ActorCell>,
}

impl ActorHandle {
    pub(crate) fn new(system: Arc<SystemInner>, cell: Arc<ActorCell>) -> Self {
        Self { system, cell }
    }

    #[must_use]
    pub fn id(&self) -> &ActorRef {
        &self.cell.id
    }

    /// Run one handler in a fresh turn.
    pub async fn call(&self, invocation: Invocation) -> Result<(), DeliveryError> {
        let mut actor = self.cell.turn.lock().await;
        delivery::invoke_in_turn(&self.system, &self.cell, &mut actor, invocation).await
    }

    pub async fn enqueue_fetch(
        &self,
        target: FetchTarget,
        continuation: Option<Continuation>,
        options: FetchOptions,
    ) -> Result<ReqId, SubmitError> {
        let request = prepare(&self.cell, target, continuation, options)?;
        queue::submit(&self.system, request).await
    }

    pub async fn race_fetch(
        &self,
        target: FetchTarget,
        continuation: Continuation,
        options: FetchOptions,
    ) -> Result<ReqId, SubmitError> {
        let request = prepare(&self.cell, target, Some(continuation), options)?;
        let _turn = self.cell.turn.lock().await;
        race::submit(&self.system, &self.cell, request)
    }

    pub async fn cancel_fetch(&self, req_id: &ReqId) -> Result<bool, SubmitError> {
        let _turn = self.cell.turn.lock().await;
        race::cancel(&self.cell, req_id).map_err(SubmitError::Storage)
    }

    /// Run the expiry path for one wake-up now, whatever its deadline.
    ///
    /// `true` if this firing delivered; `false` if the race was already settled.
    pub async fn fire_wakeup(&self, req_id: &ReqId) -> Result<bool, DeliveryError> {
        race::expire(&self.system, &self.cell, req_id).await
    }

    /// Fire every wake-up whose deadline has passed. Returns how many delivered.
    pub async fn fire_due_wakeups(&self) -> Result<usize, DeliveryError> {
        race::expire_due(&self.system, &self.cell).await
    }

    /// Whether a race for `req_id` is still unsettled.
    pub fn has_pending_wakeup(&self, req_id: &ReqId) -> anyhow::Result<bool> {
        Ok(self.cell.store.pending_wakeup(req_id)?.is_some())
    }

    pub fn pending_wakeups(&self) -> anyhow::Result<u64> {
        self.cell.store.pending_wakeup_count()
    }

    /// Wait until all detached work in the system has settled.
    pub async fn idle(&self) {
        ActorSystem::from_inner(Arc::clone(&self.system)).idle().await;
    }
}
