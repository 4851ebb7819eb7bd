use thiserror::Error;

use courier_types::{ActorRef, InvocationError, ReqId, ValidationError};

/// Failure to bring an actor or queue processor into memory.
#[derive(Debug, Error)]
pub enum ActivationError {
    #[error(transparent)]
    InvalidName(#[from] ValidationError),
    #[error("no actor binding named {0:?}")]
    UnknownBinding(String),
    #[error("failed to open storage for {actor}")]
    Storage {
        actor: ActorRef,
        #[source]
        source: anyhow::Error,
    },
    #[error("actor system has shut down")]
    Shutdown,
}

/// Synchronous rejection of a fetch submission. Nothing was persisted.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid fetch request: {0}")]
    Validation(#[from] ValidationError),
    #[error("{actor} has no handler named {method:?}")]
    UnknownMethod { actor: ActorRef, method: String },
    #[error("no execution context bound to {0:?}")]
    UnknownExecutor(String),
    #[error("request {0} is already active")]
    Duplicate(ReqId),
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Activation(#[from] ActivationError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// An execution context refused to take a raced call.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("execution context {0:?} is unavailable")]
    Unavailable(String),
    #[error("execution context rejected request: {0}")]
    Rejected(String),
}

/// Routing an outcome back to its origin failed. Logged and dropped, never retried.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Activation(#[from] ActivationError),
    #[error("{actor} has no handler named {method:?}")]
    UnknownMethod { actor: ActorRef, method: String },
    #[error("handler {method} on {actor} failed")]
    Handler {
        actor: ActorRef,
        method: String,
        #[source]
        source: HandlerError,
    },
    #[error("malformed wake-up for {req_id}: {reason}")]
    MalformedWakeup { req_id: String, reason: String },
    #[error("failed to encode outcome of {req_id}")]
    Encode {
        req_id: ReqId,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Returned by [`Actor::invoke`](crate::Actor::invoke).
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    BadArgs(#[from] InvocationError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}
