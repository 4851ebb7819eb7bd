//! Actor host and offloaded-fetch coordination for Courier.
//!
//! | Module | Role |
//! |--------|------|
//! | `system` | Bindings, execution contexts, on-demand activation, resume |
//! | `actor` | The [`Actor`] contract and the handles used to reach one |
//! | `queue` | Durable FIFO processor with retry and orphan recovery |
//! | `race` | Offloaded call raced against a durable wake-up |
//! | `executor` | Where raced calls run, and how they report back |
//! | `config` | `~/.courier/config.toml` |
//!
//! Outcomes always arrive as a new turn of the origin actor, through the
//! continuation captured at submission.

#![allow(clippy::missing_errors_doc)]

mod actor;
mod cell;
pub mod config;
mod delivery;
mod error;
mod executor;
mod queue;
mod race;
mod system;

pub use actor::{Actor, ActorContext, ActorHandle};
pub use config::{
    ConfigError, CourierConfig, ExecutorConfig, FetchConfig, QueueConfig, StorageConfig,
};
pub use error::{ActivationError, DeliveryError, DispatchError, HandlerError, SubmitError};
pub use executor::{DeliveryPort, ExecutionContext, ExecutionTask, LocalExecutor};
pub use queue::{QUEUE_INSTANCE, QueueHandle, QueueStatus, RecoveryReport};
pub use system::{
    ActorFactory, ActorSystem, ActorSystemBuilder, BuildError, DEFAULT_EXECUTOR, ResumeReport,
};

pub use courier_fetch::{HttpFetcher, HttpSettings};
pub use courier_store::QueueEntry;
pub use courier_types::{
    ActorRef, Continuation, FailureKind, FetchFailure, FetchOptions, FetchResult, FetchTarget,
    Invocation, InvocationError, Outcome, ReqId, ResponseSnapshot, ValidationError,
};
pub use futures_util::future::BoxFuture;
