//! Core domain types for Courier.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies:
//! identifiers, the continuation envelope, fetch requests, and the outcomes
//! delivered back to origin actors.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod continuation;
mod ids;
mod outcome;
mod request;

pub use continuation::{Arg, Continuation, Invocation, InvocationError};
pub use ids::{ActorRef, OrderingKey, ReqId};
pub use outcome::{FailureKind, FetchFailure, FetchResult, Outcome, ResponseSnapshot};
pub use request::{FetchOptions, FetchRequest, FetchTarget};

use thiserror::Error;

/// Rejection of malformed input at submission time.
///
/// Everything here is raised synchronously, before any state is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("{field} contains invalid characters: {value:?}")]
    InvalidChars { field: &'static str, value: String },
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("url scheme '{0}' not allowed; only http and https are supported")]
    UnsupportedScheme(String),
    #[error("invalid http method {0:?}")]
    InvalidMethod(String),
    #[error("invalid header name {0:?}")]
    InvalidHeaderName(String),
    #[error("continuation declares {0} result placeholders; at most one is allowed")]
    TooManyPlaceholders(usize),
    #[error("malformed continuation: {0}")]
    MalformedContinuation(String),
    #[error("timeout_ms must be greater than zero")]
    ZeroTimeout,
    #[error("retry_delay_ms ({delay}) exceeds max_retry_delay_ms ({max})")]
    RetryDelayAboveCap { delay: u64, max: u64 },
    #[error("invalid ordering key {0:?}")]
    InvalidOrderingKey(String),
}

/// Characters allowed in identifiers that end up in storage paths.
pub(crate) fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}
