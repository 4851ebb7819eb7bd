//! Outbound half of the delivery adapter.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`http`] | Runs a [`FetchTarget`](courier_types::FetchTarget) under an abort timer and captures the response |
//! | [`retry`] | Retry classification and exponential backoff with jitter |
//!
//! Outcome normalization: every HTTP status, 4xx and 5xx included, comes back as
//! `Ok(ResponseSnapshot)`. Only transport failures and the abort timer produce
//! `Err(FetchFailure)`.

pub mod http;
pub mod retry;

pub use http::{ClientError, HttpFetcher, HttpSettings};
pub use retry::{is_retryable, parse_retry_after, retry_delay};
