//! Retry policy for queued fetches.
//!
//! # Retryable outcomes
//!
//! - Transport failures and abort timeouts
//! - 5xx responses, when the request opted in with `retry_on_5xx`
//!
//! Everything else (2xx, 3xx, 4xx) is final and goes straight to delivery.
//!
//! # Backoff
//!
//! `retry_delay_ms * 2^retry_count`, capped at `max_retry_delay_ms`, then
//! down-jittered by up to `jitter_factor` (0.25 means a multiplier in
//! `[0.75, 1.0]`). A valid `Retry-After-Ms` or `Retry-After` header on the
//! failed response replaces the exponential base; the cap still applies.

use std::time::Duration;

use courier_types::{FetchFailure, FetchOptions, ResponseSnapshot};

/// Whether an attempt's outcome warrants another attempt.
#[must_use]
pub fn is_retryable(result: &Result<ResponseSnapshot, FetchFailure>, retry_on_5xx: bool) -> bool {
    match result {
        Ok(response) => retry_on_5xx && response.is_server_error(),
        Err(_) => true,
    }
}

/// Parse `Retry-After-Ms` (float milliseconds) or `Retry-After` (integer seconds).
///
/// Returns `Some(duration)` only for `0 < duration < 60s`.
#[must_use]
pub fn parse_retry_after(response: &ResponseSnapshot) -> Option<Duration> {
    if let Some(val) = response.header("retry-after-ms")
        && let Ok(ms) = val.trim().parse::<f64>()
        && ms.is_finite()
        && ms > 0.0
        && ms < 60_000.0
    {
        return Some(Duration::from_secs_f64(ms / 1000.0));
    }

    if let Some(val) = response.header("retry-after")
        && let Ok(secs) = val.trim().parse::<u64>()
    {
        let duration = Duration::from_secs(secs);
        if duration > Duration::ZERO && duration < Duration::from_secs(60) {
            return Some(duration);
        }
    }

    None
}

/// Delay before the attempt that follows a failed attempt numbered `retry_count`.
///
/// `retry_count` is 0 for the first attempt, so the first retry waits about
/// `retry_delay_ms`.
#[must_use]
pub fn retry_delay(
    retry_count: u32,
    options: &FetchOptions,
    jitter_factor: f64,
    response: Option<&ResponseSnapshot>,
) -> Duration {
    let cap = Duration::from_millis(options.max_retry_delay_ms);

    if let Some(response) = response
        && let Some(delay) = parse_retry_after(response)
    {
        return delay.min(cap);
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
    let base = options.retry_delay_ms as f64 * 2.0_f64.powi(retry_count.min(32) as i32);
    #[allow(clippy::cast_precision_loss)]
    let capped = base.min(options.max_retry_delay_ms as f64);

    let jitter = 1.0 - rand::random::<f64>() * jitter_factor.clamp(0.0, 1.0);
    Duration::try_from_secs_f64(capped * jitter / 1000.0)
        .unwrap_or(cap)
        .min(cap)
}
