use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{ActorRef, Continuation, ReqId, ValidationError};

/// The outbound call as captured at submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchTarget {
    method: String,
    url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<String>,
}

impl FetchTarget {
    /// # Errors
    ///
    /// Returns `ValidationError` if:
    /// - `method` is not an HTTP token
    /// - `url` does not parse or is not http(s)
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Result<Self, ValidationError> {
        let method = method.into().to_ascii_uppercase();
        if method.is_empty() || !method.bytes().all(is_token_byte) {
            return Err(ValidationError::InvalidMethod(method));
        }

        let url = url.into();
        let parsed = Url::parse(&url).map_err(|e| ValidationError::InvalidUrl {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        match parsed.scheme() {
            "http" | "https" => {}
            scheme => return Err(ValidationError::UnsupportedScheme(scheme.to_string())),
        }

        Ok(Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
        })
    }

    pub fn get(url: impl Into<String>) -> Result<Self, ValidationError> {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>) -> Result<Self, ValidationError> {
        Self::new("POST", url)
    }

    pub fn header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.is_empty() || !name.bytes().all(is_token_byte) {
            return Err(ValidationError::InvalidHeaderName(name));
        }
        self.headers.push((name, value.into()));
        Ok(self)
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set a JSON body and the matching content type.
    #[must_use]
    pub fn json(mut self, body: &serde_json::Value) -> Self {
        self.headers
            .retain(|(name, _)| !name.eq_ignore_ascii_case("content-type"));
        self.headers
            .push(("content-type".to_string(), "application/json".to_string()));
        self.body = Some(body.to_string());
        self
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    #[must_use]
    pub fn body_text(&self) -> Option<&str> {
        self.body.as_deref()
    }
}

// RFC 9110 tchar
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Per-request delivery and retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    /// Abort timeout for one attempt, and the deadline of a raced wake-up.
    pub timeout_ms: u64,
    /// Retries after the first attempt (queue mode only).
    pub max_retries: u32,
    /// Backoff base before the first retry.
    pub retry_delay_ms: u64,
    /// Backoff cap.
    pub max_retry_delay_ms: u64,
    /// Treat 5xx responses as retryable (queue mode only).
    pub retry_on_5xx: bool,
    /// Which queue processor or execution context runs the call.
    pub executor_binding: String,
}

impl FetchOptions {
    pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
    pub const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 10_000;
    pub const DEFAULT_EXECUTOR_BINDING: &'static str = "default";

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.timeout_ms == 0 {
            return Err(ValidationError::ZeroTimeout);
        }
        if self.retry_delay_ms > self.max_retry_delay_ms {
            return Err(ValidationError::RetryDelayAboveCap {
                delay: self.retry_delay_ms,
                max: self.max_retry_delay_ms,
            });
        }
        if self.executor_binding.is_empty() {
            return Err(ValidationError::Empty {
                field: "executor_binding",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout_ms: Self::DEFAULT_TIMEOUT_MS,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            retry_delay_ms: Self::DEFAULT_RETRY_DELAY_MS,
            max_retry_delay_ms: Self::DEFAULT_MAX_RETRY_DELAY_MS,
            retry_on_5xx: true,
            executor_binding: Self::DEFAULT_EXECUTOR_BINDING.to_string(),
        }
    }
}

/// Everything needed to run an offloaded call and route its outcome home.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub req_id: ReqId,
    pub target: FetchTarget,
    pub origin: ActorRef,
    /// Handler to run with the outcome. `None` means fire-and-forget.
    pub continuation: Option<Continuation>,
    pub options: FetchOptions,
    pub retry_count: u32,
    pub submitted_at: DateTime<Utc>,
}

impl FetchRequest {
    pub fn new(
        target: FetchTarget,
        origin: ActorRef,
        continuation: Option<Continuation>,
        options: FetchOptions,
    ) -> Self {
        Self {
            req_id: ReqId::generate(),
            target,
            origin,
            continuation,
            options,
            retry_count: 0,
            submitted_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.options.max_retries
    }

    /// The same request, one attempt later.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            ..self.clone()
        }
    }
}
