use std::borrow::Cow;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ReqId;

/// Captured HTTP response, readable long after the connection is gone.
///
/// Any status is a response, including 4xx and 5xx; `ok` mirrors the 2xx check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSnapshot {
    pub status: u16,
    pub status_text: String,
    pub ok: bool,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "body_base64")]
    pub body: Vec<u8>,
}

impl ResponseSnapshot {
    pub fn new(
        status: u16,
        status_text: impl Into<String>,
        url: impl Into<String>,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            ok: (200..300).contains(&status),
            url: url.into(),
            headers,
            body,
        }
    }

    /// First header value matching `name`, case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    #[must_use]
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }

    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

mod body_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Why a fetch produced no response. The per-call abort is reported as `Timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// DNS, connect, TLS, or a broken connection.
    Transport,
    /// The abort timer fired before the response completed.
    Timeout,
}

impl FailureKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fetch that produced no response at all.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct FetchFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl FetchFailure {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transport,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn timeout(timeout_ms: u64) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: format!("request timed out after {timeout_ms}ms"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Response(ResponseSnapshot),
    Error(FetchFailure),
}

/// What a handler receives: `{reqId, response | error, retryCount, durationMs}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResult {
    pub req_id: ReqId,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub retry_count: u32,
    pub duration_ms: u64,
}

impl FetchResult {
    /// Normalize one attempt's outcome.
    pub fn new(
        req_id: ReqId,
        attempt: Result<ResponseSnapshot, FetchFailure>,
        retry_count: u32,
        duration_ms: u64,
    ) -> Self {
        let outcome = match attempt {
            Ok(response) => Outcome::Response(response),
            Err(error) => Outcome::Error(error),
        };
        Self {
            req_id,
            outcome,
            retry_count,
            duration_ms,
        }
    }

    #[must_use]
    pub fn response(&self) -> Option<&ResponseSnapshot> {
        match &self.outcome {
            Outcome::Response(response) => Some(response),
            Outcome::Error(_) => None,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&FetchFailure> {
        match &self.outcome {
            Outcome::Error(error) => Some(error),
            Outcome::Response(_) => None,
        }
    }

    /// Wire form substituted into a continuation's placeholder.
    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
