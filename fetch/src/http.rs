//! Outbound call execution.

use std::error::Error as _;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{Method, RequestBuilder, Response};
use thiserror::Error;
use tracing::debug;

use courier_types::{FetchFailure, FetchTarget, ResponseSnapshot};

/// Client-wide settings; per-call limits come from `FetchOptions`.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub user_agent: String,
    pub connect_timeout: Duration,
    /// Bodies larger than this fail the attempt as a transport error.
    pub max_body_bytes: u64,
}

impl HttpSettings {
    pub const DEFAULT_USER_AGENT: &'static str =
        concat!("courier/", env!("CARGO_PKG_VERSION"));
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: Self::DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            max_body_bytes: Self::DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to build HTTP client")]
pub struct ClientError(#[from] reqwest::Error);

/// Runs one attempt of a [`FetchTarget`].
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_body_bytes: u64,
}

impl HttpFetcher {
    pub fn new(settings: &HttpSettings) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(settings.connect_timeout)
            .build()?;
        Ok(Self {
            client,
            max_body_bytes: settings.max_body_bytes,
        })
    }

    /// Execute `target`, aborting after `timeout`.
    ///
    /// The timer covers the whole attempt, body included. Any HTTP status is a
    /// response; only network failures and the abort timer are errors.
    pub async fn execute(
        &self,
        target: &FetchTarget,
        timeout: Duration,
    ) -> Result<ResponseSnapshot, FetchFailure> {
        let request = self.build(target)?;
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);

        match tokio::time::timeout(timeout, self.send(request)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(url = target.url(), timeout_ms, "Fetch aborted by timeout");
                Err(FetchFailure::timeout(timeout_ms))
            }
        }
    }

    fn build(&self, target: &FetchTarget) -> Result<RequestBuilder, FetchFailure> {
        let method = Method::from_bytes(target.method().as_bytes())
            .map_err(|e| FetchFailure::transport(format!("invalid method: {e}")))?;
        let mut builder = self.client.request(method, target.url());
        for (name, value) in target.headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = target.body_text() {
            builder = builder.body(body.to_string());
        }
        Ok(builder)
    }

    async fn send(&self, request: RequestBuilder) -> Result<ResponseSnapshot, FetchFailure> {
        let response = request.send().await.map_err(|e| describe(&e))?;
        self.capture(response).await
    }

    async fn capture(&self, response: Response) -> Result<ResponseSnapshot, FetchFailure> {
        let status = response.status();
        let url = response.url().to_string();

        let mut headers = Vec::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let max_bytes = usize::try_from(self.max_body_bytes).unwrap_or(usize::MAX);
        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| FetchFailure::transport(format!("response stream error: {e}")))?;
            if body.len() + chunk.len() > max_bytes {
                return Err(FetchFailure::transport(format!(
                    "response body exceeds {} bytes",
                    self.max_body_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }

        debug!(url = %url, status = status.as_u16(), bytes = body.len(), "Fetch completed");
        Ok(ResponseSnapshot::new(
            status.as_u16(),
            status.canonical_reason().unwrap_or_default(),
            url,
            headers,
            body,
        ))
    }
}

/// Flatten a reqwest error and its sources into one message.
fn describe(error: &reqwest::Error) -> FetchFailure {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    FetchFailure::transport(message)
}
