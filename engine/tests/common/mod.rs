//! Shared test utilities and fixtures
//!
//! A recording actor, a system builder over a temp directory, and polling helpers.

#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier_engine::{
    Actor, ActorContext, ActorRef, ActorSystem, ActorSystemBuilder, BoxFuture, Continuation,
    CourierConfig, ExecutorConfig, FetchOptions, FetchResult, FetchTarget, HandlerError,
    Invocation, QueueConfig,
};
use tempfile::TempDir;

pub type Log = Arc<Mutex<Vec<(String, FetchResult)>>>;

pub const RECORDER: &str = "recorder";

/// Records every delivered outcome under the label its continuation was bound with.
///
/// `fetch_later(url)` enqueues a GET from inside a handler turn.
pub struct Recorder {
    log: Log,
}

impl Actor for Recorder {
    fn methods(&self) -> &'static [&'static str] {
        &["record", "fetch_later"]
    }

    fn invoke<'a>(
        &'a mut self,
        ctx: &'a ActorContext,
        invocation: Invocation,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            match invocation.method() {
                "record" => {
                    let label: String = invocation.arg(0)?;
                    let result: FetchResult = invocation.arg(1)?;
                    self.log.lock().unwrap().push((label, result));
                    Ok(())
                }
                "fetch_later" => {
                    let url: String = invocation.arg(0)?;
                    let target =
                        FetchTarget::get(url).map_err(|e| HandlerError::failed(e.to_string()))?;
                    ctx.enqueue_fetch(target, Some(record("from-handler")), FetchOptions::default())
                        .await?;
                    Ok(())
                }
                other => Err(HandlerError::failed(format!("unexpected method {other}"))),
            }
        })
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub log: Log,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Builder over this harness's data dir with the recorder bound.
    pub fn builder(&self, config: CourierConfig) -> ActorSystemBuilder {
        let log = Arc::clone(&self.log);
        ActorSystem::builder(config)
            .data_dir(self.dir.path())
            .binding(RECORDER, move |_: &ActorRef| -> Box<dyn Actor> {
                Box::new(Recorder {
                    log: Arc::clone(&log),
                })
            })
    }

    pub fn system(&self) -> ActorSystem {
        self.builder(fast_queue()).build().unwrap()
    }

    pub fn deliveries(&self) -> Vec<(String, FetchResult)> {
        self.log.lock().unwrap().clone()
    }

    /// Poll until at least `count` outcomes were delivered.
    pub async fn wait_for(&self, count: usize) -> Vec<(String, FetchResult)> {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let seen = self.deliveries();
                if seen.len() >= count {
                    return seen;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {count} deliveries"))
    }
}

pub fn recorder(instance: &str) -> ActorRef {
    ActorRef::new(RECORDER, instance).unwrap()
}

/// Continuation `record(label, <result>)`.
pub fn record(label: &str) -> Continuation {
    Continuation::new("record").arg(label).result()
}

/// Default config with jitter off so backoff is predictable.
pub fn fast_queue() -> CourierConfig {
    CourierConfig {
        queue: Some(QueueConfig {
            retry_jitter: Some(0.0),
            ..QueueConfig::default()
        }),
        ..CourierConfig::default()
    }
}

/// Config whose local executor never reports back.
pub fn suppressed() -> CourierConfig {
    CourierConfig {
        executor: Some(ExecutorConfig {
            suppress_delivery: true,
        }),
        ..fast_queue()
    }
}

/// Short backoff for retry tests.
pub fn quick_retries(max_retries: u32) -> FetchOptions {
    FetchOptions {
        max_retries,
        retry_delay_ms: 10,
        max_retry_delay_ms: 20,
        timeout_ms: 5_000,
        ..FetchOptions::default()
    }
}

/// A loopback port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
