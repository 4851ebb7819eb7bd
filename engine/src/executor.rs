//! Execution contexts: where raced calls actually run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;

use courier_fetch::HttpFetcher;
use courier_types::{ActorRef, FetchResult, FetchTarget, ReqId};

use crate::cell::TaskSet;
use crate::error::{ActivationError, DeliveryError, DispatchError};
use crate::race;
use crate::system::SystemInner;

/// Accepts raced calls and reports each outcome through its [`DeliveryPort`].
///
/// Dispatch only has to accept the task; the outcome may arrive at any later
/// time, or never, in which case the origin's wake-up delivers a timeout.
pub trait ExecutionContext: Send + Sync + 'static {
    fn dispatch(&self, task: ExecutionTask) -> Result<(), DispatchError>;

    /// Wait for accepted work to finish. `true` if anything was outstanding.
    fn idle(&self) -> BoxFuture<'_, bool> {
        Box::pin(async { false })
    }
}

/// One raced call handed to an execution context.
pub struct ExecutionTask {
    pub req_id: ReqId,
    pub target: FetchTarget,
    pub timeout: Duration,
    pub reply: DeliveryPort,
}

/// Reply channel back to the origin actor of a raced call.
///
/// Delivering through the port competes with the wake-up; only the first of
/// the two reaches the handler.
pub struct DeliveryPort {
    system: Weak<SystemInner>,
    origin: ActorRef,
    req_id: ReqId,
}

impl DeliveryPort {
    pub(crate) fn new(system: Weak<SystemInner>, origin: ActorRef, req_id: ReqId) -> Self {
        Self {
            system,
            origin,
            req_id,
        }
    }

    #[must_use]
    pub fn origin(&self) -> &ActorRef {
        &self.origin
    }

    /// `Ok(true)` if this delivery won the race, `Ok(false)` if it was already settled.
    pub async fn deliver(self, result: FetchResult) -> Result<bool, DeliveryError> {
        let Some(system) = self.system.upgrade() else {
            return Err(ActivationError::Shutdown.into());
        };
        let cell = system.activate_actor(&self.origin).await?;
        race::deliver(&system, &cell, &self.req_id, result).await
    }
}

/// Runs raced calls on the local tokio runtime.
pub struct LocalExecutor {
    fetcher: HttpFetcher,
    suppress_delivery: AtomicBool,
    tasks: TaskSet,
}

impl LocalExecutor {
    #[must_use]
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self {
            fetcher,
            suppress_delivery: AtomicBool::new(false),
            tasks: TaskSet::default(),
        }
    }

    /// Perform calls but never report back, so every race settles by wake-up.
    #[must_use]
    pub fn with_suppressed_delivery(self, suppress: bool) -> Self {
        self.suppress_delivery.store(suppress, Ordering::Relaxed);
        self
    }

    pub fn set_suppress_delivery(&self, suppress: bool) {
        self.suppress_delivery.store(suppress, Ordering::Relaxed);
    }
}

impl ExecutionContext for LocalExecutor {
    fn dispatch(&self, task: ExecutionTask) -> Result<(), DispatchError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(DispatchError::Unavailable("local".to_string()));
        }
        let fetcher = self.fetcher.clone();
        let suppress = self.suppress_delivery.load(Ordering::Relaxed);

        self.tasks.spawn(async move {
            let started = Instant::now();
            let attempt = fetcher.execute(&task.target, task.timeout).await;
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            if suppress {
                tracing::debug!(req_id = %task.req_id, "Delivery suppressed");
                return;
            }

            let req_id = task.req_id.clone();
            let result = FetchResult::new(task.req_id, attempt, 0, duration_ms);
            match task.reply.deliver(result).await {
                Ok(true) => {}
                Ok(false) => tracing::debug!(%req_id, "Race already settled"),
                Err(e) => tracing::warn!(%req_id, "Failed to deliver raced fetch: {e:#}"),
            }
        });
        Ok(())
    }

    fn idle(&self) -> BoxFuture<'_, bool> {
        Box::pin(self.tasks.drain())
    }
}
