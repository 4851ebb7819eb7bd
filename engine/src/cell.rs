//! Single-writer actor cells.
//!
//! A cell pairs an actor's SQLite store with a turn lock, a durable-alarm timer
//! task, and the set of detached tasks it launched. Everything that reads and
//! then writes the store runs while holding the turn.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime};

use tokio::sync::{Mutex as TurnLock, Notify, OnceCell};
use tokio::task::JoinHandle;

use courier_store::{ActorStore, epoch_ms};
use courier_types::ActorRef;

use crate::system::SystemInner;

/// Pause after a failed alarm so a persistent storage error cannot spin the timer.
const ALARM_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Detached work tracked so the host can wait for it or abort it.
#[derive(Default)]
pub(crate) struct TaskSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut handles = lock(&self.handles);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Await every tracked task, including ones spawned while waiting.
    ///
    /// Returns `true` if anything was outstanding.
    pub(crate) async fn drain(&self) -> bool {
        let mut waited = false;
        loop {
            let handles = std::mem::take(&mut *lock(&self.handles));
            if handles.is_empty() {
                return waited;
            }
            for handle in handles {
                waited = true;
                if let Err(err) = handle.await
                    && err.is_panic()
                {
                    tracing::error!("Detached task panicked: {err}");
                }
            }
        }
    }

    pub(crate) fn abort_all(&self) {
        for handle in lock(&self.handles).drain(..) {
            handle.abort();
        }
    }
}

pub(crate) struct Cell<S> {
    pub(crate) id: ActorRef,
    pub(crate) store: ActorStore,
    pub(crate) turn: TurnLock<S>,
    /// Handler names accepted as continuation targets. Empty for queue cells.
    pub(crate) methods: &'static [&'static str],
    pub(crate) tasks: TaskSet,
    pub(crate) started: OnceCell<()>,
    alarm_changed: Notify,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Send + 'static> Cell<S> {
    pub(crate) fn new(
        id: ActorRef,
        store: ActorStore,
        methods: &'static [&'static str],
        state: S,
    ) -> Self {
        Self {
            id,
            store,
            turn: TurnLock::new(state),
            methods,
            tasks: TaskSet::default(),
            started: OnceCell::new(),
            alarm_changed: Notify::new(),
            timer: Mutex::new(None),
        }
    }

    pub(crate) fn accepts(&self, method: &str) -> bool {
        self.methods.contains(&method)
    }

    /// Tell the timer that the persisted schedule changed.
    pub(crate) fn alarm_changed(&self) {
        self.alarm_changed.notify_one();
    }

    /// Launch the timer task. `fire` runs whenever the earliest persisted
    /// deadline is due, and must consume what it fires.
    pub(crate) fn start_timer<F, Fut>(self: &Arc<Self>, system: Weak<SystemInner>, fire: F)
    where
        F: Fn(Arc<SystemInner>, Arc<Self>, u64) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handle = tokio::spawn(run_timer(system, Arc::clone(self), fire));
        if let Some(previous) = lock(&self.timer).replace(handle) {
            previous.abort();
        }
    }

    /// Abort the timer and all detached work, as a crash would.
    pub(crate) fn shutdown(&self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
        self.tasks.abort_all();
    }
}

async fn run_timer<S, F, Fut>(system: Weak<SystemInner>, cell: Arc<Cell<S>>, fire: F)
where
    S: Send + 'static,
    F: Fn(Arc<SystemInner>, Arc<Cell<S>>, u64) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    loop {
        let next = match cell.store.next_alarm_at() {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(actor = %cell.id, "Failed to read alarm schedule: {e:#}");
                tokio::time::sleep(ALARM_ERROR_BACKOFF).await;
                continue;
            }
        };
        let now = epoch_ms(SystemTime::now());

        match next {
            Some(at) if at <= now => {
                let Some(system) = system.upgrade() else {
                    return;
                };
                if let Err(e) = fire(system, Arc::clone(&cell), now).await {
                    tracing::error!(actor = %cell.id, "Alarm failed: {e:#}");
                    tokio::time::sleep(ALARM_ERROR_BACKOFF).await;
                }
            }
            Some(at) => {
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_millis(at - now)) => {}
                    () = cell.alarm_changed.notified() => {}
                }
            }
            None => cell.alarm_changed.notified().await,
        }
    }
}
