//! Actor host: bindings, executors, and on-demand activation.
//!
//! Storage layout under the data directory:
//!
//! ```text
//! <data_dir>/<binding>/<instance>.db    one file per actor
//! <data_dir>/.queue/<binding>.db        one file per queue processor
//! ```
//!
//! Actor names cannot start with `.`, so the two never collide.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use thiserror::Error;

use courier_fetch::{ClientError, HttpFetcher};
use courier_store::ActorStore;
use courier_types::{ActorRef, ValidationError};

use crate::actor::{Actor, ActorCell, ActorHandle};
use crate::cell::{Cell, lock};
use crate::config::CourierConfig;
use crate::error::ActivationError;
use crate::executor::{ExecutionContext, LocalExecutor};
use crate::queue::{self, QUEUE_INSTANCE, QueueCell, QueueHandle, QueueState, RecoveryReport};
use crate::race;

/// Builds the actor for a freshly activated [`ActorRef`].
pub type ActorFactory = Arc<dyn Fn(&ActorRef) -> Box<dyn Actor> + Send + Sync>;

/// Executor binding used when a request does not name one.
pub const DEFAULT_EXECUTOR: &str = "default";

const QUEUE_DIR: &str = ".queue";

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no data directory configured and no home directory found")]
    NoDataDir,
    #[error("invalid binding name {name:?}")]
    InvalidBinding {
        name: String,
        #[source]
        source: ValidationError,
    },
    #[error(transparent)]
    Http(#[from] ClientError),
}

pub struct ActorSystemBuilder {
    config: CourierConfig,
    data_dir: Option<PathBuf>,
    bindings: HashMap<String, ActorFactory>,
    executors: HashMap<String, Arc<dyn ExecutionContext>>,
}

impl ActorSystemBuilder {
    /// Register the actor type activated for `name`.
    #[must_use]
    pub fn binding<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ActorRef) -> Box<dyn Actor> + Send + Sync + 'static,
    {
        self.bindings.insert(name.into(), Arc::new(factory));
        self
    }

    /// Register an execution context for raced calls naming `name`.
    #[must_use]
    pub fn executor(mut self, name: impl Into<String>, context: Arc<dyn ExecutionContext>) -> Self {
        self.executors.insert(name.into(), context);
        self
    }

    /// Override the configured data directory.
    #[must_use]
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    pub fn build(self) -> Result<ActorSystem, BuildError> {
        let data_dir = self
            .data_dir
            .or_else(|| self.config.data_dir())
            .ok_or(BuildError::NoDataDir)?;

        for name in self.bindings.keys().chain(self.executors.keys()) {
            ActorRef::new(name.as_str(), QUEUE_INSTANCE).map_err(|source| {
                BuildError::InvalidBinding {
                    name: name.clone(),
                    source,
                }
            })?;
        }

        let fetcher = HttpFetcher::new(&self.config.http_settings())?;
        let mut executors = self.executors;
        if !executors.contains_key(DEFAULT_EXECUTOR) {
            let local = LocalExecutor::new(fetcher.clone())
                .with_suppressed_delivery(self.config.suppress_delivery());
            executors.insert(DEFAULT_EXECUTOR.to_string(), Arc::new(local));
        }

        tracing::info!(
            data_dir = %data_dir.display(),
            bindings = self.bindings.len(),
            executors = executors.len(),
            "Actor system ready"
        );
        Ok(ActorSystem {
            inner: Arc::new(SystemInner {
                config: self.config,
                data_dir,
                bindings: self.bindings,
                executors,
                fetcher,
                actors: Mutex::new(HashMap::new()),
                queues: Mutex::new(HashMap::new()),
            }),
        })
    }
}

pub(crate) struct SystemInner {
    config: CourierConfig,
    data_dir: PathBuf,
    bindings: HashMap<String, ActorFactory>,
    executors: HashMap<String, Arc<dyn ExecutionContext>>,
    fetcher: HttpFetcher,
    actors: Mutex<HashMap<ActorRef, Arc<ActorCell>>>,
    queues: Mutex<HashMap<String, Arc<QueueCell>>>,
}

impl SystemInner {
    pub(crate) fn config(&self) -> &CourierConfig {
        &self.config
    }

    pub(crate) fn fetcher(&self) -> &HttpFetcher {
        &self.fetcher
    }

    pub(crate) fn executor(&self, name: &str) -> Option<Arc<dyn ExecutionContext>> {
        self.executors.get(name).cloned()
    }

    fn actor_path(&self, id: &ActorRef) -> PathBuf {
        self.data_dir
            .join(id.binding())
            .join(format!("{}.db", id.instance()))
    }

    fn queue_path(&self, binding: &str) -> PathBuf {
        self.data_dir.join(QUEUE_DIR).join(format!("{binding}.db"))
    }

    /// Bring `id` into memory, reopening its store and starting its timer.
    pub(crate) async fn activate_actor(
        self: &Arc<Self>,
        id: &ActorRef,
    ) -> Result<Arc<ActorCell>, ActivationError> {
        let cell = {
            let mut actors = lock(&self.actors);
            if let Some(cell) = actors.get(id) {
                Arc::clone(cell)
            } else {
                let factory = self
                    .bindings
                    .get(id.binding())
                    .ok_or_else(|| ActivationError::UnknownBinding(id.binding().to_string()))?;
                let store = ActorStore::open(self.actor_path(id)).map_err(|source| {
                    ActivationError::Storage {
                        actor: id.clone(),
                        source,
                    }
                })?;
                let actor = factory(id);
                let methods = actor.methods();
                let cell = Arc::new(Cell::new(id.clone(), store, methods, actor));
                actors.insert(id.clone(), Arc::clone(&cell));
                tracing::debug!(actor = %id, "Actor activated");
                cell
            }
        };

        cell.started
            .get_or_init(|| async {
                cell.start_timer(Arc::downgrade(self), race::on_alarm);
            })
            .await;
        Ok(cell)
    }

    /// Bring the queue processor for `binding` into memory and recover it.
    pub(crate) async fn activate_queue(
        self: &Arc<Self>,
        binding: &str,
    ) -> Result<Arc<QueueCell>, ActivationError> {
        let id = ActorRef::new(binding, QUEUE_INSTANCE)?;
        let cell = {
            let mut queues = lock(&self.queues);
            if let Some(cell) = queues.get(binding) {
                Arc::clone(cell)
            } else {
                let store = ActorStore::open(self.queue_path(binding)).map_err(|source| {
                    ActivationError::Storage {
                        actor: id.clone(),
                        source,
                    }
                })?;
                let cell = Arc::new(Cell::new(id, store, &[], QueueState::default()));
                queues.insert(binding.to_string(), Arc::clone(&cell));
                cell
            }
        };

        cell.started
            .get_or_init(|| async {
                match queue::recover(self, &cell).await {
                    Ok(report) if report != RecoveryReport::default() => {
                        tracing::info!(
                            queue = %cell.id,
                            requeued = report.requeued,
                            expired = report.expired,
                            corrupt = report.corrupt,
                            launched = report.launched,
                            "Queue recovered"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(queue = %cell.id, "Queue recovery failed: {e:#}"),
                }
                cell.start_timer(Arc::downgrade(self), queue::on_alarm);
            })
            .await;
        Ok(cell)
    }

    fn all_cells(&self) -> (Vec<Arc<ActorCell>>, Vec<Arc<QueueCell>>) {
        let actors = lock(&self.actors).values().cloned().collect();
        let queues = lock(&self.queues).values().cloned().collect();
        (actors, queues)
    }
}

impl Drop for SystemInner {
    fn drop(&mut self) {
        let actors = self.actors.get_mut().unwrap_or_else(PoisonError::into_inner);
        for cell in actors.values() {
            cell.shutdown();
        }
        let queues = self.queues.get_mut().unwrap_or_else(PoisonError::into_inner);
        for cell in queues.values() {
            cell.shutdown();
        }
    }
}

/// What [`ActorSystem::resume`] brought back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeReport {
    pub actors: usize,
    pub queues: usize,
}

/// Host for actors, queue processors, and execution contexts. Cheap to clone.
#[derive(Clone)]
pub struct ActorSystem {
    inner: Arc<SystemInner>,
}

impl ActorSystem {
    #[must_use]
    pub fn builder(config: CourierConfig) -> ActorSystemBuilder {
        ActorSystemBuilder {
            config,
            data_dir: None,
            bindings: HashMap::new(),
            executors: HashMap::new(),
        }
    }

    pub(crate) fn from_inner(inner: Arc<SystemInner>) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn config(&self) -> &CourierConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    /// Activate `id` on demand.
    pub async fn actor(&self, id: &ActorRef) -> Result<ActorHandle, ActivationError> {
        let cell = self.inner.activate_actor(id).await?;
        Ok(ActorHandle::new(Arc::clone(&self.inner), cell))
    }

    /// Activate the queue processor for `binding`, recovering orphans first.
    pub async fn queue(&self, binding: &str) -> Result<QueueHandle, ActivationError> {
        let cell = self.inner.activate_queue(binding).await?;
        Ok(QueueHandle::new(Arc::clone(&self.inner), cell))
    }

    /// Drop an actor from memory, aborting its timer and detached work.
    pub fn evict(&self, id: &ActorRef) -> bool {
        let removed = lock(&self.inner.actors).remove(id);
        match removed {
            Some(cell) => {
                cell.shutdown();
                tracing::debug!(actor = %id, "Actor evicted");
                true
            }
            None => false,
        }
    }

    /// Drop a queue processor from memory mid-flight. In-flight entries stay
    /// persisted and are recovered on next activation.
    pub fn evict_queue(&self, binding: &str) -> bool {
        let removed = lock(&self.inner.queues).remove(binding);
        match removed {
            Some(cell) => {
                cell.shutdown();
                tracing::debug!(queue = binding, "Queue evicted");
                true
            }
            None => false,
        }
    }

    /// Evict everything.
    pub fn shutdown(&self) {
        let (actors, queues) = {
            let actors: Vec<_> = lock(&self.inner.actors).drain().map(|(_, c)| c).collect();
            let queues: Vec<_> = lock(&self.inner.queues).drain().map(|(_, c)| c).collect();
            (actors, queues)
        };
        for cell in actors {
            cell.shutdown();
        }
        for cell in queues {
            cell.shutdown();
        }
    }

    /// Activate every actor and queue with persisted storage, so overdue
    /// wake-ups fire and orphaned entries are recovered after a restart.
    pub async fn resume(&self) -> anyhow::Result<ResumeReport> {
        let mut report = ResumeReport::default();
        let root = self.inner.data_dir.clone();
        if !root.exists() {
            return Ok(report);
        }

        for dir in std::fs::read_dir(&root)
            .with_context(|| format!("Failed to read data directory: {}", root.display()))?
        {
            let dir = dir?;
            if !dir.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = dir.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let is_queue = name == QUEUE_DIR;
            if !is_queue && !self.inner.bindings.contains_key(&name) {
                tracing::debug!("Skipping storage for unbound actor type {name:?}");
                continue;
            }

            for file in std::fs::read_dir(dir.path())? {
                let path = file?.path();
                if path.extension() != Some(OsStr::new("db")) {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(OsStr::to_str) else {
                    continue;
                };

                if is_queue {
                    match self.queue(stem).await {
                        Ok(_) => report.queues += 1,
                        Err(e) => tracing::warn!("Failed to resume queue {stem:?}: {e:#}"),
                    }
                } else {
                    let resumed = match ActorRef::new(name.as_str(), stem) {
                        Ok(id) => self.actor(&id).await.map(|_| ()),
                        Err(e) => Err(e.into()),
                    };
                    match resumed {
                        Ok(()) => report.actors += 1,
                        Err(e) => tracing::warn!("Failed to resume {name}/{stem}: {e:#}"),
                    }
                }
            }
        }

        tracing::info!(
            actors = report.actors,
            queues = report.queues,
            "Resumed persisted actors"
        );
        Ok(report)
    }

    /// Wait until no detached work is outstanding anywhere in the system.
    ///
    /// Work scheduled on a future alarm (retry backoff, race deadlines) is not
    /// outstanding until its alarm fires.
    pub async fn idle(&self) {
        loop {
            let mut busy = false;
            let (actors, queues) = self.inner.all_cells();
            for cell in actors {
                busy |= cell.tasks.drain().await;
            }
            for cell in queues {
                busy |= cell.tasks.drain().await;
            }
            for executor in self.inner.executors.values() {
                busy |= executor.idle().await;
            }
            if !busy {
                return;
            }
        }
    }
}
