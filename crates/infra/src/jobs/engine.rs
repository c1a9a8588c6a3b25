//! Worker pool, engine instance and its init-once / shutdown-once lifecycle.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, instrument, warn};

use super::error::EngineError;
use super::message::{Dispatcher, Message};
use super::queue::WorkQueue;
use super::worker::{self, Counters, WorkerContext, WorkerHandle};
use crate::storage::Storage;

pub const WORKERS_ENV: &str = "COLLECTIONJOBS_WORKERS";
pub const POLL_INTERVAL_ENV: &str = "COLLECTIONJOBS_POLL_INTERVAL_MS";

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Prefix for worker thread names.
    pub name: String,
    pub worker_count: usize,
    /// How long an idle worker waits on the queue before re-checking for shutdown.
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "collectionjobs".to_string(),
            worker_count: 2,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Defaults overridden by `COLLECTIONJOBS_WORKERS` and
    /// `COLLECTIONJOBS_POLL_INTERVAL_MS`. Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(WORKERS_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.worker_count = n,
                _ => warn!(var = WORKERS_ENV, value = %raw, "invalid worker count; using default"),
            }
        }
        if let Some(raw) = lookup(POLL_INTERVAL_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => config.poll_interval = Duration::from_millis(ms),
                _ => warn!(var = POLL_INTERVAL_ENV, value = %raw, "invalid poll interval; using default"),
            }
        }

        config
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.worker_count == 0 {
            return Err(EngineError::InvalidConfig(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(EngineError::InvalidConfig(
                "poll_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Batches whose unit of work committed.
    pub batches_processed: u64,
    /// Batches rolled back because the handler failed or panicked.
    pub batches_failed: u64,
    /// Continuation messages resubmitted by workers.
    pub continuations: u64,
    /// Messages consumed without effect because their type is unknown.
    pub unknown_messages: u64,
    /// Messages submitted and not yet finished.
    pub outstanding: usize,
}

/// Anything that accepts new job messages.
pub trait JobSubmitter: Send + Sync {
    fn submit(&self, message: Message) -> Result<(), EngineError>;
}

impl<T: JobSubmitter + ?Sized> JobSubmitter for Arc<T> {
    fn submit(&self, message: Message) -> Result<(), EngineError> {
        (**self).submit(message)
    }
}

impl<T: JobSubmitter + ?Sized> JobSubmitter for &T {
    fn submit(&self, message: Message) -> Result<(), EngineError> {
        (**self).submit(message)
    }
}

/// A running worker pool over one storage backend.
///
/// Dropping an engine without calling [`Engine::shutdown`] disconnects the workers;
/// they exit after their current message without draining the queue.
pub struct Engine<S: Storage> {
    storage: Arc<S>,
    queue: Arc<WorkQueue>,
    counters: Arc<Counters>,
    workers: Vec<WorkerHandle>,
}

impl<S: Storage> Engine<S> {
    /// Spawn `config.worker_count` workers with the default dispatcher.
    pub fn start(config: EngineConfig, storage: Arc<S>) -> Result<Self, EngineError> {
        Self::with_dispatcher(config, storage, Dispatcher::default())
    }

    #[instrument(skip_all, fields(engine = %config.name, workers = config.worker_count))]
    pub fn with_dispatcher(
        config: EngineConfig,
        storage: Arc<S>,
        dispatcher: Dispatcher,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let queue = Arc::new(WorkQueue::new());
        let counters = Arc::new(Counters::default());
        let mut workers = Vec::with_capacity(config.worker_count);

        for i in 0..config.worker_count {
            let ctx = WorkerContext {
                storage: storage.clone(),
                queue: queue.clone(),
                dispatcher: dispatcher.clone(),
                counters: counters.clone(),
                poll_interval: config.poll_interval,
            };
            match worker::spawn(format!("{}-worker-{i}", config.name), ctx) {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    stop_workers(workers);
                    return Err(err);
                }
            }
        }

        info!("engine started");
        Ok(Self {
            storage,
            queue,
            counters,
            workers,
        })
    }

    /// Enqueue a new job message. Never blocks on workers.
    pub fn submit(&self, message: Message) -> Result<(), EngineError> {
        self.queue.submit(message)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            batches_processed: self.counters.batches_processed.load(Ordering::Relaxed),
            batches_failed: self.counters.batches_failed.load(Ordering::Relaxed),
            continuations: self.counters.continuations.load(Ordering::Relaxed),
            unknown_messages: self.counters.unknown_messages.load(Ordering::Relaxed),
            outstanding: self.queue.outstanding(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting new jobs, wait until every queued message and every
    /// continuation it spawns has been processed, then stop and join the workers.
    #[instrument(skip_all)]
    pub fn shutdown(self) -> EngineStats {
        self.queue.close();
        info!(outstanding = self.queue.outstanding(), "draining engine");
        self.queue.wait_drained();

        let stats = self.stats();
        stop_workers(self.workers);
        info!(
            batches_processed = stats.batches_processed,
            batches_failed = stats.batches_failed,
            "engine stopped"
        );
        stats
    }
}

impl<S: Storage> JobSubmitter for Engine<S> {
    fn submit(&self, message: Message) -> Result<(), EngineError> {
        Engine::submit(self, message)
    }
}

fn stop_workers(workers: Vec<WorkerHandle>) {
    for handle in &workers {
        handle.signal();
    }
    for handle in workers {
        handle.join();
    }
}

enum LifecycleState<S: Storage> {
    Uninitialized,
    Running(Engine<S>),
    ShutDown,
}

/// Engine slot with explicit init-once / shutdown-once semantics.
///
/// - `init` on a running or shut-down engine fails with `AlreadyInitialized`.
/// - `submit` before `init` fails with `NotInitialized`, after `shutdown` with `ShutDown`.
/// - `shutdown` before `init` is a no-op returning `Ok(None)`; a second `shutdown`
///   fails with `ShutDown`.
pub struct EngineLifecycle<S: Storage> {
    state: Mutex<LifecycleState<S>>,
}

impl<S: Storage> Default for EngineLifecycle<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Storage> EngineLifecycle<S> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Uninitialized),
        }
    }

    pub fn init(&self, config: EngineConfig, storage: Arc<S>) -> Result<(), EngineError> {
        let mut state = self.lock();
        match *state {
            LifecycleState::Uninitialized => {
                *state = LifecycleState::Running(Engine::start(config, storage)?);
                Ok(())
            }
            LifecycleState::Running(_) | LifecycleState::ShutDown => {
                Err(EngineError::AlreadyInitialized)
            }
        }
    }

    pub fn submit(&self, message: Message) -> Result<(), EngineError> {
        match &*self.lock() {
            LifecycleState::Running(engine) => engine.submit(message),
            LifecycleState::Uninitialized => Err(EngineError::NotInitialized),
            LifecycleState::ShutDown => Err(EngineError::ShutDown),
        }
    }

    pub fn stats(&self) -> Option<EngineStats> {
        match &*self.lock() {
            LifecycleState::Running(engine) => Some(engine.stats()),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock(), LifecycleState::Running(_))
    }

    /// Drain and stop the engine. The slot is released before draining, so
    /// concurrent submits fail fast with `ShutDown` instead of blocking.
    pub fn shutdown(&self) -> Result<Option<EngineStats>, EngineError> {
        let engine = {
            let mut state = self.lock();
            match std::mem::replace(&mut *state, LifecycleState::ShutDown) {
                LifecycleState::Running(engine) => engine,
                LifecycleState::Uninitialized => {
                    *state = LifecycleState::Uninitialized;
                    return Ok(None);
                }
                LifecycleState::ShutDown => return Err(EngineError::ShutDown),
            }
        };
        Ok(Some(engine.shutdown()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LifecycleState<S>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<S: Storage> JobSubmitter for EngineLifecycle<S> {
    fn submit(&self, message: Message) -> Result<(), EngineError> {
        EngineLifecycle::submit(self, message)
    }
}
