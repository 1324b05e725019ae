//! Supervisor for a set of projection workers.
//!
//! One OS thread per projection, each looping its runner's cycle. A worker
//! sleeps for the poll interval when caught up, parks itself as stalled
//! (position intact, retrying at the capped delay) when the store or source
//! stays unhealthy, and exits as failed on errors that can only be fixed by
//! a code or schema change. Stopping is cooperative: a flag checked between
//! cycles, then a join.

use crate::config::RunnerConfig;
use crate::runner::{ProjectionRunner, RunnerError};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Errors from managing workers, as opposed to errors inside a cycle.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("projection {projection} already has a worker")]
    AlreadyRunning { projection: &'static str },

    #[error("no worker registered for projection {projection}")]
    UnknownProjection { projection: String },

    #[error("failed to spawn worker thread: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },
}

/// Lifecycle of a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Consuming events, or idle and caught up.
    Running,
    /// Store or source unhealthy; holding position and retrying.
    Stalled,
    /// Hit an error retries cannot fix; the thread has exited.
    Failed,
    /// Stop was requested and the worker wound down cleanly.
    Stopped,
}

struct WorkerShared {
    status: Mutex<WorkerStatus>,
    last_error: Mutex<Option<String>>,
    position: AtomicU64,
    lag: AtomicU64,
    stop: AtomicBool,
}

impl WorkerShared {
    const fn new(position: u64) -> Self {
        Self {
            status: Mutex::new(WorkerStatus::Running),
            last_error: Mutex::new(None),
            position: AtomicU64::new(position),
            lag: AtomicU64::new(0),
            stop: AtomicBool::new(false),
        }
    }

    fn set_status(&self, status: WorkerStatus) {
        *self
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn status(&self) -> WorkerStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_error(&self, err: &RunnerError) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(format!("{}: {err}", err.code()));
    }

    fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct WorkerHandle {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

/// Spawns and tracks one worker per projection.
#[derive(Default)]
pub struct ProjectionRuntime {
    workers: HashMap<&'static str, WorkerHandle>,
}

impl std::fmt::Debug for ProjectionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionRuntime")
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl ProjectionRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a worker thread for `runner`.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::AlreadyRunning`] if the projection already has a
    /// worker, or [`RuntimeError::Spawn`] if the OS refuses the thread.
    pub fn spawn(&mut self, runner: ProjectionRunner) -> Result<(), RuntimeError> {
        let name = runner.name();
        if self.workers.contains_key(name) {
            return Err(RuntimeError::AlreadyRunning { projection: name });
        }

        let shared = Arc::new(WorkerShared::new(runner.position()));
        let worker_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(format!("proj-{name}"))
            .spawn(move || worker_loop(runner, &worker_shared))
            .map_err(|source| RuntimeError::Spawn { source })?;

        tracing::info!(projection = name, "worker spawned");
        self.workers.insert(
            name,
            WorkerHandle {
                shared,
                thread: Some(thread),
            },
        );
        Ok(())
    }

    #[must_use]
    pub fn status(&self, projection: &str) -> Option<WorkerStatus> {
        self.workers.get(projection).map(|w| w.shared.status())
    }

    /// Last committed position, as observed by the worker.
    #[must_use]
    pub fn position(&self, projection: &str) -> Option<u64> {
        self.workers
            .get(projection)
            .map(|w| w.shared.position.load(Ordering::Relaxed))
    }

    /// Events between the log head and the worker's position, as of its
    /// most recent cycle.
    #[must_use]
    pub fn lag(&self, projection: &str) -> Option<u64> {
        self.workers
            .get(projection)
            .map(|w| w.shared.lag.load(Ordering::Relaxed))
    }

    /// Message of the error behind a stalled or failed status.
    #[must_use]
    pub fn last_error(&self, projection: &str) -> Option<String> {
        self.workers
            .get(projection)
            .and_then(|w| w.shared.last_error())
    }

    /// Status of every worker, ordered by projection name.
    #[must_use]
    pub fn statuses(&self) -> BTreeMap<&'static str, WorkerStatus> {
        self.workers
            .iter()
            .map(|(name, w)| (*name, w.shared.status()))
            .collect()
    }

    /// Stop one worker and wait for it to finish its current cycle.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::UnknownProjection`] if nothing was spawned under
    /// this name.
    pub fn stop(&mut self, projection: &str) -> Result<(), RuntimeError> {
        let worker = self
            .workers
            .get_mut(projection)
            .ok_or_else(|| RuntimeError::UnknownProjection {
                projection: projection.to_owned(),
            })?;
        worker.shared.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = worker.thread.take() {
            if thread.join().is_err() {
                tracing::error!(projection, "worker thread panicked");
                worker.shared.set_status(WorkerStatus::Failed);
            }
        }
        tracing::info!(projection, "worker stopped");
        Ok(())
    }

    /// Stop every worker and wait for all of them.
    pub fn shutdown(mut self) {
        for worker in self.workers.values() {
            worker.shared.stop.store(true, Ordering::Relaxed);
        }
        let names: Vec<&'static str> = self.workers.keys().copied().collect();
        for name in names {
            // Already flagged, so this only joins.
            let _ = self.stop(name);
        }
    }
}

impl Drop for ProjectionRuntime {
    fn drop(&mut self) {
        for worker in self.workers.values() {
            worker.shared.stop.store(true, Ordering::Relaxed);
        }
    }
}

fn worker_loop(mut runner: ProjectionRunner, shared: &WorkerShared) {
    let config: RunnerConfig = runner.config().clone();
    let poll = config.poll_interval();
    let stall_pause = Duration::from_millis(config.retry.max_delay_ms);

    while !shared.stop.load(Ordering::Relaxed) {
        match runner.run_cycle() {
            Ok(report) => {
                shared.position.store(report.position, Ordering::Relaxed);
                if let Ok(lag) = runner.lag() {
                    shared.lag.store(lag, Ordering::Relaxed);
                }
                shared.set_status(WorkerStatus::Running);
                if report.caught_up() {
                    std::thread::sleep(poll);
                }
            }
            Err(err)
                if err.is_transient() || matches!(err, RunnerError::RetriesExhausted { .. }) =>
            {
                tracing::warn!(
                    projection = runner.name(),
                    code = %err.code(),
                    error = %err,
                    "projection stalled, will retry"
                );
                shared.record_error(&err);
                shared.set_status(WorkerStatus::Stalled);
                std::thread::sleep(stall_pause);
            }
            Err(err) => {
                tracing::error!(
                    projection = runner.name(),
                    code = %err.code(),
                    error = %err,
                    "projection failed, worker exiting"
                );
                shared.record_error(&err);
                shared.set_status(WorkerStatus::Failed);
                return;
            }
        }
    }
    shared.set_status(WorkerStatus::Stopped);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
