use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Result, WorkerError};
use crate::native::NativeWorkerRun;
use crate::settings::{BackendKind, ManagerConfig};
use crate::state::WorkerState;
use crate::worker::Worker;

type WorkerList = Arc<Mutex<Vec<Worker>>>;

fn lock(list: &Mutex<Vec<Worker>>) -> MutexGuard<'_, Vec<Worker>> {
    list.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns the workers of one host process.
///
/// Construct one per process and pass it to whatever needs to reach workers.
/// Closed workers drop out of the set on their own.
pub struct WorkerManager {
    config: ManagerConfig,
    native_entry: Option<NativeWorkerRun>,
    workers: WorkerList,
    next: AtomicUsize,
}

impl WorkerManager {
    pub fn new(config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            native_entry: None,
            workers: Arc::new(Mutex::new(Vec::new())),
            next: AtomicUsize::new(0),
        })
    }

    /// Entry point used when the config selects the native backend.
    pub fn with_native_entry(mut self, entry: NativeWorkerRun) -> Self {
        self.native_entry = Some(entry);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Start the configured number of workers.
    ///
    /// If one fails to spawn, the ones already started are closed again.
    pub fn start(&self) -> Result<Vec<Worker>> {
        let count = self.config.startup.worker_count();
        let mut started = Vec::with_capacity(count);
        for _ in 0..count {
            match self.spawn_worker() {
                Ok(worker) => started.push(worker),
                Err(err) => {
                    warn!(error = %err, started = started.len(), "worker spawn failed, rolling back");
                    for worker in &started {
                        worker.close();
                    }
                    return Err(err);
                }
            }
        }
        info!(count, backend = ?self.config.startup.backend, "workers spawned");
        Ok(started)
    }

    /// Start one more worker and add it to the set.
    pub fn spawn_worker(&self) -> Result<Worker> {
        let startup = &self.config.startup;
        let settings = &self.config.worker_settings;
        let channel = self.config.channel.to_channel_config();

        let worker = match startup.backend {
            #[cfg(unix)]
            BackendKind::Process => Worker::spawn(startup, settings, channel)?,
            #[cfg(not(unix))]
            BackendKind::Process => {
                return Err(WorkerError::Config(
                    "process backend is only available on unix".into(),
                ))
            }
            BackendKind::Native => {
                let entry = self.native_entry.ok_or_else(|| {
                    WorkerError::Config("native backend selected without an entry point".into())
                })?;
                Worker::spawn_native(entry, startup, settings, channel)?
            }
        };

        let list: Weak<Mutex<Vec<Worker>>> = Arc::downgrade(&self.workers);
        worker.on_state_change(move |pid, _, to| {
            if to != WorkerState::Closed {
                return;
            }
            if let Some(list) = list.upgrade() {
                lock(&list).retain(|worker| !worker.is_closed());
                debug!(worker_pid = pid, "closed worker removed");
            }
        });

        lock(&self.workers).push(worker.clone());
        Ok(worker)
    }

    /// Wait until every worker still in the set is running, failing on the
    /// first that is not. Workers that already closed have been pruned.
    pub fn wait_running(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        for worker in self.workers() {
            let left = deadline.saturating_duration_since(Instant::now());
            worker.wait_running(left).map_err(|err| match err {
                WorkerError::StartupTimeout(_) => WorkerError::StartupTimeout(timeout),
                other => other,
            })?;
        }
        Ok(())
    }

    /// Next running worker in round-robin order.
    pub fn next_worker(&self) -> Option<Worker> {
        let workers = lock(&self.workers);
        if workers.is_empty() {
            return None;
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        (0..workers.len())
            .map(|offset| &workers[(start + offset) % workers.len()])
            .find(|worker| worker.state() == WorkerState::Running)
            .cloned()
    }

    /// Worker with the given process id.
    pub fn get(&self, pid: u32) -> Option<Worker> {
        lock(&self.workers)
            .iter()
            .find(|worker| worker.pid() == pid)
            .cloned()
    }

    /// Snapshot of the current workers.
    pub fn workers(&self) -> Vec<Worker> {
        lock(&self.workers).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.workers).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.workers).is_empty()
    }

    /// Drop closed workers. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut workers = lock(&self.workers);
        let before = workers.len();
        workers.retain(|worker| !worker.is_closed());
        before - workers.len()
    }

    /// Close every worker and empty the set.
    pub fn close_all(&self) {
        // Closing fires state handlers that take the list lock.
        let workers = std::mem::take(&mut *lock(&self.workers));
        for worker in &workers {
            worker.close();
        }
        if !workers.is_empty() {
            info!(count = workers.len(), "workers closed");
        }
    }
}

impl std::fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerManager")
            .field("backend", &self.config.startup.backend)
            .field("workers", &self.len())
            .finish()
    }
}
