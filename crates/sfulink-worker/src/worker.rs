use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sfulink_channel::{
    Channel, ChannelConfig, ChannelFault, ChannelObserver, ChannelOptions, EntityRegistry, Method,
    Notification, RoutingContext,
};
use sfulink_transport::Transport;
use tracing::{debug, error, info, warn};

use crate::error::{Result, WorkerError};
use crate::native::{self, NativeWorkerRun};
use crate::settings::{BackendKind, LogLevel, LogTag, WorkerSettings, WorkerStartup};
use crate::state::{Failure, Lifecycle, StateHandler, WorkerState};

/// Exit code of a worker that refused its settings.
pub const INVALID_SETTINGS_EXIT_CODE: i32 = 42;

/// Event the worker emits on its own id once it is ready.
const RUNNING_EVENT: &str = "running";

/// How long [`Worker::close`] waits for the worker to exit before escalating.
const CLOSE_WAIT: Duration = Duration::from_secs(5);

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// How a worker ended, as seen by its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// What the worker needs from the thing actually running it.
pub(crate) trait Backend: Send + Sync {
    /// Ask the worker to stop and give it a chance to do so.
    fn shutdown(&self, channel: &Channel);
    /// Ask the worker to stop without waiting.
    fn terminate(&self);
    /// Last resort after `wait_exit` timed out.
    fn kill(&self);
    /// Whether the worker is gone within `timeout`.
    fn wait_exit(&self, timeout: Duration) -> bool;
}

/// Counters returned by `worker.getResourceUsage`, as in getrusage(2).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerResourceUsage {
    pub ru_utime: u64,
    pub ru_stime: u64,
    pub ru_maxrss: u64,
    pub ru_ixrss: u64,
    pub ru_idrss: u64,
    pub ru_isrss: u64,
    pub ru_minflt: u64,
    pub ru_majflt: u64,
    pub ru_nswap: u64,
    pub ru_inblock: u64,
    pub ru_oublock: u64,
    pub ru_msgsnd: u64,
    pub ru_msgrcv: u64,
    pub ru_nsignals: u64,
    pub ru_nvcsw: u64,
    pub ru_nivcsw: u64,
}

struct WorkerInner {
    id: u64,
    pid: u32,
    kind: BackendKind,
    lifecycle: Arc<Lifecycle>,
    channel: Channel,
    backend: Box<dyn Backend>,
}

impl Drop for WorkerInner {
    fn drop(&mut self) {
        if self.lifecycle.state().is_alive() {
            debug!(worker_pid = self.pid, "worker dropped while alive, terminating");
            self.backend.terminate();
            self.channel.close();
        }
    }
}

/// Channel events that drive the lifecycle.
struct WorkerObserver {
    pid: u32,
    lifecycle: Arc<Lifecycle>,
    worker: OnceLock<Weak<WorkerInner>>,
}

impl ChannelObserver for WorkerObserver {
    fn on_owner_notification(&self, notification: &Notification) {
        if notification.event == RUNNING_EVENT {
            if self.lifecycle.transition(WorkerState::Running) {
                info!(worker_pid = self.pid, "worker running");
            }
        } else {
            debug!(worker_pid = self.pid, event = %notification.event, "ignoring worker event");
        }
    }

    fn on_fault(&self, fault: &ChannelFault) {
        error!(worker_pid = self.pid, %fault, "worker channel failed");
        if self
            .lifecycle
            .fail(Failure::ProtocolCorruption(fault.to_string()))
        {
            if let Some(worker) = self.worker.get().and_then(Weak::upgrade) {
                worker.backend.terminate();
            }
        }
    }

    fn on_transport_closed(&self) {
        debug!(worker_pid = self.pid, state = %self.lifecycle.state(), "worker closed its channel");
    }
}

/// Settle the lifecycle after the backend reports that the worker is gone.
fn handle_exit(pid: u32, lifecycle: &Lifecycle, worker: &Weak<WorkerInner>, report: ExitReport) {
    match lifecycle.state() {
        WorkerState::Starting => {
            let failure = if report.code == Some(INVALID_SETTINGS_EXIT_CODE) {
                Failure::InvalidSettings(format!(
                    "worker exited with code {INVALID_SETTINGS_EXIT_CODE}"
                ))
            } else {
                Failure::Spawn(format!(
                    "worker exited before running (code: {:?}, signal: {:?})",
                    report.code, report.signal
                ))
            };
            error!(
                worker_pid = pid,
                code = ?report.code,
                signal = ?report.signal,
                "worker failed to start"
            );
            lifecycle.fail(failure);
        }
        WorkerState::Running => {
            error!(
                worker_pid = pid,
                code = ?report.code,
                signal = ?report.signal,
                "worker died unexpectedly"
            );
            lifecycle.fail(Failure::UnexpectedExit {
                code: report.code,
                signal: report.signal,
            });
        }
        // Closing is finished by `Worker::close`.
        WorkerState::Closing | WorkerState::Errored | WorkerState::Closed => {}
    }

    if let Some(worker) = worker.upgrade() {
        worker.channel.close();
    }
    if lifecycle.state() == WorkerState::Errored {
        lifecycle.transition(WorkerState::Closed);
    }
}

/// A media worker: a running process or native thread plus its channel.
///
/// Cloning yields another handle to the same worker.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    /// Spawn a worker process with the given settings.
    ///
    /// Returns once the process is launched; use [`Worker::wait_running`] to
    /// wait for it to become ready.
    #[cfg(unix)]
    pub fn spawn(
        startup: &WorkerStartup,
        settings: &WorkerSettings,
        channel: ChannelConfig,
    ) -> Result<Worker> {
        if startup.backend != BackendKind::Process {
            return Err(WorkerError::Config(
                "native backend needs an entry point, use Worker::spawn_native".into(),
            ));
        }
        settings.validate()?;

        let spawned = crate::process::spawn(startup, settings)?;
        let pid = spawned.pid;
        let lifecycle = Arc::new(Lifecycle::new(pid));

        // The monitor starts before the worker exists; it learns about it
        // through a cell filled in right after.
        let slot: Arc<OnceLock<Weak<WorkerInner>>> = Arc::new(OnceLock::new());
        let exit_slot = Arc::clone(&slot);
        let exit_lifecycle = Arc::clone(&lifecycle);
        let backend = crate::process::supervise(spawned.child, pid, move |report| {
            let worker = exit_slot.get().cloned().unwrap_or_default();
            handle_exit(pid, &exit_lifecycle, &worker, report);
        })?;

        let worker = Self::assemble(
            pid,
            BackendKind::Process,
            lifecycle,
            spawned.transport,
            channel,
            Box::new(backend),
        )?;
        let _ = slot.set(Arc::downgrade(&worker.inner));
        worker.settle_early_exit();
        Ok(worker)
    }

    /// Run a native worker entry point on a thread of this process.
    pub fn spawn_native(
        entry: NativeWorkerRun,
        startup: &WorkerStartup,
        settings: &WorkerSettings,
        channel: ChannelConfig,
    ) -> Result<Worker> {
        settings.validate()?;

        // The worker reports the host process id as its own.
        let pid = std::process::id();
        let (transport, backend, runner) = native::prepare(startup, settings, &channel)?.into_parts();
        let lifecycle = Arc::new(Lifecycle::new(pid));

        let worker = Self::assemble(
            pid,
            BackendKind::Native,
            Arc::clone(&lifecycle),
            transport,
            channel,
            Box::new(backend),
        )?;

        let weak = Arc::downgrade(&worker.inner);
        runner.start(entry, pid, move |report| {
            handle_exit(pid, &lifecycle, &weak, report);
        })?;
        Ok(worker)
    }

    fn assemble(
        pid: u32,
        kind: BackendKind,
        lifecycle: Arc<Lifecycle>,
        transport: Transport,
        config: ChannelConfig,
        backend: Box<dyn Backend>,
    ) -> Result<Worker> {
        let observer = Arc::new(WorkerObserver {
            pid,
            lifecycle: Arc::clone(&lifecycle),
            worker: OnceLock::new(),
        });
        let options = ChannelOptions {
            config,
            registry: EntityRegistry::new(),
            owner_id: Some(pid.to_string()),
            observer: observer.clone(),
            worker_pid: pid,
        };
        let channel = match Channel::with_options(transport, options) {
            Ok(channel) => channel,
            Err(err) => {
                backend.terminate();
                return Err(err.into());
            }
        };

        let inner = Arc::new(WorkerInner {
            id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
            pid,
            kind,
            lifecycle,
            channel,
            backend,
        });
        let _ = observer.worker.set(Arc::downgrade(&inner));
        if inner.lifecycle.state() == WorkerState::Errored {
            // Faulted before the observer could reach the backend.
            inner.backend.terminate();
        }
        Ok(Worker { inner })
    }

    /// Catch up on an exit reported before the worker handle existed.
    #[cfg(unix)]
    fn settle_early_exit(&self) {
        if self.inner.lifecycle.state() == WorkerState::Closed {
            self.inner.channel.close();
        }
    }

    /// Identifier unique among the workers of this process. In-process
    /// workers share the host pid, so this is what tells them apart.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.kind
    }

    pub fn state(&self) -> WorkerState {
        self.inner.lifecycle.state()
    }

    /// Error that moved the worker to `Errored`, if any.
    pub fn failure(&self) -> Option<WorkerError> {
        self.inner.lifecycle.failure().map(|failure| failure.to_error())
    }

    pub fn is_closed(&self) -> bool {
        self.state() == WorkerState::Closed
    }

    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    /// Entities that receive notifications from this worker.
    pub fn registry(&self) -> &EntityRegistry {
        self.inner.channel.registry()
    }

    /// Block until the worker reports running.
    pub fn wait_running(&self, timeout: Duration) -> Result<()> {
        self.inner.lifecycle.wait_running(timeout)
    }

    /// Call `handler(pid, from, to)` on every later state change.
    ///
    /// Handlers run on whichever thread caused the change, possibly the
    /// channel reader, and must not block.
    pub fn on_state_change(
        &self,
        handler: impl Fn(u32, WorkerState, WorkerState) + Send + Sync + 'static,
    ) {
        let handler: StateHandler = Arc::new(handler);
        self.inner.lifecycle.subscribe(handler);
    }

    /// Send a request to the worker and wait for its answer.
    pub fn request(
        &self,
        method: Method,
        routing: RoutingContext,
        data: Option<Value>,
    ) -> Result<Option<Value>> {
        if !self.state().is_alive() {
            return Err(WorkerError::Closed);
        }
        Ok(self.inner.channel.request(method, routing, data)?)
    }

    /// Internal state of the worker (`worker.dump`).
    pub fn dump(&self) -> Result<Value> {
        let data = self.request(Method::WorkerDump, RoutingContext::Worker, None)?;
        Ok(data.unwrap_or(Value::Null))
    }

    /// Resource usage of the worker (`worker.getResourceUsage`).
    pub fn resource_usage(&self) -> Result<WorkerResourceUsage> {
        let data = self.request(Method::WorkerGetResourceUsage, RoutingContext::Worker, None)?;
        let data = data.unwrap_or(Value::Null);
        serde_json::from_value(data)
            .map_err(|err| WorkerError::Channel(sfulink_channel::ChannelError::Json(err)))
    }

    /// Change log settings of the running worker (`worker.updateSettings`).
    pub fn update_settings(
        &self,
        log_level: Option<LogLevel>,
        log_tags: Option<&[LogTag]>,
    ) -> Result<()> {
        let mut data = json!({});
        if let Some(level) = log_level {
            data["logLevel"] = json!(level);
        }
        if let Some(tags) = log_tags {
            data["logTags"] = json!(tags);
        }
        self.request(Method::WorkerUpdateSettings, RoutingContext::Worker, Some(data))?;
        Ok(())
    }

    /// Stop the worker. Idempotent.
    ///
    /// Fails pending requests, stops the process or native thread and leaves
    /// the worker `Closed`. Steps that fail are logged and skipped.
    pub fn close(&self) {
        let inner = &self.inner;
        match inner.lifecycle.state() {
            WorkerState::Closed => return,
            WorkerState::Closing => {
                inner.lifecycle.wait_closed(CLOSE_WAIT * 2);
                return;
            }
            _ => {}
        }

        debug!(worker_pid = inner.pid, "closing worker");
        if inner.lifecycle.transition(WorkerState::Closing) {
            inner.backend.shutdown(&inner.channel);
        } else {
            inner.backend.terminate();
        }
        inner.channel.close();

        if !inner.backend.wait_exit(CLOSE_WAIT) {
            inner.backend.kill();
            if !inner.backend.wait_exit(CLOSE_WAIT) {
                warn!(worker_pid = inner.pid, "worker still running after close");
            }
        }

        if !inner.lifecycle.transition(WorkerState::Closed) {
            debug!(worker_pid = inner.pid, state = %inner.lifecycle.state(), "worker already settled");
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.inner.id)
            .field("pid", &self.inner.pid)
            .field("backend", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}
