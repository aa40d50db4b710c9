use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Result, WorkerError};

/// Lifecycle of a worker.
///
/// `Starting -> Running -> Closing -> Closed`, with
/// `Starting | Running -> Errored -> Closed` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    Starting,
    Running,
    Closing,
    Errored,
    Closed,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Closing => "closing",
            WorkerState::Errored => "errored",
            WorkerState::Closed => "closed",
        }
    }

    /// Whether the worker can still serve requests or become able to.
    pub fn is_alive(self) -> bool {
        matches!(self, WorkerState::Starting | WorkerState::Running)
    }

    fn can_become(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting | Running, Closing)
                | (Starting | Running, Errored)
                | (Closing | Errored, Closed)
        )
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a worker went to `Errored`. Kept so late callers of
/// [`Worker::wait_running`](crate::Worker::wait_running) see the same cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    Spawn(String),
    InvalidSettings(String),
    UnexpectedExit {
        code: Option<i32>,
        signal: Option<i32>,
    },
    ProtocolCorruption(String),
}

impl Failure {
    pub fn to_error(&self) -> WorkerError {
        match self {
            Failure::Spawn(msg) => WorkerError::Spawn(msg.clone()),
            Failure::InvalidSettings(msg) => WorkerError::InvalidSettings(msg.clone()),
            Failure::UnexpectedExit { code, signal } => WorkerError::UnexpectedExit {
                code: *code,
                signal: *signal,
            },
            Failure::ProtocolCorruption(msg) => WorkerError::ProtocolCorruption(msg.clone()),
        }
    }
}

pub type StateHandler = Arc<dyn Fn(u32, WorkerState, WorkerState) + Send + Sync>;

struct Snapshot {
    state: WorkerState,
    failure: Option<Failure>,
}

/// Thread-safe state cell with change notification.
pub(crate) struct Lifecycle {
    pid: u32,
    current: Mutex<Snapshot>,
    changed: Condvar,
    handlers: Mutex<Vec<StateHandler>>,
}

impl Lifecycle {
    pub(crate) fn new(pid: u32) -> Self {
        Self {
            pid,
            current: Mutex::new(Snapshot {
                state: WorkerState::Starting,
                failure: None,
            }),
            changed: Condvar::new(),
            handlers: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Snapshot> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn state(&self) -> WorkerState {
        self.lock().state
    }

    pub(crate) fn failure(&self) -> Option<Failure> {
        self.lock().failure.clone()
    }

    pub(crate) fn subscribe(&self, handler: StateHandler) {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.push(handler);
        }
    }

    /// Move to `next` if the lifecycle allows it. Returns whether it moved.
    pub(crate) fn transition(&self, next: WorkerState) -> bool {
        self.transition_with(next, None)
    }

    /// Move to `Errored`, keeping the first recorded cause.
    pub(crate) fn fail(&self, failure: Failure) -> bool {
        self.transition_with(WorkerState::Errored, Some(failure))
    }

    fn transition_with(&self, next: WorkerState, failure: Option<Failure>) -> bool {
        let previous = {
            let mut current = self.lock();
            if !current.state.can_become(next) {
                return false;
            }
            let previous = current.state;
            current.state = next;
            if current.failure.is_none() {
                current.failure = failure;
            }
            previous
        };
        self.changed.notify_all();

        if next == WorkerState::Errored {
            warn!(worker_pid = self.pid, from = %previous, "worker errored");
        } else {
            debug!(worker_pid = self.pid, from = %previous, to = %next, "worker state changed");
        }

        // Handlers run without the state lock so they may query the worker.
        let handlers: Vec<StateHandler> = match self.handlers.lock() {
            Ok(handlers) => handlers.clone(),
            Err(_) => Vec::new(),
        };
        for handler in handlers {
            handler(self.pid, previous, next);
        }
        true
    }

    /// Block until the worker leaves `Starting`.
    pub(crate) fn wait_running(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut current = self.lock();
        while current.state == WorkerState::Starting {
            let now = Instant::now();
            if now >= deadline {
                return Err(WorkerError::StartupTimeout(timeout));
            }
            current = match self.changed.wait_timeout(current, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        match (current.state, &current.failure) {
            (WorkerState::Running, _) => Ok(()),
            (_, Some(failure)) => Err(failure.to_error()),
            _ => Err(WorkerError::Closed),
        }
    }

    /// Block until the worker is `Closed` or the timeout passes.
    pub(crate) fn wait_closed(&self, timeout: Duration) -> bool {
        let current = self.lock();
        let result = self
            .changed
            .wait_timeout_while(current, timeout, |s| s.state != WorkerState::Closed);
        match result {
            Ok((current, _)) => current.state == WorkerState::Closed,
            Err(poisoned) => poisoned.into_inner().0.state == WorkerState::Closed,
        }
    }
}
