//! Out-of-process worker backend.
//!
//! The worker executable is spawned with two socket descriptors: fd 3 carries
//! host-to-worker frames, fd 4 worker-to-host frames. Its stdout and stderr
//! are forwarded to `tracing` line by line.

use std::io::{BufRead, BufReader, Read};
use std::os::fd::AsRawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use sfulink_channel::{Channel, WORKER_LOG_TARGET};
use sfulink_transport::{remap_fds, socket_pair, Transport};
use tracing::{debug, error, warn};

use crate::error::{Result, WorkerError};
use crate::settings::{WorkerSettings, WorkerStartup};
use crate::worker::{Backend, ExitReport};

/// Descriptor the worker reads requests from.
const PRODUCER_FD: i32 = 3;
/// Descriptor the worker writes responses and notifications to.
const CONSUMER_FD: i32 = 4;

/// A freshly spawned worker process and the host end of its channel.
pub(crate) struct SpawnedProcess {
    pub(crate) pid: u32,
    pub(crate) child: Child,
    pub(crate) transport: Transport,
}

pub(crate) fn spawn(startup: &WorkerStartup, settings: &WorkerSettings) -> Result<SpawnedProcess> {
    let (host_producer, worker_producer) = socket_pair()?;
    let (host_consumer, worker_consumer) = socket_pair()?;

    let mut command = Command::new(&startup.worker_path);
    command
        .args(settings.to_args())
        .env("MEDIASOUP_VERSION", &startup.mediasoup_version)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let producer_fd = worker_producer.as_raw_fd();
    let consumer_fd = worker_consumer.as_raw_fd();
    // SAFETY: The hook runs in the forked child, which owns fds 3 and 4.
    unsafe {
        command.pre_exec(move || {
            remap_fds([(producer_fd, PRODUCER_FD), (consumer_fd, CONSUMER_FD)])
        });
    }

    let child = command.spawn().map_err(|err| {
        WorkerError::Spawn(format!("{}: {err}", startup.worker_path.display()))
    })?;
    // The child holds its own copies now.
    drop(worker_producer);
    drop(worker_consumer);

    let pid = child.id();
    debug!(worker_pid = pid, path = %startup.worker_path.display(), "worker process spawned");

    let transport = Transport::from_streams(host_producer, host_consumer)?;
    Ok(SpawnedProcess {
        pid,
        child,
        transport,
    })
}

/// Forward the child's output and start waiting for it to exit.
pub(crate) fn supervise(
    mut child: Child,
    pid: u32,
    on_exit: impl FnOnce(ExitReport) + Send + 'static,
) -> Result<ProcessBackend> {
    if let Some(stdout) = child.stdout.take() {
        forward_output(stdout, pid, false)?;
    }
    if let Some(stderr) = child.stderr.take() {
        forward_output(stderr, pid, true)?;
    }

    let exited = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = mpsc::channel();
    let backend = ProcessBackend {
        pid,
        exited: Arc::clone(&exited),
        done: Mutex::new(done_rx),
    };

    thread::Builder::new()
        .name(format!("sfulink-wait-{pid}"))
        .spawn(move || wait_child(child, pid, exited, done_tx, on_exit))?;
    Ok(backend)
}

fn wait_child(
    mut child: Child,
    pid: u32,
    exited: Arc<AtomicBool>,
    done: Sender<()>,
    on_exit: impl FnOnce(ExitReport),
) {
    let report = match child.wait() {
        Ok(status) => ExitReport {
            code: status.code(),
            signal: status.signal(),
        },
        Err(err) => {
            error!(worker_pid = pid, error = %err, "failed to wait for worker process");
            ExitReport {
                code: None,
                signal: None,
            }
        }
    };
    exited.store(true, Ordering::SeqCst);
    debug!(worker_pid = pid, code = ?report.code, signal = ?report.signal, "worker process exited");
    on_exit(report);
    let _ = done.send(());
}

fn forward_output(stream: impl Read + Send + 'static, pid: u32, is_stderr: bool) -> Result<()> {
    let name = if is_stderr { "err" } else { "out" };
    thread::Builder::new()
        .name(format!("sfulink-std{name}-{pid}"))
        .spawn(move || {
            for line in BufReader::new(stream).lines() {
                let Ok(line) = line else { break };
                if line.is_empty() {
                    continue;
                }
                if is_stderr {
                    error!(target: WORKER_LOG_TARGET, worker_pid = pid, "(stderr) {line}");
                } else {
                    debug!(target: WORKER_LOG_TARGET, worker_pid = pid, "(stdout) {line}");
                }
            }
        })?;
    Ok(())
}

/// Host handle to a spawned worker process.
pub(crate) struct ProcessBackend {
    pid: u32,
    exited: Arc<AtomicBool>,
    done: Mutex<Receiver<()>>,
}

impl ProcessBackend {
    fn signal(&self, signal: libc::c_int) {
        if self.exited.load(Ordering::SeqCst) {
            return;
        }
        let Ok(pid) = libc::pid_t::try_from(self.pid) else {
            return;
        };
        // SAFETY: kill(2) has no memory-safety preconditions.
        if unsafe { libc::kill(pid, signal) } != 0 {
            let err = std::io::Error::last_os_error();
            debug!(worker_pid = self.pid, signal, error = %err, "failed to signal worker");
        }
    }
}

impl Backend for ProcessBackend {
    fn shutdown(&self, _channel: &Channel) {
        self.signal(libc::SIGTERM);
    }

    fn terminate(&self) {
        self.signal(libc::SIGTERM);
    }

    fn kill(&self) {
        warn!(worker_pid = self.pid, "worker ignored SIGTERM, killing it");
        self.signal(libc::SIGKILL);
    }

    fn wait_exit(&self, timeout: Duration) -> bool {
        if self.exited.load(Ordering::SeqCst) {
            return true;
        }
        let Ok(done) = self.done.lock() else {
            return false;
        };
        match done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => self.exited.load(Ordering::SeqCst),
        }
    }
}
