use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use sfulink_frame::{
    encode_frame, FrameConfig, FrameError, FrameReader, FrameWriter, MESSAGE_MAX_LEN,
    PAYLOAD_MAX_LEN, RECV_BUFFER_MAX_LEN,
};
use sfulink_transport::{Transport, TransportShutdown};
use tracing::{debug, error, info, warn};

use crate::error::{ChannelError, Result};
use crate::message::{
    classify, HostNotification, InboundMessage, Notification, RequestMessage, ResponseOutcome,
    RoutingContext, WorkerLogLevel,
};
use crate::method::Method;
use crate::pending::PendingTable;
use crate::registry::EntityRegistry;

/// Target of log lines the worker writes on the channel.
pub const WORKER_LOG_TARGET: &str = "sfulink::worker";

/// Limits and timeouts of a channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Hard ceiling for one frame, header included.
    pub message_max_len: usize,
    /// Ceiling for a serialized request.
    pub payload_max_len: usize,
    /// Capacity of the receive reassembly buffer.
    pub recv_buffer_capacity: usize,
    /// Deadline of a request issued while nothing else is pending.
    pub base_timeout: Duration,
    /// Extra deadline per request already pending at send time.
    pub timeout_per_pending: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            message_max_len: MESSAGE_MAX_LEN,
            payload_max_len: PAYLOAD_MAX_LEN,
            recv_buffer_capacity: RECV_BUFFER_MAX_LEN,
            base_timeout: Duration::from_secs(15),
            timeout_per_pending: Duration::from_millis(100),
        }
    }
}

impl ChannelConfig {
    /// Deadline for a request sent while `pending` others are outstanding.
    pub fn timeout_for(&self, pending: usize) -> Duration {
        let pending = u32::try_from(pending).unwrap_or(u32::MAX);
        self.base_timeout
            .saturating_add(self.timeout_per_pending.saturating_mul(pending))
    }

    /// Frame a serialized message, enforcing the payload and frame ceilings.
    pub fn encode_payload(&self, payload: &[u8]) -> Result<Bytes> {
        if payload.len() > self.payload_max_len {
            return Err(ChannelError::PayloadTooLarge {
                size: payload.len(),
                max: self.payload_max_len,
            });
        }
        let mut frame = BytesMut::with_capacity(payload.len() + 4);
        encode_frame(payload, self.message_max_len, &mut frame).map_err(|_| {
            ChannelError::PayloadTooLarge {
                size: payload.len(),
                max: self.message_max_len,
            }
        })?;
        Ok(frame.freeze())
    }

    /// The complete frame of a host-to-worker notification.
    pub fn notification_frame(
        &self,
        event: Method,
        routing: RoutingContext,
        data: Option<Value>,
    ) -> Result<Bytes> {
        let payload = serde_json::to_vec(&HostNotification::new(event, routing, data))?;
        self.encode_payload(&payload)
    }

    fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_message_len: self.message_max_len,
            recv_buffer_capacity: self.recv_buffer_capacity,
        }
    }
}

/// A condition after which the channel can no longer be trusted.
#[derive(Debug)]
pub enum ChannelFault {
    /// The receive buffer overflowed or a frame boundary was unreadable.
    /// Buffered bytes were discarded.
    ProtocolCorruption(FrameError),
    /// Reading from the transport failed.
    ReadFailed(FrameError),
}

impl std::fmt::Display for ChannelFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelFault::ProtocolCorruption(err) => write!(f, "protocol corruption: {err}"),
            ChannelFault::ReadFailed(err) => write!(f, "read failed: {err}"),
        }
    }
}

/// Hooks the owner of a channel receives on the reader thread.
///
/// All methods run inline on the reader thread and must not block on the
/// channel (in particular, must not issue requests and wait for them).
pub trait ChannelObserver: Send + Sync {
    /// A notification addressed to the reserved owner id arrived.
    fn on_owner_notification(&self, _notification: &Notification) {}

    /// The channel hit a fault and is about to close.
    fn on_fault(&self, _fault: &ChannelFault) {}

    /// The worker closed its end of the transport.
    fn on_transport_closed(&self) {}
}

struct NoopObserver;

impl ChannelObserver for NoopObserver {}

/// Options for constructing a [`Channel`].
pub struct ChannelOptions {
    pub config: ChannelConfig,
    pub registry: EntityRegistry,
    /// Notifications for this target id go to the observer, not the registry.
    pub owner_id: Option<String>,
    pub observer: Arc<dyn ChannelObserver>,
    /// Used in log fields and thread names.
    pub worker_pid: u32,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            config: ChannelConfig::default(),
            registry: EntityRegistry::new(),
            owner_id: None,
            observer: Arc::new(NoopObserver),
            worker_pid: 0,
        }
    }
}

struct WriteCommand {
    /// `None` for notifications, which have no pending entry.
    id: Option<u32>,
    method: Method,
    frame: Bytes,
}

struct ChannelInner {
    worker_pid: u32,
    config: ChannelConfig,
    registry: EntityRegistry,
    owner_id: Option<String>,
    observer: Arc<dyn ChannelObserver>,
    next_id: AtomicU32,
    pending: PendingTable,
    closed: AtomicBool,
    write_tx: Mutex<Option<Sender<WriteCommand>>>,
    shutdown: Mutex<Option<TransportShutdown>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// The framed request/response/notification engine for one worker.
///
/// Cloning yields another handle to the same channel. Requests may be issued
/// from any number of threads; frames are written by one writer thread and
/// inbound bytes are consumed by one reader thread.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Start a channel over `transport` with default options.
    pub fn new(transport: Transport) -> Result<Self> {
        Self::with_options(transport, ChannelOptions::default())
    }

    /// Start a channel over `transport`, spawning its reader and writer threads.
    pub fn with_options(transport: Transport, options: ChannelOptions) -> Result<Self> {
        let (reader, writer, shutdown) = transport.into_parts();
        let (write_tx, write_rx) = mpsc::channel::<WriteCommand>();

        let inner = Arc::new(ChannelInner {
            worker_pid: options.worker_pid,
            config: options.config,
            registry: options.registry,
            owner_id: options.owner_id,
            observer: options.observer,
            next_id: AtomicU32::new(0),
            pending: PendingTable::new(),
            closed: AtomicBool::new(false),
            write_tx: Mutex::new(Some(write_tx)),
            shutdown: Mutex::new(Some(shutdown)),
            threads: Mutex::new(Vec::with_capacity(2)),
        });

        let frame_config = inner.config.frame_config();
        let writer_handle = {
            let inner = Arc::clone(&inner);
            let writer = FrameWriter::with_config(writer, frame_config.clone());
            thread::Builder::new()
                .name(format!("sfulink-tx-{}", inner.worker_pid))
                .spawn(move || writer_loop(inner, writer, write_rx))?
        };

        let reader_handle = {
            let worker = Arc::clone(&inner);
            let reader = FrameReader::with_config(reader, frame_config);
            thread::Builder::new()
                .name(format!("sfulink-rx-{}", inner.worker_pid))
                .spawn(move || reader_loop(worker, reader))
        };
        let reader_handle = match reader_handle {
            Ok(handle) => handle,
            Err(err) => {
                let channel = Channel { inner };
                channel.close();
                return Err(err.into());
            }
        };

        if let Ok(mut threads) = inner.threads.lock() {
            threads.push(writer_handle);
            threads.push(reader_handle);
        }

        Ok(Channel { inner })
    }

    /// Send a request and block until it completes.
    ///
    /// Fails fast with `ChannelClosed` after close and with `PayloadTooLarge`
    /// when the serialized request exceeds the payload ceiling; in both cases
    /// nothing is written.
    pub fn request(
        &self,
        method: Method,
        routing: RoutingContext,
        data: Option<Value>,
    ) -> Result<Option<Value>> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::ChannelClosed);
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let message = RequestMessage::new(id, method, routing, data);
        let payload = serde_json::to_vec(&message)?;
        let frame = inner.config.encode_payload(&payload)?;

        let timeout = inner.config.timeout_for(inner.pending.len());
        let waiter = inner.pending.insert(id, method)?;

        // close() flips the flag before draining: either the drain saw our
        // entry or we see the flag here.
        if inner.closed.load(Ordering::SeqCst) {
            waiter.abandon();
            return Err(ChannelError::ChannelClosed);
        }

        let sent = match inner.write_tx.lock() {
            Ok(tx) => tx.as_ref().is_some_and(|tx| {
                tx.send(WriteCommand {
                    id: Some(id),
                    method,
                    frame,
                })
                .is_ok()
            }),
            Err(_) => false,
        };
        if !sent {
            waiter.abandon();
            return Err(ChannelError::ChannelClosed);
        }

        debug!(worker_pid = inner.worker_pid, id, %method, ?timeout, "request sent");
        waiter.wait(timeout)
    }

    /// Send a notification to the worker without waiting for anything.
    ///
    /// Shares the size checks and the writer thread with [`Channel::request`];
    /// write failures after this returns are only logged.
    pub fn notify(
        &self,
        event: Method,
        routing: RoutingContext,
        data: Option<Value>,
    ) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::ChannelClosed);
        }

        let frame = inner.config.notification_frame(event, routing, data)?;

        let sent = match inner.write_tx.lock() {
            Ok(tx) => tx.as_ref().is_some_and(|tx| {
                tx.send(WriteCommand {
                    id: None,
                    method: event,
                    frame,
                })
                .is_ok()
            }),
            Err(_) => false,
        };
        if !sent {
            return Err(ChannelError::ChannelClosed);
        }

        debug!(worker_pid = inner.worker_pid, %event, "notification sent");
        Ok(())
    }

    /// Send a request from async code on the blocking thread pool.
    #[cfg(feature = "async")]
    pub async fn request_async(
        &self,
        method: Method,
        routing: RoutingContext,
        data: Option<Value>,
    ) -> Result<Option<Value>> {
        let channel = self.clone();
        tokio::task::spawn_blocking(move || channel.request(method, routing, data))
            .await
            .map_err(|err| ChannelError::Io(std::io::Error::other(err.to_string())))?
    }

    /// Close the channel. Idempotent.
    ///
    /// Fails every pending request with `ChannelClosed`, stops dispatching
    /// inbound messages and shuts both transport directions down. Teardown
    /// errors are logged and do not stop the remaining steps.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!(worker_pid = inner.worker_pid, "closing channel");

        let pending = inner.pending.drain();
        if !pending.is_empty() {
            debug!(
                worker_pid = inner.worker_pid,
                count = pending.len(),
                "failing pending requests"
            );
        }
        for request in pending {
            request.cancel();
        }

        match inner.write_tx.lock() {
            Ok(mut tx) => drop(tx.take()),
            Err(err) => {
                error!(worker_pid = inner.worker_pid, error = %err, "writer handle poisoned")
            }
        }

        match inner.shutdown.lock() {
            Ok(mut shutdown) => {
                if let Some(shutdown) = shutdown.take() {
                    for err in shutdown.shutdown_all() {
                        error!(
                            worker_pid = inner.worker_pid,
                            error = %err,
                            "transport shutdown failed"
                        );
                    }
                }
            }
            Err(err) => {
                error!(worker_pid = inner.worker_pid, error = %err, "transport handle poisoned")
            }
        }

        let handles = match inner.threads.lock() {
            Ok(mut threads) => std::mem::take(&mut *threads),
            Err(_) => Vec::new(),
        };
        // close() also runs on the reader thread; it never joins itself.
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(worker_pid = inner.worker_pid, "channel thread panicked");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn worker_pid(&self) -> u32 {
        self.inner.worker_pid
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("worker_pid", &self.inner.worker_pid)
            .field("pending", &self.inner.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn writer_loop<W: std::io::Write>(
    inner: Arc<ChannelInner>,
    mut writer: FrameWriter<W>,
    rx: Receiver<WriteCommand>,
) {
    while let Ok(cmd) = rx.recv() {
        if let Err(err) = writer.send_encoded(&cmd.frame) {
            error!(
                worker_pid = inner.worker_pid,
                id = ?cmd.id,
                method = %cmd.method,
                error = %err,
                "failed to write frame"
            );
            let Some(id) = cmd.id else {
                continue;
            };
            if let Some(pending) = inner.pending.remove(id) {
                pending.reject(ChannelError::Write {
                    method: cmd.method,
                    id,
                    source: err,
                });
            }
        }
    }
    debug!(worker_pid = inner.worker_pid, "writer stopped");
}

fn reader_loop<R: Read>(inner: Arc<ChannelInner>, mut reader: FrameReader<R>) {
    loop {
        let result = reader.read_frames(|payload| {
            if !inner.closed.load(Ordering::SeqCst) {
                process_payload(&inner, &payload);
            }
        });

        match result {
            Ok(_) => {
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(FrameError::ConnectionClosed) => {
                if !inner.closed.load(Ordering::SeqCst) {
                    debug!(worker_pid = inner.worker_pid, "channel ended by the worker");
                    inner.observer.on_transport_closed();
                }
                break;
            }
            Err(err) if err.is_corruption() => {
                error!(
                    worker_pid = inner.worker_pid,
                    error = %err,
                    "receive buffer discarded"
                );
                if !inner.closed.load(Ordering::SeqCst) {
                    inner
                        .observer
                        .on_fault(&ChannelFault::ProtocolCorruption(err));
                }
                break;
            }
            Err(err) => {
                if !inner.closed.load(Ordering::SeqCst) {
                    error!(worker_pid = inner.worker_pid, error = %err, "channel read failed");
                    inner.observer.on_fault(&ChannelFault::ReadFailed(err));
                }
                break;
            }
        }
    }

    // Whatever stopped the reader, nothing can be answered any more.
    Channel { inner }.close();
}

fn process_payload(inner: &ChannelInner, payload: &[u8]) {
    match classify(payload) {
        InboundMessage::Response(response) => {
            let Some(pending) = inner.pending.remove(response.id) else {
                error!(
                    worker_pid = inner.worker_pid,
                    id = response.id,
                    "received response does not match any sent request"
                );
                return;
            };
            let (id, method) = (pending.id(), pending.method());
            match response.outcome {
                ResponseOutcome::Accepted(data) => {
                    debug!(worker_pid = inner.worker_pid, id, %method, "request succeeded");
                    pending.resolve(data);
                }
                ResponseOutcome::Rejected { error, reason } => {
                    warn!(worker_pid = inner.worker_pid, id, %method, %reason, "request failed");
                    pending.reject(ChannelError::RequestFailed {
                        method,
                        id,
                        error,
                        reason,
                    });
                }
                ResponseOutcome::Malformed => {
                    error!(
                        worker_pid = inner.worker_pid,
                        id,
                        %method,
                        "received response is not accepted nor rejected"
                    );
                    pending.reject(ChannelError::MalformedResponse { method, id });
                }
            }
        }
        InboundMessage::Notification(notification) => {
            if inner.owner_id.as_deref() == Some(notification.target_id.as_str()) {
                inner.observer.on_owner_notification(&notification);
            } else {
                inner.registry.dispatch(&notification);
            }
        }
        InboundMessage::Log { level, line } => {
            let pid = inner.worker_pid;
            match level {
                WorkerLogLevel::Debug => debug!(target: WORKER_LOG_TARGET, worker_pid = pid, "{line}"),
                WorkerLogLevel::Warn => warn!(target: WORKER_LOG_TARGET, worker_pid = pid, "{line}"),
                WorkerLogLevel::Error => error!(target: WORKER_LOG_TARGET, worker_pid = pid, "{line}"),
                WorkerLogLevel::Dump => info!(target: WORKER_LOG_TARGET, worker_pid = pid, "{line}"),
            }
        }
        InboundMessage::Unexpected(text) => {
            error!(
                worker_pid = inner.worker_pid,
                payload = %text,
                "received message is not a response nor a notification"
            );
        }
        InboundMessage::Invalid(text) => {
            error!(
                worker_pid = inner.worker_pid,
                payload = %text,
                "invalid data received from the worker"
            );
        }
    }
}
