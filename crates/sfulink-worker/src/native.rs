//! In-process worker backend.
//!
//! The native worker library exposes a single blocking entry point that
//! receives channel read/write callbacks instead of file descriptors. This
//! module bridges those callbacks onto in-memory pipes so the host side is an
//! ordinary [`Transport`] and the channel runs the same framing path as for a
//! child process. Every message crossing the boundary is one complete
//! length-prefixed frame.

use std::ffi::{c_char, c_int, c_void, CString};
use std::panic::AssertUnwindSafe;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use sfulink_channel::{Channel, ChannelConfig, Method, RoutingContext};
use sfulink_transport::{memory_pipe, MemoryReader, MemoryWriter, Transport};
use tracing::{debug, warn};

use crate::error::{Result, WorkerError};
use crate::settings::{WorkerSettings, WorkerStartup};
use crate::worker::{Backend, ExitReport};

/// Releases a message handed out by [`ChannelReadFn`].
pub type ChannelReadFreeFn =
    Option<unsafe extern "C" fn(message: *mut u8, message_len: u32, message_ctx: usize)>;

/// Called by the worker to fetch the next host-to-worker frame.
///
/// Returns `None` when nothing is queued. Otherwise `message`/`message_len`
/// hold one frame that stays valid until the returned free function is called.
pub type ChannelReadFn = unsafe extern "C" fn(
    message: *mut *mut u8,
    message_len: *mut u32,
    message_ctx: *mut usize,
    handle: *const c_void,
    ctx: *mut c_void,
) -> ChannelReadFreeFn;

/// Called by the worker to hand one worker-to-host frame to the host.
/// The bytes are copied before the call returns.
pub type ChannelWriteFn =
    unsafe extern "C" fn(message: *const u8, message_len: u32, ctx: *mut c_void);

/// Signature of the native worker entry point.
///
/// Blocks until the worker stops and returns its exit code. The descriptor
/// arguments are passed as `0` since the callbacks carry all channel traffic.
pub type NativeWorkerRun = unsafe extern "C" fn(
    argc: c_int,
    argv: *const *const c_char,
    version: *const c_char,
    consumer_channel_fd: c_int,
    producer_channel_fd: c_int,
    channel_read: ChannelReadFn,
    channel_read_ctx: *mut c_void,
    channel_write: ChannelWriteFn,
    channel_write_ctx: *mut c_void,
) -> c_int;

const EXIT_WAIT: Duration = Duration::from_secs(5);

fn ffi_boundary<T>(on_panic: T, f: impl FnOnce() -> T) -> T {
    std::panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or(on_panic)
}

/// State shared between the host and the native callbacks.
struct NativeBridge {
    inbound: Mutex<MemoryReader>,
    outbound: MemoryWriter,
    close_requested: AtomicBool,
    close_frame: Bytes,
}

impl NativeBridge {
    fn next_frame(&self) -> Option<Bytes> {
        if self.close_requested.swap(false, Ordering::AcqRel) {
            return Some(self.close_frame.clone());
        }
        let mut inbound = self.inbound.lock().ok()?;
        inbound.try_next_chunk()
    }
}

unsafe extern "C" fn channel_read(
    message: *mut *mut u8,
    message_len: *mut u32,
    message_ctx: *mut usize,
    _handle: *const c_void,
    ctx: *mut c_void,
) -> ChannelReadFreeFn {
    ffi_boundary(None, || {
        if ctx.is_null() || message.is_null() || message_len.is_null() {
            return None;
        }
        // SAFETY: `ctx` is the bridge pointer passed to the entry point; the
        // running thread holds an `Arc` to it until the entry point returns.
        let bridge = unsafe { &*(ctx as *const NativeBridge) };
        let frame = bridge.next_frame()?;
        let len = u32::try_from(frame.len()).ok()?;

        let data = Box::into_raw(frame.to_vec().into_boxed_slice()) as *mut u8;
        // SAFETY: Out pointers were checked for null above.
        unsafe {
            *message = data;
            *message_len = len;
            if !message_ctx.is_null() {
                *message_ctx = 0;
            }
        }
        Some(free_message as unsafe extern "C" fn(*mut u8, u32, usize))
    })
}

unsafe extern "C" fn free_message(message: *mut u8, message_len: u32, _message_ctx: usize) {
    ffi_boundary((), || {
        if message.is_null() {
            return;
        }
        let slice = ptr::slice_from_raw_parts_mut(message, message_len as usize);
        // SAFETY: `message` was allocated as a `Box<[u8]>` of this length in `channel_read`.
        unsafe {
            drop(Box::from_raw(slice));
        }
    });
}

unsafe extern "C" fn channel_write(message: *const u8, message_len: u32, ctx: *mut c_void) {
    ffi_boundary((), || {
        if ctx.is_null() || message.is_null() || message_len == 0 {
            return;
        }
        // SAFETY: See `channel_read`.
        let bridge = unsafe { &*(ctx as *const NativeBridge) };
        // SAFETY: The worker guarantees `message_len` readable bytes at `message`.
        let bytes = unsafe { std::slice::from_raw_parts(message, message_len as usize) };
        if bridge.outbound.send(Bytes::copy_from_slice(bytes)).is_err() {
            debug!("dropping worker frame, host side closed");
        }
    });
}

/// A native worker prepared to run: its host transport plus what the run
/// thread needs.
pub(crate) struct PreparedNative {
    pub(crate) transport: Transport,
    bridge: Arc<NativeBridge>,
    argv: Vec<CString>,
    version: CString,
}

/// Build the host transport and the callback bridge for a native worker.
pub(crate) fn prepare(
    startup: &WorkerStartup,
    settings: &WorkerSettings,
    channel: &ChannelConfig,
) -> Result<PreparedNative> {
    let mut argv = Vec::with_capacity(1 + settings.log_tags.len() + 6);
    // argv[0] is the program name slot, unused in-process.
    argv.push(CString::default());
    for arg in settings.to_args() {
        argv.push(
            CString::new(arg)
                .map_err(|err| WorkerError::Config(format!("worker argument: {err}")))?,
        );
    }
    let version = CString::new(startup.mediasoup_version.clone())
        .map_err(|err| WorkerError::Config(format!("mediasoupVersion: {err}")))?;

    // Injected when the host asks to stop and the worker is blocked on reads.
    let close_frame =
        channel.notification_frame(Method::WorkerClose, RoutingContext::Worker, None)?;

    let (to_worker, from_host) = memory_pipe();
    let (to_host, from_worker) = memory_pipe();

    let bridge = Arc::new(NativeBridge {
        inbound: Mutex::new(from_host),
        outbound: to_host.clone(),
        close_requested: AtomicBool::new(false),
        close_frame,
    });
    let transport = Transport::new(
        from_worker,
        to_worker.clone(),
        vec![Box::new(to_worker), Box::new(to_host)],
    );

    Ok(PreparedNative {
        transport,
        bridge,
        argv,
        version,
    })
}

impl PreparedNative {
    /// Split off the backend handle; [`NativeRunner::start`] runs the entry point.
    pub(crate) fn into_parts(self) -> (Transport, NativeBackend, NativeRunner) {
        let (done_tx, done_rx) = mpsc::channel();
        let backend = NativeBackend {
            bridge: Arc::clone(&self.bridge),
            exited: Arc::new(AtomicBool::new(false)),
            done: Mutex::new(done_rx),
        };
        let runner = NativeRunner {
            bridge: self.bridge,
            argv: self.argv,
            version: self.version,
            exited: Arc::clone(&backend.exited),
            done: done_tx,
        };
        (self.transport, backend, runner)
    }
}

/// Owns everything the run thread needs.
pub(crate) struct NativeRunner {
    bridge: Arc<NativeBridge>,
    argv: Vec<CString>,
    version: CString,
    exited: Arc<AtomicBool>,
    done: mpsc::Sender<()>,
}

impl NativeRunner {
    /// Run `entry` on a dedicated thread; `on_exit` receives its result.
    pub(crate) fn start(
        self,
        entry: NativeWorkerRun,
        pid: u32,
        on_exit: impl FnOnce(ExitReport) + Send + 'static,
    ) -> Result<()> {
        thread::Builder::new()
            .name(format!("sfulink-native-{pid}"))
            .spawn(move || {
                let NativeRunner {
                    bridge,
                    argv,
                    version,
                    exited,
                    done,
                } = self;

                let mut pointers: Vec<*const c_char> =
                    argv.iter().map(|arg| arg.as_ptr()).collect();
                pointers.push(ptr::null());
                let argc = c_int::try_from(argv.len()).unwrap_or(c_int::MAX);
                let ctx = Arc::as_ptr(&bridge) as *mut c_void;

                debug!(worker_pid = pid, argc, "running native worker");
                // SAFETY: `pointers` is a null-terminated array of valid C
                // strings and `ctx` outlives the call; both are owned by this
                // thread until the entry point returns.
                let code = unsafe {
                    entry(
                        argc,
                        pointers.as_ptr(),
                        version.as_ptr(),
                        0,
                        0,
                        channel_read,
                        ctx,
                        channel_write,
                        ctx,
                    )
                };
                debug!(worker_pid = pid, code, "native worker returned");

                // The host reader sees EOF once the worker is gone.
                bridge.outbound.close();
                exited.store(true, Ordering::SeqCst);
                on_exit(ExitReport {
                    code: Some(code),
                    signal: None,
                });
                let _ = done.send(());
            })?;
        Ok(())
    }
}

/// Host handle to a running native worker.
pub(crate) struct NativeBackend {
    bridge: Arc<NativeBridge>,
    exited: Arc<AtomicBool>,
    done: Mutex<Receiver<()>>,
}

impl Backend for NativeBackend {
    fn shutdown(&self, channel: &Channel) {
        if self.exited.load(Ordering::SeqCst) {
            return;
        }
        if channel
            .notify(Method::WorkerClose, RoutingContext::Worker, None)
            .is_err()
        {
            self.terminate();
        }
        if !self.wait_exit(EXIT_WAIT) {
            warn!("native worker did not stop after worker.close");
        }
    }

    fn terminate(&self) {
        if !self.exited.load(Ordering::SeqCst) {
            self.bridge.close_requested.store(true, Ordering::Release);
        }
    }

    fn kill(&self) {
        // A thread cannot be killed; the run thread is left detached.
        warn!("native worker thread left running");
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
