use std::ffi::{c_char, c_int, c_void, CStr};
use std::ptr;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use sfulink_channel::ChannelConfig;
use sfulink_worker::{
    BackendKind, ChannelReadFn, ChannelWriteFn, LogLevel, LogTag, ManagerConfig, Worker,
    WorkerError, WorkerManager, WorkerSettings, WorkerStartup, WorkerState,
};

const STARTUP: Duration = Duration::from_secs(5);

static RECORDED_ARGS: Mutex<Option<(Vec<String>, String)>> = Mutex::new(None);

struct FakeChannel {
    read: ChannelReadFn,
    read_ctx: *mut c_void,
    write: ChannelWriteFn,
    write_ctx: *mut c_void,
}

impl FakeChannel {
    fn send(&self, message: Value) {
        let payload = serde_json::to_vec(&message).unwrap();
        let mut frame = (payload.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(&payload);
        self.send_raw(&frame);
    }

    fn send_raw(&self, bytes: &[u8]) {
        unsafe { (self.write)(bytes.as_ptr(), bytes.len() as u32, self.write_ctx) };
    }

    fn announce_running(&self) {
        self.send(json!({ "targetId": std::process::id().to_string(), "event": "running" }));
    }

    /// Next message from the host, polling like the worker's event loop.
    fn recv(&self) -> Value {
        loop {
            let mut message = ptr::null_mut();
            let mut len = 0u32;
            let mut ctx = 0usize;
            let free = unsafe { (self.read)(&mut message, &mut len, &mut ctx, ptr::null(), self.read_ctx) };
            match free {
                Some(free) => {
                    let frame = unsafe { std::slice::from_raw_parts(message, len as usize) }.to_vec();
                    unsafe { free(message, len, ctx) };
                    let size = u32::from_le_bytes(frame[..4].try_into().unwrap()) as usize;
                    assert_eq!(size, frame.len() - 4, "one frame per read");
                    return serde_json::from_slice(&frame[4..]).unwrap();
                }
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    /// Answer requests until the host sends `worker.close`.
    fn serve(&self) -> c_int {
        loop {
            let message = self.recv();
            if message["event"] == "worker.close" {
                return 0;
            }
            let id = message["id"].clone();
            let reply = match message["method"].as_str() {
                Some("worker.dump") => json!({
                    "id": id, "accepted": true,
                    "data": { "pid": std::process::id(), "routerIds": [] }
                }),
                Some("worker.getResourceUsage") => json!({
                    "id": id, "accepted": true,
                    "data": { "ru_maxrss": 2048, "ru_nvcsw": 7 }
                }),
                Some("worker.updateSettings") => {
                    if message["data"]["logLevel"] == "debug" {
                        json!({ "id": id, "accepted": true })
                    } else {
                        json!({ "id": id, "error": "TypeError", "reason": "invalid logLevel" })
                    }
                }
                _ => json!({ "id": id, "error": "Error", "reason": "unknown method" }),
            };
            self.send(reply);
        }
    }
}

unsafe extern "C" fn serving_worker(
    _argc: c_int,
    _argv: *const *const c_char,
    _version: *const c_char,
    _consumer_fd: c_int,
    _producer_fd: c_int,
    read: ChannelReadFn,
    read_ctx: *mut c_void,
    write: ChannelWriteFn,
    write_ctx: *mut c_void,
) -> c_int {
    let channel = FakeChannel {
        read,
        read_ctx,
        write,
        write_ctx,
    };
    channel.announce_running();
    channel.serve()
}

unsafe extern "C" fn recording_worker(
    argc: c_int,
    argv: *const *const c_char,
    version: *const c_char,
    consumer_fd: c_int,
    producer_fd: c_int,
    read: ChannelReadFn,
    read_ctx: *mut c_void,
    write: ChannelWriteFn,
    write_ctx: *mut c_void,
) -> c_int {
    let args = (0..argc as usize)
        .map(|i| unsafe { CStr::from_ptr(*argv.add(i)) }.to_string_lossy().into_owned())
        .collect();
    assert!(unsafe { *argv.add(argc as usize) }.is_null());
    let version = unsafe { CStr::from_ptr(version) }.to_string_lossy().into_owned();
    *RECORDED_ARGS.lock().unwrap() = Some((args, version));
    unsafe {
        serving_worker(
            argc, argv, ptr::null(), consumer_fd, producer_fd, read, read_ctx, write, write_ctx,
        )
    }
}

unsafe extern "C" fn rejecting_worker(
    _argc: c_int,
    _argv: *const *const c_char,
    _version: *const c_char,
    _consumer_fd: c_int,
    _producer_fd: c_int,
    _read: ChannelReadFn,
    _read_ctx: *mut c_void,
    _write: ChannelWriteFn,
    _write_ctx: *mut c_void,
) -> c_int {
    42
}

unsafe extern "C" fn crashing_worker(
    _argc: c_int,
    _argv: *const *const c_char,
    _version: *const c_char,
    _consumer_fd: c_int,
    _producer_fd: c_int,
    read: ChannelReadFn,
    read_ctx: *mut c_void,
    write: ChannelWriteFn,
    write_ctx: *mut c_void,
) -> c_int {
    let channel = FakeChannel {
        read,
        read_ctx,
        write,
        write_ctx,
    };
    channel.announce_running();
    // Die on the first request without answering it.
    channel.recv();
    1
}

unsafe extern "C" fn flooding_worker(
    _argc: c_int,
    _argv: *const *const c_char,
    _version: *const c_char,
    _consumer_fd: c_int,
    _producer_fd: c_int,
    read: ChannelReadFn,
    read_ctx: *mut c_void,
    write: ChannelWriteFn,
    write_ctx: *mut c_void,
) -> c_int {
    let channel = FakeChannel {
        read,
        read_ctx,
        write,
        write_ctx,
    };
    channel.announce_running();
    channel.recv();
    // Announce a 200 byte frame and push more than the host buffers.
    let mut flood = 200u32.to_le_bytes().to_vec();
    flood.extend_from_slice(&[b'x'; 120]);
    channel.send_raw(&flood);
    while channel.recv()["event"] != "worker.close" {}
    0
}

unsafe extern "C" fn failing_worker(
    _argc: c_int,
    _argv: *const *const c_char,
    _version: *const c_char,
    _consumer_fd: c_int,
    _producer_fd: c_int,
    _read: ChannelReadFn,
    _read_ctx: *mut c_void,
    _write: ChannelWriteFn,
    _write_ctx: *mut c_void,
) -> c_int {
    7
}

fn spawn(entry: sfulink_worker::NativeWorkerRun) -> Worker {
    let startup = WorkerStartup {
        backend: BackendKind::Native,
        ..WorkerStartup::default()
    };
    Worker::spawn_native(entry, &startup, &WorkerSettings::default(), ChannelConfig::default())
        .unwrap()
}

fn wait_for_state(worker: &Worker, state: WorkerState) {
    let start = Instant::now();
    while worker.state() != state {
        assert!(start.elapsed() < STARTUP, "worker stuck in {}", worker.state());
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn native_worker_runs_and_answers() {
    let worker = spawn(serving_worker);
    worker.wait_running(STARTUP).unwrap();
    assert_eq!(worker.state(), WorkerState::Running);
    assert_eq!(worker.pid(), std::process::id());
    assert_eq!(worker.backend_kind(), BackendKind::Native);

    let dump = worker.dump().unwrap();
    assert_eq!(dump["pid"], std::process::id());

    let usage = worker.resource_usage().unwrap();
    assert_eq!(usage.ru_maxrss, 2048);
    assert_eq!(usage.ru_nvcsw, 7);
    assert_eq!(usage.ru_utime, 0);

    worker
        .update_settings(Some(LogLevel::Debug), Some(&[LogTag::Rtp]))
        .unwrap();
    let err = worker.update_settings(Some(LogLevel::Error), None).unwrap_err();
    assert!(err.to_string().contains("invalid logLevel"), "{err}");

    worker.close();
    assert_eq!(worker.state(), WorkerState::Closed);
    assert!(worker.failure().is_none());
}

#[test]
fn close_is_idempotent_and_fails_later_requests() {
    let worker = spawn(serving_worker);
    worker.wait_running(STARTUP).unwrap();

    let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
    let sink = std::sync::Arc::clone(&seen);
    worker.on_state_change(move |_, from, to| sink.lock().unwrap().push((from, to)));

    worker.close();
    worker.close();

    assert!(matches!(worker.dump(), Err(WorkerError::Closed)));
    assert!(worker.channel().is_closed());
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (WorkerState::Running, WorkerState::Closing),
            (WorkerState::Closing, WorkerState::Closed),
        ]
    );
}

#[test]
fn settings_are_rendered_into_argv() {
    let startup = WorkerStartup {
        backend: BackendKind::Native,
        mediasoup_version: "3.14.0".into(),
        ..WorkerStartup::default()
    };
    let settings = WorkerSettings {
        log_level: Some(LogLevel::Debug),
        log_tags: vec![LogTag::Ice, LogTag::Dtls],
        rtc_min_port: Some(40000),
        rtc_max_port: Some(40100),
        dtls_certificate_file: None,
        dtls_private_key_file: None,
    };
    let worker =
        Worker::spawn_native(recording_worker, &startup, &settings, ChannelConfig::default())
            .unwrap();
    worker.wait_running(STARTUP).unwrap();

    let (args, version) = RECORDED_ARGS.lock().unwrap().clone().unwrap();
    assert_eq!(
        args,
        [
            "",
            "--logLevel=debug",
            "--logTag=ice",
            "--logTag=dtls",
            "--rtcMinPort=40000",
            "--rtcMaxPort=40100"
        ]
    );
    assert_eq!(version, "3.14.0");
    worker.close();
}

#[test]
fn exit_code_42_means_invalid_settings() {
    let worker = spawn(rejecting_worker);
    let err = worker.wait_running(STARTUP).unwrap_err();
    assert!(matches!(err, WorkerError::InvalidSettings(_)), "{err}");
    wait_for_state(&worker, WorkerState::Closed);
    assert!(worker.channel().is_closed());
}

#[test]
fn crash_after_running_is_unexpected_exit() {
    let worker = spawn(crashing_worker);
    worker.wait_running(STARTUP).unwrap();

    let err = worker.dump().unwrap_err();
    assert!(matches!(err, WorkerError::Channel(ref e) if e.is_closed()), "{err}");

    wait_for_state(&worker, WorkerState::Closed);
    assert!(matches!(
        worker.failure(),
        Some(WorkerError::UnexpectedExit { code: Some(1), signal: None })
    ));
    worker.close();
    assert_eq!(worker.state(), WorkerState::Closed);
}

#[test]
fn receive_buffer_overflow_errors_the_worker() {
    let startup = WorkerStartup {
        backend: BackendKind::Native,
        ..WorkerStartup::default()
    };
    let channel = ChannelConfig {
        recv_buffer_capacity: 64,
        ..ChannelConfig::default()
    };
    let worker =
        Worker::spawn_native(flooding_worker, &startup, &WorkerSettings::default(), channel)
            .unwrap();
    worker.wait_running(STARTUP).unwrap();

    let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
    let sink = std::sync::Arc::clone(&seen);
    worker.on_state_change(move |_, from, to| sink.lock().unwrap().push((from, to)));

    let err = worker.dump().unwrap_err();
    assert!(matches!(err, WorkerError::Channel(ref e) if e.is_closed()), "{err}");

    wait_for_state(&worker, WorkerState::Closed);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (WorkerState::Running, WorkerState::Errored),
            (WorkerState::Errored, WorkerState::Closed),
        ]
    );
    match worker.failure() {
        Some(WorkerError::ProtocolCorruption(reason)) => assert_eq!(
            reason,
            "protocol corruption: receive buffer overflow \
             (0 buffered + 124 incoming, capacity 64)"
        ),
        other => panic!("expected protocol corruption, got {other:?}"),
    }
    assert!(worker.channel().is_closed());
}

#[test]
fn early_native_exit_is_a_spawn_failure() {
    let worker = spawn(failing_worker);
    let err = worker.wait_running(STARTUP).unwrap_err();
    match err {
        WorkerError::Spawn(reason) => assert!(reason.contains("code: Some(7)"), "{reason}"),
        other => panic!("expected spawn failure, got {other}"),
    }
    wait_for_state(&worker, WorkerState::Closed);
    assert!(matches!(worker.failure(), Some(WorkerError::Spawn(_))));
}

#[test]
fn manager_round_robin_and_pruning() {
    let mut config = ManagerConfig::default();
    config.startup.backend = BackendKind::Native;
    config.startup.number_of_workers = 3;

    let manager = WorkerManager::new(config)
        .unwrap()
        .with_native_entry(serving_worker);
    let started = manager.start().unwrap();
    assert_eq!(started.len(), 3);
    manager.wait_running(STARTUP).unwrap();

    let picks: Vec<u64> = (0..6).map(|_| manager.next_worker().unwrap().id()).collect();
    assert_eq!(picks[0..3], picks[3..6]);
    let mut distinct = picks[0..3].to_vec();
    distinct.sort_unstable();
    distinct.dedup();
    assert_eq!(distinct.len(), 3);

    started[1].close();
    assert_eq!(manager.len(), 2);
    assert!(manager.workers().iter().all(|w| w.id() != started[1].id()));
    assert_eq!(manager.prune(), 0);

    manager.close_all();
    assert!(manager.is_empty());
    assert!(manager.next_worker().is_none());
    assert!(started.iter().all(Worker::is_closed));
}

#[test]
fn native_backend_without_entry_is_a_config_error() {
    let mut config = ManagerConfig::default();
    config.startup.backend = BackendKind::Native;
    config.startup.number_of_workers = 1;
    let manager = WorkerManager::new(config).unwrap();
    assert!(matches!(manager.start(), Err(WorkerError::Config(_))));
    assert!(manager.is_empty());
}
