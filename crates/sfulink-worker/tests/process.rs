#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use sfulink_channel::ChannelConfig;
use sfulink_worker::{
    LogLevel, ManagerConfig, Worker, WorkerError, WorkerManager, WorkerSettings, WorkerStartup,
    WorkerState,
};
use tempfile::TempDir;

const STARTUP: Duration = Duration::from_secs(10);

/// Shell helpers shared by the fake workers: `send` writes one frame to fd 4,
/// `recv` reads one frame from fd 3 into `$payload`.
const PRELUDE: &str = r#"#!/bin/sh
send() {
    n=${#1}
    printf "$(printf '\\%03o\\%03o\\000\\000' $((n % 256)) $((n / 256)))" >&4
    printf '%s' "$1" >&4
}
recv() {
    set -- $(dd bs=1 count=4 <&3 2>/dev/null | od -An -tu1)
    len=$(( $1 + $2 * 256 + $3 * 65536 + $4 * 16777216 ))
    payload=$(dd bs=1 count=$len <&3 2>/dev/null)
}
running() {
    send "{\"targetId\":\"$$\",\"event\":\"running\"}"
}
"#;

fn write_worker(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, format!("{PRELUDE}{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn startup(path: &Path) -> WorkerStartup {
    WorkerStartup {
        worker_path: path.to_path_buf(),
        mediasoup_version: "3.14.6".into(),
        ..WorkerStartup::default()
    }
}

/// Spawn, retrying while another test thread still holds a freshly written
/// script open (ETXTBSY).
fn spawn(path: &Path, settings: &WorkerSettings) -> Worker {
    let mut attempts = 0;
    loop {
        match Worker::spawn(&startup(path), settings, ChannelConfig::default()) {
            Ok(worker) => return worker,
            Err(WorkerError::Spawn(msg)) if msg.contains("busy") && attempts < 20 => {
                attempts += 1;
                thread::sleep(Duration::from_millis(20));
            }
            Err(err) => panic!("spawn failed: {err}"),
        }
    }
}

fn wait_for_state(worker: &Worker, state: WorkerState) {
    let start = Instant::now();
    while worker.state() != state {
        assert!(start.elapsed() < STARTUP, "worker stuck in {}", worker.state());
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn worker_reports_running_and_closes() {
    let dir = TempDir::new().unwrap();
    let path = write_worker(&dir, "idle-worker", "running\nexec sleep 30");

    let worker = spawn(&path, &WorkerSettings::default());
    assert_eq!(worker.state(), WorkerState::Starting);
    worker.wait_running(STARTUP).unwrap();
    assert!(worker.pid() > 0);

    worker.close();
    assert_eq!(worker.state(), WorkerState::Closed);
    assert!(worker.failure().is_none());
    assert!(worker.channel().is_closed());
}

#[test]
fn worker_answers_dump_over_inherited_descriptors() {
    let dir = TempDir::new().unwrap();
    let path = write_worker(
        &dir,
        "dump-worker",
        r#"running
recv
id=$(printf '%s' "$payload" | sed 's/.*"id":\([0-9]*\).*/\1/')
send "{\"id\":$id,\"accepted\":true,\"data\":{\"pid\":$$}}"
exec sleep 30"#,
    );

    let worker = spawn(&path, &WorkerSettings::default());
    worker.wait_running(STARTUP).unwrap();
    let dump = worker.dump().unwrap();
    assert_eq!(dump["pid"], worker.pid());
    worker.close();
}

#[test]
fn arguments_and_version_reach_the_worker() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("args.txt");
    let body = format!(
        "printf '%s|%s' \"$MEDIASOUP_VERSION\" \"$*\" > '{}'\nrunning\nexec sleep 30",
        out.display()
    );
    let path = write_worker(&dir, "args-worker", &body);
    let settings = WorkerSettings {
        log_level: Some(LogLevel::Error),
        log_tags: Vec::new(),
        rtc_min_port: Some(20000),
        rtc_max_port: Some(20010),
        dtls_certificate_file: Some("/tmp/cert.pem".into()),
        dtls_private_key_file: None,
    };

    let worker = spawn(&path, &settings);
    worker.wait_running(STARTUP).unwrap();
    let recorded = fs::read_to_string(&out).unwrap();
    assert_eq!(
        recorded,
        "3.14.6|--logLevel=error --rtcMinPort=20000 --rtcMaxPort=20010 --dtlsCertificateFile=/tmp/cert.pem"
    );
    worker.close();
}

#[test]
fn exit_42_during_startup_is_invalid_settings() {
    let dir = TempDir::new().unwrap();
    let path = write_worker(&dir, "picky-worker", "exit 42");

    let worker = spawn(&path, &WorkerSettings::default());
    let err = worker.wait_running(STARTUP).unwrap_err();
    assert!(matches!(err, WorkerError::InvalidSettings(_)), "{err}");
    wait_for_state(&worker, WorkerState::Closed);
}

#[test]
fn other_exit_during_startup_is_spawn_failure() {
    let dir = TempDir::new().unwrap();
    let path = write_worker(&dir, "broken-worker", "echo 'cannot open device' >&2\nexit 3");

    let worker = spawn(&path, &WorkerSettings::default());
    let err = worker.wait_running(STARTUP).unwrap_err();
    assert!(matches!(err, WorkerError::Spawn(_)), "{err}");
}

#[test]
fn exit_while_running_is_unexpected() {
    let dir = TempDir::new().unwrap();
    let path = write_worker(&dir, "flaky-worker", "running\nrecv\nexit 1");

    let worker = spawn(&path, &WorkerSettings::default());
    worker.wait_running(STARTUP).unwrap();

    // The request is read and never answered.
    let err = worker.dump().unwrap_err();
    assert!(matches!(err, WorkerError::Channel(ref e) if e.is_closed()), "{err}");

    wait_for_state(&worker, WorkerState::Closed);
    assert!(matches!(
        worker.failure(),
        Some(WorkerError::UnexpectedExit { code: Some(1), .. })
    ));
}

#[test]
fn missing_executable_fails_to_spawn() {
    let startup = startup(Path::new("/nonexistent/sfulink-test-worker"));
    let err = Worker::spawn(&startup, &WorkerSettings::default(), ChannelConfig::default())
        .unwrap_err();
    assert!(matches!(err, WorkerError::Spawn(_)), "{err}");
}

#[test]
fn inverted_port_range_is_rejected_before_spawning() {
    let settings = WorkerSettings {
        rtc_min_port: Some(30000),
        rtc_max_port: Some(20000),
        ..WorkerSettings::default()
    };
    let err = Worker::spawn(
        &startup(Path::new("/bin/true")),
        &settings,
        ChannelConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, WorkerError::Config(_)), "{err}");
}

#[test]
fn manager_finds_process_workers_by_pid() {
    let dir = TempDir::new().unwrap();
    let path = write_worker(&dir, "pool-worker", "running\nexec sleep 30");

    let mut config = ManagerConfig::default();
    config.startup = startup(&path);
    config.startup.number_of_workers = 2;
    let manager = WorkerManager::new(config).unwrap();

    let workers = manager.start().unwrap();
    manager.wait_running(STARTUP).unwrap();
    for worker in &workers {
        assert_eq!(manager.get(worker.pid()).unwrap().id(), worker.id());
    }
    assert!(manager.get(0).is_none());

    manager.close_all();
    assert!(workers.iter().all(Worker::is_closed));
}
