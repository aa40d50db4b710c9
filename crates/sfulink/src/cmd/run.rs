use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sfulink_worker::{BackendKind, WorkerManager};
use tracing::{error, info};

use crate::cmd::{load_config, parse_duration, RunArgs};
use crate::exit::{worker_error, CliError, CliResult, FAILURE, INTERNAL, SUCCESS, USAGE};
use crate::output::{print_dump, print_workers, OutputFormat};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub fn run(args: RunArgs, format: OutputFormat) -> CliResult<i32> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(workers) = args.workers {
        config.startup.number_of_workers = workers;
    }
    if let Some(path) = args.worker_path {
        config.startup.worker_path = path;
    }
    if config.startup.backend == BackendKind::Native {
        return Err(CliError::new(
            USAGE,
            "the native backend needs a program that links the worker library",
        ));
    }
    let startup_timeout = parse_duration(&args.startup_timeout)?;

    let manager = WorkerManager::new(config).map_err(|err| worker_error("invalid config", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let started = manager
        .start()
        .map_err(|err| worker_error("worker spawn failed", err))?;
    // A worker that dies during startup is pruned from the manager at once,
    // so wait on the spawned handles rather than the live set.
    let deadline = Instant::now() + startup_timeout;
    for worker in &started {
        let left = deadline.saturating_duration_since(Instant::now());
        if let Err(err) = worker.wait_running(left) {
            manager.close_all();
            return Err(worker_error("worker startup failed", err));
        }
    }
    info!(workers = started.len(), "workers running");
    print_workers(&started, format);

    if args.dump {
        for worker in &started {
            match worker.dump() {
                Ok(dump) => print_dump(worker, &dump, format),
                Err(err) => {
                    manager.close_all();
                    return Err(worker_error("worker dump failed", err));
                }
            }
        }
    }

    if args.once {
        manager.close_all();
        return Ok(SUCCESS);
    }

    while running.load(Ordering::SeqCst) {
        // Workers that died have already dropped out of the manager.
        if manager.is_empty() {
            error!("all workers exited");
            return Err(CliError::new(FAILURE, "all workers exited"));
        }
        thread::sleep(POLL_INTERVAL);
    }

    info!("shutting down workers");
    manager.close_all();
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
