use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Subcommand};
use sfulink_worker::ManagerConfig;

use crate::exit::{worker_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod args;
pub mod run;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start workers and keep them running until Ctrl-C.
    Run(RunArgs),
    /// Print the command line a worker would be started with.
    Args(ArgsArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Run(args) => run::run(args, format),
        Command::Args(args) => args::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// JSON config file (startup, workerSettings, channel).
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Number of workers; 0 starts one per CPU.
    #[arg(long, short = 'n')]
    pub workers: Option<usize>,
    /// Worker executable, overriding the config.
    #[arg(long, value_name = "PATH", env = "SFULINK_WORKER_PATH")]
    pub worker_path: Option<PathBuf>,
    /// How long to wait for every worker to report running (e.g. 10s, 500ms).
    #[arg(long, default_value = "10s")]
    pub startup_timeout: String,
    /// Print each worker's `worker.dump` once it is running.
    #[arg(long)]
    pub dump: bool,
    /// Close the workers right after startup instead of waiting for Ctrl-C.
    #[arg(long)]
    pub once: bool,
}

#[derive(Args, Debug)]
pub struct ArgsArgs {
    /// JSON config file (startup, workerSettings, channel).
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn load_config(path: Option<&Path>) -> CliResult<ManagerConfig> {
    match path {
        Some(path) => ManagerConfig::from_json_file(path)
            .map_err(|err| worker_error(&format!("config {}", path.display()), err)),
        None => Ok(ManagerConfig::default()),
    }
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
