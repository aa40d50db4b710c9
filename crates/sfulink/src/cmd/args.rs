use sfulink_worker::BackendKind;

use crate::cmd::{load_config, ArgsArgs};
use crate::exit::{worker_error, CliResult, SUCCESS};
use crate::output::{print_args, OutputFormat};

pub fn run(args: ArgsArgs, format: OutputFormat) -> CliResult<i32> {
    let config = load_config(args.config.as_deref())?;
    let settings = &config.worker_settings;
    settings
        .validate()
        .map_err(|err| worker_error("invalid worker settings", err))?;

    let program = match config.startup.backend {
        BackendKind::Process => config.startup.worker_path.display().to_string(),
        // In-process workers get an empty program name slot.
        BackendKind::Native => String::new(),
    };
    print_args(
        &program,
        &settings.to_args(),
        &config.startup.mediasoup_version,
        format,
    );
    Ok(SUCCESS)
}
