use std::fmt;
use std::io;

use sfulink_channel::ChannelError;
use sfulink_transport::TransportError;
use sfulink_worker::WorkerError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound => USAGE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Io(source) => io_error(context, source),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn channel_error(context: &str, err: ChannelError) -> CliError {
    match err {
        ChannelError::Io(source) => io_error(context, source),
        ChannelError::RequestTimeout { .. } => CliError::new(TIMEOUT, format!("{context}: {err}")),
        ChannelError::PayloadTooLarge { .. }
        | ChannelError::MalformedResponse { .. }
        | ChannelError::Json(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        ChannelError::Write { .. } => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        ChannelError::ChannelClosed
        | ChannelError::RequestFailed { .. }
        | ChannelError::DuplicateRequestId { .. } => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
    }
}

pub fn worker_error(context: &str, err: WorkerError) -> CliError {
    match err {
        WorkerError::Channel(err) => channel_error(context, err),
        WorkerError::Transport(err) => transport_error(context, err),
        WorkerError::Io(source) => io_error(context, source),
        WorkerError::StartupTimeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        WorkerError::InvalidSettings(_) | WorkerError::Config(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        WorkerError::ProtocolCorruption(_) => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sfulink_channel::Method;

    use super::*;

    #[test]
    fn worker_errors_map_to_exit_codes() {
        let timeout = worker_error("start", WorkerError::StartupTimeout(Duration::from_secs(1)));
        assert_eq!(timeout.code, TIMEOUT);

        let invalid = worker_error("start", WorkerError::InvalidSettings("exit 42".into()));
        assert_eq!(invalid.code, DATA_INVALID);

        let request = worker_error(
            "dump",
            WorkerError::Channel(ChannelError::RequestTimeout {
                method: Method::WorkerDump,
                id: 3,
                timeout: Duration::from_secs(15),
            }),
        );
        assert_eq!(request.code, TIMEOUT);
        assert!(request.message.starts_with("dump: "));

        let missing = worker_error(
            "config",
            WorkerError::Io(io::Error::from(io::ErrorKind::NotFound)),
        );
        assert_eq!(missing.code, USAGE);
    }
}
