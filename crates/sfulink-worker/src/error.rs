use std::time::Duration;

/// Errors that can occur while starting, driving or stopping a worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The worker could not be launched, or exited before it was running.
    #[error("worker spawn failed: {0}")]
    Spawn(String),

    /// The worker exited while it was running.
    #[error("worker exited unexpectedly (code: {code:?}, signal: {signal:?})")]
    UnexpectedExit {
        code: Option<i32>,
        signal: Option<i32>,
    },

    /// The worker refused its startup settings.
    #[error("worker rejected its settings: {0}")]
    InvalidSettings(String),

    /// The channel to the worker lost frame synchronization.
    #[error("worker channel corrupted: {0}")]
    ProtocolCorruption(String),

    /// Channel-level error.
    #[error("channel error: {0}")]
    Channel(#[from] sfulink_channel::ChannelError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] sfulink_transport::TransportError),

    /// The worker is closing or closed.
    #[error("worker closed")]
    Closed,

    /// The worker did not report running in time.
    #[error("worker not running after {0:?}")]
    StartupTimeout(Duration),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded or is inconsistent.
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
