use std::time::Duration;

use crate::method::Method;

/// Errors returned to the caller of a channel request.
///
/// Request-scoped errors are delivered only to the caller that issued the
/// request; they never affect other in-flight requests.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel was closed before or while the request was in flight.
    #[error("channel closed")]
    ChannelClosed,

    /// No response arrived within the adaptive deadline.
    #[error("request timed out [method:{method}, id:{id}] after {timeout:?}")]
    RequestTimeout {
        method: Method,
        id: u32,
        timeout: Duration,
    },

    /// The serialized request does not fit the size ceiling. Nothing was written.
    #[error("channel request too big ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The request id is still held by an outstanding request. Nothing was
    /// written.
    #[error("request id already in flight [method:{method}, id:{id}]")]
    DuplicateRequestId { method: Method, id: u32 },

    /// The worker rejected the request.
    #[error("request failed [method:{method}, id:{id}]: {error}: {reason}")]
    RequestFailed {
        method: Method,
        id: u32,
        error: String,
        reason: String,
    },

    /// The worker answered with neither an acceptance nor an error.
    #[error("received response is not accepted nor rejected [method:{method}, id:{id}]")]
    MalformedResponse { method: Method, id: u32 },

    /// Writing the request frame to the transport failed.
    #[error("failed to write request [method:{method}, id:{id}]: {source}")]
    Write {
        method: Method,
        id: u32,
        source: sfulink_frame::FrameError,
    },

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failed to start the channel's I/O threads.
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Whether the error was caused by the channel going away rather than by
    /// the request itself.
    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelError::ChannelClosed)
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
