/// Errors that can occur during frame encoding, decoding and reassembly.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Buffering more bytes would exceed the receive buffer capacity.
    /// The buffered bytes have been discarded.
    #[error("receive buffer overflow ({buffered} buffered + {incoming} incoming, capacity {capacity})")]
    BufferOverflow {
        buffered: usize,
        incoming: usize,
        capacity: usize,
    },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed.
    #[error("connection closed")]
    ConnectionClosed,
}

impl FrameError {
    /// Whether the error leaves the byte stream without a trustworthy frame
    /// boundary. No further frame can be decoded from such a stream.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            FrameError::BufferOverflow { .. } | FrameError::PayloadTooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
