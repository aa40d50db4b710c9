//! Control-plane runtime for SFU media workers.
//!
//! sfulink supervises native media workers and talks to each one over a
//! private, length-framed byte stream: requests with adaptive timeouts,
//! notifications routed to registered entities, and worker lifecycle.
//!
//! # Crate Structure
//!
//! - [`transport`] - Byte-stream transports (socket pairs, in-memory pipes)
//! - [`frame`] - Length-prefixed framing and receive reassembly
//! - [`channel`] - Request/response correlation and notification dispatch
//! - [`worker`] - Worker lifecycle, backends and supervision (behind `worker` feature)

/// Re-export transport types.
pub mod transport {
    pub use sfulink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use sfulink_frame::*;
}

/// Re-export channel types.
pub mod channel {
    pub use sfulink_channel::*;
}

/// Re-export worker types (requires `worker` feature).
#[cfg(feature = "worker")]
pub mod worker {
    pub use sfulink_worker::*;
}
