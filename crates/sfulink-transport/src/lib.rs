//! Byte-stream transports between the host and a media worker.
//!
//! A worker is reached through a split-duplex byte stream:
//! - Unix socket pairs, whose far ends are handed to a spawned worker process
//! - In-memory pipes, bridged to an in-process native worker
//!
//! This is the lowest layer of sfulink. The channel layer only sees the
//! [`Transport`] type provided here.

pub mod error;
pub mod memory;
pub mod stream;
pub mod transport;

pub use error::{Result, TransportError};
pub use memory::{memory_pipe, MemoryReader, MemoryWriter};
#[cfg(unix)]
pub use stream::{remap_fds, socket_pair, FD_SCRATCH_BASE};
pub use stream::IpcStream;
pub use transport::{Shutdown, Transport, TransportShutdown};
