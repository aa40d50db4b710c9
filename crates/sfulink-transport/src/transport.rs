use std::io::{Read, Write};

use tracing::debug;

use crate::error::Result;
use crate::memory::MemoryWriter;
use crate::stream::IpcStream;

/// Tears a transport down from any thread.
///
/// Implementations must unblock a reader parked on the transport's read half
/// and must tolerate being called more than once.
pub trait Shutdown: Send + Sync {
    fn shutdown(&self) -> Result<()>;
}

impl Shutdown for IpcStream {
    fn shutdown(&self) -> Result<()> {
        IpcStream::shutdown(self)
    }
}

impl Shutdown for MemoryWriter {
    fn shutdown(&self) -> Result<()> {
        self.close();
        Ok(())
    }
}

/// A split-duplex byte transport to one worker.
///
/// The read half carries worker-to-host bytes, the write half host-to-worker
/// bytes. Each half is moved onto its own thread by the channel layer, so
/// both must be `Send`. The shutdown handles stay with the owner.
pub struct Transport {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    shutdown: Vec<Box<dyn Shutdown>>,
}

impl Transport {
    /// Assemble a transport from arbitrary halves.
    pub fn new(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
        shutdown: Vec<Box<dyn Shutdown>>,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            shutdown,
        }
    }

    /// Build a transport over one duplex stream.
    pub fn from_stream(stream: IpcStream) -> Result<Self> {
        let reader = stream.try_clone()?;
        let handle = stream.try_clone()?;
        Ok(Self::new(reader, stream, vec![Box::new(handle)]))
    }

    /// Build a transport over two streams: `producer` carries host-to-worker
    /// bytes and `consumer` carries worker-to-host bytes.
    pub fn from_streams(producer: IpcStream, consumer: IpcStream) -> Result<Self> {
        let producer_handle = producer.try_clone()?;
        let consumer_handle = consumer.try_clone()?;
        Ok(Self::new(
            consumer,
            producer,
            vec![Box::new(producer_handle), Box::new(consumer_handle)],
        ))
    }

    /// Split into read half, write half and a shutdown handle.
    pub fn into_parts(
        self,
    ) -> (
        Box<dyn Read + Send>,
        Box<dyn Write + Send>,
        TransportShutdown,
    ) {
        (
            self.reader,
            self.writer,
            TransportShutdown {
                handles: self.shutdown,
            },
        )
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("shutdown_handles", &self.shutdown.len())
            .finish()
    }
}

/// Shutdown handles of a transport whose halves have been moved away.
pub struct TransportShutdown {
    handles: Vec<Box<dyn Shutdown>>,
}

impl TransportShutdown {
    /// Shut every handle down, continuing past failures.
    ///
    /// Returns the errors encountered; an empty vector means a clean teardown.
    pub fn shutdown_all(&self) -> Vec<crate::TransportError> {
        let mut errors = Vec::new();
        for (idx, handle) in self.handles.iter().enumerate() {
            if let Err(err) = handle.shutdown() {
                debug!(handle = idx, error = %err, "transport shutdown failed");
                errors.push(err);
            }
        }
        errors
    }
}

impl std::fmt::Debug for TransportShutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportShutdown")
            .field("handles", &self.handles.len())
            .finish()
    }
}
