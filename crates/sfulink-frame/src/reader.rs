use std::io::{ErrorKind, Read};

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::codec::{decode_frame, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 64 * 1024;
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Bounded reassembly buffer for inbound frames.
///
/// Bytes arrive in arbitrary chunks; complete frames are handed out in wire
/// order and any trailing partial frame (including a split length prefix) is
/// carried over to the next push. The buffer is owned by exactly one reader.
#[derive(Debug)]
pub struct RecvBuffer {
    buf: BytesMut,
    capacity: usize,
    max_message_len: usize,
}

impl RecvBuffer {
    /// Create a buffer using the limits of `config`.
    pub fn new(config: &FrameConfig) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY.min(config.recv_buffer_capacity)),
            capacity: config.recv_buffer_capacity,
            max_message_len: config.max_message_len,
        }
    }

    /// Append `chunk` and deliver every complete payload to `on_frame`.
    ///
    /// If the chunk does not fit in the remaining capacity, or a length prefix
    /// announces a frame larger than the message ceiling, everything buffered
    /// is discarded and the error is returned. Frames decoded before a bad
    /// prefix have already been delivered.
    pub fn push(&mut self, chunk: &[u8], mut on_frame: impl FnMut(Bytes)) -> Result<()> {
        if self.buf.len() + chunk.len() > self.capacity {
            let err = FrameError::BufferOverflow {
                buffered: self.buf.len(),
                incoming: chunk.len(),
                capacity: self.capacity,
            };
            self.discard();
            return Err(err);
        }

        self.buf.extend_from_slice(chunk);

        loop {
            match decode_frame(&mut self.buf, self.max_message_len) {
                Ok(Some(payload)) => on_frame(payload),
                Ok(None) => break,
                Err(err) => {
                    self.discard();
                    return Err(err);
                }
            }
        }

        if self.buf.is_empty() {
            // Rewind to the start of the allocation.
            self.buf.clear();
        } else {
            trace!(carried = self.buf.len(), "partial frame carried over");
        }
        Ok(())
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop every buffered byte.
    pub fn discard(&mut self) {
        self.buf.clear();
    }
}

/// Reads frames from any `Read` stream through a [`RecvBuffer`].
pub struct FrameReader<T> {
    inner: T,
    recv: RecvBuffer,
    chunk: Box<[u8]>,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            recv: RecvBuffer::new(&config),
            chunk: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
        }
    }

    /// Perform one blocking read and deliver every frame it completes.
    ///
    /// Returns the number of frames delivered, which may be zero when the read
    /// only extended a partial frame. Returns `Err(FrameError::ConnectionClosed)`
    /// at EOF.
    pub fn read_frames(&mut self, on_frame: impl FnMut(Bytes)) -> Result<usize> {
        let read = loop {
            match self.inner.read(&mut self.chunk) {
                Ok(n) => break n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        };

        if read == 0 {
            return Err(FrameError::ConnectionClosed);
        }

        let mut delivered = 0usize;
        let mut on_frame = on_frame;
        self.recv.push(&self.chunk[..read], |payload| {
            delivered += 1;
            on_frame(payload);
        })?;
        Ok(delivered)
    }

    /// Borrow the reassembly buffer.
    pub fn recv_buffer(&self) -> &RecvBuffer {
        &self.recv
    }
}
