use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use bytes::{Buf, Bytes};

/// Create a one-directional in-memory byte pipe.
///
/// Every `write` call on the [`MemoryWriter`] is delivered to the
/// [`MemoryReader`] as one chunk, in order. The reader sees EOF once every
/// writer clone is dropped or [`MemoryWriter::close`] has been called.
pub fn memory_pipe() -> (MemoryWriter, MemoryReader) {
    let (tx, rx) = mpsc::channel();
    let closed = Arc::new(AtomicBool::new(false));
    (
        MemoryWriter {
            tx,
            closed: Arc::clone(&closed),
        },
        MemoryReader {
            rx,
            current: Bytes::new(),
            closed,
        },
    )
}

/// Writing half of an in-memory pipe. Cheap to clone.
#[derive(Clone)]
pub struct MemoryWriter {
    tx: Sender<Bytes>,
    closed: Arc<AtomicBool>,
}

impl MemoryWriter {
    /// Send one chunk without going through `Write`.
    pub fn send(&self, chunk: impl Into<Bytes>) -> std::io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        }
        self.tx
            .send(chunk.into())
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))
    }

    /// Close the pipe for every clone. Wakes a reader blocked in `read`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Empty chunk only wakes the reader; it never reaches callers.
            let _ = self.tx.send(Bytes::new());
        }
    }

    /// Whether the pipe has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.send(Bytes::copy_from_slice(buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for MemoryWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryWriter")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Reading half of an in-memory pipe.
pub struct MemoryReader {
    rx: Receiver<Bytes>,
    current: Bytes,
    closed: Arc<AtomicBool>,
}

impl MemoryReader {
    /// Take the next chunk exactly as it was written, without blocking.
    ///
    /// Returns `None` when nothing is queued or the pipe is closed.
    pub fn try_next_chunk(&mut self) -> Option<Bytes> {
        if !self.current.is_empty() {
            return Some(std::mem::take(&mut self.current));
        }
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            match self.rx.try_recv() {
                Ok(chunk) if chunk.is_empty() => continue,
                Ok(chunk) => return Some(chunk),
                Err(_) => return None,
            }
        }
    }
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.current.is_empty() {
            if self.closed.load(Ordering::Acquire) {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(chunk) => self.current = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = self.current.len().min(buf.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

impl std::fmt::Debug for MemoryReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryReader")
            .field("buffered", &self.current.len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}
