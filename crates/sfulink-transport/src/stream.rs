use std::io::{Read, Write};
use std::net::Shutdown as NetShutdown;
#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};

use crate::error::{Result, TransportError};

/// A connected local stream: implements Read + Write.
///
/// On Unix this wraps one end of a Unix domain socket pair. The other end is
/// typically inherited by a worker process as one of its channel descriptors.
pub struct IpcStream {
    inner: IpcStreamInner,
}

enum IpcStreamInner {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

/// Create a connected pair of streams.
///
/// Bytes written to one end are readable from the other. Both descriptors are
/// created close-on-exec; a backend that passes one end to a child process is
/// responsible for re-exposing it at the expected descriptor number.
#[cfg(unix)]
pub fn socket_pair() -> Result<(IpcStream, IpcStream)> {
    let (left, right) = std::os::unix::net::UnixStream::pair().map_err(TransportError::Pair)?;
    Ok((IpcStream::from_unix(left), IpcStream::from_unix(right)))
}

/// Scratch descriptors used by [`remap_fds`] start here.
#[cfg(unix)]
pub const FD_SCRATCH_BASE: RawFd = 10;

/// Re-expose each `(source, target)` descriptor at `target` without
/// close-on-exec, so it survives into an exec'd child.
///
/// Sources are first duplicated above [`FD_SCRATCH_BASE`], then moved onto
/// their targets, so a source sitting on another pair's target is not lost.
/// Only async-signal-safe calls are made and nothing is allocated, which
/// makes this usable from a `pre_exec` hook.
///
/// # Safety
///
/// Every target must be below [`FD_SCRATCH_BASE`], and whatever is open at a
/// target is closed. Call it only in a freshly forked child, where no other
/// code owns those descriptors.
#[cfg(unix)]
pub unsafe fn remap_fds<const N: usize>(pairs: [(RawFd, RawFd); N]) -> std::io::Result<()> {
    let mut scratch: [RawFd; N] = [-1; N];
    for (slot, (source, _)) in scratch.iter_mut().zip(pairs.iter()) {
        // SAFETY: F_DUPFD only reads `source` and allocates a new descriptor.
        let fd = unsafe { libc::fcntl(*source, libc::F_DUPFD, FD_SCRATCH_BASE) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        *slot = fd;
    }
    for (fd, (_, target)) in scratch.iter().zip(pairs.iter()) {
        // SAFETY: The caller owns every target descriptor.
        if unsafe { libc::dup2(*fd, *target) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    for fd in scratch {
        // SAFETY: Scratch descriptors were opened above and are not shared.
        unsafe { libc::close(fd) };
    }
    Ok(())
}

impl Read for IpcStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for IpcStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.flush(),
        }
    }
}

impl IpcStream {
    /// Create an IpcStream from a Unix domain socket stream.
    #[cfg(unix)]
    pub fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: IpcStreamInner::Unix(stream),
        }
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => {
                let cloned = stream.try_clone()?;
                Ok(Self::from_unix(cloned))
            }
        }
    }

    /// Shut down both directions of the stream.
    ///
    /// Unblocks any thread parked in `read` on a clone of this stream.
    /// Shutting down an already disconnected stream is not an error.
    pub fn shutdown(&self) -> Result<()> {
        let res = match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.shutdown(NetShutdown::Both),
        };
        match res {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(TransportError::Io(err)),
        }
    }
}

#[cfg(unix)]
impl AsRawFd for IpcStream {
    fn as_raw_fd(&self) -> RawFd {
        match &self.inner {
            IpcStreamInner::Unix(stream) => stream.as_raw_fd(),
        }
    }
}

impl std::fmt::Debug for IpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => f
                .debug_struct("IpcStream")
                .field("type", &"unix")
                .field("fd", &stream.as_raw_fd())
                .finish(),
        }
    }
}
