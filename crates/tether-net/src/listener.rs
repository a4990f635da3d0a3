use crate::{release, retry, Result, UnixStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net;
use std::path::Path;
use tether_core::Direction;

/// Unix socket listening for connections
#[derive(Debug)]
pub struct UnixListener {
    inner: net::UnixListener,
}

impl UnixListener {
    /// Bind to `path`, which must not exist yet
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let inner = net::UnixListener::bind(path.as_ref())?;
        inner.set_nonblocking(true)?;
        tracing::debug!(fd = inner.as_raw_fd(), path = %path.as_ref().display(), "listening");
        Ok(Self { inner })
    }

    /// Wait for the next connection
    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _) = retry(self.as_raw_fd(), Direction::Read, || self.inner.accept()).await?;
        tracing::trace!(listener = self.as_raw_fd(), fd = stream.as_raw_fd(), "accepted");
        UnixStream::from_std(stream)
    }
}

impl AsRawFd for UnixListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl Drop for UnixListener {
    fn drop(&mut self) {
        if let Err(e) = release(self.as_raw_fd()) {
            tracing::warn!(fd = self.as_raw_fd(), error = %e, "failed to notify waiters of closing listener");
        }
    }
}
