use crate::{release, retry, sys, Result};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net;
use std::path::Path;
use tether_core::Direction;

/// Connected Unix stream socket
#[derive(Debug)]
pub struct UnixStream {
    inner: net::UnixStream,
    /// Waiters were already told about the close
    released: bool,
}

impl UnixStream {
    /// Connect to the socket bound at `path`.
    ///
    /// The socket is closed again if the connect fails or is cancelled.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let addr = sys::SocketAddr::from_path(path)?;
        let socket = Self::from_nonblocking(sys::stream_socket()?);

        if !sys::start_connect(&socket.inner, &addr)? {
            tether_core::wait_writable(socket.as_raw_fd()).await?;
            if let Some(err) = socket.inner.take_error()? {
                return Err(err.into());
            }
        }

        tracing::debug!(fd = socket.as_raw_fd(), path = %path.display(), "connected");
        Ok(socket)
    }

    /// Pair of connected sockets
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = net::UnixStream::pair()?;
        Ok((Self::from_std(a)?, Self::from_std(b)?))
    }

    /// Adopt a std socket, switching it to non-blocking mode
    pub fn from_std(stream: net::UnixStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::from_nonblocking(stream))
    }

    fn from_nonblocking(inner: net::UnixStream) -> Self {
        Self { inner, released: false }
    }

    /// Read into `buf`, waiting for data if none is buffered. `Ok(0)` is end of
    /// stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        retry(self.as_raw_fd(), Direction::Read, || (&self.inner).read(buf)).await
    }

    /// Write part of `buf`, waiting for buffer space if there is none
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        retry(self.as_raw_fd(), Direction::Write, || (&self.inner).write(buf)).await
    }

    /// Write all of `buf`
    pub async fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Shut down the write half; the peer reads end of stream
    pub fn shutdown_write(&self) -> Result<()> {
        self.inner.shutdown(std::net::Shutdown::Write)?;
        Ok(())
    }

    /// Wake tasks waiting on this socket, then close it
    pub fn close(mut self) -> Result<()> {
        self.released = true;
        release(self.as_raw_fd())
    }
}

impl AsRawFd for UnixStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl Drop for UnixStream {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = release(self.as_raw_fd()) {
            tracing::warn!(fd = self.as_raw_fd(), error = %e, "failed to notify waiters of closing socket");
        }
    }
}
