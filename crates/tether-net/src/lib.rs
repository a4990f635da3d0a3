//! Tether networking
//!
//! Unix domain sockets driven by the tether runtime. Every blocking operation is
//! a non-blocking attempt followed by a readiness wait on `EAGAIN`:
//! - [`UnixStream`]: connect, read, write
//! - [`UnixListener`]: bind, accept
//!
//! Sockets call [`tether_core::notify_closing`] before their descriptor is
//! released, so tasks still waiting on them resume with `DescriptorClosed`
//! instead of hanging on a reused descriptor number.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod listener;
mod stream;
mod sys;

pub use listener::UnixListener;
pub use stream::UnixStream;
pub use tether_core::{Error, Result};

use std::io;
use std::os::unix::io::RawFd;
use tether_core::Direction;

/// Run `op` until it stops failing with `WouldBlock`, parking on `fd` in
/// between
pub(crate) async fn retry<T>(fd: RawFd, direction: Direction, mut op: impl FnMut() -> io::Result<T>) -> Result<T> {
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => match direction {
                Direction::Read => tether_core::wait_readable(fd).await?,
                Direction::Write => tether_core::wait_writable(fd).await?,
            },
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Wake waiters on a descriptor about to be closed. Outside a runtime nobody
/// can be waiting.
pub(crate) fn release(fd: RawFd) -> Result<()> {
    match tether_core::notify_closing(fd) {
        Ok(()) | Err(Error::NoRuntime) => Ok(()),
        Err(e) => Err(e),
    }
}
