//! OS polling backends
//!
//! Platform-specific implementations:
//! - Linux: epoll (edge-triggered), io_uring (completion-based, `uring` feature)
//! - macOS/BSD: kqueue (edge-triggered via `EV_CLEAR`)
//! - Everywhere: poll (level-triggered)
//!
//! The backend is chosen once when the runtime is built and stored in the
//! [`Backend`] enum.

use crate::config::BackendKind;
use crate::io::{Direction, Event};
use crate::{Error, Result};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub use epoll::EpollBackend;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub use kqueue::KqueueBackend;

mod poll;
pub use poll::PollBackend;

#[cfg(all(target_os = "linux", feature = "uring"))]
mod uring;
#[cfg(all(target_os = "linux", feature = "uring"))]
pub use uring::UringBackend;

/// What a reported event means
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Semantics {
    /// Readiness occurred since the last report
    EdgeTriggered,
    /// Readiness currently holds
    LevelTriggered,
    /// A one-shot poll operation completed
    Completion,
}

/// Common capability set of every OS polling strategy
pub trait Multiplexer {
    /// Short backend name ("epoll", "poll", ...)
    fn name(&self) -> &'static str;

    /// Event semantics of this backend
    fn semantics(&self) -> Semantics;

    /// Arm monitoring of `fd` for `direction`.
    ///
    /// The other direction of the same descriptor may already be armed.
    fn register(&mut self, fd: RawFd, direction: Direction) -> io::Result<()>;

    /// Disarm monitoring of `fd` for `direction`.
    ///
    /// Succeeds when the descriptor has already been closed or was never armed.
    fn deregister(&mut self, fd: RawFd, direction: Direction) -> io::Result<()>;

    /// Block for at most `timeout` (`None` blocks indefinitely) and append
    /// ready (fd, direction) pairs to `events`.
    ///
    /// An interrupted wait reports zero events.
    fn block_and_report(&mut self, timeout: Option<Duration>, events: &mut Vec<Event>) -> io::Result<()>;

    /// Number of armed (fd, direction) pairs
    fn armed(&self) -> usize;
}

/// The backend bound at startup
pub enum Backend {
    /// epoll(7)
    #[cfg(target_os = "linux")]
    Epoll(EpollBackend),
    /// poll(2)
    Poll(PollBackend),
    /// kqueue(2)
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    Kqueue(KqueueBackend),
    /// io_uring(7)
    #[cfg(all(target_os = "linux", feature = "uring"))]
    Uring(UringBackend),
}

macro_rules! dispatch {
    ($self:expr, $b:ident => $call:expr) => {
        match $self {
            #[cfg(target_os = "linux")]
            Backend::Epoll($b) => $call,
            Backend::Poll($b) => $call,
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Backend::Kqueue($b) => $call,
            #[cfg(all(target_os = "linux", feature = "uring"))]
            Backend::Uring($b) => $call,
        }
    };
}

impl Backend {
    /// Build the backend for `kind`; `Auto` picks the best one available.
    pub fn select(kind: BackendKind, event_capacity: usize) -> Result<Self> {
        let backend = match kind {
            BackendKind::Auto => Self::detect(event_capacity)?,
            BackendKind::Poll => Backend::Poll(PollBackend::new()),
            #[cfg(target_os = "linux")]
            BackendKind::Epoll => Backend::Epoll(EpollBackend::new(event_capacity)?),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            BackendKind::Kqueue => Backend::Kqueue(KqueueBackend::new(event_capacity)?),
            #[cfg(all(target_os = "linux", feature = "uring"))]
            BackendKind::Uring => Backend::Uring(UringBackend::new(event_capacity)?),
            #[allow(unreachable_patterns)]
            other => return Err(Error::UnsupportedBackend(other)),
        };
        tracing::debug!(backend = backend.name(), requested = %kind, "selected I/O backend");
        Ok(backend)
    }

    #[cfg(target_os = "linux")]
    fn detect(event_capacity: usize) -> Result<Self> {
        #[cfg(feature = "uring")]
        match UringBackend::new(event_capacity) {
            Ok(uring) => return Ok(Backend::Uring(uring)),
            Err(e) => tracing::debug!(error = %e, "io_uring unavailable, falling back to epoll"),
        }
        Ok(Backend::Epoll(EpollBackend::new(event_capacity)?))
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    fn detect(event_capacity: usize) -> Result<Self> {
        Ok(Backend::Kqueue(KqueueBackend::new(event_capacity)?))
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    )))]
    fn detect(_event_capacity: usize) -> Result<Self> {
        Ok(Backend::Poll(PollBackend::new()))
    }

    /// Which kind this backend is
    pub fn kind(&self) -> BackendKind {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(_) => BackendKind::Epoll,
            Backend::Poll(_) => BackendKind::Poll,
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Backend::Kqueue(_) => BackendKind::Kqueue,
            #[cfg(all(target_os = "linux", feature = "uring"))]
            Backend::Uring(_) => BackendKind::Uring,
        }
    }
}

impl Multiplexer for Backend {
    fn name(&self) -> &'static str {
        dispatch!(self, b => b.name())
    }

    fn semantics(&self) -> Semantics {
        dispatch!(self, b => b.semantics())
    }

    fn register(&mut self, fd: RawFd, direction: Direction) -> io::Result<()> {
        dispatch!(self, b => b.register(fd, direction))
    }

    fn deregister(&mut self, fd: RawFd, direction: Direction) -> io::Result<()> {
        dispatch!(self, b => b.deregister(fd, direction))
    }

    fn block_and_report(&mut self, timeout: Option<Duration>, events: &mut Vec<Event>) -> io::Result<()> {
        dispatch!(self, b => b.block_and_report(timeout, events))
    }

    fn armed(&self) -> usize {
        dispatch!(self, b => b.armed())
    }
}

/// Directions armed on one descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub fn is_empty(self) -> bool {
        !self.read && !self.write
    }

    pub fn contains(self, direction: Direction) -> bool {
        match direction {
            Direction::Read => self.read,
            Direction::Write => self.write,
        }
    }

    pub fn with(mut self, direction: Direction) -> Self {
        match direction {
            Direction::Read => self.read = true,
            Direction::Write => self.write = true,
        }
        self
    }

    pub fn without(mut self, direction: Direction) -> Self {
        match direction {
            Direction::Read => self.read = false,
            Direction::Write => self.write = false,
        }
        self
    }

    pub fn count(self) -> usize {
        self.read as usize + self.write as usize
    }
}

/// Millisecond timeout for epoll/poll, rounded up so timers never fire early.
/// `None` maps to -1 (block indefinitely).
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if Duration::from_millis(ms as u64) < d {
                ms += 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

/// Errors from disarming a descriptor that is already gone
pub(crate) fn is_stale_descriptor(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EBADF) | Some(libc::ENOENT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_millis_rounds_up() {
        assert_eq!(timeout_millis(None), -1);
        assert_eq!(timeout_millis(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_millis(Some(Duration::from_micros(1))), 1);
        assert_eq!(timeout_millis(Some(Duration::from_millis(5))), 5);
        assert_eq!(timeout_millis(Some(Duration::from_micros(5_001))), 6);
        assert_eq!(timeout_millis(Some(Duration::MAX)), libc::c_int::MAX);
    }

    #[test]
    fn test_interest_bits() {
        let interest = Interest::default().with(Direction::Read);
        assert!(interest.contains(Direction::Read));
        assert!(!interest.contains(Direction::Write));
        assert_eq!(interest.with(Direction::Write).count(), 2);
        assert!(interest.without(Direction::Read).is_empty());
    }

    #[test]
    fn test_select_poll_everywhere() {
        let backend = Backend::select(BackendKind::Poll, 64).unwrap();
        assert_eq!(backend.name(), "poll");
        assert_eq!(backend.kind(), BackendKind::Poll);
        assert_eq!(backend.semantics(), Semantics::LevelTriggered);
    }

    #[test]
    fn test_select_auto() {
        let backend = Backend::select(BackendKind::Auto, 64).unwrap();
        assert_eq!(backend.armed(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_kqueue_unsupported_on_linux() {
        assert!(matches!(
            Backend::select(BackendKind::Kqueue, 64),
            Err(Error::UnsupportedBackend(BackendKind::Kqueue))
        ));
    }
}

/// Shared tests run against every backend compiled for the host
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    fn wait(backend: &mut dyn Multiplexer, timeout: Duration) -> Vec<Event> {
        let mut events = Vec::new();
        backend.block_and_report(Some(timeout), &mut events).unwrap();
        events
    }

    pub fn readable_after_write(backend: &mut dyn Multiplexer) {
        let (mut a, b) = pair();
        backend.register(b.as_raw_fd(), Direction::Read).unwrap();
        assert!(wait(backend, Duration::ZERO).is_empty());

        a.write_all(b"x").unwrap();
        let events = wait(backend, Duration::from_secs(1));
        assert!(events.contains(&Event::new(b.as_raw_fd(), Direction::Read)));
        backend.deregister(b.as_raw_fd(), Direction::Read).unwrap();
        assert_eq!(backend.armed(), 0);
    }

    pub fn writable_immediately(backend: &mut dyn Multiplexer) {
        let (a, _b) = pair();
        backend.register(a.as_raw_fd(), Direction::Write).unwrap();
        let events = wait(backend, Duration::from_secs(1));
        assert_eq!(events, vec![Event::new(a.as_raw_fd(), Direction::Write)]);
        backend.deregister(a.as_raw_fd(), Direction::Write).unwrap();
    }

    pub fn both_directions_independent(backend: &mut dyn Multiplexer) {
        let (mut a, b) = pair();
        let fd = b.as_raw_fd();
        backend.register(fd, Direction::Read).unwrap();
        backend.register(fd, Direction::Write).unwrap();
        assert_eq!(backend.armed(), 2);

        // Only write readiness holds so far
        let events = wait(backend, Duration::from_secs(1));
        assert!(events.contains(&Event::new(fd, Direction::Write)));
        assert!(!events.contains(&Event::new(fd, Direction::Read)));

        backend.deregister(fd, Direction::Write).unwrap();
        assert_eq!(backend.armed(), 1);

        a.write_all(b"y").unwrap();
        let events = wait(backend, Duration::from_secs(1));
        assert_eq!(events, vec![Event::new(fd, Direction::Read)]);
        backend.deregister(fd, Direction::Read).unwrap();
        assert_eq!(backend.armed(), 0);
    }

    pub fn deregister_after_close(backend: &mut dyn Multiplexer) {
        let (_a, b) = pair();
        let fd = b.as_raw_fd();
        backend.register(fd, Direction::Read).unwrap();
        drop(b);
        backend.deregister(fd, Direction::Read).unwrap();
        assert_eq!(backend.armed(), 0);
        // Never armed
        backend.deregister(fd, Direction::Write).unwrap();
    }

    pub fn timeout_elapses(backend: &mut dyn Multiplexer) {
        let started = std::time::Instant::now();
        let events = wait(backend, Duration::from_millis(20));
        assert!(events.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    pub fn run_all(backend: &mut dyn Multiplexer) {
        readable_after_write(backend);
        writable_immediately(backend);
        both_directions_independent(backend);
        deregister_after_close(backend);
        timeout_elapses(backend);
    }
}
