//! poll(2) backend, level-triggered, available on every Unix.
//!
//! Registration is pure bookkeeping; the pollfd array is rebuilt for each wait.

use super::{timeout_millis, Interest, Multiplexer, Semantics};
use crate::io::{Direction, Event};
use rustc_hash::FxHashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// poll(2) backend
#[derive(Default)]
pub struct PollBackend {
    /// Armed directions per descriptor
    interests: FxHashMap<RawFd, Interest>,
    /// Reused pollfd buffer
    fds: Vec<libc::pollfd>,
}

impl PollBackend {
    /// Create an empty poll set
    pub fn new() -> Self {
        Self::default()
    }
}

impl Multiplexer for PollBackend {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn semantics(&self) -> Semantics {
        Semantics::LevelTriggered
    }

    fn register(&mut self, fd: RawFd, direction: Direction) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let interest = self.interests.entry(fd).or_default();
        *interest = interest.with(direction);
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd, direction: Direction) -> io::Result<()> {
        if let Some(interest) = self.interests.get_mut(&fd) {
            *interest = interest.without(direction);
            if interest.is_empty() {
                self.interests.remove(&fd);
            }
        }
        Ok(())
    }

    fn block_and_report(&mut self, timeout: Option<Duration>, events: &mut Vec<Event>) -> io::Result<()> {
        self.fds.clear();
        for (&fd, interest) in &self.interests {
            let mut wanted: libc::c_short = 0;
            if interest.read {
                wanted |= libc::POLLIN;
            }
            if interest.write {
                wanted |= libc::POLLOUT;
            }
            self.fds.push(libc::pollfd { fd, events: wanted, revents: 0 });
        }

        // SAFETY: fds is a live buffer of exactly `fds.len()` pollfds
        let n = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_millis(timeout),
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        if n == 0 {
            return Ok(());
        }

        let failed = libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
        for pfd in &self.fds {
            if pfd.revents == 0 {
                continue;
            }
            if pfd.events & libc::POLLIN != 0 && pfd.revents & (libc::POLLIN | failed) != 0 {
                events.push(Event::new(pfd.fd, Direction::Read));
            }
            if pfd.events & libc::POLLOUT != 0 && pfd.revents & (libc::POLLOUT | failed) != 0 {
                events.push(Event::new(pfd.fd, Direction::Write));
            }
        }

        Ok(())
    }

    fn armed(&self) -> usize {
        self.interests.values().map(|i| i.count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::backend::conformance;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_poll_conformance() {
        let mut backend = PollBackend::new();
        conformance::run_all(&mut backend);
    }

    #[test]
    fn test_poll_level_reports_repeatedly() {
        let mut backend = PollBackend::new();
        let (mut a, b) = UnixStream::pair().unwrap();
        backend.register(b.as_raw_fd(), Direction::Read).unwrap();
        a.write_all(b"level").unwrap();

        for _ in 0..3 {
            let mut events = Vec::new();
            backend.block_and_report(Some(Duration::ZERO), &mut events).unwrap();
            assert_eq!(events, vec![Event::new(b.as_raw_fd(), Direction::Read)]);
        }
    }
}
