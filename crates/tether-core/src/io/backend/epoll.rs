//! epoll backend for Linux.
//!
//! One kernel registration per descriptor carrying the union of the armed
//! directions; adding or dropping a direction rewrites it with `EPOLL_CTL_MOD`.
//! Edge-triggered, so every (re)arm reports the current state once.

use super::{is_stale_descriptor, timeout_millis, Interest, Multiplexer, Semantics};
use crate::io::{Direction, Event};
use rustc_hash::FxHashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::time::Duration;

const READ_FLAGS: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;
const WRITE_FLAGS: u32 = (libc::EPOLLOUT | libc::EPOLLHUP | libc::EPOLLERR) as u32;

/// epoll(7) backend
pub struct EpollBackend {
    /// The epoll instance
    epoll: OwnedFd,
    /// Buffer for epoll_wait
    events: Vec<libc::epoll_event>,
    /// Armed directions per descriptor
    interests: FxHashMap<RawFd, Interest>,
}

impl EpollBackend {
    /// Create a new epoll instance able to report `capacity` events per wait
    pub fn new(capacity: usize) -> io::Result<Self> {
        // SAFETY: plain syscall; the result is checked before use
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            // SAFETY: fd was just created and nothing else owns it
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            interests: FxHashMap::default(),
        })
    }

    fn mask(interest: Interest) -> u32 {
        let mut mask = libc::EPOLLET as u32;
        if interest.read {
            mask |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if interest.write {
            mask |= libc::EPOLLOUT as u32;
        }
        mask
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: Self::mask(interest),
            u64: fd as u64,
        };
        let event_ptr = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut event as *mut libc::epoll_event
        };

        // SAFETY: event_ptr is null for DEL or points at `event`, which outlives the call
        let result = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, event_ptr) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Multiplexer for EpollBackend {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn semantics(&self) -> Semantics {
        Semantics::EdgeTriggered
    }

    fn register(&mut self, fd: RawFd, direction: Direction) -> io::Result<()> {
        let old = self.interests.get(&fd).copied().unwrap_or_default();
        if old.contains(direction) {
            return Ok(());
        }
        let new = old.with(direction);

        if old.is_empty() {
            match self.ctl(libc::EPOLL_CTL_ADD, fd, new) {
                // A stale kernel registration survives when the fd number was
                // reused through a dup of the old description
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => self.ctl(libc::EPOLL_CTL_MOD, fd, new)?,
                result => result?,
            }
        } else {
            self.ctl(libc::EPOLL_CTL_MOD, fd, new)?;
        }

        self.interests.insert(fd, new);
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd, direction: Direction) -> io::Result<()> {
        let Some(old) = self.interests.get(&fd).copied() else {
            return Ok(());
        };
        if !old.contains(direction) {
            return Ok(());
        }
        let new = old.without(direction);

        if new.is_empty() {
            self.interests.remove(&fd);
        } else {
            self.interests.insert(fd, new);
        }

        let op = if new.is_empty() { libc::EPOLL_CTL_DEL } else { libc::EPOLL_CTL_MOD };
        match self.ctl(op, fd, new) {
            Err(e) if is_stale_descriptor(&e) => {
                tracing::debug!(fd, %direction, error = %e, "descriptor already closed");
                Ok(())
            }
            result => result,
        }
    }

    fn block_and_report(&mut self, timeout: Option<Duration>, events: &mut Vec<Event>) -> io::Result<()> {
        // SAFETY: the kernel writes at most `events.len()` entries into the buffer
        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_millis(timeout),
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            // EINTR is not an error, just no events
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for raw in &self.events[..n as usize] {
            let fd = raw.u64 as RawFd;
            let flags = raw.events;
            // Reports for a direction disarmed since the kernel queued them are dropped
            let Some(interest) = self.interests.get(&fd).copied() else {
                continue;
            };
            if interest.read && flags & READ_FLAGS != 0 {
                events.push(Event::new(fd, Direction::Read));
            }
            if interest.write && flags & WRITE_FLAGS != 0 {
                events.push(Event::new(fd, Direction::Write));
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

    #[test]
    fn test_epoll_creation() {
        let backend = EpollBackend::new(16).unwrap();
        assert_eq!(backend.name(), "epoll");
        assert_eq!(backend.armed(), 0);
    }

    #[test]
    fn test_epoll_conformance() {
        let mut backend = EpollBackend::new(16).unwrap();
        conformance::run_all(&mut backend);
    }

    #[test]
    fn test_epoll_edge_reports_once() {
        use std::io::Write;
        use std::os::unix::net::UnixStream;

        let mut backend = EpollBackend::new(16).unwrap();
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        backend.register(b.as_raw_fd(), Direction::Read).unwrap();

        a.write_all(b"edge").unwrap();
        let mut events = Vec::new();
        backend.block_and_report(Some(Duration::from_secs(1)), &mut events).unwrap();
        assert_eq!(events, vec![Event::new(b.as_raw_fd(), Direction::Read)]);

        // Data still unread, but no new edge
        events.clear();
        backend.block_and_report(Some(Duration::ZERO), &mut events).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_epoll_peer_close_is_readable() {
        use std::os::unix::net::UnixStream;

        let mut backend = EpollBackend::new(16).unwrap();
        let (a, b) = UnixStream::pair().unwrap();
        let fd = b.as_raw_fd();
        backend.register(fd, Direction::Read).unwrap();
        drop(a);

        let mut events = Vec::new();
        backend.block_and_report(Some(Duration::from_secs(1)), &mut events).unwrap();
        assert!(events.contains(&Event::new(fd, Direction::Read)));
    }
}
