//! kqueue backend for macOS and BSD.
//!
//! One kernel filter per (descriptor, direction); `EV_CLEAR` makes both
//! edge-triggered.

use super::{is_stale_descriptor, Interest, Multiplexer, Semantics};
use crate::io::{Direction, Event};
use rustc_hash::FxHashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::time::Duration;

/// kqueue(2) backend
pub struct KqueueBackend {
    /// The kqueue instance
    kq: OwnedFd,
    /// Buffer for kevent results
    events: Vec<libc::kevent>,
    /// Armed directions per descriptor
    interests: FxHashMap<RawFd, Interest>,
}

impl KqueueBackend {
    /// Create a new kqueue able to report `capacity` events per wait
    pub fn new(capacity: usize) -> io::Result<Self> {
        // SAFETY: plain syscall; the result is checked before use
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: kq was just created and nothing else owns it
        let kq = unsafe { OwnedFd::from_raw_fd(kq) };

        // SAFETY: fcntl on a descriptor we own (sets close-on-exec)
        unsafe {
            let flags = libc::fcntl(kq.as_raw_fd(), libc::F_GETFD);
            libc::fcntl(kq.as_raw_fd(), libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }

        Ok(Self {
            kq,
            events: (0..capacity.max(1)).map(|_| empty_kevent()).collect(),
            interests: FxHashMap::default(),
        })
    }

    fn apply(&self, fd: RawFd, direction: Direction, add: bool) -> io::Result<()> {
        let mut change = empty_kevent();
        change.ident = fd as _;
        change.filter = match direction {
            Direction::Read => libc::EVFILT_READ,
            Direction::Write => libc::EVFILT_WRITE,
        };
        change.flags = if add { libc::EV_ADD | libc::EV_CLEAR } else { libc::EV_DELETE };

        // SAFETY: one change read from `change`, no event buffer
        let result = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                &change,
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn empty_kevent() -> libc::kevent {
    // SAFETY: all-zero is a valid kevent (null udata)
    unsafe { std::mem::zeroed() }
}

impl Multiplexer for KqueueBackend {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn semantics(&self) -> Semantics {
        Semantics::EdgeTriggered
    }

    fn register(&mut self, fd: RawFd, direction: Direction) -> io::Result<()> {
        let old = self.interests.get(&fd).copied().unwrap_or_default();
        if old.contains(direction) {
            return Ok(());
        }
        self.apply(fd, direction, true)?;
        self.interests.insert(fd, old.with(direction));
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

        match self.apply(fd, direction, false) {
            Err(e) if is_stale_descriptor(&e) => {
                tracing::debug!(fd, %direction, error = %e, "descriptor already closed");
                Ok(())
            }
            result => result,
        }
    }

    fn block_and_report(&mut self, timeout: Option<Duration>, events: &mut Vec<Event>) -> io::Result<()> {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: d.subsec_nanos() as _,
        });
        let ts_ptr = ts.as_ref().map_or(std::ptr::null(), |t| t as *const libc::timespec);

        // SAFETY: the kernel writes at most `events.len()` entries; ts_ptr is null or points at `ts`
        let n = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                std::ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.len() as _,
                ts_ptr,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for raw in &self.events[..n as usize] {
            let fd = raw.ident as RawFd;
            let direction = if raw.filter == libc::EVFILT_READ {
                Direction::Read
            } else if raw.filter == libc::EVFILT_WRITE {
                Direction::Write
            } else {
                continue;
            };
            if self.interests.get(&fd).is_some_and(|i| i.contains(direction)) {
                events.push(Event::new(fd, direction));
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
    fn test_kqueue_creation() {
        let backend = KqueueBackend::new(16).unwrap();
        assert_eq!(backend.name(), "kqueue");
    }

    #[test]
    fn test_kqueue_conformance() {
        let mut backend = KqueueBackend::new(16).unwrap();
        conformance::run_all(&mut backend);
    }
}
