//! io_uring backend for Linux (completion-based).
//!
//! Each armed (descriptor, direction) is a one-shot `POLL_ADD` submission keyed by
//! its user_data. A completion consumes the registration; deregistering an armed
//! pair forgets its key first and then submits `POLL_REMOVE`, so a completion that
//! races with the removal is ignored. Timeouts are `TIMEOUT` submissions with a
//! tagged key.

use super::{Multiplexer, Semantics};
use crate::io::{Direction, Event};
use io_uring::{opcode, squeue, types, IoUring};
use rustc_hash::FxHashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

const TIMEOUT_TAG: u64 = 1 << 63;
const CANCEL_KEY: u64 = u64::MAX;

/// io_uring(7) backend
pub struct UringBackend {
    ring: IoUring,
    /// user_data -> armed pair
    in_flight: FxHashMap<u64, (RawFd, Direction)>,
    /// armed pair -> user_data
    keys: FxHashMap<(RawFd, Direction), u64>,
    next_key: u64,
    /// Key of the timeout submitted for the current wait
    pending_timeout: Option<u64>,
    timespec: types::Timespec,
}

impl UringBackend {
    /// Create a ring sized for `capacity` in-flight operations
    pub fn new(capacity: usize) -> io::Result<Self> {
        let entries = capacity.clamp(8, 4096).next_power_of_two() as u32;
        Ok(Self {
            ring: IoUring::new(entries)?,
            in_flight: FxHashMap::default(),
            keys: FxHashMap::default(),
            next_key: 1,
            pending_timeout: None,
            timespec: types::Timespec::new(),
        })
    }

    fn push(&mut self, entry: squeue::Entry) -> io::Result<()> {
        for _ in 0..2 {
            // SAFETY: entries point at no caller memory except `self.timespec`, which
            // lives as long as the ring
            if unsafe { self.ring.submission().push(&entry) }.is_ok() {
                return Ok(());
            }
            // Submission queue full
            self.ring.submit()?;
        }
        Err(io::Error::other("io_uring submission queue is full"))
    }

    fn take_key(&mut self) -> u64 {
        let key = self.next_key;
        self.next_key = (self.next_key + 1) & !TIMEOUT_TAG;
        key
    }

    /// Drain the completion queue; returns true if the pending timeout fired
    fn harvest(&mut self, events: &mut Vec<Event>) -> bool {
        let completed: Vec<u64> = self.ring.completion().map(|cqe| cqe.user_data()).collect();
        let mut timed_out = false;

        for key in completed {
            if key == CANCEL_KEY {
                continue;
            }
            if key & TIMEOUT_TAG != 0 {
                if self.pending_timeout == Some(key) {
                    self.pending_timeout = None;
                    timed_out = true;
                }
                continue;
            }
            // Keys removed by deregister are stale
            if let Some((fd, direction)) = self.in_flight.remove(&key) {
                self.keys.remove(&(fd, direction));
                events.push(Event::new(fd, direction));
            }
        }

        timed_out
    }
}

impl Multiplexer for UringBackend {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn semantics(&self) -> Semantics {
        Semantics::Completion
    }

    fn register(&mut self, fd: RawFd, direction: Direction) -> io::Result<()> {
        if self.keys.contains_key(&(fd, direction)) {
            return Ok(());
        }
        let mask = match direction {
            Direction::Read => libc::POLLIN,
            Direction::Write => libc::POLLOUT,
        };
        let key = self.take_key();
        let entry = opcode::PollAdd::new(types::Fd(fd), mask as u32).build().user_data(key);
        self.push(entry)?;
        self.ring.submit()?;

        self.in_flight.insert(key, (fd, direction));
        self.keys.insert((fd, direction), key);
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd, direction: Direction) -> io::Result<()> {
        let Some(key) = self.keys.remove(&(fd, direction)) else {
            return Ok(());
        };
        self.in_flight.remove(&key);

        let entry = opcode::PollRemove::new(key).build().user_data(CANCEL_KEY);
        self.push(entry)?;
        self.ring.submit()?;
        Ok(())
    }

    fn block_and_report(&mut self, timeout: Option<Duration>, events: &mut Vec<Event>) -> io::Result<()> {
        let reported = events.len();

        match timeout {
            Some(d) if d.is_zero() => {
                self.ring.submit()?;
                self.harvest(events);
                return Ok(());
            }
            Some(d) => {
                // The kernel rejects seconds that overflow a signed 64-bit value
                let secs = d.as_secs().min(i64::MAX as u64);
                self.timespec = types::Timespec::new().sec(secs).nsec(d.subsec_nanos());
                let key = TIMEOUT_TAG | self.take_key();
                let entry = opcode::Timeout::new(&self.timespec as *const types::Timespec)
                    .build()
                    .user_data(key);
                self.push(entry)?;
                self.pending_timeout = Some(key);
            }
            None => {}
        }

        loop {
            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => break,
                Err(e) => return Err(e),
            }
            let timed_out = self.harvest(events);
            // Stale completions (removed polls, cancelled timeouts) keep us waiting
            if timed_out || events.len() > reported {
                break;
            }
        }

        if let Some(key) = self.pending_timeout.take() {
            let entry = opcode::TimeoutRemove::new(key).build().user_data(CANCEL_KEY);
            self.push(entry)?;
            self.ring.submit()?;
        }

        Ok(())
    }

    fn armed(&self) -> usize {
        self.keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::backend::conformance;

    #[test]
    fn test_uring_conformance() {
        // Kernels without io_uring (or sandboxes that forbid it) skip
        let Ok(mut backend) = UringBackend::new(64) else {
            return;
        };
        conformance::run_all(&mut backend);
    }

    #[test]
    fn test_uring_registration_is_one_shot() {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixStream;

        let Ok(mut backend) = UringBackend::new(64) else {
            return;
        };
        let (mut a, b) = UnixStream::pair().unwrap();
        backend.register(b.as_raw_fd(), Direction::Read).unwrap();
        assert_eq!(backend.armed(), 1);

        a.write_all(b"once").unwrap();
        let mut events = Vec::new();
        backend.block_and_report(Some(Duration::from_secs(1)), &mut events).unwrap();
        assert_eq!(events, vec![Event::new(b.as_raw_fd(), Direction::Read)]);
        assert_eq!(backend.armed(), 0);
    }
}
