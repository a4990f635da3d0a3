//! I/O readiness
//!
//! Tasks park on a descriptor becoming readable or writable with
//! [`wait_readable`] / [`wait_writable`]. The run loop asks the active
//! [`backend::Backend`] which descriptors are ready and wakes the single waiter
//! recorded in the [`registry::WaiterRegistry`] for each (descriptor, direction).
//!
//! [`notify_closing`] must be called before a descriptor that may have waiters is
//! closed; the waiters resume with [`Error::DescriptorClosed`](crate::Error).

pub mod backend;
pub mod registry;

use crate::runtime;
use crate::scheduler::park::{ParkRequest, Parked};
use crate::Result;
use std::fmt;
use std::os::unix::io::RawFd;

/// Readiness direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    /// Descriptor has data to read (or EOF / error)
    Read,
    /// Descriptor can accept writes (or error)
    Write,
}

impl Direction {
    /// Both directions, read first
    pub const ALL: [Direction; 2] = [Direction::Read, Direction::Write];
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

/// A readiness report from a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Descriptor
    pub fd: RawFd,
    /// Which direction became ready
    pub direction: Direction,
}

impl Event {
    /// Create an event
    pub fn new(fd: RawFd, direction: Direction) -> Self {
        Self { fd, direction }
    }
}

/// Suspend the current task until `fd` is readable.
///
/// Fails with `DuplicateWaiter` if another task already waits to read `fd`,
/// `DescriptorClosed` if [`notify_closing`] is called for `fd` while parked,
/// `Cancelled` if an enclosing cancel scope is cancelled, and `NoRuntime`
/// outside a runtime.
pub async fn wait_readable(fd: RawFd) -> Result<()> {
    Parked::new(ParkRequest::Io { fd, direction: Direction::Read }).await
}

/// Suspend the current task until `fd` is writable.
///
/// Same failure modes as [`wait_readable`].
pub async fn wait_writable(fd: RawFd) -> Result<()> {
    Parked::new(ParkRequest::Io { fd, direction: Direction::Write }).await
}

/// Wake every task waiting on `fd` with `DescriptorClosed` and drop the
/// descriptor's OS registrations.
///
/// Call this before closing a descriptor that other tasks may be waiting on.
/// Safe to call from any task in the middle of a tick.
pub fn notify_closing(fd: RawFd) -> Result<()> {
    runtime::with_core(|core| core.notify_closing(fd)).and_then(|r| r)
}
