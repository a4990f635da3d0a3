//! Tether core runtime
//!
//! A single-threaded cooperative task runtime. This crate provides:
//! - I/O readiness multiplexing over epoll, poll, kqueue and io_uring
//! - The scheduler run loop that turns readiness events and timers into wakeups
//! - Cancel scopes with deadlines, delivered to parked tasks as resumption values
//! - Run-local variables, statistics and test helpers (mock clock, instruments)
//!
//! ```ignore
//! use tether_core::{io, Runtime};
//!
//! let mut rt = Runtime::new()?;
//! rt.block_on(async move {
//!     io::wait_readable(fd).await?;
//!     Ok::<_, tether_core::Error>(())
//! })??;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cancel;
pub mod clock;
pub mod config;
pub mod instrument;
pub mod io;
pub mod local;
pub mod runtime;
pub mod scheduler;
pub mod testing;
pub mod time;

pub use cancel::{checkpoint, fail_after, fail_at, move_on_after, move_on_at, CancelReason, CancelScope};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{BackendKind, RuntimeConfig};
pub use instrument::{Instrument, TracingInstrument};
pub use io::{notify_closing, wait_readable, wait_writable, Direction};
pub use local::{RunVar, RunVarToken};
pub use runtime::{current_statistics, current_task, run, spawn, IoStatistics, RunStatistics, Runtime, RuntimeBuilder};
pub use scheduler::{JoinHandle, Resume, TaskId};
pub use time::{current_time, sleep, sleep_forever, sleep_until};

use std::os::unix::io::RawFd;

/// Runtime errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Another task already waits on this descriptor in this direction
    #[error("another task is already waiting for {direction} readiness on fd {fd}")]
    DuplicateWaiter {
        /// Descriptor
        fd: RawFd,
        /// Direction of the existing waiter
        direction: Direction,
    },

    /// The descriptor was closed while the task was parked on it
    #[error("fd {fd} was closed while a task was waiting on it")]
    DescriptorClosed {
        /// Descriptor
        fd: RawFd,
    },

    /// The enclosing cancel scope was cancelled
    #[error("operation was cancelled")]
    Cancelled,

    /// A `fail_after`/`fail_at` deadline expired
    #[error("deadline expired before the operation completed")]
    TooSlow,

    /// Nothing can ever wake the top-level task
    #[error("deadlock: no runnable tasks, no pending timers and no armed descriptors")]
    Deadlock,

    /// Called outside of a running runtime
    #[error("must be called from inside a running runtime")]
    NoRuntime,

    /// `block_on` called while a runtime is already running on this thread
    #[error("a runtime is already running on this thread")]
    NestedRuntime,

    /// The requested backend is not compiled in for this platform
    #[error("I/O backend {0} is not available on this platform")]
    UnsupportedBackend(BackendKind),

    /// Run variable read with no value and no default
    #[error("run variable {0} has no value")]
    RunVarUnset(&'static str),

    /// Token handed to the wrong run variable
    #[error("token was not created by run variable {0}")]
    TokenMismatch(&'static str),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),

    /// OS error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Runtime result
pub type Result<T> = std::result::Result<T, Error>;
