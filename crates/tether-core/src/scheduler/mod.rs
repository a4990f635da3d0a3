//! Cooperative scheduler
//!
//! This module provides the single-threaded task scheduler:
//! - Task records and join handles (`task`)
//! - Parks: one suspension of one task at one primitive (`park`)
//! - Timer queue for sleeps and cancel-scope deadlines (`timer`)
//! - Thread-safe wakers feeding a wake queue (`waker`)
//! - Runtime state shared by every primitive (`state`)
//! - The run loop tying the backend, timers and tasks together (`bridge`)

pub(crate) mod bridge;
pub(crate) mod park;
pub(crate) mod state;
mod task;
pub(crate) mod timer;
pub(crate) mod waker;

pub use park::{ParkId, Resume};
pub use task::{JoinHandle, TaskId, TaskState};
pub(crate) use task::Task;
