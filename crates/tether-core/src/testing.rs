//! Test helpers
//!
//! - [`wait_all_tasks_blocked`]: resume once every other task is parked
//! - [`RecordingInstrument`]: keeps every instrumentation event for assertions
//! - [`MockClock`](crate::MockClock) lives in [`clock`](crate::clock)

use crate::instrument::Instrument;
use crate::io::Direction;
use crate::scheduler::park::{ParkRequest, Parked};
use crate::scheduler::{Resume, TaskId};
use crate::Result;
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

/// Park until no other task is runnable and the backend has nothing ready.
///
/// Useful to let every spawned task reach its first wait before acting.
pub async fn wait_all_tasks_blocked() -> Result<()> {
    Parked::new(ParkRequest::Quiescent).await
}

/// One recorded instrumentation callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrumentEvent {
    /// `before_run`
    RunStarted,
    /// `after_run`
    RunFinished,
    /// `task_spawned`
    TaskSpawned(TaskId),
    /// `task_scheduled`
    TaskScheduled(TaskId),
    /// `before_task_step`
    TaskStep(TaskId),
    /// `task_exited`
    TaskExited(TaskId),
    /// `before_io_wait`
    IoWait(Option<Duration>),
    /// `io_wait_begin`
    IoWaitBegin {
        /// Waiting task
        task: TaskId,
        /// Descriptor
        fd: RawFd,
        /// Direction
        direction: Direction,
    },
    /// `io_wait_end`
    IoWaitEnd {
        /// Waiting task
        task: TaskId,
        /// Descriptor
        fd: RawFd,
        /// Direction
        direction: Direction,
        /// How the wait ended
        resume: Resume,
    },
}

/// Instrument that records events. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingInstrument {
    events: Rc<RefCell<Vec<InstrumentEvent>>>,
}

impl RecordingInstrument {
    /// Empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far
    pub fn events(&self) -> Vec<InstrumentEvent> {
        self.events.borrow().clone()
    }

    /// Number of recorded events matching `pred`
    pub fn count(&self, pred: impl Fn(&InstrumentEvent) -> bool) -> usize {
        self.events.borrow().iter().filter(|e| pred(e)).count()
    }

    fn record(&self, event: InstrumentEvent) {
        self.events.borrow_mut().push(event);
    }
}

impl Instrument for RecordingInstrument {
    fn before_run(&self) {
        self.record(InstrumentEvent::RunStarted);
    }

    fn after_run(&self) {
        self.record(InstrumentEvent::RunFinished);
    }

    fn task_spawned(&self, task: TaskId) {
        self.record(InstrumentEvent::TaskSpawned(task));
    }

    fn task_scheduled(&self, task: TaskId) {
        self.record(InstrumentEvent::TaskScheduled(task));
    }

    fn before_task_step(&self, task: TaskId) {
        self.record(InstrumentEvent::TaskStep(task));
    }

    fn task_exited(&self, task: TaskId) {
        self.record(InstrumentEvent::TaskExited(task));
    }

    fn before_io_wait(&self, timeout: Option<Duration>) {
        self.record(InstrumentEvent::IoWait(timeout));
    }

    fn io_wait_begin(&self, task: TaskId, fd: RawFd, direction: Direction) {
        self.record(InstrumentEvent::IoWaitBegin { task, fd, direction });
    }

    fn io_wait_end(&self, task: TaskId, fd: RawFd, direction: Direction, resume: Resume) {
        self.record(InstrumentEvent::IoWaitEnd {
            task,
            fd,
            direction,
            resume,
        });
    }
}
