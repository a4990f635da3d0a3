//! Task records and join handles

use crate::cancel::ScopeState;
use crate::scheduler::park::{ParkId, ParkRequest, Parked};
use crate::scheduler::waker::TaskWaker;
use crate::{Error, Result};
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw u64 value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Task execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Spawned, waiting for its first step
    Created,
    /// Currently being polled
    Running,
    /// Parked; not in the ready queue
    Suspended,
    /// Woken and queued for its next step
    Resumed,
    /// Future returned `Ready`
    Completed,
}

/// Scheduler-owned task record
pub(crate) struct Task {
    /// Current state
    pub state: TaskState,
    /// The task body; taken out while it is being polled
    pub future: Option<Pin<Box<dyn Future<Output = ()>>>>,
    /// Waker handed to the task body
    pub waker: Arc<TaskWaker>,
    /// Cancel scopes entered by the task body, innermost last
    pub scopes: Vec<Rc<ScopeState>>,
    /// Parks of tasks joining this one
    pub joiners: Vec<ParkId>,
    /// Woken while running; requeue after the step
    pub notified: bool,
}

impl Task {
    pub fn new(future: Pin<Box<dyn Future<Output = ()>>>, waker: Arc<TaskWaker>) -> Self {
        Self {
            state: TaskState::Created,
            future: Some(future),
            waker,
            scopes: Vec::new(),
            joiners: Vec::new(),
            notified: false,
        }
    }

    /// Any enclosing cancel scope has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.scopes.iter().any(|scope| scope.is_cancelled())
    }

    /// Something outside the runtime holds a clone of this task's waker
    pub fn waker_held_elsewhere(&self) -> bool {
        Arc::strong_count(&self.waker) > 1
    }
}

/// Handle to a spawned task's output.
///
/// Dropping the handle detaches the task; it keeps running.
pub struct JoinHandle<T> {
    id: TaskId,
    output: Rc<RefCell<Option<T>>>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(id: TaskId, output: Rc<RefCell<Option<T>>>) -> Self {
        Self { id, output }
    }

    /// ID of the spawned task
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The task has finished and its output is waiting to be joined
    pub fn is_finished(&self) -> bool {
        self.output.borrow().is_some()
    }

    /// Wait for the task to finish and take its output.
    ///
    /// Fails with `Cancelled` if the caller's cancel scope is cancelled first.
    pub async fn join(self) -> Result<T> {
        if let Some(value) = self.output.borrow_mut().take() {
            return Ok(value);
        }
        Parked::new(ParkRequest::Join { target: self.id }).await?;
        // Tasks only vanish without output when the runtime is torn down
        self.output.borrow_mut().take().ok_or(Error::Cancelled)
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
