//! Runtime state
//!
//! Everything the wait primitives and the run loop share: tasks, parks, the
//! waiter registry, the backend and the timer queue. Lives in a `RefCell`
//! owned by the runtime thread; every borrow is short and none is held while
//! a task body is polled or dropped.

use crate::cancel::{CancelReason, ScopeState};
use crate::clock::Clock;
use crate::instrument::Instruments;
use crate::io::backend::{Backend, Multiplexer, Semantics};
use crate::io::registry::{Waiter, WaiterRegistry};
use crate::io::{Direction, Event};
use crate::runtime::{IoStatistics, RunStatistics};
use crate::scheduler::park::{Park, ParkId, ParkKind, ParkRequest, Resume};
use crate::scheduler::timer::{TimerKind, TimerQueue};
use crate::scheduler::waker::{self, TaskWaker, WakeQueue, WakeReceiver};
use crate::scheduler::{Task, TaskId, TaskState};
use crate::{Error, Result};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::Waker;
use std::time::Duration;

/// A task body taken out of its slot for one step
pub(crate) type TaskBody = Pin<Box<dyn Future<Output = ()>>>;

pub(crate) struct Core {
    pub clock: Rc<dyn Clock>,
    pub instruments: Instruments,
    pub registry: WaiterRegistry,
    pub backend: Backend,
    pub timers: TimerQueue,
    pub tasks: FxHashMap<TaskId, Task>,
    pub parks: FxHashMap<ParkId, Park>,
    pub ready: VecDeque<TaskId>,
    /// Task being stepped
    pub current: Option<TaskId>,
    /// Parks of `wait_all_tasks_blocked` callers
    pub quiescent: Vec<ParkId>,
    /// Run variable values, keyed by variable ID
    pub locals: FxHashMap<u64, Box<dyn Any>>,
    pub wake_queue: Arc<WakeQueue>,
    pub wake_receiver: WakeReceiver,
    /// Reused event buffer
    pub events: Vec<Event>,
    pub tick: u64,
}

impl Core {
    pub fn new(backend: Backend, clock: Rc<dyn Clock>, instruments: Instruments) -> Result<Self> {
        let (wake_queue, wake_receiver) = waker::channel()?;
        let mut backend = backend;
        backend.register(wake_receiver.fd(), Direction::Read)?;

        Ok(Self {
            clock,
            instruments,
            registry: WaiterRegistry::new(),
            backend,
            timers: TimerQueue::new(),
            tasks: FxHashMap::default(),
            parks: FxHashMap::default(),
            ready: VecDeque::new(),
            current: None,
            quiescent: Vec::new(),
            locals: FxHashMap::default(),
            wake_queue,
            wake_receiver,
            events: Vec::new(),
            tick: 0,
        })
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    pub fn spawn(&mut self, future: TaskBody) -> TaskId {
        let id = TaskId::new();
        let waker = TaskWaker::new(id, self.wake_queue.clone());
        self.tasks.insert(id, Task::new(future, waker));
        self.ready.push_back(id);
        self.instruments.task_spawned(id);
        id
    }

    /// Make a task runnable. Suspended tasks are queued; a running task is
    /// requeued after its current step.
    pub fn schedule(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        match task.state {
            TaskState::Suspended => {
                task.state = TaskState::Resumed;
                self.ready.push_back(id);
                self.instruments.task_scheduled(id);
            }
            TaskState::Running => task.notified = true,
            TaskState::Created | TaskState::Resumed | TaskState::Completed => {}
        }
    }

    /// Schedule every task woken through its waker
    pub fn drain_wakes(&mut self) {
        while let Some(id) = self.wake_queue.pop() {
            self.schedule(id);
        }
    }

    pub fn current_task(&self) -> Result<TaskId> {
        self.current.ok_or(Error::NoRuntime)
    }

    /// Pop the next ready task and take its body out for polling
    pub fn start_step(&mut self) -> Option<(TaskId, TaskBody, Arc<TaskWaker>)> {
        let id = self.ready.pop_front()?;
        let task = self.tasks.get_mut(&id)?;
        if !matches!(task.state, TaskState::Created | TaskState::Resumed) {
            return None;
        }
        let body = task.future.take()?;
        task.state = TaskState::Running;
        let waker = task.waker.clone();
        self.current = Some(id);
        self.instruments.before_task_step(id);
        Some((id, body, waker))
    }

    /// Put a polled body back, or retire the task if it finished.
    /// A finished body is returned so the caller drops it outside the borrow.
    pub fn end_step(&mut self, id: TaskId, body: TaskBody, finished: bool) -> Option<TaskBody> {
        self.current = None;
        self.instruments.after_task_step(id);

        let retired = if finished {
            let joiners = match self.tasks.get_mut(&id) {
                Some(task) => {
                    task.state = TaskState::Completed;
                    std::mem::take(&mut task.joiners)
                }
                None => Vec::new(),
            };
            for park in joiners {
                self.complete_park(park, Resume::Ready);
            }
            self.tasks.remove(&id);
            self.instruments.task_exited(id);
            Some(body)
        } else {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.future = Some(body);
                if std::mem::take(&mut task.notified) {
                    task.state = TaskState::Resumed;
                    self.ready.push_back(id);
                } else {
                    task.state = TaskState::Suspended;
                }
            }
            None
        };

        self.drain_wakes();
        retired
    }

    // ========================================================================
    // Parks
    // ========================================================================

    /// Start a wait for the current task
    pub fn park(&mut self, request: ParkRequest, waker: &Waker) -> Result<ParkId> {
        let task_id = self.current_task()?;
        let task = self.tasks.get(&task_id).ok_or(Error::NoRuntime)?;
        if task.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let scopes = task.scopes.clone();
        let own = Waker::from(task.waker.clone());
        let waker = if waker.will_wake(&own) { None } else { Some(waker.clone()) };
        drop(own);

        let id = ParkId::new();
        let (kind, immediate) = match request {
            ParkRequest::Io { fd, direction } => {
                self.registry.register(Waiter {
                    fd,
                    direction,
                    task: task_id,
                    park: id,
                    armed_at: self.clock.current_time(),
                })?;
                if let Err(e) = self.backend.register(fd, direction) {
                    self.registry.remove(fd, direction);
                    return Err(Error::Io(e));
                }
                self.instruments.io_wait_begin(task_id, fd, direction);
                (ParkKind::Io { fd, direction }, false)
            }
            ParkRequest::Sleep { deadline } => {
                let timer = self.timers.insert(deadline, TimerKind::Park(id));
                (ParkKind::Sleep { timer }, false)
            }
            ParkRequest::Join { target } => match self.tasks.get_mut(&target) {
                Some(t) if t.state != TaskState::Completed => {
                    t.joiners.push(id);
                    (ParkKind::Join { target }, false)
                }
                _ => (ParkKind::Join { target }, true),
            },
            ParkRequest::Yield => (ParkKind::Yield, true),
            ParkRequest::Quiescent => {
                self.quiescent.push(id);
                (ParkKind::Quiescent, false)
            }
            ParkRequest::Forever => (ParkKind::Forever, false),
        };

        self.parks.insert(
            id,
            Park {
                task: task_id,
                kind,
                scopes,
                outcome: None,
                waker,
            },
        );
        if immediate {
            self.complete_park(id, Resume::Ready);
        }
        Ok(id)
    }

    /// Collect a park's outcome, removing the park once it is resolved
    pub fn take_outcome(&mut self, id: ParkId, waker: &Waker) -> Option<Resume> {
        let park = self.parks.get_mut(&id)?;
        match park.outcome {
            Some(resume) => {
                self.parks.remove(&id);
                Some(resume)
            }
            None => {
                if park.waker.as_ref().is_some_and(|w| !w.will_wake(waker)) {
                    park.waker = Some(waker.clone());
                }
                None
            }
        }
    }

    /// The waiting future was dropped before its outcome was collected
    pub fn abandon_park(&mut self, id: ParkId) {
        if let Some(park) = self.parks.remove(&id) {
            if park.outcome.is_none() {
                self.release(id, park.kind);
            }
        }
    }

    /// Record an outcome and wake the parked task. Bookkeeping for the
    /// park's kind must already be released.
    pub fn complete_park(&mut self, id: ParkId, resume: Resume) {
        let Some(park) = self.parks.get_mut(&id) else {
            return;
        };
        if park.outcome.is_some() {
            return;
        }
        park.outcome = Some(resume);
        let task = park.task;
        let kind = park.kind;
        let waker = park.waker.take();

        if let ParkKind::Io { fd, direction } = kind {
            self.instruments.io_wait_end(task, fd, direction, resume);
        }
        match waker {
            Some(waker) => waker.wake(),
            None => self.schedule(task),
        }
    }

    /// Release a park's bookkeeping, then complete it
    pub fn resolve_park(&mut self, id: ParkId, resume: Resume) {
        let Some(park) = self.parks.get(&id) else {
            return;
        };
        if park.outcome.is_some() {
            return;
        }
        let kind = park.kind;
        self.release(id, kind);
        self.complete_park(id, resume);
    }

    fn release(&mut self, id: ParkId, kind: ParkKind) {
        match kind {
            ParkKind::Io { fd, direction } => {
                if self.registry.remove(fd, direction).is_some() {
                    self.deregister_quietly(fd, direction);
                }
            }
            ParkKind::Sleep { timer } => {
                self.timers.cancel(timer);
            }
            ParkKind::Join { target } => {
                if let Some(task) = self.tasks.get_mut(&target) {
                    task.joiners.retain(|p| *p != id);
                }
            }
            ParkKind::Quiescent => self.quiescent.retain(|p| *p != id),
            ParkKind::Yield | ParkKind::Forever => {}
        }
    }

    // ========================================================================
    // I/O
    // ========================================================================

    fn deregister_quietly(&mut self, fd: RawFd, direction: Direction) {
        if let Err(e) = self.backend.deregister(fd, direction) {
            tracing::warn!(fd, %direction, error = %e, "failed to deregister descriptor");
        }
    }

    /// Turn one backend event into a wakeup
    pub fn dispatch_event(&mut self, event: Event) {
        if event.fd == self.wake_receiver.fd() {
            self.wake_receiver.drain();
            // One-shot registrations are consumed by the completion
            if self.backend.semantics() == Semantics::Completion {
                if let Err(e) = self.backend.register(event.fd, Direction::Read) {
                    tracing::warn!(error = %e, "failed to re-arm wakeup socket");
                }
            }
            return;
        }

        if let Some(waiter) = self.registry.resolve(event.fd, event.direction) {
            self.deregister_quietly(event.fd, event.direction);
            let waited = self.clock.current_time().saturating_duration_since(waiter.armed_at);
            tracing::trace!(fd = event.fd, direction = %event.direction, task = %waiter.task, ?waited, "descriptor ready");
            self.complete_park(waiter.park, Resume::Ready);
        }
    }

    /// Wake both waiters of a descriptor about to be closed
    pub fn notify_closing(&mut self, fd: RawFd) -> Result<()> {
        if fd == self.wake_receiver.fd() {
            return Ok(());
        }
        for direction in Direction::ALL {
            let waiter = self.registry.remove(fd, direction);
            // Drop any residual interest so a reused fd number starts clean
            self.deregister_quietly(fd, direction);
            if let Some(waiter) = waiter {
                tracing::debug!(fd, %direction, task = %waiter.task, "waking waiter of closing descriptor");
                self.complete_park(waiter.park, Resume::Closed);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Cancel scopes
    // ========================================================================

    pub fn enter_scope(&mut self, scope: &Rc<ScopeState>) -> Result<()> {
        let id = self.current_task()?;
        let task = self.tasks.get_mut(&id).ok_or(Error::NoRuntime)?;
        task.scopes.push(scope.clone());
        if !scope.entered.replace(true) {
            self.arm_scope_deadline(scope);
        }
        Ok(())
    }

    pub fn exit_scope(&mut self, scope: &Rc<ScopeState>) {
        let Some(task) = self.current.and_then(|id| self.tasks.get_mut(&id)) else {
            return;
        };
        if task.scopes.last().is_some_and(|s| Rc::ptr_eq(s, scope)) {
            task.scopes.pop();
        } else {
            task.scopes.retain(|s| !Rc::ptr_eq(s, scope));
        }
    }

    /// (Re)arm the deadline timer of a scope
    pub fn arm_scope_deadline(&mut self, scope: &Rc<ScopeState>) {
        self.disarm_scope_deadline(scope);
        if scope.is_cancelled() {
            return;
        }
        let Some(deadline) = scope.deadline.get() else {
            return;
        };
        if deadline <= self.clock.current_time() {
            self.cancel_scope(scope, CancelReason::Deadline);
        } else {
            let key = self.timers.insert(deadline, TimerKind::Scope(Rc::downgrade(scope)));
            scope.timer.set(Some(key));
        }
    }

    pub fn disarm_scope_deadline(&mut self, scope: &ScopeState) {
        if let Some(key) = scope.timer.take() {
            self.timers.cancel(key);
        }
    }

    /// Cancel a scope and resolve every park inside it with `Cancelled`
    pub fn cancel_scope(&mut self, scope: &Rc<ScopeState>, reason: CancelReason) {
        if scope.is_cancelled() {
            return;
        }
        scope.reason.set(Some(reason));
        self.disarm_scope_deadline(scope);

        let parks: Vec<ParkId> = self
            .parks
            .iter()
            .filter(|(_, park)| park.outcome.is_none() && park.in_scope(scope))
            .map(|(id, _)| *id)
            .collect();
        tracing::debug!(scope = scope.id, ?reason, parked = parks.len(), "cancel scope");
        for id in parks {
            self.resolve_park(id, Resume::Cancelled);
        }
    }

    // ========================================================================
    // Run loop support
    // ========================================================================

    /// Blocking budget for the next backend wait
    pub fn compute_timeout(&mut self) -> Result<Option<Duration>> {
        self.drain_wakes();
        if !self.ready.is_empty() || !self.quiescent.is_empty() {
            return Ok(Some(Duration::ZERO));
        }
        if let Some(deadline) = self.timers.next_deadline() {
            return Ok(Some(self.clock.deadline_to_sleep_time(deadline)));
        }
        if !self.registry.is_empty() || self.tasks.values().any(|t| t.waker_held_elsewhere()) {
            return Ok(None);
        }
        tracing::debug!(tasks = self.tasks.len(), "no task can ever be woken");
        Err(Error::Deadlock)
    }

    /// Resolve every due timer
    pub fn fire_timers(&mut self) {
        let now = self.clock.current_time();
        for kind in self.timers.pop_due(now) {
            match kind {
                TimerKind::Park(id) => self.complete_park(id, Resume::Ready),
                TimerKind::Scope(scope) => {
                    if let Some(scope) = scope.upgrade() {
                        scope.timer.set(None);
                        self.cancel_scope(&scope, CancelReason::Deadline);
                    }
                }
            }
        }
    }

    /// Wake `wait_all_tasks_blocked` callers once nothing else can run
    pub fn wake_quiescent(&mut self) {
        self.drain_wakes();
        if self.quiescent.is_empty() || !self.ready.is_empty() {
            return;
        }
        for id in std::mem::take(&mut self.quiescent) {
            self.complete_park(id, Resume::Ready);
        }
    }

    pub fn statistics(&mut self) -> RunStatistics {
        let now = self.clock.current_time();
        RunStatistics {
            tasks_living: self.tasks.len(),
            tasks_runnable: self.ready.len(),
            next_deadline_in: self.timers.next_deadline().map(|d| d.saturating_duration_since(now)),
            io: IoStatistics {
                tasks_waiting_read: self.registry.count(Direction::Read),
                tasks_waiting_write: self.registry.count(Direction::Write),
                // Minus the wakeup socket
                registrations: self.backend.armed().saturating_sub(1),
                backend: self.backend.name(),
            },
        }
    }

    /// Forget per-run state after the top-level task returned
    pub fn reset(&mut self) {
        for direction in Direction::ALL {
            let fds: Vec<RawFd> = self
                .parks
                .values()
                .filter_map(|p| match p.kind {
                    ParkKind::Io { fd, direction: d } if d == direction && p.outcome.is_none() => Some(fd),
                    _ => None,
                })
                .collect();
            for fd in fds {
                if self.registry.remove(fd, direction).is_some() {
                    self.deregister_quietly(fd, direction);
                }
            }
        }
        self.parks.clear();
        self.ready.clear();
        self.quiescent.clear();
        self.timers.clear();
        self.locals.clear();
        self.current = None;
        while self.wake_queue.pop().is_some() {}
    }
}
