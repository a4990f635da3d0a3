//! Runtime entry points
//!
//! A [`Runtime`] owns the backend, timers and tasks of one thread. While
//! [`Runtime::block_on`] runs, the free functions of this crate (`spawn`,
//! `wait_readable`, `sleep`, ...) reach it through a thread-local handle and
//! fail with `NoRuntime` anywhere else.

use crate::clock::{Clock, SystemClock};
use crate::config::{BackendKind, RuntimeConfig};
use crate::instrument::{Instrument, Instruments};
use crate::io::backend::{Backend, Multiplexer};
use crate::scheduler::bridge;
use crate::scheduler::state::Core;
use crate::scheduler::{JoinHandle, Task, TaskId};
use crate::{Error, Result};
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

thread_local! {
    static CONTEXT: RefCell<Option<Rc<RefCell<Core>>>> = const { RefCell::new(None) };
}

/// Run `f` against the running runtime's state
pub(crate) fn with_core<R>(f: impl FnOnce(&mut Core) -> R) -> Result<R> {
    let shared = CONTEXT.with(|ctx| ctx.borrow().clone()).ok_or(Error::NoRuntime)?;
    let mut core = shared.borrow_mut();
    Ok(f(&mut core))
}

/// Like [`with_core`], for destructors: does nothing if there is no runtime,
/// the thread is shutting down, or the state is already borrowed
pub(crate) fn try_with_core<R>(f: impl FnOnce(&mut Core) -> R) -> Option<R> {
    let shared = CONTEXT.try_with(|ctx| ctx.borrow().clone()).ok().flatten()?;
    let mut core = shared.try_borrow_mut().ok()?;
    Some(f(&mut core))
}

/// Installs a runtime as this thread's current one for the duration of a run
struct ContextGuard;

impl ContextGuard {
    fn enter(core: &Rc<RefCell<Core>>) -> Result<Self> {
        CONTEXT.with(|ctx| {
            let mut ctx = ctx.borrow_mut();
            if ctx.is_some() {
                return Err(Error::NestedRuntime);
            }
            *ctx = Some(core.clone());
            Ok(ContextGuard)
        })
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let _ = CONTEXT.try_with(|ctx| ctx.borrow_mut().take());
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Snapshot of a running runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStatistics {
    /// Tasks spawned and not yet finished
    pub tasks_living: usize,
    /// Tasks queued to run
    pub tasks_runnable: usize,
    /// Time until the earliest timer, if any
    pub next_deadline_in: Option<Duration>,
    /// I/O multiplexer state
    pub io: IoStatistics,
}

/// I/O part of [`RunStatistics`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoStatistics {
    /// Tasks parked in `wait_readable`
    pub tasks_waiting_read: usize,
    /// Tasks parked in `wait_writable`
    pub tasks_waiting_write: usize,
    /// Armed backend registrations
    pub registrations: usize,
    /// Backend name
    pub backend: &'static str,
}

// ============================================================================
// Runtime
// ============================================================================

/// Builder for [`Runtime`]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    clock: Rc<dyn Clock>,
    instruments: Instruments,
}

impl RuntimeBuilder {
    /// Builder with default configuration and the system clock
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            clock: Rc::new(SystemClock),
            instruments: Instruments::default(),
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Select the I/O backend
    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.config.backend = kind;
        self
    }

    /// Maximum events reported per backend wait
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity.max(1);
        self
    }

    /// Use a custom clock
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Rc::new(clock);
        self
    }

    /// Add an instrument
    pub fn instrument(mut self, instrument: impl Instrument + 'static) -> Self {
        self.instruments.push(Rc::new(instrument));
        self
    }

    /// Build the runtime
    pub fn build(self) -> Result<Runtime> {
        let backend = Backend::select(self.config.backend, self.config.event_capacity)?;
        let core = Core::new(backend, self.clock, self.instruments)?;
        Ok(Runtime {
            core: Rc::new(RefCell::new(core)),
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-threaded cooperative runtime
pub struct Runtime {
    core: Rc<RefCell<Core>>,
}

impl Runtime {
    /// Runtime configured from the environment (see [`RuntimeConfig::from_env`])
    pub fn new() -> Result<Self> {
        Self::builder().config(RuntimeConfig::from_env()?).build()
    }

    /// Start building a runtime
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Name of the active backend
    pub fn backend_name(&self) -> &'static str {
        self.core.borrow().backend.name()
    }

    /// Kind of the active backend
    pub fn backend_kind(&self) -> BackendKind {
        self.core.borrow().backend.kind()
    }

    /// Statistics snapshot (also available between runs)
    pub fn statistics(&self) -> RunStatistics {
        self.core.borrow_mut().statistics()
    }

    /// Run `future` as the top-level task until it completes.
    ///
    /// Tasks still alive when it completes are dropped. Fails with `Deadlock`
    /// if the top-level task can never be woken, with `NestedRuntime` if a run
    /// is already active on this thread, and with `Io` if the backend fails.
    pub fn block_on<F>(&mut self, future: F) -> Result<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let _guard = ContextGuard::enter(&self.core)?;
        let output = Rc::new(RefCell::new(None));

        {
            let mut core = self.core.borrow_mut();
            core.clock.start_clock();
            core.instruments.before_run();
            let slot = output.clone();
            core.spawn(Box::pin(async move {
                let value = future.await;
                *slot.borrow_mut() = Some(value);
            }));
            tracing::debug!(backend = core.backend.name(), "run started");
        }

        let result = bridge::drive(&self.core, &output);
        if let Err(e) = &result {
            tracing::debug!(error = %e, "run failed");
        }
        self.teardown();

        let core = self.core.borrow();
        core.instruments.after_run();
        tracing::debug!(ticks = core.tick, "run finished");
        result
    }

    fn teardown(&mut self) {
        // Task bodies are dropped with the state unborrowed: their waits
        // unregister themselves
        let leftovers: Vec<Task> = self.core.borrow_mut().tasks.drain().map(|(_, task)| task).collect();
        if !leftovers.is_empty() {
            tracing::debug!(tasks = leftovers.len(), "dropping unfinished tasks");
        }
        drop(leftovers);
        let locals = std::mem::take(&mut self.core.borrow_mut().locals);
        drop(locals);
        self.core.borrow_mut().reset();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").field("backend", &self.backend_name()).finish()
    }
}

/// Build a runtime from the environment and run `future` on it
pub fn run<F>(future: F) -> Result<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    Runtime::new()?.block_on(future)
}

/// Spawn a task on the running runtime
pub fn spawn<F>(future: F) -> Result<JoinHandle<F::Output>>
where
    F: Future + 'static,
    F::Output: 'static,
{
    let output = Rc::new(RefCell::new(None));
    let slot = output.clone();
    let body = Box::pin(async move {
        let value = future.await;
        *slot.borrow_mut() = Some(value);
    });
    let id = with_core(move |core| core.spawn(body))?;
    Ok(JoinHandle::new(id, output))
}

/// ID of the task calling this
pub fn current_task() -> Result<TaskId> {
    with_core(|core| core.current_task()).and_then(|r| r)
}

/// Statistics of the running runtime
pub fn current_statistics() -> Result<RunStatistics> {
    with_core(|core| core.statistics())
}
