//! Instrumentation
//!
//! Observers of the run loop. Every hook has a no-op default. Hooks are called
//! while the runtime's state is borrowed, so they must not call back into the
//! runtime.

use crate::io::Direction;
use crate::scheduler::{Resume, TaskId};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

/// Run loop observer
pub trait Instrument {
    /// A run is starting
    fn before_run(&self) {}
    /// A run finished
    fn after_run(&self) {}
    /// A scheduler tick is starting
    fn before_tick(&self, _tick: u64) {}
    /// A scheduler tick finished
    fn after_tick(&self, _tick: u64) {}
    /// A task was spawned
    fn task_spawned(&self, _task: TaskId) {}
    /// A parked task became runnable
    fn task_scheduled(&self, _task: TaskId) {}
    /// A task is about to be polled
    fn before_task_step(&self, _task: TaskId) {}
    /// A task was polled
    fn after_task_step(&self, _task: TaskId) {}
    /// A task finished
    fn task_exited(&self, _task: TaskId) {}
    /// The loop is about to block in the backend
    fn before_io_wait(&self, _timeout: Option<Duration>) {}
    /// The backend returned `events` events
    fn after_io_wait(&self, _timeout: Option<Duration>, _events: usize) {}
    /// A task parked on a descriptor
    fn io_wait_begin(&self, _task: TaskId, _fd: RawFd, _direction: Direction) {}
    /// A descriptor wait was resolved
    fn io_wait_end(&self, _task: TaskId, _fd: RawFd, _direction: Direction, _resume: Resume) {}
}

/// Forwards every hook to `tracing` at trace level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingInstrument;

impl Instrument for TracingInstrument {
    fn before_run(&self) {
        tracing::trace!(target: "tether::instrument", "run started");
    }

    fn after_run(&self) {
        tracing::trace!(target: "tether::instrument", "run finished");
    }

    fn before_tick(&self, tick: u64) {
        tracing::trace!(target: "tether::instrument", tick, "tick started");
    }

    fn task_spawned(&self, task: TaskId) {
        tracing::trace!(target: "tether::instrument", %task, "task spawned");
    }

    fn task_scheduled(&self, task: TaskId) {
        tracing::trace!(target: "tether::instrument", %task, "task scheduled");
    }

    fn before_task_step(&self, task: TaskId) {
        tracing::trace!(target: "tether::instrument", %task, "task step");
    }

    fn task_exited(&self, task: TaskId) {
        tracing::trace!(target: "tether::instrument", %task, "task exited");
    }

    fn before_io_wait(&self, timeout: Option<Duration>) {
        tracing::trace!(target: "tether::instrument", ?timeout, "io wait");
    }

    fn after_io_wait(&self, _timeout: Option<Duration>, events: usize) {
        tracing::trace!(target: "tether::instrument", events, "io wait returned");
    }

    fn io_wait_begin(&self, task: TaskId, fd: RawFd, direction: Direction) {
        tracing::trace!(target: "tether::instrument", %task, fd, %direction, "waiting on descriptor");
    }

    fn io_wait_end(&self, task: TaskId, fd: RawFd, direction: Direction, resume: Resume) {
        tracing::trace!(target: "tether::instrument", %task, fd, %direction, ?resume, "descriptor wait resolved");
    }
}

/// Fan-out over the installed instruments
#[derive(Clone, Default)]
pub(crate) struct Instruments {
    list: Vec<Rc<dyn Instrument>>,
}

impl Instruments {
    pub fn push(&mut self, instrument: Rc<dyn Instrument>) {
        self.list.push(instrument);
    }

    pub fn before_run(&self) {
        self.list.iter().for_each(|i| i.before_run());
    }

    pub fn after_run(&self) {
        self.list.iter().for_each(|i| i.after_run());
    }

    pub fn before_tick(&self, tick: u64) {
        self.list.iter().for_each(|i| i.before_tick(tick));
    }

    pub fn after_tick(&self, tick: u64) {
        self.list.iter().for_each(|i| i.after_tick(tick));
    }

    pub fn task_spawned(&self, task: TaskId) {
        self.list.iter().for_each(|i| i.task_spawned(task));
    }

    pub fn task_scheduled(&self, task: TaskId) {
        self.list.iter().for_each(|i| i.task_scheduled(task));
    }

    pub fn before_task_step(&self, task: TaskId) {
        self.list.iter().for_each(|i| i.before_task_step(task));
    }

    pub fn after_task_step(&self, task: TaskId) {
        self.list.iter().for_each(|i| i.after_task_step(task));
    }

    pub fn task_exited(&self, task: TaskId) {
        self.list.iter().for_each(|i| i.task_exited(task));
    }

    pub fn before_io_wait(&self, timeout: Option<Duration>) {
        self.list.iter().for_each(|i| i.before_io_wait(timeout));
    }

    pub fn after_io_wait(&self, timeout: Option<Duration>, events: usize) {
        self.list.iter().for_each(|i| i.after_io_wait(timeout, events));
    }

    pub fn io_wait_begin(&self, task: TaskId, fd: RawFd, direction: Direction) {
        self.list.iter().for_each(|i| i.io_wait_begin(task, fd, direction));
    }

    pub fn io_wait_end(&self, task: TaskId, fd: RawFd, direction: Direction, resume: Resume) {
        self.list.iter().for_each(|i| i.io_wait_end(task, fd, direction, resume));
    }
}
