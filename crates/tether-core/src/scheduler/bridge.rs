//! Run loop
//!
//! One tick:
//! 1. Step every task that was ready when the tick started
//! 2. Stop if the top-level task finished
//! 3. Compute the blocking budget from ready tasks, timers and armed descriptors
//! 4. Block in the backend exactly once
//! 5. Resolve readiness events to waiters
//! 6. Fire due timers (sleeps, cancel-scope deadlines)
//! 7. Wake `wait_all_tasks_blocked` callers if nothing else became runnable

use crate::io::backend::Multiplexer;
use crate::scheduler::state::Core;
use crate::{Error, Result};
use std::cell::RefCell;
use std::rc::Rc;
use std::task::{Context, Waker};
use std::time::Duration;

/// Drive the runtime until `output` holds the top-level task's result
pub(crate) fn drive<T>(core: &Rc<RefCell<Core>>, output: &RefCell<Option<T>>) -> Result<T> {
    loop {
        {
            let mut core = core.borrow_mut();
            core.tick += 1;
            core.instruments.before_tick(core.tick);
        }

        // 1. Run ready tasks
        run_ready_tasks(core);

        // 2. Top-level task done?
        if let Some(value) = output.borrow_mut().take() {
            let core = core.borrow();
            core.instruments.after_tick(core.tick);
            return Ok(value);
        }

        // 3. Blocking budget
        let timeout = core.borrow_mut().compute_timeout()?;

        // 4-5. Block once, dispatch events
        poll_io(&mut core.borrow_mut(), timeout)?;

        // 6-7. Timers and idle waiters
        let mut core = core.borrow_mut();
        core.fire_timers();
        core.wake_quiescent();
        core.instruments.after_tick(core.tick);
    }
}

/// Step each task that was ready at the start of the pass once; tasks
/// readied during the pass run next tick
fn run_ready_tasks(core: &Rc<RefCell<Core>>) {
    let batch = {
        let mut core = core.borrow_mut();
        core.drain_wakes();
        core.ready.len()
    };

    for _ in 0..batch {
        let Some((id, mut body, waker)) = core.borrow_mut().start_step() else {
            continue;
        };

        let waker = Waker::from(waker);
        let mut cx = Context::from_waker(&waker);
        let finished = body.as_mut().poll(&mut cx).is_ready();
        drop(waker);

        let retired = core.borrow_mut().end_step(id, body, finished);
        // Drop the finished body outside the borrow; its destructors may
        // call back into the runtime
        drop(retired);
    }
}

fn poll_io(core: &mut Core, timeout: Option<Duration>) -> Result<()> {
    let mut timeout = timeout;
    core.wake_queue.set_blocked(true);
    // A waker that fired before `blocked` was set would not signal the socket
    if !core.wake_queue.is_empty() {
        timeout = Some(Duration::ZERO);
    }

    core.instruments.before_io_wait(timeout);
    let mut events = std::mem::take(&mut core.events);
    let result = core.backend.block_and_report(timeout, &mut events);
    core.wake_queue.set_blocked(false);

    if let Err(e) = result {
        core.events = events;
        tracing::warn!(backend = core.backend.name(), error = %e, "backend wait failed");
        return Err(Error::Io(e));
    }

    core.instruments.after_io_wait(timeout, events.len());
    tracing::trace!(tick = core.tick, ?timeout, events = events.len(), "io wait finished");
    for event in events.drain(..) {
        core.dispatch_event(event);
    }
    core.events = events;
    Ok(())
}
