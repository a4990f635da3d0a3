//! Cancel scopes
//!
//! A [`CancelScope`] wraps a future. Cancelling the scope, explicitly or when its
//! deadline passes, resolves every wait started inside it with
//! [`Error::Cancelled`] and makes every later wait in it fail immediately. The
//! scope absorbs its own cancellation: [`CancelScope::run`] returns `Ok(None)`.
//!
//! Scopes are per task: a task spawned inside a scope does not inherit it.

use crate::runtime;
use crate::scheduler::park::{ParkRequest, Parked};
use crate::scheduler::timer::TimerKey;
use crate::time;
use crate::{Error, Result};
use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Why a scope was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// `CancelScope::cancel` was called
    Explicit,
    /// The scope's deadline passed
    Deadline,
}

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct ScopeState {
    pub id: u64,
    pub reason: Cell<Option<CancelReason>>,
    pub deadline: Cell<Option<Instant>>,
    /// Queued deadline timer
    pub timer: Cell<Option<TimerKey>>,
    /// First poll happened (deadline armed)
    pub entered: Cell<bool>,
    /// `run` swallowed its own cancellation
    pub caught: Cell<bool>,
}

impl ScopeState {
    pub fn is_cancelled(&self) -> bool {
        self.reason.get().is_some()
    }
}

/// Cancellation boundary with an optional deadline
#[derive(Clone)]
pub struct CancelScope {
    state: Rc<ScopeState>,
}

impl CancelScope {
    /// Scope without a deadline
    pub fn new() -> Self {
        Self {
            state: Rc::new(ScopeState {
                id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
                reason: Cell::new(None),
                deadline: Cell::new(None),
                timer: Cell::new(None),
                entered: Cell::new(false),
                caught: Cell::new(false),
            }),
        }
    }

    /// Scope cancelled automatically at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        let scope = Self::new();
        scope.state.deadline.set(Some(deadline));
        scope
    }

    /// Scope cancelled automatically `timeout` from now (runtime clock).
    ///
    /// A timeout past the clock's range leaves the scope without a deadline.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        Ok(match time::current_time()?.checked_add(timeout) {
            Some(deadline) => Self::with_deadline(deadline),
            None => Self::new(),
        })
    }

    /// Cancel the scope; parked waits inside it resume with `Cancelled`
    pub fn cancel(&self) {
        let cancelled = runtime::try_with_core(|core| core.cancel_scope(&self.state, CancelReason::Explicit));
        if cancelled.is_none() && !self.state.is_cancelled() {
            self.state.reason.set(Some(CancelReason::Explicit));
        }
    }

    /// Cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Why the scope was cancelled, if it was
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.state.reason.get()
    }

    /// `run` returned `None` because of this scope's cancellation
    pub fn cancelled_caught(&self) -> bool {
        self.state.caught.get()
    }

    /// Current deadline
    pub fn deadline(&self) -> Option<Instant> {
        self.state.deadline.get()
    }

    /// Move (or clear) the deadline; takes effect immediately for a running scope
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.state.deadline.set(deadline);
        if self.state.entered.get() {
            runtime::try_with_core(|core| core.arm_scope_deadline(&self.state));
        }
    }

    /// Run `future` inside the scope.
    ///
    /// Returns `Ok(None)` if the future failed with `Cancelled` because this
    /// scope was cancelled; other errors pass through.
    pub fn run<F, T>(&self, future: F) -> Scoped<F>
    where
        F: Future<Output = Result<T>>,
    {
        Scoped {
            state: self.state.clone(),
            future: Box::pin(future),
            done: false,
        }
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelScope")
            .field("id", &self.state.id)
            .field("cancelled", &self.state.reason.get())
            .field("deadline", &self.state.deadline.get())
            .finish()
    }
}

/// Future returned by [`CancelScope::run`]
pub struct Scoped<F> {
    state: Rc<ScopeState>,
    future: Pin<Box<F>>,
    done: bool,
}

impl<F, T> Future for Scoped<F>
where
    F: Future<Output = Result<T>>,
{
    type Output = Result<Option<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(Ok(None));
        }
        if let Err(e) = runtime::with_core(|core| core.enter_scope(&this.state)).and_then(|r| r) {
            this.done = true;
            return Poll::Ready(Err(e));
        }

        let poll = this.future.as_mut().poll(cx);
        let _ = runtime::with_core(|core| core.exit_scope(&this.state));

        let Poll::Ready(result) = poll else {
            return Poll::Pending;
        };
        this.done = true;
        let _ = runtime::with_core(|core| core.disarm_scope_deadline(&this.state));

        Poll::Ready(match result {
            Ok(value) => Ok(Some(value)),
            Err(Error::Cancelled) if this.state.is_cancelled() => {
                this.state.caught.set(true);
                Ok(None)
            }
            Err(e) => Err(e),
        })
    }
}

impl<F> Drop for Scoped<F> {
    fn drop(&mut self) {
        if !self.done {
            runtime::try_with_core(|core| core.disarm_scope_deadline(&self.state));
        }
    }
}

/// Run `future`, giving up (returning `Ok(None)`) after `timeout`
pub async fn move_on_after<F, T>(timeout: Duration, future: F) -> Result<Option<T>>
where
    F: Future<Output = Result<T>>,
{
    CancelScope::with_timeout(timeout)?.run(future).await
}

/// Run `future`, giving up (returning `Ok(None)`) at `deadline`
pub async fn move_on_at<F, T>(deadline: Instant, future: F) -> Result<Option<T>>
where
    F: Future<Output = Result<T>>,
{
    CancelScope::with_deadline(deadline).run(future).await
}

/// Run `future`, failing with `TooSlow` after `timeout`
pub async fn fail_after<F, T>(timeout: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let scope = CancelScope::with_timeout(timeout)?;
    expect_in_time(&scope, scope.run(future).await)
}

/// Run `future`, failing with `TooSlow` at `deadline`
pub async fn fail_at<F, T>(deadline: Instant, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let scope = CancelScope::with_deadline(deadline);
    expect_in_time(&scope, scope.run(future).await)
}

fn expect_in_time<T>(scope: &CancelScope, result: Result<Option<T>>) -> Result<T> {
    match result? {
        Some(value) => Ok(value),
        None if scope.cancel_reason() == Some(CancelReason::Deadline) => Err(Error::TooSlow),
        None => Err(Error::Cancelled),
    }
}

/// Yield to the scheduler, failing with `Cancelled` if an enclosing scope
/// has been cancelled
pub async fn checkpoint() -> Result<()> {
    Parked::new(ParkRequest::Yield).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_outside_runtime_marks_scope() {
        let scope = CancelScope::new();
        assert!(!scope.is_cancelled());
        scope.cancel();
        assert!(scope.is_cancelled());
        assert_eq!(scope.cancel_reason(), Some(CancelReason::Explicit));
        assert!(!scope.cancelled_caught());
    }

    #[test]
    fn test_with_deadline() {
        let deadline = Instant::now() + Duration::from_secs(5);
        let scope = CancelScope::with_deadline(deadline);
        assert_eq!(scope.deadline(), Some(deadline));
        scope.set_deadline(None);
        assert_eq!(scope.deadline(), None);
    }

    #[test]
    fn test_with_timeout_needs_runtime() {
        assert!(matches!(CancelScope::with_timeout(Duration::from_secs(1)), Err(Error::NoRuntime)));
    }
}
