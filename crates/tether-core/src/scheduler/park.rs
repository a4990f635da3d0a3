//! Parks
//!
//! A park is one suspension of one task at one primitive. Its outcome is written
//! exactly once (`Ready`, `Cancelled` or `Closed`) and read back by the
//! [`Parked`] future that created it.

use crate::cancel::ScopeState;
use crate::io::Direction;
use crate::runtime;
use crate::scheduler::timer::TimerKey;
use crate::scheduler::TaskId;
use crate::{Error, Result};
use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::Instant;

/// Unique identifier for a park
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParkId(u64);

static NEXT_PARK_ID: AtomicU64 = AtomicU64::new(1);

impl ParkId {
    /// Generate a new unique ParkId
    pub fn new() -> Self {
        ParkId(NEXT_PARK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ParkId {
    fn default() -> Self {
        Self::new()
    }
}

/// How a park was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// The awaited condition happened
    Ready,
    /// An enclosing cancel scope was cancelled
    Cancelled,
    /// The descriptor was closed (`notify_closing`)
    Closed,
}

/// What a task asks to wait for
#[derive(Debug, Clone, Copy)]
pub(crate) enum ParkRequest {
    Io { fd: RawFd, direction: Direction },
    Sleep { deadline: Instant },
    Join { target: TaskId },
    Yield,
    Quiescent,
    Forever,
}

/// What a live park is waiting on; owns the matching bookkeeping
#[derive(Debug, Clone, Copy)]
pub(crate) enum ParkKind {
    Io { fd: RawFd, direction: Direction },
    Sleep { timer: TimerKey },
    Join { target: TaskId },
    Yield,
    Quiescent,
    Forever,
}

pub(crate) struct Park {
    pub task: TaskId,
    pub kind: ParkKind,
    /// Cancel scopes enclosing the wait when it started
    pub scopes: Vec<Rc<ScopeState>>,
    pub outcome: Option<Resume>,
    /// Waker to use instead of rescheduling the task directly, when the
    /// wait was polled through a combinator with its own waker
    pub waker: Option<Waker>,
}

impl Park {
    pub fn in_scope(&self, scope: &Rc<ScopeState>) -> bool {
        self.scopes.iter().any(|s| Rc::ptr_eq(s, scope))
    }
}

enum Stage {
    Init(ParkRequest),
    Armed { id: ParkId, request: ParkRequest },
    Done,
}

/// Future that parks the current task until its park is resolved
pub(crate) struct Parked {
    stage: Stage,
}

impl Parked {
    pub fn new(request: ParkRequest) -> Self {
        Self { stage: Stage::Init(request) }
    }
}

impl Future for Parked {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        match this.stage {
            Stage::Init(request) => {
                match runtime::with_core(|core| core.park(request, cx.waker())).and_then(|r| r) {
                    Ok(id) => {
                        this.stage = Stage::Armed { id, request };
                        Poll::Pending
                    }
                    Err(e) => {
                        this.stage = Stage::Done;
                        Poll::Ready(Err(e))
                    }
                }
            }
            Stage::Armed { id, request } => {
                match runtime::with_core(|core| core.take_outcome(id, cx.waker())) {
                    Ok(None) => Poll::Pending,
                    Ok(Some(resume)) => {
                        this.stage = Stage::Done;
                        Poll::Ready(outcome(resume, request))
                    }
                    Err(e) => {
                        this.stage = Stage::Done;
                        Poll::Ready(Err(e))
                    }
                }
            }
            Stage::Done => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for Parked {
    fn drop(&mut self) {
        if let Stage::Armed { id, .. } = self.stage {
            runtime::try_with_core(|core| core.abandon_park(id));
        }
    }
}

fn outcome(resume: Resume, request: ParkRequest) -> Result<()> {
    match resume {
        Resume::Ready => Ok(()),
        Resume::Cancelled => Err(Error::Cancelled),
        Resume::Closed => match request {
            ParkRequest::Io { fd, .. } => Err(Error::DescriptorClosed { fd }),
            _ => Err(Error::Cancelled),
        },
    }
}
