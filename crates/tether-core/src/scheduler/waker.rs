//! Task wakers
//!
//! Wakers are `Send + Sync`. Waking pushes the task ID onto a lock-free queue
//! drained by the run loop; if the loop is blocked in the backend, one byte is
//! written to an internal socket pair whose read end the backend watches.

use crate::scheduler::TaskId;
use crossbeam::queue::SegQueue;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Wake;

pub(crate) struct WakeQueue {
    queue: SegQueue<TaskId>,
    /// The run loop is (about to be) blocked in the backend
    blocked: AtomicBool,
    signal: UnixStream,
}

/// Read end of the wakeup socket, owned by the run loop
pub(crate) struct WakeReceiver {
    socket: UnixStream,
}

pub(crate) fn channel() -> io::Result<(Arc<WakeQueue>, WakeReceiver)> {
    let (signal, socket) = UnixStream::pair()?;
    signal.set_nonblocking(true)?;
    socket.set_nonblocking(true)?;

    let queue = WakeQueue {
        queue: SegQueue::new(),
        blocked: AtomicBool::new(false),
        signal,
    };
    Ok((Arc::new(queue), WakeReceiver { socket }))
}

impl WakeQueue {
    pub fn push(&self, task: TaskId) {
        self.queue.push(task);
        if self.blocked.swap(false, Ordering::SeqCst) {
            // A full socket already holds a pending wakeup
            let _ = (&self.signal).write(&[1]);
        }
    }

    pub fn pop(&self) -> Option<TaskId> {
        self.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }
}

impl WakeReceiver {
    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Consume pending wakeup bytes
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = (&self.socket).read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}

pub(crate) struct TaskWaker {
    task: TaskId,
    queue: Arc<WakeQueue>,
}

impl TaskWaker {
    pub fn new(task: TaskId, queue: Arc<WakeQueue>) -> Arc<Self> {
        Arc::new(Self { task, queue })
    }
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.queue.push(self.task);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.queue.push(self.task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Waker;

    #[test]
    fn test_wake_pushes_task() {
        let (queue, _receiver) = channel().unwrap();
        let task = TaskId::new();
        let waker = Waker::from(TaskWaker::new(task, queue.clone()));

        waker.wake_by_ref();
        waker.wake();
        assert_eq!(queue.pop(), Some(task));
        assert_eq!(queue.pop(), Some(task));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_wake_while_blocked_signals_socket() {
        let (queue, receiver) = channel().unwrap();
        let task = TaskId::new();
        queue.set_blocked(true);

        std::thread::spawn({
            let queue = queue.clone();
            move || queue.push(task)
        })
        .join()
        .unwrap();

        let mut buf = [0u8; 8];
        assert_eq!((&receiver.socket).read(&mut buf).unwrap(), 1);
        // Only the first wake per block writes
        queue.push(task);
        receiver.drain();
        assert!((&receiver.socket).read(&mut buf).is_err());
    }
}
