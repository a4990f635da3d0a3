//! Waiter registry
//!
//! Records which task is parked on each (descriptor, direction). At most one
//! waiter per pair; the registry makes no OS calls.

use crate::io::Direction;
use crate::scheduler::{ParkId, TaskId};
use crate::{Error, Result};
use rustc_hash::FxHashMap;
use std::os::unix::io::RawFd;
use std::time::Instant;

/// A task parked on one direction of one descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Waiter {
    /// Descriptor being waited on
    pub fd: RawFd,
    /// Direction being waited on
    pub direction: Direction,
    /// Parked task
    pub task: TaskId,
    /// The park that resumes the task
    pub park: ParkId,
    /// When the wait started
    pub armed_at: Instant,
}

/// Per-descriptor, per-direction waiter table
#[derive(Debug, Default)]
pub struct WaiterRegistry {
    waiters: FxHashMap<(RawFd, Direction), Waiter>,
}

impl WaiterRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a waiter.
    ///
    /// Fails with `DuplicateWaiter` if (fd, direction) already has one; the
    /// existing waiter is left untouched.
    pub fn register(&mut self, waiter: Waiter) -> Result<&Waiter> {
        use std::collections::hash_map::Entry;

        match self.waiters.entry((waiter.fd, waiter.direction)) {
            Entry::Occupied(_) => Err(Error::DuplicateWaiter {
                fd: waiter.fd,
                direction: waiter.direction,
            }),
            Entry::Vacant(slot) => Ok(slot.insert(waiter)),
        }
    }

    /// Take the waiter for a readiness event.
    ///
    /// Returns `None` when nobody waits, so repeated level-triggered reports
    /// for the same pair are absorbed.
    pub fn resolve(&mut self, fd: RawFd, direction: Direction) -> Option<Waiter> {
        self.waiters.remove(&(fd, direction))
    }

    /// Remove a waiter on cancellation or close
    pub fn remove(&mut self, fd: RawFd, direction: Direction) -> Option<Waiter> {
        self.waiters.remove(&(fd, direction))
    }

    /// Look up a waiter without removing it
    pub fn get(&self, fd: RawFd, direction: Direction) -> Option<&Waiter> {
        self.waiters.get(&(fd, direction))
    }

    /// Number of live waiters
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// True when nobody is waiting
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Number of live waiters in one direction
    pub fn count(&self, direction: Direction) -> usize {
        self.waiters.keys().filter(|(_, d)| *d == direction).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::HashSet;

    fn waiter(fd: RawFd, direction: Direction) -> Waiter {
        Waiter {
            fd,
            direction,
            task: TaskId::new(),
            park: ParkId::new(),
            armed_at: Instant::now(),
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = WaiterRegistry::new();
        let w = waiter(5, Direction::Read);
        let task = w.task;
        registry.register(w).unwrap();

        assert_eq!(registry.len(), 1);
        let resolved = registry.resolve(5, Direction::Read).unwrap();
        assert_eq!(resolved.task, task);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_waiter_rejected() {
        let mut registry = WaiterRegistry::new();
        let first = waiter(7, Direction::Write);
        let first_task = first.task;
        registry.register(first).unwrap();

        let err = registry.register(waiter(7, Direction::Write)).unwrap_err();
        assert!(matches!(
            err,
            Error::DuplicateWaiter { fd: 7, direction: Direction::Write }
        ));
        // Existing waiter survives
        assert_eq!(registry.get(7, Direction::Write).unwrap().task, first_task);
    }

    #[test]
    fn test_directions_are_independent() {
        let mut registry = WaiterRegistry::new();
        registry.register(waiter(3, Direction::Read)).unwrap();
        registry.register(waiter(3, Direction::Write)).unwrap();

        assert_eq!(registry.count(Direction::Read), 1);
        assert_eq!(registry.count(Direction::Write), 1);

        registry.remove(3, Direction::Read);
        assert!(registry.get(3, Direction::Read).is_none());
        assert!(registry.get(3, Direction::Write).is_some());
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let mut registry = WaiterRegistry::new();
        registry.register(waiter(9, Direction::Read)).unwrap();

        assert!(registry.resolve(9, Direction::Read).is_some());
        assert!(registry.resolve(9, Direction::Read).is_none());
        assert!(registry.resolve(9, Direction::Read).is_none());
        assert!(registry.remove(9, Direction::Read).is_none());
    }

    #[test]
    fn test_random_operations_keep_one_waiter_per_pair() {
        let mut rng = rand::thread_rng();
        let mut registry = WaiterRegistry::new();
        let mut model: HashSet<(RawFd, Direction)> = HashSet::new();

        for _ in 0..10_000 {
            let fd = rng.gen_range(0..8);
            let direction = if rng.gen_bool(0.5) { Direction::Read } else { Direction::Write };

            match rng.gen_range(0..3) {
                0 => {
                    let result = registry.register(waiter(fd, direction));
                    if model.insert((fd, direction)) {
                        assert!(result.is_ok());
                    } else {
                        assert!(matches!(result, Err(Error::DuplicateWaiter { .. })));
                    }
                }
                1 => {
                    let resolved = registry.resolve(fd, direction);
                    assert_eq!(resolved.is_some(), model.remove(&(fd, direction)));
                }
                _ => {
                    let removed = registry.remove(fd, direction);
                    assert_eq!(removed.is_some(), model.remove(&(fd, direction)));
                }
            }

            assert_eq!(registry.len(), model.len());
        }
    }
}
