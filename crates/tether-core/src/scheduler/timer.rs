//! Timer queue
//!
//! Deadlines for sleeping tasks and cancel scopes, earliest first. Cancelled
//! entries stay in the heap and are skipped when they reach the top, unless
//! they come to outnumber the live ones, in which case the heap is swept.

use crate::cancel::ScopeState;
use crate::scheduler::ParkId;
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Weak;
use std::time::Instant;

/// Dead entries tolerated on top of twice the live count before a sweep
const COMPACT_SLACK: usize = 64;

/// Handle to a queued timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TimerKey {
    deadline: Instant,
    seq: u64,
}

/// What happens when a timer fires
pub(crate) enum TimerKind {
    /// Resume a sleeping park
    Park(ParkId),
    /// Cancel a scope whose deadline passed
    Scope(Weak<ScopeState>),
}

/// Entry in the timer heap
struct TimerEntry {
    key: TimerKey,
}

// Reverse ordering for min-heap (earliest deadline first, then insertion order)
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .deadline
            .cmp(&self.key.deadline)
            .then_with(|| other.key.seq.cmp(&self.key.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for TimerEntry {}

#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    /// Live timers by sequence number
    live: FxHashMap<u64, TimerKind>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, deadline: Instant, kind: TimerKind) -> TimerKey {
        let key = TimerKey { deadline, seq: self.next_seq };
        self.next_seq += 1;
        self.heap.push(TimerEntry { key });
        self.live.insert(key.seq, kind);
        key
    }

    /// Remove a timer; returns false if it already fired or was cancelled
    pub fn cancel(&mut self, key: TimerKey) -> bool {
        if self.live.remove(&key.seq).is_none() {
            return false;
        }
        if self.heap.len() > 2 * self.live.len() + COMPACT_SLACK {
            let live = &self.live;
            self.heap.retain(|entry| live.contains_key(&entry.key.seq));
        }
        true
    }

    /// Earliest live deadline
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if self.live.contains_key(&top.key.seq) {
                return Some(top.key.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Remove and return every live timer due at `now`, earliest first
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.key.deadline > now {
                break;
            }
            let seq = top.key.seq;
            self.heap.pop();
            if let Some(kind) = self.live.remove(&seq) {
                due.push(kind);
            }
        }
        due
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    #[cfg(test)]
    fn heap_len(&self) -> usize {
        self.heap.len()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn park_ids(kinds: Vec<TimerKind>) -> Vec<ParkId> {
        kinds
            .into_iter()
            .filter_map(|k| match k {
                TimerKind::Park(id) => Some(id),
                TimerKind::Scope(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_pop_due_in_deadline_order() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        let (a, b, c) = (ParkId::new(), ParkId::new(), ParkId::new());
        timers.insert(now + Duration::from_millis(30), TimerKind::Park(c));
        timers.insert(now + Duration::from_millis(10), TimerKind::Park(a));
        timers.insert(now + Duration::from_millis(20), TimerKind::Park(b));

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(10)));
        assert_eq!(park_ids(timers.pop_due(now + Duration::from_millis(25))), vec![a, b]);
        assert_eq!(timers.len(), 1);
        assert!(timers.pop_due(now).is_empty());
    }

    #[test]
    fn test_same_deadline_fires_in_insertion_order() {
        let mut timers = TimerQueue::new();
        let deadline = Instant::now();
        let ids: Vec<ParkId> = (0..5).map(|_| ParkId::new()).collect();
        for id in &ids {
            timers.insert(deadline, TimerKind::Park(*id));
        }
        assert_eq!(park_ids(timers.pop_due(deadline)), ids);
    }

    #[test]
    fn test_cancelled_timer_skipped() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        let early = timers.insert(now, TimerKind::Park(ParkId::new()));
        let late_id = ParkId::new();
        timers.insert(now + Duration::from_secs(1), TimerKind::Park(late_id));

        assert!(timers.cancel(early));
        assert!(!timers.cancel(early));
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(1)));
        assert!(timers.pop_due(now).is_empty());
        assert_eq!(park_ids(timers.pop_due(now + Duration::from_secs(1))), vec![late_id]);
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn test_cancelled_timers_behind_live_one_are_swept() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        let sleeper = ParkId::new();
        timers.insert(now + Duration::from_secs(1), TimerKind::Park(sleeper));

        for _ in 0..100_000 {
            let key = timers.insert(now + Duration::from_secs(3600), TimerKind::Park(ParkId::new()));
            assert!(timers.cancel(key));
        }

        assert_eq!(timers.len(), 1);
        assert!(timers.heap_len() <= 2 + COMPACT_SLACK + 1, "heap holds {}", timers.heap_len());
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(1)));
        assert_eq!(park_ids(timers.pop_due(now + Duration::from_secs(3600))), vec![sleeper]);
        assert_eq!(timers.heap_len(), 0);
    }
}
