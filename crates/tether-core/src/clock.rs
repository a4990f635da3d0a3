//! Clocks
//!
//! The run loop reads time and converts timer deadlines into blocking budgets
//! through a [`Clock`]. [`SystemClock`] is the default; [`MockClock`] lets tests
//! control time.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Time source for a runtime
pub trait Clock {
    /// Called once when a run starts
    fn start_clock(&self) {}

    /// Current time
    fn current_time(&self) -> Instant;

    /// How long the backend may block to reach `deadline`
    fn deadline_to_sleep_time(&self, deadline: Instant) -> Duration;
}

/// Monotonic OS clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn current_time(&self) -> Instant {
        Instant::now()
    }

    fn deadline_to_sleep_time(&self, deadline: Instant) -> Duration {
        deadline.saturating_duration_since(Instant::now())
    }
}

struct MockState {
    origin: Instant,
    offset: Cell<Duration>,
    autojump: Cell<bool>,
}

/// Clock that only moves when told to.
///
/// With autojump enabled, whenever the run loop would block waiting for a
/// timer the clock jumps straight to that timer's deadline instead. Clones
/// share the same time.
#[derive(Clone)]
pub struct MockClock {
    state: Rc<MockState>,
}

impl MockClock {
    /// Frozen clock starting at the current instant
    pub fn new() -> Self {
        Self {
            state: Rc::new(MockState {
                origin: Instant::now(),
                offset: Cell::new(Duration::ZERO),
                autojump: Cell::new(false),
            }),
        }
    }

    /// Frozen clock that jumps to the next timer whenever the loop is idle
    pub fn autojump() -> Self {
        let clock = Self::new();
        clock.set_autojump(true);
        clock
    }

    /// Enable or disable autojump
    pub fn set_autojump(&self, enabled: bool) {
        self.state.autojump.set(enabled);
    }

    /// Advance the clock
    pub fn jump(&self, by: Duration) {
        self.state.offset.set(self.state.offset.get() + by);
    }

    /// Time elapsed on this clock since it was created
    pub fn elapsed(&self) -> Duration {
        self.state.offset.get()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClock")
            .field("elapsed", &self.elapsed())
            .field("autojump", &self.state.autojump.get())
            .finish()
    }
}

impl Clock for MockClock {
    fn current_time(&self) -> Instant {
        self.state.origin + self.state.offset.get()
    }

    fn deadline_to_sleep_time(&self, deadline: Instant) -> Duration {
        let now = self.current_time();
        if deadline <= now {
            return Duration::ZERO;
        }
        if self.state.autojump.get() {
            self.jump(deadline - now);
            return Duration::ZERO;
        }
        // Only jump() moves time; wait for I/O or another task
        Duration::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_sleep_time() {
        let clock = SystemClock;
        let past = clock.current_time();
        assert_eq!(clock.deadline_to_sleep_time(past), Duration::ZERO);
        let later = clock.current_time() + Duration::from_secs(10);
        let sleep = clock.deadline_to_sleep_time(later);
        assert!(sleep > Duration::from_secs(9) && sleep <= Duration::from_secs(10));
    }

    #[test]
    fn test_mock_clock_jump() {
        let clock = MockClock::new();
        let start = clock.current_time();
        clock.jump(Duration::from_secs(3));
        assert_eq!(clock.current_time() - start, Duration::from_secs(3));
        assert_eq!(clock.clone().elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn test_mock_clock_autojump() {
        let clock = MockClock::new();
        let deadline = clock.current_time() + Duration::from_secs(60);
        assert_eq!(clock.deadline_to_sleep_time(deadline), Duration::MAX);

        clock.set_autojump(true);
        assert_eq!(clock.deadline_to_sleep_time(deadline), Duration::ZERO);
        assert_eq!(clock.current_time(), deadline);
    }
}
