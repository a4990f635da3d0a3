//! Sleeping and reading the runtime clock

use crate::runtime;
use crate::scheduler::park::{ParkRequest, Parked};
use crate::Result;
use std::time::{Duration, Instant};

/// Current time on the runtime's clock
pub fn current_time() -> Result<Instant> {
    runtime::with_core(|core| core.clock.current_time())
}

/// Sleep until `deadline` on the runtime's clock.
///
/// A deadline in the past still yields once.
pub async fn sleep_until(deadline: Instant) -> Result<()> {
    Parked::new(ParkRequest::Sleep { deadline }).await
}

/// Sleep for `duration`.
///
/// A duration too long to represent as a deadline sleeps until cancelled.
pub async fn sleep(duration: Duration) -> Result<()> {
    match current_time()?.checked_add(duration) {
        Some(deadline) => sleep_until(deadline).await,
        None => sleep_forever().await,
    }
}

/// Park until cancelled
pub async fn sleep_forever() -> Result<()> {
    Parked::new(ParkRequest::Forever).await
}
