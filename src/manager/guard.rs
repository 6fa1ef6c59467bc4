//! Single-flight guard for mutating lifecycle operations.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::types::{KeywardError, Result};

/// At most one holder at a time; contention fails fast instead of waiting.
#[derive(Debug, Default)]
pub struct SingleFlight {
    in_flight: AtomicBool,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the guard for `operation`, or fail with
    /// [`KeywardError::Multithread`] while another holder is active.
    pub fn try_acquire(&self, operation: &'static str) -> Result<FlightGuard<'_>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            warn!(operation, "Lifecycle operation rejected: another is in flight");
            return Err(KeywardError::Multithread);
        }
        Ok(FlightGuard { flight: self })
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Releases the guard on drop, on every exit path.
#[derive(Debug)]
pub struct FlightGuard<'a> {
    flight: &'a SingleFlight,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flight.in_flight.store(false, Ordering::Release);
    }
}
