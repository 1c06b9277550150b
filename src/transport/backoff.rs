//! Doubling backoff counter for HTTP 429 responses.
//!
//! One [`Backoff`] lives on each [`Transport`](super::Transport) and is
//! shared by every request the client issues, so the counter damps the
//! aggregate call rate of the whole client against the server rather than
//! a single call site. Pure arithmetic, no I/O; the transport owns the
//! actual sleeping.

use std::sync::{Mutex, PoisonError};

/// Value the counter starts at and is reset to, in delay units.
pub const INITIAL_DELAY_UNITS: u64 = 1;

/// Give-up ceiling. A freshly doubled delay above this value means the
/// replay loop has already slept 2 + 4 + 8 + 16 + 32 = 62 units and
/// should abort instead of sleeping again.
pub const MAX_DELAY_UNITS: u64 = 32;

/// Total units slept before the ceiling fires.
pub const TOTAL_WAIT_UNITS: u64 = 62;

/// Shared doubling delay counter.
///
/// `next_delay()` doubles the counter and returns the new value, so the
/// first rate-limit signal yields 2 units, the next 4, and so on. Any
/// successful request resets the counter to [`INITIAL_DELAY_UNITS`], as
/// does giving up.
///
/// The counter sits behind a `Mutex` because the transport is shared by
/// reference across calls. The design assumes sequential use; concurrent
/// callers get correct arithmetic but imprecise damping.
#[derive(Debug)]
pub struct Backoff {
    wait: Mutex<u64>,
}

impl Backoff {
    /// Creates a counter at the initial delay.
    #[must_use]
    pub fn new() -> Self {
        Self {
            wait: Mutex::new(INITIAL_DELAY_UNITS),
        }
    }

    /// Doubles the counter and returns the new delay in units.
    pub fn next_delay(&self) -> u64 {
        let mut wait = self.wait.lock().unwrap_or_else(PoisonError::into_inner);
        *wait = wait.saturating_mul(2);
        *wait
    }

    /// Restores the counter to the initial delay.
    pub fn reset(&self) {
        let mut wait = self.wait.lock().unwrap_or_else(PoisonError::into_inner);
        *wait = INITIAL_DELAY_UNITS;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_strictly_double() {
        let backoff = Backoff::new();
        assert_eq!(backoff.next_delay(), 2);
        assert_eq!(backoff.next_delay(), 4);
        assert_eq!(backoff.next_delay(), 8);
        assert_eq!(backoff.next_delay(), 16);
        assert_eq!(backoff.next_delay(), 32);
    }

    #[test]
    fn test_sixth_delay_exceeds_ceiling() {
        let backoff = Backoff::new();
        let mut total = 0;
        for _ in 0..5 {
            let delay = backoff.next_delay();
            assert!(delay <= MAX_DELAY_UNITS);
            total += delay;
        }
        assert_eq!(total, TOTAL_WAIT_UNITS);
        // the sixth doubling crosses the ceiling and must trigger give-up
        assert!(backoff.next_delay() > MAX_DELAY_UNITS);
    }

    #[test]
    fn test_reset_restores_initial_delay() {
        let backoff = Backoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), 2, "first delay after reset is 2");
    }

    #[test]
    fn test_default_matches_new() {
        let backoff = Backoff::default();
        assert_eq!(backoff.next_delay(), 2);
    }
}
