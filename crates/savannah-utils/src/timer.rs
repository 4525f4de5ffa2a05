//! Elapsed-time helpers.

use std::time::{Duration, Instant};

/// Measures time since it was started.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.start
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Restarts the timer, returning the time elapsed so far.
    pub fn reset(&mut self) -> Duration {
        let elapsed = self.elapsed();
        self.start = Instant::now();
        elapsed
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::start()
    }
}

/// Estimates the time remaining for a job that has done `progress` units
/// of `end` in `elapsed`, rounded to whole seconds.
///
/// Returns zero when no progress has been made yet or the work is done.
#[must_use]
pub fn estimate_eta(elapsed: Duration, progress: u64, end: u64) -> Duration {
    if progress == 0 || progress >= end {
        return Duration::ZERO;
    }
    let total = elapsed.as_secs_f64() * end as f64 / progress as f64;
    let remaining = (total - elapsed.as_secs_f64()).max(0.0);
    Duration::from_secs(remaining.round() as u64)
}
