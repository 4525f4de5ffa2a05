//! Cooperative cancellation for long-running gear work.

use std::sync::atomic::{AtomicBool, Ordering};

/// Set once when a chain is shutting down. Loops that can run for a long
/// time check it at every iteration and persist their progress before
/// returning early.
#[derive(Debug, Default)]
pub struct Halter {
    halted: AtomicBool,
}

impl Halter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
    }

    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halt() {
        let halter = Halter::new();
        assert!(!halter.halted());
        halter.halt();
        assert!(halter.halted());
    }
}
