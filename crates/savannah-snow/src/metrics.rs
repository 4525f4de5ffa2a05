//! Counters exported through health checks.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Bootstrap progress counters, shared by a bootstrapper and its jobs.
#[derive(Debug, Default)]
pub struct BootstrapMetrics {
    pub fetched: AtomicU64,
    pub accepted: AtomicU64,
    pub dropped: AtomicU64,
    pub restarts: AtomicU64,
    pub fetch_eta_secs: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BootstrapSnapshot {
    pub fetched: u64,
    pub accepted: u64,
    pub dropped: u64,
    pub restarts: u64,
    pub fetch_eta_secs: u64,
}

impl BootstrapMetrics {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> BootstrapSnapshot {
        BootstrapSnapshot {
            fetched: self.fetched.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            fetch_eta_secs: self.fetch_eta_secs.load(Ordering::Relaxed),
        }
    }
}

/// Normal-operation counters.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub polls_successful: AtomicU64,
    pub polls_failed: AtomicU64,
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineSnapshot {
    pub polls_successful: u64,
    pub polls_failed: u64,
    pub accepted: u64,
    pub rejected: u64,
}

impl EngineMetrics {
    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            polls_successful: self.polls_successful.load(Ordering::Relaxed),
            polls_failed: self.polls_failed.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}
