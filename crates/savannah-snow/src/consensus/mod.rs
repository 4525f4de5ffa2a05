//! Consensus protocols.

pub mod avalanche;
pub mod snowball;
pub mod snowman;

use std::time::Duration;

use savannah_ids::Id;
use serde::Serialize;

use crate::Parameters;

/// Containers decided by one consensus step, in the order they were decided.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decisions {
    pub accepted: Vec<Id>,
    pub rejected: Vec<Id>,
}

impl Decisions {
    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty() && self.rejected.is_empty()
    }

    pub fn extend(&mut self, other: Decisions) {
        self.accepted.extend(other.accepted);
        self.rejected.extend(other.rejected);
    }
}

/// Liveness summary of a consensus instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub processing: usize,
    pub longest_processing_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl HealthReport {
    pub(crate) fn new(params: &Parameters, processing: usize, longest: Duration) -> Self {
        let reason = if processing > params.max_outstanding_items {
            Some(format!(
                "{processing} items processing, more than {}",
                params.max_outstanding_items
            ))
        } else if longest > params.max_item_processing_time {
            Some(format!(
                "item processing for {longest:?}, longer than {:?}",
                params.max_item_processing_time
            ))
        } else {
            None
        };
        Self {
            healthy: reason.is_none(),
            processing,
            longest_processing_ms: longest.as_millis() as u64,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_report() {
        let params = Parameters::default();
        assert!(HealthReport::new(&params, 1, Duration::from_secs(1)).healthy);

        let report = HealthReport::new(&params, 2000, Duration::ZERO);
        assert!(!report.healthy);
        assert!(report.reason.unwrap().contains("2000"));

        assert!(!HealthReport::new(&params, 1, Duration::from_secs(600)).healthy);
    }
}
