//! Consensus parameters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConsensusError, Result};

/// Parameters for the Snow family of protocols.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    /// Sample size.
    pub k: usize,

    /// Votes needed for a poll to count as successful.
    pub alpha: usize,

    /// Consecutive successful polls needed to finalize an uncontested choice.
    pub beta_virtuous: usize,

    /// Consecutive successful polls needed to finalize a contested choice.
    pub beta_rogue: usize,

    /// Polls kept outstanding while anything is processing.
    pub concurrent_repolls: usize,

    /// Processing items beyond which new work is not built.
    pub optimal_processing: usize,

    /// Processing items beyond which the chain reports unhealthy.
    pub max_outstanding_items: usize,

    /// Age beyond which a processing item makes the chain unhealthy.
    #[serde(with = "duration_ms")]
    pub max_item_processing_time: Duration,

    /// How many of the `k` sampled validators receive the full container.
    pub mixed_query_num_push_vdr: usize,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 15,
            beta_virtuous: 15,
            beta_rogue: 20,
            concurrent_repolls: 4,
            optimal_processing: 50,
            max_outstanding_items: 1024,
            max_item_processing_time: Duration::from_secs(120),
            mixed_query_num_push_vdr: 10,
        }
    }
}

impl Parameters {
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(ConsensusError::InvalidParameters(msg));
        if self.k == 0 {
            return fail("k must be positive".into());
        }
        if self.alpha <= self.k / 2 {
            return fail(format!("alpha = {} must be > k/2 = {}", self.alpha, self.k / 2));
        }
        if self.alpha > self.k {
            return fail(format!("alpha = {} must be <= k = {}", self.alpha, self.k));
        }
        if self.beta_virtuous == 0 {
            return fail("beta_virtuous must be positive".into());
        }
        if self.beta_rogue < self.beta_virtuous {
            return fail(format!(
                "beta_rogue = {} must be >= beta_virtuous = {}",
                self.beta_rogue, self.beta_virtuous
            ));
        }
        if self.concurrent_repolls == 0 || self.concurrent_repolls > self.beta_rogue {
            return fail(format!(
                "concurrent_repolls = {} must be in [1, beta_rogue = {}]",
                self.concurrent_repolls, self.beta_rogue
            ));
        }
        if self.optimal_processing == 0 {
            return fail("optimal_processing must be positive".into());
        }
        if self.max_outstanding_items == 0 {
            return fail("max_outstanding_items must be positive".into());
        }
        if self.max_item_processing_time.is_zero() {
            return fail("max_item_processing_time must be positive".into());
        }
        if self.mixed_query_num_push_vdr > self.k {
            return fail(format!(
                "mixed_query_num_push_vdr = {} must be <= k = {}",
                self.mixed_query_num_push_vdr, self.k
            ));
        }
        Ok(())
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
