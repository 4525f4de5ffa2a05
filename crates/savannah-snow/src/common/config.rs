//! Bootstrap configuration and the collaborators shared by a chain's gears.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Halter, Sender, Timeouts};
use crate::context::ConsensusContext;
use crate::metrics::BootstrapMetrics;
use crate::parameters::duration_ms;
use crate::subnet::Subnet;
use crate::validators::{PeerTracker, StartupTracker, ValidatorSet};
use crate::{ConsensusError, Result};

/// Node-wide bootstrap options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Containers of an `Ancestors` response considered; the rest are ignored.
    pub ancestors_max_containers_received: usize,

    /// Containers put in an `Ancestors` response at most.
    pub ancestors_max_containers_sent: usize,

    /// Bytes put in an `Ancestors` response at most, counting a 4-byte
    /// length per container.
    pub ancestors_max_bytes_sent: usize,

    /// Time spent building an `Ancestors` response at most.
    #[serde(with = "duration_ms")]
    pub max_time_get_ancestors: Duration,

    /// Restart bootstrapping while each round keeps shrinking the work left.
    pub retry_bootstrap: bool,

    /// Restarts allowed before finishing with the current frontier.
    pub max_bootstrap_retries: usize,

    /// Frontier retries between warnings to the operator.
    pub retry_bootstrap_warn_frequency: usize,

    /// Wait before re-checking the frontier while the rest of the subnet
    /// bootstraps.
    #[serde(with = "duration_ms")]
    pub bootstrapping_delay: Duration,

    /// Beacons asked for their accepted frontier.
    pub sample_k: usize,

    /// Beacon weight that must call a container accepted. Defaults to a
    /// strict majority of the beacon weight.
    pub alpha: Option<u64>,

    /// Connected beacon weight needed before bootstrapping starts. Defaults
    /// to three quarters of the beacon weight.
    pub startup_alpha: Option<u64>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            ancestors_max_containers_received: 2000,
            ancestors_max_containers_sent: 2000,
            ancestors_max_bytes_sent: 2 * 1024 * 1024,
            max_time_get_ancestors: Duration::from_millis(50),
            retry_bootstrap: true,
            max_bootstrap_retries: 50,
            retry_bootstrap_warn_frequency: 50,
            bootstrapping_delay: Duration::from_secs(10),
            sample_k: 20,
            alpha: None,
            startup_alpha: None,
        }
    }
}

impl BootstrapConfig {
    /// # Errors
    ///
    /// Returns the first option that can never let bootstrapping progress.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(ConsensusError::InvalidParameters(msg.to_string()));
        if self.ancestors_max_containers_received == 0 {
            return fail("ancestors_max_containers_received must be positive");
        }
        if self.ancestors_max_containers_sent == 0 {
            return fail("ancestors_max_containers_sent must be positive");
        }
        if self.ancestors_max_bytes_sent == 0 {
            return fail("ancestors_max_bytes_sent must be positive");
        }
        if self.max_time_get_ancestors.is_zero() {
            return fail("max_time_get_ancestors must be positive");
        }
        if self.sample_k == 0 {
            return fail("sample_k must be positive");
        }
        if self.retry_bootstrap_warn_frequency == 0 {
            return fail("retry_bootstrap_warn_frequency must be positive");
        }
        Ok(())
    }

    pub fn beacon_alpha(&self, beacon_weight: u64) -> u64 {
        self.alpha.unwrap_or(beacon_weight / 2 + 1)
    }

    pub fn startup_weight(&self, beacon_weight: u64) -> u64 {
        self.startup_alpha
            .unwrap_or_else(|| beacon_weight.saturating_mul(3).saturating_add(3) / 4)
    }

    pub fn beacon_sample_k(&self, beacon_weight: u64) -> usize {
        let weight = usize::try_from(beacon_weight).unwrap_or(usize::MAX);
        self.sample_k.min(weight)
    }
}

/// Everything a state syncer, bootstrapper, or getter of one chain shares.
#[derive(Clone)]
pub struct CommonConfig {
    pub ctx: Arc<ConsensusContext>,
    pub beacons: Arc<ValidatorSet>,
    pub sample_k: usize,
    pub alpha: u64,
    pub startup_tracker: Arc<StartupTracker>,
    pub sender: Arc<dyn Sender>,
    pub subnet: Arc<Subnet>,
    pub timeouts: Arc<dyn Timeouts>,
    pub halter: Arc<Halter>,
    pub metrics: Arc<BootstrapMetrics>,
    pub bootstrap: BootstrapConfig,
}

impl CommonConfig {
    /// Derives the beacon thresholds from `beacons` and registers a fresh
    /// startup tracker with them.
    pub fn new(
        ctx: Arc<ConsensusContext>,
        beacons: Arc<ValidatorSet>,
        sender: Arc<dyn Sender>,
        subnet: Arc<Subnet>,
        timeouts: Arc<dyn Timeouts>,
        bootstrap: BootstrapConfig,
    ) -> Self {
        let weight = beacons.total_weight();
        let peers = Arc::new(PeerTracker::new());
        beacons.register_callback_listener(peers.clone());
        let startup_tracker = Arc::new(StartupTracker::new(peers, bootstrap.startup_weight(weight)));
        Self {
            ctx,
            sample_k: bootstrap.beacon_sample_k(weight),
            alpha: bootstrap.beacon_alpha(weight),
            beacons,
            startup_tracker,
            sender,
            subnet,
            timeouts,
            halter: Arc::new(Halter::new()),
            metrics: Arc::new(BootstrapMetrics::default()),
            bootstrap,
        }
    }
}
