//! Agreeing with the beacons on where bootstrapping should end.
//!
//! A sample of beacons is asked for its accepted frontier. The union of the
//! answers is then sent to every beacon, which replies with the subset it
//! has accepted. Containers reported accepted by at least `alpha` beacon
//! weight are what the bootstrapper must reach.

use std::collections::{BTreeMap, BTreeSet};

use savannah_ids::{Id, NodeId};
use tracing::{debug, info, warn};

use super::CommonConfig;
use crate::metrics::BootstrapMetrics;
use crate::Result;

/// Requests of one kind kept in flight at once.
const MAX_OUTSTANDING_BROADCAST_REQUESTS: usize = 50;

/// Where the frontier phase stands after handling a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontierOutcome {
    /// Still waiting on beacons.
    Pending,
    /// The beacons agreed on these accepted containers.
    Accepted(Vec<Id>),
}

/// The beacon frontier phase shared by both bootstrappers. Owns the chain's
/// request ID counter while bootstrapping.
pub struct Frontier {
    config: CommonConfig,
    request_id: u32,
    /// Set once bootstrapping restarted to catch a moving tip
    restarted: bool,
    /// Frontier rounds since the last reset
    attempts: usize,
    /// Restarts to catch up with a moving tip
    restarts: usize,
    /// Set while a round waits on beacon replies
    in_round: bool,

    sampled_weight: u64,
    pending_send_accepted_frontier: BTreeSet<NodeId>,
    pending_accepted_frontier: BTreeSet<NodeId>,
    failed_accepted_frontier: BTreeSet<NodeId>,
    accepted_frontier_set: BTreeSet<Id>,

    pending_send_accepted: BTreeSet<NodeId>,
    pending_accepted: BTreeSet<NodeId>,
    failed_accepted: BTreeSet<NodeId>,
    accepted_frontier: Vec<Id>,
    accepted_votes: BTreeMap<Id, u64>,
}

impl Frontier {
    pub fn new(config: CommonConfig) -> Self {
        Self {
            config,
            request_id: 0,
            restarted: false,
            attempts: 0,
            restarts: 0,
            in_round: false,
            sampled_weight: 0,
            pending_send_accepted_frontier: BTreeSet::new(),
            pending_accepted_frontier: BTreeSet::new(),
            failed_accepted_frontier: BTreeSet::new(),
            accepted_frontier_set: BTreeSet::new(),
            pending_send_accepted: BTreeSet::new(),
            pending_accepted: BTreeSet::new(),
            failed_accepted: BTreeSet::new(),
            accepted_frontier: Vec::new(),
            accepted_votes: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &CommonConfig {
        &self.config
    }

    /// The last request ID used.
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub fn set_request_id(&mut self, request_id: u32) {
        self.request_id = request_id;
    }

    pub fn next_request_id(&mut self) -> u32 {
        self.request_id = self.request_id.wrapping_add(1);
        self.request_id
    }

    pub fn restarted(&self) -> bool {
        self.restarted
    }

    pub fn restarts(&self) -> usize {
        self.restarts
    }

    /// Whether a round was started and the beacons have not yet agreed on a
    /// frontier. Bootstrapping must not finish in the meantime.
    pub fn in_round(&self) -> bool {
        self.in_round
    }

    /// Starts a new frontier round.
    pub fn startup(&mut self) -> Result<FrontierOutcome> {
        self.attempts += 1;
        self.in_round = false;
        self.sampled_weight = 0;
        self.pending_send_accepted_frontier.clear();
        self.pending_accepted_frontier.clear();
        self.failed_accepted_frontier.clear();
        self.accepted_frontier_set.clear();
        self.pending_send_accepted.clear();
        self.pending_accepted.clear();
        self.failed_accepted.clear();
        self.accepted_frontier.clear();
        self.accepted_votes.clear();

        let beacons = &self.config.beacons;
        if beacons.is_empty() {
            info!(chain_id = %self.config.ctx.chain_id, "bootstrapping skipped, no beacons");
            return Ok(FrontierOutcome::Accepted(Vec::new()));
        }

        let sampled: BTreeSet<NodeId> = beacons
            .sample(self.config.sample_k.max(1))?
            .into_iter()
            .collect();
        self.sampled_weight = sampled.iter().map(|node_id| beacons.get_weight(node_id)).sum();
        self.pending_send_accepted_frontier = sampled;
        self.pending_send_accepted = beacons.node_ids().into_iter().collect();

        self.in_round = true;
        self.next_request_id();
        self.send_get_accepted_frontiers();
        Ok(FrontierOutcome::Pending)
    }

    /// Starts over. `reset` marks a restart to catch a moving tip rather than
    /// a retry after beacons failed to answer.
    pub fn restart(&mut self, reset: bool) -> Result<FrontierOutcome> {
        if reset {
            debug!("checking for new frontiers");
            self.restarted = true;
            self.attempts = 0;
            self.restarts += 1;
            BootstrapMetrics::inc(&self.config.metrics.restarts);
        }
        let warn_frequency = self.config.bootstrap.retry_bootstrap_warn_frequency.max(1);
        if self.attempts > 0 && self.attempts % warn_frequency == 0 {
            warn!(
                attempts = self.attempts,
                "bootstrapping keeps failing, check the connection to the beacons"
            );
        }
        self.startup()
    }

    pub fn accepted_frontier(
        &mut self,
        node_id: NodeId,
        request_id: u32,
        container_ids: Vec<Id>,
    ) -> Result<FrontierOutcome> {
        if request_id != self.request_id || !self.pending_accepted_frontier.remove(&node_id) {
            debug!(%node_id, request_id, "received unexpected AcceptedFrontier");
            return Ok(FrontierOutcome::Pending);
        }
        self.accepted_frontier_set.extend(container_ids);

        self.send_get_accepted_frontiers();
        if !self.pending_send_accepted_frontier.is_empty()
            || !self.pending_accepted_frontier.is_empty()
        {
            return Ok(FrontierOutcome::Pending);
        }

        // The sampled beacons must keep alpha's share of the total weight.
        let total_weight = self.config.beacons.total_weight().max(1) as f64;
        let sampled_weight = self.sampled_weight as f64;
        let new_alpha = sampled_weight * self.config.alpha as f64 / total_weight;
        let failed_weight = self.subset_weight(&self.failed_accepted_frontier) as f64;
        if sampled_weight - new_alpha < failed_weight {
            if self.config.bootstrap.retry_bootstrap {
                debug!(failed_weight, "not enough frontiers received, retrying");
                return self.restart(false);
            }
            debug!(failed_weight, "didn't receive enough frontiers");
        }

        self.accepted_frontier = std::mem::take(&mut self.accepted_frontier_set)
            .into_iter()
            .collect();
        self.send_get_accepted();
        Ok(FrontierOutcome::Pending)
    }

    pub fn get_accepted_frontier_failed(
        &mut self,
        node_id: NodeId,
        request_id: u32,
    ) -> Result<FrontierOutcome> {
        if request_id == self.request_id && self.pending_accepted_frontier.contains(&node_id) {
            self.failed_accepted_frontier.insert(node_id);
        }
        self.accepted_frontier(node_id, request_id, Vec::new())
    }

    pub fn accepted(
        &mut self,
        node_id: NodeId,
        request_id: u32,
        container_ids: Vec<Id>,
    ) -> Result<FrontierOutcome> {
        if request_id != self.request_id || !self.pending_accepted.remove(&node_id) {
            debug!(%node_id, request_id, "received unexpected Accepted");
            return Ok(FrontierOutcome::Pending);
        }

        let weight = self.config.beacons.get_weight(&node_id);
        for container_id in container_ids {
            let votes = self.accepted_votes.entry(container_id).or_default();
            *votes = votes.saturating_add(weight);
        }

        self.send_get_accepted();
        if !self.pending_send_accepted.is_empty() || !self.pending_accepted.is_empty() {
            return Ok(FrontierOutcome::Pending);
        }

        let alpha = self.config.alpha;
        let accepted: Vec<Id> = self
            .accepted_votes
            .iter()
            .filter(|(_, weight)| **weight >= alpha)
            .map(|(id, _)| *id)
            .collect();

        if accepted.is_empty() && !self.config.beacons.is_empty() {
            // With no accepted votes at all, either the network is fresh or
            // too many beacons failed to answer.
            let failed_weight = self.subset_weight(&self.failed_accepted);
            let total_weight = self.config.beacons.total_weight();
            if self.config.bootstrap.retry_bootstrap
                && total_weight.saturating_sub(alpha) < failed_weight
            {
                debug!(failed_weight, "not enough accepted votes received, retrying");
                return self.restart(false);
            }
        }

        self.in_round = false;
        if self.restarted {
            debug!(num_accepted = accepted.len(), "bootstrapping started syncing");
        } else {
            info!(num_accepted = accepted.len(), "bootstrapping started syncing");
        }
        Ok(FrontierOutcome::Accepted(accepted))
    }

    pub fn get_accepted_failed(
        &mut self,
        node_id: NodeId,
        request_id: u32,
    ) -> Result<FrontierOutcome> {
        if request_id == self.request_id && self.pending_accepted.contains(&node_id) {
            self.failed_accepted.insert(node_id);
        }
        self.accepted(node_id, request_id, Vec::new())
    }

    fn subset_weight(&self, node_ids: &BTreeSet<NodeId>) -> u64 {
        node_ids
            .iter()
            .map(|node_id| self.config.beacons.get_weight(node_id))
            .fold(0u64, u64::saturating_add)
    }

    fn send_get_accepted_frontiers(&mut self) {
        let batch = take_batch(
            &mut self.pending_send_accepted_frontier,
            &mut self.pending_accepted_frontier,
        );
        if !batch.is_empty() {
            self.config.sender.send_get_accepted_frontier(&batch, self.request_id);
        }
    }

    fn send_get_accepted(&mut self) {
        let batch = take_batch(&mut self.pending_send_accepted, &mut self.pending_accepted);
        if !batch.is_empty() {
            debug!(
                num_sent = batch.len(),
                num_pending = self.pending_send_accepted.len(),
                "sent GetAccepted messages"
            );
            self.config.sender.send_get_accepted(&batch, self.request_id, &self.accepted_frontier);
        }
    }
}

/// Moves peers from `to_send` into `in_flight` while fewer than the
/// broadcast limit are in flight, returning the moved peers.
fn take_batch(to_send: &mut BTreeSet<NodeId>, in_flight: &mut BTreeSet<NodeId>) -> BTreeSet<NodeId> {
    let mut batch = BTreeSet::new();
    while in_flight.len() < MAX_OUTSTANDING_BROADCAST_REQUESTS {
        let Some(node_id) = to_send.pop_first() else {
            break;
        };
        in_flight.insert(node_id);
        batch.insert(node_id);
    }
    batch
}
