//! State sync for linear chains.
//!
//! When the VM supports it, a chain first asks a sample of beacons for the
//! latest state summary they would serve. The candidates are parsed by the
//! VM and put to a vote among all beacons; the summary backed by the most
//! beacon weight, at least `alpha`, is handed to the VM. Bootstrapping then
//! fetches only the blocks above it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use savannah_ids::{Id, NodeId};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::common::{CommonConfig, Engine, OnFinished};
use crate::context::ChainState;
use crate::message::VmMessage;
use crate::vm::{ChainVm, StateSummaryRef};
use crate::Result;

/// Collaborators of a state syncer.
pub struct Config {
    pub common: CommonConfig,
    pub vm: Arc<dyn ChainVm>,
}

struct Candidate {
    summary: StateSummaryRef,
    weight: u64,
}

pub struct StateSyncer {
    config: CommonConfig,
    vm: Arc<dyn ChainVm>,
    on_finished: OnFinished,
    request_id: u32,
    enabled: bool,
    started: bool,
    /// Set while the VM applies the accepted summary
    syncing: bool,

    pending_frontier: BTreeSet<NodeId>,
    failed_frontier: BTreeSet<NodeId>,
    candidates: BTreeMap<Id, Candidate>,

    pending_votes: BTreeSet<NodeId>,
    failed_votes: BTreeSet<NodeId>,
}

impl StateSyncer {
    pub fn new(config: Config, on_finished: OnFinished) -> Self {
        Self {
            config: config.common,
            vm: config.vm,
            on_finished,
            request_id: 0,
            enabled: false,
            started: false,
            syncing: false,
            pending_frontier: BTreeSet::new(),
            failed_frontier: BTreeSet::new(),
            candidates: BTreeMap::new(),
            pending_votes: BTreeSet::new(),
            failed_votes: BTreeSet::new(),
        }
    }

    /// Summaries still in the running.
    pub fn num_candidates(&self) -> usize {
        self.candidates.len()
    }

    fn next_request_id(&mut self) -> u32 {
        self.request_id = self.request_id.wrapping_add(1);
        self.request_id
    }

    fn start_sync(&mut self) -> Result<()> {
        self.started = true;
        self.pending_frontier.clear();
        self.failed_frontier.clear();
        self.candidates.clear();
        self.pending_votes.clear();
        self.failed_votes.clear();

        let beacons = Arc::clone(&self.config.beacons);
        if beacons.is_empty() {
            info!(chain_id = %self.config.ctx.chain_id, "state sync skipped, no beacons");
            return self.finish();
        }

        let sampled: BTreeSet<NodeId> = beacons
            .sample(self.config.sample_k.max(1))?
            .into_iter()
            .collect();
        let request_id = self.next_request_id();
        debug!(num_beacons = sampled.len(), request_id, "requesting state summary frontiers");
        self.config.sender.send_get_state_summary_frontier(&sampled, request_id);
        self.pending_frontier = sampled;
        Ok(())
    }

    /// Puts the candidates to a vote once every sampled beacon answered.
    fn check_frontier(&mut self) -> Result<()> {
        if !self.pending_frontier.is_empty() {
            return Ok(());
        }
        if self.candidates.is_empty() {
            info!(
                num_failed = self.failed_frontier.len(),
                "no state summary offered, falling back to bootstrapping"
            );
            return self.finish();
        }

        let heights: Vec<u64> = self
            .candidates
            .values()
            .map(|candidate| candidate.summary.height())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let beacons: BTreeSet<NodeId> = self.config.beacons.node_ids().into_iter().collect();
        debug!(
            num_candidates = self.candidates.len(),
            num_beacons = beacons.len(),
            "requesting votes on state summaries"
        );
        self.config
            .sender
            .send_get_accepted_state_summary(&beacons, self.request_id, &heights);
        self.pending_votes = beacons;
        Ok(())
    }

    /// Accepts the winning summary once every beacon voted.
    fn check_votes(&mut self) -> Result<()> {
        if !self.pending_votes.is_empty() {
            return Ok(());
        }

        let alpha = self.config.alpha;
        let winner = self
            .candidates
            .values()
            .filter(|candidate| candidate.weight >= alpha)
            .max_by_key(|candidate| (candidate.weight, candidate.summary.height()))
            .map(|candidate| Arc::clone(&candidate.summary));
        self.candidates.clear();

        let Some(summary) = winner else {
            info!(
                alpha,
                num_failed = self.failed_votes.len(),
                "no state summary reached alpha, falling back to bootstrapping"
            );
            return self.finish();
        };

        info!(
            summary_id = %summary.id(),
            height = summary.height(),
            "accepting state summary"
        );
        if summary.accept()? {
            self.syncing = true;
            return Ok(());
        }
        debug!(summary_id = %summary.id(), "vm skipped state summary");
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        self.syncing = false;
        (self.on_finished)(self.request_id)
    }
}

impl Engine for StateSyncer {
    fn gear(&self) -> &'static str {
        "state_syncer"
    }

    fn start(&mut self, request_id: u32) -> Result<()> {
        self.request_id = request_id;
        self.enabled = self.vm.state_sync_enabled()?;
        if !self.enabled {
            debug!(chain_id = %self.config.ctx.chain_id, "state sync disabled");
            return self.finish();
        }

        info!(chain_id = %self.config.ctx.chain_id, "starting state sync");
        self.config.ctx.set_state(ChainState::StateSyncing)?;
        self.vm.set_state(ChainState::StateSyncing)?;
        if !self.config.startup_tracker.should_start() {
            return Ok(());
        }
        self.start_sync()
    }

    fn state_summary_frontier(
        &mut self,
        node_id: NodeId,
        request_id: u32,
        summary: Vec<u8>,
    ) -> Result<()> {
        if request_id != self.request_id || !self.pending_frontier.remove(&node_id) {
            debug!(%node_id, request_id, "received unexpected StateSummaryFrontier");
            return Ok(());
        }
        match self.vm.parse_state_summary(&summary) {
            Ok(summary) => {
                self.candidates.entry(summary.id()).or_insert(Candidate {
                    summary,
                    weight: 0,
                });
            }
            Err(err) => {
                debug!(%node_id, request_id, error = %err, "failed to parse state summary");
                self.failed_frontier.insert(node_id);
            }
        }
        self.check_frontier()
    }

    fn get_state_summary_frontier_failed(&mut self, node_id: NodeId, request_id: u32) -> Result<()> {
        if request_id != self.request_id || !self.pending_frontier.remove(&node_id) {
            debug!(%node_id, request_id, "unexpectedly called GetStateSummaryFrontierFailed");
            return Ok(());
        }
        self.failed_frontier.insert(node_id);
        self.check_frontier()
    }

    fn accepted_state_summary(
        &mut self,
        node_id: NodeId,
        request_id: u32,
        summary_ids: Vec<Id>,
    ) -> Result<()> {
        if request_id != self.request_id || !self.pending_votes.remove(&node_id) {
            debug!(%node_id, request_id, "received unexpected AcceptedStateSummary");
            return Ok(());
        }
        let weight = self.config.beacons.get_weight(&node_id);
        for summary_id in summary_ids.into_iter().collect::<BTreeSet<_>>() {
            if let Some(candidate) = self.candidates.get_mut(&summary_id) {
                candidate.weight = candidate.weight.saturating_add(weight);
            }
        }
        self.check_votes()
    }

    fn get_accepted_state_summary_failed(&mut self, node_id: NodeId, request_id: u32) -> Result<()> {
        if request_id != self.request_id || !self.pending_votes.remove(&node_id) {
            debug!(%node_id, request_id, "unexpectedly called GetAcceptedStateSummaryFailed");
            return Ok(());
        }
        self.failed_votes.insert(node_id);
        self.check_votes()
    }

    fn connected(&mut self, _node_id: NodeId) -> Result<()> {
        if !self.enabled || self.started || !self.config.startup_tracker.should_start() {
            return Ok(());
        }
        self.start_sync()
    }

    fn notify(&mut self, msg: VmMessage) -> Result<()> {
        match msg {
            VmMessage::StateSyncDone if self.syncing => {
                info!(chain_id = %self.config.ctx.chain_id, "state sync done");
                self.finish()
            }
            msg => {
                warn!(?msg, "unexpected vm notification while state syncing");
                Ok(())
            }
        }
    }

    fn health_check(&self) -> Result<serde_json::Value> {
        let vm = self.vm.health_check()?;
        Ok(json!({
            "consensus": {
                "state_sync_enabled": self.enabled,
                "candidates": self.candidates.len(),
                "pending_frontiers": self.pending_frontier.len(),
                "pending_votes": self.pending_votes.len(),
                "applying_summary": self.syncing,
            },
            "vm": vm,
        }))
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::common::BootstrapConfig;
    use crate::testing::{node, test_env, SentMessage, TestBlock, TestEnv, TestSummary, TestVm};
    use crate::validators::Connector;
    use crate::vm::StateSummary;

    struct Harness {
        syncer: StateSyncer,
        env: TestEnv,
        vm: Arc<TestVm>,
        finished: Arc<Mutex<Vec<u32>>>,
    }

    fn harness(beacons: &[(NodeId, u64)]) -> Harness {
        let env = test_env(beacons, BootstrapConfig::default());
        let vm = Arc::new(TestVm::new(TestBlock::genesis()));
        let finished = Arc::new(Mutex::new(Vec::new()));
        let on_finished: OnFinished = {
            let finished = Arc::clone(&finished);
            Box::new(move |request_id| {
                finished.lock().push(request_id);
                Ok(())
            })
        };
        let syncer = StateSyncer::new(
            Config {
                common: env.config.clone(),
                vm: vm.clone(),
            },
            on_finished,
        );
        Harness {
            syncer,
            env,
            vm,
            finished,
        }
    }

    fn three_beacons() -> Harness {
        let h = harness(&[(node(1), 1), (node(2), 1), (node(3), 1)]);
        h.vm.enable_state_sync();
        for byte in 1..=3 {
            h.env.config.startup_tracker.connected(node(byte)).unwrap();
        }
        h
    }

    #[test]
    fn test_disabled_finishes_immediately() {
        let mut h = harness(&[(node(1), 1)]);
        h.syncer.start(7).unwrap();
        assert_eq!(*h.finished.lock(), vec![7]);
        assert!(h.env.sender.take().is_empty());
        assert_eq!(h.env.config.ctx.state(), ChainState::Initializing);
    }

    #[test]
    fn test_accepts_summary_backed_by_alpha() {
        let mut h = three_beacons();
        let (low, high) = (TestSummary::new(10), TestSummary::new(20));
        h.vm.add_summary(low.clone());
        h.vm.add_summary(high.clone());

        h.syncer.start(0).unwrap();
        assert_eq!(h.env.config.ctx.state(), ChainState::StateSyncing);
        assert_eq!(
            h.env.sender.take(),
            vec![SentMessage::GetStateSummaryFrontier {
                node_ids: vec![node(1), node(2), node(3)],
                request_id: 1,
            }]
        );

        h.syncer.state_summary_frontier(node(1), 1, low.bytes()).unwrap();
        h.syncer.state_summary_frontier(node(2), 1, high.bytes()).unwrap();
        h.syncer.get_state_summary_frontier_failed(node(3), 1).unwrap();
        assert_eq!(
            h.env.sender.take(),
            vec![SentMessage::GetAcceptedStateSummary {
                node_ids: vec![node(1), node(2), node(3)],
                request_id: 1,
                heights: vec![10, 20],
            }]
        );

        // alpha is 2 of 3; only the low summary reaches it
        h.syncer.accepted_state_summary(node(1), 1, vec![low.id(), high.id()]).unwrap();
        h.syncer.accepted_state_summary(node(2), 1, vec![low.id()]).unwrap();
        h.syncer.get_accepted_state_summary_failed(node(3), 1).unwrap();
        assert!(low.was_accepted());
        assert!(!high.was_accepted());
        assert!(h.finished.lock().is_empty());

        h.syncer.notify(VmMessage::StateSyncDone).unwrap();
        assert_eq!(*h.finished.lock(), vec![1]);
    }

    #[test]
    fn test_no_quorum_falls_back() {
        let mut h = three_beacons();
        let summary = TestSummary::new(10);
        h.vm.add_summary(summary.clone());
        h.syncer.start(0).unwrap();
        h.env.sender.take();

        for byte in 1..=3 {
            h.syncer.state_summary_frontier(node(byte), 1, summary.bytes()).unwrap();
        }
        h.syncer.accepted_state_summary(node(1), 1, vec![summary.id()]).unwrap();
        h.syncer.accepted_state_summary(node(2), 1, vec![]).unwrap();
        h.syncer.accepted_state_summary(node(3), 1, vec![]).unwrap();
        assert!(!summary.was_accepted());
        assert_eq!(*h.finished.lock(), vec![1]);
    }

    #[test]
    fn test_unparseable_frontiers_fall_back() {
        let mut h = three_beacons();
        h.syncer.start(0).unwrap();
        h.env.sender.take();
        for byte in 1..=3 {
            h.syncer.state_summary_frontier(node(byte), 1, vec![byte]).unwrap();
        }
        assert!(h.env.sender.take().is_empty());
        assert_eq!(*h.finished.lock(), vec![1]);
    }

    #[test]
    fn test_waits_for_startup_weight() {
        let mut h = harness(&[(node(1), 1), (node(2), 1)]);
        h.vm.enable_state_sync();
        h.syncer.start(0).unwrap();
        assert!(h.env.sender.take().is_empty());

        for byte in 1..=2 {
            h.env.config.startup_tracker.connected(node(byte)).unwrap();
            h.syncer.connected(node(byte)).unwrap();
        }
        let sent = h.env.sender.take();
        assert!(matches!(&sent[..], [SentMessage::GetStateSummaryFrontier { request_id: 1, .. }]));

        // stale and duplicate answers are ignored
        h.syncer.state_summary_frontier(node(1), 9, vec![]).unwrap();
        h.syncer.accepted_state_summary(node(1), 1, vec![]).unwrap();
        assert!(h.finished.lock().is_empty());
    }
}
