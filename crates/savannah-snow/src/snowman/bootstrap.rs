//! Snowman bootstrapper.
//!
//! Fetches the blocks between the last accepted block and the frontier the
//! beacons agree on, queues each one as a job, and accepts them in height
//! order once nothing is missing. Progress is persisted in the job queue, so
//! a restarted node resumes from the last committed missing set.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use savannah_db::Database;
use savannah_ids::{Id, NodeId};
use savannah_utils::timer::{estimate_eta, Timer};
use serde_json::json;
use tracing::{debug, info};

use super::block_job::{BlockJob, BlockParser};
use crate::choices::Status;
use crate::codec::Codecs;
use crate::common::{
    CommonConfig, Engine, Frontier, FrontierOutcome, OnFinished, OutstandingRequests,
};
use crate::context::ChainState;
use crate::metrics::BootstrapMetrics;
use crate::queue::{JobsWithMissing, STATUS_UPDATE_FREQUENCY};
use crate::vm::{BlockRef, ChainVm};
use crate::{ConsensusError, Result};

/// Collaborators of a Snowman bootstrapper.
pub struct Config {
    pub common: CommonConfig,
    /// Namespace holding the block job queue
    pub db: Arc<dyn Database>,
    pub codecs: Arc<Codecs>,
    pub vm: Arc<dyn ChainVm>,
}

pub struct Bootstrapper {
    frontier: Frontier,
    blocked: JobsWithMissing,
    vm: Arc<dyn ChainVm>,
    on_finished: OnFinished,
    outstanding: OutstandingRequests,
    /// Peers without an outstanding request. A peer leaves the set while a
    /// request to it is in flight and after an empty `Ancestors` response.
    fetch_from: BTreeSet<NodeId>,
    started: bool,
    /// Greatest height of the blocks queued
    tip_height: u64,
    /// Height of the last accepted block when bootstrapping started
    starting_height: u64,
    /// Jobs queued when the current run started
    initially_fetched: u64,
    start_time: Timer,
    /// Blocks executed by the previous run
    executed_state_transitions: usize,
    awaiting_timeout: bool,
    /// Set once control was handed to the next gear
    finished: bool,
}

impl Bootstrapper {
    pub fn new(config: Config, on_finished: OnFinished) -> Result<Self> {
        let parser = Arc::new(BlockParser {
            vm: Arc::clone(&config.vm),
        });
        let blocked = JobsWithMissing::new(config.db, parser, config.codecs)?;
        Ok(Self {
            frontier: Frontier::new(config.common),
            blocked,
            vm: config.vm,
            on_finished,
            outstanding: OutstandingRequests::new(),
            fetch_from: BTreeSet::new(),
            started: false,
            tip_height: 0,
            starting_height: 0,
            initially_fetched: 0,
            start_time: Timer::start(),
            executed_state_transitions: usize::MAX,
            awaiting_timeout: false,
            finished: false,
        })
    }

    fn common(&self) -> &CommonConfig {
        self.frontier.config()
    }

    pub fn metrics(&self) -> &Arc<BootstrapMetrics> {
        &self.common().metrics
    }

    /// Blocks still to be fetched.
    pub fn missing_ids(&self) -> Vec<Id> {
        self.blocked.missing_ids()
    }

    /// Block jobs waiting to be executed.
    pub fn num_queued(&self) -> u64 {
        self.blocked.num_jobs()
    }

    /// Drops every queued job.
    pub fn clear(&mut self) -> Result<()> {
        self.blocked.clear()?;
        self.blocked.commit()
    }

    fn startup(&mut self) -> Result<()> {
        let outcome = self.frontier.startup()?;
        self.on_frontier(outcome)
    }

    fn restart(&mut self, reset: bool) -> Result<()> {
        let outcome = self.frontier.restart(reset)?;
        self.on_frontier(outcome)
    }

    fn on_frontier(&mut self, outcome: FrontierOutcome) -> Result<()> {
        match outcome {
            FrontierOutcome::Pending => Ok(()),
            FrontierOutcome::Accepted(accepted) => self.force_accepted(accepted),
        }
    }

    /// Fetches everything between the last accepted block and `accepted`,
    /// resuming whatever a previous run left missing.
    pub fn force_accepted(&mut self, accepted: Vec<Id>) -> Result<()> {
        let mut pending = self.blocked.missing_ids();
        self.fetch_from = self.common().startup_tracker.preferred_peers();
        debug!(
            num_pending_blocks = pending.len(),
            num_accepted_blocks = accepted.len(),
            "starting bootstrapping"
        );
        pending.extend(accepted);

        let mut to_process = Vec::with_capacity(pending.len());
        for block_id in pending {
            self.blocked.add_missing_id(block_id);
            match self.vm.get_block(&block_id) {
                Ok(block) => to_process.push(block),
                Err(err) if err.is_not_found() => self.fetch(block_id)?,
                Err(err) => return Err(err.into()),
            }
        }

        self.initially_fetched = self.blocked.num_jobs();
        self.start_time = Timer::start();

        let no_batch = HashMap::new();
        for block in to_process {
            self.process(block, &no_batch)?;
        }
        self.check_finish()
    }

    /// Requests `block_id` and its ancestors from a peer.
    fn fetch(&mut self, block_id: Id) -> Result<()> {
        if self.outstanding.contains(&block_id) {
            return Ok(());
        }
        match self.vm.get_block(&block_id) {
            Ok(_) => return self.check_finish(),
            Err(err) if !err.is_not_found() => return Err(err.into()),
            Err(_) => {}
        }

        if self.fetch_from.is_empty() {
            self.fetch_from = self.common().startup_tracker.preferred_peers();
        }
        let Some(node_id) = self.fetch_from.first().copied() else {
            return Err(ConsensusError::NoPeers(block_id));
        };

        // One outstanding request per peer.
        self.mark_unavailable(&node_id);

        let request_id = self.frontier.next_request_id();
        self.outstanding.add(node_id, request_id, block_id);
        self.common().sender.send_get_ancestors(node_id, request_id, block_id);
        Ok(())
    }

    /// Stops fetching from `node_id`, refilling the pool from the preferred
    /// peers once it runs dry.
    fn mark_unavailable(&mut self, node_id: &NodeId) {
        self.fetch_from.remove(node_id);
        if self.fetch_from.is_empty() {
            self.fetch_from = self.common().startup_tracker.preferred_peers();
        }
    }

    /// Walks from `block` down to the accepted frontier, queueing each block.
    /// Parents are looked up in `batch` first, then in the VM; the first
    /// parent found in neither is fetched.
    fn process(&mut self, block: BlockRef, batch: &HashMap<Id, BlockRef>) -> Result<()> {
        let mut block = block;
        loop {
            let block_id = block.id();
            if self.common().halter.halted() {
                // Resume from here after a restart.
                self.blocked.add_missing_id(block_id);
                return self.blocked.commit();
            }

            self.blocked.remove_missing_id(&block_id);

            let status = block.status();
            if status == Status::Rejected {
                return Err(ConsensusError::PreviouslyRejected(block_id));
            }

            let height = block.height();
            if status == Status::Accepted || height <= self.starting_height {
                self.blocked.commit()?;
                return self.check_finish();
            }
            self.tip_height = self.tip_height.max(height);

            let pushed = self.blocked.push(Box::new(BlockJob {
                block: Arc::clone(&block),
                vm: Arc::clone(&self.vm),
            }))?;
            if !pushed {
                // Reached a block queued earlier.
                self.blocked.commit()?;
                return self.check_finish();
            }

            BootstrapMetrics::inc(&self.common().metrics.fetched);
            self.log_fetch_progress();

            let parent_id = block.parent();
            if let Some(parent) = batch.get(&parent_id) {
                block = Arc::clone(parent);
                continue;
            }
            match self.vm.get_block(&parent_id) {
                Ok(parent) => {
                    block = parent;
                    continue;
                }
                Err(err) if !err.is_not_found() => return Err(err.into()),
                Err(_) => {}
            }

            self.blocked.add_missing_id(parent_id);
            self.fetch(parent_id)?;
            self.blocked.commit()?;
            return self.check_finish();
        }
    }

    fn log_fetch_progress(&self) {
        let fetched = self.blocked.num_jobs();
        if fetched % STATUS_UPDATE_FREQUENCY as u64 != 0 {
            return;
        }
        let total = self.tip_height.saturating_sub(self.starting_height);
        let eta = estimate_eta(
            self.start_time.elapsed(),
            fetched.saturating_sub(self.initially_fetched),
            total.saturating_sub(self.initially_fetched),
        );
        self.common()
            .metrics
            .fetch_eta_secs
            .store(eta.as_secs(), Ordering::Relaxed);
        if self.frontier.restarted() {
            debug!(num_fetched = fetched, num_total = total, ?eta, "fetching blocks");
        } else {
            info!(num_fetched = fetched, num_total = total, ?eta, "fetching blocks");
        }
    }

    /// Executes the queue once nothing is missing, then either restarts to
    /// catch a moving tip or finishes.
    fn check_finish(&mut self) -> Result<()> {
        if self.blocked.has_missing_ids() {
            return Ok(());
        }
        if self.frontier.in_round() {
            return Ok(());
        }
        let common = self.common().clone();
        if common.ctx.is_bootstrapped() || self.awaiting_timeout || self.finished {
            return Ok(());
        }

        let restarted = self.frontier.restarted();
        let executed = self
            .blocked
            .execute_all(&common.halter, restarted, &common.metrics)?;
        if common.halter.halted() {
            return Ok(());
        }

        let previously_executed = self.executed_state_transitions;
        self.executed_state_transitions = executed;

        // Each restart must execute fewer than half the blocks of the one
        // before, so bootstrapping ends even while new blocks keep coming.
        if common.bootstrap.retry_bootstrap && executed > 0 && executed < previously_executed / 2 {
            if self.frontier.restarts() < common.bootstrap.max_bootstrap_retries {
                return self.restart(true);
            }
            info!(
                restarts = self.frontier.restarts(),
                "bootstrap restart limit reached, finishing with the current frontier"
            );
        }

        common.subnet.bootstrapped(common.ctx.chain_id);
        if !common.subnet.is_bootstrapped() {
            if restarted {
                debug!("waiting for the remaining chains in this subnet to finish syncing");
            } else {
                info!("waiting for the remaining chains in this subnet to finish syncing");
            }
            common.timeouts.register_timeout(common.bootstrap.bootstrapping_delay);
            self.awaiting_timeout = true;
            return Ok(());
        }
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        self.common().metrics.fetch_eta_secs.store(0, Ordering::Relaxed);
        let request_id = self.frontier.request_id();
        (self.on_finished)(request_id)
    }
}

impl Engine for Bootstrapper {
    fn gear(&self) -> &'static str {
        "snowman_bootstrapper"
    }

    fn start(&mut self, request_id: u32) -> Result<()> {
        info!(chain_id = %self.common().ctx.chain_id, "starting bootstrapper");
        self.common().ctx.set_state(ChainState::Bootstrapping)?;
        self.vm.set_state(ChainState::Bootstrapping)?;

        let last_accepted_id = self.vm.last_accepted()?;
        let last_accepted = self.vm.get_block(&last_accepted_id)?;
        self.starting_height = last_accepted.height();
        self.frontier.set_request_id(request_id);

        if !self.common().startup_tracker.should_start() {
            return Ok(());
        }
        self.started = true;
        self.startup()
    }

    fn accepted_frontier(
        &mut self,
        node_id: NodeId,
        request_id: u32,
        container_ids: Vec<Id>,
    ) -> Result<()> {
        let outcome = self.frontier.accepted_frontier(node_id, request_id, container_ids)?;
        self.on_frontier(outcome)
    }

    fn get_accepted_frontier_failed(&mut self, node_id: NodeId, request_id: u32) -> Result<()> {
        let outcome = self.frontier.get_accepted_frontier_failed(node_id, request_id)?;
        self.on_frontier(outcome)
    }

    fn accepted(&mut self, node_id: NodeId, request_id: u32, container_ids: Vec<Id>) -> Result<()> {
        let outcome = self.frontier.accepted(node_id, request_id, container_ids)?;
        self.on_frontier(outcome)
    }

    fn get_accepted_failed(&mut self, node_id: NodeId, request_id: u32) -> Result<()> {
        let outcome = self.frontier.get_accepted_failed(node_id, request_id)?;
        self.on_frontier(outcome)
    }

    fn ancestors(
        &mut self,
        node_id: NodeId,
        request_id: u32,
        containers: Vec<Vec<u8>>,
    ) -> Result<()> {
        let Some(wanted_id) = self.outstanding.remove(&node_id, request_id) else {
            debug!(%node_id, request_id, "received unexpected Ancestors");
            return Ok(());
        };

        if containers.is_empty() {
            debug!(%node_id, request_id, "received Ancestors with no block");
            self.mark_unavailable(&node_id);
            return self.fetch(wanted_id);
        }

        // Answered, so the peer can be asked again.
        self.fetch_from.insert(node_id);

        let max_received = self.common().bootstrap.ancestors_max_containers_received;
        let mut containers = containers;
        if containers.len() > max_received {
            debug!(
                num_ignored = containers.len() - max_received,
                %node_id,
                request_id,
                "ignoring containers in Ancestors"
            );
            containers.truncate(max_received);
        }

        let mut blocks = Vec::with_capacity(containers.len());
        for bytes in &containers {
            match self.vm.parse_block(bytes) {
                Ok(block) => blocks.push(block),
                Err(err) => {
                    debug!(%node_id, request_id, error = %err, "failed to parse blocks in Ancestors");
                    return self.fetch(wanted_id);
                }
            }
        }

        let requested = blocks.remove(0);
        if requested.id() != wanted_id {
            debug!(
                expected_block_id = %wanted_id,
                block_id = %requested.id(),
                "first block is not the requested block"
            );
            return self.fetch(wanted_id);
        }

        let batch: HashMap<Id, BlockRef> = blocks.into_iter().map(|b| (b.id(), b)).collect();
        self.process(requested, &batch)
    }

    fn get_ancestors_failed(&mut self, node_id: NodeId, request_id: u32) -> Result<()> {
        let Some(block_id) = self.outstanding.remove(&node_id, request_id) else {
            debug!(%node_id, request_id, "unexpectedly called GetAncestorsFailed");
            return Ok(());
        };
        // The peer timed out; it may be asked again.
        self.fetch_from.insert(node_id);
        self.fetch(block_id)
    }

    fn connected(&mut self, node_id: NodeId) -> Result<()> {
        if self.common().beacons.contains(&node_id) {
            self.fetch_from.insert(node_id);
        }
        if self.started || !self.common().startup_tracker.should_start() {
            return Ok(());
        }
        self.started = true;
        self.startup()
    }

    fn disconnected(&mut self, node_id: NodeId) -> Result<()> {
        self.mark_unavailable(&node_id);
        Ok(())
    }

    fn timeout(&mut self) -> Result<()> {
        if !self.awaiting_timeout {
            return Err(ConsensusError::UnexpectedTimeout);
        }
        self.awaiting_timeout = false;

        if !self.common().subnet.is_bootstrapped() {
            return self.restart(true);
        }
        self.finish()
    }

    fn health_check(&self) -> Result<serde_json::Value> {
        let vm = self.vm.health_check()?;
        Ok(json!({
            "consensus": {
                "bootstrap": self.common().metrics.snapshot(),
                "missing": self.blocked.num_missing_ids(),
                "queued": self.blocked.num_jobs(),
            },
            "vm": vm,
        }))
    }

    fn shutdown(&mut self) -> Result<()> {
        info!("shutting down bootstrapper");
        self.vm.shutdown()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use savannah_db::MemDb;

    use super::*;
    use crate::common::BootstrapConfig;
    use crate::testing::{node, test_env, SentMessage, TestBlock, TestEnv, TestVm};
    use crate::validators::Connector;
    use crate::vm::Block;

    struct Harness {
        bootstrapper: Bootstrapper,
        env: TestEnv,
        vm: Arc<TestVm>,
        db: Arc<MemDb>,
        chain: Vec<Arc<TestBlock>>,
        finished: Arc<Mutex<Vec<u32>>>,
    }

    impl Harness {
        /// Genesis plus three blocks the VM can parse but doesn't store.
        fn new(beacons: &[(NodeId, u64)]) -> Self {
            let env = test_env(beacons, BootstrapConfig::default());
            let genesis = TestBlock::genesis();
            let vm = Arc::new(TestVm::new(genesis.clone()));
            let mut chain = vec![genesis];
            for seed in 1..=3 {
                let block = TestBlock::child(chain.last().unwrap(), seed);
                vm.add_parseable(block.clone());
                chain.push(block);
            }
            let db = Arc::new(MemDb::new());
            let finished = Arc::new(Mutex::new(Vec::new()));
            let bootstrapper = Self::bootstrapper(&env, &vm, &db, &finished);
            Self {
                bootstrapper,
                env,
                vm,
                db,
                chain,
                finished,
            }
        }

        fn bootstrapper(
            env: &TestEnv,
            vm: &Arc<TestVm>,
            db: &Arc<MemDb>,
            finished: &Arc<Mutex<Vec<u32>>>,
        ) -> Bootstrapper {
            let finished = Arc::clone(finished);
            let on_finished: OnFinished = Box::new(move |request_id| {
                finished.lock().push(request_id);
                Ok(())
            });
            let config = Config {
                common: env.config.clone(),
                db: db.clone(),
                codecs: Arc::new(Codecs::new().unwrap()),
                vm: vm.clone(),
            };
            Bootstrapper::new(config, on_finished).unwrap()
        }

        fn connect(&mut self, node_id: NodeId) {
            self.env.config.startup_tracker.connected(node_id).unwrap();
            self.bootstrapper.connected(node_id).unwrap();
        }

        fn tip(&self) -> Id {
            self.chain[3].id()
        }
    }

    #[test]
    fn test_bootstrap_from_single_beacon() {
        let mut h = Harness::new(&[(node(1), 1)]);
        h.bootstrapper.start(0).unwrap();
        assert!(h.env.sender.take().is_empty());
        assert_eq!(h.env.config.ctx.state(), ChainState::Bootstrapping);

        h.connect(node(1));
        assert_eq!(
            h.env.sender.take(),
            vec![SentMessage::GetAcceptedFrontier {
                node_ids: vec![node(1)],
                request_id: 1,
            }]
        );

        let tip = h.tip();
        h.bootstrapper.accepted_frontier(node(1), 1, vec![tip]).unwrap();
        assert_eq!(
            h.env.sender.take(),
            vec![SentMessage::GetAccepted {
                node_ids: vec![node(1)],
                request_id: 1,
                container_ids: vec![tip],
            }]
        );

        h.bootstrapper.accepted(node(1), 1, vec![tip]).unwrap();
        assert_eq!(
            h.env.sender.take(),
            vec![SentMessage::GetAncestors {
                node_id: node(1),
                request_id: 2,
                container_id: tip,
            }]
        );
        assert_eq!(h.bootstrapper.missing_ids(), vec![tip]);

        let containers = h.chain[1..].iter().rev().map(|b| b.bytes()).collect();
        h.bootstrapper.ancestors(node(1), 2, containers).unwrap();
        for block in &h.chain[1..] {
            assert_eq!(block.status(), Status::Accepted);
        }
        assert_eq!(h.vm.last_accepted().unwrap(), tip);

        // The first run executed blocks, so the frontier is checked again.
        assert!(h.finished.lock().is_empty());
        assert_eq!(
            h.env.sender.take(),
            vec![SentMessage::GetAcceptedFrontier {
                node_ids: vec![node(1)],
                request_id: 3,
            }]
        );
        h.bootstrapper.accepted_frontier(node(1), 3, vec![tip]).unwrap();
        h.bootstrapper.accepted(node(1), 3, vec![tip]).unwrap();

        assert_eq!(*h.finished.lock(), vec![3]);
        let metrics = h.bootstrapper.metrics().snapshot();
        assert_eq!(metrics.fetched, 3);
        assert_eq!(metrics.accepted, 3);
        assert_eq!(metrics.restarts, 1);
        assert_eq!(h.bootstrapper.num_queued(), 0);
    }

    #[test]
    fn test_restart_round_blocks_finish() {
        let mut h = Harness::new(&[(node(1), 1)]);
        for block in &h.chain[1..] {
            h.vm.add_block(block.clone());
        }
        h.bootstrapper.start(0).unwrap();
        h.connect(node(1));
        let tip = h.tip();
        h.bootstrapper.accepted_frontier(node(1), 1, vec![tip]).unwrap();
        h.env.sender.take();

        // Every block is stored locally, so they execute without a fetch and
        // a new frontier round begins in the same call.
        h.bootstrapper.accepted(node(1), 1, vec![tip]).unwrap();
        assert_eq!(h.vm.last_accepted().unwrap(), tip);
        assert_eq!(
            h.env.sender.take(),
            vec![SentMessage::GetAcceptedFrontier {
                node_ids: vec![node(1)],
                request_id: 2,
            }]
        );
        assert!(h.finished.lock().is_empty());

        h.bootstrapper.accepted_frontier(node(1), 2, vec![tip]).unwrap();
        h.bootstrapper.accepted(node(1), 2, vec![tip]).unwrap();
        assert_eq!(*h.finished.lock(), vec![2]);
    }

    #[test]
    fn test_wrong_first_block_refetches() {
        let mut h = Harness::new(&[(node(1), 1), (node(2), 1)]);
        for byte in 1..=2 {
            h.env.config.startup_tracker.connected(node(byte)).unwrap();
        }
        let tip = h.tip();
        h.bootstrapper.force_accepted(vec![tip]).unwrap();
        h.env.sender.take();

        let wrong = vec![h.chain[2].bytes()];
        h.bootstrapper.ancestors(node(1), 1, wrong).unwrap();
        let sent = h.env.sender.take();
        assert!(matches!(
            &sent[..],
            [SentMessage::GetAncestors { request_id: 2, container_id, .. }] if *container_id == tip
        ));
        assert_eq!(h.bootstrapper.num_queued(), 0);
    }

    #[test]
    fn test_progress_survives_restart() {
        let mut h = Harness::new(&[(node(1), 1)]);
        h.env.config.startup_tracker.connected(node(1)).unwrap();
        let tip = h.tip();
        h.bootstrapper.force_accepted(vec![tip]).unwrap();
        h.env.sender.take();

        // Only the tip arrives, so its parent is now missing.
        h.bootstrapper.ancestors(node(1), 1, vec![h.chain[3].bytes()]).unwrap();
        let parent = h.chain[2].id();
        assert_eq!(h.bootstrapper.missing_ids(), vec![parent]);
        assert_eq!(h.bootstrapper.num_queued(), 1);
        h.env.sender.take();

        let mut restarted = Harness::bootstrapper(&h.env, &h.vm, &h.db, &h.finished);
        assert_eq!(restarted.missing_ids(), vec![parent]);
        assert_eq!(restarted.num_queued(), 1);

        restarted.force_accepted(Vec::new()).unwrap();
        let sent = h.env.sender.take();
        assert!(matches!(
            &sent[..],
            [SentMessage::GetAncestors { container_id, .. }] if *container_id == parent
        ));
    }

    #[test]
    fn test_waits_for_subnet_then_finishes() {
        let mut h = Harness::new(&[]);
        let other_chain = Id::from_hash(b"other chain");
        h.env.config.subnet.add_chain(other_chain);

        h.bootstrapper.start(0).unwrap();
        assert_eq!(h.env.timeouts.take(), vec![Duration::from_secs(10)]);
        assert!(h.finished.lock().is_empty());

        // Still waiting on the other chain, so the frontier is checked again.
        h.bootstrapper.timeout().unwrap();
        assert_eq!(h.env.timeouts.take(), vec![Duration::from_secs(10)]);

        h.env.config.subnet.bootstrapped(other_chain);
        h.bootstrapper.timeout().unwrap();
        assert_eq!(*h.finished.lock(), vec![0]);
    }

    #[test]
    fn test_unexpected_messages_dropped() {
        let mut h = Harness::new(&[(node(1), 1)]);
        assert!(matches!(
            h.bootstrapper.timeout(),
            Err(ConsensusError::UnexpectedTimeout)
        ));
        h.bootstrapper.ancestors(node(1), 9, vec![vec![1]]).unwrap();
        h.bootstrapper.get_ancestors_failed(node(1), 9).unwrap();
        assert!(h.env.sender.take().is_empty());
    }
}
