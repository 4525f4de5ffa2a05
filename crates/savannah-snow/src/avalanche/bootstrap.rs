//! Avalanche bootstrapper.
//!
//! Fetches every vertex between the accepted edge and the frontier the
//! beacons agree on. Each vertex is queued as a vertex job and each of its
//! transactions as a transaction job. Once nothing is missing, the
//! transaction queue runs first, then the vertex queue.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use savannah_db::{Database, PrefixDb};
use savannah_ids::{Id, NodeId};
use serde_json::json;
use tracing::{debug, info};

use super::tx_job::{TxJob, TxParser};
use super::vertex_job::{VertexJob, VertexParser};
use crate::choices::Status;
use crate::codec::Codecs;
use crate::common::{
    CommonConfig, Engine, Frontier, FrontierOutcome, OnFinished, OutstandingRequests,
};
use crate::context::ChainState;
use crate::metrics::BootstrapMetrics;
use crate::queue::{Jobs, JobsWithMissing};
use crate::vm::{DagVm, VertexManager, VertexRef};
use crate::{ConsensusError, Result};

const VERTEX_JOBS_PREFIX: &[u8] = b"vertex_jobs";
const TX_JOBS_PREFIX: &[u8] = b"tx_jobs";

/// Collaborators of an Avalanche bootstrapper.
pub struct Config {
    pub common: CommonConfig,
    /// Namespace holding the vertex and transaction job queues
    pub db: Arc<dyn Database>,
    pub codecs: Arc<Codecs>,
    pub manager: Arc<dyn VertexManager>,
    pub vm: Arc<dyn DagVm>,
}

pub struct Bootstrapper {
    frontier: Frontier,
    vertices: JobsWithMissing,
    txs: Jobs,
    manager: Arc<dyn VertexManager>,
    vm: Arc<dyn DagVm>,
    on_finished: OnFinished,
    outstanding: OutstandingRequests,
    fetch_from: BTreeSet<NodeId>,
    started: bool,
    executed_state_transitions: usize,
    awaiting_timeout: bool,
    /// Set once control was handed to the next gear
    finished: bool,
}

impl Bootstrapper {
    pub fn new(config: Config, on_finished: OnFinished) -> Result<Self> {
        let vertex_db: Arc<dyn Database> = Arc::new(PrefixDb::new(Arc::clone(&config.db), VERTEX_JOBS_PREFIX));
        let tx_db: Arc<dyn Database> = Arc::new(PrefixDb::new(config.db, TX_JOBS_PREFIX));
        let vertices = JobsWithMissing::new(
            vertex_db,
            Arc::new(VertexParser {
                manager: Arc::clone(&config.manager),
            }),
            Arc::clone(&config.codecs),
        )?;
        let txs = Jobs::new(
            tx_db,
            Arc::new(TxParser {
                vm: Arc::clone(&config.vm),
            }),
            config.codecs,
        )?;
        Ok(Self {
            frontier: Frontier::new(config.common),
            vertices,
            txs,
            manager: config.manager,
            vm: config.vm,
            on_finished,
            outstanding: OutstandingRequests::new(),
            fetch_from: BTreeSet::new(),
            started: false,
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

    pub fn missing_ids(&self) -> Vec<Id> {
        self.vertices.missing_ids()
    }

    /// Vertex and transaction jobs waiting to be executed.
    pub fn num_queued(&self) -> (u64, u64) {
        (self.vertices.num_jobs(), self.txs.num_jobs())
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

    /// Fetches everything between the accepted edge and `accepted`, resuming
    /// whatever a previous run left missing.
    pub fn force_accepted(&mut self, accepted: Vec<Id>) -> Result<()> {
        let mut pending = self.vertices.missing_ids();
        self.fetch_from = self.common().startup_tracker.preferred_peers();
        debug!(
            num_pending_vertices = pending.len(),
            num_accepted_vertices = accepted.len(),
            "starting bootstrapping"
        );
        pending.extend(accepted);

        let mut to_process = Vec::with_capacity(pending.len());
        for vtx_id in pending {
            self.vertices.add_missing_id(vtx_id);
            match self.manager.get_vtx(&vtx_id) {
                Ok(vtx) => to_process.push(vtx),
                Err(err) if err.is_not_found() => self.fetch(vtx_id)?,
                Err(err) => return Err(err.into()),
            }
        }
        self.process(to_process)
    }

    fn fetch(&mut self, vtx_id: Id) -> Result<()> {
        if self.outstanding.contains(&vtx_id) {
            return Ok(());
        }
        match self.manager.get_vtx(&vtx_id) {
            Ok(_) => return Ok(()),
            Err(err) if !err.is_not_found() => return Err(err.into()),
            Err(_) => {}
        }

        if self.fetch_from.is_empty() {
            self.fetch_from = self.common().startup_tracker.preferred_peers();
        }
        let Some(node_id) = self.fetch_from.first().copied() else {
            return Err(ConsensusError::NoPeers(vtx_id));
        };
        self.mark_unavailable(&node_id);

        let request_id = self.frontier.next_request_id();
        self.outstanding.add(node_id, request_id, vtx_id);
        self.common().sender.send_get_ancestors(node_id, request_id, vtx_id);
        Ok(())
    }

    fn mark_unavailable(&mut self, node_id: &NodeId) {
        self.fetch_from.remove(node_id);
        if self.fetch_from.is_empty() {
            self.fetch_from = self.common().startup_tracker.preferred_peers();
        }
    }

    /// Queues `vertices` and every unqueued ancestor down to the accepted
    /// edge, fetching the ancestors not stored locally.
    fn process(&mut self, vertices: Vec<VertexRef>) -> Result<()> {
        let mut stack = vertices;
        let mut seen = HashSet::new();
        while let Some(vtx) = stack.pop() {
            let vtx_id = vtx.id();
            if !seen.insert(vtx_id) {
                continue;
            }
            if self.common().halter.halted() {
                self.vertices.add_missing_id(vtx_id);
                for vtx in stack {
                    self.vertices.add_missing_id(vtx.id());
                }
                self.txs.commit()?;
                return self.vertices.commit();
            }

            self.vertices.remove_missing_id(&vtx_id);
            match vtx.status() {
                Status::Accepted => continue,
                Status::Rejected => return Err(ConsensusError::PreviouslyRejected(vtx_id)),
                Status::Unknown => {
                    self.vertices.add_missing_id(vtx_id);
                    self.fetch(vtx_id)?;
                    continue;
                }
                Status::Processing => {}
            }

            let pushed = self.vertices.push(Box::new(VertexJob {
                vtx: Arc::clone(&vtx),
                manager: Arc::clone(&self.manager),
            }))?;
            if !pushed {
                continue;
            }
            BootstrapMetrics::inc(&self.common().metrics.fetched);

            for tx in vtx.txs()? {
                self.txs.push(Box::new(TxJob {
                    tx,
                    vm: Arc::clone(&self.vm),
                }))?;
            }

            for parent_id in vtx.parent_ids() {
                match self.manager.get_vtx(&parent_id) {
                    Ok(parent) => stack.push(parent),
                    Err(err) if err.is_not_found() => {
                        self.vertices.add_missing_id(parent_id);
                        self.fetch(parent_id)?;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        self.txs.commit()?;
        self.vertices.commit()?;
        debug!(
            num_vertices = self.vertices.num_jobs(),
            num_txs = self.txs.num_jobs(),
            num_missing = self.vertices.num_missing_ids(),
            "queued vertices"
        );
        self.check_finish()
    }

    fn check_finish(&mut self) -> Result<()> {
        if self.vertices.has_missing_ids() {
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
        self.txs.execute_all(&common.halter, restarted, &common.metrics)?;
        if common.halter.halted() {
            return Ok(());
        }
        let executed = self
            .vertices
            .execute_all(&common.halter, restarted, &common.metrics)?;
        if common.halter.halted() {
            return Ok(());
        }

        let previously_executed = self.executed_state_transitions;
        self.executed_state_transitions = executed;
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
            info!("waiting for the remaining chains in this subnet to finish syncing");
            common.timeouts.register_timeout(common.bootstrap.bootstrapping_delay);
            self.awaiting_timeout = true;
            return Ok(());
        }
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        let request_id = self.frontier.request_id();
        (self.on_finished)(request_id)
    }
}

impl Engine for Bootstrapper {
    fn gear(&self) -> &'static str {
        "avalanche_bootstrapper"
    }

    fn start(&mut self, request_id: u32) -> Result<()> {
        info!(chain_id = %self.common().ctx.chain_id, "starting bootstrapper");
        self.common().ctx.set_state(ChainState::Bootstrapping)?;
        self.vm.set_state(ChainState::Bootstrapping)?;
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
            debug!(%node_id, request_id, "received Ancestors with no vertex");
            self.mark_unavailable(&node_id);
            return self.fetch(wanted_id);
        }
        self.fetch_from.insert(node_id);

        let max_received = self.common().bootstrap.ancestors_max_containers_received;
        let mut containers = containers;
        containers.truncate(max_received);

        // Parsing stores each vertex, so ancestors found later are read back
        // from the vertex manager.
        let mut vertices = Vec::with_capacity(containers.len());
        for bytes in &containers {
            match self.manager.parse_vtx(bytes) {
                Ok(vtx) => vertices.push(vtx),
                Err(err) => {
                    debug!(%node_id, request_id, error = %err, "failed to parse vertices in Ancestors");
                    return self.fetch(wanted_id);
                }
            }
        }
        let requested = vertices.swap_remove(0);
        if requested.id() != wanted_id {
            debug!(
                expected_vtx_id = %wanted_id,
                vtx_id = %requested.id(),
                "first vertex is not the requested vertex"
            );
            return self.fetch(wanted_id);
        }
        self.process(vec![requested])
    }

    fn get_ancestors_failed(&mut self, node_id: NodeId, request_id: u32) -> Result<()> {
        let Some(vtx_id) = self.outstanding.remove(&node_id, request_id) else {
            debug!(%node_id, request_id, "unexpectedly called GetAncestorsFailed");
            return Ok(());
        };
        self.fetch_from.insert(node_id);
        self.fetch(vtx_id)
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
                "missing": self.vertices.num_missing_ids(),
                "queued_vertices": self.vertices.num_jobs(),
                "queued_txs": self.txs.num_jobs(),
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
    use parking_lot::Mutex;
    use savannah_db::MemDb;

    use super::*;
    use crate::avalanche::state::Serializer;
    use crate::common::BootstrapConfig;
    use crate::testing::{node, test_env, SentMessage, TestDagVm, TestEnv, TestTx};
    use crate::validators::Connector;
    use crate::vm::TxRef;

    struct Harness {
        bootstrapper: Bootstrapper,
        env: TestEnv,
        finished: Arc<Mutex<Vec<u32>>>,
        /// Bytes of a root vertex and its child, built by a remote node
        remote: Vec<Vec<u8>>,
        remote_ids: Vec<Id>,
        txs: Vec<Arc<TestTx>>,
    }

    fn serializer(vm: &Arc<TestDagVm>) -> Arc<Serializer> {
        Arc::new(
            Serializer::new(
                crate::testing::chain_id(),
                Arc::new(MemDb::new()),
                Arc::new(Codecs::new().unwrap()),
                vm.clone(),
            )
            .unwrap(),
        )
    }

    fn setup() -> Harness {
        let env = test_env(&[(node(1), 1)], BootstrapConfig::default());
        let vm = Arc::new(TestDagVm::default());
        let txs = vec![
            TestTx::new(1, vec![], vec![]),
            TestTx::new(2, vec![], vec![]),
        ];
        for tx in &txs {
            vm.add_parseable(tx.clone());
        }

        // The remote node builds the vertices against its own storage.
        let remote_vm = Arc::new(TestDagVm::default());
        let remote = serializer(&remote_vm);
        let root = remote
            .build_vtx(vec![], vec![txs[0].clone() as TxRef])
            .unwrap();
        let child = remote
            .build_vtx(vec![root.id()], vec![txs[1].clone() as TxRef])
            .unwrap();

        let finished = Arc::new(Mutex::new(Vec::new()));
        let on_finished: OnFinished = {
            let finished = finished.clone();
            Box::new(move |request_id| {
                finished.lock().push(request_id);
                Ok(())
            })
        };
        let bootstrapper = Bootstrapper::new(
            Config {
                common: env.config.clone(),
                db: Arc::new(MemDb::new()),
                codecs: Arc::new(Codecs::new().unwrap()),
                manager: serializer(&vm),
                vm,
            },
            on_finished,
        )
        .unwrap();
        Harness {
            bootstrapper,
            env,
            finished,
            remote: vec![child.bytes(), root.bytes()],
            remote_ids: vec![child.id(), root.id()],
            txs,
        }
    }

    #[test]
    fn test_bootstrap_accepts_txs_then_vertices() {
        let mut h = setup();
        h.bootstrapper.start(0).unwrap();
        h.env.config.startup_tracker.connected(node(1)).unwrap();
        h.bootstrapper.connected(node(1)).unwrap();

        let tip = h.remote_ids[0];
        h.bootstrapper.accepted_frontier(node(1), 1, vec![tip]).unwrap();
        h.bootstrapper.accepted(node(1), 1, vec![tip]).unwrap();
        let sent = h.env.sender.take();
        assert!(sent.contains(&SentMessage::GetAncestors {
            node_id: node(1),
            request_id: 2,
            container_id: tip,
        }));

        h.bootstrapper.ancestors(node(1), 2, h.remote.clone()).unwrap();
        for tx in &h.txs {
            assert_eq!(tx.status(), Status::Accepted);
        }
        assert_eq!(h.bootstrapper.num_queued(), (0, 0));
        assert_eq!(h.bootstrapper.metrics().snapshot().accepted, 4);

        // The first round always restarts to catch a moving tip.
        let sent = h.env.sender.take();
        assert!(matches!(
            &sent[..],
            [SentMessage::GetAcceptedFrontier { request_id: 3, .. }]
        ));
        h.bootstrapper.accepted_frontier(node(1), 3, vec![tip]).unwrap();
        h.bootstrapper.accepted(node(1), 3, vec![tip]).unwrap();
        assert_eq!(*h.finished.lock(), vec![3]);
    }

    #[test]
    fn test_unparseable_ancestors_refetched() {
        let mut h = setup();
        h.env.config.startup_tracker.connected(node(1)).unwrap();
        h.bootstrapper.start(0).unwrap();
        let tip = h.remote_ids[0];
        h.bootstrapper.accepted_frontier(node(1), 1, vec![tip]).unwrap();
        h.bootstrapper.accepted(node(1), 1, vec![tip]).unwrap();
        h.env.sender.take();

        h.bootstrapper.ancestors(node(1), 2, vec![b"garbage".to_vec()]).unwrap();
        assert_eq!(
            h.env.sender.take(),
            vec![SentMessage::GetAncestors {
                node_id: node(1),
                request_id: 3,
                container_id: tip,
            }]
        );
        assert_eq!(h.bootstrapper.missing_ids(), vec![tip]);
        assert!(h.finished.lock().is_empty());
    }
}
