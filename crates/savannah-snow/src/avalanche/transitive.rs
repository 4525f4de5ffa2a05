//! Avalanche consensus engine for normal operation.
//!
//! A vertex reaches consensus only after all of its parents did. Vertices
//! with unissued parents wait in `pending` while the parents are fetched
//! from the peer that referenced them.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use savannah_ids::{Id, NodeId};
use savannah_utils::Bag;
use serde_json::json;
use tracing::{debug, info, trace};

use super::vertex::{MAX_PARENTS, MAX_TXS};
use crate::choices::Status;
use crate::common::{send_mixed_query, Engine, OutstandingRequests, Sender};
use crate::consensus::avalanche::Topological;
use crate::consensus::Decisions;
use crate::context::{ChainState, ConsensusContext};
use crate::message::VmMessage;
use crate::metrics::EngineMetrics;
use crate::poll::{DagFactory, PollSet};
use crate::validators::ValidatorSet;
use crate::vm::{DagVm, TxRef, Vertex, VertexManager, VertexRef};
use crate::{Parameters, Result};

/// Collaborators of an Avalanche engine.
pub struct Config {
    pub ctx: Arc<ConsensusContext>,
    pub vm: Arc<dyn DagVm>,
    pub manager: Arc<dyn VertexManager>,
    pub sender: Arc<dyn Sender>,
    pub validators: Arc<ValidatorSet>,
    pub params: Parameters,
}

pub struct Transitive {
    ctx: Arc<ConsensusContext>,
    vm: Arc<dyn DagVm>,
    manager: Arc<dyn VertexManager>,
    sender: Arc<dyn Sender>,
    validators: Arc<ValidatorSet>,
    params: Parameters,
    consensus: Topological,
    polls: PollSet,
    request_id: u32,
    vtx_requests: OutstandingRequests,
    /// Vertices received but not yet added to consensus
    pending: HashMap<Id, VertexRef>,
    /// Pending vertices waiting on each parent
    blocked: HashMap<Id, Vec<Id>>,
    metrics: Arc<EngineMetrics>,
}

impl Transitive {
    pub fn new(config: Config) -> Result<Self> {
        config.params.validate()?;
        let polls = PollSet::new(Box::new(DagFactory {
            alpha: config.params.alpha,
        }));
        Ok(Self {
            consensus: Topological::new(config.params.clone()),
            ctx: config.ctx,
            vm: config.vm,
            manager: config.manager,
            sender: config.sender,
            validators: config.validators,
            params: config.params,
            polls,
            request_id: 0,
            vtx_requests: OutstandingRequests::new(),
            pending: HashMap::new(),
            blocked: HashMap::new(),
            metrics: Arc::new(EngineMetrics::default()),
        })
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn consensus(&self) -> &Topological {
        &self.consensus
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    fn next_request_id(&mut self) -> u32 {
        self.request_id = self.request_id.wrapping_add(1);
        self.request_id
    }

    fn get_vtx(&self, id: &Id) -> Result<VertexRef> {
        if let Some(vtx) = self.pending.get(id) {
            return Ok(Arc::clone(vtx));
        }
        Ok(self.manager.get_vtx(id)?)
    }

    fn was_issued(&self, vtx: &dyn Vertex) -> bool {
        let id = vtx.id();
        self.pending.contains_key(&id)
            || self.consensus.vertex_processing(&id)
            || vtx.status().decided()
    }

    /// Whether `id` is decided or in consensus.
    fn in_consensus(&self, id: &Id) -> bool {
        self.consensus.vertex_processing(id)
            || self
                .manager
                .get_vtx(id)
                .is_ok_and(|vtx| vtx.status().decided())
    }

    fn send_request(&mut self, node_id: NodeId, vtx_id: Id) {
        if self.vtx_requests.contains(&vtx_id) {
            return;
        }
        let request_id = self.next_request_id();
        self.vtx_requests.add(node_id, request_id, vtx_id);
        trace!(%node_id, request_id, %vtx_id, "sending Get request");
        self.sender.send_get(node_id, request_id, vtx_id);
    }

    fn issue_from_by_id(&mut self, node_id: NodeId, vtx_id: Id) -> Result<bool> {
        match self.get_vtx(&vtx_id) {
            Ok(vtx) => self.issue_from(node_id, vtx),
            Err(_) => {
                self.send_request(node_id, vtx_id);
                Ok(false)
            }
        }
    }

    /// Issues `vtx` and every unissued ancestor, requesting the ancestors
    /// not available locally from `node_id`. Returns whether `vtx` made it
    /// into consensus.
    fn issue_from(&mut self, node_id: NodeId, vtx: VertexRef) -> Result<bool> {
        let id = vtx.id();
        let mut stack = vec![vtx];
        while let Some(vtx) = stack.pop() {
            if self.was_issued(&*vtx) {
                continue;
            }
            let mut parents = Vec::new();
            for parent_id in vtx.parent_ids() {
                match self.get_vtx(&parent_id) {
                    Ok(parent) if parent.status().fetched() => {
                        if !self.was_issued(&*parent) {
                            parents.push(parent);
                        }
                    }
                    _ => self.send_request(node_id, parent_id),
                }
            }
            self.issue(vtx)?;
            stack.extend(parents);
        }
        self.vtx_requests.remove_any(&id);
        Ok(self.in_consensus(&id))
    }

    fn issue(&mut self, vtx: VertexRef) -> Result<()> {
        let id = vtx.id();
        self.pending.insert(id, Arc::clone(&vtx));
        self.vtx_requests.remove_any(&id);
        let waiting: Vec<Id> = vtx
            .parent_ids()
            .into_iter()
            .filter(|parent_id| !self.in_consensus(parent_id))
            .collect();
        if waiting.is_empty() {
            return self.deliver(vtx);
        }
        trace!(vtx_id = %id, num_waiting = waiting.len(), "vertex waiting for parents to be issued");
        for parent_id in waiting {
            self.blocked.entry(parent_id).or_default().push(id);
        }
        Ok(())
    }

    /// Why `vtx` can't be added to consensus, if it can't.
    fn invalid_reason(&self, vtx: &dyn Vertex) -> Option<String> {
        for parent_id in vtx.parent_ids() {
            if matches!(self.manager.get_vtx(&parent_id), Ok(parent) if parent.status() == Status::Rejected) {
                return Some(format!("parent {parent_id} was rejected"));
            }
        }
        let txs = match vtx.txs() {
            Ok(txs) => txs,
            Err(err) => return Some(err.to_string()),
        };
        for tx in txs {
            let tx_id = tx.id();
            if tx.status() != Status::Processing || self.consensus.tx_processing(&tx_id) {
                continue;
            }
            if let Err(err) = tx.verify() {
                return Some(format!("tx {tx_id} failed verification: {err}"));
            }
        }
        None
    }

    /// Adds `vtx` to consensus, then every pending descendant it unblocks.
    fn deliver(&mut self, vtx: VertexRef) -> Result<()> {
        let mut ready = vec![vtx];
        while let Some(vtx) = ready.pop() {
            let id = vtx.id();
            if self.pending.remove(&id).is_none() {
                continue;
            }

            if let Some(reason) = self.invalid_reason(&*vtx) {
                debug!(vtx_id = %id, reason, "dropping invalid vertex");
                self.abandon(&id);
                continue;
            }

            let decisions = self.consensus.add(Arc::clone(&vtx))?;
            self.on_decisions(&decisions);
            if self.consensus.vertex_processing(&id) {
                self.send_query(id, Some(vtx.bytes()));
            } else if vtx.status() != Status::Accepted {
                self.abandon(&id);
                continue;
            }

            for child_id in self.blocked.remove(&id).unwrap_or_default() {
                let Some(child) = self.pending.get(&child_id) else {
                    continue;
                };
                if child.parent_ids().iter().all(|p| self.in_consensus(p)) {
                    ready.push(Arc::clone(child));
                }
            }
        }
        self.repoll();
        Ok(())
    }

    /// Drops every pending vertex that descends from `vtx_id`.
    fn abandon(&mut self, vtx_id: &Id) {
        let mut stack = vec![*vtx_id];
        while let Some(id) = stack.pop() {
            for child_id in self.blocked.remove(&id).unwrap_or_default() {
                if self.pending.remove(&child_id).is_some() {
                    trace!(vtx_id = %child_id, abandoned_parent = %id, "abandoning vertex");
                    stack.push(child_id);
                }
            }
        }
    }

    fn send_query(&mut self, vtx_id: Id, container: Option<Vec<u8>>) {
        let sampled = match self.validators.sample(self.params.k) {
            Ok(sampled) => sampled,
            Err(err) => {
                debug!(%vtx_id, error = %err, "dropped query, couldn't sample validators");
                return;
            }
        };
        let bag = Bag::of(sampled.iter().copied());
        let request_id = self.next_request_id();
        if !self.polls.add(request_id, &bag) {
            debug!(request_id, "dropped query, duplicate request ID");
            return;
        }

        let mut seen = BTreeSet::new();
        let unique: Vec<NodeId> = sampled.into_iter().filter(|n| seen.insert(*n)).collect();
        match container {
            Some(bytes) => send_mixed_query(
                self.sender.as_ref(),
                &unique,
                self.params.mixed_query_num_push_vdr,
                request_id,
                vtx_id,
                bytes,
            ),
            None => {
                let node_ids: BTreeSet<NodeId> = unique.into_iter().collect();
                self.sender.send_pull_query(&node_ids, request_id, vtx_id);
            }
        }
    }

    fn repoll(&mut self) {
        let Some(preferred) = self.consensus.preferences().first().copied() else {
            return;
        };
        for _ in self.polls.len()..self.params.concurrent_repolls {
            self.send_query(preferred, None);
        }
    }

    fn on_decisions(&mut self, decisions: &Decisions) {
        EngineMetrics::add(&self.metrics.accepted, decisions.accepted.len());
        EngineMetrics::add(&self.metrics.rejected, decisions.rejected.len());
        for id in &decisions.rejected {
            self.abandon(id);
        }
    }

    fn record_results(&mut self, results: Vec<Bag<Id>>) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }
        for result in results {
            let successful = result.iter().any(|(_, count)| count >= self.params.alpha);
            let counter = if successful {
                &self.metrics.polls_successful
            } else {
                &self.metrics.polls_failed
            };
            EngineMetrics::add(counter, 1);

            let decisions = self.consensus.record_poll(&result)?;
            self.on_decisions(&decisions);
        }
        self.repoll();
        Ok(())
    }

    /// Vertices a new vertex builds on: the preferred frontier, or the
    /// accepted edge when nothing is processing.
    fn new_vertex_parents(&self) -> Vec<Id> {
        let preferences = self.consensus.preferences();
        let parents: Vec<Id> = if preferences.is_empty() {
            self.manager.edge()
        } else {
            preferences.into_iter().collect()
        };
        parents.into_iter().take(MAX_PARENTS).collect()
    }

    /// Batches the VM's unissued transactions into new vertices.
    fn build_vertices(&mut self, txs: Vec<TxRef>) -> Result<()> {
        let txs: Vec<TxRef> = txs
            .into_iter()
            .filter(|tx| tx.status() == Status::Processing && !self.consensus.tx_processing(&tx.id()))
            .collect();
        for batch in txs.chunks(MAX_TXS) {
            let parents = self.new_vertex_parents();
            let vtx = match self.manager.build_vtx(parents, batch.to_vec()) {
                Ok(vtx) => vtx,
                Err(err) => {
                    debug!(num_txs = batch.len(), error = %err, "failed building vertex");
                    continue;
                }
            };
            let node_id = self.ctx.node_id;
            self.issue_from(node_id, vtx)?;
        }
        Ok(())
    }

    fn send_chits(&self, node_id: NodeId, request_id: u32) {
        let preferences = self.consensus.preferences();
        let votes = if preferences.is_empty() {
            self.manager.edge()
        } else {
            preferences.into_iter().collect()
        };
        self.sender.send_chits(node_id, request_id, votes);
    }
}

impl Engine for Transitive {
    fn gear(&self) -> &'static str {
        "avalanche_engine"
    }

    fn start(&mut self, request_id: u32) -> Result<()> {
        self.request_id = request_id;
        self.consensus = Topological::new(self.params.clone());
        info!(
            chain_id = %self.ctx.chain_id,
            edge = self.manager.edge().len(),
            "starting consensus"
        );
        self.ctx.set_state(ChainState::NormalOp)?;
        self.vm.set_state(ChainState::NormalOp)?;
        let txs = self.vm.pending_txs();
        self.build_vertices(txs)
    }

    fn put(&mut self, node_id: NodeId, request_id: u32, container: Vec<u8>) -> Result<()> {
        let vtx = match self.manager.parse_vtx(&container) {
            Ok(vtx) => vtx,
            Err(err) => {
                debug!(%node_id, request_id, error = %err, "failed to parse vertex");
                return self.get_failed(node_id, request_id);
            }
        };
        let vtx_id = vtx.id();
        if let Some(expected) = self.vtx_requests.remove(&node_id, request_id) {
            if expected != vtx_id {
                debug!(%node_id, request_id, %expected, %vtx_id, "unexpected vertex in Put");
                self.abandon(&expected);
                return Ok(());
            }
        }
        self.issue_from(node_id, vtx)?;
        Ok(())
    }

    fn get_failed(&mut self, node_id: NodeId, request_id: u32) -> Result<()> {
        let Some(vtx_id) = self.vtx_requests.remove(&node_id, request_id) else {
            debug!(%node_id, request_id, "unexpected GetFailed");
            return Ok(());
        };
        self.abandon(&vtx_id);
        Ok(())
    }

    fn pull_query(&mut self, node_id: NodeId, request_id: u32, container_id: Id) -> Result<()> {
        self.send_chits(node_id, request_id);
        self.issue_from_by_id(node_id, container_id)?;
        Ok(())
    }

    fn push_query(&mut self, node_id: NodeId, request_id: u32, container: Vec<u8>) -> Result<()> {
        self.send_chits(node_id, request_id);
        let vtx = match self.manager.parse_vtx(&container) {
            Ok(vtx) => vtx,
            Err(err) => {
                debug!(%node_id, request_id, error = %err, "failed to parse vertex in PushQuery");
                return Ok(());
            }
        };
        self.issue_from(node_id, vtx)?;
        Ok(())
    }

    fn chits(&mut self, node_id: NodeId, request_id: u32, votes: Vec<Id>) -> Result<()> {
        if votes.is_empty() {
            debug!(%node_id, request_id, "received empty Chits");
            return self.query_failed(node_id, request_id);
        }
        let mut issued = Vec::with_capacity(votes.len());
        for vtx_id in votes {
            if self.in_consensus(&vtx_id) {
                issued.push(vtx_id);
            } else {
                debug!(%node_id, request_id, %vtx_id, "dropping vote for unissued vertex");
                self.issue_from_by_id(node_id, vtx_id)?;
            }
        }
        let results = if issued.is_empty() {
            self.polls.drop(request_id, &node_id)
        } else {
            self.polls.vote_many(request_id, &node_id, &issued)
        };
        self.record_results(results)
    }

    fn query_failed(&mut self, node_id: NodeId, request_id: u32) -> Result<()> {
        let results = self.polls.drop(request_id, &node_id);
        self.record_results(results)
    }

    fn gossip(&mut self) -> Result<()> {
        let Some(vtx_id) = self.manager.edge().first().copied() else {
            return Ok(());
        };
        let vtx = self.manager.get_vtx(&vtx_id)?;
        trace!(%vtx_id, "gossiping accepted vertex");
        self.sender.send_gossip(vtx.bytes());
        Ok(())
    }

    fn notify(&mut self, msg: VmMessage) -> Result<()> {
        match msg {
            VmMessage::PendingTxs => {
                let txs = self.vm.pending_txs();
                self.build_vertices(txs)
            }
            VmMessage::StateSyncDone => {
                debug!("dropping StateSyncDone, unhandled by this gear");
                Ok(())
            }
        }
    }

    fn health_check(&self) -> Result<serde_json::Value> {
        let vm = self.vm.health_check()?;
        Ok(json!({
            "consensus": {
                "health": self.consensus.health_check(),
                "processing_txs": self.consensus.num_processing_txs(),
                "outstanding_polls": self.polls.len(),
                "pending": self.pending.len(),
                "engine": self.metrics.snapshot(),
            },
            "vm": vm,
        }))
    }

    fn shutdown(&mut self) -> Result<()> {
        info!("shutting down consensus engine");
        self.vm.shutdown()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use savannah_db::MemDb;

    use super::*;
    use crate::avalanche::state::Serializer;
    use crate::codec::Codecs;
    use crate::testing::{chain_id, node, SentMessage, TestDagVm, TestSender, TestTx};

    struct Harness {
        engine: Transitive,
        vm: Arc<TestDagVm>,
        manager: Arc<Serializer>,
        sender: Arc<TestSender>,
    }

    fn serializer(vm: &Arc<TestDagVm>) -> Arc<Serializer> {
        Arc::new(
            Serializer::new(
                chain_id(),
                Arc::new(MemDb::new()),
                Arc::new(Codecs::new().unwrap()),
                vm.clone(),
            )
            .unwrap(),
        )
    }

    fn setup() -> Harness {
        let vm = Arc::new(TestDagVm::default());
        let manager = serializer(&vm);
        let sender = Arc::new(TestSender::default());
        let validators = Arc::new(ValidatorSet::with_seed(3));
        validators.add_weight(node(1), 1).unwrap();
        let params = Parameters {
            k: 1,
            alpha: 1,
            beta_virtuous: 1,
            beta_rogue: 1,
            concurrent_repolls: 1,
            mixed_query_num_push_vdr: 1,
            ..Default::default()
        };
        let mut engine = Transitive::new(Config {
            ctx: Arc::new(ConsensusContext::new(chain_id(), Id::EMPTY, node(0))),
            vm: vm.clone(),
            manager: manager.clone(),
            sender: sender.clone(),
            validators,
            params,
        })
        .unwrap();
        engine.start(0).unwrap();
        Harness {
            engine,
            vm,
            manager,
            sender,
        }
    }

    fn status(manager: &Serializer, id: &Id) -> Status {
        manager.get_vtx(id).map_or(Status::Unknown, |vtx| vtx.status())
    }

    fn pushed(sent: &[SentMessage]) -> Vec<(u32, Vec<u8>)> {
        sent.iter()
            .filter_map(|m| match m {
                SentMessage::PushQuery {
                    request_id,
                    container,
                    ..
                } => Some((*request_id, container.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_pending_txs_built_into_vertex_and_accepted() {
        let mut h = setup();
        assert_eq!(h.vm.states(), vec![ChainState::NormalOp]);
        let tx = TestTx::new(1, vec![Id::from_hash(b"utxo")], vec![]);
        h.vm.add_pending(tx.clone());
        h.engine.notify(VmMessage::PendingTxs).unwrap();
        assert!(h.engine.consensus().tx_processing(&tx.id()));

        let pushed = pushed(&h.sender.take());
        assert_eq!(pushed.len(), 1);
        let vtx = h.manager.parse_vtx(&pushed[0].1).unwrap();
        assert_eq!(pushed[0].0, 1);

        h.engine.chits(node(1), 1, vec![vtx.id()]).unwrap();
        assert_eq!(tx.status(), Status::Accepted);
        assert_eq!(status(&h.manager, &vtx.id()), Status::Accepted);
        assert_eq!(h.manager.edge(), vec![vtx.id()]);
        assert_eq!(h.engine.metrics().snapshot().polls_successful, 1);
    }

    #[test]
    fn test_conflicting_tx_rejected() {
        let mut h = setup();
        let utxo = Id::from_hash(b"utxo");
        let (first, second) = (TestTx::new(1, vec![utxo], vec![]), TestTx::new(2, vec![utxo], vec![]));
        h.vm.add_pending(first.clone());
        h.engine.notify(VmMessage::PendingTxs).unwrap();
        h.vm.add_pending(second.clone());
        h.engine.notify(VmMessage::PendingTxs).unwrap();
        assert!(h.engine.consensus().tx_preferred(&first.id()));
        assert!(!h.engine.consensus().tx_preferred(&second.id()));

        let pushed = pushed(&h.sender.take());
        assert_eq!(pushed.len(), 2);
        let first_vtx = h.manager.parse_vtx(&pushed[0].1).unwrap();
        let second_vtx = h.manager.parse_vtx(&pushed[1].1).unwrap();
        assert_eq!(second_vtx.parent_ids(), vec![first_vtx.id()]);

        h.engine.chits(node(1), pushed[0].0, vec![first_vtx.id()]).unwrap();
        assert_eq!(first.status(), Status::Accepted);
        assert_eq!(second.status(), Status::Rejected);
        assert_eq!(status(&h.manager, &first_vtx.id()), Status::Accepted);
        assert_eq!(status(&h.manager, &second_vtx.id()), Status::Rejected);
    }

    #[test]
    fn test_missing_parent_fetched_then_issued() {
        let mut h = setup();
        let (root_tx, child_tx) = (TestTx::new(1, vec![], vec![]), TestTx::new(2, vec![], vec![]));
        h.vm.add_parseable(root_tx.clone());
        h.vm.add_parseable(child_tx.clone());

        let remote = serializer(&Arc::new(TestDagVm::default()));
        let root = remote.build_vtx(vec![], vec![root_tx as TxRef]).unwrap();
        let child = remote.build_vtx(vec![root.id()], vec![child_tx as TxRef]).unwrap();

        h.engine.push_query(node(1), 10, child.bytes()).unwrap();
        assert_eq!(h.engine.num_pending(), 1);
        assert_eq!(
            h.sender.take(),
            vec![
                SentMessage::Chits {
                    node_id: node(1),
                    request_id: 10,
                    votes: vec![],
                },
                SentMessage::Get {
                    node_id: node(1),
                    request_id: 1,
                    container_id: root.id(),
                },
            ]
        );

        h.engine.put(node(1), 1, root.bytes()).unwrap();
        assert_eq!(h.engine.num_pending(), 0);
        assert!(h.engine.consensus().vertex_processing(&root.id()));
        assert!(h.engine.consensus().vertex_processing(&child.id()));
        let pushed: Vec<u32> = pushed(&h.sender.take()).into_iter().map(|(id, _)| id).collect();
        assert_eq!(pushed, vec![2, 3]);
    }

    #[test]
    fn test_failed_get_abandons_waiting_vertex() {
        let mut h = setup();
        let (root_tx, child_tx) = (TestTx::new(1, vec![], vec![]), TestTx::new(2, vec![], vec![]));
        h.vm.add_parseable(child_tx.clone());
        let remote = serializer(&Arc::new(TestDagVm::default()));
        let root = remote.build_vtx(vec![], vec![root_tx as TxRef]).unwrap();
        let child = remote.build_vtx(vec![root.id()], vec![child_tx as TxRef]).unwrap();

        h.engine.push_query(node(1), 10, child.bytes()).unwrap();
        assert_eq!(h.engine.num_pending(), 1);
        h.engine.get_failed(node(1), 1).unwrap();
        assert_eq!(h.engine.num_pending(), 0);
        assert!(!h.engine.consensus().vertex_processing(&child.id()));
    }
}
