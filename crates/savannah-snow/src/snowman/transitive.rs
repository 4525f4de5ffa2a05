//! Snowman consensus engine for normal operation.
//!
//! Blocks reach consensus only after their parent did. A block whose parent
//! is unknown is held in `pending` while the parent is fetched from the peer
//! that referenced it; if the fetch fails, everything waiting on it is
//! abandoned.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use savannah_ids::{Id, NodeId};
use savannah_utils::Bag;
use serde_json::json;
use tracing::{debug, info, trace};

use crate::choices::Status;
use crate::common::{send_mixed_query, Engine, OutstandingRequests, Sender};
use crate::consensus::snowman::Topological;
use crate::consensus::Decisions;
use crate::context::{ChainState, ConsensusContext};
use crate::message::VmMessage;
use crate::metrics::EngineMetrics;
use crate::poll::{EarlyTermFactory, PollSet};
use crate::validators::ValidatorSet;
use crate::vm::{Block, BlockRef, ChainVm};
use crate::{Parameters, Result};

/// Collaborators of a Snowman engine.
pub struct Config {
    pub ctx: Arc<ConsensusContext>,
    pub vm: Arc<dyn ChainVm>,
    pub sender: Arc<dyn Sender>,
    pub validators: Arc<ValidatorSet>,
    pub params: Parameters,
}

pub struct Transitive {
    ctx: Arc<ConsensusContext>,
    vm: Arc<dyn ChainVm>,
    sender: Arc<dyn Sender>,
    validators: Arc<ValidatorSet>,
    params: Parameters,
    consensus: Topological,
    polls: PollSet,
    request_id: u32,
    /// Blocks requested with `Get`
    block_requests: OutstandingRequests,
    /// Blocks received but not yet added to consensus
    pending: HashMap<Id, BlockRef>,
    /// Pending blocks waiting on each parent
    blocked: HashMap<Id, Vec<Id>>,
    /// `PendingTxs` notifications not yet turned into blocks
    pending_build_blocks: usize,
    metrics: Arc<EngineMetrics>,
}

impl Transitive {
    pub fn new(config: Config) -> Result<Self> {
        config.params.validate()?;
        let polls = PollSet::new(Box::new(EarlyTermFactory {
            alpha: config.params.alpha,
        }));
        Ok(Self {
            consensus: Topological::new(config.params.clone(), Id::EMPTY, 0),
            ctx: config.ctx,
            vm: config.vm,
            sender: config.sender,
            validators: config.validators,
            params: config.params,
            polls,
            request_id: 0,
            block_requests: OutstandingRequests::new(),
            pending: HashMap::new(),
            blocked: HashMap::new(),
            pending_build_blocks: 0,
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

    fn get_block(&self, id: &Id) -> Result<BlockRef> {
        if let Some(block) = self.pending.get(id) {
            return Ok(Arc::clone(block));
        }
        Ok(self.vm.get_block(id)?)
    }

    fn was_issued(&self, block: &dyn Block) -> bool {
        let id = block.id();
        self.pending.contains_key(&id)
            || self.consensus.decided(block)
            || self.consensus.processing(&id)
    }

    /// Whether `id` is the last accepted block or in consensus.
    fn in_consensus(&self, id: &Id) -> bool {
        if self.consensus.processing(id) {
            return true;
        }
        match self.vm.get_block(id) {
            Ok(block) => self.consensus.decided(&*block),
            Err(_) => false,
        }
    }

    /// Asks `node_id` for a block unless it was already requested.
    fn send_request(&mut self, node_id: NodeId, block_id: Id) {
        if self.block_requests.contains(&block_id) {
            return;
        }
        let request_id = self.next_request_id();
        self.block_requests.add(node_id, request_id, block_id);
        trace!(%node_id, request_id, %block_id, "sending Get request");
        self.sender.send_get(node_id, request_id, block_id);
    }

    fn issue_from_by_id(&mut self, node_id: NodeId, block_id: Id) -> Result<bool> {
        match self.get_block(&block_id) {
            Ok(block) => self.issue_from(node_id, block),
            Err(_) => {
                self.send_request(node_id, block_id);
                Ok(false)
            }
        }
    }

    /// Issues `block` and every unissued ancestor, requesting the first
    /// ancestor not available locally from `node_id`. Returns whether
    /// `block` made it into consensus.
    fn issue_from(&mut self, node_id: NodeId, block: BlockRef) -> Result<bool> {
        let mut block = block;
        while !self.was_issued(&*block) {
            self.issue(Arc::clone(&block))?;
            let parent_id = block.parent();
            match self.get_block(&parent_id) {
                Ok(parent) if parent.status().fetched() => block = parent,
                _ => {
                    self.send_request(node_id, parent_id);
                    return Ok(false);
                }
            }
        }

        let id = block.id();
        self.block_requests.remove_any(&id);
        if block.status() == Status::Rejected {
            self.abandon(&id);
        }
        Ok(self.consensus.decided(&*block) || self.consensus.processing(&id))
    }

    /// Marks `block` pending and adds it to consensus as soon as its parent
    /// is there.
    fn issue(&mut self, block: BlockRef) -> Result<()> {
        let id = block.id();
        let parent_id = block.parent();
        self.pending.insert(id, Arc::clone(&block));
        self.block_requests.remove_any(&id);
        if self.in_consensus(&parent_id) {
            return self.deliver(block);
        }
        trace!(block_id = %id, %parent_id, "block waiting for parent to be issued");
        self.blocked.entry(parent_id).or_default().push(id);
        Ok(())
    }

    /// Adds `block` to consensus, then every pending descendant it unblocks.
    fn deliver(&mut self, block: BlockRef) -> Result<()> {
        let mut ready = vec![block];
        while let Some(block) = ready.pop() {
            let id = block.id();
            self.pending.remove(&id);

            if let Err(err) = block.verify() {
                debug!(block_id = %id, error = %err, "block verification failed");
                self.abandon(&id);
                continue;
            }

            let decisions = self.consensus.add(Arc::clone(&block))?;
            self.on_decisions(&decisions);
            if !self.consensus.processing(&id) {
                self.abandon(&id);
                continue;
            }

            self.vm.set_preference(&self.consensus.preference())?;
            if self.consensus.is_preferred(&id) {
                self.send_query(id, Some(block.bytes()));
            }

            for child_id in self.blocked.remove(&id).unwrap_or_default() {
                if let Some(child) = self.pending.get(&child_id) {
                    ready.push(Arc::clone(child));
                }
            }
        }
        self.repoll();
        Ok(())
    }

    /// Drops every pending block that descends from `block_id`.
    fn abandon(&mut self, block_id: &Id) {
        let mut stack = vec![*block_id];
        while let Some(id) = stack.pop() {
            for child_id in self.blocked.remove(&id).unwrap_or_default() {
                if self.pending.remove(&child_id).is_some() {
                    trace!(block_id = %child_id, abandoned_parent = %id, "abandoning block");
                    stack.push(child_id);
                }
            }
        }
    }

    /// Samples `k` validators and polls them about `container_id`. With the
    /// container's bytes, part of the sample receives a push query.
    fn send_query(&mut self, container_id: Id, container: Option<Vec<u8>>) {
        let sampled = match self.validators.sample(self.params.k) {
            Ok(sampled) => sampled,
            Err(err) => {
                debug!(%container_id, error = %err, "dropped query, couldn't sample validators");
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
                container_id,
                bytes,
            ),
            None => {
                let node_ids: BTreeSet<NodeId> = unique.into_iter().collect();
                self.sender.send_pull_query(&node_ids, request_id, container_id);
            }
        }
    }

    /// Keeps `concurrent_repolls` polls outstanding while blocks are processing.
    fn repoll(&mut self) {
        if self.consensus.num_processing() == 0 {
            return;
        }
        let preference = self.consensus.preference();
        for _ in self.polls.len()..self.params.concurrent_repolls {
            self.send_query(preference, None);
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
            let successful = result.mode().is_some_and(|(_, count)| count >= self.params.alpha);
            let counter = if successful {
                &self.metrics.polls_successful
            } else {
                &self.metrics.polls_failed
            };
            EngineMetrics::add(counter, 1);

            let decisions = self.consensus.record_poll(&result)?;
            self.on_decisions(&decisions);
        }
        self.vm.set_preference(&self.consensus.preference())?;
        self.repoll();
        Ok(())
    }

    fn build_blocks(&mut self) -> Result<()> {
        while self.pending_build_blocks > 0
            && self.consensus.num_processing() < self.params.optimal_processing
        {
            self.pending_build_blocks -= 1;
            let block = match self.vm.build_block() {
                Ok(block) => block,
                Err(err) => {
                    debug!(error = %err, "failed building block");
                    continue;
                }
            };
            let parent_id = block.parent();
            if !self.in_consensus(&parent_id) {
                debug!(block_id = %block.id(), %parent_id, "built block with unissued parent");
            }
            let node_id = self.ctx.node_id;
            self.issue_from(node_id, block)?;
        }
        Ok(())
    }

    fn send_chits(&self, node_id: NodeId, request_id: u32) {
        self.sender
            .send_chits(node_id, request_id, vec![self.consensus.preference()]);
    }
}

impl Engine for Transitive {
    fn gear(&self) -> &'static str {
        "snowman_engine"
    }

    fn start(&mut self, request_id: u32) -> Result<()> {
        self.request_id = request_id;
        let last_accepted_id = self.vm.last_accepted()?;
        let last_accepted = self.vm.get_block(&last_accepted_id)?;
        self.consensus = Topological::new(
            self.params.clone(),
            last_accepted_id,
            last_accepted.height(),
        );
        self.vm.set_preference(&last_accepted_id)?;

        info!(
            chain_id = %self.ctx.chain_id,
            last_accepted = %last_accepted_id,
            height = last_accepted.height(),
            "starting consensus"
        );
        self.ctx.set_state(ChainState::NormalOp)?;
        self.vm.set_state(ChainState::NormalOp)?;
        self.build_blocks()
    }

    fn put(&mut self, node_id: NodeId, request_id: u32, container: Vec<u8>) -> Result<()> {
        let block = match self.vm.parse_block(&container) {
            Ok(block) => block,
            Err(err) => {
                debug!(%node_id, request_id, error = %err, "failed to parse block");
                return self.get_failed(node_id, request_id);
            }
        };

        // A different block than requested fails the request, so nothing
        // stays blocked on the one that never came.
        let block_id = block.id();
        if let Some(expected) = self.block_requests.remove(&node_id, request_id) {
            if expected != block_id {
                debug!(%node_id, request_id, %expected, %block_id, "unexpected block in Put");
                self.abandon(&expected);
                return self.build_blocks();
            }
        }

        self.issue_from(node_id, block)?;
        self.build_blocks()
    }

    fn get_failed(&mut self, node_id: NodeId, request_id: u32) -> Result<()> {
        let Some(block_id) = self.block_requests.remove(&node_id, request_id) else {
            debug!(%node_id, request_id, "unexpected GetFailed");
            return Ok(());
        };
        self.abandon(&block_id);
        self.build_blocks()
    }

    fn pull_query(&mut self, node_id: NodeId, request_id: u32, container_id: Id) -> Result<()> {
        self.send_chits(node_id, request_id);
        self.issue_from_by_id(node_id, container_id)?;
        self.build_blocks()
    }

    fn push_query(&mut self, node_id: NodeId, request_id: u32, container: Vec<u8>) -> Result<()> {
        self.send_chits(node_id, request_id);
        let block = match self.vm.parse_block(&container) {
            Ok(block) => block,
            Err(err) => {
                debug!(%node_id, request_id, error = %err, "failed to parse block in PushQuery");
                return Ok(());
            }
        };
        self.issue_from(node_id, block)?;
        self.build_blocks()
    }

    fn chits(&mut self, node_id: NodeId, request_id: u32, votes: Vec<Id>) -> Result<()> {
        let Some(&block_id) = votes.first() else {
            debug!(%node_id, request_id, "received empty Chits");
            return self.query_failed(node_id, request_id);
        };

        let issued = match self.get_block(&block_id) {
            Ok(block) => {
                self.consensus.processing(&block_id) || self.consensus.decided(&*block)
            }
            Err(_) => false,
        };
        let results = if issued {
            self.polls.vote(request_id, &node_id, block_id)
        } else {
            // The vote can't be counted for a block consensus hasn't seen.
            debug!(%node_id, request_id, %block_id, "dropping vote for unissued block");
            self.issue_from_by_id(node_id, block_id)?;
            self.polls.drop(request_id, &node_id)
        };
        self.record_results(results)?;
        self.build_blocks()
    }

    fn query_failed(&mut self, node_id: NodeId, request_id: u32) -> Result<()> {
        let results = self.polls.drop(request_id, &node_id);
        self.record_results(results)?;
        self.build_blocks()
    }

    fn gossip(&mut self) -> Result<()> {
        let block_id = self.vm.last_accepted()?;
        let block = self.vm.get_block(&block_id)?;
        trace!(%block_id, "gossiping accepted block");
        self.sender.send_gossip(block.bytes());
        Ok(())
    }

    fn notify(&mut self, msg: VmMessage) -> Result<()> {
        match msg {
            VmMessage::PendingTxs => {
                self.pending_build_blocks += 1;
                self.build_blocks()
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
