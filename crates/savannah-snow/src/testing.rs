//! In-memory doubles for the VM, network, and timer seams.
//!
//! Compiled for unit tests and behind the `testing` feature for the
//! integration tests.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use savannah_ids::{Id, NodeId};

use crate::choices::Status;
use crate::common::{BootstrapConfig, CommonConfig, Sender, Timeouts};
use crate::context::{ChainState, ConsensusContext};
use crate::subnet::Subnet;
use crate::validators::ValidatorSet;
use crate::vm::{
    Block, BlockRef, ChainVm, CommonVm, DagVm, StateSummary, StateSummaryRef, Tx, TxRef, Vertex,
    VmError, VmResult,
};

pub fn node(byte: u8) -> NodeId {
    NodeId::from_slice(&[byte; 20]).unwrap()
}

pub fn chain_id() -> Id {
    Id::from_hash(b"test chain")
}

/// Everything a test needs to drive a gear built from a [`CommonConfig`].
pub struct TestEnv {
    pub config: CommonConfig,
    pub sender: Arc<TestSender>,
    pub timeouts: Arc<TestTimeouts>,
}

/// A common config over `beacons`, with a subnet holding only the test chain.
pub fn test_env(beacons: &[(NodeId, u64)], bootstrap: BootstrapConfig) -> TestEnv {
    let ctx = Arc::new(ConsensusContext::new(chain_id(), Id::EMPTY, node(0)));
    let validators = Arc::new(ValidatorSet::with_seed(0));
    for (node_id, weight) in beacons {
        validators.add_weight(*node_id, *weight).unwrap();
    }
    let subnet = Arc::new(Subnet::new(Id::EMPTY));
    subnet.add_chain(chain_id());
    let sender = Arc::new(TestSender::default());
    let timeouts = Arc::new(TestTimeouts::default());
    let config = CommonConfig::new(
        ctx,
        validators,
        sender.clone(),
        subnet,
        timeouts.clone(),
        bootstrap,
    );
    TestEnv {
        config,
        sender,
        timeouts,
    }
}

pub fn test_config(beacons: &[(NodeId, u64)]) -> (CommonConfig, Arc<TestSender>) {
    let env = test_env(beacons, BootstrapConfig::default());
    (env.config, env.sender)
}

/// An outbound message captured by [`TestSender`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentMessage {
    GetStateSummaryFrontier {
        node_ids: Vec<NodeId>,
        request_id: u32,
    },
    GetAcceptedStateSummary {
        node_ids: Vec<NodeId>,
        request_id: u32,
        heights: Vec<u64>,
    },
    GetAcceptedFrontier {
        node_ids: Vec<NodeId>,
        request_id: u32,
    },
    AcceptedFrontier {
        node_id: NodeId,
        request_id: u32,
        container_ids: Vec<Id>,
    },
    GetAccepted {
        node_ids: Vec<NodeId>,
        request_id: u32,
        container_ids: Vec<Id>,
    },
    Accepted {
        node_id: NodeId,
        request_id: u32,
        container_ids: Vec<Id>,
    },
    GetAncestors {
        node_id: NodeId,
        request_id: u32,
        container_id: Id,
    },
    Ancestors {
        node_id: NodeId,
        request_id: u32,
        containers: Vec<Vec<u8>>,
    },
    Get {
        node_id: NodeId,
        request_id: u32,
        container_id: Id,
    },
    Put {
        node_id: NodeId,
        request_id: u32,
        container: Vec<u8>,
    },
    PushQuery {
        node_ids: Vec<NodeId>,
        request_id: u32,
        container: Vec<u8>,
    },
    PullQuery {
        node_ids: Vec<NodeId>,
        request_id: u32,
        container_id: Id,
    },
    Chits {
        node_id: NodeId,
        request_id: u32,
        votes: Vec<Id>,
    },
    Gossip {
        container: Vec<u8>,
    },
}

/// Records every outbound message in send order.
#[derive(Debug, Default)]
pub struct TestSender {
    sent: Mutex<Vec<SentMessage>>,
}

impl TestSender {
    /// Drains the messages sent so far.
    pub fn take(&self) -> Vec<SentMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    fn record(&self, msg: SentMessage) {
        self.sent.lock().push(msg);
    }
}

fn listed(node_ids: &BTreeSet<NodeId>) -> Vec<NodeId> {
    node_ids.iter().copied().collect()
}

impl Sender for TestSender {
    fn send_get_state_summary_frontier(&self, node_ids: &BTreeSet<NodeId>, request_id: u32) {
        self.record(SentMessage::GetStateSummaryFrontier {
            node_ids: listed(node_ids),
            request_id,
        });
    }

    fn send_get_accepted_state_summary(
        &self,
        node_ids: &BTreeSet<NodeId>,
        request_id: u32,
        heights: &[u64],
    ) {
        self.record(SentMessage::GetAcceptedStateSummary {
            node_ids: listed(node_ids),
            request_id,
            heights: heights.to_vec(),
        });
    }

    fn send_get_accepted_frontier(&self, node_ids: &BTreeSet<NodeId>, request_id: u32) {
        self.record(SentMessage::GetAcceptedFrontier {
            node_ids: listed(node_ids),
            request_id,
        });
    }

    fn send_accepted_frontier(&self, node_id: NodeId, request_id: u32, container_ids: Vec<Id>) {
        self.record(SentMessage::AcceptedFrontier {
            node_id,
            request_id,
            container_ids,
        });
    }

    fn send_get_accepted(
        &self,
        node_ids: &BTreeSet<NodeId>,
        request_id: u32,
        container_ids: &[Id],
    ) {
        self.record(SentMessage::GetAccepted {
            node_ids: listed(node_ids),
            request_id,
            container_ids: container_ids.to_vec(),
        });
    }

    fn send_accepted(&self, node_id: NodeId, request_id: u32, container_ids: Vec<Id>) {
        self.record(SentMessage::Accepted {
            node_id,
            request_id,
            container_ids,
        });
    }

    fn send_get_ancestors(&self, node_id: NodeId, request_id: u32, container_id: Id) {
        self.record(SentMessage::GetAncestors {
            node_id,
            request_id,
            container_id,
        });
    }

    fn send_ancestors(&self, node_id: NodeId, request_id: u32, containers: Vec<Vec<u8>>) {
        self.record(SentMessage::Ancestors {
            node_id,
            request_id,
            containers,
        });
    }

    fn send_get(&self, node_id: NodeId, request_id: u32, container_id: Id) {
        self.record(SentMessage::Get {
            node_id,
            request_id,
            container_id,
        });
    }

    fn send_put(&self, node_id: NodeId, request_id: u32, container: Vec<u8>) {
        self.record(SentMessage::Put {
            node_id,
            request_id,
            container,
        });
    }

    fn send_push_query(&self, node_ids: &BTreeSet<NodeId>, request_id: u32, container: Vec<u8>) {
        self.record(SentMessage::PushQuery {
            node_ids: listed(node_ids),
            request_id,
            container,
        });
    }

    fn send_pull_query(&self, node_ids: &BTreeSet<NodeId>, request_id: u32, container_id: Id) {
        self.record(SentMessage::PullQuery {
            node_ids: listed(node_ids),
            request_id,
            container_id,
        });
    }

    fn send_chits(&self, node_id: NodeId, request_id: u32, votes: Vec<Id>) {
        self.record(SentMessage::Chits {
            node_id,
            request_id,
            votes,
        });
    }

    fn send_gossip(&self, container: Vec<u8>) {
        self.record(SentMessage::Gossip { container });
    }
}

/// Records requested timeouts instead of scheduling them.
#[derive(Debug, Default)]
pub struct TestTimeouts {
    registered: Mutex<Vec<Duration>>,
}

impl TestTimeouts {
    pub fn take(&self) -> Vec<Duration> {
        std::mem::take(&mut *self.registered.lock())
    }
}

impl Timeouts for TestTimeouts {
    fn register_timeout(&self, delay: Duration) {
        self.registered.lock().push(delay);
    }
}

#[derive(Debug)]
pub struct TestBlock {
    id: Id,
    parent: Id,
    height: u64,
    bytes: Vec<u8>,
    status: Mutex<Status>,
    fail_verify: AtomicBool,
}

impl TestBlock {
    fn build(parent: Id, height: u64, seed: u64, status: Status) -> Arc<Self> {
        let mut bytes = b"block".to_vec();
        bytes.extend_from_slice(parent.as_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.extend_from_slice(&seed.to_be_bytes());
        Arc::new(Self {
            id: Id::from_hash(&bytes),
            parent,
            height,
            bytes,
            status: Mutex::new(status),
            fail_verify: AtomicBool::new(false),
        })
    }

    /// An accepted block at height zero.
    pub fn genesis() -> Arc<Self> {
        Self::build(Id::EMPTY, 0, 0, Status::Accepted)
    }

    /// A processing block on top of `parent`. Distinct seeds give siblings
    /// distinct IDs.
    pub fn child(parent: &TestBlock, seed: u64) -> Arc<Self> {
        Self::build(parent.id, parent.height + 1, seed, Status::Processing)
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn status(&self) -> Status {
        *self.status.lock()
    }

    pub fn set_status(&self, status: Status) {
        *self.status.lock() = status;
    }

    /// Makes every later `verify` fail.
    pub fn fail_verify(&self) {
        self.fail_verify.store(true, Ordering::Relaxed);
    }
}

impl Block for TestBlock {
    fn id(&self) -> Id {
        self.id
    }

    fn parent(&self) -> Id {
        self.parent
    }

    fn height(&self) -> u64 {
        self.height
    }

    fn bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    fn status(&self) -> Status {
        *self.status.lock()
    }

    fn verify(&self) -> VmResult<()> {
        if self.fail_verify.load(Ordering::Relaxed) {
            return Err(VmError::Invalid(format!("block {} is invalid", self.id)));
        }
        Ok(())
    }

    fn accept(&self) -> VmResult<()> {
        self.set_status(Status::Accepted);
        Ok(())
    }

    fn reject(&self) -> VmResult<()> {
        self.set_status(Status::Rejected);
        Ok(())
    }
}

#[derive(Debug)]
pub struct TestSummary {
    id: Id,
    height: u64,
    bytes: Vec<u8>,
    accepted: AtomicBool,
}

impl TestSummary {
    pub fn new(height: u64) -> Arc<Self> {
        let mut bytes = b"summary".to_vec();
        bytes.extend_from_slice(&height.to_be_bytes());
        Arc::new(Self {
            id: Id::from_hash(&bytes),
            height,
            bytes,
            accepted: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn was_accepted(&self) -> bool {
        self.accepted.load(Ordering::Relaxed)
    }
}

impl StateSummary for TestSummary {
    fn id(&self) -> Id {
        self.id
    }

    fn height(&self) -> u64 {
        self.height
    }

    fn bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    fn accept(&self) -> VmResult<bool> {
        self.accepted.store(true, Ordering::Relaxed);
        Ok(true)
    }
}

#[derive(Default)]
struct TestVmState {
    /// Blocks stored locally
    blocks: HashMap<Id, Arc<TestBlock>>,
    /// Blocks `parse_block` recognizes, keyed by bytes
    parseable: HashMap<Vec<u8>, Arc<TestBlock>>,
    summaries: HashMap<Vec<u8>, Arc<TestSummary>>,
    to_build: VecDeque<Arc<TestBlock>>,
    preference: Id,
    states: Vec<ChainState>,
    state_sync_enabled: bool,
}

/// A chain VM over blocks held in memory.
pub struct TestVm {
    state: Mutex<TestVmState>,
}

impl TestVm {
    pub fn new(genesis: Arc<TestBlock>) -> Self {
        let vm = Self {
            state: Mutex::new(TestVmState::default()),
        };
        vm.add_block(genesis);
        vm
    }

    /// Stores `block` locally.
    pub fn add_block(&self, block: Arc<TestBlock>) {
        let mut state = self.state.lock();
        state.parseable.insert(block.bytes.clone(), Arc::clone(&block));
        state.blocks.insert(block.id, block);
    }

    /// Lets `block` be parsed without storing it.
    pub fn add_parseable(&self, block: Arc<TestBlock>) {
        self.state.lock().parseable.insert(block.bytes.clone(), block);
    }

    /// Queues `block` to be returned by the next `build_block`.
    pub fn queue_build(&self, block: Arc<TestBlock>) {
        self.state.lock().to_build.push_back(block);
    }

    pub fn add_summary(&self, summary: Arc<TestSummary>) {
        self.state.lock().summaries.insert(summary.bytes.clone(), summary);
    }

    pub fn enable_state_sync(&self) {
        self.state.lock().state_sync_enabled = true;
    }

    pub fn preference(&self) -> Id {
        self.state.lock().preference
    }

    /// Every state the VM was moved to, in order.
    pub fn states(&self) -> Vec<ChainState> {
        self.state.lock().states.clone()
    }
}

impl CommonVm for TestVm {
    fn set_state(&self, state: ChainState) -> VmResult<()> {
        self.state.lock().states.push(state);
        Ok(())
    }

    fn health_check(&self) -> VmResult<serde_json::Value> {
        Ok(serde_json::json!({ "blocks": self.state.lock().blocks.len() }))
    }
}

impl ChainVm for TestVm {
    fn parse_block(&self, bytes: &[u8]) -> VmResult<BlockRef> {
        let mut state = self.state.lock();
        let Some(block) = state.parseable.get(bytes).cloned() else {
            return Err(VmError::Invalid("unknown block bytes".into()));
        };
        let block = state.blocks.entry(block.id).or_insert(block).clone();
        Ok(block)
    }

    fn get_block(&self, id: &Id) -> VmResult<BlockRef> {
        match self.state.lock().blocks.get(id) {
            Some(block) => Ok(block.clone()),
            None => Err(VmError::NotFound(*id)),
        }
    }

    fn last_accepted(&self) -> VmResult<Id> {
        self.state
            .lock()
            .blocks
            .values()
            .filter(|block| block.status() == Status::Accepted)
            .max_by_key(|block| block.height)
            .map(|block| block.id)
            .ok_or_else(|| VmError::Internal("no accepted block".into()))
    }

    fn build_block(&self) -> VmResult<BlockRef> {
        let mut state = self.state.lock();
        let Some(block) = state.to_build.pop_front() else {
            return Err(VmError::Internal("nothing to build".into()));
        };
        state.parseable.insert(block.bytes.clone(), Arc::clone(&block));
        state.blocks.insert(block.id, Arc::clone(&block));
        Ok(block)
    }

    fn set_preference(&self, id: &Id) -> VmResult<()> {
        self.state.lock().preference = *id;
        Ok(())
    }

    fn state_sync_enabled(&self) -> VmResult<bool> {
        Ok(self.state.lock().state_sync_enabled)
    }

    fn parse_state_summary(&self, bytes: &[u8]) -> VmResult<StateSummaryRef> {
        match self.state.lock().summaries.get(bytes) {
            Some(summary) => Ok(summary.clone()),
            None => Err(VmError::Invalid("unknown summary bytes".into())),
        }
    }
}

#[derive(Debug)]
pub struct TestTx {
    id: Id,
    bytes: Vec<u8>,
    inputs: Vec<Id>,
    dependencies: Vec<Id>,
    status: Mutex<Status>,
    fail_verify: AtomicBool,
}

impl TestTx {
    /// A processing tx consuming `inputs` that must follow `dependencies`.
    pub fn new(seed: u64, inputs: Vec<Id>, dependencies: Vec<Id>) -> Arc<Self> {
        let mut bytes = b"tx".to_vec();
        bytes.extend_from_slice(&seed.to_be_bytes());
        Arc::new(Self {
            id: Id::from_hash(&bytes),
            bytes,
            inputs,
            dependencies,
            status: Mutex::new(Status::Processing),
            fail_verify: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn status(&self) -> Status {
        *self.status.lock()
    }

    pub fn fail_verify(&self) {
        self.fail_verify.store(true, Ordering::Relaxed);
    }
}

impl Tx for TestTx {
    fn id(&self) -> Id {
        self.id
    }

    fn bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    fn status(&self) -> Status {
        *self.status.lock()
    }

    fn dependencies(&self) -> Vec<Id> {
        self.dependencies.clone()
    }

    fn input_ids(&self) -> Vec<Id> {
        self.inputs.clone()
    }

    fn verify(&self) -> VmResult<()> {
        if self.fail_verify.load(Ordering::Relaxed) {
            return Err(VmError::Invalid(format!("tx {} is invalid", self.id)));
        }
        Ok(())
    }

    fn accept(&self) -> VmResult<()> {
        *self.status.lock() = Status::Accepted;
        Ok(())
    }

    fn reject(&self) -> VmResult<()> {
        *self.status.lock() = Status::Rejected;
        Ok(())
    }
}

/// A vertex that exists only in memory, for driving DAG consensus directly.
pub struct TestVertex {
    id: Id,
    height: u64,
    parents: Vec<Id>,
    txs: Vec<Arc<TestTx>>,
    status: Mutex<Status>,
}

impl TestVertex {
    pub fn accepted(seed: u64) -> Arc<Self> {
        Arc::new(Self {
            id: Id::from_hash(format!("vertex{seed}").as_bytes()),
            height: 0,
            parents: Vec::new(),
            txs: Vec::new(),
            status: Mutex::new(Status::Accepted),
        })
    }

    pub fn new(seed: u64, parents: &[&Arc<TestVertex>], txs: Vec<Arc<TestTx>>) -> Arc<Self> {
        Arc::new(Self {
            id: Id::from_hash(format!("vertex{seed}").as_bytes()),
            height: parents.iter().map(|p| p.height).max().unwrap_or(0) + 1,
            parents: parents.iter().map(|p| p.id).collect(),
            txs,
            status: Mutex::new(Status::Processing),
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn status(&self) -> Status {
        *self.status.lock()
    }
}

impl Vertex for TestVertex {
    fn id(&self) -> Id {
        self.id
    }

    fn bytes(&self) -> Vec<u8> {
        self.id.as_bytes().to_vec()
    }

    fn status(&self) -> Status {
        *self.status.lock()
    }

    fn height(&self) -> u64 {
        self.height
    }

    fn parent_ids(&self) -> Vec<Id> {
        self.parents.clone()
    }

    fn txs(&self) -> VmResult<Vec<TxRef>> {
        Ok(self.txs.iter().map(|tx| Arc::clone(tx) as TxRef).collect())
    }

    fn accept(&self) -> VmResult<()> {
        *self.status.lock() = Status::Accepted;
        Ok(())
    }

    fn reject(&self) -> VmResult<()> {
        *self.status.lock() = Status::Rejected;
        Ok(())
    }
}

#[derive(Default)]
struct TestDagVmState {
    txs: HashMap<Id, Arc<TestTx>>,
    parseable: HashMap<Vec<u8>, Arc<TestTx>>,
    pending: Vec<Arc<TestTx>>,
    states: Vec<ChainState>,
}

/// A DAG VM over transactions held in memory.
#[derive(Default)]
pub struct TestDagVm {
    state: Mutex<TestDagVmState>,
}

impl TestDagVm {
    /// Lets `tx` be parsed. Parsing stores it.
    pub fn add_parseable(&self, tx: Arc<TestTx>) {
        self.state.lock().parseable.insert(tx.bytes.clone(), tx);
    }

    /// Queues `tx` for the next `pending_txs`.
    pub fn add_pending(&self, tx: Arc<TestTx>) {
        let mut state = self.state.lock();
        state.parseable.insert(tx.bytes.clone(), Arc::clone(&tx));
        state.txs.insert(tx.id, Arc::clone(&tx));
        state.pending.push(tx);
    }

    pub fn states(&self) -> Vec<ChainState> {
        self.state.lock().states.clone()
    }
}

impl CommonVm for TestDagVm {
    fn set_state(&self, state: ChainState) -> VmResult<()> {
        self.state.lock().states.push(state);
        Ok(())
    }
}

impl DagVm for TestDagVm {
    fn parse_tx(&self, bytes: &[u8]) -> VmResult<TxRef> {
        let mut state = self.state.lock();
        let Some(tx) = state.parseable.get(bytes).cloned() else {
            return Err(VmError::Invalid("unknown tx bytes".into()));
        };
        let tx = state.txs.entry(tx.id).or_insert(tx).clone();
        Ok(tx)
    }

    fn get_tx(&self, id: &Id) -> VmResult<TxRef> {
        match self.state.lock().txs.get(id) {
            Some(tx) => Ok(tx.clone()),
            None => Err(VmError::NotFound(*id)),
        }
    }

    fn pending_txs(&self) -> Vec<TxRef> {
        std::mem::take(&mut self.state.lock().pending)
            .into_iter()
            .map(|tx| tx as TxRef)
            .collect()
    }
}
