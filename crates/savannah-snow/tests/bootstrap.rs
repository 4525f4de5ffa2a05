use std::sync::Arc;

use parking_lot::Mutex;
use savannah_db::MemDb;
use savannah_ids::{Id, NodeId};
use savannah_snow::choices::Status;
use savannah_snow::codec::Codecs;
use savannah_snow::common::{BootstrapConfig, Engine, OnFinished};
use savannah_snow::context::ChainState;
use savannah_snow::snowman::bootstrap::Config;
use savannah_snow::snowman::Bootstrapper;
use savannah_snow::testing::{node, test_env, SentMessage, TestBlock, TestEnv, TestVm};
use savannah_snow::validators::Connector;
use savannah_snow::vm::{
    Block, BlockRef, ChainVm, CommonVm, StateSummaryRef, VmResult,
};
use savannah_snow::ConsensusError;

/// A block that logs its acceptance.
struct Recorded {
    inner: BlockRef,
    log: Arc<Mutex<Vec<Id>>>,
}

impl Block for Recorded {
    fn id(&self) -> Id {
        self.inner.id()
    }

    fn parent(&self) -> Id {
        self.inner.parent()
    }

    fn height(&self) -> u64 {
        self.inner.height()
    }

    fn bytes(&self) -> Vec<u8> {
        self.inner.bytes()
    }

    fn status(&self) -> Status {
        self.inner.status()
    }

    fn verify(&self) -> VmResult<()> {
        self.inner.verify()
    }

    fn accept(&self) -> VmResult<()> {
        self.inner.accept()?;
        self.log.lock().push(self.inner.id());
        Ok(())
    }

    fn reject(&self) -> VmResult<()> {
        self.inner.reject()
    }
}

/// A [`TestVm`] that records the order blocks are accepted in.
struct RecordingVm {
    inner: TestVm,
    accepted: Arc<Mutex<Vec<Id>>>,
}

impl RecordingVm {
    fn wrap(&self, block: BlockRef) -> BlockRef {
        Arc::new(Recorded {
            inner: block,
            log: Arc::clone(&self.accepted),
        })
    }

    fn accepted(&self) -> Vec<Id> {
        self.accepted.lock().clone()
    }
}

impl CommonVm for RecordingVm {
    fn set_state(&self, state: ChainState) -> VmResult<()> {
        self.inner.set_state(state)
    }
}

impl ChainVm for RecordingVm {
    fn parse_block(&self, bytes: &[u8]) -> VmResult<BlockRef> {
        Ok(self.wrap(self.inner.parse_block(bytes)?))
    }

    fn get_block(&self, id: &Id) -> VmResult<BlockRef> {
        Ok(self.wrap(self.inner.get_block(id)?))
    }

    fn last_accepted(&self) -> VmResult<Id> {
        self.inner.last_accepted()
    }

    fn build_block(&self) -> VmResult<BlockRef> {
        self.inner.build_block()
    }

    fn set_preference(&self, id: &Id) -> VmResult<()> {
        self.inner.set_preference(id)
    }

    fn parse_state_summary(&self, bytes: &[u8]) -> VmResult<StateSummaryRef> {
        self.inner.parse_state_summary(bytes)
    }
}

struct Harness {
    env: TestEnv,
    vm: Arc<RecordingVm>,
    db: Arc<MemDb>,
    /// Genesis followed by A, B, C
    chain: Vec<Arc<TestBlock>>,
    finished: Arc<Mutex<Vec<u32>>>,
}

impl Harness {
    /// Every beacon is connected. The VM can parse A, B and C but stores
    /// only genesis.
    fn new(beacons: &[(NodeId, u64)]) -> Self {
        let env = test_env(beacons, BootstrapConfig::default());
        for (node_id, _) in beacons {
            env.config.startup_tracker.connected(*node_id).unwrap();
        }
        let genesis = TestBlock::genesis();
        let inner = TestVm::new(genesis.clone());
        let mut chain = vec![genesis];
        for seed in 1..=3 {
            let block = TestBlock::child(chain.last().unwrap(), seed);
            inner.add_parseable(block.clone());
            chain.push(block);
        }
        let vm = Arc::new(RecordingVm {
            inner,
            accepted: Arc::default(),
        });
        Self {
            env,
            vm,
            db: Arc::new(MemDb::new()),
            chain,
            finished: Arc::default(),
        }
    }

    fn bootstrapper(&self) -> Bootstrapper {
        let finished = Arc::clone(&self.finished);
        let on_finished: OnFinished = Box::new(move |request_id| {
            finished.lock().push(request_id);
            Ok(())
        });
        let config = Config {
            common: self.env.config.clone(),
            db: self.db.clone(),
            codecs: Arc::new(Codecs::new().unwrap()),
            vm: self.vm.clone(),
        };
        Bootstrapper::new(config, on_finished).unwrap()
    }

    fn ids(&self) -> (Id, Id, Id) {
        (self.chain[1].id(), self.chain[2].id(), self.chain[3].id())
    }

    fn bytes(&self, index: usize) -> Vec<u8> {
        self.chain[index].bytes()
    }

    /// The single `GetAncestors` sent since the last call.
    fn ancestors_request(&self) -> (NodeId, u32, Id) {
        let sent = self.env.sender.take();
        match &sent[..] {
            [SentMessage::GetAncestors {
                node_id,
                request_id,
                container_id,
            }] => (*node_id, *request_id, *container_id),
            other => panic!("expected one GetAncestors, got {other:?}"),
        }
    }

    fn ancestors_requests(&self) -> Vec<(NodeId, Id)> {
        self.env
            .sender
            .take()
            .into_iter()
            .map(|msg| match msg {
                SentMessage::GetAncestors {
                    node_id,
                    container_id,
                    ..
                } => (node_id, container_id),
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }
}

#[test]
fn test_blocks_accepted_parent_first_when_fetched_one_by_one() {
    let h = Harness::new(&[(node(1), 1)]);
    let mut bootstrapper = h.bootstrapper();
    let (a, b, c) = h.ids();

    bootstrapper.force_accepted(vec![c]).unwrap();
    let (peer, request_id, wanted) = h.ancestors_request();
    assert_eq!(wanted, c);

    // Each response carries a single block, newest first.
    bootstrapper.ancestors(peer, request_id, vec![h.bytes(3)]).unwrap();
    let (peer, request_id, wanted) = h.ancestors_request();
    assert_eq!(wanted, b);
    assert!(h.vm.accepted().is_empty());

    bootstrapper.ancestors(peer, request_id, vec![h.bytes(2)]).unwrap();
    let (peer, request_id, wanted) = h.ancestors_request();
    assert_eq!(wanted, a);
    assert!(h.vm.accepted().is_empty());
    assert_eq!(bootstrapper.num_queued(), 2);

    bootstrapper.ancestors(peer, request_id, vec![h.bytes(1)]).unwrap();
    assert_eq!(h.vm.accepted(), vec![a, b, c]);
    assert_eq!(h.vm.last_accepted().unwrap(), c);
    assert!(bootstrapper.missing_ids().is_empty());
    assert_eq!(bootstrapper.num_queued(), 0);
}

#[test]
fn test_blocks_accepted_parent_first_when_fetched_together() {
    let h = Harness::new(&[(node(1), 1)]);
    let mut bootstrapper = h.bootstrapper();
    let (a, b, c) = h.ids();

    bootstrapper.force_accepted(vec![c]).unwrap();
    let (peer, request_id, _) = h.ancestors_request();
    bootstrapper
        .ancestors(peer, request_id, vec![h.bytes(3), h.bytes(2), h.bytes(1)])
        .unwrap();
    assert_eq!(h.vm.accepted(), vec![a, b, c]);
    for block in &h.chain {
        assert_eq!(block.status(), Status::Accepted);
    }
}

#[test]
fn test_duplicate_frontier_fetched_and_accepted_once() {
    let h = Harness::new(&[(node(1), 1), (node(2), 1)]);
    let mut bootstrapper = h.bootstrapper();
    let (a, b, c) = h.ids();

    bootstrapper.force_accepted(vec![c, c]).unwrap();
    let (peer, request_id, wanted) = h.ancestors_request();
    assert_eq!(wanted, c);
    assert_eq!(bootstrapper.missing_ids(), vec![c]);

    bootstrapper
        .ancestors(peer, request_id, vec![h.bytes(3), h.bytes(2), h.bytes(1)])
        .unwrap();
    assert_eq!(h.vm.accepted(), vec![a, b, c]);

    // The same response again is not expected anymore.
    bootstrapper
        .ancestors(peer, request_id, vec![h.bytes(3), h.bytes(2), h.bytes(1)])
        .unwrap();
    assert_eq!(h.vm.accepted(), vec![a, b, c]);
    assert_eq!(bootstrapper.metrics().snapshot().accepted, 3);
}

#[test]
fn test_restart_resumes_the_same_fetch() {
    let h = Harness::new(&[(node(1), 1)]);
    let (a, b, c) = h.ids();
    {
        let mut bootstrapper = h.bootstrapper();
        bootstrapper.force_accepted(vec![c]).unwrap();
        let (peer, request_id, _) = h.ancestors_request();
        bootstrapper.ancestors(peer, request_id, vec![h.bytes(3)]).unwrap();
        let (_, _, wanted) = h.ancestors_request();
        assert_eq!(wanted, b);
        // Crash while B is in flight.
    }

    let mut restarted = h.bootstrapper();
    assert_eq!(restarted.missing_ids(), vec![b]);
    assert_eq!(restarted.num_queued(), 1);

    restarted.force_accepted(Vec::new()).unwrap();
    let (peer, request_id, wanted) = h.ancestors_request();
    assert_eq!(wanted, b);

    restarted
        .ancestors(peer, request_id, vec![h.bytes(2), h.bytes(1)])
        .unwrap();
    assert_eq!(h.vm.accepted(), vec![a, b, c]);
    assert!(restarted.missing_ids().is_empty());
}

#[test]
fn test_concurrent_fetches_spread_over_peers() {
    let h = Harness::new(&[(node(1), 1), (node(2), 1), (node(3), 1)]);
    let mut bootstrapper = h.bootstrapper();
    let wanted: Vec<Id> = (0u8..4).map(|i| Id::from_hash(&[i])).collect();

    bootstrapper.force_accepted(wanted.clone()).unwrap();
    let requests = h.ancestors_requests();
    let peers: Vec<NodeId> = requests.iter().map(|(peer, _)| *peer).collect();
    // Three distinct peers, then the pool is reset and the fourth fetch
    // reuses one of them.
    assert_eq!(peers, vec![node(1), node(2), node(3), node(1)]);

    let mut fetched: Vec<Id> = requests.iter().map(|(_, id)| *id).collect();
    fetched.sort();
    let mut expected = wanted;
    expected.sort();
    assert_eq!(fetched, expected);
}

#[test]
fn test_fetch_without_connected_peers_fails() {
    let env = test_env(&[(node(1), 1)], BootstrapConfig::default());
    let genesis = TestBlock::genesis();
    let block = TestBlock::child(&genesis, 1);
    let h = Harness {
        env,
        vm: Arc::new(RecordingVm {
            inner: TestVm::new(genesis.clone()),
            accepted: Arc::default(),
        }),
        db: Arc::new(MemDb::new()),
        chain: vec![genesis, block.clone()],
        finished: Arc::default(),
    };
    let mut bootstrapper = h.bootstrapper();
    assert!(matches!(
        bootstrapper.force_accepted(vec![block.id()]),
        Err(ConsensusError::NoPeers(id)) if id == block.id()
    ));
    assert!(h.env.sender.take().is_empty());
}

#[test]
fn test_empty_ancestors_refetches_from_another_peer() {
    let h = Harness::new(&[(node(1), 1), (node(2), 1), (node(3), 1)]);
    let mut bootstrapper = h.bootstrapper();
    let (_, _, c) = h.ids();

    bootstrapper.force_accepted(vec![c]).unwrap();
    let (peer, request_id, _) = h.ancestors_request();
    assert_eq!(peer, node(1));

    bootstrapper.ancestors(peer, request_id, Vec::new()).unwrap();
    assert_eq!(
        h.env.sender.take(),
        vec![SentMessage::GetAncestors {
            node_id: node(2),
            request_id: request_id + 1,
            container_id: c,
        }]
    );
    assert_eq!(bootstrapper.missing_ids(), vec![c]);
    assert!(h.finished.lock().is_empty());
}
