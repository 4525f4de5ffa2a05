use std::sync::Arc;

use savannah_ids::{Id, NodeId};
use savannah_snow::choices::Status;
use savannah_snow::common::Engine;
use savannah_snow::context::ConsensusContext;
use savannah_snow::message::VmMessage;
use savannah_snow::snowman::transitive::Config;
use savannah_snow::snowman::Transitive;
use savannah_snow::testing::{chain_id, node, SentMessage, TestBlock, TestSender, TestVm};
use savannah_snow::validators::ValidatorSet;
use savannah_snow::vm::{Block, ChainVm};
use savannah_snow::Parameters;

struct Network {
    engine: Transitive,
    vm: Arc<TestVm>,
    sender: Arc<TestSender>,
    genesis: Arc<TestBlock>,
}

/// Three validators of weight one, sampled two at a time. One of the two is
/// pushed the block and the other pulls it.
fn three_validators() -> Network {
    let params = Parameters {
        k: 2,
        alpha: 2,
        beta_virtuous: 1,
        beta_rogue: 1,
        concurrent_repolls: 1,
        mixed_query_num_push_vdr: 1,
        ..Parameters::default()
    };
    let validators = Arc::new(ValidatorSet::with_seed(7));
    for byte in 1..=3 {
        validators.add_weight(node(byte), 1).unwrap();
    }
    let genesis = TestBlock::genesis();
    let vm = Arc::new(TestVm::new(genesis.clone()));
    let sender = Arc::new(TestSender::default());
    let mut engine = Transitive::new(Config {
        ctx: Arc::new(ConsensusContext::new(chain_id(), Id::EMPTY, node(0))),
        vm: vm.clone(),
        sender: sender.clone(),
        validators,
        params,
    })
    .unwrap();
    engine.start(0).unwrap();
    Network {
        engine,
        vm,
        sender,
        genesis,
    }
}

/// Builds a block on genesis and returns the query sent for it as
/// `(push target, pull target, request ID)`.
fn issue_block(net: &mut Network) -> (Arc<TestBlock>, NodeId, NodeId, u32) {
    let block = TestBlock::child(&net.genesis, 1);
    net.vm.queue_build(block.clone());
    net.engine.notify(VmMessage::PendingTxs).unwrap();
    assert!(net.engine.consensus().processing(&block.id()));

    let sent = net.sender.take();
    let [SentMessage::PushQuery {
        node_ids: push,
        request_id,
        container,
    }, SentMessage::PullQuery {
        node_ids: pull,
        request_id: pull_request_id,
        container_id,
    }] = &sent[..]
    else {
        panic!("expected a push and a pull query, got {sent:?}");
    };
    assert_eq!((push.len(), pull.len()), (1, 1));
    assert_ne!(push[0], pull[0]);
    assert_eq!(request_id, pull_request_id);
    assert_eq!(*container, block.bytes());
    assert_eq!(*container_id, block.id());
    (block, push[0], pull[0], *request_id)
}

#[test]
fn test_block_accepted_after_one_alpha_poll() {
    let mut net = three_validators();
    let (block, pushed, pulled, request_id) = issue_block(&mut net);

    net.engine.chits(pushed, request_id, vec![block.id()]).unwrap();
    assert_eq!(block.status(), Status::Processing);

    net.engine.chits(pulled, request_id, vec![block.id()]).unwrap();
    assert_eq!(block.status(), Status::Accepted);
    assert_eq!(net.vm.preference(), block.id());
    assert_eq!(net.vm.last_accepted().unwrap(), block.id());

    let metrics = net.engine.metrics().snapshot();
    assert_eq!(metrics.polls_successful, 1);
    assert_eq!(metrics.accepted, 1);
    assert_eq!(net.engine.consensus().num_processing(), 0);
    // Nothing is left processing, so no further poll is sent.
    assert!(net.sender.take().is_empty());
}

#[test]
fn test_poll_below_alpha_keeps_block_processing() {
    let mut net = three_validators();
    let (block, pushed, pulled, request_id) = issue_block(&mut net);

    net.engine.chits(pushed, request_id, vec![block.id()]).unwrap();
    net.engine.query_failed(pulled, request_id).unwrap();
    assert_eq!(block.status(), Status::Processing);
    assert_eq!(net.engine.metrics().snapshot().polls_failed, 1);

    // The block is polled again.
    let sent = net.sender.take();
    let [SentMessage::PullQuery {
        node_ids,
        request_id: repoll_id,
        container_id,
    }] = &sent[..]
    else {
        panic!("expected a repoll, got {sent:?}");
    };
    assert_eq!(node_ids.len(), 2);
    assert_eq!(*repoll_id, request_id + 1);
    assert_eq!(*container_id, block.id());

    for node_id in node_ids {
        net.engine.chits(*node_id, *repoll_id, vec![block.id()]).unwrap();
    }
    assert_eq!(block.status(), Status::Accepted);
}
