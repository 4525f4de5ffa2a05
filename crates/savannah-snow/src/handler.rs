//! The per-chain message loop.
//!
//! A chain's gears are driven by a single tokio task. Peer messages arrive on
//! a bounded queue, while timers, VM notifications, gear hand-offs, and
//! control requests arrive on an unbounded internal queue that is always
//! drained first. Requests for this chain's containers are served by the
//! getter in every state; everything else goes to the active gear.

use std::sync::Arc;
use std::time::Duration;

use savannah_ids::{Id, NodeId};
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, trace};

use crate::common::{Engine, GetServer, Halter, HandlerTimeouts, OnFinished};
use crate::context::{ChainState, ConsensusContext};
use crate::message::{InboundMessage, InternalMessage, VmMessage};
use crate::validators::Connector;
use crate::vm::CommonVm;
use crate::{ConsensusError, Result};

/// Peer messages buffered per chain before senders wait.
pub const DEFAULT_INBOUND_CAPACITY: usize = 1024;

/// Queues feeding one chain's handler.
///
/// Created before the chain's gears so that their timers and completion
/// callbacks can report back to the handler.
pub struct HandlerChannels {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    internal_tx: UnboundedSender<InternalMessage>,
    internal_rx: UnboundedReceiver<InternalMessage>,
}

impl HandlerChannels {
    pub fn new(inbound_capacity: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity.max(1));
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx,
            inbound_rx,
            internal_tx,
            internal_rx,
        }
    }

    /// Timers delivered to the handler's active gear.
    pub fn timeouts(&self) -> Arc<HandlerTimeouts> {
        Arc::new(HandlerTimeouts::new(self.internal_tx.clone()))
    }

    /// Completion callback for the state syncer.
    pub fn on_state_sync_finished(&self) -> OnFinished {
        let internal = self.internal_tx.clone();
        Box::new(move |request_id| {
            internal
                .send(InternalMessage::StateSyncFinished { request_id })
                .map_err(|_| ConsensusError::HandlerClosed)
        })
    }

    /// Completion callback for the bootstrapper.
    pub fn on_bootstrap_finished(&self) -> OnFinished {
        let internal = self.internal_tx.clone();
        Box::new(move |request_id| {
            internal
                .send(InternalMessage::BootstrapFinished { request_id })
                .map_err(|_| ConsensusError::HandlerClosed)
        })
    }
}

impl Default for HandlerChannels {
    fn default() -> Self {
        Self::new(DEFAULT_INBOUND_CAPACITY)
    }
}

/// The parts of a chain a handler drives.
pub struct HandlerConfig {
    pub ctx: Arc<ConsensusContext>,
    pub vm: Arc<dyn CommonVm>,
    /// Peer tracking that gates the start of bootstrapping
    pub peers: Arc<dyn Connector>,
    pub halter: Arc<Halter>,
    pub getter: Box<dyn GetServer>,
    pub state_syncer: Option<Box<dyn Engine>>,
    pub bootstrapper: Box<dyn Engine>,
    pub engine: Box<dyn Engine>,
    /// How often the consensus engine gossips its accepted frontier
    pub gossip_frequency: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gear {
    StateSyncer,
    Bootstrapper,
    Engine,
}

pub struct Handler {
    ctx: Arc<ConsensusContext>,
    vm: Arc<dyn CommonVm>,
    peers: Arc<dyn Connector>,
    halter: Arc<Halter>,
    getter: Box<dyn GetServer>,
    state_syncer: Option<Box<dyn Engine>>,
    bootstrapper: Box<dyn Engine>,
    engine: Box<dyn Engine>,
    current: Gear,
    gossip_frequency: Duration,
    inbound: mpsc::Receiver<InboundMessage>,
    internal: UnboundedReceiver<InternalMessage>,
}

impl Handler {
    pub fn new(config: HandlerConfig, channels: HandlerChannels) -> (Self, ChainHandle) {
        let handle = ChainHandle {
            ctx: Arc::clone(&config.ctx),
            inbound: channels.inbound_tx,
            internal: channels.internal_tx,
        };
        let current = if config.state_syncer.is_some() {
            Gear::StateSyncer
        } else {
            Gear::Bootstrapper
        };
        let handler = Self {
            ctx: config.ctx,
            vm: config.vm,
            peers: config.peers,
            halter: config.halter,
            getter: config.getter,
            state_syncer: config.state_syncer,
            bootstrapper: config.bootstrapper,
            engine: config.engine,
            current,
            gossip_frequency: config.gossip_frequency,
            inbound: channels.inbound_rx,
            internal: channels.internal_rx,
        };
        (handler, handle)
    }

    /// Starts the chain's first gear and processes messages until shutdown.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that stopped the chain.
    pub async fn run(mut self) -> Result<()> {
        let chain_id = self.ctx.chain_id;
        if let Err(err) = self.gear_mut().start(0) {
            return self.fail(err);
        }

        let mut gossip = time::interval_at(
            time::Instant::now() + self.gossip_frequency,
            self.gossip_frequency.max(Duration::from_millis(1)),
        );
        gossip.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let result = tokio::select! {
                biased;
                msg = self.internal.recv() => match msg {
                    Some(InternalMessage::Shutdown) | None => break,
                    Some(msg) => self.handle_internal(msg),
                },
                Some(msg) = self.inbound.recv() => self.handle_inbound(msg),
                _ = gossip.tick() => self.handle_gossip(),
            };
            match result {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return self.fail(err),
                Err(err) => debug!(%chain_id, error = %err, "dropped message"),
            }
        }
        self.stop()
    }

    fn gear_mut(&mut self) -> &mut dyn Engine {
        match (self.current, self.state_syncer.as_mut()) {
            (Gear::StateSyncer, Some(syncer)) => syncer.as_mut(),
            (Gear::StateSyncer, None) | (Gear::Bootstrapper, _) => self.bootstrapper.as_mut(),
            (Gear::Engine, _) => self.engine.as_mut(),
        }
    }

    fn gear(&self) -> &dyn Engine {
        match (self.current, self.state_syncer.as_ref()) {
            (Gear::StateSyncer, Some(syncer)) => syncer.as_ref(),
            (Gear::StateSyncer, None) | (Gear::Bootstrapper, _) => self.bootstrapper.as_ref(),
            (Gear::Engine, _) => self.engine.as_ref(),
        }
    }

    fn handle_internal(&mut self, msg: InternalMessage) -> Result<()> {
        match msg {
            InternalMessage::Timeout => self.gear_mut().timeout(),
            InternalMessage::Gossip => self.handle_gossip(),
            InternalMessage::Notify(msg) => self.gear_mut().notify(msg),
            InternalMessage::StateSyncFinished { request_id } => {
                if self.current != Gear::StateSyncer {
                    debug!(request_id, "dropping unexpected state sync completion");
                    return Ok(());
                }
                self.current = Gear::Bootstrapper;
                self.bootstrapper.start(request_id)
            }
            InternalMessage::BootstrapFinished { request_id } => {
                if self.current != Gear::Bootstrapper {
                    debug!(request_id, "dropping unexpected bootstrap completion");
                    return Ok(());
                }
                self.current = Gear::Engine;
                self.engine.start(request_id)
            }
            InternalMessage::HealthCheck(reply) => {
                self.answer_health_check(reply);
                Ok(())
            }
            // Handled by the run loop.
            InternalMessage::Shutdown => Ok(()),
        }
    }

    fn handle_gossip(&mut self) -> Result<()> {
        if self.current != Gear::Engine {
            return Ok(());
        }
        self.engine.gossip()
    }

    fn answer_health_check(&self, reply: oneshot::Sender<serde_json::Value>) {
        let details = match self.gear().health_check() {
            Ok(details) => details,
            Err(err) => json!({ "error": err.to_string() }),
        };
        let report = json!({
            "state": self.ctx.state(),
            "bootstrapped": self.ctx.is_bootstrapped(),
            "gear": self.gear().gear(),
            "details": details,
        });
        if reply.send(report).is_err() {
            trace!("health check requester went away");
        }
    }

    fn handle_inbound(&mut self, msg: InboundMessage) -> Result<()> {
        trace!(chain_id = %self.ctx.chain_id, op = %msg.op(), node_id = %msg.node_id(), "handling message");
        match msg {
            InboundMessage::GetStateSummaryFrontier {
                node_id,
                request_id,
            } => self.getter.get_state_summary_frontier(node_id, request_id),
            InboundMessage::GetAcceptedStateSummary {
                node_id,
                request_id,
                heights,
            } => self
                .getter
                .get_accepted_state_summary(node_id, request_id, heights),
            InboundMessage::GetAcceptedFrontier {
                node_id,
                request_id,
            } => self.getter.get_accepted_frontier(node_id, request_id),
            InboundMessage::GetAccepted {
                node_id,
                request_id,
                container_ids,
            } => self.getter.get_accepted(node_id, request_id, container_ids),
            InboundMessage::GetAncestors {
                node_id,
                request_id,
                container_id,
            } => self.getter.get_ancestors(node_id, request_id, container_id),
            InboundMessage::Get {
                node_id,
                request_id,
                container_id,
            } => self.getter.get(node_id, request_id, container_id),

            InboundMessage::StateSummaryFrontier {
                node_id,
                request_id,
                summary,
            } => self
                .gear_mut()
                .state_summary_frontier(node_id, request_id, summary),
            InboundMessage::GetStateSummaryFrontierFailed {
                node_id,
                request_id,
            } => self
                .gear_mut()
                .get_state_summary_frontier_failed(node_id, request_id),
            InboundMessage::AcceptedStateSummary {
                node_id,
                request_id,
                summary_ids,
            } => self
                .gear_mut()
                .accepted_state_summary(node_id, request_id, summary_ids),
            InboundMessage::GetAcceptedStateSummaryFailed {
                node_id,
                request_id,
            } => self
                .gear_mut()
                .get_accepted_state_summary_failed(node_id, request_id),
            InboundMessage::AcceptedFrontier {
                node_id,
                request_id,
                container_ids,
            } => self
                .gear_mut()
                .accepted_frontier(node_id, request_id, container_ids),
            InboundMessage::GetAcceptedFrontierFailed {
                node_id,
                request_id,
            } => self
                .gear_mut()
                .get_accepted_frontier_failed(node_id, request_id),
            InboundMessage::Accepted {
                node_id,
                request_id,
                container_ids,
            } => self.gear_mut().accepted(node_id, request_id, container_ids),
            InboundMessage::GetAcceptedFailed {
                node_id,
                request_id,
            } => self.gear_mut().get_accepted_failed(node_id, request_id),
            InboundMessage::Ancestors {
                node_id,
                request_id,
                containers,
            } => self.gear_mut().ancestors(node_id, request_id, containers),
            InboundMessage::GetAncestorsFailed {
                node_id,
                request_id,
            } => self.gear_mut().get_ancestors_failed(node_id, request_id),
            InboundMessage::Put {
                node_id,
                request_id,
                container,
            } => self.gear_mut().put(node_id, request_id, container),
            InboundMessage::GetFailed {
                node_id,
                request_id,
            } => self.gear_mut().get_failed(node_id, request_id),
            InboundMessage::PushQuery {
                node_id,
                request_id,
                container,
            } => self.gear_mut().push_query(node_id, request_id, container),
            InboundMessage::PullQuery {
                node_id,
                request_id,
                container_id,
            } => self.gear_mut().pull_query(node_id, request_id, container_id),
            InboundMessage::Chits {
                node_id,
                request_id,
                votes,
            } => self.gear_mut().chits(node_id, request_id, votes),
            InboundMessage::QueryFailed {
                node_id,
                request_id,
            } => self.gear_mut().query_failed(node_id, request_id),

            InboundMessage::Connected { node_id } => self.connected(node_id),
            InboundMessage::Disconnected { node_id } => self.disconnected(node_id),
        }
    }

    fn connected(&mut self, node_id: NodeId) -> Result<()> {
        self.vm.connected(&node_id)?;
        self.peers.connected(node_id)?;
        self.gear_mut().connected(node_id)
    }

    fn disconnected(&mut self, node_id: NodeId) -> Result<()> {
        self.vm.disconnected(&node_id)?;
        self.peers.disconnected(node_id)?;
        self.gear_mut().disconnected(node_id)
    }

    fn fail(mut self, err: ConsensusError) -> Result<()> {
        error!(chain_id = %self.ctx.chain_id, error = %err, "chain stopped by fatal error");
        self.ctx.record_failure(&err);
        if let Err(shutdown_err) = self.stop() {
            debug!(error = %shutdown_err, "failed to shut down after fatal error");
        }
        Err(err)
    }

    fn stop(&mut self) -> Result<()> {
        info!(chain_id = %self.ctx.chain_id, gear = self.gear().gear(), "shutting down chain");
        self.halter.halt();
        self.inbound.close();
        self.gear_mut().shutdown()
    }
}

/// Cloneable handle used to reach a running chain.
#[derive(Clone)]
pub struct ChainHandle {
    ctx: Arc<ConsensusContext>,
    inbound: mpsc::Sender<InboundMessage>,
    internal: UnboundedSender<InternalMessage>,
}

impl ChainHandle {
    pub fn chain_id(&self) -> Id {
        self.ctx.chain_id
    }

    pub fn subnet_id(&self) -> Id {
        self.ctx.subnet_id
    }

    pub fn state(&self) -> ChainState {
        self.ctx.state()
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.ctx.is_bootstrapped()
    }

    /// The fatal error that stopped the chain, if it failed.
    pub fn failure(&self) -> Option<String> {
        self.ctx.failure()
    }

    /// Queues a peer message, waiting while the chain's queue is full.
    ///
    /// # Errors
    ///
    /// Fails once the chain stopped.
    pub async fn push(&self, msg: InboundMessage) -> Result<()> {
        self.inbound
            .send(msg)
            .await
            .map_err(|_| ConsensusError::HandlerClosed)
    }

    /// Queues a peer message unless the chain's queue is full.
    ///
    /// Returns false if the message was dropped.
    pub fn try_push(&self, msg: InboundMessage) -> bool {
        match self.inbound.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                debug!(chain_id = %self.ctx.chain_id, op = %msg.op(), "dropping message, queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Forwards a VM notification to the active gear.
    ///
    /// # Errors
    ///
    /// Fails once the chain stopped.
    pub fn notify(&self, msg: VmMessage) -> Result<()> {
        self.send_internal(InternalMessage::Notify(msg))
    }

    /// The chain's state and the active gear's health report.
    ///
    /// # Errors
    ///
    /// Fails once the chain stopped.
    pub async fn health_check(&self) -> Result<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        self.send_internal(InternalMessage::HealthCheck(tx))?;
        rx.await.map_err(|_| ConsensusError::HandlerClosed)
    }

    /// Asks the chain to stop after the messages already queued internally.
    ///
    /// # Errors
    ///
    /// Fails if the chain already stopped.
    pub fn shutdown(&self) -> Result<()> {
        self.send_internal(InternalMessage::Shutdown)
    }

    fn send_internal(&self, msg: InternalMessage) -> Result<()> {
        self.internal
            .send(msg)
            .map_err(|_| ConsensusError::HandlerClosed)
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::common::BootstrapConfig;
    use crate::testing::{chain_id, node, test_env, SentMessage, TestBlock, TestVm};

    /// Records the calls a gear receives.
    struct Recorder {
        name: &'static str,
        calls: Arc<Mutex<Vec<String>>>,
        on_start: Option<OnFinished>,
    }

    impl Engine for Recorder {
        fn gear(&self) -> &'static str {
            self.name
        }

        fn start(&mut self, request_id: u32) -> Result<()> {
            self.calls.lock().push(format!("{}.start({request_id})", self.name));
            match self.on_start.as_mut() {
                Some(on_finished) => on_finished(request_id + 5),
                None => Ok(()),
            }
        }

        fn chits(&mut self, node_id: NodeId, request_id: u32, _votes: Vec<Id>) -> Result<()> {
            self.calls.lock().push(format!("{}.chits({request_id})", self.name));
            if node_id == node(9) {
                return Err(ConsensusError::InvalidState {
                    expected: "a sane peer".into(),
                    actual: "poison".into(),
                });
            }
            Ok(())
        }

        fn connected(&mut self, _node_id: NodeId) -> Result<()> {
            self.calls.lock().push(format!("{}.connected", self.name));
            Ok(())
        }

        fn notify(&mut self, msg: VmMessage) -> Result<()> {
            self.calls.lock().push(format!("{}.notify({msg:?})", self.name));
            Ok(())
        }

        fn health_check(&self) -> Result<serde_json::Value> {
            Ok(json!({ "gear": self.name }))
        }

        fn shutdown(&mut self) -> Result<()> {
            self.calls.lock().push(format!("{}.shutdown", self.name));
            Ok(())
        }
    }

    struct Setup {
        handler: Handler,
        handle: ChainHandle,
        calls: Arc<Mutex<Vec<String>>>,
        sender: Arc<crate::testing::TestSender>,
    }

    /// A chain whose state syncer and bootstrapper finish as soon as they
    /// start, each advancing the request ID by five.
    fn setup() -> Setup {
        let env = test_env(&[(node(1), 1)], BootstrapConfig::default());
        let channels = HandlerChannels::default();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorder = |name: &'static str, on_start: Option<OnFinished>| {
            Box::new(Recorder {
                name,
                calls: Arc::clone(&calls),
                on_start,
            }) as Box<dyn Engine>
        };
        let vm = Arc::new(TestVm::new(TestBlock::genesis()));
        let config = HandlerConfig {
            ctx: Arc::clone(&env.config.ctx),
            vm: vm.clone(),
            peers: env.config.startup_tracker.clone(),
            halter: Arc::clone(&env.config.halter),
            getter: Box::new(crate::snowman::Getter::new(
                vm,
                env.sender.clone(),
                BootstrapConfig::default(),
            )),
            state_syncer: Some(recorder("syncer", Some(channels.on_state_sync_finished()))),
            bootstrapper: recorder("bootstrapper", Some(channels.on_bootstrap_finished())),
            engine: recorder("engine", None),
            gossip_frequency: Duration::from_secs(3600),
        };
        let (handler, handle) = Handler::new(config, channels);
        Setup {
            handler,
            handle,
            calls,
            sender: env.sender,
        }
    }

    /// Yields to the handler task until `done` holds.
    async fn eventually(mut done: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if done() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition never held");
    }

    fn saw(calls: &Mutex<Vec<String>>, call: &str) -> bool {
        calls.lock().iter().any(|c| c == call)
    }

    #[tokio::test]
    async fn test_gears_hand_off_in_order() {
        let Setup {
            handler,
            handle,
            calls,
            ..
        } = setup();
        let task = tokio::spawn(handler.run());
        eventually(|| saw(&calls, "engine.start(10)")).await;
        assert_eq!(handle.state(), ChainState::Initializing);

        handle.notify(VmMessage::PendingTxs).unwrap();
        handle
            .push(InboundMessage::Chits {
                node_id: node(1),
                request_id: 11,
                votes: vec![],
            })
            .await
            .unwrap();
        eventually(|| saw(&calls, "engine.chits(11)")).await;
        let health = handle.health_check().await.unwrap();
        assert_eq!(health["gear"], "engine");
        assert_eq!(health["details"]["gear"], "engine");

        handle.shutdown().unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(
            *calls.lock(),
            vec![
                "syncer.start(0)",
                "bootstrapper.start(5)",
                "engine.start(10)",
                "engine.notify(PendingTxs)",
                "engine.chits(11)",
                "engine.shutdown",
            ]
        );
        assert!(handle.push(InboundMessage::Connected { node_id: node(1) }).await.is_err());
    }

    #[tokio::test]
    async fn test_requests_served_by_getter() {
        let Setup {
            handler,
            handle,
            sender,
            ..
        } = setup();
        let task = tokio::spawn(handler.run());
        handle
            .push(InboundMessage::GetAcceptedFrontier {
                node_id: node(2),
                request_id: 4,
            })
            .await
            .unwrap();
        let mut sent = Vec::new();
        eventually(|| {
            sent.extend(sender.take());
            !sent.is_empty()
        })
        .await;
        handle.shutdown().unwrap();
        task.await.unwrap().unwrap();

        assert!(matches!(
            &sent[..],
            [SentMessage::AcceptedFrontier { request_id: 4, container_ids, .. }] if container_ids.len() == 1
        ));
    }

    #[tokio::test]
    async fn test_connected_reaches_gear() {
        let Setup {
            handler,
            handle,
            calls,
            ..
        } = setup();
        let task = tokio::spawn(handler.run());
        eventually(|| saw(&calls, "engine.start(10)")).await;
        handle
            .push(InboundMessage::Connected { node_id: node(1) })
            .await
            .unwrap();
        eventually(|| saw(&calls, "engine.connected")).await;
        handle.shutdown().unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fatal_error_stops_chain() {
        let Setup {
            handler,
            handle,
            calls,
            ..
        } = setup();
        let task = tokio::spawn(handler.run());
        handle
            .push(InboundMessage::Chits {
                node_id: node(9),
                request_id: 1,
                votes: vec![],
            })
            .await
            .unwrap();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(ConsensusError::InvalidState { .. })));
        assert_eq!(calls.lock().last().map(String::as_str), Some("engine.shutdown"));
        assert!(handle.health_check().await.is_err());
        assert!(handle.failure().is_some_and(|failure| failure.contains("poison")));
        assert_eq!(handle.chain_id(), chain_id());
    }
}
