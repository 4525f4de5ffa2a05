//! A single node running one chain over the loopback network.

use std::sync::Arc;

use savannah_db::MemDb;
use savannah_ids::{Id, NodeId};
use savannah_snow::codec::Codecs;
use savannah_snow::message::{InboundMessage, VmMessage};
use savannah_snow::validators::ValidatorSet;
use savannah_snow::{ChainParameters, ChainVmKind, Manager, ManagerConfig};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, NodeConfig, PeerWeight};
use crate::network::{LoopbackSender, Routed};
use crate::vm::DevVm;

pub struct Node {
    config: NodeConfig,
    node_id: NodeId,
    chain_id: Id,
    vm: Arc<DevVm>,
    manager: Arc<Manager>,
    router: JoinHandle<()>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Node {
    /// Creates the node and starts its chain.
    pub async fn new(config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| NodeError::InitError(format!("failed to create data dir: {e}")))?;

        let node_id = match config.node_id {
            Some(node_id) => node_id,
            None => Self::load_or_create_node_id(&config)?,
        };
        info!(%node_id, "node ID");

        let codecs = Codecs::new().map_err(|e| NodeError::InitError(e.to_string()))?;
        let mut manager_config = ManagerConfig::new(node_id, Arc::new(MemDb::new()), Arc::new(codecs));
        manager_config.params = config.consensus.clone();
        manager_config.bootstrap = config.bootstrap.clone();
        manager_config.gossip_frequency = config.gossip_frequency();
        let manager = Manager::new(manager_config);

        let (tx, rx) = mpsc::unbounded_channel();
        let router = tokio::spawn(route(Arc::clone(&manager), rx));

        let vm = Arc::new(
            DevVm::new(config.chain.genesis.as_bytes())
                .map_err(|e| NodeError::ChainError(e.to_string()))?,
        );
        let chain_id = Id::from_hash(config.chain.name.as_bytes());
        manager.create_chain(ChainParameters {
            id: chain_id,
            subnet_id: Id::EMPTY,
            vm: ChainVmKind::Snowman(vm.clone()),
            beacons: peer_set(&config.beacons, node_id)?,
            validators: peer_set(&config.validators, node_id)?,
            sender: Arc::new(LoopbackSender::new(node_id, chain_id, tx)),
        });
        manager
            .route(&chain_id, InboundMessage::Connected { node_id })
            .await
            .map_err(|e| NodeError::ChainError(e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        Ok(Self {
            config,
            node_id,
            chain_id,
            vm,
            manager,
            router,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Loads the node ID from the data directory, creating one if absent.
    fn load_or_create_node_id(config: &NodeConfig) -> Result<NodeId, NodeError> {
        let path = config.node_id_path();
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| NodeError::InitError(format!("failed to read node ID: {e}")))?;
            return content
                .trim()
                .parse()
                .map_err(|e| NodeError::InitError(format!("invalid node ID: {e}")));
        }

        let node_id = NodeId::from_slice(&rand::random::<[u8; 20]>())
            .map_err(|e| NodeError::InitError(format!("failed to create node ID: {e}")))?;
        std::fs::write(&path, node_id.to_string())
            .map_err(|e| NodeError::InitError(format!("failed to write node ID: {e}")))?;
        Ok(node_id)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn vm(&self) -> Arc<DevVm> {
        Arc::clone(&self.vm)
    }

    /// Returns a handle that stops [`Node::run`].
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Feeds the VM a payload every block interval until shut down or the
    /// stop height is accepted.
    pub async fn run(mut self) -> Result<(), NodeError> {
        let mut ticker = tokio::time::interval(self.config.block_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut submitted = 0u64;

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("ctrl+c received, shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let height = self.vm.last_accepted_height();
                    if self.config.chain.stop_height.is_some_and(|stop| height >= stop) {
                        info!(height, "reached stop height");
                        break;
                    }
                    let Some(chain) = self.manager.chain(&self.chain_id) else {
                        return Err(NodeError::ChainError(format!("chain {} is not running", self.chain_id)));
                    };
                    if !chain.is_bootstrapped() {
                        debug!(state = ?chain.state(), "waiting for the chain to bootstrap");
                        continue;
                    }
                    submitted += 1;
                    self.vm.submit(format!("payload {submitted}").into_bytes());
                    chain
                        .notify(VmMessage::PendingTxs)
                        .map_err(|e| NodeError::ChainError(e.to_string()))?;
                }
            }
        }

        self.shutdown().await
    }

    async fn shutdown(self) -> Result<(), NodeError> {
        info!("shutting down node");
        let health = self.manager.health_check().await;
        info!(%health, "final chain health");

        let result = self.manager.shutdown().await;
        self.router.abort();
        result.map_err(|e| NodeError::ChainError(e.to_string()))?;
        info!("node stopped");
        Ok(())
    }
}

async fn route(manager: Arc<Manager>, mut rx: mpsc::UnboundedReceiver<Routed>) {
    while let Some((chain_id, msg)) = rx.recv().await {
        if let Err(err) = manager.route(&chain_id, msg).await {
            warn!(%chain_id, error = %err, "failed to route message");
        }
    }
}

/// The configured peers, or just this node when none are listed.
fn peer_set(peers: &[PeerWeight], node_id: NodeId) -> Result<Arc<ValidatorSet>, NodeError> {
    let set = ValidatorSet::new();
    if peers.is_empty() {
        set.add_weight(node_id, 1)
            .map_err(|e| NodeError::InitError(e.to_string()))?;
    }
    for peer in peers {
        set.add_weight(peer.node_id, peer.weight)
            .map_err(|e| NodeError::InitError(e.to_string()))?;
    }
    Ok(Arc::new(set))
}

/// Node errors.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("initialization error: {0}")]
    InitError(String),
    #[error("chain error: {0}")]
    ChainError(String),
}
