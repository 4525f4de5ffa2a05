//! Creation and supervision of a node's chains.
//!
//! Every chain gets its own handler task. Chains other than the primary one
//! are held back until the primary chain's subnet has bootstrapped, since
//! they depend on the validator state it syncs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use savannah_db::{Database, PrefixDb};
use savannah_ids::{Id, NodeId};
use savannah_utils::errors::ErrorCollection;
use savannah_utils::Errors;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::avalanche;
use crate::codec::Codecs;
use crate::common::{BootstrapConfig, CommonConfig, Engine, GetServer, Sender};
use crate::context::ConsensusContext;
use crate::handler::{ChainHandle, Handler, HandlerChannels, HandlerConfig, DEFAULT_INBOUND_CAPACITY};
use crate::message::InboundMessage;
use crate::parameters::Parameters;
use crate::snowman;
use crate::subnet::Subnet;
use crate::syncer::{self, StateSyncer};
use crate::validators::ValidatorSet;
use crate::vm::{AnyVm, ChainVm, DagVm};
use crate::{ConsensusError, Result};

const BOOTSTRAP_PREFIX: &[u8] = b"bootstrap";
const VERTEX_STATE_PREFIX: &[u8] = b"vertex_state";

/// Node-wide settings every chain is built with.
pub struct ManagerConfig {
    pub node_id: NodeId,
    pub params: Parameters,
    pub bootstrap: BootstrapConfig,
    /// Each chain's data lives under its ID in this database
    pub db: Arc<dyn Database>,
    pub codecs: Arc<Codecs>,
    pub inbound_capacity: usize,
    pub gossip_frequency: Duration,
    /// Chain whose subnet must bootstrap before any other chain is created.
    /// Every chain is created right away if unset.
    pub primary_chain: Option<Id>,
}

impl ManagerConfig {
    pub fn new(node_id: NodeId, db: Arc<dyn Database>, codecs: Arc<Codecs>) -> Self {
        Self {
            node_id,
            params: Parameters::default(),
            bootstrap: BootstrapConfig::default(),
            db,
            codecs,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            gossip_frequency: Duration::from_secs(10),
            primary_chain: None,
        }
    }
}

/// The VM a chain runs, which decides the consensus it uses.
#[derive(Clone)]
pub enum ChainVmKind {
    /// A linear chain decided by Snowman.
    Snowman(Arc<dyn ChainVm>),
    /// A DAG of transactions decided by Avalanche.
    Avalanche(Arc<dyn DagVm>),
}

/// Everything needed to create one chain.
#[derive(Clone)]
pub struct ChainParameters {
    pub id: Id,
    pub subnet_id: Id,
    pub vm: ChainVmKind,
    /// Peers trusted to report the accepted frontier while bootstrapping
    pub beacons: Arc<ValidatorSet>,
    /// Peers sampled by consensus
    pub validators: Arc<ValidatorSet>,
    pub sender: Arc<dyn Sender>,
}

struct RunningChain {
    handle: ChainHandle,
    task: Option<JoinHandle<Result<()>>>,
}

#[derive(Default)]
struct State {
    unblocked: bool,
    blocked: Vec<ChainParameters>,
    subnets: HashMap<Id, Arc<Subnet>>,
    chains: BTreeMap<Id, RunningChain>,
}

pub struct Manager {
    config: ManagerConfig,
    state: Mutex<State>,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let unblocked = config.primary_chain.is_none();
        Arc::new(Self {
            config,
            state: Mutex::new(State {
                unblocked,
                ..State::default()
            }),
        })
    }

    /// Creates the chain now, or once the primary subnet has bootstrapped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn create_chain(self: &Arc<Self>, params: ChainParameters) {
        {
            let mut state = self.state.lock();
            if !state.unblocked && Some(params.id) != self.config.primary_chain {
                debug!(chain_id = %params.id, "holding chain until the primary subnet bootstraps");
                state.blocked.push(params);
                return;
            }
        }
        self.force_create_chain(params);
    }

    /// Creates the chain regardless of the primary subnet's state. A chain
    /// that fails to build is logged and left out.
    pub fn force_create_chain(self: &Arc<Self>, params: ChainParameters) {
        let chain_id = params.id;
        if let Err(err) = self.try_create_chain(params) {
            error!(%chain_id, error = %err, "error creating chain");
        }
    }

    fn try_create_chain(self: &Arc<Self>, params: ChainParameters) -> Result<()> {
        let chain_id = params.id;
        let subnet = {
            let mut state = self.state.lock();
            if state.chains.contains_key(&chain_id) {
                debug!(%chain_id, reason = "already created", "skipping chain creation");
                return Ok(());
            }
            let subnet = state
                .subnets
                .entry(params.subnet_id)
                .or_insert_with(|| Arc::new(Subnet::new(params.subnet_id)));
            Arc::clone(subnet)
        };
        info!(%chain_id, subnet_id = %params.subnet_id, "creating chain");
        subnet.add_chain(chain_id);

        let (handler, handle) = match self.build_chain(&params, &subnet) {
            Ok(built) => built,
            Err(err) => {
                subnet.remove_chain(&chain_id);
                return Err(err);
            }
        };

        let task = tokio::spawn(async move {
            let result = handler.run().await;
            if let Err(err) = &result {
                error!(%chain_id, error = %err, "chain stopped");
            }
            result
        });
        self.state.lock().chains.insert(
            chain_id,
            RunningChain {
                handle,
                task: Some(task),
            },
        );

        if Some(chain_id) == self.config.primary_chain {
            self.unblock_after_bootstrap(&subnet);
        }
        Ok(())
    }

    /// Creates the held chains once `subnet` has bootstrapped.
    fn unblock_after_bootstrap(self: &Arc<Self>, subnet: &Subnet) {
        let mut done = subnet.on_bootstrap_completed();
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    return;
                }
            }
            if let Some(manager) = manager.upgrade() {
                manager.unblock_chains();
            }
        });
    }

    fn unblock_chains(self: &Arc<Self>) {
        let blocked = {
            let mut state = self.state.lock();
            state.unblocked = true;
            std::mem::take(&mut state.blocked)
        };
        info!(num_chains = blocked.len(), "primary subnet bootstrapped, creating held chains");
        for params in blocked {
            self.force_create_chain(params);
        }
    }

    fn build_chain(
        &self,
        params: &ChainParameters,
        subnet: &Arc<Subnet>,
    ) -> Result<(Handler, ChainHandle)> {
        let ctx = Arc::new(ConsensusContext::new(
            params.id,
            params.subnet_id,
            self.config.node_id,
        ));
        let chain_db: Arc<dyn Database> =
            Arc::new(PrefixDb::new(Arc::clone(&self.config.db), params.id.as_bytes()));
        let channels = HandlerChannels::new(self.config.inbound_capacity);
        let common = CommonConfig::new(
            Arc::clone(&ctx),
            Arc::clone(&params.beacons),
            Arc::clone(&params.sender),
            Arc::clone(subnet),
            channels.timeouts(),
            self.config.bootstrap.clone(),
        );

        let gears = match &params.vm {
            ChainVmKind::Snowman(vm) => {
                self.snowman_gears(params, &ctx, &common, &chain_db, vm, &channels)?
            }
            ChainVmKind::Avalanche(vm) => {
                self.avalanche_gears(params, &ctx, &common, &chain_db, vm, &channels)?
            }
        };
        let config = HandlerConfig {
            ctx,
            vm: Arc::new(match &params.vm {
                ChainVmKind::Snowman(vm) => AnyVm::Chain(Arc::clone(vm)),
                ChainVmKind::Avalanche(vm) => AnyVm::Dag(Arc::clone(vm)),
            }),
            peers: common.startup_tracker.clone(),
            halter: Arc::clone(&common.halter),
            getter: gears.getter,
            state_syncer: gears.state_syncer,
            bootstrapper: gears.bootstrapper,
            engine: gears.engine,
            gossip_frequency: self.config.gossip_frequency,
        };
        Ok(Handler::new(config, channels))
    }

    fn snowman_gears(
        &self,
        params: &ChainParameters,
        ctx: &Arc<ConsensusContext>,
        common: &CommonConfig,
        chain_db: &Arc<dyn Database>,
        vm: &Arc<dyn ChainVm>,
        channels: &HandlerChannels,
    ) -> Result<Gears> {
        let state_syncer = StateSyncer::new(
            syncer::Config {
                common: common.clone(),
                vm: Arc::clone(vm),
            },
            channels.on_state_sync_finished(),
        );
        let bootstrapper = snowman::Bootstrapper::new(
            snowman::bootstrap::Config {
                common: common.clone(),
                db: Arc::new(PrefixDb::new(Arc::clone(chain_db), BOOTSTRAP_PREFIX)),
                codecs: Arc::clone(&self.config.codecs),
                vm: Arc::clone(vm),
            },
            channels.on_bootstrap_finished(),
        )?;
        let engine = snowman::Transitive::new(snowman::transitive::Config {
            ctx: Arc::clone(ctx),
            vm: Arc::clone(vm),
            sender: Arc::clone(&params.sender),
            validators: Arc::clone(&params.validators),
            params: self.config.params.clone(),
        })?;
        Ok(Gears {
            getter: Box::new(snowman::Getter::new(
                Arc::clone(vm),
                Arc::clone(&params.sender),
                self.config.bootstrap.clone(),
            )),
            state_syncer: Some(Box::new(state_syncer)),
            bootstrapper: Box::new(bootstrapper),
            engine: Box::new(engine),
        })
    }

    fn avalanche_gears(
        &self,
        params: &ChainParameters,
        ctx: &Arc<ConsensusContext>,
        common: &CommonConfig,
        chain_db: &Arc<dyn Database>,
        vm: &Arc<dyn DagVm>,
        channels: &HandlerChannels,
    ) -> Result<Gears> {
        let manager = Arc::new(avalanche::Serializer::new(
            params.id,
            Arc::new(PrefixDb::new(Arc::clone(chain_db), VERTEX_STATE_PREFIX)),
            Arc::clone(&self.config.codecs),
            Arc::clone(vm),
        )?);
        let bootstrapper = avalanche::Bootstrapper::new(
            avalanche::bootstrap::Config {
                common: common.clone(),
                db: Arc::new(PrefixDb::new(Arc::clone(chain_db), BOOTSTRAP_PREFIX)),
                codecs: Arc::clone(&self.config.codecs),
                manager: manager.clone(),
                vm: Arc::clone(vm),
            },
            channels.on_bootstrap_finished(),
        )?;
        let engine = avalanche::Transitive::new(avalanche::transitive::Config {
            ctx: Arc::clone(ctx),
            vm: Arc::clone(vm),
            manager: manager.clone(),
            sender: Arc::clone(&params.sender),
            validators: Arc::clone(&params.validators),
            params: self.config.params.clone(),
        })?;
        Ok(Gears {
            getter: Box::new(avalanche::Getter::new(
                manager,
                Arc::clone(&params.sender),
                self.config.bootstrap.clone(),
            )),
            state_syncer: None,
            bootstrapper: Box::new(bootstrapper),
            engine: Box::new(engine),
        })
    }

    /// Handle of a running chain.
    pub fn chain(&self, chain_id: &Id) -> Option<ChainHandle> {
        self.state
            .lock()
            .chains
            .get(chain_id)
            .map(|chain| chain.handle.clone())
    }

    /// Chains created so far, in ID order.
    pub fn chain_ids(&self) -> Vec<Id> {
        self.state.lock().chains.keys().copied().collect()
    }

    /// Chains held until the primary subnet bootstraps.
    pub fn num_blocked(&self) -> usize {
        self.state.lock().blocked.len()
    }

    /// # Errors
    ///
    /// Fails for a chain that was never created.
    pub fn subnet_id(&self, chain_id: &Id) -> Result<Id> {
        self.chain(chain_id)
            .map(|chain| chain.subnet_id())
            .ok_or(ConsensusError::UnknownChain(*chain_id))
    }

    /// Whether the chain has reached normal operation.
    pub fn is_bootstrapped(&self, chain_id: &Id) -> bool {
        self.chain(chain_id)
            .is_some_and(|chain| chain.is_bootstrapped())
    }

    pub fn chains_not_bootstrapped(&self) -> Vec<Id> {
        self.state
            .lock()
            .chains
            .iter()
            .filter(|(_, chain)| !chain.handle.is_bootstrapped())
            .map(|(chain_id, _)| *chain_id)
            .collect()
    }

    /// Readiness check: lists the chains not yet in normal operation.
    ///
    /// # Errors
    ///
    /// Returns [`ConsensusError::NotBootstrapped`] while any chain is still
    /// syncing.
    pub fn bootstrapped(&self) -> Result<serde_json::Value> {
        let pending = self.chains_not_bootstrapped();
        if pending.is_empty() {
            return Ok(json!([]));
        }
        Err(ConsensusError::NotBootstrapped(pending))
    }

    /// Every chain's health report keyed by chain ID. A chain stopped by a
    /// fatal error reports that error.
    pub async fn health_check(&self) -> serde_json::Value {
        let handles: Vec<ChainHandle> = self
            .state
            .lock()
            .chains
            .values()
            .map(|chain| chain.handle.clone())
            .collect();
        let mut reports = serde_json::Map::new();
        for handle in handles {
            let report = match handle.health_check().await {
                Ok(report) => report,
                Err(err) => json!({
                    "state": handle.state(),
                    "error": handle.failure().unwrap_or_else(|| err.to_string()),
                }),
            };
            reports.insert(handle.chain_id().to_string(), report);
        }
        serde_json::Value::Object(reports)
    }

    /// Routes a peer message to its chain.
    ///
    /// # Errors
    ///
    /// Fails if the chain is unknown or stopped.
    pub async fn route(&self, chain_id: &Id, msg: InboundMessage) -> Result<()> {
        let chain = self
            .chain(chain_id)
            .ok_or(ConsensusError::UnknownChain(*chain_id))?;
        chain.push(msg).await
    }

    /// Stops every chain and waits for their handlers to exit.
    ///
    /// # Errors
    ///
    /// Returns every chain that failed to stop cleanly.
    pub async fn shutdown(&self) -> std::result::Result<(), ErrorCollection> {
        info!("shutting down chain manager");
        let chains: Vec<(Id, RunningChain)> = {
            let mut state = self.state.lock();
            state.blocked.clear();
            std::mem::take(&mut state.chains).into_iter().collect()
        };

        let mut errs = Errors::new();
        for (chain_id, chain) in &chains {
            if let Err(err) = chain.handle.shutdown() {
                debug!(%chain_id, error = %err, "chain already stopped");
            }
        }
        for (chain_id, mut chain) in chains {
            let Some(task) = chain.task.take() else {
                continue;
            };
            match task.await {
                Ok(result) => {
                    errs.add_result(result.map_err(|err| format!("chain {chain_id}: {err}")));
                }
                Err(err) => errs.add(format!("chain {chain_id}: {err}")),
            }
        }
        errs.into_result()
    }
}

struct Gears {
    getter: Box<dyn GetServer>,
    state_syncer: Option<Box<dyn Engine>>,
    bootstrapper: Box<dyn Engine>,
    engine: Box<dyn Engine>,
}

#[cfg(test)]
mod tests {
    use savannah_db::MemDb;

    use super::*;
    use crate::choices::Status;
    use crate::context::ChainState;
    use crate::testing::{node, TestBlock, TestDagVm, TestSender, TestVm};

    fn manager(primary_chain: Option<Id>) -> Arc<Manager> {
        let mut config = ManagerConfig::new(
            node(0),
            Arc::new(MemDb::new()),
            Arc::new(Codecs::new().unwrap()),
        );
        config.primary_chain = primary_chain;
        config.bootstrap.bootstrapping_delay = Duration::from_millis(5);
        config.params = Parameters {
            k: 1,
            alpha: 1,
            beta_virtuous: 1,
            beta_rogue: 1,
            concurrent_repolls: 1,
            mixed_query_num_push_vdr: 1,
            ..Parameters::default()
        };
        Manager::new(config)
    }

    /// A chain with no beacons, which bootstraps without any peer.
    fn snowman_chain(id: &[u8], subnet_id: Id) -> ChainParameters {
        ChainParameters {
            id: Id::from_hash(id),
            subnet_id,
            vm: ChainVmKind::Snowman(Arc::new(TestVm::new(TestBlock::genesis()))),
            beacons: Arc::new(ValidatorSet::new()),
            validators: Arc::new(ValidatorSet::new()),
            sender: Arc::new(TestSender::default()),
        }
    }

    async fn wait_bootstrapped(manager: &Manager, chain_id: &Id) {
        for _ in 0..1000 {
            if manager.is_bootstrapped(chain_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("chain {chain_id} never bootstrapped");
    }

    #[tokio::test]
    async fn test_chains_without_beacons_reach_normal_op() {
        let manager = manager(None);
        let chain = snowman_chain(b"x", Id::from_hash(b"x subnet"));
        let dag = ChainParameters {
            id: Id::from_hash(b"dag"),
            vm: ChainVmKind::Avalanche(Arc::new(TestDagVm::default())),
            ..snowman_chain(b"unused", Id::EMPTY)
        };
        manager.create_chain(chain.clone());
        manager.create_chain(dag.clone());
        // a second create is ignored
        manager.create_chain(chain.clone());
        assert_eq!(manager.chain_ids().len(), 2);

        wait_bootstrapped(&manager, &chain.id).await;
        wait_bootstrapped(&manager, &dag.id).await;
        assert!(manager.bootstrapped().is_ok());
        assert_eq!(manager.subnet_id(&chain.id).unwrap(), chain.subnet_id);

        let health = manager.health_check().await;
        assert_eq!(health[chain.id.to_string()]["state"], json!(ChainState::NormalOp));
        assert_eq!(health[dag.id.to_string()]["gear"], "avalanche_engine");

        manager.shutdown().await.unwrap();
        assert!(manager.chain_ids().is_empty());
    }

    #[tokio::test]
    async fn test_chains_held_until_primary_bootstraps() {
        let primary = snowman_chain(b"primary", Id::EMPTY);
        let manager = manager(Some(primary.id));
        let other = snowman_chain(b"other", Id::from_hash(b"subnet"));

        manager.create_chain(other.clone());
        assert_eq!(manager.num_blocked(), 1);
        assert!(manager.chain(&other.id).is_none());
        assert!(!manager.is_bootstrapped(&other.id));

        manager.create_chain(primary.clone());
        wait_bootstrapped(&manager, &primary.id).await;
        wait_bootstrapped(&manager, &other.id).await;
        assert_eq!(manager.num_blocked(), 0);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_chain_reports_cause() {
        let manager = manager(None);
        let genesis = TestBlock::genesis();
        let mut chain = snowman_chain(b"broken", Id::EMPTY);
        chain.vm = ChainVmKind::Snowman(Arc::new(TestVm::new(genesis.clone())));
        // Without an accepted block the bootstrapper can't find where to start.
        genesis.set_status(Status::Rejected);
        manager.create_chain(chain.clone());

        let handle = manager.chain(&chain.id).unwrap();
        for _ in 0..1000 {
            if handle.failure().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let health = manager.health_check().await;
        let error = health[chain.id.to_string()]["error"].as_str().unwrap();
        assert!(error.starts_with("vm error"), "{error}");
        assert!(error.contains("no accepted block"), "{error}");
        assert!(manager.bootstrapped().is_err());

        assert!(manager.shutdown().await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_chain() {
        let manager = manager(None);
        let missing = Id::from_hash(b"missing");
        assert!(matches!(
            manager.subnet_id(&missing),
            Err(ConsensusError::UnknownChain(id)) if id == missing
        ));
        assert!(manager
            .route(&missing, InboundMessage::Connected { node_id: node(1) })
            .await
            .is_err());
    }
}
