//! Connected-stake tracking for startup gating and fetch peer selection.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use savannah_ids::NodeId;
use tracing::info;

use super::{Connector, SetCallbackListener};
use crate::Result;

#[derive(Debug, Default)]
struct Peers {
    /// Weight of each validator, connected or not
    validators: HashMap<NodeId, u64>,
    /// Sum of the weights of connected validators
    connected_weight: u64,
    connected_validators: BTreeSet<NodeId>,
    connected_peers: BTreeSet<NodeId>,
}

/// Tracks which validators are connected and how much stake they hold.
#[derive(Debug, Default)]
pub struct PeerTracker {
    inner: RwLock<Peers>,
}

impl PeerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stake of the validators currently connected.
    pub fn connected_weight(&self) -> u64 {
        self.inner.read().connected_weight
    }

    /// Connected validators, or every connected peer when no validator is
    /// connected.
    pub fn preferred_peers(&self) -> BTreeSet<NodeId> {
        let inner = self.inner.read();
        if inner.connected_validators.is_empty() {
            inner.connected_peers.clone()
        } else {
            inner.connected_validators.clone()
        }
    }

    pub fn is_connected(&self, node_id: &NodeId) -> bool {
        self.inner.read().connected_peers.contains(node_id)
    }
}

impl SetCallbackListener for PeerTracker {
    fn on_validator_added(&self, node_id: NodeId, weight: u64) {
        let mut inner = self.inner.write();
        inner.validators.insert(node_id, weight);
        if inner.connected_peers.contains(&node_id) {
            inner.connected_weight = inner.connected_weight.saturating_add(weight);
            inner.connected_validators.insert(node_id);
        }
    }

    fn on_validator_removed(&self, node_id: NodeId, weight: u64) {
        let mut inner = self.inner.write();
        inner.validators.remove(&node_id);
        if inner.connected_peers.contains(&node_id) {
            inner.connected_weight = inner.connected_weight.saturating_sub(weight);
            inner.connected_validators.remove(&node_id);
        }
    }

    fn on_validator_weight_changed(&self, node_id: NodeId, old_weight: u64, new_weight: u64) {
        let mut inner = self.inner.write();
        inner.validators.insert(node_id, new_weight);
        if inner.connected_peers.contains(&node_id) {
            inner.connected_weight = inner
                .connected_weight
                .saturating_sub(old_weight)
                .saturating_add(new_weight);
        }
    }
}

impl Connector for PeerTracker {
    fn connected(&self, node_id: NodeId) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.connected_peers.insert(node_id) {
            return Ok(());
        }
        if let Some(weight) = inner.validators.get(&node_id).copied() {
            inner.connected_weight = inner.connected_weight.saturating_add(weight);
            inner.connected_validators.insert(node_id);
        }
        Ok(())
    }

    fn disconnected(&self, node_id: NodeId) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.connected_peers.remove(&node_id) {
            return Ok(());
        }
        if let Some(weight) = inner.validators.get(&node_id).copied() {
            inner.connected_weight = inner.connected_weight.saturating_sub(weight);
            inner.connected_validators.remove(&node_id);
        }
        Ok(())
    }
}

/// Latches once enough stake is connected to begin bootstrapping.
#[derive(Debug)]
pub struct StartupTracker {
    peers: Arc<PeerTracker>,
    startup_weight: u64,
    should_start: AtomicBool,
}

impl StartupTracker {
    pub fn new(peers: Arc<PeerTracker>, startup_weight: u64) -> Self {
        Self {
            peers,
            startup_weight,
            should_start: AtomicBool::new(false),
        }
    }

    pub fn peers(&self) -> &Arc<PeerTracker> {
        &self.peers
    }

    pub fn startup_weight(&self) -> u64 {
        self.startup_weight
    }

    /// Returns true once the connected stake has reached the startup weight.
    /// Stays true even if peers later disconnect.
    pub fn should_start(&self) -> bool {
        if self.should_start.load(Ordering::Acquire) {
            return true;
        }
        let connected = self.peers.connected_weight();
        if connected >= self.startup_weight {
            info!(
                connected_weight = connected,
                startup_weight = self.startup_weight,
                "startup quorum reached"
            );
            self.should_start.store(true, Ordering::Release);
            return true;
        }
        false
    }

    pub fn preferred_peers(&self) -> BTreeSet<NodeId> {
        self.peers.preferred_peers()
    }
}

impl Connector for StartupTracker {
    fn connected(&self, node_id: NodeId) -> Result<()> {
        self.peers.connected(node_id)
    }

    fn disconnected(&self, node_id: NodeId) -> Result<()> {
        self.peers.disconnected(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validators::ValidatorSet;

    fn make_node(byte: u8) -> NodeId {
        NodeId::from_slice(&[byte; 20]).unwrap()
    }

    #[test]
    fn test_connected_weight() {
        let peers = PeerTracker::new();
        peers.on_validator_added(make_node(1), 5);
        peers.connected(make_node(1)).unwrap();
        peers.connected(make_node(2)).unwrap();
        assert_eq!(peers.connected_weight(), 5);

        peers.on_validator_weight_changed(make_node(1), 5, 8);
        assert_eq!(peers.connected_weight(), 8);

        peers.disconnected(make_node(1)).unwrap();
        assert_eq!(peers.connected_weight(), 0);
    }

    #[test]
    fn test_validator_added_while_connected() {
        let peers = PeerTracker::new();
        peers.connected(make_node(1)).unwrap();
        assert_eq!(peers.connected_weight(), 0);
        peers.on_validator_added(make_node(1), 3);
        assert_eq!(peers.connected_weight(), 3);
        peers.on_validator_removed(make_node(1), 3);
        assert_eq!(peers.connected_weight(), 0);
    }

    #[test]
    fn test_preferred_peers() {
        let peers = PeerTracker::new();
        peers.connected(make_node(1)).unwrap();
        peers.connected(make_node(2)).unwrap();
        assert_eq!(peers.preferred_peers().len(), 2);

        peers.on_validator_added(make_node(2), 1);
        assert_eq!(
            peers.preferred_peers().into_iter().collect::<Vec<_>>(),
            vec![make_node(2)]
        );
    }

    #[test]
    fn test_duplicate_connect_counts_once() {
        let peers = PeerTracker::new();
        peers.on_validator_added(make_node(1), 4);
        peers.connected(make_node(1)).unwrap();
        peers.connected(make_node(1)).unwrap();
        assert_eq!(peers.connected_weight(), 4);
    }

    #[test]
    fn test_startup_latches() {
        let beacons = ValidatorSet::with_seed(0);
        beacons.add_weight(make_node(1), 1).unwrap();
        beacons.add_weight(make_node(2), 1).unwrap();

        let peers = Arc::new(PeerTracker::new());
        beacons.register_callback_listener(peers.clone());
        let startup = StartupTracker::new(peers, 2);

        startup.connected(make_node(1)).unwrap();
        assert!(!startup.should_start());
        startup.connected(make_node(2)).unwrap();
        assert!(startup.should_start());
        startup.disconnected(make_node(2)).unwrap();
        assert!(startup.should_start());
    }

    #[test]
    fn test_weight_change_reaches_quorum() {
        let beacons = ValidatorSet::with_seed(0);
        beacons.add_weight(make_node(1), 1).unwrap();
        let peers = Arc::new(PeerTracker::new());
        beacons.register_callback_listener(peers.clone());
        let startup = StartupTracker::new(peers, 3);

        startup.connected(make_node(1)).unwrap();
        assert!(!startup.should_start());
        beacons.add_weight(make_node(1), 2).unwrap();
        assert!(startup.should_start());
    }
}
