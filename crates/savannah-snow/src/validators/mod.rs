//! Validator sets and peer tracking.

mod set;
mod tracker;

pub use set::ValidatorSet;
pub use tracker::{PeerTracker, StartupTracker};

use savannah_ids::NodeId;

use crate::Result;

/// Receives changes to a [`ValidatorSet`].
///
/// Callbacks run after the set's weight lock is released, so a listener may
/// read the set. A listener must not modify the set it listens to.
pub trait SetCallbackListener: Send + Sync {
    fn on_validator_added(&self, node_id: NodeId, weight: u64);

    fn on_validator_removed(&self, node_id: NodeId, weight: u64);

    fn on_validator_weight_changed(&self, node_id: NodeId, old_weight: u64, new_weight: u64);
}

/// Receives peer connection events.
pub trait Connector: Send + Sync {
    fn connected(&self, node_id: NodeId) -> Result<()>;

    fn disconnected(&self, node_id: NodeId) -> Result<()>;
}
