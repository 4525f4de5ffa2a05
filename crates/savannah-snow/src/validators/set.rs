//! Weighted validator set.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use savannah_ids::NodeId;
use tracing::trace;

use super::SetCallbackListener;
use crate::{ConsensusError, Result};

enum Change {
    Added(NodeId, u64),
    Removed(NodeId, u64),
    WeightChanged(NodeId, u64, u64),
}

#[derive(Debug, Default)]
struct Weights {
    /// Stake per validator, ordered by node ID so sampling is reproducible
    /// under a fixed seed
    by_node: BTreeMap<NodeId, u64>,
    /// Sum of all stake
    total: u64,
}

/// A set of validators with stake weights.
///
/// Reads dominate, so the weights sit behind an RW lock. Listeners are
/// notified of every change once the write lock is dropped. The listener
/// lock is held from a change until its notification, so every listener
/// sees each change exactly once and in order.
pub struct ValidatorSet {
    weights: RwLock<Weights>,
    listeners: Mutex<Vec<Arc<dyn SetCallbackListener>>>,
    rng: Mutex<StdRng>,
}

impl Default for ValidatorSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ValidatorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let weights = self.weights.read();
        f.debug_struct("ValidatorSet")
            .field("validators", &weights.by_node.len())
            .field("total_weight", &weights.total)
            .finish()
    }
}

impl ValidatorSet {
    /// Creates an empty set sampling from OS entropy.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Creates an empty set whose samples are reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            weights: RwLock::new(Weights::default()),
            listeners: Mutex::new(Vec::new()),
            rng: Mutex::new(rng),
        }
    }

    /// Adds `weight` to `node_id`, inserting it if absent.
    pub fn add_weight(&self, node_id: NodeId, weight: u64) -> Result<()> {
        if weight == 0 {
            return Ok(());
        }
        let listeners = self.listeners.lock();
        let change = {
            let mut weights = self.weights.write();
            let total = weights
                .total
                .checked_add(weight)
                .ok_or(ConsensusError::WeightOverflow(node_id))?;
            let change = match weights.by_node.get(&node_id).copied() {
                Some(old) => Change::WeightChanged(node_id, old, old + weight),
                None => Change::Added(node_id, weight),
            };
            *weights.by_node.entry(node_id).or_insert(0) += weight;
            weights.total = total;
            change
        };
        notify(&listeners, change);
        Ok(())
    }

    /// Removes up to `weight` from `node_id`, dropping it at zero.
    pub fn remove_weight(&self, node_id: NodeId, weight: u64) -> Result<()> {
        if weight == 0 {
            return Ok(());
        }
        let listeners = self.listeners.lock();
        let change = {
            let mut weights = self.weights.write();
            let old = weights
                .by_node
                .get(&node_id)
                .copied()
                .ok_or(ConsensusError::UnknownValidator(node_id))?;
            let removed = weight.min(old);
            weights.total -= removed;
            if removed == old {
                weights.by_node.remove(&node_id);
                Change::Removed(node_id, old)
            } else {
                weights.by_node.insert(node_id, old - removed);
                Change::WeightChanged(node_id, old, old - removed)
            }
        };
        notify(&listeners, change);
        Ok(())
    }

    /// Gets the weight of a validator, zero if absent.
    pub fn get_weight(&self, node_id: &NodeId) -> u64 {
        self.weights.read().by_node.get(node_id).copied().unwrap_or(0)
    }

    /// Returns true if the validator exists.
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.weights.read().by_node.contains_key(node_id)
    }

    /// Returns the number of validators.
    pub fn len(&self) -> usize {
        self.weights.read().by_node.len()
    }

    /// Returns true if empty.
    pub fn is_empty(&self) -> bool {
        self.weights.read().by_node.is_empty()
    }

    /// Returns the total stake weight.
    pub fn total_weight(&self) -> u64 {
        self.weights.read().total
    }

    /// Returns all validators and their weights.
    pub fn list(&self) -> Vec<(NodeId, u64)> {
        self.weights
            .read()
            .by_node
            .iter()
            .map(|(node_id, weight)| (*node_id, *weight))
            .collect()
    }

    /// Returns all node IDs.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.weights.read().by_node.keys().copied().collect()
    }

    /// Samples `k` units of stake without replacement and returns their
    /// owners.
    ///
    /// A validator holding several of the drawn units appears once per unit,
    /// so heavier validators carry proportionally more votes in a poll.
    pub fn sample(&self, k: usize) -> Result<Vec<NodeId>> {
        let weights = self.weights.read();
        let total = usize::try_from(weights.total).unwrap_or(usize::MAX);
        if k > total {
            return Err(ConsensusError::InsufficientValidators {
                needed: k as u64,
                have: weights.total,
            });
        }

        let mut cumulative = Vec::with_capacity(weights.by_node.len());
        let mut running = 0u64;
        for (node_id, weight) in &weights.by_node {
            running += weight;
            cumulative.push((running, *node_id));
        }

        let indices = {
            let mut rng = self.rng.lock();
            rand::seq::index::sample(&mut *rng, total, k)
        };
        let sampled = indices
            .into_iter()
            .map(|unit| {
                let unit = unit as u64;
                let pos = cumulative.partition_point(|(end, _)| *end <= unit);
                cumulative[pos].1
            })
            .collect::<Vec<_>>();
        trace!(k, total_weight = weights.total, "sampled validators");
        Ok(sampled)
    }

    /// Registers a listener and replays every current validator to it as an
    /// addition. Changes made concurrently are delivered after the replay.
    pub fn register_callback_listener(&self, listener: Arc<dyn SetCallbackListener>) {
        let mut listeners = self.listeners.lock();
        for (node_id, weight) in self.list() {
            listener.on_validator_added(node_id, weight);
        }
        listeners.push(listener);
    }
}

fn notify(listeners: &[Arc<dyn SetCallbackListener>], change: Change) {
    for listener in listeners {
        match change {
            Change::Added(node_id, weight) => listener.on_validator_added(node_id, weight),
            Change::Removed(node_id, weight) => listener.on_validator_removed(node_id, weight),
            Change::WeightChanged(node_id, old, new) => {
                listener.on_validator_weight_changed(node_id, old, new);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn make_node(byte: u8) -> NodeId {
        NodeId::from_slice(&[byte; 20]).unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl SetCallbackListener for Recorder {
        fn on_validator_added(&self, node_id: NodeId, weight: u64) {
            self.events.lock().push(format!("add {node_id} {weight}"));
        }

        fn on_validator_removed(&self, node_id: NodeId, weight: u64) {
            self.events.lock().push(format!("remove {node_id} {weight}"));
        }

        fn on_validator_weight_changed(&self, node_id: NodeId, old: u64, new: u64) {
            self.events.lock().push(format!("change {node_id} {old} {new}"));
        }
    }

    #[test]
    fn test_weights() {
        let set = ValidatorSet::with_seed(0);
        set.add_weight(make_node(1), 10).unwrap();
        set.add_weight(make_node(2), 5).unwrap();
        set.add_weight(make_node(1), 5).unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(set.get_weight(&make_node(1)), 15);
        assert_eq!(set.total_weight(), 20);

        set.remove_weight(make_node(2), 5).unwrap();
        assert!(!set.contains(&make_node(2)));
        assert_eq!(set.total_weight(), 15);

        assert!(matches!(
            set.remove_weight(make_node(3), 1),
            Err(ConsensusError::UnknownValidator(_))
        ));
    }

    #[test]
    fn test_overflow() {
        let set = ValidatorSet::with_seed(0);
        set.add_weight(make_node(1), u64::MAX).unwrap();
        assert!(matches!(
            set.add_weight(make_node(2), 1),
            Err(ConsensusError::WeightOverflow(_))
        ));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_sample_respects_stake() {
        let set = ValidatorSet::with_seed(7);
        set.add_weight(make_node(1), 1).unwrap();
        set.add_weight(make_node(2), 3).unwrap();

        let sampled = set.sample(4).unwrap();
        let mut counts = HashMap::new();
        for node in sampled {
            *counts.entry(node).or_insert(0) += 1;
        }
        assert_eq!(counts[&make_node(1)], 1);
        assert_eq!(counts[&make_node(2)], 3);
    }

    #[test]
    fn test_sample_too_many() {
        let set = ValidatorSet::with_seed(0);
        set.add_weight(make_node(1), 2).unwrap();
        assert!(matches!(
            set.sample(3),
            Err(ConsensusError::InsufficientValidators { needed: 3, have: 2 })
        ));
        assert!(set.sample(0).unwrap().is_empty());
    }

    #[test]
    fn test_listener_replay_and_changes() {
        let set = ValidatorSet::with_seed(0);
        set.add_weight(make_node(1), 4).unwrap();

        let recorder = Arc::new(Recorder::default());
        set.register_callback_listener(recorder.clone());
        set.add_weight(make_node(1), 1).unwrap();
        set.remove_weight(make_node(1), 5).unwrap();

        let node = make_node(1);
        assert_eq!(
            *recorder.events.lock(),
            vec![
                format!("add {node} 4"),
                format!("change {node} 4 5"),
                format!("remove {node} 5"),
            ]
        );
    }

    /// Mirrors the set's weights from the change stream alone.
    #[derive(Default)]
    struct Tally {
        weights: Mutex<BTreeMap<NodeId, u64>>,
    }

    impl SetCallbackListener for Tally {
        fn on_validator_added(&self, node_id: NodeId, weight: u64) {
            let previous = self.weights.lock().insert(node_id, weight);
            assert!(previous.is_none(), "{node_id} added twice");
        }

        fn on_validator_removed(&self, node_id: NodeId, _weight: u64) {
            let previous = self.weights.lock().remove(&node_id);
            assert!(previous.is_some(), "{node_id} removed before it was added");
        }

        fn on_validator_weight_changed(&self, node_id: NodeId, old: u64, new: u64) {
            let mut weights = self.weights.lock();
            let weight = weights.get_mut(&node_id).expect("weight change for unknown validator");
            assert_eq!(*weight, old);
            *weight = new;
        }
    }

    #[test]
    fn test_listener_registered_during_changes() {
        for _ in 0..20 {
            let set = ValidatorSet::with_seed(0);
            let tally = Arc::new(Tally::default());
            std::thread::scope(|scope| {
                scope.spawn(|| {
                    for byte in 0..=u8::MAX {
                        set.add_weight(make_node(byte), 2).unwrap();
                        if byte % 3 == 0 {
                            set.remove_weight(make_node(byte), 1).unwrap();
                        }
                        if byte % 5 == 0 {
                            set.remove_weight(make_node(byte), 2).unwrap();
                        }
                    }
                });
                set.register_callback_listener(tally.clone());
            });

            let mirrored: Vec<_> = tally
                .weights
                .lock()
                .iter()
                .map(|(node_id, weight)| (*node_id, *weight))
                .collect();
            assert_eq!(mirrored, set.list());
        }
    }
}
