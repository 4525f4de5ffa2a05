//! Outbound message surface consumed by the gears.

use std::collections::BTreeSet;

use savannah_ids::{Id, NodeId};
use tracing::trace;

/// Sends consensus messages to peers.
///
/// Delivery is best effort and unordered. Implementations must not block:
/// a send hands the message to the network layer and returns.
pub trait Sender: Send + Sync {
    fn send_get_state_summary_frontier(&self, node_ids: &BTreeSet<NodeId>, request_id: u32);

    fn send_get_accepted_state_summary(
        &self,
        node_ids: &BTreeSet<NodeId>,
        request_id: u32,
        heights: &[u64],
    );

    fn send_get_accepted_frontier(&self, node_ids: &BTreeSet<NodeId>, request_id: u32);

    fn send_accepted_frontier(&self, node_id: NodeId, request_id: u32, container_ids: Vec<Id>);

    fn send_get_accepted(&self, node_ids: &BTreeSet<NodeId>, request_id: u32, container_ids: &[Id]);

    fn send_accepted(&self, node_id: NodeId, request_id: u32, container_ids: Vec<Id>);

    fn send_get_ancestors(&self, node_id: NodeId, request_id: u32, container_id: Id);

    fn send_ancestors(&self, node_id: NodeId, request_id: u32, containers: Vec<Vec<u8>>);

    fn send_get(&self, node_id: NodeId, request_id: u32, container_id: Id);

    fn send_put(&self, node_id: NodeId, request_id: u32, container: Vec<u8>);

    fn send_push_query(&self, node_ids: &BTreeSet<NodeId>, request_id: u32, container: Vec<u8>);

    fn send_pull_query(&self, node_ids: &BTreeSet<NodeId>, request_id: u32, container_id: Id);

    fn send_chits(&self, node_id: NodeId, request_id: u32, votes: Vec<Id>);

    /// Gossips an accepted container to a sample of peers.
    fn send_gossip(&self, container: Vec<u8>);
}

/// Queries `validators` about a container: the first `num_push_to` receive
/// the container itself, the rest only its ID.
pub fn send_mixed_query(
    sender: &dyn Sender,
    validators: &[NodeId],
    num_push_to: usize,
    request_id: u32,
    container_id: Id,
    container: Vec<u8>,
) {
    let num_push_to = num_push_to.min(validators.len());
    let (push, pull) = validators.split_at(num_push_to);
    let push: BTreeSet<NodeId> = push.iter().copied().collect();
    let pull: BTreeSet<NodeId> = pull
        .iter()
        .filter(|node_id| !push.contains(node_id))
        .copied()
        .collect();
    trace!(request_id, %container_id, push = push.len(), pull = pull.len(), "sending mixed query");
    if !push.is_empty() {
        sender.send_push_query(&push, request_id, container);
    }
    if !pull.is_empty() {
        sender.send_pull_query(&pull, request_id, container_id);
    }
}
