//! In-process delivery of a chain's outbound messages.
//!
//! Messages addressed to the local node are handed back to the chain as if a
//! peer had sent them. Every other peer is unreachable: requests to them
//! fail at once and responses are dropped.

use std::collections::BTreeSet;

use savannah_ids::{Id, NodeId};
use savannah_snow::common::Sender;
use savannah_snow::message::InboundMessage;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

/// A message waiting to be routed to a chain.
pub type Routed = (Id, InboundMessage);

pub struct LoopbackSender {
    node_id: NodeId,
    chain_id: Id,
    tx: UnboundedSender<Routed>,
}

impl LoopbackSender {
    pub fn new(node_id: NodeId, chain_id: Id, tx: UnboundedSender<Routed>) -> Self {
        Self {
            node_id,
            chain_id,
            tx,
        }
    }

    fn deliver(&self, msg: InboundMessage) {
        if self.tx.send((self.chain_id, msg)).is_err() {
            debug!(chain_id = %self.chain_id, "router stopped, dropping message");
        }
    }

    /// Sends a request, or reports it failed if `node_id` is not this node.
    fn request(
        &self,
        node_id: NodeId,
        local: impl FnOnce() -> InboundMessage,
        failed: impl FnOnce(NodeId) -> InboundMessage,
    ) {
        if node_id == self.node_id {
            self.deliver(local());
        } else {
            trace!(%node_id, "peer unreachable, failing request");
            self.deliver(failed(node_id));
        }
    }

    fn respond(&self, node_id: NodeId, msg: impl FnOnce() -> InboundMessage) {
        if node_id == self.node_id {
            self.deliver(msg());
        } else {
            trace!(%node_id, "peer unreachable, dropping response");
        }
    }
}

impl Sender for LoopbackSender {
    fn send_get_state_summary_frontier(&self, node_ids: &BTreeSet<NodeId>, request_id: u32) {
        for &node_id in node_ids {
            self.request(
                node_id,
                || InboundMessage::GetStateSummaryFrontier {
                    node_id,
                    request_id,
                },
                |node_id| InboundMessage::GetStateSummaryFrontierFailed {
                    node_id,
                    request_id,
                },
            );
        }
    }

    fn send_get_accepted_state_summary(
        &self,
        node_ids: &BTreeSet<NodeId>,
        request_id: u32,
        heights: &[u64],
    ) {
        for &node_id in node_ids {
            self.request(
                node_id,
                || InboundMessage::GetAcceptedStateSummary {
                    node_id,
                    request_id,
                    heights: heights.to_vec(),
                },
                |node_id| InboundMessage::GetAcceptedStateSummaryFailed {
                    node_id,
                    request_id,
                },
            );
        }
    }

    fn send_get_accepted_frontier(&self, node_ids: &BTreeSet<NodeId>, request_id: u32) {
        for &node_id in node_ids {
            self.request(
                node_id,
                || InboundMessage::GetAcceptedFrontier {
                    node_id,
                    request_id,
                },
                |node_id| InboundMessage::GetAcceptedFrontierFailed {
                    node_id,
                    request_id,
                },
            );
        }
    }

    fn send_accepted_frontier(&self, node_id: NodeId, request_id: u32, container_ids: Vec<Id>) {
        self.respond(node_id, || InboundMessage::AcceptedFrontier {
            node_id,
            request_id,
            container_ids,
        });
    }

    fn send_get_accepted(&self, node_ids: &BTreeSet<NodeId>, request_id: u32, container_ids: &[Id]) {
        for &node_id in node_ids {
            self.request(
                node_id,
                || InboundMessage::GetAccepted {
                    node_id,
                    request_id,
                    container_ids: container_ids.to_vec(),
                },
                |node_id| InboundMessage::GetAcceptedFailed {
                    node_id,
                    request_id,
                },
            );
        }
    }

    fn send_accepted(&self, node_id: NodeId, request_id: u32, container_ids: Vec<Id>) {
        self.respond(node_id, || InboundMessage::Accepted {
            node_id,
            request_id,
            container_ids,
        });
    }

    fn send_get_ancestors(&self, node_id: NodeId, request_id: u32, container_id: Id) {
        self.request(
            node_id,
            || InboundMessage::GetAncestors {
                node_id,
                request_id,
                container_id,
            },
            |node_id| InboundMessage::GetAncestorsFailed {
                node_id,
                request_id,
            },
        );
    }

    fn send_ancestors(&self, node_id: NodeId, request_id: u32, containers: Vec<Vec<u8>>) {
        self.respond(node_id, || InboundMessage::Ancestors {
            node_id,
            request_id,
            containers,
        });
    }

    fn send_get(&self, node_id: NodeId, request_id: u32, container_id: Id) {
        self.request(
            node_id,
            || InboundMessage::Get {
                node_id,
                request_id,
                container_id,
            },
            |node_id| InboundMessage::GetFailed {
                node_id,
                request_id,
            },
        );
    }

    fn send_put(&self, node_id: NodeId, request_id: u32, container: Vec<u8>) {
        self.respond(node_id, || InboundMessage::Put {
            node_id,
            request_id,
            container,
        });
    }

    fn send_push_query(&self, node_ids: &BTreeSet<NodeId>, request_id: u32, container: Vec<u8>) {
        for &node_id in node_ids {
            self.request(
                node_id,
                || InboundMessage::PushQuery {
                    node_id,
                    request_id,
                    container: container.clone(),
                },
                |node_id| InboundMessage::QueryFailed {
                    node_id,
                    request_id,
                },
            );
        }
    }

    fn send_pull_query(&self, node_ids: &BTreeSet<NodeId>, request_id: u32, container_id: Id) {
        for &node_id in node_ids {
            self.request(
                node_id,
                || InboundMessage::PullQuery {
                    node_id,
                    request_id,
                    container_id,
                },
                |node_id| InboundMessage::QueryFailed {
                    node_id,
                    request_id,
                },
            );
        }
    }

    fn send_chits(&self, node_id: NodeId, request_id: u32, votes: Vec<Id>) {
        self.respond(node_id, || InboundMessage::Chits {
            node_id,
            request_id,
            votes,
        });
    }

    fn send_gossip(&self, container: Vec<u8>) {
        trace!(chain_id = %self.chain_id, len = container.len(), "no peers to gossip to");
    }
}
