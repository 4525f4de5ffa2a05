//! Messages delivered to a chain's handler.

use std::fmt;

use savannah_ids::{Id, NodeId};
use tokio::sync::oneshot;

/// Operation name of an inbound message, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageOp {
    GetStateSummaryFrontier,
    StateSummaryFrontier,
    GetStateSummaryFrontierFailed,
    GetAcceptedStateSummary,
    AcceptedStateSummary,
    GetAcceptedStateSummaryFailed,
    GetAcceptedFrontier,
    AcceptedFrontier,
    GetAcceptedFrontierFailed,
    GetAccepted,
    Accepted,
    GetAcceptedFailed,
    GetAncestors,
    Ancestors,
    GetAncestorsFailed,
    Get,
    Put,
    GetFailed,
    PushQuery,
    PullQuery,
    Chits,
    QueryFailed,
    Connected,
    Disconnected,
}

impl fmt::Display for MessageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GetStateSummaryFrontier => "get_state_summary_frontier",
            Self::StateSummaryFrontier => "state_summary_frontier",
            Self::GetStateSummaryFrontierFailed => "get_state_summary_frontier_failed",
            Self::GetAcceptedStateSummary => "get_accepted_state_summary",
            Self::AcceptedStateSummary => "accepted_state_summary",
            Self::GetAcceptedStateSummaryFailed => "get_accepted_state_summary_failed",
            Self::GetAcceptedFrontier => "get_accepted_frontier",
            Self::AcceptedFrontier => "accepted_frontier",
            Self::GetAcceptedFrontierFailed => "get_accepted_frontier_failed",
            Self::GetAccepted => "get_accepted",
            Self::Accepted => "accepted",
            Self::GetAcceptedFailed => "get_accepted_failed",
            Self::GetAncestors => "get_ancestors",
            Self::Ancestors => "ancestors",
            Self::GetAncestorsFailed => "get_ancestors_failed",
            Self::Get => "get",
            Self::Put => "put",
            Self::GetFailed => "get_failed",
            Self::PushQuery => "push_query",
            Self::PullQuery => "pull_query",
            Self::Chits => "chits",
            Self::QueryFailed => "query_failed",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// A message received from a peer, or a peer-lifecycle notification from the
/// network layer. `*Failed` variants are synthesized when a request times
/// out or cannot be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    GetStateSummaryFrontier { node_id: NodeId, request_id: u32 },
    StateSummaryFrontier { node_id: NodeId, request_id: u32, summary: Vec<u8> },
    GetStateSummaryFrontierFailed { node_id: NodeId, request_id: u32 },
    GetAcceptedStateSummary { node_id: NodeId, request_id: u32, heights: Vec<u64> },
    AcceptedStateSummary { node_id: NodeId, request_id: u32, summary_ids: Vec<Id> },
    GetAcceptedStateSummaryFailed { node_id: NodeId, request_id: u32 },
    GetAcceptedFrontier { node_id: NodeId, request_id: u32 },
    AcceptedFrontier { node_id: NodeId, request_id: u32, container_ids: Vec<Id> },
    GetAcceptedFrontierFailed { node_id: NodeId, request_id: u32 },
    GetAccepted { node_id: NodeId, request_id: u32, container_ids: Vec<Id> },
    Accepted { node_id: NodeId, request_id: u32, container_ids: Vec<Id> },
    GetAcceptedFailed { node_id: NodeId, request_id: u32 },
    GetAncestors { node_id: NodeId, request_id: u32, container_id: Id },
    Ancestors { node_id: NodeId, request_id: u32, containers: Vec<Vec<u8>> },
    GetAncestorsFailed { node_id: NodeId, request_id: u32 },
    Get { node_id: NodeId, request_id: u32, container_id: Id },
    Put { node_id: NodeId, request_id: u32, container: Vec<u8> },
    GetFailed { node_id: NodeId, request_id: u32 },
    PushQuery { node_id: NodeId, request_id: u32, container: Vec<u8> },
    PullQuery { node_id: NodeId, request_id: u32, container_id: Id },
    Chits { node_id: NodeId, request_id: u32, votes: Vec<Id> },
    QueryFailed { node_id: NodeId, request_id: u32 },
    Connected { node_id: NodeId },
    Disconnected { node_id: NodeId },
}

impl InboundMessage {
    pub fn op(&self) -> MessageOp {
        match self {
            Self::GetStateSummaryFrontier { .. } => MessageOp::GetStateSummaryFrontier,
            Self::StateSummaryFrontier { .. } => MessageOp::StateSummaryFrontier,
            Self::GetStateSummaryFrontierFailed { .. } => MessageOp::GetStateSummaryFrontierFailed,
            Self::GetAcceptedStateSummary { .. } => MessageOp::GetAcceptedStateSummary,
            Self::AcceptedStateSummary { .. } => MessageOp::AcceptedStateSummary,
            Self::GetAcceptedStateSummaryFailed { .. } => MessageOp::GetAcceptedStateSummaryFailed,
            Self::GetAcceptedFrontier { .. } => MessageOp::GetAcceptedFrontier,
            Self::AcceptedFrontier { .. } => MessageOp::AcceptedFrontier,
            Self::GetAcceptedFrontierFailed { .. } => MessageOp::GetAcceptedFrontierFailed,
            Self::GetAccepted { .. } => MessageOp::GetAccepted,
            Self::Accepted { .. } => MessageOp::Accepted,
            Self::GetAcceptedFailed { .. } => MessageOp::GetAcceptedFailed,
            Self::GetAncestors { .. } => MessageOp::GetAncestors,
            Self::Ancestors { .. } => MessageOp::Ancestors,
            Self::GetAncestorsFailed { .. } => MessageOp::GetAncestorsFailed,
            Self::Get { .. } => MessageOp::Get,
            Self::Put { .. } => MessageOp::Put,
            Self::GetFailed { .. } => MessageOp::GetFailed,
            Self::PushQuery { .. } => MessageOp::PushQuery,
            Self::PullQuery { .. } => MessageOp::PullQuery,
            Self::Chits { .. } => MessageOp::Chits,
            Self::QueryFailed { .. } => MessageOp::QueryFailed,
            Self::Connected { .. } => MessageOp::Connected,
            Self::Disconnected { .. } => MessageOp::Disconnected,
        }
    }

    pub fn node_id(&self) -> NodeId {
        match self {
            Self::GetStateSummaryFrontier { node_id, .. }
            | Self::StateSummaryFrontier { node_id, .. }
            | Self::GetStateSummaryFrontierFailed { node_id, .. }
            | Self::GetAcceptedStateSummary { node_id, .. }
            | Self::AcceptedStateSummary { node_id, .. }
            | Self::GetAcceptedStateSummaryFailed { node_id, .. }
            | Self::GetAcceptedFrontier { node_id, .. }
            | Self::AcceptedFrontier { node_id, .. }
            | Self::GetAcceptedFrontierFailed { node_id, .. }
            | Self::GetAccepted { node_id, .. }
            | Self::Accepted { node_id, .. }
            | Self::GetAcceptedFailed { node_id, .. }
            | Self::GetAncestors { node_id, .. }
            | Self::Ancestors { node_id, .. }
            | Self::GetAncestorsFailed { node_id, .. }
            | Self::Get { node_id, .. }
            | Self::Put { node_id, .. }
            | Self::GetFailed { node_id, .. }
            | Self::PushQuery { node_id, .. }
            | Self::PullQuery { node_id, .. }
            | Self::Chits { node_id, .. }
            | Self::QueryFailed { node_id, .. }
            | Self::Connected { node_id }
            | Self::Disconnected { node_id } => *node_id,
        }
    }
}

/// Notifications a VM pushes to its consensus engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmMessage {
    /// The VM has transactions ready to be built into a container.
    PendingTxs,
    /// The VM finished applying an accepted state summary.
    StateSyncDone,
}

/// Messages a chain sends to itself.
#[derive(Debug)]
pub enum InternalMessage {
    /// A timer registered through [`crate::common::Timeouts`] fired.
    Timeout,
    Gossip,
    Notify(VmMessage),
    /// The state syncer is done; bootstrapping starts with the next request ID.
    StateSyncFinished { request_id: u32 },
    /// Bootstrapping is done; consensus starts with the next request ID.
    BootstrapFinished { request_id: u32 },
    HealthCheck(oneshot::Sender<serde_json::Value>),
    Shutdown,
}
