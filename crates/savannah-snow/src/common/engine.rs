//! The interface every gear of a chain implements.
//!
//! A chain runs one gear at a time (state syncer, bootstrapper, or consensus
//! engine). Each message kind has a default handler that logs the message and
//! drops it, so a gear only overrides what it consumes.

use savannah_ids::{Id, NodeId};
use tracing::debug;

use crate::message::{MessageOp, VmMessage};
use crate::Result;

/// Called by a gear when it is done, with the last request ID it used.
pub type OnFinished = Box<dyn FnMut(u32) -> Result<()> + Send>;

fn drop_unhandled(
    gear: &'static str,
    op: MessageOp,
    node_id: &NodeId,
    request_id: u32,
) -> Result<()> {
    debug!(
        gear,
        %op,
        %node_id,
        request_id,
        reason = "unhandled by this gear",
        "dropping message"
    );
    Ok(())
}

/// A gear driven by the chain handler.
///
/// Every call happens on the chain's handler task, one at a time. An error
/// returned from any method is fatal to the chain.
pub trait Engine: Send {
    /// Name used in logs.
    fn gear(&self) -> &'static str;

    /// Hands control to this gear. `request_id` is the last request ID the
    /// chain used; the gear's requests continue after it.
    fn start(&mut self, request_id: u32) -> Result<()>;

    fn state_summary_frontier(
        &mut self,
        node_id: NodeId,
        request_id: u32,
        _summary: Vec<u8>,
    ) -> Result<()> {
        drop_unhandled(self.gear(), MessageOp::StateSummaryFrontier, &node_id, request_id)
    }

    fn get_state_summary_frontier_failed(&mut self, node_id: NodeId, request_id: u32) -> Result<()> {
        drop_unhandled(
            self.gear(),
            MessageOp::GetStateSummaryFrontierFailed,
            &node_id,
            request_id,
        )
    }

    fn accepted_state_summary(
        &mut self,
        node_id: NodeId,
        request_id: u32,
        _summary_ids: Vec<Id>,
    ) -> Result<()> {
        drop_unhandled(self.gear(), MessageOp::AcceptedStateSummary, &node_id, request_id)
    }

    fn get_accepted_state_summary_failed(&mut self, node_id: NodeId, request_id: u32) -> Result<()> {
        drop_unhandled(
            self.gear(),
            MessageOp::GetAcceptedStateSummaryFailed,
            &node_id,
            request_id,
        )
    }

    fn accepted_frontier(
        &mut self,
        node_id: NodeId,
        request_id: u32,
        _container_ids: Vec<Id>,
    ) -> Result<()> {
        drop_unhandled(self.gear(), MessageOp::AcceptedFrontier, &node_id, request_id)
    }

    fn get_accepted_frontier_failed(&mut self, node_id: NodeId, request_id: u32) -> Result<()> {
        drop_unhandled(self.gear(), MessageOp::GetAcceptedFrontierFailed, &node_id, request_id)
    }

    fn accepted(&mut self, node_id: NodeId, request_id: u32, _container_ids: Vec<Id>) -> Result<()> {
        drop_unhandled(self.gear(), MessageOp::Accepted, &node_id, request_id)
    }

    fn get_accepted_failed(&mut self, node_id: NodeId, request_id: u32) -> Result<()> {
        drop_unhandled(self.gear(), MessageOp::GetAcceptedFailed, &node_id, request_id)
    }

    fn ancestors(
        &mut self,
        node_id: NodeId,
        request_id: u32,
        _containers: Vec<Vec<u8>>,
    ) -> Result<()> {
        drop_unhandled(self.gear(), MessageOp::Ancestors, &node_id, request_id)
    }

    fn get_ancestors_failed(&mut self, node_id: NodeId, request_id: u32) -> Result<()> {
        drop_unhandled(self.gear(), MessageOp::GetAncestorsFailed, &node_id, request_id)
    }

    fn put(&mut self, node_id: NodeId, request_id: u32, _container: Vec<u8>) -> Result<()> {
        drop_unhandled(self.gear(), MessageOp::Put, &node_id, request_id)
    }

    fn get_failed(&mut self, node_id: NodeId, request_id: u32) -> Result<()> {
        drop_unhandled(self.gear(), MessageOp::GetFailed, &node_id, request_id)
    }

    fn push_query(&mut self, node_id: NodeId, request_id: u32, _container: Vec<u8>) -> Result<()> {
        drop_unhandled(self.gear(), MessageOp::PushQuery, &node_id, request_id)
    }

    fn pull_query(&mut self, node_id: NodeId, request_id: u32, _container_id: Id) -> Result<()> {
        drop_unhandled(self.gear(), MessageOp::PullQuery, &node_id, request_id)
    }

    fn chits(&mut self, node_id: NodeId, request_id: u32, _votes: Vec<Id>) -> Result<()> {
        drop_unhandled(self.gear(), MessageOp::Chits, &node_id, request_id)
    }

    fn query_failed(&mut self, node_id: NodeId, request_id: u32) -> Result<()> {
        drop_unhandled(self.gear(), MessageOp::QueryFailed, &node_id, request_id)
    }

    /// Called after the VM and the peer trackers saw the connection.
    fn connected(&mut self, _node_id: NodeId) -> Result<()> {
        Ok(())
    }

    /// Called after the VM and the peer trackers saw the disconnection.
    fn disconnected(&mut self, _node_id: NodeId) -> Result<()> {
        Ok(())
    }

    fn timeout(&mut self) -> Result<()> {
        debug!(gear = self.gear(), "dropping timeout, unhandled by this gear");
        Ok(())
    }

    fn gossip(&mut self) -> Result<()> {
        Ok(())
    }

    fn notify(&mut self, msg: VmMessage) -> Result<()> {
        debug!(gear = self.gear(), ?msg, "dropping vm notification, unhandled by this gear");
        Ok(())
    }

    /// Consensus details of this gear merged with the VM's own report.
    fn health_check(&self) -> Result<serde_json::Value>;

    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Serves other nodes' requests for this chain's containers. Requests are
/// answered in every chain state.
pub trait GetServer: Send {
    fn get_state_summary_frontier(&self, node_id: NodeId, request_id: u32) -> Result<()> {
        drop_unhandled("getter", MessageOp::GetStateSummaryFrontier, &node_id, request_id)
    }

    fn get_accepted_state_summary(
        &self,
        node_id: NodeId,
        request_id: u32,
        _heights: Vec<u64>,
    ) -> Result<()> {
        drop_unhandled("getter", MessageOp::GetAcceptedStateSummary, &node_id, request_id)
    }

    fn get_accepted_frontier(&self, node_id: NodeId, request_id: u32) -> Result<()>;

    fn get_accepted(&self, node_id: NodeId, request_id: u32, container_ids: Vec<Id>) -> Result<()>;

    fn get_ancestors(&self, node_id: NodeId, request_id: u32, container_id: Id) -> Result<()>;

    fn get(&self, node_id: NodeId, request_id: u32, container_id: Id) -> Result<()>;
}
