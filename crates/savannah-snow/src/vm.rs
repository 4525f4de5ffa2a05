//! VM traits for consensus integration.
//!
//! The consensus core never reads VM storage directly. Containers, their
//! bytes, and their verification semantics are reached only through these
//! traits.

use std::sync::Arc;

use savannah_ids::{Id, NodeId};
use thiserror::Error;

use crate::choices::Status;
use crate::context::ChainState;

/// Errors returned by a VM.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VmError {
    /// The requested container is not known to the VM.
    #[error("{0} not found")]
    NotFound(Id),

    /// The container failed to parse or verify.
    #[error("invalid container: {0}")]
    Invalid(String),

    /// Any other VM failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl VmError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type VmResult<T> = std::result::Result<T, VmError>;

/// A block in a linear chain.
pub trait Block: Send + Sync {
    /// Returns the block's unique identifier.
    fn id(&self) -> Id;

    /// Returns the parent block's ID.
    fn parent(&self) -> Id;

    /// Returns the block's height.
    fn height(&self) -> u64;

    /// Returns the block's byte representation.
    fn bytes(&self) -> Vec<u8>;

    /// Returns the block's status.
    fn status(&self) -> Status;

    /// Verifies the block against its parent's state.
    fn verify(&self) -> VmResult<()>;

    /// Accepts the block.
    fn accept(&self) -> VmResult<()>;

    /// Rejects the block.
    fn reject(&self) -> VmResult<()>;
}

pub type BlockRef = Arc<dyn Block>;

/// A VM-defined state summary used by the state syncer.
pub trait StateSummary: Send + Sync {
    fn id(&self) -> Id;

    fn height(&self) -> u64;

    fn bytes(&self) -> Vec<u8>;

    /// Starts syncing to this summary. Returns false if the VM skipped it.
    fn accept(&self) -> VmResult<bool>;
}

pub type StateSummaryRef = Arc<dyn StateSummary>;

/// Functionality shared by every VM kind.
pub trait CommonVm: Send + Sync {
    /// Notifies the VM of the chain's lifecycle phase.
    fn set_state(&self, state: ChainState) -> VmResult<()>;

    /// Returns a VM-defined health report.
    fn health_check(&self) -> VmResult<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    fn connected(&self, _node_id: &NodeId) -> VmResult<()> {
        Ok(())
    }

    fn disconnected(&self, _node_id: &NodeId) -> VmResult<()> {
        Ok(())
    }

    fn shutdown(&self) -> VmResult<()> {
        Ok(())
    }
}

/// A VM that builds a linear chain of blocks.
pub trait ChainVm: CommonVm {
    fn parse_block(&self, bytes: &[u8]) -> VmResult<BlockRef>;

    /// Returns [`VmError::NotFound`] if the block is unknown.
    fn get_block(&self, id: &Id) -> VmResult<BlockRef>;

    fn last_accepted(&self) -> VmResult<Id>;

    /// Builds a block on top of the current preference.
    fn build_block(&self) -> VmResult<BlockRef>;

    fn set_preference(&self, id: &Id) -> VmResult<()>;

    fn state_sync_enabled(&self) -> VmResult<bool> {
        Ok(false)
    }

    fn parse_state_summary(&self, _bytes: &[u8]) -> VmResult<StateSummaryRef> {
        Err(VmError::Invalid("state sync is not supported".into()))
    }
}

/// A transaction decided by DAG consensus.
pub trait Tx: Send + Sync {
    fn id(&self) -> Id;

    fn bytes(&self) -> Vec<u8>;

    fn status(&self) -> Status;

    /// Transactions that must be accepted before this one.
    fn dependencies(&self) -> Vec<Id>;

    /// State this transaction consumes. Two transactions conflict if they
    /// share an input.
    fn input_ids(&self) -> Vec<Id>;

    fn verify(&self) -> VmResult<()>;

    fn accept(&self) -> VmResult<()>;

    fn reject(&self) -> VmResult<()>;
}

pub type TxRef = Arc<dyn Tx>;

/// A DAG vertex batching transactions.
pub trait Vertex: Send + Sync {
    fn id(&self) -> Id;

    fn bytes(&self) -> Vec<u8>;

    fn status(&self) -> Status;

    /// One more than the highest parent height.
    fn height(&self) -> u64;

    fn parent_ids(&self) -> Vec<Id>;

    fn txs(&self) -> VmResult<Vec<TxRef>>;

    fn accept(&self) -> VmResult<()>;

    fn reject(&self) -> VmResult<()>;
}

pub type VertexRef = Arc<dyn Vertex>;

/// A VM whose transactions are ordered by a DAG.
pub trait DagVm: CommonVm {
    fn parse_tx(&self, bytes: &[u8]) -> VmResult<TxRef>;

    /// Returns [`VmError::NotFound`] if the transaction is unknown.
    fn get_tx(&self, id: &Id) -> VmResult<TxRef>;

    /// Drains transactions waiting to be issued.
    fn pending_txs(&self) -> Vec<TxRef>;
}

/// Storage and construction of DAG vertices.
pub trait VertexManager: Send + Sync {
    fn parse_vtx(&self, bytes: &[u8]) -> VmResult<VertexRef>;

    /// Returns [`VmError::NotFound`] if the vertex is unknown.
    fn get_vtx(&self, id: &Id) -> VmResult<VertexRef>;

    fn build_vtx(&self, parent_ids: Vec<Id>, txs: Vec<TxRef>) -> VmResult<VertexRef>;

    /// Accepted vertices with no accepted children.
    fn edge(&self) -> Vec<Id>;
}

/// A VM of either kind, seen through what both kinds share.
#[derive(Clone)]
pub enum AnyVm {
    Chain(Arc<dyn ChainVm>),
    Dag(Arc<dyn DagVm>),
}

impl CommonVm for AnyVm {
    fn set_state(&self, state: ChainState) -> VmResult<()> {
        match self {
            Self::Chain(vm) => vm.set_state(state),
            Self::Dag(vm) => vm.set_state(state),
        }
    }

    fn health_check(&self) -> VmResult<serde_json::Value> {
        match self {
            Self::Chain(vm) => vm.health_check(),
            Self::Dag(vm) => vm.health_check(),
        }
    }

    fn connected(&self, node_id: &NodeId) -> VmResult<()> {
        match self {
            Self::Chain(vm) => vm.connected(node_id),
            Self::Dag(vm) => vm.connected(node_id),
        }
    }

    fn disconnected(&self, node_id: &NodeId) -> VmResult<()> {
        match self {
            Self::Chain(vm) => vm.disconnected(node_id),
            Self::Dag(vm) => vm.disconnected(node_id),
        }
    }

    fn shutdown(&self) -> VmResult<()> {
        match self {
            Self::Chain(vm) => vm.shutdown(),
            Self::Dag(vm) => vm.shutdown(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found() {
        assert!(VmError::NotFound(Id::EMPTY).is_not_found());
        assert!(!VmError::Invalid("bad".into()).is_not_found());
        assert!(!VmError::Internal("io".into()).is_not_found());
    }
}
