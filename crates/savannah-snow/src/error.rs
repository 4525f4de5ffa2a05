//! Error types for consensus and bootstrapping.

use savannah_codec::CodecError;
use savannah_db::DatabaseError;
use savannah_ids::{Id, NodeId};
use thiserror::Error;

use crate::context::ChainState;
use crate::vm::VmError;

pub type Result<T> = std::result::Result<T, ConsensusError>;

#[derive(Debug, Error, Clone)]
pub enum ConsensusError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("invalid chain state transition from {from} to {to}")]
    InvalidTransition { from: ChainState, to: ChainState },

    #[error("invalid engine state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("insufficient validators: need {needed}, have {have}")]
    InsufficientValidators { needed: u64, have: u64 },

    #[error("unknown validator {0}")]
    UnknownValidator(NodeId),

    #[error("validator weight overflow for {0}")]
    WeightOverflow(NodeId),

    #[error("dropping request for {0} as there are no peers")]
    NoPeers(Id),

    #[error("unexpected timeout")]
    UnexpectedTimeout,

    #[error("job {id} dropped: {reason}")]
    JobDropped { id: Id, reason: String },

    #[error("{0} was previously rejected")]
    PreviouslyRejected(Id),

    #[error("unknown job type {0:?}")]
    UnknownJobType(String),

    #[error("chain handler closed")]
    HandlerClosed,

    #[error("unknown chain {0}")]
    UnknownChain(Id),

    #[error("chains not bootstrapped: {0:?}")]
    NotBootstrapped(Vec<Id>),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("vm error: {0}")]
    Vm(#[from] VmError),
}

impl ConsensusError {
    /// Whether the error must stop the chain.
    ///
    /// Peer faults and individual dropped jobs are recovered locally; storage,
    /// VM, and invariant failures risk divergence and are fatal.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::JobDropped { .. } | Self::UnexpectedTimeout | Self::UnknownValidator(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        let dropped = ConsensusError::JobDropped {
            id: Id::EMPTY,
            reason: "missing dependencies".into(),
        };
        assert!(!dropped.is_fatal());
        assert!(ConsensusError::Database(DatabaseError::Closed).is_fatal());
        assert!(ConsensusError::Vm(VmError::Internal("disk".into())).is_fatal());
        assert!(ConsensusError::NoPeers(Id::EMPTY).is_fatal());
    }
}
