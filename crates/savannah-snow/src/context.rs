//! Per-chain identity and lifecycle state.

use std::fmt;

use parking_lot::RwLock;
use savannah_ids::{Id, NodeId};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{ConsensusError, Result};

/// Lifecycle phase of a chain.
///
/// Phases only move forward, except that a chain in normal operation may
/// drop back to bootstrapping when it falls behind.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum ChainState {
    #[default]
    Initializing,
    StateSyncing,
    Bootstrapping,
    NormalOp,
}

impl ChainState {
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        next >= self || (self == Self::NormalOp && next == Self::Bootstrapping)
    }
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initializing => "initializing",
            Self::StateSyncing => "state_syncing",
            Self::Bootstrapping => "bootstrapping",
            Self::NormalOp => "normal_op",
        })
    }
}

/// Identity of a chain plus its current [`ChainState`].
///
/// Shared between the chain's handler, its gears, and the manager; the state
/// is read far more often than written.
#[derive(Debug)]
pub struct ConsensusContext {
    pub chain_id: Id,
    pub subnet_id: Id,
    pub node_id: NodeId,
    state: RwLock<ChainState>,
    /// The fatal error that stopped the chain, if any
    failure: RwLock<Option<String>>,
}

impl ConsensusContext {
    pub fn new(chain_id: Id, subnet_id: Id, node_id: NodeId) -> Self {
        Self {
            chain_id,
            subnet_id,
            node_id,
            state: RwLock::new(ChainState::Initializing),
            failure: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn state(&self) -> ChainState {
        *self.state.read()
    }

    /// # Errors
    ///
    /// Rejects transitions that move the chain backwards.
    pub fn set_state(&self, next: ChainState) -> Result<()> {
        let mut state = self.state.write();
        if *state == next {
            return Ok(());
        }
        if !state.can_transition_to(next) {
            return Err(ConsensusError::InvalidTransition {
                from: *state,
                to: next,
            });
        }
        info!(chain_id = %self.chain_id, from = %*state, to = %next, "chain state changed");
        *state = next;
        Ok(())
    }

    #[must_use]
    pub fn is_bootstrapped(&self) -> bool {
        self.state() == ChainState::NormalOp
    }

    /// Records why the chain stopped. The first failure is kept.
    pub fn record_failure(&self, err: &ConsensusError) {
        let mut failure = self.failure.write();
        if failure.is_none() {
            *failure = Some(err.to_string());
        }
    }

    #[must_use]
    pub fn failure(&self) -> Option<String> {
        self.failure.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ConsensusContext {
        ConsensusContext::new(Id::from_hash(b"chain"), Id::EMPTY, NodeId::EMPTY)
    }

    #[test]
    fn test_forward_transitions() {
        let ctx = ctx();
        ctx.set_state(ChainState::StateSyncing).unwrap();
        ctx.set_state(ChainState::Bootstrapping).unwrap();
        ctx.set_state(ChainState::NormalOp).unwrap();
        assert!(ctx.is_bootstrapped());
    }

    #[test]
    fn test_restart_from_normal_op() {
        let ctx = ctx();
        ctx.set_state(ChainState::NormalOp).unwrap();
        ctx.set_state(ChainState::Bootstrapping).unwrap();
        assert_eq!(ctx.state(), ChainState::Bootstrapping);
    }

    #[test]
    fn test_first_failure_kept() {
        let ctx = ctx();
        assert!(ctx.failure().is_none());
        ctx.record_failure(&ConsensusError::UnexpectedTimeout);
        ctx.record_failure(&ConsensusError::HandlerClosed);
        assert_eq!(
            ctx.failure(),
            Some(ConsensusError::UnexpectedTimeout.to_string())
        );
    }

    #[test]
    fn test_backwards_rejected() {
        let ctx = ctx();
        ctx.set_state(ChainState::Bootstrapping).unwrap();
        assert!(matches!(
            ctx.set_state(ChainState::StateSyncing),
            Err(ConsensusError::InvalidTransition { .. })
        ));
        ctx.set_state(ChainState::NormalOp).unwrap();
        assert!(ctx.set_state(ChainState::Initializing).is_err());
    }
}
