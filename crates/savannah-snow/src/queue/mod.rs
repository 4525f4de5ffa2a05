//! Persistent dependency queue.
//!
//! Jobs wait in the queue until every container they depend on is accepted,
//! then run in an order that respects those dependencies. The queue lives
//! in a versioned database and commits after each executed job, so a crash
//! never re-runs a finished job nor loses a pending one.

mod jobs;
mod state;

pub use jobs::{Jobs, JobsWithMissing};
pub(crate) use jobs::STATUS_UPDATE_FREQUENCY;

use std::collections::BTreeSet;

use savannah_ids::Id;

use crate::Result;

/// A unit of bootstrap work.
pub trait Job: Send {
    fn id(&self) -> Id;

    /// IDs that must be accepted before the job can run.
    fn missing_dependencies(&self) -> Result<BTreeSet<Id>>;

    fn has_missing_dependencies(&self) -> Result<bool> {
        Ok(!self.missing_dependencies()?.is_empty())
    }

    /// Runs the job. [`crate::ConsensusError::JobDropped`] discards the job
    /// and everything waiting on it; any other error is fatal.
    fn execute(&self) -> Result<()>;

    /// Bytes handed back to [`Parser::parse`] after a restart.
    fn bytes(&self) -> Vec<u8>;
}

/// Rebuilds jobs from their persisted bytes.
pub trait Parser: Send + Sync {
    /// Type name the job records are registered under.
    fn type_name(&self) -> &'static str;

    fn parse(&self, bytes: &[u8]) -> Result<Box<dyn Job>>;
}
