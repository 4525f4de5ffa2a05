//! Queue jobs that accept a fetched transaction.

use std::collections::BTreeSet;
use std::sync::Arc;

use savannah_ids::Id;
use tracing::{debug, trace};

use crate::choices::Status;
use crate::codec::TX_JOB;
use crate::queue::{Job, Parser};
use crate::vm::{DagVm, TxRef};
use crate::{ConsensusError, Result};

pub(crate) struct TxParser {
    pub vm: Arc<dyn DagVm>,
}

impl Parser for TxParser {
    fn type_name(&self) -> &'static str {
        TX_JOB
    }

    fn parse(&self, bytes: &[u8]) -> Result<Box<dyn Job>> {
        let tx = self.vm.parse_tx(bytes)?;
        Ok(Box::new(TxJob {
            tx,
            vm: Arc::clone(&self.vm),
        }))
    }
}

/// Verifies and accepts a transaction once its dependencies are accepted.
pub(crate) struct TxJob {
    pub tx: TxRef,
    pub vm: Arc<dyn DagVm>,
}

impl Job for TxJob {
    fn id(&self) -> Id {
        self.tx.id()
    }

    fn missing_dependencies(&self) -> Result<BTreeSet<Id>> {
        let mut missing = BTreeSet::new();
        for dep in self.tx.dependencies() {
            match self.vm.get_tx(&dep) {
                Ok(tx) if tx.status() == Status::Accepted => {}
                Ok(_) => {
                    missing.insert(dep);
                }
                Err(err) if err.is_not_found() => {
                    missing.insert(dep);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(missing)
    }

    fn execute(&self) -> Result<()> {
        let id = self.tx.id();
        if self.has_missing_dependencies()? {
            return Err(ConsensusError::JobDropped {
                id,
                reason: "missing dependencies on accept".into(),
            });
        }
        match self.tx.status() {
            Status::Accepted => {
                debug!(tx_id = %id, "tx already accepted");
                Ok(())
            }
            status @ (Status::Unknown | Status::Rejected) => Err(ConsensusError::JobDropped {
                id,
                reason: format!("attempting to execute tx with status {status}"),
            }),
            Status::Processing => {
                if let Err(err) = self.tx.verify() {
                    return Err(ConsensusError::JobDropped {
                        id,
                        reason: format!("failed to verify: {err}"),
                    });
                }
                trace!(tx_id = %id, "accepting tx in bootstrapping");
                self.tx.accept()?;
                Ok(())
            }
        }
    }

    fn bytes(&self) -> Vec<u8> {
        self.tx.bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestDagVm, TestTx};
    use crate::vm::Tx;

    #[test]
    fn test_tx_job_follows_dependencies() {
        let vm = Arc::new(TestDagVm::default());
        let first = TestTx::new(1, vec![], vec![]);
        let second = TestTx::new(2, vec![], vec![first.id()]);
        vm.add_pending(first.clone());
        vm.add_pending(second.clone());

        let job = TxJob {
            tx: second.clone(),
            vm: vm.clone(),
        };
        assert_eq!(job.missing_dependencies().unwrap(), BTreeSet::from([first.id()]));
        first.accept().unwrap();
        job.execute().unwrap();
        assert_eq!(second.status(), Status::Accepted);
    }

    #[test]
    fn test_tx_job_drops_invalid_tx() {
        let vm = Arc::new(TestDagVm::default());
        let bad = TestTx::new(1, vec![], vec![]);
        bad.fail_verify();
        let job = TxJob { tx: bad.clone(), vm };
        assert!(matches!(job.execute(), Err(ConsensusError::JobDropped { .. })));
        assert_eq!(bad.status(), Status::Processing);
    }
}
