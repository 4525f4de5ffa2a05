//! Queue jobs that accept a fetched vertex.

use std::collections::BTreeSet;
use std::sync::Arc;

use savannah_ids::Id;
use tracing::{debug, trace};

use crate::choices::Status;
use crate::codec::VERTEX_JOB;
use crate::queue::{Job, Parser};
use crate::vm::{VertexManager, VertexRef};
use crate::{ConsensusError, Result};

pub(crate) struct VertexParser {
    pub manager: Arc<dyn VertexManager>,
}

impl Parser for VertexParser {
    fn type_name(&self) -> &'static str {
        VERTEX_JOB
    }

    fn parse(&self, bytes: &[u8]) -> Result<Box<dyn Job>> {
        let vtx = self.manager.parse_vtx(bytes)?;
        Ok(Box::new(VertexJob {
            vtx,
            manager: Arc::clone(&self.manager),
        }))
    }
}

/// Accepts a vertex once its parents are accepted. Its transactions run in
/// their own queue, which is drained first.
pub(crate) struct VertexJob {
    pub vtx: VertexRef,
    pub manager: Arc<dyn VertexManager>,
}

impl Job for VertexJob {
    fn id(&self) -> Id {
        self.vtx.id()
    }

    fn missing_dependencies(&self) -> Result<BTreeSet<Id>> {
        let mut missing = BTreeSet::new();
        for parent_id in self.vtx.parent_ids() {
            match self.manager.get_vtx(&parent_id) {
                Ok(parent) if parent.status() == Status::Accepted => {}
                Ok(_) => {
                    missing.insert(parent_id);
                }
                Err(err) if err.is_not_found() => {
                    missing.insert(parent_id);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(missing)
    }

    fn execute(&self) -> Result<()> {
        let id = self.vtx.id();
        if self.has_missing_dependencies()? {
            return Err(ConsensusError::JobDropped {
                id,
                reason: "missing dependencies on accept".into(),
            });
        }
        for tx in self.vtx.txs()? {
            if tx.status() != Status::Accepted {
                return Err(ConsensusError::JobDropped {
                    id,
                    reason: format!("tx {} is not accepted", tx.id()),
                });
            }
        }
        match self.vtx.status() {
            Status::Accepted => {
                debug!(vtx_id = %id, "vertex already accepted");
                Ok(())
            }
            status @ (Status::Unknown | Status::Rejected) => Err(ConsensusError::JobDropped {
                id,
                reason: format!("attempting to execute vertex with status {status}"),
            }),
            Status::Processing => {
                trace!(vtx_id = %id, height = self.vtx.height(), "accepting vertex in bootstrapping");
                self.vtx.accept()?;
                Ok(())
            }
        }
    }

    fn bytes(&self) -> Vec<u8> {
        self.vtx.bytes()
    }
}

#[cfg(test)]
mod tests {
    use savannah_db::MemDb;

    use super::*;
    use crate::avalanche::state::Serializer;
    use crate::codec::Codecs;
    use crate::testing::{chain_id, TestDagVm, TestTx};
    use crate::vm::Tx;

    #[test]
    fn test_vertex_job_waits_for_parents_and_txs() {
        let vm = Arc::new(TestDagVm::default());
        let (tx1, tx2) = (TestTx::new(1, vec![], vec![]), TestTx::new(2, vec![], vec![]));
        vm.add_parseable(tx1.clone());
        vm.add_parseable(tx2.clone());
        let manager: Arc<dyn VertexManager> = Arc::new(
            Serializer::new(
                chain_id(),
                Arc::new(MemDb::new()),
                Arc::new(Codecs::new().unwrap()),
                vm.clone(),
            )
            .unwrap(),
        );
        let root = manager.build_vtx(vec![], vec![tx1.clone()]).unwrap();
        let child = manager.build_vtx(vec![root.id()], vec![tx2.clone()]).unwrap();

        let child_job = VertexJob {
            vtx: child.clone(),
            manager: manager.clone(),
        };
        assert_eq!(child_job.missing_dependencies().unwrap(), BTreeSet::from([root.id()]));

        let root_job = VertexJob {
            vtx: root.clone(),
            manager: manager.clone(),
        };
        // tx1 is still processing
        assert!(matches!(root_job.execute(), Err(ConsensusError::JobDropped { .. })));
        tx1.accept().unwrap();
        root_job.execute().unwrap();
        assert_eq!(root.status(), Status::Accepted);

        assert!(!child_job.has_missing_dependencies().unwrap());
        tx2.accept().unwrap();
        child_job.execute().unwrap();
        assert_eq!(manager.edge(), vec![child.id()]);
    }
}
