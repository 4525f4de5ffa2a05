//! Queue jobs that accept a fetched block.

use std::collections::BTreeSet;
use std::sync::Arc;

use savannah_ids::Id;
use tracing::{debug, trace};

use crate::choices::Status;
use crate::codec::BLOCK_JOB;
use crate::queue::{Job, Parser};
use crate::vm::{BlockRef, ChainVm};
use crate::{ConsensusError, Result};

/// Rebuilds block jobs through the VM after a restart.
pub(crate) struct BlockParser {
    pub vm: Arc<dyn ChainVm>,
}

impl Parser for BlockParser {
    fn type_name(&self) -> &'static str {
        BLOCK_JOB
    }

    fn parse(&self, bytes: &[u8]) -> Result<Box<dyn Job>> {
        let block = self.vm.parse_block(bytes)?;
        Ok(Box::new(BlockJob {
            block,
            vm: Arc::clone(&self.vm),
        }))
    }
}

/// Accepts a block once its parent is accepted.
pub(crate) struct BlockJob {
    pub block: BlockRef,
    pub vm: Arc<dyn ChainVm>,
}

impl Job for BlockJob {
    fn id(&self) -> Id {
        self.block.id()
    }

    fn missing_dependencies(&self) -> Result<BTreeSet<Id>> {
        let parent_id = self.block.parent();
        let mut missing = BTreeSet::new();
        match self.vm.get_block(&parent_id) {
            Ok(parent) if parent.status() == Status::Accepted => {}
            Ok(_) => {
                missing.insert(parent_id);
            }
            Err(err) if err.is_not_found() => {
                missing.insert(parent_id);
            }
            Err(err) => return Err(err.into()),
        }
        Ok(missing)
    }

    fn execute(&self) -> Result<()> {
        let id = self.block.id();
        if self.has_missing_dependencies()? {
            return Err(ConsensusError::JobDropped {
                id,
                reason: "missing dependencies on accept".into(),
            });
        }
        match self.block.status() {
            Status::Accepted => {
                debug!(block_id = %id, "block already accepted");
                Ok(())
            }
            status @ (Status::Unknown | Status::Rejected) => Err(ConsensusError::JobDropped {
                id,
                reason: format!("attempting to execute block with status {status}"),
            }),
            Status::Processing => {
                if let Err(err) = self.block.verify() {
                    return Err(ConsensusError::JobDropped {
                        id,
                        reason: format!("failed to verify: {err}"),
                    });
                }
                trace!(block_id = %id, height = self.block.height(), "accepting block in bootstrapping");
                self.block.accept()?;
                Ok(())
            }
        }
    }

    fn bytes(&self) -> Vec<u8> {
        self.block.bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestBlock, TestVm};
    use crate::vm::Block;

    #[test]
    fn test_block_job_waits_for_parent() {
        let genesis = TestBlock::genesis();
        let vm = Arc::new(TestVm::new(genesis.clone()));
        let b1 = TestBlock::child(&genesis, 1);
        let b2 = TestBlock::child(&b1, 2);
        vm.add_block(b1.clone());
        vm.add_block(b2.clone());

        let job = BlockJob {
            block: b2.clone(),
            vm: vm.clone(),
        };
        assert_eq!(job.missing_dependencies().unwrap(), BTreeSet::from([b1.id()]));
        assert!(matches!(job.execute(), Err(ConsensusError::JobDropped { .. })));

        BlockJob {
            block: b1.clone(),
            vm: vm.clone(),
        }
        .execute()
        .unwrap();
        assert!(!job.has_missing_dependencies().unwrap());
        job.execute().unwrap();
        assert_eq!(b2.status(), Status::Accepted);
    }

    #[test]
    fn test_block_job_drops_unverifiable_block() {
        let genesis = TestBlock::genesis();
        let vm = Arc::new(TestVm::new(genesis.clone()));
        let bad = TestBlock::child(&genesis, 1);
        bad.fail_verify();
        vm.add_block(bad.clone());
        let job = BlockJob { block: bad.clone(), vm };
        assert!(matches!(job.execute(), Err(ConsensusError::JobDropped { .. })));
        assert_eq!(bad.status(), Status::Processing);
    }

    #[test]
    fn test_parser_round_trip() {
        let genesis = TestBlock::genesis();
        let vm = Arc::new(TestVm::new(genesis.clone()));
        let b1 = TestBlock::child(&genesis, 1);
        vm.add_parseable(b1.clone());
        let parser = BlockParser { vm };
        let job = parser.parse(&b1.bytes()).unwrap();
        assert_eq!(job.id(), b1.id());
    }
}
