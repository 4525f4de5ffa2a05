//! Serves block requests from other nodes.

use std::sync::Arc;
use std::time::Instant;

use savannah_ids::{Id, NodeId};
use tracing::{debug, trace};

use crate::choices::Status;
use crate::common::{BootstrapConfig, GetServer, Sender};
use crate::vm::ChainVm;
use crate::Result;

/// Length prefix each container costs in an `Ancestors` message.
const CONTAINER_LEN_OVERHEAD: usize = 4;

pub struct Getter {
    vm: Arc<dyn ChainVm>,
    sender: Arc<dyn Sender>,
    config: BootstrapConfig,
}

impl Getter {
    pub fn new(vm: Arc<dyn ChainVm>, sender: Arc<dyn Sender>, config: BootstrapConfig) -> Self {
        Self { vm, sender, config }
    }

    /// `block_id` followed by its ancestors, newest first, within the
    /// response limits. Empty if the block is unknown.
    fn ancestors(&self, block_id: &Id) -> Result<Vec<Vec<u8>>> {
        let start = Instant::now();
        let mut block = match self.vm.get_block(block_id) {
            Ok(block) => block,
            Err(err) if err.is_not_found() => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let first = block.bytes();
        let mut total_len = first.len() + CONTAINER_LEN_OVERHEAD;
        let mut containers = vec![first];
        while containers.len() < self.config.ancestors_max_containers_sent
            && start.elapsed() < self.config.max_time_get_ancestors
        {
            block = match self.vm.get_block(&block.parent()) {
                Ok(parent) => parent,
                Err(_) => break,
            };
            let bytes = block.bytes();
            let new_len = total_len + bytes.len() + CONTAINER_LEN_OVERHEAD;
            if new_len > self.config.ancestors_max_bytes_sent {
                break;
            }
            containers.push(bytes);
            total_len = new_len;
        }
        Ok(containers)
    }
}

impl GetServer for Getter {
    fn get_accepted_frontier(&self, node_id: NodeId, request_id: u32) -> Result<()> {
        let last_accepted = self.vm.last_accepted()?;
        self.sender
            .send_accepted_frontier(node_id, request_id, vec![last_accepted]);
        Ok(())
    }

    fn get_accepted(&self, node_id: NodeId, request_id: u32, container_ids: Vec<Id>) -> Result<()> {
        let accepted = container_ids
            .into_iter()
            .filter(|id| {
                self.vm
                    .get_block(id)
                    .map(|block| block.status() == Status::Accepted)
                    .unwrap_or(false)
            })
            .collect();
        self.sender.send_accepted(node_id, request_id, accepted);
        Ok(())
    }

    fn get_ancestors(&self, node_id: NodeId, request_id: u32, container_id: Id) -> Result<()> {
        trace!(%node_id, request_id, block_id = %container_id, "called GetAncestors");
        let containers = match self.ancestors(&container_id) {
            Ok(containers) => containers,
            Err(err) => {
                debug!(%node_id, request_id, block_id = %container_id, error = %err, "couldn't get ancestors");
                return Ok(());
            }
        };
        if containers.is_empty() {
            trace!(block_id = %container_id, "dropping GetAncestors for unknown block");
            return Ok(());
        }
        self.sender.send_ancestors(node_id, request_id, containers);
        Ok(())
    }

    fn get(&self, node_id: NodeId, request_id: u32, container_id: Id) -> Result<()> {
        match self.vm.get_block(&container_id) {
            Ok(block) => self.sender.send_put(node_id, request_id, block.bytes()),
            Err(err) => {
                trace!(%node_id, request_id, block_id = %container_id, error = %err, "dropping Get");
            }
        }
        Ok(())
    }
}
