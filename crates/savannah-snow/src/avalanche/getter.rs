//! Serves vertex requests from other nodes.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use savannah_ids::{Id, NodeId};
use tracing::{debug, trace};

use crate::choices::Status;
use crate::common::{BootstrapConfig, GetServer, Sender};
use crate::vm::VertexManager;
use crate::Result;

const CONTAINER_LEN_OVERHEAD: usize = 4;

pub struct Getter {
    manager: Arc<dyn VertexManager>,
    sender: Arc<dyn Sender>,
    config: BootstrapConfig,
}

impl Getter {
    pub fn new(manager: Arc<dyn VertexManager>, sender: Arc<dyn Sender>, config: BootstrapConfig) -> Self {
        Self {
            manager,
            sender,
            config,
        }
    }

    /// `vtx_id` followed by its ancestors in breadth-first order, within the
    /// response limits. Empty if the vertex is unknown.
    fn ancestors(&self, vtx_id: &Id) -> Result<Vec<Vec<u8>>> {
        let start = Instant::now();
        let vtx = match self.manager.get_vtx(vtx_id) {
            Ok(vtx) => vtx,
            Err(err) if err.is_not_found() => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut containers = Vec::new();
        let mut total_len = 0;
        let mut queued = HashSet::from([*vtx_id]);
        let mut queue = VecDeque::from([vtx]);
        while let Some(vtx) = queue.pop_front() {
            if containers.len() >= self.config.ancestors_max_containers_sent
                || start.elapsed() >= self.config.max_time_get_ancestors
            {
                break;
            }
            let bytes = vtx.bytes();
            let new_len = total_len + bytes.len() + CONTAINER_LEN_OVERHEAD;
            if !containers.is_empty() && new_len > self.config.ancestors_max_bytes_sent {
                break;
            }
            containers.push(bytes);
            total_len = new_len;

            for parent_id in vtx.parent_ids() {
                if !queued.insert(parent_id) {
                    continue;
                }
                match self.manager.get_vtx(&parent_id) {
                    Ok(parent) => queue.push_back(parent),
                    Err(err) => {
                        trace!(vtx_id = %parent_id, error = %err, "skipping unknown ancestor");
                    }
                }
            }
        }
        Ok(containers)
    }
}

impl GetServer for Getter {
    fn get_accepted_frontier(&self, node_id: NodeId, request_id: u32) -> Result<()> {
        self.sender
            .send_accepted_frontier(node_id, request_id, self.manager.edge());
        Ok(())
    }

    fn get_accepted(&self, node_id: NodeId, request_id: u32, container_ids: Vec<Id>) -> Result<()> {
        let accepted = container_ids
            .into_iter()
            .filter(|id| {
                self.manager
                    .get_vtx(id)
                    .is_ok_and(|vtx| vtx.status() == Status::Accepted)
            })
            .collect();
        self.sender.send_accepted(node_id, request_id, accepted);
        Ok(())
    }

    fn get_ancestors(&self, node_id: NodeId, request_id: u32, container_id: Id) -> Result<()> {
        let containers = match self.ancestors(&container_id) {
            Ok(containers) => containers,
            Err(err) => {
                debug!(%node_id, request_id, vtx_id = %container_id, error = %err, "couldn't get ancestors");
                return Ok(());
            }
        };
        if containers.is_empty() {
            trace!(vtx_id = %container_id, "dropping GetAncestors for unknown vertex");
            return Ok(());
        }
        self.sender.send_ancestors(node_id, request_id, containers);
        Ok(())
    }

    fn get(&self, node_id: NodeId, request_id: u32, container_id: Id) -> Result<()> {
        match self.manager.get_vtx(&container_id) {
            Ok(vtx) => self.sender.send_put(node_id, request_id, vtx.bytes()),
            Err(err) => {
                trace!(%node_id, request_id, vtx_id = %container_id, error = %err, "dropping Get");
            }
        }
        Ok(())
    }
}
