//! Snowman consensus.
//!
//! Processing blocks form a tree rooted at the last accepted block. Each
//! block with children runs a Snowball instance choosing among them, and the
//! preferred chain follows those preferences down from the root.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use savannah_ids::Id;
use savannah_utils::Bag;
use tracing::{debug, trace};

use super::snowball::Snowball;
use super::{Decisions, HealthReport};
use crate::vm::{Block, BlockRef};
use crate::{Parameters, Result};

struct Node {
    /// Absent for the last accepted block
    block: Option<BlockRef>,
    parent: Id,
    /// Children in the order they were added
    children: Vec<Id>,
    /// Chooses among `children`, created with the first child
    sb: Option<Snowball>,
    added: Instant,
}

/// Tree-based Snowman consensus.
pub struct Topological {
    params: Parameters,
    /// Last accepted block ID
    last_accepted: Id,
    /// Last accepted block height
    last_accepted_height: u64,
    /// The last accepted block and every processing block
    nodes: HashMap<Id, Node>,
    /// Preferred processing chain, from the child of the last accepted block
    preferred: Vec<Id>,
}

impl Topological {
    pub fn new(params: Parameters, last_accepted: Id, last_accepted_height: u64) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            last_accepted,
            Node {
                block: None,
                parent: Id::EMPTY,
                children: Vec::new(),
                sb: None,
                added: Instant::now(),
            },
        );
        Self {
            params,
            last_accepted,
            last_accepted_height,
            nodes,
            preferred: Vec::new(),
        }
    }

    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    pub fn last_accepted(&self) -> (Id, u64) {
        (self.last_accepted, self.last_accepted_height)
    }

    pub fn num_processing(&self) -> usize {
        self.nodes.len() - 1
    }

    /// Whether `id` is a processing block.
    pub fn processing(&self, id: &Id) -> bool {
        *id != self.last_accepted && self.nodes.contains_key(id)
    }

    /// Whether `block` can no longer be issued.
    pub fn decided(&self, block: &dyn Block) -> bool {
        if block.status().decided() {
            return true;
        }
        block.height() <= self.last_accepted_height && !self.processing(&block.id())
    }

    /// Tip of the preferred chain.
    pub fn preference(&self) -> Id {
        self.preferred.last().copied().unwrap_or(self.last_accepted)
    }

    pub fn is_preferred(&self, id: &Id) -> bool {
        *id == self.last_accepted || self.preferred.contains(id)
    }

    /// Adds a block whose parent is the last accepted block or processing.
    ///
    /// A block whose parent is neither can never be accepted and is rejected
    /// right away.
    pub fn add(&mut self, block: BlockRef) -> Result<Decisions> {
        let id = block.id();
        let parent = block.parent();
        let mut decisions = Decisions::default();
        if self.nodes.contains_key(&id) {
            return Ok(decisions);
        }

        let Some(parent_node) = self.nodes.get_mut(&parent) else {
            debug!(block_id = %id, parent_id = %parent, "rejecting block with decided parent");
            block.reject()?;
            decisions.rejected.push(id);
            return Ok(decisions);
        };
        parent_node.children.push(id);
        match parent_node.sb.as_mut() {
            Some(sb) => sb.add(id),
            None => parent_node.sb = Some(Snowball::new(&self.params, id)),
        }

        self.nodes.insert(
            id,
            Node {
                block: Some(block),
                parent,
                children: Vec::new(),
                sb: None,
                added: Instant::now(),
            },
        );
        if parent == self.preference() {
            self.preferred.push(id);
        }
        trace!(block_id = %id, parent_id = %parent, "added block to consensus");
        Ok(decisions)
    }

    /// Applies the result of a finished poll.
    pub fn record_poll(&mut self, votes: &Bag<Id>) -> Result<Decisions> {
        // Each vote for a block also counts for every processing ancestor,
        // tallied at that ancestor's parent.
        let mut kid_votes: HashMap<Id, Bag<Id>> = HashMap::new();
        for (voted, count) in votes.iter() {
            let mut cur = *voted;
            while cur != self.last_accepted {
                let Some(node) = self.nodes.get(&cur) else {
                    break;
                };
                kid_votes.entry(node.parent).or_default().add_count(cur, count);
                cur = node.parent;
            }
        }

        let mut cur = self.last_accepted;
        loop {
            let Some(node) = self.nodes.get_mut(&cur) else {
                break;
            };
            let Some(sb) = node.sb.as_mut() else {
                break;
            };
            let next = match kid_votes.get(&cur) {
                Some(kids) => {
                    if sb.record_poll(kids) {
                        kids.mode().map(|(id, _)| *id)
                    } else {
                        None
                    }
                }
                None => {
                    sb.record_unsuccessful_poll();
                    None
                }
            };
            let children = node.children.clone();
            for child in children {
                if Some(child) == next {
                    continue;
                }
                if let Some(sb) = self.nodes.get_mut(&child).and_then(|n| n.sb.as_mut()) {
                    sb.record_unsuccessful_poll();
                }
            }
            match next {
                Some(next) => cur = next,
                None => break,
            }
        }

        let mut decisions = Decisions::default();
        while let Some(child) = self.finalized_child() {
            self.accept(child, &mut decisions)?;
        }
        self.update_preferred();
        Ok(decisions)
    }

    fn finalized_child(&self) -> Option<Id> {
        let sb = self.nodes.get(&self.last_accepted)?.sb.as_ref()?;
        sb.finalized().then(|| sb.preference())
    }

    fn accept(&mut self, id: Id, decisions: &mut Decisions) -> Result<()> {
        let Some(root) = self.nodes.remove(&self.last_accepted) else {
            return Ok(());
        };
        let Some(node) = self.nodes.get_mut(&id) else {
            return Ok(());
        };
        let height = match node.block.take() {
            Some(block) => {
                block.accept()?;
                block.height()
            }
            None => self.last_accepted_height + 1,
        };
        debug!(block_id = %id, height, "accepted block");
        self.last_accepted = id;
        self.last_accepted_height = height;
        decisions.accepted.push(id);

        let mut to_reject: Vec<Id> = root.children.into_iter().filter(|c| *c != id).collect();
        while let Some(rejected) = to_reject.pop() {
            let Some(node) = self.nodes.remove(&rejected) else {
                continue;
            };
            if let Some(block) = node.block {
                block.reject()?;
            }
            trace!(block_id = %rejected, "rejected block");
            decisions.rejected.push(rejected);
            to_reject.extend(node.children);
        }
        Ok(())
    }

    fn update_preferred(&mut self) {
        self.preferred.clear();
        let mut cur = self.last_accepted;
        while let Some(sb) = self.nodes.get(&cur).and_then(|n| n.sb.as_ref()) {
            cur = sb.preference();
            self.preferred.push(cur);
        }
    }

    pub fn health_check(&self) -> HealthReport {
        let longest = self
            .nodes
            .iter()
            .filter(|(id, _)| **id != self.last_accepted)
            .map(|(_, node)| node.added.elapsed())
            .max()
            .unwrap_or(Duration::ZERO);
        HealthReport::new(&self.params, self.num_processing(), longest)
    }
}
