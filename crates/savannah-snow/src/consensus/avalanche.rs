//! Avalanche consensus.
//!
//! Vertices batch transactions into a DAG. A vote for a vertex is a vote for
//! every transaction in it and in its processing ancestors. Transactions
//! that spend the same input conflict; among conflicts, the one with the
//! most successful polls is preferred. A transaction is accepted once it has
//! been voted for in enough consecutive polls and its dependencies are
//! accepted. A vertex is accepted once its transactions and parents are.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use savannah_ids::Id;
use savannah_utils::Bag;
use tracing::{debug, trace};

use super::{Decisions, HealthReport};
use crate::choices::Status;
use crate::vm::{TxRef, VertexRef};
use crate::{Parameters, Result};

struct TxNode {
    tx: TxRef,
    inputs: Vec<Id>,
    dependencies: Vec<Id>,
    /// Conflicting transactions that currently beat this one
    ins: HashSet<Id>,
    num_successful_polls: usize,
    /// Consecutive successful polls, valid while `last_vote` is current
    confidence: usize,
    last_vote: u64,
    rogue: bool,
    /// Confidence has passed beta while preferred
    finalized: bool,
}

impl TxNode {
    fn preferred(&self) -> bool {
        self.ins.is_empty()
    }
}

struct VtxNode {
    vtx: VertexRef,
    parents: Vec<Id>,
    txs: Vec<Id>,
    height: u64,
    added: Instant,
}

/// DAG consensus over vertices and their transactions.
pub struct Topological {
    params: Parameters,
    /// Processing transactions
    txs: HashMap<Id, TxNode>,
    /// Processing transactions spending each input
    spenders: HashMap<Id, BTreeSet<Id>>,
    /// Processing vertices
    vertices: HashMap<Id, VtxNode>,
    rejected_txs: HashSet<Id>,
    rejected_vertices: HashSet<Id>,
    /// Number of polls recorded
    current_vote: u64,
}

impl Topological {
    pub fn new(params: Parameters) -> Self {
        Self {
            params,
            txs: HashMap::new(),
            spenders: HashMap::new(),
            vertices: HashMap::new(),
            rejected_txs: HashSet::new(),
            rejected_vertices: HashSet::new(),
            current_vote: 0,
        }
    }

    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    /// Number of processing vertices.
    pub fn num_processing(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_processing_txs(&self) -> usize {
        self.txs.len()
    }

    pub fn vertex_processing(&self, id: &Id) -> bool {
        self.vertices.contains_key(id)
    }

    pub fn tx_processing(&self, id: &Id) -> bool {
        self.txs.contains_key(id)
    }

    /// Whether a processing transaction has no conflict beating it.
    pub fn tx_preferred(&self, id: &Id) -> bool {
        self.txs.get(id).is_some_and(TxNode::preferred)
    }

    /// Whether a transaction conflicts with no other processing transaction.
    pub fn tx_virtuous(&self, id: &Id) -> bool {
        self.txs.get(id).is_some_and(|node| !node.rogue)
    }

    /// Adds a vertex whose parents are accepted or processing.
    pub fn add(&mut self, vtx: VertexRef) -> Result<Decisions> {
        let id = vtx.id();
        let mut decisions = Decisions::default();
        if self.vertices.contains_key(&id) || vtx.status().decided() {
            return Ok(decisions);
        }

        let parents = vtx.parent_ids();
        if parents.iter().any(|p| self.rejected_vertices.contains(p)) {
            debug!(vtx_id = %id, "rejecting vertex with rejected parent");
            vtx.reject()?;
            self.rejected_vertices.insert(id);
            decisions.rejected.push(id);
            return Ok(decisions);
        }

        let mut tx_ids = Vec::new();
        for tx in vtx.txs()? {
            tx_ids.push(tx.id());
            self.add_tx(tx);
        }
        trace!(vtx_id = %id, txs = tx_ids.len(), "added vertex to consensus");
        self.vertices.insert(
            id,
            VtxNode {
                height: vtx.height(),
                vtx,
                parents,
                txs: tx_ids,
                added: Instant::now(),
            },
        );
        self.update(&mut decisions)?;
        Ok(decisions)
    }

    fn add_tx(&mut self, tx: TxRef) {
        let id = tx.id();
        if self.txs.contains_key(&id) || self.rejected_txs.contains(&id) {
            return;
        }
        match tx.status() {
            Status::Accepted => return,
            Status::Rejected => {
                self.rejected_txs.insert(id);
                return;
            }
            Status::Unknown | Status::Processing => {}
        }

        let inputs = tx.input_ids();
        let mut ins = HashSet::new();
        for input in &inputs {
            let spenders = self.spenders.entry(*input).or_default();
            for other in spenders.iter() {
                if let Some(node) = self.txs.get_mut(other) {
                    node.rogue = true;
                }
                ins.insert(*other);
            }
            spenders.insert(id);
        }
        let rogue = !ins.is_empty();
        self.txs.insert(
            id,
            TxNode {
                dependencies: tx.dependencies(),
                tx,
                inputs,
                ins,
                num_successful_polls: 0,
                confidence: 0,
                last_vote: 0,
                rogue,
                finalized: false,
            },
        );
    }

    fn conflicts(&self, id: &Id) -> BTreeSet<Id> {
        let mut conflicts = BTreeSet::new();
        if let Some(node) = self.txs.get(id) {
            for input in &node.inputs {
                if let Some(spenders) = self.spenders.get(input) {
                    conflicts.extend(spenders.iter().filter(|s| *s != id).copied());
                }
            }
        }
        conflicts
    }

    /// Applies a poll whose votes name vertices.
    pub fn record_poll(&mut self, votes: &Bag<Id>) -> Result<Decisions> {
        self.current_vote += 1;

        let mut tx_votes: Bag<Id> = Bag::new();
        for (vtx_id, count) in votes.iter() {
            for tx_id in self.ancestor_txs(vtx_id) {
                tx_votes.add_count(tx_id, count);
            }
        }

        let successful: Vec<Id> = tx_votes
            .iter()
            .filter(|(_, count)| *count >= self.params.alpha)
            .map(|(id, _)| *id)
            .collect();
        for tx_id in successful {
            self.record_successful_poll(tx_id);
        }

        let mut decisions = Decisions::default();
        self.update(&mut decisions)?;
        Ok(decisions)
    }

    /// Processing transactions in `vtx_id` and its processing ancestors.
    fn ancestor_txs(&self, vtx_id: &Id) -> HashSet<Id> {
        let mut txs = HashSet::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([*vtx_id]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let Some(node) = self.vertices.get(&id) else {
                continue;
            };
            txs.extend(node.txs.iter().filter(|tx| self.txs.contains_key(*tx)));
            queue.extend(node.parents.iter().copied());
        }
        txs
    }

    fn record_successful_poll(&mut self, id: Id) {
        let current_vote = self.current_vote;
        let (beta_virtuous, beta_rogue) = (self.params.beta_virtuous, self.params.beta_rogue);
        let num_successful_polls = {
            let Some(node) = self.txs.get_mut(&id) else {
                return;
            };
            node.confidence = if node.last_vote + 1 == current_vote {
                node.confidence + 1
            } else {
                1
            };
            node.last_vote = current_vote;
            node.num_successful_polls += 1;
            node.num_successful_polls
        };

        // Take the preference from every conflict this one now strictly beats.
        for other in self.conflicts(&id) {
            let beats = self
                .txs
                .get(&other)
                .is_some_and(|o| num_successful_polls > o.num_successful_polls);
            if !beats {
                continue;
            }
            if let Some(node) = self.txs.get_mut(&id) {
                node.ins.remove(&other);
            }
            if let Some(o) = self.txs.get_mut(&other) {
                o.ins.insert(id);
            }
        }

        if let Some(node) = self.txs.get_mut(&id) {
            let beta_met = (!node.rogue && node.confidence >= beta_virtuous)
                || node.confidence >= beta_rogue;
            if beta_met && node.preferred() {
                node.finalized = true;
            }
        }
    }

    fn dependency_state(&self, dep: &Id) -> Status {
        if self.txs.contains_key(dep) {
            Status::Processing
        } else if self.rejected_txs.contains(dep) {
            Status::Rejected
        } else {
            Status::Accepted
        }
    }

    /// Decides everything that can be decided, until nothing changes.
    fn update(&mut self, decisions: &mut Decisions) -> Result<()> {
        loop {
            let mut changed = false;

            let mut tx_ids: Vec<Id> = self.txs.keys().copied().collect();
            tx_ids.sort();
            for id in tx_ids {
                let Some(node) = self.txs.get(&id) else {
                    continue;
                };
                let deps: Vec<Status> = node
                    .dependencies
                    .iter()
                    .map(|d| self.dependency_state(d))
                    .collect();
                if deps.contains(&Status::Rejected) {
                    self.reject_tx(id, decisions)?;
                    changed = true;
                } else if node.finalized && deps.iter().all(|s| *s == Status::Accepted) {
                    self.accept_tx(id, decisions)?;
                    changed = true;
                }
            }

            let mut vtx_ids: Vec<(u64, Id)> =
                self.vertices.iter().map(|(id, n)| (n.height, *id)).collect();
            vtx_ids.sort();
            for (_, id) in vtx_ids {
                let Some(node) = self.vertices.get(&id) else {
                    continue;
                };
                let rejected = node.parents.iter().any(|p| self.rejected_vertices.contains(p))
                    || node.txs.iter().any(|tx| self.rejected_txs.contains(tx));
                let accepted = !rejected
                    && node.parents.iter().all(|p| !self.vertices.contains_key(p))
                    && node.txs.iter().all(|tx| !self.txs.contains_key(tx));
                if !rejected && !accepted {
                    continue;
                }
                let Some(node) = self.vertices.remove(&id) else {
                    continue;
                };
                changed = true;
                if rejected {
                    node.vtx.reject()?;
                    self.rejected_vertices.insert(id);
                    decisions.rejected.push(id);
                    debug!(vtx_id = %id, "rejected vertex");
                } else {
                    node.vtx.accept()?;
                    decisions.accepted.push(id);
                    debug!(vtx_id = %id, "accepted vertex");
                }
            }

            if !changed {
                return Ok(());
            }
        }
    }

    fn accept_tx(&mut self, id: Id, decisions: &mut Decisions) -> Result<()> {
        let conflicts = self.conflicts(&id);
        let Some(node) = self.remove_tx(&id) else {
            return Ok(());
        };
        node.tx.accept()?;
        trace!(tx_id = %id, "accepted tx");
        decisions.accepted.push(id);
        for conflict in conflicts {
            self.reject_tx(conflict, decisions)?;
        }
        Ok(())
    }

    fn reject_tx(&mut self, id: Id, decisions: &mut Decisions) -> Result<()> {
        let Some(node) = self.remove_tx(&id) else {
            return Ok(());
        };
        node.tx.reject()?;
        trace!(tx_id = %id, "rejected tx");
        self.rejected_txs.insert(id);
        decisions.rejected.push(id);
        Ok(())
    }

    fn remove_tx(&mut self, id: &Id) -> Option<TxNode> {
        let node = self.txs.remove(id)?;
        for input in &node.inputs {
            if let Some(spenders) = self.spenders.get_mut(input) {
                spenders.remove(id);
                for other in spenders.iter() {
                    if let Some(o) = self.txs.get_mut(other) {
                        o.ins.remove(id);
                    }
                }
                if spenders.is_empty() {
                    self.spenders.remove(input);
                }
            }
        }
        Some(node)
    }

    /// Preferred processing vertices that no other preferred vertex builds
    /// on. Empty when nothing preferred is processing.
    pub fn preferences(&self) -> BTreeSet<Id> {
        let mut ordered: Vec<(&u64, &Id)> =
            self.vertices.iter().map(|(id, n)| (&n.height, id)).collect();
        ordered.sort();

        let mut preferred = HashSet::new();
        for (_, id) in ordered {
            let Some(node) = self.vertices.get(id) else {
                continue;
            };
            let txs_preferred = node
                .txs
                .iter()
                .all(|tx| self.txs.get(tx).map_or(!self.rejected_txs.contains(tx), TxNode::preferred));
            let parents_preferred = node
                .parents
                .iter()
                .all(|p| !self.vertices.contains_key(p) || preferred.contains(p));
            if txs_preferred && parents_preferred {
                preferred.insert(*id);
            }
        }

        let mut frontier: BTreeSet<Id> = preferred.iter().copied().collect();
        for id in &preferred {
            if let Some(node) = self.vertices.get(id) {
                for parent in &node.parents {
                    frontier.remove(parent);
                }
            }
        }
        frontier
    }

    pub fn health_check(&self) -> HealthReport {
        let longest = self
            .vertices
            .values()
            .map(|node| node.added.elapsed())
            .max()
            .unwrap_or(Duration::ZERO);
        HealthReport::new(&self.params, self.num_processing(), longest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestTx, TestVertex};

    fn params(alpha: usize, beta_virtuous: usize, beta_rogue: usize) -> Parameters {
        Parameters {
            k: alpha,
            alpha,
            beta_virtuous,
            beta_rogue,
            concurrent_repolls: 1,
            mixed_query_num_push_vdr: 1,
            ..Default::default()
        }
    }

    fn votes(ids: &[Id], count: usize) -> Bag<Id> {
        let mut bag = Bag::new();
        for id in ids {
            bag.add_count(*id, count);
        }
        bag
    }

    fn input(byte: u8) -> Id {
        Id::from_slice(&[byte; 32]).unwrap()
    }

    #[test]
    fn test_virtuous_vertex_accepted() {
        let root = TestVertex::accepted(0);
        let tx = TestTx::new(1, vec![input(1)], vec![]);
        let vtx = TestVertex::new(1, &[&root], vec![tx.clone()]);

        let mut ava = Topological::new(params(1, 1, 2));
        assert!(ava.add(vtx.clone()).unwrap().is_empty());
        assert_eq!(ava.preferences().into_iter().collect::<Vec<_>>(), vec![vtx.id()]);

        let decisions = ava.record_poll(&votes(&[vtx.id()], 1)).unwrap();
        assert_eq!(decisions.accepted, vec![tx.id(), vtx.id()]);
        assert_eq!(tx.status(), Status::Accepted);
        assert_eq!(vtx.status(), Status::Accepted);
        assert_eq!(ava.num_processing(), 0);
    }

    #[test]
    fn test_conflict_rejects_loser_and_its_vertex() {
        let root = TestVertex::accepted(0);
        let tx_a = TestTx::new(1, vec![input(1)], vec![]);
        let tx_b = TestTx::new(2, vec![input(1)], vec![]);
        let vtx_a = TestVertex::new(1, &[&root], vec![tx_a.clone()]);
        let vtx_b = TestVertex::new(2, &[&root], vec![tx_b.clone()]);

        let mut ava = Topological::new(params(1, 1, 2));
        ava.add(vtx_a.clone()).unwrap();
        ava.add(vtx_b.clone()).unwrap();
        assert!(ava.tx_preferred(&tx_a.id()));
        assert!(!ava.tx_preferred(&tx_b.id()));
        assert!(!ava.tx_virtuous(&tx_a.id()));
        assert_eq!(ava.preferences().into_iter().collect::<Vec<_>>(), vec![vtx_a.id()]);

        ava.record_poll(&votes(&[vtx_b.id()], 1)).unwrap();
        assert!(ava.tx_preferred(&tx_b.id()));

        let decisions = ava.record_poll(&votes(&[vtx_b.id()], 1)).unwrap();
        assert_eq!(tx_b.status(), Status::Accepted);
        assert_eq!(tx_a.status(), Status::Rejected);
        assert_eq!(vtx_a.status(), Status::Rejected);
        assert_eq!(vtx_b.status(), Status::Accepted);
        assert!(decisions.rejected.contains(&vtx_a.id()));
    }

    #[test]
    fn test_votes_flow_to_ancestors() {
        let root = TestVertex::accepted(0);
        let tx1 = TestTx::new(1, vec![input(1)], vec![]);
        let tx2 = TestTx::new(2, vec![input(2)], vec![]);
        let parent = TestVertex::new(1, &[&root], vec![tx1.clone()]);
        let child = TestVertex::new(2, &[&parent], vec![tx2.clone()]);

        let mut ava = Topological::new(params(2, 1, 1));
        ava.add(parent.clone()).unwrap();
        ava.add(child.clone()).unwrap();
        assert_eq!(ava.preferences().into_iter().collect::<Vec<_>>(), vec![child.id()]);

        let decisions = ava.record_poll(&votes(&[child.id()], 2)).unwrap();
        assert_eq!(decisions.accepted.len(), 4);
        assert_eq!(parent.status(), Status::Accepted);
        assert_eq!(child.status(), Status::Accepted);
    }

    #[test]
    fn test_dependency_waits() {
        let root = TestVertex::accepted(0);
        let tx1 = TestTx::new(1, vec![input(1)], vec![]);
        let tx2 = TestTx::new(2, vec![input(2)], vec![tx1.id()]);
        let vtx1 = TestVertex::new(1, &[&root], vec![tx1.clone()]);
        let vtx2 = TestVertex::new(2, &[&root], vec![tx2.clone()]);

        let mut ava = Topological::new(params(1, 1, 1));
        ava.add(vtx1.clone()).unwrap();
        ava.add(vtx2.clone()).unwrap();

        ava.record_poll(&votes(&[vtx2.id()], 1)).unwrap();
        assert_eq!(tx2.status(), Status::Processing);

        ava.record_poll(&votes(&[vtx1.id()], 1)).unwrap();
        assert_eq!(tx1.status(), Status::Accepted);
        assert_eq!(tx2.status(), Status::Accepted);
        assert_eq!(vtx2.status(), Status::Accepted);
    }

    #[test]
    fn test_non_consecutive_polls_reset() {
        let root = TestVertex::accepted(0);
        let tx = TestTx::new(1, vec![input(1)], vec![]);
        let other = TestTx::new(2, vec![input(2)], vec![]);
        let vtx = TestVertex::new(1, &[&root], vec![tx.clone()]);
        let vtx_other = TestVertex::new(2, &[&root], vec![other.clone()]);

        let mut ava = Topological::new(params(1, 2, 2));
        ava.add(vtx.clone()).unwrap();
        ava.add(vtx_other.clone()).unwrap();

        ava.record_poll(&votes(&[vtx.id()], 1)).unwrap();
        ava.record_poll(&votes(&[vtx_other.id()], 1)).unwrap();
        ava.record_poll(&votes(&[vtx.id()], 1)).unwrap();
        assert_eq!(tx.status(), Status::Processing);
        ava.record_poll(&votes(&[vtx.id()], 1)).unwrap();
        assert_eq!(tx.status(), Status::Accepted);
    }

    #[test]
    fn test_child_of_rejected_vertex_rejected() {
        let root = TestVertex::accepted(0);
        let tx_a = TestTx::new(1, vec![input(1)], vec![]);
        let tx_b = TestTx::new(2, vec![input(1)], vec![]);
        let vtx_a = TestVertex::new(1, &[&root], vec![tx_a.clone()]);
        let vtx_b = TestVertex::new(2, &[&root], vec![tx_b.clone()]);

        let mut ava = Topological::new(params(1, 1, 1));
        ava.add(vtx_a.clone()).unwrap();
        ava.add(vtx_b.clone()).unwrap();
        ava.record_poll(&votes(&[vtx_a.id()], 1)).unwrap();
        assert_eq!(vtx_b.status(), Status::Rejected);

        let late = TestVertex::new(3, &[&vtx_b], vec![TestTx::new(3, vec![input(3)], vec![])]);
        let decisions = ava.add(late.clone()).unwrap();
        assert_eq!(decisions.rejected, vec![late.id()]);
    }
}
