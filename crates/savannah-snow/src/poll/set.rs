//! Set of outstanding polls, resolved in request order.

use std::fmt;
use std::time::Instant;

use indexmap::IndexMap;
use savannah_ids::{Id, NodeId};
use savannah_utils::Bag;
use tracing::{debug, trace};

use super::{Poll, PollFactory};

struct Holder {
    poll: Box<dyn Poll>,
    start: Instant,
}

/// Outstanding polls keyed by request ID in insertion order.
///
/// Results are released only for the longest prefix of finished polls, so
/// consensus sees them in the order the polls were issued even when
/// responses arrive out of order.
pub struct PollSet {
    factory: Box<dyn PollFactory>,
    polls: IndexMap<u32, Holder>,
}

impl PollSet {
    pub fn new(factory: Box<dyn PollFactory>) -> Self {
        Self {
            factory,
            polls: IndexMap::new(),
        }
    }

    /// Registers a poll of `validators`. Returns false for a duplicate
    /// request ID.
    pub fn add(&mut self, request_id: u32, validators: &Bag<NodeId>) -> bool {
        if self.polls.contains_key(&request_id) {
            debug!(request_id, reason = "duplicated request", "dropping poll");
            return false;
        }
        trace!(request_id, validators = %validators, "creating poll");
        self.polls.insert(
            request_id,
            Holder {
                poll: self.factory.new_poll(validators),
                start: Instant::now(),
            },
        );
        true
    }

    /// Records a single-choice vote.
    pub fn vote(&mut self, request_id: u32, voter: &NodeId, vote: Id) -> Vec<Bag<Id>> {
        self.vote_many(request_id, voter, &[vote])
    }

    /// Records a vote naming several containers.
    pub fn vote_many(&mut self, request_id: u32, voter: &NodeId, votes: &[Id]) -> Vec<Bag<Id>> {
        let Some(holder) = self.polls.get_mut(&request_id) else {
            trace!(request_id, validator = %voter, reason = "unknown poll", "dropping vote");
            return Vec::new();
        };
        holder.poll.vote(voter, votes);
        if !holder.poll.finished() {
            return Vec::new();
        }
        self.process_finished_polls()
    }

    /// Records that `voter` failed to respond.
    pub fn drop(&mut self, request_id: u32, voter: &NodeId) -> Vec<Bag<Id>> {
        let Some(holder) = self.polls.get_mut(&request_id) else {
            trace!(request_id, validator = %voter, reason = "unknown poll", "dropping vote");
            return Vec::new();
        };
        holder.poll.drop_voter(voter);
        if !holder.poll.finished() {
            return Vec::new();
        }
        self.process_finished_polls()
    }

    fn process_finished_polls(&mut self) -> Vec<Bag<Id>> {
        let mut results = Vec::new();
        while let Some((_, holder)) = self.polls.first() {
            if !holder.poll.finished() {
                break;
            }
            if let Some((request_id, holder)) = self.polls.shift_remove_index(0) {
                trace!(
                    request_id,
                    duration = ?holder.start.elapsed(),
                    poll = %holder.poll,
                    "poll finished"
                );
                results.push(holder.poll.result());
            }
        }
        results
    }

    pub fn len(&self) -> usize {
        self.polls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polls.is_empty()
    }
}

impl fmt::Display for PollSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "current polls: (Size = {})", self.polls.len())?;
        for (request_id, holder) in self.polls.iter() {
            write!(f, "\n    RequestID {request_id}: {}", holder.poll)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::EarlyTermFactory;

    fn make_id(byte: u8) -> Id {
        Id::from_slice(&[byte; 32]).unwrap()
    }

    fn make_node(byte: u8) -> NodeId {
        NodeId::from_slice(&[byte; 20]).unwrap()
    }

    fn poll_set(alpha: usize) -> PollSet {
        PollSet::new(Box::new(EarlyTermFactory { alpha }))
    }

    #[test]
    fn test_duplicate_request() {
        let mut set = poll_set(1);
        let vdrs = Bag::of([make_node(1)]);
        assert!(set.add(0, &vdrs));
        assert!(!set.add(0, &vdrs));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_vote_unknown_poll() {
        let mut set = poll_set(1);
        assert!(set.vote(5, &make_node(1), make_id(1)).is_empty());
        assert!(set.drop(5, &make_node(1)).is_empty());
    }

    #[test]
    fn test_single_poll() {
        let mut set = poll_set(2);
        let vdrs = Bag::of([make_node(1), make_node(2)]);
        assert!(set.add(0, &vdrs));

        assert!(set.vote(0, &make_node(1), make_id(1)).is_empty());
        let results = set.vote(0, &make_node(2), make_id(1));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].count(&make_id(1)), 2);
        assert!(set.is_empty());
    }

    #[test]
    fn test_younger_poll_waits_for_older() {
        let mut set = poll_set(1);
        let vdrs = Bag::of([make_node(1)]);
        set.add(1, &vdrs);
        set.add(2, &vdrs);

        assert!(set.vote(2, &make_node(1), make_id(2)).is_empty());
        assert_eq!(set.len(), 2);

        let results = set.vote(1, &make_node(1), make_id(1));
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].count(&make_id(1)), 1);
        assert_eq!(results[1].count(&make_id(2)), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_finished_tail_drains_in_request_order() {
        let mut set = poll_set(1);
        let vdrs = Bag::of([make_node(1)]);
        for request_id in 1..=3 {
            set.add(request_id, &vdrs);
        }

        assert!(set.drop(2, &make_node(1)).is_empty());
        assert!(set.vote(3, &make_node(1), make_id(3)).is_empty());
        assert_eq!(set.len(), 3);

        let results = set.vote(1, &make_node(1), make_id(1));
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].count(&make_id(1)), 1);
        assert!(results[1].is_empty());
        assert_eq!(results[2].count(&make_id(3)), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_drop_finishes_poll() {
        let mut set = poll_set(2);
        let vdrs = Bag::of([make_node(1), make_node(2)]);
        set.add(0, &vdrs);

        let results = set.drop(0, &make_node(1));
        assert_eq!(results.len(), 1);
        assert!(results[0].is_empty());
    }

    #[test]
    fn test_display() {
        let mut set = poll_set(1);
        set.add(3, &Bag::of([make_node(1)]));
        assert!(set.to_string().starts_with("current polls: (Size = 1)"));
    }
}
