//! Network polls and the FIFO set that resolves them.

mod set;

pub use set::PollSet;

use std::collections::HashMap;
use std::fmt;

use savannah_ids::{Id, NodeId};
use savannah_utils::Bag;

/// A single sampling round.
pub trait Poll: fmt::Display + Send {
    /// Records `voter`'s response. Later responses from the same voter are
    /// ignored.
    fn vote(&mut self, voter: &NodeId, votes: &[Id]);

    /// Records that `voter` will not respond.
    fn drop_voter(&mut self, voter: &NodeId);

    /// Whether the outcome can no longer change.
    fn finished(&self) -> bool;

    /// Vote tally, weighted by how many times each voter was sampled.
    fn result(&self) -> Bag<Id>;
}

/// Builds polls for a sampled validator bag.
pub trait PollFactory: Send {
    fn new_poll(&self, polled: &Bag<NodeId>) -> Box<dyn Poll>;
}

/// Counts of outstanding voters, taken from the sampled bag.
#[derive(Debug, Default)]
struct Polled {
    remaining: HashMap<NodeId, usize>,
    remaining_weight: usize,
}

impl Polled {
    fn new(bag: &Bag<NodeId>) -> Self {
        Self {
            remaining: bag.iter().map(|(node, count)| (*node, count)).collect(),
            remaining_weight: bag.len(),
        }
    }

    /// Removes `voter`, returning how many samples it held.
    fn take(&mut self, voter: &NodeId) -> usize {
        let count = self.remaining.remove(voter).unwrap_or(0);
        self.remaining_weight -= count;
        count
    }
}

/// Snowman poll that terminates once an alpha majority is reached or can no
/// longer be reached.
pub struct EarlyTermPoll {
    alpha: usize,
    polled: Polled,
    votes: Bag<Id>,
}

impl Poll for EarlyTermPoll {
    fn vote(&mut self, voter: &NodeId, votes: &[Id]) {
        let count = self.polled.take(voter);
        if let Some(vote) = votes.first() {
            self.votes.add_count(*vote, count);
        }
    }

    fn drop_voter(&mut self, voter: &NodeId) {
        self.polled.take(voter);
    }

    fn finished(&self) -> bool {
        let remaining = self.polled.remaining_weight;
        let received = self.votes.len();
        let freq = self.votes.mode().map_or(0, |(_, freq)| freq);
        remaining == 0 || freq >= self.alpha || received + remaining < self.alpha
    }

    fn result(&self) -> Bag<Id> {
        self.votes.clone()
    }
}

impl fmt::Display for EarlyTermPoll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "waiting on {} samples, received {}",
            self.polled.remaining_weight, self.votes
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EarlyTermFactory {
    pub alpha: usize,
}

impl PollFactory for EarlyTermFactory {
    fn new_poll(&self, polled: &Bag<NodeId>) -> Box<dyn Poll> {
        Box::new(EarlyTermPoll {
            alpha: self.alpha,
            polled: Polled::new(polled),
            votes: Bag::new(),
        })
    }
}

/// Avalanche poll where each voter names a set of vertices.
///
/// Several vertices can clear alpha in the same poll, so it only ends early
/// when alpha has become unreachable.
pub struct DagPoll {
    alpha: usize,
    polled: Polled,
    responded: usize,
    votes: Bag<Id>,
}

impl Poll for DagPoll {
    fn vote(&mut self, voter: &NodeId, votes: &[Id]) {
        let count = self.polled.take(voter);
        if count == 0 {
            return;
        }
        self.responded += count;
        let mut seen = std::collections::HashSet::new();
        for vote in votes {
            if seen.insert(*vote) {
                self.votes.add_count(*vote, count);
            }
        }
    }

    fn drop_voter(&mut self, voter: &NodeId) {
        self.polled.take(voter);
    }

    fn finished(&self) -> bool {
        let remaining = self.polled.remaining_weight;
        remaining == 0 || self.responded + remaining < self.alpha
    }

    fn result(&self) -> Bag<Id> {
        self.votes.clone()
    }
}

impl fmt::Display for DagPoll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "waiting on {} samples, {} responded, received {}",
            self.polled.remaining_weight, self.responded, self.votes
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DagFactory {
    pub alpha: usize,
}

impl PollFactory for DagFactory {
    fn new_poll(&self, polled: &Bag<NodeId>) -> Box<dyn Poll> {
        Box::new(DagPoll {
            alpha: self.alpha,
            polled: Polled::new(polled),
            responded: 0,
            votes: Bag::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_id(byte: u8) -> Id {
        Id::from_slice(&[byte; 32]).unwrap()
    }

    fn make_node(byte: u8) -> NodeId {
        NodeId::from_slice(&[byte; 20]).unwrap()
    }

    #[test]
    fn test_early_term_alpha_reached() {
        let polled = Bag::of([make_node(1), make_node(2), make_node(3)]);
        let mut poll = EarlyTermFactory { alpha: 2 }.new_poll(&polled);

        poll.vote(&make_node(1), &[make_id(1)]);
        assert!(!poll.finished());
        poll.vote(&make_node(2), &[make_id(1)]);
        assert!(poll.finished());
        assert_eq!(poll.result().count(&make_id(1)), 2);
    }

    #[test]
    fn test_early_term_unreachable() {
        let polled = Bag::of([make_node(1), make_node(2), make_node(3)]);
        let mut poll = EarlyTermFactory { alpha: 3 }.new_poll(&polled);

        poll.drop_voter(&make_node(1));
        assert!(poll.finished());
    }

    #[test]
    fn test_double_vote_ignored() {
        let polled = Bag::of([make_node(1), make_node(2)]);
        let mut poll = EarlyTermFactory { alpha: 2 }.new_poll(&polled);

        poll.vote(&make_node(1), &[make_id(1)]);
        poll.vote(&make_node(1), &[make_id(1)]);
        assert!(!poll.finished());
        assert_eq!(poll.result().count(&make_id(1)), 1);
    }

    #[test]
    fn test_sampled_twice_votes_twice() {
        let mut polled = Bag::new();
        polled.add_count(make_node(1), 2);
        polled.add(make_node(2));
        let mut poll = EarlyTermFactory { alpha: 2 }.new_poll(&polled);

        poll.vote(&make_node(1), &[make_id(1)]);
        assert!(poll.finished());
        assert_eq!(poll.result().count(&make_id(1)), 2);
    }

    #[test]
    fn test_unsampled_voter_ignored() {
        let polled = Bag::of([make_node(1)]);
        let mut poll = EarlyTermFactory { alpha: 1 }.new_poll(&polled);

        poll.vote(&make_node(9), &[make_id(1)]);
        assert!(!poll.finished());
        assert!(poll.result().is_empty());
    }

    #[test]
    fn test_dag_poll_waits_for_all() {
        let polled = Bag::of([make_node(1), make_node(2), make_node(3)]);
        let mut poll = DagFactory { alpha: 2 }.new_poll(&polled);

        poll.vote(&make_node(1), &[make_id(1), make_id(2)]);
        poll.vote(&make_node(2), &[make_id(1), make_id(1)]);
        assert!(!poll.finished());
        poll.drop_voter(&make_node(3));
        assert!(poll.finished());

        let result = poll.result();
        assert_eq!(result.count(&make_id(1)), 2);
        assert_eq!(result.count(&make_id(2)), 1);
    }

    #[test]
    fn test_dag_poll_unreachable() {
        let polled = Bag::of([make_node(1), make_node(2)]);
        let mut poll = DagFactory { alpha: 2 }.new_poll(&polled);
        poll.drop_voter(&make_node(1));
        assert!(poll.finished());
    }
}
