//! Bootstrap status of the chains sharing a subnet.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use savannah_ids::Id;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Default)]
struct Chains {
    all: BTreeSet<Id>,
    bootstrapped: BTreeSet<Id>,
}

/// Tracks which of a subnet's chains finished bootstrapping.
///
/// A chain that finishes early keeps re-checking its frontier until every
/// chain of the subnet is done, so all of them enter consensus together.
#[derive(Debug)]
pub struct Subnet {
    id: Id,
    chains: Mutex<Chains>,
    done: watch::Sender<bool>,
}

impl Subnet {
    pub fn new(id: Id) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            id,
            chains: Mutex::new(Chains::default()),
            done,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// Returns false if the chain was already tracked.
    pub fn add_chain(&self, chain_id: Id) -> bool {
        let mut chains = self.chains.lock();
        let added = chains.all.insert(chain_id);
        self.update(&chains);
        added
    }

    pub fn remove_chain(&self, chain_id: &Id) {
        let mut chains = self.chains.lock();
        chains.all.remove(chain_id);
        chains.bootstrapped.remove(chain_id);
        self.update(&chains);
    }

    /// Marks `chain_id` as done bootstrapping.
    pub fn bootstrapped(&self, chain_id: Id) {
        let mut chains = self.chains.lock();
        if !chains.all.contains(&chain_id) || !chains.bootstrapped.insert(chain_id) {
            return;
        }
        self.update(&chains);
    }

    /// True once every tracked chain has bootstrapped.
    pub fn is_bootstrapped(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolves once the whole subnet has bootstrapped.
    pub fn on_bootstrap_completed(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    fn update(&self, chains: &Chains) {
        let done = chains.bootstrapped.len() == chains.all.len();
        self.done.send_if_modified(|current| {
            if *current == done {
                return false;
            }
            if done {
                info!(subnet_id = %self.id, num_chains = chains.all.len(), "subnet bootstrapped");
            }
            *current = done;
            true
        });
    }
}
