//! Outstanding request tracking.

use std::collections::HashMap;

use savannah_ids::{Id, NodeId};

/// Requests sent to peers that have not been answered yet, keyed by
/// `(node_id, request_id)` and indexed by the container they ask for.
#[derive(Debug, Default)]
pub struct OutstandingRequests {
    by_request: HashMap<(NodeId, u32), Id>,
    by_container: HashMap<Id, (NodeId, u32)>,
}

impl OutstandingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `container_id` was requested from `node_id`.
    pub fn add(&mut self, node_id: NodeId, request_id: u32, container_id: Id) {
        self.by_request.insert((node_id, request_id), container_id);
        self.by_container.insert(container_id, (node_id, request_id));
    }

    /// Removes the request and returns the container it asked for, or `None`
    /// if no such request is outstanding.
    pub fn remove(&mut self, node_id: &NodeId, request_id: u32) -> Option<Id> {
        let container_id = self.by_request.remove(&(*node_id, request_id))?;
        if self.by_container.get(&container_id) == Some(&(*node_id, request_id)) {
            self.by_container.remove(&container_id);
        }
        Some(container_id)
    }

    /// Removes whichever request asks for `container_id`.
    pub fn remove_any(&mut self, container_id: &Id) -> bool {
        match self.by_container.remove(container_id) {
            Some(key) => {
                self.by_request.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, container_id: &Id) -> bool {
        self.by_container.contains_key(container_id)
    }

    pub fn len(&self) -> usize {
        self.by_request.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_request.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_request.clear();
        self.by_container.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests() {
        let node = NodeId::from_slice(&[1; 20]).unwrap();
        let id = Id::from_hash(b"container");
        let mut reqs = OutstandingRequests::new();
        assert!(reqs.remove(&node, 0).is_none());

        reqs.add(node, 0, id);
        assert!(reqs.contains(&id));
        assert_eq!(reqs.len(), 1);
        assert!(reqs.remove(&node, 1).is_none());
        assert_eq!(reqs.remove(&node, 0), Some(id));
        assert!(!reqs.contains(&id));
        assert!(reqs.is_empty());

        reqs.add(node, 5, id);
        assert!(reqs.remove_any(&id));
        assert!(reqs.remove(&node, 5).is_none());
        assert!(!reqs.remove_any(&id));
    }
}
