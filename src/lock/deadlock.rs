use crate::lock::types::OwnerId;
use std::collections::{HashMap, HashSet};

/// Directed graph of transactions waiting on other transactions.
///
/// An edge `a -> b` means `a` waits for a lock that `b` currently holds.
#[derive(Debug, Default, Clone)]
pub struct WaitForGraph {
    edges: HashMap<OwnerId, HashSet<OwnerId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the outgoing edges of `waiter`
    pub fn set_waits(&mut self, waiter: OwnerId, holders: impl IntoIterator<Item = OwnerId>) {
        let targets: HashSet<OwnerId> = holders.into_iter().collect();
        if targets.is_empty() {
            self.edges.remove(&waiter);
        } else {
            self.edges.insert(waiter, targets);
        }
    }

    pub fn clear_waits(&mut self, waiter: OwnerId) {
        self.edges.remove(&waiter);
    }

    /// Remove a node together with every edge pointing at it
    pub fn remove_node(&mut self, node: OwnerId) {
        self.edges.remove(&node);
        for targets in self.edges.values_mut() {
            targets.remove(&node);
        }
        self.edges.retain(|_, targets| !targets.is_empty());
    }

    pub fn waits_on(&self, waiter: OwnerId) -> Option<&HashSet<OwnerId>> {
        self.edges.get(&waiter)
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Find cycles with an iterative depth-first search.
    ///
    /// Every node is visited once, so the search terminates on any graph. Each
    /// back edge yields the cycle on the current path; cycles sharing nodes may
    /// be reported separately.
    pub fn find_cycles(&self) -> Vec<Vec<OwnerId>> {
        let mut marks: HashMap<OwnerId, Mark> = HashMap::new();
        let mut cycles = Vec::new();

        // Sorted start order keeps the result stable between runs
        let mut roots: Vec<OwnerId> = self.edges.keys().copied().collect();
        roots.sort();

        for root in roots {
            if marks.contains_key(&root) {
                continue;
            }

            let mut path: Vec<OwnerId> = vec![root];
            let mut stack: Vec<Vec<OwnerId>> = vec![self.sorted_targets(root)];
            marks.insert(root, Mark::InProgress);

            while let Some(pending) = stack.last_mut() {
                match pending.pop() {
                    Some(next) => match marks.get(&next) {
                        None => {
                            marks.insert(next, Mark::InProgress);
                            path.push(next);
                            stack.push(self.sorted_targets(next));
                        }
                        Some(Mark::InProgress) => {
                            if let Some(start) = path.iter().position(|n| *n == next) {
                                cycles.push(path[start..].to_vec());
                            }
                        }
                        Some(Mark::Done) => {}
                    },
                    None => {
                        stack.pop();
                        if let Some(done) = path.pop() {
                            marks.insert(done, Mark::Done);
                        }
                    }
                }
            }
        }

        cycles
    }

    fn sorted_targets(&self, node: OwnerId) -> Vec<OwnerId> {
        let mut targets: Vec<OwnerId> = self
            .edges
            .get(&node)
            .map(|t| t.iter().copied().collect())
            .unwrap_or_default();
        // Reverse so that popping visits the smallest id first
        targets.sort_by(|a, b| b.cmp(a));
        targets
    }
}
