//! Deadlock detection via a wait-for graph.
//!
//! A transaction blocked in a write-write dependency records the edge
//! `waiter → holder`. A waiter blocks on exactly one holder at a time, so the
//! graph is a functional graph and cycles are found by walking the chain.
//!
//! Tie-break: the lowest start timestamp wins. The victim of a cycle is its
//! youngest member (highest start timestamp). Every member of a cycle checks
//! periodically while it waits; only the victim gives up. The globally
//! youngest transaction on any cycle always finds itself the victim of the
//! cycle it is on, so resolution always makes progress and the oldest
//! transaction is never starved.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

/// Wait-for graph keyed by transaction start timestamp
pub struct WaitForGraph {
    /// waiter → holder it is blocked on
    edges: Mutex<HashMap<u64, u64>>,
}

impl Default for WaitForGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self {
            edges: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `waiter` is blocked waiting for `holder`
    pub fn add_wait(&self, waiter: u64, holder: u64) {
        self.edges.lock().insert(waiter, holder);
    }

    /// Remove the outgoing edge of `waiter`
    pub fn remove_wait(&self, waiter: u64) {
        self.edges.lock().remove(&waiter);
    }

    /// Cycle that passes through `node`, in wait order starting at `node`
    pub fn cycle_through(&self, node: u64) -> Option<Vec<u64>> {
        let edges = self.edges.lock();
        let mut path = vec![node];
        let mut seen = HashSet::new();
        seen.insert(node);

        let mut current = node;
        while let Some(&holder) = edges.get(&current) {
            if holder == node {
                return Some(path);
            }
            if !seen.insert(holder) {
                // A cycle downstream that does not include `node`
                return None;
            }
            path.push(holder);
            current = holder;
        }
        None
    }

    /// Youngest member of the cycle
    pub fn choose_victim(cycle: &[u64]) -> u64 {
        cycle.iter().copied().max().unwrap_or(0)
    }

    /// Number of edges in the graph (for diagnostics)
    pub fn edge_count(&self) -> usize {
        self.edges.lock().len()
    }
}
