// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-root two-level trees minimizing the worst-case delivery time.
//!
//! For every possible root, a binary search finds the smallest time bound
//! under which a greedy construction still reaches all peers within two
//! hops, with every node forwarding to a bounded number of children.
//! Roots are independent and built in parallel.

use log::warn;
use rayon::prelude::*;

use super::{GraphConstructor, RoutingTable};
use crate::PeerId;
use crate::latency::{GraphError, LatencyMatrix};
use crate::strategy::StrategyError;

/// Upper end of the binary search over time bounds, in microseconds.
const MAX_TIME_US: u64 = 1_000_000;

/// Forwarding lists for every root: `trees[root][peer]` are the children of `peer`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RootedTrees {
    trees: Vec<Vec<Vec<PeerId>>>,
}

impl RootedTrees {
    #[must_use]
    pub fn peers(&self) -> usize {
        self.trees.len()
    }
}

impl RoutingTable for RootedTrees {
    fn forward_targets(&self, root: PeerId, peer: PeerId) -> Vec<PeerId> {
        self.trees
            .get(root)
            .and_then(|tree| tree.get(peer))
            .cloned()
            .unwrap_or_default()
    }
}

/// Latency matrix optimization with out-degree bounded by
/// `max(ceil(percent * n / 100), ceil(sqrt(n)))`.
pub struct LatencyOptimization {
    percent: usize,
}

impl LatencyOptimization {
    #[must_use]
    pub const fn new(percent: usize) -> Self {
        Self { percent }
    }

    fn max_connections(&self, peers: usize) -> usize {
        let sqrt = peers.isqrt();
        let sqrt = if sqrt * sqrt < peers { sqrt + 1 } else { sqrt };
        (self.percent * peers).div_ceil(100).max(sqrt)
    }
}

/// Greedy tree construction for one root under one time bound.
struct TreeBuilder<'a> {
    /// Symmetric round trip times in microseconds.
    latency: &'a [Vec<u64>],
    max_connections: usize,
    root: PeerId,
    max_time: u64,
    degree_in_remain: Vec<isize>,
    degree_out: Vec<usize>,
    max_degree_out: Vec<isize>,
    connected: Vec<bool>,
    root_child: Vec<bool>,
    children: Vec<Vec<PeerId>>,
}

impl<'a> TreeBuilder<'a> {
    fn new(latency: &'a [Vec<u64>], max_connections: usize, root: PeerId, max_time: u64) -> Self {
        let n = latency.len();
        let mut builder = Self {
            latency,
            max_connections,
            root,
            max_time,
            degree_in_remain: vec![0; n],
            degree_out: vec![0; n],
            max_degree_out: vec![0; n],
            connected: vec![false; n],
            root_child: vec![false; n],
            children: vec![Vec::new(); n],
        };
        builder.connected[root] = true;
        builder.root_child[root] = true;
        for u in 0..n {
            for v in (0..n).filter(|&v| v != root && v != u) {
                if builder.reachable(u, v) {
                    builder.degree_in_remain[v] += 1;
                    builder.max_degree_out[u] += 1;
                }
            }
        }
        builder
    }

    /// Whether `v` can be reached from the root via `u` within the time bound.
    fn reachable(&self, u: PeerId, v: PeerId) -> bool {
        self.latency[self.root][u] + self.latency[u][v] <= self.max_time
    }

    /// Unconnected node with the fewest remaining potential parents.
    fn next_node(&self) -> Option<PeerId> {
        (0..self.connected.len())
            .filter(|&u| !self.connected[u])
            .min_by_key(|&u| self.degree_in_remain[u])
    }

    fn pick_parent(&self, node: PeerId) -> Option<PeerId> {
        let root_has_room = self.degree_out[self.root] < self.max_connections;
        (0..self.connected.len())
            .filter(|&u| u != node && self.degree_out[u] < self.max_connections)
            .filter(|&u| self.reachable(u, node))
            .filter(|&u| self.root_child[u] || (root_has_room && !self.connected[u]))
            .min_by_key(|&u| self.max_degree_out[u])
    }

    fn connect(&mut self, node: PeerId, parent: PeerId) {
        self.degree_out[parent] += 1;
        for u in 0..self.connected.len() {
            if u != parent && u != node && self.reachable(u, node) {
                self.max_degree_out[u] -= 1;
            }
        }
        self.connected[node] = true;
        if parent == self.root {
            self.root_child[node] = true;
        } else {
            for u in 0..self.connected.len() {
                if !self.connected[u] && self.reachable(node, u) {
                    self.degree_in_remain[u] -= 1;
                }
            }
        }
        self.children[parent].push(node);
    }

    /// Connects every peer, or returns `None` if some peer cannot be placed.
    fn build(mut self) -> Option<Vec<Vec<PeerId>>> {
        while let Some(node) = self.next_node() {
            if self.degree_in_remain[node] == 0 {
                return None;
            }
            let parent = self.pick_parent(node)?;
            if !self.connected[parent] {
                self.connect(parent, self.root);
            }
            self.connect(node, parent);
        }
        Some(self.children)
    }
}

/// Builds the tree for `root` under the smallest feasible time bound.
fn tree_for_root(latency: &[Vec<u64>], max_connections: usize, root: PeerId) -> Option<Vec<Vec<PeerId>>> {
    let (mut low, mut high) = (0, MAX_TIME_US);
    while low < high {
        let mid = (low + high) / 2;
        if TreeBuilder::new(latency, max_connections, root, mid).build().is_some() {
            high = mid;
        } else {
            low = mid + 1;
        }
    }
    TreeBuilder::new(latency, max_connections, root, low).build()
}

impl GraphConstructor for LatencyOptimization {
    type Topology = RootedTrees;

    fn requires_exact_peers(&self) -> bool {
        true
    }

    fn construct(
        &self,
        _local_id: PeerId,
        max_peers: usize,
        latencies: &LatencyMatrix,
    ) -> Result<RootedTrees, GraphError> {
        if max_peers == 0 {
            return Err(GraphError::TooFewPeers(0));
        }
        let rows = latencies.rows();
        if rows.len() < max_peers || rows[..max_peers].iter().any(|row| row.len() < max_peers) {
            return Err(GraphError::InconsistentDimensions);
        }
        let latency: Vec<Vec<u64>> = (0..max_peers)
            .map(|i| {
                (0..max_peers)
                    .map(|j| ((rows[i][j] + rows[j][i]) / 2).as_micros() as u64)
                    .collect()
            })
            .collect();
        let max_connections = self.max_connections(max_peers);

        let trees = (0..max_peers)
            .into_par_iter()
            .map(|root| {
                tree_for_root(&latency, max_connections, root).unwrap_or_else(|| {
                    warn!("no tree for root {root} within {MAX_TIME_US}us");
                    vec![Vec::new(); max_peers]
                })
            })
            .collect();
        Ok(RootedTrees { trees })
    }

    fn route(&self, topology: &RootedTrees, local_id: PeerId, root: PeerId, _: PeerId) -> Vec<PeerId> {
        topology.forward_targets(root, local_id)
    }

    /// Children of the root forward with hop 0, grandchildren stop.
    fn forward_hop(&self, hop: u8) -> Result<Option<u8>, StrategyError> {
        match hop {
            0 => Ok(None),
            1 => Ok(Some(0)),
            hop => Err(StrategyError::InvalidHop(hop)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::clustered_latencies;

    /// Checks that `tree` is a two-level tree rooted at `root` covering all peers.
    fn assert_two_level(tree: &[Vec<PeerId>], root: PeerId, max_connections: usize) {
        let n = tree.len();
        let mut parent = vec![None; n];
        for (p, children) in tree.iter().enumerate() {
            assert!(children.len() <= max_connections);
            for &c in children {
                assert!(parent[c].is_none(), "peer {c} has two parents");
                parent[c] = Some(p);
            }
        }
        for peer in (0..n).filter(|&p| p != root) {
            let p = parent[peer].expect("every peer is covered");
            assert!(p == root || parent[p] == Some(root));
        }
        assert!(parent[root].is_none());
    }

    #[test]
    fn degree_bound() {
        let opt = LatencyOptimization::new(10);
        assert_eq!(opt.max_connections(9), 3);
        assert_eq!(opt.max_connections(10), 4);
        assert_eq!(opt.max_connections(100), 10);
        assert_eq!(opt.max_connections(400), 40);
        assert_eq!(LatencyOptimization::new(20).max_connections(50), 10);
    }

    #[test]
    fn covers_all_peers_for_every_root() {
        let matrix = LatencyMatrix::from_rows(clustered_latencies(&[4, 5, 3]));
        let opt = LatencyOptimization::new(10);
        let trees = opt.construct(0, 12, &matrix).unwrap();
        assert_eq!(trees.peers(), 12);
        for root in 0..12 {
            let tree: Vec<_> = (0..12).map(|p| trees.forward_targets(root, p)).collect();
            assert_two_level(&tree, root, opt.max_connections(12));
        }
    }

    #[test]
    fn prefers_fast_paths() {
        // peer 3 is slow to reach from everyone but peer 1
        let ms = Duration::from_millis;
        let mut rows = vec![vec![ms(10); 4]; 4];
        for (i, row) in rows.iter_mut().enumerate() {
            row[i] = Duration::ZERO;
        }
        for other in [0, 2] {
            rows[other][3] = ms(300);
            rows[3][other] = ms(300);
        }
        let trees = LatencyOptimization::new(10)
            .construct(0, 4, &LatencyMatrix::from_rows(rows))
            .unwrap();
        assert_eq!(trees.forward_targets(0, 1), vec![3]);
        assert!(!trees.forward_targets(0, 0).contains(&3));
    }

    #[test]
    fn hop_rules() {
        let opt = LatencyOptimization::new(10);
        assert_eq!(opt.forward_hop(1).unwrap(), Some(0));
        assert_eq!(opt.forward_hop(0).unwrap(), None);
        assert!(matches!(opt.forward_hop(2), Err(StrategyError::InvalidHop(2))));
        assert!(opt.requires_exact_peers());
    }

    #[test]
    fn rejects_short_rows() {
        let matrix = LatencyMatrix::from_rows(clustered_latencies(&[3]));
        let res = LatencyOptimization::new(10).construct(0, 4, &matrix);
        assert!(matches!(res, Err(GraphError::InconsistentDimensions)));
    }
}
