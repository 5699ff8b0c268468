// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Cluster topologies shared by the k-means family and random clustering.

use super::RoutingTable;
use super::kmeans;
use crate::PeerId;
use crate::latency::{GraphError, LatencyMatrix};

/// Peers partitioned into clusters, each with one or more leaders.
///
/// The root sends to every leader. Each leader forwards to the rest of its
/// cluster, excluding the root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Clustering {
    clusters: Vec<Vec<PeerId>>,
    leaders: Vec<Vec<PeerId>>,
    cluster_of: Vec<Option<usize>>,
}

impl Clustering {
    /// Creates a clustering with explicit leaders per cluster.
    ///
    /// # Panics
    ///
    /// Panics if `leaders` does not have one entry per cluster.
    #[must_use]
    pub fn new(clusters: Vec<Vec<PeerId>>, leaders: Vec<Vec<PeerId>>) -> Self {
        assert_eq!(clusters.len(), leaders.len());
        let peers = clusters.iter().flatten().max().map_or(0, |&max| max + 1);
        let mut cluster_of = vec![None; peers];
        for (c, members) in clusters.iter().enumerate() {
            for &member in members {
                cluster_of[member] = Some(c);
            }
        }
        Self {
            clusters,
            leaders,
            cluster_of,
        }
    }

    /// Creates a clustering where the `n` lowest-indexed members of each cluster lead.
    #[must_use]
    pub fn with_min_leaders(mut clusters: Vec<Vec<PeerId>>, n: usize) -> Self {
        let leaders = clusters
            .iter_mut()
            .map(|members| {
                members.sort_unstable();
                members.iter().copied().take(n.max(1)).collect()
            })
            .collect();
        Self::new(clusters, leaders)
    }

    #[must_use]
    pub fn clusters(&self) -> &[Vec<PeerId>] {
        &self.clusters
    }

    /// Number of peers covered by the clusters.
    #[must_use]
    pub fn peers(&self) -> usize {
        self.cluster_of.len()
    }

    #[must_use]
    pub fn leaders_of(&self, cluster: usize) -> &[PeerId] {
        &self.leaders[cluster]
    }

    #[must_use]
    pub fn cluster_of(&self, peer: PeerId) -> Option<usize> {
        self.cluster_of.get(peer).copied().flatten()
    }

    /// Leaders of the cluster containing `peer`.
    #[must_use]
    pub fn own_leaders(&self, peer: PeerId) -> &[PeerId] {
        match self.cluster_of(peer) {
            Some(cluster) => self.leaders_of(cluster),
            None => &[],
        }
    }

    #[must_use]
    pub fn is_leader(&self, peer: PeerId) -> bool {
        self.own_leaders(peer).contains(&peer)
    }
}

impl RoutingTable for Clustering {
    fn forward_targets(&self, root: PeerId, peer: PeerId) -> Vec<PeerId> {
        let mut targets = Vec::new();
        if root == peer {
            targets.extend(self.leaders.iter().flatten().filter(|&&l| l != peer));
        }
        if let Some(cluster) = self.cluster_of(peer).filter(|_| self.is_leader(peer)) {
            let members = self.clusters[cluster].iter();
            targets.extend(members.filter(|&&m| m != peer && m != root));
        }
        targets.sort_unstable();
        targets.dedup();
        targets
    }
}

/// Runs k-means over the latency rows of peers `0..max_peers`.
///
/// Coordinates are latencies in milliseconds.
pub(super) fn kmeans_clusters(
    latencies: &LatencyMatrix,
    max_peers: usize,
    k: usize,
) -> Result<Vec<Vec<PeerId>>, GraphError> {
    let points: Vec<Vec<f64>> = latencies
        .rows()
        .iter()
        .take(max_peers)
        .map(|row| row.iter().map(|l| l.as_secs_f64() * 1e3).collect())
        .collect();
    kmeans::cluster(&points, k)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Clustering {
        Clustering::with_min_leaders(vec![vec![2, 0, 1], vec![5, 3, 4], vec![6]], 1)
    }

    #[test]
    fn leaders_are_minimum() {
        let clustering = sample();
        assert_eq!(clustering.leaders_of(0), &[0]);
        assert_eq!(clustering.leaders_of(1), &[3]);
        assert_eq!(clustering.leaders_of(2), &[6]);
        assert_eq!(clustering.own_leaders(4), &[3]);
        assert!(clustering.is_leader(6));
        assert!(!clustering.is_leader(5));
        assert_eq!(clustering.peers(), 7);
        assert_eq!(clustering.cluster_of(7), None);
    }

    #[test]
    fn routes() {
        let clustering = sample();
        // non-leader root sends to all leaders, its own included
        assert_eq!(clustering.forward_targets(4, 4), vec![0, 3, 6]);
        // leaders forward to their cluster, except the root
        assert_eq!(clustering.forward_targets(4, 3), vec![5]);
        assert_eq!(clustering.forward_targets(1, 0), vec![2]);
        // leader root sends to other leaders and its own cluster
        assert_eq!(clustering.forward_targets(0, 0), vec![1, 2, 3, 6]);
        // leaves never forward
        assert!(clustering.forward_targets(0, 1).is_empty());
    }

    #[test]
    fn co_leaders() {
        let clustering = Clustering::with_min_leaders(vec![vec![0, 1, 2, 3], vec![4, 5, 6]], 2);
        assert_eq!(clustering.forward_targets(6, 6), vec![0, 1, 4, 5]);
        assert_eq!(clustering.forward_targets(6, 1), vec![0, 2, 3]);
    }
}
