// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use rand::prelude::*;

use super::clusters::kmeans_clusters;
use super::{Clustering, GraphConstructor, RoutingTable};
use crate::PeerId;
use crate::latency::{GraphError, LatencyMatrix};

/// K-means tree where leaves additionally forward outside their cluster.
///
/// A leaf receiving from its own leader sends to `forward` random peers of
/// other clusters. This gives redundancy against dropping leaders.
pub struct LeafForward {
    clusters: usize,
    byzantine_chance: f64,
    forward: usize,
}

impl LeafForward {
    #[must_use]
    pub const fn new(clusters: usize, byzantine_chance: f64, forward: usize) -> Self {
        Self {
            clusters,
            byzantine_chance,
            forward,
        }
    }
}

impl GraphConstructor for LeafForward {
    type Topology = Clustering;

    fn byzantine_chance(&self) -> f64 {
        self.byzantine_chance
    }

    fn construct(
        &self,
        _local_id: PeerId,
        max_peers: usize,
        latencies: &LatencyMatrix,
    ) -> Result<Clustering, GraphError> {
        let clusters = kmeans_clusters(latencies, max_peers, self.clusters)?;
        Ok(Clustering::with_min_leaders(clusters, 1))
    }

    fn route(
        &self,
        topology: &Clustering,
        local_id: PeerId,
        root: PeerId,
        from: PeerId,
    ) -> Vec<PeerId> {
        let targets = topology.forward_targets(root, local_id);
        if !targets.is_empty() || root == local_id || !topology.own_leaders(local_id).contains(&from)
        {
            return targets;
        }
        let own = topology.cluster_of(local_id);
        let outside: Vec<PeerId> = (0..topology.peers())
            .filter(|&id| id != root && id != local_id)
            .filter(|&id| topology.cluster_of(id).is_some() && topology.cluster_of(id) != own)
            .collect();
        outside
            .choose_multiple(&mut rand::rng(), self.forward)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Clustering {
        Clustering::with_min_leaders(vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7]], 1)
    }

    #[test]
    fn leaf_forwards_outside_cluster() {
        let constructor = LeafForward::new(3, 0.0, 2);
        let clustering = sample();
        for _ in 0..20 {
            let targets = constructor.route(&clustering, 4, 0, 3);
            assert_eq!(targets.len(), 2);
            assert!(targets.iter().all(|&t| t == 1 || t == 2 || t == 6 || t == 7));
            assert_ne!(targets[0], targets[1]);
        }
    }

    #[test]
    fn only_from_own_leader() {
        let constructor = LeafForward::new(3, 0.0, 2);
        let clustering = sample();
        // received from a leaf of another cluster
        assert!(constructor.route(&clustering, 4, 0, 7).is_empty());
        // leaders keep their regular routes
        assert_eq!(constructor.route(&clustering, 3, 0, 0), vec![4, 5]);
        assert_eq!(constructor.route(&clustering, 0, 0, 0), vec![1, 2, 3, 6]);
    }

    #[test]
    fn forward_capped_by_candidates() {
        let constructor = LeafForward::new(2, 0.0, 5);
        let clustering = Clustering::with_min_leaders(vec![vec![0, 1], vec![2, 3]], 1);
        let mut targets = constructor.route(&clustering, 3, 0, 2);
        targets.sort_unstable();
        assert_eq!(targets, vec![1]);
    }
}
