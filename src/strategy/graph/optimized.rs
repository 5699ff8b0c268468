// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use rand::prelude::*;

use super::clusters::kmeans_clusters;
use super::{Clustering, GraphConstructor, RoutingTable};
use crate::PeerId;
use crate::latency::{GraphError, LatencyMatrix};

/// K-means tree with a cross-cluster relay per leaf.
///
/// A leaf receiving from its own leader relays to one random non-leader of
/// another cluster. A leaf receiving from outside its cluster relays to the
/// other leaves of its own cluster. Clusters whose leader drops the payload
/// can then still be covered.
pub struct Optimized {
    clusters: usize,
    byzantine_chance: f64,
}

impl Optimized {
    #[must_use]
    pub const fn new(clusters: usize, byzantine_chance: f64) -> Self {
        Self {
            clusters,
            byzantine_chance,
        }
    }
}

impl GraphConstructor for Optimized {
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
        if !targets.is_empty() || root == local_id {
            return targets;
        }
        let Some(own) = topology.cluster_of(local_id) else {
            return targets;
        };
        let relays = |cluster: usize| -> Vec<PeerId> {
            topology.clusters()[cluster]
                .iter()
                .copied()
                .filter(|&id| id != root && !topology.is_leader(id))
                .collect()
        };

        if topology.own_leaders(local_id).contains(&from) {
            let mut rng = rand::rng();
            let candidates: Vec<Vec<PeerId>> = (0..topology.clusters().len())
                .filter(|&c| c != own)
                .map(&relays)
                .filter(|members| !members.is_empty())
                .collect();
            candidates
                .choose(&mut rng)
                .and_then(|members| members.choose(&mut rng))
                .map_or_else(Vec::new, |&id| vec![id])
        } else if topology.cluster_of(from) != Some(own) {
            relays(own).into_iter().filter(|&id| id != local_id).collect()
        } else {
            targets
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Clustering {
        Clustering::with_min_leaders(vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7]], 1)
    }

    #[test]
    fn leaf_relays_to_other_cluster() {
        let constructor = Optimized::new(3, 0.0);
        let clustering = sample();
        for _ in 0..20 {
            // root 1 is never a relay target
            let targets = constructor.route(&clustering, 4, 1, 3);
            assert_eq!(targets.len(), 1);
            assert!(targets[0] == 2 || targets[0] == 7);
        }
    }

    #[test]
    fn relay_covers_own_cluster() {
        let constructor = Optimized::new(3, 0.0);
        let clustering = sample();
        assert_eq!(constructor.route(&clustering, 4, 0, 7), vec![5]);
        // received from a cluster mate, not the leader
        assert!(constructor.route(&clustering, 4, 0, 5).is_empty());
    }

    #[test]
    fn leaders_and_root_unchanged() {
        let constructor = Optimized::new(3, 0.0);
        let clustering = sample();
        assert_eq!(constructor.route(&clustering, 3, 0, 0), vec![4, 5]);
        assert_eq!(constructor.route(&clustering, 1, 1, 1), vec![0, 3, 6]);
    }

    #[test]
    fn no_relay_candidates() {
        let constructor = Optimized::new(2, 0.0);
        let clustering = Clustering::with_min_leaders(vec![vec![0, 1], vec![2]], 1);
        assert!(constructor.route(&clustering, 1, 2, 0).is_empty());
    }
}
