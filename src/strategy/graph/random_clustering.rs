// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use rand::prelude::*;
use rand::rngs::StdRng;

use super::{Clustering, GraphConstructor, RoutingTable};
use crate::PeerId;
use crate::latency::{GraphError, LatencyMatrix};

const SEED: u64 = 12345;

/// Two-level tree over randomly chosen clusters.
///
/// Serves as a latency-oblivious baseline for the k-means strategies. The RNG
/// is seeded with a constant, so all nodes agree on the clusters without
/// exchanging latencies.
pub struct RandomClustering {
    clusters: usize,
}

impl RandomClustering {
    #[must_use]
    pub const fn new(clusters: usize) -> Self {
        Self { clusters }
    }
}

impl GraphConstructor for RandomClustering {
    type Topology = Clustering;

    fn requires_latency_matrix(&self) -> bool {
        false
    }

    fn construct(
        &self,
        _local_id: PeerId,
        max_peers: usize,
        _latencies: &LatencyMatrix,
    ) -> Result<Clustering, GraphError> {
        if max_peers == 0 || self.clusters == 0 {
            return Err(GraphError::TooFewPeers(max_peers));
        }
        let k = self.clusters.min(max_peers);
        let mut rng = StdRng::seed_from_u64(SEED);

        let mut leaders = Vec::with_capacity(k);
        while leaders.len() < k {
            let id = rng.random_range(0..max_peers);
            if !leaders.contains(&id) {
                leaders.push(id);
            }
        }
        let mut clusters: Vec<Vec<PeerId>> = leaders.iter().map(|&l| vec![l]).collect();
        for id in (0..max_peers).filter(|id| !leaders.contains(id)) {
            clusters[rng.random_range(0..k)].push(id);
        }
        let leaders = leaders.into_iter().map(|l| vec![l]).collect();
        Ok(Clustering::new(clusters, leaders))
    }

    fn route(&self, topology: &Clustering, local_id: PeerId, root: PeerId, _: PeerId) -> Vec<PeerId> {
        topology.forward_targets(root, local_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_clusters_everywhere() {
        let constructor = RandomClustering::new(6);
        let empty = LatencyMatrix::new(0);
        let a = constructor.construct(0, 50, &empty).unwrap();
        let b = constructor.construct(17, 50, &empty).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.clusters().len(), 6);
        let mut all: Vec<_> = a.clusters().iter().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..50).collect::<Vec<_>>());
        for (c, members) in a.clusters().iter().enumerate() {
            assert_eq!(a.leaders_of(c).len(), 1);
            assert!(members.contains(&a.leaders_of(c)[0]));
        }
    }

    #[test]
    fn more_clusters_than_peers() {
        let clustering = RandomClustering::new(6)
            .construct(0, 3, &LatencyMatrix::new(0))
            .unwrap();
        assert_eq!(clustering.clusters().len(), 3);
        assert!((0..3).all(|id| clustering.is_leader(id)));
        assert_eq!(clustering.forward_targets(1, 1), vec![0, 2]);
    }

    #[test]
    fn no_peers() {
        let res = RandomClustering::new(6).construct(0, 0, &LatencyMatrix::new(0));
        assert!(matches!(res, Err(GraphError::TooFewPeers(0))));
    }
}
