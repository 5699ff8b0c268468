// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::clusters::kmeans_clusters;
use super::{Clustering, GraphConstructor, RoutingTable};
use crate::PeerId;
use crate::latency::{GraphError, LatencyMatrix};

/// K-means tree where the `n` lowest-indexed members of each cluster lead.
///
/// The root sends to every leader of every cluster, and each leader forwards
/// to its whole cluster. Members therefore receive up to `n` copies.
pub struct NLeaders {
    clusters: usize,
    leaders: usize,
    byzantine_chance: f64,
}

impl NLeaders {
    #[must_use]
    pub const fn new(clusters: usize, leaders: usize, byzantine_chance: f64) -> Self {
        Self {
            clusters,
            leaders,
            byzantine_chance,
        }
    }
}

impl GraphConstructor for NLeaders {
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
        Ok(Clustering::with_min_leaders(clusters, self.leaders))
    }

    fn route(&self, topology: &Clustering, local_id: PeerId, root: PeerId, _: PeerId) -> Vec<PeerId> {
        topology.forward_targets(root, local_id)
    }
}
