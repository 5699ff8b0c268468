// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::clusters::kmeans_clusters;
use super::{Clustering, GraphConstructor, RoutingTable};
use crate::PeerId;
use crate::latency::{GraphError, LatencyMatrix, LatencyType};

/// Two-level tree over k-means clusters of the latency vectors.
///
/// The lowest-indexed member of each cluster leads it.
pub struct KmeansClustering {
    clusters: usize,
    latency_type: LatencyType,
}

impl KmeansClustering {
    /// Clusters by peer-to-peer round trip times.
    #[must_use]
    pub const fn relative(clusters: usize) -> Self {
        Self {
            clusters,
            latency_type: LatencyType::Relative,
        }
    }

    /// Clusters by round trip times to the fixed reference servers.
    #[must_use]
    pub const fn fixed(clusters: usize) -> Self {
        Self {
            clusters,
            latency_type: LatencyType::Fixed,
        }
    }
}

impl GraphConstructor for KmeansClustering {
    type Topology = Clustering;

    fn latency_type(&self) -> LatencyType {
        self.latency_type
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

    fn route(&self, topology: &Clustering, local_id: PeerId, root: PeerId, _: PeerId) -> Vec<PeerId> {
        topology.forward_targets(root, local_id)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::clustered_latencies;

    #[test]
    fn finds_latency_clusters() {
        let matrix = LatencyMatrix::from_rows(clustered_latencies(&[3, 4, 2]));
        let constructor = KmeansClustering::relative(3);
        let clustering = constructor.construct(0, 9, &matrix).unwrap();
        assert_eq!(
            clustering.clusters(),
            &[vec![0, 1, 2], vec![3, 4, 5, 6], vec![7, 8]]
        );
        assert!(clustering.is_leader(3));

        // root 5 reaches every leader, leader 3 covers the rest of its cluster
        assert_eq!(constructor.route(&clustering, 5, 5, 5), vec![0, 3, 7]);
        assert_eq!(constructor.route(&clustering, 3, 5, 5), vec![4, 6]);
        assert!(constructor.route(&clustering, 4, 5, 3).is_empty());
    }

    #[test]
    fn restricted_to_max_peers() {
        let matrix = LatencyMatrix::from_rows(clustered_latencies(&[3, 3]));
        let clustering = KmeansClustering::relative(2)
            .construct(0, 4, &matrix)
            .unwrap();
        assert_eq!(clustering.peers(), 4);
        assert_eq!(clustering.clusters(), &[vec![0, 1, 2], vec![3]]);
    }

    #[test]
    fn fixed_uses_server_latencies() {
        let ms = Duration::from_millis;
        let rows = vec![
            vec![ms(10), ms(200)],
            vec![ms(200), ms(10)],
            vec![ms(12), ms(190)],
            vec![ms(195), ms(15)],
        ];
        let constructor = KmeansClustering::fixed(2);
        assert_eq!(constructor.latency_type(), LatencyType::Fixed);
        let clustering = constructor
            .construct(0, 4, &LatencyMatrix::from_rows(rows))
            .unwrap();
        assert_eq!(clustering.clusters(), &[vec![0, 2], vec![1, 3]]);
    }
}
