// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use netdiag::network::SimulatedNetworkCore;
use netdiag::report::DisseminationResult;
use netdiag::strategy::Construction;
use netdiag::{Engine, StrategyCode, create_local_cluster};

const BROADCAST: StrategyCode = 0;
const RANDOM_50: StrategyCode = 4;
const SIMPLE: StrategyCode = 6;
const KMEANS: StrategyCode = 7;
const LEAF_FORWARD: StrategyCode = 9;
const N_LEADERS: StrategyCode = 10;
const N_LEADERS_BYZANTINE: StrategyCode = 11;
const KMEANS_FIXED: StrategyCode = 12;
const OPTIMIZED: StrategyCode = 14;
const RANDOM_CLUSTERING: StrategyCode = 15;
const LATENCY_OPTIMIZATION: StrategyCode = 16;

/// Core with two regions, even and odd nodes, 40 ms apart.
fn two_regions(nodes: usize) -> SimulatedNetworkCore {
    let core = SimulatedNetworkCore::default().with_default_latency(Duration::from_millis(2));
    for a in 0..nodes {
        for b in (a + 1)..nodes {
            if a % 2 != b % 2 {
                core.set_latency(a, b, Duration::from_millis(40));
            }
        }
    }
    core
}

async fn wait_until_ready(engines: &[Arc<Engine>], code: StrategyCode) {
    for _ in 0..200 {
        let ready = engines
            .iter()
            .all(|e| e.is_graph_ready(code).unwrap().not_ready.is_empty());
        if ready {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("graph of strategy {code} never became ready everywhere");
}

/// Cluster over [`two_regions`] with the graph of `code` built everywhere.
async fn prepared_cluster(nodes: usize, code: StrategyCode) -> Vec<Arc<Engine>> {
    let engines = create_local_cluster(nodes, &two_regions(nodes));
    engines[0].trigger_latency_broadcast(code).await.unwrap();
    wait_until_ready(&engines, code).await;
    engines
}

/// Checks one report per peer and that every received unit came one hop
/// further than its relay's own, up to `max_hop`.
fn assert_hop_chain(result: &DisseminationResult, origin: usize, max_hop: u8) {
    let senders: HashSet<_> = result.results.iter().map(|r| r.sender).collect();
    assert_eq!(senders.len(), result.results.len(), "duplicate reports");
    let hops: HashMap<_, _> = result
        .results
        .iter()
        .filter(|r| !r.error_timeout)
        .map(|r| (r.sender, r.hop))
        .collect();
    for r in result.results.iter().filter(|r| !r.error_timeout) {
        if r.sender == origin {
            assert_eq!((r.relay, r.hop), (origin, 0));
            continue;
        }
        assert!(r.hop <= max_hop, "peer {} reached at hop {}", r.sender, r.hop);
        assert_eq!(r.hop == 1, r.relay == origin, "peer {} hop {} via {}", r.sender, r.hop, r.relay);
        let relay_hop = hops.get(&r.relay).copied();
        assert_eq!(relay_hop, r.hop.checked_sub(1), "peer {} relayed by {}", r.sender, r.relay);
    }
}

fn assert_all_full(result: &DisseminationResult) {
    for r in &result.results {
        assert!(!r.error_timeout, "peer {} timed out", r.sender);
        assert!(r.full, "peer {} only reported partial reception", r.sender);
    }
}

#[tokio::test]
async fn broadcast_reaches_all() {
    let engines = create_local_cluster(8, &SimulatedNetworkCore::default());
    let result = engines[3].disseminate(BROADCAST, 10_000, 0).await.unwrap();
    assert_eq!(result.results.len(), 8);
    assert_all_full(&result);
    let summary = result.summary();
    assert_eq!(summary.received, 8);
    assert_eq!(summary.timed_out, 0);
}

#[tokio::test]
async fn chunked_broadcast() {
    let core = SimulatedNetworkCore::default().with_datagram_mode(true);
    let engines = create_local_cluster(5, &core);
    let result = engines[0].disseminate(BROADCAST, 100_000, 0).await.unwrap();
    assert_all_full(&result);
}

#[tokio::test]
async fn restricted_broadcast() {
    let engines = create_local_cluster(6, &SimulatedNetworkCore::default());
    let result = engines[5].disseminate(BROADCAST, 1_000, 3).await.unwrap();
    // the originator is outside the targets and does not report itself
    assert_eq!(result.results.len(), 3);
    assert_all_full(&result);
}

#[tokio::test]
async fn random_hop0_recipients_stop() {
    let core = SimulatedNetworkCore::default().with_default_latency(Duration::from_millis(2));
    let engines = create_local_cluster(12, &core);
    let result = engines[0].disseminate(RANDOM_50, 1_000, 0).await.unwrap();
    assert_eq!(result.results.len(), 12);
    let senders: HashSet<_> = result.results.iter().map(|r| r.sender).collect();
    assert_eq!(senders.len(), 12);

    let received: Vec<_> = result.results.iter().filter(|r| !r.error_timeout).collect();
    let first_hop: HashSet<_> = received
        .iter()
        .filter(|r| r.sender != 0 && r.relay == 0)
        .map(|r| r.sender)
        .collect();
    assert_eq!(first_hop.len(), 6);
    for r in &received {
        assert!(r.full);
        if r.sender == 0 {
            assert_eq!((r.relay, r.hop), (0, 0));
        } else if first_hop.contains(&r.sender) {
            assert_eq!(r.hop, 1);
        } else {
            // only first hop recipients forward
            assert_eq!(r.hop, 0);
            assert!(first_hop.contains(&r.relay), "peer {} relayed by {}", r.sender, r.relay);
        }
    }
}

#[tokio::test]
async fn simple_groups() {
    let engines = create_local_cluster(9, &SimulatedNetworkCore::default());
    let result = engines[0].disseminate(SIMPLE, 5_000, 0).await.unwrap();
    assert_all_full(&result);
}

#[tokio::test]
async fn kmeans_after_latency_exchange() {
    let engines = create_local_cluster(8, &two_regions(8));
    engines[0].trigger_latency_broadcast(KMEANS).await.unwrap();
    wait_until_ready(&engines, KMEANS).await;

    let matrix = engines[5].latency_matrix(netdiag::latency::LatencyType::Relative);
    assert_eq!(matrix.peers(), 8);
    let result = engines[2].disseminate(KMEANS, 20_000, 0).await.unwrap();
    assert_all_full(&result);
}

#[tokio::test]
async fn kmeans_on_fixed_servers() {
    let engines = create_local_cluster(6, &two_regions(6));
    engines[1].trigger_latency_broadcast(KMEANS_FIXED).await.unwrap();
    wait_until_ready(&engines, KMEANS_FIXED).await;
    let result = engines[1].disseminate(KMEANS_FIXED, 2_000, 0).await.unwrap();
    assert_all_full(&result);
}

#[tokio::test]
async fn random_clustering_without_latencies() {
    let engines = create_local_cluster(10, &SimulatedNetworkCore::default());
    for engine in &engines {
        let construction = engine.construct_graph(RANDOM_CLUSTERING, 0).await.unwrap();
        assert_eq!(construction, Construction::Constructed);
    }
    let again = engines[0].construct_graph(RANDOM_CLUSTERING, 0).await.unwrap();
    assert_eq!(again, Construction::AlreadyConstructed);
    wait_until_ready(&engines, RANDOM_CLUSTERING).await;

    let result = engines[4].disseminate(RANDOM_CLUSTERING, 3_000, 0).await.unwrap();
    assert_all_full(&result);
}

#[tokio::test]
async fn latency_optimization_trees() {
    let engines = create_local_cluster(9, &two_regions(9));
    engines[8]
        .trigger_latency_broadcast(LATENCY_OPTIMIZATION)
        .await
        .unwrap();
    wait_until_ready(&engines, LATENCY_OPTIMIZATION).await;
    let result = engines[8]
        .disseminate(LATENCY_OPTIMIZATION, 8_000, 0)
        .await
        .unwrap();
    assert_all_full(&result);
}

#[tokio::test]
async fn leaf_forward_through_own_leaders() {
    let engines = prepared_cluster(12, LEAF_FORWARD).await;
    let result = engines[3].disseminate(LEAF_FORWARD, 5_000, 0).await.unwrap();
    assert_eq!(result.results.len(), 12);
    assert_all_full(&result);
    // root to leaders, leaders to members, leaves across clusters
    assert_hop_chain(&result, 3, 3);
}

#[tokio::test]
async fn n_leaders_two_levels() {
    let engines = prepared_cluster(12, N_LEADERS).await;
    let result = engines[0].disseminate(N_LEADERS, 5_000, 0).await.unwrap();
    assert_eq!(result.results.len(), 12);
    assert_all_full(&result);
    assert_hop_chain(&result, 0, 2);
}

#[tokio::test]
async fn optimized_relays_across_clusters() {
    let engines = prepared_cluster(12, OPTIMIZED).await;
    let result = engines[5].disseminate(OPTIMIZED, 5_000, 0).await.unwrap();
    assert_eq!(result.results.len(), 12);
    assert_all_full(&result);
    // leaves relay to other clusters, which relay within their cluster
    assert_hop_chain(&result, 5, 4);
}

#[tokio::test]
async fn byzantine_leaders_never_drop_root_sends() {
    let engines = prepared_cluster(12, N_LEADERS_BYZANTINE).await;
    for _ in 0..3 {
        let result = engines[0]
            .disseminate(N_LEADERS_BYZANTINE, 2_000, 0)
            .await
            .unwrap();
        assert_eq!(result.results.len(), 12);
        assert_hop_chain(&result, 0, 2);
        let received: Vec<_> = result.results.iter().filter(|r| !r.error_timeout).collect();
        assert!(received.iter().all(|r| r.full));
        // the root sends to every other leader itself
        assert!(received.iter().any(|r| r.hop == 1));
        assert!(received.iter().any(|r| r.sender == 0));
    }
}

#[tokio::test]
async fn graph_not_ready_before_exchange() {
    let engines = create_local_cluster(3, &SimulatedNetworkCore::default());
    assert!(engines[0].disseminate(KMEANS, 100, 0).await.is_err());
    let status = engines[0].is_graph_ready(KMEANS).unwrap();
    assert!(status.ready.is_empty());
    assert_eq!(status.not_ready, vec![0, 1, 2]);
}
