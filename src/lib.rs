// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! netdiag: Peer-to-Peer Dissemination Benchmarking
//!
//! A pluggable engine for measuring and comparing strategies that propagate a
//! data blob across a fixed set of peers, including latency-aware broadcast
//! topologies built from a shared latency matrix.

#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod engine;
pub mod latency;
pub mod logging;
pub mod network;
pub mod peer;
pub mod protocol;
pub mod report;
pub mod state;
pub mod strategy;
#[cfg(test)]
pub mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use static_assertions::const_assert_eq;

pub use self::engine::{Engine, EngineConfig};
use self::latency::StaticLatencySampler;
use self::network::localhost_ip_sockaddr;
use self::network::simulated::SimulatedNetworkCore;
pub use self::strategy::{Strategy, StrategyRegistry};

// NOTE: Peer indices travel as `u64` on the wire and are used as `usize` indices.
// So, for now, we only support 64-bit architectures.
const_assert_eq!(std::mem::size_of::<usize>(), 8);

/// Peer index type.
///
/// Peers are addressed by their position in the shared, index-aligned peer list.
pub type PeerId = usize;
/// Random identifier correlating requests with their replies.
pub type RequestId = u64;
/// Stable numeric strategy identifier, the strategy's position in the registry.
pub type StrategyCode = u64;

/// Number of fixed latency servers used by local clusters.
const LOCAL_FIXED_SERVERS: usize = 6;

/// Creates a fully connected cluster of [`Engine`]s for testing and benchmarking.
///
/// The engines are linked through the given [`SimulatedNetworkCore`].
/// Latency samples are served by a [`StaticLatencySampler`] whose round-trip
/// times are twice the core's one-way link latencies. Fixed latency servers are
/// modelled as co-located with the first few nodes.
///
/// Must be called from within a tokio runtime, as it spawns one receive loop
/// per connection.
///
/// # Panics
///
/// Panics if `count` exceeds the number of available local ports.
pub fn create_local_cluster(count: usize, core: &SimulatedNetworkCore) -> Vec<Arc<Engine>> {
    assert!(count < usize::from(u16::MAX) - 10_000);
    let addresses: Vec<_> = (0..count)
        .map(|i| localhost_ip_sockaddr(i as u16))
        .collect();
    let fixed_servers: Vec<_> = (0..LOCAL_FIXED_SERVERS)
        .map(|s| localhost_ip_sockaddr(10_000 + s as u16))
        .collect();

    let registry = StrategyRegistry::default();
    let engines: Vec<_> = (0..count)
        .map(|id| {
            let peer_rtts = (0..count)
                .filter(|&other| other != id)
                .map(|other| (addresses[other], core.latency(id, other) * 2));
            let server_rtts = fixed_servers.iter().enumerate().map(|(s, addr)| {
                let anchor = s % count;
                let rtt = core.latency(id, anchor) * 2 + Duration::from_millis(1);
                (*addr, rtt)
            });
            let sampler = StaticLatencySampler::new(peer_rtts.chain(server_rtts));
            let config = EngineConfig {
                id,
                addresses: addresses.clone(),
                fixed_servers: fixed_servers.clone(),
            };
            Engine::new(config, &registry, Arc::new(sampler))
        })
        .collect();

    for a in 0..count {
        for b in (a + 1)..count {
            let (conn_a, conn_b) = core.connect(a, b);
            engines[a]
                .add_peer(b, Arc::new(conn_a))
                .expect("peer index should be in range");
            engines[b]
                .add_peer(a, Arc::new(conn_b))
                .expect("peer index should be in range");
        }
    }
    engines
}
