// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Dissemination strategies.
//!
//! A [`Strategy`] decides where the originator sends a payload and how every
//! receiver forwards it. Strategies are instantiated once per node from a
//! [`StrategyRegistry`], which assigns each a stable numeric code.
//!
//! Implementations:
//! - [`Broadcast`] sends directly to every peer
//! - [`RandomStrategy`] forwards through random peers
//! - [`SimpleStrategy`] forwards through one peer per index range
//! - [`GraphStrategy`] forwards along a topology built from latencies

pub mod broadcast;
pub mod graph;
pub mod random;
pub mod simple;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use log::warn;
use thiserror::Error;

pub use self::broadcast::Broadcast;
pub use self::graph::GraphStrategy;
use self::graph::{
    KmeansClustering, LatencyOptimization, LeafForward, NLeaders, Optimized, RandomClustering,
};
pub use self::random::RandomStrategy;
pub use self::simple::SimpleStrategy;
use crate::latency::{GraphError, LatencyType};
use crate::peer::{Peer, PeerError, PeerSet};
use crate::protocol::DisseminatePacket;
use crate::state::State;
use crate::{PeerId, RequestId, StrategyCode};

/// Code of the non-blocking broadcast in the default registry, used for warm-up.
pub const BROADCAST: StrategyCode = 0;

/// Error type for strategy operations.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("graph is not constructed yet")]
    GraphNotReady,
    #[error("unexpected hop count {0}")]
    InvalidHop(u8),
    #[error("graph construction failed: {0}")]
    Graph(#[from] GraphError),
    #[error("peer error: {0}")]
    Peer(#[from] PeerError),
}

/// Granularity at which a strategy sees incoming disseminations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Once per newly accepted packet, so chunks can be forwarded cut-through.
    PerChunk,
    /// Once per dissemination, with the reassembled payload.
    Reassembled,
}

/// Outcome of a graph construction attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Construction {
    /// This call built the graph.
    Constructed,
    /// Another call is building or has built the graph.
    AlreadyConstructed,
    /// The strategy does not use a graph.
    Unsupported,
}

/// One unit of an incoming dissemination, handed to [`Strategy::handle_packet`].
#[derive(Clone, Debug)]
pub struct Delivery {
    pub request_id: RequestId,
    pub hop: u8,
    pub original_sender: PeerId,
    /// Peer this unit was received from.
    pub from: PeerId,
    pub max_peers: usize,
    pub data: Bytes,
    pub partial: bool,
    pub seq: u16,
    pub total: u16,
}

impl Delivery {
    /// Wraps a single received packet.
    #[must_use]
    pub fn from_packet(packet: &DisseminatePacket, from: PeerId) -> Self {
        Self {
            request_id: packet.request_id,
            hop: packet.hop,
            original_sender: packet.original_sender as PeerId,
            from,
            max_peers: packet.max_peers as usize,
            data: packet.data.clone(),
            partial: packet.partial,
            seq: packet.seq,
            total: packet.total,
        }
    }

    /// Wraps a fully reassembled payload.
    ///
    /// `packet` is the packet that completed the payload.
    #[must_use]
    pub fn reassembled(packet: &DisseminatePacket, from: PeerId, data: Bytes) -> Self {
        Self {
            data,
            partial: false,
            seq: 0,
            total: 0,
            ..Self::from_packet(packet, from)
        }
    }

    /// Builds the packet that forwards this unit with a new hop count.
    #[must_use]
    pub fn forward(&self, strategy_code: StrategyCode, hop: u8) -> DisseminatePacket {
        DisseminatePacket {
            strategy_code,
            request_id: self.request_id,
            original_sender: self.original_sender as u64,
            max_peers: self.max_peers as u64,
            hop,
            partial: self.partial,
            seq: self.seq,
            total: self.total,
            data: self.data.clone(),
        }
    }
}

/// Abstraction of a dissemination strategy.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Stable numeric code of this strategy.
    fn code(&self) -> StrategyCode;

    /// Sends `data` as the original sender, only to peers `0..max_peers`.
    async fn execute(
        &self,
        request_id: RequestId,
        data: Bytes,
        max_peers: usize,
    ) -> Result<(), StrategyError>;

    /// Performs any necessary forwarding of a received unit.
    async fn handle_packet(&self, delivery: Delivery) -> Result<(), StrategyError>;

    /// How incoming disseminations are handed to [`Self::handle_packet`].
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::Reassembled
    }

    /// Which latency vectors this strategy's graph is built from.
    fn latency_type(&self) -> LatencyType {
        LatencyType::Relative
    }

    /// Builds the strategy's graph, at most once.
    ///
    /// This may be CPU heavy, so async callers should run it on a blocking thread.
    fn construct_graph(&self, _max_peers: usize) -> Result<Construction, StrategyError> {
        Ok(Construction::Unsupported)
    }

    /// Marks `peer` as having constructed its graph.
    fn graph_ready_for_peer(&self, _peer: PeerId) {}

    /// Whether `peer` has constructed its graph.
    fn is_graph_ready_for_peer(&self, _peer: PeerId) -> bool {
        true
    }
}

/// Everything a strategy needs to know about its node.
#[derive(Clone)]
pub struct StrategyContext {
    pub code: StrategyCode,
    pub local_id: PeerId,
    pub peers: Arc<PeerSet>,
    pub state: Arc<State>,
}

impl StrategyContext {
    /// Looks up all targets, failing if any of them is unavailable.
    ///
    /// Nothing is sent if this fails.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError`] for the first target that is out of range or not connected.
    pub fn resolve(
        &self,
        targets: impl IntoIterator<Item = PeerId>,
    ) -> Result<Vec<Arc<Peer>>, StrategyError> {
        targets
            .into_iter()
            .map(|id| self.peers.connected(id).map_err(StrategyError::from))
            .collect()
    }

    /// Looks up all targets, skipping those that are unavailable.
    #[must_use]
    pub fn resolve_available(&self, targets: impl IntoIterator<Item = PeerId>) -> Vec<Arc<Peer>> {
        targets
            .into_iter()
            .filter_map(|id| match self.peers.connected(id) {
                Ok(peer) => Some(peer),
                Err(err) => {
                    warn!("skipping forward target: {err}");
                    None
                }
            })
            .collect()
    }

    /// Builds the packet the original sender sends.
    #[must_use]
    pub fn origin_packet(
        &self,
        request_id: RequestId,
        data: Bytes,
        max_peers: usize,
        hop: u8,
    ) -> DisseminatePacket {
        DisseminatePacket {
            strategy_code: self.code,
            request_id,
            original_sender: self.local_id as u64,
            max_peers: max_peers as u64,
            hop,
            partial: false,
            seq: 0,
            total: 0,
            data,
        }
    }

    /// Sends `packet` to all `peers` concurrently.
    ///
    /// Individual send failures are logged, not returned.
    pub async fn send_concurrently(&self, peers: &[Arc<Peer>], packet: &DisseminatePacket) {
        let tasks = peers.iter().map(|peer| async move {
            (peer.id(), peer.disseminate_request(packet.clone()).await)
        });
        for (id, res) in join_all(tasks).await {
            if let Err(err) = res {
                warn!("sending dissemination to peer {id} failed: {err}");
            }
        }
    }

    /// Sends `packet` to all `peers`, one after another.
    ///
    /// Individual send failures are logged, not returned.
    pub async fn send_sequentially(&self, peers: &[Arc<Peer>], packet: &DisseminatePacket) {
        for peer in peers {
            if let Err(err) = peer.disseminate_request(packet.clone()).await {
                warn!("sending dissemination to peer {} failed: {err}", peer.id());
            }
        }
    }
}

/// Creates a strategy instance for one node.
pub type StrategyConstructor = fn(StrategyContext) -> Arc<dyn Strategy>;

/// Table of `(name, constructor)` pairs, the position being the strategy code.
pub struct StrategyRegistry {
    entries: Vec<(&'static str, StrategyConstructor)>,
}

impl Default for StrategyRegistry {
    /// Registry with all built-in strategies.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("Broadcast", |ctx| Arc::new(Broadcast::new(ctx, false)));
        registry.register("Broadcast (blocking)", |ctx| {
            Arc::new(Broadcast::new(ctx, true))
        });
        registry.register("Random - 10%", |ctx| {
            Arc::new(RandomStrategy::new(ctx, 10, false))
        });
        registry.register("Random - 20%", |ctx| {
            Arc::new(RandomStrategy::new(ctx, 20, false))
        });
        registry.register("Random - 50%", |ctx| {
            Arc::new(RandomStrategy::new(ctx, 50, false))
        });
        registry.register("Random - 10%, hop 0 forwarding", |ctx| {
            Arc::new(RandomStrategy::new(ctx, 10, true))
        });
        registry.register("Simple - sqrt(n) groups", |ctx| {
            Arc::new(SimpleStrategy::new(ctx))
        });
        registry.register("K-Means Clustering - 6 clusters", |ctx| {
            Arc::new(GraphStrategy::new(ctx, KmeansClustering::relative(6)))
        });
        registry.register("K-Means Leaf Forward - (k=6, byz=30%, forward=2)", |ctx| {
            Arc::new(GraphStrategy::new(ctx, LeafForward::new(6, 0.3, 2)))
        });
        registry.register("K-Means Leaf Forward - (k=6, byz=0%, forward=2)", |ctx| {
            Arc::new(GraphStrategy::new(ctx, LeafForward::new(6, 0.0, 2)))
        });
        registry.register("K-Means N Leaders - (k=6, byz=0%, n=3)", |ctx| {
            Arc::new(GraphStrategy::new(ctx, NLeaders::new(6, 3, 0.0)))
        });
        registry.register("K-Means N Leaders - (k=6, byz=30%, n=3)", |ctx| {
            Arc::new(GraphStrategy::new(ctx, NLeaders::new(6, 3, 0.3)))
        });
        registry.register("K-Means Fixed NTP - 6 clusters", |ctx| {
            Arc::new(GraphStrategy::new(ctx, KmeansClustering::fixed(6)))
        });
        registry.register("K-Means Optimized - (k=6, byz=30%)", |ctx| {
            Arc::new(GraphStrategy::new(ctx, Optimized::new(6, 0.3)))
        });
        registry.register("K-Means Optimized - (k=6, byz=0%)", |ctx| {
            Arc::new(GraphStrategy::new(ctx, Optimized::new(6, 0.0)))
        });
        registry.register("Random Clustering - 6 clusters", |ctx| {
            Arc::new(GraphStrategy::new(ctx, RandomClustering::new(6)))
        });
        registry.register("Latency Matrix Optimization - upper bound 10%", |ctx| {
            Arc::new(GraphStrategy::new(ctx, LatencyOptimization::new(10)))
        });
        registry.register("Latency Matrix Optimization - upper bound 20%", |ctx| {
            Arc::new(GraphStrategy::new(ctx, LatencyOptimization::new(20)))
        });
        registry
    }
}

impl StrategyRegistry {
    /// Registry without any strategies.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Appends a strategy and returns its code.
    pub fn register(&mut self, name: &'static str, constructor: StrategyConstructor) -> StrategyCode {
        self.entries.push((name, constructor));
        (self.entries.len() - 1) as StrategyCode
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of all strategies, in code order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(name, _)| *name)
    }

    /// Creates one instance of every registered strategy for a node.
    #[must_use]
    pub fn instantiate(
        &self,
        local_id: PeerId,
        peers: &Arc<PeerSet>,
        state: &Arc<State>,
    ) -> Vec<Arc<dyn Strategy>> {
        self.entries
            .iter()
            .enumerate()
            .map(|(code, (_, constructor))| {
                constructor(StrategyContext {
                    code: code as StrategyCode,
                    local_id,
                    peers: Arc::clone(peers),
                    state: Arc::clone(state),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::recording_peers;

    #[test]
    fn registry_codes() {
        let registry = StrategyRegistry::default();
        assert_eq!(registry.len(), 18);
        assert_eq!(registry.names().next(), Some("Broadcast"));

        let (peers, _) = recording_peers(4, 0);
        let state = Arc::new(State::new(4));
        let strategies = registry.instantiate(0, &peers, &state);
        for (code, strategy) in strategies.iter().enumerate() {
            assert_eq!(strategy.code(), code as StrategyCode);
        }
        assert_eq!(strategies[BROADCAST as usize].delivery_mode(), DeliveryMode::Reassembled);
        assert_eq!(strategies[12].latency_type(), LatencyType::Fixed);
        assert_eq!(strategies[7].delivery_mode(), DeliveryMode::PerChunk);
    }

    #[test]
    fn custom_registration() {
        let mut registry = StrategyRegistry::empty();
        assert!(registry.is_empty());
        let code = registry.register("only", |ctx| Arc::new(Broadcast::new(ctx, true)));
        assert_eq!(code, 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn resolve_is_all_or_nothing() {
        let (peers, _) = recording_peers(4, 0);
        let ctx = StrategyContext {
            code: 0,
            local_id: 0,
            peers,
            state: Arc::new(State::new(4)),
        };
        assert_eq!(ctx.resolve([1, 2, 3]).unwrap().len(), 3);
        // local node has no session
        assert!(ctx.resolve([0, 1]).is_err());
        assert!(ctx.resolve([1, 4]).is_err());
        assert_eq!(ctx.resolve_available([0, 1, 4]).len(), 1);
    }
}
