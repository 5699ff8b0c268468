// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Latency-aware graph strategies.
//!
//! A [`GraphStrategy`] drives a pluggable [`GraphConstructor`]: it checks the
//! latency matrix for readiness, constructs the topology at most once, and
//! then forwards every received chunk along the constructor's routes.
//!
//! Topologies are root-relative: which peers a node forwards to may depend on
//! which node originated the dissemination (see [`RoutingTable`]).

mod clusters;
pub mod kmeans;
mod kmeans_clustering;
mod latency_optimization;
mod leaf_forward;
mod n_leaders;
mod optimized;
mod random_clustering;

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, trace};
use rand::Rng;

pub use self::clusters::Clustering;
pub use self::kmeans_clustering::KmeansClustering;
pub use self::latency_optimization::{LatencyOptimization, RootedTrees};
pub use self::leaf_forward::LeafForward;
pub use self::n_leaders::NLeaders;
pub use self::optimized::Optimized;
pub use self::random_clustering::RandomClustering;
use super::{Construction, Delivery, DeliveryMode, Strategy, StrategyContext, StrategyError};
use crate::latency::{GraphError, LatencyMatrix, LatencyType};
use crate::{PeerId, RequestId, StrategyCode};

const UNINITIATED: u8 = 0;
const CONSTRUCTING: u8 = 1;
const READY: u8 = 2;

/// Forwarding adjacency, relative to the root of a dissemination.
pub trait RoutingTable {
    /// Peers that `peer` forwards to when `root` originated the dissemination.
    fn forward_targets(&self, root: PeerId, peer: PeerId) -> Vec<PeerId>;
}

/// Algorithm that turns a latency matrix into a forwarding topology.
pub trait GraphConstructor: Send + Sync + 'static {
    type Topology: Send + Sync + 'static;

    /// Which latency vectors the topology is built from.
    fn latency_type(&self) -> LatencyType {
        LatencyType::Relative
    }

    /// Whether construction has to wait for a complete latency matrix.
    fn requires_latency_matrix(&self) -> bool {
        true
    }

    /// Probability with which a non-root node silently drops a forward.
    fn byzantine_chance(&self) -> f64 {
        0.0
    }

    /// Whether disseminations must target exactly the peers the topology was built for.
    fn requires_exact_peers(&self) -> bool {
        false
    }

    /// Builds the topology over peers `0..max_peers`.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError`] if the latencies do not allow any topology.
    fn construct(
        &self,
        local_id: PeerId,
        max_peers: usize,
        latencies: &LatencyMatrix,
    ) -> Result<Self::Topology, GraphError>;

    /// Peers that `local_id` sends to, having received from `from` a
    /// dissemination originated by `root`.
    ///
    /// The originator itself calls this with `root == from == local_id`.
    fn route(
        &self,
        topology: &Self::Topology,
        local_id: PeerId,
        root: PeerId,
        from: PeerId,
    ) -> Vec<PeerId>;

    /// Hop count for forwards of a unit received with `hop`.
    ///
    /// Returns `None` if units with this hop are not forwarded.
    ///
    /// # Errors
    ///
    /// Returns [`StrategyError::InvalidHop`] if `hop` cannot occur.
    fn forward_hop(&self, hop: u8) -> Result<Option<u8>, StrategyError> {
        Ok(Some(hop.saturating_add(1)))
    }
}

struct Graph<T> {
    peers: usize,
    topology: T,
}

/// Strategy forwarding along a topology built by `C`.
pub struct GraphStrategy<C: GraphConstructor> {
    ctx: StrategyContext,
    constructor: C,
    guard: AtomicU8,
    graph: OnceLock<Graph<C::Topology>>,
    peer_graph_ready: Vec<AtomicBool>,
}

impl<C: GraphConstructor> GraphStrategy<C> {
    pub fn new(ctx: StrategyContext, constructor: C) -> Self {
        let peer_graph_ready = (0..ctx.peers.len()).map(|_| AtomicBool::new(false)).collect();
        Self {
            ctx,
            constructor,
            guard: AtomicU8::new(UNINITIATED),
            graph: OnceLock::new(),
            peer_graph_ready,
        }
    }

    /// Returns the constructed topology, if any.
    pub fn topology(&self) -> Option<&C::Topology> {
        self.graph.get().map(|graph| &graph.topology)
    }

    fn graph_for(&self, max_peers: usize) -> Result<&Graph<C::Topology>, StrategyError> {
        let graph = self.graph.get().ok_or(StrategyError::GraphNotReady)?;
        if max_peers > graph.peers
            || (self.constructor.requires_exact_peers() && max_peers != graph.peers)
        {
            return Err(StrategyError::GraphNotReady);
        }
        Ok(graph)
    }

    fn targets(
        &self,
        graph: &Graph<C::Topology>,
        root: PeerId,
        from: PeerId,
        max_peers: usize,
    ) -> Vec<PeerId> {
        let local = self.ctx.local_id;
        let mut targets = self.constructor.route(&graph.topology, local, root, from);
        targets.retain(|&id| id != local && id < max_peers);
        targets.sort_unstable();
        targets.dedup();
        targets
    }
}

#[async_trait]
impl<C: GraphConstructor> Strategy for GraphStrategy<C> {
    fn code(&self) -> StrategyCode {
        self.ctx.code
    }

    async fn execute(
        &self,
        request_id: RequestId,
        data: Bytes,
        max_peers: usize,
    ) -> Result<(), StrategyError> {
        let local = self.ctx.local_id;
        let graph = self.graph_for(max_peers)?;
        let targets = self.targets(graph, local, local, max_peers);
        let peers = self.ctx.resolve(targets)?;
        let packet = self.ctx.origin_packet(request_id, data, max_peers, 1);
        self.ctx.send_concurrently(&peers, &packet).await;
        Ok(())
    }

    async fn handle_packet(&self, delivery: Delivery) -> Result<(), StrategyError> {
        let graph = self.graph_for(delivery.max_peers)?;
        let Some(hop) = self.constructor.forward_hop(delivery.hop)? else {
            return Ok(());
        };
        let chance = self.constructor.byzantine_chance();
        if chance > 0.0 && rand::rng().random_bool(chance) {
            trace!(
                "byzantine drop of dissemination {:#x} chunk {}",
                delivery.request_id, delivery.seq
            );
            return Ok(());
        }
        let targets = self.targets(
            graph,
            delivery.original_sender,
            delivery.from,
            delivery.max_peers,
        );
        if targets.is_empty() {
            return Ok(());
        }
        let peers = self.ctx.resolve_available(targets);
        let packet = delivery.forward(self.ctx.code, hop);
        self.ctx.send_concurrently(&peers, &packet).await;
        Ok(())
    }

    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::PerChunk
    }

    fn latency_type(&self) -> LatencyType {
        self.constructor.latency_type()
    }

    fn construct_graph(&self, max_peers: usize) -> Result<Construction, StrategyError> {
        if self.guard.load(Ordering::Acquire) == READY {
            return Ok(Construction::AlreadyConstructed);
        }
        let latencies = self
            .ctx
            .state
            .latency_matrix(self.constructor.latency_type());
        if self.constructor.requires_latency_matrix()
            && !latencies.is_ready(self.constructor.latency_type())?
        {
            return Err(GraphError::LatencyMatrixNotReady.into());
        }
        if self
            .guard
            .compare_exchange(UNINITIATED, CONSTRUCTING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(Construction::AlreadyConstructed);
        }

        let max_peers = if self.constructor.requires_latency_matrix() {
            max_peers.min(latencies.peers())
        } else {
            max_peers
        };
        let local = self.ctx.local_id;
        match self.constructor.construct(local, max_peers, &latencies) {
            Ok(topology) => {
                let graph = Graph {
                    peers: max_peers,
                    topology,
                };
                if self.graph.set(graph).is_err() {
                    debug!("graph of strategy {} was already published", self.ctx.code);
                }
                self.graph_ready_for_peer(local);
                self.guard.store(READY, Ordering::Release);
                info!(
                    "constructed graph of strategy {} over {max_peers} peers",
                    self.ctx.code
                );
                Ok(Construction::Constructed)
            }
            Err(err) => {
                self.guard.store(UNINITIATED, Ordering::Release);
                Err(err.into())
            }
        }
    }

    fn graph_ready_for_peer(&self, peer: PeerId) {
        if let Some(ready) = self.peer_graph_ready.get(peer) {
            ready.store(true, Ordering::Release);
        }
    }

    fn is_graph_ready_for_peer(&self, peer: PeerId) -> bool {
        self.peer_graph_ready
            .get(peer)
            .is_some_and(|ready| ready.load(Ordering::Acquire))
    }
}
