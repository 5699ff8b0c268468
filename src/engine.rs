// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The per-node engine.
//!
//! The [`Engine`] owns the peer sessions, the shared [`State`] and one
//! instance of every registered strategy. It runs one receive loop per peer,
//! dispatches incoming messages by their [`MessageCode`], and exposes the
//! operator operations (disseminations, graph construction, diagnostics).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use fastrace::Span;
use fastrace::future::FutureExt;
use futures::future::join_all;
use log::{debug, error, info, trace, warn};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::latency::{
    GraphError, LatencyMatrix, LatencySampler, LatencyType, PingStatistics, filter_avg_rtt,
};
use crate::network::Connection;
use crate::peer::{DataTransfer, Peer, PeerError, PeerSet, Response};
use crate::protocol::{
    AckDataPacket, DataPacket, DisseminatePacket, DisseminateReportPacket, GraphReadyPacket,
    LatencyArrayPacket, MessageCode, PingPacket, PongPacket, ProtocolError, TriggerRequestPacket,
    UpdateTcpSocketPacket, decode, system_time_from_ns, unix_time_ns,
};
use crate::report::{DisseminationResult, IndividualDisseminateResult};
use crate::state::{ChunkOutcome, ChunkProgress, State};
use crate::strategy::{
    BROADCAST, Construction, Delivery, DeliveryMode, Strategy, StrategyError, StrategyRegistry,
};
use crate::{PeerId, StrategyCode};

/// Error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown strategy {0}")]
    UnknownStrategy(StrategyCode),
    #[error("cannot target {max_peers} peers out of {peers}")]
    InvalidMaxPeers { max_peers: usize, peers: usize },
    #[error("{} peers failed", .0.len())]
    FanOut(Vec<(PeerId, PeerError)>),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Strategy(#[from] StrategyError),
    #[error(transparent)]
    Peer(#[from] PeerError),
}

/// Static configuration of one engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Own index into `addresses`.
    pub id: PeerId,
    /// Addresses of all nodes, index-aligned with peer ids.
    pub addresses: Vec<SocketAddr>,
    /// External servers sampled for fixed latency vectors.
    pub fixed_servers: Vec<SocketAddr>,
}

/// Which peers have confirmed their graph for a strategy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GraphStatus {
    pub ready: Vec<PeerId>,
    pub not_ready: Vec<PeerId>,
}

/// One node of the dissemination benchmark.
pub struct Engine {
    id: PeerId,
    addresses: Vec<SocketAddr>,
    fixed_servers: Vec<SocketAddr>,
    peers: Arc<PeerSet>,
    state: Arc<State>,
    strategies: Vec<Arc<dyn Strategy>>,
    strategy_names: Vec<&'static str>,
    sampler: Arc<dyn LatencySampler>,
    cancel_token: CancellationToken,
}

impl Engine {
    /// Creates a new engine with one instance of every strategy in `registry`.
    ///
    /// No peer is connected yet, see [`Engine::add_peer`].
    pub fn new(
        config: EngineConfig,
        registry: &StrategyRegistry,
        sampler: Arc<dyn LatencySampler>,
    ) -> Arc<Self> {
        let nodes = config.addresses.len();
        let peers = Arc::new(PeerSet::new(nodes));
        let state = Arc::new(State::new(nodes));
        let strategies = registry.instantiate(config.id, &peers, &state);
        Arc::new(Self {
            id: config.id,
            addresses: config.addresses,
            fixed_servers: config.fixed_servers,
            peers,
            state,
            strategies,
            strategy_names: registry.names().collect(),
            sampler,
            cancel_token: CancellationToken::new(),
        })
    }

    #[must_use]
    pub const fn id(&self) -> PeerId {
        self.id
    }

    /// Names of all strategies, indexed by strategy code.
    #[must_use]
    pub fn strategy_names(&self) -> &[&'static str] {
        &self.strategy_names
    }

    /// Indices of all currently connected peers.
    #[must_use]
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.connected_ids()
    }

    /// Snapshot of the latency matrix of the given type.
    #[must_use]
    pub fn latency_matrix(&self, latency_type: LatencyType) -> LatencyMatrix {
        self.state.latency_matrix(latency_type)
    }

    /// Stops all receive loops.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    fn strategy(&self, code: StrategyCode) -> Option<&Arc<dyn Strategy>> {
        usize::try_from(code)
            .ok()
            .and_then(|index| self.strategies.get(index))
    }

    fn known_strategy(&self, code: StrategyCode) -> Result<Arc<dyn Strategy>, EngineError> {
        self.strategy(code)
            .cloned()
            .ok_or(EngineError::UnknownStrategy(code))
    }

    /// Resolves `0` to all nodes and rejects targets beyond the peer list.
    fn target_count(&self, max_peers: usize) -> Result<usize, EngineError> {
        let peers = self.peers.len();
        match max_peers {
            0 => Ok(peers),
            n if n > peers => Err(EngineError::InvalidMaxPeers {
                max_peers: n,
                peers,
            }),
            n => Ok(n),
        }
    }

    /// Registers a session for peer `id` over `connection` and starts its receive loop.
    ///
    /// A previous session for the same peer is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::OutOfRange`] if `id` is not in the peer list.
    pub fn add_peer(
        self: &Arc<Self>,
        id: PeerId,
        connection: Arc<dyn Connection>,
    ) -> Result<JoinHandle<()>, EngineError> {
        let address = self.addresses.get(id).copied().ok_or(PeerError::OutOfRange {
            id,
            peers: self.addresses.len(),
        })?;
        let peer = Arc::new(Peer::new(id, address, connection));
        if let Some(old) = self.peers.insert(Arc::clone(&peer))? {
            debug!("replacing session of peer {id}");
            tokio::spawn(async move { old.disconnect().await });
        }
        let engine = Arc::clone(self);
        let span = Span::enter_with_local_parent(format!("peer {id} receive loop"));
        Ok(tokio::spawn(async move { engine.receive_loop(peer).await }.in_span(span)))
    }

    async fn receive_loop(self: Arc<Self>, peer: Arc<Peer>) {
        loop {
            let res = tokio::select! {
                res = peer.receive() => res,
                () = self.cancel_token.cancelled() => break,
            };
            let (code, payload) = match res {
                Ok(message) => message,
                Err(err) => {
                    info!("connection to peer {} lost: {err}", peer.id());
                    break;
                }
            };
            match self.handle_message(&peer, code, payload).await {
                Ok(()) => {}
                Err(EngineError::Protocol(err)) => {
                    warn!("protocol violation by peer {}, disconnecting: {err}", peer.id());
                    break;
                }
                Err(err) => warn!("handling message {code} from peer {}: {err}", peer.id()),
            }
        }
        peer.disconnect().await;
    }

    async fn handle_message(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        code: u64,
        payload: Bytes,
    ) -> Result<(), EngineError> {
        let received_at = unix_time_ns();
        let from = peer.id();
        match MessageCode::try_from(code)? {
            MessageCode::Ping => {
                let ping: PingPacket = decode(&payload)?;
                let pong = PongPacket {
                    request_id: ping.request_id,
                    time_ns: unix_time_ns(),
                };
                peer.send_packet(&pong).await?;
            }
            MessageCode::Pong => {
                let pong: PongPacket = decode(&payload)?;
                peer.dispatch_response(Response::Pong(pong)).await;
            }
            MessageCode::Data => {
                let data: DataPacket = decode(&payload)?;
                ack(peer, data.request_id).await?;
            }
            MessageCode::AckData => {
                let ack: AckDataPacket = decode(&payload)?;
                peer.dispatch_response(Response::AckData(ack)).await;
            }
            MessageCode::UpdateTcpSocket => {
                let update: UpdateTcpSocketPacket = decode(&payload)?;
                debug!(
                    "peer {from} asked for socket buffers of {} bytes (reset: {})",
                    update.buffer_size, update.reset
                );
            }
            MessageCode::DisseminateRequest => {
                let packet: DisseminatePacket = decode(&payload)?;
                self.handle_dissemination(from, packet, received_at).await?;
            }
            MessageCode::DisseminateReport => {
                let report: DisseminateReportPacket = decode(&payload)?;
                let result = IndividualDisseminateResult {
                    sender: from,
                    relay: report.relay as PeerId,
                    hop: report.hop,
                    reception_time: system_time_from_ns(report.time_ns),
                    full: report.full,
                    error_timeout: false,
                };
                if !self.state.deliver_report(report.request_id, result) {
                    error!(
                        "report from peer {from} for unknown dissemination {:#x}",
                        report.request_id
                    );
                }
            }
            MessageCode::LatencyArray => {
                let array: LatencyArrayPacket = decode(&payload)?;
                let strategy = self.strategy_for_packet(array.strategy)?;
                let latency_type = strategy.latency_type();
                let mut row: Vec<Duration> = array
                    .latencies_ns
                    .iter()
                    .map(|&ns| Duration::from_nanos(ns))
                    .collect();
                if latency_type == LatencyType::Relative {
                    row.truncate(self.peers.len());
                }
                self.state.set_latency_row(latency_type, from, row);
                ack(peer, array.request_id).await?;
                self.spawn_construction(strategy);
            }
            MessageCode::TriggerRequest => {
                let trigger: TriggerRequestPacket = decode(&payload)?;
                let strategy = self.strategy_for_packet(trigger.strategy)?;
                ack(peer, trigger.request_id).await?;
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    let failures = engine.share_latency_row(&strategy).await;
                    log_fan_out("latency array", strategy.code(), &failures);
                });
            }
            MessageCode::GraphReady => {
                let ready: GraphReadyPacket = decode(&payload)?;
                let strategy = self.strategy_for_packet(ready.strategy)?;
                strategy.graph_ready_for_peer(from);
                ack(peer, ready.request_id).await?;
            }
        }
        Ok(())
    }

    fn strategy_for_packet(&self, code: StrategyCode) -> Result<Arc<dyn Strategy>, ProtocolError> {
        self.strategy(code)
            .cloned()
            .ok_or(ProtocolError::UnknownStrategy(code))
    }

    /// Records a dissemination packet, hands it to its strategy and reports progress.
    async fn handle_dissemination(
        &self,
        from: PeerId,
        packet: DisseminatePacket,
        received_at: u64,
    ) -> Result<(), EngineError> {
        let strategy = self.strategy_for_packet(packet.strategy_code)?;
        self.check_targets(&packet)?;
        if packet.original_sender as PeerId == self.id {
            trace!("ignoring own dissemination {:#x}", packet.request_id);
            return Ok(());
        }
        let progress = match self.state.record_chunk(&packet, from).await? {
            ChunkOutcome::Duplicate => return Ok(()),
            ChunkOutcome::Accepted(progress) => progress,
        };

        let delivery = match strategy.delivery_mode() {
            DeliveryMode::PerChunk => Some(Delivery::from_packet(&packet, from)),
            DeliveryMode::Reassembled => progress
                .reassembled
                .clone()
                .map(|data| Delivery::reassembled(&packet, from, data)),
        };
        if let Some(delivery) = delivery {
            tokio::spawn(async move {
                let request_id = delivery.request_id;
                if let Err(err) = strategy.handle_packet(delivery).await {
                    warn!(
                        "strategy {} failed to forward dissemination {request_id:#x}: {err}",
                        strategy.code()
                    );
                }
            });
        }

        if progress.is_complete() || progress.is_half_complete() {
            self.report(&packet, &progress, received_at).await?;
        }
        Ok(())
    }

    /// Rejects packets naming peers outside the peer list.
    fn check_targets(&self, packet: &DisseminatePacket) -> Result<(), ProtocolError> {
        let peers = self.peers.len();
        if usize::try_from(packet.max_peers).map_or(true, |max_peers| max_peers > peers) {
            return Err(ProtocolError::MaxPeersOutOfRange {
                max_peers: packet.max_peers,
                peers,
            });
        }
        if usize::try_from(packet.original_sender).map_or(true, |sender| sender >= peers) {
            return Err(ProtocolError::UnknownSender {
                sender: packet.original_sender,
            });
        }
        Ok(())
    }

    /// Reports reception of a whole or half payload to its original sender.
    async fn report(
        &self,
        packet: &DisseminatePacket,
        progress: &ChunkProgress,
        received_at: u64,
    ) -> Result<(), EngineError> {
        let origin = packet.original_sender as PeerId;
        let full = progress.is_complete();
        trace!(
            "received {}/{} chunks of dissemination {:#x}",
            progress.received, progress.expected, packet.request_id
        );
        let report = DisseminateReportPacket {
            request_id: packet.request_id,
            relay: progress.relay as u64,
            hop: packet.hop,
            time_ns: received_at,
            full,
        };
        self.peers.connected(origin)?.send_packet(&report).await?;
        Ok(())
    }

    /// Disseminates `size` random bytes with strategy `code` to peers `0..max_peers`.
    ///
    /// `max_peers == 0` targets all peers. Waits for reports for at most
    /// [`REPORT_TIMEOUT`](crate::state::REPORT_TIMEOUT).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the strategy is unknown, `max_peers` is out
    /// of range, or the strategy refuses to execute. No reports are collected then.
    #[fastrace::trace]
    pub async fn disseminate(
        &self,
        code: StrategyCode,
        size: usize,
        max_peers: usize,
    ) -> Result<DisseminationResult, EngineError> {
        let strategy = self.known_strategy(code)?;
        let max_peers = self.target_count(max_peers)?;
        let (request_id, data) = {
            let mut rng = rand::rng();
            let mut data = vec![0u8; size];
            rng.fill(&mut data[..]);
            (rng.random(), Bytes::from(data))
        };

        self.state.open_report_slot(request_id);
        let start_time = SystemTime::now();
        if self.id < max_peers {
            let own = IndividualDisseminateResult {
                sender: self.id,
                relay: self.id,
                hop: 0,
                reception_time: start_time,
                full: true,
                error_timeout: false,
            };
            self.state.deliver_report(request_id, own);
        }
        if let Err(err) = strategy.execute(request_id, data, max_peers).await {
            self.state.close_report_slot(request_id);
            return Err(err.into());
        }
        debug!("dissemination {request_id:#x} with strategy {code} sent");

        let results = self.state.collect_reports(request_id, max_peers).await;
        Ok(DisseminationResult {
            size,
            max_peers,
            start_time,
            results,
        })
    }

    /// Runs a broadcast to warm up connections before measuring.
    ///
    /// # Errors
    ///
    /// See [`Engine::disseminate`].
    #[fastrace::trace]
    pub async fn warm_up(
        &self,
        size: usize,
        max_peers: usize,
    ) -> Result<DisseminationResult, EngineError> {
        self.disseminate(BROADCAST, size, max_peers).await
    }

    /// Constructs the graph of strategy `code` over `max_peers` peers.
    ///
    /// Announces readiness to all peers if this call built the graph.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Strategy`] if the latency matrix is not ready
    /// or construction fails.
    #[fastrace::trace]
    pub async fn construct_graph(
        self: &Arc<Self>,
        code: StrategyCode,
        max_peers: usize,
    ) -> Result<Construction, EngineError> {
        let strategy = self.known_strategy(code)?;
        let max_peers = self.target_count(max_peers)?;
        let builder = Arc::clone(&strategy);
        let construction =
            tokio::task::spawn_blocking(move || builder.construct_graph(max_peers)).await??;
        if construction == Construction::Constructed {
            let failures = self.announce_graph_ready(code).await;
            log_fan_out("graph ready", code, &failures);
        }
        Ok(construction)
    }

    /// Lists which peers have confirmed their graph for strategy `code`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownStrategy`] if `code` is not registered.
    pub fn is_graph_ready(&self, code: StrategyCode) -> Result<GraphStatus, EngineError> {
        let strategy = self.known_strategy(code)?;
        let (ready, not_ready): (Vec<_>, Vec<_>) =
            (0..self.peers.len()).partition(|&id| strategy.is_graph_ready_for_peer(id));
        Ok(GraphStatus { ready, not_ready })
    }

    /// Samples latencies for strategy `code`, shares them with all peers and
    /// asks every peer to do the same.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::FanOut`] with every peer that could not be reached.
    #[fastrace::trace]
    pub async fn trigger_latency_broadcast(
        self: &Arc<Self>,
        code: StrategyCode,
    ) -> Result<(), EngineError> {
        let strategy = self.known_strategy(code)?;
        let triggers = self.fan_out(|peer| async move { peer.send_trigger_request(code).await });
        let (mut failures, trigger_failures) =
            tokio::join!(self.share_latency_row(&strategy), triggers);
        failures.extend(trigger_failures);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(EngineError::FanOut(failures))
        }
    }

    /// Samples and stores the local latency row, tries to construct the graph,
    /// and sends the row to every other peer.
    ///
    /// Returns the peers the row could not be delivered to.
    async fn share_latency_row(
        self: &Arc<Self>,
        strategy: &Arc<dyn Strategy>,
    ) -> Vec<(PeerId, PeerError)> {
        let latency_type = strategy.latency_type();
        let row = self.sample_latency_row(latency_type).await;
        self.state.set_latency_row(latency_type, self.id, row.clone());
        self.spawn_construction(Arc::clone(strategy));

        let code = strategy.code();
        let row = &row;
        self.fan_out(|peer| async move { peer.send_latency_array(code, row).await })
            .await
    }

    async fn sample_latency_row(&self, latency_type: LatencyType) -> Vec<Duration> {
        let stats = match latency_type {
            LatencyType::Relative => {
                let sample_all = || async {
                    let samples = self.addresses.iter().enumerate().map(|(id, &addr)| async move {
                        if id == self.id {
                            PingStatistics::default()
                        } else {
                            self.sampler.sample(addr).await
                        }
                    });
                    join_all(samples).await
                };
                let complete = |stats: &[PingStatistics]| {
                    stats
                        .iter()
                        .enumerate()
                        .all(|(id, s)| id == self.id || s.packets_received > 0)
                };
                self.state.cached_ping_results(sample_all, complete).await
            }
            LatencyType::Fixed => {
                let samples = self.fixed_servers.iter().map(|&addr| self.sampler.sample(addr));
                join_all(samples).await
            }
        };
        filter_avg_rtt(&stats, latency_type)
    }

    /// Tries to construct the graph of `strategy` in the background.
    ///
    /// On success, readiness is announced to all peers.
    fn spawn_construction(self: &Arc<Self>, strategy: Arc<dyn Strategy>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let code = strategy.code();
            let max_peers = engine.peers.len();
            let builder = Arc::clone(&strategy);
            let res = tokio::task::spawn_blocking(move || builder.construct_graph(max_peers)).await;
            match res {
                Ok(Ok(Construction::Constructed)) => {
                    let failures = engine.announce_graph_ready(code).await;
                    log_fan_out("graph ready", code, &failures);
                }
                Ok(Ok(_)) => {}
                Ok(Err(StrategyError::Graph(GraphError::LatencyMatrixNotReady))) => {
                    debug!("latency matrix for strategy {code} not ready yet");
                }
                Ok(Err(StrategyError::Graph(err @ GraphError::InvalidSelfLatency { .. }))) => {
                    error!("latency matrix for strategy {code} is corrupt: {err}");
                    panic!("corrupt latency matrix: {err}");
                }
                Ok(Err(err)) => warn!("graph construction for strategy {code} failed: {err}"),
                Err(err) => error!("graph construction task for strategy {code} failed: {err}"),
            }
        });
    }

    async fn announce_graph_ready(&self, code: StrategyCode) -> Vec<(PeerId, PeerError)> {
        info!("graph of strategy {code} ready, notifying peers");
        self.fan_out(|peer| async move { peer.send_graph_ready(code).await })
            .await
    }

    /// Runs `request` against every other peer concurrently.
    ///
    /// Returns the peers for which it failed, including unconnected ones.
    async fn fan_out<'a, F, Fut>(&'a self, request: F) -> Vec<(PeerId, PeerError)>
    where
        F: Fn(Arc<Peer>) -> Fut + 'a,
        Fut: Future<Output = Result<(), PeerError>> + 'a,
    {
        let requests = (0..self.peers.len())
            .filter(|&id| id != self.id)
            .map(|id| {
                let peer = self.peers.connected(id);
                let request = &request;
                async move {
                    let res = match peer {
                        Ok(peer) => request(peer).await,
                        Err(err) => Err(err),
                    };
                    (id, res)
                }
            });
        join_all(requests)
            .await
            .into_iter()
            .filter_map(|(id, res)| res.err().map(|err| (id, err)))
            .collect()
    }

    /// Measures the round-trip time of a ping to peer `id`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Peer`] if the peer is unavailable or does not answer.
    #[fastrace::trace]
    pub async fn ping_peer(&self, id: PeerId) -> Result<Duration, EngineError> {
        let peer = self.peers.connected(id)?;
        let start = Instant::now();
        peer.send_ping().await?;
        Ok(start.elapsed())
    }

    /// Sends `size` random bytes to peer `id` and waits for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Peer`] if the peer is unavailable or does not answer.
    #[fastrace::trace]
    pub async fn send_data(&self, id: PeerId, size: usize) -> Result<DataTransfer, EngineError> {
        let peer = self.peers.connected(id)?;
        let mut data = vec![0u8; size];
        rand::rng().fill(&mut data[..]);
        Ok(peer.send_data(data.into()).await?)
    }

    /// Asks peer `id` to retune its socket buffers to `buffer_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Peer`] if the peer is unavailable.
    pub async fn update_tcp_socket(
        &self,
        id: PeerId,
        buffer_size: u64,
        reset: bool,
    ) -> Result<(), EngineError> {
        let peer = self.peers.connected(id)?;
        peer.send_update_tcp_socket(buffer_size, reset).await?;
        Ok(())
    }
}

async fn ack(peer: &Peer, request_id: u64) -> Result<(), PeerError> {
    let ack = AckDataPacket {
        request_id,
        time_ns: unix_time_ns(),
    };
    peer.send_packet(&ack).await
}

fn log_fan_out(what: &str, code: StrategyCode, failures: &[(PeerId, PeerError)]) {
    for (id, err) in failures {
        warn!("sending {what} of strategy {code} to peer {id} failed: {err}");
    }
}
