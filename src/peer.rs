// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Peer sessions.
//!
//! A [`Peer`] owns exactly one [`Connection`] and correlates outbound requests
//! with their replies. Every request carries a random [`RequestId`] and waits
//! on a single-slot rendezvous for at most [`REQUEST_TIMEOUT`].
//!
//! The [`PeerSet`] is the index-addressed list of all peers, shared between
//! the engine and the strategies.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};

use crate::network::{Connection, NetworkError};
use crate::protocol::{
    self, AckDataPacket, DataPacket, DisseminatePacket, GraphReadyPacket, LatencyArrayPacket,
    Packet, PingPacket, PongPacket, ProtocolError, TriggerRequestPacket, UpdateTcpSocketPacket,
};
use crate::{PeerId, RequestId, StrategyCode};

/// Time a request waits for its reply.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for peer session operations.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),
    #[error("peer index {id} out of range for {peers} peers")]
    OutOfRange { id: PeerId, peers: usize },
    #[error("request timed out")]
    Timeout,
    #[error("peer disconnected while waiting for reply")]
    Disconnected,
    #[error("unexpected reply type")]
    UnexpectedReply,
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
}

/// A reply that completes an outstanding request.
#[derive(Clone, Debug)]
pub enum Response {
    Pong(PongPacket),
    AckData(AckDataPacket),
}

impl Response {
    const fn request_id(&self) -> RequestId {
        match self {
            Self::Pong(pong) => pong.request_id,
            Self::AckData(ack) => ack.request_id,
        }
    }
}

struct PendingRequest {
    sender: oneshot::Sender<Response>,
    issued_at: tokio::time::Instant,
}

/// Result of a [`Peer::send_data`] round trip.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct DataTransfer {
    /// Remote wall-clock time at which the data was acknowledged.
    pub remote_time_ns: u64,
    /// Time spent handing the data to the transport.
    pub dispatch: Duration,
    /// Time from dispatch until the acknowledgement arrived.
    pub round_trip: Duration,
}

/// Session with a single remote peer.
pub struct Peer {
    id: PeerId,
    address: SocketAddr,
    connection: Arc<dyn Connection>,
    requests: Mutex<HashMap<RequestId, PendingRequest>>,
    connected: AtomicBool,
}

impl Peer {
    /// Creates a new connected session over `connection`.
    pub fn new(id: PeerId, address: SocketAddr, connection: Arc<dyn Connection>) -> Self {
        Self {
            id,
            address,
            connection,
            requests: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub const fn id(&self) -> PeerId {
        self.id
    }

    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Receives the next raw message from this peer's connection.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError`] if the connection fails or was closed.
    pub async fn receive(&self) -> Result<(u64, Bytes), NetworkError> {
        self.connection.receive().await
    }

    /// Sends a packet without waiting for any reply.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::NotConnected`] if the peer was disconnected and
    /// [`PeerError::Network`] if the transport fails.
    pub async fn send_packet<P: Packet>(&self, packet: &P) -> Result<(), PeerError> {
        if !self.is_connected() {
            return Err(PeerError::NotConnected(self.id));
        }
        self.connection
            .send(P::CODE.into(), protocol::encode(packet))
            .await?;
        Ok(())
    }

    /// Registers a rendezvous slot under `request_id` and sends the packet.
    ///
    /// Stale slots older than twice [`REQUEST_TIMEOUT`] are swept first.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError`] if sending fails, in which case the slot is removed again.
    pub async fn dispatch_request<P: Packet>(
        &self,
        request_id: RequestId,
        packet: &P,
    ) -> Result<oneshot::Receiver<Response>, PeerError> {
        let (sender, receiver) = oneshot::channel();
        {
            let mut requests = self.requests.lock().await;
            let now = tokio::time::Instant::now();
            requests.retain(|_, req| now.duration_since(req.issued_at) < 2 * REQUEST_TIMEOUT);
            let pending = PendingRequest {
                sender,
                issued_at: now,
            };
            requests.insert(request_id, pending);
        }
        if let Err(err) = self.send_packet(packet).await {
            self.requests.lock().await.remove(&request_id);
            return Err(err);
        }
        Ok(receiver)
    }

    /// Delivers a reply to the matching rendezvous slot and removes it.
    ///
    /// Returns `false` if no request with this id is outstanding.
    pub async fn dispatch_response(&self, response: Response) -> bool {
        let request_id = response.request_id();
        let Some(pending) = self.requests.lock().await.remove(&request_id) else {
            warn!(
                "peer {}: reply for unknown request {request_id:#x}, discarding",
                self.id
            );
            return false;
        };
        if pending.sender.send(response).is_err() {
            debug!(
                "peer {}: reply for request {request_id:#x} arrived after timeout",
                self.id
            );
        }
        true
    }

    /// Races a rendezvous slot against [`REQUEST_TIMEOUT`].
    async fn await_response(receiver: oneshot::Receiver<Response>) -> Result<Response, PeerError> {
        match tokio::time::timeout(REQUEST_TIMEOUT, receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(PeerError::Disconnected),
            Err(_) => Err(PeerError::Timeout),
        }
    }

    async fn request<P: Packet>(
        &self,
        request_id: RequestId,
        packet: &P,
    ) -> Result<Response, PeerError> {
        let receiver = self.dispatch_request(request_id, packet).await?;
        Self::await_response(receiver).await
    }

    async fn request_ack<P: Packet>(
        &self,
        request_id: RequestId,
        packet: &P,
    ) -> Result<AckDataPacket, PeerError> {
        match self.request(request_id, packet).await? {
            Response::AckData(ack) => Ok(ack),
            Response::Pong(_) => Err(PeerError::UnexpectedReply),
        }
    }

    /// Sends a ping and waits for the pong.
    ///
    /// Returns the remote wall-clock time in the pong.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Timeout`] if no pong arrives in time.
    pub async fn send_ping(&self) -> Result<u64, PeerError> {
        let request_id = rand::random();
        match self.request(request_id, &PingPacket { request_id }).await? {
            Response::Pong(pong) => Ok(pong.time_ns),
            Response::AckData(_) => Err(PeerError::UnexpectedReply),
        }
    }

    /// Sends an opaque data blob and waits for its acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Timeout`] if no acknowledgement arrives in time.
    pub async fn send_data(&self, data: Bytes) -> Result<DataTransfer, PeerError> {
        let request_id = rand::random();
        let start = Instant::now();
        let receiver = self
            .dispatch_request(request_id, &DataPacket { request_id, data })
            .await?;
        let dispatch = start.elapsed();
        let sent = Instant::now();
        let Response::AckData(ack) = Self::await_response(receiver).await? else {
            return Err(PeerError::UnexpectedReply);
        };
        Ok(DataTransfer {
            remote_time_ns: ack.time_ns,
            dispatch,
            round_trip: sent.elapsed(),
        })
    }

    /// Sends the local latency row for `strategy` and waits for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Timeout`] if no acknowledgement arrives in time.
    pub async fn send_latency_array(
        &self,
        strategy: StrategyCode,
        latencies: &[Duration],
    ) -> Result<(), PeerError> {
        let request_id = rand::random();
        let packet = LatencyArrayPacket {
            request_id,
            strategy,
            latencies_ns: latencies.iter().map(|l| l.as_nanos() as u64).collect(),
        };
        self.request_ack(request_id, &packet).await?;
        Ok(())
    }

    /// Asks the peer to sample and broadcast its latency row for `strategy`.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Timeout`] if no acknowledgement arrives in time.
    pub async fn send_trigger_request(&self, strategy: StrategyCode) -> Result<(), PeerError> {
        let request_id = rand::random();
        let packet = TriggerRequestPacket {
            request_id,
            strategy,
        };
        self.request_ack(request_id, &packet).await?;
        Ok(())
    }

    /// Tells the peer that the local graph for `strategy` is constructed.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Timeout`] if no acknowledgement arrives in time.
    pub async fn send_graph_ready(&self, strategy: StrategyCode) -> Result<(), PeerError> {
        let request_id = rand::random();
        let packet = GraphReadyPacket {
            request_id,
            strategy,
        };
        self.request_ack(request_id, &packet).await?;
        Ok(())
    }

    /// Asks the peer to retune its socket buffers.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError`] if sending fails.
    pub async fn send_update_tcp_socket(
        &self,
        buffer_size: u64,
        reset: bool,
    ) -> Result<(), PeerError> {
        self.send_packet(&UpdateTcpSocketPacket { buffer_size, reset })
            .await
    }

    /// Sends one dissemination packet, chunked if the connection requires it.
    ///
    /// Fire-and-forget, no reply is expected.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError`] if chunking or sending any chunk fails.
    pub async fn disseminate_request(&self, packet: DisseminatePacket) -> Result<(), PeerError> {
        if !self.connection.is_datagram() {
            return self.send_packet(&packet).await;
        }
        for chunk in packet.into_chunks()? {
            self.send_packet(&chunk).await?;
        }
        Ok(())
    }

    /// Marks the peer disconnected and fails all pending requests.
    pub async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            debug!("peer {} disconnected", self.id);
        }
        self.connection.close().await;
        // dropping the senders fails every waiting request
        self.requests.lock().await.clear();
    }
}

/// Index-addressed list of peer sessions.
///
/// A slot stays empty until a peer registers for it.
pub struct PeerSet {
    slots: RwLock<Vec<Option<Arc<Peer>>>>,
}

impl PeerSet {
    /// Creates a set with `count` empty slots.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            slots: RwLock::new(vec![None; count]),
        }
    }

    /// Total number of slots, including the local node and empty slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().expect("peer lock should not be poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the session in slot `id`, connected or not.
    #[must_use]
    pub fn get(&self, id: PeerId) -> Option<Arc<Peer>> {
        let slots = self.slots.read().expect("peer lock should not be poisoned");
        slots.get(id).cloned().flatten()
    }

    /// Returns the session in slot `id` if it is connected.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::OutOfRange`] or [`PeerError::NotConnected`].
    pub fn connected(&self, id: PeerId) -> Result<Arc<Peer>, PeerError> {
        let peers = self.len();
        if id >= peers {
            return Err(PeerError::OutOfRange { id, peers });
        }
        self.get(id)
            .filter(|peer| peer.is_connected())
            .ok_or(PeerError::NotConnected(id))
    }

    /// Places `peer` in its slot, replacing any previous session.
    ///
    /// Returns the replaced session, if any.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::OutOfRange`] if the peer's index has no slot.
    pub fn insert(&self, peer: Arc<Peer>) -> Result<Option<Arc<Peer>>, PeerError> {
        let mut slots = self.slots.write().expect("peer lock should not be poisoned");
        let peers = slots.len();
        let slot = slots.get_mut(peer.id()).ok_or(PeerError::OutOfRange {
            id: peer.id(),
            peers,
        })?;
        Ok(slot.replace(peer))
    }

    /// Indices of all currently connected peers, in ascending order.
    #[must_use]
    pub fn connected_ids(&self) -> Vec<PeerId> {
        let slots = self.slots.read().expect("peer lock should not be poisoned");
        slots
            .iter()
            .flatten()
            .filter(|peer| peer.is_connected())
            .map(|peer| peer.id())
            .collect()
    }
}
