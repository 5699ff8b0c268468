// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared helpers for unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::network::{Connection, NetworkError, localhost_ip_sockaddr};
use crate::peer::{Peer, PeerSet};
use crate::protocol::{DisseminatePacket, MessageCode, decode};
use crate::state::State;
use crate::strategy::{Delivery, StrategyContext};
use crate::PeerId;

/// Connection that records everything sent and never receives anything.
pub struct RecordingConnection {
    datagram: bool,
    sent: Mutex<Vec<(u64, Bytes)>>,
}

impl RecordingConnection {
    pub fn new(datagram: bool) -> Self {
        Self {
            datagram,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Codes of all messages sent so far, in order.
    pub fn sent_codes(&self) -> Vec<u64> {
        self.sent.lock().unwrap().iter().map(|(code, _)| *code).collect()
    }

    /// All messages sent so far.
    pub fn sent(&self) -> Vec<(u64, Bytes)> {
        self.sent.lock().unwrap().clone()
    }

    /// All dissemination packets sent so far, decoded.
    pub fn disseminate_packets(&self) -> Vec<DisseminatePacket> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(code, _)| *code == u64::from(MessageCode::DisseminateRequest))
            .map(|(_, bytes)| decode(bytes).unwrap())
            .collect()
    }
}

#[async_trait]
impl Connection for RecordingConnection {
    async fn send(&self, code: u64, payload: Bytes) -> Result<(), NetworkError> {
        self.sent.lock().unwrap().push((code, payload));
        Ok(())
    }

    async fn receive(&self) -> Result<(u64, Bytes), NetworkError> {
        futures::future::pending().await
    }

    fn is_datagram(&self) -> bool {
        self.datagram
    }

    async fn close(&self) {}
}

/// Creates a peer set of `n` slots with every slot but `local` connected.
///
/// The returned connections are indexed by peer, the one of `local` is unused.
pub fn recording_peers(n: usize, local: PeerId) -> (Arc<PeerSet>, Vec<Arc<RecordingConnection>>) {
    let peers = Arc::new(PeerSet::new(n));
    let conns: Vec<_> = (0..n)
        .map(|_| Arc::new(RecordingConnection::new(false)))
        .collect();
    for (id, conn) in conns.iter().enumerate().filter(|&(id, _)| id != local) {
        let addr = localhost_ip_sockaddr(id as u16);
        let peer = Peer::new(id, addr, conn.clone());
        peers.insert(Arc::new(peer)).unwrap();
    }
    (peers, conns)
}

/// Strategy context with code 0 for node `local`.
pub fn test_context(local: PeerId, peers: Arc<PeerSet>) -> StrategyContext {
    let state = Arc::new(State::new(peers.len()));
    StrategyContext {
        code: 0,
        local_id: local,
        peers,
        state,
    }
}

/// Whole-payload delivery of request 1.
pub fn delivery(original_sender: PeerId, from: PeerId, hop: u8, max_peers: usize) -> Delivery {
    Delivery {
        request_id: 1,
        hop,
        original_sender,
        from,
        max_peers,
        data: Bytes::from_static(b"data"),
        partial: false,
        seq: 0,
        total: 0,
    }
}

/// Relative latency rows for peers grouped into consecutive clusters of the given sizes.
///
/// Peers of the same cluster are 5 ms apart. Peers of clusters `a` and `b`
/// are `80 + 10 * |a - b|` ms apart.
pub fn clustered_latencies(sizes: &[usize]) -> Vec<Vec<Duration>> {
    let cluster_of: Vec<usize> = sizes
        .iter()
        .enumerate()
        .flat_map(|(c, &size)| std::iter::repeat_n(c, size))
        .collect();
    let n = cluster_of.len();
    (0..n)
        .map(|i| {
            (0..n)
                .map(|j| {
                    if i == j {
                        Duration::ZERO
                    } else if cluster_of[i] == cluster_of[j] {
                        Duration::from_millis(5)
                    } else {
                        let distance = cluster_of[i].abs_diff(cluster_of[j]) as u64;
                        Duration::from_millis(80 + 10 * distance)
                    }
                })
                .collect()
        })
        .collect()
}
