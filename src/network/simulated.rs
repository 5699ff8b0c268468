// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Simulated network links.
//!
//! This module provides an in-memory implementation of [`Connection`], which
//! may be used for local testing and simulations. Pairs of
//! [`SimulatedConnection`]s are created by a [`SimulatedNetworkCore`], which
//! stores virtual latencies for all links between any pair of nodes.
//! Messages are delayed accordingly, but never lost or reordered.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Connection, NetworkError};
use crate::PeerId;

struct SimulatedPacket {
    code: u64,
    payload: Bytes,
    deliver_at: Instant,
}

/// Simulated network core, which links nodes together.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use netdiag::network::SimulatedNetworkCore;
///
/// let core = SimulatedNetworkCore::default().with_default_latency(Duration::from_millis(5));
/// core.set_latency(0, 1, Duration::from_millis(20));
/// assert_eq!(core.latency(1, 0), Duration::from_millis(20));
/// assert_eq!(core.latency(0, 2), Duration::from_millis(5));
/// ```
pub struct SimulatedNetworkCore {
    /// One-way latency between each configured pair of nodes.
    latencies: RwLock<HashMap<(PeerId, PeerId), Duration>>,
    /// Fallback latency to use for any link that is not configured.
    default_latency: Duration,
    /// Whether links created by this core are flagged datagram-oriented.
    datagram: bool,
}

impl Default for SimulatedNetworkCore {
    fn default() -> Self {
        Self {
            latencies: RwLock::new(HashMap::new()),
            default_latency: Duration::from_millis(10),
            datagram: false,
        }
    }
}

impl SimulatedNetworkCore {
    /// Turns this instance into a new instance with a different default latency.
    #[must_use]
    pub const fn with_default_latency(mut self, latency: Duration) -> Self {
        self.default_latency = latency;
        self
    }

    /// Turns this instance into a new instance that creates datagram-oriented links.
    #[must_use]
    pub const fn with_datagram_mode(mut self, datagram: bool) -> Self {
        self.datagram = datagram;
        self
    }

    /// Sets the latency between two nodes, symmetric in both directions.
    pub fn set_latency(&self, node1: PeerId, node2: PeerId, latency: Duration) {
        let mut guard = self
            .latencies
            .write()
            .expect("latency lock should not be poisoned");
        guard.insert((node1, node2), latency);
        guard.insert((node2, node1), latency);
    }

    /// Returns the one-way latency from `from` to `to`.
    ///
    /// The latency from a node to itself is always zero.
    #[must_use]
    pub fn latency(&self, from: PeerId, to: PeerId) -> Duration {
        if from == to {
            return Duration::ZERO;
        }
        let guard = self
            .latencies
            .read()
            .expect("latency lock should not be poisoned");
        *guard.get(&(from, to)).unwrap_or(&self.default_latency)
    }

    /// Creates a linked pair of connections between nodes `a` and `b`.
    ///
    /// The first connection is `a`'s end of the link, the second is `b`'s.
    #[must_use]
    pub fn connect(&self, a: PeerId, b: PeerId) -> (SimulatedConnection, SimulatedConnection) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let end_a = SimulatedConnection {
            sender: a_tx,
            receiver: Mutex::new(a_rx),
            latency: self.latency(a, b),
            datagram: self.datagram,
            closed: closed.clone(),
        };
        let end_b = SimulatedConnection {
            sender: b_tx,
            receiver: Mutex::new(b_rx),
            latency: self.latency(b, a),
            datagram: self.datagram,
            closed,
        };
        (end_a, end_b)
    }
}

/// One end of a simulated link.
pub struct SimulatedConnection {
    sender: mpsc::UnboundedSender<SimulatedPacket>,
    receiver: Mutex<mpsc::UnboundedReceiver<SimulatedPacket>>,
    /// One-way latency applied to messages sent from this end.
    latency: Duration,
    datagram: bool,
    /// Shared by both ends, closing either closes the link.
    closed: CancellationToken,
}

#[async_trait]
impl Connection for SimulatedConnection {
    async fn send(&self, code: u64, payload: Bytes) -> Result<(), NetworkError> {
        if self.closed.is_cancelled() {
            return Err(NetworkError::ConnectionClosed);
        }
        let packet = SimulatedPacket {
            code,
            payload,
            deliver_at: Instant::now() + self.latency,
        };
        self.sender
            .send(packet)
            .map_err(|_| NetworkError::ConnectionClosed)
    }

    async fn receive(&self) -> Result<(u64, Bytes), NetworkError> {
        let mut receiver = self.receiver.lock().await;
        let packet = tokio::select! {
            () = self.closed.cancelled() => return Err(NetworkError::ConnectionClosed),
            packet = receiver.recv() => packet.ok_or(NetworkError::ConnectionClosed)?,
        };
        tokio::select! {
            () = self.closed.cancelled() => Err(NetworkError::ConnectionClosed),
            () = tokio::time::sleep_until(packet.deliver_at) => Ok((packet.code, packet.payload)),
        }
    }

    fn is_datagram(&self) -> bool {
        self.datagram
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}
