// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Latency sampling and the shared latency matrix.
//!
//! Each node samples round-trip times, either to every other peer
//! ([`LatencyType::Relative`]) or to a fixed set of external servers
//! ([`LatencyType::Fixed`]), and exchanges the resulting row with all peers.
//! Once every row is in, graph-based strategies construct their topology
//! from the [`LatencyMatrix`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;

use crate::PeerId;

/// Latency recorded for a fixed server that never answered.
pub const UNREACHABLE_LATENCY: Duration = Duration::from_secs(10_000);

/// Which kind of latency vector a strategy builds its graph from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LatencyType {
    /// Latency from each node to every other node.
    Relative,
    /// Latency from each node to a fixed set of external servers.
    Fixed,
}

/// Error type for latency matrix and graph construction.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("latency matrix is not complete yet")]
    LatencyMatrixNotReady,
    #[error("peer {peer} reported non-zero latency {latency:?} to itself")]
    InvalidSelfLatency { peer: PeerId, latency: Duration },
    #[error("latency rows have inconsistent lengths")]
    InconsistentDimensions,
    #[error("cannot build a graph over {0} peers")]
    TooFewPeers(usize),
}

/// Round-trip statistics for one address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingStatistics {
    pub min_rtt: Duration,
    pub avg_rtt: Duration,
    pub max_rtt: Duration,
    pub std_dev_rtt: Duration,
    pub packets_sent: u32,
    pub packets_received: u32,
}

impl PingStatistics {
    /// Summarizes the given successful samples out of `sent` attempts.
    #[must_use]
    pub fn from_samples(samples: &[Duration], sent: u32) -> Self {
        if samples.is_empty() {
            return Self {
                packets_sent: sent,
                ..Self::default()
            };
        }
        let count = samples.len() as u32;
        let total: Duration = samples.iter().sum();
        let avg = total / count;
        let variance = samples
            .iter()
            .map(|s| {
                let diff = s.as_secs_f64() - avg.as_secs_f64();
                diff * diff
            })
            .sum::<f64>()
            / f64::from(count);
        Self {
            min_rtt: samples.iter().copied().min().unwrap_or_default(),
            avg_rtt: avg,
            max_rtt: samples.iter().copied().max().unwrap_or_default(),
            std_dev_rtt: Duration::from_secs_f64(variance.sqrt()),
            packets_sent: sent,
            packets_received: count,
        }
    }
}

/// Produces round-trip time samples for an address.
#[async_trait]
pub trait LatencySampler: Send + Sync {
    async fn sample(&self, address: SocketAddr) -> PingStatistics;
}

/// Serves round-trip times from a fixed table.
///
/// Addresses missing from the table look unreachable.
pub struct StaticLatencySampler {
    rtts: HashMap<SocketAddr, Duration>,
}

impl StaticLatencySampler {
    /// Number of samples reported per lookup.
    const SAMPLES: u32 = 5;

    pub fn new(rtts: impl IntoIterator<Item = (SocketAddr, Duration)>) -> Self {
        Self {
            rtts: rtts.into_iter().collect(),
        }
    }
}

#[async_trait]
impl LatencySampler for StaticLatencySampler {
    async fn sample(&self, address: SocketAddr) -> PingStatistics {
        match self.rtts.get(&address) {
            Some(&rtt) => {
                let samples = [rtt; Self::SAMPLES as usize];
                PingStatistics::from_samples(&samples, Self::SAMPLES)
            }
            None => PingStatistics::from_samples(&[], Self::SAMPLES),
        }
    }
}

/// Measures round-trip times by timing TCP connection establishment.
pub struct TcpConnectSampler {
    count: u32,
    timeout: Duration,
}

impl Default for TcpConnectSampler {
    fn default() -> Self {
        Self {
            count: 5,
            timeout: Duration::from_secs(1),
        }
    }
}

impl TcpConnectSampler {
    #[must_use]
    pub const fn new(count: u32, timeout: Duration) -> Self {
        Self { count, timeout }
    }
}

#[async_trait]
impl LatencySampler for TcpConnectSampler {
    async fn sample(&self, address: SocketAddr) -> PingStatistics {
        let mut samples = Vec::with_capacity(self.count as usize);
        for _ in 0..self.count {
            let start = Instant::now();
            if let Ok(Ok(stream)) =
                tokio::time::timeout(self.timeout, TcpStream::connect(address)).await
            {
                samples.push(start.elapsed());
                drop(stream);
            }
        }
        PingStatistics::from_samples(&samples, self.count)
    }
}

/// Turns ping statistics into a latency row of average round-trip times.
///
/// In [`LatencyType::Fixed`] mode an unanswered server is recorded as
/// [`UNREACHABLE_LATENCY`], so that rows stay complete.
#[must_use]
pub fn filter_avg_rtt(stats: &[PingStatistics], latency_type: LatencyType) -> Vec<Duration> {
    stats
        .iter()
        .map(|s| match latency_type {
            LatencyType::Fixed if s.avg_rtt.is_zero() => UNREACHABLE_LATENCY,
            _ => s.avg_rtt,
        })
        .collect()
}

/// Rows of latency vectors, one per peer.
///
/// Row `i` holds what node `i` observed. A row is empty until it arrives.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LatencyMatrix {
    rows: Vec<Vec<Duration>>,
}

impl LatencyMatrix {
    /// Creates a matrix with `peers` empty rows.
    #[must_use]
    pub fn new(peers: usize) -> Self {
        Self {
            rows: vec![Vec::new(); peers],
        }
    }

    /// Builds a matrix from complete rows.
    #[must_use]
    pub const fn from_rows(rows: Vec<Vec<Duration>>) -> Self {
        Self { rows }
    }

    /// Number of rows.
    #[must_use]
    pub fn peers(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn rows(&self) -> &[Vec<Duration>] {
        &self.rows
    }

    /// Stores the row observed by `peer`, ignoring out-of-range peers.
    pub fn set_row(&mut self, peer: PeerId, row: Vec<Duration>) {
        if let Some(slot) = self.rows.get_mut(peer) {
            *slot = row;
        }
    }

    /// Whether the matrix is complete enough to construct a graph.
    ///
    /// For [`LatencyType::Relative`], every row must have one entry per peer,
    /// with a zero diagonal and non-zero entries elsewhere.
    /// For [`LatencyType::Fixed`], every row must have the same, non-zero
    /// number of entries, all of them non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::InvalidSelfLatency`] if any row reports a
    /// non-zero latency to itself. This is checked before completeness.
    pub fn is_ready(&self, latency_type: LatencyType) -> Result<bool, GraphError> {
        match latency_type {
            LatencyType::Relative => {
                for (peer, row) in self.rows.iter().enumerate() {
                    match row.get(peer) {
                        Some(&latency) if !latency.is_zero() => {
                            return Err(GraphError::InvalidSelfLatency { peer, latency });
                        }
                        _ => {}
                    }
                }
                let peers = self.rows.len();
                Ok(self.rows.iter().enumerate().all(|(i, row)| {
                    row.len() == peers
                        && row
                            .iter()
                            .enumerate()
                            .all(|(j, latency)| i == j || !latency.is_zero())
                }))
            }
            LatencyType::Fixed => {
                let Some(servers) = self.rows.first().map(Vec::len) else {
                    return Ok(false);
                };
                Ok(servers > 0
                    && self.rows.iter().all(|row| {
                        row.len() == servers && row.iter().all(|latency| !latency.is_zero())
                    }))
            }
        }
    }
}
