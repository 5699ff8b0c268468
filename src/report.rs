// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Dissemination results.

use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::PeerId;

/// What one target peer reported about a dissemination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct IndividualDisseminateResult {
    /// Peer that received the data.
    pub sender: PeerId,
    /// Peer it first received data from.
    pub relay: PeerId,
    pub hop: u8,
    /// Reporter's wall-clock reception time.
    pub reception_time: SystemTime,
    /// Whether all chunks were received, as opposed to half of them.
    pub full: bool,
    /// Set if no report arrived before the collection window closed.
    pub error_timeout: bool,
}

impl IndividualDisseminateResult {
    /// Placeholder for a peer that never reported.
    #[must_use]
    pub const fn timed_out(sender: PeerId) -> Self {
        Self {
            sender,
            relay: sender,
            hop: 0,
            reception_time: SystemTime::UNIX_EPOCH,
            full: false,
            error_timeout: true,
        }
    }

    /// Reception delay relative to `start`, if this peer reported at all.
    ///
    /// Clock skew between peers may make a reception appear before `start`,
    /// such delays are clamped to zero.
    #[must_use]
    pub fn delay_since(&self, start: SystemTime) -> Option<Duration> {
        if self.error_timeout {
            return None;
        }
        Some(
            self.reception_time
                .duration_since(start)
                .unwrap_or(Duration::ZERO),
        )
    }
}

/// Everything collected for one dissemination.
#[derive(Clone, Debug, Serialize)]
pub struct DisseminationResult {
    pub size: usize,
    pub max_peers: usize,
    pub start_time: SystemTime,
    /// One entry per target peer, indexed by peer.
    pub results: Vec<IndividualDisseminateResult>,
}

/// Aggregated reception delays of a [`DisseminationResult`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DisseminationSummary {
    pub received: usize,
    pub full: usize,
    pub timed_out: usize,
    pub min: Option<Duration>,
    pub median: Option<Duration>,
    pub two_thirds: Option<Duration>,
    pub max: Option<Duration>,
}

impl DisseminationResult {
    /// Number of peers that never reported.
    #[must_use]
    pub fn timeouts(&self) -> usize {
        self.results.iter().filter(|r| r.error_timeout).count()
    }

    /// Summarizes the reception delays over all peers that reported.
    #[must_use]
    pub fn summary(&self) -> DisseminationSummary {
        let mut delays: Vec<_> = self
            .results
            .iter()
            .filter_map(|r| r.delay_since(self.start_time))
            .collect();
        delays.sort_unstable();
        let n = delays.len();
        DisseminationSummary {
            received: n,
            full: self.results.iter().filter(|r| r.full).count(),
            timed_out: self.timeouts(),
            min: delays.first().copied(),
            median: delays.get(n / 2).copied(),
            two_thirds: delays.get(2 * n / 3).copied(),
            max: delays.last().copied(),
        }
    }
}
