// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Node state shared by the engine and all strategies.
//!
//! Holds the latency matrices, the receiver-side chunk tracking for
//! disseminations, the sender-side report slots, and cached ping results.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bitvec::vec::BitVec;
use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use moka::future::Cache;
use tokio::sync::mpsc;

use crate::latency::{LatencyMatrix, LatencyType, PingStatistics};
use crate::protocol::{DisseminatePacket, ProtocolError};
use crate::report::IndividualDisseminateResult;
use crate::{PeerId, RequestId};

/// Time the originator waits for reports of a dissemination.
pub const REPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum number of disseminations tracked on the receiver side.
const MAX_TRACKED_DISSEMINATIONS: u64 = 65_536;
/// Tracking records are evicted after being idle for this long.
const TRACKING_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Receiver-side record of the chunks of one dissemination.
#[derive(Debug)]
pub struct ChunkInfo {
    seq_received: BitVec,
    total_received: usize,
    partial: bool,
    /// Peer the first accepted packet came from.
    relay: PeerId,
    /// Received chunk payloads, kept only until reassembly.
    chunks: Vec<Option<Bytes>>,
}

impl ChunkInfo {
    fn new(total: u16, partial: bool, relay: PeerId) -> Self {
        let len = usize::from(total).max(1);
        Self {
            seq_received: BitVec::repeat(false, len),
            total_received: 0,
            partial,
            relay,
            chunks: vec![None; len],
        }
    }

    /// Number of chunks the payload consists of.
    #[must_use]
    pub fn expected(&self) -> usize {
        self.seq_received.len()
    }

    #[must_use]
    pub const fn total_received(&self) -> usize {
        self.total_received
    }

    /// Whether some chunks are still missing.
    #[must_use]
    pub const fn is_partial(&self) -> bool {
        self.partial
    }

    /// Records chunk `seq`.
    ///
    /// Returns `false` if the chunk was already recorded.
    fn record(&mut self, seq: u16, data: Bytes) -> Result<bool, ProtocolError> {
        let index = usize::from(seq);
        if index >= self.expected() {
            return Err(ProtocolError::InvalidSequence {
                seq,
                total: self.expected() as u16,
            });
        }
        if self.seq_received[index] {
            return Ok(false);
        }
        self.seq_received.set(index, true);
        self.total_received += 1;
        self.chunks[index] = Some(data);
        if self.total_received == self.expected() {
            self.partial = false;
        }
        Ok(true)
    }

    /// Concatenates all chunks in sequence order, releasing them.
    fn reassemble(&mut self) -> Bytes {
        let chunks = std::mem::take(&mut self.chunks);
        if let [Some(single)] = chunks.as_slice() {
            return single.clone();
        }
        let len = chunks.iter().flatten().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(len);
        for chunk in chunks.iter().flatten() {
            buf.extend_from_slice(chunk);
        }
        buf.freeze()
    }
}

/// Result of offering a packet to the chunk tracking.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// Already seen, nothing to do.
    Duplicate,
    /// Newly accepted packet.
    Accepted(ChunkProgress),
}

/// State of a dissemination after accepting one more packet.
#[derive(Debug)]
pub struct ChunkProgress {
    pub received: usize,
    pub expected: usize,
    /// Peer the first accepted packet of this dissemination came from.
    pub relay: PeerId,
    /// The whole payload, present exactly once, when the last chunk arrives.
    pub reassembled: Option<Bytes>,
}

impl ChunkProgress {
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.received == self.expected
    }

    /// Whether this packet made exactly half of a multi-chunk payload available.
    #[must_use]
    pub const fn is_half_complete(&self) -> bool {
        self.expected > 1 && self.received == self.expected.div_ceil(2)
    }
}

struct ReportSlot {
    sender: mpsc::UnboundedSender<IndividualDisseminateResult>,
    receiver: Option<mpsc::UnboundedReceiver<IndividualDisseminateResult>>,
}

/// State shared by the engine and all strategies of one node.
pub struct State {
    relative_latency: RwLock<LatencyMatrix>,
    fixed_latency: RwLock<LatencyMatrix>,
    /// Cached local ping results, filled once all peers answered.
    ping_results: tokio::sync::Mutex<Option<Vec<PingStatistics>>>,
    received_packets: Cache<RequestId, Arc<Mutex<ChunkInfo>>>,
    received_reports: Mutex<HashMap<RequestId, ReportSlot>>,
}

impl State {
    /// Creates empty state for a cluster of `peers` nodes.
    #[must_use]
    pub fn new(peers: usize) -> Self {
        Self {
            relative_latency: RwLock::new(LatencyMatrix::new(peers)),
            fixed_latency: RwLock::new(LatencyMatrix::new(peers)),
            ping_results: tokio::sync::Mutex::new(None),
            received_packets: Cache::builder()
                .max_capacity(MAX_TRACKED_DISSEMINATIONS)
                .time_to_idle(TRACKING_IDLE_TIMEOUT)
                .build(),
            received_reports: Mutex::new(HashMap::new()),
        }
    }

    fn matrix(&self, latency_type: LatencyType) -> &RwLock<LatencyMatrix> {
        match latency_type {
            LatencyType::Relative => &self.relative_latency,
            LatencyType::Fixed => &self.fixed_latency,
        }
    }

    /// Stores the latency row observed by `peer`.
    pub fn set_latency_row(&self, latency_type: LatencyType, peer: PeerId, row: Vec<Duration>) {
        self.matrix(latency_type)
            .write()
            .expect("latency lock should not be poisoned")
            .set_row(peer, row);
    }

    /// Returns a snapshot of the latency matrix of the given type.
    #[must_use]
    pub fn latency_matrix(&self, latency_type: LatencyType) -> LatencyMatrix {
        self.matrix(latency_type)
            .read()
            .expect("latency lock should not be poisoned")
            .clone()
    }

    /// Returns the cached local ping results, or computes and caches them.
    ///
    /// Results are cached only if `is_complete` accepts them.
    /// Concurrent callers wait for a single computation.
    pub async fn cached_ping_results<F, Fut>(
        &self,
        compute: F,
        is_complete: impl FnOnce(&[PingStatistics]) -> bool,
    ) -> Vec<PingStatistics>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Vec<PingStatistics>>,
    {
        let mut cached = self.ping_results.lock().await;
        if let Some(results) = cached.as_ref() {
            return results.clone();
        }
        let results = compute().await;
        if is_complete(&results) {
            *cached = Some(results.clone());
        }
        results
    }

    /// Offers a received dissemination packet to the chunk tracking.
    ///
    /// A packet is a duplicate if a non-partial packet with the same request id
    /// was seen before, or if its chunk was already recorded.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidSequence`] if the chunk index is out of range.
    pub async fn record_chunk(
        &self,
        packet: &DisseminatePacket,
        from: PeerId,
    ) -> Result<ChunkOutcome, ProtocolError> {
        let entry = self
            .received_packets
            .entry(packet.request_id)
            .or_insert_with(async {
                Arc::new(Mutex::new(ChunkInfo::new(packet.total, packet.partial, from)))
            })
            .await;
        let is_new = entry.is_fresh();
        let info = entry.into_value();
        let mut info = info.lock().expect("chunk lock should not be poisoned");
        if !is_new && !packet.partial {
            trace!("duplicate dissemination {:#x}", packet.request_id);
            return Ok(ChunkOutcome::Duplicate);
        }
        if !info.record(packet.seq, packet.data.clone())? {
            trace!(
                "duplicate chunk {} of dissemination {:#x}",
                packet.seq, packet.request_id
            );
            return Ok(ChunkOutcome::Duplicate);
        }
        let reassembled = (!info.is_partial()).then(|| info.reassemble());
        Ok(ChunkOutcome::Accepted(ChunkProgress {
            received: info.total_received(),
            expected: info.expected(),
            relay: info.relay,
            reassembled,
        }))
    }

    /// Opens the report slot for a new dissemination.
    pub fn open_report_slot(&self, request_id: RequestId) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let slot = ReportSlot {
            sender,
            receiver: Some(receiver),
        };
        self.received_reports
            .lock()
            .expect("report lock should not be poisoned")
            .insert(request_id, slot);
    }

    /// Removes the report slot, dropping any reports not yet collected.
    pub fn close_report_slot(&self, request_id: RequestId) {
        self.received_reports
            .lock()
            .expect("report lock should not be poisoned")
            .remove(&request_id);
    }

    /// Hands a report to the slot of its dissemination.
    ///
    /// Returns `false` if there is no open slot for `request_id`.
    pub fn deliver_report(&self, request_id: RequestId, result: IndividualDisseminateResult) -> bool {
        let reports = self
            .received_reports
            .lock()
            .expect("report lock should not be poisoned");
        reports
            .get(&request_id)
            .is_some_and(|slot| slot.sender.send(result).is_ok())
    }

    /// Collects reports for `request_id` for at most [`REPORT_TIMEOUT`].
    ///
    /// Returns one entry per peer `0..max_peers`, indexed by reporting peer.
    /// A full report replaces a half report, never the reverse.
    /// Returns early once every entry holds a full report.
    /// Peers that never reported get a timeout entry.
    /// The slot is removed afterwards.
    pub async fn collect_reports(
        &self,
        request_id: RequestId,
        max_peers: usize,
    ) -> Vec<IndividualDisseminateResult> {
        let receiver = self
            .received_reports
            .lock()
            .expect("report lock should not be poisoned")
            .get_mut(&request_id)
            .and_then(|slot| slot.receiver.take());

        let mut results: Vec<Option<IndividualDisseminateResult>> = vec![None; max_peers];
        if let Some(mut receiver) = receiver {
            let deadline = tokio::time::Instant::now() + REPORT_TIMEOUT;
            while !results.iter().all(|r| r.is_some_and(|r| r.full)) {
                let Ok(Some(result)) = tokio::time::timeout_at(deadline, receiver.recv()).await
                else {
                    break;
                };
                let Some(entry) = results.get_mut(result.sender) else {
                    debug!(
                        "dropping report from peer {} outside of {max_peers} targets",
                        result.sender
                    );
                    continue;
                };
                if entry.is_some_and(|existing| existing.full && !result.full) {
                    continue;
                }
                *entry = Some(result);
            }
        }
        self.close_report_slot(request_id);

        results
            .into_iter()
            .enumerate()
            .map(|(peer, r)| r.unwrap_or_else(|| IndividualDisseminateResult::timed_out(peer)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Instant, SystemTime};

    use super::*;
    use crate::protocol::MAX_CHUNK_SIZE;

    fn whole_packet(request_id: RequestId, data: &[u8]) -> DisseminatePacket {
        DisseminatePacket {
            strategy_code: 0,
            request_id,
            original_sender: 0,
            max_peers: 4,
            hop: 0,
            partial: false,
            seq: 0,
            total: 0,
            data: Bytes::copy_from_slice(data),
        }
    }

    fn report(sender: PeerId, full: bool) -> IndividualDisseminateResult {
        IndividualDisseminateResult {
            sender,
            relay: 0,
            hop: 0,
            reception_time: SystemTime::now(),
            full,
            error_timeout: false,
        }
    }

    #[tokio::test]
    async fn whole_payload() {
        let state = State::new(4);
        let packet = whole_packet(1, b"payload");
        let ChunkOutcome::Accepted(progress) = state.record_chunk(&packet, 2).await.unwrap() else {
            panic!("first delivery should be accepted");
        };
        assert!(progress.is_complete());
        assert!(!progress.is_half_complete());
        assert_eq!(progress.relay, 2);
        assert_eq!(progress.reassembled.as_deref(), Some(&b"payload"[..]));

        let outcome = state.record_chunk(&packet, 3).await.unwrap();
        assert!(matches!(outcome, ChunkOutcome::Duplicate));
    }

    #[tokio::test]
    async fn chunk_reassembly() {
        let state = State::new(4);
        let data: Vec<u8> = (0..(3 * MAX_CHUNK_SIZE + 17)).map(|i| i as u8).collect();
        let mut chunks = whole_packet(7, &data).into_chunks().unwrap();
        assert_eq!(chunks.len(), 4);
        // deliver out of order
        chunks.swap(0, 3);
        chunks.swap(1, 2);

        let mut reassembled = None;
        for (i, chunk) in chunks.iter().enumerate() {
            let ChunkOutcome::Accepted(progress) = state.record_chunk(chunk, 1).await.unwrap()
            else {
                panic!("new chunk should be accepted");
            };
            assert_eq!(progress.received, i + 1);
            assert_eq!(progress.expected, 4);
            assert_eq!(progress.is_half_complete(), i + 1 == 2);
            assert_eq!(progress.is_complete(), i + 1 == 4);
            if progress.is_complete() {
                reassembled = progress.reassembled;
            } else {
                assert!(progress.reassembled.is_none());
            }

            // re-delivery is a no-op
            let outcome = state.record_chunk(chunk, 1).await.unwrap();
            assert!(matches!(outcome, ChunkOutcome::Duplicate));
        }
        assert_eq!(reassembled.unwrap(), Bytes::from(data));
    }

    #[tokio::test]
    async fn odd_chunk_count_half_threshold() {
        let state = State::new(2);
        let data = vec![1u8; 2 * MAX_CHUNK_SIZE + 1];
        let chunks = whole_packet(9, &data).into_chunks().unwrap();
        let mut half_reports = 0;
        for chunk in &chunks {
            if let ChunkOutcome::Accepted(progress) = state.record_chunk(chunk, 1).await.unwrap() {
                if progress.is_half_complete() {
                    assert_eq!(progress.received, 2);
                    half_reports += 1;
                }
            }
        }
        assert_eq!(half_reports, 1);
    }

    #[tokio::test]
    async fn invalid_sequence() {
        let state = State::new(2);
        let data = vec![1u8; 2 * MAX_CHUNK_SIZE];
        let mut chunks = whole_packet(5, &data).into_chunks().unwrap();
        state.record_chunk(&chunks[0], 1).await.unwrap();
        chunks[1].seq = 2;
        let res = state.record_chunk(&chunks[1], 1).await;
        assert!(matches!(
            res,
            Err(ProtocolError::InvalidSequence { seq: 2, total: 2 })
        ));
    }

    #[tokio::test]
    async fn collect_returns_early() {
        let state = State::new(3);
        state.open_report_slot(11);
        for peer in 0..3 {
            assert!(state.deliver_report(11, report(peer, true)));
        }
        let start = Instant::now();
        let results = state.collect_reports(11, 3).await;
        assert!(start.elapsed() < REPORT_TIMEOUT);
        assert!(results.iter().all(|r| r.full && !r.error_timeout));
        // the slot is gone afterwards
        assert!(!state.deliver_report(11, report(0, true)));
    }

    #[tokio::test]
    async fn collect_timeouts() {
        let state = State::new(5);
        state.open_report_slot(12);
        state.deliver_report(12, report(0, true));
        state.deliver_report(12, report(2, false));
        state.deliver_report(12, report(2, true));
        state.deliver_report(12, report(2, false));
        state.deliver_report(12, report(4, false));
        state.deliver_report(12, report(9, true));

        let results = state.collect_reports(12, 5).await;
        assert_eq!(results.len(), 5);
        let timeouts: Vec<_> = results
            .iter()
            .filter(|r| r.error_timeout)
            .map(|r| r.sender)
            .collect();
        assert_eq!(timeouts, vec![1, 3]);
        // full report is never overwritten by a half report
        assert!(results[2].full);
        assert!(!results[4].full);
        assert!(!results[4].error_timeout);
    }

    #[tokio::test]
    async fn ping_cache() {
        let state = State::new(2);
        let incomplete = state
            .cached_ping_results(
                || async { vec![PingStatistics::default(); 2] },
                |_| false,
            )
            .await;
        assert_eq!(incomplete.len(), 2);

        let stats = PingStatistics::from_samples(&[Duration::from_millis(4)], 1);
        let first = state
            .cached_ping_results(|| async { vec![stats; 2] }, |_| true)
            .await;
        let second = state
            .cached_ping_results(|| async { Vec::new() }, |_| true)
            .await;
        assert_eq!(first, second);
    }
}
