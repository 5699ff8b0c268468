// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Binary peer protocol.
//!
//! Every message on a peer connection is a numeric [`MessageCode`] plus a
//! body. Bodies are the packet structs in this module, serialized with
//! [`bincode`] in its serde mode.
//!
//! Large dissemination payloads are split into chunks of at most
//! [`MAX_CHUNK_SIZE`] bytes when sent over datagram-oriented connections,
//! see [`DisseminatePacket::into_chunks`].
//!
//! # Examples
//!
//! ```
//! use netdiag::protocol::{self, Packet, PingPacket};
//!
//! let ping = PingPacket { request_id: 7 };
//! let bytes = protocol::encode(&ping);
//! let decoded: PingPacket = protocol::decode(&bytes).unwrap();
//! assert_eq!(decoded.request_id, 7);
//! assert_eq!(u64::from(PingPacket::CODE), 0);
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{RequestId, StrategyCode};

/// Maximum number of payload bytes carried by a single chunk.
pub const MAX_CHUNK_SIZE: usize = 20_000;

const BINCODE_CONFIG: bincode::config::Configuration = bincode::config::standard();

/// Numeric message codes, stable across versions.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageCode {
    Ping = 0,
    Pong = 1,
    Data = 2,
    AckData = 3,
    UpdateTcpSocket = 4,
    DisseminateRequest = 5,
    DisseminateReport = 6,
    LatencyArray = 7,
    TriggerRequest = 8,
    GraphReady = 9,
}

impl TryFrom<u64> for MessageCode {
    type Error = ProtocolError;

    fn try_from(code: u64) -> Result<Self, Self::Error> {
        let code = match code {
            0 => Self::Ping,
            1 => Self::Pong,
            2 => Self::Data,
            3 => Self::AckData,
            4 => Self::UpdateTcpSocket,
            5 => Self::DisseminateRequest,
            6 => Self::DisseminateReport,
            7 => Self::LatencyArray,
            8 => Self::TriggerRequest,
            9 => Self::GraphReady,
            _ => return Err(ProtocolError::UnknownMessageCode(code)),
        };
        Ok(code)
    }
}

impl From<MessageCode> for u64 {
    fn from(code: MessageCode) -> Self {
        code as u64
    }
}

/// Error type for protocol violations by a remote peer.
///
/// Any of these tears down the connection it occurred on.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message code {0}")]
    UnknownMessageCode(u64),
    #[error("unknown strategy code {0}")]
    UnknownStrategy(StrategyCode),
    #[error("malformed packet body")]
    Malformed(#[from] bincode::error::DecodeError),
    #[error("chunk sequence number {seq} out of range for {total} chunks")]
    InvalidSequence { seq: u16, total: u16 },
    #[error("payload of {0} bytes needs too many chunks")]
    PayloadTooLarge(usize),
    #[error("dissemination targets {max_peers} peers out of {peers}")]
    MaxPeersOutOfRange { max_peers: u64, peers: usize },
    #[error("dissemination from unknown original sender {sender}")]
    UnknownSender { sender: u64 },
}

/// A packet body that travels under a fixed [`MessageCode`].
pub trait Packet: Serialize + DeserializeOwned {
    const CODE: MessageCode;
}

/// Serializes a packet body into owned bytes using [`bincode`].
#[must_use]
pub fn encode<P: Packet>(packet: &P) -> Bytes {
    bincode::serde::encode_to_vec(packet, BINCODE_CONFIG)
        .expect("serialization should not panic")
        .into()
}

/// Deserializes a packet body from bytes using [`bincode`].
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] if bincode decoding fails.
pub fn decode<P: Packet>(bytes: &[u8]) -> Result<P, ProtocolError> {
    let (packet, _) = bincode::serde::decode_from_slice(bytes, BINCODE_CONFIG)?;
    Ok(packet)
}

/// Current wall-clock time as nanoseconds since the UNIX epoch.
#[must_use]
pub fn unix_time_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

/// Converts nanoseconds since the UNIX epoch back into a [`SystemTime`].
#[must_use]
pub fn system_time_from_ns(nanos: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos)
}

/// Number of chunks a payload of `len` bytes is split into.
#[must_use]
pub const fn chunk_count(len: usize) -> usize {
    len.div_ceil(MAX_CHUNK_SIZE)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPacket {
    pub request_id: RequestId,
}

impl Packet for PingPacket {
    const CODE: MessageCode = MessageCode::Ping;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongPacket {
    pub request_id: RequestId,
    /// Responder's wall-clock time when replying.
    pub time_ns: u64,
}

impl Packet for PongPacket {
    const CODE: MessageCode = MessageCode::Pong;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPacket {
    pub request_id: RequestId,
    pub data: Bytes,
}

impl Packet for DataPacket {
    const CODE: MessageCode = MessageCode::Data;
}

/// Acknowledgement for [`DataPacket`], [`LatencyArrayPacket`],
/// [`TriggerRequestPacket`] and [`GraphReadyPacket`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckDataPacket {
    pub request_id: RequestId,
    pub time_ns: u64,
}

impl Packet for AckDataPacket {
    const CODE: MessageCode = MessageCode::AckData;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTcpSocketPacket {
    pub buffer_size: u64,
    pub reset: bool,
}

impl Packet for UpdateTcpSocketPacket {
    const CODE: MessageCode = MessageCode::UpdateTcpSocket;
}

/// One unit of a dissemination.
///
/// If `partial` is false, `seq == total == 0` and `data` is the whole payload.
/// Otherwise the payload was split into `total` chunks and this is chunk `seq`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisseminatePacket {
    pub strategy_code: StrategyCode,
    pub request_id: RequestId,
    pub original_sender: u64,
    pub max_peers: u64,
    pub hop: u8,
    pub partial: bool,
    pub seq: u16,
    pub total: u16,
    pub data: Bytes,
}

impl Packet for DisseminatePacket {
    const CODE: MessageCode = MessageCode::DisseminateRequest;
}

impl DisseminatePacket {
    /// Splits this packet into chunks of at most [`MAX_CHUNK_SIZE`] bytes.
    ///
    /// Packets that already fit, or are already partial, are returned as is.
    /// Chunks share the underlying buffer with the original payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooLarge`] if the number of chunks
    /// does not fit into the 16-bit sequence number space.
    pub fn into_chunks(self) -> Result<Vec<Self>, ProtocolError> {
        if self.partial || self.data.len() <= MAX_CHUNK_SIZE {
            return Ok(vec![self]);
        }
        let len = self.data.len();
        let total =
            u16::try_from(chunk_count(len)).map_err(|_| ProtocolError::PayloadTooLarge(len))?;
        let chunks = (0..total)
            .map(|seq| {
                let start = usize::from(seq) * MAX_CHUNK_SIZE;
                let end = (start + MAX_CHUNK_SIZE).min(len);
                Self {
                    partial: true,
                    seq,
                    total,
                    data: self.data.slice(start..end),
                    ..self.clone()
                }
            })
            .collect();
        Ok(chunks)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisseminateReportPacket {
    pub request_id: RequestId,
    /// Peer the reporter received the first accepted chunk from.
    pub relay: u64,
    pub hop: u8,
    /// Reporter's wall-clock reception time.
    pub time_ns: u64,
    /// Whether all chunks were received, as opposed to half of them.
    pub full: bool,
}

impl Packet for DisseminateReportPacket {
    const CODE: MessageCode = MessageCode::DisseminateReport;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyArrayPacket {
    pub request_id: RequestId,
    pub strategy: StrategyCode,
    pub latencies_ns: Vec<u64>,
}

impl Packet for LatencyArrayPacket {
    const CODE: MessageCode = MessageCode::LatencyArray;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRequestPacket {
    pub request_id: RequestId,
    pub strategy: StrategyCode,
}

impl Packet for TriggerRequestPacket {
    const CODE: MessageCode = MessageCode::TriggerRequest;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphReadyPacket {
    pub request_id: RequestId,
    pub strategy: StrategyCode,
}

impl Packet for GraphReadyPacket {
    const CODE: MessageCode = MessageCode::GraphReady;
}
