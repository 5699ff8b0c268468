// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! An abstraction layer for peer connections.
//!
//! The [`Connection`] trait provides a common interface for one bidirectional
//! link to a single peer. Messages are abstracted as a numeric code plus an
//! opaque payload; interpreting them is up to [`crate::protocol`].
//!
//! Specific implementations for different underlying network stacks are provided:
//! - [`TcpConnection`] uses a length-delimited TCP stream
//! - [`SimulatedConnection`] provides an in-memory link for local testing
//!
//! A connection is flagged datagram-oriented by explicit configuration.
//! Senders split large payloads into chunks on such connections.

pub mod simulated;
pub mod tcp;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use self::simulated::{SimulatedConnection, SimulatedNetworkCore};
pub use self::tcp::{TcpConnection, TcpNetwork};

/// Error type for transport operations.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("frame of {0} bytes is too short")]
    FrameTooShort(usize),
    #[error("handshake failed: {0}")]
    Handshake(&'static str),
    #[error("bad socket state")]
    BadSocket(#[from] std::io::Error),
}

/// Abstraction of a bidirectional link to a single peer.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Sends one message with the given numeric code.
    async fn send(&self, code: u64, payload: Bytes) -> Result<(), NetworkError>;

    /// Receives the next message.
    ///
    /// Messages are delivered in the order they were sent.
    /// There is at most one concurrent caller, the peer's receive loop.
    async fn receive(&self) -> Result<(u64, Bytes), NetworkError>;

    /// Whether large payloads have to be split into chunks on this link.
    fn is_datagram(&self) -> bool;

    /// Closes the connection, failing any pending and future `receive` calls.
    async fn close(&self);
}

/// Returns a localhost socket address with the given `port`.
#[must_use]
pub const fn localhost_ip_sockaddr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}
