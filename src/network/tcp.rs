// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! TCP connections.
//!
//! This module provides an implementation of the [`Connection`] trait for TCP.
//! It uses [`tokio::net::TcpListener`] and [`tokio::net::TcpStream`] under the hood.
//!
//! Each frame is length-delimited and starts with an 8-byte big-endian message code.
//! The dialing side announces its peer index in a single hello frame.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use log::debug;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use super::{Connection, NetworkError};
use crate::PeerId;

type StreamReader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
type StreamWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

/// Message code reserved for the hello frame.
const HELLO_CODE: u64 = u64::MAX;
/// Largest frame accepted, enough for unchunked multi-megabyte payloads.
const MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;
/// Time a freshly accepted stream gets to announce itself.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
const CODE_LEN: usize = std::mem::size_of::<u64>();

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .big_endian()
        .new_codec()
}

/// A single TCP link to a peer.
pub struct TcpConnection {
    reader: Mutex<StreamReader>,
    writer: Mutex<StreamWriter>,
    remote: SocketAddr,
    datagram: bool,
}

impl TcpConnection {
    fn new(stream: TcpStream, datagram: bool) -> Result<Self, NetworkError> {
        stream.set_nodelay(true)?;
        let remote = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(FramedRead::new(read_half, codec())),
            writer: Mutex::new(FramedWrite::new(write_half, codec())),
            remote,
            datagram,
        })
    }

    /// Dials `address` and announces `local_id` to the other side.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BadSocket`] if connecting or sending the hello fails.
    pub async fn connect(
        address: SocketAddr,
        local_id: PeerId,
        datagram: bool,
    ) -> Result<Self, NetworkError> {
        let stream = TcpStream::connect(address).await?;
        let conn = Self::new(stream, datagram)?;
        let hello = Bytes::copy_from_slice(&(local_id as u64).to_be_bytes());
        conn.send(HELLO_CODE, hello).await?;
        Ok(conn)
    }

    /// Address of the remote end of this connection.
    #[must_use]
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    async fn receive_hello(&self) -> Result<PeerId, NetworkError> {
        let (code, mut payload) = self.receive().await?;
        if code != HELLO_CODE {
            return Err(NetworkError::Handshake("first frame is not a hello"));
        }
        if payload.len() != CODE_LEN {
            return Err(NetworkError::Handshake("hello has wrong length"));
        }
        Ok(payload.get_u64() as PeerId)
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&self, code: u64, payload: Bytes) -> Result<(), NetworkError> {
        let mut frame = BytesMut::with_capacity(CODE_LEN + payload.len());
        frame.put_u64(code);
        frame.put_slice(&payload);
        self.writer.lock().await.send(frame.freeze()).await?;
        Ok(())
    }

    async fn receive(&self) -> Result<(u64, Bytes), NetworkError> {
        let Some(frame) = self.reader.lock().await.next().await else {
            return Err(NetworkError::ConnectionClosed);
        };
        let mut frame = frame?;
        if frame.len() < CODE_LEN {
            return Err(NetworkError::FrameTooShort(frame.len()));
        }
        let code = frame.get_u64();
        Ok((code, frame.freeze()))
    }

    fn is_datagram(&self) -> bool {
        self.datagram
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(err) = SinkExt::<Bytes>::close(&mut *writer).await {
            debug!("closing connection to {} failed: {err}", self.remote);
        }
    }
}

/// Listening side of the TCP transport.
pub struct TcpNetwork {
    listener: TcpListener,
    datagram: bool,
}

impl TcpNetwork {
    /// Binds a listener to `address`.
    ///
    /// Connections accepted by this instance are flagged datagram-oriented
    /// iff `datagram` is set.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BadSocket`] if the address is already in use.
    pub async fn bind(address: SocketAddr, datagram: bool) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener, datagram })
    }

    /// Returns the TCP port number the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BadSocket`] if the socket is in a bad state.
    pub fn port(&self) -> Result<u16, NetworkError> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Accepts the next incoming stream, without waiting for its hello.
    ///
    /// Use [`Self::handshake`] on the result, ideally on a separate task.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BadSocket`] if accepting fails.
    pub async fn accept(&self) -> Result<TcpConnection, NetworkError> {
        let (stream, _) = self.listener.accept().await?;
        TcpConnection::new(stream, self.datagram)
    }

    /// Waits for the hello frame of an accepted connection.
    ///
    /// Returns the peer index announced by the dialer.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Handshake`] if the first frame is not a valid
    /// hello or does not arrive in time.
    pub async fn handshake(conn: TcpConnection) -> Result<(PeerId, TcpConnection), NetworkError> {
        let id = tokio::time::timeout(HELLO_TIMEOUT, conn.receive_hello())
            .await
            .map_err(|_| NetworkError::Handshake("timed out waiting for hello"))??;
        Ok((id, conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::localhost_ip_sockaddr;

    #[tokio::test]
    async fn hello_and_messages() {
        let network = TcpNetwork::bind(localhost_ip_sockaddr(0), false)
            .await
            .unwrap();
        let address = localhost_ip_sockaddr(network.port().unwrap());

        let dialer = tokio::spawn(async move {
            let conn = TcpConnection::connect(address, 3, false).await.unwrap();
            conn.send(5, Bytes::from_static(b"hello world")).await.unwrap();
            let (code, payload) = conn.receive().await.unwrap();
            assert_eq!(code, 1);
            assert!(payload.is_empty());
        });

        let accepted = network.accept().await.unwrap();
        let (id, conn) = TcpNetwork::handshake(accepted).await.unwrap();
        assert_eq!(id, 3);
        assert!(!conn.is_datagram());
        let (code, payload) = conn.receive().await.unwrap();
        assert_eq!(code, 5);
        assert_eq!(&payload[..], b"hello world");
        conn.send(1, Bytes::new()).await.unwrap();
        dialer.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_rejects_other_frames() {
        let network = TcpNetwork::bind(localhost_ip_sockaddr(0), true)
            .await
            .unwrap();
        let address = localhost_ip_sockaddr(network.port().unwrap());

        let dialer = tokio::spawn(async move {
            let stream = TcpStream::connect(address).await.unwrap();
            let conn = TcpConnection::new(stream, true).unwrap();
            conn.send(0, Bytes::from_static(b"not a hello")).await.unwrap();
            conn
        });

        let accepted = network.accept().await.unwrap();
        assert!(accepted.is_datagram());
        let res = TcpNetwork::handshake(accepted).await;
        assert!(matches!(res, Err(NetworkError::Handshake(_))));
        drop(dialer.await.unwrap());
    }
}
