//! Networking primitives.
//!
//! Goals:
//! - Provide a simple reliable (TCP) control channel and an unreliable (UDP)
//!   data channel.
//! - Control messages are JSON; replication frames are the binary layout from
//!   [`crate::codec`]. A datagram starting with `{` is a control message.
//!
//! Delivery guarantees for frames are best effort; the scheduler only needs
//! the transport to accept bytes.

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    time,
};

use crate::{codec::ReplicationFrame, math::Vec3};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest datagram we are prepared to read.
pub const MAX_DATAGRAM: usize = 64 * 1024;

static NEXT_CLIENT_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl ClientId {
    pub fn new_unique() -> Self {
        ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Control-plane message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NetMsg {
    // ─── Connection handshake ───
    Hello {
        protocol: u32,
    },
    /// Client announces its UDP port to the server.
    UdpHello {
        client_udp_port: u16,
    },
    Welcome {
        client_id: ClientId,
        server_update_rate: f32,
    },

    // ─── Relevance ───
    /// Client -> server: where the client currently is. `None` until spawned.
    AnchorUpdate {
        client_id: ClientId,
        anchor: Option<Vec3>,
    },

    // ─── Disconnect ───
    Disconnect {
        reason: String,
    },
}

/// What arrived on the data channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Datagram {
    Control(NetMsg),
    Frame(ReplicationFrame),
}

impl Datagram {
    pub fn parse(bytes: &[u8]) -> anyhow::Result<Self> {
        match bytes.first() {
            Some(b'{') => Ok(Datagram::Control(decode_from_bytes(bytes)?)),
            Some(_) => Ok(Datagram::Frame(
                ReplicationFrame::decode(bytes).context("decode replication frame")?,
            )),
            None => anyhow::bail!("empty datagram"),
        }
    }
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(msg).context("serialize msg")?;
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);
        self.stream.write_all(&buf).await.context("tcp write")?;
        Ok(())
    }

    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        let mut len_buf = [0u8; 4];
        self.stream
            .read_exact(&mut len_buf)
            .await
            .context("tcp read len")?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        self.stream
            .read_exact(&mut payload)
            .await
            .context("tcp read payload")?;
        let msg = serde_json::from_slice(&payload).context("deserialize msg")?;
        Ok(msg)
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }
}

/// Unreliable channel over UDP.
#[derive(Debug)]
pub struct UnreliableConn {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UnreliableConn {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.context("udp bind")?;
        socket.connect(peer).await.context("udp connect")?;
        Ok(Self { socket, peer })
    }

    pub async fn send(&self, msg: &NetMsg) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(msg).context("serialize udp msg")?;
        self.socket.send(&payload).await.context("udp send")?;
        Ok(())
    }

    /// Receives one raw datagram within the given timeout.
    pub async fn recv_timeout(&self, timeout: Duration) -> anyhow::Result<Option<Bytes>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match time::timeout(timeout, self.socket.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(Some(Bytes::from(buf)))
            }
            Ok(Err(e)) => Err(e).context("udp recv")?,
            Err(_) => Ok(None),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Convenience codec helpers.
pub fn encode_to_bytes(msg: &NetMsg) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize")?;
    Ok(Bytes::from(payload))
}

pub fn decode_from_bytes(b: &[u8]) -> anyhow::Result<NetMsg> {
    serde_json::from_slice(b).context("deserialize")
}
