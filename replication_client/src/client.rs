//! Client implementation.
//!
//! The client maintains:
//! - A reliable control stream (handshake)
//! - An unreliable datagram socket (anchor updates out, frames in)
//! - A replica cache fed by verified replication frames

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use replication_shared::{
    codec::{CodecError, EntityStateCodec},
    config::EngineConfig,
    entity::EntityHandle,
    math::Vec3,
    net::{ClientId, Datagram, NetMsg, ReliableConn, UnreliableConn, PROTOCOL_VERSION},
};
use tokio::{net::TcpStream, time::Instant};
use tracing::{debug, info, warn};

use crate::replica::ReplicaCache;

/// Client connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    /// Not connected to any server.
    Disconnected,
    /// Handshake done, receiving frames.
    Connected,
}

/// Replication receiver.
pub struct ReplicaClient {
    pub client_id: ClientId,
    pub state: ClientState,

    reliable: ReliableConn,
    pub unreliable: UnreliableConn,
    pub replicas: ReplicaCache,
    codec: EntityStateCodec,

    anchor: Option<Vec3>,
    server_update_rate: f32,
    frames_received: u64,
    frames_rejected: u64,
}

impl ReplicaClient {
    /// Connects to a server and performs handshake.
    pub async fn connect(cfg: &EngineConfig) -> anyhow::Result<Self> {
        let server_addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;

        info!(server = %server_addr, "Connecting to server");

        // Bind UDP first so we can tell the server where to send frames.
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let unreliable = UnreliableConn::connect(bind, server_addr).await?;
        let client_udp_port = unreliable.local_addr().context("udp local_addr")?.port();

        let stream = TcpStream::connect(server_addr)
            .await
            .context("tcp connect")?;
        let mut reliable = ReliableConn::new(stream);

        reliable
            .send(&NetMsg::Hello {
                protocol: PROTOCOL_VERSION,
            })
            .await?;

        reliable.send(&NetMsg::UdpHello { client_udp_port }).await?;

        let welcome = reliable.recv().await?;
        let (client_id, server_update_rate) = match welcome {
            NetMsg::Welcome {
                client_id,
                server_update_rate,
            } => (client_id, server_update_rate),
            NetMsg::Disconnect { reason } => anyhow::bail!("server refused connection: {reason}"),
            other => anyhow::bail!("expected Welcome, got {other:?}"),
        };

        info!(client_id = ?client_id, server_update_rate, "Connected to server");

        Ok(Self {
            client_id,
            state: ClientState::Connected,
            reliable,
            unreliable,
            replicas: ReplicaCache::new(),
            codec: EntityStateCodec::new(
                cfg.replication.compression_enabled,
                cfg.replication.encryption_enabled,
            ),
            anchor: None,
            server_update_rate,
            frames_received: 0,
            frames_rejected: 0,
        })
    }

    /// Codec used to revert payload transforms; must mirror the server's.
    pub fn codec_mut(&mut self) -> &mut EntityStateCodec {
        &mut self.codec
    }

    pub fn anchor(&self) -> Option<Vec3> {
        self.anchor
    }

    pub fn server_update_rate(&self) -> f32 {
        self.server_update_rate
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    /// Frames dropped because they failed decoding or verification.
    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected
    }

    /// Reports where this client is. Also serves as the UDP keepalive.
    pub async fn send_anchor(&mut self, anchor: Option<Vec3>) -> anyhow::Result<()> {
        self.anchor = anchor;
        self.unreliable
            .send(&NetMsg::AnchorUpdate {
                client_id: self.client_id,
                anchor,
            })
            .await
    }

    /// Receives at most one datagram. Returns the entity it updated, if any.
    pub async fn recv_frame(&mut self, timeout: Duration) -> anyhow::Result<Option<EntityHandle>> {
        match self.unreliable.recv_timeout(timeout).await? {
            Some(bytes) => Ok(self.handle_datagram(&bytes)),
            None => Ok(None),
        }
    }

    /// Drains datagrams until one `idle` wait passes without traffic.
    /// Returns how many replica updates were applied.
    pub async fn pump(&mut self, idle: Duration) -> anyhow::Result<usize> {
        let mut updated = 0;
        while let Some(bytes) = self.unreliable.recv_timeout(idle).await? {
            if self.handle_datagram(&bytes).is_some() {
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Receives for exactly `window`, however busy the channel is.
    pub async fn pump_for(&mut self, window: Duration) -> anyhow::Result<usize> {
        let deadline = Instant::now() + window;
        let mut updated = 0;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(updated);
            }
            if let Some(bytes) = self.unreliable.recv_timeout(left).await? {
                if self.handle_datagram(&bytes).is_some() {
                    updated += 1;
                }
            }
        }
    }

    fn handle_datagram(&mut self, bytes: &[u8]) -> Option<EntityHandle> {
        match Datagram::parse(bytes) {
            Ok(Datagram::Frame(frame)) => {
                let block = match self.codec.decode_payload(frame.flags, frame.payload) {
                    Ok(block) => block,
                    Err(e) => {
                        self.reject(&e);
                        return None;
                    }
                };
                self.replicas.apply(frame.entity, block.decode());
                self.frames_received += 1;
                debug!(entity = %frame.entity, "Replica updated");
                Some(frame.entity)
            }
            Ok(Datagram::Control(NetMsg::Disconnect { reason })) => {
                info!(reason = %reason, "Disconnected from server");
                self.state = ClientState::Disconnected;
                None
            }
            Ok(Datagram::Control(other)) => {
                debug!(?other, "Unexpected UDP message");
                None
            }
            Err(e) => {
                match e.downcast_ref::<CodecError>() {
                    Some(codec) => self.reject(codec),
                    None => warn!(error = %e, "Unreadable datagram"),
                }
                None
            }
        }
    }

    fn reject(&mut self, e: &CodecError) {
        self.frames_rejected += 1;
        warn!(error = %e, "Dropping replication frame");
    }

    /// Tells the server we are leaving.
    pub async fn disconnect(&mut self, reason: &str) -> anyhow::Result<()> {
        self.unreliable
            .send(&NetMsg::Disconnect {
                reason: reason.to_string(),
            })
            .await?;
        self.state = ClientState::Disconnected;
        Ok(())
    }

    /// Returns the underlying reliable connection peer.
    pub fn server_peer(&self) -> anyhow::Result<SocketAddr> {
        self.reliable.peer_addr()
    }
}
