//! Server implementation.
//!
//! An authoritative host that drives the replication scheduler from a fixed
//! timestep loop. It supports:
//! - Client handshake over TCP, anchor updates over UDP
//! - A small simulation world standing in for the gameplay model
//! - Distribution of accepted payloads as checksummed frames to relevant clients
//! - Periodic sweep of stale registrations
//! - Admin commands (status, stats, force, priority, frequency, reset_budget, ...)
//!
//! Determinism notes:
//! - Scheduling time is the elapsed session time passed into the scheduler.
//! - Client iteration goes through the scheduler's ordered client table.

use anyhow::Context;
use rand::Rng;
use replication_shared::{
    config::EngineConfig,
    entity::{EntityHandle, EntitySource, EntityTransform},
    math::{Rotator, Vec3},
    net::{ClientId, Datagram, NetMsg, ReliableConn, ReliableListener, MAX_DATAGRAM, PROTOCOL_VERSION},
    registry::{Frequency, Priority},
    scheduler::{OutboundReplication, Outbox, ReplicationScheduler, TickOutcome},
    world::SimWorld,
};
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};
use tokio::{net::UdpSocket, sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

/// Connected client state.
struct ClientState {
    _reliable: ReliableConn,
    udp_peer: SocketAddr,
}

/// Replication host.
pub struct ReplicationServer {
    pub cfg: EngineConfig,
    world: SimWorld,
    scheduler: ReplicationScheduler,
    outbox: Outbox,
    clients: HashMap<ClientId, ClientState>,

    tcp: ReliableListener,
    udp: UdpSocket,

    steps: u64,
    session_start: Instant,
    frames_sent: u64,

    /// Channel for admin commands from stdin.
    console_rx: Option<mpsc::Receiver<String>>,
}

impl ReplicationServer {
    /// Binds TCP and UDP on the configured address.
    pub async fn new(cfg: EngineConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let tcp = ReliableListener::bind(addr).await?;
        let udp = UdpSocket::bind(tcp.local_addr()?).await.context("udp bind")?;
        Ok(Self::from_parts(cfg, tcp, udp))
    }

    fn from_parts(cfg: EngineConfig, tcp: ReliableListener, udp: UdpSocket) -> Self {
        Self {
            scheduler: ReplicationScheduler::new(cfg.replication.clone()),
            cfg,
            world: SimWorld::new(),
            outbox: Outbox::new(),
            clients: HashMap::new(),
            tcp,
            udp,
            steps: 0,
            session_start: Instant::now(),
            frames_sent: 0,
            console_rx: None,
        }
    }

    /// Sets the admin command receiver.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    /// Returns the local address (after binding).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn world(&self) -> &SimWorld {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut SimWorld {
        &mut self.world
    }

    pub fn scheduler(&self) -> &ReplicationScheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut ReplicationScheduler {
        &mut self.scheduler
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Spawns an entity in the world and registers it for replication.
    pub fn spawn_entity(
        &mut self,
        transform: EntityTransform,
        priority: Priority,
        frequency: Frequency,
    ) -> EntityHandle {
        let handle = self.world.spawn(transform);
        self.scheduler.register(handle, priority, frequency);
        handle
    }

    /// Removes an entity from the world only; its registration goes stale and
    /// is purged by the scheduler.
    pub fn despawn_entity(&mut self, handle: EntityHandle) -> bool {
        self.world.despawn(handle)
    }

    /// Populates the world with drifting entities around the origin.
    pub fn spawn_demo_entities<R: Rng>(&mut self, count: usize, radius: f32, rng: &mut R) -> Vec<EntityHandle> {
        const PRIORITIES: [Priority; 4] = [Priority::Critical, Priority::High, Priority::Normal, Priority::Low];
        const FREQUENCIES: [Frequency; 4] = [
            Frequency::Always,
            Frequency::Frequently,
            Frequency::Occasionally,
            Frequency::Rarely,
        ];

        (0..count)
            .map(|i| {
                let position = Vec3::new(
                    rng.gen_range(-radius..=radius),
                    rng.gen_range(-radius..=radius),
                    0.0,
                );
                let transform = EntityTransform {
                    position,
                    rotation: Rotator::new(0.0, rng.gen_range(0.0..360.0), 0.0),
                    scale: Vec3::ONE,
                };
                let handle = self.spawn_entity(transform, PRIORITIES[i % 4], FREQUENCIES[i % 4]);
                if i % 3 != 0 {
                    self.world.set_velocity(
                        handle,
                        Vec3::new(rng.gen_range(-5.0..5.0), rng.gen_range(-5.0..5.0), 0.0),
                    );
                }
                handle
            })
            .collect()
    }

    /// Accepts exactly one client (handshake).
    pub async fn accept_one(&mut self) -> anyhow::Result<ClientId> {
        let (conn, peer) = self.tcp.accept().await?;
        self.handle_new_connection(conn, peer).await
    }

    /// Accepts a client with timeout (non-blocking).
    pub async fn try_accept(&mut self, timeout: Duration) -> anyhow::Result<Option<ClientId>> {
        match tokio::time::timeout(timeout, self.tcp.accept()).await {
            Ok(Ok((conn, peer))) => self.handle_new_connection(conn, peer).await.map(Some),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None), // Timeout
        }
    }

    async fn handle_new_connection(
        &mut self,
        mut conn: ReliableConn,
        peer: SocketAddr,
    ) -> anyhow::Result<ClientId> {
        let msg = conn.recv().await?;
        match msg {
            NetMsg::Hello { protocol } if protocol == PROTOCOL_VERSION => {
                let udp_hello = conn.recv().await?;
                let client_udp_port = match udp_hello {
                    NetMsg::UdpHello { client_udp_port } => client_udp_port,
                    other => anyhow::bail!("expected UdpHello, got {other:?}"),
                };

                let id = ClientId::new_unique();
                conn.send(&NetMsg::Welcome {
                    client_id: id,
                    server_update_rate: self.cfg.replication.server_update_rate,
                })
                .await?;

                let udp_peer = SocketAddr::new(peer.ip(), client_udp_port);
                self.clients.insert(
                    id,
                    ClientState {
                        _reliable: conn,
                        udp_peer,
                    },
                );
                self.scheduler.upsert_client(id, None);

                info!(client_id = ?id, %udp_peer, "Client connected");
                Ok(id)
            }
            NetMsg::Hello { protocol } => {
                conn.send(&NetMsg::Disconnect {
                    reason: format!("protocol {protocol} not supported"),
                })
                .await?;
                anyhow::bail!("client protocol {protocol} != {PROTOCOL_VERSION}")
            }
            other => anyhow::bail!("unexpected handshake msg: {other:?}"),
        }
    }

    /// Disconnects a client and forgets its view.
    pub fn drop_client(&mut self, id: ClientId) -> bool {
        self.scheduler.remove_client(id);
        let removed = self.clients.remove(&id).is_some();
        if removed {
            info!(client_id = ?id, "Client removed");
        }
        removed
    }

    /// Runs the server for a number of steps at the configured rate.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = self.cfg.replication.server_tick_interval().max(Duration::from_millis(1));
        let mut next = Instant::now();

        for _ in 0..ticks {
            next += dt;
            self.step(dt.as_secs_f32()).await?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes one step using elapsed session time.
    pub async fn step(&mut self, dt_sec: f32) -> anyhow::Result<TickOutcome> {
        let now = self.session_start.elapsed();
        self.step_at(now, dt_sec).await
    }

    /// Executes one step at an explicit session time.
    pub async fn step_at(&mut self, now: Duration, dt_sec: f32) -> anyhow::Result<TickOutcome> {
        self.process_console_commands()?;
        self.recv_datagrams().await?;
        self.world.step(dt_sec);

        let outcome = self.scheduler.tick(now, &self.world, &mut self.outbox);
        self.flush_outbox().await;

        self.steps += 1;
        let every = u64::from(self.cfg.replication.optimize_interval_ticks.max(1));
        if self.steps % every == 0 {
            self.scheduler.optimize(&self.world);
        }
        Ok(outcome)
    }

    fn process_console_commands(&mut self) -> anyhow::Result<()> {
        // Collect lines first to avoid borrow conflict
        let lines: Vec<String> = if let Some(ref mut rx) = self.console_rx {
            let mut collected = Vec::new();
            while let Ok(line) = rx.try_recv() {
                collected.push(line);
            }
            collected
        } else {
            Vec::new()
        };

        for line in lines {
            for out in self.exec_command(&line)? {
                println!("{out}");
            }
        }
        Ok(())
    }

    async fn recv_datagrams(&mut self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match self.udp.try_recv_from(&mut buf) {
                Ok((n, from)) => match Datagram::parse(&buf[..n]) {
                    Ok(Datagram::Control(msg)) => self.handle_udp_message(from, msg),
                    Ok(Datagram::Frame(_)) => debug!(%from, "Ignoring replication frame sent to server"),
                    Err(e) => debug!(%from, error = %e, "Dropping malformed datagram"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e).context("udp recv")?,
            }
        }
        Ok(())
    }

    fn handle_udp_message(&mut self, from: SocketAddr, msg: NetMsg) {
        match msg {
            NetMsg::AnchorUpdate { client_id, anchor } => {
                let Some(client) = self.clients.get_mut(&client_id) else {
                    debug!(client_id = ?client_id, %from, "Anchor update from unknown client");
                    return;
                };
                client.udp_peer = from;
                self.scheduler.set_client_anchor(client_id, anchor);
            }
            NetMsg::Disconnect { reason } => {
                let id = self
                    .clients
                    .iter()
                    .find(|(_, c)| c.udp_peer == from)
                    .map(|(id, _)| *id);
                if let Some(id) = id {
                    info!(client_id = ?id, reason = %reason, "Client disconnected");
                    self.drop_client(id);
                }
            }
            _ => {
                debug!(?msg, "Unexpected UDP message");
            }
        }
    }

    async fn flush_outbox(&mut self) {
        for packet in self.outbox.drain() {
            self.send_packet(&packet).await;
        }
    }

    async fn send_packet(&mut self, packet: &OutboundReplication) {
        let bytes = match packet.to_frame().encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(entity = %packet.entity, error = %e, "Failed to encode replication frame");
                return;
            }
        };
        for client_id in &packet.relevant_clients {
            let Some(client) = self.clients.get(client_id) else {
                continue;
            };
            match self.udp.send_to(&bytes, client.udp_peer).await {
                Ok(_) => self.frames_sent += 1,
                Err(e) => warn!(client_id = ?client_id, error = %e, "Frame send failed"),
            }
        }
    }

    /// Executes an admin command.
    pub fn exec_command(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        match tokens[0] {
            "status" => {
                let mut out = Vec::new();
                out.push(format!("Steps: {}", self.steps));
                out.push(format!("World entities: {}", self.world.len()));
                out.push(format!("Registered: {}", self.scheduler.registry().len()));
                let throttle = self.scheduler.throttle();
                out.push(format!("Budget: {}/{} bytes", throttle.spent(), throttle.limit()));
                out.push(format!("Clients: {}", self.clients.len()));
                for view in self.scheduler.clients() {
                    let peer = self.clients.get(&view.id).map(|c| c.udp_peer.to_string());
                    out.push(format!(
                        "  {:?}: udp={} anchor={:?}",
                        view.id,
                        peer.unwrap_or_default(),
                        view.anchor
                    ));
                }
                Ok(out)
            }
            "stats" => {
                let json = serde_json::to_string_pretty(self.scheduler.statistics())
                    .context("serialize stats")?;
                Ok(json.lines().map(str::to_string).collect())
            }
            "force" => {
                let Some(handle) = parse_handle(tokens.get(1)) else {
                    return Ok(vec!["Usage: force <entity>".to_string()]);
                };
                if self.scheduler.force_replicate(handle) {
                    Ok(vec![format!("Forced {handle}")])
                } else {
                    Ok(vec![format!("Unknown entity {handle}")])
                }
            }
            "priority" => {
                let (Some(handle), Some(level)) = (parse_handle(tokens.get(1)), tokens.get(2)) else {
                    return Ok(vec!["Usage: priority <entity> <critical|high|normal|low>".to_string()]);
                };
                let priority: Priority = match level.parse() {
                    Ok(p) => p,
                    Err(e) => return Ok(vec![e.to_string()]),
                };
                self.scheduler.set_priority(handle, priority);
                Ok(vec![format!("{handle} priority = {priority:?}")])
            }
            "frequency" => {
                let (Some(handle), Some(level)) = (parse_handle(tokens.get(1)), tokens.get(2)) else {
                    return Ok(vec![
                        "Usage: frequency <entity> <never|rarely|occasionally|frequently|always>".to_string(),
                    ]);
                };
                let frequency: Frequency = match level.parse() {
                    Ok(f) => f,
                    Err(e) => return Ok(vec![e.to_string()]),
                };
                self.scheduler.set_frequency(handle, frequency);
                Ok(vec![format!("{handle} frequency = {frequency:?}")])
            }
            "relevant" => {
                let Some(client) = tokens.get(1).and_then(|t| t.parse::<u32>().ok()) else {
                    return Ok(vec!["Usage: relevant <client>".to_string()]);
                };
                let entities = self.scheduler.relevant_entities(ClientId(client), &self.world);
                Ok(vec![format!(
                    "{} relevant: {}",
                    entities.len(),
                    entities.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ")
                )])
            }
            "reset_budget" => {
                self.scheduler.reset_bandwidth();
                Ok(vec!["Bandwidth window reset".to_string()])
            }
            "reset_stats" => {
                self.scheduler.reset_statistics();
                Ok(vec!["Statistics reset".to_string()])
            }
            "optimize" => {
                let purged = self.scheduler.optimize(&self.world);
                Ok(vec![format!("Purged {} stale handles", purged.len())])
            }
            "despawn" => {
                let Some(handle) = parse_handle(tokens.get(1)) else {
                    return Ok(vec!["Usage: despawn <entity>".to_string()]);
                };
                let alive = self.world.is_valid(handle);
                self.despawn_entity(handle);
                Ok(vec![format!("{handle} despawned: {alive}")])
            }
            "quit" | "exit" => {
                info!("Server shutting down");
                std::process::exit(0);
            }
            other => Ok(vec![format!("Unknown command: {other}")]),
        }
    }
}

fn parse_handle(token: Option<&&str>) -> Option<EntityHandle> {
    token
        .map(|t| t.trim_start_matches('#'))
        .and_then(|t| t.parse::<u64>().ok())
        .map(EntityHandle)
}

/// Helper for tests: bind to an ephemeral port.
pub async fn bind_ephemeral(mut cfg: EngineConfig) -> anyhow::Result<(ReplicationServer, EngineConfig)> {
    cfg.server_addr = format!("{}:{}", IpAddr::V4(Ipv4Addr::LOCALHOST), 0);

    // Bind TCP first to get an ephemeral port, then bind UDP to that same port.
    let tcp = ReliableListener::bind(cfg.server_addr.parse()?).await?;
    let addr = tcp.local_addr()?;
    cfg.server_addr = addr.to_string();

    let udp_bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port());
    let udp = UdpSocket::bind(udp_bind).await?;

    Ok((ReplicationServer::from_parts(cfg.clone(), tcp, udp), cfg))
}
