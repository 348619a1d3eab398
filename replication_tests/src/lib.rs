//! Shared fixtures for the integration tests.

use std::time::Duration;

use replication_client::ReplicaClient;
use replication_server::{server::bind_ephemeral, ReplicationServer};
use replication_shared::{
    config::{EngineConfig, ReplicationConfig},
    math::Vec3,
    net::ClientId,
};

/// Ten scheduling passes per second, 100 unit relevance radius.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        replication: ReplicationConfig {
            relevance_distance: 100.0,
            server_update_rate: 10.0,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Binds a server and completes one client handshake against it.
pub async fn connected_pair(
    cfg: EngineConfig,
) -> anyhow::Result<(ReplicationServer, ReplicaClient, ClientId)> {
    let (mut server, cfg) = bind_ephemeral(cfg).await?;
    let (accepted, client) = tokio::join!(server.accept_one(), ReplicaClient::connect(&cfg));
    Ok((server, client?, accepted?))
}

/// Reports an anchor and waits for the datagram to reach the server socket.
pub async fn anchor_and_settle(client: &mut ReplicaClient, anchor: Vec3) -> anyhow::Result<()> {
    client.send_anchor(Some(anchor)).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
