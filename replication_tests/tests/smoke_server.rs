use rand::{rngs::StdRng, SeedableRng};
use replication_server::server::bind_ephemeral;
use replication_shared::config::{EngineConfig, ReplicationConfig};

/// Smoke test: server can run a few ticks without panicking.
#[tokio::test]
async fn server_runs_few_ticks() -> anyhow::Result<()> {
    let (mut server, _cfg) = bind_ephemeral(EngineConfig::default()).await?;
    server.run_for_ticks(3).await?;
    Ok(())
}

/// Smoke test: a populated demo world replicates and sweeps without clients.
#[tokio::test]
async fn demo_world_replicates_and_sweeps() -> anyhow::Result<()> {
    let cfg = EngineConfig {
        replication: ReplicationConfig {
            server_update_rate: 100.0,
            optimize_interval_ticks: 2,
            ..Default::default()
        },
        ..Default::default()
    };
    let (mut server, _cfg) = bind_ephemeral(cfg).await?;
    let handles = server.spawn_demo_entities(16, 50.0, &mut StdRng::seed_from_u64(7));
    assert_eq!(handles.len(), 16);

    server.despawn_entity(handles[0]);
    server.run_for_ticks(4).await?;

    let stats = server.scheduler().statistics();
    assert!(stats.ticks_processed >= 1);
    assert!(stats.total_entities_replicated >= 15);
    assert_eq!(server.scheduler().registry().len(), 15);
    assert_eq!(server.frames_sent(), 0);
    Ok(())
}
