//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p replication_server -- [--addr 127.0.0.1:40000] [--rate 30]
//!       [--config server.json] [--demo-entities 64] [--budget 1048576]
//!
//! The server accepts clients, simulates a handful of drifting entities and
//! replicates them to every client they are relevant to.
//!
//! Admin commands:
//!   status                       - Show server status
//!   stats                        - Dump replication statistics
//!   force <entity>               - Force the next due-check of an entity
//!   priority <entity> <level>    - Change an entity's priority
//!   frequency <entity> <level>   - Change an entity's frequency
//!   relevant <client>            - List entities relevant to a client
//!   despawn <entity>             - Remove an entity from the world
//!   reset_budget                 - Clear the bandwidth window
//!   reset_stats                  - Clear statistics
//!   optimize                     - Purge stale registrations now
//!   quit                         - Shutdown server

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use replication_server::server::ReplicationServer;
use replication_shared::config::EngineConfig;
use tokio::sync::mpsc;
use tracing::{info, warn};

struct Args {
    cfg: EngineConfig,
    demo_entities: usize,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();

    // A config file, if given, is the base the other flags override.
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let text = std::fs::read_to_string(&args[i + 1])
                .with_context(|| format!("read config {}", args[i + 1]))?;
            EngineConfig::from_json_str(&text).context("parse config")?
        }
        _ => EngineConfig::default(),
    };
    let mut demo_entities = 32;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--rate" if i + 1 < args.len() => {
                cfg.replication.server_update_rate = args[i + 1].parse().unwrap_or(30.0);
                i += 2;
            }
            "--budget" if i + 1 < args.len() => {
                cfg.replication.max_bytes_per_window =
                    args[i + 1].parse().unwrap_or(cfg.replication.max_bytes_per_window);
                i += 2;
            }
            "--demo-entities" if i + 1 < args.len() => {
                demo_entities = args[i + 1].parse().unwrap_or(demo_entities);
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(Args { cfg, demo_entities })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Args { cfg, demo_entities } = parse_args()?;
    info!(
        addr = %cfg.server_addr,
        rate = cfg.replication.server_update_rate,
        budget = cfg.replication.max_bytes_per_window,
        "Starting server"
    );

    let mut server = ReplicationServer::new(cfg.clone())
        .await
        .context("create server")?;
    let local = server.local_addr()?;
    info!(%local, "Server listening");

    let spawned = server.spawn_demo_entities(demo_entities, 200.0, &mut rand::thread_rng());
    info!(entities = spawned.len(), "Demo world populated");

    // Set up admin input channel.
    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'status', 'stats' or 'quit'.");
    println!();

    // Poll faster than the scheduler rate; the tick gate keeps it honest.
    let poll_interval = (cfg.replication.server_tick_interval() / 2).max(std::time::Duration::from_millis(1));
    let mut next_poll = tokio::time::Instant::now();

    loop {
        match server.try_accept(std::time::Duration::from_millis(1)).await {
            Ok(Some(cid)) => info!(client_id = ?cid, "New client accepted"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Handshake failed"),
        }

        server.step(poll_interval.as_secs_f32()).await?;

        next_poll += poll_interval;
        tokio::time::sleep_until(next_poll).await;
    }
}
