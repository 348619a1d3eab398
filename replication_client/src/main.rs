//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p replication_client -- [--addr 127.0.0.1:40000] [--anchor 0,0,0] [--rate 20]
//!       [--config client.json]
//!
//! The client connects to the server, reports its anchor position at the
//! client update rate and keeps a cache of every entity replicated to it.
//!
//! Console commands:
//!   status              - Show client status
//!   anchor <x> <y> <z>  - Move the anchor
//!   unanchor            - Clear the anchor (only always-relevant entities arrive)
//!   list                - Print known entities
//!   quit                - Exit client

use std::env;
use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::Context;
use replication_client::client::{ClientState, ReplicaClient};
use replication_shared::{config::EngineConfig, math::Vec3};
use tokio::sync::mpsc;
use tracing::info;

fn parse_vec3(s: &str) -> Option<Vec3> {
    let parts: Vec<f32> = s
        .split(',')
        .map(|p| p.trim().parse::<f32>())
        .collect::<Result<_, _>>()
        .ok()?;
    match parts.as_slice() {
        [x, y, z] => Some(Vec3::new(*x, *y, *z)),
        _ => None,
    }
}

fn parse_args(args: &[String]) -> anyhow::Result<(EngineConfig, Option<Vec3>)> {
    // A config file, if given, is the base the other flags override. It has
    // to mirror the server's codec stages for frames to decode.
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let text = std::fs::read_to_string(&args[i + 1])
                .with_context(|| format!("read config {}", args[i + 1]))?;
            EngineConfig::from_json_str(&text).context("parse config")?
        }
        _ => EngineConfig::default(),
    };
    let mut anchor = Some(Vec3::ZERO);

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--anchor" if i + 1 < args.len() => {
                anchor = parse_vec3(&args[i + 1]);
                i += 2;
            }
            "--rate" if i + 1 < args.len() => {
                cfg.replication.client_update_rate = args[i + 1].parse().unwrap_or(20.0);
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok((cfg, anchor))
}

fn exec_console(client: &ReplicaClient, anchor: &mut Option<Vec3>, line: &str) -> Vec<String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        ["status"] => vec![
            format!("State: {:?}", client.state),
            format!("Client ID: {:?}", client.client_id),
            format!("Anchor: {:?}", client.anchor()),
            format!("Known entities: {}", client.replicas.len()),
            format!(
                "Frames: {} received, {} rejected",
                client.frames_received(),
                client.frames_rejected()
            ),
        ],
        ["anchor", x, y, z] => match parse_vec3(&format!("{x},{y},{z}")) {
            Some(v) => {
                *anchor = Some(v);
                vec![format!("Anchor set to {v:?}")]
            }
            None => vec!["Usage: anchor <x> <y> <z>".to_string()],
        },
        ["unanchor"] => {
            *anchor = None;
            vec!["Anchor cleared".to_string()]
        }
        ["list"] => client
            .replicas
            .handles()
            .into_iter()
            .filter_map(|h| client.replicas.latest(h).map(|t| format!("  {h}: {:?}", t.position)))
            .collect(),
        ["quit"] | ["exit"] => std::process::exit(0),
        [] => Vec::new(),
        [other, ..] => vec![format!("Unknown command: {other}")],
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let (cfg, mut anchor) = parse_args(&args)?;
    info!(server = %cfg.server_addr, ?anchor, "Starting client");

    let mut client = ReplicaClient::connect(&cfg).await.context("connect")?;

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

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

    println!("Client connected. Type 'status' for info, 'quit' to exit.");
    println!();

    let update_interval = cfg.replication.client_update_interval().max(Duration::from_millis(5));
    let mut updates = 0u64;

    loop {
        while let Ok(line) = console_rx.try_recv() {
            for out in exec_console(&client, &mut anchor, &line) {
                println!("{out}");
            }
        }

        if client.state == ClientState::Disconnected {
            println!("Disconnected from server.");
            break;
        }

        if let Err(e) = client.send_anchor(anchor).await {
            println!("Anchor update error: {e}");
        }

        // Whatever arrives within one update interval.
        match client.pump_for(update_interval).await {
            Ok(n) => updates += n as u64,
            Err(e) => println!("Receive error: {e}"),
        }

        if updates >= 256 {
            info!(entities = client.replicas.len(), rejected = client.frames_rejected(), "Replicas");
            updates = 0;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("client")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn config_file_sets_codec_stages_and_flags_override() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!("replication_client_cfg_{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{"server_addr":"127.0.0.1:41000","replication":{"encryption_enabled":true,"compression_enabled":true}}"#,
        )?;
        let path_str = path.to_string_lossy().to_string();

        let parsed = parse_args(&args(&["--config", path_str.as_str(), "--addr", "127.0.0.1:42000"]));
        std::fs::remove_file(&path)?;
        let (cfg, anchor) = parsed?;

        assert_eq!(cfg.server_addr, "127.0.0.1:42000");
        assert!(cfg.replication.encryption_enabled);
        assert!(cfg.replication.compression_enabled);
        assert_eq!(anchor, Some(Vec3::ZERO));
        Ok(())
    }

    #[test]
    fn missing_config_file_is_an_error() {
        assert!(parse_args(&args(&["--config", "/nonexistent/replication_client.json"])).is_err());
    }

    #[test]
    fn defaults_without_flags() -> anyhow::Result<()> {
        let (cfg, anchor) = parse_args(&args(&["--anchor", "1,2,3"]))?;
        assert_eq!(cfg.server_addr, EngineConfig::default().server_addr);
        assert!(!cfg.replication.encryption_enabled);
        assert_eq!(anchor, Some(Vec3::new(1.0, 2.0, 3.0)));
        Ok(())
    }
}
