//! Configuration system.
//!
//! Loads engine configuration from JSON strings/files (file IO left to app).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::entity::EntityHandle;

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Server listen address, e.g. `127.0.0.1:40000`.
    pub server_addr: String,
    /// Replication tuning.
    #[serde(default)]
    pub replication: ReplicationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:40000".to_string(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

/// Options recognized by the replication scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Sphere radius (world units) around a client anchor inside which entities are relevant.
    pub relevance_distance: f32,
    /// Byte ceiling of the bandwidth window.
    pub max_bytes_per_window: u64,
    /// Scheduler ticks per second.
    pub server_update_rate: f32,
    /// How often clients report their anchor, per second.
    pub client_update_rate: f32,
    /// Soft cap, informational only.
    pub max_entities_per_tick: usize,
    pub compression_enabled: bool,
    pub encryption_enabled: bool,
    /// Per-field tolerance for change detection. Zero compares exact bytes.
    pub change_tolerance: f32,
    /// Entities relevant to every client regardless of distance.
    pub always_relevant_overrides: Vec<EntityHandle>,
    /// Host steps between two stale-handle sweeps.
    pub optimize_interval_ticks: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            relevance_distance: 50_000.0,
            max_bytes_per_window: 1024 * 1024,
            server_update_rate: 30.0,
            client_update_rate: 20.0,
            max_entities_per_tick: 100,
            compression_enabled: false,
            encryption_enabled: false,
            change_tolerance: 0.0,
            always_relevant_overrides: Vec::new(),
            optimize_interval_ticks: 150,
        }
    }
}

impl ReplicationConfig {
    /// Minimum spacing between two scheduler ticks.
    ///
    /// A non-positive rate disables the gate.
    pub fn server_tick_interval(&self) -> Duration {
        rate_to_interval(self.server_update_rate)
    }

    pub fn client_update_interval(&self) -> Duration {
        rate_to_interval(self.client_update_rate)
    }
}

fn rate_to_interval(hz: f32) -> Duration {
    if hz.is_finite() && hz > 0.0 {
        Duration::from_secs_f64(1.0 / hz as f64)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg = EngineConfig::from_json_str(
            r#"{ "server_addr": "0.0.0.0:1", "replication": { "max_bytes_per_window": 10, "always_relevant_overrides": [7] } }"#,
        )
        .unwrap();
        assert_eq!(cfg.replication.max_bytes_per_window, 10);
        assert_eq!(cfg.replication.always_relevant_overrides, vec![EntityHandle(7)]);
        assert_eq!(cfg.replication.server_update_rate, 30.0);
        assert!(!cfg.replication.compression_enabled);
    }

    #[test]
    fn tick_interval_from_rate() {
        let cfg = ReplicationConfig {
            server_update_rate: 10.0,
            ..Default::default()
        };
        assert_eq!(cfg.server_tick_interval(), Duration::from_millis(100));

        let off = ReplicationConfig {
            server_update_rate: 0.0,
            ..Default::default()
        };
        assert_eq!(off.server_tick_interval(), Duration::ZERO);
    }
}
