//! Configuration for the space server.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use spacelink_core::{LinkConfig, RegistryConfig, SchedulerConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceConfig {
    /// Numeric id of this server; also its slot in the segmentation.
    pub server_id: u32,
    /// Other space servers this one forwards to.
    pub peers: Vec<PeerConfig>,
    /// Listen addresses and link tuning.
    pub network: NetworkConfig,
    /// Outbound fair scheduling.
    pub scheduler: SchedulerSection,
    /// Object-host registry behaviour.
    pub registry: RegistrySection,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address object hosts connect to.
    pub oh_listen: String,
    /// Address peer space servers connect to.
    pub peer_listen: String,
    /// Frames buffered per link before it reports backpressure.
    pub link_capacity: usize,
    /// Largest accepted frame in bytes.
    pub max_frame_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Frames sent per service round.
    pub max_messages_per_round: usize,
    /// Capacity estimator window in milliseconds.
    pub capacity_window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// Use the accepted stream as the session (no separate session layer).
    pub bind_session_on_accept: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

/// One peer space server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: u32,
    /// `host:port` of the peer's `peer_listen` address.
    pub address: String,
    /// Fair-queue weight of traffic towards this peer.
    #[serde(default = "default_peer_weight")]
    pub weight: f64,
}

fn default_peer_weight() -> f64 {
    1.0
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            server_id: 1,
            peers: Vec::new(),
            network: NetworkConfig::default(),
            scheduler: SchedulerSection::default(),
            registry: RegistrySection::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            oh_listen: "0.0.0.0:7777".into(),
            peer_listen: "0.0.0.0:7778".into(),
            link_capacity: spacelink_core::DEFAULT_LINK_CAPACITY,
            max_frame_size: spacelink_core::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_messages_per_round: spacelink_core::scheduler::DEFAULT_MAX_MESSAGES_PER_ROUND,
            capacity_window_ms: 1000,
        }
    }
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            bind_session_on_accept: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl SpaceConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_messages_per_round: self.scheduler.max_messages_per_round.clamp(1, 10_000),
            capacity_window: Duration::from_millis(self.scheduler.capacity_window_ms.max(1)),
        }
    }

    pub fn to_registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            bind_session_on_accept: self.registry.bind_session_on_accept,
            max_frame_size: self.max_frame_size(),
        }
    }

    pub fn to_link_config(&self) -> LinkConfig {
        LinkConfig {
            capacity: self.network.link_capacity.clamp(1, 65_536),
            max_frame_size: self.max_frame_size(),
        }
    }

    fn max_frame_size(&self) -> usize {
        self.network.max_frame_size.clamp(1024, 16 * 1024 * 1024)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = SpaceConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("oh_listen"));
        assert!(text.contains("max_messages_per_round"));
    }

    #[test]
    fn peers_parse_with_default_weight() {
        let text = r#"
            server_id = 2

            [network]
            oh_listen = "127.0.0.1:9000"

            [[peers]]
            id = 1
            address = "10.0.0.1:7778"

            [[peers]]
            id = 3
            address = "10.0.0.3:7778"
            weight = 2.5
        "#;
        let cfg: SpaceConfig = toml::from_str(text).unwrap();
        assert_eq!(cfg.server_id, 2);
        assert_eq!(cfg.network.oh_listen, "127.0.0.1:9000");
        assert_eq!(cfg.network.peer_listen, "0.0.0.0:7778");
        assert_eq!(cfg.peers.len(), 2);
        assert_eq!(cfg.peers[0].weight, 1.0);
        assert_eq!(cfg.peers[1].weight, 2.5);
    }

    #[test]
    fn conversions_clamp() {
        let mut cfg = SpaceConfig::default();
        cfg.scheduler.max_messages_per_round = 0;
        cfg.scheduler.capacity_window_ms = 0;
        cfg.network.link_capacity = 0;
        cfg.network.max_frame_size = 10;

        let sched = cfg.to_scheduler_config();
        assert_eq!(sched.max_messages_per_round, 1);
        assert_eq!(sched.capacity_window, Duration::from_millis(1));
        assert_eq!(cfg.to_link_config().capacity, 1);
        assert_eq!(cfg.to_registry_config().max_frame_size, 1024);
        assert!(cfg.to_registry_config().bind_session_on_accept);
    }

    #[test]
    fn written_default_loads_back() {
        let path = std::env::temp_dir().join(format!("spacelink-space-{}.toml", std::process::id()));
        SpaceConfig::write_default(&path).unwrap();
        let cfg = SpaceConfig::load(&path);
        std::fs::remove_file(&path).ok();
        assert_eq!(cfg.network.oh_listen, "0.0.0.0:7777");
        assert!(cfg.peers.is_empty());
    }
}
