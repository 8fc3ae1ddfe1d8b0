//! Configuration for the radionet runner.
//!
//! Settings come from a YAML file, then `RADIONET_*` environment
//! variables, then command line flags, each overriding the previous.

use anyhow::Result;
use radionet_node::{NodeConfig, Role};
use radionet_storage::StorageMode;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioNetConfig {
    /// Engine settings
    pub node: NodeConfig,
    /// Persistent state backend
    pub storage: StorageMode,
    /// Simulated radio
    pub radio: RadioConfig,
    /// Controller bridge (gateway only)
    pub bridge: BridgeConfig,
    /// Seconds between stats log lines, 0 to disable
    pub stats_interval_secs: u64,
}

impl Default for RadioNetConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            storage: StorageMode::default(),
            radio: RadioConfig::default(),
            bridge: BridgeConfig::default(),
            stats_interval_secs: 60,
        }
    }
}

/// UDP multicast radio settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Multicast group every node joins
    pub group: Ipv4Addr,
    /// UDP port
    pub port: u16,
    /// Local interface for multicast
    pub interface: Ipv4Addr,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 255, 77, 77),
            port: 47777,
            interface: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// Text bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// TCP listen address
    pub listen: SocketAddr,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 5003)),
        }
    }
}

impl RadioNetConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<RadioNetConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());

        info!(
            "Final configuration: role={}, node_id={:?}, parent={:?}, storage={:?}",
            config.node.role, config.node.node_id, config.node.parent_node_id, config.storage
        );
        Ok(config)
    }

    /// Apply `RADIONET_*` overrides read through `lookup`
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(role) = lookup("RADIONET_ROLE") {
            match parse_role(&role) {
                Some(r) => {
                    self.node.role = r;
                    info!("Role overridden by environment: {}", r);
                }
                None => warn!("Ignoring unknown RADIONET_ROLE {:?}", role),
            }
        }

        if let Some(id) = lookup("RADIONET_NODE_ID").and_then(|v| v.parse::<u8>().ok()) {
            self.node.node_id = Some(id);
            info!("Node id overridden by environment: {}", id);
        }

        if let Some(parent) = lookup("RADIONET_PARENT_ID").and_then(|v| v.parse::<u8>().ok()) {
            self.node.parent_node_id = Some(parent);
            info!("Parent overridden by environment: {}", parent);
        }

        if let Some(path) = lookup("RADIONET_STORAGE_PATH") {
            self.storage = StorageMode::File {
                path: PathBuf::from(path),
                fsync_every: 1,
            };
        }

        if let Some(listen) = lookup("RADIONET_BRIDGE_LISTEN").and_then(|v| v.parse().ok()) {
            self.bridge.listen = listen;
            info!("Bridge address overridden by environment: {}", listen);
        }
    }
}

/// Parse a role name as written in YAML
pub fn parse_role(s: &str) -> Option<Role> {
    match s.to_ascii_lowercase().as_str() {
        "sensor" => Some(Role::Sensor),
        "repeater" => Some(Role::Repeater),
        "gateway" => Some(Role::Gateway),
        _ => None,
    }
}
