// Configuration management for the relaynet CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/relaynet/config.json
// - Linux: ~/.config/relaynet/config.json
// - Windows: %APPDATA%\relaynet\config.json
//
// RELAY_* environment variables override the file at load time and are never
// written back.

use anyhow::{Context, Result};
use relaynet_core::NodeConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Multiaddrs dialed at start, e.g. /ip4/1.2.3.4/tcp/6000/p2p/12D3...
    pub bootstrap_nodes: Vec<String>,

    /// TCP port for the gossip swarm
    pub listen_port: u16,

    /// Local WebSocket bridge port (0 disables the bridge)
    pub bridge_port: u16,

    /// Tags this node announces for itself
    pub base_tags: Vec<String>,

    /// Peers blocked on every start
    pub blocked_peers: Vec<String>,

    /// Enable mDNS for local network discovery
    pub enable_mdns: bool,

    /// Storage path for messages, policy and identity
    pub storage_path: Option<String>,

    /// Directory for daily-rolling log files; stderr only when unset
    pub log_dir: Option<String>,

    pub dedup_ttl_secs: u64,

    /// Inbound frames processed concurrently
    pub max_in_flight: usize,

    /// Hex Ed25519 secret. Usually supplied via RELAY_PRIVATE_KEY instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap_nodes: vec![],
            listen_port: 6000,
            bridge_port: 6001,
            base_tags: vec![],
            blocked_peers: vec![],
            enable_mdns: true,
            storage_path: None,
            log_dir: None,
            dedup_ttl_secs: 60,
            max_in_flight: 64,
            private_key: None,
        }
    }
}

/// Split a comma-separated list, trimming entries and dropping empty ones.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("relaynet");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("relaynet");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Where the sled database lives
    pub fn storage_dir(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("storage")),
        }
    }

    /// Load config from file (creating the default if missing), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_file()?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load the file alone, for editing.
    pub fn load_file() -> Result<Self> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            let contents =
                std::fs::read_to_string(&config_file).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_file = Self::config_file()?;
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_file, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Apply RELAY_* overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("RELAY_PRIVATE_KEY") {
            let key = key.trim();
            if !key.is_empty() {
                self.private_key = Some(key.to_string());
            }
        }
        if let Some(tags) = lookup("RELAY_BASE_TAGS") {
            self.base_tags = parse_list(&tags);
        }
        if let Some(peers) = lookup("RELAY_BLOCKED_PEERS") {
            self.blocked_peers = parse_list(&peers);
        }
        if let Some(nodes) = lookup("RELAY_BOOTSTRAP_NODES") {
            self.bootstrap_nodes = parse_list(&nodes);
        }
        if let Some(port) = lookup("RELAY_P2P_PORT") {
            self.listen_port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid RELAY_P2P_PORT: {}", port))?;
        }
        if let Some(port) = lookup("RELAY_BRIDGE_PORT") {
            self.bridge_port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid RELAY_BRIDGE_PORT: {}", port))?;
        }
        Ok(())
    }

    pub fn to_node_config(&self) -> NodeConfig {
        NodeConfig {
            listen_port: self.listen_port,
            bridge_port: (self.bridge_port != 0).then_some(self.bridge_port),
            bootstrap_nodes: self.bootstrap_nodes.clone(),
            base_tags: self.base_tags.clone(),
            blocked_peers: self.blocked_peers.clone(),
            private_key: self.private_key.clone(),
            dedup_ttl: Duration::from_secs(self.dedup_ttl_secs.max(1)),
            max_in_flight: self.max_in_flight.max(1),
            enable_mdns: self.enable_mdns,
            ..NodeConfig::default()
        }
    }

    /// Add a bootstrap node
    pub fn add_bootstrap_node(&mut self, node: String) -> Result<()> {
        if !self.bootstrap_nodes.contains(&node) {
            self.bootstrap_nodes.push(node);
            self.save()?;
        }
        Ok(())
    }

    /// Remove a bootstrap node
    pub fn remove_bootstrap_node(&mut self, node: &str) -> Result<()> {
        self.bootstrap_nodes.retain(|n| n != node);
        self.save()?;
        Ok(())
    }

    /// Set a config value in memory; callers persist with `save`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "listen_port" => {
                self.listen_port = value.parse().context("Invalid port number")?;
            }
            "bridge_port" => {
                self.bridge_port = value.parse().context("Invalid port number")?;
            }
            "enable_mdns" => {
                self.enable_mdns = value.parse().context("Invalid boolean value")?;
            }
            "base_tags" => self.base_tags = parse_list(value),
            "blocked_peers" => self.blocked_peers = parse_list(value),
            "storage_path" => {
                self.storage_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "log_dir" => {
                self.log_dir = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "dedup_ttl_secs" => {
                self.dedup_ttl_secs = value.parse().context("Invalid number")?;
            }
            "max_in_flight" => {
                self.max_in_flight = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "listen_port" => Some(self.listen_port.to_string()),
            "bridge_port" => Some(self.bridge_port.to_string()),
            "enable_mdns" => Some(self.enable_mdns.to_string()),
            "base_tags" => Some(self.base_tags.join(",")),
            "blocked_peers" => Some(self.blocked_peers.join(",")),
            "storage_path" => self.storage_path.clone(),
            "log_dir" => self.log_dir.clone(),
            "dedup_ttl_secs" => Some(self.dedup_ttl_secs.to_string()),
            "max_in_flight" => Some(self.max_in_flight.to_string()),
            _ => None,
        }
    }

    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("listen_port".to_string(), self.listen_port.to_string()),
            ("bridge_port".to_string(), self.bridge_port.to_string()),
            ("enable_mdns".to_string(), self.enable_mdns.to_string()),
            ("base_tags".to_string(), self.base_tags.join(",")),
            ("blocked_peers".to_string(), self.blocked_peers.join(",")),
            (
                "storage_path".to_string(),
                self.storage_path.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
            (
                "log_dir".to_string(),
                self.log_dir.clone().unwrap_or_else(|| "(stderr)".to_string()),
            ),
            ("dedup_ttl_secs".to_string(), format!("{}s", self.dedup_ttl_secs)),
            ("max_in_flight".to_string(), self.max_in_flight.to_string()),
            ("bootstrap_nodes".to_string(), self.bootstrap_nodes.len().to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_port, 6000);
        assert_eq!(config.bridge_port, 6001);
        assert!(config.enable_mdns);
        assert_eq!(config.dedup_ttl_secs, 60);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("private_key"));
        let deserialized: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config.listen_port, deserialized.listen_port);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = serde_json::from_str(r#"{"listen_port": 7000}"#).unwrap();
        assert_eq!(config.listen_port, 7000);
        assert_eq!(config.bridge_port, 6001);
    }

    #[test]
    fn test_parse_list_trims_and_drops_empty() {
        assert_eq!(parse_list(" a, b ,,c ,"), vec!["a", "b", "c"]);
        assert!(parse_list("").is_empty());
        assert!(parse_list(" , ").is_empty());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(env(&[
                ("RELAY_BASE_TAGS", "news, weather"),
                ("RELAY_BLOCKED_PEERS", "p1,,p2"),
                ("RELAY_BOOTSTRAP_NODES", "/ip4/10.0.0.1/tcp/6000"),
                ("RELAY_P2P_PORT", "7100"),
                ("RELAY_BRIDGE_PORT", "0"),
                ("RELAY_PRIVATE_KEY", " abcd "),
            ]))
            .unwrap();

        assert_eq!(config.base_tags, vec!["news", "weather"]);
        assert_eq!(config.blocked_peers, vec!["p1", "p2"]);
        assert_eq!(config.bootstrap_nodes, vec!["/ip4/10.0.0.1/tcp/6000"]);
        assert_eq!(config.listen_port, 7100);
        assert_eq!(config.private_key.as_deref(), Some("abcd"));

        let node = config.to_node_config();
        assert_eq!(node.listen_port, 7100);
        assert_eq!(node.bridge_port, None);
        assert_eq!(node.base_tags, vec!["news", "weather"]);
    }

    #[test]
    fn test_invalid_port_override_is_an_error() {
        let mut config = Config::default();
        assert!(config
            .apply_overrides(env(&[("RELAY_P2P_PORT", "not-a-port")]))
            .is_err());
    }

    #[test]
    fn test_set_get_roundtrip() {
        let mut config = Config::default();
        config.set("base_tags", "a, b").unwrap();
        config.set("bridge_port", "0").unwrap();
        assert_eq!(config.get("base_tags").as_deref(), Some("a,b"));
        assert_eq!(config.to_node_config().bridge_port, None);
        assert!(config.set("no_such_key", "1").is_err());
        assert!(config.get("no_such_key").is_none());
    }
}
