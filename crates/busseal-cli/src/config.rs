//! Configuration system for the BusSeal CLI.

use anyhow::Context;
use busseal_core::{GroupConfig, HeaderType, KeyStore, NodeId, SessionConfig};
use busseal_transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

/// BusSeal configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node configuration
    #[serde(default)]
    pub node: NodeConfig,
    /// Bus configuration
    #[serde(default)]
    pub bus: BusConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Provisioned groups
    #[serde(default)]
    pub groups: Vec<GroupEntry>,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identifier on the bus
    #[serde(default = "default_node_id")]
    pub id: u8,
    /// Group identifier width in frame headers
    #[serde(default)]
    pub header_type: HeaderType,
    /// Reject handshake responses older than this many milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handshake_timeout_ms: Option<u64>,
    /// Send counter limit per session
    #[serde(default = "default_max_counter")]
    pub max_counter: u32,
    /// Additional group files to provision from
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_files: Vec<PathBuf>,
}

/// Bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Multicast group emulating the bus
    #[serde(default = "default_multicast_group")]
    pub group: String,
    /// UDP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface address to join on
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Frame identifier of this node's frames (node id is added)
    #[serde(default = "default_frame_id_base")]
    pub frame_id_base: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// One provisioned group
#[derive(Clone, Serialize, Deserialize)]
pub struct GroupEntry {
    /// Group identifier
    pub id: u32,
    /// Long-term key (64 hex characters)
    pub key: String,
    /// Member node identifiers
    pub members: Vec<u8>,
}

impl std::fmt::Debug for GroupEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupEntry")
            .field("id", &self.id)
            .field("key", &"[REDACTED]")
            .field("members", &self.members)
            .finish()
    }
}

impl GroupEntry {
    /// Decode into a provisioning record.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not valid hex.
    pub fn to_group_config(&self) -> anyhow::Result<GroupConfig> {
        let key = Zeroizing::new(
            hex::decode(self.key.trim())
                .with_context(|| format!("group {}: key is not valid hex", self.id))?,
        );
        Ok(GroupConfig {
            id: self.id,
            long_term_key: key.to_vec(),
            members: self.members.clone(),
        })
    }
}

// Default values

fn default_node_id() -> u8 {
    1
}

fn default_max_counter() -> u32 {
    u32::MAX
}

fn default_multicast_group() -> String {
    TransportConfig::default().group.to_string()
}

fn default_port() -> u16 {
    TransportConfig::default().port
}

fn default_interface() -> String {
    Ipv4Addr::UNSPECIFIED.to_string()
}

fn default_frame_id_base() -> u32 {
    0x100
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            header_type: HeaderType::default(),
            handshake_timeout_ms: None,
            max_counter: default_max_counter(),
            group_files: Vec::new(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            group: default_multicast_group(),
            port: default_port(),
            interface: default_interface(),
            frame_id_base: default_frame_id_base(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Load one group provisioning file.
///
/// The file holds a single group table: `id`, `key` (hex) and `members`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_group<P: AsRef<Path>>(path: P) -> anyhow::Result<GroupConfig> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("cannot read group file {}", path.display()))?;
    let entry: GroupEntry = toml::from_str(&contents)
        .with_context(|| format!("cannot parse group file {}", path.display()))?;
    entry.to_group_config()
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("cannot parse config {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("busseal/config.toml")
    }

    /// Node identifier
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.node.id)
    }

    /// Frame identifier for this node's outbound frames
    #[must_use]
    pub fn frame_id(&self) -> u32 {
        self.bus.frame_id_base.wrapping_add(u32::from(self.node.id))
    }

    /// Session settings for the protocol core
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::default()
            .with_header_type(self.node.header_type)
            .with_max_counter(self.node.max_counter);
        if let Some(ms) = self.node.handshake_timeout_ms {
            config = config.with_handshake_timeout(Duration::from_millis(ms));
        }
        config
    }

    /// Multicast bus settings
    ///
    /// # Errors
    ///
    /// Returns an error if an address cannot be parsed.
    pub fn transport_config(&self) -> anyhow::Result<TransportConfig> {
        let group: Ipv4Addr = self
            .bus
            .group
            .parse()
            .with_context(|| format!("invalid multicast group: {}", self.bus.group))?;
        let interface: Ipv4Addr = self
            .bus
            .interface
            .parse()
            .with_context(|| format!("invalid interface address: {}", self.bus.interface))?;
        Ok(TransportConfig {
            group,
            port: self.bus.port,
            interface,
            ..TransportConfig::default()
        })
    }

    /// All provisioning records: inline groups followed by group files.
    ///
    /// # Errors
    ///
    /// Returns an error if a key is not hex or a group file cannot be loaded.
    pub fn group_configs(&self) -> anyhow::Result<Vec<GroupConfig>> {
        let mut configs = self
            .groups
            .iter()
            .map(GroupEntry::to_group_config)
            .collect::<anyhow::Result<Vec<_>>>()?;
        for path in &self.node.group_files {
            configs.push(load_group(path)?);
        }
        Ok(configs)
    }

    /// Build the key store.
    ///
    /// # Errors
    ///
    /// Returns an error if any group is invalid.
    pub fn keystore(&self) -> anyhow::Result<KeyStore> {
        let configs = self.group_configs()?;
        Ok(KeyStore::from_configs(&configs)?)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.transport_config()?.validate()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.node.max_counter == 0 {
            anyhow::bail!("max_counter must be at least 1");
        }

        let keystore = self.keystore()?;
        if keystore.groups_of(self.node_id()).next().is_none() {
            anyhow::bail!("node {} is not a member of any group", self.node.id);
        }

        let max_gid = self.node.header_type.max_group_id();
        for group in keystore.groups_of(self.node_id()) {
            if group.id().as_u16() > max_gid {
                anyhow::bail!(
                    "group {} does not fit the {:?} header type",
                    group.id(),
                    self.node.header_type
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn config_with_group() -> Config {
        Config {
            groups: vec![GroupEntry {
                id: 1,
                key: KEY.to_string(),
                members: vec![1, 2],
            }],
            ..Config::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.id, 1);
        assert_eq!(config.node.header_type, HeaderType::Extended);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.frame_id(), 0x101);
    }

    #[test]
    fn test_config_validation() {
        let mut config = config_with_group();
        assert!(config.validate().is_ok());

        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        config.node.id = 9;
        assert!(config.validate().is_err());

        config.node.id = 1;
        config.groups[0].key = "abcd".to_string();
        assert!(config.validate().is_err());

        config.groups[0].key = KEY.to_string();
        config.bus.group = "10.0.0.1".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_compact_header_rejects_large_group() {
        let mut config = config_with_group();
        config.groups[0].id = 300;
        config.node.header_type = HeaderType::Compact;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_config() {
        let mut config = config_with_group();
        config.node.handshake_timeout_ms = Some(250);
        config.node.header_type = HeaderType::Compact;
        let session = config.session_config();
        assert_eq!(session.handshake_timeout, Some(Duration::from_millis(250)));
        assert_eq!(session.header_type, HeaderType::Compact);
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        config_with_group().save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.groups.len(), 1);
        assert_eq!(loaded.groups[0].members, vec![1, 2]);
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn test_parse_minimal_file() {
        let toml_str = format!(
            r#"
            [node]
            id = 2
            header_type = "compact"

            [[groups]]
            id = 7
            key = "{KEY}"
            members = [1, 2]
            "#
        );
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.node.id, 2);
        assert_eq!(config.node.header_type, HeaderType::Compact);
        assert_eq!(config.bus.port, TransportConfig::default().port);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_group_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "id = 3\nkey = \"{KEY}\"\nmembers = [4, 5]").unwrap();

        let group = load_group(file.path()).unwrap();
        assert_eq!(group.id, 3);
        assert_eq!(group.long_term_key.len(), 32);
        assert_eq!(group.members, vec![4, 5]);

        assert!(load_group("/nonexistent/group.toml").is_err());
    }
}
