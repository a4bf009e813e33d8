//! Node configuration.
//!
//! Values come from three places, later ones winning: built-in defaults,
//! an optional JSON file ([`NodeConfig::from_json_file`]), and whatever the
//! embedding code or the CLI sets through [`NodeConfigBuilder`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use minnow_transport::{ProxyUri, TransportConfig};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::port::QueueSizes;

/// Default delay before reconnecting to the next proxy.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Default upper bound on one event wait.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(2);
/// Default capacity of the pending-message table.
pub const DEFAULT_MAX_PENDING_MSGS: usize = 10;
/// Default number of actors a node hosts.
pub const DEFAULT_MAX_ACTORS: usize = 10;
/// Default number of links and of tunnels.
pub const DEFAULT_MAX_CHANNELS: usize = 10;
/// Default queue size for ports whose descriptor carries no queue size.
pub const DEFAULT_FIFO_SIZE: u32 = 5;
/// Default limit on the queue size a port descriptor may ask for.
pub const DEFAULT_MAX_FIFO_SIZE: u32 = 64;

/// Per-node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    name: String,
    node_id: Option<String>,
    proxy_uris: Vec<ProxyUri>,
    vid: u32,
    pid: u32,
    reconnect_delay: Duration,
    inactivity_timeout: Duration,
    max_pending_msgs: usize,
    max_actors: usize,
    max_links: usize,
    max_tunnels: usize,
    fifo_size: u32,
    max_fifo_size: u32,
    max_token_size: usize,
    state_file: Option<PathBuf>,
    checkpoint: bool,
    transport: TransportConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "minnow".to_string(),
            node_id: None,
            proxy_uris: Vec::new(),
            vid: 0,
            pid: 0,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            max_pending_msgs: DEFAULT_MAX_PENDING_MSGS,
            max_actors: DEFAULT_MAX_ACTORS,
            max_links: DEFAULT_MAX_CHANNELS,
            max_tunnels: DEFAULT_MAX_CHANNELS,
            fifo_size: DEFAULT_FIFO_SIZE,
            max_fifo_size: DEFAULT_MAX_FIFO_SIZE,
            max_token_size: minnow_core::MAX_TOKEN_SIZE,
            state_file: None,
            checkpoint: false,
            transport: TransportConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Start building a node configuration.
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::default()
    }

    /// Load a JSON config file on top of the defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<NodeConfig, ConfigError> {
        NodeConfigBuilder::default().json_file(path)?.build()
    }

    /// Human-readable node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fixed runtime id; a random one is generated when unset.
    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    /// Proxies tried in round-robin order.
    pub fn proxy_uris(&self) -> &[ProxyUri] {
        &self.proxy_uris
    }

    /// Vendor id announced in PROXY_CONFIG.
    pub fn vid(&self) -> u32 {
        self.vid
    }

    /// Product id announced in PROXY_CONFIG.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Fixed delay before retrying after a disconnect.
    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    /// Longest single event wait.
    pub fn inactivity_timeout(&self) -> Duration {
        self.inactivity_timeout
    }

    /// Capacity of the pending-message table.
    pub fn max_pending_msgs(&self) -> usize {
        self.max_pending_msgs
    }

    /// Capacity of the actor table.
    pub fn max_actors(&self) -> usize {
        self.max_actors
    }

    /// Capacity of the link table.
    pub fn max_links(&self) -> usize {
        self.max_links
    }

    /// Capacity of the tunnel table.
    pub fn max_tunnels(&self) -> usize {
        self.max_tunnels
    }

    /// Queue size used when a port descriptor does not carry one.
    pub fn fifo_size(&self) -> u32 {
        self.fifo_size
    }

    /// Largest queue a port descriptor may ask for.
    pub fn max_fifo_size(&self) -> u32 {
        self.max_fifo_size
    }

    /// Queue sizes handed to port construction.
    pub fn queue_sizes(&self) -> QueueSizes {
        QueueSizes::new(self.fifo_size, self.max_fifo_size)
    }

    /// Largest token accepted from a peer.
    pub fn max_token_size(&self) -> usize {
        self.max_token_size
    }

    /// Where node state is persisted, if anywhere.
    pub fn state_file(&self) -> Option<&Path> {
        self.state_file.as_deref()
    }

    /// Whether state is written after every tick that changed it.
    pub fn checkpoint(&self) -> bool {
        self.checkpoint
    }

    /// Transport settings.
    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }
}

/// On-disk shape of a config file. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    name: Option<String>,
    node_id: Option<String>,
    proxy_uris: Option<Vec<String>>,
    vid: Option<u32>,
    pid: Option<u32>,
    reconnect_delay_ms: Option<u64>,
    inactivity_timeout_ms: Option<u64>,
    max_pending_msgs: Option<usize>,
    max_actors: Option<usize>,
    max_links: Option<usize>,
    max_tunnels: Option<usize>,
    fifo_size: Option<u32>,
    max_fifo_size: Option<u32>,
    max_token_size: Option<usize>,
    state_file: Option<PathBuf>,
    checkpoint: Option<bool>,
}

/// Builder for [`NodeConfig`].
#[derive(Debug, Clone, Default)]
pub struct NodeConfigBuilder {
    config: NodeConfig,
    uris: Vec<String>,
}

impl NodeConfigBuilder {
    /// Apply every field present in a JSON config file.
    pub fn json_file(self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        self.json_str(&text)
    }

    /// Apply every field present in a JSON document.
    pub fn json_str(mut self, text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_json::from_str(text)?;
        let c = &mut self.config;
        if let Some(v) = file.name {
            c.name = v;
        }
        if file.node_id.is_some() {
            c.node_id = file.node_id;
        }
        if let Some(v) = file.proxy_uris {
            self.uris = v;
        }
        if let Some(v) = file.vid {
            c.vid = v;
        }
        if let Some(v) = file.pid {
            c.pid = v;
        }
        if let Some(v) = file.reconnect_delay_ms {
            c.reconnect_delay = Duration::from_millis(v);
        }
        if let Some(v) = file.inactivity_timeout_ms {
            c.inactivity_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.max_pending_msgs {
            c.max_pending_msgs = v;
        }
        if let Some(v) = file.max_actors {
            c.max_actors = v;
        }
        if let Some(v) = file.max_links {
            c.max_links = v;
        }
        if let Some(v) = file.max_tunnels {
            c.max_tunnels = v;
        }
        if let Some(v) = file.fifo_size {
            c.fifo_size = v;
        }
        if let Some(v) = file.max_fifo_size {
            c.max_fifo_size = v;
        }
        if let Some(v) = file.max_token_size {
            c.max_token_size = v;
        }
        if file.state_file.is_some() {
            c.state_file = file.state_file;
        }
        if let Some(v) = file.checkpoint {
            c.checkpoint = v;
        }
        Ok(self)
    }

    /// Set the node name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Use a fixed runtime id.
    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.config.node_id = Some(id.into());
        self
    }

    /// Append a proxy URI (`calvinip://host:port`).
    pub fn proxy_uri(mut self, uri: impl Into<String>) -> Self {
        self.uris.push(uri.into());
        self
    }

    /// Replace the proxy list.
    pub fn proxy_uris(mut self, uris: Vec<String>) -> Self {
        self.uris = uris;
        self
    }

    /// Set vendor and product ids.
    pub fn ids(mut self, vid: u32, pid: u32) -> Self {
        self.config.vid = vid;
        self.config.pid = pid;
        self
    }

    /// Set the vendor id.
    pub fn vid(mut self, vid: u32) -> Self {
        self.config.vid = vid;
        self
    }

    /// Set the product id.
    pub fn pid(mut self, pid: u32) -> Self {
        self.config.pid = pid;
        self
    }

    /// Set the reconnect delay.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    /// Set the longest event wait.
    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.config.inactivity_timeout = timeout;
        self
    }

    /// Set the pending-message table capacity.
    pub fn max_pending_msgs(mut self, n: usize) -> Self {
        self.config.max_pending_msgs = n;
        self
    }

    /// Set the actor table capacity.
    pub fn max_actors(mut self, n: usize) -> Self {
        self.config.max_actors = n;
        self
    }

    /// Set the default queue size.
    pub fn fifo_size(mut self, n: u32) -> Self {
        self.config.fifo_size = n;
        self
    }

    /// Set the largest queue size accepted from a descriptor.
    pub fn max_fifo_size(mut self, n: u32) -> Self {
        self.config.max_fifo_size = n;
        self
    }

    /// Persist state to `path`.
    pub fn state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.state_file = Some(path.into());
        self
    }

    /// Write state after every tick that changed it.
    pub fn checkpoint(mut self, enabled: bool) -> Self {
        self.config.checkpoint = enabled;
        self
    }

    /// Set transport settings.
    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.config.transport = transport;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<NodeConfig, ConfigError> {
        let mut config = self.config;
        config.proxy_uris = self
            .uris
            .iter()
            .map(|u| u.parse::<ProxyUri>())
            .collect::<Result<_, _>>()?;

        if config.max_pending_msgs == 0 {
            return Err(ConfigError::Invalid("max_pending_msgs must be > 0".to_string()));
        }
        if config.max_actors == 0 || config.max_links == 0 || config.max_tunnels == 0 {
            return Err(ConfigError::Invalid("table capacities must be > 0".to_string()));
        }
        if config.fifo_size < 2 {
            return Err(ConfigError::Invalid(format!(
                "fifo_size must be >= 2, got {}",
                config.fifo_size
            )));
        }
        if config.max_fifo_size < config.fifo_size {
            return Err(ConfigError::Invalid(format!(
                "max_fifo_size {} is below fifo_size {}",
                config.max_fifo_size, config.fifo_size
            )));
        }
        if config.inactivity_timeout.is_zero() {
            return Err(ConfigError::Invalid("inactivity_timeout must be > 0".to_string()));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default() {
        let config = NodeConfig::builder().build().expect("config");
        assert_eq!(config.name(), "minnow");
        assert!(config.proxy_uris().is_empty());
        assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.inactivity_timeout(), Duration::from_secs(2));
        assert_eq!(config.max_pending_msgs(), 10);
        assert_eq!(config.queue_sizes(), QueueSizes::new(5, 64));
        assert!(config.state_file().is_none());
        assert!(!config.checkpoint());
    }

    #[test]
    fn test_builder() {
        let config = NodeConfig::builder()
            .name("sensor-1")
            .proxy_uri("calvinip://10.0.0.1:5000")
            .proxy_uri("calvinip://10.0.0.2:5000")
            .ids(7, 9)
            .max_pending_msgs(4)
            .build()
            .expect("config");
        assert_eq!(config.name(), "sensor-1");
        assert_eq!(config.proxy_uris().len(), 2);
        assert_eq!(config.proxy_uris()[1].host(), "10.0.0.2");
        assert_eq!((config.vid(), config.pid()), (7, 9));
        assert_eq!(config.max_pending_msgs(), 4);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            NodeConfig::builder().max_pending_msgs(0).build(),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            NodeConfig::builder().fifo_size(1).build(),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            NodeConfig::builder().fifo_size(8).max_fifo_size(4).build(),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            NodeConfig::builder().proxy_uri("ssdp").build(),
            Err(ConfigError::Uri(_))
        ));
    }

    #[test]
    fn test_json_file_then_override() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"{{"name": "from-file", "proxy_uris": ["calvinip://proxy:5000"],
                "reconnect_delay_ms": 250, "checkpoint": true}}"#
        )
        .expect("write");

        let config = NodeConfig::builder()
            .json_file(file.path())
            .expect("json")
            .name("from-cli")
            .build()
            .expect("config");
        assert_eq!(config.name(), "from-cli");
        assert_eq!(config.proxy_uris()[0].port(), 5000);
        assert_eq!(config.reconnect_delay(), Duration::from_millis(250));
        assert!(config.checkpoint());
    }

    #[test]
    fn test_json_rejects_unknown_fields() {
        assert!(matches!(
            NodeConfig::builder().json_str(r#"{"nmae": "typo"}"#),
            Err(ConfigError::Parse(_))
        ));
    }
}
