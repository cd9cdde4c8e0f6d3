//! Node configuration
//!
//! Loaded from a YAML file, with the three boot-critical settings
//! overridable from the environment: `NODE_ADDRESS`, `DOMAIN_ID`, and
//! `GLOBAL_REGISTRY_ADDR`. Memory sizes accept both SI and IEC unit
//! suffixes.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{FabricError, Result};

/// Environment variable carrying the node's generic RPC address
pub const ENV_NODE_ADDRESS: &str = "NODE_ADDRESS";
/// Environment variable carrying the administrative domain
pub const ENV_DOMAIN_ID: &str = "DOMAIN_ID";
/// Environment variable carrying the optional global registry address
pub const ENV_GLOBAL_REGISTRY_ADDR: &str = "GLOBAL_REGISTRY_ADDR";

/// Top-level node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Server listener settings
    pub server: ServerConfig,

    /// Node identity and domain
    pub node: NodeConfig,

    /// Advertised local resource envelope
    pub resource: ResourceConfig,

    /// Capability labels this node advertises
    pub resource_tags: Vec<String>,

    /// Languages the local providers accept
    pub supported_languages: Vec<String>,

    /// Static host overrides applied when dialling peers
    pub dns: DnsConfig,

    /// Discovery tuning knobs
    pub discovery: DiscoveryConfig,

    /// Provider staleness settings
    pub provider: ProviderConfig,

    /// Upstream ecosystem addresses handed to deployed components
    pub upstream: UpstreamConfig,

    /// Execution back-end control-stream address, when one is attached
    pub backend_addr: Option<String>,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            node: NodeConfig::default(),
            resource: ResourceConfig::default(),
            resource_tags: vec!["cpu".to_string(), "memory".to_string()],
            supported_languages: vec!["json".to_string(), "python".to_string(), "go".to_string()],
            dns: DnsConfig::default(),
            discovery: DiscoveryConfig::default(),
            provider: ProviderConfig::default(),
            upstream: UpstreamConfig::default(),
            backend_addr: None,
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Generic RPC port (discovery, store); 0 binds an ephemeral port
    pub port: u16,
    /// Scheduler RPC port; 0 binds an ephemeral port
    pub scheduler_port: u16,
    /// Bind host
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 7946, scheduler_port: 7947, host: "0.0.0.0".to_string() }
    }
}

/// Node identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Human-facing node name
    pub name: String,
    /// Administrative domain; overridden by `DOMAIN_ID`
    pub domain_id: String,
    /// Externally reachable generic RPC address; overridden by
    /// `NODE_ADDRESS`
    pub address: Option<String>,
    /// Externally reachable scheduler RPC address
    pub scheduler_address: Option<String>,
    /// Data directory holding `node_id` and the audit log
    pub data_dir: PathBuf,
    /// Optional global registry base URL; overridden by
    /// `GLOBAL_REGISTRY_ADDR`
    pub global_registry_addr: Option<String>,
    /// Seed peer addresses dialled on boot
    pub peers: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "weavemesh-node".to_string(),
            domain_id: "default".to_string(),
            address: None,
            scheduler_address: None,
            data_dir: PathBuf::from("data"),
            global_registry_addr: None,
            peers: Vec::new(),
        }
    }
}

/// Advertised resource envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// CPU in millicores
    pub cpu: i64,
    /// Memory; accepts `512Mi`, `8gb`, raw bytes, …
    pub memory: MemSize,
    /// GPU unit count
    pub gpu: i64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self { cpu: 4000, memory: MemSize(8 * 1024 * 1024 * 1024), gpu: 0 }
    }
}

/// Static DNS host overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// host -> IP map consulted before dialling
    pub hosts: HashMap<String, String>,
}

/// Discovery tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Seconds between gossip rounds
    pub gossip_interval_secs: u64,
    /// Seconds a silent node stays in the known table
    pub node_ttl_secs: u64,
    /// Fan-out cap per gossip round
    pub max_gossip_peers: usize,
    /// Hop budget for forwarded gossip and queries
    pub max_hops: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { gossip_interval_secs: 10, node_ttl_secs: 120, max_gossip_peers: 10, max_hops: 5 }
    }
}

/// Provider registry tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Seconds without a health check before a binding is cleared
    pub health_ttl_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self { health_ttl_secs: 90 }
    }
}

/// Ecosystem addresses injected into every deployment's environment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Message-passing endpoint components attach to
    pub zmq_addr: String,
    /// Object-store endpoint
    pub store_addr: String,
    /// Log-stream endpoint
    pub logger_addr: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            zmq_addr: "127.0.0.1:7950".to_string(),
            store_addr: "127.0.0.1:7946".to_string(),
            logger_addr: "127.0.0.1:7946".to_string(),
        }
    }
}

impl FabricConfig {
    /// Load configuration from a YAML file, then apply environment
    /// overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FabricError::not_configured(format!("config {}: {e}", path.display())))?;
        let mut config: FabricConfig = serde_yaml::from_str(&raw)
            .map_err(|e| FabricError::not_configured(format!("config {}: {e}", path.display())))?;
        config.apply_env();
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var(ENV_NODE_ADDRESS) {
            if !addr.is_empty() {
                self.node.address = Some(addr);
            }
        }
        if let Ok(domain) = std::env::var(ENV_DOMAIN_ID) {
            if !domain.is_empty() {
                self.node.domain_id = domain;
            }
        }
        if let Ok(registry) = std::env::var(ENV_GLOBAL_REGISTRY_ADDR) {
            if !registry.is_empty() {
                self.node.global_registry_addr = Some(registry);
            }
        }
    }

    /// Gossip interval as a [`Duration`]
    pub fn gossip_interval(&self) -> Duration {
        Duration::from_secs(self.discovery.gossip_interval_secs.max(1))
    }

    /// Node TTL as a [`Duration`]
    pub fn node_ttl(&self) -> Duration {
        Duration::from_secs(self.discovery.node_ttl_secs.max(1))
    }
}

/// A memory quantity in bytes, deserializable from either a raw
/// integer or a human string such as `512Mi` or `8gb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemSize(pub i64);

impl MemSize {
    /// The quantity in bytes
    pub fn bytes(&self) -> i64 {
        self.0
    }
}

/// Parse a memory string. Unit suffixes follow their own semantics:
/// `kb/mb/gb/tb` (and the bare `k/m/g/t`) are SI powers of 1000,
/// `kib/mib/gib/tib` (and `ki/mi/gi/ti`) are IEC powers of 1024, and
/// `b` or no suffix means bytes.
pub fn parse_memory_size(input: &str) -> Result<i64> {
    let trimmed = input.trim().to_ascii_lowercase();
    if trimmed.is_empty() {
        return Err(FabricError::not_configured("empty memory size"));
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| FabricError::not_configured(format!("memory size {input:?}")))?;

    let multiplier: i64 = match unit.trim() {
        "" | "b" => 1,
        "k" | "kb" => 1000,
        "ki" | "kib" => 1024,
        "m" | "mb" => 1000 * 1000,
        "mi" | "mib" => 1024 * 1024,
        "g" | "gb" => 1000 * 1000 * 1000,
        "gi" | "gib" => 1024 * 1024 * 1024,
        "t" | "tb" => 1000 * 1000 * 1000 * 1000,
        "ti" | "tib" => 1024 * 1024 * 1024 * 1024,
        other => {
            return Err(FabricError::not_configured(format!("memory unit {other:?}")));
        }
    };

    Ok((value * multiplier as f64) as i64)
}

impl Serialize for MemSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for MemSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct MemSizeVisitor;

        impl<'de> Visitor<'de> for MemSizeVisitor {
            type Value = MemSize;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte count or a string like \"512Mi\"")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<MemSize, E> {
                Ok(MemSize(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<MemSize, E> {
                Ok(MemSize(v as i64))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<MemSize, E> {
                parse_memory_size(v).map(MemSize).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(MemSizeVisitor)
    }
}
