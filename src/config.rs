use crate::fs::MetadataMode;
use crate::ring::RingDigest;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration, loaded from a TOML file at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub node: NodeSettings,
    pub storage: StorageSettings,
    #[serde(default)]
    pub ring: RingSettings,
    #[serde(default)]
    pub flush: FlushSettings,
    #[serde(default)]
    pub rpc: RpcSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Socket address the RPC server binds.
    pub listen: String,
    /// Address peers reach this node at; defaults to `listen`.
    pub address: Option<String>,
    /// Include the port when hashing the node name onto the ring. Every
    /// member must agree on this.
    #[serde(default)]
    pub hash_port: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Root of the local chunk tree.
    pub data_dir: PathBuf,
    /// Root of the durable backend; flushing fails without one.
    pub backend_dir: Option<PathBuf>,
    /// How per-chunk metadata is persisted. `xattr` needs user extended
    /// attributes on the data filesystem; `header` works anywhere.
    #[serde(default = "default_metadata_mode")]
    pub metadata: MetadataMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingSettings {
    /// Ring digest; must be identical across the cluster.
    #[serde(default = "default_digest")]
    pub digest: RingDigest,
    /// Peers to fetch the membership snapshot from on startup.
    #[serde(default)]
    pub seeds: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushSettings {
    #[serde(default = "default_flush_workers")]
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcSettings {
    /// Deadline for forwarded requests; 0 disables the deadline.
    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,
}

fn default_metadata_mode() -> MetadataMode {
    MetadataMode::Xattr
}

fn default_digest() -> RingDigest {
    RingDigest::Md5
}

fn default_flush_workers() -> usize {
    2
}

fn default_forward_timeout_ms() -> u64 {
    30_000
}

impl Default for RingSettings {
    fn default() -> Self {
        RingSettings {
            digest: default_digest(),
            seeds: Vec::new(),
        }
    }
}

impl Default for FlushSettings {
    fn default() -> Self {
        FlushSettings {
            workers: default_flush_workers(),
        }
    }
}

impl Default for RpcSettings {
    fn default() -> Self {
        RpcSettings {
            forward_timeout_ms: default_forward_timeout_ms(),
        }
    }
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn write_default_config(path: &Path) -> Result<()> {
        std::fs::write(path, DEFAULT_CONFIG)
            .with_context(|| format!("writing config file {}", path.display()))
    }

    pub fn advertised_address(&self) -> &str {
        self.node.address.as_deref().unwrap_or(&self.node.listen)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc.forward_timeout_ms)
    }
}

const DEFAULT_CONFIG: &str = r#"[node]
# Address the RPC server binds.
listen = "0.0.0.0:8260"
# Address peers reach this node at (defaults to `listen`).
# address = "node0.example:8260"
# Include the port when hashing the node name onto the ring.
# hash_port = false

[storage]
data_dir = "/var/lib/shardfs/data"
# Durable backend that dirty chunks are flushed to.
# backend_dir = "/mnt/backend"
# Chunk metadata persistence: "xattr" or "header".
# metadata = "xattr"

[ring]
# Ring digest, identical across the cluster: "md5" or "murmur3".
# digest = "md5"
# Existing members to fetch the ring from on startup.
# seeds = ["node1.example:8260"]

[flush]
# workers = 2

[rpc]
# forward_timeout_ms = 30000
"#;
