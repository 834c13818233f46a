//! Storage configuration and backend selection.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vaultfs_transport::{ConnectionManagerConfig, RpcClientConfig, TcpTransportConfig};

use crate::error::{BlockServerError, BlockServerResult};

/// Environment variable naming the remote block server address.
pub const ENV_BSERVER_ADDR: &str = "VAULTFS_BSERVER_ADDR";
/// Environment variable naming the remote metadata server address.
pub const ENV_MDSERVER_ADDR: &str = "VAULTFS_MDSERVER_ADDR";

/// Subdirectory of the root holding on-disk blocks.
pub const BLOCKS_DIR: &str = "blocks";

/// Where blocks (or metadata) are served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Process-local, volatile.
    Memory,
    /// Directory on local disk.
    Disk(PathBuf),
    /// Remote service at this address.
    Remote(String),
}

/// Configuration for the storage layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Remote block server; unset selects a local store.
    pub bserver_addr: Option<String>,
    /// Remote metadata server; unset selects local metadata.
    pub mdserver_addr: Option<String>,
    /// Root for on-disk state; unset keeps local state in memory.
    pub server_root_dir: Option<PathBuf>,
    /// Per-user byte limit for the local stores.
    pub quota_bytes: Option<u64>,
    /// Force debug-level logging.
    pub debug: bool,
    /// TCP connect timeout for the remote client.
    pub connect_timeout_ms: u64,
    /// Per-call response timeout for the remote client.
    pub response_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bserver_addr: None,
            mdserver_addr: None,
            server_root_dir: None,
            quota_bytes: None,
            debug: false,
            connect_timeout_ms: 5_000,
            response_timeout_ms: 30_000,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl StorageConfig {
    /// Defaults with the server addresses taken from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults with the server addresses taken from `lookup`. Empty values
    /// count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            bserver_addr: non_empty(lookup(ENV_BSERVER_ADDR)),
            mdserver_addr: non_empty(lookup(ENV_MDSERVER_ADDR)),
            ..Self::default()
        }
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> BlockServerResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: StorageConfig =
            serde_json::from_str(&contents).map_err(|e| BlockServerError::Config {
                reason: format!("{}: {}", path.display(), e),
            })?;
        config.bserver_addr = non_empty(config.bserver_addr);
        config.mdserver_addr = non_empty(config.mdserver_addr);
        Ok(config)
    }

    /// Reject settings no backend can run with.
    pub fn validate(&self) -> BlockServerResult<()> {
        for addr in self.bserver_addr.iter().chain(self.mdserver_addr.iter()) {
            let port_ok = addr
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !port_ok {
                return Err(BlockServerError::Config {
                    reason: format!("server address {:?} is not host:port", addr),
                });
            }
        }
        if self.connect_timeout_ms == 0 || self.response_timeout_ms == 0 {
            return Err(BlockServerError::Config {
                reason: "timeouts must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    fn local_backend(&self, subdir: &str) -> Backend {
        match &self.server_root_dir {
            Some(root) => Backend::Disk(root.join(subdir)),
            None => Backend::Memory,
        }
    }

    /// The block store to build.
    pub fn block_backend(&self) -> Backend {
        match &self.bserver_addr {
            Some(addr) => Backend::Remote(addr.clone()),
            None => self.local_backend(BLOCKS_DIR),
        }
    }

    /// The metadata store a caller should build. Selection only.
    ///
    /// Without a root dir metadata stays in memory even when an mdserver
    /// address is set.
    pub fn metadata_backend(&self) -> Backend {
        match (&self.server_root_dir, &self.mdserver_addr) {
            (None, _) => Backend::Memory,
            (Some(_), Some(addr)) => Backend::Remote(addr.clone()),
            (Some(_), None) => self.local_backend("metadata"),
        }
    }

    /// Connection settings for the remote client.
    pub fn connection_config(&self) -> ConnectionManagerConfig {
        ConnectionManagerConfig {
            tcp: TcpTransportConfig {
                connect_timeout_ms: self.connect_timeout_ms,
                ..TcpTransportConfig::default()
            },
            rpc: RpcClientConfig {
                response_timeout_ms: self.response_timeout_ms,
            },
        }
    }
}
