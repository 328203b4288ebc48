//! Operator configuration
//!
//! YAML-loadable configuration tree. Every section has defaults so a
//! partial file (or no file at all) yields a usable config once the
//! LPAR name is known.

use crate::controlplane::GatewayConfig;
use crate::error::{Error, Result};
use crate::pool::FcpManagerConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: HostConfig,
    pub hardware: HardwareConfig,
    pub volume: VolumeConfig,
    pub gateway: GatewaySection,
    pub store: StoreConfig,
    pub api: ApiConfig,
}

/// Identity of the hypervisor partition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// First half of the connector host identifier
    pub lpar_name: String,
    /// Device query target; falls back to the LPAR name
    pub query_target: Option<String>,
}

impl HostConfig {
    pub fn effective_query_target(&self) -> &str {
        self.query_target.as_deref().unwrap_or(&self.lpar_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Local command listing FCP devices; the target is appended
    pub query_command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    pub same_index_pairing: bool,
    pub sync_before_reserve: bool,
}

/// Hypervisor gateway settings as they appear in the file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub endpoint: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
    pub retry_max_elapsed_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080".to_string(),
            token: None,
            timeout_secs: 300,
            retry_max_elapsed_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON snapshot file; absent keeps the pool purely in memory
    pub snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8090".to_string(),
        }
    }
}

impl Config {
    /// Load from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(serde_yaml::from_str(&text)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.lpar_name.trim().is_empty() {
            return Err(Error::Configuration("host.lpar_name must be set".into()));
        }
        if let Some(command) = &self.hardware.query_command {
            if command.is_empty() {
                return Err(Error::Configuration(
                    "hardware.query_command must not be empty".into(),
                ));
            }
        }
        if self.gateway.timeout_secs == 0 {
            return Err(Error::Configuration(
                "gateway.timeout_secs must be greater than zero".into(),
            ));
        }
        self.listen_addr()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.api.listen_addr.parse().map_err(|e| {
            Error::Configuration(format!(
                "invalid api.listen_addr '{}': {}",
                self.api.listen_addr, e
            ))
        })
    }

    pub fn manager_config(&self) -> FcpManagerConfig {
        FcpManagerConfig {
            query_target: self.host.effective_query_target().to_string(),
            same_index_pairing: self.volume.same_index_pairing,
            sync_before_reserve: self.volume.sync_before_reserve,
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            endpoint: self.gateway.endpoint.clone(),
            token: self.gateway.token.clone(),
            timeout: Duration::from_secs(self.gateway.timeout_secs),
            retry_max_elapsed: Duration::from_secs(self.gateway.retry_max_elapsed_secs),
        }
    }
}
