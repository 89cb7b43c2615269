//! Configuration file handling.
//!
//! The configuration is a JSON document. When the file does not exist, defaults are written to
//! it and used.

use std::{
    fs, io,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Overlay address that announcements are broadcast to.
pub const DEFAULT_DISCOVERY_ADDRESS: &str = "nghost.discovery";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid subnet {cidr:?}: {reason}")]
    InvalidSubnet { cidr: String, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub vpn: VpnConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OverlayConfig {
    /// Node tickets of well-known peers added to the endpoint's address book on connect.
    #[serde(default)]
    pub bootstrap: Vec<String>,
    #[serde(default = "default_discovery_address")]
    pub discovery_address: String,
    /// Fixes the node identity across restarts. A fresh identity is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VpnConfig {
    pub interface_name: String,
    pub cidr: String,
    pub mtu: u16,
    #[serde(default)]
    pub dns: Vec<String>,
    /// Static exit-node allow-list.
    #[serde(default)]
    pub exit_nodes: Vec<String>,
}

fn default_discovery_address() -> String {
    DEFAULT_DISCOVERY_ADDRESS.to_string()
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            discovery_address: default_discovery_address(),
            secret_key: None,
        }
    }
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            interface_name: "nghost0".to_string(),
            cidr: "10.100.0.0/16".to_string(),
            mtu: 1420,
            dns: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
            exit_nodes: Vec::new(),
        }
    }
}

/// Validated view of [VpnConfig] used by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnSettings {
    pub interface_name: String,
    pub subnet: Ipv4Net,
    pub mtu: u16,
}

impl VpnSettings {
    /// The address this node takes on the virtual subnet: its first host.
    pub fn self_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.subnet.network()) + 1)
    }
}

impl Config {
    /// Loads the configuration at `path`, writing the defaults there first if it is missing.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            info!("Wrote default configuration to {}", path.display());
            return Ok(config);
        }
        let data = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(path, data).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validates the VPN section. An unparsable subnet is fatal at startup.
    pub fn vpn_settings(&self) -> Result<VpnSettings, ConfigError> {
        let cidr = &self.vpn.cidr;
        let subnet: Ipv4Net = cidr.parse().map_err(|error: ipnet::AddrParseError| {
            ConfigError::InvalidSubnet {
                cidr: cidr.clone(),
                reason: error.to_string(),
            }
        })?;
        if subnet.prefix_len() > 30 {
            return Err(ConfigError::InvalidSubnet {
                cidr: cidr.clone(),
                reason: "subnet must hold at least two hosts".to_string(),
            });
        }
        Ok(VpnSettings {
            interface_name: self.vpn.interface_name.clone(),
            subnet: subnet.trunc(),
            mtu: self.vpn.mtu,
        })
    }
}
