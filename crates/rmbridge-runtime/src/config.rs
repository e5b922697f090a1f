//! [`ClientConfig`] – everything needed to bring a [`Client`](crate::Client)
//! up, in a form that serialises cleanly to TOML or JSON.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use rmbridge_finder::FinderConfig;
use rmbridge_finder::finder::{DEFAULT_ACK_PORT, DEFAULT_PROBE_PORT};
use rmbridge_middleware::BridgeConfig;
use rmbridge_native::CreateOptions;
use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionConfig, DEFAULT_BRIDGE_PORT};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name passed to the native library on create.
    pub bridge_name: String,
    pub debug: bool,
    /// Where the native library writes its own log.
    pub log_path: String,
    /// Dynamic library to load. `None` picks the platform default.
    pub library_path: Option<PathBuf>,
    /// Application id to pair with; 0 accepts any device.
    pub app_id: u64,
    pub discovery_timeout_secs: u64,
    pub status_timeout_secs: u64,
    pub request_timeout_ms: u64,
    /// Port on the device the bridge connects to.
    pub bridge_port: u64,
    pub broadcast_address: Ipv4Addr,
    pub probe_port: u16,
    pub ack_port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bridge_name: "Robomaster".to_string(),
            debug: false,
            log_path: String::new(),
            library_path: None,
            app_id: 0,
            discovery_timeout_secs: 30,
            status_timeout_secs: 10,
            request_timeout_ms: 5_000,
            bridge_port: DEFAULT_BRIDGE_PORT,
            broadcast_address: Ipv4Addr::BROADCAST,
            probe_port: DEFAULT_PROBE_PORT,
            ack_port: DEFAULT_ACK_PORT,
        }
    }
}

impl ClientConfig {
    pub fn create_options(&self) -> CreateOptions {
        CreateOptions {
            name: self.bridge_name.clone(),
            debug: self.debug,
            log_path: self.log_path.clone(),
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            create: self.create_options(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn finder_config(&self) -> FinderConfig {
        FinderConfig {
            app_id: self.app_id,
            probe_target: SocketAddr::new(IpAddr::V4(self.broadcast_address), self.probe_port),
            ack_port: self.ack_port,
            ..FinderConfig::default()
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            finder: self.finder_config(),
            bridge_port: self.bridge_port,
            discovery_timeout: Duration::from_secs(self.discovery_timeout_secs),
            status_timeout: Duration::from_secs(self.status_timeout_secs),
        }
    }
}
