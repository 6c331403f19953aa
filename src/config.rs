//! Client configuration.
//!
//! Loaded once at startup from JSON and passed by reference to everything that needs it.
//!
//! # Example
//! ```rust
//! use fsf_client::ClientConfig;
//!
//! let config = ClientConfig::from_json_str(r#"{
//!     "server": { "ip_address": ["10.0.0.5", "10.0.0.6"], "port": 5800 },
//!     "client": { "log_file": "/tmp/client_dbg.log" }
//! }"#).unwrap();
//!
//! assert_eq!(config.server_pool().unwrap().len(), 2);
//! ```
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::protocol::{ServerPool, TcpConnector, error::ConfigError};

pub const DEFAULT_PORT: u16 = 5800;

fn default_port() -> u16 {
    DEFAULT_PORT
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(alias = "SERVER_CONFIG")]
    pub server: ServerConfig,
    #[serde(alias = "CLIENT_CONFIG")]
    pub client: LocalConfig,
    #[serde(default)]
    pub timeouts: Timeouts,
}

/// Servers to submit to. One is picked at random per submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(alias = "IP_ADDRESS")]
    pub ip_address: Vec<String>,
    #[serde(alias = "PORT", default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Debug log used when reports are suppressed.
    #[serde(alias = "LOG_FILE")]
    pub log_file: PathBuf,
}

/// Socket timeouts in seconds; absent means block indefinitely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    pub connect_secs: Option<u64>,
    pub read_secs: Option<u64>,
    pub write_secs: Option<u64>,
}

impl Timeouts {
    pub fn connect(&self) -> Option<Duration> {
        self.connect_secs.map(Duration::from_secs)
    }

    pub fn read(&self) -> Option<Duration> {
        self.read_secs.map(Duration::from_secs)
    }

    pub fn write(&self) -> Option<Duration> {
        self.write_secs.map(Duration::from_secs)
    }
}

impl From<&Timeouts> for TcpConnector {
    fn from(value: &Timeouts) -> Self {
        TcpConnector::new(value.connect(), value.read(), value.write())
    }
}

impl ClientConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn server_pool(&self) -> Result<ServerPool, ConfigError> {
        ServerPool::from_hosts(self.server.ip_address.iter().cloned(), self.server.port)
    }
}
