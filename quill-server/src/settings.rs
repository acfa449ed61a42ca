//! Process settings read from the environment.
//!
//! | Variable                      | Default          |
//! |-------------------------------|------------------|
//! | `QUILL_BIND_ADDR`             | `127.0.0.1:8000` |
//! | `QUILL_DATA_DIR`              | unset: in-memory |
//! | `QUILL_SNAPSHOT_INTERVAL_SECS`| `5`              |
//! | `QUILL_HTTP_ADDR`             | `127.0.0.1:8001` |
//! | `QUILL_REDIS_URL`             | unset: in-process bus |

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use quill_collab::{RegistryConfig, ServerConfig, SnapshotConfig};

pub const BIND_ADDR: &str = "QUILL_BIND_ADDR";
pub const DATA_DIR: &str = "QUILL_DATA_DIR";
pub const SNAPSHOT_INTERVAL_SECS: &str = "QUILL_SNAPSHOT_INTERVAL_SECS";
pub const HTTP_ADDR: &str = "QUILL_HTTP_ADDR";
pub const REDIS_URL: &str = "QUILL_REDIS_URL";

const DEFAULT_HTTP_ADDR: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 8001);

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub snapshot: SnapshotConfig,
    /// RocksDB directory; `None` keeps documents in memory
    pub data_dir: Option<PathBuf>,
    /// Address of the status and rollback endpoints
    pub http_addr: SocketAddr,
    /// Redis server for the replication bus; `None` runs a single instance
    pub redis_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            registry: RegistryConfig::default(),
            snapshot: SnapshotConfig::default(),
            data_dir: None,
            http_addr: DEFAULT_HTTP_ADDR,
            redis_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    Invalid { variable: &'static str, value: String },
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::Invalid { variable, value } => {
                write!(f, "Invalid value for {variable}: {value:?}")
            }
        }
    }
}

impl std::error::Error for SettingsError {}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let mut settings = Settings::default();

        if let Some(addr) = lookup(BIND_ADDR).filter(|v| !v.is_empty()) {
            settings.server.bind_addr = addr;
        }

        settings.data_dir = lookup(DATA_DIR).filter(|v| !v.is_empty()).map(PathBuf::from);

        if let Some(value) = lookup(HTTP_ADDR).filter(|v| !v.is_empty()) {
            settings.http_addr = value
                .trim()
                .parse()
                .map_err(|_| SettingsError::Invalid { variable: HTTP_ADDR, value })?;
        }

        settings.redis_url = lookup(REDIS_URL).filter(|v| !v.is_empty());

        if let Some(value) = lookup(SNAPSHOT_INTERVAL_SECS) {
            let secs = value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or(SettingsError::Invalid { variable: SNAPSHOT_INTERVAL_SECS, value })?;
            settings.snapshot.interval = Duration::from_secs(secs);
        }

        Ok(settings)
    }
}
