//! Configuration for corral-fleet.

use std::net::SocketAddr;
use std::path::PathBuf;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{FleetError, FleetResult};

/// Top-level configuration for the fleet service.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FleetConfig {
    /// HTTP server configuration.
    pub server: ServerConfig,

    /// Database configuration.
    pub database: DatabaseConfig,

    /// Firmware artifact storage configuration.
    pub artifacts: StorageConfig,
}

impl FleetConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `fleet.toml` in the current directory (if present)
    /// 3. Environment variables with `CORRAL_FLEET_` prefix
    pub fn load() -> FleetResult<Self> {
        Figment::new()
            .merge(Toml::file("fleet.toml"))
            .merge(Env::prefixed("CORRAL_FLEET_").split("__"))
            .extract()
            .map_err(|e| FleetError::Config(e.to_string()))
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> FleetResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CORRAL_FLEET_").split("__"))
            .extract()
            .map_err(|e| FleetError::Config(e.to_string()))
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen: SocketAddr,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8084)),
            request_timeout_secs: 30,
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    pub url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/corral".to_owned(),
            max_connections: 10,
            connect_timeout_secs: 5,
        }
    }
}

/// Firmware artifact storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Local {
        /// Path to the storage directory.
        path: PathBuf,
    },
    /// In-memory storage, for tests.
    Memory,
    /// AWS S3 or S3-compatible storage (MinIO, Garage, etc.).
    S3 {
        /// S3 bucket name.
        bucket: String,
        /// AWS region or custom region for S3-compatible services.
        region: Option<String>,
        /// Custom endpoint URL for S3-compatible services.
        endpoint: Option<String>,
        /// Access key ID (can also be set via `AWS_ACCESS_KEY_ID`).
        access_key_id: Option<String>,
        /// Secret access key (can also be set via `AWS_SECRET_ACCESS_KEY`).
        secret_access_key: Option<String>,
        /// Allow HTTP (non-TLS) connections, for local development.
        #[serde(default)]
        allow_http: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Local {
            path: PathBuf::from("/var/lib/corral/firmware"),
        }
    }
}
