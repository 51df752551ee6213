//! Configuration and data directory management.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Paths to all ConnectRelay data locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// Durable key-value store directory (`data/store/`).
    pub store: PathBuf,
    /// Relay settings (`data/relay-settings.json`).
    pub settings_file: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates directories if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let paths = Self {
            store: root.join("store"),
            settings_file: root.join("relay-settings.json"),
            root,
        };
        paths.ensure_dirs()?;
        Ok(paths)
    }

    fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.store)?;
        Ok(())
    }
}

/// Top-level process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// HTTP port the relay listens on.
    pub port: u16,
    /// Bind address.
    pub host: String,
    /// Data directory paths.
    pub data_paths: DataPaths,
}

impl RelayConfig {
    /// Create configuration from environment and defaults.
    pub fn from_env(data_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3011);

        // Loopback by default: the extension shim and web app talk to a local relay.
        let host = std::env::var("CONNECTRELAY_HOST").unwrap_or_else(|_| "127.0.0.1".into());

        let data_paths = DataPaths::new(data_dir)?;

        Ok(Self {
            port,
            host,
            data_paths,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
