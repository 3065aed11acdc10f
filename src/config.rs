// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Top-level process configuration, deserialized once at startup from a JSON file and
//! turned into the running pieces `bin/trojan-server.rs` wires together.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use crate::directory::backend::JsonFileBackend;
use crate::directory::write_behind::WriteBehindDirectory;
use crate::directory::{Directory, MemoryDirectory};
use crate::session::Fallback;
use crate::tls::TlsConfig;

/// Where the credential directory keeps its durable copy of traffic counters.
#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DirectoryConfig {
    /// No persistence: counters reset on every restart.
    Memory,
    /// One JSON file per token under `root`, synced write-behind.
    JsonFile { root: PathBuf },
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        DirectoryConfig::Memory
    }
}

impl DirectoryConfig {
    pub async fn build(self) -> io::Result<Arc<dyn Directory>> {
        match self {
            DirectoryConfig::Memory => Ok(Arc::new(MemoryDirectory::new())),
            DirectoryConfig::JsonFile { root } => {
                let backend = Arc::new(JsonFileBackend::new(root));
                let directory = WriteBehindDirectory::new(backend).await?;
                Ok(Arc::new(directory))
            }
        }
    }
}

/// The admin HTTP surface, bound to its own address, disabled unless configured.
#[derive(serde::Deserialize)]
pub struct AdminConfig {
    pub listen: SocketAddr,
}

/// Top-level process configuration.
#[derive(serde::Deserialize)]
pub struct Config {
    /// Address the Trojan (TLS) listener binds to.
    pub listen: SocketAddr,
    pub tls: TlsConfig,
    #[serde(default)]
    pub fallback: Fallback,
    #[serde(default)]
    pub directory: DirectoryConfig,
    pub admin: Option<AdminConfig>,
    #[serde(default = "default_log_level")]
    pub log_level: log::LevelFilter,
}

fn default_log_level() -> log::LevelFilter {
    log::LevelFilter::Info
}

impl Config {
    /// Parse a `Config` out of a JSON file at `path`.
    pub async fn load(path: impl Into<PathBuf>) -> io::Result<Config> {
        let bytes = tokio::fs::read(path.into()).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
