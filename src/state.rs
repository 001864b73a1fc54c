use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::model::Node;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// Everything persisted for one joined network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub network: String,
    #[serde(default)]
    pub server: ServerConfig,
    pub node: Node,
    #[serde(default = "default_true")]
    pub daemon: bool,
    /// Set when the last peer application failed; the next pass rebuilds.
    #[serde(default)]
    pub stale: bool,
    #[serde(default)]
    pub updated_at: i64,
}

impl NetworkConfig {
    pub fn new(network: &str, server: ServerConfig, node: Node, daemon: bool) -> Self {
        Self {
            network: network.to_string(),
            server,
            node,
            daemon,
            stale: false,
            updated_at: now_unix(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now_unix();
    }
}

fn default_true() -> bool {
    true
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Durable per-network records, keyed by network name.
pub trait ConfigStore: Send + Sync {
    fn read(&self, network: &str) -> Result<Option<NetworkConfig>>;

    fn write(&self, config: &NetworkConfig) -> Result<()>;

    fn delete(&self, network: &str) -> Result<()>;

    fn list_networks(&self) -> Result<Vec<String>>;
}

/// One JSON file per network under `<data>/networks`.
pub struct FileConfigStore {
    dir: PathBuf,
}

impl FileConfigStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("networks"),
        }
    }

    fn path_for(&self, network: &str) -> Result<PathBuf> {
        validate_network_name(network)?;
        Ok(self.dir.join(format!("{network}.json")))
    }
}

impl ConfigStore for FileConfigStore {
    fn read(&self, network: &str) -> Result<Option<NetworkConfig>> {
        let path = self.path_for(network)?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, config: &NetworkConfig) -> Result<()> {
        let path = self.path_for(&config.network)?;
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(config)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, network: &str) -> Result<()> {
        let path = self.path_for(network)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn list_networks(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut networks = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(network) = name.strip_suffix(".json") {
                networks.push(network.to_string());
            }
        }
        networks.sort();
        Ok(networks)
    }
}

/// Network names become file and unit names, so keep them to a safe alphabet.
pub fn validate_network_name(network: &str) -> Result<()> {
    if network.trim().is_empty() {
        return Err(Error::NoNetworkProvided);
    }
    let valid = network
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.')
        && !network.starts_with('.');
    if !valid {
        return Err(Error::Config(format!("invalid network name {network:?}")));
    }
    Ok(())
}
