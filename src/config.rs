use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

use crate::resolver::DEFAULT_BASE_PORT;

/// Agent-wide settings shared by every network on this host.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(
        default,
        deserialize_with = "deserialize_control_urls",
        alias = "control_url"
    )]
    pub control_urls: Vec<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_public_ip_services")]
    pub public_ip_services: Vec<String>,
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_seconds: u64,
    #[serde(default)]
    pub backend: BackendPreference,
    #[serde(default = "default_true")]
    pub daemon: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            control_urls: Vec::new(),
            access_key: None,
            data_dir: None,
            public_ip_services: default_public_ip_services(),
            base_port: default_base_port(),
            sync_interval_seconds: default_sync_interval(),
            backend: BackendPreference::default(),
            daemon: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPreference {
    #[default]
    Auto,
    Kernel,
    Userspace,
}

/// How to reach the control plane for one network.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(
        default,
        deserialize_with = "deserialize_control_urls",
        alias = "control_url"
    )]
    pub control_urls: Vec<String>,
    #[serde(default)]
    pub access_key: Option<String>,
}

fn deserialize_control_urls<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ControlUrls {
        One(String),
        Many(Vec<String>),
    }

    let raw = Option::<ControlUrls>::deserialize(deserializer)?;
    let mut urls = match raw {
        Some(ControlUrls::One(url)) => vec![url],
        Some(ControlUrls::Many(urls)) => urls,
        None => Vec::new(),
    };
    urls.retain(|url| !url.trim().is_empty());
    Ok(urls)
}

fn default_public_ip_services() -> Vec<String> {
    vec![
        "https://ifconfig.me".to_string(),
        "https://api.ipify.org".to_string(),
        "https://ipinfo.io/ip".to_string(),
    ]
}

fn default_base_port() -> u16 {
    DEFAULT_BASE_PORT
}

fn default_sync_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("meshnode").join("config.json"))
}

pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("meshnode"))
}

impl AgentConfig {
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.data_dir.clone().or_else(default_data_dir)
    }
}

pub fn load_config(path: &Path) -> Result<AgentConfig> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(serde_json::from_str(&contents)?),
        Err(_) => Ok(AgentConfig::default()),
    }
}

pub fn save_config(path: &Path, config: &AgentConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(path, json)?;
    Ok(())
}
