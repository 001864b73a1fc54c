use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

const UNIT_DIR: &str = "/etc/systemd/system";

/// Registration of the background sync service for one network.
#[async_trait]
pub trait DaemonManager: Send + Sync {
    async fn install(&self, network: &str) -> Result<()>;

    /// Removing a service that is not installed succeeds.
    async fn remove(&self, network: &str) -> Result<()>;

    async fn is_installed(&self, network: &str) -> Result<bool>;
}

/// One systemd unit per network running `meshnode daemon --network <name>`.
pub struct SystemdDaemon {
    unit_dir: PathBuf,
    executable: PathBuf,
    config_path: Option<PathBuf>,
}

impl SystemdDaemon {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self> {
        Ok(Self {
            unit_dir: PathBuf::from(UNIT_DIR),
            executable: std::env::current_exe()?,
            config_path,
        })
    }

    fn unit_name(network: &str) -> String {
        format!("meshnode-{network}.service")
    }

    fn unit_path(&self, network: &str) -> PathBuf {
        self.unit_dir.join(Self::unit_name(network))
    }

    fn render_unit(&self, network: &str) -> String {
        let mut exec = format!("{} ", self.executable.display());
        if let Some(config) = &self.config_path {
            exec.push_str(&format!("--config {} ", config.display()));
        }
        exec.push_str(&format!("daemon --network {network}"));
        format!(
            "[Unit]\n\
             Description=meshnode sync for network {network}\n\
             Wants=network-online.target\n\
             After=network-online.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             ExecStart={exec}\n\
             Restart=on-failure\n\
             RestartSec=5\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n"
        )
    }
}

async fn systemctl(args: &[&str]) -> Result<()> {
    let output = Command::new("systemctl")
        .args(args)
        .output()
        .await
        .map_err(|err| Error::Daemon(format!("systemctl {}: {err}", args.join(" "))))?;
    if !output.status.success() {
        return Err(Error::Daemon(format!(
            "systemctl {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[async_trait]
impl DaemonManager for SystemdDaemon {
    async fn install(&self, network: &str) -> Result<()> {
        let path = self.unit_path(network);
        std::fs::write(&path, self.render_unit(network))?;
        systemctl(&["daemon-reload"]).await?;
        systemctl(&["enable", "--now", &Self::unit_name(network)]).await?;
        info!(network, unit = %path.display(), "daemon installed");
        Ok(())
    }

    async fn remove(&self, network: &str) -> Result<()> {
        let path = self.unit_path(network);
        if !path.exists() {
            debug!(network, "no daemon unit to remove");
            return Ok(());
        }
        systemctl(&["disable", "--now", &Self::unit_name(network)]).await?;
        remove_if_exists(&path)?;
        systemctl(&["daemon-reload"]).await?;
        info!(network, "daemon removed");
        Ok(())
    }

    async fn is_installed(&self, network: &str) -> Result<bool> {
        Ok(self.unit_path(network).exists())
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// For hosts without systemd or runs with `daemon` disabled.
pub struct NoopDaemon;

#[async_trait]
impl DaemonManager for NoopDaemon {
    async fn install(&self, network: &str) -> Result<()> {
        debug!(network, "daemon management disabled, not installing");
        Ok(())
    }

    async fn remove(&self, _network: &str) -> Result<()> {
        Ok(())
    }

    async fn is_installed(&self, _network: &str) -> Result<bool> {
        Ok(false)
    }
}

/// systemd is running when its runtime directory exists.
pub fn systemd_available() -> bool {
    Path::new("/run/systemd/system").exists()
}
