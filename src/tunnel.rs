//! Tunnel interface lifecycle.
//!
//! A [`TunnelManager`] owns every live device handle. Drivers are the
//! platform strategies (kernel module or userspace) and never see a
//! partially built peer table: the table is validated up front, then the
//! exclusive lock is held across the driver call and the swap.

use crate::error::{Error, Result};
use crate::model::Peer;
use crate::uapi::ControlSocket;
use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Linux IFNAMSIZ minus the trailing NUL.
const MAX_INTERFACE_NAME: usize = 15;

/// Parameters a device is created with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceSpec {
    pub name: String,
    pub address: Option<IpNet>,
    pub address6: Option<IpNet>,
    pub listen_port: u16,
    pub private_key: String,
}

/// Platform strategy for tunnel devices.
#[async_trait]
pub trait TunnelDriver: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Whether devices stay up after this process exits.
    fn outlives_process(&self) -> bool {
        true
    }

    /// Allocate the device, assign its addresses and bring it up.
    async fn create(&self, spec: &InterfaceSpec) -> Result<()>;

    /// Replace the whole peer table and the routes pointing at the device.
    /// `withdrawn` lists prefixes the previous table routed here that the new
    /// one no longer covers.
    async fn configure(
        &self,
        spec: &InterfaceSpec,
        peers: &[Peer],
        routes: &[IpNet],
        withdrawn: &[IpNet],
    ) -> Result<()>;

    /// Remove the device. Removing a device that does not exist succeeds.
    async fn destroy(&self, name: &str) -> Result<()>;

    async fn active_listen_ports(&self) -> Result<Vec<u16>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterfaceState {
    Absent,
    Created,
    Configured,
    Reconfigured,
    Destroyed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Installed {
    peers: Vec<Peer>,
    routes: Vec<IpNet>,
}

/// A live device and its installed peer table.
pub struct Device {
    driver: Arc<dyn TunnelDriver>,
    spec: InterfaceSpec,
    installed: RwLock<Installed>,
}

impl Device {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &InterfaceSpec {
        &self.spec
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.installed.read().await.peers.clone()
    }

    /// Swap in a new peer table. `routes` of `None` keeps the installed routes.
    pub async fn replace_peers(&self, peers: Vec<Peer>, routes: Option<Vec<IpNet>>) -> Result<()> {
        let apply_failed = |reason: String| Error::ApplyFailed {
            interface: self.spec.name.clone(),
            reason,
        };
        check_peer_table(&peers).map_err(apply_failed)?;

        let mut installed = self.installed.write().await;
        let routes = routes.unwrap_or_else(|| installed.routes.clone());
        let wanted = routed_prefixes(&peers, &routes);
        let withdrawn: Vec<IpNet> = routed_prefixes(&installed.peers, &installed.routes)
            .difference(&wanted)
            .copied()
            .collect();
        self.driver
            .configure(&self.spec, &peers, &routes, &withdrawn)
            .await
            .map_err(|err| apply_failed(err.to_string()))?;
        *installed = Installed { peers, routes };
        Ok(())
    }
}

pub struct TunnelHandle {
    device: Arc<Device>,
    state: InterfaceState,
    stale: bool,
    socket: Option<ControlSocket>,
}

impl TunnelHandle {
    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn state(&self) -> InterfaceState {
        self.state
    }

    /// Set after a failed apply; the next sync pass must rebuild.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn socket_path(&self) -> Option<&Path> {
        self.socket.as_ref().map(ControlSocket::path)
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.device.peers().await
    }

    async fn stop_listener(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.shutdown().await;
        }
    }
}

pub struct TunnelManager {
    driver: Arc<dyn TunnelDriver>,
    socket_dir: PathBuf,
}

impl TunnelManager {
    pub fn new(driver: Arc<dyn TunnelDriver>, socket_dir: PathBuf) -> Self {
        Self { driver, socket_dir }
    }

    pub fn outlives_process(&self) -> bool {
        self.driver.outlives_process()
    }

    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.socket_dir.join(format!("{name}.sock"))
    }

    pub async fn create(&self, spec: InterfaceSpec) -> Result<TunnelHandle> {
        let create_failed = |reason: String| Error::DeviceCreateFailed {
            interface: spec.name.clone(),
            reason,
        };
        if spec.name.is_empty() || spec.name.len() > MAX_INTERFACE_NAME {
            return Err(create_failed(format!(
                "interface name must be 1-{MAX_INTERFACE_NAME} bytes"
            )));
        }
        self.driver
            .create(&spec)
            .await
            .map_err(|err| create_failed(err.to_string()))?;

        let device = Arc::new(Device {
            driver: Arc::clone(&self.driver),
            spec: spec.clone(),
            installed: RwLock::new(Installed::default()),
        });
        let socket = match ControlSocket::bind(&self.socket_path(&spec.name), Arc::clone(&device)) {
            Ok(socket) => socket,
            Err(err) => {
                if let Err(cleanup) = self.driver.destroy(&spec.name).await {
                    warn!(interface = %spec.name, error = %cleanup, "failed to remove half-created interface");
                }
                return Err(create_failed(format!("configuration socket: {err}")));
            }
        };
        info!(interface = %spec.name, backend = self.driver.backend(), port = spec.listen_port, "tunnel interface created");
        Ok(TunnelHandle {
            device,
            state: InterfaceState::Created,
            stale: false,
            socket: Some(socket),
        })
    }

    /// Replace the peer table. On failure the handle is left `Configured`
    /// and stale.
    pub async fn apply_peers(
        &self,
        handle: &mut TunnelHandle,
        peers: Vec<Peer>,
        routes: Vec<IpNet>,
    ) -> Result<()> {
        let count = peers.len();
        match handle.device.replace_peers(peers, Some(routes)).await {
            Ok(()) => {
                handle.state = match handle.state {
                    InterfaceState::Created => InterfaceState::Configured,
                    _ => InterfaceState::Reconfigured,
                };
                handle.stale = false;
                debug!(interface = %handle.name(), peers = count, "peer table applied");
                Ok(())
            }
            Err(err) => {
                handle.state = InterfaceState::Configured;
                handle.stale = true;
                Err(err)
            }
        }
    }

    /// Tear the device down, run `post_down` best-effort, then stop the
    /// configuration listener. Only a driver failure is reported, and only
    /// after every step has run.
    pub async fn destroy(&self, handle: &mut TunnelHandle, post_down: Option<&str>) -> Result<()> {
        let name = handle.name().to_string();
        let result = self.driver.destroy(&name).await;
        run_hooks("post_down", &name, post_down).await;
        handle.stop_listener().await;
        handle.state = InterfaceState::Destroyed;
        match &result {
            Ok(()) => info!(interface = %name, "tunnel interface destroyed"),
            Err(err) => warn!(interface = %name, error = %err, "tunnel interface teardown failed"),
        }
        result
    }

    /// Remove a device this process holds no handle for, such as one left
    /// behind by an earlier run.
    pub async fn destroy_by_name(&self, name: &str, post_down: Option<&str>) -> Result<()> {
        let result = self.driver.destroy(name).await;
        run_hooks("post_down", name, post_down).await;
        match std::fs::remove_file(self.socket_path(name)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => debug!(interface = %name, error = %err, "failed to remove stale socket"),
        }
        result
    }

    /// Stop the listener but leave the device running.
    pub async fn detach(&self, mut handle: TunnelHandle) {
        handle.stop_listener().await;
        debug!(interface = %handle.name(), "configuration listener stopped");
    }

    pub async fn active_listen_ports(&self) -> Result<Vec<u16>> {
        self.driver.active_listen_ports().await
    }
}

/// A rebuild is needed whenever the interface name changed.
pub fn needs_rebuild(current: &str, previous: &str) -> bool {
    current != previous
}

/// `nm-<network>`, cut to what the kernel accepts.
pub fn default_interface_name(network: &str) -> String {
    let mut name = format!("nm-{network}");
    if name.len() > MAX_INTERFACE_NAME {
        let mut end = MAX_INTERFACE_NAME;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

/// Rejects duplicate keys and allowed-IP ranges claimed by more than one peer.
pub fn check_peer_table(peers: &[Peer]) -> std::result::Result<(), String> {
    let mut keys = HashSet::new();
    let mut claimed: Vec<(&IpNet, &str)> = Vec::new();
    for peer in peers {
        if peer.public_key.trim().is_empty() {
            return Err("peer with empty public key".to_string());
        }
        if !keys.insert(peer.public_key.as_str()) {
            return Err(format!("duplicate peer key {}", peer.public_key));
        }
        for net in &peer.allowed_ips {
            if let Some((_, owner)) = claimed.iter().find(|(other, _)| nets_overlap(net, other)) {
                return Err(format!(
                    "allowed ip {net} of {} overlaps a range of {owner}",
                    peer.public_key
                ));
            }
        }
        claimed.extend(peer.allowed_ips.iter().map(|net| (net, peer.public_key.as_str())));
    }
    Ok(())
}

/// Every prefix routed through the device for a table: peer allowed IPs and
/// gateway ranges, host bits cleared.
pub fn routed_prefixes(peers: &[Peer], routes: &[IpNet]) -> BTreeSet<IpNet> {
    peers
        .iter()
        .flat_map(|peer| peer.allowed_ips.iter())
        .chain(routes)
        .map(IpNet::trunc)
        .collect()
}

fn nets_overlap(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// Run `"; "`-separated shell commands. Failures are logged, never returned.
pub async fn run_hooks(stage: &str, interface: &str, commands: Option<&str>) {
    let Some(commands) = commands else {
        return;
    };
    for command in commands.split("; ").map(str::trim).filter(|c| !c.is_empty()) {
        match Command::new("sh").arg("-c").arg(command).status().await {
            Ok(status) if status.success() => {
                debug!(stage, interface, command, "hook finished");
            }
            Ok(status) => {
                warn!(stage, interface, command, status = %status, "hook exited with failure");
            }
            Err(err) => {
                warn!(stage, interface, command, error = %err, "hook could not be started");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{peer, FakeDriver};

    fn spec(name: &str) -> InterfaceSpec {
        InterfaceSpec {
            name: name.to_string(),
            address: Some("10.20.0.2/24".parse().unwrap()),
            address6: None,
            listen_port: 51821,
            private_key: "key".to_string(),
        }
    }

    fn manager(driver: &Arc<FakeDriver>, dir: &Path) -> TunnelManager {
        TunnelManager::new(driver.clone(), dir.to_path_buf())
    }

    #[test]
    fn rebuild_only_when_names_differ() {
        for name in ["", "office0", "nm-lab"] {
            assert!(!needs_rebuild(name, name));
        }
        assert!(needs_rebuild("office0", "office1"));
        assert!(needs_rebuild("office0", ""));
    }

    #[test]
    fn default_names_fit_ifnamsiz() {
        assert_eq!(default_interface_name("office"), "nm-office");
        let long = default_interface_name("engineering-west");
        assert_eq!(long, "nm-engineering-");
        assert_eq!(long.len(), 15);
    }

    #[test]
    fn overlapping_or_duplicate_peers_are_rejected() {
        let ok = vec![peer("a", &["10.0.0.1/32"]), peer("b", &["10.0.0.2/32", "fd00::2/128"])];
        assert!(check_peer_table(&ok).is_ok());

        let dup = vec![peer("a", &["10.0.0.1/32"]), peer("a", &["10.0.0.2/32"])];
        assert!(check_peer_table(&dup).unwrap_err().contains("duplicate"));

        let overlap = vec![peer("a", &["10.0.0.0/24"]), peer("b", &["10.0.0.7/32"])];
        assert!(check_peer_table(&overlap).unwrap_err().contains("overlaps"));
    }

    #[tokio::test]
    async fn lifecycle_moves_through_states() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let driver = Arc::new(FakeDriver::default());
        let tunnels = manager(&driver, dir.path());

        let mut handle = tunnels.create(spec("office0")).await?;
        assert_eq!(handle.state(), InterfaceState::Created);
        assert!(handle.socket_path().is_some_and(Path::exists));

        tunnels
            .apply_peers(&mut handle, vec![peer("a", &["10.20.0.3/32"])], Vec::new())
            .await?;
        assert_eq!(handle.state(), InterfaceState::Configured);
        tunnels
            .apply_peers(&mut handle, vec![peer("b", &["10.20.0.4/32"])], Vec::new())
            .await?;
        assert_eq!(handle.state(), InterfaceState::Reconfigured);

        let socket = handle.socket_path().map(Path::to_path_buf).unwrap();
        tunnels.destroy(&mut handle, None).await?;
        assert_eq!(handle.state(), InterfaceState::Destroyed);
        assert!(!socket.exists());
        assert!(driver.device("office0").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn dropped_peers_and_gateways_are_withdrawn() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let driver = Arc::new(FakeDriver::default());
        let tunnels = manager(&driver, dir.path());
        let mut handle = tunnels.create(spec("office0")).await?;
        let gateway: IpNet = "192.168.50.0/24".parse().unwrap();

        tunnels
            .apply_peers(
                &mut handle,
                vec![peer("a", &["10.20.0.3/32"]), peer("b", &["10.20.0.4/32"])],
                vec![gateway],
            )
            .await?;
        assert!(driver.device("office0").unwrap().withdrawn.is_empty());

        tunnels
            .apply_peers(&mut handle, vec![peer("a", &["10.20.0.3/32"])], Vec::new())
            .await?;
        let device = driver.device("office0").unwrap();
        let expected: Vec<IpNet> = vec!["10.20.0.4/32".parse().unwrap(), gateway];
        assert_eq!(device.withdrawn, expected);
        assert_eq!(device.routes, Vec::<IpNet>::new());

        tunnels.destroy(&mut handle, None).await?;
        Ok(())
    }

    #[test]
    fn routed_prefixes_clear_host_bits() {
        let peers = vec![peer("a", &["10.20.0.3/24"])];
        let routes: Vec<IpNet> = vec!["10.20.0.0/24".parse().unwrap()];
        let prefixes: Vec<IpNet> = routed_prefixes(&peers, &routes).into_iter().collect();
        assert_eq!(prefixes, vec!["10.20.0.0/24".parse::<IpNet>().unwrap()]);
    }

    #[tokio::test]
    async fn applying_same_peers_twice_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let driver = Arc::new(FakeDriver::default());
        let tunnels = manager(&driver, dir.path());
        let mut handle = tunnels.create(spec("office0")).await?;
        let peers = vec![peer("a", &["10.20.0.3/32"]), peer("b", &["10.20.0.4/32"])];

        tunnels.apply_peers(&mut handle, peers.clone(), Vec::new()).await?;
        let once = (handle.peers().await, driver.device("office0"));
        tunnels.apply_peers(&mut handle, peers.clone(), Vec::new()).await?;
        let twice = (handle.peers().await, driver.device("office0"));
        assert_eq!(once, twice);
        assert_eq!(twice.0, peers);
        tunnels.destroy(&mut handle, None).await?;
        Ok(())
    }

    #[tokio::test]
    async fn failed_apply_marks_stale_and_keeps_old_table() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let driver = Arc::new(FakeDriver::default());
        let tunnels = manager(&driver, dir.path());
        let mut handle = tunnels.create(spec("office0")).await?;
        let good = vec![peer("a", &["10.20.0.3/32"])];
        tunnels.apply_peers(&mut handle, good.clone(), Vec::new()).await?;

        driver.fail_configure(true);
        let err = tunnels
            .apply_peers(&mut handle, vec![peer("b", &["10.20.0.4/32"])], Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ApplyFailed { .. }));
        assert!(handle.is_stale());
        assert_eq!(handle.state(), InterfaceState::Configured);
        assert_eq!(handle.peers().await, good);

        driver.fail_configure(false);
        tunnels.apply_peers(&mut handle, good, Vec::new()).await?;
        assert!(!handle.is_stale());
        tunnels.destroy(&mut handle, None).await?;
        Ok(())
    }

    #[tokio::test]
    async fn driver_rejection_is_create_failure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let driver = Arc::new(FakeDriver::default());
        driver.fail_create(true);
        let tunnels = manager(&driver, dir.path());
        let err = tunnels.create(spec("office0")).await.err().unwrap();
        assert!(matches!(err, Error::DeviceCreateFailed { .. }));

        let err = tunnels.create(spec("much-too-long-name0")).await.err().unwrap();
        assert!(matches!(err, Error::DeviceCreateFailed { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn destroy_runs_post_down_even_when_commands_fail() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let marker = dir.path().join("post-down-ran");
        let driver = Arc::new(FakeDriver::default());
        let tunnels = manager(&driver, dir.path());
        let mut handle = tunnels.create(spec("office0")).await?;
        let commands = format!("exit 3; touch {}", marker.display());
        tunnels.destroy(&mut handle, Some(&commands)).await?;
        assert!(marker.exists());
        Ok(())
    }
}
