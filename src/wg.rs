//! WireGuard drivers: the in-kernel module, or boringtun in-process when the
//! module is missing.

use crate::config::BackendPreference;
use crate::error::{Error, Result};
use crate::tunnel::TunnelDriver;
use std::sync::Arc;

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use crate::model::Peer;
    use crate::netlink::Netlink;
    use crate::tunnel::{routed_prefixes, InterfaceSpec};
    use async_trait::async_trait;
    use boringtun::device::{DeviceConfig, DeviceHandle};
    use ipnet::IpNet;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};
    use tokio::time::sleep;
    use tracing::{debug, warn};
    use wireguard_control::{
        Backend as WgBackend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder,
    };

    const LINK_TIMEOUT: Duration = Duration::from_secs(3);

    fn driver_error(context: &str, err: impl std::fmt::Display) -> Error {
        Error::Io(std::io::Error::other(format!("{context}: {err}")))
    }

    pub struct KernelDriver;

    #[async_trait]
    impl TunnelDriver for KernelDriver {
        fn backend(&self) -> &'static str {
            "kernel"
        }

        async fn create(&self, spec: &InterfaceSpec) -> Result<()> {
            base_update(spec)?
                .apply(&interface_name(&spec.name)?, WgBackend::Kernel)
                .map_err(|err| driver_error("wireguard interface setup failed", err))?;
            bring_up(spec).await
        }

        async fn configure(
            &self,
            spec: &InterfaceSpec,
            peers: &[Peer],
            routes: &[IpNet],
            withdrawn: &[IpNet],
        ) -> Result<()> {
            apply_peers(spec, peers, WgBackend::Kernel)?;
            sync_routes(&spec.name, peers, routes, withdrawn).await
        }

        async fn destroy(&self, name: &str) -> Result<()> {
            Netlink::new().await?.delete_link(name).await
        }

        async fn active_listen_ports(&self) -> Result<Vec<u16>> {
            listen_ports(WgBackend::Kernel)
        }
    }

    /// boringtun devices live as long as their handle in `handles`.
    #[derive(Default)]
    pub struct UserspaceDriver {
        handles: Mutex<HashMap<String, DeviceHandle>>,
    }

    impl UserspaceDriver {
        fn start(&self, name: &str) -> Result<()> {
            let mut handles = self
                .handles
                .lock()
                .map_err(|_| driver_error("boringtun", "device table poisoned"))?;
            if handles.contains_key(name) {
                return Ok(());
            }
            let handle = DeviceHandle::new(name, DeviceConfig::default())
                .map_err(|err| driver_error("boringtun init failed", format!("{err:?}")))?;
            handles.insert(name.to_string(), handle);
            Ok(())
        }

        fn stop(&self, name: &str) -> Result<()> {
            let mut handles = self
                .handles
                .lock()
                .map_err(|_| driver_error("boringtun", "device table poisoned"))?;
            handles.remove(name);
            Ok(())
        }
    }

    #[async_trait]
    impl TunnelDriver for UserspaceDriver {
        fn backend(&self) -> &'static str {
            "userspace"
        }

        fn outlives_process(&self) -> bool {
            false
        }

        async fn create(&self, spec: &InterfaceSpec) -> Result<()> {
            self.start(&spec.name)?;
            wait_for_userspace_socket(&spec.name, LINK_TIMEOUT).await?;
            base_update(spec)?
                .apply(&interface_name(&spec.name)?, WgBackend::Userspace)
                .map_err(|err| driver_error("wireguard interface setup failed", err))?;
            bring_up(spec).await
        }

        async fn configure(
            &self,
            spec: &InterfaceSpec,
            peers: &[Peer],
            routes: &[IpNet],
            withdrawn: &[IpNet],
        ) -> Result<()> {
            apply_peers(spec, peers, WgBackend::Userspace)?;
            sync_routes(&spec.name, peers, routes, withdrawn).await
        }

        async fn destroy(&self, name: &str) -> Result<()> {
            self.stop(name)?;
            let socket = userspace_socket_path(name);
            match std::fs::remove_file(&socket) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(socket = %socket.display(), error = %err, "failed to remove userspace socket")
                }
            }
            Netlink::new().await?.delete_link(name).await
        }

        async fn active_listen_ports(&self) -> Result<Vec<u16>> {
            listen_ports(WgBackend::Userspace)
        }
    }

    fn interface_name(name: &str) -> Result<InterfaceName> {
        name.parse()
            .map_err(|err| driver_error("invalid interface name", err))
    }

    fn parse_key(key: &str, what: &str) -> Result<Key> {
        Key::from_base64(key).map_err(|_| Error::InvalidKey(format!("invalid {what}")))
    }

    fn base_update(spec: &InterfaceSpec) -> Result<DeviceUpdate> {
        Ok(DeviceUpdate::new()
            .set_private_key(parse_key(&spec.private_key, "wireguard private key")?)
            .set_listen_port(spec.listen_port))
    }

    fn apply_peers(spec: &InterfaceSpec, peers: &[Peer], backend: WgBackend) -> Result<()> {
        let mut update = base_update(spec)?.replace_peers();
        for peer in peers {
            let key = parse_key(&peer.public_key, "peer public key")?;
            let mut builder = PeerConfigBuilder::new(&key).replace_allowed_ips();
            for net in &peer.allowed_ips {
                builder = builder.add_allowed_ip(net.network(), net.prefix_len());
            }
            if let Some(endpoint) = peer.endpoint {
                builder = builder.set_endpoint(endpoint);
            }
            if let Some(keepalive) = peer.persistent_keepalive {
                builder = builder.set_persistent_keepalive_interval(keepalive);
            }
            update = update.add_peer(builder);
        }
        update
            .apply(&interface_name(&spec.name)?, backend)
            .map_err(|err| driver_error("wireguard config apply failed", err))
    }

    async fn bring_up(spec: &InterfaceSpec) -> Result<()> {
        let netlink = Netlink::new().await?;
        let index = netlink.wait_for_link(&spec.name, LINK_TIMEOUT).await?;
        for net in [spec.address, spec.address6].into_iter().flatten() {
            netlink.replace_address(index, net.addr(), net.prefix_len()).await?;
        }
        netlink.set_link_up(index).await
    }

    async fn sync_routes(
        name: &str,
        peers: &[Peer],
        routes: &[IpNet],
        withdrawn: &[IpNet],
    ) -> Result<()> {
        let netlink = Netlink::new().await?;
        let index = netlink.wait_for_link(name, LINK_TIMEOUT).await?;
        for prefix in withdrawn {
            netlink.delete_route(*prefix, index).await?;
        }
        for prefix in routed_prefixes(peers, routes) {
            netlink.replace_route(prefix, index).await?;
        }
        Ok(())
    }

    fn listen_ports(backend: WgBackend) -> Result<Vec<u16>> {
        let names = Device::list(backend)
            .map_err(|err| driver_error("wireguard device list failed", err))?;
        let mut ports = Vec::new();
        for name in names {
            match Device::get(&name, backend) {
                Ok(device) => ports.extend(device.listen_port),
                Err(err) => debug!(interface = %name, error = %err, "skipping unreadable device"),
            }
        }
        Ok(ports)
    }

    async fn wait_for_userspace_socket(interface: &str, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let path = userspace_socket_path(interface);
        loop {
            if path.exists() {
                return Ok(());
            }
            if start.elapsed() > timeout {
                return Err(driver_error(
                    "boringtun",
                    format!("userspace socket {} did not appear", path.display()),
                ));
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    fn userspace_socket_path(interface: &str) -> PathBuf {
        Path::new("/var/run/wireguard").join(format!("{interface}.sock"))
    }

    pub fn kernel_module_loaded() -> bool {
        Path::new("/sys/module/wireguard").exists()
    }
}

/// Pick a driver strategy. `Auto` uses the kernel module when it is loaded.
#[cfg(target_os = "linux")]
pub fn select_driver(preference: BackendPreference) -> Result<Arc<dyn TunnelDriver>> {
    let driver: Arc<dyn TunnelDriver> = match preference {
        BackendPreference::Kernel => Arc::new(imp::KernelDriver),
        BackendPreference::Userspace => Arc::new(imp::UserspaceDriver::default()),
        BackendPreference::Auto if imp::kernel_module_loaded() => Arc::new(imp::KernelDriver),
        BackendPreference::Auto => Arc::new(imp::UserspaceDriver::default()),
    };
    Ok(driver)
}

#[cfg(not(target_os = "linux"))]
pub fn select_driver(_preference: BackendPreference) -> Result<Arc<dyn TunnelDriver>> {
    Err(Error::Config(
        "tunnel interfaces are only supported on linux".to_string(),
    ))
}
