//! In-memory collaborators for tests.

use crate::config::ServerConfig;
use crate::control::ControlPlane;
use crate::daemon::DaemonManager;
use crate::error::{Error, Result};
use crate::keys::{generate_wg_keys, SecretStore};
use crate::model::{Node, Peer, PeerList, RegisterRequest, RemotePeer};
use crate::resolver::{AddressEcho, HostInterface, HostNetwork};
use crate::session::{Context, NetworkSession};
use crate::state::{ConfigStore, NetworkConfig};
use crate::tunnel::{InterfaceSpec, TunnelDriver, TunnelManager};
use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub const PUBLIC_ADDRESS: &str = "198.51.100.7";
const ECHO_URL: &str = "https://echo.test";

pub fn peer(key: &str, allowed: &[&str]) -> Peer {
    Peer {
        public_key: key.to_string(),
        allowed_ips: allowed.iter().map(|net| net.parse().unwrap()).collect(),
        endpoint: None,
        persistent_keepalive: None,
    }
}

pub fn remote(key: &str, allowed: &str, endpoint: Option<&str>, listen_port: u16) -> RemotePeer {
    RemotePeer {
        public_key: key.to_string(),
        allowed_ips: vec![allowed.parse().unwrap()],
        endpoint: endpoint.map(str::to_string),
        local_address: None,
        listen_port,
        persistent_keepalive: None,
    }
}

/// An up, non-loopback interface.
pub fn iface(name: &str, mac: &str, addrs: &[&str]) -> HostInterface {
    HostInterface {
        name: name.to_string(),
        up: true,
        loopback: false,
        hardware_addr: (!mac.is_empty()).then(|| mac.to_string()),
        addresses: addrs.iter().map(|addr| addr.parse().unwrap()).collect(),
    }
}

pub fn joined_record(network: &str) -> NetworkConfig {
    NetworkConfig::new(
        network,
        ServerConfig::default(),
        Node {
            name: "laptop".to_string(),
            network: network.to_string(),
            mac_address: "02:00:00:00:00:01".to_string(),
            public_key: "self-pub".to_string(),
            interface: format!("{network}0"),
            address: Some("10.20.0.2/24".parse().unwrap()),
            endpoint: PUBLIC_ADDRESS.to_string(),
            listen_port: 51821,
            ..Node::default()
        },
        true,
    )
}

pub struct FakeHost {
    interfaces: Mutex<Option<Vec<HostInterface>>>,
}

impl FakeHost {
    pub fn new(interfaces: Vec<HostInterface>) -> Self {
        Self {
            interfaces: Mutex::new(Some(interfaces)),
        }
    }

    pub fn failing() -> Self {
        Self {
            interfaces: Mutex::new(None),
        }
    }

    pub fn set(&self, interfaces: Vec<HostInterface>) {
        *self.interfaces.lock().unwrap() = Some(interfaces);
    }
}

#[async_trait]
impl HostNetwork for FakeHost {
    async fn interfaces(&self) -> Result<Vec<HostInterface>> {
        self.interfaces
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Io(std::io::Error::other("address dump failed")))
    }
}

type EchoReply = std::result::Result<(u16, String), ()>;

pub struct FakeEcho {
    replies: Mutex<BTreeMap<String, EchoReply>>,
    calls: Mutex<Vec<String>>,
}

impl FakeEcho {
    pub fn new(replies: Vec<(&str, EchoReply)>) -> Self {
        Self {
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|(url, reply)| (url.to_string(), reply))
                    .collect(),
            ),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_all(&self) {
        for reply in self.replies.lock().unwrap().values_mut() {
            *reply = Err(());
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AddressEcho for FakeEcho {
    async fn fetch(&self, url: &str) -> Result<(u16, String)> {
        self.calls.lock().unwrap().push(url.to_string());
        match self.replies.lock().unwrap().get(url) {
            Some(Ok(reply)) => Ok(reply.clone()),
            _ => Err(Error::Control(format!("{url}: connection refused"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeDevice {
    pub spec: InterfaceSpec,
    pub peers: Vec<Peer>,
    pub routes: Vec<IpNet>,
    /// Prefixes the last `configure` asked to withdraw.
    pub withdrawn: Vec<IpNet>,
}

#[derive(Default)]
struct DriverState {
    devices: BTreeMap<String, FakeDevice>,
    calls: Vec<String>,
    creates: usize,
    fail_create: bool,
    fail_configure: bool,
    ports_in_use: Vec<u16>,
}

/// Parks `configure` until released, so a test can act while a peer table
/// swap is in flight.
#[derive(Default)]
pub struct ConfigureGate {
    pub entered: Notify,
    pub release: Notify,
}

#[derive(Default)]
pub struct FakeDriver {
    state: Mutex<DriverState>,
    gate: Mutex<Option<Arc<ConfigureGate>>>,
}

impl FakeDriver {
    pub fn fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    pub fn fail_configure(&self, fail: bool) {
        self.state.lock().unwrap().fail_configure = fail;
    }

    /// Ports held by devices this driver did not create.
    pub fn set_ports_in_use(&self, ports: Vec<u16>) {
        self.state.lock().unwrap().ports_in_use = ports;
    }

    pub fn device(&self, name: &str) -> Option<FakeDevice> {
        self.state.lock().unwrap().devices.get(name).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn create_count(&self) -> usize {
        self.state.lock().unwrap().creates
    }

    /// Every later `configure` waits on the returned gate.
    pub fn hold_configure(&self) -> Arc<ConfigureGate> {
        let gate = Arc::new(ConfigureGate::default());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl TunnelDriver for FakeDriver {
    fn backend(&self) -> &'static str {
        "fake"
    }

    async fn create(&self, spec: &InterfaceSpec) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("create {}", spec.name));
        if state.fail_create {
            return Err(Error::Io(std::io::Error::other("operation not permitted")));
        }
        state.creates += 1;
        state.devices.insert(
            spec.name.clone(),
            FakeDevice {
                spec: spec.clone(),
                peers: Vec::new(),
                routes: Vec::new(),
                withdrawn: Vec::new(),
            },
        );
        Ok(())
    }

    async fn configure(
        &self,
        spec: &InterfaceSpec,
        peers: &[Peer],
        routes: &[IpNet],
        withdrawn: &[IpNet],
    ) -> Result<()> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("configure {}", spec.name));
        if state.fail_configure {
            return Err(Error::Io(std::io::Error::other("device busy")));
        }
        let device = state
            .devices
            .get_mut(&spec.name)
            .ok_or_else(|| Error::Io(std::io::Error::other("no such device")))?;
        device.peers = peers.to_vec();
        device.routes = routes.to_vec();
        device.withdrawn = withdrawn.to_vec();
        Ok(())
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("destroy {name}"));
        state.devices.remove(name);
        Ok(())
    }

    async fn active_listen_ports(&self) -> Result<Vec<u16>> {
        let state = self.state.lock().unwrap();
        let mut ports = state.ports_in_use.clone();
        ports.extend(state.devices.values().map(|device| device.spec.listen_port));
        Ok(ports)
    }
}

#[derive(Default)]
struct ControlState {
    interface: Option<String>,
    pending: bool,
    local: Option<bool>,
    local_range: Option<IpNet>,
    peers: Vec<RemotePeer>,
    gateways: Vec<IpNet>,
    read_node_empty: bool,
    transport_down: bool,
    fail_deregister: bool,
    requests: Vec<RegisterRequest>,
    deregistered: Vec<String>,
}

impl ControlState {
    fn overlay(&self, node: &mut Node) {
        if let Some(interface) = &self.interface {
            node.interface = interface.clone();
        }
        if let Some(local) = self.local {
            node.is_local = local;
        }
        if self.local_range.is_some() {
            node.local_range = self.local_range;
        }
        node.is_pending = self.pending;
    }

    fn check_transport(&self) -> Result<()> {
        if self.transport_down {
            return Err(Error::Control("control request failed: connection refused".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeControl {
    state: Mutex<ControlState>,
}

impl FakeControl {
    pub fn set_interface(&self, interface: &str) {
        self.state.lock().unwrap().interface = Some(interface.to_string());
    }

    pub fn set_pending(&self, pending: bool) {
        self.state.lock().unwrap().pending = pending;
    }

    pub fn set_local(&self, local: bool) {
        self.state.lock().unwrap().local = Some(local);
    }

    pub fn set_local_range(&self, range: IpNet) {
        self.state.lock().unwrap().local_range = Some(range);
    }

    pub fn set_peers(&self, peers: Vec<RemotePeer>) {
        self.state.lock().unwrap().peers = peers;
    }

    pub fn set_gateways(&self, gateways: Vec<IpNet>) {
        self.state.lock().unwrap().gateways = gateways;
    }

    pub fn set_read_node_empty(&self, empty: bool) {
        self.state.lock().unwrap().read_node_empty = empty;
    }

    pub fn fail_transport(&self, down: bool) {
        self.state.lock().unwrap().transport_down = down;
    }

    pub fn fail_deregister(&self, fail: bool) {
        self.state.lock().unwrap().fail_deregister = fail;
    }

    pub fn last_request(&self) -> Option<RegisterRequest> {
        self.state.lock().unwrap().requests.last().cloned()
    }

    pub fn register_count(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    pub fn deregistered(&self) -> Vec<String> {
        self.state.lock().unwrap().deregistered.clone()
    }
}

#[async_trait]
impl ControlPlane for FakeControl {
    async fn register_node(&self, request: &RegisterRequest) -> Result<Node> {
        let mut state = self.state.lock().unwrap();
        state.check_transport()?;
        state.requests.push(request.clone());
        let mut node = request.node.clone();
        state.overlay(&mut node);
        Ok(node)
    }

    async fn read_node(&self, _node_id: &str, network: &str) -> Result<Node> {
        let state = self.state.lock().unwrap();
        state.check_transport()?;
        if state.read_node_empty {
            return Err(Error::EmptyRecord("read node: no result found".to_string()));
        }
        let mut node = Node {
            network: network.to_string(),
            ..Node::default()
        };
        state.overlay(&mut node);
        Ok(node)
    }

    async fn fetch_peers(&self, _node_id: &str, _network: &str) -> Result<PeerList> {
        let state = self.state.lock().unwrap();
        state.check_transport()?;
        Ok(PeerList {
            peers: state.peers.clone(),
            has_gateway: !state.gateways.is_empty(),
            gateways: state.gateways.clone(),
        })
    }

    async fn deregister_node(&self, node_id: &str, _network: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check_transport()?;
        state.deregistered.push(node_id.to_string());
        if state.fail_deregister {
            return Err(Error::Control("deregister node failed with 503".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDaemon {
    installed: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    fail_remove: Mutex<bool>,
}

impl FakeDaemon {
    pub fn installed(&self) -> Vec<String> {
        self.installed.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn fail_remove(&self, fail: bool) {
        *self.fail_remove.lock().unwrap() = fail;
    }
}

#[async_trait]
impl DaemonManager for FakeDaemon {
    async fn install(&self, network: &str) -> Result<()> {
        self.installed.lock().unwrap().push(network.to_string());
        Ok(())
    }

    async fn remove(&self, network: &str) -> Result<()> {
        self.removed.lock().unwrap().push(network.to_string());
        if *self.fail_remove.lock().unwrap() {
            return Err(Error::Daemon("systemctl disable failed".to_string()));
        }
        Ok(())
    }

    async fn is_installed(&self, network: &str) -> Result<bool> {
        Ok(self.installed.lock().unwrap().iter().any(|n| n == network))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, NetworkConfig>>,
}

impl ConfigStore for MemoryStore {
    fn read(&self, network: &str) -> Result<Option<NetworkConfig>> {
        Ok(self.records.lock().unwrap().get(network).cloned())
    }

    fn write(&self, config: &NetworkConfig) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .insert(config.network.clone(), config.clone());
        Ok(())
    }

    fn delete(&self, network: &str) -> Result<()> {
        self.records.lock().unwrap().remove(network);
        Ok(())
    }

    fn list_networks(&self) -> Result<Vec<String>> {
        Ok(self.records.lock().unwrap().keys().cloned().collect())
    }
}

#[derive(Default)]
pub struct MemorySecrets {
    secrets: Mutex<BTreeMap<String, String>>,
    keys: Mutex<BTreeMap<String, String>>,
}

impl MemorySecrets {
    pub fn secret(&self, network: &str) -> Option<String> {
        self.secrets.lock().unwrap().get(network).cloned()
    }

    pub fn private_key(&self, network: &str) -> Option<String> {
        self.keys.lock().unwrap().get(network).cloned()
    }
}

impl SecretStore for MemorySecrets {
    fn store_secret(&self, value: &str, network: &str) -> Result<()> {
        self.secrets
            .lock()
            .unwrap()
            .insert(network.to_string(), value.to_string());
        Ok(())
    }

    fn store_private_key(&self, value: &str, network: &str) -> Result<()> {
        self.keys
            .lock()
            .unwrap()
            .insert(network.to_string(), value.to_string());
        Ok(())
    }

    fn read_private_key(&self, network: &str) -> Result<String> {
        self.private_key(network)
            .ok_or_else(|| Error::InvalidKey(format!("no private key stored for {network}")))
    }

    fn remove(&self, network: &str) -> Result<()> {
        self.secrets.lock().unwrap().remove(network);
        self.keys.lock().unwrap().remove(network);
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub secrets: Arc<MemorySecrets>,
    pub daemon: Arc<FakeDaemon>,
    pub driver: Arc<FakeDriver>,
    pub control: Arc<FakeControl>,
    pub host: Arc<FakeHost>,
    pub echo: Arc<FakeEcho>,
    pub ctx: Arc<Context>,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn session(&self, network: &str) -> NetworkSession {
        NetworkSession::new(network, self.control.clone(), self.ctx.clone())
    }

    /// A network joined by an earlier run: record and key on disk, no handle.
    pub fn install(&self, record: &NetworkConfig) -> Result<()> {
        self.store.write(record)?;
        self.secrets
            .store_private_key(&generate_wg_keys().private_key, &record.network)
    }
}

/// One host with a single uplink (`eth0`, 203.0.113.10) and an echo service
/// that reports 198.51.100.7.
pub fn harness() -> Result<Harness> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(MemoryStore::default());
    let secrets = Arc::new(MemorySecrets::default());
    let daemon = Arc::new(FakeDaemon::default());
    let driver = Arc::new(FakeDriver::default());
    let control = Arc::new(FakeControl::default());
    let host = Arc::new(FakeHost::new(vec![
        HostInterface {
            name: "lo".to_string(),
            up: true,
            loopback: true,
            hardware_addr: None,
            addresses: vec!["127.0.0.1".parse().unwrap()],
        },
        iface("eth0", "02:00:00:00:00:01", &["203.0.113.10"]),
    ]));
    let echo = Arc::new(FakeEcho::new(vec![(
        ECHO_URL,
        Ok((200, format!("{PUBLIC_ADDRESS}\n"))),
    )]));
    let ctx = Arc::new(Context {
        store: store.clone(),
        secrets: secrets.clone(),
        daemon: daemon.clone(),
        host: host.clone(),
        echo: echo.clone(),
        tunnels: Arc::new(TunnelManager::new(driver.clone(), dir.path().join("run"))),
        public_ip_services: vec![ECHO_URL.to_string()],
        base_port: crate::resolver::DEFAULT_BASE_PORT,
    });
    Ok(Harness {
        store,
        secrets,
        daemon,
        driver,
        control,
        host,
        echo,
        ctx,
        _dir: dir,
    })
}
