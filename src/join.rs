//! Enrollment into a network and removal from it.
//!
//! Join runs to completion or to rollback. Once the provisional record is on
//! disk every failure unwinds the whole enrollment: remote de-registration,
//! interface, record, secrets and daemon registration are all attempted even
//! when an earlier cleanup step fails.

use crate::config::ServerConfig;
use crate::error::{Error, JoinStep, Result};
use crate::keys::{generate_passphrase, resolve_wg_keys};
use crate::model::{Node, RegisterRequest};
use crate::resolver::{resolve_free_port, resolve_hardware_id, resolve_local, resolve_public};
use crate::session::NetworkSession;
use crate::state::{validate_network_name, NetworkConfig};
use crate::sync::resolve_peers;
use crate::tunnel::default_interface_name;
use ipnet::IpNet;
use std::net::IpAddr;
use tracing::{info, warn};

/// What the operator supplied for a join.
#[derive(Clone, Debug, Default)]
pub struct JoinOptions {
    pub server: ServerConfig,
    pub node_name: Option<String>,
    pub private_key: Option<String>,
    pub password: Option<String>,
    pub local_range: Option<IpNet>,
    /// Pins the local address instead of scanning interfaces.
    pub local_address: Option<IpAddr>,
    pub is_local: bool,
    pub endpoint: Option<String>,
    pub listen_port: Option<u16>,
    pub keepalive: Option<u16>,
    pub interface: Option<String>,
    pub pre_up: Option<String>,
    pub post_up: Option<String>,
    pub pre_down: Option<String>,
    pub post_down: Option<String>,
    pub daemon: bool,
    /// Register and persist only; a later sync creates the interface.
    pub defer_interface: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Registered and waiting for approval; the daemon brings the interface up later.
    Pending(Node),
    /// Registered; the interface is left to the daemon's first sync.
    Deferred(Node),
    Connected(Node),
}

impl JoinOutcome {
    pub fn node(&self) -> &Node {
        match self {
            JoinOutcome::Pending(node)
            | JoinOutcome::Deferred(node)
            | JoinOutcome::Connected(node) => node,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub remote_deregistered: bool,
    /// Local cleanup steps that failed; already logged.
    pub cleanup_failures: Vec<String>,
}

/// What a failed join left behind.
#[derive(Default)]
struct Progress {
    node: Node,
    identifier: Option<String>,
}

type StepResult<T> = std::result::Result<T, (JoinStep, Error)>;

fn at(step: JoinStep) -> impl FnOnce(Error) -> (JoinStep, Error) {
    move |err| (step, err)
}

impl NetworkSession {
    pub async fn join(&mut self, options: &JoinOptions) -> Result<JoinOutcome> {
        let network = self.network.clone();
        validate_network_name(&network)?;
        if self.ctx.store.read(&network)?.is_some() {
            return Err(Error::AlreadyInstalled(network));
        }

        let mut node = Node {
            name: options.node_name.clone().unwrap_or_else(default_node_name),
            network: network.clone(),
            interface: options.interface.clone().unwrap_or_default(),
            local_address: options.local_address,
            local_range: options.local_range,
            endpoint: options.endpoint.clone().unwrap_or_default(),
            listen_port: options.listen_port.unwrap_or(0),
            persistent_keepalive: options.keepalive.unwrap_or(0),
            is_local: options.is_local,
            pre_up: options.pre_up.clone(),
            post_up: options.post_up.clone(),
            pre_down: options.pre_down.clone(),
            post_down: options.post_down.clone(),
            ..Node::default()
        };
        let record = NetworkConfig::new(&network, options.server.clone(), node.clone(), options.daemon);
        self.ctx.store.write(&record).map_err(|err| Error::Join {
            network: network.clone(),
            step: JoinStep::PersistProvisional,
            source: Box::new(err),
        })?;
        info!(network = %network, "joining network");

        let mut progress = Progress::default();
        match self.enroll(options, &mut node, record, &mut progress).await {
            Ok(outcome) => {
                if options.daemon {
                    if let Err(err) = self.ctx.daemon.install(&network).await {
                        warn!(network = %network, error = %err, "joined, but installing the daemon failed");
                    }
                }
                Ok(outcome)
            }
            Err((step, err)) => {
                warn!(network = %network, step = %step, error = %err, "join failed, rolling back");
                progress.node = node;
                self.roll_back(&progress).await;
                Err(Error::Join {
                    network,
                    step,
                    source: Box::new(err),
                })
            }
        }
    }

    async fn enroll(
        &mut self,
        options: &JoinOptions,
        node: &mut Node,
        mut record: NetworkConfig,
        progress: &mut Progress,
    ) -> StepResult<JoinOutcome> {
        let network = self.network.clone();
        let ctx = self.ctx.clone();

        if node.local_address.is_none() {
            if let Some(range) = node.local_range {
                let filter = node.is_local.then_some(&range);
                let addr = resolve_local(ctx.host.as_ref(), filter)
                    .await
                    .map_err(at(JoinStep::ResolveLocalAddress))?;
                node.local_address = Some(addr);
            }
        }

        let password = match options.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => password.to_string(),
            None => generate_passphrase(),
        };
        ctx.secrets
            .store_secret(&password, &network)
            .map_err(at(JoinStep::StoreSecret))?;

        if node.endpoint.is_empty() {
            node.endpoint = match (node.is_local, node.local_address) {
                (true, Some(local)) => local.to_string(),
                _ => resolve_public(ctx.echo.as_ref(), &ctx.public_ip_services)
                    .await
                    .map_err(at(JoinStep::ResolveEndpoint))?
                    .to_string(),
            };
        }

        let keys = resolve_wg_keys(options.private_key.as_deref()).map_err(at(JoinStep::GenerateKeys))?;
        node.public_key = keys.public_key.clone();

        node.mac_address = resolve_hardware_id(ctx.host.as_ref())
            .await
            .map_err(at(JoinStep::ResolveIdentifier))?;

        let request = RegisterRequest {
            node: node.clone(),
            access_key: options.server.access_key.clone(),
            password,
        };
        let server = self
            .control
            .register_node(&request)
            .await
            .map_err(at(JoinStep::Register))?;
        progress.identifier = Some(node.identifier().to_string());
        let was_local = node.is_local;
        node.merge_from_server(&server);
        info!(network = %network, pending = node.is_pending, "node registered");

        if !was_local && node.is_local {
            if let Some(range) = node.local_range {
                let addr = resolve_local(ctx.host.as_ref(), Some(&range))
                    .await
                    .map_err(at(JoinStep::ResolveLocalAddress))?;
                node.local_address = Some(addr);
                node.endpoint = addr.to_string();
                info!(network = %network, endpoint = %addr, "control plane reclassified node as local");
            }
        }
        if node.interface.is_empty() {
            node.interface = default_interface_name(&network);
        }

        if node.listen_port == 0 {
            let in_use = ctx
                .tunnels
                .active_listen_ports()
                .await
                .map_err(at(JoinStep::ResolveListenPort))?;
            node.listen_port =
                resolve_free_port(&in_use, ctx.base_port).map_err(at(JoinStep::ResolveListenPort))?;
        }

        record.node = node.clone();
        record.touch();
        ctx.store.write(&record).map_err(at(JoinStep::PersistRecord))?;

        ctx.secrets
            .store_private_key(&keys.private_key, &network)
            .map_err(at(JoinStep::StorePrivateKey))?;

        if node.is_pending {
            info!(network = %network, "node is pending approval; the interface comes up once approved");
            return Ok(JoinOutcome::Pending(node.clone()));
        }
        if options.defer_interface {
            info!(network = %network, interface = %node.interface, "interface creation left to the daemon");
            return Ok(JoinOutcome::Deferred(node.clone()));
        }

        let peer_list = self
            .fetch_peer_list(node)
            .await
            .map_err(at(JoinStep::FetchPeers))?;
        let peers = resolve_peers(node, &peer_list);
        let routes = if peer_list.has_gateway {
            peer_list.gateways.clone()
        } else {
            Vec::new()
        };
        self.bring_up(node, &keys.private_key, peers, routes)
            .await
            .map_err(at(JoinStep::BringUp))?;
        info!(network = %network, interface = %node.interface, port = node.listen_port, "joined network");
        Ok(JoinOutcome::Connected(node.clone()))
    }

    async fn roll_back(&mut self, progress: &Progress) {
        let mut failures = Vec::new();
        if let Some(id) = &progress.identifier {
            if let Err(err) = self.control.deregister_node(id, &self.network).await {
                warn!(network = %self.network, error = %err, "rollback: remote de-registration failed");
            }
        }
        failures.extend(self.wipe(&progress.node, false).await);
        if !failures.is_empty() {
            let err = Error::RollbackPartial {
                network: self.network.clone(),
                failures,
            };
            warn!(error = %err, "rollback incomplete");
        }
    }

    /// Remove this node from the network. Local state is always wiped, even
    /// when the control plane cannot be reached.
    pub async fn leave(&mut self) -> Result<LeaveOutcome> {
        let network = self.network.clone();
        let record = self
            .ctx
            .store
            .read(&network)?
            .ok_or_else(|| Error::NotInstalled(network.clone()))?;

        let id = record.node.identifier();
        let remote_deregistered = if id.is_empty() {
            false
        } else {
            match self.control.deregister_node(id, &network).await {
                Ok(()) => true,
                Err(err) if err.is_empty_record() => true,
                Err(err) => {
                    warn!(network = %network, error = %err, "remote de-registration failed, wiping local state anyway");
                    false
                }
            }
        };

        let cleanup_failures = self.wipe(&record.node, true).await;
        if !cleanup_failures.is_empty() {
            let err = Error::RollbackPartial {
                network: network.clone(),
                failures: cleanup_failures.clone(),
            };
            warn!(error = %err, "leave left local state behind");
        }
        info!(network = %network, remote_deregistered, "left network");
        Ok(LeaveOutcome {
            remote_deregistered,
            cleanup_failures,
        })
    }

    /// Best-effort local cleanup; returns what failed. Only `leave` removes a
    /// device this session holds no handle for.
    async fn wipe(&mut self, node: &Node, by_name: bool) -> Vec<String> {
        let network = self.network.clone();
        let ctx = self.ctx.clone();
        let mut failures = Vec::new();

        let fallback = by_name.then_some(node.interface.as_str());
        if let Err(err) = self.tear_down(node, fallback).await {
            failures.push(format!("interface: {err}"));
        }
        if let Err(err) = ctx.store.delete(&network) {
            failures.push(format!("record: {err}"));
        }
        if let Err(err) = ctx.secrets.remove(&network) {
            failures.push(format!("secrets: {err}"));
        }
        if let Err(err) = ctx.daemon.remove(&network).await {
            failures.push(format!("daemon: {err}"));
        }
        for failure in &failures {
            warn!(network = %network, failure = %failure, "cleanup step failed");
        }
        failures
    }
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/proc/sys/kernel/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "node".to_string())
}
