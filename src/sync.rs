//! One synchronization pass: bring the local interface in line with the
//! control plane's view of this node and its peers.

use crate::error::{Error, Result};
use crate::model::{Node, Peer, PeerList};
use crate::resolver::resolve_free_port;
use crate::session::{interface_spec, NetworkSession};
use crate::state::NetworkConfig;
use crate::tunnel::{default_interface_name, needs_rebuild};
use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info, warn};

impl NetworkSession {
    /// Returns the node as it stands after the pass. A node the control plane
    /// does not know comes back unchanged and nothing local is touched.
    pub async fn sync(&mut self, node: &Node) -> Result<Node> {
        let network = self.network.clone();
        let sync_failed = |err: Error| Error::SyncFailed {
            network: network.clone(),
            reason: err.to_string(),
        };
        let mut record = self
            .ctx
            .store
            .read(&network)?
            .ok_or_else(|| Error::NotInstalled(network.clone()))?;

        let server = match self.control.read_node(node.identifier(), &network).await {
            Ok(server) => server,
            Err(err) if err.is_empty_record() => {
                info!(network = %network, "control plane has no record for this node, skipping");
                return Ok(node.clone());
            }
            Err(err) => return Err(sync_failed(err)),
        };
        let peer_list = self.fetch_peer_list(node).await.map_err(sync_failed)?;

        let mut updated = node.clone();
        updated.merge_from_server(&server);
        if updated.interface.is_empty() {
            updated.interface = default_interface_name(&network);
        }

        if updated.is_pending {
            info!(network = %network, "node is pending approval, leaving the interface alone");
            record.node = updated.clone();
            record.touch();
            self.ctx.store.write(&record)?;
            return Ok(updated);
        }

        if let Err(err) = self.reconcile(&mut updated, &record, &peer_list).await {
            let err = match err {
                err @ Error::ApplyFailed { .. } => err,
                other => Error::ApplyFailed {
                    interface: updated.interface.clone(),
                    reason: other.to_string(),
                },
            };
            warn!(network = %network, error = %err, "sync pass failed, marking state stale");
            record.stale = true;
            record.touch();
            if let Err(persist) = self.ctx.store.write(&record) {
                warn!(network = %network, error = %persist, "failed to persist stale flag");
            }
            return Err(err);
        }

        record.node = updated.clone();
        record.stale = false;
        record.touch();
        self.ctx.store.write(&record)?;
        Ok(updated)
    }

    /// Peer list for this node; "no records" means no peers yet.
    pub(crate) async fn fetch_peer_list(&self, node: &Node) -> Result<PeerList> {
        match self.control.fetch_peers(node.identifier(), &self.network).await {
            Ok(list) => Ok(list),
            Err(err) if err.is_empty_record() => Ok(PeerList::default()),
            Err(err) => Err(err),
        }
    }

    async fn reconcile(
        &mut self,
        node: &mut Node,
        record: &NetworkConfig,
        peer_list: &PeerList,
    ) -> Result<()> {
        let private_key = self.ctx.secrets.read_private_key(&self.network)?;
        let previous = record.node.interface.as_str();
        let rebuild = match &self.tunnel {
            None => true,
            Some(handle) => {
                handle.is_stale()
                    || record.stale
                    || needs_rebuild(&node.interface, handle.name())
                    || needs_rebuild(&node.interface, previous)
                    || handle.device().spec() != &interface_spec(node, &private_key)
            }
        };

        let peers = resolve_peers(node, peer_list);
        let routes = gateway_routes(peer_list);

        if !rebuild {
            if let Some(handle) = self.tunnel.as_mut() {
                return self.ctx.tunnels.apply_peers(handle, peers, routes).await;
            }
        }

        let fallback = if previous.is_empty() {
            node.interface.clone()
        } else {
            previous.to_string()
        };
        let mut old = record.node.clone();
        old.interface = fallback.clone();
        self.tear_down(&old, Some(&fallback)).await?;
        if node.listen_port == 0 {
            let in_use = self.ctx.tunnels.active_listen_ports().await?;
            node.listen_port = resolve_free_port(&in_use, self.ctx.base_port)?;
        }
        info!(network = %self.network, interface = %node.interface, "rebuilding tunnel interface");
        self.bring_up(node, &private_key, peers, routes).await
    }
}

/// Turn the control plane's peer descriptions into an installable table.
/// When this node is local, peers inside its local range are reached on
/// their local address instead of the public endpoint.
pub fn resolve_peers(node: &Node, list: &PeerList) -> Vec<Peer> {
    let mut peers = Vec::new();
    for remote in &list.peers {
        if !node.public_key.is_empty() && remote.public_key == node.public_key {
            continue;
        }
        let local = match (node.is_local, node.local_range, remote.local_address) {
            (true, Some(range), Some(addr)) if range.contains(&addr) && remote.listen_port != 0 => {
                Some(SocketAddr::new(addr, remote.listen_port))
            }
            _ => None,
        };
        let endpoint = local.or_else(|| {
            remote
                .endpoint
                .as_deref()
                .and_then(|endpoint| parse_endpoint(endpoint, remote.listen_port))
        });
        if endpoint.is_none() && remote.endpoint.as_deref().is_some_and(|e| !e.is_empty()) {
            warn!(peer = %remote.public_key, "ignoring unusable peer endpoint");
        }
        let keepalive = remote
            .persistent_keepalive
            .or((node.persistent_keepalive != 0).then_some(node.persistent_keepalive));
        peers.push(Peer {
            public_key: remote.public_key.clone(),
            allowed_ips: remote.allowed_ips.clone(),
            endpoint,
            persistent_keepalive: keepalive,
        });
    }
    debug!(count = peers.len(), "resolved peers");
    peers
}

/// `host:port`, or a bare address paired with the advertised listen port.
fn parse_endpoint(endpoint: &str, listen_port: u16) -> Option<SocketAddr> {
    let endpoint = endpoint.trim();
    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        return Some(addr);
    }
    match endpoint.parse::<IpAddr>() {
        Ok(ip) if listen_port != 0 => Some(SocketAddr::new(ip, listen_port)),
        _ => None,
    }
}

fn gateway_routes(list: &PeerList) -> Vec<IpNet> {
    if list.has_gateway {
        list.gateways.clone()
    } else {
        Vec::new()
    }
}
