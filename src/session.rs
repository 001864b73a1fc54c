use crate::control::ControlPlane;
use crate::daemon::DaemonManager;
use crate::error::Result;
use crate::keys::SecretStore;
use crate::model::{Node, Peer};
use crate::resolver::{AddressEcho, HostNetwork};
use crate::state::ConfigStore;
use crate::tunnel::{run_hooks, InterfaceSpec, InterfaceState, TunnelHandle, TunnelManager};
use ipnet::IpNet;
use std::sync::Arc;
use tracing::debug;

/// Host-wide collaborators shared by every network session.
pub struct Context {
    pub store: Arc<dyn ConfigStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub daemon: Arc<dyn DaemonManager>,
    pub host: Arc<dyn HostNetwork>,
    pub echo: Arc<dyn AddressEcho>,
    pub tunnels: Arc<TunnelManager>,
    pub public_ip_services: Vec<String>,
    pub base_port: u16,
}

/// Everything one network needs. Join, sync and leave take `&mut self`, so
/// passes for the same network never overlap; different networks use
/// different sessions and run independently.
pub struct NetworkSession {
    pub(crate) network: String,
    pub(crate) control: Arc<dyn ControlPlane>,
    pub(crate) ctx: Arc<Context>,
    pub(crate) tunnel: Option<TunnelHandle>,
}

impl NetworkSession {
    pub fn new(network: &str, control: Arc<dyn ControlPlane>, ctx: Arc<Context>) -> Self {
        Self {
            network: network.to_string(),
            control,
            ctx,
            tunnel: None,
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn tunnel(&self) -> Option<&TunnelHandle> {
        self.tunnel.as_ref()
    }

    pub fn interface_state(&self) -> InterfaceState {
        self.tunnel
            .as_ref()
            .map_or(InterfaceState::Absent, TunnelHandle::state)
    }

    /// `pre_up`, create, first peer table, `post_up`. The handle is kept even
    /// if the first apply fails so the caller can tear it down.
    pub(crate) async fn bring_up(
        &mut self,
        node: &Node,
        private_key: &str,
        peers: Vec<Peer>,
        routes: Vec<IpNet>,
    ) -> Result<()> {
        let spec = interface_spec(node, private_key);
        run_hooks("pre_up", &spec.name, node.pre_up.as_deref()).await;
        let handle = self.ctx.tunnels.create(spec).await?;
        let handle = self.tunnel.insert(handle);
        self.ctx.tunnels.apply_peers(handle, peers, routes).await?;
        run_hooks("post_up", handle.name(), node.post_up.as_deref()).await;
        Ok(())
    }

    /// Destroy the interface held by this session, or when there is none the
    /// one named `fallback` (left over from an earlier process).
    pub(crate) async fn tear_down(&mut self, node: &Node, fallback: Option<&str>) -> Result<()> {
        let tunnels = Arc::clone(&self.ctx.tunnels);
        match self.tunnel.take() {
            Some(mut handle) => {
                run_hooks("pre_down", handle.name(), node.pre_down.as_deref()).await;
                tunnels.destroy(&mut handle, node.post_down.as_deref()).await
            }
            None => match fallback.filter(|name| !name.is_empty()) {
                Some(name) => {
                    run_hooks("pre_down", name, node.pre_down.as_deref()).await;
                    tunnels.destroy_by_name(name, node.post_down.as_deref()).await
                }
                None => Ok(()),
            },
        }
    }

    /// Stop the configuration listener and leave the device in place.
    pub async fn close(mut self) {
        if let Some(handle) = self.tunnel.take() {
            debug!(network = %self.network, interface = %handle.name(), "closing session");
            self.ctx.tunnels.detach(handle).await;
        }
    }
}

pub(crate) fn interface_spec(node: &Node, private_key: &str) -> InterfaceSpec {
    InterfaceSpec {
        name: node.interface.clone(),
        address: node.address,
        address6: if node.is_dual_stack { node.address6 } else { None },
        listen_port: node.listen_port,
        private_key: private_key.to_string(),
    }
}
