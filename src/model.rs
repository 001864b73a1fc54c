use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// This host's identity within one network.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub name: String,
    pub network: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub interface: String,
    #[serde(default)]
    pub address: Option<IpNet>,
    #[serde(default)]
    pub address6: Option<IpNet>,
    #[serde(default)]
    pub local_address: Option<IpAddr>,
    #[serde(default)]
    pub local_range: Option<IpNet>,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default)]
    pub persistent_keepalive: u16,
    #[serde(default)]
    pub is_local: bool,
    #[serde(default)]
    pub is_pending: bool,
    #[serde(default)]
    pub is_dual_stack: bool,
    #[serde(default)]
    pub is_gateway: bool,
    #[serde(default)]
    pub pre_up: Option<String>,
    #[serde(default)]
    pub post_up: Option<String>,
    #[serde(default)]
    pub pre_down: Option<String>,
    #[serde(default)]
    pub post_down: Option<String>,
}

impl Node {
    /// Identifier the control plane knows this node by.
    pub fn identifier(&self) -> &str {
        &self.mac_address
    }

    /// Overlay fields from the control plane's canonical record. Values the
    /// server leaves blank keep what this host already knows.
    pub fn merge_from_server(&mut self, server: &Node) {
        if !server.name.is_empty() {
            self.name = server.name.clone();
        }
        if !server.interface.is_empty() {
            self.interface = server.interface.clone();
        }
        if !server.public_key.is_empty() && self.public_key.is_empty() {
            self.public_key = server.public_key.clone();
        }
        if server.address.is_some() {
            self.address = server.address;
        }
        if server.address6.is_some() {
            self.address6 = server.address6;
        }
        if server.local_range.is_some() {
            self.local_range = server.local_range;
        }
        if !server.endpoint.is_empty() {
            self.endpoint = server.endpoint.clone();
        }
        if server.listen_port != 0 {
            self.listen_port = server.listen_port;
        }
        if server.persistent_keepalive != 0 {
            self.persistent_keepalive = server.persistent_keepalive;
        }
        self.is_local = server.is_local;
        self.is_pending = server.is_pending;
        self.is_dual_stack = server.is_dual_stack;
        self.is_gateway = server.is_gateway;
        for (ours, theirs) in [
            (&mut self.pre_up, &server.pre_up),
            (&mut self.post_up, &server.post_up),
            (&mut self.pre_down, &server.pre_down),
            (&mut self.post_down, &server.post_down),
        ] {
            if theirs.is_some() {
                *ours = theirs.clone();
            }
        }
    }
}

/// Registration payload sent to the control plane.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(flatten)]
    pub node: Node,
    #[serde(default)]
    pub access_key: Option<String>,
    pub password: String,
}

/// A remote node as described by the control plane.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePeer {
    pub public_key: String,
    #[serde(default)]
    pub allowed_ips: Vec<IpNet>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub local_address: Option<IpAddr>,
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default)]
    pub persistent_keepalive: Option<u16>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerList {
    #[serde(default)]
    pub peers: Vec<RemotePeer>,
    #[serde(default)]
    pub has_gateway: bool,
    #[serde(default)]
    pub gateways: Vec<IpNet>,
}

/// The tunnel-relevant projection of a peer, ready to install.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub public_key: String,
    pub allowed_ips: Vec<IpNet>,
    pub endpoint: Option<SocketAddr>,
    pub persistent_keepalive: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_fields_override_request_fields() {
        let mut node = Node {
            network: "office".into(),
            name: "laptop".into(),
            endpoint: "198.51.100.4".into(),
            public_key: "local-key".into(),
            listen_port: 0,
            post_down: Some("echo bye".into()),
            ..Node::default()
        };
        let server = Node {
            network: "office".into(),
            interface: "office0".into(),
            listen_port: 51830,
            is_pending: true,
            is_dual_stack: true,
            ..Node::default()
        };
        node.merge_from_server(&server);
        assert_eq!(node.interface, "office0");
        assert_eq!(node.listen_port, 51830);
        assert_eq!(node.name, "laptop");
        assert_eq!(node.endpoint, "198.51.100.4");
        assert_eq!(node.public_key, "local-key");
        assert_eq!(node.post_down.as_deref(), Some("echo bye"));
        assert!(node.is_pending);
        assert!(node.is_dual_stack);
    }

    #[test]
    fn register_request_flattens_node() {
        let request = RegisterRequest {
            node: Node {
                network: "office".into(),
                mac_address: "aa:bb:cc:dd:ee:ff".into(),
                ..Node::default()
            },
            access_key: Some("key".into()),
            password: "secret".into(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["network"], "office");
        assert_eq!(value["mac_address"], "aa:bb:cc:dd:ee:ff");
        assert_eq!(value["password"], "secret");
    }

    #[test]
    fn peer_list_defaults_missing_fields() {
        let list: PeerList =
            serde_json::from_str(r#"{"peers":[{"public_key":"abc"}]}"#).unwrap();
        assert_eq!(list.peers.len(), 1);
        assert!(!list.has_gateway);
        assert!(list.peers[0].allowed_ips.is_empty());
    }
}
