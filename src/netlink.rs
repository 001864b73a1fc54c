use crate::error::{Error, Result};
use ipnet::IpNet;
use std::net::IpAddr;
use std::time::Duration;

/// A host link as enumerated from the kernel, in kernel order.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    pub up: bool,
    pub loopback: bool,
    pub hardware_addr: Option<String>,
}

fn netlink_error(context: &str, err: impl std::fmt::Display) -> Error {
    Error::Io(std::io::Error::other(format!("{context}: {err}")))
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use futures_util::stream::TryStreamExt;
    use netlink_packet_route::address::AddressAttribute;
    use netlink_packet_route::link::{LinkAttribute, LinkFlags};
    use rtnetlink::{new_connection, Handle, LinkUnspec, RouteMessageBuilder};
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::time::Instant;
    use tokio::time::sleep;

    /// Kernel reply when the route to delete does not exist.
    const ESRCH: i32 = 3;

    #[derive(Clone)]
    pub struct Netlink {
        handle: Handle,
    }

    impl Netlink {
        pub async fn new() -> Result<Self> {
            let (connection, handle, _) =
                new_connection().map_err(|err| netlink_error("failed to open netlink connection", err))?;
            tokio::spawn(connection);
            Ok(Netlink { handle })
        }

        pub async fn link_index(&self, name: &str) -> Result<Option<u32>> {
            let mut links = self
                .handle
                .link()
                .get()
                .match_name(name.to_string())
                .execute();
            match links.try_next().await {
                Ok(Some(link)) => Ok(Some(link.header.index)),
                Ok(None) => Ok(None),
                // The kernel answers a name lookup for a missing link with an error reply.
                Err(rtnetlink::Error::NetlinkError(_)) => Ok(None),
                Err(err) => Err(netlink_error("link lookup failed", err)),
            }
        }

        pub async fn wait_for_link(&self, name: &str, timeout: Duration) -> Result<u32> {
            let start = Instant::now();
            loop {
                if let Some(index) = self.link_index(name).await? {
                    return Ok(index);
                }
                if start.elapsed() > timeout {
                    return Err(netlink_error(
                        "link wait",
                        format!("interface {} did not appear", name),
                    ));
                }
                sleep(Duration::from_millis(100)).await;
            }
        }

        pub async fn set_link_up(&self, index: u32) -> Result<()> {
            let link = LinkUnspec::new_with_index(index).up().build();
            self.handle
                .link()
                .set(link)
                .execute()
                .await
                .map_err(|err| netlink_error("failed to set link up", err))
        }

        pub async fn list_links(&self) -> Result<Vec<LinkInfo>> {
            let mut links = self.handle.link().get().execute();
            let mut results = Vec::new();
            while let Some(link) = links
                .try_next()
                .await
                .map_err(|err| netlink_error("link dump failed", err))?
            {
                let flags = link.header.flags;
                let mut info = LinkInfo {
                    index: link.header.index,
                    name: String::new(),
                    up: flags.contains(LinkFlags::Up),
                    loopback: flags.contains(LinkFlags::Loopback),
                    hardware_addr: None,
                };
                for attr in link.attributes {
                    match attr {
                        LinkAttribute::IfName(name) => info.name = name,
                        LinkAttribute::Address(bytes) => info.hardware_addr = format_mac(&bytes),
                        _ => {}
                    }
                }
                results.push(info);
            }
            Ok(results)
        }

        /// Addresses assigned to a link, local address preferred per entry.
        pub async fn interface_addresses(&self, index: u32) -> Result<Vec<IpAddr>> {
            let mut addresses = self
                .handle
                .address()
                .get()
                .set_link_index_filter(index)
                .execute();
            let mut results = Vec::new();
            while let Some(msg) = addresses
                .try_next()
                .await
                .map_err(|err| netlink_error("address dump failed", err))?
            {
                let mut selected = None;
                for attr in msg.attributes {
                    match attr {
                        AddressAttribute::Local(addr) => {
                            selected = Some(addr);
                            break;
                        }
                        AddressAttribute::Address(addr) => {
                            if selected.is_none() {
                                selected = Some(addr);
                            }
                        }
                        _ => {}
                    }
                }
                let Some(addr) = selected else {
                    continue;
                };
                results.push(addr);
            }
            Ok(results)
        }

        pub async fn replace_address(&self, index: u32, address: IpAddr, prefix: u8) -> Result<()> {
            let mut req = self.handle.address().add(index, address, prefix).replace();
            if let (IpAddr::V4(_), 32) = (address, prefix) {
                // rtnetlink always sets IFA_BROADCAST for IPv4; on a /32
                // tunnel address that makes echo requests look like broadcast.
                req.message_mut().attributes.retain(|attr| {
                    !matches!(
                        attr,
                        AddressAttribute::Broadcast(_) | AddressAttribute::Address(_)
                    )
                });
            }
            req.execute()
                .await
                .map_err(|err| netlink_error("failed to assign address", err))
        }

        pub async fn replace_route(&self, prefix: IpNet, index: u32) -> Result<()> {
            let result = match prefix {
                IpNet::V4(net) => {
                    let route = RouteMessageBuilder::<Ipv4Addr>::new()
                        .destination_prefix(net.network(), net.prefix_len())
                        .output_interface(index)
                        .build();
                    self.handle.route().add(route).replace().execute().await
                }
                IpNet::V6(net) => {
                    let route = RouteMessageBuilder::<Ipv6Addr>::new()
                        .destination_prefix(net.network(), net.prefix_len())
                        .output_interface(index)
                        .build();
                    self.handle.route().add(route).replace().execute().await
                }
            };
            result.map_err(|err| netlink_error("failed to install route", err))
        }

        /// Remove the route for `prefix` through `index`; a route that is
        /// already gone counts as removed.
        pub async fn delete_route(&self, prefix: IpNet, index: u32) -> Result<()> {
            let route = match prefix {
                IpNet::V4(net) => RouteMessageBuilder::<Ipv4Addr>::new()
                    .destination_prefix(net.network(), net.prefix_len())
                    .output_interface(index)
                    .build(),
                IpNet::V6(net) => RouteMessageBuilder::<Ipv6Addr>::new()
                    .destination_prefix(net.network(), net.prefix_len())
                    .output_interface(index)
                    .build(),
            };
            match self.handle.route().del(route).execute().await {
                Ok(()) => Ok(()),
                Err(rtnetlink::Error::NetlinkError(msg)) if msg.raw_code() == -ESRCH => Ok(()),
                Err(err) => Err(netlink_error("failed to delete route", err)),
            }
        }

        pub async fn delete_link(&self, name: &str) -> Result<()> {
            if let Some(index) = self.link_index(name).await? {
                self.handle
                    .link()
                    .del(index)
                    .execute()
                    .await
                    .map_err(|err| netlink_error("failed to delete link", err))?;
            }
            Ok(())
        }
    }
}

#[cfg(target_os = "linux")]
pub use imp::Netlink;

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    #[derive(Clone)]
    pub struct Netlink;

    fn unsupported<T>() -> Result<T> {
        Err(netlink_error("netlink", "only supported on linux"))
    }

    impl Netlink {
        pub async fn new() -> Result<Self> {
            unsupported()
        }

        pub async fn link_index(&self, _name: &str) -> Result<Option<u32>> {
            unsupported()
        }

        pub async fn wait_for_link(&self, _name: &str, _timeout: Duration) -> Result<u32> {
            unsupported()
        }

        pub async fn set_link_up(&self, _index: u32) -> Result<()> {
            unsupported()
        }

        pub async fn list_links(&self) -> Result<Vec<LinkInfo>> {
            unsupported()
        }

        pub async fn interface_addresses(&self, _index: u32) -> Result<Vec<IpAddr>> {
            unsupported()
        }

        pub async fn replace_address(&self, _index: u32, _address: IpAddr, _prefix: u8) -> Result<()> {
            unsupported()
        }

        pub async fn replace_route(&self, _prefix: IpNet, _index: u32) -> Result<()> {
            unsupported()
        }

        pub async fn delete_route(&self, _prefix: IpNet, _index: u32) -> Result<()> {
            unsupported()
        }

        pub async fn delete_link(&self, _name: &str) -> Result<()> {
            unsupported()
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use imp::Netlink;

/// Colon-separated lowercase hex; all-zero addresses (loopback) count as none.
pub fn format_mac(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() || bytes.iter().all(|byte| *byte == 0) {
        return None;
    }
    Some(
        bytes
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<Vec<_>>()
            .join(":"),
    )
}
