//! Address resolution for this host.
//!
//! Every scan here is deliberately first-match: interfaces are visited in
//! enumeration order and the first qualifying address or identifier wins.
//! Multi-homed hosts may prefer a different address; callers that care can
//! pin one explicitly.

use crate::error::{Error, Result};
use crate::netlink::Netlink;
use async_trait::async_trait;
use ipnet::IpNet;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

/// Highest listen port handed out by the free-port scan.
pub const MAX_LISTEN_PORT: u16 = 60000;

/// Where the free-port scan starts when the control plane assigns no port.
pub const DEFAULT_BASE_PORT: u16 = 51821;

const ECHO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct HostInterface {
    pub name: String,
    pub up: bool,
    pub loopback: bool,
    pub hardware_addr: Option<String>,
    pub addresses: Vec<IpAddr>,
}

/// Host interface enumeration.
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// All interfaces in enumeration order. A failure to read any
    /// interface's addresses fails the whole enumeration.
    async fn interfaces(&self) -> Result<Vec<HostInterface>>;
}

/// Reads links and addresses over rtnetlink.
pub struct NetlinkHost;

#[async_trait]
impl HostNetwork for NetlinkHost {
    async fn interfaces(&self) -> Result<Vec<HostInterface>> {
        let netlink = Netlink::new().await?;
        let mut interfaces = Vec::new();
        for link in netlink.list_links().await? {
            let addresses = netlink.interface_addresses(link.index).await?;
            interfaces.push(HostInterface {
                name: link.name,
                up: link.up,
                loopback: link.loopback,
                hardware_addr: link.hardware_addr,
                addresses,
            });
        }
        Ok(interfaces)
    }
}

/// Plain-text "what is my address" lookups.
#[async_trait]
pub trait AddressEcho: Send + Sync {
    /// Returns the HTTP status and body for a GET of `url`.
    async fn fetch(&self, url: &str) -> Result<(u16, String)>;
}

pub struct HttpEcho {
    client: reqwest::Client,
}

impl HttpEcho {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(ECHO_TIMEOUT)
            .build()
            .map_err(|err| Error::Config(format!("failed to build http client: {err}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AddressEcho for HttpEcho {
    async fn fetch(&self, url: &str) -> Result<(u16, String)> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| Error::Control(format!("{url}: {err}")))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| Error::Control(format!("{url}: {err}")))?;
        Ok((status, body))
    }
}

/// First address on an up, non-loopback interface that satisfies `range`
/// (any address when `range` is `None`).
pub fn first_qualifying_address(
    interfaces: &[HostInterface],
    range: Option<&IpNet>,
) -> Option<IpAddr> {
    interfaces
        .iter()
        .filter(|iface| iface.up && !iface.loopback)
        .flat_map(|iface| iface.addresses.iter().map(move |addr| (iface, *addr)))
        .find(|(_, addr)| range.map_or(true, |range| range.contains(addr)))
        .map(|(iface, addr)| {
            debug!(interface = %iface.name, address = %addr, "local address selected");
            addr
        })
}

pub async fn resolve_local(host: &dyn HostNetwork, range: Option<&IpNet>) -> Result<IpAddr> {
    let interfaces = host.interfaces().await?;
    first_qualifying_address(&interfaces, range)
        .ok_or_else(|| Error::AddressNotFound(range.map(ToString::to_string)))
}

/// Ask each echo service in order; the first 200 with a usable body wins.
pub async fn resolve_public(echo: &dyn AddressEcho, services: &[String]) -> Result<IpAddr> {
    for service in services {
        match echo.fetch(service).await {
            Ok((200, body)) => match body.trim().parse::<IpAddr>() {
                Ok(addr) => return Ok(addr),
                Err(_) => debug!(service = %service, "echo service returned no address"),
            },
            Ok((status, _)) => debug!(service = %service, status, "echo service refused"),
            Err(err) => debug!(service = %service, error = %err, "echo service unreachable"),
        }
    }
    Err(Error::LookupFailed(services.len()))
}

/// First port at or above `range_start` not used by an active tunnel device.
pub fn resolve_free_port(in_use: &[u16], range_start: u16) -> Result<u16> {
    (range_start..=MAX_LISTEN_PORT)
        .find(|port| !in_use.contains(port))
        .ok_or(Error::NoFreePort(range_start))
}

/// First non-empty hardware address in enumeration order.
pub fn first_hardware_id(interfaces: &[HostInterface]) -> Option<String> {
    interfaces
        .iter()
        .filter_map(|iface| iface.hardware_addr.as_deref())
        .map(str::trim)
        .find(|addr| !addr.is_empty())
        .map(str::to_string)
}

pub async fn resolve_hardware_id(host: &dyn HostNetwork) -> Result<String> {
    let interfaces = host.interfaces().await?;
    first_hardware_id(&interfaces).ok_or(Error::NoIdentifier)
}
