//! Per-interface configuration socket.
//!
//! Text protocol, one `key=value` per line, a request ends at an empty line
//! or EOF:
//!
//! ```text
//! get=1            ->  public_key=..  allowed_ip=..  endpoint=..  ...  errno=0
//! set=1
//! public_key=..    ->  errno=0 | errno=1
//! allowed_ip=..
//! ```

use crate::error::{Error, Result};
use crate::model::Peer;
use crate::tunnel::Device;
use ipnet::IpNet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

/// Listener task bound to one device. Dropping without [`shutdown`] leaves
/// the task running until the runtime stops.
///
/// [`shutdown`]: ControlSocket::shutdown
pub struct ControlSocket {
    path: PathBuf,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ControlSocket {
    pub fn bind(path: &Path, device: Arc<Device>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let listener = UnixListener::bind(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, device, shutdown_rx));
        Ok(Self {
            path: path.to_path_buf(),
            shutdown_tx,
            task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting, wait for the loop to exit and remove the socket file.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(err) = self.task.await {
            warn!(socket = %self.path.display(), error = %err, "configuration listener ended abnormally");
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(socket = %self.path.display(), error = %err, "failed to remove socket"),
        }
    }
}

/// Total bytes read from one connection.
const MAX_REQUEST_BYTES: u64 = 64 * 1024;
/// Lines accepted in one request.
const MAX_REQUEST_LINES: usize = 4096;
/// A client must finish its request within this window.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

async fn accept_loop(
    listener: UnixListener,
    device: Arc<Device>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let device = Arc::clone(&device);
                    connections.spawn(async move {
                        if let Err(err) = serve(stream, &device).await {
                            debug!(interface = %device.name(), error = %err, "configuration connection failed");
                        }
                    });
                }
                Err(err) => {
                    warn!(interface = %device.name(), error = %err, "configuration socket accept failed");
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    connections.shutdown().await;
}

async fn serve(stream: UnixStream, device: &Device) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let request = tokio::time::timeout(REQUEST_TIMEOUT, read_request(reader))
        .await
        .map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "configuration request timed out")
        })??;

    let response = match request.first().map(String::as_str) {
        Some("get=1") => render_peers(&device.peers().await),
        Some("set=1") => match parse_peers(&request[1..]) {
            Ok(peers) => match device.replace_peers(peers, None).await {
                Ok(()) => "errno=0\n\n".to_string(),
                Err(err) => {
                    warn!(interface = %device.name(), error = %err, "socket set rejected");
                    "errno=1\n\n".to_string()
                }
            },
            Err(err) => {
                debug!(interface = %device.name(), error = %err, "malformed set request");
                "errno=1\n\n".to_string()
            }
        },
        _ => "errno=1\n\n".to_string(),
    };
    writer.write_all(response.as_bytes()).await?;
    writer.shutdown().await?;
    Ok(())
}

async fn read_request(reader: OwnedReadHalf) -> Result<Vec<String>> {
    let mut lines = BufReader::new(reader.take(MAX_REQUEST_BYTES)).lines();
    let mut request = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            break;
        }
        if request.len() == MAX_REQUEST_LINES {
            return Err(Error::Config(format!(
                "configuration request exceeds {MAX_REQUEST_LINES} lines"
            )));
        }
        request.push(line);
    }
    Ok(request)
}

pub fn render_peers(peers: &[Peer]) -> String {
    let mut out = String::new();
    for peer in peers {
        let _ = writeln!(out, "public_key={}", peer.public_key);
        for net in &peer.allowed_ips {
            let _ = writeln!(out, "allowed_ip={net}");
        }
        if let Some(endpoint) = peer.endpoint {
            let _ = writeln!(out, "endpoint={endpoint}");
        }
        if let Some(keepalive) = peer.persistent_keepalive {
            let _ = writeln!(out, "persistent_keepalive_interval={keepalive}");
        }
    }
    out.push_str("errno=0\n\n");
    out
}

pub fn parse_peers(lines: &[String]) -> Result<Vec<Peer>> {
    let invalid = |line: &str| Error::Config(format!("invalid configuration line {line:?}"));
    let mut peers: Vec<Peer> = Vec::new();
    for line in lines {
        let (key, value) = line.split_once('=').ok_or_else(|| invalid(line))?;
        if key == "public_key" {
            peers.push(Peer {
                public_key: value.to_string(),
                allowed_ips: Vec::new(),
                endpoint: None,
                persistent_keepalive: None,
            });
            continue;
        }
        let peer = peers.last_mut().ok_or_else(|| invalid(line))?;
        match key {
            "allowed_ip" => {
                let net: IpNet = value.parse().map_err(|_| invalid(line))?;
                peer.allowed_ips.push(net);
            }
            "endpoint" => peer.endpoint = Some(value.parse().map_err(|_| invalid(line))?),
            "persistent_keepalive_interval" => {
                peer.persistent_keepalive = Some(value.parse().map_err(|_| invalid(line))?)
            }
            _ => return Err(invalid(line)),
        }
    }
    Ok(peers)
}
